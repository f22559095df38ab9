//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for Rendezvous.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RendezvousError(pub(crate) String);

impl RendezvousError {
    pub fn msg(msg: impl ToString) -> Self {
        RendezvousError(msg.to_string())
    }
}

impl fmt::Display for RendezvousError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for RendezvousError {}

// Saves the boiler-plate `impl From<X>`s that turn common source errors into
// a `RendezvousError` holding their string representation.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for RendezvousError {
            fn from(e: $error) -> Self {
                RendezvousError(e.to_string())
            }
        }
    };
}

// Same as above, for error types generic over the payload they failed on.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for RendezvousError {
            fn from(e: $error) -> RendezvousError {
                RendezvousError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::sync::watch::error::RecvError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = RendezvousError::msg("principal went away");
        assert_eq!(format!("{}", e), String::from("principal went away"));
    }

    #[test]
    fn from_io_error() {
        let io_error =
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused!");
        let e = RendezvousError::from(io_error);
        assert!(e.0.contains("refused!"));
    }

    #[test]
    fn from_addr_parse_error() {
        let parsed: Result<net::SocketAddr, _> = "10.0.0.1".parse();
        let e = RendezvousError::from(parsed.unwrap_err());
        assert!(!e.0.is_empty());
    }
}
