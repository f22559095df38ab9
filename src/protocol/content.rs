//! Typed codecs for the `|`-delimited envelope content tuples.

use std::net::SocketAddr;

use crate::utils::RendezvousError;

/// Field separator inside envelope contents.
const FIELD_SEP: char = '|';

/// Splits `content` into exactly `N` fields, failing on any other count.
fn split_fields<'a, const N: usize>(
    content: &'a str,
    what: &str,
) -> Result<[&'a str; N], RendezvousError> {
    let fields: Vec<&'a str> = content.split(FIELD_SEP).collect();
    fields.try_into().map_err(|fields: Vec<&'a str>| {
        RendezvousError::msg(format!(
            "invalid {} content '{}': expected {} fields, got {}",
            what,
            content,
            N,
            fields.len()
        ))
    })
}

/// Parses a `host:port` address.
pub fn parse_addr(s: &str) -> Result<SocketAddr, RendezvousError> {
    s.trim().parse().map_err(|e| {
        RendezvousError::msg(format!("invalid address '{}': {}", s, e))
    })
}

/// Parses an optional `host:port` address, where empty means `None`.
pub fn parse_opt_addr(s: &str) -> Result<Option<SocketAddr>, RendezvousError> {
    if s.trim().is_empty() {
        Ok(None)
    } else {
        parse_addr(s).map(Some)
    }
}

/// Renders an optional address, `None` as the empty string.
pub fn encode_opt_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_default()
}

/// Content of `SERVER_REGISTER`: `clientHost:clientPort|copyHost:copyPort`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RegisterContent {
    pub client_addr: SocketAddr,
    pub copy_addr: SocketAddr,
}

impl RegisterContent {
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.client_addr, FIELD_SEP, self.copy_addr)
    }

    pub fn parse(content: &str) -> Result<Self, RendezvousError> {
        let [client, copy] = split_fields::<2>(content, "SERVER_REGISTER")?;
        Ok(RegisterContent {
            client_addr: parse_addr(client)?,
            copy_addr: parse_addr(copy)?,
        })
    }
}

/// Content of `HEARTBEAT`: `version|clientPort|copyPort`. The receiver pairs
/// the ports with the datagram's source IP.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct HeartbeatContent {
    /// Local snapshot version of the sender; `0` if it has none.
    pub version: u64,
    pub client_port: u16,
    pub copy_port: u16,
}

impl HeartbeatContent {
    pub fn encode(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.version,
            self.client_port,
            self.copy_port,
            sep = FIELD_SEP
        )
    }

    pub fn parse(content: &str) -> Result<Self, RendezvousError> {
        let [version, client_port, copy_port] =
            split_fields::<3>(content, "HEARTBEAT")?;
        Ok(HeartbeatContent {
            version: version.trim().parse()?,
            client_port: client_port.trim().parse()?,
            copy_port: copy_port.trim().parse()?,
        })
    }

    /// Derives `(client_addr, copy_addr)` from the sender's source address.
    pub fn addrs_from(&self, source: SocketAddr) -> (SocketAddr, SocketAddr) {
        let ip = source.ip();
        (
            SocketAddr::new(ip, self.client_port),
            SocketAddr::new(ip, self.copy_port),
        )
    }
}
