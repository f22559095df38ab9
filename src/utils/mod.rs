//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;
mod safeudp;
mod timer;

pub use error::RendezvousError;
pub use print::{logger_init, ME};
pub use timer::Timer;

pub(crate) use safetcp::{
    tcp_bind_with_retry, tcp_connect_with_retry, tcp_read_envelope,
    tcp_read_frame, tcp_write_envelope, tcp_write_frame,
};
pub(crate) use safeudp::{
    udp_bind, udp_drain, udp_recv_envelope, udp_send_envelope,
};
pub use safeudp::MAX_DATAGRAM_SIZE;
