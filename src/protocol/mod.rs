//! Wire vocabulary shared by the directory service, workers, and clients.

mod content;
mod envelope;

pub use content::{
    encode_opt_addr, parse_addr, parse_opt_addr, HeartbeatContent,
    RegisterContent,
};
pub use envelope::{Envelope, MsgType};
