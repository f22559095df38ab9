//! Two-field tagged message envelope used for every wire exchange.

use std::fmt;
use std::net::SocketAddr;

use crate::protocol::{encode_opt_addr, HeartbeatContent, RegisterContent};
use crate::utils::RendezvousError;

use serde::{Deserialize, Serialize};

/// Recognized envelope type tags.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum MsgType {
    /// Client -> DS: who is the principal?
    ClientRequest,

    /// DS -> client/worker: principal address, or empty.
    DsResponse,

    /// Worker -> DS: `clientAddr|copyAddr`.
    ServerRegister,

    /// Worker -> DS: `version|clientPort|copyPort`.
    Heartbeat,

    /// Worker -> DS: `copyAddr`.
    ServerDeregister,

    /// DS -> worker: copy address of the new principal.
    UpdatePrincipal,

    /// Backup -> principal: please send me your snapshot.
    DbCopyRequest,

    /// Principal -> backup: snapshot version, raw bytes follow in a
    /// separate frame unless the version is `0`.
    DbCopyStart,
}

impl MsgType {
    /// All recognized types.
    pub const ALL: [MsgType; 8] = [
        MsgType::ClientRequest,
        MsgType::DsResponse,
        MsgType::ServerRegister,
        MsgType::Heartbeat,
        MsgType::ServerDeregister,
        MsgType::UpdatePrincipal,
        MsgType::DbCopyRequest,
        MsgType::DbCopyStart,
    ];

    /// Wire tag of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientRequest => "CLIENT_REQUEST",
            Self::DsResponse => "DS_RESPONSE",
            Self::ServerRegister => "SERVER_REGISTER",
            Self::Heartbeat => "HEARTBEAT",
            Self::ServerDeregister => "SERVER_DEREGISTER",
            Self::UpdatePrincipal => "UPDATE_PRINCIPAL",
            Self::DbCopyRequest => "DB_COPY_REQUEST",
            Self::DbCopyStart => "DB_COPY_START",
        }
    }

    /// Parses a wire tag, returning `None` for unrecognized ones.
    pub fn parse_name(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A `{type, content}` message. The tag is kept as a raw string so that
/// messages of unknown type still decode and can be logged and skipped.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    tag: String,

    content: String,
}

impl Envelope {
    /// Creates an envelope of a recognized type.
    pub fn new(msg_type: MsgType, content: impl Into<String>) -> Self {
        Envelope {
            tag: msg_type.as_str().into(),
            content: content.into(),
        }
    }

    /// Creates an envelope with an arbitrary tag.
    pub fn with_tag(tag: impl Into<String>, content: impl Into<String>) -> Self {
        Envelope {
            tag: tag.into(),
            content: content.into(),
        }
    }

    /// Recognized type of this envelope, if any.
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::parse_name(&self.tag)
    }

    /// Raw type tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Raw content payload.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Serializes into MessagePack bytes.
    pub fn encode(&self) -> Result<Vec<u8>, RendezvousError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserializes from MessagePack bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, RendezvousError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

// Typed constructors
impl Envelope {
    pub fn client_request() -> Self {
        Self::new(MsgType::ClientRequest, "")
    }

    pub fn ds_response(principal: Option<SocketAddr>) -> Self {
        Self::new(MsgType::DsResponse, encode_opt_addr(principal))
    }

    pub fn server_register(content: &RegisterContent) -> Self {
        Self::new(MsgType::ServerRegister, content.encode())
    }

    pub fn heartbeat(content: &HeartbeatContent) -> Self {
        Self::new(MsgType::Heartbeat, content.encode())
    }

    pub fn server_deregister(copy_addr: SocketAddr) -> Self {
        Self::new(MsgType::ServerDeregister, copy_addr.to_string())
    }

    pub fn update_principal(principal: SocketAddr) -> Self {
        Self::new(MsgType::UpdatePrincipal, principal.to_string())
    }

    pub fn db_copy_request() -> Self {
        Self::new(MsgType::DbCopyRequest, "")
    }

    pub fn db_copy_start(version: u64) -> Self {
        Self::new(MsgType::DbCopyStart, version.to_string())
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}('{}')", self.tag, self.content)
    }
}

#[cfg(test)]
mod envelope_tests {
    use super::*;

    #[test]
    fn type_tags() {
        for t in MsgType::ALL {
            assert_eq!(MsgType::parse_name(t.as_str()), Some(t));
        }
        assert_eq!(MsgType::parse_name("AUTH_REQUEST"), None);
        assert_eq!(MsgType::parse_name("heartbeat"), None);
    }

    #[test]
    fn encode_decode() -> Result<(), RendezvousError> {
        let env = Envelope::update_principal("10.0.0.2:7002".parse()?);
        let back = Envelope::decode(&env.encode()?)?;
        assert_eq!(back, env);
        assert_eq!(back.msg_type(), Some(MsgType::UpdatePrincipal));
        assert_eq!(back.content(), "10.0.0.2:7002");
        Ok(())
    }

    #[test]
    fn unknown_tag_still_decodes() -> Result<(), RendezvousError> {
        let env = Envelope::with_tag("LOGOUT", "alice");
        let back = Envelope::decode(&env.encode()?)?;
        assert_eq!(back.msg_type(), None);
        assert_eq!(back.tag(), "LOGOUT");
        Ok(())
    }

    #[test]
    fn decode_garbage() {
        assert!(Envelope::decode(b"\xc1\x00not msgpack").is_err());
        assert!(Envelope::decode(&[]).is_err());
    }

    #[test]
    fn empty_principal_response() {
        let env = Envelope::ds_response(None);
        assert_eq!(env.msg_type(), Some(MsgType::DsResponse));
        assert_eq!(env.content(), "");
        assert_eq!(format!("{}", env), "DS_RESPONSE('')");
    }
}
