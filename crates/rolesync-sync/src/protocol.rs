//! Well-known content types of the sync protocol.
//!
//! Besides service-defined content, hosts and clients exchange:
//! - errors: `[u16 code][u32 len message]`
//! - identity relocations: `[u8 successor?][successor identifier]`
//! - state queries and replies, used by reload
//! - audit queries, used by refresh

use std::fmt;

use bytes::Bytes;
use rolesync_core::{
    ContentBlock, CoreError, Decode, Encode, Identifier, TypeIdentifier, WireReader, WireWriter,
};

use crate::error::Result;

pub const ERROR_TYPE: &str = "error@core.rolesync.net";
pub const RELOCATION_TYPE: &str = "relocation@core.rolesync.net";
pub const STATE_QUERY_TYPE: &str = "state.query@core.rolesync.net";
pub const STATE_REPLY_TYPE: &str = "state.reply@core.rolesync.net";
pub const AUDIT_QUERY_TYPE: &str = "audit.query@core.rolesync.net";

fn is_type(content: &ContentBlock, name: &str) -> bool {
    content.type_id.as_str() == name
}

/// Error codes a host may answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    /// The host's signing key rotated; the client must recommit.
    KeyRotated = 1,
    /// The host could not unwrap the request key; the client must refresh
    /// the host's encryption key.
    StaleEncryptionKey = 2,
    Unauthorized = 3,
    Conflict = 4,
    Malformed = 5,
    Internal = 6,
    NotFound = 7,
}

impl ErrorCode {
    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => Self::KeyRotated,
            2 => Self::StaleEncryptionKey,
            3 => Self::Unauthorized,
            4 => Self::Conflict,
            5 => Self::Malformed,
            6 => Self::Internal,
            7 => Self::NotFound,
            _ => Self::Unknown,
        }
    }

    /// Handled by resending rather than by failing the action.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::KeyRotated | Self::StaleEncryptionKey)
    }
}

/// A host-reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub code: ErrorCode,
    pub message: String,
}

impl HostError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_error(content: &ContentBlock) -> bool {
        is_type(content, ERROR_TYPE)
    }

    pub fn to_content(&self) -> ContentBlock {
        let mut w = WireWriter::new();
        w.put_u16(self.code as u16);
        w.put_bytes(self.message.as_bytes());
        ContentBlock::new(TypeIdentifier::from_static(ERROR_TYPE), w.finish())
    }

    pub fn from_content(content: &ContentBlock) -> Result<Self> {
        let mut r = WireReader::new(&content.payload);
        let code = ErrorCode::from_u16(r.get_u16()?);
        let message = String::from_utf8_lossy(r.get_bytes()?).into_owned();
        r.finish()?;
        Ok(Self { code, message })
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// The host no longer serves the subject; it moved to `successor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Absent when the host only knows the identity moved.
    pub successor: Option<Identifier>,
}

impl Relocation {
    pub fn is_relocation(content: &ContentBlock) -> bool {
        is_type(content, RELOCATION_TYPE)
    }

    pub fn to_content(&self) -> ContentBlock {
        let mut w = WireWriter::new();
        match &self.successor {
            Some(id) => {
                w.put_bool(true);
                w.put_identifier(id);
            }
            None => w.put_bool(false),
        }
        ContentBlock::new(TypeIdentifier::from_static(RELOCATION_TYPE), w.finish())
    }

    pub fn from_content(content: &ContentBlock) -> Result<Self> {
        let mut r = WireReader::new(&content.payload);
        let successor = if r.get_bool("successor present")? {
            Some(r.get_identifier()?)
        } else {
            None
        };
        r.finish()?;
        Ok(Self { successor })
    }
}

/// Ask for the full state of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateQuery {
    pub service: TypeIdentifier,
}

impl StateQuery {
    pub fn to_content(&self) -> ContentBlock {
        let mut w = WireWriter::new();
        w.put_type(&self.service);
        ContentBlock::new(TypeIdentifier::from_static(STATE_QUERY_TYPE), w.finish())
    }

    /// `None` when the content is not a state query.
    pub fn from_content(content: &ContentBlock) -> Result<Option<Self>> {
        if !is_type(content, STATE_QUERY_TYPE) {
            return Ok(None);
        }
        let mut r = WireReader::new(&content.payload);
        let service = r.get_type()?;
        r.finish()?;
        Ok(Some(Self { service }))
    }
}

/// A full-state snapshot of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateReply {
    pub service: TypeIdentifier,
    pub state: Bytes,
}

impl StateReply {
    pub fn type_id() -> TypeIdentifier {
        TypeIdentifier::from_static(STATE_REPLY_TYPE)
    }

    pub fn to_content(&self) -> ContentBlock {
        ContentBlock::new(Self::type_id(), self.to_bytes())
    }

    pub fn from_content(content: &ContentBlock) -> Result<Self> {
        if !is_type(content, STATE_REPLY_TYPE) {
            return Err(CoreError::InvalidIdentifier(format!(
                "expected {STATE_REPLY_TYPE}, got {}",
                content.type_id
            ))
            .into());
        }
        Ok(Self::from_bytes(&content.payload)?)
    }
}

impl Encode for StateReply {
    fn encode_to(&self, w: &mut WireWriter) {
        w.put_type(&self.service);
        w.put_bytes(&self.state);
    }
}

impl Decode for StateReply {
    fn decode_from(r: &mut WireReader<'_>) -> rolesync_core::Result<Self> {
        let service = r.get_type()?;
        let state = Bytes::copy_from_slice(r.get_bytes()?);
        Ok(Self { service, state })
    }
}

/// Ask for the audit of one service since the request's cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditQuery {
    pub service: TypeIdentifier,
}

impl AuditQuery {
    pub fn to_content(&self) -> ContentBlock {
        let mut w = WireWriter::new();
        w.put_type(&self.service);
        ContentBlock::new(TypeIdentifier::from_static(AUDIT_QUERY_TYPE), w.finish())
    }

    /// `None` when the content is not an audit query.
    pub fn from_content(content: &ContentBlock) -> Result<Option<Self>> {
        if !is_type(content, AUDIT_QUERY_TYPE) {
            return Ok(None);
        }
        let mut r = WireReader::new(&content.payload);
        let service = r.get_type()?;
        r.finish()?;
        Ok(Some(Self { service }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_content() {
        let err = HostError::new(ErrorCode::Conflict, "already exists");
        let content = err.to_content();
        assert!(HostError::is_error(&content));
        assert_eq!(HostError::from_content(&content).unwrap(), err);
        assert_eq!(
            content.payload.as_ref()[..2],
            [0, 4],
            "code is a big-endian u16"
        );
    }

    #[test]
    fn test_unknown_code_maps_to_unknown() {
        assert_eq!(ErrorCode::from_u16(999), ErrorCode::Unknown);
        assert!(ErrorCode::KeyRotated.is_recoverable());
        assert!(!ErrorCode::Conflict.is_recoverable());
    }

    #[test]
    fn test_relocation_content() {
        let moved = Relocation {
            successor: Some(Identifier::new("alice@new.test").unwrap()),
        };
        assert_eq!(Relocation::from_content(&moved.to_content()).unwrap(), moved);

        let unknown = Relocation { successor: None };
        assert_eq!(Relocation::from_content(&unknown.to_content()).unwrap(), unknown);
    }

    #[test]
    fn test_state_query_detection() {
        let query = StateQuery {
            service: TypeIdentifier::from_static("contacts@test"),
        };
        assert_eq!(StateQuery::from_content(&query.to_content()).unwrap(), Some(query));
        let audit = AuditQuery {
            service: TypeIdentifier::from_static("contacts@test"),
        };
        assert_eq!(StateQuery::from_content(&audit.to_content()).unwrap(), None);
    }

    #[test]
    fn test_state_reply_type_checked() {
        let err = HostError::new(ErrorCode::Internal, "x").to_content();
        assert!(StateReply::from_content(&err).is_err());
    }
}
