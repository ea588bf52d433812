//! Time-windowed audit trailers.
//!
//! A request audit carries the client's cursor (`last_time`); the host
//! answers with every event applied since that cursor, up to `this_time`.

use crate::content::ContentBlock;
use crate::error::{CoreError, Result};
use crate::types::Time;
use crate::wire::{Decode, Encode, WireReader, WireWriter};

/// Cursor sent with a request: "everything since `last_time`".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestAudit {
    pub last_time: Time,
}

/// One action the host applied, at host time `time`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub time: Time,
    pub content: ContentBlock,
}

/// The host's answer to a request audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseAudit {
    pub last_time: Time,
    pub this_time: Time,
    pub events: Vec<AuditEvent>,
}

impl ResponseAudit {
    /// Build a response audit, enforcing `last_time <= this_time`.
    pub fn new(last_time: Time, this_time: Time, events: Vec<AuditEvent>) -> Result<Self> {
        if last_time > this_time {
            return Err(CoreError::InvalidAudit(format!(
                "last time {last_time} is after this time {this_time}"
            )));
        }
        Ok(Self {
            last_time,
            this_time,
            events,
        })
    }

    /// Events strictly after `cursor`, in host order.
    pub fn events_after(&self, cursor: Time) -> impl Iterator<Item = &AuditEvent> {
        self.events.iter().filter(move |e| e.time > cursor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audit {
    Request(RequestAudit),
    Response(ResponseAudit),
}

impl Audit {
    pub fn request(last_time: Time) -> Self {
        Self::Request(RequestAudit { last_time })
    }

    pub fn last_time(&self) -> Time {
        match self {
            Self::Request(a) => a.last_time,
            Self::Response(a) => a.last_time,
        }
    }
}

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;

impl Encode for Audit {
    fn encode_to(&self, w: &mut WireWriter) {
        match self {
            Self::Request(a) => {
                w.put_u8(KIND_REQUEST);
                w.put_i64(a.last_time.0);
            }
            Self::Response(a) => {
                w.put_u8(KIND_RESPONSE);
                w.put_i64(a.last_time.0);
                w.put_i64(a.this_time.0);
                w.put_u32(a.events.len() as u32);
                for event in &a.events {
                    w.put_i64(event.time.0);
                    w.put(&event.content);
                }
            }
        }
    }
}

impl Decode for Audit {
    fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        match r.get_u8()? {
            KIND_REQUEST => Ok(Self::request(Time(r.get_i64()?))),
            KIND_RESPONSE => {
                let last_time = Time(r.get_i64()?);
                let this_time = Time(r.get_i64()?);
                let count = r.get_u32()? as usize;
                // Each event takes at least 8 + 1 + 4 bytes.
                if count > r.remaining() / 13 {
                    return Err(CoreError::Truncated {
                        needed: count * 13,
                        remaining: r.remaining(),
                    });
                }
                let mut events = Vec::with_capacity(count);
                for _ in 0..count {
                    let time = Time(r.get_i64()?);
                    let content = r.get()?;
                    events.push(AuditEvent { time, content });
                }
                Ok(Self::Response(ResponseAudit::new(last_time, this_time, events)?))
            }
            tag => Err(CoreError::InvalidTag {
                field: "audit kind",
                tag,
            }),
        }
    }
}
