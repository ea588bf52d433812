//! Internal actions and their queue entries.

use std::fmt;

use crate::content::ContentBlock;
use crate::error::{CoreError, Result};
use crate::types::{ActionId, AgentId, Identifier, RoleId, ServiceKey, Time, TypeIdentifier};
use crate::wire::{Decode, Encode, WireReader, WireWriter};

/// How an action's local effect relates to its effect on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Effect {
    /// Local and remote effects are identical; the client can apply the
    /// action before the host confirms it.
    Deterministic = 0,
    /// The host assigns part of the outcome; the client applies the action
    /// only once the host's reply arrives.
    HostAssigned = 1,
}

impl Effect {
    fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Deterministic),
            1 => Ok(Self::HostAssigned),
            tag => Err(CoreError::InvalidTag { field: "effect", tag }),
        }
    }
}

/// A client-originated state change that must reach the subject's host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalAction {
    pub role: RoleId,
    pub subject: Identifier,
    pub service: TypeIdentifier,
    pub content: ContentBlock,
    pub effect: Effect,
    pub agent: Option<AgentId>,
}

impl InternalAction {
    pub fn new(
        role: RoleId,
        subject: Identifier,
        service: TypeIdentifier,
        content: ContentBlock,
        effect: Effect,
    ) -> Self {
        Self {
            role,
            subject,
            service,
            content,
            effect,
            agent: None,
        }
    }

    pub fn with_agent(mut self, agent: AgentId) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.role, self.service.clone())
    }

    /// Whether executing `self` has the same effect as `other`.
    ///
    /// `a.is_similar_to(&a)` holds exactly for deterministic actions, which
    /// are executed locally before they are sent.
    pub fn is_similar_to(&self, other: &InternalAction) -> bool {
        self.effect == Effect::Deterministic
            && other.effect == Effect::Deterministic
            && self.service == other.service
            && self.subject == other.subject
            && self.content == other.content
    }

    pub fn executes_locally_first(&self) -> bool {
        self.is_similar_to(self)
    }
}

impl Encode for InternalAction {
    fn encode_to(&self, w: &mut WireWriter) {
        w.put_u64(self.role.0);
        w.put_identifier(&self.subject);
        w.put_type(&self.service);
        w.put(&self.content);
        w.put_u8(self.effect as u8);
        match self.agent {
            Some(agent) => {
                w.put_bool(true);
                w.put_u64(agent.0);
            }
            None => w.put_bool(false),
        }
    }
}

impl Decode for InternalAction {
    fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        let role = RoleId(r.get_u64()?);
        let subject = r.get_identifier()?;
        let service = r.get_type()?;
        let content = r.get()?;
        let effect = Effect::from_u8(r.get_u8()?)?;
        let agent = if r.get_bool("agent")? {
            Some(AgentId(r.get_u64()?))
        } else {
            None
        };
        Ok(Self {
            role,
            subject,
            service,
            content,
            effect,
            agent,
        })
    }
}

/// Delivery state of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    Queued,
    InFlight,
    Acknowledged,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InFlight => "in-flight",
            Self::Acknowledged => "acknowledged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "in-flight" => Some(Self::InFlight),
            "acknowledged" => Some(Self::Acknowledged),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    pub id: ActionId,
    pub action: InternalAction,
    pub enqueued_at: Time,
    pub state: DeliveryState,
    /// Delivery attempts that ended in a transport or structural failure.
    pub attempts: u32,
}

impl PendingAction {
    pub fn new(id: ActionId, action: InternalAction, enqueued_at: Time) -> Self {
        Self {
            id,
            action,
            enqueued_at,
            state: DeliveryState::Queued,
            attempts: 0,
        }
    }

    pub fn key(&self) -> ServiceKey {
        self.action.key()
    }
}

/// An action the host rejected or that exhausted its delivery attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAction {
    pub id: ActionId,
    pub action: InternalAction,
    pub failed_at: Time,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(effect: Effect, payload: &'static [u8]) -> InternalAction {
        InternalAction::new(
            RoleId(1),
            Identifier::new("alice@host.test").unwrap(),
            TypeIdentifier::from_static("contacts@test"),
            ContentBlock::new(TypeIdentifier::from_static("add@test"), payload),
            effect,
        )
    }

    #[test]
    fn test_similarity() {
        let a = action(Effect::Deterministic, b"x");
        assert!(a.is_similar_to(&a));
        assert!(a.executes_locally_first());
        assert!(!a.is_similar_to(&action(Effect::Deterministic, b"y")));

        let h = action(Effect::HostAssigned, b"x");
        assert!(!h.is_similar_to(&h));
        assert!(!a.is_similar_to(&h));
    }

    #[test]
    fn test_encoding_roundtrip_with_agent() {
        let a = action(Effect::HostAssigned, b"payload").with_agent(AgentId(9));
        assert_eq!(InternalAction::from_bytes(&a.to_bytes()).unwrap(), a);
    }

    #[test]
    fn test_delivery_state_names() {
        for state in [DeliveryState::Queued, DeliveryState::InFlight, DeliveryState::Acknowledged] {
            assert_eq!(DeliveryState::parse(state.as_str()), Some(state));
        }
        assert_eq!(DeliveryState::parse("lost"), None);
    }
}
