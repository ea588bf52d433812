//! Methods sent to hosts and the replies they produce.
//!
//! A method is one element of a request envelope; its reply is the element
//! at the same position of the response.

use std::collections::BTreeSet;

use rolesync_core::{AgentId, ContentBlock, HostIdentifier, Identifier, InternalAction, RoleId, TypeIdentifier};
use rolesync_envelope::Slot;

use crate::collaborators::Authorizer;
use crate::protocol::HostError;

/// A read-only request. Never queued, never audited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub subject: Identifier,
    pub content: ContentBlock,
    /// Type the reply content must have, if any reply is expected.
    pub reply_type: Option<TypeIdentifier>,
    /// Unsigned queries are sent in an unsigned slot.
    pub signed: bool,
}

impl Query {
    pub fn new(subject: Identifier, content: ContentBlock) -> Self {
        Self {
            subject,
            content,
            reply_type: None,
            signed: true,
        }
    }

    pub fn expecting(mut self, reply_type: TypeIdentifier) -> Self {
        self.reply_type = Some(reply_type);
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.signed = false;
        self
    }
}

/// A host-to-host action. Delivered directly, never queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAction {
    pub subject: Identifier,
    pub content: ContentBlock,
}

/// One element of an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Query(Query),
    /// A client-originated state change; queued by the synchronizer.
    Internal(InternalAction),
    External(ExternalAction),
}

impl Method {
    pub fn subject(&self) -> &Identifier {
        match self {
            Self::Query(q) => &q.subject,
            Self::Internal(a) => &a.subject,
            Self::External(a) => &a.subject,
        }
    }

    pub fn recipient(&self) -> HostIdentifier {
        self.subject().host()
    }

    pub fn content(&self) -> &ContentBlock {
        match self {
            Self::Query(q) => &q.content,
            Self::Internal(a) => &a.content,
            Self::External(a) => &a.content,
        }
    }

    pub fn agent(&self) -> Option<AgentId> {
        match self {
            Self::Internal(a) => a.agent,
            Self::Query(_) | Self::External(_) => None,
        }
    }

    pub fn role(&self) -> Option<RoleId> {
        match self {
            Self::Internal(a) => Some(a.role),
            Self::Query(_) | Self::External(_) => None,
        }
    }

    pub fn is_action(&self) -> bool {
        !matches!(self, Self::Query(_))
    }

    /// Whether executing `self` locally has the same effect as executing
    /// `other` on the host. Only internal actions can be similar.
    pub fn is_similar_to(&self, other: &Method) -> bool {
        match (self, other) {
            (Self::Internal(a), Self::Internal(b)) => a.is_similar_to(b),
            _ => false,
        }
    }

    /// Whether a null reply slot is acceptable for this method.
    pub fn expects_reply(&self) -> bool {
        match self {
            Self::Query(q) => q.reply_type.is_some(),
            Self::Internal(_) | Self::External(_) => true,
        }
    }

    pub fn reply_type(&self) -> Option<&TypeIdentifier> {
        match self {
            Self::Query(q) => q.reply_type.as_ref(),
            Self::Internal(_) | Self::External(_) => None,
        }
    }

    /// The envelope slot this method is sent in.
    pub fn slot(&self) -> Slot {
        match self {
            Self::Query(q) if !q.signed => Slot::Unsigned(Some(q.content.clone())),
            _ => Slot::Signed(Some(self.content().clone())),
        }
    }

    pub fn required_authorization(&self, authorizer: &dyn Authorizer) -> RequiredAuthorization {
        RequiredAuthorization {
            permissions: authorizer.required_permissions(self),
            restrictions: authorizer.required_restrictions(self),
            agent: self.agent(),
        }
    }
}

/// Service types a caller must be permitted to use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Permissions(pub BTreeSet<TypeIdentifier>);

impl Permissions {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn of(service: TypeIdentifier) -> Self {
        Self(BTreeSet::from([service]))
    }

    pub fn contains(&self, service: &TypeIdentifier) -> bool {
        self.0.contains(service)
    }

    pub fn is_subset(&self, granted: &Permissions) -> bool {
        self.0.is_subset(&granted.0)
    }
}

/// Conditions on who may send a method.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Restrictions {
    /// Only the client itself, never a delegated agent.
    pub client_only: bool,
    /// Restricted to a single role.
    pub role: Option<RoleId>,
    /// The method changes state.
    pub writing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredAuthorization {
    pub permissions: Permissions,
    pub restrictions: Restrictions,
    pub agent: Option<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReply {
    pub content: Option<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryReply {
    pub content: Option<ContentBlock>,
}

/// A successful reply, correlated by position with its method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Action(ActionReply),
    Query(QueryReply),
}

impl Reply {
    pub(crate) fn for_method(method: &Method, content: Option<ContentBlock>) -> Self {
        if method.is_action() {
            Self::Action(ActionReply { content })
        } else {
            Self::Query(QueryReply { content })
        }
    }

    pub fn content(&self) -> Option<&ContentBlock> {
        match self {
            Self::Action(r) => r.content.as_ref(),
            Self::Query(r) => r.content.as_ref(),
        }
    }

    pub fn as_action(&self) -> Option<&ActionReply> {
        match self {
            Self::Action(r) => Some(r),
            Self::Query(_) => None,
        }
    }
}

/// What the host made of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply(Reply),
    Error(HostError),
    /// A null slot for a method that expects no reply.
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolesync_core::Effect;

    fn content(payload: &'static [u8]) -> ContentBlock {
        ContentBlock::new(TypeIdentifier::from_static("note@test"), payload)
    }

    fn internal(effect: Effect) -> InternalAction {
        InternalAction::new(
            RoleId(1),
            Identifier::new("alice@host.test").unwrap(),
            TypeIdentifier::from_static("notes@test"),
            content(b"add"),
            effect,
        )
    }

    #[test]
    fn test_recipient_is_subject_host() {
        let method = Method::Internal(internal(Effect::Deterministic));
        assert_eq!(method.recipient().as_str(), "host.test");
    }

    #[test]
    fn test_similarity() {
        let det = Method::Internal(internal(Effect::Deterministic));
        let assigned = Method::Internal(internal(Effect::HostAssigned));
        assert!(det.is_similar_to(&det));
        assert!(!assigned.is_similar_to(&assigned));
        assert!(!det.is_similar_to(&assigned));

        let query = Method::Query(Query::new(Identifier::new("alice@host.test").unwrap(), content(b"q")));
        assert!(!query.is_similar_to(&query));
    }

    #[test]
    fn test_slots() {
        let subject = Identifier::new("alice@host.test").unwrap();
        let signed = Method::Query(Query::new(subject.clone(), content(b"q")));
        let unsigned = Method::Query(Query::new(subject, content(b"q")).unsigned());
        assert!(matches!(signed.slot(), Slot::Signed(Some(_))));
        assert!(matches!(unsigned.slot(), Slot::Unsigned(Some(_))));
    }

    #[test]
    fn test_reply_kind_follows_method() {
        let action = Method::Internal(internal(Effect::HostAssigned));
        let query = Method::Query(Query::new(Identifier::new("alice@host.test").unwrap(), content(b"q")));
        assert!(Reply::for_method(&action, None).as_action().is_some());
        assert!(Reply::for_method(&query, None).as_action().is_none());
        assert!(!query.expects_reply());
        assert!(action.expects_reply());
    }

    #[test]
    fn test_permissions_subset() {
        let notes = TypeIdentifier::from_static("notes@test");
        let granted = Permissions::of(notes.clone());
        assert!(Permissions::none().is_subset(&granted));
        assert!(Permissions::of(notes).is_subset(&granted));
        assert!(!Permissions::of(TypeIdentifier::from_static("other@test")).is_subset(&granted));
    }
}
