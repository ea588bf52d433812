//! The transport exchange: one request envelope out, one response back.
//!
//! A response is only handed to the caller after three checks:
//! - every present element is signed by the recipient host
//! - the response is about the request's subject
//! - the response has exactly one slot per method
//!
//! An encrypted request must be answered under the same key. The one
//! plaintext answer accepted is a host-signed stale-key notice.
//!
//! Key rotation, stale encryption keys and identity relocation are answered
//! by resending. Resends are bounded by an explicit iteration counter.

use std::sync::Arc;

use bytes::Bytes;
use rolesync_core::{Audit, ContentBlock, HostIdentifier, Identifier, ResponseAudit};
use rolesync_envelope::{
    DecryptionKey, Draft, EncryptionContext, Envelope, EnvelopeError, PacketType,
    SignatureVariant, Verifier,
};
use tracing::{debug, info, warn};

use crate::collaborators::{HostKeys, IdentityResolver, SigningContext};
use crate::error::{Result, SyncError};
use crate::method::{Method, Outcome, Reply};
use crate::protocol::{ErrorCode, HostError, Relocation};
use crate::transport::Connector;

/// A validated response.
#[derive(Debug, Clone)]
pub struct Response {
    /// The subject the methods finally reached; differs from the requested
    /// one after a relocation.
    pub subject: Identifier,
    pub recipient: HostIdentifier,
    pub audit: Option<ResponseAudit>,
    /// One outcome per method, in method order.
    pub outcomes: Vec<Outcome>,
    /// Attempts it took, starting at 1.
    pub iterations: u32,
}

enum Attempt {
    Done(Response),
    Retry(String),
}

/// Where a request is going. Rewritten by relocation.
struct Target {
    subject: Identifier,
    recipient: HostIdentifier,
}

pub struct Exchange {
    connector: Arc<dyn Connector>,
    signing: Arc<dyn SigningContext>,
    host_keys: Arc<dyn HostKeys>,
    resolver: Arc<dyn IdentityResolver>,
    verifier: Arc<dyn Verifier>,
    max_iterations: u32,
}

impl Exchange {
    pub fn new(
        connector: Arc<dyn Connector>,
        signing: Arc<dyn SigningContext>,
        host_keys: Arc<dyn HostKeys>,
        resolver: Arc<dyn IdentityResolver>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            connector,
            signing,
            host_keys,
            resolver,
            verifier,
            max_iterations: 3,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Send `methods` about `subject` to `recipient` and return the
    /// validated response.
    pub async fn send(
        &self,
        methods: &[Method],
        subject: Identifier,
        recipient: HostIdentifier,
        audit: Option<Audit>,
    ) -> Result<Response> {
        if methods.is_empty() {
            return Err(EnvelopeError::Empty.into());
        }
        let mut target = Target { subject, recipient };
        let mut reason = String::new();
        for iteration in 1..=self.max_iterations {
            match self
                .attempt(methods, &mut target, audit.as_ref(), iteration)
                .await?
            {
                Attempt::Done(mut response) => {
                    response.iterations = iteration;
                    return Ok(response);
                }
                Attempt::Retry(why) => {
                    debug!(iteration, reason = %why, "resending");
                    reason = why;
                }
            }
        }
        warn!(iterations = self.max_iterations, %reason, "exchange gave up");
        Err(SyncError::RetriesExhausted {
            iterations: self.max_iterations,
            reason,
        })
    }

    async fn attempt(
        &self,
        methods: &[Method],
        target: &mut Target,
        audit: Option<&Audit>,
        iteration: u32,
    ) -> Result<Attempt> {
        let context = match self.host_keys.encryption_key(&target.recipient).await? {
            Some(host_key) => EncryptionContext::for_host(host_key),
            None => EncryptionContext::Plain,
        };
        let mut draft = Draft::request(
            target.subject.clone(),
            target.recipient.clone(),
            methods.iter().map(Method::slot).collect(),
        );
        if let Some(audit) = audit {
            draft = draft.with_audit(audit.clone());
        }
        let signer = self.signing.signer();
        let request = draft.encode(Some(signer.as_ref()), &context)?;
        debug!(
            subject = %target.subject,
            recipient = %target.recipient,
            methods = methods.len(),
            iteration,
            "sending request"
        );

        let bytes = self.connector.exchange(&target.recipient, request).await?;
        let key = match context.symmetric_key() {
            Some(key) => DecryptionKey::Symmetric(key),
            None => DecryptionKey::None,
        };
        let envelope = Envelope::decode(&bytes, key, self.verifier.as_ref())?;
        self.validate(&envelope, methods.len(), target)?;
        if context.symmetric_key().is_some() && envelope.key.is_none() && !is_stale_key_notice(&envelope)
        {
            return Err(SyncError::InvalidResponse(
                "plaintext reply to an encrypted request".into(),
            ));
        }

        if let Some(signal) = self.recoverable_signal(&envelope)? {
            return self.recover(signal, target).await.map(Attempt::Retry);
        }

        let outcomes = build_outcomes(methods, &envelope)?;
        let audit = match envelope.audit {
            None => None,
            Some(Audit::Response(audit)) => Some(audit),
            Some(Audit::Request(_)) => {
                return Err(SyncError::InvalidResponse(
                    "response carries a request audit".into(),
                ))
            }
        };
        Ok(Attempt::Done(Response {
            subject: target.subject.clone(),
            recipient: target.recipient.clone(),
            audit,
            outcomes,
            iterations: iteration,
        }))
    }

    fn validate(&self, envelope: &Envelope, expected: usize, target: &Target) -> Result<()> {
        if envelope.packet != PacketType::Response {
            return Err(SyncError::InvalidResponse("expected a response packet".into()));
        }
        if envelope.len() != expected {
            return Err(SyncError::InvalidResponse(format!(
                "{} reply slots for {expected} methods",
                envelope.len()
            )));
        }
        let host = Bytes::copy_from_slice(target.recipient.as_str().as_bytes());
        match &envelope.signer {
            Some((SignatureVariant::Host, identity)) if *identity == host => {}
            Some((variant, identity)) => {
                return Err(SyncError::InvalidResponse(format!(
                    "reply signed by {variant:?} {}, expected host {}",
                    String::from_utf8_lossy(identity),
                    target.recipient
                )))
            }
            None => {
                return Err(SyncError::InvalidResponse(format!(
                    "reply is not signed by host {}",
                    target.recipient
                )))
            }
        }
        let unsigned = envelope
            .elements
            .iter()
            .position(|e| matches!(e, Some(element) if element.variant != SignatureVariant::Host));
        if let Some(i) = unsigned {
            return Err(SyncError::InvalidResponse(format!(
                "reply slot {i} is not host-signed"
            )));
        }
        if envelope.subject != target.subject {
            return Err(SyncError::InvalidResponse(format!(
                "reply is about {}, request was about {}",
                envelope.subject, target.subject
            )));
        }
        Ok(())
    }

    fn recoverable_signal(&self, envelope: &Envelope) -> Result<Option<Signal>> {
        for content in (0..envelope.len()).filter_map(|i| envelope.content(i)) {
            if Relocation::is_relocation(content) {
                return Ok(Some(Signal::Relocated(Relocation::from_content(content)?)));
            }
            if HostError::is_error(content) {
                let error = HostError::from_content(content)?;
                match error.code {
                    ErrorCode::KeyRotated => return Ok(Some(Signal::KeyRotated)),
                    ErrorCode::StaleEncryptionKey => return Ok(Some(Signal::StaleKey)),
                    _ => {}
                }
            }
        }
        Ok(None)
    }

    async fn recover(&self, signal: Signal, target: &mut Target) -> Result<String> {
        match signal {
            Signal::KeyRotated => {
                info!(host = %target.recipient, "host key rotated, recommitting");
                self.signing.recommit(&target.recipient).await?;
                Ok(format!("{} rotated its key", target.recipient))
            }
            Signal::StaleKey => {
                info!(host = %target.recipient, "host rejected encryption key, refreshing");
                self.host_keys.refresh(&target.recipient).await?;
                Ok(format!("{} rejected the encryption key", target.recipient))
            }
            Signal::Relocated(relocation) => {
                let from = target.subject.clone();
                self.relocate(relocation, target).await?;
                Ok(format!("{from} relocated to {}", target.subject))
            }
        }
    }

    async fn relocate(&self, relocation: Relocation, target: &mut Target) -> Result<()> {
        let successor = match relocation.successor {
            Some(successor) => successor,
            None => self
                .resolver
                .resolve_successor(&target.subject)
                .await?
                .ok_or_else(|| {
                    SyncError::InvalidResponse(format!(
                        "{} relocated to an unknown successor",
                        target.subject
                    ))
                })?,
        };
        let original = self.resolver.resolve(&target.subject).await?;
        let moved = self.resolver.resolve(&successor).await?;
        if original.number != moved.number {
            return Err(SyncError::IdentityMismatch {
                from: target.subject.clone(),
                to: successor,
            });
        }
        self.resolver
            .merge_identities(std::slice::from_ref(&target.subject), &successor)
            .await?;
        info!(from = %target.subject, to = %successor, "subject relocated");
        target.recipient = successor.host();
        target.subject = successor;
        Ok(())
    }
}

enum Signal {
    KeyRotated,
    StaleKey,
    Relocated(Relocation),
}

/// Every slot carries a `StaleEncryptionKey` error.
fn is_stale_key_notice(envelope: &Envelope) -> bool {
    (0..envelope.len()).all(|i| {
        envelope.content(i).is_some_and(|content| {
            HostError::is_error(content)
                && HostError::from_content(content)
                    .is_ok_and(|e| e.code == ErrorCode::StaleEncryptionKey)
        })
    })
}

fn build_outcomes(methods: &[Method], envelope: &Envelope) -> Result<Vec<Outcome>> {
    methods
        .iter()
        .zip(&envelope.elements)
        .enumerate()
        .map(|(i, (method, element))| {
            let Some(element) = element else {
                if method.expects_reply() {
                    return Err(SyncError::InvalidResponse(format!("no reply for method {i}")));
                }
                return Ok(Outcome::Empty);
            };
            outcome_for(i, method, element.content.as_ref())
        })
        .collect()
}

fn outcome_for(i: usize, method: &Method, content: Option<&ContentBlock>) -> Result<Outcome> {
    let Some(content) = content else {
        if method.reply_type().is_some() {
            return Err(SyncError::InvalidResponse(format!("empty reply for method {i}")));
        }
        return Ok(Outcome::Reply(Reply::for_method(method, None)));
    };
    if HostError::is_error(content) {
        return Ok(Outcome::Error(HostError::from_content(content)?));
    }
    if let Some(expected) = method.reply_type() {
        if !content.is_type(expected) {
            return Err(SyncError::InvalidResponse(format!(
                "method {i} expected {expected}, got {}",
                content.type_id
            )));
        }
    }
    Ok(Outcome::Reply(Reply::for_method(method, Some(content.clone()))))
}
