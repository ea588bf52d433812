//! Proptest generators for property-based testing.

use bytes::Bytes;
use proptest::prelude::*;

use rolesync_core::{
    AuditEvent, ContentBlock, Effect, Identifier, Keypair, ResponseAudit, Time, TypeIdentifier,
};
use rolesync_envelope::Slot;

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// A lowercase DNS-ish label.
fn label() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,11}"
}

/// Generate a user identifier `name@host.tld`.
pub fn identifier() -> impl Strategy<Value = Identifier> {
    (label(), label(), label()).prop_filter_map("invalid identifier", |(user, host, tld)| {
        Identifier::new(format!("{user}@{host}.{tld}")).ok()
    })
}

/// Generate a content type identifier.
pub fn type_identifier() -> impl Strategy<Value = TypeIdentifier> {
    (label(), label()).prop_filter_map("invalid type", |(name, domain)| {
        TypeIdentifier::new(format!("{name}@{domain}.test")).ok()
    })
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..=max_len).prop_map(Bytes::from)
}

/// Generate a content block.
pub fn content_block() -> impl Strategy<Value = ContentBlock> {
    (type_identifier(), payload(256)).prop_map(|(t, p)| ContentBlock::new(t, p))
}

/// Generate a request slot: signed or unsigned, with or without content.
pub fn request_slot() -> impl Strategy<Value = Slot> {
    (any::<bool>(), prop::option::of(content_block())).prop_map(|(signed, content)| {
        if signed {
            Slot::Signed(content)
        } else {
            Slot::Unsigned(content)
        }
    })
}

/// Generate a response slot, which may also be null.
pub fn response_slot() -> impl Strategy<Value = Slot> {
    prop_oneof![1 => Just(Slot::Null), 4 => request_slot()]
}

pub fn effect() -> impl Strategy<Value = Effect> {
    prop_oneof![Just(Effect::Deterministic), Just(Effect::HostAssigned)]
}

/// Generate a well-formed response audit: strictly increasing event times
/// within `(last_time, this_time]`.
pub fn response_audit() -> impl Strategy<Value = ResponseAudit> {
    (
        0i64..1_000,
        prop::collection::vec((1i64..100, content_block()), 0..8),
        0i64..100,
    )
        .prop_filter_map("invalid audit", |(last, steps, slack)| {
            let mut time = last;
            let events = steps
                .into_iter()
                .map(|(step, content)| {
                    time += step;
                    AuditEvent {
                        time: Time(time),
                        content,
                    }
                })
                .collect();
            ResponseAudit::new(Time(last), Time(time + slack), events).ok()
        })
}
