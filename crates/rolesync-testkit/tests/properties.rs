//! Property tests over generated envelopes, audits and action queues.

use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;
use rolesync_core::{Effect, Keypair, Role, RoleId, ServiceKey, Time};
use rolesync_envelope::{
    DecryptionKey, Draft, EncryptionContext, Envelope, KeyTableVerifier, KeypairSigner,
    SignatureVariant, Signer, Slot, X25519StaticSecret,
};
use rolesync_store::{MemoryStore, Store};
use rolesync_sync::{apply_audit, ActionQueue, AuditMode, ServiceRegistry, SyncConfig};
use rolesync_testkit::fixtures::{action, identifier, note, notes};
use rolesync_testkit::generators::{
    effect, identifier as any_identifier, keypair, request_slot, response_audit, response_slot,
};
use rolesync_testkit::{Harness, RecordingService, TestHost};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn expected_variant(slot: &Slot) -> SignatureVariant {
    match slot {
        Slot::Signed(_) => SignatureVariant::Client,
        _ => SignatureVariant::None,
    }
}

fn slot_content(slot: &Slot) -> Option<&rolesync_core::ContentBlock> {
    match slot {
        Slot::Null => None,
        Slot::Unsigned(c) | Slot::Signed(c) => c.as_ref(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn plaintext_request_round_trips(
        subject in any_identifier(),
        slots in prop::collection::vec(request_slot(), 1..6),
    ) {
        let signer = KeypairSigner::client(Keypair::generate());
        let bytes = Draft::request(subject.clone(), subject.host(), slots.clone())
            .encode(Some(&signer as &dyn Signer), &EncryptionContext::Plain)
            .unwrap();
        let envelope = Envelope::decode(&bytes, DecryptionKey::None, &KeyTableVerifier::new()).unwrap();

        prop_assert_eq!(&envelope.subject, &subject);
        prop_assert_eq!(&envelope.recipient, &Some(subject.host()));
        prop_assert_eq!(envelope.len(), slots.len());
        for (i, slot) in slots.iter().enumerate() {
            let element = envelope.elements[i].as_ref().unwrap();
            prop_assert_eq!(element.variant, expected_variant(slot));
            prop_assert_eq!(element.content.as_ref(), slot_content(slot));
        }
    }

    #[test]
    fn encrypted_request_round_trips(
        subject in any_identifier(),
        slots in prop::collection::vec(request_slot(), 1..4),
    ) {
        let secret = X25519StaticSecret::generate();
        let signer = KeypairSigner::client(Keypair::generate());
        let context = EncryptionContext::for_host(secret.public_key());
        let bytes = Draft::request(subject.clone(), subject.host(), slots.clone())
            .encode(Some(&signer as &dyn Signer), &context)
            .unwrap();

        let envelope = Envelope::decode(&bytes, DecryptionKey::Host(&secret), &KeyTableVerifier::new()).unwrap();
        prop_assert_eq!(envelope.key.as_ref(), context.symmetric_key());
        for (i, slot) in slots.iter().enumerate() {
            prop_assert_eq!(envelope.content(i), slot_content(slot));
        }

        let other = X25519StaticSecret::generate();
        prop_assert!(Envelope::decode(&bytes, DecryptionKey::Host(&other), &KeyTableVerifier::new()).is_err());
    }

    #[test]
    fn host_signed_response_keeps_null_slots(
        subject in any_identifier(),
        slots in prop::collection::vec(response_slot(), 1..6),
        host_key in keypair(),
    ) {
        // The subject travels inside the elements, so one must be present.
        prop_assume!(slots.iter().any(|s| *s != Slot::Null));
        let host = subject.host();
        let verifier = KeyTableVerifier::new();
        verifier.insert_host(&host, host_key.public_key());
        let signer = KeypairSigner::host(&host, host_key);
        let bytes = Draft::response(subject.clone(), slots.clone())
            .at(Time(1_000))
            .encode(Some(&signer as &dyn Signer), &EncryptionContext::Plain)
            .unwrap();
        let envelope = Envelope::decode(&bytes, DecryptionKey::None, &verifier).unwrap();

        prop_assert_eq!(envelope.len(), slots.len());
        for (i, slot) in slots.iter().enumerate() {
            match (slot, &envelope.elements[i]) {
                (Slot::Null, None) => {}
                (Slot::Signed(_), Some(element)) => {
                    prop_assert_eq!(element.variant, SignatureVariant::Host);
                }
                (Slot::Unsigned(_), Some(element)) => {
                    prop_assert_eq!(element.variant, SignatureVariant::None);
                }
                (slot, element) => {
                    prop_assert!(false, "{:?} decoded as {:?}", slot, element);
                }
            }
            prop_assert_eq!(envelope.content(i), slot_content(slot));
        }
    }

    #[test]
    fn audit_cursor_never_moves_backwards(
        audits in prop::collection::vec(response_audit(), 1..6),
    ) {
        runtime().block_on(async {
            let queue = ActionQueue::open(Arc::new(MemoryStore::new())).await.unwrap();
            let service = RecordingService::new();
            let registry = ServiceRegistry::new().with(service.clone());
            let key = ServiceKey::new(RoleId(1), notes());

            let mut cursor = Time::ZERO;
            let mut applied = 0;
            for audit in &audits {
                let expected = if audit.this_time < cursor {
                    0
                } else {
                    audit.events_after(cursor).count()
                };
                let outcome = apply_audit(audit, &key, &queue, &registry, &[], AuditMode::Apply)
                    .await
                    .unwrap();
                assert_eq!(outcome.stale, audit.this_time < cursor);
                assert_eq!(outcome.applied, expected);
                cursor = cursor.max(audit.this_time);
                assert_eq!(outcome.cursor, cursor);
                assert_eq!(queue.store().load_audit_cursor(&key).await.unwrap(), cursor);
                applied += expected;
            }
            assert_eq!(service.state().len(), applied);
        });
    }

    /// After a reload, local state is the host snapshot followed by every
    /// deterministic action the snapshot does not contain, in enqueue order.
    #[test]
    fn reload_redoes_exactly_the_undelivered_suffix(
        actions in prop::collection::vec(("[a-z]{1,8}", effect()), 1..8),
        delivered in 0usize..8,
    ) {
        let delivered = delivered.min(actions.len());
        runtime().block_on(async {
            let alice = identifier("alice@host.test");
            let host = TestHost::new(alice.clone());
            host.record_foreign(note(b"seed-0"));
            let harness = Harness::new();
            harness.add_host(&host).await;
            let sync = harness.unstarted_synchronizer(SyncConfig::default()).await.unwrap();

            let mut ids = Vec::new();
            for (payload, effect) in &actions {
                ids.push(sync.execute(action(&alice, payload.as_bytes(), *effect)).await.unwrap());
            }
            // The host applied a prefix whose acknowledgments were lost.
            for (payload, _) in &actions[..delivered] {
                host.record_foreign(note(payload.as_bytes()));
            }

            let report = sync.reload(&Role::new(RoleId(1), alice.clone()), &notes()).await.unwrap();

            assert_eq!(report.acknowledged, ids[..delivered].to_vec());
            assert_eq!(report.pending, ids[delivered..].to_vec());
            let redone: Vec<_> = ids[delivered..]
                .iter()
                .zip(&actions[delivered..])
                .filter(|(_, (_, effect))| *effect == Effect::Deterministic)
                .map(|(id, _)| *id)
                .collect();
            assert_eq!(report.redone, redone);

            let mut expected = vec![Bytes::from_static(b"seed-0")];
            expected.extend(actions[..delivered].iter().map(|(p, _)| Bytes::from(p.clone())));
            expected.extend(
                actions[delivered..]
                    .iter()
                    .filter(|(_, effect)| *effect == Effect::Deterministic)
                    .map(|(p, _)| Bytes::from(p.clone())),
            );
            assert_eq!(harness.service.state(), expected);
            assert_eq!(report.cursor, Time(delivered as i64 + 1));
        });
    }
}
