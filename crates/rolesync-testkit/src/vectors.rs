//! Golden wire vectors.
//!
//! Each vector pins the exact bytes one encoder produces for fixed input.
//! Every layout is built from stored (undeflated) content so the bytes do
//! not depend on the zlib implementation. Content is stored only when it is
//! empty and carries no audit, so no vector attaches an audit to content.

use bytes::Bytes;
use rolesync_core::{
    Audit, AuditEvent, ContentBlock, Encode, HostIdentifier, Identifier, Keypair, ResponseAudit,
    Time, TypeIdentifier,
};
use rolesync_envelope::{Draft, EncryptionContext, KeypairSigner, Signer, Slot};
use serde::Serialize;

/// A golden test vector.
#[derive(Debug, Clone, Serialize)]
pub struct GoldenVector {
    /// Human-readable name for the vector.
    pub name: &'static str,
    /// What the bytes encode.
    pub description: &'static str,
    /// Expected encoding (hex).
    pub expected: &'static str,
}

/// Seed of the host keypair signing [`signed_response`].
pub const HOST_SEED: [u8; 32] = [0x07; 32];

/// Public key derived from [`HOST_SEED`] (hex).
pub const HOST_PUBLIC_KEY: &str =
    "ea4a6c63e29c520abef5507b132ec5f9954776aebebe7b92421eea691446d22c";

pub fn all_vectors() -> Vec<GoldenVector> {
    vec![
        GoldenVector {
            name: "content_block",
            description: "note@test carrying \"hi\"",
            expected: "096e6f74654074657374000000026869",
        },
        GoldenVector {
            name: "request_audit",
            description: "request audit with cursor 5",
            expected: "000000000000000005",
        },
        GoldenVector {
            name: "response_audit",
            description: "response audit 0..20 with one event at 10",
            expected: concat!(
                "01",
                "0000000000000000",
                "0000000000000014",
                "00000001",
                "000000000000000a",
                "096e6f746540746573740000000178",
            ),
        },
        GoldenVector {
            name: "unsigned_request",
            description: "plaintext request, one unsigned empty ping",
            expected: concat!(
                "20726571756573742e7061636b657440636f72652e726f6c6573796e632e6e6574",
                "00000043",
                "00000001",
                "0109686f73742e74657374",
                "00",
                "0000002f",
                "00000001",
                "01",
                "00000026",
                "00",
                "0f616c69636540686f73742e74657374",
                "00",
                "01000000000e0970696e67407465737400000000",
            ),
        },
        GoldenVector {
            name: "signed_response",
            description: "plaintext response signed by the host, one empty pong and a null slot",
            expected: concat!(
                "21726573706f6e73652e7061636b657440636f72652e726f6c6573796e632e6e6574",
                "00000093",
                "00000002",
                "00",
                "00",
                "00000089",
                "00000002",
                "01",
                "0000007f",
                "01",
                "0f616c69636540686f73742e74657374",
                "00",
                "01000000000e09706f6e67407465737400000000",
                "00000009686f73742e74657374",
                "00000000000003e8",
                "00000040",
                "8f90e92592619968d73d21daeb1162d28a44f5ae87622cd9d50208bc5a3a648e",
                "65927a6c1043b83a7d2c63f1afac1e7795ebc9c0140a81b5191f34ab9fba970b",
                "00",
            ),
        },
    ]
}

fn subject() -> Identifier {
    Identifier::new("alice@host.test").expect("valid identifier")
}

fn empty(name: &'static str) -> ContentBlock {
    ContentBlock::empty(TypeIdentifier::from_static(name))
}

pub fn content_block() -> Bytes {
    ContentBlock::new(TypeIdentifier::from_static("note@test"), &b"hi"[..]).to_bytes()
}

pub fn request_audit() -> Bytes {
    Audit::request(Time(5)).to_bytes()
}

pub fn response_audit() -> Bytes {
    let event = AuditEvent {
        time: Time(10),
        content: ContentBlock::new(TypeIdentifier::from_static("note@test"), &b"x"[..]),
    };
    match ResponseAudit::new(Time(0), Time(20), vec![event]) {
        Ok(audit) => Audit::Response(audit).to_bytes(),
        Err(e) => panic!("golden audit rejected: {e}"),
    }
}

pub fn unsigned_request() -> Bytes {
    let host = HostIdentifier::new("host.test").expect("valid host");
    Draft::request(subject(), host, vec![Slot::Unsigned(Some(empty("ping@test")))])
        .encode(None, &EncryptionContext::Plain)
        .expect("encodable request")
}

pub fn signed_response() -> Bytes {
    let host = HostIdentifier::new("host.test").expect("valid host");
    let signer = KeypairSigner::host(&host, Keypair::from_seed(&HOST_SEED));
    Draft::response(subject(), vec![Slot::Signed(Some(empty("pong@test"))), Slot::Null])
        .at(Time(1000))
        .encode(Some(&signer as &dyn Signer), &EncryptionContext::Plain)
        .expect("encodable response")
}

/// Encode the input a vector describes.
pub fn encode_vector(vector: &GoldenVector) -> Option<Bytes> {
    let bytes = match vector.name {
        "content_block" => content_block(),
        "request_audit" => request_audit(),
        "response_audit" => response_audit(),
        "unsigned_request" => unsigned_request(),
        "signed_response" => signed_response(),
        _ => return None,
    };
    Some(bytes)
}

/// Check every vector, returning the names of those that differ.
pub fn verify_all_vectors() -> Vec<&'static str> {
    all_vectors()
        .iter()
        .filter(|v| encode_vector(v).map(hex::encode).as_deref() != Some(v.expected))
        .map(|v| v.name)
        .collect()
}

/// All vectors as pretty JSON, for other implementations to consume.
pub fn vectors_json() -> serde_json::Result<String> {
    serde_json::to_string_pretty(&all_vectors())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_vectors_match() {
        assert_eq!(verify_all_vectors(), Vec::<&str>::new());
    }

    #[test]
    fn test_host_public_key() {
        assert_eq!(
            Keypair::from_seed(&HOST_SEED).public_key().to_hex(),
            HOST_PUBLIC_KEY
        );
    }

    #[test]
    fn test_vectors_serialize() {
        let json = vectors_json().unwrap();
        assert!(json.contains("signed_response"));
    }
}
