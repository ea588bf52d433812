//! # rolesync core
//!
//! Pure primitives shared by every rolesync layer: identifiers, the
//! byte-exact wire encoding, content and compression blocks, audits and
//! internal actions.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`ContentBlock`] - A typed, self-describing payload
//! - [`CompressedBlock`] - The compression layer around one content block
//! - [`Audit`] - Request cursor or host response trailer
//! - [`InternalAction`] / [`PendingAction`] - Queued client state changes
//!
//! ## Wire encoding
//!
//! All blocks implement [`Encode`]/[`Decode`]. See the [`wire`] module.

pub mod action;
pub mod audit;
pub mod compression;
pub mod content;
pub mod crypto;
pub mod error;
pub mod types;
pub mod wire;

pub use action::{DeliveryState, Effect, FailedAction, InternalAction, PendingAction};
pub use audit::{Audit, AuditEvent, RequestAudit, ResponseAudit};
pub use compression::{Algorithm, CompressedBlock};
pub use content::ContentBlock;
pub use crypto::{Blake3Hash, Ed25519PublicKey, Ed25519Signature, Keypair};
pub use error::{CoreError, Result};
pub use types::{
    ActionId, AgentId, HostIdentifier, Identifier, Role, RoleId, ServiceKey, Time,
    TypeIdentifier, MAX_IDENTIFIER_LEN,
};
pub use wire::{Decode, Encode, WireReader, WireWriter};
