//! # rolesync
//!
//! Client-side synchronization of role state with hosts.
//!
//! ## Overview
//!
//! A client records *internal actions* against services owned by a role,
//! executes them locally when their effect is known, and delivers them in
//! batches to the subject's host inside signed, optionally encrypted
//! envelopes. Responses carry replies and an audit of everything the host
//! applied since the client last asked, which keeps local state converged
//! with actions made elsewhere.
//!
//! - **Queue**: durable per-`(role, service)` FIFO of undelivered actions
//! - **Exchange**: request/response with bounded retries on key rotation,
//!   stale encryption keys and subject relocation
//! - **Audit**: ordered application of host events, skipping our own
//! - **Reload / refresh**: full-state snapshot or audit catch-up while the
//!   service is suspended
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rolesync::{Client, ClientConfig, Collaborators};
//! use rolesync::envelope::{KeyTableVerifier, KeypairSigner};
//! use rolesync::sync::{KeyTable, LocalResolver, OpenAuthorizer, ServiceRegistry, StaticSigning};
//! use rolesync::core::Keypair;
//!
//! async fn example() -> rolesync::Result<()> {
//!     rolesync::init_tracing("info")?;
//!     let config = ClientConfig::from_json_str(r#"{"hosts": {"example.net": "127.0.0.1:7400"}}"#)?;
//!     let collaborators = Collaborators {
//!         signing: Arc::new(StaticSigning::new(Arc::new(KeypairSigner::client(Keypair::generate())))),
//!         host_keys: Arc::new(KeyTable::new()),
//!         resolver: Arc::new(LocalResolver::new()),
//!         verifier: Arc::new(KeyTableVerifier::new()),
//!         authorizer: Arc::new(OpenAuthorizer),
//!     };
//!     let client = Client::open(config, collaborators, ServiceRegistry::new()).await?;
//!     // client.execute(action).await?;
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `rolesync::core` - identifiers, wire primitives, content and actions
//! - `rolesync::envelope` - envelope codec, signatures and encryption
//! - `rolesync::store` - durable queue storage
//! - `rolesync::sync` - exchange, queue, sender and synchronizer

pub mod client;
pub mod config;
pub mod error;
pub mod telemetry;

// Re-export component crates
pub use rolesync_core as core;
pub use rolesync_envelope as envelope;
pub use rolesync_store as store;
pub use rolesync_sync as sync;

// Re-export main types for convenience
pub use client::{Client, Collaborators};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use telemetry::init_tracing;

pub use rolesync_core::{
    ActionId, ContentBlock, Effect, Identifier, InternalAction, Role, RoleId, ServiceKey,
    TypeIdentifier,
};
pub use rolesync_sync::{Service, ServiceRegistry, SyncConfig, SyncEvent};
