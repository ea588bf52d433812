//! # rolesync sync
//!
//! Keeps client-side service state in step with the hosts that own it.
//!
//! ## Overview
//!
//! Internal actions are queued durably per `(role, service)`, delivered in
//! enqueue order by senders running on a bounded worker pool, and
//! reconciled with the host through audits. A full reload replaces local
//! state with a host snapshot and redoes what the snapshot does not
//! contain yet.
//!
//! ## Key Types
//!
//! - [`Synchronizer`] - Execute, reload, refresh and shut down
//! - [`ActionQueue`] - Durable per-service FIFO of pending actions
//! - [`Exchange`] - One request/response round trip with bounded resends
//! - [`Sender`] - One delivery attempt of a batch
//! - [`Connector`] - Transport to hosts (in-memory or TCP)
//!
//! ## Message Flow
//!
//! ```text
//! execute ──► ActionQueue ──► dispatch loop ──► WorkerPool ──► Sender
//!                 ▲                                              │
//!                 │            acknowledge / fail / requeue      ▼
//!                 └──────────────────────────────────────── Exchange ◄──► host
//! ```

pub mod audit;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod events;
pub mod exchange;
pub mod method;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod sender;
pub mod synchronizer;
pub mod transport;

pub use audit::{apply_audit, AuditMode, AuditOutcome};
pub use collaborators::{
    Authorizer, GrantAuthorizer, HostKeys, Identity, IdentityResolver, KeyTable, LocalResolver,
    OpenAuthorizer, SigningContext, StaticSigning,
};
pub use config::SyncConfig;
pub use error::{ErrorKind, Result, SyncError};
pub use events::{EventBus, SyncEvent};
pub use exchange::{Exchange, Response};
pub use method::{
    ActionReply, ExternalAction, Method, Outcome, Permissions, Query, QueryReply, Reply,
    RequiredAuthorization, Restrictions,
};
pub use pool::{retry_delay, Backoff, Rejected, WorkerPool};
pub use protocol::{AuditQuery, ErrorCode, HostError, Relocation, StateQuery, StateReply};
pub use queue::ActionQueue;
pub use registry::{Service, ServiceRegistry};
pub use sender::{SendReport, Sender, SyncContext};
pub use synchronizer::{ReloadReport, SuspensionGuard, Synchronizer};
pub use transport::memory::MemoryNetwork;
pub use transport::tcp::TcpConnector;
pub use transport::{Connector, RequestHandler};
