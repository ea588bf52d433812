//! Store trait: durable state of the synchronizer.
//!
//! The action queue and the audit cursors must survive a crash between
//! enqueue and acknowledgment. Implementations include SQLite (primary)
//! and in-memory (for tests).

use async_trait::async_trait;
use rolesync_core::{ActionId, DeliveryState, FailedAction, PendingAction, ServiceKey, Time};

use crate::error::Result;

/// The Store trait: async interface for synchronizer persistence.
///
/// For SQLite, `spawn_blocking` is used internally to avoid blocking the
/// runtime.
///
/// # Design Notes
///
/// - **Ordering**: pending actions load in ascending [`ActionId`] order,
///   which is enqueue order.
/// - **Failures are terminal**: [`Store::record_failure`] removes the
///   pending entry and records the failure in one step.
/// - **Cursors default to zero**: a service never synced has cursor [`Time::ZERO`].
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Pending Actions
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert or replace a pending action.
    async fn persist_action(&self, pending: &PendingAction) -> Result<()>;

    /// Update delivery state and attempt counter of a pending action.
    async fn set_delivery_state(
        &self,
        id: ActionId,
        state: DeliveryState,
        attempts: u32,
    ) -> Result<()>;

    /// Remove an acknowledged action. Removing an unknown id is a no-op.
    async fn remove_action(&self, id: ActionId) -> Result<()>;

    /// Pending actions of one service, in enqueue order.
    async fn load_pending(&self, key: &ServiceKey) -> Result<Vec<PendingAction>>;

    /// Every pending action, in enqueue order.
    async fn load_all_pending(&self) -> Result<Vec<PendingAction>>;

    /// Highest action id ever persisted, including failed ones.
    async fn max_action_id(&self) -> Result<Option<ActionId>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Audit Cursors
    // ─────────────────────────────────────────────────────────────────────────

    async fn save_audit_cursor(&self, key: &ServiceKey, time: Time) -> Result<()>;

    async fn load_audit_cursor(&self, key: &ServiceKey) -> Result<Time>;

    // ─────────────────────────────────────────────────────────────────────────
    // Failures
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a failed action and drop it from the pending set.
    async fn record_failure(&self, failed: &FailedAction) -> Result<()>;

    async fn load_failures(&self) -> Result<Vec<FailedAction>>;
}
