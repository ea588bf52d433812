//! Applying response audits to local state.
//!
//! An audit lists every action the host applied to a service since the
//! client's cursor. Events the client itself caused are matched against the
//! action queue, in order; the rest came from other clients.

use std::collections::VecDeque;

use rolesync_core::{ActionId, PendingAction, ResponseAudit, ServiceKey, Time};
use tracing::{debug, warn};

use crate::error::Result;
use crate::queue::ActionQueue;
use crate::registry::ServiceRegistry;

/// How events are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditMode {
    /// Execute foreign events and our own delivered actions locally.
    Apply,
    /// A full-state snapshot already reflects every event; only settle the
    /// queue.
    Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditOutcome {
    /// The cursor after applying.
    pub cursor: Time,
    /// Foreign events applied.
    pub applied: usize,
    /// Our own queued actions the audit proved delivered.
    pub acknowledged: Vec<ActionId>,
    /// The audit was older than the stored cursor and was ignored.
    pub stale: bool,
}

/// Apply `audit` to the service `key` and advance its cursor.
///
/// Events matching an action in `sent` belong to the exchange that brought
/// the audit and are left to its sender.
pub async fn apply_audit(
    audit: &ResponseAudit,
    key: &ServiceKey,
    queue: &ActionQueue,
    registry: &ServiceRegistry,
    sent: &[PendingAction],
    mode: AuditMode,
) -> Result<AuditOutcome> {
    let store = queue.store();
    let cursor = store.load_audit_cursor(key).await?;
    if audit.this_time < cursor {
        debug!(%key, %cursor, this_time = %audit.this_time, "ignoring stale audit");
        return Ok(AuditOutcome {
            cursor,
            applied: 0,
            acknowledged: Vec::new(),
            stale: true,
        });
    }
    let service = registry.get(&key.service)?;

    let mut unmatched_sent: Vec<&PendingAction> = sent.iter().collect();
    let mut earlier: VecDeque<PendingAction> = queue
        .pending(key)
        .into_iter()
        .filter(|p| !sent.iter().any(|s| s.id == p.id))
        .collect();

    let mut applied = 0;
    let mut acknowledged = Vec::new();
    for event in audit.events_after(cursor) {
        if let Some(pos) = unmatched_sent
            .iter()
            .position(|p| p.action.content == event.content)
        {
            unmatched_sent.remove(pos);
            continue;
        }
        if earlier
            .front()
            .is_some_and(|p| p.action.content == event.content)
        {
            let Some(pending) = earlier.pop_front() else { continue };
            queue.acknowledge(key, pending.id).await?;
            if mode == AuditMode::Apply && !pending.action.executes_locally_first() {
                service.execute_action(&pending.action).await?;
            }
            acknowledged.push(pending.id);
            continue;
        }
        if mode == AuditMode::Apply {
            if let Err(e) = service.apply_event(key.role, event).await {
                warn!(%key, time = %event.time, error = %e, "failed to apply audit event");
                return Err(e);
            }
            applied += 1;
        }
    }

    store.save_audit_cursor(key, audit.this_time).await?;
    debug!(%key, cursor = %audit.this_time, applied, acknowledged = acknowledged.len(), "audit applied");
    Ok(AuditOutcome {
        cursor: audit.this_time,
        applied,
        acknowledged,
        stale: false,
    })
}
