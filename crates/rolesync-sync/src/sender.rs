//! One delivery attempt of a batch of queued actions.
//!
//! Every action in the batch leaves the sender acknowledged, failed or
//! requeued. None is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rolesync_core::{ActionId, Audit, PendingAction, ServiceKey};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{apply_audit, AuditMode, AuditOutcome};
use crate::config::SyncConfig;
use crate::error::{ErrorKind, Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::exchange::{Exchange, Response};
use crate::method::{Method, Outcome};
use crate::pool::retry_delay;
use crate::queue::ActionQueue;
use crate::registry::{Service, ServiceRegistry};

/// Everything a sender needs, shared by the synchronizer and its workers.
pub struct SyncContext {
    pub queue: ActionQueue,
    pub exchange: Exchange,
    pub registry: ServiceRegistry,
    pub events: EventBus,
    pub config: SyncConfig,
}

/// What became of a batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub delivered: Vec<ActionId>,
    pub failed: Vec<ActionId>,
    pub requeued: Vec<ActionId>,
    pub audit: Option<AuditOutcome>,
    /// Local state may have diverged from the host.
    pub reload_required: bool,
}

pub struct Sender {
    ctx: Arc<SyncContext>,
    key: ServiceKey,
    batch: Vec<PendingAction>,
    /// The host answered; a later local error may leave state behind it.
    answered: AtomicBool,
}

impl Sender {
    /// `batch` must come from one `dequeue_ready_batch` call for `key`.
    pub fn new(ctx: Arc<SyncContext>, key: ServiceKey, batch: Vec<PendingAction>) -> Self {
        Self {
            ctx,
            key,
            batch,
            answered: AtomicBool::new(false),
        }
    }

    pub fn ids(&self) -> Vec<ActionId> {
        self.batch.iter().map(|p| p.id).collect()
    }

    /// Deliver the batch once.
    ///
    /// On a local (store) error the actions still in flight are put back and
    /// the key is deferred, so the next round retries them.
    pub async fn run(self) -> Result<SendReport> {
        match self.deliver().await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.stall(&e).await;
                Err(e)
            }
        }
    }

    async fn stall(&self, error: &SyncError) {
        let ids = self.ids();
        if let Err(e) = self.ctx.queue.release(&self.key, &ids).await {
            warn!(key = %self.key, error = %e, "could not persist released batch");
        }
        let delay = retry_delay(
            1,
            self.ctx.config.backoff_floor(),
            self.ctx.config.backoff_ceiling(),
        );
        self.ctx.queue.defer(&self.key, Instant::now() + delay);
        warn!(key = %self.key, %error, ?delay, "sender stopped on a local error");
        self.ctx.events.emit(SyncEvent::Stalled {
            key: self.key.clone(),
            reason: error.to_string(),
            delay,
        });
        if self.answered.load(Ordering::SeqCst) {
            self.ctx.events.emit(SyncEvent::ReloadRequired {
                key: self.key.clone(),
            });
        }
    }

    async fn deliver(&self) -> Result<SendReport> {
        let mut report = SendReport::default();
        let Some(first) = self.batch.first() else {
            return Ok(report);
        };
        let subject = first.action.subject.clone();

        let service = match self.ctx.registry.get(&self.key.service) {
            Ok(service) => service,
            Err(e) => {
                self.fail_all(&e, &mut report).await?;
                return Ok(report);
            }
        };

        let cursor = self.ctx.queue.store().load_audit_cursor(&self.key).await?;
        let methods: Vec<Method> = self
            .batch
            .iter()
            .map(|p| Method::Internal(p.action.clone()))
            .collect();
        debug!(key = %self.key, actions = methods.len(), %cursor, "delivering batch");

        match self
            .ctx
            .exchange
            .send(&methods, subject.clone(), subject.host(), Some(Audit::request(cursor)))
            .await
        {
            Ok(response) => {
                self.answered.store(true, Ordering::SeqCst);
                if response.subject != subject {
                    info!(key = %self.key, from = %subject, to = %response.subject, "delivered to relocated subject");
                }
                self.delivered(response, service.as_ref(), &mut report).await?;
            }
            Err(e) if e.kind() == ErrorKind::Application => {
                self.fail_all(&e, &mut report).await?;
            }
            Err(e) => {
                self.requeue_all(&e, &mut report).await?;
            }
        }

        if report.reload_required {
            self.ctx.events.emit(SyncEvent::ReloadRequired {
                key: self.key.clone(),
            });
        }
        Ok(report)
    }

    async fn delivered(
        &self,
        response: Response,
        service: &dyn Service,
        report: &mut SendReport,
    ) -> Result<()> {
        let ctx = &self.ctx;
        for (pending, outcome) in self.batch.iter().zip(&response.outcomes) {
            match outcome {
                Outcome::Reply(_) | Outcome::Empty => {
                    ctx.queue.acknowledge(&self.key, pending.id).await?;
                    let action = &pending.action;
                    if !action.executes_locally_first() {
                        if let Err(e) = service.execute_action(action).await {
                            warn!(id = %pending.id, error = %e, "local execution failed after delivery");
                            report.reload_required = true;
                        }
                    }
                    if let Outcome::Reply(reply) = outcome {
                        if let Some(reply) = reply.as_action() {
                            if let Err(e) = service.execute_reply(action, reply).await {
                                warn!(id = %pending.id, error = %e, "failed to execute reply");
                                report.reload_required = true;
                            }
                        }
                    }
                    ctx.events.emit(SyncEvent::Delivered {
                        key: self.key.clone(),
                        id: pending.id,
                    });
                    report.delivered.push(pending.id);
                }
                Outcome::Error(error) => {
                    warn!(id = %pending.id, key = %self.key, %error, "host rejected action");
                    self.fail(pending, ErrorKind::Application, error.to_string(), report)
                        .await?;
                    // Already applied locally; local state is now ahead of the host.
                    if pending.action.executes_locally_first() {
                        report.reload_required = true;
                    }
                }
            }
        }

        if let Some(audit) = &response.audit {
            match apply_audit(
                audit,
                &self.key,
                &ctx.queue,
                &ctx.registry,
                &self.batch,
                AuditMode::Apply,
            )
            .await
            {
                Ok(outcome) => {
                    if !outcome.stale {
                        ctx.events.emit(SyncEvent::AuditApplied {
                            key: self.key.clone(),
                            cursor: outcome.cursor,
                            events: outcome.applied,
                        });
                    }
                    report.audit = Some(outcome);
                }
                Err(e) => {
                    warn!(key = %self.key, error = %e, "failed to apply audit");
                    report.reload_required = true;
                }
            }
        }
        Ok(())
    }

    async fn fail_all(&self, error: &SyncError, report: &mut SendReport) -> Result<()> {
        warn!(key = %self.key, %error, actions = self.batch.len(), "failing batch");
        for pending in &self.batch {
            self.fail(pending, error.kind(), error.to_string(), report)
                .await?;
            if pending.action.executes_locally_first() {
                report.reload_required = true;
            }
        }
        Ok(())
    }

    async fn requeue_all(&self, error: &SyncError, report: &mut SendReport) -> Result<()> {
        let max_attempts = self.ctx.config.max_delivery_attempts;
        let mut highest = 0;
        for pending in &self.batch {
            let attempts = self.ctx.queue.requeue(&self.key, pending.id).await?;
            if attempts >= max_attempts {
                let reason = format!("gave up after {attempts} attempts: {error}");
                self.fail(pending, error.kind(), reason, report).await?;
                if pending.action.executes_locally_first() {
                    report.reload_required = true;
                }
            } else {
                highest = highest.max(attempts);
                report.requeued.push(pending.id);
            }
        }
        if !report.requeued.is_empty() {
            let delay = retry_delay(
                highest,
                self.ctx.config.backoff_floor(),
                self.ctx.config.backoff_ceiling(),
            );
            warn!(key = %self.key, %error, attempts = highest, ?delay, "delivery failed, will retry");
            self.ctx.queue.defer(&self.key, Instant::now() + delay);
        }
        Ok(())
    }

    async fn fail(
        &self,
        pending: &PendingAction,
        kind: ErrorKind,
        reason: String,
        report: &mut SendReport,
    ) -> Result<()> {
        self.ctx.queue.fail(&self.key, pending.id, reason.clone()).await?;
        self.ctx.events.emit(SyncEvent::Failed {
            key: self.key.clone(),
            id: pending.id,
            kind,
            reason,
        });
        report.failed.push(pending.id);
        Ok(())
    }
}
