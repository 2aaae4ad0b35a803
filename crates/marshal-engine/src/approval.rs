use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use marshal_core::config::ApprovalConfig;
use marshal_core::error::{MarshalError, Result};
use marshal_core::event::EventBus;
use marshal_core::policy::{RiskLevel, Urgency};
use marshal_core::traits::ApprovalChannel;
use marshal_core::types::{ActionRequest, ApprovalRequest, ApprovalStatus, EngineEvent};

/// Expiry reason recorded when the owning run is cancelled.
pub const RUN_CANCELLED: &str = "run_cancelled";

/// How long resolved and expired requests stay queryable before pruning.
pub const RESOLVED_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Approval channel that only writes to the tracing log.
pub struct LoggingChannel;

impl ApprovalChannel for LoggingChannel {
    fn notify(&self, request: &ApprovalRequest) -> BoxFuture<'_, Result<()>> {
        info!(
            id = %request.id,
            action = %request.action,
            risk = %request.risk,
            urgency = %request.urgency,
            summary = %request.summary,
            "Approval requested"
        );
        Box::pin(async { Ok(()) })
    }

    fn escalate(&self, request: &ApprovalRequest) -> BoxFuture<'_, Result<()>> {
        warn!(
            id = %request.id,
            action = %request.action,
            expires_at = %request.expires_at,
            "Approval escalated"
        );
        Box::pin(async { Ok(()) })
    }
}

struct Entry {
    request: ApprovalRequest,
    tx: watch::Sender<ApprovalStatus>,
    opened: Instant,
    lifetime: Duration,
    settled: Option<Instant>,
}

impl Entry {
    fn deadline(&self) -> Instant {
        self.opened + self.lifetime
    }

    fn escalate_at(&self) -> Instant {
        self.opened + self.lifetime / 2
    }
}

/// Tracks human approval requests from creation to a terminal status.
pub struct ApprovalCoordinator {
    entries: Mutex<HashMap<String, Entry>>,
    config: ApprovalConfig,
    channel: Arc<dyn ApprovalChannel>,
    event_bus: Arc<EventBus>,
}

impl ApprovalCoordinator {
    pub fn new(
        config: ApprovalConfig,
        channel: Arc<dyn ApprovalChannel>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
            channel,
            event_bus,
        }
    }

    /// Open a request for `action`. It expires after the urgency's lifetime.
    pub async fn request_approval(
        &self,
        action: &ActionRequest,
        risk: RiskLevel,
        urgency: Urgency,
    ) -> ApprovalRequest {
        let lifetime = self.config.timeout_for(urgency);
        let created_at = Utc::now();
        let expires_at = created_at
            + chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::hours(24));
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            run_id: action.run_id.clone(),
            node: action.node.clone(),
            action: action.action.clone(),
            risk,
            urgency,
            summary: action.summary(),
            created_at,
            expires_at,
            status: ApprovalStatus::Pending,
            escalation_count: 0,
            resolved_by: None,
            reason: None,
        };

        self.prune_resolved().await;
        let (tx, _) = watch::channel(ApprovalStatus::Pending);
        self.entries.lock().await.insert(
            request.id.clone(),
            Entry {
                request: request.clone(),
                tx,
                opened: Instant::now(),
                lifetime,
                settled: None,
            },
        );

        self.event_bus.publish(EngineEvent::ApprovalRequested {
            request: request.clone(),
        });
        if let Err(e) = self.channel.notify(&request).await {
            warn!(id = %request.id, error = %e, "Approval channel notify failed");
        }
        request
    }

    /// Wait until the request leaves the pending state. Escalates once at
    /// half the lifetime and expires the request at its deadline.
    pub async fn wait_for_resolution(&self, id: &str) -> Result<ApprovalRequest> {
        let (mut rx, escalate_at, deadline, mut escalated) = {
            let entries = self.entries.lock().await;
            let entry = entries
                .get(id)
                .ok_or_else(|| MarshalError::ApprovalNotFound(id.to_string()))?;
            if entry.request.status.is_terminal() {
                return Ok(entry.request.clone());
            }
            (
                entry.tx.subscribe(),
                entry.escalate_at(),
                entry.deadline(),
                entry.request.escalation_count > 0,
            )
        };

        loop {
            if rx.borrow_and_update().is_terminal() {
                break;
            }
            let wake = if escalated { deadline } else { escalate_at };
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(wake) => {
                    if escalated {
                        self.expire(id, "timeout").await;
                    } else {
                        self.escalate(id).await;
                        escalated = true;
                    }
                }
            }
        }

        self.get(id)
            .await
            .ok_or_else(|| MarshalError::ApprovalNotFound(id.to_string()))
    }

    pub async fn approve(&self, id: &str, resolver: &str) -> Result<ApprovalRequest> {
        self.resolve(id, ApprovalStatus::Approved, resolver, None)
            .await
    }

    pub async fn reject(&self, id: &str, resolver: &str, reason: &str) -> Result<ApprovalRequest> {
        self.resolve(id, ApprovalStatus::Rejected, resolver, Some(reason.to_string()))
            .await
    }

    async fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        resolver: &str,
        reason: Option<String>,
    ) -> Result<ApprovalRequest> {
        let resolved = {
            let mut entries = self.entries.lock().await;
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| MarshalError::ApprovalNotFound(id.to_string()))?;
            if entry.request.status.is_terminal() {
                return Err(MarshalError::AlreadyResolved(id.to_string()));
            }
            entry.request.status = status;
            entry.request.resolved_by = Some(resolver.to_string());
            entry.request.reason = reason;
            entry.settled = Some(Instant::now());
            entry.tx.send_replace(status);
            entry.request.clone()
        };
        info!(id = %id, status = %status, resolver = %resolver, "Approval resolved");
        self.event_bus.publish(EngineEvent::ApprovalResolved {
            request_id: id.to_string(),
            status,
        });
        Ok(resolved)
    }

    async fn escalate(&self, id: &str) {
        let request = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(id) else {
                return;
            };
            if entry.request.status != ApprovalStatus::Pending || entry.request.escalation_count > 0
            {
                return;
            }
            entry.request.status = ApprovalStatus::Escalated;
            entry.request.escalation_count += 1;
            entry.request.clone()
        };

        self.event_bus.publish(EngineEvent::ApprovalEscalated {
            request_id: id.to_string(),
            escalation_count: request.escalation_count,
        });
        if let Err(e) = self.channel.escalate(&request).await {
            warn!(id = %id, error = %e, "Approval channel escalate failed");
        }

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id) {
            if entry.request.status == ApprovalStatus::Escalated {
                entry.request.status = ApprovalStatus::Pending;
            }
        }
    }

    /// Mark a request expired. Returns false if it was already terminal.
    async fn expire(&self, id: &str, reason: &str) -> bool {
        {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(id) else {
                return false;
            };
            if entry.request.status.is_terminal() {
                return false;
            }
            entry.request.status = ApprovalStatus::Expired;
            entry.request.reason = Some(reason.to_string());
            entry.settled = Some(Instant::now());
            entry.tx.send_replace(ApprovalStatus::Expired);
        }
        info!(id = %id, reason = %reason, "Approval expired");
        self.event_bus.publish(EngineEvent::ApprovalResolved {
            request_id: id.to_string(),
            status: ApprovalStatus::Expired,
        });
        true
    }

    /// Expire every open request belonging to a run.
    pub async fn cancel_run(&self, run_id: &str) -> usize {
        let ids: Vec<String> = self
            .entries
            .lock()
            .await
            .values()
            .filter(|e| {
                !e.request.status.is_terminal() && e.request.run_id.as_deref() == Some(run_id)
            })
            .map(|e| e.request.id.clone())
            .collect();
        let mut expired = 0;
        for id in ids {
            if self.expire(&id, RUN_CANCELLED).await {
                expired += 1;
            }
        }
        expired
    }

    /// Drop terminal requests settled more than [`RESOLVED_RETENTION`] ago.
    pub async fn prune_resolved(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| match e.settled {
            Some(at) => now.duration_since(at) < RESOLVED_RETENTION,
            None => true,
        });
        let pruned = before - entries.len();
        if pruned > 0 {
            debug!(pruned, remaining = entries.len(), "Pruned settled approvals");
        }
        pruned
    }

    /// Expire open requests past their deadline, including ones nobody waits
    /// on, and prune long-settled ones.
    pub async fn expire_overdue(&self) -> Vec<String> {
        self.prune_resolved().await;
        let now = Instant::now();
        let ids: Vec<String> = self
            .entries
            .lock()
            .await
            .values()
            .filter(|e| !e.request.status.is_terminal() && e.deadline() <= now)
            .map(|e| e.request.id.clone())
            .collect();
        let mut expired = Vec::new();
        for id in ids {
            if self.expire(&id, "timeout").await {
                expired.push(id);
            }
        }
        expired
    }

    pub async fn get(&self, id: &str) -> Option<ApprovalRequest> {
        self.entries
            .lock()
            .await
            .get(id)
            .map(|e| e.request.clone())
    }

    /// List all open approvals, oldest first.
    pub async fn pending_requests(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> = self
            .entries
            .lock()
            .await
            .values()
            .filter(|e| !e.request.status.is_terminal())
            .map(|e| e.request.clone())
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending
    }

    /// Find an open request by prefix match on the ID.
    pub async fn find_by_prefix(&self, prefix: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter(|e| !e.request.status.is_terminal())
            .map(|e| &e.request.id)
            .find(|id| id.starts_with(prefix))
            .cloned()
    }
}
