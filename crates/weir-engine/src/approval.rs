//! Approval gates.
//!
//! A gated node suspends its task on a oneshot channel until an operator
//! decides, the deadline elapses, or the run is torn down. No polling: the
//! decision is pushed straight to the waiting task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use weir_core::error::{Result, WeirError};
use weir_core::event::EventBus;
use weir_core::traits::RunStore;
use weir_core::types::{Approval, ApprovalDecision, ApprovalId, ApprovalStatus, EngineEvent, RunId};

type PendingGate = (Approval, oneshot::Sender<ApprovalDecision>);

pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, PendingGate>>,
    store: Arc<dyn RunStore>,
    bus: Arc<EventBus>,
}

impl ApprovalBroker {
    pub fn new(store: Arc<dyn RunStore>, bus: Arc<EventBus>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            store,
            bus,
        }
    }

    /// Open a gate for a node. Persists the approval record, announces it,
    /// and returns the receiver the node task will suspend on.
    /// `timeout_secs == 0` means no deadline.
    pub async fn request(
        &self,
        run_id: &RunId,
        node_id: &str,
        timeout_secs: u64,
    ) -> Result<(Approval, oneshot::Receiver<ApprovalDecision>)> {
        let now = Utc::now();
        let approval = Approval {
            id: ApprovalId::new(),
            run_id: run_id.clone(),
            node_id: node_id.to_string(),
            status: ApprovalStatus::Pending,
            requested_at: now,
            deadline: (timeout_secs > 0).then(|| now + chrono::Duration::seconds(timeout_secs as i64)),
            decided_at: None,
            decided_by: None,
            reason: None,
        };
        self.store.create_approval(&approval).await?;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(approval.id.0.clone(), (approval.clone(), tx));
        info!(
            run_id = %run_id,
            node_id,
            approval_id = %approval.id,
            "Approval requested"
        );
        self.bus.publish(EngineEvent::ApprovalRequested {
            run_id: run_id.clone(),
            node_id: node_id.to_string(),
            approval_id: approval.id.clone(),
        });
        Ok((approval, rx))
    }

    /// Resolve a pending gate. The waiting node task is woken with the
    /// decision; the record is updated first so the decision is durable
    /// before anything acts on it.
    pub async fn respond(&self, approval_id: &ApprovalId, decision: ApprovalDecision) -> Result<()> {
        let entry = self.pending.lock().await.remove(&approval_id.0);
        let Some((mut approval, tx)) = entry else {
            let existing = self.store.get_approval(approval_id).await?;
            let msg = if existing.status == ApprovalStatus::Pending {
                format!("approval '{}' has no live run awaiting it", approval_id)
            } else {
                format!("approval '{}' was already {}", approval_id, existing.status)
            };
            return Err(WeirError::Validation(msg));
        };

        approval.status = if decision.is_approved() {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        approval.decided_at = Some(Utc::now());
        approval.decided_by = Some(decision.decided_by().to_string());
        if let ApprovalDecision::Rejected { reason, .. } = &decision {
            approval.reason = reason.clone();
        }
        self.store.update_approval(&approval).await?;
        info!(
            run_id = %approval.run_id,
            approval_id = %approval.id,
            approved = decision.is_approved(),
            decided_by = decision.decided_by(),
            "Approval decided"
        );
        self.bus.publish(EngineEvent::ApprovalDecided {
            run_id: approval.run_id.clone(),
            approval_id: approval.id.clone(),
            approved: decision.is_approved(),
            decided_by: decision.decided_by().to_string(),
        });
        // The waiting task may already be gone (teardown race); the record
        // above is still correct.
        let _ = tx.send(decision);
        Ok(())
    }

    /// Suspend until the gate resolves. Returns the decision, or
    /// `Cancelled` if the run is torn down while waiting. A deadline lapse
    /// is recorded as a rejection decided by `system:timeout`.
    pub async fn await_decision(
        &self,
        approval: &Approval,
        rx: oneshot::Receiver<ApprovalDecision>,
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<ApprovalDecision> {
        if timeout_secs == 0 {
            return tokio::select! {
                result = rx => result.map_err(|_| {
                    WeirError::InternalConsistency(format!(
                        "approval '{}' channel dropped",
                        approval.id
                    ))
                }),
                _ = cancel.cancelled() => Err(WeirError::Cancelled),
            };
        }
        tokio::select! {
            result = tokio::time::timeout(Duration::from_secs(timeout_secs), rx) => match result {
                Ok(Ok(decision)) => Ok(decision),
                Ok(Err(_)) => Err(WeirError::InternalConsistency(format!(
                    "approval '{}' channel dropped",
                    approval.id
                ))),
                Err(_) => self.reject_on_timeout(approval).await,
            },
            _ = cancel.cancelled() => Err(WeirError::Cancelled),
        }
    }

    async fn reject_on_timeout(&self, approval: &Approval) -> Result<ApprovalDecision> {
        let decision = ApprovalDecision::Rejected {
            decided_by: "system:timeout".to_string(),
            reason: Some("approval deadline elapsed".to_string()),
        };
        match self.respond(&approval.id, decision.clone()).await {
            Ok(()) => Ok(decision),
            // An operator decision raced the deadline; take theirs.
            Err(_) => {
                let stored = self.store.get_approval(&approval.id).await?;
                match stored.status {
                    ApprovalStatus::Approved => Ok(ApprovalDecision::Approved {
                        decided_by: stored.decided_by.unwrap_or_else(|| "unknown".to_string()),
                    }),
                    _ => Ok(ApprovalDecision::Rejected {
                        decided_by: stored
                            .decided_by
                            .unwrap_or_else(|| "system:timeout".to_string()),
                        reason: stored.reason,
                    }),
                }
            }
        }
    }

    /// Close a gate without waking its task, marking the record rejected.
    /// Used during run teardown, where the task is torn down separately.
    /// A no-op if the gate was already decided.
    pub async fn discard(&self, approval_id: &ApprovalId, reason: &str) -> Result<()> {
        let entry = self.pending.lock().await.remove(&approval_id.0);
        let Some((mut approval, _tx)) = entry else {
            return Ok(());
        };
        approval.status = ApprovalStatus::Rejected;
        approval.decided_at = Some(Utc::now());
        approval.decided_by = Some("system:cancel".to_string());
        approval.reason = Some(reason.to_string());
        self.store.update_approval(&approval).await?;
        debug!(
            run_id = %approval.run_id,
            approval_id = %approval.id,
            "Approval discarded"
        );
        self.bus.publish(EngineEvent::ApprovalDecided {
            run_id: approval.run_id.clone(),
            approval_id: approval.id.clone(),
            approved: false,
            decided_by: "system:cancel".to_string(),
        });
        Ok(())
    }

    /// Gates currently waiting on a decision, oldest first.
    pub async fn live_gates(&self) -> Vec<Approval> {
        let pending = self.pending.lock().await;
        let mut gates: Vec<Approval> = pending.values().map(|(a, _)| a.clone()).collect();
        gates.sort_by_key(|a| a.requested_at);
        gates
    }
}
