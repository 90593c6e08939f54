//! Scheduled and event-driven run triggers.
//!
//! One service, two loops. The schedule loop wakes for the earliest
//! upcoming cron fire across active workflows, re-scanning periodically so
//! newly registered workflows are picked up without a restart. The watch
//! loop subscribes to the event bus and starts runs for workflows whose
//! trigger matches another run's terminal event.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use weir_core::error::Result;
use weir_core::event::EventBus;
use weir_core::traits::RunStore;
use weir_core::types::{
    EngineEvent, EventTriggerOn, Run, TriggerKind, TriggerSpec, WorkflowDefinition, WorkflowStatus,
};

use crate::orchestrator::Engine;

/// Upper bound on schedule-loop sleep, so workflow registrations are seen
/// without waiting out a distant cron fire.
const RESCAN_INTERVAL: Duration = Duration::from_secs(30);

pub struct TriggerService {
    engine: Arc<Engine>,
    store: Arc<dyn RunStore>,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl TriggerService {
    pub fn new(
        engine: Arc<Engine>,
        store: Arc<dyn RunStore>,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            store,
            bus,
            cancel,
        }
    }

    /// Drive both trigger loops until cancelled.
    pub async fn run(&self) {
        tokio::join!(self.schedule_loop(), self.watch_loop());
    }

    async fn schedule_loop(&self) {
        info!("Schedule trigger loop started");
        loop {
            let next = match self.store.list_workflows().await {
                Ok(defs) => {
                    next_fire(&defs, Utc::now()).map(|(at, idx)| (at, defs[idx].clone()))
                }
                Err(e) => {
                    warn!(error = %e, "Could not scan scheduled workflows");
                    None
                }
            };
            let sleep_for = match &next {
                Some((fire_at, _)) => (*fire_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(RESCAN_INTERVAL),
                None => RESCAN_INTERVAL,
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.cancel.cancelled() => {
                    info!("Schedule trigger loop shutting down");
                    return;
                }
            }
            if let Some((fire_at, def)) = next {
                if Utc::now() >= fire_at {
                    info!(workflow_id = %def.id, "Schedule fired");
                    let context = json!({"trigger": {"kind": "schedule", "workflow": def.id}});
                    if let Err(e) = self
                        .engine
                        .trigger_run(&def, context, TriggerKind::Auto)
                        .await
                    {
                        error!(workflow_id = %def.id, error = %e, "Scheduled run refused");
                    }
                }
            }
        }
    }

    async fn watch_loop(&self) {
        let mut rx = self.bus.subscribe();
        info!("Event trigger loop started");
        loop {
            let event = tokio::select! {
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Event trigger loop lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = self.cancel.cancelled() => {
                    info!("Event trigger loop shutting down");
                    return;
                }
            };
            if !event.is_run_terminal() {
                continue;
            }
            if let Err(e) = self.fire_event_triggers(&event).await {
                warn!(error = %e, "Event trigger dispatch failed");
            }
        }
    }

    async fn fire_event_triggers(&self, event: &EngineEvent) -> Result<()> {
        let source_id = match event {
            EngineEvent::RunSuccess { workflow_id, .. }
            | EngineEvent::RunFailed { workflow_id, .. }
            | EngineEvent::RunCancelled { workflow_id, .. } => workflow_id.clone(),
            _ => return Ok(()),
        };
        let parent = self.store.get_run(event.run_id()).await?;
        for def in self.store.list_workflows().await? {
            if def.status != WorkflowStatus::Active {
                continue;
            }
            let TriggerSpec::Event { workflow, on } = &def.trigger else {
                continue;
            };
            if *workflow != source_id || !trigger_matches(*on, event) {
                continue;
            }
            info!(
                workflow_id = %def.id,
                source = %source_id,
                parent_run_id = %parent.id,
                "Event trigger fired"
            );
            let context = chain_context(&source_id, &parent, event);
            if let Err(e) = self.engine.trigger_chained(&def, context, &parent).await {
                warn!(workflow_id = %def.id, error = %e, "Event-triggered run refused");
            }
        }
        Ok(())
    }
}

/// Earliest upcoming fire strictly after `after` among active scheduled
/// workflows. Invalid cron expressions are skipped with a warning.
fn next_fire(defs: &[WorkflowDefinition], after: DateTime<Utc>) -> Option<(DateTime<Utc>, usize)> {
    let mut next: Option<(DateTime<Utc>, usize)> = None;
    for (idx, def) in defs.iter().enumerate() {
        if def.status != WorkflowStatus::Active {
            continue;
        }
        let TriggerSpec::Scheduled { cron } = &def.trigger else {
            continue;
        };
        let schedule = match Schedule::from_str(cron) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(workflow_id = %def.id, error = %e, "Invalid cron expression, skipping");
                continue;
            }
        };
        let Some(fire_at) = schedule.after(&after).next() else {
            continue;
        };
        if next.as_ref().map_or(true, |(at, _)| fire_at < *at) {
            next = Some((fire_at, idx));
        }
    }
    next
}

/// Cancellation is deliberate, so only `any` chains on it.
fn trigger_matches(on: EventTriggerOn, event: &EngineEvent) -> bool {
    match on {
        EventTriggerOn::Any => true,
        EventTriggerOn::Success => matches!(event, EngineEvent::RunSuccess { .. }),
        EventTriggerOn::Failed => matches!(event, EngineEvent::RunFailed { .. }),
    }
}

fn chain_context(source_workflow: &str, parent: &Run, event: &EngineEvent) -> Value {
    let outcome = match event {
        EngineEvent::RunSuccess { .. } => "run.success",
        EngineEvent::RunFailed { .. } => "run.failed",
        EngineEvent::RunCancelled { .. } => "run.cancelled",
        _ => "unknown",
    };
    json!({
        "trigger": {
            "workflow": source_workflow,
            "run_id": parent.id.0,
            "event": outcome,
        }
    })
}
