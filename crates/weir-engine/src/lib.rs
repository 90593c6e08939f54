//! Run orchestration: DAG validation and scheduling, the per-run state
//! machine, approval gates, scheduled and event triggers, and per-run
//! event logs.
//!
//! Every accepted run is driven by exactly one task. It dispatches ready
//! nodes into a join set, applies their progress and completions to the
//! state machine (which persists before anything acts), and finishes the
//! run the moment its verdict is known.

pub mod approval;
pub mod dag;
pub mod orchestrator;
pub mod run_log;
pub mod state;
pub mod triggers;

pub use approval::ApprovalBroker;
pub use orchestrator::Engine;
pub use run_log::RunLogWriter;
pub use triggers::TriggerService;
