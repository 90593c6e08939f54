use std::path::PathBuf;
use std::sync::Arc;

use weir_core::config::GatewayConfig;
use weir_core::traits::RunStore;
use weir_engine::Engine;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: Arc<Engine>,
    pub store: Arc<dyn RunStore>,
    /// Directory holding per-run JSONL event logs.
    pub log_dir: PathBuf,
}
