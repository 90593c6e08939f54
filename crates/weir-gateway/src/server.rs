use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use weir_core::config::GatewayConfig;
use weir_core::error::Result;
use weir_core::traits::RunStore;
use weir_engine::Engine;

use crate::routes;
use crate::state::AppState;

/// HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Arc<Engine>,
    store: Arc<dyn RunStore>,
    log_dir: PathBuf,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        engine: Arc<Engine>,
        store: Arc<dyn RunStore>,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            engine,
            store,
            log_dir,
        }
    }

    /// Bind the configured address and serve until the token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
            store: self.store.clone(),
            log_dir: self.log_dir.clone(),
        });

        let app = router(state);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/workflows", post(routes::put_workflow))
        .route("/api/workflows/{id}", get(routes::get_workflow))
        .route(
            "/api/runs",
            post(routes::trigger_run).get(routes::list_runs),
        )
        .route("/api/runs/{id}", get(routes::get_run))
        .route("/api/runs/{id}/cancel", post(routes::cancel_run))
        .route("/api/runs/{id}/retry", post(routes::retry_run))
        .route("/api/runs/{id}/log", get(routes::get_run_log))
        .route("/api/approvals", get(routes::list_approvals))
        .route("/api/approvals/{id}", post(routes::decide_approval))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
