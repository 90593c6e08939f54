//! Per-run JSONL event logs.
//!
//! One writer task subscribes to the bus and appends every event to
//! `<dir>/<run_id>.jsonl`, one JSON object per line. Files are flushed per
//! line and closed when the run's terminal event lands.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use weir_core::error::Result;
use weir_core::event::EventBus;
use weir_core::types::{EngineEvent, RunId};

pub fn log_path(dir: &Path, run_id: &RunId) -> PathBuf {
    dir.join(format!("{}.jsonl", run_id))
}

#[derive(Serialize)]
struct LogLine<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a EngineEvent,
}

pub struct RunLogWriter {
    dir: PathBuf,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl RunLogWriter {
    pub fn new(dir: PathBuf, bus: Arc<EventBus>, cancel: CancellationToken) -> Self {
        Self { dir, bus, cancel }
    }

    pub async fn run(self) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            error!(dir = %self.dir.display(), error = %e, "Could not create run log directory");
            return;
        }
        let mut rx = self.bus.subscribe();
        let mut files: HashMap<String, BufWriter<File>> = HashMap::new();
        info!(dir = %self.dir.display(), "Run log writer started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = rx.recv() => match result {
                    Ok(event) => {
                        if let Err(e) = self.append(&mut files, &event).await {
                            warn!(run_id = %event.run_id(), error = %e, "Run log write failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Run log writer lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        for (_, mut writer) in files {
            let _ = writer.flush().await;
        }
        debug!("Run log writer stopped");
    }

    async fn append(
        &self,
        files: &mut HashMap<String, BufWriter<File>>,
        event: &EngineEvent,
    ) -> Result<()> {
        let run_id = event.run_id().clone();
        let writer = match files.entry(run_id.0.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(log_path(&self.dir, &run_id))
                    .await?;
                entry.insert(BufWriter::new(file))
            }
        };
        let line = serde_json::to_string(&LogLine {
            timestamp: Utc::now(),
            event,
        })?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        // Flush per line; readers tail these files live.
        writer.flush().await?;
        if event.is_run_terminal() {
            files.remove(&run_id.0);
        }
        Ok(())
    }
}
