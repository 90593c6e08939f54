use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tracing::debug;

use weir_core::error::{Result, WeirError};
use weir_core::traits::RunStore;
use weir_core::types::*;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT NOT NULL,
        version INTEGER NOT NULL,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL,
        definition TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (id, version)
    );

    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        trigger_kind TEXT NOT NULL,
        parent_run_id TEXT,
        chain_depth INTEGER NOT NULL DEFAULT 0,
        context TEXT NOT NULL,
        status TEXT NOT NULL,
        error TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        finished_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_runs_workflow ON runs(workflow_id);

    CREATE TABLE IF NOT EXISTS node_runs (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(id),
        node_id TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        status TEXT NOT NULL,
        project_id TEXT NOT NULL,
        resolved_input TEXT NOT NULL,
        output TEXT,
        error_kind TEXT,
        error TEXT,
        started_at TEXT,
        finished_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_node_runs_run ON node_runs(run_id);

    CREATE TABLE IF NOT EXISTS approvals (
        id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(id),
        node_id TEXT NOT NULL,
        status TEXT NOT NULL,
        requested_at TEXT NOT NULL,
        deadline TEXT,
        decided_at TEXT,
        decided_by TEXT,
        reason TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_approvals_status ON approvals(status);
";

/// SQLite-backed run store. WAL mode; a single mutex-guarded connection.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
}

impl SqliteRunStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WeirError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| WeirError::Database(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| WeirError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| WeirError::Database(e.to_string()))?;

        debug!(path = %path.display(), "Run store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| WeirError::Database(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| WeirError::Database(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WeirError::Database(e.to_string()))
    }
}

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

fn to_opt_ts(t: &Option<DateTime<Utc>>) -> Option<String> {
    t.map(|dt| dt.to_rfc3339())
}

/// Strict column parse; corrupt status text must surface, not default.
fn parse_col<T>(idx: usize, s: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    s.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: RunId::from_str(&row.get::<_, String>(0)?),
        workflow_id: row.get(1)?,
        project_id: row.get(2)?,
        trigger_kind: parse_col(3, &row.get::<_, String>(3)?)?,
        parent_run_id: row
            .get::<_, Option<String>>(4)?
            .map(|s| RunId::from_str(&s)),
        chain_depth: row.get::<_, i64>(5)? as u32,
        context: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        status: parse_col(7, &row.get::<_, String>(7)?)?,
        error: row.get(8)?,
        created_at: ts(&row.get::<_, String>(9)?),
        started_at: opt_ts(row.get(10)?),
        finished_at: opt_ts(row.get(11)?),
    })
}

fn node_run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRun> {
    Ok(NodeRun {
        id: NodeRunId::from_str(&row.get::<_, String>(0)?),
        run_id: RunId::from_str(&row.get::<_, String>(1)?),
        node_id: row.get(2)?,
        attempt: row.get::<_, i64>(3)? as u32,
        status: parse_col(4, &row.get::<_, String>(4)?)?,
        project_id: row.get(5)?,
        resolved_input: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        output: row
            .get::<_, Option<String>>(7)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        error_kind: row
            .get::<_, Option<String>>(8)?
            .and_then(|s| s.parse().ok()),
        error: row.get(9)?,
        started_at: opt_ts(row.get(10)?),
        finished_at: opt_ts(row.get(11)?),
    })
}

fn approval_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Approval> {
    Ok(Approval {
        id: ApprovalId::from_str(&row.get::<_, String>(0)?),
        run_id: RunId::from_str(&row.get::<_, String>(1)?),
        node_id: row.get(2)?,
        status: parse_col(3, &row.get::<_, String>(3)?)?,
        requested_at: ts(&row.get::<_, String>(4)?),
        deadline: opt_ts(row.get(5)?),
        decided_at: opt_ts(row.get(6)?),
        decided_by: row.get(7)?,
        reason: row.get(8)?,
    })
}

const RUN_COLUMNS: &str = "id, workflow_id, project_id, trigger_kind, parent_run_id, \
     chain_depth, context, status, error, created_at, started_at, finished_at";

const NODE_RUN_COLUMNS: &str = "id, run_id, node_id, attempt, status, project_id, \
     resolved_input, output, error_kind, error, started_at, finished_at";

const APPROVAL_COLUMNS: &str =
    "id, run_id, node_id, status, requested_at, deadline, decided_at, decided_by, reason";

fn insert_node_run(conn: &Connection, node_run: &NodeRun) -> Result<()> {
    conn.execute(
        "INSERT INTO node_runs (id, run_id, node_id, attempt, status, project_id, \
         resolved_input, output, error_kind, error, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            node_run.id.0,
            node_run.run_id.0,
            node_run.node_id,
            node_run.attempt as i64,
            node_run.status.to_string(),
            node_run.project_id,
            node_run.resolved_input.to_string(),
            node_run.output.as_ref().map(|v| v.to_string()),
            node_run.error_kind.map(|k| k.to_string()),
            node_run.error,
            to_opt_ts(&node_run.started_at),
            to_opt_ts(&node_run.finished_at),
        ],
    )
    .map_err(|e| WeirError::Database(e.to_string()))?;
    Ok(())
}

fn update_run_row(conn: &Connection, run: &Run) -> Result<()> {
    conn.execute(
        "UPDATE runs SET status = ?2, error = ?3, started_at = ?4, finished_at = ?5
         WHERE id = ?1",
        params![
            run.id.0,
            run.status.to_string(),
            run.error,
            to_opt_ts(&run.started_at),
            to_opt_ts(&run.finished_at),
        ],
    )
    .map_err(|e| WeirError::Database(e.to_string()))?;
    Ok(())
}

impl RunStore for SqliteRunStore {
    fn put_workflow(&self, def: &WorkflowDefinition) -> BoxFuture<'_, Result<()>> {
        let def = def.clone();
        Box::pin(async move {
            let definition = serde_json::to_string(&def)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO workflows \
                 (id, version, project_id, name, status, definition, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    def.id,
                    def.version as i64,
                    def.project_id,
                    def.name,
                    def.status.to_string(),
                    definition,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| WeirError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn get_workflow(&self, id: &str) -> BoxFuture<'_, Result<WorkflowDefinition>> {
        let id = id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT definition FROM workflows WHERE id = ?1
                     ORDER BY version DESC LIMIT 1",
                )
                .map_err(|e| WeirError::Database(e.to_string()))?;
            let definition: String = match stmt.query_row(params![id], |row| row.get(0)) {
                Ok(d) => d,
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    return Err(WeirError::NotFound(format!("workflow {}", id)))
                }
                Err(e) => return Err(WeirError::Database(e.to_string())),
            };
            Ok(serde_json::from_str(&definition)?)
        })
    }

    fn list_workflows(&self) -> BoxFuture<'_, Result<Vec<WorkflowDefinition>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT definition FROM workflows w
                     WHERE version = (SELECT MAX(version) FROM workflows WHERE id = w.id)
                     ORDER BY id",
                )
                .map_err(|e| WeirError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| WeirError::Database(e.to_string()))?;

            let mut defs = Vec::new();
            for row in rows {
                let definition = row.map_err(|e| WeirError::Database(e.to_string()))?;
                defs.push(serde_json::from_str(&definition)?);
            }
            Ok(defs)
        })
    }

    fn create_run(&self, run: &Run) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO runs (id, workflow_id, project_id, trigger_kind, parent_run_id, \
                 chain_depth, context, status, error, created_at, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    run.id.0,
                    run.workflow_id,
                    run.project_id,
                    run.trigger_kind.to_string(),
                    run.parent_run_id.as_ref().map(|r| r.0.clone()),
                    run.chain_depth as i64,
                    run.context.to_string(),
                    run.status.to_string(),
                    run.error,
                    run.created_at.to_rfc3339(),
                    to_opt_ts(&run.started_at),
                    to_opt_ts(&run.finished_at),
                ],
            )
            .map_err(|e| WeirError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn update_run(&self, run: &Run) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            update_run_row(&conn, &run)
        })
    }

    fn get_run(&self, id: &RunId) -> BoxFuture<'_, Result<Run>> {
        let id = id.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS))
                .map_err(|e| WeirError::Database(e.to_string()))?;
            match stmt.query_row(params![id], run_from_row) {
                Ok(run) => Ok(run),
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    Err(WeirError::NotFound(format!("run {}", id)))
                }
                Err(e) => Err(WeirError::Database(e.to_string())),
            }
        })
    }

    fn list_runs(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Run>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
                    RUN_COLUMNS
                ))
                .map_err(|e| WeirError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![limit as i64], run_from_row)
                .map_err(|e| WeirError::Database(e.to_string()))?;

            let mut runs = Vec::new();
            for row in rows {
                runs.push(row.map_err(|e| WeirError::Database(e.to_string()))?);
            }
            Ok(runs)
        })
    }

    fn create_node_run(&self, node_run: &NodeRun) -> BoxFuture<'_, Result<()>> {
        let node_run = node_run.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            insert_node_run(&conn, &node_run)
        })
    }

    fn update_node_run(&self, node_run: &NodeRun) -> BoxFuture<'_, Result<()>> {
        let node_run = node_run.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE node_runs SET attempt = ?2, status = ?3, resolved_input = ?4, \
                 output = ?5, error_kind = ?6, error = ?7, started_at = ?8, finished_at = ?9
                 WHERE id = ?1",
                params![
                    node_run.id.0,
                    node_run.attempt as i64,
                    node_run.status.to_string(),
                    node_run.resolved_input.to_string(),
                    node_run.output.as_ref().map(|v| v.to_string()),
                    node_run.error_kind.map(|k| k.to_string()),
                    node_run.error,
                    to_opt_ts(&node_run.started_at),
                    to_opt_ts(&node_run.finished_at),
                ],
            )
            .map_err(|e| WeirError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn node_runs(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<NodeRun>>> {
        let run_id = run_id.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM node_runs WHERE run_id = ?1 ORDER BY rowid ASC",
                    NODE_RUN_COLUMNS
                ))
                .map_err(|e| WeirError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![run_id], node_run_from_row)
                .map_err(|e| WeirError::Database(e.to_string()))?;

            let mut node_runs = Vec::new();
            for row in rows {
                node_runs.push(row.map_err(|e| WeirError::Database(e.to_string()))?);
            }
            Ok(node_runs)
        })
    }

    fn latest_node_runs(
        &self,
        run_id: &RunId,
    ) -> BoxFuture<'_, Result<HashMap<String, NodeRun>>> {
        let run_id = run_id.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM node_runs WHERE run_id = ?1 AND rowid IN (
                         SELECT MAX(rowid) FROM node_runs WHERE run_id = ?1 GROUP BY node_id
                     )",
                    NODE_RUN_COLUMNS
                ))
                .map_err(|e| WeirError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![run_id], node_run_from_row)
                .map_err(|e| WeirError::Database(e.to_string()))?;

            let mut latest = HashMap::new();
            for row in rows {
                let node_run = row.map_err(|e| WeirError::Database(e.to_string()))?;
                latest.insert(node_run.node_id.clone(), node_run);
            }
            Ok(latest)
        })
    }

    fn create_approval(&self, approval: &Approval) -> BoxFuture<'_, Result<()>> {
        let approval = approval.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO approvals (id, run_id, node_id, status, requested_at, \
                 deadline, decided_at, decided_by, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    approval.id.0,
                    approval.run_id.0,
                    approval.node_id,
                    approval.status.to_string(),
                    approval.requested_at.to_rfc3339(),
                    to_opt_ts(&approval.deadline),
                    to_opt_ts(&approval.decided_at),
                    approval.decided_by,
                    approval.reason,
                ],
            )
            .map_err(|e| WeirError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn update_approval(&self, approval: &Approval) -> BoxFuture<'_, Result<()>> {
        let approval = approval.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            conn.execute(
                "UPDATE approvals SET status = ?2, decided_at = ?3, decided_by = ?4, reason = ?5
                 WHERE id = ?1",
                params![
                    approval.id.0,
                    approval.status.to_string(),
                    to_opt_ts(&approval.decided_at),
                    approval.decided_by,
                    approval.reason,
                ],
            )
            .map_err(|e| WeirError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn get_approval(&self, id: &ApprovalId) -> BoxFuture<'_, Result<Approval>> {
        let id = id.0.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM approvals WHERE id = ?1",
                    APPROVAL_COLUMNS
                ))
                .map_err(|e| WeirError::Database(e.to_string()))?;
            match stmt.query_row(params![id], approval_from_row) {
                Ok(approval) => Ok(approval),
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    Err(WeirError::NotFound(format!("approval {}", id)))
                }
                Err(e) => Err(WeirError::Database(e.to_string())),
            }
        })
    }

    fn pending_approvals(&self) -> BoxFuture<'_, Result<Vec<Approval>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM approvals WHERE status = 'pending' ORDER BY requested_at",
                    APPROVAL_COLUMNS
                ))
                .map_err(|e| WeirError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], approval_from_row)
                .map_err(|e| WeirError::Database(e.to_string()))?;

            let mut approvals = Vec::new();
            for row in rows {
                approvals.push(row.map_err(|e| WeirError::Database(e.to_string()))?);
            }
            Ok(approvals)
        })
    }

    fn run_approvals(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<Approval>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM approvals WHERE run_id = ?1 ORDER BY requested_at, rowid",
                    APPROVAL_COLUMNS
                ))
                .map_err(|e| WeirError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![run_id.0], approval_from_row)
                .map_err(|e| WeirError::Database(e.to_string()))?;

            let mut approvals = Vec::new();
            for row in rows {
                approvals.push(row.map_err(|e| WeirError::Database(e.to_string()))?);
            }
            Ok(approvals)
        })
    }

    fn finish_run(&self, run: &Run, skipped: &[NodeRun]) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        let skipped = skipped.to_vec();
        Box::pin(async move {
            let mut guard = self.lock()?;
            let tx = guard
                .transaction()
                .map_err(|e| WeirError::Database(e.to_string()))?;
            update_run_row(&tx, &run)?;
            for node_run in &skipped {
                insert_node_run(&tx, node_run)?;
            }
            tx.commit().map_err(|e| WeirError::Database(e.to_string()))?;
            Ok(())
        })
    }

    fn active_run_ids(&self) -> BoxFuture<'_, Result<Vec<RunId>>> {
        Box::pin(async move {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT run_id FROM node_runs
                     WHERE status IN ('dispatched', 'running')",
                )
                .map_err(|e| WeirError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| WeirError::Database(e.to_string()))?;

            let mut ids = Vec::new();
            for row in rows {
                ids.push(RunId::from_str(
                    &row.map_err(|e| WeirError::Database(e.to_string()))?,
                ));
            }
            Ok(ids)
        })
    }
}
