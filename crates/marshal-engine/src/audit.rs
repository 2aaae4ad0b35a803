use std::path::Path;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::warn;

use marshal_core::policy::{Severity, Violation};
use marshal_core::types::StepRecord;

/// Read-only access to the governance audit trail.
pub trait AuditReader: Send + Sync {
    fn violations(&self) -> Vec<Violation>;
    fn violations_for_run(&self, run_id: &str) -> Vec<Violation>;
    fn violations_for_action(&self, action: &str) -> Vec<Violation>;
    fn steps_for_run(&self, run_id: &str) -> Vec<StepRecord>;
}

/// Append-only audit trail of violations and step records.
///
/// Entries are never mutated or removed. When a journal is attached every
/// append is also written to SQLite; journal failures are logged and the
/// in-memory trail stays authoritative.
pub struct AuditLog {
    violations: RwLock<Vec<Violation>>,
    steps: RwLock<Vec<(String, StepRecord)>>,
    journal: Option<AuditJournal>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            violations: RwLock::new(Vec::new()),
            steps: RwLock::new(Vec::new()),
            journal: None,
        }
    }

    pub fn with_journal(journal: AuditJournal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new()
        }
    }

    pub fn journal(&self) -> Option<&AuditJournal> {
        self.journal.as_ref()
    }

    pub fn append_violation(&self, violation: Violation) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_violation(&violation) {
                warn!(error = %e, "Failed to journal violation");
            }
        }
        if let Ok(mut v) = self.violations.write() {
            v.push(violation);
        }
    }

    pub fn append_step(&self, run_id: &str, record: StepRecord) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_step(run_id, &record) {
                warn!(error = %e, "Failed to journal step record");
            }
        }
        if let Ok(mut s) = self.steps.write() {
            s.push((run_id.to_string(), record));
        }
    }

    pub fn violation_count(&self) -> usize {
        self.violations.read().map(|v| v.len()).unwrap_or(0)
    }

    fn filter_violations(&self, pred: impl Fn(&Violation) -> bool) -> Vec<Violation> {
        self.violations
            .read()
            .map(|v| v.iter().filter(|x| pred(x)).cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditReader for AuditLog {
    fn violations(&self) -> Vec<Violation> {
        self.filter_violations(|_| true)
    }

    fn violations_for_run(&self, run_id: &str) -> Vec<Violation> {
        self.filter_violations(|v| v.run_id.as_deref() == Some(run_id))
    }

    fn violations_for_action(&self, action: &str) -> Vec<Violation> {
        self.filter_violations(|v| v.action == action)
    }

    fn steps_for_run(&self, run_id: &str) -> Vec<StepRecord> {
        self.steps
            .read()
            .map(|s| {
                s.iter()
                    .filter(|(r, _)| r == run_id)
                    .map(|(_, rec)| rec.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Persistent SQLite journal of violations and step records.
pub struct AuditJournal {
    conn: Mutex<Connection>,
}

impl AuditJournal {
    /// Open or create the audit journal database.
    pub fn open(path: &Path) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create journal directory: {}", e))?;
        }

        let conn =
            Connection::open(path).map_err(|e| format!("Failed to open audit journal: {}", e))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS violations (
                 id TEXT PRIMARY KEY,
                 timestamp TEXT NOT NULL,
                 run_id TEXT,
                 node TEXT NOT NULL,
                 action TEXT NOT NULL,
                 severity TEXT NOT NULL,
                 reason TEXT NOT NULL,
                 detail TEXT
             );

             CREATE INDEX IF NOT EXISTS idx_violations_action
                 ON violations(action, timestamp);

             CREATE INDEX IF NOT EXISTS idx_violations_run
                 ON violations(run_id, timestamp);

             CREATE TABLE IF NOT EXISTS step_records (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 run_id TEXT NOT NULL,
                 step INTEGER NOT NULL,
                 node TEXT NOT NULL,
                 record_json TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_steps_run
                 ON step_records(run_id, step);",
        )
        .map_err(|e| format!("Failed to initialize audit schema: {}", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn record_violation(&self, v: &Violation) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO violations (id, timestamp, run_id, node, action, severity, reason, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                v.id,
                v.timestamp.to_rfc3339(),
                v.run_id,
                v.node,
                v.action,
                v.severity.to_string(),
                v.reason,
                v.detail,
            ],
        )
        .map_err(|e| format!("Failed to record violation: {}", e))?;
        Ok(())
    }

    pub fn record_step(&self, run_id: &str, record: &StepRecord) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        let json = serde_json::to_string(record).map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO step_records (run_id, step, node, record_json) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, record.step as i64, record.node, json],
        )
        .map_err(|e| format!("Failed to record step: {}", e))?;
        Ok(())
    }

    /// Most recent violations, optionally filtered by action.
    pub fn recent_violations(
        &self,
        action: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Violation>, String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare(
                "SELECT id, timestamp, run_id, node, action, severity, reason, detail
                 FROM violations
                 WHERE ?1 IS NULL OR action = ?1
                 ORDER BY timestamp DESC
                 LIMIT ?2",
            )
            .map_err(|e| format!("Failed to query violations: {}", e))?;

        let rows = stmt
            .query_map(params![action, limit as i64], |row| {
                let ts_str: String = row.get(1)?;
                let severity: String = row.get(5)?;
                Ok(Violation {
                    id: row.get(0)?,
                    timestamp: DateTime::parse_from_rfc3339(&ts_str)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    run_id: row.get(2)?,
                    node: row.get(3)?,
                    action: row.get(4)?,
                    severity: severity.parse().unwrap_or(Severity::Medium),
                    reason: row.get(6)?,
                    detail: row.get(7)?,
                })
            })
            .map_err(|e| format!("Failed to fetch violations: {}", e))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| e.to_string())?);
        }
        Ok(out)
    }

    /// Step records of one run in execution order.
    pub fn steps_for_run(&self, run_id: &str) -> Result<Vec<StepRecord>, String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare(
                "SELECT record_json FROM step_records
                 WHERE run_id = ?1
                 ORDER BY id ASC",
            )
            .map_err(|e| format!("Failed to query steps: {}", e))?;

        let rows = stmt
            .query_map(params![run_id], |row| row.get::<_, String>(0))
            .map_err(|e| format!("Failed to fetch steps: {}", e))?;

        let mut out = Vec::new();
        for row in rows {
            let json = row.map_err(|e| e.to_string())?;
            out.push(serde_json::from_str(&json).map_err(|e| e.to_string())?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marshal_core::types::StepOutcome;

    fn violation(action: &str, run: Option<&str>) -> Violation {
        Violation {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            run_id: run.map(String::from),
            node: "n".into(),
            action: action.into(),
            severity: Severity::High,
            reason: "rate_limit_exceeded".into(),
            detail: None,
        }
    }

    fn step(n: usize) -> StepRecord {
        StepRecord {
            step: n,
            node: format!("node{}", n),
            attempt: 1,
            input_version: n as u64,
            output_delta: None,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            outcome: StepOutcome::Success,
            error_kind: None,
            error: None,
            notes: Vec::new(),
        }
    }

    #[test]
    fn in_memory_filters() {
        let log = AuditLog::new();
        log.append_violation(violation("run_command", Some("r1")));
        log.append_violation(violation("http_call", Some("r2")));
        log.append_violation(violation("run_command", None));

        assert_eq!(log.violations().len(), 3);
        assert_eq!(log.violations_for_action("run_command").len(), 2);
        assert_eq!(log.violations_for_run("r2").len(), 1);
        assert_eq!(log.violation_count(), 3);
    }

    #[test]
    fn steps_grouped_by_run() {
        let log = AuditLog::new();
        log.append_step("r1", step(1));
        log.append_step("r2", step(1));
        log.append_step("r1", step(2));
        let steps = log.steps_for_run("r1");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].step, 2);
    }

    #[test]
    fn journal_write_through() {
        let dir = tempfile::tempdir().unwrap();
        let journal = AuditJournal::open(&dir.path().join("audit.db")).unwrap();
        let log = AuditLog::with_journal(journal);

        log.append_violation(violation("run_command", Some("r1")));
        log.append_violation(violation("http_call", Some("r1")));
        log.append_step("r1", step(1));

        let journal = log.journal().unwrap();
        let all = journal.recent_violations(None, 10).unwrap();
        assert_eq!(all.len(), 2);
        let only = journal.recent_violations(Some("http_call"), 10).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].severity, Severity::High);

        let steps = journal.steps_for_run("r1").unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].node, "node1");
    }

    #[test]
    fn journal_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.db");
        {
            let journal = AuditJournal::open(&path).unwrap();
            journal
                .record_violation(&violation("run_command", None))
                .unwrap();
        }
        let journal = AuditJournal::open(&path).unwrap();
        assert_eq!(journal.recent_violations(None, 10).unwrap().len(), 1);
    }
}
