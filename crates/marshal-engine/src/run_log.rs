use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use marshal_core::config::AppConfig;
use marshal_core::event::EventBus;
use marshal_core::types::{EngineEvent, RunId};

/// JSONL runtime logger.
///
/// Subscribes to the EventBus and writes one JSON object per line for every
/// event of a run, plus governance events that carry no run id (breaker
/// trips, budget alerts, escalations). Append-only, so a crash mid-run
/// leaves every previous line intact.
#[derive(Debug, Clone)]
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// Logs land in `{log_dir}/{run_id}/{timestamp}.jsonl`.
    /// `level`: 1 = run and governance events, 2 = adds node events.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let log = config.log.as_ref().filter(|l| l.enabled)?;
        Some(Self::new(config.log_dir(), log.level))
    }

    /// Subscribe now and write entries in a background task until the run
    /// reaches a terminal event. On cancel, already-queued events are
    /// drained before the file is closed.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, run_id, cancel))
    }

    async fn run(
        self,
        mut rx: broadcast::Receiver<EngineEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) {
        let run_dir = self.log_dir.join(&run_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled, draining");
                    loop {
                        match rx.try_recv() {
                            Ok(event) => {
                                if self.write_event(&mut writer, &run_id, &event).await.is_err() {
                                    break;
                                }
                            }
                            Err(TryRecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if self.write_event(&mut writer, &run_id, &event).await.is_err() {
                                break;
                            }
                            if event.is_terminal() && event.run_id() == Some(run_id.0.as_str()) {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    async fn write_event(
        &self,
        writer: &mut tokio::io::BufWriter<tokio::fs::File>,
        run_id: &RunId,
        event: &EngineEvent,
    ) -> std::io::Result<()> {
        let Some(entry) = self.event_to_entry(&run_id.0, event) else {
            return Ok(());
        };
        let Ok(json) = serde_json::to_string(&entry) else {
            return Ok(());
        };
        let line = format!("{}\n", json);
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!(error = %e, "Failed to write log entry");
            return Err(e);
        }
        if let Err(e) = writer.flush().await {
            error!(error = %e, "Failed to flush log");
        }
        Ok(())
    }

    /// None when the event belongs to another run or is filtered by level.
    fn event_to_entry(&self, run_id: &str, event: &EngineEvent) -> Option<LogEntry> {
        match event.run_id() {
            Some(other) if other != run_id => return None,
            _ => {}
        }
        let node_level = matches!(
            event,
            EngineEvent::NodeStarted { .. }
                | EngineEvent::NodeCompleted { .. }
                | EngineEvent::NodeFailed { .. }
        );
        if node_level && self.level < 2 {
            return None;
        }

        let detail = serde_json::to_value(event).ok().map(|mut v| {
            if let Some(obj) = v.as_object_mut() {
                obj.remove("event");
                obj.remove("run_id");
            }
            v
        });
        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            event_type: event.name(),
            detail: detail.filter(|d| d.as_object().is_some_and(|o| !o.is_empty())),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use marshal_core::error::ErrorKind;

    fn node_started(run: &str) -> EngineEvent {
        EngineEvent::NodeStarted {
            run_id: RunId::from_str(run),
            node: "fetch".into(),
            attempt: 1,
        }
    }

    #[test]
    fn level_filtering() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(logger.event_to_entry("r1", &node_started("r1")).is_none());
        let completed = EngineEvent::RunCompleted {
            run_id: RunId::from_str("r1"),
            steps: 3,
        };
        let entry = logger.event_to_entry("r1", &completed).unwrap();
        assert_eq!(entry.event_type, "run_completed");
        assert_eq!(entry.detail.unwrap()["steps"], 3);

        let logger = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(logger.event_to_entry("r1", &node_started("r1")).is_some());
    }

    #[test]
    fn other_runs_are_skipped() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(logger.event_to_entry("r1", &node_started("r2")).is_none());

        let trip = EngineEvent::CircuitOpened {
            action: "flaky_api".into(),
            failure_count: 3,
        };
        let json = serde_json::to_string(&logger.event_to_entry("r1", &trip).unwrap()).unwrap();
        assert!(json.contains("circuit_opened"));
        assert!(json.contains("flaky_api"));
    }

    #[tokio::test]
    async fn writes_jsonl_until_run_ends() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let run_id = RunId::from_str("r1");
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let handle = logger.spawn(&bus, run_id.clone(), CancellationToken::new());

        bus.publish(node_started("r1"));
        bus.publish(EngineEvent::RunFailed {
            run_id: run_id.clone(),
            kind: ErrorKind::Timeout,
            error: "slow".into(),
        });
        handle.await.unwrap();

        let run_dir = dir.path().join("r1");
        let file = std::fs::read_dir(&run_dir).unwrap().next().unwrap().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("node_started"));
        assert!(lines[1].contains("\"timeout\""));
    }
}
