use crate::core::db;
use crate::core::error::GovernanceError;
use crate::core::time;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Serialized access to the anchor database.
///
/// Every operation holds one process-wide lock for its whole duration and
/// leaves one line in `broker.events.jsonl`, success or not.
pub struct DbBroker {
    audit_log_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub conference_id: Option<String>,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

/// Append one JSON line to `path`, creating the file if needed.
pub fn append_event<T: Serialize>(path: &Path, event: &T) -> Result<(), GovernanceError> {
    let line = serde_json::to_string(event)?;
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(GovernanceError::IoError)?;
    writeln!(f, "{}", line).map_err(GovernanceError::IoError)?;
    Ok(())
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join("broker.events.jsonl"),
        }
    }

    pub fn audit_log_path(&self) -> &Path {
        &self.audit_log_path
    }

    /// Execute a closure with a serialized connection to the specified DB.
    pub fn with_conn<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        conference_id: Option<&str>,
        op_name: &str,
        f: F,
    ) -> Result<R, GovernanceError>
    where
        F: FnOnce(&Connection) -> Result<R, GovernanceError>,
    {
        static DB_LOCK: Mutex<()> = Mutex::new(());
        let _lock = DB_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let db_id = db_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let conn = db::db_connect(db_path)?;

        let result = f(&conn);

        let status = match &result {
            Ok(_) => "success",
            Err(e) if e.is_rejection() => "rejected",
            Err(_) => "error",
        };
        self.log_event(actor, conference_id, op_name, &db_id, status)?;

        result
    }

    fn log_event(
        &self,
        actor: &str,
        conference_id: Option<&str>,
        op: &str,
        db_id: &str,
        status: &str,
    ) -> Result<(), GovernanceError> {
        let ev = BrokerEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            actor: actor.to_string(),
            conference_id: conference_id.map(|s| s.to_string()),
            op: op.to_string(),
            db_id: db_id.to_string(),
            status: status.to_string(),
        };
        append_event(&self.audit_log_path, &ev)
    }
}

/// Read back the broker audit log.
pub fn read_events(root: &Path) -> Result<Vec<BrokerEvent>, GovernanceError> {
    let path = root.join("broker.events.jsonl");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path).map_err(GovernanceError::IoError)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(GovernanceError::from))
        .collect()
}
