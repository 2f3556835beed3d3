use crate::core::broker::DbBroker;
use crate::core::error::GovernanceError;
use crate::core::marker::Lifecycle;
use crate::core::registry::{self, Anchor, AnchorKey, AnchorStore, CommitBatch};
use crate::core::schemas;
use rusqlite::{Connection, OptionalExtension, params};
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &Path) -> Result<Connection, GovernanceError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(GovernanceError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(GovernanceError::RusqliteError)?;
    Ok(conn)
}

pub fn anchor_db_path(root: &Path) -> PathBuf {
    root.join(schemas::ANCHOR_DB_NAME)
}

pub fn initialize_anchor_db(root: &Path) -> Result<PathBuf, GovernanceError> {
    fs::create_dir_all(root).map_err(GovernanceError::IoError)?;
    let db_path = anchor_db_path(root);

    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "anchorage", None, "anchors.init", |conn| {
        for schema in schemas::ANCHOR_DB_SCHEMAS {
            conn.execute(schema, [])?;
        }
        Ok(())
    })?;
    Ok(db_path)
}

/// Anchor registry in `anchors.db`, accessed through the broker.
pub struct SqliteAnchorStore {
    root: PathBuf,
    db_path: PathBuf,
    broker: DbBroker,
    actor: String,
}

impl SqliteAnchorStore {
    /// Open (and create if missing) the registry under `root`.
    pub fn open(root: &Path) -> Result<Self, GovernanceError> {
        let db_path = initialize_anchor_db(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            db_path,
            broker: DbBroker::new(root),
            actor: "anchorage".to_string(),
        })
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn decode_anchor(body: String) -> Result<Anchor, GovernanceError> {
    Ok(serde_json::from_str(&body)?)
}

fn current_version(conn: &Connection, key: AnchorKey) -> Result<u64, GovernanceError> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM anchors WHERE project_id = ?1 AND marker = ?2",
            params![key.project_id as i64, key.marker.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.unwrap_or(0) as u64)
}

impl AnchorStore for SqliteAnchorStore {
    fn load(&self, key: AnchorKey) -> Result<Option<Anchor>, GovernanceError> {
        self.broker
            .with_conn(&self.db_path, &self.actor, None, "anchor.load", |conn| {
                let body: Option<String> = conn
                    .query_row(
                        "SELECT body FROM anchors WHERE project_id = ?1 AND marker = ?2",
                        params![key.project_id as i64, key.marker.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                body.map(decode_anchor).transpose()
            })
    }

    fn history(&self, key: AnchorKey) -> Result<Vec<Anchor>, GovernanceError> {
        self.broker
            .with_conn(&self.db_path, &self.actor, None, "anchor.history", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT body FROM anchor_versions
                     WHERE project_id = ?1 AND marker = ?2
                     ORDER BY version ASC",
                )?;
                let rows = stmt.query_map(
                    params![key.project_id as i64, key.marker.as_str()],
                    |row| row.get::<_, String>(0),
                )?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(decode_anchor(row?)?);
                }
                Ok(out)
            })
    }

    fn load_lifecycle(&self, project_id: u64, chat_id: &str) -> Result<Option<Lifecycle>, GovernanceError> {
        self.broker
            .with_conn(&self.db_path, &self.actor, None, "lifecycle.load", |conn| {
                let body: Option<String> = conn
                    .query_row(
                        "SELECT body FROM lifecycles WHERE project_id = ?1 AND chat_id = ?2",
                        params![project_id as i64, chat_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match body {
                    Some(b) => Ok(Some(serde_json::from_str(&b)?)),
                    None => Ok(None),
                }
            })
    }

    fn commit(&mut self, batch: CommitBatch) -> Result<(), GovernanceError> {
        let actor = if batch.actor.is_empty() {
            self.actor.clone()
        } else {
            batch.actor.clone()
        };
        let conference_id = batch.conference_id.clone();
        self.broker.with_conn(
            &self.db_path,
            &actor,
            conference_id.as_deref(),
            "anchor.commit",
            |conn| {
                let tx = conn.unchecked_transaction()?;
                for write in &batch.writes {
                    let key = write.anchor.key();
                    registry::check_write(write, current_version(&tx, key)?)?;
                    let anchor = &write.anchor;
                    let body = serde_json::to_string(anchor)?;
                    tx.execute(
                        "INSERT INTO anchors (project_id, marker, version, body, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(project_id, marker) DO UPDATE SET
                           version = excluded.version,
                           body = excluded.body,
                           updated_at = excluded.updated_at",
                        params![
                            anchor.project_id as i64,
                            anchor.marker.as_str(),
                            anchor.version as i64,
                            body,
                            anchor.updated_at,
                        ],
                    )?;
                    tx.execute(
                        "INSERT INTO anchor_versions
                           (project_id, marker, version, revision, status, body, updated_at, updated_by)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            anchor.project_id as i64,
                            anchor.marker.as_str(),
                            anchor.version as i64,
                            anchor.revision as i64,
                            anchor.status.as_str(),
                            body,
                            anchor.updated_at,
                            anchor.updated_by,
                        ],
                    )?;
                }
                if let Some(lifecycle) = &batch.lifecycle {
                    tx.execute(
                        "INSERT INTO lifecycles (project_id, chat_id, cycle, closed, body)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT(project_id, chat_id) DO UPDATE SET
                           cycle = excluded.cycle,
                           closed = excluded.closed,
                           body = excluded.body",
                        params![
                            lifecycle.project_id as i64,
                            lifecycle.chat_id,
                            lifecycle.cycle as i64,
                            lifecycle.closed,
                            serde_json::to_string(lifecycle)?,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            },
        )
    }
}
