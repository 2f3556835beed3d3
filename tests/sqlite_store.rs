use anchorage::core::artefact::{Artefact, ArtefactKind};
use anchorage::core::broker;
use anchorage::core::conference::{Engine, MutationBody, MutationRequest};
use anchorage::core::config::GovernanceConfig;
use anchorage::core::db::{self, SqliteAnchorStore};
use anchorage::core::error::GovernanceError;
use anchorage::core::knowledge::{FieldMap, KnowledgeKind, KnowledgeObject, SectionValue};
use anchorage::core::marker::{AnchorStatus, Lifecycle, Marker};
use anchorage::core::registry::{Anchor, AnchorKey, AnchorStore, CommitBatch};
use rusqlite::params;
use tempfile::TempDir;

fn anchor(marker: Marker, kind: KnowledgeKind, version: u64) -> Anchor {
    let artefact = Artefact::Knowledge(KnowledgeObject::new(kind, 7));
    Anchor {
        project_id: 7,
        marker,
        identifier: artefact.identifier(),
        version,
        revision: 0,
        cycle: 1,
        status: AnchorStatus::Draft,
        artefact,
        document: format!("v{}\n", version),
        deviations: Vec::new(),
        closes_cycle: false,
        updated_at: "1700000000Z".to_string(),
        updated_by: "tester".to_string(),
    }
}

fn intent(version: u64) -> Anchor {
    anchor(Marker::Intent, KnowledgeKind::Cko, version)
}

#[test]
fn open_creates_the_database_and_tables() {
    let tmp = TempDir::new().expect("tempdir");
    let root = tmp.path().join("store");
    SqliteAnchorStore::open(&root).expect("open");

    let db_path = db::anchor_db_path(&root);
    assert!(db_path.exists());
    let conn = db::db_connect(&db_path).expect("connect");
    let tables: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .expect("prepare")
        .query_map([], |row| row.get(0))
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("rows");
    assert_eq!(tables, vec!["anchor_versions", "anchors", "lifecycles"]);

    let mode: String = conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .expect("journal mode");
    assert_eq!(mode.to_lowercase(), "wal");
}

#[test]
fn commit_load_and_history() {
    let tmp = TempDir::new().expect("tempdir");
    let mut store = SqliteAnchorStore::open(tmp.path()).expect("open");
    let key = AnchorKey::new(7, Marker::Intent);

    assert!(store.load(key).expect("load").is_none());
    store
        .commit(CommitBatch::new("alice", "conf-1").write(intent(1), 0))
        .expect("v1");
    store
        .commit(CommitBatch::new("alice", "conf-2").write(intent(2), 1))
        .expect("v2");

    let current = store.load(key).expect("load").expect("anchor");
    assert_eq!(current, intent(2));

    let history = store.history(key).expect("history");
    assert_eq!(history.iter().map(|a| a.version).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(history[0].document, "v1\n");
}

#[test]
fn stale_expected_version_conflicts() {
    let tmp = TempDir::new().expect("tempdir");
    let mut store = SqliteAnchorStore::open(tmp.path()).expect("open");
    store
        .commit(CommitBatch::new("alice", "c1").write(intent(1), 0))
        .expect("v1");
    store
        .commit(CommitBatch::new("alice", "c2").write(intent(2), 1))
        .expect("v2");

    let err = store
        .commit(CommitBatch::new("bob", "c3").write(intent(2), 1))
        .expect_err("stale");
    assert!(matches!(
        err,
        GovernanceError::ConcurrencyConflict { expected: 1, actual: 2 }
    ));
    assert_eq!(store.history(AnchorKey::new(7, Marker::Intent)).expect("history").len(), 2);
}

#[test]
fn a_failing_write_rolls_back_the_whole_batch() {
    let tmp = TempDir::new().expect("tempdir");
    let mut store = SqliteAnchorStore::open(tmp.path()).expect("open");

    let mut batch = CommitBatch::new("alice", "c1")
        .write(intent(1), 0)
        .write(anchor(Marker::Route, KnowledgeKind::Wko, 1), 3);
    batch.lifecycle = Some(Lifecycle::new(7, "chat-1"));
    store.commit(batch).expect_err("second write is stale");

    assert!(store.load(AnchorKey::new(7, Marker::Intent)).expect("load").is_none());
    assert!(store.load(AnchorKey::new(7, Marker::Route)).expect("load").is_none());
    assert!(store.load_lifecycle(7, "chat-1").expect("lifecycle").is_none());
}

#[test]
fn lifecycles_persist_across_reopen() {
    let tmp = TempDir::new().expect("tempdir");
    {
        let mut store = SqliteAnchorStore::open(tmp.path()).expect("open");
        let mut lifecycle = Lifecycle::new(7, "chat-1").reopen("second pass", "alice");
        lifecycle.closed = true;
        let mut batch = CommitBatch::new("alice", "c1").write(intent(1), 0);
        batch.lifecycle = Some(lifecycle);
        store.commit(batch).expect("commit");
    }

    let store = SqliteAnchorStore::open(tmp.path()).expect("reopen");
    let lifecycle = store
        .load_lifecycle(7, "chat-1")
        .expect("lifecycle")
        .expect("present");
    assert_eq!(lifecycle.cycle, 2);
    assert!(lifecycle.closed);
    assert_eq!(lifecycle.deviations[0].reason, "second pass");
    assert!(store.load_lifecycle(7, "chat-2").expect("lifecycle").is_none());

    let conn = db::db_connect(&db::anchor_db_path(tmp.path())).expect("connect");
    let (cycle, closed): (i64, bool) = conn
        .query_row(
            "SELECT cycle, closed FROM lifecycles WHERE project_id = ?1 AND chat_id = ?2",
            params![7i64, "chat-1"],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("row");
    assert_eq!((cycle, closed), (2, true));
}

#[test]
fn every_operation_is_logged_by_the_broker() {
    let tmp = TempDir::new().expect("tempdir");
    let mut store = SqliteAnchorStore::open(tmp.path()).expect("open");
    store
        .commit(CommitBatch::new("alice", "conf-1").write(intent(1), 0))
        .expect("v1");
    store
        .commit(CommitBatch::new("bob", "conf-2").write(intent(1), 0))
        .expect_err("stale");
    store.load(AnchorKey::new(7, Marker::Intent)).expect("load");

    let events = broker::read_events(tmp.path()).expect("events");
    let ops: Vec<(&str, &str)> = events
        .iter()
        .map(|e| (e.op.as_str(), e.status.as_str()))
        .collect();
    assert_eq!(
        ops,
        vec![
            ("anchors.init", "success"),
            ("anchor.commit", "success"),
            ("anchor.commit", "rejected"),
            ("anchor.load", "success"),
        ]
    );
    assert_eq!(events[1].actor, "alice");
    assert_eq!(events[1].conference_id.as_deref(), Some("conf-1"));
    assert_eq!(events[2].actor, "bob");
    assert!(events.iter().all(|e| e.db_id == "anchors.db"));
}

#[test]
fn engine_runs_over_sqlite() {
    let tmp = TempDir::new().expect("tempdir");
    let store = SqliteAnchorStore::open(tmp.path()).expect("open");
    let mut engine = Engine::new(store, GovernanceConfig::default());

    let mut fields = FieldMap::new();
    fields.insert(
        "canonical_summary".to_string(),
        Some(SectionValue::text("Reduce onboarding time")),
    );
    let req = MutationRequest::new(
        7,
        "chat-1",
        Marker::Intent,
        ArtefactKind::Cko,
        MutationBody::Fields { fields, stages: None },
    )
    .by("alice");

    let committed = engine.submit(req.clone()).expect("commit");
    assert_eq!(committed.anchor.version, 1);

    let conflict = engine.submit(req).expect_err("stale base");
    assert_eq!(conflict.error.code(), "CONCURRENCY_CONFLICT");
    assert_eq!(conflict.prior.expect("prior").version, 1);

    let store = engine.into_store();
    let reopened = SqliteAnchorStore::open(store.root()).expect("reopen");
    let anchor = reopened
        .load(AnchorKey::new(7, Marker::Intent))
        .expect("load")
        .expect("anchor");
    assert!(anchor.document.starts_with("# CKO-PROJECT-000007\n\nReduce onboarding time\n\n"));
    assert!(reopened.load_lifecycle(7, "chat-1").expect("lifecycle").is_some());

    let commits: Vec<_> = broker::read_events(tmp.path())
        .expect("events")
        .into_iter()
        .filter(|e| e.op == "anchor.commit")
        .collect();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].conference_id.as_deref(), Some(committed.conference_id.as_str()));
}
