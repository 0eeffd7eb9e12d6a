//! End-to-end engine tests. Skipped when the host refuses an inotify
//! instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use irondome::integrity::{BaselineStore, IntegrityGate, SqliteBaseline};
use irondome::watch::{
    EngineConfig, EngineState, EventKind, Incident, InotifyRegistrar, InotifySource,
    MonitorEvent, WatchEngine,
};
use tokio_util::sync::CancellationToken;

const WINDOW: Duration = Duration::from_millis(50);

type Engine = WatchEngine<InotifySource, InotifyRegistrar>;

fn open_engine(store: Arc<SqliteBaseline>) -> Option<Engine> {
    let config = EngineConfig {
        inactivity_window: WINDOW,
        poll_interval: Duration::from_millis(5),
        ..EngineConfig::default()
    };
    match WatchEngine::open(config, IntegrityGate::new(store, 0)) {
        Ok(engine) => Some(engine),
        Err(e) => {
            eprintln!("skipping: {e}");
            None
        }
    }
}

/// Poll until the kernel queue is drained and every pending path flushed.
fn drain(engine: &mut Engine) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline {
        events.extend(engine.poll().unwrap());
        std::thread::sleep(Duration::from_millis(10));
    }
    events.extend(engine.poll_at(Instant::now() + WINDOW * 4).unwrap());
    events
}

fn incident_for<'a>(events: &'a [MonitorEvent], path: &Path) -> Option<&'a Incident> {
    events.iter().find_map(|e| match e {
        MonitorEvent::Incident(i) if i.path == path => Some(i),
        _ => None,
    })
}

fn canonical_tempdir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = std::fs::canonicalize(dir.path()).unwrap();
    (dir, root)
}

#[test]
fn test_file_write_produces_incident() {
    let (_dir, root) = canonical_tempdir();
    let store = Arc::new(SqliteBaseline::open_in_memory().unwrap());
    let Some(mut engine) = open_engine(Arc::clone(&store)) else {
        return;
    };
    engine.add_roots(&[root.clone()]).unwrap();

    let file = root.join("notes.txt");
    std::fs::write(&file, b"first draft").unwrap();

    let events = drain(&mut engine);
    let incident = incident_for(&events, &file).expect("incident for written file");
    assert!(incident.kinds.contains(&EventKind::Create));
    assert!(incident.kinds.contains(&EventKind::Modify));
    assert_eq!(store.get(&file).unwrap().unwrap().hash.len(), 64);
}

#[test]
fn test_mismatch_after_rewrite() {
    let (_dir, root) = canonical_tempdir();
    let file = root.join("config.ini");
    std::fs::write(&file, b"mode=safe").unwrap();

    let store = Arc::new(SqliteBaseline::open_in_memory().unwrap());
    irondome::integrity::initialize(store.as_ref(), &[root.clone()], 0).unwrap();
    let Some(mut engine) = open_engine(Arc::clone(&store)) else {
        return;
    };
    engine.add_roots(&[root.clone()]).unwrap();

    std::fs::write(&file, b"mode=unsafe").unwrap();

    let events = drain(&mut engine);
    let alert = events.iter().find_map(|e| match e {
        MonitorEvent::Mismatch(a) => Some(a),
        _ => None,
    });
    let alert = alert.expect("mismatch alert");
    assert_eq!(alert.path, file);
    assert_ne!(alert.old_hash, alert.new_hash);
}

#[test]
fn test_created_subdirectory_is_followed() {
    let (_dir, root) = canonical_tempdir();
    let store = Arc::new(SqliteBaseline::open_in_memory().unwrap());
    let Some(mut engine) = open_engine(store) else {
        return;
    };
    engine.add_roots(&[root.clone()]).unwrap();
    assert_eq!(engine.table().len(), 1);

    let sub = root.join("incoming");
    std::fs::create_dir(&sub).unwrap();
    drain(&mut engine);
    assert!(engine.table().handle_of(&sub).is_some());

    let nested = sub.join("payload.bin");
    std::fs::write(&nested, b"\x00\x01").unwrap();
    let events = drain(&mut engine);
    assert!(incident_for(&events, &nested).is_some());

    std::fs::remove_file(&nested).unwrap();
    std::fs::remove_dir(&sub).unwrap();
    drain(&mut engine);
    assert!(engine.table().handle_of(&sub).is_none());
    assert_eq!(engine.table().len(), 1);
}

#[test]
fn test_shutdown_clears_table() {
    let (_dir, root) = canonical_tempdir();
    std::fs::create_dir(root.join("a")).unwrap();
    let store = Arc::new(SqliteBaseline::open_in_memory().unwrap());
    let Some(mut engine) = open_engine(store) else {
        return;
    };
    let report = engine.add_roots(&[root.clone()]).unwrap();
    assert_eq!(report.directories, 2);

    engine.shutdown();
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(engine.table().is_empty());
}

#[tokio::test]
async fn test_spawned_engine_stops_on_cancel() {
    let (_dir, root) = canonical_tempdir();
    let store = Arc::new(SqliteBaseline::open_in_memory().unwrap());
    let Some(engine) = open_engine(store) else {
        return;
    };
    engine.add_roots(&[root.clone()]).unwrap();

    let cancel = CancellationToken::new();
    let (handle, mut rx) = engine.spawn(cancel.clone());
    let file = root.join("log.txt");
    std::fs::write(&file, b"line").unwrap();

    let incident = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            if let MonitorEvent::Incident(i) = event {
                if i.path == file {
                    return Some(i);
                }
            }
        }
        None
    })
    .await
    .unwrap();
    assert!(incident.is_some());

    cancel.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_ok());
}
