//! Baseline persistence across store reopen.

use std::sync::Arc;

use irondome::integrity::{
    hash_file, initialize, rebuild, BaselineStore, IntegrityGate, SqliteBaseline, Verdict,
};

#[test]
fn test_baseline_survives_reopen() {
    let data = tempfile::tempdir().unwrap();
    let root = std::fs::canonicalize(data.path()).unwrap();
    std::fs::create_dir(root.join("bin")).unwrap();
    std::fs::write(root.join("bin/tool"), b"#!/bin/sh\necho ok\n").unwrap();
    std::fs::write(root.join("README"), b"docs").unwrap();

    let db_dir = tempfile::tempdir().unwrap();
    let db = db_dir.path().join("nested/integrity.db");
    {
        let store = SqliteBaseline::open(&db).unwrap();
        let report = initialize(&store, &[root.clone()], 0).unwrap();
        assert_eq!(report.hashed, 2);
        assert_eq!(report.skipped, 0);
    }

    let store = Arc::new(SqliteBaseline::open(&db).unwrap());
    assert_eq!(store.count().unwrap(), 2);
    let record = store.get(&root.join("bin/tool")).unwrap().unwrap();
    assert_eq!(record.hash, hash_file(&root.join("bin/tool"), 0).unwrap());

    let gate = IntegrityGate::new(Arc::clone(&store) as Arc<dyn BaselineStore>, 0);
    assert_eq!(gate.on_modified(&root.join("README")).unwrap(), Verdict::Unchanged);

    std::fs::write(root.join("README"), b"tampered").unwrap();
    assert!(matches!(
        gate.on_modified(&root.join("README")).unwrap(),
        Verdict::Mismatch { .. }
    ));
}

#[test]
fn test_rebuild_drops_vanished_files() {
    let data = tempfile::tempdir().unwrap();
    let root = std::fs::canonicalize(data.path()).unwrap();
    std::fs::write(root.join("keep"), b"1").unwrap();
    std::fs::write(root.join("drop"), b"2").unwrap();

    let store = SqliteBaseline::open_in_memory().unwrap();
    initialize(&store, &[root.clone()], 0).unwrap();
    assert_eq!(store.count().unwrap(), 2);

    std::fs::remove_file(root.join("drop")).unwrap();
    let report = rebuild(&store, &[root.clone()], 0).unwrap();
    assert_eq!(report.hashed, 1);
    assert_eq!(store.count().unwrap(), 1);
    assert!(store.get(&root.join("drop")).unwrap().is_none());
}
