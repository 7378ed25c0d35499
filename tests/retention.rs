//! Integration tests for local and remote retention.

#[path = "util/mod.rs"]
mod util;

use std::fs::File;
use std::path::Path;
use std::time::{Duration, SystemTime};

use offsite_backup::archive::ArchiveNaming;
use offsite_backup::remote::DeleteResult;
use offsite_backup::remote::TransferOutcome;
use offsite_backup::retention::{
    LocalRetentionReport, RemoteRetentionOutcome, RetentionEngine, RetentionPolicy,
    delete_local_archives, list_local_archives, select_local_excess, select_remote_victim,
};
use proptest::prelude::*;
use tempfile::TempDir;
use util::{FakeStore, remote_file};

fn naming() -> ArchiveNaming {
    ArchiveNaming::new("backup_")
}

fn policy(keep_local: usize, keep_remote: usize) -> RetentionPolicy {
    RetentionPolicy {
        keep_local,
        keep_remote,
    }
}

/// Create `name` in `dir` with an mtime `age_secs` in the past.
fn touch_aged(dir: &Path, name: &str, age_secs: u64) {
    let path = dir.join(name);
    std::fs::write(&path, b"archive").unwrap();
    let file = File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
        .unwrap();
}

fn empty_store() -> FakeStore {
    FakeStore::new(TransferOutcome::Confirmed { url: None })
}

// ============================================
// Local retention
// ============================================

#[test]
fn keeps_three_newest_of_five() {
    let tmp = TempDir::new().unwrap();
    for (i, age) in [500, 400, 300, 200, 100].iter().enumerate() {
        touch_aged(tmp.path(), &format!("backup_{i}.tar.gz"), *age);
    }

    let engine = RetentionEngine::<FakeStore>::new(policy(3, 7), tmp.path(), naming());
    let report = engine.enforce_local();

    assert_eq!(report.found, 5);
    assert_eq!(report.kept, 3);
    assert_eq!(report.deleted.len(), 2);
    assert!(!tmp.path().join("backup_0.tar.gz").exists());
    assert!(!tmp.path().join("backup_1.tar.gz").exists());
    for survivor in ["backup_2.tar.gz", "backup_3.tar.gz", "backup_4.tar.gz"] {
        assert!(tmp.path().join(survivor).exists(), "{survivor} should survive");
    }
}

#[test]
fn local_retention_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    for (i, age) in [50, 40, 30, 20].iter().enumerate() {
        touch_aged(tmp.path(), &format!("backup_{i}.tar.gz"), *age);
    }
    let engine = RetentionEngine::<FakeStore>::new(policy(2, 7), tmp.path(), naming());

    assert_eq!(engine.enforce_local().deleted.len(), 2);
    let second = engine.enforce_local();
    assert_eq!(second.found, 2);
    assert!(second.deleted.is_empty());
}

#[test]
fn unrelated_files_are_ignored() {
    let tmp = TempDir::new().unwrap();
    touch_aged(tmp.path(), "backup_old.tar.gz", 100);
    touch_aged(tmp.path(), "notes.txt", 200);
    touch_aged(tmp.path(), "backup_partial.tar", 300);
    touch_aged(tmp.path(), "other_2025.tar.gz", 400);

    let found = list_local_archives(tmp.path(), &naming()).unwrap();
    assert_eq!(found.len(), 1);

    let engine = RetentionEngine::<FakeStore>::new(policy(0, 7), tmp.path(), naming());
    let report = engine.enforce_local();
    assert_eq!(report.deleted.len(), 1);
    assert!(tmp.path().join("notes.txt").exists());
    assert!(tmp.path().join("backup_partial.tar").exists());
    assert!(tmp.path().join("other_2025.tar.gz").exists());
}

#[test]
fn one_failed_local_delete_does_not_stop_the_rest() {
    let tmp = TempDir::new().unwrap();
    for (i, age) in [500, 400, 300, 200, 100].iter().enumerate() {
        touch_aged(tmp.path(), &format!("backup_{i}.tar.gz"), *age);
    }
    let archives = list_local_archives(tmp.path(), &naming()).unwrap();
    let excess = select_local_excess(&archives, 2);
    let names: Vec<_> = excess.iter().map(|a| a.file_name.as_str()).collect();
    assert_eq!(names, vec!["backup_2.tar.gz", "backup_1.tar.gz", "backup_0.tar.gz"]);

    // Swap the middle victim for a directory so unlinking it fails.
    let stuck = tmp.path().join("backup_1.tar.gz");
    std::fs::remove_file(&stuck).unwrap();
    std::fs::create_dir(&stuck).unwrap();
    std::fs::write(stuck.join("inner"), b"x").unwrap();

    let mut report = LocalRetentionReport::default();
    delete_local_archives(excess, &mut report);

    assert_eq!(
        report.deleted,
        vec![tmp.path().join("backup_2.tar.gz"), tmp.path().join("backup_0.tar.gz")]
    );
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, stuck);
    assert!(stuck.exists());
    assert!(!tmp.path().join("backup_0.tar.gz").exists());
    assert!(!tmp.path().join("backup_2.tar.gz").exists());
    assert!(tmp.path().join("backup_3.tar.gz").exists());
    assert!(tmp.path().join("backup_4.tar.gz").exists());
}

#[test]
fn missing_archive_dir_is_not_an_error() {
    let tmp = TempDir::new().unwrap();
    let engine = RetentionEngine::<FakeStore>::new(policy(3, 7), tmp.path().join("none"), naming());
    let report = engine.enforce_local();
    assert_eq!(report.found, 0);
    assert!(report.listing_error.is_none());
}

// ============================================
// Remote retention
// ============================================

#[test]
fn deletes_exactly_one_remote_file_per_run() {
    let files = (0..10).map(|i| remote_file(&format!("k{i:02}"), Some(1_000 + i))).collect();
    let store = empty_store().with_files(files);
    let tmp = TempDir::new().unwrap();
    let engine = RetentionEngine::new(policy(3, 7), tmp.path(), naming()).with_remote(&store);

    let report = engine.run();

    assert_eq!(
        report.remote,
        Some(RemoteRetentionOutcome::Deleted {
            key: "k00".to_string(),
            name: "backup_k00.tar.gz".to_string(),
            count: 10,
        })
    );
    assert_eq!(store.delete_calls(), vec![vec!["k00".to_string()]]);
    assert_eq!(store.files.borrow().len(), 9);
}

#[test]
fn oldest_of_three_is_selected() {
    let files = vec![
        remote_file("a", Some(100)),
        remote_file("b", Some(300)),
        remote_file("c", Some(200)),
    ];
    let store = empty_store().with_files(files);
    let tmp = TempDir::new().unwrap();
    let engine = RetentionEngine::new(policy(3, 1), tmp.path(), naming()).with_remote(&store);

    engine.run();
    assert_eq!(store.delete_calls(), vec![vec!["a".to_string()]]);
}

#[test]
fn at_threshold_nothing_is_deleted() {
    let files = (0..7).map(|i| remote_file(&format!("k{i}"), Some(i))).collect();
    let store = empty_store().with_files(files);
    let tmp = TempDir::new().unwrap();
    let engine = RetentionEngine::new(policy(3, 7), tmp.path(), naming()).with_remote(&store);

    let report = engine.run();
    assert_eq!(report.remote, Some(RemoteRetentionOutcome::WithinWindow { count: 7 }));
    assert!(store.delete_calls().is_empty());
}

#[test]
fn unconfirmed_delete_is_reported_and_nothing_changes() {
    let files = vec![remote_file("a", Some(1)), remote_file("b", Some(2))];
    let mut store = empty_store().with_files(files);
    store.delete_result = Some(DeleteResult {
        success: true,
        deleted_count: 0,
    });
    let tmp = TempDir::new().unwrap();
    let engine = RetentionEngine::new(policy(3, 1), tmp.path(), naming()).with_remote(&store);

    let report = engine.run();
    assert!(matches!(
        report.remote,
        Some(RemoteRetentionOutcome::NotConfirmed { ref key, success: true, deleted_count: 0 }) if key == "a"
    ));
    assert_eq!(store.files.borrow().len(), 2);
}

#[test]
fn listing_failure_skips_remote_but_not_local_retention() {
    let files = (0..5).map(|i| remote_file(&format!("k{i}"), Some(i))).collect();
    let mut store = empty_store().with_files(files);
    store.list_status = Some(503);
    let tmp = TempDir::new().unwrap();
    for (i, age) in [30, 20, 10].iter().enumerate() {
        touch_aged(tmp.path(), &format!("backup_{i}.tar.gz"), *age);
    }
    let engine = RetentionEngine::new(policy(1, 2), tmp.path(), naming()).with_remote(&store);

    let report = engine.run();

    match report.remote {
        Some(RemoteRetentionOutcome::ListFailed { ref error }) => {
            assert!(error.contains("503"), "error: {error}");
        }
        ref other => panic!("expected listing failure, got {other:?}"),
    }
    assert!(store.delete_calls().is_empty());
    assert_eq!(store.files.borrow().len(), 5);
    assert_eq!(report.local.deleted.len(), 2);
}

#[test]
fn failed_delete_is_reported_and_nothing_changes() {
    let files = vec![
        remote_file("a", Some(1)),
        remote_file("b", Some(2)),
        remote_file("c", Some(3)),
    ];
    let mut store = empty_store().with_files(files);
    store.delete_status = Some(500);
    let tmp = TempDir::new().unwrap();
    let engine = RetentionEngine::new(policy(3, 1), tmp.path(), naming()).with_remote(&store);

    let report = engine.run();

    match report.remote {
        Some(RemoteRetentionOutcome::DeleteFailed { ref key, ref error }) => {
            assert_eq!(key, "a");
            assert!(error.contains("500"), "error: {error}");
        }
        ref other => panic!("expected delete failure, got {other:?}"),
    }
    assert_eq!(store.delete_calls(), vec![vec!["a".to_string()]]);
    assert_eq!(store.files.borrow().len(), 3);
}

#[test]
fn files_without_upload_time_are_never_deleted() {
    let files = vec![remote_file("x", None), remote_file("y", None), remote_file("z", None)];
    let store = empty_store().with_files(files);
    let tmp = TempDir::new().unwrap();
    let engine = RetentionEngine::new(policy(3, 1), tmp.path(), naming()).with_remote(&store);

    let report = engine.run();
    assert_eq!(report.remote, Some(RemoteRetentionOutcome::NoCandidate { count: 3 }));
    assert!(store.delete_calls().is_empty());
}

#[test]
fn repeated_runs_converge_one_file_at_a_time() {
    let files = (0..5).map(|i| remote_file(&format!("k{i}"), Some(i))).collect();
    let store = empty_store().with_files(files);
    let tmp = TempDir::new().unwrap();
    let engine = RetentionEngine::new(policy(3, 2), tmp.path(), naming()).with_remote(&store);

    for expected_remaining in [4, 3, 2, 2] {
        engine.run();
        assert_eq!(store.files.borrow().len(), expected_remaining);
    }
    assert_eq!(store.delete_calls().len(), 3);
}

proptest! {
    #[test]
    fn remote_victim_is_the_oldest_timed_file(
        times in prop::collection::vec(prop::option::of(0i64..1_000), 0..20),
        keep in 0usize..10,
    ) {
        let files: Vec<_> = times
            .iter()
            .enumerate()
            .map(|(i, at)| remote_file(&format!("k{i:02}"), *at))
            .collect();

        match select_remote_victim(&files, keep) {
            None => {
                prop_assert!(files.len() <= keep || files.iter().all(|f| f.uploaded_at.is_none()));
            }
            Some(victim) => {
                prop_assert!(files.len() > keep);
                let at = victim.uploaded_at.unwrap();
                for other in files.iter().filter_map(|f| f.uploaded_at.map(|t| (t, &f.key))) {
                    prop_assert!(at < other.0 || (at == other.0 && victim.key <= *other.1));
                }
            }
        }
    }
}
