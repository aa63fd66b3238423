//! End-to-end tests: producers on one side of a real pipe, the collector
//! task on the other, a temp directory as the archive.
//!
//! Shutdown is EOF-driven throughout: dropping every write end is exactly
//! how the last database backend going away looks to the collector.

#![allow(clippy::unwrap_used)]

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use aur_core::framing::encode_chunks;
use aur_core::record::{AuditResult, AuditType, RecordFields};
use aur_core::{CategoryPolicy, MAX_CHUNK_PAYLOAD, PIPE_CHUNK_SIZE};
use aur_store::{audit_file_path, IndexTable};
use aurec::{query_audit, AuditSettings, Principal, SessionInfo, Supervisor};
use tempfile::tempdir;

fn base_settings(dir: &Path) -> AuditSettings {
    AuditSettings {
        audit_dir: dir.to_path_buf(),
        node_name: Some("node1".to_owned()),
        rotation_age: 0,
        rotation_size: 0,
        space_limit: u64::MAX / 2048,
        file_remain_threshold: 64,
        remain_age: 0,
        categories: CategoryPolicy {
            dml: true,
            ..CategoryPolicy::default()
        },
        ..AuditSettings::default()
    }
}

fn admin() -> Principal {
    Principal::audit_admin("sec_admin")
}

fn write_frame(fd: &OwnedFd, frame: &[u8]) {
    // SAFETY: fd is an open pipe write end, frame is a live buffer
    let n = unsafe { libc::write(fd.as_raw_fd(), frame.as_ptr().cast(), frame.len()) };
    assert_eq!(n, isize::try_from(frame.len()).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_record_end_to_end() {
    let tmp = tempdir().unwrap();
    let settings = base_settings(tmp.path());
    let mut supervisor = Supervisor::new(settings.clone(), None);
    let handle = supervisor.start().unwrap().unwrap();

    let emitter = supervisor
        .emitter()
        .with_producer_id(42)
        .with_session(SessionInfo {
            user_name: Some("u".to_owned()),
            database_name: Some("db1".to_owned()),
            ..SessionInfo::default()
        });
    emitter.report(
        AuditType::LoginSuccess,
        AuditResult::Ok,
        Some("u"),
        Some("ok"),
    );

    drop(emitter);
    supervisor.close_write_end();
    handle.await.unwrap().unwrap();

    assert!(audit_file_path(tmp.path(), 0).exists());

    let rows = query_audit(&admin(), &settings, 0, i64::MAX, None).unwrap();
    let logins: Vec<_> = rows
        .iter()
        .filter(|r| r.type_label == "login_success")
        .collect();
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].user_name, "u");
    assert_eq!(logins[0].database_name, "db1");
    assert_eq!(logins[0].result_label, "ok");
    assert_eq!(logins[0].object_name, "u");
    assert_eq!(logins[0].detail_info, "ok");
    assert!(logins[0].thread_id.starts_with("42@"));
    assert_eq!(logins[0].node_name, "node1");
    // absent session fields render as the literal null
    assert_eq!(logins[0].remote_port, "null");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fragmented_record_reassembles_to_one_row() {
    let tmp = tempdir().unwrap();
    let settings = base_settings(tmp.path());
    let mut supervisor = Supervisor::new(settings.clone(), None);
    let handle = supervisor.start().unwrap().unwrap();

    // payload spanning several atomic chunks
    let detail = "x".repeat(3 * PIPE_CHUNK_SIZE);
    let emitter = supervisor.emitter().with_producer_id(7);
    emitter.report(AuditType::DmlAction, AuditResult::Ok, Some("t1"), Some(&detail));

    drop(emitter);
    supervisor.close_write_end();
    handle.await.unwrap().unwrap();

    let rows = query_audit(&admin(), &settings, 0, i64::MAX, None).unwrap();
    let dml: Vec<_> = rows.iter().filter(|r| r.type_label == "dml_action").collect();
    assert_eq!(dml.len(), 1);
    assert_eq!(dml[0].detail_info.len(), 3 * PIPE_CHUNK_SIZE);
    assert!(dml[0].detail_info.bytes().all(|b| b == b'x'));
    // nothing but the file-creation event and the record made it to disk,
    // so no partial buffer leaked into the archive
    assert_eq!(rows.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interleaved_producers_keep_records_whole() {
    let tmp = tempdir().unwrap();
    let settings = base_settings(tmp.path());
    let mut supervisor = Supervisor::new(settings.clone(), None);
    let handle = supervisor.start().unwrap().unwrap();

    let record_a = RecordFields {
        user_name: Some("a".to_owned()),
        detail_info: Some("d".repeat(2 * MAX_CHUNK_PAYLOAD)),
        ..RecordFields::default()
    }
    .encode(AuditType::DmlAction, AuditResult::Ok);
    let record_b = RecordFields {
        user_name: Some("b".to_owned()),
        detail_info: Some("e".repeat(MAX_CHUNK_PAYLOAD + 10)),
        ..RecordFields::default()
    }
    .encode(AuditType::DmlAction, AuditResult::Failed);

    let a = encode_chunks(1, &record_a);
    let b = encode_chunks(2, &record_b);
    assert_eq!(a.len(), 3); // f f t
    assert_eq!(b.len(), 2); // f t

    let fd = supervisor.writer_fd().unwrap();
    for frame in [&a[0], &b[0], &a[1], &b[1], &a[2]] {
        write_frame(&fd, frame);
    }
    drop(fd);
    supervisor.close_write_end();
    handle.await.unwrap().unwrap();

    let rows = query_audit(&admin(), &settings, 0, i64::MAX, None).unwrap();
    let dml: Vec<_> = rows
        .iter()
        .filter(|r| r.type_label == "dml_action")
        .collect();
    assert_eq!(dml.len(), 2);

    // b's final chunk landed first, so b precedes a in the file
    assert_eq!(dml[0].user_name, "b");
    assert_eq!(dml[0].result_label, "failed");
    assert_eq!(dml[0].detail_info.len(), MAX_CHUNK_PAYLOAD + 10);
    assert_eq!(dml[1].user_name, "a");
    assert_eq!(dml[1].detail_info.len(), 2 * MAX_CHUNK_PAYLOAD);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_size_rotation_splits_the_archive() {
    let tmp = tempdir().unwrap();
    let settings = AuditSettings {
        rotation_size: 1, // KiB
        ..base_settings(tmp.path())
    };
    let mut supervisor = Supervisor::new(settings.clone(), None);
    let handle = supervisor.start().unwrap().unwrap();

    // more than a second apart, so consecutive rotations get distinct
    // creation times and non-degenerate slot windows
    let emitter = supervisor.emitter().with_producer_id(9);
    for detail_len in [600usize, 500, 300] {
        let detail = "y".repeat(detail_len);
        emitter.report(AuditType::DmlAction, AuditResult::Ok, None, Some(&detail));
        tokio::time::sleep(Duration::from_millis(1_200)).await;
    }

    drop(emitter);
    supervisor.close_write_end();
    handle.await.unwrap().unwrap();

    let index = IndexTable::load(tmp.path()).unwrap().unwrap();
    assert_eq!(index.count, 2);
    assert_eq!(index.begidx, 0);
    assert_eq!(index.curidx, 1);

    let first_len = std::fs::metadata(audit_file_path(tmp.path(), 0)).unwrap().len();
    assert!(first_len >= 1024, "first file closed at {first_len} bytes");
    assert!(audit_file_path(tmp.path(), 1).exists());

    let rows = query_audit(&admin(), &settings, 0, i64::MAX, None).unwrap();
    let dml = rows.iter().filter(|r| r.type_label == "dml_action").count();
    assert_eq!(dml, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_count_retention_unlinks_the_oldest_files() {
    let tmp = tempdir().unwrap();
    let settings = AuditSettings {
        rotation_size: 1,     // rotate after every sizeable record
        file_remain_threshold: 2,
        cleanup_policy: 1, // space priority
        ..base_settings(tmp.path())
    };
    let mut supervisor = Supervisor::new(settings.clone(), None);
    let handle = supervisor.start().unwrap().unwrap();

    // spaced past a second so every slot window has a distinct ctime
    let emitter = supervisor.emitter().with_producer_id(11);
    for _ in 0..4 {
        let detail = "z".repeat(1100);
        emitter.report(AuditType::DmlAction, AuditResult::Ok, None, Some(&detail));
        tokio::time::sleep(Duration::from_millis(1_200)).await;
    }

    drop(emitter);
    supervisor.close_write_end();
    handle.await.unwrap().unwrap();

    let index = IndexTable::load(tmp.path()).unwrap().unwrap();
    assert_eq!(index.count, 2);
    let live: Vec<u32> = index
        .live_indices()
        .iter()
        .map(|&i| index.slot(i).filenum)
        .collect();
    assert_eq!(live, vec![2, 3]);

    assert!(!audit_file_path(tmp.path(), 0).exists());
    assert!(!audit_file_path(tmp.path(), 1).exists());
    assert!(audit_file_path(tmp.path(), 2).exists());
    assert!(audit_file_path(tmp.path(), 3).exists());

    let rows = query_audit(&admin(), &settings, 0, i64::MAX, None).unwrap();
    let details: Vec<&str> = rows.iter().map(|r| r.detail_info.as_str()).collect();
    assert!(details.contains(&"remove an audit file(number: 0)"));
    assert!(details.contains(&"remove an audit file(number: 1)"));
    // the two oldest data records went down with their files
    let dml = rows.iter().filter(|r| r.type_label == "dml_action").count();
    assert_eq!(dml, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_partial_record_is_flushed_at_eof() {
    let tmp = tempdir().unwrap();
    let settings = base_settings(tmp.path());
    let mut supervisor = Supervisor::new(settings, None);
    let handle = supervisor.start().unwrap().unwrap();

    // two non-final chunks, then the producer "dies" without finishing
    let record = RecordFields {
        user_name: Some("gone".to_owned()),
        detail_info: Some("q".repeat(2 * MAX_CHUNK_PAYLOAD + 100)),
        ..RecordFields::default()
    }
    .encode(AuditType::DmlAction, AuditResult::Ok);
    let frames = encode_chunks(5, &record);
    assert_eq!(frames.len(), 3);

    let fd = supervisor.writer_fd().unwrap();
    write_frame(&fd, &frames[0]);
    write_frame(&fd, &frames[1]);
    drop(fd);
    supervisor.close_write_end();
    handle.await.unwrap().unwrap();

    // the half-sent record's bytes were written out, not dropped: the
    // file holds the creation event plus both chunk payloads
    let len = std::fs::metadata(audit_file_path(tmp.path(), 0)).unwrap().len();
    assert!(
        len > 2 * MAX_CHUNK_PAYLOAD as u64,
        "flushed prefix missing, file is only {len} bytes"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_respawn_cooldown_throttles_restarts() {
    let tmp = tempdir().unwrap();
    let settings = base_settings(tmp.path());
    let mut supervisor = Supervisor::new(settings, None);

    let first = supervisor.start().unwrap().unwrap();
    // a second start right away is refused
    assert!(supervisor.start().unwrap().is_none());

    supervisor.allow_immediate_restart();
    let second = supervisor.start().unwrap().unwrap();

    supervisor.close_write_end();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
}
