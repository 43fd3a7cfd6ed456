mod common;

use std::time::Duration;

use chrono::Utc;
use common::{BASE_DN, TestEnv, people, person, skeleton};
use ldapguard::domain::entry::generalized_time;
use ldapguard::domain::{BackupType, JobKind, JobStatus};
use ldapguard::services::artifact;
use ldapguard::services::{BackupRequest, RestoreError, RestoreRequest};

fn full(server_id: i32) -> BackupRequest {
    BackupRequest {
        ldap_server_id: server_id,
        backup_type: BackupType::Full,
        encrypted: true,
        compression_enabled: true,
        scheduled_backup_id: None,
    }
}

fn restore_all(backup_id: i32, server_id: i32) -> RestoreRequest {
    RestoreRequest {
        backup_id,
        ldap_server_id: server_id,
        selective_restore: false,
        restore_filter: None,
        point_in_time: None,
    }
}

#[tokio::test]
async fn test_full_backup_restores_into_empty_directory() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(25));
    let target = env.memory.add_directory(BASE_DN, Vec::new());
    let source_server = env.add_server("source", &source).await;
    let target_server = env.add_server("target", &target).await;

    let backup = env
        .shared
        .backup_engine
        .run_backup(full(source_server.id), None)
        .await
        .unwrap();

    assert_eq!(backup.status, "completed");
    assert_eq!(backup.backup_type, "full");
    assert_eq!(backup.entry_count, Some(27));
    assert!(backup.checksum.is_some());

    let path = backup.file_path.clone().unwrap();
    let manifest = artifact::verify_file(std::path::Path::new(&path)).unwrap();
    assert_eq!(manifest.backup_id, backup.id);
    assert_eq!(manifest.entry_count, 27);
    assert!(manifest.is_encrypted());

    let restore = env
        .shared
        .restore_engine
        .run_restore(restore_all(backup.id, target_server.id), None)
        .await
        .unwrap();

    assert_eq!(restore.status, "completed");
    assert_eq!(restore.entries_restored, 27);
    assert_eq!(restore.entries_failed, 0);

    let mut restored: Vec<String> = env
        .memory
        .entries(&target)
        .iter()
        .map(|e| e.normalized_dn())
        .collect();
    let mut original: Vec<String> = env
        .memory
        .entries(&source)
        .iter()
        .map(|e| e.normalized_dn())
        .collect();
    restored.sort();
    original.sort();
    assert_eq!(restored, original);
    assert_eq!(env.memory.open_sessions(), 0);
}

#[tokio::test]
async fn test_selective_restore_writes_only_matching_entries() {
    let env = TestEnv::new().await;

    let mut entries = skeleton();
    entries.extend((0..3).map(|i| person(&format!("admin{i}"))));
    entries.extend((0..97).map(|i| person(&format!("user{i}"))));
    let source = env.memory.add_directory(BASE_DN, entries);
    let target = env.memory.add_directory(BASE_DN, skeleton());
    let source_server = env.add_server("source", &source).await;
    let target_server = env.add_server("target", &target).await;

    let backup = env
        .shared
        .backup_engine
        .run_backup(full(source_server.id), None)
        .await
        .unwrap();
    assert_eq!(backup.entry_count, Some(102));

    let restore = env
        .shared
        .restore_engine
        .run_restore(
            RestoreRequest {
                selective_restore: true,
                restore_filter: Some("(cn=admin*)".to_string()),
                ..restore_all(backup.id, target_server.id)
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(restore.status, "completed");
    assert_eq!(restore.entries_restored, 3);
    assert_eq!(env.memory.add_count(&target), 3);
    assert!(
        env.memory
            .get_entry(&target, &format!("cn=admin2,ou=people,{BASE_DN}"))
            .is_some()
    );
    assert!(
        env.memory
            .get_entry(&target, &format!("cn=user0,ou=people,{BASE_DN}"))
            .is_none()
    );
}

#[tokio::test]
async fn test_selective_restore_requires_a_valid_filter() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(1));
    let server = env.add_server("source", &source).await;
    let backup = env
        .shared
        .backup_engine
        .run_backup(full(server.id), None)
        .await
        .unwrap();

    let missing = env
        .shared
        .restore_engine
        .request(
            RestoreRequest {
                selective_restore: true,
                ..restore_all(backup.id, server.id)
            },
            None,
        )
        .await;
    assert!(matches!(missing, Err(RestoreError::Validation(_))));

    let broken = env
        .shared
        .restore_engine
        .request(
            RestoreRequest {
                selective_restore: true,
                restore_filter: Some("(cn=admin".to_string()),
                ..restore_all(backup.id, server.id)
            },
            None,
        )
        .await;
    assert!(matches!(broken, Err(RestoreError::Validation(_))));
}

#[tokio::test]
async fn test_existing_entries_are_skipped() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(5));
    let server = env.add_server("source", &source).await;

    let backup = env
        .shared
        .backup_engine
        .run_backup(full(server.id), None)
        .await
        .unwrap();

    // Restoring onto the directory it came from changes nothing.
    let restore = env
        .shared
        .restore_engine
        .run_restore(restore_all(backup.id, server.id), None)
        .await
        .unwrap();

    assert_eq!(restore.status, "completed");
    assert_eq!(restore.entries_restored, 0);
    assert_eq!(restore.entries_skipped, 7);
    assert_eq!(env.memory.add_count(&source), 0);
}

#[tokio::test]
async fn test_corrupted_artifact_fails_without_writing() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(10));
    let target = env.memory.add_directory(BASE_DN, Vec::new());
    let source_server = env.add_server("source", &source).await;
    let target_server = env.add_server("target", &target).await;

    let backup = env
        .shared
        .backup_engine
        .run_backup(full(source_server.id), None)
        .await
        .unwrap();

    let path = backup.file_path.clone().unwrap();
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();

    let restore = env
        .shared
        .restore_engine
        .run_restore(restore_all(backup.id, target_server.id), None)
        .await
        .unwrap();

    assert_eq!(restore.status, "failed");
    assert!(
        restore
            .error_message
            .as_deref()
            .is_some_and(|m| m.starts_with("ArtifactCorrupted"))
    );
    assert_eq!(restore.entries_restored, 0);
    assert_eq!(env.memory.add_count(&target), 0);
    assert!(env.memory.entries(&target).is_empty());
}

#[tokio::test]
async fn test_failed_entry_fails_the_restore() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(4));
    let target = env.memory.add_directory(BASE_DN, skeleton());
    let source_server = env.add_server("source", &source).await;
    let target_server = env.add_server("target", &target).await;

    let backup = env
        .shared
        .backup_engine
        .run_backup(full(source_server.id), None)
        .await
        .unwrap();

    env.memory
        .fail_adds_of(&format!("cn=user2,ou=people,{BASE_DN}"));

    let restore = env
        .shared
        .restore_engine
        .run_restore(restore_all(backup.id, target_server.id), None)
        .await
        .unwrap();

    assert_eq!(restore.status, "failed");
    assert_eq!(restore.entries_restored, 3);
    assert_eq!(restore.entries_failed, 1);
    assert!(
        restore
            .error_message
            .as_deref()
            .is_some_and(|m| m.starts_with("EntriesFailed"))
    );
}

#[tokio::test]
async fn test_incremental_without_parent_runs_full() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(3));
    let server = env.add_server("source", &source).await;

    let backup = env
        .shared
        .backup_engine
        .run_backup(
            BackupRequest {
                backup_type: BackupType::Incremental,
                ..full(server.id)
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(backup.status, "completed");
    assert_eq!(backup.backup_type, "full");
    assert_eq!(backup.parent_backup_id, None);
    assert_eq!(backup.entry_count, Some(5));
}

#[tokio::test]
async fn test_incremental_captures_only_changes() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(10));
    let server = env.add_server("source", &source).await;

    let first = env
        .shared
        .backup_engine
        .run_backup(full(server.id), None)
        .await
        .unwrap();

    let changed_at = generalized_time(Utc::now() + chrono::Duration::minutes(1));
    env.memory.put_entry(
        &source,
        person("user3").with_attr("modifyTimestamp", [changed_at.as_str()]),
    );

    let second = env
        .shared
        .backup_engine
        .run_backup(
            BackupRequest {
                backup_type: BackupType::Incremental,
                ..full(server.id)
            },
            None,
        )
        .await
        .unwrap();

    assert_eq!(second.status, "completed");
    assert_eq!(second.backup_type, "incremental");
    assert_eq!(second.parent_backup_id, Some(first.id));
    assert_eq!(second.entry_count, Some(1));
}

#[tokio::test]
async fn test_point_in_time_restore_picks_version_at_cutoff() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(3));
    let server = env.add_server("source", &source).await;

    let original = person("user1").with_attr("mail", ["old@example.org"]);
    env.memory.put_entry(&source, original);

    let base = env
        .shared
        .backup_engine
        .run_backup(full(server.id), None)
        .await
        .unwrap();

    let changed_at = Utc::now() + chrono::Duration::hours(1);
    env.memory.put_entry(
        &source,
        person("user1")
            .with_attr("mail", ["new@example.org"])
            .with_attr("modifyTimestamp", [generalized_time(changed_at)]),
    );

    let increment = env
        .shared
        .backup_engine
        .run_backup(
            BackupRequest {
                backup_type: BackupType::Incremental,
                ..full(server.id)
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(increment.parent_backup_id, Some(base.id));

    let user1 = format!("cn=user1,ou=people,{BASE_DN}");
    for (cutoff, expected) in [
        (changed_at - chrono::Duration::minutes(30), "old@example.org"),
        (changed_at + chrono::Duration::minutes(30), "new@example.org"),
    ] {
        let target = env.memory.add_directory(BASE_DN, Vec::new());
        let target_server = env
            .add_server(&format!("target-{}", target.port), &target)
            .await;

        let restore = env
            .shared
            .restore_engine
            .run_restore(
                RestoreRequest {
                    point_in_time: Some(cutoff),
                    ..restore_all(increment.id, target_server.id)
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(restore.status, "completed");
        assert_eq!(restore.entries_restored, 5);
        let restored = env.memory.get_entry(&target, &user1).unwrap();
        assert_eq!(restored.first_text("mail").as_deref(), Some(expected));
        assert!(!restored.has_attribute("modifyTimestamp"));
    }
}

#[tokio::test]
async fn test_cancelled_backup_leaves_no_artifact() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(100));
    let server = env.add_server("source", &source).await;
    env.memory.set_search_delay(Duration::from_millis(100));

    let backup = env
        .shared
        .backup_engine
        .request(full(server.id), None)
        .await
        .unwrap();

    let engine = env.shared.backup_engine.clone();
    let id = backup.id;
    let running = tokio::spawn(async move { engine.run(id).await });

    let ledger = env.shared.ledger.clone();
    for _ in 0..200 {
        if ledger.status(JobKind::Backup, id).await.unwrap() == JobStatus::InProgress {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        ledger.cancel(JobKind::Backup, id).await.unwrap(),
        JobStatus::Cancelling
    );

    let finished = running.await.unwrap().unwrap();
    assert_eq!(finished.status, "failed");
    assert_eq!(finished.error_message.as_deref(), Some("Cancelled: cancelled"));
    assert!(finished.file_path.is_none());

    let written = std::fs::read_dir(env.dir.join("backups"))
        .map(|dir| dir.count())
        .unwrap_or(0);
    assert_eq!(written, 0);
    assert_eq!(env.memory.open_sessions(), 0);

    let reasons: Vec<Option<String>> = ledger
        .transitions(JobKind::Backup, id)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.reason)
        .collect();
    assert_eq!(reasons.last().cloned().flatten().as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_long_running_backup_is_not_recovered_as_stale() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(50));
    let server = env.add_server("source", &source).await;
    env.memory.set_search_delay(Duration::from_millis(100));

    let backup = env
        .shared
        .backup_engine
        .request(full(server.id), None)
        .await
        .unwrap();

    let engine = env.shared.backup_engine.clone();
    let id = backup.id;
    let running = tokio::spawn(async move { engine.run(id).await });

    // Six pages at 100 ms each; by now the claim itself is older than the
    // threshold but the last page is not.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let recovered = env
        .shared
        .ledger
        .recover_stale(chrono::Duration::milliseconds(250))
        .await
        .unwrap();
    assert_eq!(recovered, 0);

    let finished = running.await.unwrap().unwrap();
    assert_eq!(finished.status, "completed");
    assert_eq!(finished.entry_count, Some(52));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(2));
    let server = env.add_server("source", &source).await;
    env.memory.fail_next_connects(2);

    let backup = env
        .shared
        .backup_engine
        .run_backup(full(server.id), None)
        .await
        .unwrap();

    assert_eq!(backup.status, "completed");
    assert_eq!(env.memory.connect_attempts(), 3);
}

#[tokio::test]
async fn test_backup_survives_connection_reset_mid_search() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(30));
    let target = env.memory.add_directory(BASE_DN, Vec::new());
    let source_server = env.add_server("source", &source).await;
    let target_server = env.add_server("target", &target).await;
    // Pages of 10: the connection drops while fetching the second page.
    env.memory.reset_connection_after(1);

    let backup = env
        .shared
        .backup_engine
        .run_backup(full(source_server.id), None)
        .await
        .unwrap();

    assert_eq!(backup.status, "completed");
    assert_eq!(backup.entry_count, Some(32));
    assert_eq!(env.memory.connect_attempts(), 2);
    assert_eq!(env.memory.open_sessions(), 0);

    let restore = env
        .shared
        .restore_engine
        .run_restore(restore_all(backup.id, target_server.id), None)
        .await
        .unwrap();
    assert_eq!(restore.status, "completed");
    assert_eq!(restore.entries_restored, 32);
    assert_eq!(env.memory.entries(&target).len(), 32);
}

#[tokio::test]
async fn test_wrong_bind_password_fails_backup() {
    let env = TestEnv::new().await;
    let mut source = env.memory.add_directory(BASE_DN, people(2));
    source.bind_password = Some("wrong".to_string());

    let server = env.add_server("source", &source).await;

    let backup = env
        .shared
        .backup_engine
        .run_backup(full(server.id), None)
        .await
        .unwrap();

    assert_eq!(backup.status, "failed");
    assert!(
        backup
            .error_message
            .as_deref()
            .is_some_and(|m| m.starts_with("ConnectorAuthFailed"))
    );
    assert_eq!(env.memory.connect_attempts(), 1);
}
