mod common;

use chrono::{Duration, Utc};
use common::{BASE_DN, TestEnv, people};
use ldapguard::db::ScheduledBackup;
use ldapguard::db::repositories::audit::AuditFilter;
use ldapguard::db::repositories::ldap_server::LdapServerUpdate;
use ldapguard::db::repositories::schedule::NewSchedule;
use ldapguard::domain::events::JobEvent;
use ldapguard::domain::{BackupType, JobStatus};
use ldapguard::entities::{backups, prelude::Backups};
use ldapguard::services::{BackupRequest, DeletionActor, RetentionError, ScheduleError};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, sea_query::Expr};

fn full(server_id: i32) -> BackupRequest {
    BackupRequest {
        ldap_server_id: server_id,
        backup_type: BackupType::Full,
        encrypted: false,
        compression_enabled: true,
        scheduled_backup_id: None,
    }
}

async fn backdate(env: &TestEnv, backup_id: i32, age: Duration) {
    let at = Utc::now() - age;
    Backups::update_many()
        .col_expr(backups::Column::CreatedAt, Expr::value(at))
        .col_expr(backups::Column::StartedAt, Expr::value(Some(at)))
        .col_expr(backups::Column::CompletedAt, Expr::value(Some(at)))
        .filter(backups::Column::Id.eq(backup_id))
        .exec(&env.shared.store.conn)
        .await
        .unwrap();
}

async fn nightly(
    env: &TestEnv,
    server_id: i32,
    next_run_at: chrono::DateTime<Utc>,
) -> ScheduledBackup {
    env.shared
        .store
        .schedules()
        .create(NewSchedule {
            name: "nightly".to_string(),
            ldap_server_id: server_id,
            backup_type: "full".to_string(),
            cron_expression: "0 2 * * *".to_string(),
            retention_days: 7,
            encrypted: false,
            compression_enabled: true,
            is_active: true,
            next_run_at: Some(next_run_at),
            created_by: None,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_retention_keeps_backups_inside_window() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(2));
    let server = env.add_server("source", &source).await;

    let mut old = Vec::new();
    for i in 0..10 {
        let backup = env
            .shared
            .backup_engine
            .run_backup(full(server.id), None)
            .await
            .unwrap();
        backdate(&env, backup.id, Duration::days(30) - Duration::hours(i)).await;
        old.push(backup);
    }
    let fresh = env
        .shared
        .backup_engine
        .run_backup(full(server.id), None)
        .await
        .unwrap();

    let deleted = env.shared.retention.enforce(server.id, 7).await.unwrap();
    assert_eq!(deleted, 10);

    let left = env
        .shared
        .store
        .backups()
        .completed_for_server(server.id)
        .await
        .unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, fresh.id);

    for backup in &old {
        let path = backup.file_path.as_deref().unwrap();
        assert!(!std::path::Path::new(path).exists());
    }
    assert!(std::path::Path::new(fresh.file_path.as_deref().unwrap()).exists());

    // A second pass finds nothing more to do.
    assert_eq!(env.shared.retention.enforce(server.id, 7).await.unwrap(), 0);

    let expired = env
        .shared
        .store
        .list_audit(
            &AuditFilter {
                action: Some("backup.expired".to_string()),
                ..AuditFilter::default()
            },
            0,
            100,
        )
        .await
        .unwrap();
    assert_eq!(expired.len(), 10);
}

#[tokio::test]
async fn test_retention_keeps_newest_even_when_expired() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(1));
    let server = env.add_server("source", &source).await;

    for i in 0..3 {
        let backup = env
            .shared
            .backup_engine
            .run_backup(full(server.id), None)
            .await
            .unwrap();
        backdate(&env, backup.id, Duration::days(60) - Duration::days(i)).await;
    }

    assert_eq!(env.shared.retention.enforce(server.id, 7).await.unwrap(), 2);
    assert_eq!(
        env.shared
            .store
            .backups()
            .count_completed_for_server(server.id)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_sweep_uses_schedule_retention() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(1));
    let server = env.add_server("source", &source).await;
    nightly(&env, server.id, Utc::now() + Duration::hours(1)).await;

    for age in [20, 10, 0] {
        let backup = env
            .shared
            .backup_engine
            .run_backup(full(server.id), None)
            .await
            .unwrap();
        backdate(&env, backup.id, Duration::days(age)).await;
    }

    assert_eq!(env.shared.retention.sweep().await.unwrap(), 2);
    assert_eq!(env.shared.retention.sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn test_last_backup_of_scheduled_server_cannot_be_deleted() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(1));
    let server = env.add_server("source", &source).await;
    nightly(&env, server.id, Utc::now() + Duration::hours(1)).await;

    let backup = env
        .shared
        .backup_engine
        .run_backup(full(server.id), None)
        .await
        .unwrap();

    let refused = env
        .shared
        .retention
        .delete_backup(backup.id, &DeletionActor::default())
        .await;
    assert!(matches!(refused, Err(RetentionError::RetentionViolation(_))));

    let second = env
        .shared
        .backup_engine
        .run_backup(full(server.id), None)
        .await
        .unwrap();
    let deleted = env
        .shared
        .retention
        .delete_backup(backup.id, &DeletionActor::default())
        .await
        .unwrap();
    assert_eq!(deleted.id, backup.id);
    assert!(env.shared.store.backups().get(second.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_running_backup_cannot_be_deleted() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(1));
    let server = env.add_server("source", &source).await;

    let pending = env
        .shared
        .backup_engine
        .request(full(server.id), None)
        .await
        .unwrap();

    assert!(matches!(
        env.shared
            .retention
            .delete_backups(&[pending.id], &DeletionActor::default())
            .await,
        Err(RetentionError::Conflict(_))
    ));
}

#[tokio::test]
async fn test_tick_enqueues_due_schedule_and_advances_it() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(1));
    let server = env.add_server("source", &source).await;
    let now = Utc::now();
    let schedule = nightly(&env, server.id, now - Duration::minutes(1)).await;

    let summary = env.shared.schedule_runner.tick(now).await.unwrap();
    assert_eq!(summary.enqueued, 1);
    assert_eq!(summary.missed, 0);

    let stored = env
        .shared
        .store
        .schedules()
        .get(schedule.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        stored.last_run_at.map(|at| at.timestamp()),
        Some(now.timestamp())
    );
    assert!(stored.next_run_at.is_some_and(|next| next > now));

    // Not due again until the next fire time.
    let summary = env.shared.schedule_runner.tick(now).await.unwrap();
    assert_eq!(summary.enqueued, 0);
}

#[tokio::test]
async fn test_outstanding_run_is_recorded_as_missed() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(1));
    let server = env.add_server("source", &source).await;
    let now = Utc::now();
    let schedule = nightly(&env, server.id, now - Duration::minutes(1)).await;
    let mut events = env.shared.event_bus.subscribe();

    assert_eq!(env.shared.schedule_runner.tick(now).await.unwrap().enqueued, 1);

    let later = now + Duration::days(1);
    let summary = env.shared.schedule_runner.tick(later).await.unwrap();
    assert_eq!(summary.missed, 1);
    assert_eq!(summary.enqueued, 0);

    let mut saw_missed = false;
    while let Ok(event) = events.try_recv() {
        if let JobEvent::ScheduleMissedRun { schedule_id, .. } = event {
            assert_eq!(schedule_id, schedule.id);
            saw_missed = true;
        }
    }
    assert!(saw_missed);

    let audit = env
        .shared
        .store
        .list_audit(
            &AuditFilter {
                action: Some("schedule.missed_run".to_string()),
                ..AuditFilter::default()
            },
            0,
            10,
        )
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);

    assert!(matches!(
        env.shared.schedule_runner.run_now(schedule.id, None).await,
        Err(ScheduleError::Conflict(_))
    ));

    // Once the queued run finishes the schedule fires normally again.
    let pending = env
        .shared
        .ledger
        .pending_ids(ldapguard::domain::JobKind::Backup, 10)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    let finished = env.shared.backup_engine.run(pending[0]).await.unwrap();
    assert_eq!(finished.status, JobStatus::Completed.as_str());
    assert_eq!(finished.scheduled_backup_id, Some(schedule.id));

    let summary = env
        .shared
        .schedule_runner
        .tick(later + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(summary.enqueued, 1);
}

#[tokio::test]
async fn test_inactive_server_is_skipped() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(1));
    let server = env.add_server("source", &source).await;
    let now = Utc::now();
    let schedule = nightly(&env, server.id, now - Duration::minutes(1)).await;

    env.shared
        .store
        .ldap_servers()
        .update(
            server.id,
            LdapServerUpdate {
                is_active: Some(false),
                ..LdapServerUpdate::default()
            },
        )
        .await
        .unwrap();

    let summary = env.shared.schedule_runner.tick(now).await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.enqueued, 0);

    let stored = env
        .shared
        .store
        .schedules()
        .get(schedule.id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.next_run_at.is_some_and(|next| next > now));
}

#[tokio::test]
async fn test_batch_delete_stopping_halfway_audits_what_it_removed() {
    let env = TestEnv::new().await;
    let source = env.memory.add_directory(BASE_DN, people(1));
    let server = env.add_server("source", &source).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        let backup = env
            .shared
            .backup_engine
            .run_backup(full(server.id), None)
            .await
            .unwrap();
        ids.push(backup.id);
    }

    // A directory where the second artifact should be cannot be unlinked.
    let blocked = env
        .shared
        .store
        .backups()
        .get(ids[1])
        .await
        .unwrap()
        .unwrap()
        .file_path
        .unwrap();
    std::fs::remove_file(&blocked).unwrap();
    std::fs::create_dir(&blocked).unwrap();

    let actor = DeletionActor {
        user_id: Some(1),
        ..DeletionActor::default()
    };
    let result = env.shared.retention.delete_backups(&ids, &actor).await;
    assert!(matches!(result, Err(RetentionError::Internal(_))));

    let backups = env.shared.store.backups();
    assert!(backups.get(ids[0]).await.unwrap().is_none());
    assert!(backups.get(ids[1]).await.unwrap().is_some());
    assert!(backups.get(ids[2]).await.unwrap().is_some());

    let audit = env
        .shared
        .store
        .list_audit(
            &AuditFilter {
                action: Some("backup.deleted".to_string()),
                ..AuditFilter::default()
            },
            0,
            10,
        )
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].resource_id, Some(ids[0].to_string()));
    assert_eq!(audit[0].user_id, Some(1));
}
