mod common;

use common::{BASE_DN, TestEnv, people};
use ldapguard::db::repositories::ledger::NewBackupJob;
use ldapguard::domain::{JobKind, JobStatus};
use ldapguard::services::ledger::LedgerError;

async fn pending_backup(env: &TestEnv) -> i32 {
    let source = env.memory.add_directory(BASE_DN, people(1));
    let server = env.add_server(&format!("source-{}", source.port), &source).await;
    env.shared
        .ledger
        .create_backup(NewBackupJob {
            ldap_server_id: server.id,
            backup_type: "full".to_string(),
            encrypted: false,
            compression_enabled: false,
            scheduled_backup_id: None,
            created_by: None,
        })
        .await
        .unwrap()
        .id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_one_winner() {
    let env = TestEnv::new().await;

    for _ in 0..5 {
        let id = pending_backup(&env).await;

        let claims: Vec<_> = (0..8)
            .map(|_| {
                let ledger = env.shared.ledger.clone();
                tokio::spawn(async move { ledger.claim(JobKind::Backup, id).await })
            })
            .collect();

        let mut winners = 0;
        for claim in claims {
            if claim.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(
            env.shared.ledger.status(JobKind::Backup, id).await.unwrap(),
            JobStatus::InProgress
        );

        let transitions = env
            .shared
            .ledger
            .transitions(JobKind::Backup, id)
            .await
            .unwrap();
        let claimed = transitions
            .iter()
            .filter(|t| t.to_status == JobStatus::InProgress.as_str())
            .count();
        assert_eq!(claimed, 1);
    }
}

#[tokio::test]
async fn test_terminal_jobs_do_not_move() {
    let env = TestEnv::new().await;
    let id = pending_backup(&env).await;

    assert_eq!(
        env.shared.ledger.cancel(JobKind::Backup, id).await.unwrap(),
        JobStatus::Failed
    );
    assert!(!env.shared.ledger.claim(JobKind::Backup, id).await.unwrap());
    assert!(matches!(
        env.shared.ledger.cancel(JobKind::Backup, id).await,
        Err(LedgerError::InvalidTransition { .. })
    ));

    let backup = env.shared.ledger.get_backup(id).await.unwrap();
    assert_eq!(backup.status, "failed");
    assert_eq!(
        backup.error_message.as_deref(),
        Some("Cancelled: cancelled before start")
    );
}

#[tokio::test]
async fn test_stale_jobs_are_failed_on_recovery() {
    let env = TestEnv::new().await;
    let id = pending_backup(&env).await;
    assert!(env.shared.ledger.claim(JobKind::Backup, id).await.unwrap());
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let recovered = env
        .shared
        .ledger
        .recover_stale(chrono::Duration::zero())
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let backup = env.shared.ledger.get_backup(id).await.unwrap();
    assert_eq!(backup.status, "failed");
    assert!(backup.error_message.is_some());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let env = TestEnv::new().await;
    assert!(matches!(
        env.shared.ledger.status(JobKind::Restore, 999).await,
        Err(LedgerError::NotFound { .. })
    ));
}
