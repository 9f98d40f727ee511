//! Sync engine integration: inbound creates, overwrite rules, the
//! conflict law, resolution in both directions, deletions, outbound
//! pushes, and the errored-task retry floor.

mod common;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use common::{harness, seed_credential, t0, HarnessOptions};
use dayflow::cancel::CancelSignal;
use dayflow::connectors::RemoteTask;
use dayflow::error::CoreError;
use dayflow::store::Store;
use dayflow::sync::ConflictChoice;
use dayflow::types::{Priority, SyncStatus, TaskDraft, TaskFlags, TaskSource, UserId};

fn remote(external_id: &str, title: &str, updated_at: DateTime<Utc>) -> RemoteTask {
    RemoteTask {
        external_id: external_id.to_owned(),
        title: title.to_owned(),
        description: None,
        due: Some(t0() + Duration::hours(3)),
        completed: false,
        updated_at,
        deleted: false,
    }
}

/// Seed a local task that mirrors a remote item, as the ingest path
/// would have created it.
async fn seed_local(store: &Store, user: &UserId, external_id: &str, title: &str) -> String {
    let draft = TaskDraft {
        title: title.to_owned(),
        description: None,
        start: t0() + Duration::hours(3),
        end: t0() + Duration::hours(4),
        attendees: vec![],
        location: None,
        recurrence: None,
        priority: Priority::Normal,
        is_critical: false,
        is_urgent: false,
        is_spam: false,
        spam_reason: None,
        spam_score: None,
        raw_payload: json!({}),
        external_id: Some(external_id.to_owned()),
        external_updated_at: Some(t0()),
    };
    let (id, _) = store
        .upsert_ingested_task(user, TaskSource::TaskManager, &draft, t0())
        .await
        .expect("seed local");
    id
}

#[tokio::test]
async fn unknown_remote_items_create_local_tasks() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_credential(&h.store, "u1", dayflow::types::Provider::TaskManager).await;
    h.task_manager
        .seed(remote("x1", "Buy groceries", t0() + Duration::minutes(5)));

    let report = h
        .core
        .sync_task_manager(&user, &CancelSignal::never())
        .await
        .expect("sync");
    assert_eq!(report.created_inbound, 1);

    let tasks = h.core.list_tasks(&user, None, None).await.expect("list");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "Buy groceries");
    assert_eq!(tasks[0].source, TaskSource::TaskManager);
    assert_eq!(tasks[0].sync_status, SyncStatus::Synced);
    assert!(tasks[0].last_synced_at.is_some());
}

#[tokio::test]
async fn locally_unchanged_task_is_overwritten_by_remote() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_credential(&h.store, "u1", dayflow::types::Provider::TaskManager).await;
    let local_id = seed_local(&h.store, &user, "x1", "Old title").await;

    // Remote mutated after the local row's last_synced_at.
    h.clock.advance(std::time::Duration::from_secs(600));
    h.task_manager
        .seed(remote("x1", "New title", t0() + Duration::minutes(5)));

    let report = h
        .core
        .sync_task_manager(&user, &CancelSignal::never())
        .await
        .expect("sync");
    assert_eq!(report.overwritten_local, 1);
    assert_eq!(report.conflicts_found, 0);

    let task = h.store.task(&user, &local_id).await.expect("ok").expect("task");
    assert_eq!(task.title, "New title");
    assert_eq!(task.sync_status, SyncStatus::Synced);
}

/// The conflict law: both sides changed since last sync ⇒ exactly
/// `conflict`, neither side overwritten.
#[tokio::test]
async fn concurrent_edits_become_conflict() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_credential(&h.store, "u1", dayflow::types::Provider::TaskManager).await;
    let local_id = seed_local(&h.store, &user, "x1", "Original").await;

    // Local edit at t0 + 10m.
    h.clock.advance(std::time::Duration::from_secs(600));
    h.core
        .update_task_flags(
            &user,
            &local_id,
            TaskFlags {
                is_critical: Some(true),
                ..TaskFlags::default()
            },
        )
        .await
        .expect("local edit");

    // Remote edit at t0 + 20m.
    h.task_manager
        .seed(remote("x1", "Remote rename", t0() + Duration::minutes(20)));

    let report = h
        .core
        .sync_task_manager(&user, &CancelSignal::never())
        .await
        .expect("sync");
    assert_eq!(report.conflicts_found, 1);

    let task = h.store.task(&user, &local_id).await.expect("ok").expect("task");
    assert_eq!(task.sync_status, SyncStatus::Conflict);
    assert_eq!(task.title, "Original", "conflict overwrites neither side");
    assert!(task.is_critical, "local edit preserved");
    assert!(
        task.external_updated_at > task.last_synced_at,
        "conflict implies a newer remote mutation"
    );

    let summary = h.core.sync_status(&user).await.expect("status");
    assert_eq!(summary.sync_status, SyncStatus::Conflict);
    assert_eq!(summary.conflicts_count, 1);
}

/// Scenario: local title A vs remote title B; resolve local; provider
/// ends up with A and the task returns to synced.
#[tokio::test]
async fn resolve_local_pushes_local_state_outward() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_credential(&h.store, "u1", dayflow::types::Provider::TaskManager).await;
    let local_id = seed_local(&h.store, &user, "x1", "A").await;
    // Seed the provider-side copy the engine will update.
    h.task_manager.seed(remote("x1", "B", t0()));

    // Local rename to stay "A" via flag edit (content edit marker).
    h.clock.advance(std::time::Duration::from_secs(600));
    h.core
        .update_task_flags(
            &user,
            &local_id,
            TaskFlags {
                is_urgent: Some(true),
                ..TaskFlags::default()
            },
        )
        .await
        .expect("local edit");

    // Remote rename to B, newer than last sync.
    {
        let mut remote_tasks = h.task_manager.remote.lock().expect("lock");
        let item = remote_tasks.iter_mut().find(|t| t.external_id == "x1").expect("seeded");
        item.title = "B".to_owned();
        item.updated_at = t0() + Duration::minutes(20);
    }

    h.core
        .sync_task_manager(&user, &CancelSignal::never())
        .await
        .expect("sync detects conflict");
    let task = h.store.task(&user, &local_id).await.expect("ok").expect("task");
    assert_eq!(task.sync_status, SyncStatus::Conflict);

    let before_last_synced = task.last_synced_at;
    h.clock.advance(std::time::Duration::from_secs(60));
    let resolved = h
        .core
        .resolve_conflict(&user, &local_id, ConflictChoice::Local, &CancelSignal::never())
        .await
        .expect("resolve local");
    assert_eq!(resolved.sync_status, SyncStatus::Synced);
    assert!(resolved.last_synced_at > before_last_synced, "last_synced_at advanced");
    assert!(resolved.sync_error.is_none());

    let provider_side = h.task_manager.remote_by_id("x1").expect("remote");
    assert_eq!(provider_side.title, "A", "provider now matches local");

    // The next cycle is a no-op for this task.
    let report = h
        .core
        .sync_task_manager(&user, &CancelSignal::never())
        .await
        .expect("follow-up sync");
    assert_eq!(report.conflicts_found, 0);
    let task = h.store.task(&user, &local_id).await.expect("ok").expect("task");
    assert_eq!(task.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn resolve_external_applies_stored_remote_version() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_credential(&h.store, "u1", dayflow::types::Provider::TaskManager).await;
    let local_id = seed_local(&h.store, &user, "x1", "Local title").await;

    h.clock.advance(std::time::Duration::from_secs(600));
    h.core
        .update_task_flags(
            &user,
            &local_id,
            TaskFlags {
                is_critical: Some(true),
                ..TaskFlags::default()
            },
        )
        .await
        .expect("local edit");
    h.task_manager
        .seed(remote("x1", "Remote title", t0() + Duration::minutes(20)));

    h.core
        .sync_task_manager(&user, &CancelSignal::never())
        .await
        .expect("sync");

    let resolved = h
        .core
        .resolve_conflict(&user, &local_id, ConflictChoice::External, &CancelSignal::never())
        .await
        .expect("resolve external");
    assert_eq!(resolved.sync_status, SyncStatus::Synced);
    assert_eq!(resolved.title, "Remote title", "remote version applied");
}

#[tokio::test]
async fn remote_deletion_completes_local_task() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_credential(&h.store, "u1", dayflow::types::Provider::TaskManager).await;
    let local_id = seed_local(&h.store, &user, "x1", "Doomed").await;

    let mut tombstone = remote("x1", "Doomed", t0() + Duration::minutes(5));
    tombstone.deleted = true;
    h.task_manager.seed(tombstone);

    let report = h
        .core
        .sync_task_manager(&user, &CancelSignal::never())
        .await
        .expect("sync");
    assert_eq!(report.completed_by_remote_delete, 1);

    let task = h.store.task(&user, &local_id).await.expect("ok").expect("task");
    assert!(task.is_completed, "deletion maps to completion, never hard-delete");
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn local_completion_pushes_remote_done_state() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_credential(&h.store, "u1", dayflow::types::Provider::TaskManager).await;
    let local_id = seed_local(&h.store, &user, "x1", "Finish me").await;
    h.task_manager.seed(remote("x1", "Finish me", t0()));

    h.clock.advance(std::time::Duration::from_secs(600));
    h.core
        .update_task_flags(
            &user,
            &local_id,
            TaskFlags {
                is_completed: Some(true),
                ..TaskFlags::default()
            },
        )
        .await
        .expect("complete locally");

    let report = h
        .core
        .sync_task_manager(&user, &CancelSignal::never())
        .await
        .expect("sync");
    assert_eq!(report.pushed, 1);

    let provider_side = h.task_manager.remote_by_id("x1").expect("remote");
    assert!(provider_side.completed, "provider item moved to done");
}

#[tokio::test]
async fn push_failure_marks_error_and_respects_retry_floor() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_credential(&h.store, "u1", dayflow::types::Provider::TaskManager).await;
    let local_id = seed_local(&h.store, &user, "x1", "Unlucky").await;
    h.task_manager.seed(remote("x1", "Unlucky", t0()));

    h.clock.advance(std::time::Duration::from_secs(600));
    h.core
        .update_task_flags(
            &user,
            &local_id,
            TaskFlags {
                is_urgent: Some(true),
                ..TaskFlags::default()
            },
        )
        .await
        .expect("local edit");

    // Provider rejects writes.
    h.task_manager.set_failure(Some(400));
    let report = h
        .core
        .sync_task_manager(&user, &CancelSignal::never())
        .await
        .expect("cycle completes despite push failure");
    assert_eq!(report.push_errors, 1);

    let task = h.store.task(&user, &local_id).await.expect("ok").expect("task");
    assert_eq!(task.sync_status, SyncStatus::Error);
    assert!(task.sync_error.is_some());
    assert_eq!(task.sync_attempts, 1);

    // Within the 5-minute floor the errored task is not retried.
    h.task_manager.set_failure(None);
    h.clock.advance(std::time::Duration::from_secs(60));
    let report = h
        .core
        .sync_task_manager(&user, &CancelSignal::never())
        .await
        .expect("cycle");
    assert_eq!(report.pushed, 0, "below the retry floor");

    // Past the floor it retries and recovers.
    h.clock.advance(std::time::Duration::from_secs(300));
    let report = h
        .core
        .sync_task_manager(&user, &CancelSignal::never())
        .await
        .expect("cycle");
    assert_eq!(report.pushed, 1, "floor elapsed, push retried");

    let task = h.store.task(&user, &local_id).await.expect("ok").expect("task");
    assert_eq!(task.sync_status, SyncStatus::Synced);
    assert!(task.sync_error.is_none());
    assert_eq!(task.sync_attempts, 0, "success resets the attempt counter");
}

#[tokio::test]
async fn duplicate_sync_cycle_is_busy() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_credential(&h.store, "u1", dayflow::types::Provider::TaskManager).await;

    // Throttle the first cycle's change feed so the second overlaps.
    h.task_manager.set_changes_failure(Some(429));
    let first_cancel = CancelSignal::never();
    let first = h.core.sync_task_manager(&user, &first_cancel);
    let second = async {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        h.core.sync_task_manager(&user, &CancelSignal::never()).await
    };
    let (first_result, second_result) = tokio::join!(first, second);
    assert!(
        matches!(second_result, Err(CoreError::Busy(_))),
        "overlapping cycle must be rejected"
    );
    // The throttled first cycle surfaces RateLimited after its retries.
    assert!(matches!(
        first_result,
        Err(CoreError::RateLimited(_))
    ));
}

#[tokio::test]
async fn status_summary_reflects_connection_and_counts() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");

    let summary = h.core.sync_status(&user).await.expect("status");
    assert!(!summary.connected, "no credential means disconnected");

    seed_credential(&h.store, "u1", dayflow::types::Provider::TaskManager).await;
    seed_local(&h.store, &user, "x1", "One").await;

    let summary = h.core.sync_status(&user).await.expect("status");
    assert!(summary.connected);
    assert_eq!(summary.sync_status, SyncStatus::Synced);
    assert_eq!(summary.status_counts.get("synced"), Some(&1));
    assert_eq!(summary.conflicts_count, 0);
    assert_eq!(summary.errors_count, 0);
}

#[tokio::test]
async fn missing_credential_is_auth_required() {
    let h = harness(HarnessOptions::default()).await;
    let err = h
        .core
        .sync_task_manager(&UserId::from("u1"), &CancelSignal::never())
        .await
        .expect_err("no credential");
    assert!(matches!(err, CoreError::AuthRequired(_)));
}
