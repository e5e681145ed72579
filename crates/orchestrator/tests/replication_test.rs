//! Replication tasks against the simulated cluster: setup, edit, restart
//! and delete, the status gate, and the connected-universe sweep of delete.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{TestResult, add_universe, fast_config, plane, universe};
use conductor_core::{Error, Result, TaskType};
use conductor_orchestrator::{ControlPlane, ExpectedVersion};
use conductor_orchestrator::replication::{
    AllowedTasks, ReplicationConfig, ReplicationStatus, TableStatus,
};
use conductor_orchestrator::tasks::{
    EditReplicationParams, ReplicationConfigParams, SetupReplicationParams,
};
use conductor_workflow::{InMemoryTaskStore, TaskRecord, TaskStatus, TaskStore};
use proptest::prelude::*;
use uuid::Uuid;

const REPLICATION_TASKS: [TaskType; 4] = [
    TaskType::SetupReplication,
    TaskType::EditReplication,
    TaskType::RestartReplication,
    TaskType::DeleteReplication,
];

fn setup_params(source: Uuid, target: Uuid, tables: &[&str]) -> SetupReplicationParams {
    SetupReplicationParams {
        name: format!("{source}->{target}"),
        source,
        target,
        tables: tables.iter().map(ToString::to_string).collect(),
    }
}

async fn setup(plane: &ControlPlane, source: Uuid, target: Uuid, tables: &[&str]) -> Result<ReplicationConfig> {
    let progress = plane
        .run(TaskType::SetupReplication, &setup_params(source, target, tables))
        .await?;
    if progress.status != TaskStatus::Success {
        return Err(Error::step_failure(
            "setup",
            progress.error_message.unwrap_or_default(),
        ));
    }
    plane
        .services()
        .replication
        .configs_touching(source)
        .await?
        .into_iter()
        .find(|c| c.target == target)
        .ok_or_else(|| Error::not_found("replication config", format!("{source}->{target}")))
}

async fn config(plane: &ControlPlane, uuid: Uuid) -> Result<ReplicationConfig> {
    plane
        .services()
        .replication
        .get(uuid)
        .await?
        .ok_or_else(|| Error::not_found("replication config", uuid.to_string()))
}

fn tables(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(ToString::to_string).collect()
}

// ============================================================================
// SETUP
// ============================================================================

#[tokio::test]
async fn test_setup_replication_runs_streams() -> TestResult {
    let (plane, sim) = plane();
    let source = add_universe(&plane, "source").await?;
    let target = add_universe(&plane, "target").await?;

    let created = setup(&plane, source.uuid, target.uuid, &["orders", "users"]).await?;

    assert_eq!(created.status, ReplicationStatus::Running);
    assert!(created.tables.values().all(|s| *s == TableStatus::Running));
    assert_eq!(
        sim.replicated_tables(created.uuid).await,
        Some(tables(&["orders", "users"]))
    );
    for side in [source.uuid, target.uuid] {
        let after = universe(&plane, side).await?;
        assert!(!after.update_in_progress);
        assert!(after.update_succeeded);
        assert_eq!(after.version, 2);
    }
    assert_eq!(sim.open_sessions(), 0);
    Ok(())
}

#[tokio::test]
async fn test_setup_to_self_rejected() -> TestResult {
    let (plane, _sim) = plane();
    let source = add_universe(&plane, "source").await?;

    let result = plane
        .submit(
            TaskType::SetupReplication,
            &setup_params(source.uuid, source.uuid, &["orders"]),
        )
        .await;

    assert!(result.is_err_and(|e| e.is_fatal()));
    Ok(())
}

#[tokio::test]
async fn test_failed_setup_marks_config_and_tables_failed() -> TestResult {
    let (plane, sim) = plane();
    let source = add_universe(&plane, "source").await?;
    let target = add_universe(&plane, "target").await?;
    sim.fail("rpc:setup_replication").await;

    let progress = plane
        .run(
            TaskType::SetupReplication,
            &setup_params(source.uuid, target.uuid, &["orders"]),
        )
        .await?;

    assert_eq!(progress.status, TaskStatus::Failure);
    let configs = plane.services().replication.list().await?;
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].status, ReplicationStatus::Failed);
    assert_eq!(configs[0].tables.get("orders"), Some(&TableStatus::Failed));
    for side in [source.uuid, target.uuid] {
        let after = universe(&plane, side).await?;
        assert!(!after.update_in_progress);
        assert!(after.last_error.is_some());
    }
    Ok(())
}

#[tokio::test]
async fn test_setup_against_busy_universe_stores_nothing() -> TestResult {
    let (plane, _sim) = plane();
    let source = add_universe(&plane, "source").await?;
    let target = add_universe(&plane, "target").await?;
    plane
        .services()
        .lock
        .acquire(target.uuid, ExpectedVersion::Any)
        .await?;

    let progress = plane
        .run(
            TaskType::SetupReplication,
            &setup_params(source.uuid, target.uuid, &["orders"]),
        )
        .await?;

    assert_eq!(progress.status, TaskStatus::Failure);
    assert!(
        progress
            .error_message
            .is_some_and(|m| m.contains("already being updated"))
    );
    assert!(plane.services().replication.list().await?.is_empty());
    assert!(!universe(&plane, source.uuid).await?.update_in_progress);

    plane.services().lock.release(target.uuid, None).await?;
    let created = setup(&plane, source.uuid, target.uuid, &["orders"]).await?;
    assert_eq!(created.status, ReplicationStatus::Running);
    assert_eq!(plane.services().replication.list().await?.len(), 1);
    Ok(())
}

// ============================================================================
// EDIT AND RESTART
// ============================================================================

#[tokio::test]
async fn test_edit_replication_tables_and_pause() -> TestResult {
    let (plane, sim) = plane();
    let source = add_universe(&plane, "source").await?;
    let target = add_universe(&plane, "target").await?;
    let created = setup(&plane, source.uuid, target.uuid, &["orders", "users"]).await?;

    let params = EditReplicationParams {
        config: created.uuid,
        add_tables: vec!["payments".into()],
        remove_tables: vec!["users".into()],
        paused: Some(true),
    };
    let progress = plane.run(TaskType::EditReplication, &params).await?;

    assert_eq!(progress.status, TaskStatus::Success);
    let edited = config(&plane, created.uuid).await?;
    assert_eq!(edited.status, ReplicationStatus::Running);
    assert!(edited.paused);
    assert_eq!(
        edited.tables.keys().cloned().collect::<BTreeSet<_>>(),
        tables(&["orders", "payments"])
    );
    assert!(edited.tables.values().all(|s| *s == TableStatus::Running));
    assert_eq!(
        sim.replicated_tables(created.uuid).await,
        Some(tables(&["orders", "payments"]))
    );
    Ok(())
}

#[tokio::test]
async fn test_edit_of_unknown_table_rejected() -> TestResult {
    let (plane, _sim) = plane();
    let source = add_universe(&plane, "source").await?;
    let target = add_universe(&plane, "target").await?;
    let created = setup(&plane, source.uuid, target.uuid, &["orders"]).await?;

    let params = EditReplicationParams {
        config: created.uuid,
        remove_tables: vec!["missing".into()],
        ..EditReplicationParams::default()
    };
    let result = plane.submit(TaskType::EditReplication, &params).await;

    assert!(matches!(result, Err(Error::NotFound { .. })));
    Ok(())
}

#[tokio::test]
async fn test_restart_recovers_failed_config() -> TestResult {
    let (plane, sim) = plane();
    let source = add_universe(&plane, "source").await?;
    let target = add_universe(&plane, "target").await?;
    sim.fail_times("rpc:setup_replication", 1).await;
    plane
        .run(
            TaskType::SetupReplication,
            &setup_params(source.uuid, target.uuid, &["orders"]),
        )
        .await?;
    let failed = plane
        .services()
        .replication
        .list()
        .await?
        .pop()
        .ok_or("config missing")?;
    assert_eq!(failed.status, ReplicationStatus::Failed);

    // Edit is not allowed on a failed config, restart is.
    let edit = EditReplicationParams {
        config: failed.uuid,
        paused: Some(true),
        ..EditReplicationParams::default()
    };
    assert!(matches!(
        plane.submit(TaskType::EditReplication, &edit).await,
        Err(Error::TaskNotAllowed { .. })
    ));
    let progress = plane
        .run(
            TaskType::RestartReplication,
            &ReplicationConfigParams { config: failed.uuid },
        )
        .await?;

    assert_eq!(progress.status, TaskStatus::Success);
    let restarted = config(&plane, failed.uuid).await?;
    assert_eq!(restarted.status, ReplicationStatus::Running);
    assert_eq!(restarted.tables.get("orders"), Some(&TableStatus::Running));
    assert_eq!(sim.replicated_tables(failed.uuid).await, Some(tables(&["orders"])));
    Ok(())
}

// ============================================================================
// DELETE
// ============================================================================

#[tokio::test]
async fn test_delete_promotes_flags_on_connected_universes() -> TestResult {
    let (plane, sim) = plane();
    let a = add_universe(&plane, "a").await?.uuid;
    let b = add_universe(&plane, "b").await?.uuid;
    let c = add_universe(&plane, "c").await?.uuid;
    let d = add_universe(&plane, "d").await?.uuid;
    let unrelated = add_universe(&plane, "unrelated").await?.uuid;
    let ab = setup(&plane, a, b, &["orders"]).await?;
    setup(&plane, b, c, &["orders"]).await?;
    setup(&plane, c, d, &["orders"]).await?;

    let progress = plane
        .run(
            TaskType::DeleteReplication,
            &ReplicationConfigParams { config: ab.uuid },
        )
        .await?;

    assert_eq!(progress.status, TaskStatus::Success);
    assert!(plane.services().replication.get(ab.uuid).await?.is_none());
    assert_eq!(sim.replicated_tables(ab.uuid).await, None);
    // a and b, plus c and d reachable through the remaining configs
    assert_eq!(sim.calls("rpc:promote_auto_flags").await, 4);
    for uuid in [a, b, c, d, unrelated] {
        assert!(!universe(&plane, uuid).await?.update_in_progress);
    }
    assert_eq!(universe(&plane, unrelated).await?.version, 1);
    Ok(())
}

#[tokio::test]
async fn test_delete_with_deleted_universe_ignores_stream_errors() -> TestResult {
    let (plane, sim) = plane();
    let source = add_universe(&plane, "source").await?;
    let target = add_universe(&plane, "target").await?;
    let mut orphaned = ReplicationConfig::new("orphaned", source.uuid, target.uuid, vec!["orders".into()]);
    orphaned.status = ReplicationStatus::DeletedUniverse;
    plane.services().replication.put(orphaned.clone()).await?;
    plane.services().universes.remove(target.uuid).await?;
    sim.fail("rpc:delete_replication").await;

    let progress = plane
        .run(
            TaskType::DeleteReplication,
            &ReplicationConfigParams { config: orphaned.uuid },
        )
        .await?;

    assert_eq!(progress.status, TaskStatus::Success);
    assert!(plane.services().replication.get(orphaned.uuid).await?.is_none());
    assert_eq!(sim.calls("rpc:delete_replication").await, 1);
    let after = universe(&plane, source.uuid).await?;
    assert!(!after.update_in_progress);
    assert!(after.update_succeeded);
    Ok(())
}

#[tokio::test]
async fn test_failed_delete_leaves_only_delete_allowed() -> TestResult {
    let (plane, sim) = plane();
    let source = add_universe(&plane, "source").await?;
    let target = add_universe(&plane, "target").await?;
    let created = setup(&plane, source.uuid, target.uuid, &["orders"]).await?;
    sim.fail("rpc:promote_auto_flags").await;

    let params = ReplicationConfigParams { config: created.uuid };
    let failed = plane.run(TaskType::DeleteReplication, &params).await?;

    assert_eq!(failed.status, TaskStatus::Failure);
    assert_eq!(
        config(&plane, created.uuid).await?.status,
        ReplicationStatus::DeletionFailed
    );
    for side in [source.uuid, target.uuid] {
        assert!(!universe(&plane, side).await?.update_in_progress);
    }
    assert!(matches!(
        plane.submit(TaskType::RestartReplication, &params).await,
        Err(Error::TaskNotAllowed { .. })
    ));

    sim.clear_all().await;
    let deleted = plane.run(TaskType::DeleteReplication, &params).await?;
    assert_eq!(deleted.status, TaskStatus::Success);
    assert!(plane.services().replication.get(created.uuid).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_delete_resumed_after_every_group_finished_succeeds() -> TestResult {
    let (plane, sim) = plane();
    let source = add_universe(&plane, "source").await?;
    let target = add_universe(&plane, "target").await?;
    let created = setup(&plane, source.uuid, target.uuid, &["orders"]).await?;
    let params = ReplicationConfigParams { config: created.uuid };
    let id = plane.submit(TaskType::DeleteReplication, &params).await?;
    assert_eq!(plane.executor().wait_for_completion(id).await?.status, TaskStatus::Success);

    // The process died after the last group was recorded but before the
    // task itself was marked finished.
    let mut record = plane
        .executor()
        .store()
        .load_task(id)
        .await?
        .ok_or_else(|| Error::not_found("task", id.to_string()))?;
    record.status = TaskStatus::Running;
    let tasks = Arc::new(InMemoryTaskStore::new());
    tasks.create_task(&record).await?;
    let restarted = ControlPlane::new(plane.services().clone(), tasks, &fast_config());

    assert_eq!(restarted.recover().await?, vec![id]);
    let resumed = restarted.executor().wait_for_completion(id).await?;

    assert_eq!(resumed.status, TaskStatus::Success, "{:?}", resumed.error_message);
    assert!(plane.services().replication.get(created.uuid).await?.is_none());
    // recorded groups were skipped
    assert_eq!(sim.calls("rpc:promote_auto_flags").await, 2);
    assert_eq!(sim.calls("rpc:delete_replication").await, 1);
    for side in [source.uuid, target.uuid] {
        assert!(!universe(&plane, side).await?.update_in_progress);
    }
    Ok(())
}

#[tokio::test]
async fn test_delete_resumed_without_recorded_plan_after_config_removed() -> TestResult {
    let (plane, _sim) = plane();
    let source = add_universe(&plane, "source").await?;
    let target = add_universe(&plane, "target").await?;
    let created = setup(&plane, source.uuid, target.uuid, &["orders"]).await?;
    let params = ReplicationConfigParams { config: created.uuid };
    let deleted = plane.run(TaskType::DeleteReplication, &params).await?;
    assert_eq!(deleted.status, TaskStatus::Success);

    let mut record = TaskRecord::new(
        TaskType::DeleteReplication,
        serde_json::to_value(params)?,
        vec![created.uuid],
    );
    record.status = TaskStatus::Running;
    record.attempt = 1;
    plane.executor().store().create_task(&record).await?;

    assert_eq!(plane.recover().await?, vec![record.id]);
    let resumed = plane.executor().wait_for_completion(record.id).await?;

    assert_eq!(resumed.status, TaskStatus::Success);
    for side in [source.uuid, target.uuid] {
        assert!(!universe(&plane, side).await?.update_in_progress);
    }
    Ok(())
}

// ============================================================================
// GATING
// ============================================================================

/// The allowed-task table as documented for operators.
fn documented_allowed(status: ReplicationStatus, task: TaskType) -> bool {
    use ReplicationStatus as S;
    use TaskType as T;
    match status {
        S::Initialized => matches!(task, T::SetupReplication | T::DeleteReplication | T::RestartReplication),
        S::Running => matches!(task, T::EditReplication | T::DeleteReplication | T::RestartReplication),
        S::Updating | S::Failed => matches!(task, T::DeleteReplication | T::RestartReplication),
        S::DeletionFailed | S::DeletedUniverse => task == T::DeleteReplication,
    }
}

/// Submit `task` against a config in `status`; report whether it was admitted.
async fn admitted(status: ReplicationStatus, task: TaskType) -> Result<bool> {
    let (plane, _sim) = plane();
    let source = add_universe(&plane, "source").await?;
    let target = add_universe(&plane, "target").await?;
    let mut stored = ReplicationConfig::new("gated", source.uuid, target.uuid, vec!["orders".into()]);
    stored.status = status;
    plane.services().replication.put(stored.clone()).await?;

    let by_config = ReplicationConfigParams { config: stored.uuid };
    let result = match task {
        TaskType::SetupReplication => {
            plane
                .submit(task, &setup_params(source.uuid, target.uuid, &["orders"]))
                .await
        }
        TaskType::EditReplication => {
            let params = EditReplicationParams {
                config: stored.uuid,
                paused: Some(true),
                ..EditReplicationParams::default()
            };
            plane.submit(task, &params).await
        }
        _ => plane.submit(task, &by_config).await,
    };
    match result {
        Ok(_) => Ok(true),
        Err(Error::TaskNotAllowed { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

#[tokio::test]
async fn test_admission_matches_table_for_every_pair() -> TestResult {
    for status in ReplicationStatus::ALL {
        for task in REPLICATION_TASKS {
            assert_eq!(
                admitted(status, task).await?,
                documented_allowed(status, task),
                "{task} in {status}"
            );
        }
    }
    Ok(())
}

#[test]
fn test_unmapped_status_fails_open() {
    // Fail-open is deliberate: a status missing from the table admits
    // every task and only logs a warning.
    let partial = AllowedTasks::from_entries([(ReplicationStatus::Running, vec![TaskType::EditReplication])]);
    let mut updating = ReplicationConfig::new("c", Uuid::new_v4(), Uuid::new_v4(), Vec::new());
    updating.status = ReplicationStatus::Updating;

    assert!(partial.allowed_for(ReplicationStatus::Updating).is_none());
    for task in REPLICATION_TASKS {
        assert!(partial.is_task_allowed(&updating, task));
    }
}

proptest! {
    /// Property: the shared table admits exactly the documented pairs, and
    /// `check` agrees with `is_task_allowed`.
    #[test]
    fn prop_standard_table_matches_documentation(
        status_index in 0usize..ReplicationStatus::ALL.len(),
        task_index in 0usize..TaskType::ALL.len(),
    ) {
        let status = ReplicationStatus::ALL[status_index];
        let task = TaskType::ALL[task_index];
        let allowed = AllowedTasks::standard();
        let mut stored = ReplicationConfig::new("c", Uuid::new_v4(), Uuid::new_v4(), Vec::new());
        stored.status = status;

        let expected = documented_allowed(status, task);
        prop_assert_eq!(allowed.is_task_allowed(&stored, task), expected);
        prop_assert_eq!(allowed.check(&stored, task).is_ok(), expected);
    }

    /// Property: removing a status from the table makes it admit everything.
    #[test]
    fn prop_removed_status_fails_open(
        missing_index in 0usize..ReplicationStatus::ALL.len(),
        task_index in 0usize..TaskType::ALL.len(),
    ) {
        let missing = ReplicationStatus::ALL[missing_index];
        let entries = ReplicationStatus::ALL
            .into_iter()
            .filter(|s| *s != missing)
            .map(|s| {
                let tasks = TaskType::ALL
                    .into_iter()
                    .filter(|t| documented_allowed(s, *t))
                    .collect();
                (s, tasks)
            });
        let table = AllowedTasks::from_entries(entries);
        let mut stored = ReplicationConfig::new("c", Uuid::new_v4(), Uuid::new_v4(), Vec::new());
        stored.status = missing;

        prop_assert!(table.is_task_allowed(&stored, TaskType::ALL[task_index]));
    }
}
