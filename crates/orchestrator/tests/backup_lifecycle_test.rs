//! Backup Lifecycle Tests - BDD Style
//!
//! Following BDD naming convention: given_<context>_when_<action>_then_<outcome>
//!
//! Every backup or restore job a task creates ends in a terminal state,
//! whatever happens to the task, and scheduled runs skip or submit
//! according to the universe they target.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestResult, add_universe, fast_config, plane, universe};
use conductor_core::{ConductorConfig, Result, TaskType};
use conductor_orchestrator::backup::{
    BackupJob, BackupState, RestoreState, Schedule, ScheduleOutcome, SkipReason,
};
use conductor_orchestrator::tasks::{CreateBackupParams, RestoreBackupParams};
use conductor_orchestrator::{ControlPlane, ExpectedVersion, SimulatedCluster};
use conductor_workflow::{InMemoryTaskStore, TaskId, TaskStatus};
use uuid::Uuid;

fn backup_of(universe: Uuid) -> CreateBackupParams {
    CreateBackupParams {
        universe,
        keyspace: "orders".into(),
        location: "sim://backups".into(),
        base_backup: None,
        schedule: None,
    }
}

async fn job_of(plane: &ControlPlane, task: TaskId) -> Result<BackupJob> {
    plane
        .services()
        .backups
        .backups_for_task(task.as_uuid())
        .await?
        .pop()
        .ok_or_else(|| conductor_core::Error::not_found("backup of task", task.to_string()))
}

fn slow_plane(latency: Duration, config: &ConductorConfig) -> (ControlPlane, SimulatedCluster) {
    let sim = SimulatedCluster::new().with_latency(latency);
    let plane = ControlPlane::simulated_with(config, &sim, Arc::new(InMemoryTaskStore::new()));
    (plane, sim)
}

// ============================================================================
// 1. CREATE BACKUP
// ============================================================================

#[tokio::test]
async fn given_healthy_cluster_when_backup_runs_then_job_completed_and_stored() -> TestResult {
    // GIVEN: A universe
    let (plane, sim) = plane();
    let record = add_universe(&plane, "u").await?;

    // WHEN: A full backup runs
    let id = plane.submit(TaskType::CreateBackup, &backup_of(record.uuid)).await?;
    let progress = plane.executor().wait_for_completion(id).await?;

    // THEN: The job is completed and its files exist
    assert_eq!(progress.status, TaskStatus::Success);
    let job = job_of(&plane, id).await?;
    assert_eq!(job.state, BackupState::Completed);
    assert_eq!(job.size_bytes, 4096);
    assert!(job.completed_at.is_some());
    assert!(sim.has_stored(&job.location).await);
    assert!(job.location.starts_with("sim://backups/"));

    // AND: The universe is unlocked and marked successful
    let after = universe(&plane, record.uuid).await?;
    assert!(!after.update_in_progress);
    assert!(after.update_succeeded);
    assert_eq!(after.version, record.version + 1);
    Ok(())
}

#[tokio::test]
async fn given_upload_fails_when_backup_runs_then_job_failed_and_unlocked() -> TestResult {
    // GIVEN: Uploads fail
    let (plane, sim) = plane();
    let record = add_universe(&plane, "u").await?;
    sim.fail("storage:upload").await;

    // WHEN: A backup runs
    let id = plane.submit(TaskType::CreateBackup, &backup_of(record.uuid)).await?;
    let progress = plane.executor().wait_for_completion(id).await?;

    // THEN: The task and its job both failed, and nothing is locked
    assert_eq!(progress.status, TaskStatus::Failure);
    let job = job_of(&plane, id).await?;
    assert_eq!(job.state, BackupState::Failed);
    assert!(!sim.has_stored(&job.location).await);
    assert!(!universe(&plane, record.uuid).await?.update_in_progress);
    Ok(())
}

#[tokio::test]
async fn given_running_backup_when_aborted_then_job_stopped() -> TestResult {
    // GIVEN: A slow cluster and a running backup
    let (plane, _sim) = slow_plane(Duration::from_millis(100), &fast_config());
    let record = add_universe(&plane, "u").await?;
    let id = plane.submit(TaskType::CreateBackup, &backup_of(record.uuid)).await?;
    tokio::time::sleep(Duration::from_millis(30)).await;

    // WHEN: It is aborted
    assert!(plane.executor().abort(id).await?);
    let progress = plane.executor().wait_for_completion(id).await?;

    // THEN: The job is stopped, not left in progress
    assert_eq!(progress.status, TaskStatus::Aborted);
    assert_eq!(job_of(&plane, id).await?.state, BackupState::Stopped);
    assert!(!universe(&plane, record.uuid).await?.update_in_progress);
    Ok(())
}

#[tokio::test]
async fn given_many_fault_points_when_backups_run_then_no_job_left_in_progress() -> TestResult {
    for label in ["rpc:create_snapshot", "storage:upload", "session:open"] {
        // GIVEN: One fault point
        let (plane, sim) = plane();
        let record = add_universe(&plane, "u").await?;
        sim.fail(label).await;

        // WHEN: A backup runs
        let id = plane.submit(TaskType::CreateBackup, &backup_of(record.uuid)).await?;
        plane.executor().wait_for_completion(id).await?;

        // THEN: Every job of the task is terminal
        for job in plane.services().backups.list_backups().await? {
            assert!(job.state.is_terminal(), "{label}: {:?}", job.state);
        }
        assert!(!universe(&plane, record.uuid).await?.update_in_progress, "{label}");
    }
    Ok(())
}

// ============================================================================
// 2. INCREMENTAL CHAINS
// ============================================================================

#[tokio::test]
async fn given_completed_full_backup_when_increment_completes_then_base_records_it() -> TestResult {
    // GIVEN: A completed full backup
    let (plane, _sim) = plane();
    let record = add_universe(&plane, "u").await?;
    let full = plane.submit(TaskType::CreateBackup, &backup_of(record.uuid)).await?;
    plane.executor().wait_for_completion(full).await?;
    let base = job_of(&plane, full).await?;
    assert!(base.last_increment_at.is_none());

    // WHEN: An incremental backup on top of it completes
    let params = CreateBackupParams {
        base_backup: Some(base.uuid),
        ..backup_of(record.uuid)
    };
    let increment = plane.submit(TaskType::CreateBackup, &params).await?;
    let progress = plane.executor().wait_for_completion(increment).await?;

    // THEN: The base carries the completion time of the increment
    assert_eq!(progress.status, TaskStatus::Success);
    let increment = job_of(&plane, increment).await?;
    assert!(increment.is_incremental());
    let base = plane
        .services()
        .backups
        .get_backup(base.uuid)
        .await?
        .ok_or("base backup missing")?;
    assert_eq!(base.last_increment_at, increment.completed_at);
    Ok(())
}

#[tokio::test]
async fn given_failed_base_when_increment_submitted_then_rejected() -> TestResult {
    // GIVEN: A failed full backup
    let (plane, sim) = plane();
    let record = add_universe(&plane, "u").await?;
    sim.fail_times("storage:upload", 1).await;
    let full = plane.submit(TaskType::CreateBackup, &backup_of(record.uuid)).await?;
    plane.executor().wait_for_completion(full).await?;
    let base = job_of(&plane, full).await?;

    // WHEN: An increment on top of it is submitted
    let params = CreateBackupParams {
        base_backup: Some(base.uuid),
        ..backup_of(record.uuid)
    };
    let result = plane.submit(TaskType::CreateBackup, &params).await;

    // THEN: Admission refuses it
    assert!(result.is_err_and(|e| e.is_fatal()));
    Ok(())
}

// ============================================================================
// 3. RESTORE
// ============================================================================

async fn completed_backup(plane: &ControlPlane, universe: Uuid) -> Result<BackupJob> {
    let id = plane.submit(TaskType::CreateBackup, &backup_of(universe)).await?;
    plane.executor().wait_for_completion(id).await?;
    job_of(plane, id).await
}

#[tokio::test]
async fn given_completed_backup_when_restored_then_restore_completed() -> TestResult {
    // GIVEN: A completed backup of one universe and a second universe
    let (plane, sim) = plane();
    let source = add_universe(&plane, "source").await?;
    let target = add_universe(&plane, "target").await?;
    let backup = completed_backup(&plane, source.uuid).await?;

    // WHEN: It is restored into the second universe
    let params = RestoreBackupParams {
        backup: backup.uuid,
        universe: target.uuid,
        keyspace: Some("orders_copy".into()),
    };
    let progress = plane.run(TaskType::RestoreBackup, &params).await?;

    // THEN: The restore completed and the target is healthy again
    assert_eq!(progress.status, TaskStatus::Success);
    let restores = plane.services().backups.list_restores().await?;
    assert_eq!(restores.len(), 1);
    assert_eq!(restores[0].state, RestoreState::Completed);
    assert_eq!(restores[0].backup, backup.uuid);
    assert!(sim.load_balancer_enabled(target.uuid).await);
    assert_eq!(sim.calls("rpc:restore_snapshot").await, 1);
    assert!(!universe(&plane, target.uuid).await?.update_in_progress);
    Ok(())
}

#[tokio::test]
async fn given_download_fails_when_restoring_then_restore_failed_and_balancer_on() -> TestResult {
    // GIVEN: Downloads fail
    let (plane, sim) = plane();
    let record = add_universe(&plane, "u").await?;
    let backup = completed_backup(&plane, record.uuid).await?;
    sim.fail("storage:download").await;

    // WHEN: A restore runs
    let params = RestoreBackupParams {
        backup: backup.uuid,
        universe: record.uuid,
        keyspace: None,
    };
    let progress = plane.run(TaskType::RestoreBackup, &params).await?;

    // THEN: The restore failed and the load balancer was turned back on
    assert_eq!(progress.status, TaskStatus::Failure);
    let restores = plane.services().backups.list_restores().await?;
    assert_eq!(restores[0].state, RestoreState::Failed);
    assert!(sim.load_balancer_enabled(record.uuid).await);
    assert!(!universe(&plane, record.uuid).await?.update_in_progress);
    Ok(())
}

#[tokio::test]
async fn given_running_restore_when_aborted_then_restore_aborted() -> TestResult {
    // GIVEN: A completed backup and a slow restore
    let (plane, _sim) = slow_plane(Duration::from_millis(60), &fast_config());
    let record = add_universe(&plane, "u").await?;
    let backup = completed_backup(&plane, record.uuid).await?;
    let params = RestoreBackupParams {
        backup: backup.uuid,
        universe: record.uuid,
        keyspace: None,
    };
    let id = plane.submit(TaskType::RestoreBackup, &params).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // WHEN: It is aborted
    plane.executor().abort(id).await?;
    let progress = plane.executor().wait_for_completion(id).await?;

    // THEN: The restore record is aborted
    assert_eq!(progress.status, TaskStatus::Aborted);
    let restores = plane.services().backups.list_restores().await?;
    assert_eq!(restores[0].state, RestoreState::Aborted);
    assert!(!universe(&plane, record.uuid).await?.update_in_progress);
    Ok(())
}

#[tokio::test]
async fn given_failed_backup_when_restore_submitted_then_rejected() -> TestResult {
    let (plane, sim) = plane();
    let record = add_universe(&plane, "u").await?;
    sim.fail("storage:upload").await;
    let id = plane.submit(TaskType::CreateBackup, &backup_of(record.uuid)).await?;
    plane.executor().wait_for_completion(id).await?;
    let failed = job_of(&plane, id).await?;

    let params = RestoreBackupParams {
        backup: failed.uuid,
        universe: record.uuid,
        keyspace: None,
    };
    assert!(plane.submit(TaskType::RestoreBackup, &params).await.is_err());
    Ok(())
}

// ============================================================================
// 4. SCHEDULES
// ============================================================================

async fn add_schedule(plane: &ControlPlane, schedule: Schedule) -> Result<Uuid> {
    let uuid = schedule.uuid;
    plane.services().backups.put_schedule(schedule).await?;
    Ok(uuid)
}

async fn schedule(plane: &ControlPlane, uuid: Uuid) -> Result<Schedule> {
    plane
        .services()
        .backups
        .get_schedule(uuid)
        .await?
        .ok_or_else(|| conductor_core::Error::not_found("schedule", uuid.to_string()))
}

#[tokio::test]
async fn given_idle_universe_when_schedule_runs_then_backup_submitted() -> TestResult {
    // GIVEN: A schedule on an idle universe
    let (plane, _sim) = plane();
    let record = add_universe(&plane, "u").await?;
    let uuid = add_schedule(&plane, Schedule::new(record.uuid, "orders", "sim://nightly")).await?;

    // WHEN: It runs
    let outcome = plane.scheduler().run_scheduled_backup(uuid).await?;

    // THEN: A backup task was submitted and recorded on the schedule
    let ScheduleOutcome::Submitted(task) = outcome else {
        return Err(format!("unexpected outcome {outcome:?}").into());
    };
    let stored = schedule(&plane, uuid).await?;
    assert_eq!(stored.active_task, Some(task));
    assert!(stored.last_run_at.is_some());
    assert!(!stored.backlog);

    let progress = plane.executor().wait_for_completion(task).await?;
    assert_eq!(progress.status, TaskStatus::Success);
    let job = job_of(&plane, task).await?;
    assert_eq!(job.schedule, Some(uuid));
    assert!(job.location.starts_with("sim://nightly/"));
    Ok(())
}

#[tokio::test]
async fn given_previous_run_active_when_schedule_runs_then_skipped_with_backlog() -> TestResult {
    // GIVEN: A slow cluster and a scheduled run still in flight
    let (plane, _sim) = slow_plane(Duration::from_millis(50), &fast_config());
    let record = add_universe(&plane, "u").await?;
    let uuid = add_schedule(&plane, Schedule::new(record.uuid, "orders", "sim://nightly")).await?;
    let first = plane.scheduler().run_scheduled_backup(uuid).await?;

    // WHEN: The schedule fires again
    let second = plane.scheduler().run_scheduled_backup(uuid).await?;

    // THEN: The second run is skipped and remembered
    assert_eq!(second, ScheduleOutcome::Skipped(SkipReason::PreviousRunActive));
    assert!(schedule(&plane, uuid).await?.backlog);

    // AND: Once the first run is done, the next run clears the backlog
    if let ScheduleOutcome::Submitted(task) = first {
        plane.executor().wait_for_completion(task).await?;
    }
    let third = plane.scheduler().run_scheduled_backup(uuid).await?;
    assert!(matches!(third, ScheduleOutcome::Submitted(_)));
    assert!(!schedule(&plane, uuid).await?.backlog);
    Ok(())
}

#[tokio::test]
async fn given_paused_universe_when_schedule_runs_then_skipped_without_backlog() -> TestResult {
    let (plane, _sim) = plane();
    let mut record = add_universe(&plane, "u").await?;
    record.paused = true;
    plane.services().universes.put(record.clone()).await?;
    let uuid = add_schedule(&plane, Schedule::new(record.uuid, "orders", "sim://nightly")).await?;

    let outcome = plane.scheduler().run_scheduled_backup(uuid).await?;

    assert_eq!(outcome, ScheduleOutcome::Skipped(SkipReason::UniversePaused));
    assert!(!schedule(&plane, uuid).await?.backlog);
    Ok(())
}

#[tokio::test]
async fn given_locked_universe_when_schedule_runs_then_skipped_with_backlog() -> TestResult {
    let (plane, _sim) = plane();
    let record = add_universe(&plane, "u").await?;
    plane
        .services()
        .lock
        .acquire(record.uuid, ExpectedVersion::Any)
        .await?;
    let uuid = add_schedule(&plane, Schedule::new(record.uuid, "orders", "sim://nightly")).await?;

    let outcome = plane.scheduler().run_scheduled_backup(uuid).await?;

    assert_eq!(outcome, ScheduleOutcome::Skipped(SkipReason::UniverseLocked));
    assert!(schedule(&plane, uuid).await?.backlog);
    assert!(plane.services().backups.list_backups().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn given_backups_disabled_when_schedule_runs_then_skipped() -> TestResult {
    let (plane, _sim) = plane();
    let mut record = add_universe(&plane, "u").await?;
    record.backups_enabled = false;
    plane.services().universes.put(record.clone()).await?;
    let uuid = add_schedule(&plane, Schedule::new(record.uuid, "orders", "sim://nightly")).await?;

    let outcome = plane.scheduler().run_scheduled_backup(uuid).await?;

    assert_eq!(outcome, ScheduleOutcome::Skipped(SkipReason::BackupsDisabled));
    assert!(!schedule(&plane, uuid).await?.backlog);
    Ok(())
}

#[tokio::test]
async fn given_scheduling_disabled_when_schedule_runs_then_nothing_submitted() -> TestResult {
    let mut config = fast_config();
    config.backup.scheduled_enabled = false;
    let (plane, _sim) = ControlPlane::simulated(&config);
    let record = add_universe(&plane, "u").await?;
    let uuid = add_schedule(&plane, Schedule::new(record.uuid, "orders", "sim://nightly")).await?;

    let outcome = plane.scheduler().run_scheduled_backup(uuid).await?;

    assert_eq!(outcome, ScheduleOutcome::Skipped(SkipReason::Disabled));
    assert!(plane.services().backups.list_backups().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn given_universe_deleted_when_schedule_runs_then_schedule_removed() -> TestResult {
    let (plane, _sim) = plane();
    let record = add_universe(&plane, "u").await?;
    let uuid = add_schedule(&plane, Schedule::new(record.uuid, "orders", "sim://nightly")).await?;
    plane.services().universes.remove(record.uuid).await?;

    let outcome = plane.scheduler().run_scheduled_backup(uuid).await?;

    assert_eq!(outcome, ScheduleOutcome::ScheduleDeleted);
    assert!(plane.services().backups.get_schedule(uuid).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn given_incremental_schedule_when_run_twice_then_second_increments_first() -> TestResult {
    // GIVEN: An incremental schedule with no full backup yet
    let (plane, _sim) = plane();
    let record = add_universe(&plane, "u").await?;
    let uuid = add_schedule(
        &plane,
        Schedule::new(record.uuid, "orders", "sim://nightly").incremental(),
    )
    .await?;

    // WHEN: It runs twice
    let ScheduleOutcome::Submitted(first) = plane.scheduler().run_scheduled_backup(uuid).await?
    else {
        return Err("first run not submitted".into());
    };
    plane.executor().wait_for_completion(first).await?;
    let ScheduleOutcome::Submitted(second) = plane.scheduler().run_scheduled_backup(uuid).await?
    else {
        return Err("second run not submitted".into());
    };
    plane.executor().wait_for_completion(second).await?;

    // THEN: The first was a full backup and the second builds on it
    let full = job_of(&plane, first).await?;
    let increment = job_of(&plane, second).await?;
    assert!(!full.is_incremental());
    assert_eq!(increment.base_backup, Some(full.uuid));
    assert_eq!(increment.state, BackupState::Completed);
    Ok(())
}

#[tokio::test]
async fn given_several_schedules_when_run_all_then_each_reported() -> TestResult {
    let (plane, _sim) = plane();
    let healthy = add_universe(&plane, "healthy").await?;
    let gone = add_universe(&plane, "gone").await?;
    add_schedule(&plane, Schedule::new(healthy.uuid, "orders", "sim://nightly")).await?;
    add_schedule(&plane, Schedule::new(gone.uuid, "orders", "sim://nightly")).await?;
    plane.services().universes.remove(gone.uuid).await?;

    let outcomes = plane.scheduler().run_all().await?;

    assert_eq!(outcomes.len(), 2);
    let deleted = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, Ok(ScheduleOutcome::ScheduleDeleted)))
        .count();
    let submitted = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, Ok(ScheduleOutcome::Submitted(_))))
        .count();
    assert_eq!((deleted, submitted), (1, 1));
    Ok(())
}
