//! CLI command handlers.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::Path;

use anyhow::{Context, Result};
use conductor_core::{ConductorConfig, TaskType};
use conductor_orchestrator::backup::BackupJob;
use conductor_orchestrator::replication::{AllowedTasks, ReplicationStatus};
use conductor_orchestrator::tasks::{
    CreateBackupParams, EditReplicationParams, EditUniverseParams, NodeSpec,
    ReplicationConfigParams, RestoreBackupParams, SetupReplicationParams,
};
use conductor_orchestrator::{ControlPlane, NodeDetails, Universe};
use conductor_workflow::{TaskProgress, TaskStatus};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cli::{Commands, Scenario};

/// Execute a CLI command.
pub async fn execute_command(command: Commands) -> Result<()> {
    match command {
        Commands::AllowedTasks { status } => cmd_allowed_tasks(status.as_deref()),
        Commands::Config { file } => cmd_config(file.as_deref()),
        Commands::Simulate {
            scenario,
            config,
            faults,
        } => cmd_simulate(scenario, config.as_deref(), &faults).await,
    }
}

/// Load configuration from a file (or defaults), apply environment
/// overrides, and validate it.
fn load_config(path: Option<&Path>) -> Result<ConductorConfig> {
    let config = match path {
        Some(path) => ConductorConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ConductorConfig::default(),
    }
    .with_env_overrides();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn cmd_allowed_tasks(status: Option<&str>) -> Result<()> {
    let statuses = match status {
        Some(s) => vec![s.parse::<ReplicationStatus>()?],
        None => ReplicationStatus::ALL.to_vec(),
    };
    let table = AllowedTasks::standard();
    for status in statuses {
        let allowed = table.allowed_for(status).map_or_else(
            || "(any)".to_string(),
            |tasks| {
                tasks
                    .iter()
                    .map(TaskType::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            },
        );
        println!("{:<16} {allowed}", status.as_str());
    }
    Ok(())
}

fn cmd_config(file: Option<&Path>) -> Result<()> {
    let config = load_config(file)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn cmd_simulate(scenario: Scenario, config: Option<&Path>, faults: &[String]) -> Result<()> {
    let config = load_config(config)?;
    let (plane, sim) = ControlPlane::simulated(&config);
    for label in faults {
        sim.fail(label.clone()).await;
    }
    info!(?scenario, faults = faults.len(), "Running simulation");

    let mut run = ScenarioRun::new(plane);
    let outcome = match scenario {
        Scenario::EditUniverse => run.edit_universe().await,
        Scenario::Backup => run.backup().await,
        Scenario::Restore => run.restore().await,
        Scenario::Replication => run.replication().await,
    };
    if let Err(e) = &outcome {
        warn!(error = %e, "Scenario stopped early");
    }

    println!("{}", serde_json::to_string_pretty(&run.tasks)?);
    outcome.context("Scenario did not complete")
}

/// One scenario's control plane and the progress of every task it ran.
struct ScenarioRun {
    plane: ControlPlane,
    tasks: Vec<TaskProgress>,
}

impl ScenarioRun {
    fn new(plane: ControlPlane) -> Self {
        Self {
            plane,
            tasks: Vec::new(),
        }
    }

    async fn add_universe(&self, name: &str) -> Result<Universe> {
        let universe = Universe::new(
            name,
            vec![
                NodeDetails::new(format!("{name}-n1"), "az1").master(),
                NodeDetails::new(format!("{name}-n2"), "az2").master(),
                NodeDetails::new(format!("{name}-n3"), "az3").master(),
            ],
        );
        self.plane.services().universes.put(universe.clone()).await?;
        Ok(universe)
    }

    /// Run a task to completion; fails unless it succeeded.
    async fn run<P: Serialize + Sync>(&mut self, task_type: TaskType, params: &P) -> Result<TaskProgress> {
        let progress = self.plane.run(task_type, params).await?;
        self.tasks.push(progress.clone());
        if progress.status != TaskStatus::Success {
            anyhow::bail!(
                "{task_type} task {} ended {}: {}",
                progress.task_id,
                progress.status,
                progress.error_message.unwrap_or_default()
            );
        }
        Ok(progress)
    }

    async fn backup_of(&self, progress: &TaskProgress) -> Result<BackupJob> {
        self.plane
            .services()
            .backups
            .backups_for_task(progress.task_id.as_uuid())
            .await?
            .pop()
            .context("Backup task left no backup record")
    }

    async fn edit_universe(&mut self) -> Result<()> {
        let universe = self.add_universe("edit").await?;
        let spec = |name: &str| NodeSpec {
            name: name.to_string(),
            zone: "az1".to_string(),
            is_master: true,
        };
        let params = EditUniverseParams {
            universe: universe.uuid,
            expected_version: Some(universe.version),
            nodes: vec![spec("edit-n1"), spec("edit-n2"), spec("edit-n4")],
            disable_load_balancer: true,
        };
        self.run(TaskType::EditUniverse, &params).await?;
        Ok(())
    }

    async fn full_backup(&mut self, universe: Uuid) -> Result<BackupJob> {
        let params = CreateBackupParams {
            universe,
            keyspace: "orders".to_string(),
            location: "sim://backups".to_string(),
            base_backup: None,
            schedule: None,
        };
        let progress = self.run(TaskType::CreateBackup, &params).await?;
        self.backup_of(&progress).await
    }

    async fn backup(&mut self) -> Result<()> {
        let universe = self.add_universe("backup").await?;
        let full = self.full_backup(universe.uuid).await?;
        let params = CreateBackupParams {
            universe: universe.uuid,
            keyspace: full.keyspace.clone(),
            location: "sim://backups".to_string(),
            base_backup: Some(full.uuid),
            schedule: None,
        };
        self.run(TaskType::CreateBackup, &params).await?;
        Ok(())
    }

    async fn restore(&mut self) -> Result<()> {
        let source = self.add_universe("source").await?;
        let target = self.add_universe("target").await?;
        let backup = self.full_backup(source.uuid).await?;
        let params = RestoreBackupParams {
            backup: backup.uuid,
            universe: target.uuid,
            keyspace: None,
        };
        self.run(TaskType::RestoreBackup, &params).await?;
        Ok(())
    }

    async fn replication(&mut self) -> Result<()> {
        let source = self.add_universe("source").await?;
        let target = self.add_universe("target").await?;
        let setup = SetupReplicationParams {
            name: "source-to-target".to_string(),
            source: source.uuid,
            target: target.uuid,
            tables: vec!["orders".to_string(), "users".to_string()],
        };
        self.run(TaskType::SetupReplication, &setup).await?;

        let config = self
            .plane
            .services()
            .replication
            .configs_touching(source.uuid)
            .await?
            .into_iter()
            .next()
            .context("Setup left no replication config")?;

        let edit = EditReplicationParams {
            config: config.uuid,
            add_tables: vec!["payments".to_string()],
            remove_tables: vec!["users".to_string()],
            paused: None,
        };
        self.run(TaskType::EditReplication, &edit).await?;
        self.run(
            TaskType::DeleteReplication,
            &ReplicationConfigParams { config: config.uuid },
        )
        .await?;
        Ok(())
    }
}
