//! # Orchestrator
//!
//! Universe locking and the cluster-mutation task bodies of the Conductor
//! control plane: universe edits, backups and restores, and cross-universe
//! replication.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

pub use conductor_core::{Error, Result};

/// Backup and restore jobs, their store, and backup schedules
pub mod backup;

/// Node, cluster-session and backup-storage capabilities
pub mod capability;

/// Stores, executor and scheduler wired together
pub mod control_plane;

/// Version-checked universe locks
pub mod lock;

/// Replication configs, status gating and the replication graph
pub mod replication;

/// Universe records and their store
pub mod resource;

/// In-process simulated cluster with fault injection
pub mod sim;

/// Task bodies and the task registry
pub mod tasks;

pub use control_plane::ControlPlane;
pub use lock::{LockSet, ResourceLock};
pub use resource::{
    ExpectedVersion, InMemoryResourceStore, NodeDetails, NodeState, ResourceStore, Universe,
};
pub use sim::SimulatedCluster;
pub use tasks::{Services, task_registry};
