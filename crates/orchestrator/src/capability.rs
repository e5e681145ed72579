//! Narrow interfaces to the collaborators the engine drives.
//!
//! Node provisioning, database RPCs and backup storage are opaque to the
//! task bodies: they only see success, failure and, for a few calls, a JSON
//! payload.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Operations the node-operation capability understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOperationKind {
    /// Create the instance and install software.
    Provision,
    /// Write process configuration.
    Configure,
    /// Start a process (`args.process` is `master` or `tserver`).
    StartProcess,
    /// Stop a process (`args.process` is `master` or `tserver`).
    StopProcess,
    /// Release the instance.
    Remove,
}

impl NodeOperationKind {
    /// Stable label used in step names and fault plans.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Configure => "configure",
            Self::StartProcess => "start_process",
            Self::StopProcess => "stop_process",
            Self::Remove => "remove",
        }
    }
}

impl std::fmt::Display for NodeOperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executes an operation against one node.
#[async_trait]
pub trait NodeOperations: Send + Sync {
    /// Run `kind` on `node` of `universe`.
    async fn execute(
        &self,
        universe: Uuid,
        node: &str,
        kind: NodeOperationKind,
        args: Value,
    ) -> Result<Value>;
}

/// RPCs issued through a cluster session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rpc", rename_all = "snake_case")]
pub enum ClusterRpc {
    /// Name of the current master leader, or null during election.
    MasterLeader,
    /// Names of tablet servers currently heartbeating.
    TServerHeartbeats,
    /// Percentage of data movement completed after a topology change.
    DataMoveProgress,
    /// Enable or disable the tablet load balancer.
    SetLoadBalancer { enabled: bool },
    /// Create the replication streams of a config on the target cluster.
    SetupReplication { config: Uuid, source: Uuid, tables: Vec<String> },
    /// Add or remove tables of an existing replication.
    AlterReplication {
        config: Uuid,
        add_tables: Vec<String>,
        remove_tables: Vec<String>,
    },
    /// Pause or resume the replication streams.
    SetReplicationPaused { config: Uuid, paused: bool },
    /// Drop the replication streams of a config.
    DeleteReplication { config: Uuid },
    /// Promote auto flags held back while replication was configured.
    PromoteAutoFlags,
    /// Create a consistent snapshot of a keyspace for a backup.
    CreateSnapshot { backup: Uuid, keyspace: String },
    /// Load a downloaded backup into a keyspace.
    RestoreSnapshot { backup: Uuid, keyspace: String },
}

impl ClusterRpc {
    /// Stable label used in step names and fault plans.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::MasterLeader => "master_leader",
            Self::TServerHeartbeats => "tserver_heartbeats",
            Self::DataMoveProgress => "data_move_progress",
            Self::SetLoadBalancer { .. } => "set_load_balancer",
            Self::SetupReplication { .. } => "setup_replication",
            Self::AlterReplication { .. } => "alter_replication",
            Self::SetReplicationPaused { .. } => "set_replication_paused",
            Self::DeleteReplication { .. } => "delete_replication",
            Self::PromoteAutoFlags => "promote_auto_flags",
            Self::CreateSnapshot { .. } => "create_snapshot",
            Self::RestoreSnapshot { .. } => "restore_snapshot",
        }
    }
}

/// An open session to a live cluster.
#[async_trait]
pub trait ClusterSession: Send + Sync {
    /// Issue one RPC.
    async fn call(&self, rpc: ClusterRpc) -> Result<Value>;
}

/// Hands out cluster sessions.
#[async_trait]
pub trait ClusterClientProvider: Send + Sync {
    /// Open a session to a universe.
    async fn open(&self, universe: Uuid) -> Result<Arc<dyn ClusterSession>>;

    /// Return a session. Must not block; called from drop paths.
    fn close(&self, universe: Uuid);
}

struct SessionGuard<'a> {
    provider: &'a dyn ClusterClientProvider,
    universe: Uuid,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.provider.close(self.universe);
    }
}

/// Run `f` with a session to `universe`.
///
/// The session is returned on every exit path: success, error, panic
/// unwinding, and the future being dropped on cancellation.
pub async fn with_cluster_client<T, F, Fut>(
    provider: &dyn ClusterClientProvider,
    universe: Uuid,
    f: F,
) -> Result<T>
where
    F: FnOnce(Arc<dyn ClusterSession>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let session = provider.open(universe).await?;
    let _guard = SessionGuard { provider, universe };
    f(session).await
}

/// Opaque backup storage backend.
#[async_trait]
pub trait BackupStorage: Send + Sync {
    /// Upload the snapshot of `backup` to `location`. Returns bytes written.
    async fn upload(&self, universe: Uuid, backup: Uuid, location: &str) -> Result<u64>;

    /// Download the backup stored at `location` into `universe`.
    async fn download(&self, universe: Uuid, backup: Uuid, location: &str) -> Result<()>;

    /// Delete the backup files at `location`.
    async fn delete(&self, location: &str) -> Result<()>;
}
