//! Reusable steps the task bodies assemble into groups.

use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::Result;
use conductor_workflow::{Step, StepContext};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::capability::{
    ClusterClientProvider, ClusterRpc, NodeOperationKind, NodeOperations, with_cluster_client,
};
use crate::resource::{ResourceStore, Universe};

/// Run one node operation.
pub struct NodeOperationStep {
    name: String,
    nodes: Arc<dyn NodeOperations>,
    universe: Uuid,
    node: String,
    kind: NodeOperationKind,
    args: Value,
}

impl NodeOperationStep {
    /// Build a shared step for `kind` on `node`.
    pub fn shared(
        nodes: &Arc<dyn NodeOperations>,
        universe: Uuid,
        node: impl Into<String>,
        kind: NodeOperationKind,
        args: Value,
    ) -> Arc<dyn Step> {
        let node = node.into();
        Arc::new(Self {
            name: format!("{kind}:{node}"),
            nodes: Arc::clone(nodes),
            universe,
            node,
            kind,
            args,
        })
    }
}

#[async_trait]
impl Step for NodeOperationStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        ctx.check_cancelled()?;
        let output = self
            .nodes
            .execute(self.universe, &self.node, self.kind, self.args.clone())
            .await?;
        debug!(task_id = %ctx.task_id, node = %self.node, kind = %self.kind, %output, "Node operation done");
        Ok(())
    }
}

/// Issue one RPC through a scoped cluster session.
pub struct ClusterRpcStep {
    name: String,
    clusters: Arc<dyn ClusterClientProvider>,
    universe: Uuid,
    rpc: ClusterRpc,
}

impl ClusterRpcStep {
    /// Build a shared step issuing `rpc` against `universe`.
    pub fn shared(
        clusters: &Arc<dyn ClusterClientProvider>,
        universe: Uuid,
        rpc: ClusterRpc,
    ) -> Arc<dyn Step> {
        Arc::new(Self {
            name: rpc.label().to_string(),
            clusters: Arc::clone(clusters),
            universe,
            rpc,
        })
    }
}

#[async_trait]
impl Step for ClusterRpcStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        ctx.check_cancelled()?;
        let rpc = self.rpc.clone();
        with_cluster_client(self.clusters.as_ref(), self.universe, |session| async move {
            session.call(rpc).await
        })
        .await?;
        Ok(())
    }
}

/// Cluster conditions a step can wait on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCondition {
    /// A master leader is elected.
    MasterLeader,
    /// Every listed tablet server heartbeats.
    TServersHeartbeating(Vec<String>),
    /// Data movement after a topology change has finished.
    DataMoved,
}

impl ClusterCondition {
    fn label(&self) -> &'static str {
        match self {
            Self::MasterLeader => "master leader elected",
            Self::TServersHeartbeating(_) => "tservers heartbeating",
            Self::DataMoved => "data movement complete",
        }
    }

    fn readiness_rpc(&self) -> ClusterRpc {
        match self {
            Self::MasterLeader => ClusterRpc::MasterLeader,
            Self::TServersHeartbeating(_) => ClusterRpc::TServerHeartbeats,
            Self::DataMoved => ClusterRpc::DataMoveProgress,
        }
    }

    fn is_met(&self, reply: &Value) -> bool {
        match self {
            Self::MasterLeader => reply.as_str().is_some_and(|leader| !leader.is_empty()),
            Self::TServersHeartbeating(expected) => {
                let live: Vec<&str> = reply
                    .as_array()
                    .map(|names| names.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                expected.iter().all(|name| live.contains(&name.as_str()))
            }
            Self::DataMoved => reply.as_f64().is_some_and(|percent| percent >= 100.0),
        }
    }
}

/// Bounded, abortable wait on a cluster condition.
pub struct WaitForClusterStep {
    clusters: Arc<dyn ClusterClientProvider>,
    universe: Uuid,
    condition: ClusterCondition,
}

impl WaitForClusterStep {
    /// Build a shared waiting step.
    pub fn shared(
        clusters: &Arc<dyn ClusterClientProvider>,
        universe: Uuid,
        condition: ClusterCondition,
    ) -> Arc<dyn Step> {
        Arc::new(Self {
            clusters: Arc::clone(clusters),
            universe,
            condition,
        })
    }

    async fn poll_ready(&self) -> Result<bool> {
        let rpc = self.condition.readiness_rpc();
        let reply = with_cluster_client(self.clusters.as_ref(), self.universe, |session| async move {
            session.call(rpc).await
        })
        .await?;
        Ok(self.condition.is_met(&reply))
    }
}

#[async_trait]
impl Step for WaitForClusterStep {
    fn name(&self) -> &str {
        self.condition.label()
    }

    async fn run(&self, ctx: &StepContext) -> Result<()> {
        ctx.wait_for(self.condition.label(), || self.poll_ready()).await
    }
}

/// Mutation applied by [`UniverseUpdateStep`].
pub type SharedUniverseUpdate = Arc<dyn Fn(&mut Universe) + Send + Sync>;

/// Apply a mutation to a universe this task holds the lock of.
pub struct UniverseUpdateStep {
    name: String,
    universes: Arc<dyn ResourceStore>,
    universe: Uuid,
    update: SharedUniverseUpdate,
}

impl UniverseUpdateStep {
    /// Build a shared update step.
    pub fn shared(
        name: impl Into<String>,
        universes: &Arc<dyn ResourceStore>,
        universe: Uuid,
        update: impl Fn(&mut Universe) + Send + Sync + 'static,
    ) -> Arc<dyn Step> {
        Arc::new(Self {
            name: name.into(),
            universes: Arc::clone(universes),
            universe,
            update: Arc::new(update),
        })
    }
}

#[async_trait]
impl Step for UniverseUpdateStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &StepContext) -> Result<()> {
        let update = Arc::clone(&self.update);
        self.universes
            .update_locked(self.universe, Box::new(move |u| update(u)))
            .await?;
        Ok(())
    }
}

/// The last step of every successful mutation.
pub fn mark_update_success(universes: &Arc<dyn ResourceStore>, universe: Uuid) -> Arc<dyn Step> {
    UniverseUpdateStep::shared("mark_update_success", universes, universe, |u| {
        u.update_succeeded = true;
    })
}
