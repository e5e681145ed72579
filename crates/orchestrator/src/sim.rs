//! In-process stand-ins for the external collaborators.
//!
//! [`SimulatedCluster`] implements node operations, cluster sessions and
//! backup storage against a small in-memory model, with fault injection by
//! label:
//!
//! - `node:<kind>` and `node:<kind>:<node>` (e.g. `node:provision:n4`)
//! - `rpc:<label>` (e.g. `rpc:setup_replication`)
//! - `storage:upload`, `storage:download`, `storage:delete`
//!
//! A stalled RPC label keeps its readiness check from ever reporting ready, which is
//! how waits are driven into timeouts or aborts.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::{Error, Result};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::capability::{
    BackupStorage, ClusterClientProvider, ClusterRpc, ClusterSession, NodeOperationKind,
    NodeOperations,
};

#[derive(Debug, Clone, Copy)]
enum Fault {
    Fail { remaining: Option<u32> },
    Stall,
}

#[derive(Default)]
struct ClusterModel {
    tservers: HashMap<Uuid, BTreeSet<String>>,
    masters: HashMap<Uuid, BTreeSet<String>>,
    load_balancer_disabled: BTreeSet<Uuid>,
    streams: HashMap<Uuid, BTreeSet<String>>,
    paused_streams: BTreeSet<Uuid>,
    snapshots: BTreeSet<Uuid>,
    stored: HashMap<String, u64>,
}

#[derive(Default)]
struct SimState {
    faults: Mutex<HashMap<String, Fault>>,
    calls: Mutex<HashMap<String, usize>>,
    model: Mutex<ClusterModel>,
    open_sessions: AtomicUsize,
}

impl SimState {
    /// Record a call and apply any fault planned for `labels`.
    /// Returns `true` when the call is stalled.
    async fn enter(&self, labels: &[String]) -> Result<bool> {
        if let Some(primary) = labels.first() {
            *self.calls.lock().await.entry(primary.clone()).or_default() += 1;
        }

        let mut faults = self.faults.lock().await;
        for label in labels {
            match faults.get_mut(label) {
                Some(Fault::Stall) => return Ok(true),
                Some(Fault::Fail { remaining }) => {
                    match remaining {
                        Some(0) => continue,
                        Some(n) => *n -= 1,
                        None => {}
                    }
                    debug!(label, "Injected fault");
                    return Err(Error::step_failure(label.clone(), "injected fault"));
                }
                None => {}
            }
        }
        Ok(false)
    }
}

/// Simulated node operations, cluster RPCs and backup storage.
#[derive(Clone, Default)]
pub struct SimulatedCluster {
    state: Arc<SimState>,
    latency: Option<Duration>,
}

impl SimulatedCluster {
    /// Create a healthy simulated cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail every call matching `label` until cleared.
    pub async fn fail(&self, label: impl Into<String>) {
        self.state
            .faults
            .lock()
            .await
            .insert(label.into(), Fault::Fail { remaining: None });
    }

    /// Fail the next `times` calls matching `label`.
    pub async fn fail_times(&self, label: impl Into<String>, times: u32) {
        self.state.faults.lock().await.insert(
            label.into(),
            Fault::Fail {
                remaining: Some(times),
            },
        );
    }

    /// Keep the readiness RPC `label` from ever reporting ready.
    pub async fn stall(&self, label: impl Into<String>) {
        self.state.faults.lock().await.insert(label.into(), Fault::Stall);
    }

    /// Remove a planned fault.
    pub async fn clear(&self, label: &str) {
        self.state.faults.lock().await.remove(label);
    }

    /// Remove every planned fault.
    pub async fn clear_all(&self) {
        self.state.faults.lock().await.clear();
    }

    /// Number of calls recorded under `label`.
    pub async fn calls(&self, label: &str) -> usize {
        self.state.calls.lock().await.get(label).copied().unwrap_or(0)
    }

    /// Sessions opened and not yet closed.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }

    /// Tables currently replicated by a config's streams.
    pub async fn replicated_tables(&self, config: Uuid) -> Option<BTreeSet<String>> {
        self.state.model.lock().await.streams.get(&config).cloned()
    }

    /// Check whether the load balancer of a universe is enabled.
    pub async fn load_balancer_enabled(&self, universe: Uuid) -> bool {
        !self
            .state
            .model
            .lock()
            .await
            .load_balancer_disabled
            .contains(&universe)
    }

    /// Check whether backup files exist at `location`.
    pub async fn has_stored(&self, location: &str) -> bool {
        self.state.model.lock().await.stored.contains_key(location)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn process_of(args: &Value) -> &str {
    args.get("process").and_then(Value::as_str).unwrap_or("tserver")
}

#[async_trait]
impl NodeOperations for SimulatedCluster {
    async fn execute(
        &self,
        universe: Uuid,
        node: &str,
        kind: NodeOperationKind,
        args: Value,
    ) -> Result<Value> {
        self.delay().await;
        let labels = [format!("node:{kind}"), format!("node:{kind}:{node}")];
        self.state.enter(&labels).await?;

        let mut guard = self.state.model.lock().await;
        let model = &mut *guard;
        let process = process_of(&args);
        match kind {
            NodeOperationKind::StartProcess => {
                let set = if process == "master" { &mut model.masters } else { &mut model.tservers };
                set.entry(universe).or_default().insert(node.to_string());
            }
            NodeOperationKind::StopProcess => {
                let set = if process == "master" { &mut model.masters } else { &mut model.tservers };
                if let Some(nodes) = set.get_mut(&universe) {
                    nodes.remove(node);
                }
            }
            NodeOperationKind::Remove => {
                for set in [&mut model.masters, &mut model.tservers] {
                    if let Some(nodes) = set.get_mut(&universe) {
                        nodes.remove(node);
                    }
                }
            }
            NodeOperationKind::Provision | NodeOperationKind::Configure => {}
        }
        Ok(json!({ "node": node, "operation": kind.as_str() }))
    }
}

struct SimSession {
    cluster: SimulatedCluster,
    universe: Uuid,
}

#[async_trait]
impl ClusterSession for SimSession {
    async fn call(&self, rpc: ClusterRpc) -> Result<Value> {
        self.cluster.delay().await;
        let stalled = self.cluster.state.enter(&[format!("rpc:{}", rpc.label())]).await?;
        let mut model = self.cluster.state.model.lock().await;
        let universe = self.universe;

        let reply = match rpc {
            ClusterRpc::MasterLeader => {
                if stalled {
                    Value::Null
                } else {
                    let leader = model
                        .masters
                        .get(&universe)
                        .and_then(|m| m.iter().next().cloned())
                        .unwrap_or_else(|| "master-leader".to_string());
                    json!(leader)
                }
            }
            ClusterRpc::TServerHeartbeats => {
                if stalled {
                    json!([])
                } else {
                    json!(model.tservers.get(&universe).cloned().unwrap_or_default())
                }
            }
            ClusterRpc::DataMoveProgress => json!(if stalled { 0 } else { 100 }),
            ClusterRpc::SetLoadBalancer { enabled } => {
                if enabled {
                    model.load_balancer_disabled.remove(&universe);
                } else {
                    model.load_balancer_disabled.insert(universe);
                }
                json!({ "enabled": enabled })
            }
            ClusterRpc::SetupReplication { config, tables, .. } => {
                model.streams.insert(config, tables.into_iter().collect());
                json!({ "config": config })
            }
            ClusterRpc::AlterReplication {
                config,
                add_tables,
                remove_tables,
            } => {
                let streams = model
                    .streams
                    .get_mut(&config)
                    .ok_or_else(|| Error::step_failure("alter_replication", "no such replication"))?;
                streams.extend(add_tables);
                for table in &remove_tables {
                    streams.remove(table);
                }
                json!({ "tables": streams.len() })
            }
            ClusterRpc::SetReplicationPaused { config, paused } => {
                if paused {
                    model.paused_streams.insert(config);
                } else {
                    model.paused_streams.remove(&config);
                }
                json!({ "paused": paused })
            }
            ClusterRpc::DeleteReplication { config } => {
                let existed = model.streams.remove(&config).is_some();
                model.paused_streams.remove(&config);
                json!({ "deleted": existed })
            }
            ClusterRpc::PromoteAutoFlags => json!({ "promoted": true }),
            ClusterRpc::CreateSnapshot { backup, .. } => {
                model.snapshots.insert(backup);
                json!({ "snapshot": backup })
            }
            ClusterRpc::RestoreSnapshot { backup, .. } => json!({ "restored": backup }),
        };
        Ok(reply)
    }
}

#[async_trait]
impl ClusterClientProvider for SimulatedCluster {
    async fn open(&self, universe: Uuid) -> Result<Arc<dyn ClusterSession>> {
        self.state.enter(&["session:open".to_string()]).await?;
        self.state.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimSession {
            cluster: self.clone(),
            universe,
        }))
    }

    fn close(&self, _universe: Uuid) {
        self.state.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BackupStorage for SimulatedCluster {
    async fn upload(&self, _universe: Uuid, backup: Uuid, location: &str) -> Result<u64> {
        self.delay().await;
        self.state.enter(&["storage:upload".to_string()]).await?;
        let mut model = self.state.model.lock().await;
        if !model.snapshots.contains(&backup) {
            return Err(Error::step_failure("upload", format!("no snapshot for backup {backup}")));
        }
        let size = 4096;
        model.stored.insert(location.to_string(), size);
        Ok(size)
    }

    async fn download(&self, _universe: Uuid, _backup: Uuid, location: &str) -> Result<()> {
        self.delay().await;
        self.state.enter(&["storage:download".to_string()]).await?;
        if !self.state.model.lock().await.stored.contains_key(location) {
            return Err(Error::step_failure("download", format!("nothing stored at {location}")));
        }
        Ok(())
    }

    async fn delete(&self, location: &str) -> Result<()> {
        self.state.enter(&["storage:delete".to_string()]).await?;
        self.state.model.lock().await.stored.remove(location);
        Ok(())
    }
}
