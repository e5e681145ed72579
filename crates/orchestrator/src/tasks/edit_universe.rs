//! Edit a universe's node set.
//!
//! The edit is planned once from the locked universe record and frozen in
//! the task snapshot, so a retry replays the same plan even if the record
//! has moved on since.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::{Error, Result};
use conductor_workflow::{RunnableTask, Step, SubtaskGroup, TaskBody};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::Services;
use super::steps::{
    ClusterCondition, ClusterRpcStep, NodeOperationStep, UniverseUpdateStep,
    WaitForClusterStep, mark_update_success,
};
use crate::capability::{ClusterRpc, NodeOperationKind};
use crate::lock::LockSet;
use crate::resource::{ExpectedVersion, NodeDetails, NodeState, Universe};

/// Desired state of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node name.
    pub name: String,
    /// Placement zone.
    pub zone: String,
    /// Whether the node should run a master.
    #[serde(default)]
    pub is_master: bool,
}

/// Parameters of an edit-universe task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditUniverseParams {
    /// Universe to edit.
    pub universe: Uuid,
    /// Version the caller planned against; `None` skips the check.
    #[serde(default)]
    pub expected_version: Option<u64>,
    /// The complete desired node set.
    pub nodes: Vec<NodeSpec>,
    /// Turn the load balancer off for the duration of the edit.
    #[serde(default)]
    pub disable_load_balancer: bool,
}

/// Node changes an edit performs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPlan {
    /// New nodes.
    pub add: Vec<NodeSpec>,
    /// Nodes leaving the universe.
    pub remove: Vec<String>,
    /// Nodes that start a master process.
    pub masters_to_start: Vec<String>,
    /// Nodes whose master process stops.
    pub masters_to_stop: Vec<String>,
}

impl EditPlan {
    /// Check if the edit changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty()
            && self.remove.is_empty()
            && self.masters_to_start.is_empty()
            && self.masters_to_stop.is_empty()
    }
}

/// Diff `desired` against the current node set.
pub fn plan_edit(current: &Universe, desired: &[NodeSpec]) -> Result<EditPlan> {
    if desired.is_empty() {
        return Err(Error::invariant_violation(format!(
            "edit of universe {} would remove every node",
            current.uuid
        )));
    }

    let mut wanted: BTreeMap<&str, &NodeSpec> = BTreeMap::new();
    for spec in desired {
        if wanted.insert(spec.name.as_str(), spec).is_some() {
            return Err(Error::invariant_violation(format!(
                "node {} listed twice in edit of universe {}",
                spec.name, current.uuid
            )));
        }
    }
    if !desired.iter().any(|n| n.is_master) {
        return Err(Error::invariant_violation(format!(
            "edit of universe {} leaves no master",
            current.uuid
        )));
    }

    let existing: BTreeSet<&str> = current.nodes.iter().map(|n| n.name.as_str()).collect();
    let add: Vec<NodeSpec> = desired
        .iter()
        .filter(|n| !existing.contains(n.name.as_str()))
        .cloned()
        .collect();
    let remove: Vec<String> = current
        .nodes
        .iter()
        .filter(|n| !wanted.contains_key(n.name.as_str()))
        .map(|n| n.name.clone())
        .collect();

    let masters_to_start = desired
        .iter()
        .filter(|n| n.is_master && current.node(&n.name).is_none_or(|c| !c.is_master))
        .map(|n| n.name.clone())
        .collect();
    let masters_to_stop: Vec<String> = current
        .nodes
        .iter()
        .filter(|n| n.is_master && wanted.get(n.name.as_str()).is_none_or(|w| !w.is_master))
        .map(|n| n.name.clone())
        .collect();

    if let Some(kept) = masters_to_stop.iter().find(|m| !remove.contains(m)) {
        return Err(Error::invariant_violation(format!(
            "master {kept} of universe {} would stop without being removed",
            current.uuid
        )));
    }

    Ok(EditPlan {
        add,
        remove,
        masters_to_start,
        masters_to_stop,
    })
}

/// Edit-universe task body.
pub struct EditUniverse {
    services: Services,
    params: EditUniverseParams,
    locks: LockSet,
}

impl EditUniverse {
    /// Create the body.
    pub fn new(services: Services, params: EditUniverseParams) -> Self {
        let locks = LockSet::new(services.lock.clone());
        Self {
            services,
            params,
            locks,
        }
    }

    fn process_step(&self, node: &str, kind: NodeOperationKind, process: &str) -> Arc<dyn Step> {
        NodeOperationStep::shared(
            &self.services.nodes,
            self.params.universe,
            node,
            kind,
            json!({ "process": process }),
        )
    }

    fn node_group<'a>(
        &self,
        name: &str,
        nodes: impl IntoIterator<Item = &'a str>,
        kind: NodeOperationKind,
        process: &str,
    ) -> SubtaskGroup {
        nodes
            .into_iter()
            .fold(SubtaskGroup::new(name), |group, node| {
                group.step(self.process_step(node, kind, process))
            })
    }

    fn load_balancer_group(&self, name: &str, enabled: bool) -> SubtaskGroup {
        SubtaskGroup::new(name).step(ClusterRpcStep::shared(
            &self.services.clusters,
            self.params.universe,
            ClusterRpc::SetLoadBalancer { enabled },
        ))
    }

    fn wait_group(&self, name: &str, condition: ClusterCondition) -> SubtaskGroup {
        SubtaskGroup::new(name).step(WaitForClusterStep::shared(
            &self.services.clusters,
            self.params.universe,
            condition,
        ))
    }
}

#[async_trait]
impl TaskBody for EditUniverse {
    fn resources(&self) -> Vec<Uuid> {
        vec![self.params.universe]
    }

    async fn validate(&self) -> Result<()> {
        self.services
            .universes
            .get(self.params.universe)
            .await?
            .ok_or_else(|| Error::not_found("universe", self.params.universe.to_string()))?;
        Ok(())
    }

    async fn run(&mut self, task: &mut RunnableTask) -> Result<()> {
        let universe_id = self.params.universe;
        // The first attempt already advanced the version.
        let expected = if task.is_first_try() {
            ExpectedVersion::from(self.params.expected_version)
        } else {
            ExpectedVersion::Any
        };
        let locked = self.locks.acquire(universe_id, expected).await?;

        let desired = self.params.nodes.clone();
        let plan: EditPlan = task
            .snapshot(|| async move { plan_edit(&locked, &desired) })
            .await?;
        info!(
            task_id = %task.id(),
            universe = %universe_id,
            add = plan.add.len(),
            remove = plan.remove.len(),
            "Edit planned"
        );

        let universes = &self.services.universes;
        {
            let add = plan.add.clone();
            let remove = plan.remove.clone();
            task.add_subtask_group(SubtaskGroup::new("register-node-changes").step(
                UniverseUpdateStep::shared("register_node_changes", universes, universe_id, move |u| {
                    for node in &mut u.nodes {
                        if remove.contains(&node.name) {
                            node.state = NodeState::ToBeRemoved;
                        }
                    }
                    for spec in &add {
                        if u.node(&spec.name).is_none() {
                            u.nodes.push(
                                NodeDetails::new(spec.name.clone(), spec.zone.clone())
                                    .with_state(NodeState::ToBeAdded),
                            );
                        }
                    }
                }),
            ))
            .await?;
        }

        if self.params.disable_load_balancer {
            task.add_subtask_group(self.load_balancer_group("disable-load-balancer", false))
                .await?;
        }

        if !plan.add.is_empty() {
            let added = || plan.add.iter().map(|n| n.name.as_str());
            task.add_subtask_group(self.node_group("provision-nodes", added(), NodeOperationKind::Provision, "tserver"))
                .await?;
            task.add_subtask_group(self.node_group("configure-nodes", added(), NodeOperationKind::Configure, "tserver"))
                .await?;
            task.add_subtask_group(self.node_group("start-tservers", added(), NodeOperationKind::StartProcess, "tserver"))
                .await?;
            task.add_subtask_group(self.wait_group(
                "wait-for-tservers",
                ClusterCondition::TServersHeartbeating(added().map(str::to_string).collect()),
            ))
            .await?;
        }

        if !plan.masters_to_start.is_empty() {
            let masters = plan.masters_to_start.iter().map(String::as_str);
            task.add_subtask_group(self.node_group("start-masters", masters, NodeOperationKind::StartProcess, "master"))
                .await?;
            task.add_subtask_group(self.wait_group("wait-for-master-leader", ClusterCondition::MasterLeader))
                .await?;
        }

        if !plan.masters_to_stop.is_empty() {
            let masters = plan.masters_to_stop.iter().map(String::as_str);
            task.add_subtask_group(self.node_group("stop-masters", masters, NodeOperationKind::StopProcess, "master"))
                .await?;
            task.add_subtask_group(self.wait_group("wait-for-new-master-leader", ClusterCondition::MasterLeader))
                .await?;
        }

        if !plan.remove.is_empty() {
            let removed = || plan.remove.iter().map(String::as_str);
            task.add_subtask_group(self.wait_group("wait-for-data-move", ClusterCondition::DataMoved))
                .await?;
            task.add_subtask_group(self.node_group("stop-tservers", removed(), NodeOperationKind::StopProcess, "tserver"))
                .await?;
            task.add_subtask_group(self.node_group("remove-nodes", removed(), NodeOperationKind::Remove, "tserver"))
                .await?;
        }

        {
            let final_plan = plan.clone();
            task.add_subtask_group(SubtaskGroup::new("update-node-states").step(
                UniverseUpdateStep::shared("update_node_states", universes, universe_id, move |u| {
                    apply_plan(u, &final_plan);
                }),
            ))
            .await?;
        }

        if self.params.disable_load_balancer {
            task.add_subtask_group(self.load_balancer_group("enable-load-balancer", true))
                .await?;
        }

        task.add_subtask_group(
            SubtaskGroup::new("mark-update-success").step(mark_update_success(universes, universe_id)),
        )
        .await?;

        task.run_subtasks(false).await
    }

    async fn compensate(&mut self, task: &mut RunnableTask, error: &Error) -> Result<()> {
        if !self.params.disable_load_balancer || !self.locks.holds(self.params.universe) {
            return Ok(());
        }
        warn!(task_id = %task.id(), error = %error, "Edit failed, re-enabling load balancer");
        task.add_compensation_group(
            self.load_balancer_group("re-enable-load-balancer", true)
                .ignore_errors(),
        )
        .await?;
        task.run_subtasks(true).await
    }

    async fn cleanup(&mut self, _task: &mut RunnableTask, error: Option<&Error>) -> Result<()> {
        let message = error.map(ToString::to_string);
        self.locks.release_all(message.as_deref()).await;
        Ok(())
    }
}

/// Final node set after a successful edit.
fn apply_plan(universe: &mut Universe, plan: &EditPlan) {
    universe.nodes.retain(|n| !plan.remove.contains(&n.name));
    for node in &mut universe.nodes {
        if plan.masters_to_start.contains(&node.name) {
            node.is_master = true;
        }
        if plan.masters_to_stop.contains(&node.name) {
            node.is_master = false;
        }
        if node.state == NodeState::ToBeAdded {
            node.state = NodeState::Live;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn universe() -> Universe {
        Universe::new(
            "u",
            vec![
                NodeDetails::new("n1", "az1").master(),
                NodeDetails::new("n2", "az2").master(),
                NodeDetails::new("n3", "az3").master(),
            ],
        )
    }

    fn spec(name: &str, is_master: bool) -> NodeSpec {
        NodeSpec {
            name: name.into(),
            zone: "az1".into(),
            is_master,
        }
    }

    #[test]
    fn test_replace_master_node() -> Result<()> {
        let plan = plan_edit(
            &universe(),
            &[spec("n1", true), spec("n2", true), spec("n4", true)],
        )?;
        assert_eq!(plan.add, vec![spec("n4", true)]);
        assert_eq!(plan.remove, vec!["n3".to_string()]);
        assert_eq!(plan.masters_to_start, vec!["n4".to_string()]);
        assert_eq!(plan.masters_to_stop, vec!["n3".to_string()]);
        Ok(())
    }

    #[test]
    fn test_empty_desired_set_rejected() {
        assert!(plan_edit(&universe(), &[]).is_err_and(|e| e.is_fatal()));
    }

    #[test]
    fn test_demoting_kept_master_rejected() {
        let result = plan_edit(
            &universe(),
            &[spec("n1", true), spec("n2", true), spec("n3", false)],
        );
        assert!(result.is_err_and(|e| e.to_string().contains("n3")));
    }

    #[test]
    fn test_no_master_left_rejected() {
        assert!(plan_edit(&universe(), &[spec("n4", false)]).is_err());
    }

    #[test]
    fn test_duplicate_node_rejected() {
        assert!(plan_edit(&universe(), &[spec("n1", true), spec("n1", true)]).is_err());
    }

    #[test]
    fn test_apply_plan_final_state() -> Result<()> {
        let mut u = universe();
        let plan = plan_edit(&u, &[spec("n1", true), spec("n2", true), spec("n4", true)])?;
        u.nodes
            .push(NodeDetails::new("n4", "az1").with_state(NodeState::ToBeAdded));

        apply_plan(&mut u, &plan);

        let names: Vec<&str> = u.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["n1", "n2", "n4"]);
        assert!(u.nodes.iter().all(|n| n.is_master && n.state == NodeState::Live));
        Ok(())
    }

    #[test]
    fn test_unchanged_set_is_empty_plan() -> Result<()> {
        let plan = plan_edit(&universe(), &[spec("n1", true), spec("n2", true), spec("n3", true)])?;
        assert!(plan.is_empty());
        Ok(())
    }
}
