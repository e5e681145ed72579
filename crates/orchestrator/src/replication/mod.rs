//! Cross-universe replication: config records, the status gate, and the
//! connectivity graph used to find every universe a change can reach.

pub mod config;
pub mod gating;
pub mod graph;

pub use config::{
    ConfigUpdate, InMemoryReplicationStore, ReplicationConfig, ReplicationStatus,
    ReplicationStore, TableStatus,
};
pub use gating::{AllowedTasks, must_delete};
pub use graph::{ReplicationGraph, connected_universes};
