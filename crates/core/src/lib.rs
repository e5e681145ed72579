//! Core types, errors, and configuration shared by every Conductor crate.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;
pub mod result;
pub mod task_type;

pub use config::{BackupConfig, ConductorConfig, ExecutorConfig, WaitConfig};
pub use error::Error;
pub use result::{Result, ResultExt};
pub use task_type::TaskType;
