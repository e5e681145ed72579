//! Backup and restore lifecycle: job records, their store, and schedules.

pub mod job;
pub mod schedule;
pub mod store;

pub use job::{BackupJob, BackupState, RestoreJob, RestoreState};
pub use schedule::{BackupScheduler, Schedule, ScheduleOutcome, SkipReason};
pub use store::{
    BackupStore, BackupUpdate, InMemoryBackupStore, RestoreUpdate, ScheduleUpdate,
};
