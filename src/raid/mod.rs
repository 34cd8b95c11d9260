//! Raid Module
//!
//! File-level erasure coding tasks and the thread pool that runs them.

pub mod tasks;
mod worker;

pub use tasks::{
    MakeOutcome, MakeRequest, ReadOutcome, ReadRequest, RebuildOutcome, RebuildRequest,
};
pub use worker::{
    RaidOutput, RaidRequest, RaidTask, RaidWorker, RaidWorkerConfig, TaskId, TaskKind, TaskResult,
};
