//! Worker runtime — the consuming side of the mesh.
//!
//! Each runtime is one agent: it registers itself by heartbeating, consumes
//! its own queue with one delivery in flight at a time, and drives the task
//! lifecycle from `assigned` through a terminal status.

mod worker;

pub use worker::{WorkerDeps, WorkerHandle, WorkerRuntime, spawn_workers};
