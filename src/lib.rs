//! taskmesh — task distribution and worker coordination.
//!
//! A management API accepts projects and tasks, a generator expands project
//! descriptions into task lists, a dispatcher binds pending tasks to live
//! worker agents over per-agent queues, and worker runtimes execute tasks
//! against a model backend. The task store is the single source of truth;
//! queue messages are transient triggers with at-least-once delivery.

pub mod api;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod generate;
pub mod model;
pub mod queue;
pub mod runtime;
pub mod store;

pub use config::MeshConfig;
pub use error::{Error, Result};
