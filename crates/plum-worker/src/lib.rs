//! Embedded task-worker runtime.
//!
//! Application processes started by the plum agent link this crate to receive
//! RPC-style tasks from the controller over a single bidirectional gRPC
//! stream. The runtime registers the worker, heartbeats it, and dispatches
//! each inbound task to a registered handler on its own tokio task.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! let mut worker = plum_worker::StreamWorker::from_env();
//! worker.register_task("echo", |inv| async move {
//!     Ok(format!("{{\"status\":\"success\",\"echo\":\"{}\"}}", inv.payload))
//! });
//! worker.run().await
//! # }
//! ```

mod stream_worker;

pub use plum_proto::task_v1 as proto;
pub use stream_worker::{StreamWorker, StreamWorkerOptions, TaskHandler, TaskInvocation};
