// Re-export compiled gRPC protos.
//
// We keep all `.proto` files within this crate so the agent, the worker
// runtime, and any in-tree tooling share a single Rust type source.

pub mod plum {
    pub mod task {
        pub mod v1 {
            tonic::include_proto!("plum.task.v1");
        }
    }
}

pub use plum::task::v1 as task_v1;
