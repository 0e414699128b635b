pub mod manager;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod transport;
pub mod worker;

pub use manager::{
    NullResultSink, PoolError, PoolStatus, ProcessPoolConfig, ProcessPoolManager, ProcessStatus,
    ResultSink,
};
pub use protocol::{WorkItem, WorkResult};
pub use registry::{InMemoryPoolRegistry, PoolRegistry, RedisPoolRegistry};
pub use runtime::{MockRuntime, RuntimeError, WorkflowRuntime};
#[cfg(feature = "rustpython-runtime")]
pub use runtime::RustPythonRuntime;
pub use transport::{InProcessSpawner, OsProcessSpawner, SpawnedWorker, WorkerSpawner};
pub use worker::{current_execution_id, run_worker_loop, ResolvedTarget, WorkflowLookup};

#[cfg(test)]
test_r::enable!();
