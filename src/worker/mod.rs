mod dispatch;
mod pool;
mod process;

pub use dispatch::DispatchPool;
pub use pool::{PoolError, ProcessPool};
pub use process::{ExchangeError, SpawnError, SpawnSpec, WorkerProcess};
