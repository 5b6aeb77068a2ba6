//! fibrous: an M:N fiber runtime with blocking synchronization
//!
//! Fibers are lightweight execution units multiplexed over a pool of worker
//! threads. Blocking a fiber parks it and frees its worker; a resume that
//! races the park is absorbed by an atomic run-state protocol, so wakeups
//! are never lost and never doubled. On top of that protocol sit counting
//! and binary semaphores, three mutex flavors, condition variables, cyclic
//! barriers, a writer-preferring reader/writer lock, and one-shot completion
//! flags, all with FIFO baton handoff. Timed waits race a shared deadline
//! queue against explicit wakeups through a claim token that only one side
//! can take. A `mio`-based event scope parks fibers on file descriptor
//! readiness and drives the timers.
//!
//! ```no_run
//! use fibrous::prelude::*;
//!
//! let rt = Runtime::init(RuntimeConfig::default()).unwrap();
//! let handle = rt.spawn(|| {
//!     fibrous::sleep(std::time::Duration::from_millis(10));
//!     42
//! }).unwrap();
//! assert_eq!(handle.join().unwrap(), 42);
//! ```

mod context;
pub mod error;
mod event_scope;
pub mod fiber;
pub mod runtime;
pub mod scheduler;
pub mod stats;
pub mod sync;
mod timer;
mod wait_queue;

pub use error::{Error, Result};
pub use fiber::{
    current, current_worker, migrate_to, preempt_point, yield_now, Fiber, FiberHandle,
    DEFAULT_PRIORITY, LOW_PRIORITY, TOP_PRIORITY,
};
pub use runtime::{
    sleep, spawn, spawn_with, wait_readable, wait_writable, Runtime, RuntimeConfig, SpawnOptions,
};
pub use scheduler::WorkerHandle;

pub mod prelude {
    pub use crate::fiber::{current, preempt_point, yield_now, FiberHandle};
    pub use crate::runtime::{
        sleep, spawn, spawn_with, Runtime, RuntimeConfig, SpawnOptions,
    };
    pub use crate::sync::{
        Barrier, BlockingMutex, Condition, OwnerMutex, RwLock, Semaphore, SpinMutex, SyncFlag,
    };
}
