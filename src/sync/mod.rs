//! Blocking synchronization primitives for fibers
//!
//! All primitives share the same shape: a short `parking_lot` lock around the
//! primitive's state, a [`WaitQueue`](crate::wait_queue::WaitQueue) nested
//! inside it, and baton-style handoff so a released resource goes to the
//! oldest live waiter instead of back into open competition.

pub mod barrier;
pub mod condition;
pub mod flag;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;

pub use barrier::Barrier;
pub use condition::Condition;
pub use flag::SyncFlag;
pub use mutex::{BlockingMutex, OwnerMutex, SpinMutex};
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
