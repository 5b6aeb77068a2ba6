//! M:N scheduler: workers, ready lanes, and cluster-wide quiescence

pub(crate) mod cluster;
pub mod worker;

pub use worker::WorkerHandle;
