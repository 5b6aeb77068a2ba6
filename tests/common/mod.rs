//! Shared harness for the integration tests
//!
//! Each test binary holds one runtime for all of its tests; the first caller
//! builds it. Binaries that need a non-default configuration (e.g. the
//! cooperative poller) pass their own config to `runtime_with`.

#![allow(dead_code)]

use std::sync::Arc;

use once_cell::sync::OnceCell;

use fibrous::{Runtime, RuntimeConfig};

static RT: OnceCell<Arc<Runtime>> = OnceCell::new();

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn runtime_with(make: impl FnOnce() -> RuntimeConfig) -> Arc<Runtime> {
    RT.get_or_init(|| {
        init_logging();
        Runtime::init(make()).expect("runtime init")
    })
    .clone()
}

pub fn runtime() -> Arc<Runtime> {
    runtime_with(|| RuntimeConfig { workers: 4, ..RuntimeConfig::default() })
}
