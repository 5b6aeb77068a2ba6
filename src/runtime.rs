//! Runtime assembly and the process-wide entry points
//!
//! The runtime bundles one cluster of workers, the timer queue, and the
//! event scope. It is reference counted rather than a true global: the
//! process keeps a `Weak` to the most recent runtime, `Runtime::get`
//! upgrades it or builds a fresh runtime from [`RuntimeConfig::from_env`],
//! and dropping the last `Arc` tears the whole thing down. Tests can
//! therefore build, use, and discard isolated runtimes in one process.

use std::panic::{self, AssertUnwindSafe};
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::event_scope::EventScope;
use crate::fiber::{self, Fiber, FiberHandle, DEFAULT_PRIORITY};
use crate::scheduler::cluster::ClusterShared;
use crate::scheduler::WorkerHandle;
use crate::sync::flag::Joinable;
use crate::timer::TimerQueue;

static CURRENT_RT: Lazy<Mutex<Weak<Runtime>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// Runtime tuning knobs; every field has an environment override.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker thread count (`FIBROUS_WORKERS`)
    pub workers: usize,
    /// Carrier stack size in KiB (`FIBROUS_STACK_KB`)
    pub stack_kb: usize,
    /// Run a cooperative poller fiber inside the pool (`FIBROUS_WORKER_POLLER`)
    pub worker_poller: bool,
    /// Preemption checkpoint interval (`FIBROUS_PREEMPT_MS`); disabled when unset
    pub preempt_interval: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            workers: num_cpus::get(),
            stack_kb: 256,
            worker_poller: false,
            preempt_interval: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied; malformed values are
    /// logged and ignored.
    pub fn from_env() -> Self {
        let mut config = RuntimeConfig::default();
        if let Some(workers) = env_parse::<usize>("FIBROUS_WORKERS") {
            config.workers = workers.max(1);
        }
        if let Some(stack_kb) = env_parse::<usize>("FIBROUS_STACK_KB") {
            config.stack_kb = stack_kb.max(16);
        }
        if let Ok(value) = std::env::var("FIBROUS_WORKER_POLLER") {
            config.worker_poller = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Some(ms) = env_parse::<u64>("FIBROUS_PREEMPT_MS") {
            config.preempt_interval = Some(Duration::from_millis(ms.max(1)));
        }
        config
    }

    fn stack_size(&self) -> usize {
        self.stack_kb * 1024
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            log::warn!("ignoring malformed {name}={value}");
            None
        }
    }
}

pub struct Runtime {
    events: EventScope,
    cluster: Arc<ClusterShared>,
    timers: TimerQueue,
    config: RuntimeConfig,
}

impl Runtime {
    /// Build a runtime and register it as the process-current one. Fails if
    /// a runtime is already live.
    pub fn init(config: RuntimeConfig) -> Result<Arc<Runtime>> {
        let runtime = {
            let mut current = CURRENT_RT.lock();
            if current.upgrade().is_some() {
                return Err(Error::Runtime { reason: "a runtime is already live".into() });
            }
            let timers = TimerQueue::new();
            let cluster = ClusterShared::new(config.stack_size());
            let mut events = EventScope::new(timers.clone())?;
            for _ in 0..config.workers.max(1) {
                cluster.add_worker()?;
            }
            if config.worker_poller {
                events.start_coop_poller(&cluster, config.stack_size())?;
            }
            let runtime = Arc::new(Runtime { events, cluster, timers, config });
            *current = Arc::downgrade(&runtime);
            runtime
        };
        // the ticker sleeps through the global timer queue, so it starts
        // only after the runtime is registered
        if let Some(interval) = runtime.config.preempt_interval {
            runtime.cluster.start_preempt_ticker(interval)?;
        }
        log::info!(
            "runtime up: {} workers, {} KiB stacks, worker poller {}",
            runtime.config.workers,
            runtime.config.stack_kb,
            if runtime.config.worker_poller { "on" } else { "off" },
        );
        Ok(runtime)
    }

    /// The current runtime, building one from the environment on first use.
    /// Concurrent first callers race to build; the losers pick up the
    /// winner's runtime instead of failing.
    pub fn get() -> Result<Arc<Runtime>> {
        loop {
            if let Some(runtime) = CURRENT_RT.lock().upgrade() {
                return Ok(runtime);
            }
            match Runtime::init(RuntimeConfig::from_env()) {
                Ok(runtime) => return Ok(runtime),
                // another caller registered a runtime first; upgrade theirs
                Err(Error::Runtime { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Spawn with default options.
    pub fn spawn<T, F>(&self, f: F) -> Result<FiberHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with(SpawnOptions::default(), f)
    }

    pub fn spawn_with<T, F>(&self, opts: SpawnOptions, f: F) -> Result<FiberHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let fiber = Fiber::new(
            &self.cluster,
            opts.name.unwrap_or_else(|| "fiber".into()),
            opts.priority,
            opts.pinned.as_ref().map(|handle| &handle.shared),
            opts.affinity,
        );
        let flag = Joinable::<T>::new();
        let result_flag = flag.clone();
        let body = move || match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => result_flag.post(Ok(value)),
            Err(payload) => result_flag.post(Err(payload)),
        };
        fiber.start(self.config.stack_size(), Box::new(body))?;
        Ok(FiberHandle::new(flag, fiber))
    }

    /// Grow the worker pool by one.
    pub fn add_worker(&self) -> Result<WorkerHandle> {
        self.cluster.add_worker()
    }

    pub fn workers(&self) -> Vec<WorkerHandle> {
        self.cluster.worker_handles()
    }

    pub fn worker_count(&self) -> usize {
        self.cluster.worker_count()
    }

    /// Quiesce every other worker; must run in fiber context.
    pub fn pause(&self) {
        self.cluster.pause();
    }

    pub fn resume(&self) {
        self.cluster.resume();
    }

    /// Run `f` with every other worker quiesced.
    pub fn quiesce<T>(&self, f: impl FnOnce() -> T) -> T {
        self.cluster.quiesce(f)
    }

    /// Park the current fiber until `fd` is readable.
    pub fn wait_readable(&self, fd: RawFd) -> Result<()> {
        self.events.block_read(fd)
    }

    /// Park the current fiber until `fd` is writable.
    pub fn wait_writable(&self, fd: RawFd) -> Result<()> {
        self.events.block_write(fd)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        log::info!("runtime shutting down");
        self.cluster.shutdown();
        // EventScope drops after this, joining the poller thread
    }
}

/// Spawn-time knobs; the builder methods cover the common cases.
pub struct SpawnOptions {
    name: Option<String>,
    priority: usize,
    pinned: Option<WorkerHandle>,
    affinity: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        SpawnOptions { name: None, priority: DEFAULT_PRIORITY, pinned: None, affinity: false }
    }
}

impl SpawnOptions {
    pub fn new() -> Self {
        SpawnOptions::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: usize) -> Self {
        self.priority = priority;
        self
    }

    /// Start on (and stay homed to) a specific worker.
    pub fn pinned(mut self, worker: WorkerHandle) -> Self {
        self.pinned = Some(worker);
        self
    }

    /// Pin hard: refuse later migration attempts.
    pub fn affinity(mut self, affinity: bool) -> Self {
        self.affinity = affinity;
        self
    }
}

/// Spawn a fiber on the current runtime.
pub fn spawn<T, F>(f: F) -> Result<FiberHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Runtime::get()?.spawn(f)
}

pub fn spawn_with<T, F>(opts: SpawnOptions, f: F) -> Result<FiberHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Runtime::get()?.spawn_with(opts, f)
}

/// Suspend the current fiber for `duration`; blocks the OS thread when
/// called outside fiber context.
pub fn sleep(duration: Duration) {
    if fiber::current().is_none() {
        std::thread::sleep(duration);
        return;
    }
    timers().sleep(duration);
}

/// Park the current fiber until `fd` is readable.
pub fn wait_readable(fd: RawFd) -> Result<()> {
    Runtime::get()?.wait_readable(fd)
}

/// Park the current fiber until `fd` is writable.
pub fn wait_writable(fd: RawFd) -> Result<()> {
    Runtime::get()?.wait_writable(fd)
}

/// Timer queue of the current runtime. Callers are fibers, so a runtime is
/// necessarily live.
pub(crate) fn timers() -> TimerQueue {
    match CURRENT_RT.lock().upgrade() {
        Some(runtime) => runtime.timers.clone(),
        None => panic!("fiber outlived its runtime"),
    }
}
