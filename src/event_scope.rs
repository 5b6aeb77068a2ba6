//! Readiness polling and fiber I/O blocking
//!
//! A dedicated master poller thread owns a `mio::Poll` and doubles as the
//! timer driver: each pass expires due timers and uses the distance to the
//! next deadline as the poll timeout, and a timer insert that becomes the new
//! earliest deadline pokes the poller's waker. Fibers block on file
//! descriptor readiness by parking one read and one write waiter per fd;
//! registrations are level-style and sticky (one register per fd, both
//! interests), with the waiter slots deciding who actually wakes.
//!
//! An optional cooperative poller runs as a fiber inside the worker pool:
//! it polls its own `mio::Poll` with a zero timeout and yields, and after a
//! stretch of empty polls escalates by parking on the master poller with the
//! cooperative poll's own descriptor, so a quiet pool pays no busy loop.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use parking_lot::Mutex;

use crate::error::Result;
use crate::fiber::{self, Fiber, ResumeMsg, WaitClaim};
use crate::scheduler::cluster::ClusterShared;
use crate::stats::{self, RuntimeStats};
use crate::timer::TimerQueue;

const WAKE: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 256;
/// Empty cooperative polls before escalating to a blocking park
const COOP_SPIN_MAX: usize = 64;

#[derive(Default)]
struct FdWaiters {
    read: Option<Arc<Fiber>>,
    write: Option<Arc<Fiber>>,
    registered: bool,
}

/// One `mio::Poll` plus its waiter table; shared by the master thread and the
/// cooperative poller fiber, each over its own instance.
struct PollerCore {
    poll: Mutex<Poll>,
    registry: Registry,
    fds: Mutex<HashMap<RawFd, FdWaiters>>,
}

impl PollerCore {
    fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(PollerCore { poll: Mutex::new(poll), registry, fds: Mutex::new(HashMap::new()) })
    }

    /// Park the current fiber until `fd` reports the requested readiness.
    fn block(&self, fd: RawFd, write: bool) -> Result<()> {
        let fiber = fiber::current().expect("readiness wait outside fiber context");
        fiber.install_claim(WaitClaim { timer: None });
        {
            let mut fds = self.fds.lock();
            let entry = fds.entry(fd).or_default();
            let slot = if write { &mut entry.write } else { &mut entry.read };
            assert!(slot.is_none(), "fd {fd} already has a parked {} waiter", if write { "write" } else { "read" });
            *slot = Some(fiber.clone());
            if !entry.registered {
                let interest = Interest::READABLE | Interest::WRITABLE;
                if let Err(err) =
                    self.registry.register(&mut SourceFd(&fd), Token(fd as usize), interest)
                {
                    *slot = None;
                    fiber.claim_resume();
                    return Err(err.into());
                }
                entry.registered = true;
            }
        }
        let msg = fiber.suspend();
        debug_assert_eq!(msg, ResumeMsg::Wake);
        Ok(())
    }

    /// Poll once; a signal-interrupted poll reports zero events.
    fn poll_once(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let mut poll = self.poll.lock();
        match poll.poll(events, timeout) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                events.clear();
                Ok(())
            }
            other => other,
        }
    }

    fn dispatch(&self, events: &Events) {
        for event in events {
            if event.token() == WAKE {
                continue;
            }
            let fd = event.token().0 as RawFd;
            let mut woken = Vec::new();
            {
                let mut fds = self.fds.lock();
                if let Some(entry) = fds.get_mut(&fd) {
                    let error = event.is_error();
                    if error || event.is_readable() || event.is_read_closed() {
                        woken.extend(entry.read.take());
                    }
                    if error || event.is_writable() || event.is_write_closed() {
                        woken.extend(entry.write.take());
                    }
                    // drop the registration with the last waiter, so a
                    // closed-and-reused descriptor starts from a clean slate
                    if entry.read.is_none() && entry.write.is_none() {
                        if let Err(err) = self.registry.deregister(&mut SourceFd(&fd)) {
                            log::debug!("deregister of fd {fd} failed: {err}");
                        }
                        fds.remove(&fd);
                    }
                }
            }
            for fiber in woken {
                RuntimeStats::count(&stats::counters().poll_events);
                if fiber.claim_resume().is_some() {
                    fiber.resume(ResumeMsg::Wake);
                }
            }
        }
    }

    /// Release every parked waiter, used during teardown.
    fn drain(&self) {
        let waiters: Vec<Arc<Fiber>> = {
            let mut fds = self.fds.lock();
            let waiters = fds
                .values_mut()
                .flat_map(|entry| entry.read.take().into_iter().chain(entry.write.take()))
                .collect();
            fds.clear();
            waiters
        };
        for fiber in waiters {
            if fiber.claim_resume().is_some() {
                fiber.resume(ResumeMsg::Wake);
            }
        }
    }
}

/// Master poller: owns the poll thread, the timer alarm, and (optionally) a
/// cooperative poller fiber inside the worker pool.
pub(crate) struct EventScope {
    master: Arc<PollerCore>,
    coop: Option<Arc<PollerCore>>,
    waker: Arc<mio::Waker>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventScope {
    pub fn new(timers: TimerQueue) -> Result<Self> {
        let master = Arc::new(PollerCore::new()?);
        let waker = Arc::new(mio::Waker::new(&master.registry, WAKE)?);
        timers.set_alarm(waker.clone());
        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name("fibrous-poller".into())
            .spawn({
                let master = master.clone();
                let stop = stop.clone();
                move || master_loop(master, timers, stop)
            })
            .map_err(|err| crate::error::Error::Spawn { reason: format!("poller thread: {err}") })?;
        Ok(EventScope { master, coop: None, waker, stop, thread: Some(thread) })
    }

    /// Start the cooperative poller fiber; subsequent readiness waits route
    /// through it instead of the master poller.
    pub fn start_coop_poller(&mut self, cluster: &Arc<ClusterShared>, stack_size: usize) -> Result<()> {
        let coop = Arc::new(PollerCore::new()?);
        let fiber = Fiber::new(cluster, "poller".into(), fiber::LOW_PRIORITY, None, false);
        let master = self.master.clone();
        let stop = self.stop.clone();
        let core = coop.clone();
        fiber.start(stack_size, Box::new(move || coop_loop(core, master, stop)))?;
        self.coop = Some(coop);
        Ok(())
    }

    fn core(&self) -> &PollerCore {
        self.coop.as_deref().unwrap_or(&*self.master)
    }

    pub fn block_read(&self, fd: RawFd) -> Result<()> {
        self.core().block(fd, false)
    }

    pub fn block_write(&self, fd: RawFd) -> Result<()> {
        self.core().block(fd, true)
    }
}

impl Drop for EventScope {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Err(err) = self.waker.wake() {
            log::warn!("poller wake during shutdown failed: {err}");
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("poller thread panicked");
            }
        }
        if let Some(coop) = &self.coop {
            coop.drain();
        }
        self.master.drain();
    }
}

fn master_loop(core: Arc<PollerCore>, timers: TimerQueue, stop: Arc<AtomicBool>) {
    let mut events = Events::with_capacity(EVENT_CAPACITY);
    log::debug!("master poller started");
    while !stop.load(Ordering::Relaxed) {
        let timeout = timers.check_expiry(Instant::now());
        if let Err(err) = core.poll_once(&mut events, timeout) {
            log::error!("poll failed: {err}");
            break;
        }
        RuntimeStats::count(&stats::counters().polls);
        core.dispatch(&events);
    }
    log::debug!("master poller stopped");
}

fn coop_loop(core: Arc<PollerCore>, master: Arc<PollerCore>, stop: Arc<AtomicBool>) {
    let coop_fd = core.poll.lock().as_raw_fd();
    let mut events = Events::with_capacity(EVENT_CAPACITY);
    let mut idle_polls = 0usize;
    while !stop.load(Ordering::Relaxed) {
        match core.poll_once(&mut events, Some(Duration::ZERO)) {
            Ok(()) => {}
            Err(err) => {
                log::error!("cooperative poll failed: {err}");
                break;
            }
        }
        RuntimeStats::count(&stats::counters().polls);
        if events.is_empty() {
            idle_polls += 1;
            if idle_polls > COOP_SPIN_MAX {
                idle_polls = 0;
                // park on the master until our own poll fd turns readable
                if let Err(err) = master.block(coop_fd, false) {
                    log::error!("cooperative poller escalation failed: {err}");
                    break;
                }
            } else {
                fiber::yield_now();
            }
        } else {
            idle_polls = 0;
            core.dispatch(&events);
        }
    }
}
