//! Reader/writer lock with writer preference
//!
//! State is a single signed count: negative one while a writer holds the
//! lock, zero when free, positive for the number of active readers. New
//! readers queue behind a waiting writer even while other readers are still
//! inside, so writers cannot be starved by a steady reader stream. Waking
//! readers chain: the granter admits one, and each admitted reader pulls the
//! next queued reader along before returning.

use parking_lot::{Mutex, MutexGuard};

use crate::fiber::ResumeMsg;
use crate::wait_queue::WaitQueue;

const WRITER: isize = -1;
const FREE: isize = 0;

pub struct RwLock {
    state: Mutex<isize>,
    readers: WaitQueue,
    writers: WaitQueue,
}

impl RwLock {
    pub fn new() -> Self {
        RwLock { state: Mutex::new(FREE), readers: WaitQueue::new(), writers: WaitQueue::new() }
    }

    pub fn acquire_read(&self) {
        let state = self.state.lock();
        if *state >= FREE && self.writers.is_empty() {
            let mut state = state;
            *state += 1;
            return;
        }
        let woken = self.readers.block(state);
        debug_assert!(woken, "untimed read acquire resumed by timeout");
        // the granter already counted us; pull the next reader along
        self.chain_readers(self.state.lock());
    }

    pub fn try_acquire_read(&self) -> bool {
        let mut state = self.state.lock();
        if *state >= FREE && self.writers.is_empty() {
            *state += 1;
            true
        } else {
            false
        }
    }

    pub fn acquire_write(&self) {
        let state = self.state.lock();
        if *state == FREE {
            let mut state = state;
            *state = WRITER;
            return;
        }
        let woken = self.writers.block(state);
        debug_assert!(woken, "untimed write acquire resumed by timeout");
        // the granter installed writer state on our behalf
        debug_assert_eq!(*self.state.lock(), WRITER);
    }

    pub fn try_acquire_write(&self) -> bool {
        let mut state = self.state.lock();
        if *state == FREE {
            *state = WRITER;
            true
        } else {
            false
        }
    }

    pub fn release_read(&self) {
        let mut state = self.state.lock();
        debug_assert!(*state > FREE, "read release without read lock");
        *state -= 1;
        if *state == FREE {
            if let Some(writer) = self.writers.next_waiter() {
                *state = WRITER;
                drop(state);
                writer.resume(ResumeMsg::Wake);
            }
        }
    }

    pub fn release_write(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(*state, WRITER, "write release without write lock");
        if let Some(writer) = self.writers.next_waiter() {
            // hand straight to the next writer, state stays claimed
            drop(state);
            writer.resume(ResumeMsg::Wake);
        } else if let Some(reader) = self.readers.next_waiter() {
            *state = 1;
            drop(state);
            reader.resume(ResumeMsg::Wake);
        } else {
            *state = FREE;
        }
    }

    fn chain_readers(&self, mut state: MutexGuard<'_, isize>) {
        if *state >= FREE {
            if let Some(reader) = self.readers.next_waiter() {
                *state += 1;
                drop(state);
                reader.resume(ResumeMsg::Wake);
            }
        }
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}
