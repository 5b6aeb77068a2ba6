//! Same readiness behavior, routed through the cooperative poller fiber.

mod common;

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use fibrous::prelude::*;

fn coop_runtime() -> std::sync::Arc<Runtime> {
    common::runtime_with(|| RuntimeConfig {
        workers: 4,
        worker_poller: true,
        ..RuntimeConfig::default()
    })
}

#[test]
fn read_wait_works_through_the_worker_poller() {
    let rt = coop_runtime();
    let (mut ours, mut theirs) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    let fd = ours.as_raw_fd();

    let reader = rt
        .spawn(move || {
            fibrous::wait_readable(fd).unwrap();
            let mut buf = [0u8; 1];
            ours.read_exact(&mut buf).unwrap();
            buf[0]
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(40));
    theirs.write_all(&[0x5A]).unwrap();
    assert_eq!(reader.join().unwrap(), 0x5A);
}

#[test]
fn idle_worker_poller_escalates_instead_of_burning_cpu() {
    let rt = coop_runtime();
    // with no registrations the poller must settle into a blocking park;
    // ordinary fibers still get scheduled underneath it
    std::thread::sleep(Duration::from_millis(100));
    let value = rt.spawn(|| 11u32).unwrap().join().unwrap();
    assert_eq!(value, 11);
}
