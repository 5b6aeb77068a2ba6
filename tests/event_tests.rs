mod common;

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use fibrous::prelude::*;

#[test]
fn read_wait_parks_until_data_arrives() {
    let rt = common::runtime();
    let (mut ours, mut theirs) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();

    let fd = ours.as_raw_fd();
    let reader = rt
        .spawn(move || {
            let start = Instant::now();
            fibrous::wait_readable(fd).unwrap();
            let mut buf = [0u8; 1];
            ours.read_exact(&mut buf).unwrap();
            (buf[0], start.elapsed())
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(40));
    theirs.write_all(&[0xAB]).unwrap();

    let (byte, elapsed) = reader.join().unwrap();
    assert_eq!(byte, 0xAB);
    assert!(elapsed >= Duration::from_millis(30), "woke before data: {elapsed:?}");
}

#[test]
fn write_wait_returns_promptly_on_a_writable_socket() {
    let rt = common::runtime();
    let (ours, _theirs) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    let fd = ours.as_raw_fd();
    rt.spawn(move || {
        fibrous::wait_writable(fd).unwrap();
        drop(ours);
    })
    .unwrap()
    .join()
    .unwrap();
}

#[test]
fn many_fds_wake_independently() {
    let rt = common::runtime();
    let mut writers = Vec::new();
    let mut readers = Vec::new();
    for i in 0..4u8 {
        let (mut ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        writers.push(theirs);
        let fd = ours.as_raw_fd();
        readers.push(
            rt.spawn(move || {
                fibrous::wait_readable(fd).unwrap();
                let mut buf = [0u8; 1];
                ours.read_exact(&mut buf).unwrap();
                assert_eq!(buf[0], i);
            })
            .unwrap(),
        );
    }
    std::thread::sleep(Duration::from_millis(20));
    for (i, writer) in writers.iter_mut().enumerate() {
        writer.write_all(&[i as u8]).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }
    for handle in readers {
        handle.join().unwrap();
    }
}
