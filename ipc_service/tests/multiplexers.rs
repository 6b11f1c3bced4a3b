// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::os::fd::AsRawFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};

use bus_protocol::channel::{WATCH_READABLE, WATCH_WRITABLE};
use ipc_service::timeouts::{TimeoutQueue, TimerCmd};
use ipc_service::watches::{WatchSet, MAX_WATCHES};

fn wait_readable(fd: std::os::fd::BorrowedFd, timeout_ms: u16) -> bool {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    matches!(poll(&mut fds, PollTimeout::from(timeout_ms)), Ok(n) if n > 0)
}

#[test]
fn watch_capacity_is_bounded() {
    let mut watches = WatchSet::new().unwrap();

    let mut keep_open = Vec::new();
    for n in 0..MAX_WATCHES {
        let event = EventFd::from_flags(EfdFlags::EFD_CLOEXEC).unwrap();
        watches
            .add(n as u64 + 1, event.as_raw_fd(), WATCH_READABLE, true)
            .unwrap();
        keep_open.push(event);
    }
    assert_eq!(watches.len(), MAX_WATCHES);

    // one more must be refused without mutating state
    let extra = EventFd::from_flags(EfdFlags::EFD_CLOEXEC).unwrap();
    assert!(watches
        .add(MAX_WATCHES as u64 + 1, extra.as_raw_fd(), WATCH_READABLE, true)
        .is_err());
    assert_eq!(watches.len(), MAX_WATCHES);

    // freeing one slot makes the registration succeed
    let tag = watches.tag_of(1).unwrap();
    watches.remove(tag);
    assert_eq!(watches.len(), MAX_WATCHES - 1);
    watches
        .add(MAX_WATCHES as u64 + 1, extra.as_raw_fd(), WATCH_READABLE, true)
        .unwrap();
}

#[test]
fn ready_watches_are_dispatched_with_their_flags() {
    let mut watches = WatchSet::new().unwrap();

    let event = EventFd::from_flags(EfdFlags::EFD_CLOEXEC).unwrap();
    watches
        .add(7, event.as_raw_fd(), WATCH_READABLE, true)
        .unwrap();

    nix::unistd::write(&event, &1u64.to_ne_bytes()).unwrap();
    assert!(wait_readable(watches.fd(), 1000));

    let mut fired = Vec::new();
    watches.process_events(WATCH_READABLE, |watch, flags| fired.push((watch, flags)));
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].0, 7);
    assert_ne!(fired[0].1 & WATCH_READABLE, 0);
}

#[test]
fn disabled_watches_stay_silent() {
    let mut watches = WatchSet::new().unwrap();

    let event = EventFd::from_flags(EfdFlags::EFD_CLOEXEC).unwrap();
    let tag = watches
        .add(3, event.as_raw_fd(), WATCH_READABLE, true)
        .unwrap();
    nix::unistd::write(&event, &1u64.to_ne_bytes()).unwrap();

    watches.toggle(tag, WATCH_READABLE, false);
    let mut fired = Vec::new();
    watches.process_events(WATCH_READABLE, |watch, flags| fired.push((watch, flags)));
    assert!(fired.is_empty());

    // toggling back on re-adds the fd to the readiness set
    watches.toggle(tag, WATCH_READABLE | WATCH_WRITABLE, true);
    assert!(wait_readable(watches.fd(), 1000));
    let mut fired = Vec::new();
    watches.process_events(WATCH_READABLE, |watch, flags| fired.push((watch, flags)));
    assert_eq!(fired.len(), 1);

    // removing twice tolerates the second call
    watches.remove(tag);
    watches.remove(tag);
    assert!(watches.is_empty());
}

#[test]
fn expired_timeout_fires_once_and_can_remove_itself() {
    let mut timeouts = TimeoutQueue::new().unwrap();

    timeouts.add(1, Duration::from_millis(30));
    assert_eq!(timeouts.len(), 1);

    assert!(wait_readable(timeouts.fd(), 1000));
    let mut fired = Vec::new();
    timeouts.process_event(|id| {
        fired.push(id);
        vec![TimerCmd::Remove { id }]
    });

    assert_eq!(fired, vec![1]);
    assert!(timeouts.is_empty());
}

#[test]
fn timeout_handlers_can_rearm() {
    let mut timeouts = TimeoutQueue::new().unwrap();

    timeouts.add(1, Duration::from_millis(20));

    // a handler that does not remove its entry stays armed for the next
    // interval
    assert!(wait_readable(timeouts.fd(), 1000));
    timeouts.process_event(|_| Vec::new());
    assert_eq!(timeouts.len(), 1);

    assert!(wait_readable(timeouts.fd(), 1000));
    let mut fired = Vec::new();
    timeouts.process_event(|id| {
        fired.push(id);
        vec![TimerCmd::Remove { id }]
    });
    assert_eq!(fired, vec![1]);
    assert!(timeouts.is_empty());
}

#[test]
fn timeout_handler_can_add_an_earlier_deadline() {
    let mut timeouts = TimeoutQueue::new().unwrap();

    timeouts.add(1, Duration::from_millis(20));

    assert!(wait_readable(timeouts.fd(), 1000));
    timeouts.process_event(|id| {
        assert_eq!(id, 1);
        vec![
            TimerCmd::Remove { id: 1 },
            TimerCmd::Add {
                id: 2,
                interval: Duration::from_millis(5),
            },
        ]
    });
    assert_eq!(timeouts.len(), 1);

    // the entry added during dispatch fires on the next timer edge
    assert!(wait_readable(timeouts.fd(), 1000));
    let mut fired = Vec::new();
    timeouts.process_event(|id| {
        fired.push(id);
        vec![TimerCmd::Remove { id }]
    });
    assert_eq!(fired, vec![2]);
    assert!(timeouts.is_empty());
}

#[test]
fn disabled_timeouts_are_swept() {
    let mut timeouts = TimeoutQueue::new().unwrap();

    timeouts.add(1, Duration::from_millis(10));
    timeouts.add(2, Duration::from_millis(15));

    assert!(wait_readable(timeouts.fd(), 1000));
    timeouts.process_event(|id| {
        if id == 1 {
            // disabling the sibling during dispatch tombstones it for the
            // post-dispatch sweep
            vec![
                TimerCmd::Remove { id: 1 },
                TimerCmd::Toggle {
                    id: 2,
                    interval: Duration::from_millis(15),
                    enabled: false,
                },
            ]
        } else {
            vec![TimerCmd::Remove { id }]
        }
    });

    assert!(timeouts.is_empty());
}
