// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Timeout multiplexer: a sorted deadline queue driven by one monotonic timer
//! descriptor. Owned exclusively by the event-loop thread.
//!
//! Handlers may mutate the queue while it is being dispatched; those commands
//! are applied with in-dispatch semantics (removal tombstones the entry,
//! additions are parked until the pass ends) so the dispatch iteration is
//! never invalidated from underneath itself.

use log::*;

use std::os::fd::{AsFd, BorrowedFd};
use std::thread::{self, ThreadId};
use std::time::Duration;

use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use bus_protocol::channel::TimerRequest;

use crate::Error;

/// A mutation of the queue produced by a firing handler.
#[derive(Debug)]
pub enum TimerCmd {
    Add { id: u64, interval: Duration },
    Remove { id: u64 },
    Toggle { id: u64, interval: Duration, enabled: bool },
}

impl From<TimerRequest> for TimerCmd {
    fn from(req: TimerRequest) -> TimerCmd {
        match req {
            TimerRequest::Add { id, interval } => TimerCmd::Add { id, interval },
            TimerRequest::Remove { id } => TimerCmd::Remove { id },
        }
    }
}

struct Entry {
    /// `None` marks a tombstone awaiting the post-dispatch sweep.
    id: Option<u64>,
    expiry: TimeSpec,
    interval: Duration,
    enabled: bool,
}

pub struct TimeoutQueue {
    timer: TimerFd,
    entries: Vec<Entry>,
    dispatching: bool,
    pending_adds: Vec<Entry>,
    thread: ThreadId,
}

impl TimeoutQueue {
    pub fn new() -> Result<TimeoutQueue, Error> {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK,
        )
        .map_err(|e| Error::Bus(format!("failed to create timerfd: {e}")))?;

        Ok(TimeoutQueue {
            timer,
            entries: Vec::new(),
            dispatching: false,
            pending_adds: Vec::new(),
            thread: thread::current().id(),
        })
    }

    /// The descriptor the event loop should poll for readability.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.timer.as_fd()
    }

    fn assert_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.thread,
            "timeout multiplexer used from the wrong thread"
        );
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.id.is_some()).count() + self.pending_adds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a deadline `interval` from now.
    pub fn add(&mut self, id: u64, interval: Duration) {
        self.assert_thread();

        if interval.is_zero() {
            warn!("timeout interval is zero");
        }

        let entry = Entry {
            id: Some(id),
            expiry: now() + TimeSpec::from_duration(interval),
            interval,
            enabled: true,
        };

        if self.dispatching {
            // parked until the dispatch pass finishes so the iteration in
            // process_event is not disturbed
            self.pending_adds.push(entry);
            return;
        }

        self.entries.push(entry);
        self.sort_entries();
        if self.entries.first().map(|e| e.id) == Some(Some(id)) {
            self.arm_from_head();
        }
    }

    /// Drops the deadline with `id`. During dispatch the entry is only
    /// tombstoned; the dispatch loop sweeps it after handlers return.
    pub fn remove(&mut self, id: u64) {
        self.assert_thread();

        if let Some(entry) = self
            .pending_adds
            .iter_mut()
            .chain(self.entries.iter_mut())
            .find(|e| e.id == Some(id))
        {
            if self.dispatching {
                entry.id = None;
                entry.expiry = TimeSpec::new(i64::MAX, 0);
            } else {
                entry.id = None;
            }
        } else {
            debug!("failed to find timeout {id} to remove");
            return;
        }

        if !self.dispatching {
            // actually erase outside dispatch; re-arming is left to the next
            // timer edge, which is cheaper than recomputing here
            self.entries.retain(|e| e.id.is_some());
        }
    }

    /// Re-enables (with a fresh deadline) or disables the entry with `id`.
    pub fn toggle(&mut self, id: u64, interval: Duration, enabled: bool) {
        self.assert_thread();

        if self.dispatching {
            // the post-dispatch sweep re-reads the enabled flag, nothing else
            // to do here
            if let Some(entry) = self
                .pending_adds
                .iter_mut()
                .chain(self.entries.iter_mut())
                .find(|e| e.id == Some(id))
            {
                entry.enabled = enabled;
                entry.interval = interval;
            }
            return;
        }

        let Some(index) = self.entries.iter().position(|e| e.id == Some(id)) else {
            debug!("failed to find timeout {id} to toggle");
            return;
        };

        if enabled && !interval.is_zero() {
            self.entries[index].enabled = true;
            self.entries[index].interval = interval;
            self.entries[index].expiry = now() + TimeSpec::from_duration(interval);
            self.sort_entries();
        } else {
            self.entries.remove(index);
        }

        self.arm_from_head();
    }

    /// Fires every expired, still-enabled entry once, in deadline order. The
    /// `fire` callback returns further queue mutations which are applied with
    /// in-dispatch semantics; afterwards tombstones are swept, the queue is
    /// re-sorted and the timer re-armed from the new head.
    pub fn process_event<F: FnMut(u64) -> Vec<TimerCmd>>(&mut self, mut fire: F) {
        self.assert_thread();

        // clear the timerfd expiry count
        let mut ticks = [0u8; 8];
        match nix::unistd::read(&self.timer, &mut ticks) {
            Ok(_) | Err(nix::errno::Errno::EAGAIN) => {}
            Err(e) => warn!("failed to read from timerfd: {e}"),
        }

        let current = now();

        self.dispatching = true;
        for index in 0..self.entries.len() {
            let (id, interval) = {
                let entry = &self.entries[index];
                match entry.id {
                    Some(id) if entry.enabled && entry.expiry <= current => (id, entry.interval),
                    _ => continue,
                }
            };

            // reset for the next interval; the commands returned below may
            // override this
            self.entries[index].expiry = current + TimeSpec::from_duration(interval);

            for cmd in fire(id) {
                match cmd {
                    TimerCmd::Add { id, interval } => self.add(id, interval),
                    TimerCmd::Remove { id } => self.remove(id),
                    TimerCmd::Toggle {
                        id,
                        interval,
                        enabled,
                    } => self.toggle(id, interval, enabled),
                }
            }
        }
        self.dispatching = false;

        self.entries.append(&mut self.pending_adds);
        self.entries.retain(|e| e.id.is_some() && e.enabled);
        self.sort_entries();
        self.arm_from_head();
    }

    fn sort_entries(&mut self) {
        self.entries.sort_by_key(|e| e.expiry);
    }

    /// Arms the timer for the head of the queue, or disarms it when the queue
    /// is empty.
    fn arm_from_head(&mut self) {
        let result = match self.entries.first() {
            Some(head) => self.timer.set(
                Expiration::OneShot(head.expiry),
                TimerSetTimeFlags::TFD_TIMER_ABSTIME,
            ),
            None => self.timer.unset(),
        };
        if let Err(e) = result {
            error!("failed to set timerfd value: {e}");
        }
    }
}

fn now() -> TimeSpec {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts,
        Err(e) => {
            // the monotonic clock has no real failure mode on this platform
            error!("clock_gettime failed: {e}");
            TimeSpec::new(0, 0)
        }
    }
}
