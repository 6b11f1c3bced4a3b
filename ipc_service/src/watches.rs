// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Watch multiplexer: presents one epoll descriptor to the event loop and
//! fans readiness out to the individual watches requested by the connection
//! engine.
//!
//! Owned exclusively by the event-loop thread. Every entry polls a duplicate
//! of the requested descriptor because the engine may register several
//! watches against the same fd, and a readiness set cannot hold one fd twice.

use log::*;

use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::thread::{self, ThreadId};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use bus_protocol::channel::{
    WatchId, WATCH_ERROR, WATCH_HANGUP, WATCH_READABLE, WATCH_WRITABLE,
};

use crate::Error;

/// Fixed upper bound on simultaneously registered watches.
pub const MAX_WATCHES: usize = 128;

struct Slot {
    fd: Option<std::os::fd::OwnedFd>,
    tag: u64,
    watch: Option<WatchId>,
    flags: u32,
    enabled: bool,
}

pub struct WatchSet {
    epoll: Epoll,
    slots: Vec<Slot>,
    tag_counter: u64,
    thread: ThreadId,
}

impl WatchSet {
    pub fn new() -> Result<WatchSet, Error> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| Error::Bus(format!("failed to create epoll fd: {e}")))?;

        let mut slots = Vec::with_capacity(MAX_WATCHES);
        for _ in 0..MAX_WATCHES {
            slots.push(Slot {
                fd: None,
                tag: 0,
                watch: None,
                flags: 0,
                enabled: false,
            });
        }

        Ok(WatchSet {
            epoll,
            slots,
            tag_counter: 0,
            thread: thread::current().id(),
        })
    }

    /// The descriptor the event loop should poll for readability.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.epoll.0.as_fd()
    }

    fn assert_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.thread,
            "watch multiplexer used from the wrong thread"
        );
    }

    /// Registers a watch on a duplicate of `fd`. Returns the slot tag, whose
    /// low bits index the slot array. Fails without mutating state when all
    /// slots are taken.
    pub fn add(&mut self, watch: WatchId, fd: RawFd, flags: u32, enabled: bool) -> Result<u64, Error> {
        self.assert_thread();

        // SAFETY: the engine keeps its socket open for the lifetime of every
        // watch it requests; the borrow only needs to live for the dup below.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let dupped = bus_protocol::variant::dup_cloexec(borrowed)
            .map_err(|e| Error::Bus(format!("failed to dup watch fd: {e}")))?;

        let mut free_slot = None;
        for _ in 0..MAX_WATCHES {
            self.tag_counter = self.tag_counter.wrapping_add(1);
            let idx = (self.tag_counter % MAX_WATCHES as u64) as usize;
            if self.slots[idx].watch.is_none() {
                free_slot = Some(idx);
                break;
            }
        }
        // the dup closes on the error path, nothing else changed
        let Some(idx) = free_slot else {
            return Err(Error::Bus("no free watch slots".into()));
        };

        let tag = self.tag_counter;
        self.slots[idx] = Slot {
            fd: Some(dupped),
            tag,
            watch: Some(watch),
            flags,
            enabled,
        };
        let epoll_flags = if enabled { to_epoll(flags) } else { EpollFlags::empty() };
        if !epoll_flags.is_empty() {
            let result = match &self.slots[idx].fd {
                Some(fd) => self.epoll.add(fd, EpollEvent::new(epoll_flags, tag)),
                None => Ok(()),
            };
            if let Err(e) = result {
                error!("failed to add watch to epoll: {e}");
                self.clear_slot(idx);
                return Err(Error::Bus(format!("failed to add watch to epoll: {e}")));
            }
        }

        Ok(tag)
    }

    /// Applies a new flag/enable combination to the watch with `tag`. An
    /// empty effective mask removes the fd from the readiness set (tolerating
    /// "not present"); otherwise the registration is modified or added.
    pub fn toggle(&mut self, tag: u64, flags: u32, enabled: bool) {
        self.assert_thread();

        let idx = (tag % MAX_WATCHES as u64) as usize;
        if self.slots[idx].tag != tag || self.slots[idx].watch.is_none() {
            error!("invalid tag value (tag={tag})");
            return;
        }

        self.slots[idx].flags = flags;
        self.slots[idx].enabled = enabled;

        let epoll_flags = if enabled { to_epoll(flags) } else { EpollFlags::empty() };
        let Some(fd) = &self.slots[idx].fd else {
            return;
        };

        if epoll_flags.is_empty() {
            match self.epoll.delete(fd) {
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(e) => error!("failed to delete watch from epoll: {e}"),
            }
        } else {
            let mut event = EpollEvent::new(epoll_flags, tag);
            match self.epoll.modify(fd, &mut event) {
                Ok(()) => {}
                // not currently in the set because it was toggled off earlier
                Err(Errno::ENOENT) => {
                    if let Err(e) = self.epoll.add(fd, EpollEvent::new(epoll_flags, tag)) {
                        error!("failed to add watch to epoll: {e}");
                    }
                }
                Err(e) => error!("failed to modify watch in epoll: {e}"),
            }
        }
    }

    /// Releases the watch with `tag`, closing the duplicated descriptor.
    pub fn remove(&mut self, tag: u64) {
        self.assert_thread();

        let idx = (tag % MAX_WATCHES as u64) as usize;
        if self.slots[idx].tag != tag || self.slots[idx].watch.is_none() {
            error!("trying to delete a watch that doesn't exist (tag={tag})");
            return;
        }

        if let Some(fd) = &self.slots[idx].fd {
            match self.epoll.delete(fd) {
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(e) => error!("failed to delete watch from epoll: {e}"),
            }
        }

        self.clear_slot(idx);
    }

    /// Finds the tag currently assigned to `watch`, if any.
    pub fn tag_of(&self, watch: WatchId) -> Option<u64> {
        self.slots
            .iter()
            .find(|s| s.watch == Some(watch))
            .map(|s| s.tag)
    }

    /// Collects the ready watches and hands each to `dispatch` with the
    /// engine's flag encoding.
    pub fn process_events<F: FnMut(WatchId, u32)>(&mut self, poll_flags: u32, mut dispatch: F) {
        self.assert_thread();

        if poll_flags & (WATCH_ERROR | WATCH_HANGUP) != 0 {
            error!("unexpected error / hang-up detected on epoll fd");
        }

        let mut events = [EpollEvent::empty(); MAX_WATCHES];
        let ready = match self.epoll.wait(&mut events, EpollTimeout::ZERO) {
            Ok(n) => n,
            Err(e) => {
                error!("epoll wait failed: {e}");
                return;
            }
        };

        for event in events.iter().take(ready) {
            let tag = event.data();
            let idx = (tag % MAX_WATCHES as u64) as usize;

            if self.slots[idx].tag != tag {
                error!("invalid tag value (tag={tag})");
                return;
            }
            let Some(watch) = self.slots[idx].watch else {
                error!("trying to handle a watch that doesn't exist (tag={tag})");
                return;
            };

            if self.slots[idx].enabled {
                // error and hang-up are always reported, readiness only for
                // the conditions the watch asked for
                let mask = self.slots[idx].flags | WATCH_ERROR | WATCH_HANGUP;
                dispatch(watch, from_epoll(event.events()) & mask);
            }
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.watch.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear_slot(&mut self, idx: usize) {
        self.slots[idx].fd = None;
        self.slots[idx].tag = 0;
        self.slots[idx].watch = None;
        self.slots[idx].flags = 0;
        self.slots[idx].enabled = false;
    }
}

fn to_epoll(flags: u32) -> EpollFlags {
    let mut out = EpollFlags::empty();
    if flags & WATCH_READABLE != 0 {
        out |= EpollFlags::EPOLLIN;
    }
    if flags & WATCH_WRITABLE != 0 {
        out |= EpollFlags::EPOLLOUT;
    }
    if flags & WATCH_HANGUP != 0 {
        out |= EpollFlags::EPOLLHUP;
    }
    out
}

fn from_epoll(flags: EpollFlags) -> u32 {
    let mut out = 0;
    if flags.contains(EpollFlags::EPOLLIN) {
        out |= WATCH_READABLE;
    }
    if flags.contains(EpollFlags::EPOLLOUT) {
        out |= WATCH_WRITABLE;
    }
    if flags.contains(EpollFlags::EPOLLERR) {
        out |= WATCH_ERROR;
    }
    if flags.contains(EpollFlags::EPOLLHUP) {
        out |= WATCH_HANGUP;
    }
    out
}
