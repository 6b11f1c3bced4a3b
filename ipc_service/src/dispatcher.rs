// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The event dispatcher: one thread per bus connection that multiplexes bus
//! I/O, call deadlines and closures posted from other threads.
//!
//! The loop polls six descriptors: three eventfds (death, wake-up, dispatch),
//! the closure-execution eventfd, the watch multiplexer's readiness set and
//! the timeout multiplexer's timer. Everything that touches the connection
//! engine funnels through [`EventDispatcher::call_in_event_loop`].

use log::*;

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};

use bus_protocol::channel::{Channel, Dispatched, TimerRequest, WatchRequest};

use crate::timeouts::{TimerCmd, TimeoutQueue};
use crate::watches::WatchSet;
use crate::Error;

type Job = Box<dyn FnOnce() + Send>;

/// Routes every item popped from the engine's dispatch queue; installed by
/// the bus connection when the dispatcher starts.
pub type DispatchRouter = Arc<dyn Fn(Dispatched) + Send + Sync>;

struct JobQueue {
    queue: VecDeque<(u64, Job)>,
    next_tag: u64,
    last_done: u64,
    running: bool,
}

struct Shared {
    death: EventFd,
    wakeup: EventFd,
    dispatch: EventFd,
    exec: EventFd,
    jobs: Mutex<JobQueue>,
    jobs_cond: Condvar,
    loop_thread: Mutex<Option<ThreadId>>,
}

pub struct EventDispatcher {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventDispatcher {
    pub fn new() -> Result<EventDispatcher, Error> {
        let mk = || {
            EventFd::from_flags(EfdFlags::EFD_CLOEXEC)
                .map_err(|e| Error::Bus(format!("failed to create eventfd: {e}")))
        };

        Ok(EventDispatcher {
            shared: Arc::new(Shared {
                death: mk()?,
                wakeup: mk()?,
                dispatch: mk()?,
                exec: mk()?,
                jobs: Mutex::new(JobQueue {
                    queue: VecDeque::new(),
                    next_tag: 1,
                    last_done: 0,
                    running: false,
                }),
                jobs_cond: Condvar::new(),
                loop_thread: Mutex::new(None),
            }),
            thread: Mutex::new(None),
        })
    }

    /// Spawns the event-loop thread for `channel`. `router` receives every
    /// dispatched incoming item, on the loop thread.
    pub fn start(
        &self,
        channel: Arc<Mutex<Channel>>,
        router: DispatchRouter,
    ) -> Result<(), Error> {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            return Err(Error::Bus("dispatch thread already running".into()));
        }

        // the engine signals "messages queued" through the dispatch eventfd
        {
            let shared = self.shared.clone();
            channel
                .lock()
                .unwrap()
                .set_dispatch_hook(Box::new(move || {
                    if let Err(e) = nix::unistd::write(&shared.dispatch, &1u64.to_ne_bytes()) {
                        error!("failed to write to the dispatch event fd: {e}");
                    }
                }));
        }

        self.shared.jobs.lock().unwrap().running = true;

        let shared = self.shared.clone();
        let handle = match thread::Builder::new()
            .name("bus-events".to_string())
            .spawn(move || event_loop(&shared, &channel, &router))
        {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.jobs.lock().unwrap().running = false;
                return Err(Error::Bus(format!("failed to spawn dispatch thread: {e}")));
            }
        };

        *thread = Some(handle);
        Ok(())
    }

    /// Stops the event-loop thread. Queued closures are dropped without
    /// running and their waiters released with a failure indication.
    pub fn stop(&self) {
        let handle = self.thread.lock().unwrap().take();
        let Some(handle) = handle else {
            debug!("dispatch thread not running");
            return;
        };

        if let Err(e) = nix::unistd::write(&self.shared.death, &1u64.to_ne_bytes()) {
            error!("failed to write to death eventfd: {e}");
        }

        if handle.join().is_err() {
            error!("dispatch thread panicked");
        }
        info!("event dispatcher finished");

        // wake up anyone whose queued closure will now never run
        let mut jobs = self.shared.jobs.lock().unwrap();
        jobs.running = false;
        jobs.queue.clear();
        self.shared.jobs_cond.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.thread.lock().unwrap().is_some()
    }

    /// Runs `job` on the event-loop thread and blocks until it completed.
    ///
    /// Calls made from the loop thread itself execute inline. Returns false
    /// when the dispatcher is not running (or stops while waiting); the job
    /// is then dropped unexecuted.
    pub fn run_on_event_loop(&self, job: Job) -> bool {
        if *self.shared.loop_thread.lock().unwrap() == Some(thread::current().id()) {
            job();
            return true;
        }

        let tag = {
            let mut jobs = self.shared.jobs.lock().unwrap();
            if !jobs.running {
                debug!("dispatcher thread not running");
                return false;
            }

            // wake the loop first; if the eventfd write fails nothing was
            // queued and the caller simply gets a failure
            if let Err(e) = nix::unistd::write(&self.shared.exec, &1u64.to_ne_bytes()) {
                error!("failed to write to the exec event fd: {e}");
                return false;
            }

            let tag = jobs.next_tag;
            jobs.next_tag += 1;
            jobs.queue.push_back((tag, job));
            tag
        };

        let mut jobs = self.shared.jobs.lock().unwrap();
        loop {
            if jobs.last_done >= tag {
                return true;
            }
            if !jobs.running {
                warn!("dispatcher stopped while waiting for a queued call");
                return false;
            }

            let (guard, timed_out) = self
                .jobs_wait_timeout(jobs, Duration::from_secs(1));
            jobs = guard;
            if timed_out && jobs.last_done < tag {
                warn!("still waiting for the event loop to run a queued call");
            }
        }
    }

    fn jobs_wait_timeout<'a>(
        &self,
        guard: std::sync::MutexGuard<'a, JobQueue>,
        timeout: Duration,
    ) -> (std::sync::MutexGuard<'a, JobQueue>, bool) {
        match self.shared.jobs_cond.wait_timeout(guard, timeout) {
            Ok((guard, result)) => (guard, result.timed_out()),
            Err(poisoned) => (poisoned.into_inner().0, false),
        }
    }

    /// Convenience wrapper: runs `f` on the event loop and returns its value.
    pub fn call_in_event_loop<R, F>(&self, f: F) -> Result<R, Error>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = slot.clone();

        if !self.run_on_event_loop(Box::new(move || {
            *out.lock().unwrap() = Some(f());
        })) {
            return Err(Error::NotConnected);
        }

        let result = slot.lock().unwrap().take();
        result.ok_or(Error::NotConnected)
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

fn read_eventfd(fd: &EventFd) {
    let mut value = [0u8; 8];
    if let Err(e) = nix::unistd::read(fd, &mut value) {
        if e != nix::errno::Errno::EAGAIN {
            error!("failed to read eventfd: {e}");
        }
    }
}

/// Applies the engine's multiplexer requests to the loop-local watch and
/// timeout sets.
fn sync_engine_requests(
    channel: &Arc<Mutex<Channel>>,
    watches: &mut WatchSet,
    timeouts: &mut TimeoutQueue,
) {
    let (watch_reqs, timer_reqs) = {
        let mut ch = channel.lock().unwrap();
        (ch.take_watch_requests(), ch.take_timer_requests())
    };

    for req in watch_reqs {
        match req {
            WatchRequest::Add {
                id,
                fd,
                flags,
                enabled,
            } => {
                if let Err(e) = watches.add(id, fd, flags, enabled) {
                    error!("failed to register bus watch: {e}");
                }
            }
            WatchRequest::Toggle { id, flags, enabled } => match watches.tag_of(id) {
                Some(tag) => watches.toggle(tag, flags, enabled),
                None => debug!("toggle for unknown watch {id}"),
            },
            WatchRequest::Remove { id } => {
                if let Some(tag) = watches.tag_of(id) {
                    watches.remove(tag);
                }
            }
        }
    }

    for req in timer_reqs {
        match req {
            TimerRequest::Add { id, interval } => timeouts.add(id, interval),
            TimerRequest::Remove { id } => timeouts.remove(id),
        }
    }
}

fn event_loop(shared: &Shared, channel: &Arc<Mutex<Channel>>, router: &DispatchRouter) {
    *shared.loop_thread.lock().unwrap() = Some(thread::current().id());
    run_event_loop(shared, channel, router);
    loop_teardown(shared);
}

/// Shared exit path: whatever made the loop return, callers queued behind it
/// must not be left waiting.
fn loop_teardown(shared: &Shared) {
    *shared.loop_thread.lock().unwrap() = None;

    let mut jobs = shared.jobs.lock().unwrap();
    jobs.running = false;
    jobs.queue.clear();
    shared.jobs_cond.notify_all();
}

fn run_event_loop(shared: &Shared, channel: &Arc<Mutex<Channel>>, router: &DispatchRouter) {
    let mut watches = match WatchSet::new() {
        Ok(w) => w,
        Err(e) => {
            error!("failed to create the watch multiplexer: {e}");
            return;
        }
    };
    let mut timeouts = match TimeoutQueue::new() {
        Ok(t) => t,
        Err(e) => {
            error!("failed to create the timeout multiplexer: {e}");
            return;
        }
    };

    sync_engine_requests(channel, &mut watches, &mut timeouts);

    let mut failures = 0u32;
    'outer: loop {
        // 1. drain the engine's dispatch queue; the lock is dropped before
        //    the router runs so handlers may call back into the connection
        loop {
            let item = channel.lock().unwrap().dispatch();
            match item {
                Some(item) => router(item),
                None => break,
            }
        }
        sync_engine_requests(channel, &mut watches, &mut timeouts);

        // 2. run closures queued for this thread, lock released per job
        loop {
            let job = {
                let mut jobs = shared.jobs.lock().unwrap();
                jobs.queue.pop_front()
            };
            let Some((tag, job)) = job else { break };

            job();

            let mut jobs = shared.jobs.lock().unwrap();
            jobs.last_done = tag;
            shared.jobs_cond.notify_all();
        }
        sync_engine_requests(channel, &mut watches, &mut timeouts);

        // 3. wait for something to happen
        let mut poll_fds = [
            PollFd::new(shared.death.as_fd(), PollFlags::POLLIN),
            PollFd::new(shared.wakeup.as_fd(), PollFlags::POLLIN),
            PollFd::new(shared.dispatch.as_fd(), PollFlags::POLLIN),
            PollFd::new(shared.exec.as_fd(), PollFlags::POLLIN),
            PollFd::new(watches.fd(), PollFlags::POLLIN),
            PollFd::new(timeouts.fd(), PollFlags::POLLIN),
        ];

        match poll(&mut poll_fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!("poll failed: {e}");
                failures += 1;
                if failures > 5 {
                    error!("too many poll errors, shutting down the event loop");
                    break 'outer;
                }
                continue;
            }
        }

        let revents: Vec<PollFlags> = poll_fds
            .iter()
            .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
            .collect();
        drop(poll_fds);

        // 4. service whatever woke us
        if revents[0].contains(PollFlags::POLLIN) {
            read_eventfd(&shared.death);
            break 'outer;
        }
        if revents[1].contains(PollFlags::POLLIN) {
            read_eventfd(&shared.wakeup);
        }
        if revents[2].contains(PollFlags::POLLIN) {
            read_eventfd(&shared.dispatch);
        }
        if revents[3].contains(PollFlags::POLLIN) {
            read_eventfd(&shared.exec);
        }

        if !revents[4].is_empty() {
            watches.process_events(poll_to_watch_flags(revents[4]), |watch, flags| {
                channel.lock().unwrap().handle_watch(watch, flags);
            });
            sync_engine_requests(channel, &mut watches, &mut timeouts);
        }

        if !revents[5].is_empty() {
            timeouts.process_event(|id| {
                let mut ch = channel.lock().unwrap();
                ch.handle_timeout(id);
                ch.take_timer_requests()
                    .into_iter()
                    .map(TimerCmd::from)
                    .collect()
            });
            sync_engine_requests(channel, &mut watches, &mut timeouts);
        }
    }
}

fn poll_to_watch_flags(flags: PollFlags) -> u32 {
    use bus_protocol::channel::{WATCH_ERROR, WATCH_HANGUP, WATCH_READABLE};

    let mut out = 0;
    if flags.contains(PollFlags::POLLIN) {
        out |= WATCH_READABLE;
    }
    if flags.contains(PollFlags::POLLERR) {
        out |= WATCH_ERROR;
    }
    if flags.contains(PollFlags::POLLHUP) {
        out |= WATCH_HANGUP;
    }
    out
}
