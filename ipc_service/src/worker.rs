// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A single FIFO worker thread for user callbacks. Handlers run here, never
//! on the bus event-loop thread, so a long handler cannot stall bus traffic.

use log::*;

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send>;

struct State {
    queue: VecDeque<Job>,
    running: bool,
    submitted: u64,
    completed: u64,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

pub struct HandlerQueue {
    inner: Arc<Inner>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl HandlerQueue {
    pub fn new(name: &str) -> HandlerQueue {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                running: true,
                submitted: 0,
                completed: 0,
            }),
            cond: Condvar::new(),
        });

        let worker = inner.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(&worker))
            .map_err(|e| error!("failed to spawn handler thread: {e}"))
            .ok();

        HandlerQueue {
            inner,
            thread: Mutex::new(thread),
        }
    }

    /// Queues a callback for execution, preserving submission order.
    pub fn post<F: FnOnce() + Send + 'static>(&self, job: F) {
        let mut state = self.inner.state.lock().unwrap();
        if !state.running {
            warn!("handler queue is stopped, dropping callback");
            return;
        }
        state.queue.push_back(Box::new(job));
        state.submitted += 1;
        self.inner.cond.notify_all();
    }

    /// Blocks until every callback queued before this call has completed.
    pub fn sync(&self) {
        let mut state = self.inner.state.lock().unwrap();
        let target = state.submitted;
        while state.completed < target && state.running {
            state = self.inner.cond.wait(state).unwrap();
        }
    }
}

impl Drop for HandlerQueue {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.running = false;
            self.inner.cond.notify_all();
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

fn worker_loop(inner: &Inner) {
    loop {
        let job = {
            let mut state = inner.state.lock().unwrap();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if !state.running {
                    return;
                }
                state = inner.cond.wait(state).unwrap();
            }
        };

        // a panicking handler must not take down the worker; every callback
        // invocation is caught at this boundary
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("a handler callback panicked");
        }

        let mut state = inner.state.lock().unwrap();
        state.completed += 1;
        inner.cond.notify_all();
    }
}
