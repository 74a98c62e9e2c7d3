//! Named worker threads with FIFO job inboxes.
//!
//! Every threaded module, the shared main worker and the remote server own
//! one [`WorkerHandle`]. Workers are reference counted: they come into being
//! on first request and are joined when the last user releases them.
//!
//! Dispatch rules:
//! - a job dispatched from the worker's own thread runs in place;
//! - otherwise it is enqueued and runs in FIFO order, optionally with an
//!   awaitable reply (bounded timeout supported);
//! - a stop request drains the queue, then pending senders disconnect and
//!   still-waiting callers observe a cancellation error.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// A unit of work executed on a worker thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum Directive {
    Run(Job),
    Stop,
}

/// Cheap, cloneable handle to a named worker.
#[derive(Clone)]
pub struct WorkerHandle {
    name: String,
    tx: Sender<Directive>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when called from the worker's own thread.
    pub fn is_current(&self) -> bool {
        thread::current().name() == Some(self.name.as_str())
    }

    /// Fire-and-forget dispatch. Runs in place when already on the worker.
    pub fn dispatch(&self, job: Job) -> Result<()> {
        if self.is_current() {
            job();
            return Ok(());
        }
        self.tx
            .send(Directive::Run(job))
            .map_err(|_| CoreError::DispatchCancelled {
                worker: self.name.clone(),
            })
    }

    /// Dispatches `f` and blocks until its result is available.
    pub fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }
        let (reply_tx, reply_rx) = bounded(1);
        self.dispatch(Box::new(move || {
            let _ = reply_tx.send(f());
        }))?;
        reply_rx.recv().map_err(|_| CoreError::DispatchCancelled {
            worker: self.name.clone(),
        })
    }

    /// Like [`run`](Self::run) but gives up waiting after `timeout`. The job
    /// itself is not cancelled; hooks and state transitions must run to a
    /// well-defined end once started.
    pub fn run_timeout<T, F>(&self, f: F, timeout: Duration) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }
        let (reply_tx, reply_rx) = bounded(1);
        self.dispatch(Box::new(move || {
            let _ = reply_tx.send(f());
        }))?;
        reply_rx.recv_timeout(timeout).map_err(|err| match err {
            crossbeam_channel::RecvTimeoutError::Timeout => CoreError::DispatchTimeout {
                worker: self.name.clone(),
                millis: timeout.as_millis() as u64,
            },
            crossbeam_channel::RecvTimeoutError::Disconnected => CoreError::DispatchCancelled {
                worker: self.name.clone(),
            },
        })
    }
}

struct WorkerEntry {
    tx: Sender<Directive>,
    refs: usize,
    done_rx: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

/// Registry of all worker threads in the process.
pub struct ThreadManager {
    workers: Mutex<HashMap<String, WorkerEntry>>,
    drain_timeout: Duration,
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadManager {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            drain_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Returns a handle to the named worker, creating the thread on first
    /// request. Each call counts one reference.
    pub fn get_or_create(&self, name: &str) -> Result<WorkerHandle> {
        let mut workers = self.workers.lock().expect("worker table poisoned");
        if let Some(entry) = workers.get_mut(name) {
            entry.refs += 1;
            return Ok(WorkerHandle {
                name: name.to_string(),
                tx: entry.tx.clone(),
            });
        }

        let (tx, rx) = unbounded::<Directive>();
        let (done_tx, done_rx) = bounded(1);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for directive in rx.iter() {
                    match directive {
                        Directive::Run(job) => job(),
                        Directive::Stop => break,
                    }
                }
                let _ = done_tx.send(());
            })?;
        debug!(worker = name, "created worker thread");
        workers.insert(
            name.to_string(),
            WorkerEntry {
                tx: tx.clone(),
                refs: 1,
                done_rx,
                join: Some(join),
            },
        );
        Ok(WorkerHandle {
            name: name.to_string(),
            tx,
        })
    }

    /// Drops one reference to the named worker. When the count reaches zero
    /// the queue is drained and the thread joined (bounded by the drain
    /// timeout; a hanging worker is detached with a warning).
    pub fn release(&self, name: &str) {
        let entry = {
            let mut workers = self.workers.lock().expect("worker table poisoned");
            match workers.get_mut(name) {
                Some(entry) => {
                    entry.refs -= 1;
                    if entry.refs > 0 {
                        return;
                    }
                    workers.remove(name)
                }
                None => {
                    warn!(worker = name, "release of unknown worker ignored");
                    return;
                }
            }
        };
        if let Some(entry) = entry {
            self.stop_entry(name, entry);
        }
    }

    /// Stops every worker regardless of reference counts. Used on shutdown.
    pub fn shutdown(&self) {
        let drained: Vec<(String, WorkerEntry)> = {
            let mut workers = self.workers.lock().expect("worker table poisoned");
            workers.drain().collect()
        };
        for (name, entry) in drained {
            self.stop_entry(&name, entry);
        }
    }

    pub fn names(&self) -> Vec<String> {
        let workers = self.workers.lock().expect("worker table poisoned");
        workers.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        let workers = self.workers.lock().expect("worker table poisoned");
        workers.contains_key(name)
    }

    fn stop_entry(&self, name: &str, mut entry: WorkerEntry) {
        // The stop marker sits behind all queued jobs, so the queue drains
        // before the thread exits.
        let _ = entry.tx.send(Directive::Stop);
        if thread::current().name() == Some(name) {
            // A worker releasing itself cannot join its own thread.
            return;
        }
        match entry.done_rx.recv_timeout(self.drain_timeout) {
            Ok(()) => {
                if let Some(join) = entry.join.take() {
                    let _ = join.join();
                }
                debug!(worker = name, "joined worker thread");
            }
            Err(_) => {
                warn!(worker = name, timeout = ?self.drain_timeout, "worker did not drain in time, detaching");
            }
        }
    }
}
