//! Worker pool sizing and the bounded streaming executor.
//!
//! [`buffered_execution`] runs a function over a lazy sequence of items on a
//! [`WorkerPool`], keeping at most `max_in_flight` tasks outstanding and
//! yielding whatever finished during each poll interval.

use std::any::Any;
use std::fmt;
use std::iter::Fuse;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use thiserror::Error;
use tracing::debug;

use crate::error::SourcedError;

pub const DEFAULT_PARALLELISM: usize = 4;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    Io,
    Cpu,
    Both,
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Workload::Io => write!(f, "io"),
            Workload::Cpu => write!(f, "cpu"),
            Workload::Both => write!(f, "both"),
        }
    }
}

impl FromStr for Workload {
    type Err = SourcedError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "io" => Ok(Workload::Io),
            "cpu" => Ok(Workload::Cpu),
            "both" => Ok(Workload::Both),
            _ => Err(SourcedError::InvalidWorkload(value.to_string())),
        }
    }
}

pub fn available_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_PARALLELISM)
}

/// Number of workers to use for the given kind of workload on this machine.
pub fn workers(heavy: Workload) -> usize {
    workers_for(heavy, available_parallelism())
}

pub fn workers_for(heavy: Workload, parallelism: usize) -> usize {
    let parallelism = parallelism.max(1);
    let count = match heavy {
        Workload::Io => parallelism * 4,
        Workload::Cpu => (parallelism as f64 * 1.25).round() as usize,
        Workload::Both => parallelism * 2,
    };
    count.max(1)
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of OS threads fed from a shared job queue.
///
/// Handles are cheap to clone. The queue closes and the threads are joined
/// once the last handle is dropped; jobs already queued still run.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    size: usize,
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self, SourcedError> {
        if size == 0 {
            return Err(SourcedError::InvalidArgument(
                "worker pool size must be at least 1".to_string(),
            ));
        }

        let (sender, receiver) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(size);
        for worker_id in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("sourced-worker-{worker_id}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
                .map_err(|err| SourcedError::PoolSpawn(err.to_string()))?;
            handles.push(handle);
        }
        debug!(workers = size, "worker pool started");

        Ok(Self {
            inner: Arc::new(PoolInner {
                size,
                sender: Mutex::new(Some(sender)),
                handles: Mutex::new(handles),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn submit<F>(&self, job: F) -> Result<(), SourcedError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self
            .inner
            .sender
            .lock()
            .map_err(|_| SourcedError::PoolShutdown)?;
        let sender = guard.as_ref().ok_or(SourcedError::PoolShutdown)?;
        sender
            .send(Box::new(job))
            .map_err(|_| SourcedError::PoolShutdown)
    }

    /// Stops accepting jobs and waits for the queued ones to finish.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl PoolInner {
    fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handles = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles),
            Err(_) => return,
        };
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        debug!(workers = self.size, "worker pool stopped");
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task panicked: {message}")]
pub struct TaskPanic {
    pub message: String,
}

pub type TaskResult<R> = Result<R, TaskPanic>;

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ToppingUp,
    Waiting,
    Drained,
}

/// Iterator returned by [`buffered_execution`].
///
/// Each item is the set of tasks that completed during one poll interval.
pub struct BufferedExecution<I, F, R>
where
    I: Iterator,
{
    pool: WorkerPool,
    items: Fuse<I>,
    func: Arc<F>,
    max_in_flight: usize,
    poll_interval: Duration,
    outstanding: usize,
    done_tx: Sender<TaskResult<R>>,
    done_rx: Receiver<TaskResult<R>>,
    phase: Phase,
    closed: bool,
}

pub fn buffered_execution<I, F, R>(
    pool: &WorkerPool,
    items: I,
    func: F,
    max_in_flight: usize,
) -> Result<BufferedExecution<I::IntoIter, F, R>, SourcedError>
where
    I: IntoIterator,
    I::Item: Send + 'static,
    F: Fn(I::Item) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    if max_in_flight == 0 {
        return Err(SourcedError::InvalidArgument(
            "max_in_flight must be at least 1".to_string(),
        ));
    }

    let (done_tx, done_rx) = unbounded();
    Ok(BufferedExecution {
        pool: pool.clone(),
        items: items.into_iter().fuse(),
        func: Arc::new(func),
        max_in_flight,
        poll_interval: DEFAULT_POLL_INTERVAL,
        outstanding: 0,
        done_tx,
        done_rx,
        phase: Phase::ToppingUp,
        closed: false,
    })
}

impl<I, F, R> BufferedExecution<I, F, R>
where
    I: Iterator,
    I::Item: Send + 'static,
    F: Fn(I::Item) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Stops pulling new items. Iteration continues until every task already
    /// submitted has reported back, then ends.
    pub fn close(&mut self) {
        if !self.closed {
            debug!(outstanding = self.outstanding, "executor closed; draining");
        }
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn top_up(&mut self) -> Result<(), SourcedError> {
        while !self.closed && self.outstanding < self.max_in_flight {
            let Some(item) = self.items.next() else {
                break;
            };
            let func = Arc::clone(&self.func);
            let done_tx = self.done_tx.clone();
            self.pool.submit(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| func(item)))
                    .map_err(|payload| TaskPanic {
                        message: panic_message(payload),
                    });
                let _ = done_tx.send(result);
            })?;
            self.outstanding += 1;
        }
        Ok(())
    }

    fn wait_for_completions(&mut self) -> Vec<TaskResult<R>> {
        let deadline = Instant::now() + self.poll_interval;
        let mut completed = Vec::new();
        while self.outstanding > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(remaining) {
                Ok(result) => {
                    completed.push(result);
                    self.outstanding -= 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        completed
    }
}

impl<I, F, R> Iterator for BufferedExecution<I, F, R>
where
    I: Iterator,
    I::Item: Send + 'static,
    F: Fn(I::Item) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    type Item = Result<Vec<TaskResult<R>>, SourcedError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.phase {
                Phase::Drained => return None,
                Phase::ToppingUp => {
                    if let Err(err) = self.top_up() {
                        self.phase = Phase::Drained;
                        return Some(Err(err));
                    }
                    if self.outstanding == 0 {
                        self.phase = Phase::Drained;
                        return None;
                    }
                    self.phase = Phase::Waiting;
                }
                Phase::Waiting => {
                    let completed = self.wait_for_completions();
                    self.phase = Phase::ToppingUp;
                    return Some(Ok(completed));
                }
            }
        }
    }
}
