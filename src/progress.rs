use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started {
        task: TaskId,
        description: String,
        total: Option<u64>,
        completed: u64,
    },
    Advanced {
        task: TaskId,
        advance: u64,
        description: Option<String>,
    },
    Finished {
        task: TaskId,
    },
}

impl ProgressEvent {
    pub fn task(&self) -> TaskId {
        match self {
            ProgressEvent::Started { task, .. }
            | ProgressEvent::Advanced { task, .. }
            | ProgressEvent::Finished { task } => *task,
        }
    }
}

/// Receives progress events from the pipelines. Called from worker threads.
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started {
                task,
                description,
                total,
                completed,
            } => debug!(task = task.get(), ?total, completed, "{description}"),
            ProgressEvent::Advanced {
                task,
                description: Some(description),
                ..
            } => debug!(task = task.get(), "{description}"),
            ProgressEvent::Advanced { .. } => {}
            ProgressEvent::Finished { task } => debug!(task = task.get(), "finished"),
        }
    }
}

/// Handle for one task on a sink; emits `Finished` when dropped.
pub struct ProgressTask {
    sink: Arc<dyn ProgressSink>,
    id: TaskId,
}

impl ProgressTask {
    pub fn start(
        sink: &Arc<dyn ProgressSink>,
        description: impl Into<String>,
        total: Option<u64>,
    ) -> Self {
        Self::start_at(sink, description, total, 0)
    }

    pub fn start_at(
        sink: &Arc<dyn ProgressSink>,
        description: impl Into<String>,
        total: Option<u64>,
        completed: u64,
    ) -> Self {
        let id = TaskId::next();
        sink.event(ProgressEvent::Started {
            task: id,
            description: description.into(),
            total,
            completed,
        });
        Self {
            sink: Arc::clone(sink),
            id,
        }
    }

    pub fn advance(&self, advance: u64) {
        if advance == 0 {
            return;
        }
        self.sink.event(ProgressEvent::Advanced {
            task: self.id,
            advance,
            description: None,
        });
    }

    pub fn step(&self, description: impl Into<String>) {
        self.sink.event(ProgressEvent::Advanced {
            task: self.id,
            advance: 1,
            description: Some(description.into()),
        });
    }

    pub fn describe(&self, description: impl Into<String>) {
        self.sink.event(ProgressEvent::Advanced {
            task: self.id,
            advance: 0,
            description: Some(description.into()),
        });
    }
}

impl Drop for ProgressTask {
    fn drop(&mut self) {
        self.sink.event(ProgressEvent::Finished { task: self.id });
    }
}
