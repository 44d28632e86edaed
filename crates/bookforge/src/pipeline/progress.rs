use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::broadcast::event::{GenerationUpdate, PushEvent, UpdateStatus};
use crate::broadcast::registry::ConnectionRegistry;
use crate::broadcast::task_store::TaskStore;
use crate::worker::job::GenerationJob;

/// A progress checkpoint emitted at a fixed point in the pipeline.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub book_id: i64,
    pub task_id: String,
    pub status: UpdateStatus,
    pub progress: u8,
    pub message: String,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub attempt: u32,
}

impl Checkpoint {
    pub fn processing(
        book_id: i64,
        task_id: &str,
        progress: u8,
        step: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            book_id,
            task_id: task_id.to_string(),
            status: UpdateStatus::Processing,
            progress,
            message: message.into(),
            current_step: Some(step.to_string()),
            error: None,
            attempt: 1,
        }
    }

    pub fn completed(book_id: i64, task_id: &str, message: impl Into<String>) -> Self {
        Self {
            book_id,
            task_id: task_id.to_string(),
            status: UpdateStatus::Completed,
            progress: 100,
            message: message.into(),
            current_step: Some("completed".to_string()),
            error: None,
            attempt: 1,
        }
    }

    pub fn failed(
        book_id: i64,
        task_id: &str,
        progress: u8,
        message: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            book_id,
            task_id: task_id.to_string(),
            status: UpdateStatus::Failed,
            progress,
            message: message.into(),
            current_step: Some("failed".to_string()),
            error: Some(error.into()),
            attempt: 1,
        }
    }

    fn to_update(&self) -> GenerationUpdate {
        GenerationUpdate {
            book_id: self.book_id,
            task_id: self.task_id.clone(),
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            current_step: self.current_step.clone(),
        }
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, checkpoint: Checkpoint);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _checkpoint: Checkpoint) {}
}

/// Production reporter. Every checkpoint feeds two independent sinks:
/// the durable task store (source of truth) and the push registry
/// (best-effort). Progress is clamped to be non-decreasing for the
/// lifetime of the job, so a retry re-running early steps never makes
/// observed progress move backwards.
pub struct PushProgress {
    registry: Arc<ConnectionRegistry>,
    tasks: Arc<TaskStore>,
    user_id: i64,
    attempt: AtomicU32,
    floor: AtomicU8,
}

impl PushProgress {
    pub fn new(job: &GenerationJob, registry: Arc<ConnectionRegistry>, tasks: Arc<TaskStore>) -> Self {
        Self {
            registry,
            tasks,
            user_id: job.user_id,
            attempt: AtomicU32::new(1),
            floor: AtomicU8::new(0),
        }
    }

    pub fn set_attempt(&self, attempt: u32) {
        self.attempt.store(attempt, Ordering::Relaxed);
    }

    pub fn last_progress(&self) -> u8 {
        self.floor.load(Ordering::Relaxed)
    }
}

impl ProgressReporter for PushProgress {
    fn report(&self, mut checkpoint: Checkpoint) {
        let previous = self.floor.fetch_max(checkpoint.progress, Ordering::Relaxed);
        checkpoint.progress = checkpoint.progress.max(previous);
        checkpoint.attempt = self.attempt.load(Ordering::Relaxed);

        self.tasks.record(&checkpoint);
        self.registry
            .send_to_user(self.user_id, &PushEvent::generation(checkpoint.to_update()));
    }
}
