use crate::pipeline::{GenerationReport, PipelineError};

/// One dispatched generation request. The task id survives retries:
/// every attempt of a run polls and pushes under the same id.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub task_id: String,
    pub book_id: i64,
    pub user_id: i64,
}

impl GenerationJob {
    pub fn new(book_id: i64, user_id: i64) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            book_id,
            user_id,
        }
    }

    pub fn with_task_id(task_id: &str, book_id: i64, user_id: i64) -> Self {
        Self {
            task_id: task_id.to_string(),
            book_id,
            user_id,
        }
    }
}

/// Final result of a job after retries are resolved.
#[derive(Debug)]
pub struct JobOutcome {
    pub task_id: String,
    pub book_id: i64,
    pub success: bool,
    pub attempts: u32,
    pub pages_persisted: u32,
    pub images_generated: u32,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn success(job: &GenerationJob, attempts: u32, report: &GenerationReport) -> Self {
        Self {
            task_id: job.task_id.clone(),
            book_id: job.book_id,
            success: true,
            attempts,
            pages_persisted: report.pages_persisted,
            images_generated: report.images_generated,
            error: None,
        }
    }

    pub fn failure(job: &GenerationJob, attempts: u32, error: &PipelineError) -> Self {
        Self {
            task_id: job.task_id.clone(),
            book_id: job.book_id,
            success: false,
            attempts,
            pages_persisted: 0,
            images_generated: 0,
            error: Some(error.to_string()),
        }
    }
}
