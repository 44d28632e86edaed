//! Lifecycle hooks fired by the job runner.
//!
//! A small capability interface instead of a task base class: the runner
//! calls whichever implementation it was given, and the production one
//! composes the push registry, the durable task store and the mailer.

use std::sync::Arc;

use crate::broadcast::event::{Notice, NoticeLevel, PushEvent};
use crate::broadcast::registry::ConnectionRegistry;
use crate::broadcast::task_store::TaskStore;
use crate::db::{user_repo, Database};
use crate::email::Mailer;
use crate::pipeline::progress::Checkpoint;
use crate::pipeline::{GenerationReport, PipelineError};
use crate::worker::job::GenerationJob;
use crate::worker::Services;

pub trait JobHooks: Send + Sync {
    fn on_success(&self, job: &GenerationJob, report: &GenerationReport);
    fn on_failure(&self, job: &GenerationJob, error: &PipelineError);
    fn on_retry(&self, job: &GenerationJob, attempt: u32, max_attempts: u32, error: &PipelineError);
}

/// Production hooks. Push delivery is best-effort; the task store write
/// is the durable record; mail goes out only on terminal outcomes.
pub struct Notifier {
    db: Database,
    registry: Arc<ConnectionRegistry>,
    tasks: Arc<TaskStore>,
    mailer: Arc<dyn Mailer>,
}

impl Notifier {
    pub fn new(services: &Services) -> Self {
        Self {
            db: services.db.clone(),
            registry: Arc::clone(&services.registry),
            tasks: Arc::clone(&services.tasks),
            mailer: Arc::clone(&services.mailer),
        }
    }

    fn mail(&self, user_id: i64, subject: &str, body: &str) {
        let user = match user_repo::find_by_id(&self.db, user_id) {
            Ok(Some(user)) => user,
            Ok(None) => {
                log::warn!("User {} not found, skipping mail '{}'", user_id, subject);
                return;
            }
            Err(e) => {
                log::error!("User lookup for mail failed: {}", e);
                return;
            }
        };
        if let Err(e) = self.mailer.send(&user.email, subject, body) {
            log::warn!("Mail '{}' to user {} not delivered: {}", subject, user_id, e);
        }
    }
}

impl JobHooks for Notifier {
    fn on_success(&self, job: &GenerationJob, report: &GenerationReport) {
        let notice = Notice::new(
            "Book completed",
            &format!("Your book '{}' is ready to read!", report.title),
            NoticeLevel::Success,
            Some(format!("/books/{}", report.book_id)),
        );
        self.registry
            .send_to_user(job.user_id, &PushEvent::notification(notice));

        self.mail(
            job.user_id,
            &format!("Your book '{}' is ready", report.title),
            &format!(
                "Your book '{}' was generated with {} pages and is ready to read.",
                report.title, report.pages_persisted
            ),
        );
    }

    fn on_failure(&self, job: &GenerationJob, error: &PipelineError) {
        // Progress stays frozen at the last successful checkpoint.
        let progress = self
            .tasks
            .get_with_fallback(&job.task_id)
            .map(|s| s.progress)
            .unwrap_or(0);

        let message = format!("Book generation failed: {error}");
        self.tasks.record(&Checkpoint::failed(
            job.book_id,
            &job.task_id,
            progress,
            message.clone(),
            error.to_string(),
        ));

        self.registry.send_to_user(
            job.user_id,
            &PushEvent::generation(crate::broadcast::event::GenerationUpdate {
                book_id: job.book_id,
                task_id: job.task_id.clone(),
                status: crate::broadcast::event::UpdateStatus::Failed,
                progress,
                message: message.clone(),
                current_step: Some("failed".to_string()),
            }),
        );

        let notice = Notice::new(
            "Generation failed",
            &message,
            NoticeLevel::Error,
            Some(format!("/books/{}", job.book_id)),
        );
        self.registry
            .send_to_user(job.user_id, &PushEvent::notification(notice));

        self.mail(
            job.user_id,
            "Book generation failed",
            &format!(
                "There was a problem generating your book: {error}. \
                 Please try again later."
            ),
        );
    }

    fn on_retry(&self, job: &GenerationJob, attempt: u32, max_attempts: u32, error: &PipelineError) {
        let progress = self
            .tasks
            .get_with_fallback(&job.task_id)
            .map(|s| s.progress)
            .unwrap_or(0);

        let mut checkpoint = Checkpoint::processing(
            job.book_id,
            &job.task_id,
            progress,
            "retrying",
            format!("Generation attempt failed, retrying ({attempt}/{max_attempts}): {error}"),
        );
        checkpoint.attempt = attempt;
        self.tasks.record(&checkpoint);

        self.registry.send_to_user(
            job.user_id,
            &PushEvent::generation(crate::broadcast::event::GenerationUpdate {
                book_id: job.book_id,
                task_id: job.task_id.clone(),
                status: crate::broadcast::event::UpdateStatus::Processing,
                progress,
                message: checkpoint.message.clone(),
                current_step: Some("retrying".to_string()),
            }),
        );
    }
}
