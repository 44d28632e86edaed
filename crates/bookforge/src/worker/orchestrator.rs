//! Dispatch gate and retrying job runner.
//!
//! Dispatch validates the book's state and claims it atomically, then
//! hands the job to the pool and returns immediately. The runner owns
//! the retry/backoff policy and always resolves a terminal state: a
//! book is never left in processing after its job ends.

use std::sync::Arc;

use serde::Serialize;

use crate::book::BookStatus;
use crate::broadcast::event::UpdateStatus;
use crate::broadcast::task_store::TaskSnapshot;
use crate::db::book_repo;
use crate::error::{BookforgeError, Result};
use crate::pipeline::progress::PushProgress;
use crate::pipeline::{GenerationContext, GenerationPipeline, GenerationReport, PipelineError};
use crate::worker::hooks::JobHooks;
use crate::worker::job::{GenerationJob, JobOutcome};
use crate::worker::pool::WorkerPool;
use crate::worker::Services;

/// Returned by `dispatch`: the caller polls or subscribes with this.
#[derive(Debug, Clone, Serialize)]
pub struct TaskHandle {
    pub task_id: String,
    pub book_id: i64,
    pub status: UpdateStatus,
}

pub struct Orchestrator {
    services: Arc<Services>,
    pool: WorkerPool,
}

impl Orchestrator {
    pub fn new(services: Arc<Services>, worker_count: usize) -> Self {
        let pool = WorkerPool::new(Arc::clone(&services), worker_count);
        Self { services, pool }
    }

    /// Starts generation for a book. Rejected unless the book is in
    /// draft or failed, which also guarantees at most one active job per
    /// book. Returns without waiting for the job.
    pub fn dispatch(&self, book_id: i64, user_id: i64) -> Result<TaskHandle> {
        book_repo::claim_for_processing(&self.services.db, book_id, user_id)?;

        let job = GenerationJob::new(book_id, user_id);
        self.services.tasks.begin(&job);

        if let Err(e) = self.pool.submit(job.clone()) {
            // The claim already moved the book to processing; resolve both
            // the book and the task row so the rejected dispatch does not
            // strand either in a non-terminal state.
            if let Err(revert) =
                book_repo::update_status(&self.services.db, book_id, BookStatus::Failed)
            {
                log::error!("Could not resolve book {} after submit failure: {}", book_id, revert);
            }
            self.services.tasks.record(&crate::pipeline::Checkpoint::failed(
                book_id,
                &job.task_id,
                0,
                "Generation could not be started",
                e.to_string(),
            ));
            return Err(e.into());
        }

        log::info!("Dispatched job {} for book {}", job.task_id, book_id);
        Ok(TaskHandle {
            task_id: job.task_id,
            book_id,
            status: UpdateStatus::Processing,
        })
    }

    /// Polling fallback for clients without a live push channel.
    pub fn job_status(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.services.tasks.get_with_fallback(task_id)
    }

    pub fn try_recv_outcome(&self) -> Option<JobOutcome> {
        self.pool.try_recv_result()
    }

    pub fn recv_outcome(&self) -> Option<JobOutcome> {
        self.pool.recv_result()
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }

    /// Shuts down and joins all workers.
    pub fn join(self) {
        self.pool.shutdown();
        self.pool.wait();
    }
}

/// Executes one job to completion, retrying retryable failures up to the
/// configured attempt count. Called from a worker's own runtime.
pub(crate) async fn run_job(
    services: &Services,
    pipeline: &GenerationPipeline,
    hooks: &dyn JobHooks,
    job: &GenerationJob,
) -> JobOutcome {
    let settings = services.generation;
    let progress = PushProgress::new(
        job,
        Arc::clone(&services.registry),
        Arc::clone(&services.tasks),
    );

    let mut attempt = 1u32;
    loop {
        progress.set_attempt(attempt);
        let ctx = GenerationContext::new(job.clone(), attempt);

        match run_attempt(pipeline, ctx, &progress, &settings).await {
            Ok(report) => {
                hooks.on_success(job, &report);
                return JobOutcome::success(job, attempt, &report);
            }
            Err(error) if error.is_retryable() && attempt < settings.max_attempts => {
                log::warn!(
                    "Job {} attempt {}/{} failed: {}",
                    job.task_id,
                    attempt,
                    settings.max_attempts,
                    error
                );
                hooks.on_retry(job, attempt, settings.max_attempts, &error);
                if settings.retry_delay_secs > 0 {
                    tokio::time::sleep(settings.retry_delay()).await;
                }
                attempt += 1;
            }
            Err(error) => {
                log::error!(
                    "Job {} failed terminally after {} attempt(s): {}",
                    job.task_id,
                    attempt,
                    error
                );
                resolve_failed(services, job);
                hooks.on_failure(job, &error);
                return JobOutcome::failure(job, attempt, &error);
            }
        }
    }
}

/// One attempt under the soft/hard time limits. The soft limit only
/// logs; the hard limit terminates the attempt as a retryable timeout.
async fn run_attempt(
    pipeline: &GenerationPipeline,
    ctx: GenerationContext,
    progress: &PushProgress,
    settings: &crate::config::GenerationSettings,
) -> std::result::Result<GenerationReport, PipelineError> {
    let deadline = tokio::time::Instant::now() + settings.hard_timeout();
    let run = pipeline.run(ctx, progress);
    tokio::pin!(run);

    match tokio::time::timeout(settings.soft_timeout(), &mut run).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!(
                "Job exceeded the soft time limit ({}s), still running",
                settings.soft_timeout_secs
            );
            match tokio::time::timeout_at(deadline, &mut run).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout {
                    limit_secs: settings.hard_timeout_secs,
                }),
            }
        }
    }
}

/// Terminal resolution: the book must not stay in processing.
fn resolve_failed(services: &Services, job: &GenerationJob) {
    match book_repo::update_status(&services.db, job.book_id, BookStatus::Failed) {
        Ok(_) => {}
        Err(BookforgeError::NotFound(_)) => {
            // The book vanished mid-run; nothing to resolve.
        }
        Err(e) => log::warn!("Could not mark book {} as failed: {}", job.book_id, e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ai::{ImageGenerator, ServiceError, TextGenerator};
    use crate::book::{BookStyle, NewBook};
    use crate::broadcast::event::{EventKind, PushEvent};
    use crate::broadcast::registry::{ChannelError, ConnectionRegistry, PushChannel};
    use crate::broadcast::task_store::TaskStore;
    use crate::config::GenerationSettings;
    use crate::db::{page_repo, user_repo, Database};
    use crate::email::LogMailer;
    use crate::error::BusinessRuleError;
    use crate::storage::FileStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn page_count_from_prompt(prompt: &str) -> u32 {
        prompt
            .split("exactly ")
            .nth(1)
            .and_then(|rest| rest.split(' ').next())
            .and_then(|n| n.parse().ok())
            .unwrap_or(5)
    }

    /// Scripted text collaborator: fails the first `fail_times` calls,
    /// optionally marks one page so the image mock fails it, optionally
    /// delays to simulate a slow service.
    #[derive(Default)]
    pub(crate) struct ScriptedText {
        pub fail_times: AtomicU32,
        pub fatal: std::sync::atomic::AtomicBool,
        pub calls: AtomicU32,
        pub sentinel_page: AtomicU32,
        pub delay_ms: AtomicU64,
    }

    #[async_trait]
    impl TextGenerator for ScriptedText {
        async fn generate(&self, prompt: &str) -> std::result::Result<String, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(if self.fatal.load(Ordering::SeqCst) {
                    ServiceError::fatal("text-generation", "invalid configuration")
                } else {
                    ServiceError::retryable("text-generation", "transient upstream error")
                });
            }

            let pages = page_count_from_prompt(prompt);
            let sentinel = self.sentinel_page.load(Ordering::SeqCst);
            let mut story = String::new();
            for n in 1..=pages {
                if n == sentinel {
                    story.push_str(&format!("PAGE {n}: FAILPAGE scene {n}.\n"));
                } else {
                    story.push_str(&format!("PAGE {n}: A scene on page {n}.\n"));
                }
            }
            Ok(story)
        }
    }

    /// Image collaborator that fails any prompt carrying the sentinel.
    #[derive(Default)]
    pub(crate) struct ScriptedImages {
        pub fail_all: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ImageGenerator for ScriptedImages {
        async fn generate(
            &self,
            description: &str,
            _style: BookStyle,
        ) -> std::result::Result<Vec<u8>, ServiceError> {
            if self.fail_all.load(Ordering::SeqCst) || description.contains("FAILPAGE") {
                return Err(ServiceError::retryable("image-generation", "render failed"));
            }
            Ok(vec![0u8; 16])
        }
    }

    pub(crate) struct Collector(pub Mutex<Vec<PushEvent>>);

    impl Collector {
        pub fn arc() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        pub fn generation_progress(&self) -> Vec<u8> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| e.generation_update().map(|u| u.progress))
                .collect()
        }
    }

    impl PushChannel for Collector {
        fn send(&self, frame: &PushEvent) -> std::result::Result<(), ChannelError> {
            self.0.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    pub(crate) struct TestFixture {
        pub db: Database,
        pub registry: Arc<ConnectionRegistry>,
        pub tasks: Arc<TaskStore>,
        pub text: Arc<ScriptedText>,
        pub images: Arc<ScriptedImages>,
        pub user_id: i64,
        _media: TempDir,
    }

    pub(crate) fn test_services_with(settings: GenerationSettings) -> (Arc<Services>, TestFixture) {
        let db = Database::open_in_memory().unwrap();
        let user = user_repo::insert(&db, "owner@example.com", Some("Owner"), 20).unwrap();
        let registry = Arc::new(ConnectionRegistry::new());
        let tasks = Arc::new(TaskStore::with_database(db.clone()));
        let text = Arc::new(ScriptedText::default());
        let images = Arc::new(ScriptedImages::default());
        let media = TempDir::new().unwrap();

        let services = Arc::new(Services {
            db: db.clone(),
            text: text.clone(),
            images: images.clone(),
            storage: Arc::new(FileStorage::new(media.path())),
            registry: Arc::clone(&registry),
            tasks: Arc::clone(&tasks),
            mailer: Arc::new(LogMailer),
            generation: settings,
        });

        let fixture = TestFixture {
            db,
            registry,
            tasks,
            text,
            images,
            user_id: user.id,
            _media: media,
        };
        (services, fixture)
    }

    pub(crate) fn test_services() -> (Arc<Services>, TestFixture) {
        test_services_with(GenerationSettings {
            max_attempts: 3,
            retry_delay_secs: 0,
            soft_timeout_secs: 300,
            hard_timeout_secs: 900,
            image_concurrency: 2,
        })
    }

    fn create_book(fx: &TestFixture, page_count: u32) -> i64 {
        let new = NewBook::new("The Lost Fox", None, page_count, BookStyle::Cartoon, fx.user_id)
            .unwrap();
        book_repo::insert(&fx.db, &new).unwrap().id
    }

    fn book_status(fx: &TestFixture, book_id: i64) -> BookStatus {
        book_repo::find_by_id(&fx.db, book_id).unwrap().unwrap().status
    }

    #[test]
    fn test_happy_path_end_to_end() {
        let (services, fx) = test_services();
        let orchestrator = Orchestrator::new(services, 1);
        let book_id = create_book(&fx, 5);

        let collector = Collector::arc();
        fx.registry.register(fx.user_id, collector.clone());

        let handle = orchestrator.dispatch(book_id, fx.user_id).unwrap();
        assert_eq!(handle.status, UpdateStatus::Processing);

        let outcome = orchestrator.recv_outcome().unwrap();
        assert!(outcome.success, "job failed: {:?}", outcome.error);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.pages_persisted, 5);
        assert_eq!(outcome.images_generated, 5);

        assert_eq!(book_status(&fx, book_id), BookStatus::Completed);
        assert_eq!(page_repo::list_for_book(&fx.db, book_id).unwrap().len(), 5);

        // Push events: non-decreasing progress through the fixed
        // boundaries, ending at 100.
        let progress = collector.generation_progress();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
        for boundary in [20, 40, 60, 80] {
            assert!(progress.contains(&boundary), "missing {boundary}: {progress:?}");
        }
        assert_eq!(*progress.last().unwrap(), 100);

        // A completion notification rode along with the updates.
        let kinds: Vec<EventKind> = collector.0.lock().unwrap().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::Notification));

        // Polling fallback agrees with the push stream.
        let snapshot = orchestrator.job_status(&handle.task_id).unwrap();
        assert_eq!(snapshot.status, UpdateStatus::Completed);
        assert_eq!(snapshot.progress, 100);

        orchestrator.join();
    }

    #[test]
    fn test_transient_failures_recover_within_max_attempts() {
        let (services, fx) = test_services();
        let orchestrator = Orchestrator::new(services, 1);
        let book_id = create_book(&fx, 5);

        let collector = Collector::arc();
        fx.registry.register(fx.user_id, collector.clone());

        // Fails twice, succeeds on attempt 3 of 3.
        fx.text.fail_times.store(2, Ordering::SeqCst);

        orchestrator.dispatch(book_id, fx.user_id).unwrap();
        let outcome = orchestrator.recv_outcome().unwrap();

        assert!(outcome.success, "job failed: {:?}", outcome.error);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(fx.text.calls.load(Ordering::SeqCst), 3);
        assert_eq!(book_status(&fx, book_id), BookStatus::Completed);

        // Intermediate events showed the retry.
        let retried = collector
            .0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.generation_update())
            .any(|u| u.current_step.as_deref() == Some("retrying"));
        assert!(retried);

        orchestrator.join();
    }

    #[test]
    fn test_exhausted_retries_resolve_to_failed() {
        let (services, fx) = test_services();
        let orchestrator = Orchestrator::new(services, 1);
        let book_id = create_book(&fx, 5);

        fx.text.fail_times.store(99, Ordering::SeqCst);

        let handle = orchestrator.dispatch(book_id, fx.user_id).unwrap();
        let outcome = orchestrator.recv_outcome().unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 3);
        // No further attempt after the limit.
        assert_eq!(fx.text.calls.load(Ordering::SeqCst), 3);

        // Terminal resolution: never left in processing.
        assert_eq!(book_status(&fx, book_id), BookStatus::Failed);

        let snapshot = orchestrator.job_status(&handle.task_id).unwrap();
        assert_eq!(snapshot.status, UpdateStatus::Failed);
        assert!(snapshot
            .error
            .as_deref()
            .unwrap()
            .contains("transient upstream error"));

        orchestrator.join();
    }

    #[test]
    fn test_fatal_service_error_skips_retry() {
        let (services, fx) = test_services();
        let orchestrator = Orchestrator::new(services, 1);
        let book_id = create_book(&fx, 5);

        fx.text.fail_times.store(1, Ordering::SeqCst);
        fx.text.fatal.store(true, Ordering::SeqCst);

        orchestrator.dispatch(book_id, fx.user_id).unwrap();
        let outcome = orchestrator.recv_outcome().unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(fx.text.calls.load(Ordering::SeqCst), 1);
        assert_eq!(book_status(&fx, book_id), BookStatus::Failed);

        orchestrator.join();
    }

    #[test]
    fn test_page_image_failure_still_completes() {
        let (services, fx) = test_services();
        let orchestrator = Orchestrator::new(services, 1);
        let book_id = create_book(&fx, 8);

        fx.text.sentinel_page.store(3, Ordering::SeqCst);

        orchestrator.dispatch(book_id, fx.user_id).unwrap();
        let outcome = orchestrator.recv_outcome().unwrap();

        assert!(outcome.success, "job failed: {:?}", outcome.error);
        assert_eq!(outcome.pages_persisted, 8);
        assert_eq!(outcome.images_generated, 7);

        let pages = page_repo::list_for_book(&fx.db, book_id).unwrap();
        let page3 = pages.iter().find(|p| p.page_number == 3).unwrap();
        assert!(page3.image_ref.is_none());
        assert_eq!(pages.iter().filter(|p| p.image_ref.is_some()).count(), 7);

        orchestrator.join();
    }

    #[test]
    fn test_second_dispatch_while_processing_rejected() {
        let (services, fx) = test_services();
        let orchestrator = Orchestrator::new(services, 1);
        let book_id = create_book(&fx, 5);

        // Slow first job so the second dispatch races against processing.
        fx.text.delay_ms.store(300, Ordering::SeqCst);

        orchestrator.dispatch(book_id, fx.user_id).unwrap();
        let err = orchestrator.dispatch(book_id, fx.user_id).unwrap_err();
        assert!(matches!(
            err,
            BookforgeError::BusinessRule(BusinessRuleError::NotDispatchable {
                status: BookStatus::Processing,
                ..
            })
        ));

        let outcome = orchestrator.recv_outcome().unwrap();
        assert!(outcome.success);
        // No second job was enqueued.
        assert!(orchestrator.try_recv_outcome().is_none());

        orchestrator.join();
    }

    #[test]
    fn test_hard_timeout_is_terminal_when_attempts_run_out() {
        let (services, fx) = test_services_with(GenerationSettings {
            max_attempts: 1,
            retry_delay_secs: 0,
            soft_timeout_secs: 0,
            hard_timeout_secs: 1,
            image_concurrency: 2,
        });
        let orchestrator = Orchestrator::new(services, 1);
        let book_id = create_book(&fx, 5);

        // Sleeps far past the hard limit.
        fx.text.delay_ms.store(10_000, Ordering::SeqCst);

        let handle = orchestrator.dispatch(book_id, fx.user_id).unwrap();
        let outcome = orchestrator.recv_outcome().unwrap();

        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("time limit"));
        assert_eq!(book_status(&fx, book_id), BookStatus::Failed);

        let snapshot = orchestrator.job_status(&handle.task_id).unwrap();
        assert_eq!(snapshot.status, UpdateStatus::Failed);

        orchestrator.join();
    }

    #[test]
    fn test_rejected_submit_resolves_book_and_task() {
        let (services, fx) = test_services();
        let orchestrator = Orchestrator::new(Arc::clone(&services), 1);
        let book_id = create_book(&fx, 5);

        // A shut-down pool rejects the submit after the claim succeeded.
        orchestrator.shutdown();
        let err = orchestrator.dispatch(book_id, fx.user_id).unwrap_err();
        assert!(matches!(err, BookforgeError::Worker(_)));

        assert_eq!(book_status(&fx, book_id), BookStatus::Failed);

        // The durable task row is terminal too, not stuck in processing.
        let task = crate::db::task_repo::find_latest_for_book(&fx.db, book_id)
            .unwrap()
            .unwrap();
        assert_eq!(task.status, "failed");

        orchestrator.join();
    }

    #[test]
    fn test_dispatch_missing_book() {
        let (services, fx) = test_services();
        let orchestrator = Orchestrator::new(services, 1);

        let err = orchestrator.dispatch(4242, fx.user_id).unwrap_err();
        assert!(matches!(err, BookforgeError::NotFound(_)));

        orchestrator.join();
    }

    #[test]
    fn test_failed_book_can_be_redispatched_and_converges() {
        let (services, fx) = test_services();
        let orchestrator = Orchestrator::new(services, 1);
        let book_id = create_book(&fx, 5);

        fx.text.fail_times.store(99, Ordering::SeqCst);
        orchestrator.dispatch(book_id, fx.user_id).unwrap();
        let outcome = orchestrator.recv_outcome().unwrap();
        assert!(!outcome.success);
        assert_eq!(book_status(&fx, book_id), BookStatus::Failed);

        // The service recovered; re-dispatch succeeds from failed.
        fx.text.fail_times.store(0, Ordering::SeqCst);
        orchestrator.dispatch(book_id, fx.user_id).unwrap();
        let outcome = orchestrator.recv_outcome().unwrap();
        assert!(outcome.success);
        assert_eq!(book_status(&fx, book_id), BookStatus::Completed);
        assert_eq!(page_repo::list_for_book(&fx.db, book_id).unwrap().len(), 5);

        orchestrator.join();
    }
}
