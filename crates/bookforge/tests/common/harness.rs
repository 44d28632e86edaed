//! Test harness for isolated generation runs.
//!
//! The `TestHarness` struct provides a complete isolated environment for
//! exercising the generation engine end to end, including:
//! - In-memory database and a temporary artifact storage directory
//! - Scripted text/image collaborators with per-test failure scripts
//! - Connection registry plus a collecting push channel for event capture

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use bookforge::ai::{ImageGenerator, ServiceError, TextGenerator};
use bookforge::book::{Book, BookStatus, BookStyle, NewBook, Page};
use bookforge::broadcast::{
    ChannelError, ConnectionRegistry, EventKind, PushChannel, PushEvent, TaskStore,
};
use bookforge::config::GenerationSettings;
use bookforge::db::{book_repo, page_repo, user_repo, Database};
use bookforge::email::LogMailer;
use bookforge::storage::FileStorage;
use bookforge::worker::{Orchestrator, Services};

/// Scripted story generator. Fails the first `fail_times` calls (fatally
/// when `fatal` is set), optionally delays to keep a job in flight, and
/// marks one page so the image collaborator fails exactly that page.
#[derive(Default)]
pub struct ScriptedText {
    pub fail_times: AtomicU32,
    pub fatal: AtomicBool,
    pub calls: AtomicU32,
    pub failing_page: AtomicU32,
    pub delay_ms: AtomicU64,
}

fn page_count_from_prompt(prompt: &str) -> u32 {
    prompt
        .split("exactly ")
        .nth(1)
        .and_then(|rest| rest.split(' ').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(5)
}

#[async_trait]
impl TextGenerator for ScriptedText {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
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
        let failing = self.failing_page.load(Ordering::SeqCst);
        let mut story = String::new();
        for n in 1..=pages {
            if n == failing {
                story.push_str(&format!("PAGE {n}: UNPAINTABLE scene {n}.\n"));
            } else {
                story.push_str(&format!("PAGE {n}: A scene on page {n}.\n"));
            }
        }
        Ok(story)
    }
}

/// Scripted illustrator: rejects any prompt carrying the sentinel planted
/// by `ScriptedText::failing_page`, or everything when `fail_all` is set.
#[derive(Default)]
pub struct ScriptedImages {
    pub fail_all: AtomicBool,
}

#[async_trait]
impl ImageGenerator for ScriptedImages {
    async fn generate(&self, description: &str, _style: BookStyle) -> Result<Vec<u8>, ServiceError> {
        if self.fail_all.load(Ordering::SeqCst) || description.contains("UNPAINTABLE") {
            return Err(ServiceError::retryable("image-generation", "render failed"));
        }
        Ok(vec![0u8; 16])
    }
}

/// Push channel that records every delivered frame.
#[derive(Default)]
pub struct CollectingChannel(pub Mutex<Vec<PushEvent>>);

impl CollectingChannel {
    pub fn events(&self) -> Vec<PushEvent> {
        self.0.lock().unwrap().clone()
    }

    /// Progress values of the generation updates, in delivery order.
    pub fn progress(&self) -> Vec<u8> {
        self.events()
            .iter()
            .filter_map(|e| e.generation_update().map(|u| u.progress))
            .collect()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }
}

impl PushChannel for CollectingChannel {
    fn send(&self, frame: &PushEvent) -> Result<(), ChannelError> {
        self.0.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

/// Isolated environment for one integration test.
pub struct TestHarness {
    pub db: Database,
    pub registry: Arc<ConnectionRegistry>,
    pub tasks: Arc<TaskStore>,
    pub text: Arc<ScriptedText>,
    pub images: Arc<ScriptedImages>,
    pub user_id: i64,
    services: Arc<Services>,
    _media: TempDir,
}

impl TestHarness {
    /// Harness with the default test settings: three attempts, no retry
    /// delay, generous time limits.
    pub fn new() -> Self {
        Self::with_settings(GenerationSettings {
            max_attempts: 3,
            retry_delay_secs: 0,
            soft_timeout_secs: 300,
            hard_timeout_secs: 900,
            image_concurrency: 2,
        })
    }

    pub fn with_settings(settings: GenerationSettings) -> Self {
        let db = Database::open_in_memory().expect("in-memory database");
        let user = user_repo::insert(&db, "reader@example.com", Some("Reader"), 50)
            .expect("test user");

        let registry = Arc::new(ConnectionRegistry::new());
        let tasks = Arc::new(TaskStore::with_database(db.clone()));
        let text = Arc::new(ScriptedText::default());
        let images = Arc::new(ScriptedImages::default());
        let media = TempDir::new().expect("media directory");

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

        Self {
            db,
            registry,
            tasks,
            text,
            images,
            user_id: user.id,
            services,
            _media: media,
        }
    }

    pub fn orchestrator(&self, worker_count: usize) -> Orchestrator {
        Orchestrator::new(Arc::clone(&self.services), worker_count)
    }

    pub fn create_book(&self, title: &str, page_count: u32, style: BookStyle) -> i64 {
        let new = NewBook::new(title, None, page_count, style, self.user_id)
            .expect("valid book payload");
        book_repo::insert(&self.db, &new).expect("book insert").id
    }

    /// Registers a collecting push channel for the harness user.
    pub fn connect(&self) -> Arc<CollectingChannel> {
        let channel = Arc::new(CollectingChannel::default());
        self.registry.register(self.user_id, channel.clone());
        channel
    }

    pub fn book(&self, book_id: i64) -> Book {
        book_repo::find_by_id(&self.db, book_id)
            .expect("book lookup")
            .expect("book exists")
    }

    pub fn book_status(&self, book_id: i64) -> BookStatus {
        self.book(book_id).status
    }

    pub fn pages(&self, book_id: i64) -> Vec<Page> {
        page_repo::list_for_book(&self.db, book_id).expect("page listing")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
