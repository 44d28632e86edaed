//! Task orchestration: the dispatch gate, the retrying job runner, the
//! worker pool, and the lifecycle hooks fired on job events.

pub mod hooks;
pub mod job;
pub mod orchestrator;
pub mod pool;

pub use hooks::{JobHooks, Notifier};
pub use job::{GenerationJob, JobOutcome};
pub use orchestrator::{Orchestrator, TaskHandle};
pub use pool::WorkerPool;

use std::sync::Arc;

use crate::ai::{ImageGenerator, TextGenerator};
use crate::broadcast::registry::ConnectionRegistry;
use crate::broadcast::task_store::TaskStore;
use crate::config::GenerationSettings;
use crate::db::Database;
use crate::email::Mailer;
use crate::storage::Storage;

/// Everything a worker needs to execute jobs. Cloned into each worker
/// thread; all members are cheap handles.
pub struct Services {
    pub db: Database,
    pub text: Arc<dyn TextGenerator>,
    pub images: Arc<dyn ImageGenerator>,
    pub storage: Arc<dyn Storage>,
    pub registry: Arc<ConnectionRegistry>,
    pub tasks: Arc<TaskStore>,
    pub mailer: Arc<dyn Mailer>,
    pub generation: GenerationSettings,
}
