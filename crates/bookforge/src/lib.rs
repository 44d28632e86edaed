pub mod ai;
pub mod book;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod email;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod storage;
pub mod sweeper;
pub mod worker;

pub use ai::{HttpTextGenerator, ImageGenerator, PlaceholderImageGenerator, ServiceError, TextGenerator};
pub use book::{Book, BookStatus, BookStyle, NewBook, Page, User};
pub use broadcast::{ConnectionRegistry, PushChannel, PushEvent, TaskSnapshot, TaskStore};
pub use config::{load_config, Config};
pub use email::{LogMailer, Mailer};
pub use error::{
    BookforgeError, BusinessRuleError, ConfigError, NotFoundError, Result, StorageError,
    ValidationError, WorkerError,
};
pub use pipeline::{GenerationPipeline, PipelineError};
pub use storage::{FileStorage, Storage};
pub use sweeper::RecoverySweeper;
pub use worker::{GenerationJob, JobOutcome, Orchestrator, Services, TaskHandle, WorkerPool};
