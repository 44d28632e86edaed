use std::path::PathBuf;
use thiserror::Error;

use crate::book::BookStatus;

#[derive(Error, Debug)]
pub enum BookforgeError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Business rule violation: {0}")]
    BusinessRule(#[from] BusinessRuleError),

    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

impl From<rusqlite::Error> for BookforgeError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(crate::db::DatabaseError::Sqlite(e))
    }
}

/// Bad input shape or range. Rejected at write time, never retried.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Title must be between 3 and 200 characters, got {got}")]
    TitleLength { got: usize },

    #[error("Description must be at most 1000 characters, got {got}")]
    DescriptionLength { got: usize },

    #[error("Books must have between 5 and 20 pages, got {got}")]
    PageCount { got: u32 },

    #[error("Unknown book style '{0}'")]
    UnknownStyle(String),

    #[error("Unknown book status '{0}'")]
    UnknownStatus(String),

    #[error("Page text must be at most 2000 characters, got {got}")]
    PageTextLength { got: usize },

    #[error("Image prompt must be at most 1000 characters, got {got}")]
    ImagePromptLength { got: usize },

    #[error("Page number {number} is outside 1..={page_count}")]
    PageNumber { number: u32, page_count: u32 },
}

fn fmt_statuses(statuses: &[BookStatus]) -> String {
    statuses
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Lifecycle and ownership rules. Terminal, never retried.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BusinessRuleError {
    #[error("Invalid status transition {from} -> {to} (allowed from {from}: {})", fmt_statuses(.allowed))]
    InvalidTransition {
        from: BookStatus,
        to: BookStatus,
        allowed: Vec<BookStatus>,
    },

    #[error("Book {book_id} cannot start generation while status is '{status}'")]
    NotDispatchable { book_id: i64, status: BookStatus },

    #[error("Book {book_id} does not belong to user {user_id}")]
    NotOwner { book_id: i64, user_id: i64 },

    #[error("Book {book_id} cannot be edited while status is '{status}'")]
    NotEditable { book_id: i64, status: BookStatus },

    #[error("Book {book_id} cannot be deleted while generation is running")]
    DeleteWhileProcessing { book_id: i64 },

    #[error("User {user_id} reached the limit of {limit} books")]
    BookLimitReached { user_id: i64, limit: u32 },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NotFoundError {
    #[error("Book {0} not found")]
    Book(i64),

    #[error("User {0} not found")]
    User(i64),

    #[error("Task '{0}' not found")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete file '{path}': {source}")]
    DeleteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid storage locator '{0}'")]
    InvalidLocator(String),

    #[error("File already exists: {0}")]
    FileExists(PathBuf),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to start worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, BookforgeError>;
