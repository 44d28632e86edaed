//! Task store: the durable side of progress reporting.
//!
//! Every checkpoint lands here (cache + database row) regardless of
//! whether any push channel is connected, so a client that lost its
//! connection can poll `get_with_fallback` and see the same truth.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::event::UpdateStatus;
use crate::db::task_repo::{self, TaskRow};
use crate::db::{format_ts, parse_ts, Database, DatabaseError};
use crate::pipeline::progress::Checkpoint;
use crate::worker::job::GenerationJob;

/// Snapshot of one generation task, served to polling clients.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub book_id: i64,
    pub user_id: i64,
    pub status: UpdateStatus,
    pub progress: u8,
    pub current_step: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    fn from_row(row: &TaskRow) -> Self {
        let status = UpdateStatus::parse(&row.status).unwrap_or_else(|| {
            log::warn!(
                "Unknown task status '{}' for task {}, defaulting to processing",
                row.status,
                row.id
            );
            UpdateStatus::Processing
        });
        Self {
            task_id: row.id.clone(),
            book_id: row.book_id,
            user_id: row.user_id,
            status,
            progress: row.progress,
            current_step: row.current_step.clone(),
            message: row.message.clone().unwrap_or_default(),
            error: row.error.clone(),
            attempt: row.attempt,
            started_at: parse_ts(&row.created_at),
            completed_at: row.completed_at.as_deref().map(parse_ts),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Cache + database task record store.
pub struct TaskStore {
    db: RwLock<Option<Database>>,
    cache: RwLock<HashMap<String, TaskSnapshot>>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStore {
    pub fn new() -> Self {
        Self {
            db: RwLock::new(None),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_database(db: Database) -> Self {
        let store = Self::new();
        store.set_database(db);
        store
    }

    pub fn set_database(&self, db: Database) {
        let mut guard = match self.db.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Task store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        *guard = Some(db);
    }

    fn database(&self) -> Option<Database> {
        let guard = match self.db.read() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Task store DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.clone()
    }

    /// Creates the queued record when a job is dispatched.
    pub fn begin(&self, job: &GenerationJob) {
        let now = Utc::now();
        let snapshot = TaskSnapshot {
            task_id: job.task_id.clone(),
            book_id: job.book_id,
            user_id: job.user_id,
            status: UpdateStatus::Processing,
            progress: 0,
            current_step: Some("queued".to_string()),
            message: "Generation queued".to_string(),
            error: None,
            attempt: 1,
            started_at: now,
            completed_at: None,
        };

        if let Some(db) = self.database() {
            let row = TaskRow {
                id: snapshot.task_id.clone(),
                book_id: snapshot.book_id,
                user_id: snapshot.user_id,
                status: snapshot.status.as_str().to_string(),
                progress: 0,
                current_step: snapshot.current_step.clone(),
                message: Some(snapshot.message.clone()),
                error: None,
                attempt: 1,
                created_at: format_ts(now),
                updated_at: format_ts(now),
                completed_at: None,
            };
            if let Err(e) = task_repo::insert(&db, &row) {
                log::error!("Failed to persist task {}: {}", snapshot.task_id, e);
            }
        }

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(snapshot.task_id.clone(), snapshot);
        }
    }

    /// Applies a checkpoint to the cache and the database row. Progress
    /// never moves backwards even across retry attempts.
    pub fn record(&self, cp: &Checkpoint) {
        let now = Utc::now();

        if let Ok(mut cache) = self.cache.write() {
            if let Some(snapshot) = cache.get_mut(&cp.task_id) {
                snapshot.status = cp.status;
                snapshot.progress = snapshot.progress.max(cp.progress);
                snapshot.current_step = cp.current_step.clone();
                snapshot.message = cp.message.clone();
                snapshot.attempt = cp.attempt;
                if cp.error.is_some() {
                    snapshot.error = cp.error.clone();
                }
                if cp.status.is_terminal() {
                    snapshot.completed_at = Some(now);
                }
            }
        }

        if let Some(db) = self.database() {
            if let Err(e) = self.persist(&db, cp, now) {
                log::error!("Failed to persist checkpoint for task {}: {}", cp.task_id, e);
            }
        }
    }

    fn persist(&self, db: &Database, cp: &Checkpoint, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        let Some(mut row) = task_repo::find_by_id(db, &cp.task_id)? else {
            log::warn!("Checkpoint for unknown task {}, skipping persist", cp.task_id);
            return Ok(());
        };

        row.status = cp.status.as_str().to_string();
        row.progress = row.progress.max(cp.progress);
        row.current_step = cp.current_step.clone();
        row.message = Some(cp.message.clone());
        row.attempt = cp.attempt;
        row.updated_at = format_ts(now);
        if cp.error.is_some() {
            row.error = cp.error.clone();
        }
        if cp.status.is_terminal() {
            row.completed_at = Some(format_ts(now));
        }

        task_repo::update(db, &row)
    }

    /// Cache lookup only.
    pub fn get(&self, task_id: &str) -> Option<TaskSnapshot> {
        let cache = match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Task store cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        cache.get(task_id).cloned()
    }

    /// Cache first, then the durable row. This is the polling fallback
    /// for clients without a live push channel.
    pub fn get_with_fallback(&self, task_id: &str) -> Option<TaskSnapshot> {
        if let Some(snapshot) = self.get(task_id) {
            return Some(snapshot);
        }
        let db = self.database()?;
        match task_repo::find_by_id(&db, task_id) {
            Ok(Some(row)) => Some(TaskSnapshot::from_row(&row)),
            Ok(None) => None,
            Err(e) => {
                log::error!("Failed to load task {}: {}", task_id, e);
                None
            }
        }
    }
}
