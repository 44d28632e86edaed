//! Task repository — durable records for generation jobs so disconnected
//! clients can poll instead of relying on push delivery.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw task row. Timestamps are RFC3339 strings, like the other tables.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: String,
    pub book_id: i64,
    pub user_id: i64,
    pub status: String,
    pub progress: u8,
    pub current_step: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub attempt: u32,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            book_id: row.get("book_id")?,
            user_id: row.get("user_id")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            current_step: row.get("current_step")?,
            message: row.get("message")?,
            error: row.get("error")?,
            attempt: row.get("attempt")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Inserts a new task row.
pub fn insert(db: &Database, task: &TaskRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO tasks (id, book_id, user_id, status, progress, current_step, message,
             error, attempt, created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id,
                task.book_id,
                task.user_id,
                task.status,
                task.progress,
                task.current_step,
                task.message,
                task.error,
                task.attempt,
                task.created_at,
                task.updated_at,
                task.completed_at,
            ],
        )?;
        Ok(())
    })
}

/// Updates the mutable fields of a task row.
pub fn update(db: &Database, task: &TaskRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE tasks SET status=?2, progress=?3, current_step=?4, message=?5, error=?6,
             attempt=?7, updated_at=?8, completed_at=?9
             WHERE id=?1",
            params![
                task.id,
                task.status,
                task.progress,
                task.current_step,
                task.message,
                task.error,
                task.attempt,
                task.updated_at,
                task.completed_at,
            ],
        )?;
        Ok(())
    })
}

/// Finds a task by its id.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<TaskRow>, DatabaseError> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT * FROM tasks WHERE id = ?1",
            params![id],
            TaskRow::from_row,
        )
        .optional()
        .map_err(DatabaseError::Sqlite)
    })
}

/// Most recent task for a book, if any.
pub fn find_latest_for_book(db: &Database, book_id: i64) -> Result<Option<TaskRow>, DatabaseError> {
    db.with_conn(|conn| {
        conn.query_row(
            "SELECT * FROM tasks WHERE book_id = ?1 ORDER BY created_at DESC LIMIT 1",
            params![book_id],
            TaskRow::from_row,
        )
        .optional()
        .map_err(DatabaseError::Sqlite)
    })
}
