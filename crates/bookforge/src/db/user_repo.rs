//! User repository — the user directory consumed by the pipeline.

use chrono::Utc;
use rusqlite::{params, Row};

use super::{format_ts, parse_ts, Database, DatabaseError};
use crate::book::User;
use crate::error::{BookforgeError, NotFoundError};

fn from_row(row: &Row<'_>) -> Result<User, rusqlite::Error> {
    Ok(User {
        id: row.get("id")?,
        email: row.get("email")?,
        full_name: row.get("full_name")?,
        max_books: row.get("max_books")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
    })
}

/// Inserts a new user and returns it.
pub fn insert(
    db: &Database,
    email: &str,
    full_name: Option<&str>,
    max_books: u32,
) -> Result<User, BookforgeError> {
    let now = format_ts(Utc::now());
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO users (email, full_name, max_books, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![email, full_name, max_books, now],
        )?;
        let id = conn.last_insert_rowid();
        let user = conn.query_row("SELECT * FROM users WHERE id = ?1", params![id], from_row)?;
        Ok(user)
    })
}

/// Finds a user by id.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<User>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM users WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Finds a user by id, failing with `NotFoundError` when missing.
pub fn get(db: &Database, id: i64) -> Result<User, BookforgeError> {
    find_by_id(db, id)?.ok_or_else(|| NotFoundError::User(id).into())
}
