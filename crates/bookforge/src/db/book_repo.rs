//! Book repository — CRUD plus the status-update primitives used by the
//! orchestrator. Status is only ever changed through the state machine.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_ts, parse_ts, Database, DatabaseError};
use crate::book::{self, Book, BookStatus, BookStyle, BookUpdate, NewBook};
use crate::error::{BookforgeError, BusinessRuleError, NotFoundError};

fn from_row(row: &Row<'_>) -> Result<Book, rusqlite::Error> {
    let status_raw: String = row.get("status")?;
    let style_raw: String = row.get("style")?;
    let id: i64 = row.get("id")?;

    // The schema constrains both columns; an unknown value means the file
    // was touched outside the application. Fall back rather than abort.
    let status = BookStatus::parse(&status_raw).unwrap_or_else(|_| {
        log::warn!("Unknown status '{}' for book {}, treating as failed", status_raw, id);
        BookStatus::Failed
    });
    let style = BookStyle::parse(&style_raw).unwrap_or_else(|_| {
        log::warn!("Unknown style '{}' for book {}, treating as cartoon", style_raw, id);
        BookStyle::Cartoon
    });

    Ok(Book {
        id,
        title: row.get("title")?,
        description: row.get("description")?,
        page_count: row.get("page_count")?,
        style,
        status,
        cover_image: row.get("cover_image")?,
        pdf_file: row.get("pdf_file")?,
        user_id: row.get("user_id")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
    })
}

fn get_in_conn(conn: &Connection, id: i64) -> Result<Book, BookforgeError> {
    conn.query_row("SELECT * FROM books WHERE id = ?1", params![id], from_row)
        .optional()
        .map_err(DatabaseError::Sqlite)?
        .ok_or_else(|| NotFoundError::Book(id).into())
}

/// Inserts a new book for its owner. Enforces the per-user book limit.
pub fn insert(db: &Database, new: &NewBook) -> Result<Book, BookforgeError> {
    let now = format_ts(Utc::now());
    db.with_conn(|conn| {
        let max_books: u32 = conn
            .query_row(
                "SELECT max_books FROM users WHERE id = ?1",
                params![new.user_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?
            .ok_or(NotFoundError::User(new.user_id))?;

        let owned: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM books WHERE user_id = ?1",
                params![new.user_id],
                |r| r.get(0),
            )
            .map_err(DatabaseError::Sqlite)?;
        if owned >= max_books {
            return Err(BusinessRuleError::BookLimitReached {
                user_id: new.user_id,
                limit: max_books,
            }
            .into());
        }

        conn.execute(
            "INSERT INTO books (title, description, page_count, style, status, user_id,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'draft', ?5, ?6, ?6)",
            params![
                new.title,
                new.description,
                new.page_count,
                new.style.as_str(),
                new.user_id,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        get_in_conn(conn, id)
    })
}

/// Finds a book by id.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<Book>, DatabaseError> {
    db.with_conn(|conn| {
        conn.query_row("SELECT * FROM books WHERE id = ?1", params![id], from_row)
            .optional()
            .map_err(DatabaseError::Sqlite)
    })
}

/// Finds a book by id, failing with `NotFoundError` when missing.
pub fn get(db: &Database, id: i64) -> Result<Book, BookforgeError> {
    db.with_conn(|conn| get_in_conn(conn, id))
}

/// Updates attributes of an editable book. page_count stays mutable only
/// while the book has never completed a run or has failed.
pub fn update(db: &Database, id: i64, changes: &BookUpdate) -> Result<Book, BookforgeError> {
    let now = format_ts(Utc::now());
    db.with_conn(|conn| {
        let book = get_in_conn(conn, id)?;
        if !book.status.is_editable() {
            return Err(BusinessRuleError::NotEditable {
                book_id: id,
                status: book.status,
            }
            .into());
        }

        let title = match &changes.title {
            Some(t) => book::validate_title(t)?,
            None => book.title,
        };
        let description = match &changes.description {
            Some(d) => book::validate_description(Some(d))?,
            None => book.description,
        };
        let page_count = match changes.page_count {
            Some(p) => book::validate_page_count(p)?,
            None => book.page_count,
        };
        let style = changes.style.unwrap_or(book.style);

        conn.execute(
            "UPDATE books SET title=?2, description=?3, page_count=?4, style=?5, updated_at=?6
             WHERE id=?1",
            params![id, title, description, page_count, style.as_str(), now],
        )?;
        get_in_conn(conn, id)
    })
}

/// Moves a book to a new status through the state machine.
pub fn update_status(db: &Database, id: i64, next: BookStatus) -> Result<Book, BookforgeError> {
    let now = format_ts(Utc::now());
    db.with_conn(|conn| {
        let current = get_in_conn(conn, id)?;
        let next = book::transition(current.status, next)?;
        conn.execute(
            "UPDATE books SET status=?2, updated_at=?3 WHERE id=?1",
            params![id, next.as_str(), now],
        )?;
        get_in_conn(conn, id)
    })
}

/// Dispatch-time claim: verifies ownership and that the book is in a
/// dispatchable state, then transitions it to processing. Runs in one
/// locked critical section so two dispatchers cannot both claim a book.
pub fn claim_for_processing(
    db: &Database,
    book_id: i64,
    user_id: i64,
) -> Result<Book, BookforgeError> {
    let now = format_ts(Utc::now());
    db.with_conn(|conn| {
        let book = get_in_conn(conn, book_id)?;
        if book.user_id != user_id {
            return Err(BusinessRuleError::NotOwner { book_id, user_id }.into());
        }
        if !matches!(book.status, BookStatus::Draft | BookStatus::Failed) {
            return Err(BusinessRuleError::NotDispatchable {
                book_id,
                status: book.status,
            }
            .into());
        }
        let next = book::transition(book.status, BookStatus::Processing)?;
        conn.execute(
            "UPDATE books SET status=?2, updated_at=?3 WHERE id=?1",
            params![book_id, next.as_str(), now],
        )?;
        get_in_conn(conn, book_id)
    })
}

/// Records the cover illustration locator after a successful run.
pub fn set_cover_image(
    db: &Database,
    id: i64,
    cover_image: Option<&str>,
) -> Result<(), DatabaseError> {
    let now = format_ts(Utc::now());
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE books SET cover_image=?2, updated_at=?3 WHERE id=?1",
            params![id, cover_image, now],
        )?;
        Ok(())
    })
}

/// Deletes a book and its pages. Rejected while a generation is running.
pub fn delete(db: &Database, id: i64) -> Result<bool, BookforgeError> {
    db.with_conn(|conn| {
        let book = match conn
            .query_row("SELECT * FROM books WHERE id = ?1", params![id], from_row)
            .optional()
            .map_err(DatabaseError::Sqlite)?
        {
            Some(b) => b,
            None => return Ok(false),
        };
        if book.status == BookStatus::Processing {
            return Err(BusinessRuleError::DeleteWhileProcessing { book_id: id }.into());
        }
        conn.execute("DELETE FROM pages WHERE book_id = ?1", params![id])?;
        let removed = conn.execute("DELETE FROM books WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    })
}

/// Lists a user's books, newest first.
pub fn list_by_user(
    db: &Database,
    user_id: i64,
    limit: u64,
    offset: u64,
) -> Result<Vec<Book>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM books WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit as i64, offset as i64], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts books with the given status.
pub fn count_by_status(db: &Database, status: BookStatus) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM books WHERE status = ?1",
            params![status.as_str()],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Finds failed books whose last update is older than `cutoff`. Used by
/// the recovery sweeper; processing and completed books are never returned.
pub fn find_stale_failed(
    db: &Database,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Book>, DatabaseError> {
    let cutoff = format_ts(cutoff);
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM books WHERE status = 'failed' AND updated_at < ?1
             ORDER BY updated_at ASC",
        )?;
        let rows = stmt
            .query_map(params![cutoff], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
