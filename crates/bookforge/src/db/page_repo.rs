//! Page repository. Pages are created by the pipeline's persistence step
//! and keyed by (book_id, page_number) so a retried run converges instead
//! of duplicating.

use chrono::Utc;
use rusqlite::{params, Row};

use super::{format_ts, parse_ts, Database, DatabaseError};
use crate::book::{self, Page};
use crate::error::BookforgeError;

/// Validated page payload for the upsert.
#[derive(Debug, Clone)]
pub struct NewPage {
    pub book_id: i64,
    pub page_number: u32,
    pub text_content: Option<String>,
    pub image_ref: Option<String>,
    pub image_prompt: Option<String>,
}

impl NewPage {
    pub fn new(
        book_id: i64,
        page_number: u32,
        page_count: u32,
        text_content: Option<String>,
        image_ref: Option<String>,
        image_prompt: Option<String>,
    ) -> Result<Self, crate::error::ValidationError> {
        book::model::validate_page_number(page_number, page_count)?;
        if let Some(ref text) = text_content {
            book::model::validate_page_text(text)?;
        }
        if let Some(ref prompt) = image_prompt {
            book::model::validate_image_prompt(prompt)?;
        }
        Ok(Self {
            book_id,
            page_number,
            text_content,
            image_ref,
            image_prompt,
        })
    }
}

fn from_row(row: &Row<'_>) -> Result<Page, rusqlite::Error> {
    Ok(Page {
        id: row.get("id")?,
        book_id: row.get("book_id")?,
        page_number: row.get("page_number")?,
        text_content: row.get("text_content")?,
        image_ref: row.get("image_ref")?,
        image_prompt: row.get("image_prompt")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        updated_at: parse_ts(&row.get::<_, String>("updated_at")?),
    })
}

/// Inserts or replaces the page with this book/number pair.
pub fn upsert(db: &Database, page: &NewPage) -> Result<Page, BookforgeError> {
    let now = format_ts(Utc::now());
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO pages (book_id, page_number, text_content, image_ref, image_prompt,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(book_id, page_number) DO UPDATE SET
                 text_content = excluded.text_content,
                 image_ref = excluded.image_ref,
                 image_prompt = excluded.image_prompt,
                 updated_at = excluded.updated_at",
            params![
                page.book_id,
                page.page_number,
                page.text_content,
                page.image_ref,
                page.image_prompt,
                now,
            ],
        )?;
        let stored = conn.query_row(
            "SELECT * FROM pages WHERE book_id = ?1 AND page_number = ?2",
            params![page.book_id, page.page_number],
            from_row,
        )?;
        Ok(stored)
    })
}

/// All pages of a book in reading order.
pub fn list_for_book(db: &Database, book_id: i64) -> Result<Vec<Page>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM pages WHERE book_id = ?1 ORDER BY page_number ASC")?;
        let rows = stmt
            .query_map(params![book_id], from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Storage locators of every page illustration the book has.
pub fn image_refs_for_book(db: &Database, book_id: i64) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT image_ref FROM pages WHERE book_id = ?1 AND image_ref IS NOT NULL",
        )?;
        let rows = stmt
            .query_map(params![book_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Removes all pages of a book. Returns the number of rows removed.
pub fn delete_for_book(db: &Database, book_id: i64) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let removed = conn.execute("DELETE FROM pages WHERE book_id = ?1", params![book_id])?;
        Ok(removed)
    })
}
