use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const MIN_PAGES: u32 = 5;
pub const MAX_PAGES: u32 = 20;
pub const TITLE_MIN: usize = 3;
pub const TITLE_MAX: usize = 200;
pub const DESCRIPTION_MAX: usize = 1000;
pub const PAGE_TEXT_MAX: usize = 2000;
pub const IMAGE_PROMPT_MAX: usize = 1000;

/// Lifecycle status of a book. Mutated only through [`crate::book::state::transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    Draft,
    Processing,
    Completed,
    Failed,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Draft => "draft",
            BookStatus::Processing => "processing",
            BookStatus::Completed => "completed",
            BookStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "draft" => Ok(BookStatus::Draft),
            "processing" => Ok(BookStatus::Processing),
            "completed" => Ok(BookStatus::Completed),
            "failed" => Ok(BookStatus::Failed),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }

    /// Attributes may only be edited while the book is not (or no longer) generating.
    pub fn is_editable(&self) -> bool {
        matches!(self, BookStatus::Draft | BookStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookStatus::Completed | BookStatus::Failed)
    }
}

impl std::fmt::Display for BookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Illustration style applied to the whole book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStyle {
    Cartoon,
    Realistic,
    Manga,
    Classic,
}

impl BookStyle {
    pub const ALL: [BookStyle; 4] = [
        BookStyle::Cartoon,
        BookStyle::Realistic,
        BookStyle::Manga,
        BookStyle::Classic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BookStyle::Cartoon => "cartoon",
            BookStyle::Realistic => "realistic",
            BookStyle::Manga => "manga",
            BookStyle::Classic => "classic",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "cartoon" => Ok(BookStyle::Cartoon),
            "realistic" => Ok(BookStyle::Realistic),
            "manga" => Ok(BookStyle::Manga),
            "classic" => Ok(BookStyle::Classic),
            other => Err(ValidationError::UnknownStyle(other.to_string())),
        }
    }
}

impl std::fmt::Display for BookStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Book {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub page_count: u32,
    pub style: BookStyle,
    pub status: BookStatus,
    /// Locator of the cover illustration, set on successful generation.
    pub cover_image: Option<String>,
    /// Locator of the assembled output, if one has been produced.
    pub pdf_file: Option<String>,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated payload for creating a book. Construction enforces every
/// attribute rule, so a `NewBook` is storable as-is.
#[derive(Debug, Clone)]
pub struct NewBook {
    pub title: String,
    pub description: Option<String>,
    pub page_count: u32,
    pub style: BookStyle,
    pub user_id: i64,
}

impl NewBook {
    pub fn new(
        title: &str,
        description: Option<&str>,
        page_count: u32,
        style: BookStyle,
        user_id: i64,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            title: validate_title(title)?,
            description: validate_description(description)?,
            page_count: validate_page_count(page_count)?,
            style,
            user_id,
        })
    }
}

/// Partial update for an editable book. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct BookUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub page_count: Option<u32>,
    pub style: Option<BookStyle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub id: i64,
    pub book_id: i64,
    pub page_number: u32,
    pub text_content: Option<String>,
    /// Storage locator of the page illustration. Absence is a valid,
    /// recoverable state, not an error.
    pub image_ref: Option<String>,
    pub image_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub full_name: Option<String>,
    pub max_books: u32,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.full_name.as_deref().unwrap_or(&self.email)
    }
}

pub fn validate_title(title: &str) -> Result<String, ValidationError> {
    let title = title.trim();
    let len = title.chars().count();
    if !(TITLE_MIN..=TITLE_MAX).contains(&len) {
        return Err(ValidationError::TitleLength { got: len });
    }
    Ok(title.to_string())
}

pub fn validate_description(description: Option<&str>) -> Result<Option<String>, ValidationError> {
    match description.map(str::trim) {
        None | Some("") => Ok(None),
        Some(d) => {
            let len = d.chars().count();
            if len > DESCRIPTION_MAX {
                return Err(ValidationError::DescriptionLength { got: len });
            }
            Ok(Some(d.to_string()))
        }
    }
}

pub fn validate_page_count(page_count: u32) -> Result<u32, ValidationError> {
    if !(MIN_PAGES..=MAX_PAGES).contains(&page_count) {
        return Err(ValidationError::PageCount { got: page_count });
    }
    Ok(page_count)
}

pub fn validate_page_text(text: &str) -> Result<(), ValidationError> {
    let len = text.chars().count();
    if len > PAGE_TEXT_MAX {
        return Err(ValidationError::PageTextLength { got: len });
    }
    Ok(())
}

pub fn validate_image_prompt(prompt: &str) -> Result<(), ValidationError> {
    let len = prompt.chars().count();
    if len > IMAGE_PROMPT_MAX {
        return Err(ValidationError::ImagePromptLength { got: len });
    }
    Ok(())
}

pub fn validate_page_number(number: u32, page_count: u32) -> Result<(), ValidationError> {
    if number == 0 || number > page_count {
        return Err(ValidationError::PageNumber { number, page_count });
    }
    Ok(())
}
