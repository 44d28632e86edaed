//! Prompt construction and story decomposition.
//!
//! The story prompt asks the model to mark pages with `PAGE <n>:` lines.
//! Decomposition is best-effort: chunks that lost their marker fall back
//! to sequential numbering instead of aborting the run.

use regex::Regex;
use std::sync::OnceLock;

use crate::book::{Book, BookStyle, IMAGE_PROMPT_MAX, PAGE_TEXT_MAX};

fn page_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| {
        Regex::new(r"(?mi)^\s*PAGE\s+(\d+)\s*:\s*").expect("valid page marker pattern")
    })
}

/// Prompt for the whole-book story generation call.
pub fn build_story_prompt(book: &Book) -> String {
    let mut prompt = format!(
        "Write a children's story titled '{}' in the {} illustration style, \
         split into exactly {} pages. Start each page with a line of the form \
         'PAGE <number>:' followed by that page's text. Keep each page under \
         {} characters.",
        book.title, book.style, book.page_count, PAGE_TEXT_MAX
    );
    if let Some(ref description) = book.description {
        prompt.push_str(&format!(" The story is about: {description}"));
    }
    prompt
}

/// Prompt for one page illustration, bounded to the stored prompt cap.
pub fn build_image_prompt(page_text: &str, style: BookStyle) -> String {
    let prompt = format!(
        "A {} style children's book illustration of the following scene: {}",
        style,
        page_text.trim()
    );
    truncate_chars(&prompt, IMAGE_PROMPT_MAX)
}

/// Splits generated story text into exactly `page_count` page texts.
pub fn split_into_pages(story: &str, page_count: u32) -> Vec<String> {
    let page_count = page_count as usize;
    let mut slots: Vec<Option<String>> = vec![None; page_count];

    let markers: Vec<_> = page_marker().captures_iter(story).collect();

    if markers.is_empty() {
        // No markers at all: distribute paragraphs sequentially.
        let paragraphs: Vec<&str> = story
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        let per_page = paragraphs.len().div_ceil(page_count).max(1);
        for (i, chunk) in paragraphs.chunks(per_page).take(page_count).enumerate() {
            slots[i] = Some(chunk.join("\n\n"));
        }
    } else {
        // Slice the text between consecutive markers.
        let spans: Vec<(Option<usize>, usize, usize)> = markers
            .iter()
            .enumerate()
            .map(|(i, cap)| {
                let whole = cap.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
                let end = markers
                    .get(i + 1)
                    .and_then(|next| next.get(0))
                    .map(|m| m.start())
                    .unwrap_or(story.len());
                let number = cap
                    .get(1)
                    .and_then(|m| m.as_str().parse::<usize>().ok())
                    .filter(|n| (1..=page_count).contains(n));
                (number, whole.1, end)
            })
            .collect();

        for (number, start, end) in spans {
            let text = story[start..end].trim().to_string();
            match number {
                // A numbered chunk lands in its slot; duplicates keep the
                // first occurrence.
                Some(n) if slots[n - 1].is_none() => slots[n - 1] = Some(text),
                Some(_) => append_sequential(&mut slots, text),
                // Marker without a usable number: sequential fallback.
                None => append_sequential(&mut slots, text),
            }
        }
    }

    slots
        .into_iter()
        .map(|slot| truncate_chars(&slot.unwrap_or_default(), PAGE_TEXT_MAX))
        .collect()
}

fn append_sequential(slots: &mut [Option<String>], text: String) {
    if let Some(slot) = slots.iter_mut().find(|s| s.is_none()) {
        *slot = Some(text);
    } else if let Some(last) = slots.last_mut() {
        // Every slot taken: merge the overflow into the final page.
        if let Some(existing) = last.as_mut() {
            existing.push_str("\n\n");
            existing.push_str(&text);
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
