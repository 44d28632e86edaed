use crate::book::{Book, User};
use crate::worker::job::GenerationJob;

/// One page being assembled by a run.
#[derive(Debug, Clone)]
pub struct PageDraft {
    pub page_number: u32,
    pub text: String,
    pub image_prompt: Option<String>,
    pub image_ref: Option<String>,
}

/// Mutable state threaded through one pipeline run.
pub struct GenerationContext {
    pub job: GenerationJob,
    pub attempt: u32,

    // Step 1 results — guaranteed Some after step_load
    pub book: Option<Book>,
    pub user: Option<User>,

    // Step 2 result — guaranteed Some after step_generate_text
    pub story_text: Option<String>,

    // Step 3 result
    pub drafts: Vec<PageDraft>,

    // Step 4 tallies
    pub images_generated: u32,
    pub images_failed: u32,
}

impl GenerationContext {
    pub fn new(job: GenerationJob, attempt: u32) -> Self {
        Self {
            job,
            attempt,
            book: None,
            user: None,
            story_text: None,
            drafts: Vec::new(),
            images_generated: 0,
            images_failed: 0,
        }
    }
}
