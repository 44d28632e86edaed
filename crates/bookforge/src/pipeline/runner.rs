use std::sync::Arc;

use futures_util::{stream, StreamExt};
use tracing::{info_span, Instrument};

use crate::ai::{ImageGenerator, TextGenerator};
use crate::book::BookStatus;
use crate::db::{book_repo, page_repo, user_repo, Database};
use crate::error::NotFoundError;
use crate::storage::Storage;

use super::context::{GenerationContext, PageDraft};
use super::error::PipelineError;
use super::progress::{Checkpoint, ProgressReporter};
use super::prompt;

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub book_id: i64,
    pub task_id: String,
    pub title: String,
    pub pages_persisted: u32,
    pub images_generated: u32,
    pub images_failed: u32,
}

/// The ordered generation steps executed against one book:
/// load -> text -> decompose -> per-page images -> persist -> finalize.
///
/// Step failures surface as classified [`PipelineError`]s; the
/// orchestrator decides between retry and terminal resolution. The one
/// locally recovered failure is a single page's illustration: the page
/// is kept with a null image reference and the loop continues.
pub struct GenerationPipeline {
    db: Database,
    text: Arc<dyn TextGenerator>,
    images: Arc<dyn ImageGenerator>,
    storage: Arc<dyn Storage>,
    image_concurrency: usize,
}

impl GenerationPipeline {
    pub fn new(
        db: Database,
        text: Arc<dyn TextGenerator>,
        images: Arc<dyn ImageGenerator>,
        storage: Arc<dyn Storage>,
        image_concurrency: usize,
    ) -> Self {
        Self {
            db,
            text,
            images,
            storage,
            image_concurrency: image_concurrency.max(1),
        }
    }

    /// Runs all steps for one attempt. Progress checkpoints land at the
    /// fixed step boundaries 20/40/60/80, per-page ticks inside 80..100,
    /// and 100 only on completion.
    pub async fn run(
        &self,
        mut ctx: GenerationContext,
        progress: &dyn ProgressReporter,
    ) -> Result<GenerationReport, PipelineError> {
        let span = info_span!(
            "generation",
            task_id = %ctx.job.task_id,
            book_id = ctx.job.book_id,
            attempt = ctx.attempt,
        );

        async move {
            let book_id = ctx.job.book_id;
            let task_id = ctx.job.task_id.clone();

            self.step_load(&mut ctx)?;
            progress.report(Checkpoint::processing(
                book_id,
                &task_id,
                20,
                "loading",
                "Starting book generation...",
            ));

            self.step_generate_text(&mut ctx).await?;
            progress.report(Checkpoint::processing(
                book_id,
                &task_id,
                40,
                "generating_text",
                "Generating story and page content...",
            ));

            self.step_decompose(&mut ctx);
            progress.report(Checkpoint::processing(
                book_id,
                &task_id,
                60,
                "decomposing",
                "Processing pages and image prompts...",
            ));

            progress.report(Checkpoint::processing(
                book_id,
                &task_id,
                80,
                "generating_images",
                "Generating an illustration for each page...",
            ));
            self.step_generate_images(&mut ctx, progress).await?;

            self.step_persist(&mut ctx)?;

            let report = self.step_finalize(&ctx)?;
            progress.report(Checkpoint::completed(
                book_id,
                &task_id,
                "Book generated and ready!",
            ));

            log::info!(
                "Book {} generated: {} pages, {} illustrations ({} failed)",
                book_id,
                report.pages_persisted,
                report.images_generated,
                report.images_failed
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Step 1: fetch the book and its owner. Missing either is terminal.
    fn step_load(&self, ctx: &mut GenerationContext) -> Result<(), PipelineError> {
        let book = book_repo::find_by_id(&self.db, ctx.job.book_id)?
            .ok_or(NotFoundError::Book(ctx.job.book_id))?;
        let user = user_repo::find_by_id(&self.db, ctx.job.user_id)?
            .ok_or(NotFoundError::User(ctx.job.user_id))?;
        ctx.book = Some(book);
        ctx.user = Some(user);
        Ok(())
    }

    /// Step 2: whole-story text generation.
    async fn step_generate_text(&self, ctx: &mut GenerationContext) -> Result<(), PipelineError> {
        let book = ctx.book.as_ref().expect("step_load completed");
        let story_prompt = prompt::build_story_prompt(book);
        let story = self.text.generate(&story_prompt).await?;
        ctx.story_text = Some(story);
        Ok(())
    }

    /// Step 3: split the story into exactly page_count page texts. No
    /// external calls; marker-less chunks fall back to sequential order.
    fn step_decompose(&self, ctx: &mut GenerationContext) {
        let book = ctx.book.as_ref().expect("step_load completed");
        let story = ctx.story_text.as_ref().expect("step_generate_text completed");

        let texts = prompt::split_into_pages(story, book.page_count);
        ctx.drafts = texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let image_prompt = if text.is_empty() {
                    None
                } else {
                    Some(prompt::build_image_prompt(&text, book.style))
                };
                PageDraft {
                    page_number: i as u32 + 1,
                    text,
                    image_prompt,
                    image_ref: None,
                }
            })
            .collect();
    }

    /// Step 4: per-page illustrations with bounded fan-out. A page whose
    /// illustration fails is kept without an image; the run only aborts
    /// if every page failed.
    async fn step_generate_images(
        &self,
        ctx: &mut GenerationContext,
        progress: &dyn ProgressReporter,
    ) -> Result<(), PipelineError> {
        let book = ctx.book.as_ref().expect("step_load completed");
        let style = book.style;
        let book_id = book.id;
        let task_id = ctx.job.task_id.clone();
        let total = ctx.drafts.len();

        let mut outcomes: Vec<(u32, Option<String>)> = Vec::with_capacity(total);
        let mut last_error = None;
        let mut done = 0usize;

        {
            let mut results = stream::iter(ctx.drafts.iter())
                .map(|draft| {
                    let images = Arc::clone(&self.images);
                    let storage = Arc::clone(&self.storage);
                    let description = draft.image_prompt.clone().unwrap_or_default();
                    let page_number = draft.page_number;
                    let task_id = task_id.clone();
                    async move {
                        let bytes = images.generate(&description, style).await;
                        let stored = bytes.and_then(|bytes| {
                            let name = format!("book_{book_id}_page_{page_number}_{task_id}.png");
                            storage.upload(&bytes, &name).map_err(|e| {
                                crate::ai::ServiceError::retryable(
                                    "image-storage",
                                    e.to_string(),
                                )
                            })
                        });
                        (page_number, stored)
                    }
                })
                .buffered(self.image_concurrency);

            while let Some((page_number, stored)) = results.next().await {
                done += 1;
                let tick = 80 + (20 * done / total.max(1)) as u8;
                match stored {
                    Ok(locator) => {
                        outcomes.push((page_number, Some(locator)));
                        progress.report(Checkpoint::processing(
                            book_id,
                            &task_id,
                            tick.min(99),
                            "generating_images",
                            format!("Generated illustration for page {page_number} of {total}"),
                        ));
                    }
                    Err(e) => {
                        log::warn!(
                            "Illustration for page {} of book {} failed: {}",
                            page_number,
                            book_id,
                            e
                        );
                        last_error = Some(e.to_string());
                        outcomes.push((page_number, None));
                        progress.report(Checkpoint::processing(
                            book_id,
                            &task_id,
                            tick.min(99),
                            "generating_images",
                            format!(
                                "Illustration for page {page_number} failed, continuing without it"
                            ),
                        ));
                    }
                }
            }
        }

        for (page_number, image_ref) in outcomes {
            if let Some(draft) = ctx
                .drafts
                .iter_mut()
                .find(|d| d.page_number == page_number)
            {
                draft.image_ref = image_ref;
            }
        }

        ctx.images_generated = ctx.drafts.iter().filter(|d| d.image_ref.is_some()).count() as u32;
        ctx.images_failed = total as u32 - ctx.images_generated;

        if total > 0 && ctx.images_generated == 0 {
            return Err(PipelineError::AllImagesFailed {
                page_count: total as u32,
                last: last_error.unwrap_or_else(|| "unknown".to_string()),
            });
        }
        Ok(())
    }

    /// Step 5: upsert every page by (book_id, page_number). Writes are
    /// serialized per book; a partial run converges on retry.
    fn step_persist(&self, ctx: &mut GenerationContext) -> Result<(), PipelineError> {
        let book = ctx.book.as_ref().expect("step_load completed");
        for draft in &ctx.drafts {
            let text = if draft.text.is_empty() {
                None
            } else {
                Some(draft.text.clone())
            };
            let page = page_repo::NewPage::new(
                book.id,
                draft.page_number,
                book.page_count,
                text,
                draft.image_ref.clone(),
                draft.image_prompt.clone(),
            )?;
            page_repo::upsert(&self.db, &page).map_err(PipelineError::from)?;
        }
        Ok(())
    }

    /// Step 6: terminal transition to completed plus the cover reference.
    fn step_finalize(&self, ctx: &GenerationContext) -> Result<GenerationReport, PipelineError> {
        let book = ctx.book.as_ref().expect("step_load completed");

        book_repo::update_status(&self.db, book.id, BookStatus::Completed)
            .map_err(PipelineError::from)?;

        let cover = ctx.drafts.iter().find_map(|d| d.image_ref.clone());
        book_repo::set_cover_image(&self.db, book.id, cover.as_deref())?;

        Ok(GenerationReport {
            book_id: book.id,
            task_id: ctx.job.task_id.clone(),
            title: book.title.clone(),
            pages_persisted: ctx.drafts.len() as u32,
            images_generated: ctx.images_generated,
            images_failed: ctx.images_failed,
        })
    }
}
