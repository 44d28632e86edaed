//! Recovery sweeper: periodically reclaims failed books past an age
//! threshold, deleting their stored artifacts and rows. Re-running over
//! an already-cleaned book is a no-op; processing and completed books
//! are never touched regardless of age.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::config::SweeperSettings;
use crate::db::{book_repo, page_repo, Database};
use crate::error::Result;
use crate::storage::Storage;

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub checked: usize,
    pub cleaned: usize,
    pub files_removed: usize,
}

pub struct RecoverySweeper {
    db: Database,
    storage: Arc<dyn Storage>,
    interval: Duration,
    failed_age: Duration,
    shutdown: Arc<AtomicBool>,
}

impl RecoverySweeper {
    pub fn new(
        db: Database,
        storage: Arc<dyn Storage>,
        interval: Duration,
        failed_age: Duration,
    ) -> Self {
        Self {
            db,
            storage,
            interval,
            failed_age,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_settings(db: Database, storage: Arc<dyn Storage>, settings: &SweeperSettings) -> Self {
        Self::new(db, storage, settings.interval(), settings.failed_age())
    }

    /// Starts the sweep loop in a background thread. Accepts a trigger
    /// receiver for manual sweeps between ticks.
    pub fn start(&self, mut trigger_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let db = self.db.clone();
        let storage = Arc::clone(&self.storage);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;
        let failed_age = self.failed_age;

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    log::error!("Sweeper failed to build its runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(interval);
                interval_timer.tick().await; // skip immediate first tick

                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            log::info!("Manual recovery sweep triggered");
                        },
                    }

                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    match sweep(&db, storage.as_ref(), failed_age) {
                        Ok(stats) if stats.cleaned > 0 => {
                            log::info!(
                                "Recovery sweep: reclaimed {} of {} stale failed books ({} files)",
                                stats.cleaned,
                                stats.checked,
                                stats.files_removed
                            );
                        }
                        Err(e) => log::error!("Recovery sweep failed: {}", e),
                        _ => {}
                    }
                }
            });
        })
    }

    /// Signals the sweep loop to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// One sweep pass. Missing files are tolerated, so a pass over
    /// half-cleaned state converges instead of failing.
    pub fn sweep_once(&self) -> Result<SweepStats> {
        sweep(&self.db, self.storage.as_ref(), self.failed_age)
    }
}

fn sweep(db: &Database, storage: &dyn Storage, failed_age: Duration) -> Result<SweepStats> {
    let age = chrono::Duration::from_std(failed_age)
        .unwrap_or_else(|_| chrono::Duration::hours(24));
    let cutoff = Utc::now() - age;

    let stale = book_repo::find_stale_failed(db, cutoff)?;
    let mut stats = SweepStats {
        checked: stale.len(),
        ..Default::default()
    };

    for book in stale {
        let mut locators = page_repo::image_refs_for_book(db, book.id)?;
        locators.extend(book.cover_image.clone());
        locators.extend(book.pdf_file.clone());

        for locator in &locators {
            match storage.delete(locator) {
                Ok(true) => stats.files_removed += 1,
                Ok(false) => {} // already gone
                Err(e) => {
                    log::warn!("Could not delete artifact '{}' of book {}: {}", locator, book.id, e);
                }
            }
        }

        page_repo::delete_for_book(db, book.id)?;
        match book_repo::delete(db, book.id) {
            Ok(true) => {
                stats.cleaned += 1;
                log::info!("Reclaimed failed book {} ('{}')", book.id, book.title);
            }
            Ok(false) => {} // removed by someone else meanwhile
            Err(e) => log::warn!("Could not delete book {}: {}", book.id, e),
        }
    }

    Ok(stats)
}
