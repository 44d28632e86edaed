//! Output storage for generated artifacts (page illustrations, covers,
//! assembled files). The pipeline and sweeper only use the trait.

pub mod filesystem;

pub use filesystem::FileStorage;

use crate::error::StorageError;

/// Narrow storage seam: store bytes under a name, get a locator back;
/// delete by locator. Deleting a missing artifact returns `Ok(false)`,
/// which keeps recovery sweeps idempotent.
pub trait Storage: Send + Sync {
    fn upload(&self, bytes: &[u8], name: &str) -> Result<String, StorageError>;
    fn delete(&self, locator: &str) -> Result<bool, StorageError>;
}
