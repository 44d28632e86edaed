use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::StorageError;

use super::Storage;

/// Filesystem-backed storage. Locators are file names relative to the
/// root directory, so they stay valid when the root moves.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Locators come from the database; reject anything that could step
    /// outside the root.
    fn checked_name(name: &str) -> Result<&str, StorageError> {
        let trimmed = name.trim();
        if trimmed.is_empty()
            || trimmed.contains('/')
            || trimmed.contains('\\')
            || trimmed.contains("..")
        {
            return Err(StorageError::InvalidLocator(name.to_string()));
        }
        Ok(trimmed)
    }

    fn ensure_root(&self) -> Result<(), StorageError> {
        if !self.root.exists() {
            std::fs::create_dir_all(&self.root).map_err(|e| StorageError::CreateDirectory {
                path: self.root.clone(),
                source: e,
            })?;
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn upload(&self, bytes: &[u8], name: &str) -> Result<String, StorageError> {
        let name = Self::checked_name(name)?;
        self.ensure_root()?;

        let (base, ext) = match name.rfind('.') {
            Some(pos) => (&name[..pos], Some(&name[pos..])),
            None => (name, None),
        };

        // Atomic create-new write; on a name collision, append a counter.
        for counter in 1..=1000u32 {
            let candidate = if counter == 1 {
                name.to_string()
            } else {
                match ext {
                    Some(ext) => format!("{base}_{counter}{ext}"),
                    None => format!("{base}_{counter}"),
                }
            };
            let path = self.root.join(&candidate);

            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    file.write_all(bytes).map_err(|e| StorageError::WriteFile {
                        path: path.clone(),
                        source: e,
                    })?;
                    return Ok(candidate);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StorageError::WriteFile { path, source: e }),
            }
        }

        Err(StorageError::FileExists(self.root.join(name)))
    }

    fn delete(&self, locator: &str) -> Result<bool, StorageError> {
        let name = Self::checked_name(locator)?;
        let path = self.root.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::DeleteFile { path, source: e }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_upload_and_delete() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());

        let locator = storage.upload(b"png bytes", "book_1_page_1.png").unwrap();
        assert_eq!(locator, "book_1_page_1.png");
        assert_eq!(std::fs::read(dir.path().join(&locator)).unwrap(), b"png bytes");

        assert!(storage.delete(&locator).unwrap());
        // Deleting again is tolerated, not an error.
        assert!(!storage.delete(&locator).unwrap());
    }

    #[test]
    fn test_upload_conflict_appends_counter() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());

        let first = storage.upload(b"a", "cover.png").unwrap();
        let second = storage.upload(b"b", "cover.png").unwrap();
        assert_eq!(first, "cover.png");
        assert_eq!(second, "cover_2.png");
        assert_eq!(std::fs::read(dir.path().join("cover_2.png")).unwrap(), b"b");
    }

    #[test]
    fn test_creates_root_on_first_upload() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("media");
        let storage = FileStorage::new(&root);

        storage.upload(b"x", "file.bin").unwrap();
        assert!(root.join("file.bin").exists());
    }

    #[test]
    fn test_rejects_traversal_locators() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());

        for bad in ["../escape.png", "sub/dir.png", "", "a\\b.png"] {
            assert!(
                matches!(storage.upload(b"x", bad), Err(StorageError::InvalidLocator(_))),
                "expected rejection for '{bad}'"
            );
            assert!(matches!(
                storage.delete(bad),
                Err(StorageError::InvalidLocator(_))
            ));
        }
    }
}
