//! Last applied level, kept between runs
//!
//! The file holds a single decimal integer with no trailing newline.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Level used when nothing has been stored yet
pub const DEFAULT_LEVEL: u32 = 1;

pub trait LevelStore: Send {
    /// Stored level, or [`DEFAULT_LEVEL`] when absent or unreadable.
    fn read_last_level(&self) -> u32;

    fn write_last_level(&self, level: u32) -> Result<()>;
}

/// Plain-text file store.
#[derive(Debug, Clone)]
pub struct FileLevelStore {
    path: PathBuf,
}

impl FileLevelStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LevelStore for FileLevelStore {
    fn read_last_level(&self) -> u32 {
        let content = match fs::read_to_string(&self.path).map_err(Error::from) {
            Ok(c) => c,
            Err(e) if e.is_not_found() => {
                debug!(
                    "No level file at {}, starting at level {}",
                    self.path.display(),
                    DEFAULT_LEVEL
                );
                return DEFAULT_LEVEL;
            }
            Err(e) => {
                warn!(
                    "Level file {} not readable ({}), starting at level {}",
                    self.path.display(),
                    e,
                    DEFAULT_LEVEL
                );
                return DEFAULT_LEVEL;
            }
        };

        match content.trim().parse::<i64>() {
            Ok(level) => level.clamp(0, u32::MAX as i64) as u32,
            Err(e) => {
                warn!(
                    "Ignoring malformed level file {} ({:?}: {}), starting at level {}",
                    self.path.display(),
                    content.trim(),
                    e,
                    DEFAULT_LEVEL
                );
                DEFAULT_LEVEL
            }
        }
    }

    fn write_last_level(&self, level: u32) -> Result<()> {
        fs::write(&self.path, level.to_string())?;
        debug!("Saved level {} to {}", level, self.path.display());
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryLevelStore {
    level: Mutex<Option<u32>>,
}

impl MemoryLevelStore {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Mutex::new(Some(level)),
        }
    }
}

impl LevelStore for MemoryLevelStore {
    fn read_last_level(&self) -> u32 {
        self.level
            .lock()
            .ok()
            .and_then(|l| *l)
            .unwrap_or(DEFAULT_LEVEL)
    }

    fn write_last_level(&self, level: u32) -> Result<()> {
        if let Ok(mut stored) = self.level.lock() {
            *stored = Some(level);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_defaults_to_one() {
        let dir = tempdir().unwrap();
        let store = FileLevelStore::new(dir.path().join("LAST_NG_LEVEL.cfg"));
        assert_eq!(store.read_last_level(), 1);
    }

    #[test]
    fn test_unreadable_path_defaults_to_one() {
        let dir = tempdir().unwrap();
        let store = FileLevelStore::new(dir.path());
        assert_eq!(store.read_last_level(), DEFAULT_LEVEL);
    }

    #[test]
    fn test_write_is_plain_integer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("LAST_NG_LEVEL.cfg");
        let store = FileLevelStore::new(&path);

        store.write_last_level(12).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "12");
        assert_eq!(store.read_last_level(), 12);
    }

    #[test]
    fn test_tolerates_whitespace_and_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("level.cfg");
        let store = FileLevelStore::new(&path);

        fs::write(&path, " 7\r\n").unwrap();
        assert_eq!(store.read_last_level(), 7);

        fs::write(&path, "seven").unwrap();
        assert_eq!(store.read_last_level(), DEFAULT_LEVEL);

        fs::write(&path, "-4").unwrap();
        assert_eq!(store.read_last_level(), 0);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryLevelStore::default();
        assert_eq!(store.read_last_level(), DEFAULT_LEVEL);
        store.write_last_level(9).unwrap();
        assert_eq!(store.read_last_level(), 9);
    }
}
