//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Enumerating the files under a source location
//! - Reading fixed-size transfer blocks from a source file

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::source::FileMatcher;

/// A regular file found while walking a source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub file_size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

/// Result of walking one source location.
///
/// Errors below the root are collected rather than aborting the walk.
#[derive(Debug, Default)]
pub struct Enumeration {
    pub files: Vec<DiscoveredFile>,
    pub errors: Vec<EngineError>,
}

/// Enumerate every regular file under `root` whose name passes `matcher`.
///
/// # Errors
/// Returns EngineError if the root itself cannot be read.
pub fn enumerate_source(root: &Path, matcher: &FileMatcher) -> Result<Enumeration, EngineError> {
    let mut enumeration = Enumeration::default();

    fn recurse(
        path: &Path,
        matcher: &FileMatcher,
        out: &mut Enumeration,
    ) -> Result<(), EngineError> {
        let entries = fs::read_dir(path).map_err(|e| EngineError::EnumerationFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    out.errors.push(EngineError::EnumerationFailed {
                        path: path.to_path_buf(),
                        source: e,
                    });
                    continue;
                }
            };

            let entry_path = entry.path();
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    out.errors.push(EngineError::ReadError {
                        path: entry_path,
                        source: e,
                    });
                    continue;
                }
            };

            if metadata.is_dir() {
                // Record the failure and keep walking siblings
                if let Err(e) = recurse(&entry_path, matcher, out) {
                    out.errors.push(e);
                }
                continue;
            }

            if !metadata.is_file() {
                continue;
            }

            let name = entry.file_name();
            if !matcher.matches(&name.to_string_lossy()) {
                continue;
            }

            let modified = match metadata.modified() {
                Ok(modified) => modified,
                Err(e) => {
                    out.errors.push(EngineError::ReadError {
                        path: entry_path,
                        source: e,
                    });
                    continue;
                }
            };

            out.files.push(DiscoveredFile {
                path: entry_path,
                file_size_bytes: metadata.len(),
                last_modified: to_utc(modified),
            });
        }

        Ok(())
    }

    recurse(root, matcher, &mut enumeration)?;
    Ok(enumeration)
}

/// Read block `index` of an open file. The final block of a file may be short.
pub fn read_block(file: &mut File, index: i64, block_size: u64) -> io::Result<Vec<u8>> {
    let offset = u64::try_from(index)
        .ok()
        .and_then(|i| i.checked_mul(block_size))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid block index"))?;
    file.seek(SeekFrom::Start(offset))?;

    let mut buffer = Vec::with_capacity(block_size as usize);
    file.by_ref().take(block_size).read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Convert a filesystem timestamp to UTC.
pub fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
