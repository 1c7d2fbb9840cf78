//! Per-journal persistent position cursors.
//!
//! One cursor file lives under the tracking directory per journal, named
//! `binlogpos<ext>` where `<ext>` is the journal filename's own numeric
//! extension (`mysql-bin.000123` -> `binlogpos.000123`). A missing cursor
//! file reads as position `"0"`; every write truncates before writing so
//! that readers never observe a prefix or a mix of old and new positions.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use mygrate_errors::CursorError;

/// Builds the tracking-file path for a given journal path, under
/// `tracking_dir`.
pub fn cursor_path(tracking_dir: &Path, journal: &Path) -> PathBuf {
    let ext = journal
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    tracking_dir.join(format!("binlogpos{ext}"))
}

/// Reads the persisted position for a cursor file, or `"0"` if the file
/// doesn't exist yet. Any other I/O error is fatal, per the cursor store
/// contract.
pub fn read_position(path: &Path) -> Result<String, CursorError> {
    let mut contents = String::new();
    match File::open(path) {
        Ok(mut f) => {
            f.read_to_string(&mut contents)
                .map_err(|source| CursorError::Read {
                    path: path.to_owned(),
                    source,
                })?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok("0".to_owned()),
        Err(source) => {
            return Err(CursorError::Read {
                path: path.to_owned(),
                source,
            })
        }
    }
    let trimmed = contents.trim_end().to_owned();
    Ok(if trimmed.is_empty() {
        "0".to_owned()
    } else {
        trimmed
    })
}

/// An open cursor file, held for the duration of one sweep over one journal
/// so repeated `# at` markers reuse the same handle instead of reopening the
/// file on every advance.
pub struct CursorHandle {
    file: File,
    path: PathBuf,
}

impl CursorHandle {
    /// Opens (creating if necessary) the cursor file at `path` for reuse
    /// across a sweep.
    pub fn open(path: &Path) -> Result<Self, CursorError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| CursorError::Write {
                path: path.to_owned(),
                source,
            })?;
        Ok(CursorHandle {
            file,
            path: path.to_owned(),
        })
    }

    /// Seeks to the start, truncates, writes `position`, and flushes. No
    /// fsync: the cursor store accepts "slightly behind on crash" (replay)
    /// in exchange for not paying fsync cost on every event boundary; fsync
    /// is reserved for the errors log.
    pub fn write(&mut self, position: &str) -> Result<(), CursorError> {
        let to_err = |source| CursorError::Write {
            path: self.path.clone(),
            source,
        };
        self.file.seek(SeekFrom::Start(0)).map_err(to_err)?;
        self.file.set_len(0).map_err(to_err)?;
        self.file.write_all(position.as_bytes()).map_err(to_err)?;
        self.file.flush().map_err(to_err)?;
        Ok(())
    }
}
