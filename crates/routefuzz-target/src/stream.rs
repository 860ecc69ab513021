//! Cursor over an append-only, line-delimited report file.

use crate::ReportError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Path plus the byte offset of the first unread line.
///
/// Only complete (newline-terminated) lines are consumed; a line the
/// target is still writing is picked up by the next read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportStream {
    path: PathBuf,
    offset: u64,
}

impl ReportStream {
    /// Cursor at the start of `path`. The file need not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Create or truncate the file and rewind the cursor.
    pub fn reset(&mut self) -> Result<(), ReportError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        self.offset = 0;
        Ok(())
    }

    /// Complete lines appended since the last call, blank lines skipped.
    pub fn read_new_lines(&mut self) -> Result<Vec<String>, ReportError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };

        let len = file
            .metadata()
            .map_err(|source| self.io_error(source))?
            .len();
        if len < self.offset {
            // Truncated underneath us; start over.
            self.offset = 0;
        }

        file.seek(SeekFrom::Start(self.offset))
            .map_err(|source| self.io_error(source))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|source| self.io_error(source))?;

        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete = &buf[..=last_newline];
        self.offset += complete.len() as u64;

        Ok(String::from_utf8_lossy(complete)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// New lines parsed as JSON records of type `T`.
    pub fn read_new<T: DeserializeOwned>(&mut self) -> Result<Vec<T>, ReportError> {
        self.read_new_lines()?
            .iter()
            .map(|line| {
                serde_json::from_str(line).map_err(|source| ReportError::Json {
                    path: self.path.clone(),
                    source,
                })
            })
            .collect()
    }

    fn io_error(&self, source: std::io::Error) -> ReportError {
        ReportError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
