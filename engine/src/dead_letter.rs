//! Dead-letter store for records that exhausted their retries.
//!
//! Records end up here instead of blocking the rest of the queue. They
//! are kept for diagnostics only; nothing re-sends them.

use crate::{error::Result, DeadLetter, Error};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// File name of the dead-letter log inside the storage directory.
pub const DEAD_LETTER_FILE_NAME: &str = "dead_letters.jsonl";

/// Where dead letters are kept.
#[derive(Debug)]
pub struct DeadLetterStore {
    path: Option<PathBuf>,
    memory: Mutex<Vec<DeadLetter>>,
}

impl DeadLetterStore {
    /// Keep dead letters in memory only.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            memory: Mutex::new(Vec::new()),
        }
    }

    /// Append dead letters to a JSON-lines file in `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: Some(dir.join(DEAD_LETTER_FILE_NAME)),
            memory: Mutex::new(Vec::new()),
        })
    }

    /// Persist a group of dead letters.
    pub fn persist(&self, letters: &[DeadLetter]) -> Result<()> {
        if letters.is_empty() {
            return Ok(());
        }

        match &self.path {
            Some(path) => {
                let mut out = Vec::new();
                for letter in letters {
                    serde_json::to_writer(&mut out, letter)
                        .map_err(|e| Error::Storage(e.to_string()))?;
                    out.push(b'\n');
                }
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                file.write_all(&out)?;
                file.sync_data()?;
            }
            None => {
                self.memory
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(letters);
            }
        }
        Ok(())
    }

    /// All dead letters stored so far, oldest first.
    pub fn entries(&self) -> Result<Vec<DeadLetter>> {
        let Some(path) = &self.path else {
            return Ok(self
                .memory
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone());
        };

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut letters = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            match serde_json::from_str(&line) {
                Ok(letter) => letters.push(letter),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable dead letter"),
            }
        }
        Ok(letters)
    }

    /// Number of dead letters stored.
    pub fn len(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }
}
