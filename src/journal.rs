// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Write-ahead journal of committed entries and account lifecycle events.
//!
//! One JSON object per line, in commit order. A record is written before it
//! becomes visible in memory. File journals are synced to disk with
//! `sync_data` on every record; other writers are only flushed, so their
//! durability is whatever the writer provides.
//!
//! A write that fails part way must not leave a fragment for the next record
//! to be glued onto. A file journal is truncated back to its last committed
//! length; any other writer is poisoned and refuses further records until the
//! journal is reopened.
//!
//! ```text
//! {"record":"account-opened","account":"alice"}
//! {"record":"entry","id":1,"fromAccount":null,"toAccount":"alice","amount":100,"kind":"earned",...}
//! {"record":"account-deactivated","account":"alice"}
//! ```

use crate::LedgerError;
use crate::base::{AccountId, EntryId};
use crate::transaction::TransactionEntry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{error, warn};

/// Errors raised while loading a journal file.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt journal entry at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("journal entry {entry} cannot be replayed: {source}")]
    Replay {
        entry: EntryId,
        #[source]
        source: LedgerError,
    },
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "kebab-case")]
pub enum JournalRecord {
    Entry(TransactionEntry),
    AccountOpened { account: AccountId },
    AccountDeactivated { account: AccountId },
}

/// Append-only sink for committed entries.
pub struct Journal {
    sink: Mutex<Sink>,
}

struct Sink {
    target: Target,
    poisoned: bool,
}

enum Target {
    /// Journal file and the length of its committed prefix.
    File { file: File, committed: u64 },
    Stream(Box<dyn Write + Send>),
}

impl Journal {
    /// Opens (or creates) the journal at `path` and returns the records it
    /// already holds.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<JournalRecord>), JournalError> {
        let path = path.as_ref();
        let (records, valid_len) = if path.exists() {
            scan(File::open(path)?)?
        } else {
            (Vec::new(), 0)
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            // Cut the torn tail so the next record starts on a fresh line.
            file.set_len(valid_len)?;
        }
        let journal = Self {
            sink: Mutex::new(Sink {
                target: Target::File {
                    file,
                    committed: valid_len,
                },
                poisoned: false,
            }),
        };
        Ok((journal, records))
    }

    /// Wraps an arbitrary writer. Every record is flushed immediately.
    ///
    /// A writer cannot be rolled back, so one that fails after accepting part
    /// of a record poisons the journal.
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            sink: Mutex::new(Sink {
                target: Target::Stream(Box::new(writer)),
                poisoned: false,
            }),
        }
    }

    /// Returns `true` once a failed write has left the journal unusable.
    pub fn is_poisoned(&self) -> bool {
        self.sink.lock().poisoned
    }

    /// Writes one record.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::SystemUnavailable`] if the record could not be
    /// serialized, written or synced, or if the journal is poisoned.
    pub fn record(&self, record: &JournalRecord) -> Result<(), LedgerError> {
        let mut line = serde_json::to_vec(record).map_err(|e| {
            error!(error = %e, "failed to serialize journal record");
            LedgerError::SystemUnavailable
        })?;
        line.push(b'\n');

        let mut sink = self.sink.lock();
        if sink.poisoned {
            error!("journal is poisoned by an earlier failed write; reopen it");
            return Err(LedgerError::SystemUnavailable);
        }

        let poisoned = match &mut sink.target {
            Target::File { file, committed } => {
                let (_, result) = write_line(file, &line);
                match result.and_then(|()| file.sync_data()) {
                    Ok(()) => {
                        *committed += line.len() as u64;
                        return Ok(());
                    }
                    Err(e) => {
                        error!(error = %e, "journal write failed");
                        match file.set_len(*committed) {
                            Ok(()) => false,
                            Err(e) => {
                                error!(error = %e, "failed to roll back journal write");
                                true
                            }
                        }
                    }
                }
            }
            Target::Stream(writer) => {
                let (written, result) = write_line(writer.as_mut(), &line);
                match result {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        error!(error = %e, written, "journal write failed");
                        written > 0
                    }
                }
            }
        };

        sink.poisoned = poisoned;
        Err(LedgerError::SystemUnavailable)
    }
}

/// Writes `line` and flushes, returning how many bytes the writer accepted.
fn write_line(writer: &mut dyn Write, line: &[u8]) -> (usize, io::Result<()>) {
    let mut written = 0;
    while written < line.len() {
        match writer.write(&line[written..]) {
            Ok(0) => return (written, Err(io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return (written, Err(e)),
        }
    }
    (written, writer.flush())
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal").finish_non_exhaustive()
    }
}

/// Parses journal lines.
///
/// A final line without a trailing newline is treated as a torn write and
/// dropped. Any other unparsable line is an error.
pub fn read_records<R: io::Read>(reader: R) -> Result<Vec<JournalRecord>, JournalError> {
    scan(reader).map(|(records, _)| records)
}

/// Parses journal lines and returns the byte length of the valid prefix.
fn scan<R: io::Read>(reader: R) -> Result<(Vec<JournalRecord>, u64), JournalError> {
    let mut reader = BufReader::new(reader);
    let mut records = Vec::new();
    let mut buf = String::new();
    let mut line_no = 0usize;
    let mut valid_len = 0u64;

    loop {
        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }
        line_no += 1;

        let complete = buf.ends_with('\n');
        let line = buf.trim();
        if line.is_empty() {
            valid_len += read as u64;
            continue;
        }

        match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) if complete => {
                records.push(record);
                valid_len += read as u64;
            }
            // The newline is part of the same write; without it the record
            // was never acknowledged.
            Ok(_) => {
                warn!(line = line_no, "dropping unterminated journal tail");
                break;
            }
            Err(e) if !complete => {
                warn!(line = line_no, error = %e, "dropping torn journal tail");
                break;
            }
            Err(source) => {
                return Err(JournalError::Corrupt {
                    line: line_no,
                    source,
                });
            }
        }
    }

    Ok((records, valid_len))
}
