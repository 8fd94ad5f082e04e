//! Double-signing protection for the local validator.
//!
//! The engine records every (kind, height, round) slot it is about to sign
//! and refuses a second signature over different content for the same slot.
//! Recorded slots are appended to an on-disk journal and replayed on start,
//! so the refusal survives restarts.

use crate::consensus::messages::{MSG_PRECOMMIT, MSG_PREVOTE, MSG_PROPOSAL};
use crate::types::{Hash32, Height, Round};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("already signed a different {kind} at height {height} round {round}")]
    Conflict { kind: &'static str, height: Height, round: Round },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct Slot {
    code: u8,
    height: Height,
    round: Round,
}

/// One journal line. The value rides as hex so the journal stays greppable
/// during incident review.
#[derive(Serialize, Deserialize)]
struct JournalEntry {
    code: u8,
    height: Height,
    round: Round,
    value: Option<String>,
}

pub struct SignGuard {
    inner: Mutex<GuardInner>,
}

struct GuardInner {
    file: File,
    signed: HashMap<Slot, Option<Hash32>>,
}

impl SignGuard {
    /// Open (or create) the journal for validator `local_hex` under `dir` and
    /// replay it. Unreadable lines are skipped with a warning rather than
    /// blocking participation.
    pub fn open(dir: impl AsRef<Path>, local_hex: &str) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("signing_{local_hex}.jsonl"));

        let mut signed = HashMap::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let Ok(line) = line else { continue };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_entry(&line) {
                    Some((slot, value)) => {
                        signed.insert(slot, value);
                    }
                    None => warn!(lineno, "skipping corrupt signing journal line"),
                }
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { inner: Mutex::new(GuardInner { file, signed }) })
    }

    /// Record the intent to sign `(code, height, round, value)`. Fails when
    /// the slot already holds different content; re-signing the identical
    /// message is a no-op and is not re-journaled.
    pub fn try_sign(
        &self,
        code: u8,
        height: Height,
        round: Round,
        value: Option<Hash32>,
    ) -> Result<(), GuardError> {
        let slot = Slot { code, height, round };
        let mut inner = self.inner.lock();
        let existing = inner.signed.get(&slot).copied();
        match existing {
            Some(prev) if prev != value => {
                Err(GuardError::Conflict { kind: kind_name(code), height, round })
            }
            Some(_) => Ok(()),
            None => {
                let entry = JournalEntry {
                    code,
                    height,
                    round,
                    value: value.map(|v| v.to_hex()),
                };
                if let Ok(mut line) = serde_json::to_vec(&entry) {
                    line.push(b'\n');
                    let write = inner.file.write_all(&line).and_then(|_| inner.file.sync_data());
                    if let Err(err) = write {
                        warn!(%err, "signing journal append failed");
                    }
                }
                inner.signed.insert(slot, value);
                Ok(())
            }
        }
    }
}

fn kind_name(code: u8) -> &'static str {
    match code {
        MSG_PROPOSAL => "proposal",
        MSG_PREVOTE => "prevote",
        MSG_PRECOMMIT => "precommit",
        _ => "message",
    }
}

fn parse_entry(line: &str) -> Option<(Slot, Option<Hash32>)> {
    let entry: JournalEntry = serde_json::from_str(line).ok()?;
    let value = match entry.value {
        None => None,
        Some(hex_str) => {
            let bytes = hex::decode(hex_str).ok()?;
            let arr: [u8; 32] = bytes.try_into().ok()?;
            Some(Hash32(arr))
        }
    };
    Some((Slot { code: entry.code, height: entry.height, round: entry.round }, value))
}
