//! Durable settlement journal.
//!
//! Append-only record of every claim's state transitions, written ahead of
//! each side-effecting call. One JSON entry per line; each append is
//! flushed and fsynced before it returns, so a crash can lose at most work
//! that was never acted on. On open, the file is replayed to rebuild the
//! last-state index used for replay protection and recovery.
//!
//! The in-memory index prunes terminal entries beyond a configured cap
//! (oldest first) so replay memory stays bounded; the consumed-claim LRU
//! cache extends fast replay rejection past the pruning horizon.

use crate::claim::{ClaimId, ClaimState};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Maximum accepted length of a single journal line during replay.
/// Guards against unbounded memory use from a corrupted file.
const MAX_JOURNAL_LINE_LEN: usize = 16_384;

/// Configuration for the settlement journal.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Path of the journal file.
    pub path: PathBuf,
    /// Terminal entries retained in the in-memory index before pruning.
    pub max_terminal_entries: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("settlement.journal"),
            max_terminal_entries: 100_000,
        }
    }
}

/// One immutable state transition record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// The claim this transition belongs to.
    pub claim_id: ClaimId,
    /// State departed.
    pub from_state: ClaimState,
    /// State entered.
    pub to_state: ClaimState,
    /// When the transition was recorded.
    pub timestamp: DateTime<Utc>,
    /// Why the transition happened, where not obvious.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Paying agent, recorded on the first transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Requested resource, recorded on the first transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Amount involved, recorded once known and on terminal transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
}

impl JournalEntry {
    /// Create an entry for `claim_id` moving `from` -> `to` now.
    #[must_use]
    pub fn new(claim_id: ClaimId, from: ClaimState, to: ClaimState) -> Self {
        Self {
            claim_id,
            from_state: from,
            to_state: to,
            timestamp: Utc::now(),
            reason: None,
            agent: None,
            resource: None,
            amount: None,
        }
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach claim context (agent, resource, amount).
    #[must_use]
    pub fn with_context(
        mut self,
        agent: impl Into<String>,
        resource: impl Into<String>,
        amount: u64,
    ) -> Self {
        self.agent = Some(agent.into());
        self.resource = Some(resource.into());
        self.amount = Some(amount);
        self
    }

    /// Attach an amount only.
    #[must_use]
    pub fn with_amount(mut self, amount: u64) -> Self {
        self.amount = Some(amount);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    last_state: ClaimState,
    seq: u64,
}

struct JournalState {
    file: File,
    seq: u64,
    index: HashMap<ClaimId, IndexEntry>,
    /// Terminal claims in completion order, for oldest-first pruning.
    terminal_queue: VecDeque<ClaimId>,
}

/// Durable, append-only settlement journal.
pub struct SettlementJournal {
    config: JournalConfig,
    state: Mutex<JournalState>,
}

impl SettlementJournal {
    /// Open (or create) the journal at the configured path and rebuild the
    /// index by replaying existing entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or contains an entry
    /// that does not parse — a corrupt journal must be inspected, not
    /// silently skipped past.
    pub fn open(config: JournalConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;

        let mut index: HashMap<ClaimId, IndexEntry> = HashMap::new();
        let mut terminal_queue = VecDeque::new();
        let mut seq = 0u64;

        let reader = BufReader::new(File::open(&config.path)?);
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_JOURNAL_LINE_LEN {
                return Err(Error::Journal(format!(
                    "journal line {} exceeds {MAX_JOURNAL_LINE_LEN} bytes",
                    line_no + 1
                )));
            }
            let entry: JournalEntry = serde_json::from_str(&line).map_err(|e| {
                Error::Journal(format!("corrupt journal line {}: {e}", line_no + 1))
            })?;

            seq += 1;
            if entry.to_state.is_terminal() {
                terminal_queue.push_back(entry.claim_id);
            }
            index.insert(
                entry.claim_id,
                IndexEntry {
                    last_state: entry.to_state,
                    seq,
                },
            );
        }

        let non_terminal = index
            .values()
            .filter(|e| !e.last_state.is_terminal())
            .count();
        info!(
            "journal opened: {} entries, {} claims, {} non-terminal",
            seq,
            index.len(),
            non_terminal
        );

        let journal = Self {
            config,
            state: Mutex::new(JournalState {
                file,
                seq,
                index,
                terminal_queue,
            }),
        };
        {
            let mut state = journal.state.lock();
            journal.prune_locked(&mut state);
        }

        Ok(journal)
    }

    /// Durably append one transition.
    ///
    /// The entry is validated against the claim's last journaled state,
    /// serialized, written, flushed, and fsynced before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] for an illegal edge, or
    /// [`Error::JournalUnavailable`] if the write cannot be made durable —
    /// callers must fail closed on the latter.
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let mut state = self.state.lock();

        // Transition legality against the journaled history, not caller
        // memory.
        match state.index.get(&entry.claim_id) {
            Some(existing) => {
                if existing.last_state != entry.from_state
                    || !existing.last_state.can_transition_to(entry.to_state)
                {
                    return Err(Error::InvalidTransition {
                        from: existing.last_state.to_string(),
                        to: entry.to_state.to_string(),
                    });
                }
            }
            None => {
                if entry.from_state != ClaimState::Received
                    || !entry.from_state.can_transition_to(entry.to_state)
                {
                    return Err(Error::InvalidTransition {
                        from: entry.from_state.to_string(),
                        to: entry.to_state.to_string(),
                    });
                }
            }
        }

        let line = serde_json::to_string(entry)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let write_result = (|| -> std::io::Result<()> {
            state.file.write_all(line.as_bytes())?;
            state.file.write_all(b"\n")?;
            state.file.flush()?;
            state.file.sync_all()
        })();
        if let Err(e) = write_result {
            warn!("journal append failed: {e}");
            return Err(Error::JournalUnavailable(e.to_string()));
        }

        state.seq += 1;
        let seq = state.seq;
        if entry.to_state.is_terminal() {
            state.terminal_queue.push_back(entry.claim_id);
        }
        state.index.insert(
            entry.claim_id,
            IndexEntry {
                last_state: entry.to_state,
                seq,
            },
        );
        self.prune_locked(&mut state);

        debug!(
            "journaled {}: {} -> {}",
            entry.claim_id, entry.from_state, entry.to_state
        );
        Ok(())
    }

    fn prune_locked(&self, state: &mut JournalState) {
        while state.terminal_queue.len() > self.config.max_terminal_entries {
            if let Some(oldest) = state.terminal_queue.pop_front() {
                state.index.remove(&oldest);
            }
        }
    }

    /// Whether the journal remembers this claim id (within the retention
    /// horizon).
    #[must_use]
    pub fn contains(&self, claim_id: &ClaimId) -> bool {
        self.state.lock().index.contains_key(claim_id)
    }

    /// Last journaled state for a claim, if remembered.
    #[must_use]
    pub fn last_state(&self, claim_id: &ClaimId) -> Option<ClaimState> {
        self.state.lock().index.get(claim_id).map(|e| e.last_state)
    }

    /// Claim ids whose last journaled state is non-terminal.
    #[must_use]
    pub fn scan_non_terminal(&self) -> Vec<ClaimId> {
        let state = self.state.lock();
        let mut ids: Vec<(u64, ClaimId)> = state
            .index
            .iter()
            .filter(|(_, e)| !e.last_state.is_terminal())
            .map(|(id, e)| (e.seq, *id))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Ordered entries for one claim, read back from the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or an entry is corrupt.
    pub fn read(&self, claim_id: &ClaimId) -> Result<Vec<JournalEntry>> {
        // Hold the writer lock so a concurrent append cannot leave a
        // partial trailing line in view.
        let _state = self.state.lock();

        let reader = BufReader::new(File::open(&self.config.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(&line)
                .map_err(|e| Error::Journal(format!("corrupt journal entry: {e}")))?;
            if entry.claim_id == *claim_id {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// All entries in append order, for read-model projections.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or an entry is corrupt.
    pub fn read_all(&self) -> Result<Vec<JournalEntry>> {
        let _state = self.state.lock();

        let reader = BufReader::new(File::open(&self.config.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            entries.push(
                serde_json::from_str(&line)
                    .map_err(|e| Error::Journal(format!("corrupt journal entry: {e}")))?,
            );
        }
        Ok(entries)
    }

    /// Number of claims tracked in the index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().index.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().index.is_empty()
    }
}
