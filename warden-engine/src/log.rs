//! In-memory view of the replicated log behind the last snapshot.

use warden_core::messages::LogEntry;
use warden_core::state_machine::Snapshot;
use warden_core::{Configuration, Result, WardenError};

/// Log entries after the compaction point.
///
/// Entry `i` of `entries` always has index `snapshot_index + 1 + i`.
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
    snapshot_configuration: Configuration,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the log from a stored snapshot and log tail. Entries already
    /// covered by the snapshot are dropped.
    pub fn restore(snapshot: Option<&Snapshot>, entries: Vec<LogEntry>) -> Result<Self> {
        let mut log = Self::new();
        if let Some(snapshot) = snapshot {
            log.snapshot_index = snapshot.last_index;
            log.snapshot_term = snapshot.last_term;
            log.snapshot_configuration = snapshot.configuration.clone();
        }

        for entry in entries {
            if entry.index <= log.snapshot_index {
                continue;
            }
            if entry.index != log.last_index() + 1 {
                return Err(WardenError::StateCorruption {
                    details: format!(
                        "log gap: expected index {}, found {}",
                        log.last_index() + 1,
                        entry.index
                    ),
                });
            }
            log.entries.push(entry);
        }
        Ok(log)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index <= self.snapshot_index {
            return None;
        }
        let offset = (index - self.snapshot_index - 1) as usize;
        (offset < self.entries.len()).then_some(offset)
    }

    /// Term of the entry at `index`; `None` if compacted away or not yet
    /// written.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.offset(index).map(|o| self.entries[o].term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        self.offset(index).map(|o| &self.entries[o])
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        match self.offset(start) {
            Some(o) => self.entries[o..].iter().take(max).cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Removes every entry at or after `index`.
    pub fn truncate_from(&mut self, index: u64) {
        if let Some(o) = self.offset(index) {
            self.entries.truncate(o);
        }
    }

    /// Whether a candidate whose log ends at (`last_index`, `last_term`) is
    /// at least as current as this log.
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_index >= self.last_index())
    }

    /// The configuration in effect: the most recent configuration entry,
    /// committed or not.
    pub fn latest_configuration(&self) -> &Configuration {
        self.entries
            .iter()
            .rev()
            .find_map(|e| e.as_configuration())
            .unwrap_or(&self.snapshot_configuration)
    }

    pub fn latest_configuration_index(&self) -> u64 {
        self.entries
            .iter()
            .rev()
            .find(|e| e.as_configuration().is_some())
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    /// The configuration in effect as of `index`.
    pub fn configuration_at(&self, index: u64) -> &Configuration {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.index <= index)
            .find_map(|e| e.as_configuration())
            .unwrap_or(&self.snapshot_configuration)
    }

    /// Drops entries up to and including `upto`, folding them into the
    /// snapshot metadata.
    pub fn compact(&mut self, upto: u64) {
        let Some(term) = self.term_at(upto) else {
            return;
        };
        if upto <= self.snapshot_index {
            return;
        }
        self.snapshot_configuration = self.configuration_at(upto).clone();
        self.snapshot_term = term;
        let drain = (upto - self.snapshot_index) as usize;
        self.entries.drain(..drain);
        self.snapshot_index = upto;
    }

    /// Replaces the log prefix with `snapshot`. A suffix that agrees with the
    /// snapshot's last entry is retained.
    pub fn install_snapshot(&mut self, snapshot: &Snapshot) {
        let retain = self.term_at(snapshot.last_index) == Some(snapshot.last_term)
            && snapshot.last_index >= self.snapshot_index;
        if retain {
            let drain = (snapshot.last_index - self.snapshot_index) as usize;
            self.entries.drain(..drain.min(self.entries.len()));
        } else {
            self.entries.clear();
        }
        self.snapshot_index = snapshot.last_index;
        self.snapshot_term = snapshot.last_term;
        self.snapshot_configuration = snapshot.configuration.clone();
    }
}
