use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{LogStatus, WorkLogEntry};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkLogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkLogError>;

// ---------------------------------------------------------------------------
// WorkLog
// ---------------------------------------------------------------------------

/// Append-only, bounded history of action lifecycle events.
///
/// Entries live in memory up to `retention`; older ones are evicted. When
/// backed by a file, every entry is appended as one JSON line. The file is
/// compacted back down to `retention` lines on open and whenever it grows
/// past twice the retention.
pub struct WorkLog {
    path: Option<PathBuf>,
    file: Option<File>,
    entries: VecDeque<WorkLogEntry>,
    retention: usize,
    next_seq: u64,
    lines_on_disk: usize,
}

impl WorkLog {
    pub fn in_memory(retention: usize) -> Self {
        Self {
            path: None,
            file: None,
            entries: VecDeque::new(),
            retention: retention.max(1),
            next_seq: 1,
            lines_on_disk: 0,
        }
    }

    /// Open (or create) a JSON-lines log at `path`, keeping the newest
    /// `retention` entries. Unparsable lines are skipped.
    pub fn open(path: impl AsRef<Path>, retention: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut log = Self::in_memory(retention);
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkLogEntry>(&line) {
                    Ok(entry) => {
                        log.next_seq = log.next_seq.max(entry.seq + 1);
                        log.entries.push_back(entry);
                        log.evict();
                    }
                    Err(e) => {
                        warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping corrupt work log line");
                    }
                }
            }
        }

        log.path = Some(path);
        log.compact()?;
        debug!(entries = log.entries.len(), "work log opened");
        Ok(log)
    }

    /// Append an entry, stamping its sequence number. Returns the sequence.
    ///
    /// The entry is kept in memory even if the disk write fails.
    pub fn append(&mut self, mut entry: WorkLogEntry) -> Result<u64> {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        let seq = entry.seq;

        let line = serde_json::to_string(&entry)?;
        self.entries.push_back(entry);
        self.evict();

        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{line}")?;
            file.flush()?;
            self.lines_on_disk += 1;
            if self.lines_on_disk > self.retention * 2 {
                self.compact()?;
            }
        }
        Ok(seq)
    }

    /// Rewrite the backing file so it holds only the retained entries.
    pub fn compact(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.file = None;

        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut out = File::create(&tmp)?;
            for entry in &self.entries {
                writeln!(out, "{}", serde_json::to_string(entry)?)?;
            }
            out.flush()?;
        }
        std::fs::rename(&tmp, &path)?;

        self.file = Some(OpenOptions::new().append(true).open(&path)?);
        self.lines_on_disk = self.entries.len();
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = &WorkLogEntry> {
        self.entries.iter()
    }

    /// The newest `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<&WorkLogEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).collect()
    }

    pub fn for_action(&self, action_id: Uuid) -> Vec<&WorkLogEntry> {
        self.entries
            .iter()
            .filter(|e| e.action_id == Some(action_id))
            .collect()
    }

    /// Actions whose most recent entry is still `Pending`, i.e. started but
    /// never resolved. After a crash these are the interrupted actions.
    pub fn unfinished_actions(&self) -> Vec<Uuid> {
        let mut last: HashMap<Uuid, (u64, LogStatus)> = HashMap::new();
        for entry in &self.entries {
            if let Some(id) = entry.action_id {
                last.insert(id, (entry.seq, entry.status));
            }
        }
        let mut open: Vec<(u64, Uuid)> = last
            .into_iter()
            .filter(|(_, (_, status))| *status == LogStatus::Pending)
            .map(|(id, (seq, _))| (seq, id))
            .collect();
        open.sort();
        open.into_iter().map(|(_, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    fn evict(&mut self) {
        while self.entries.len() > self.retention {
            self.entries.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(msg: &str, status: LogStatus) -> WorkLogEntry {
        WorkLogEntry::new("test", msg, status)
    }

    #[test]
    fn retention_evicts_oldest() {
        let mut log = WorkLog::in_memory(3);
        for i in 0..5 {
            log.append(entry(&format!("entry {i}"), LogStatus::Info)).unwrap();
        }
        assert_eq!(log.len(), 3);
        let msgs: Vec<_> = log.entries().map(|e| e.message.clone()).collect();
        assert_eq!(msgs, vec!["entry 2", "entry 3", "entry 4"]);
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let mut log = WorkLog::in_memory(10);
        let a = log.append(entry("a", LogStatus::Info)).unwrap();
        let b = log.append(entry("b", LogStatus::Info)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn unfinished_actions_tracks_last_status() {
        let mut log = WorkLog::in_memory(10);
        let done = Uuid::new_v4();
        let open = Uuid::new_v4();
        log.append(entry("start", LogStatus::Pending).for_action(done)).unwrap();
        log.append(entry("start", LogStatus::Pending).for_action(open)).unwrap();
        log.append(entry("ok", LogStatus::Success).for_action(done)).unwrap();
        assert_eq!(log.unfinished_actions(), vec![open]);
    }

    #[test]
    fn reopen_keeps_newest_entries_and_seq() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work_log.jsonl");
        {
            let mut log = WorkLog::open(&path, 2).unwrap();
            for i in 0..4 {
                log.append(entry(&format!("e{i}"), LogStatus::Info)).unwrap();
            }
        }

        let mut log = WorkLog::open(&path, 2).unwrap();
        let msgs: Vec<_> = log.entries().map(|e| e.message.clone()).collect();
        assert_eq!(msgs, vec!["e2", "e3"]);
        let seq = log.append(entry("e4", LogStatus::Info)).unwrap();
        assert_eq!(seq, 5);

        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 3);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work_log.jsonl");
        let good = serde_json::to_string(&entry("good", LogStatus::Success)).unwrap();
        std::fs::write(&path, format!("{good}\n{{oops\n")).unwrap();

        let log = WorkLog::open(&path, 10).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.recent(5)[0].message, "good");
    }
}
