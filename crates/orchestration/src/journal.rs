//! Append-only journal of coordination events.
//!
//! One JSON object per line. Every assignment, state update, release,
//! escalation and workflow step transition is recorded here so an operator
//! can reconstruct what the daemon did after the fact.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const JOURNAL_FILE: &str = "journal.jsonl";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JEntry {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub ev: String, // ASSIGN, UPDATE, RELEASE, ESCALATE, STEP, WORKFLOW
    pub msg_id: String,
    pub from: String,
    pub to: String,
    pub meta: serde_json::Value,
}

struct JournalInner {
    file: File,
    seq: u64,
}

pub struct Journal {
    path: PathBuf,
    inner: Mutex<JournalInner>,
}

impl Journal {
    /// Open or create the journal, continuing the sequence from the last
    /// readable entry.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let seq = match read_entries(&path) {
            Ok(entries) => entries.last().map(|entry| entry.seq).unwrap_or(0),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err),
        };
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if ends_torn(&path)? {
            // Terminate the fragment so the next entry starts on its own line.
            file.write_all(b"\n")?;
            file.sync_data()?;
        }

        Ok(Self {
            path,
            inner: Mutex::new(JournalInner { file, seq }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a new entry and return its sequence number.
    pub fn append(
        &self,
        event: &str,
        msg_id: &str,
        from: &str,
        to: &str,
        meta: serde_json::Value,
    ) -> io::Result<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = JEntry {
            seq: inner.seq + 1,
            ts: Utc::now(),
            ev: event.to_string(),
            msg_id: msg_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            meta,
        };

        let line = serde_json::to_string(&entry)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?
            + "\n";
        inner.file.write_all(line.as_bytes())?;
        inner.file.sync_data()?;
        inner.seq = entry.seq;
        Ok(entry.seq)
    }

    pub fn current_seq(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).seq
    }
}

/// True when the file is non-empty and its last byte is not a newline.
fn ends_torn(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Read every well-formed entry. Torn trailing lines (a crash mid-append)
/// are skipped.
pub fn read_entries(path: &Path) -> io::Result<Vec<JEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<JEntry>(&line) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_journal_basic() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("journal.jsonl");
        let journal = Journal::open(&path)?;

        journal.append(
            "ASSIGN",
            "T1",
            "orchestrator",
            "W1",
            serde_json::json!({"workflow_id": null}),
        )?;
        let seq = journal.append(
            "UPDATE",
            "T1",
            "W1",
            "captain",
            serde_json::json!({"state": "done"}),
        )?;

        assert_eq!(seq, 2);
        let entries = read_entries(&path)?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].ev, "UPDATE");
        Ok(())
    }

    #[test]
    fn test_journal_resumes_sequence_and_skips_torn_line() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("journal.jsonl");
        {
            let journal = Journal::open(&path)?;
            journal.append("ASSIGN", "T1", "o", "W1", serde_json::json!({}))?;
            journal.append("ASSIGN", "T2", "o", "W2", serde_json::json!({}))?;
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            file.write_all(b"{\"seq\":3,\"ts\"")?;
        }

        let journal = Journal::open(&path)?;
        assert_eq!(journal.current_seq(), 2);
        journal.append("RELEASE", "T1", "o", "captain", serde_json::json!({}))?;
        assert_eq!(journal.current_seq(), 3);
        drop(journal);

        let entries = read_entries(&path)?;
        let events: Vec<&str> = entries.iter().map(|e| e.ev.as_str()).collect();
        assert_eq!(events, ["ASSIGN", "ASSIGN", "RELEASE"]);
        assert_eq!(entries[2].seq, 3);

        // The next run continues after the recovered entry, not before it.
        assert_eq!(Journal::open(&path)?.current_seq(), 3);
        Ok(())
    }
}
