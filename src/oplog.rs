//!
//! oplog.rs
//! The DT-log: an append-only, line-oriented stable log of protocol events
//! and the sole source of truth used for recovery. Every append goes
//! through one process-wide serializer so that "newest matching entry
//! wins" is well defined under the scan routine below.
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::message::Op;

/// The leading token of a DT-log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    StartThreePc,
    Yes,
    PreCommit,
    Commit,
    Abort,
}

impl Kind {
    fn as_str(&self) -> &'static str {
        match self {
            Kind::StartThreePc => "start-3pc",
            Kind::Yes => "yes",
            Kind::PreCommit => "pre-commit",
            Kind::Commit => "commit",
            Kind::Abort => "abort",
        }
    }

    fn parse(s: &str) -> Result<Kind> {
        match s {
            "start-3pc" => Ok(Kind::StartThreePc),
            "yes" => Ok(Kind::Yes),
            "pre-commit" => Ok(Kind::PreCommit),
            "commit" => Ok(Kind::Commit),
            "abort" => Ok(Kind::Abort),
            other => Err(Error::MalformedMessage(format!("unknown log entry kind: {}", other))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub kind: Kind,
    pub op: Op,
    pub key: String,
    pub value: Option<String>,
}

impl LogEntry {
    pub fn new(kind: Kind, op: Op, key: impl Into<String>, value: Option<String>) -> LogEntry {
        LogEntry { kind, op, key: key.into(), value }
    }

    fn to_line(&self) -> String {
        match &self.value {
            Some(v) => format!("{} {} {} {}", self.kind.as_str(), self.op.as_str(), self.key, v),
            None => format!("{} {} {}", self.kind.as_str(), self.op.as_str(), self.key),
        }
    }

    fn parse(line: &str) -> Result<LogEntry> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            [kind, op, key] => Ok(LogEntry::new(Kind::parse(kind)?, Op::parse(op)?, *key, None)),
            [kind, op, key, value] => {
                Ok(LogEntry::new(Kind::parse(kind)?, Op::parse(op)?, *key, Some(value.to_string())))
            }
            _ => Err(Error::MalformedMessage(format!("bad DT-log line: {}", line))),
        }
    }
}

/// A key's decision, as returned by `DtLog::scan_state`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    PreCommit,
    Commit,
    Abort,
}

pub struct DtLog {
    path: String,
    file: Mutex<File>,
}

impl DtLog {
    /// Opens (creating if absent) the DT-log at `path` for appending.
    pub fn open(path: impl Into<String>) -> Result<DtLog> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(DtLog { path, file: Mutex::new(file) })
    }

    /// Appends one entry, line-atomically, flushing before returning. Every
    /// outgoing protocol message that depends on this record must not be
    /// sent until this call has returned.
    pub fn append(&self, entry: LogEntry) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        writeln!(file, "{}", entry.to_line())?;
        file.flush()?;
        Ok(())
    }

    /// Scans the full log and returns `(voted_yes, decision)` for `key`, by
    /// taking the single newest matching entry. Missing
    /// file or no matching entry means both fields are empty.
    pub fn scan_state(&self, key: &str) -> Result<(bool, Option<Decision>)> {
        // Held for the duration of the scan so a concurrent append cannot be
        // interleaved with a reader that hasn't yet reached EOF.
        let _guard = self.file.lock().unwrap();
        let reader = match File::open(&self.path) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((false, None)),
            Err(e) => return Err(Error::Log(e)),
        };

        let mut newest: Option<LogEntry> = None;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = LogEntry::parse(&line)?;
            if entry.key == key {
                newest = Some(entry);
            }
        }

        Ok(match newest {
            None | Some(LogEntry { kind: Kind::StartThreePc, .. }) => (false, None),
            Some(LogEntry { kind: Kind::Yes, .. }) => (true, None),
            Some(LogEntry { kind: Kind::PreCommit, .. }) => (false, Some(Decision::PreCommit)),
            Some(LogEntry { kind: Kind::Commit, .. }) => (false, Some(Decision::Commit)),
            Some(LogEntry { kind: Kind::Abort, .. }) => (false, Some(Decision::Abort)),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads the full log and returns, for every key it mentions, the
    /// single newest entry for that key. Used only by the offline checker,
    /// which needs every key at once rather than one key's state.
    pub fn scan_all(&self) -> Result<HashMap<String, LogEntry>> {
        let _guard = self.file.lock().unwrap();
        let reader = match File::open(&self.path) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(Error::Log(e)),
        };

        let mut newest: HashMap<String, LogEntry> = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = LogEntry::parse(&line)?;
            newest.insert(entry.key.clone(), entry);
        }
        Ok(newest)
    }
}

/// The four states the termination protocol reasons about for a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TermState {
    Commit,
    PreCommit,
    Abort,
    Uncertain,
}

/// `commit`/`pre-commit`/`abort` if decided; `abort` if no vote was ever
/// cast; otherwise `uncertain` (voted yes, no decision yet).
pub fn term_state(voted_yes: bool, decision: Option<Decision>) -> TermState {
    match decision {
        Some(Decision::Commit) => TermState::Commit,
        Some(Decision::PreCommit) => TermState::PreCommit,
        Some(Decision::Abort) => TermState::Abort,
        None => if voted_yes { TermState::Uncertain } else { TermState::Abort },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn empty_log() -> (NamedTempFile, DtLog) {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::remove_file(tmp.path()).ok();
        let log = DtLog::open(tmp.path().to_str().unwrap()).unwrap();
        (tmp, log)
    }

    #[test]
    fn missing_key_scans_empty() {
        let (_tmp, log) = empty_log();
        assert_eq!(log.scan_state("SongA").unwrap(), (false, None));
    }

    #[test]
    fn start_3pc_scans_empty_both_fields() {
        let (_tmp, log) = empty_log();
        log.append(LogEntry::new(Kind::StartThreePc, Op::Add, "SongA", Some("u".into()))).unwrap();
        assert_eq!(log.scan_state("SongA").unwrap(), (false, None));
    }

    #[test]
    fn yes_scans_voted_uncommitted() {
        let (_tmp, log) = empty_log();
        log.append(LogEntry::new(Kind::Yes, Op::Add, "SongA", Some("u".into()))).unwrap();
        assert_eq!(log.scan_state("SongA").unwrap(), (true, None));
    }

    #[test]
    fn newest_entry_wins_over_older() {
        let (_tmp, log) = empty_log();
        log.append(LogEntry::new(Kind::Yes, Op::Add, "SongA", Some("u".into()))).unwrap();
        log.append(LogEntry::new(Kind::PreCommit, Op::Add, "SongA", Some("u".into()))).unwrap();
        log.append(LogEntry::new(Kind::Commit, Op::Add, "SongA", Some("u".into()))).unwrap();
        assert_eq!(log.scan_state("SongA").unwrap(), (false, Some(Decision::Commit)));
    }

    #[test]
    fn unrelated_keys_do_not_interfere() {
        let (_tmp, log) = empty_log();
        log.append(LogEntry::new(Kind::Commit, Op::Add, "SongA", Some("u".into()))).unwrap();
        assert_eq!(log.scan_state("SongB").unwrap(), (false, None));
    }

    #[test]
    fn scan_all_keeps_newest_entry_per_key() {
        let (_tmp, log) = empty_log();
        log.append(LogEntry::new(Kind::Commit, Op::Add, "SongA", Some("u".into()))).unwrap();
        log.append(LogEntry::new(Kind::Yes, Op::Add, "SongB", Some("v".into()))).unwrap();
        log.append(LogEntry::new(Kind::Abort, Op::Add, "SongB", Some("v".into()))).unwrap();
        let all = log.scan_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["SongA"].kind, Kind::Commit);
        assert_eq!(all["SongB"].kind, Kind::Abort);
    }

    #[test]
    fn term_state_maps_correctly() {
        assert_eq!(term_state(false, None), TermState::Abort);
        assert_eq!(term_state(true, None), TermState::Uncertain);
        assert_eq!(term_state(true, Some(Decision::PreCommit)), TermState::PreCommit);
        assert_eq!(term_state(true, Some(Decision::Commit)), TermState::Commit);
        assert_eq!(term_state(true, Some(Decision::Abort)), TermState::Abort);
    }
}
