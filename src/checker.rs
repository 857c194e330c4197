//!
//! checker.rs
//! Offline DT-log auditor. Given the log directory a run left behind,
//! loads every process's `dt_log_<id>.log` and checks the one property
//! that matters across process boundaries: for any key, the terminal
//! decisions recorded by every process that reached one must agree
//! (once commit, never abort, and vice versa).
use std::collections::HashMap;

use log::info;

use crate::error::Result;
use crate::oplog::{DtLog, Kind, LogEntry};

#[derive(Debug, PartialEq, Eq)]
pub struct Mismatch {
    pub key: String,
    pub committed_by: Vec<u32>,
    pub aborted_by: Vec<u32>,
}

#[derive(Debug)]
pub struct CheckReport {
    pub keys_checked: usize,
    pub mismatches: Vec<Mismatch>,
}

impl CheckReport {
    pub fn ok(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Checks every process's DT-log under `log_dir` (named `dt_log_<id>.log`
/// for `id` in `0..num_procs`, matching `Config::dt_log_path`).
pub fn check_last_run(num_procs: u32, log_dir: &str) -> Result<CheckReport> {
    info!("checking DT-logs for {} processes under {}", num_procs, log_dir);

    let mut per_key: HashMap<String, Vec<(u32, LogEntry)>> = HashMap::new();
    for id in 0..num_procs {
        let path = format!("{}/dt_log_{}.log", log_dir.trim_end_matches('/'), id);
        let log = DtLog::open(&path)?;
        for (key, entry) in log.scan_all()? {
            per_key.entry(key).or_default().push((id, entry));
        }
    }

    let mut mismatches = Vec::new();
    for (key, entries) in &per_key {
        let committed_by: Vec<u32> = entries.iter().filter(|(_, e)| e.kind == Kind::Commit).map(|(id, _)| *id).collect();
        let aborted_by: Vec<u32> = entries.iter().filter(|(_, e)| e.kind == Kind::Abort).map(|(id, _)| *id).collect();
        if !committed_by.is_empty() && !aborted_by.is_empty() {
            mismatches.push(Mismatch { key: key.clone(), committed_by, aborted_by });
        }
    }

    for m in &mismatches {
        log::error!(
            "disagreement on {}: committed by {:?}, aborted by {:?}",
            m.key,
            m.committed_by,
            m.aborted_by
        );
    }
    info!("checked {} keys, {} disagreement(s)", per_key.len(), mismatches.len());

    Ok(CheckReport { keys_checked: per_key.len(), mismatches })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Op;

    fn write_log(dir: &std::path::Path, id: u32, entries: &[(Kind, &str)]) {
        let log = DtLog::open(format!("{}/dt_log_{}.log", dir.to_str().unwrap(), id)).unwrap();
        for (kind, key) in entries {
            log.append(LogEntry::new(*kind, Op::Add, *key, Some("u".into()))).unwrap();
        }
    }

    #[test]
    fn agreeing_processes_report_no_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), 0, &[(Kind::Commit, "SongA")]);
        write_log(dir.path(), 1, &[(Kind::Commit, "SongA")]);
        let report = check_last_run(2, dir.path().to_str().unwrap()).unwrap();
        assert!(report.ok());
        assert_eq!(report.keys_checked, 1);
    }

    #[test]
    fn disagreeing_processes_are_flagged() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), 0, &[(Kind::Commit, "SongA")]);
        write_log(dir.path(), 1, &[(Kind::Abort, "SongA")]);
        let report = check_last_run(2, dir.path().to_str().unwrap()).unwrap();
        assert!(!report.ok());
        assert_eq!(report.mismatches[0].key, "SongA");
    }

    #[test]
    fn missing_log_file_counts_as_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), 0, &[(Kind::Commit, "SongA")]);
        // process 1's log file never created
        let report = check_last_run(2, dir.path().to_str().unwrap()).unwrap();
        assert!(report.ok());
    }
}
