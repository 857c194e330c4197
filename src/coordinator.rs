//!
//! coordinator.rs
//! The coordinator side of one transaction: cast its own vote, fan out
//! `vote-req` to every live peer in parallel, and drive the three phases
//! through to commit or abort. Only one transaction is ever in flight
//! system-wide, so this runs to completion before the master's next
//! command is read.
use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

use log::warn;

use crate::crash::crash_now;
use crate::message::{Envelope, Op, PeerMsg};
use crate::net::{connect_with_timeout, read_line_with_deadline, send_line, ReadOutcome};
use crate::oplog::{Kind, LogEntry};
use crate::playlist::NONE;
use crate::state::RuntimeState;
use crate::vote::{vote, Vote};

#[derive(PartialEq)]
enum VoteOutcome {
    Yes,
    No,
    Unreachable,
}

/// Runs the whole transaction for `op key [value]`, enqueuing `ack commit`
/// or `ack abort` for the master when it settles. Called only when this
/// process is the coordinator.
pub fn handle_client_op(state: &Arc<RuntimeState>, op: Op, key: String, value: Option<String>) {
    if vote(state.config.id, op, value.as_deref()) == Vote::No {
        state.enqueue_master("ack abort".to_string());
        return;
    }

    state.set_pending((op, key.clone(), value.clone()));
    if let Err(e) = state.log.append(LogEntry::new(Kind::StartThreePc, op, &key, value.clone())) {
        warn!("failed to log start-3pc for {}: {}", key, e);
        state.clear_pending();
        return;
    }

    let peers: Vec<u32> = state
        .membership
        .alive_set()
        .into_iter()
        .filter(|&id| id != state.config.id)
        .collect();

    if let Some(targets) = state.crash_hooks.take_vote_req_targets() {
        // Only the listed ids ever see a vote-req; everyone else (including
        // other live peers) must not race ahead of them before the crash.
        for peer in targets {
            send_vote_req_only(state, peer, op, key.clone(), value.clone());
        }
        crash_now();
    }

    let mut handles = Vec::new();
    for peer in peers {
        let state = Arc::clone(state);
        let op_copy = op;
        let key_copy = key.clone();
        let value_copy = value.clone();
        handles.push(thread::spawn(move || collect_vote(&state, peer, op_copy, key_copy, value_copy)));
    }

    let mut yes_streams = Vec::new();
    let mut any_no_or_unreachable = false;
    for h in handles {
        match h.join() {
            Ok((peer, Some(stream), VoteOutcome::Yes)) => yes_streams.push((peer, stream)),
            Ok(_) => any_no_or_unreachable = true,
            Err(_) => any_no_or_unreachable = true,
        }
    }

    if any_no_or_unreachable {
        if let Err(e) = state.log.append(LogEntry::new(Kind::Abort, op, &key, value.clone())) {
            warn!("failed to log abort for {}: {}", key, e);
        }
        for (_, mut stream) in yes_streams {
            let _ = send_line(&mut stream, &as_line(PeerMsg::Abort));
        }
        state.enqueue_master("ack abort".to_string());
        state.clear_pending();
        return;
    }

    run_pre_commit_and_commit(state, op, &key, value, yes_streams);
}

fn collect_vote(state: &Arc<RuntimeState>, peer: u32, op: Op, key: String, value: Option<String>) -> (u32, Option<TcpStream>, VoteOutcome) {
    let cfg = &state.config;
    let mut stream = match connect_with_timeout(&cfg.peer_addr(peer), cfg.timeout) {
        Ok(s) => s,
        Err(_) => return (peer, None, VoteOutcome::Unreachable),
    };

    let envelope = Envelope::new(cfg.id, PeerMsg::VoteReq { op, key, value }.to_tokens());
    let line = match envelope.to_line() {
        Ok(l) => l,
        Err(_) => return (peer, None, VoteOutcome::Unreachable),
    };
    if send_line(&mut stream, &line).is_err() {
        return (peer, None, VoteOutcome::Unreachable);
    }

    match read_line_with_deadline(&mut stream, cfg.timeout) {
        ReadOutcome::Line(l) => match PeerMsg::parse(&l) {
            Ok(PeerMsg::Yes) => (peer, Some(stream), VoteOutcome::Yes),
            _ => (peer, Some(stream), VoteOutcome::No),
        },
        ReadOutcome::Timeout | ReadOutcome::Closed => (peer, None, VoteOutcome::Unreachable),
    }
}

/// Sends a bare `vote-req` to `peer` and does not wait for a reply. Used
/// only by the `crashVoteREQ` hook, which needs to put the envelope on the
/// wire for exactly the armed ids, in the given order, before crashing.
fn send_vote_req_only(state: &Arc<RuntimeState>, peer: u32, op: Op, key: String, value: Option<String>) {
    let cfg = &state.config;
    let mut stream = match connect_with_timeout(&cfg.peer_addr(peer), cfg.timeout) {
        Ok(s) => s,
        Err(_) => return,
    };
    let envelope = Envelope::new(cfg.id, PeerMsg::VoteReq { op, key, value }.to_tokens());
    if let Ok(line) = envelope.to_line() {
        let _ = send_line(&mut stream, &line);
    }
}

fn run_pre_commit_and_commit(state: &Arc<RuntimeState>, op: Op, key: &str, value: Option<String>, yes_streams: Vec<(u32, TcpStream)>) {
    let cfg = &state.config;

    let mut streams: HashMap<u32, TcpStream> = yes_streams.into_iter().collect();

    if let Some(targets) = state.crash_hooks.take_partial_pre_commit_targets() {
        // Only the listed ids get pre-commit before this process dies; the
        // rest of the yes-voters never hear about this phase at all.
        for peer in targets {
            if let Some(mut stream) = streams.remove(&peer) {
                let _ = send_line(&mut stream, &as_line(PeerMsg::PreCommit));
            }
        }
        crash_now();
    }

    let mut acked = Vec::new();
    for (peer, mut stream) in streams {
        if send_line(&mut stream, &as_line(PeerMsg::PreCommit)).is_err() {
            continue;
        }
        match read_line_with_deadline(&mut stream, cfg.timeout) {
            ReadOutcome::Line(l) if PeerMsg::parse(&l).ok() == Some(PeerMsg::Ack) => acked.push((peer, stream)),
            _ => warn!("no ack from {} during pre-commit phase for {}", peer, key),
        }
    }

    if let Err(e) = state.log.append(LogEntry::new(Kind::Commit, op, key, value.clone())) {
        warn!("failed to log commit for {}: {}", key, e);
        return;
    }
    match op {
        Op::Add => state.playlist.upsert(key, value.as_deref().unwrap_or("")),
        Op::Delete => state.playlist.delete(key),
    }

    let mut acked: HashMap<u32, TcpStream> = acked.into_iter().collect();

    if let Some(targets) = state.crash_hooks.take_partial_commit_targets() {
        for peer in targets {
            if let Some(mut stream) = acked.remove(&peer) {
                let _ = send_line(&mut stream, &as_line(PeerMsg::Commit));
            }
        }
        crash_now();
    }

    for (_, mut stream) in acked {
        let _ = send_line(&mut stream, &as_line(PeerMsg::Commit));
    }

    state.enqueue_master("ack commit".to_string());
    state.clear_pending();
}

fn as_line(msg: PeerMsg) -> String {
    let mut s = msg.to_tokens();
    s.push('\n');
    s
}

/// Coordinator-side `get`: answer locally if known, otherwise poll every
/// other live peer and return the first value found. Never caches a
/// remotely-fetched value, so `playlist` stays exactly the set of keys this
/// process itself committed.
pub fn get(state: &RuntimeState, key: &str) -> String {
    if let Some(v) = state.playlist.lookup(key) {
        return v;
    }
    let cfg = &state.config;
    for peer in state.membership.alive_set() {
        if peer == cfg.id {
            continue;
        }
        let mut stream = match connect_with_timeout(&cfg.peer_addr(peer), cfg.timeout) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let envelope = Envelope::new(cfg.id, PeerMsg::Get { key: key.to_string() }.to_tokens());
        let line = match envelope.to_line() {
            Ok(l) => l,
            Err(_) => continue,
        };
        if send_line(&mut stream, &line).is_err() {
            continue;
        }
        if let ReadOutcome::Line(l) = read_line_with_deadline(&mut stream, cfg.timeout) {
            if let Ok(PeerMsg::Resp { value }) = PeerMsg::parse(&l) {
                if value != NONE {
                    return value;
                }
            }
        }
    }
    NONE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;

    fn test_state(id: u32, num_procs: u32) -> (tempfile::TempDir, RuntimeState) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            id,
            num_procs,
            master_port: 0,
            peer_port: 0,
            heartbeat_port: 0,
            heartbeat_interval: Duration::from_millis(200),
            alive_interval: Duration::from_millis(250),
            timeout: Duration::from_millis(10),
            log_dir: dir.path().to_str().unwrap().to_string(),
        };
        (dir, RuntimeState::new(cfg).unwrap())
    }

    #[test]
    fn get_answers_locally_without_touching_the_network() {
        let (_dir, state) = test_state(0, 1);
        state.playlist.upsert("SongA", "http://a");
        assert_eq!(get(&state, "SongA"), "http://a");
    }

    #[test]
    fn get_misses_return_none_with_no_live_peers() {
        let (_dir, state) = test_state(0, 1);
        assert_eq!(get(&state, "SongA"), NONE);
    }

    #[test]
    fn a_no_vote_from_self_short_circuits_without_logging_start() {
        let (_dir, state) = test_state(0, 1);
        let state = Arc::new(state);
        let long_value = "a".repeat(10);
        handle_client_op(&state, Op::Add, "SongA".into(), Some(long_value));
        assert_eq!(state.drain_master_queue(), vec!["ack abort".to_string()]);
        assert_eq!(state.log.scan_state("SongA").unwrap(), (false, None));
    }
}
