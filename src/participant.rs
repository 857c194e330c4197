//!
//! participant.rs
//! The participant side of one transaction: vote,
//! then hold the connection to the coordinator open and follow whatever
//! directive arrives next, for as long as the transaction is live. Entered
//! by the listener immediately after it has parsed an inbound `vote-req`.
use std::net::TcpStream;

use log::warn;

use crate::crash::{crash_now, ParticipantHook};
use crate::election::participant_timeout;
use crate::message::{Op, PeerMsg};
use crate::net::{read_line_with_deadline, send_line, ReadOutcome};
use crate::oplog::{Kind, LogEntry};
use crate::state::RuntimeState;
use crate::vote::{vote, Vote};

pub fn handle_vote_req(state: &RuntimeState, stream: &mut TcpStream, op: Op, key: String, value: Option<String>) {
    state.set_pending((op, key.clone(), value.clone()));

    match vote(state.config.id, op, value.as_deref()) {
        Vote::No => {
            if let Err(e) = state.log.append(LogEntry::new(Kind::Abort, op, &key, value.clone())) {
                warn!("failed to log no-vote abort for {}: {}", key, e);
            }
            let _ = send_line(stream, &line(PeerMsg::No));
            state.clear_pending();
        }
        Vote::Yes => {
            if let Err(e) = state.log.append(LogEntry::new(Kind::Yes, op, &key, value.clone())) {
                warn!("failed to log yes-vote for {}: {}", key, e);
                return;
            }
            if state.crash_hooks.take_participant(ParticipantHook::BeforeVote) {
                crash_now();
            }
            if send_line(stream, &line(PeerMsg::Yes)).is_err() {
                return;
            }
            if state.crash_hooks.take_participant(ParticipantHook::AfterVote) {
                crash_now();
            }
            await_directive(state, stream, op, &key, value);
        }
    }
}

fn line(msg: PeerMsg) -> String {
    let mut s = msg.to_tokens();
    s.push('\n');
    s
}

fn await_directive(state: &RuntimeState, stream: &mut TcpStream, op: Op, key: &str, value: Option<String>) {
    match read_line_with_deadline(stream, state.config.participant_deadline()) {
        ReadOutcome::Line(l) => match PeerMsg::parse(&l) {
            Ok(PeerMsg::PreCommit) => handle_pre_commit(state, stream, op, key, value),
            Ok(PeerMsg::Commit) => {
                decide_commit(state, op, key, &value);
                state.clear_pending();
            }
            Ok(PeerMsg::Abort) => {
                decide_abort(state, op, key, &value);
                state.clear_pending();
            }
            _ => warn!("malformed directive from coordinator for {}", key),
        },
        ReadOutcome::Timeout | ReadOutcome::Closed => {
            participant_timeout(state, op, key, value);
        }
    }
}

fn handle_pre_commit(state: &RuntimeState, stream: &mut TcpStream, op: Op, key: &str, value: Option<String>) {
    if let Err(e) = state.log.append(LogEntry::new(Kind::PreCommit, op, key, value.clone())) {
        warn!("failed to log pre-commit for {}: {}", key, e);
        return;
    }
    if send_line(stream, &line(PeerMsg::Ack)).is_err() {
        return;
    }
    if state.crash_hooks.take_participant(ParticipantHook::AfterAck) {
        crash_now();
    }
    match read_line_with_deadline(stream, state.config.participant_deadline()) {
        ReadOutcome::Line(l) => match PeerMsg::parse(&l) {
            Ok(PeerMsg::Commit) => {
                decide_commit(state, op, key, &value);
                state.clear_pending();
            }
            Ok(PeerMsg::Abort) => {
                decide_abort(state, op, key, &value);
                state.clear_pending();
            }
            _ => warn!("malformed post-pre-commit directive for {}", key),
        },
        ReadOutcome::Timeout | ReadOutcome::Closed => {
            participant_timeout(state, op, key, value);
        }
    }
}

fn decide_commit(state: &RuntimeState, op: Op, key: &str, value: &Option<String>) {
    if let Err(e) = state.log.append(LogEntry::new(Kind::Commit, op, key, value.clone())) {
        warn!("failed to log commit for {}: {}", key, e);
        return;
    }
    match op {
        Op::Add => state.playlist.upsert(key, value.as_deref().unwrap_or("")),
        Op::Delete => state.playlist.delete(key),
    }
}

fn decide_abort(state: &RuntimeState, op: Op, key: &str, value: &Option<String>) {
    if let Err(e) = state.log.append(LogEntry::new(Kind::Abort, op, key, value.clone())) {
        warn!("failed to log abort for {}: {}", key, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::oplog::Decision;
    use std::time::Duration;

    fn test_state(id: u32) -> (tempfile::TempDir, RuntimeState) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config {
            id,
            num_procs: 2,
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
    fn decide_commit_logs_and_applies_add() {
        let (_dir, state) = test_state(0);
        decide_commit(&state, Op::Add, "SongA", &Some("http://a".to_string()));
        assert_eq!(state.playlist.lookup("SongA"), Some("http://a".to_string()));
        assert_eq!(state.log.scan_state("SongA").unwrap(), (false, Some(Decision::Commit)));
    }

    #[test]
    fn decide_commit_logs_and_applies_delete() {
        let (_dir, state) = test_state(0);
        state.playlist.upsert("SongA", "http://a");
        decide_commit(&state, Op::Delete, "SongA", &None);
        assert_eq!(state.playlist.lookup("SongA"), None);
    }

    #[test]
    fn decide_abort_logs_without_touching_playlist() {
        let (_dir, state) = test_state(0);
        decide_abort(&state, Op::Add, "SongA", &Some("http://a".to_string()));
        assert_eq!(state.playlist.lookup("SongA"), None);
        assert_eq!(state.log.scan_state("SongA").unwrap(), (false, Some(Decision::Abort)));
    }

    #[test]
    fn no_vote_on_long_value_logs_abort_and_replies_no() {
        use std::io::{BufRead, BufReader};
        use std::net::TcpListener;

        let (_dir, state) = test_state(0);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (mut server_side, _) = listener.accept().unwrap();

        let long_value = "a".repeat(10);
        handle_vote_req(&state, &mut server_side, Op::Add, "SongA".to_string(), Some(long_value));

        let mut reply = String::new();
        BufReader::new(&mut client).read_line(&mut reply).unwrap();
        assert_eq!(reply.trim(), "no");
        assert_eq!(state.log.scan_state("SongA").unwrap(), (false, Some(Decision::Abort)));
    }
}
