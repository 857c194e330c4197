//!
//! election.rs
//! Lowest-live-id election and the non-blocking termination protocol.
//! Entered from two places: a participant whose wait on the coordinator's
//! next directive times out, and the heartbeat sender noticing the
//! current coordinator has dropped out of the alive set with no one
//! currently waiting on it.
use std::net::TcpStream;

use log::{info, warn};

use crate::message::{Op, PeerMsg};
use crate::net::{connect_with_timeout, read_line_with_deadline, send_line, ReadOutcome};
use crate::oplog::{term_state, Kind, LogEntry, TermState};
use crate::state::RuntimeState;

/// Picks the smallest live id greater than the current `coord_id`, falling
/// back to self if no such peer is alive, and adopts it. Returns the
/// (possibly unchanged) coordinator id.
pub fn elect_new_coordinator(state: &RuntimeState) -> u32 {
    let cfg = &state.config;
    let current = state.membership.coord_id();
    let candidate = state
        .membership
        .alive_set()
        .into_iter()
        .filter(|&id| id > current)
        .min()
        .unwrap_or(cfg.id);
    if state.membership.adopt_coord_id(candidate) {
        info!("elected coordinator {}", candidate);
        if candidate == cfg.id {
            state.enqueue_master(format!("coordinator {}", candidate));
        }
    }
    state.membership.coord_id()
}

/// Heartbeat-driven election trigger: called after every heartbeat
/// broadcast round. If the current coordinator
/// has dropped out of the alive set and nobody is waiting on it inside a
/// connection handler, this is the only remaining place that notices.
pub fn heartbeat_watchdog_tick(state: &RuntimeState) {
    let coord = state.membership.coord_id();
    if coord == state.config.id {
        return;
    }
    if state.membership.alive_set().contains(&coord) {
        return;
    }
    let new_coord = elect_new_coordinator(state);
    if new_coord == state.config.id {
        if let Some((op, key, value)) = state.pending() {
            run_termination_as_new_coordinator(state, op, &key, value);
        }
    }
}

/// Entry point for a process that was waiting on the coordinator and timed
/// out. Elects a new coordinator; if that is itself, runs the termination
/// round for the pending transaction (if any). Otherwise there is nothing
/// further to do here — the listener's next accept is expected to bring the
/// new coordinator's `state-req`.
pub fn participant_timeout(state: &RuntimeState, op: Op, key: &str, value: Option<String>) {
    warn!("timed out waiting on coordinator for key {}, starting election", key);
    let new_coord = elect_new_coordinator(state);
    if new_coord == state.config.id {
        run_termination_as_new_coordinator(state, op, key, value);
    }
}

struct Responder {
    id: u32,
    stream: TcpStream,
    term_state: TermState,
}

/// The newly elected coordinator's side of termination: broadcasts
/// `state-req` to every other live process, collects at most one reply per
/// peer (silently treating an absent/unreachable peer as no response), then
/// resolves the key by the TR1-TR4 case analysis.
pub fn run_termination_as_new_coordinator(state: &RuntimeState, op: Op, key: &str, value: Option<String>) {
    let cfg = &state.config;
    let self_id = cfg.id;
    let recipients: Vec<u32> = state.membership.alive_set().into_iter().filter(|&id| id != self_id).collect();

    let mut responders: Vec<Responder> = Vec::new();
    for peer in recipients {
        let msg = PeerMsg::StateReq { op, key: key.to_string(), value: value.clone() };
        let mut line = msg.to_tokens();
        line.push('\n');
        let mut stream = match connect_with_timeout(&cfg.peer_addr(peer), cfg.timeout) {
            Ok(s) => s,
            Err(_) => continue,
        };
        if send_line(&mut stream, &line).is_err() {
            continue;
        }
        match read_line_with_deadline(&mut stream, cfg.participant_deadline()) {
            ReadOutcome::Line(reply) => match parse_term_state(&reply) {
                Some(ts) => responders.push(Responder { id: peer, stream, term_state: ts }),
                None => continue,
            },
            ReadOutcome::Timeout | ReadOutcome::Closed => continue,
        }
    }

    let (voted_yes, decision) = match state.log.scan_state(key) {
        Ok(v) => v,
        Err(e) => {
            warn!("failed to scan log during termination for {}: {}", key, e);
            (false, None)
        }
    };
    let own_state = term_state(voted_yes, decision);

    let any_abort = own_state == TermState::Abort || responders.iter().any(|r| r.term_state == TermState::Abort);
    let any_commit = own_state == TermState::Commit || responders.iter().any(|r| r.term_state == TermState::Commit);
    let all_uncertain = own_state == TermState::Uncertain
        && responders.iter().all(|r| r.term_state == TermState::Uncertain);

    if any_abort {
        terminate_tr1(state, op, key, &value, own_state, responders);
    } else if any_commit {
        terminate_tr2(state, op, key, &value, own_state, responders);
    } else if all_uncertain {
        terminate_tr3(state, op, key, responders);
    } else {
        terminate_tr4(state, op, key, &value, responders);
    }
    state.clear_pending();
}

fn parse_term_state(line: &str) -> Option<TermState> {
    match line.trim() {
        "commit" => Some(TermState::Commit),
        "pre-commit" => Some(TermState::PreCommit),
        "abort" => Some(TermState::Abort),
        "uncertain" => Some(TermState::Uncertain),
        _ => None,
    }
}

fn term_state_line(ts: TermState) -> &'static str {
    match ts {
        TermState::Commit => "commit",
        TermState::PreCommit => "pre-commit",
        TermState::Abort => "abort",
        TermState::Uncertain => "uncertain",
    }
}

// TR1: some responder has already aborted. Abort here too (if not already
// decided) and tell every responder to abort.
fn terminate_tr1(state: &RuntimeState, op: Op, key: &str, value: &Option<String>, own_state: TermState, responders: Vec<Responder>) {
    if !matches!(own_state, TermState::Commit | TermState::Abort) {
        append(state, Kind::Abort, op, key, value);
    }
    broadcast(responders, PeerMsg::Abort);
    state.enqueue_master("ack abort".to_string());
}

// TR2: some responder has already committed. Commit here too (if not
// already decided) and tell every responder to commit.
fn terminate_tr2(state: &RuntimeState, op: Op, key: &str, value: &Option<String>, own_state: TermState, responders: Vec<Responder>) {
    if own_state != TermState::Commit {
        append(state, Kind::Commit, op, key, value);
        apply(state, op, key, value);
    }
    broadcast(responders, PeerMsg::Commit);
    state.enqueue_master("ack commit".to_string());
}

// TR3: every responder (and the coordinator itself) is uncertain. Safe to
// abort: nobody could possibly have already committed.
fn terminate_tr3(state: &RuntimeState, op: Op, key: &str, responders: Vec<Responder>) {
    append(state, Kind::Abort, op, key, &None);
    broadcast(responders, PeerMsg::Abort);
    state.enqueue_master("ack abort".to_string());
}

// TR4: mixed pre-commit/uncertain, no commit or abort anywhere yet. Bring
// the uncertain subset up to pre-commit, then commit.
fn terminate_tr4(state: &RuntimeState, op: Op, key: &str, value: &Option<String>, responders: Vec<Responder>) {
    let (uncertain, committable): (Vec<Responder>, Vec<Responder>) =
        responders.into_iter().partition(|r| r.term_state == TermState::Uncertain);

    append(state, Kind::PreCommit, op, key, value);
    let mut acked = Vec::new();
    for mut r in uncertain {
        let mut line = PeerMsg::PreCommit.to_tokens();
        line.push('\n');
        if send_line(&mut r.stream, &line).is_err() {
            continue;
        }
        match read_line_with_deadline(&mut r.stream, state.config.timeout) {
            ReadOutcome::Line(l) if PeerMsg::parse(&l).ok() == Some(PeerMsg::Ack) => acked.push(r),
            _ => warn!("no ack from {} during termination pre-commit", r.id),
        }
    }

    append(state, Kind::Commit, op, key, value);
    apply(state, op, key, value);
    broadcast(acked, PeerMsg::Commit);
    // Responders already at pre-commit/commit need no further message; they
    // independently converge via their own log.
    drop(committable);
    state.enqueue_master("ack commit".to_string());
}

fn broadcast(responders: Vec<Responder>, msg: PeerMsg) {
    let mut line = msg.to_tokens();
    line.push('\n');
    for mut r in responders {
        let _ = send_line(&mut r.stream, &line);
    }
}

fn append(state: &RuntimeState, kind: Kind, op: Op, key: &str, value: &Option<String>) {
    if let Err(e) = state.log.append(LogEntry::new(kind, op, key, value.clone())) {
        warn!("failed to append {:?} for {} during termination: {}", kind, key, e);
    }
}

fn apply(state: &RuntimeState, op: Op, key: &str, value: &Option<String>) {
    match op {
        Op::Add => state.playlist.upsert(key, value.as_deref().unwrap_or("")),
        Op::Delete => state.playlist.delete(key),
    }
}

/// Participant side of termination: replies with its own state for the key
/// and then follows whatever directive the new coordinator sends. Called by
/// the listener immediately after reading a bare `state-req` line.
pub fn handle_state_req(state: &RuntimeState, stream: &mut TcpStream, op: Op, key: &str, value: Option<String>) {
    let (voted_yes, decision) = match state.log.scan_state(key) {
        Ok(v) => v,
        Err(e) => {
            warn!("failed to scan log answering state-req for {}: {}", key, e);
            (false, None)
        }
    };
    let own = term_state(voted_yes, decision);
    let mut reply = term_state_line(own).to_string();
    reply.push('\n');
    if send_line(stream, &reply).is_err() {
        return;
    }

    match read_line_with_deadline(stream, state.config.participant_deadline()) {
        ReadOutcome::Line(l) => match PeerMsg::parse(&l) {
            Ok(PeerMsg::Abort) => {
                if !matches!(own, TermState::Commit | TermState::Abort) {
                    append(state, Kind::Abort, op, key, &value);
                }
            }
            Ok(PeerMsg::Commit) => {
                if own != TermState::Commit {
                    append(state, Kind::Commit, op, key, &value);
                    apply(state, op, key, &value);
                }
            }
            Ok(PeerMsg::PreCommit) => {
                append(state, Kind::PreCommit, op, key, &value);
                let mut ack = PeerMsg::Ack.to_tokens();
                ack.push('\n');
                if send_line(stream, &ack).is_err() {
                    return;
                }
                match read_line_with_deadline(stream, state.config.participant_deadline()) {
                    ReadOutcome::Line(l2) => match PeerMsg::parse(&l2) {
                        Ok(PeerMsg::Commit) => {
                            append(state, Kind::Commit, op, key, &value);
                            apply(state, op, key, &value);
                        }
                        Ok(PeerMsg::Abort) => append(state, Kind::Abort, op, key, &value),
                        _ => warn!("malformed follow-up after pre-commit ack for {}", key),
                    },
                    ReadOutcome::Timeout | ReadOutcome::Closed => {
                        participant_timeout(state, op, key, value);
                    }
                }
            }
            _ => warn!("malformed termination directive for {}", key),
        },
        ReadOutcome::Timeout | ReadOutcome::Closed => {
            participant_timeout(state, op, key, value);
        }
    }
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
        let state = RuntimeState::new(cfg).unwrap();
        (dir, state)
    }

    #[test]
    fn term_state_line_round_trips() {
        for ts in [TermState::Commit, TermState::PreCommit, TermState::Abort, TermState::Uncertain] {
            assert_eq!(parse_term_state(term_state_line(ts)), Some(ts));
        }
    }

    #[test]
    fn unparsable_term_state_is_none() {
        assert_eq!(parse_term_state("bogus"), None);
    }

    #[test]
    fn election_falls_back_to_self_with_no_higher_peer_alive() {
        let (_dir, state) = test_state(2, 3);
        assert_eq!(elect_new_coordinator(&state), 2);
        assert!(state.membership.is_coordinator());
    }

    #[test]
    fn election_picks_lowest_live_id_above_current_coordinator() {
        let (_dir, state) = test_state(0, 4);
        state.membership.record_heartbeat(1);
        state.membership.record_heartbeat(3);
        assert_eq!(elect_new_coordinator(&state), 1);
    }

    #[test]
    fn own_commit_counts_as_any_commit_even_if_no_responder_committed() {
        use std::io::{BufRead, BufReader, Write};
        use std::net::TcpListener;

        // New coordinator (id=1) already holds a commit for this key from
        // before the original coordinator crashed; the one other live peer
        // (id=2) only reached pre-commit. Per TR2 this must still resolve
        // to commit, not fall through to TR4's pre-commit dance.
        let (_dir, state) = test_state(1, 3);
        state.membership.record_heartbeat(2);
        state
            .log
            .append(LogEntry::new(Kind::Commit, Op::Add, "SongA", Some("http://a".to_string())))
            .unwrap();

        let listener = TcpListener::bind(("127.0.0.1", crate::config::START_PORT + 2)).unwrap();
        let peer = thread_spawn_fake_peer(listener);

        run_termination_as_new_coordinator(&state, Op::Add, "SongA", Some("http://a".to_string()));

        let final_directive = peer.join().unwrap();
        assert_eq!(final_directive, "commit");
        assert_eq!(state.drain_master_queue(), vec!["ack commit".to_string()]);

        fn thread_spawn_fake_peer(listener: std::net::TcpListener) -> std::thread::JoinHandle<String> {
            std::thread::spawn(move || {
                let (mut conn, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(conn.try_clone().unwrap());
                let mut state_req = String::new();
                reader.read_line(&mut state_req).unwrap();
                assert!(state_req.starts_with("state-req"));
                conn.write_all(b"pre-commit\n").unwrap();
                let mut directive = String::new();
                reader.read_line(&mut directive).unwrap();
                directive.trim().to_string()
            })
        }
    }
}
