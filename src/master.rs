//!
//! master.rs
//! The master-facing channel: a single connection, one
//! command at a time. `get` always replies synchronously; everything else
//! the server has to say (`ack commit`, `ack abort`, `coordinator <id>`) is
//! queued and drained opportunistically between command reads.
use std::net::{TcpListener, TcpStream};
use std::process;
use std::sync::Arc;

use log::{error, info, warn};

use crate::coordinator;
use crate::crash::{crash_now, CoordinatorHook, ParticipantHook};
use crate::message::Op;
use crate::net::{read_line_with_deadline, send_line, ReadOutcome};
use crate::playlist::NONE;
use crate::state::RuntimeState;

pub fn run_master_server(state: &Arc<RuntimeState>) {
    let cfg = &state.config;
    let listener = match TcpListener::bind(("127.0.0.1", cfg.master_port)) {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind master port {}: {}", cfg.master_port, e);
            process::exit(1);
        }
    };

    for conn in listener.incoming() {
        let mut stream = match conn {
            Ok(s) => s,
            Err(_) => continue,
        };
        info!("master connected");
        handle_master_connection(state, &mut stream);
    }
}

fn handle_master_connection(state: &Arc<RuntimeState>, stream: &mut TcpStream) {
    loop {
        for queued in state.drain_master_queue() {
            if send_line(stream, &format!("{}\n", queued)).is_err() {
                return;
            }
        }
        match read_line_with_deadline(stream, state.config.timeout) {
            ReadOutcome::Line(line) => execute(state, stream, line.trim()),
            ReadOutcome::Timeout => continue,
            ReadOutcome::Closed => return,
        }
    }
}

fn execute(state: &Arc<RuntimeState>, stream: &mut TcpStream, command: &str) {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    match tokens.as_slice() {
        ["get", key] => {
            let value = if state.membership.is_coordinator() {
                coordinator::get(state, key)
            } else {
                state.playlist.lookup(key).unwrap_or_else(|| NONE.to_string())
            };
            let _ = send_line(stream, &format!("resp {}\n", value));
        }
        ["add", key, value] => dispatch_client_op(state, Op::Add, key, Some(value.to_string())),
        ["delete", key] => dispatch_client_op(state, Op::Delete, key, None),
        ["crash"] => crash_now(),
        ["crashBeforeVote"] => state.crash_hooks.arm_participant(ParticipantHook::BeforeVote),
        ["crashAfterVote"] => state.crash_hooks.arm_participant(ParticipantHook::AfterVote),
        ["crashAfterAck"] => state.crash_hooks.arm_participant(ParticipantHook::AfterAck),
        ["crashVoteREQ", rest @ ..] => arm_coordinator_hook(state, rest, CoordinatorHook::VoteReq),
        ["crashPartialPreCommit", rest @ ..] => arm_coordinator_hook(state, rest, CoordinatorHook::PartialPreCommit),
        ["crashPartialCommit", rest @ ..] => arm_coordinator_hook(state, rest, CoordinatorHook::PartialCommit),
        [] => {}
        _ => warn!("unrecognized master command: {}", command),
    }
}

fn dispatch_client_op(state: &Arc<RuntimeState>, op: Op, key: &str, value: Option<String>) {
    if !state.membership.is_coordinator() {
        // add/delete are silently ignored unless this process is the
        // current coordinator.
        return;
    }
    coordinator::handle_client_op(state, op, key.to_string(), value);
}

fn arm_coordinator_hook(state: &Arc<RuntimeState>, rest: &[&str], build: impl Fn(Vec<u32>) -> CoordinatorHook) {
    let ids: Result<Vec<u32>, _> = rest.iter().map(|s| s.parse::<u32>()).collect();
    match ids {
        Ok(ids) => {
            if let Err(e) = state.crash_hooks.arm_coordinator(build(ids)) {
                warn!("failed to arm crash hook: {}", e);
            }
        }
        Err(_) => warn!("crash hook command has non-numeric target ids: {:?}", rest),
    }
}
