//!
//! listener.rs
//! The inter-peer listener: accepts exactly one connection at a time and
//! runs it to completion before accepting the next one. Because only one
//! transaction is ever in flight, this single accept loop is also where a
//! participant, having timed out mid-transaction and lost the election,
//! naturally picks up the new coordinator's `state-req` as "the next
//! inbound connection".
use std::net::{TcpListener, TcpStream};
use std::process;
use std::sync::Arc;

use log::{debug, error, warn};

use crate::election::handle_state_req;
use crate::message::{Envelope, PeerMsg};
use crate::net::{read_line_with_deadline, send_line, ReadOutcome};
use crate::participant::handle_vote_req;
use crate::state::RuntimeState;

pub fn run_peer_listener(state: &Arc<RuntimeState>) {
    let cfg = &state.config;
    let listener = match TcpListener::bind(("127.0.0.1", cfg.peer_port)) {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind peer port {}: {}", cfg.peer_port, e);
            process::exit(1);
        }
    };

    for conn in listener.incoming() {
        let mut stream = match conn {
            Ok(s) => s,
            Err(_) => continue,
        };
        let _guard = state.protocol_lock.lock().unwrap();
        handle_connection(state, &mut stream);
    }
}

fn handle_connection(state: &Arc<RuntimeState>, stream: &mut TcpStream) {
    let first = match read_line_with_deadline(stream, state.config.timeout) {
        ReadOutcome::Line(l) => l,
        ReadOutcome::Timeout | ReadOutcome::Closed => return,
    };

    if let Ok(envelope) = Envelope::from_line(&first) {
        match PeerMsg::parse(&envelope.msg) {
            Ok(PeerMsg::VoteReq { op, key, value }) => handle_vote_req(state, stream, op, key, value),
            Ok(PeerMsg::Get { key }) => {
                // A peer asking us for a value only ever wants our own local
                // answer; the multi-hop poll lives in `coordinator::get`, one
                // level up, not here (no recursive fan-out across hops).
                let value = state.playlist.lookup(&key).unwrap_or_else(|| crate::playlist::NONE.to_string());
                let _ = send_line(stream, &format!("{}\n", PeerMsg::Resp { value }.to_tokens()));
            }
            _ => debug!("dropping malformed envelope payload: {}", envelope.msg),
        }
        return;
    }

    match PeerMsg::parse(first.trim()) {
        Ok(PeerMsg::StateReq { op, key, value }) => handle_state_req(state, stream, op, &key, value),
        _ => debug!("dropping unparsable first line on peer connection: {}", first.trim()),
    }
}
