//!
//! main.rs
//! Entry point: parses configuration, builds the shared `RuntimeState`,
//! and starts the heartbeat sender, heartbeat receiver, inter-peer
//! listener and master-facing server, each on its own OS thread. The
//! heartbeat sender and receiver together form one logical failure-
//! detector role split across two threads for a simpler read/write split.
use std::process;
use std::sync::Arc;
use std::thread;

use log::error;

use playlist_3pc::config::Config;
use playlist_3pc::election::heartbeat_watchdog_tick;
use playlist_3pc::listener::run_peer_listener;
use playlist_3pc::master::run_master_server;
use playlist_3pc::membership::{run_heartbeat_receiver, run_heartbeat_sender};
use playlist_3pc::state::RuntimeState;

fn main() {
    let config = match Config::from_args() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("playlist-3pc: {}", e);
            process::exit(1);
        }
    };

    let state = match RuntimeState::new(config) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("playlist-3pc: failed to start: {}", e);
            process::exit(1);
        }
    };

    let heartbeat_sender_state = Arc::clone(&state);
    let heartbeat_sender = thread::spawn(move || {
        let cfg = heartbeat_sender_state.config.clone();
        run_heartbeat_sender(&cfg, &heartbeat_sender_state.membership, || {
            heartbeat_watchdog_tick(&heartbeat_sender_state);
        });
    });

    let heartbeat_receiver_state = Arc::clone(&state);
    let heartbeat_receiver = thread::spawn(move || {
        let cfg = heartbeat_receiver_state.config.clone();
        run_heartbeat_receiver(&cfg, &heartbeat_receiver_state.membership, |new_coord| {
            heartbeat_receiver_state.enqueue_master(format!("coordinator {}", new_coord));
        });
    });

    let listener_state = Arc::clone(&state);
    let peer_listener = thread::spawn(move || {
        run_peer_listener(&listener_state);
    });

    let master_state = Arc::clone(&state);
    let master_server = thread::spawn(move || {
        run_master_server(&master_state);
    });

    for handle in [heartbeat_sender, heartbeat_receiver, peer_listener, master_server] {
        if handle.join().is_err() {
            error!("a server task panicked");
        }
    }
}
