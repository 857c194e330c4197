//!
//! membership.rs
//! The heartbeat-based failure detector: tracks each peer's last-seen
//! instant and the locally-known `coord_id`, and answers "who is alive"
//! for the election and termination protocols. Guarded by a single
//! short-critical-section lock.
use std::net::{TcpListener, TcpStream};
use std::process;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::message::Envelope;
use crate::net::{read_line_with_deadline, ReadOutcome};

/// Shared liveness table and coordinator pointer. `last_seen[i]` is the
/// instant peer `i` was last heard from; the local process is always
/// considered alive without consulting the table.
pub struct Membership {
    self_id: u32,
    num_procs: u32,
    alive_interval: Duration,
    last_seen: Mutex<Vec<Instant>>,
    coord_id: AtomicU32,
}

impl Membership {
    /// A freshly started process has heard from nobody yet and assumes
    /// process 0 is coordinator (the reference's boot convention: id 0 is
    /// the initial coordinator until a higher `coord_id` is heard from).
    pub fn new(cfg: &Config) -> Membership {
        let epoch = Instant::now() - cfg.alive_interval * 1000;
        Membership {
            self_id: cfg.id,
            num_procs: cfg.num_procs,
            alive_interval: cfg.alive_interval,
            last_seen: Mutex::new(vec![epoch; cfg.num_procs as usize]),
            coord_id: AtomicU32::new(0),
        }
    }

    pub fn coord_id(&self) -> u32 {
        self.coord_id.load(Ordering::SeqCst)
    }

    pub fn is_coordinator(&self) -> bool {
        self.coord_id() == self.self_id
    }

    /// Adopts `candidate` as `coord_id` iff it is strictly greater than the
    /// current value, keeping `coord_id` non-decreasing over the process's
    /// lifetime. Returns `true` if adoption happened (the caller should then notify
    /// the master of the new coordinator).
    pub fn adopt_coord_id(&self, candidate: u32) -> bool {
        let mut cur = self.coord_id.load(Ordering::SeqCst);
        while candidate > cur {
            match self.coord_id.compare_exchange(cur, candidate, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
        false
    }

    pub fn record_heartbeat(&self, peer_id: u32) {
        if let Some(slot) = self.last_seen.lock().unwrap().get_mut(peer_id as usize) {
            *slot = Instant::now();
        }
    }

    fn is_alive(&self, peer_id: u32) -> bool {
        if peer_id == self.self_id {
            return true;
        }
        match self.last_seen.lock().unwrap().get(peer_id as usize) {
            Some(seen) => seen.elapsed() < self.alive_interval,
            None => false,
        }
    }

    /// Ascending ids currently believed alive, self always included.
    pub fn alive_set(&self) -> Vec<u32> {
        (0..self.num_procs).filter(|&id| self.is_alive(id)).collect()
    }
}

/// Heartbeat sender: broadcasts `(self_id, coord_id)` to every other process
/// every `heartbeat_interval`, forever. Runs as one of the long-lived
/// background tasks. `on_tick` runs after each broadcast round and is the
/// hook a caller uses to notice a dead coordinator even when nobody is
/// currently waiting on it mid-transaction.
pub fn run_heartbeat_sender(cfg: &Config, membership: &Membership, on_tick: impl Fn()) {
    loop {
        std::thread::sleep(cfg.heartbeat_interval);
        let envelope = Envelope::heartbeat(cfg.id, membership.coord_id());
        let line = match envelope.to_line() {
            Ok(l) => l,
            Err(e) => {
                warn!("failed to encode heartbeat: {}", e);
                continue;
            }
        };
        for peer in 0..cfg.num_procs {
            if peer == cfg.id {
                continue;
            }
            send_heartbeat(cfg, peer, &line);
        }
        on_tick();
    }
}

fn send_heartbeat(cfg: &Config, peer: u32, line: &str) {
    use std::io::Write;
    let addr = cfg.heartbeat_addr(peer);
    match TcpStream::connect_timeout(&addr.parse().unwrap(), cfg.timeout) {
        Ok(mut stream) => {
            if let Err(e) = stream.write_all(line.as_bytes()) {
                debug!("heartbeat send to {} failed: {}", peer, e);
            }
        }
        Err(e) => debug!("heartbeat connect to {} failed: {}", peer, e),
    }
}

/// Heartbeat receiver: accepts connections on the dedicated heartbeat port
/// and updates `last_seen`/`coord_id` for every envelope received. Unlike
/// the peer listener, heartbeat handling never needs FIFO ordering across
/// senders (only the max timestamp per peer matters), so accepts may be
/// handled one at a time without a protocol-wide lock.
pub fn run_heartbeat_receiver(cfg: &Config, membership: &Membership, on_new_coordinator: impl Fn(u32)) {
    let listener = match TcpListener::bind(("127.0.0.1", cfg.heartbeat_port)) {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind heartbeat port {}: {}", cfg.heartbeat_port, e);
            process::exit(1);
        }
    };

    for conn in listener.incoming() {
        let mut stream = match conn {
            Ok(s) => s,
            Err(_) => continue,
        };
        match read_line_with_deadline(&mut stream, cfg.timeout) {
            ReadOutcome::Line(line) => handle_heartbeat_line(&line, membership, &on_new_coordinator),
            ReadOutcome::Timeout | ReadOutcome::Closed => continue,
        }
    }
}

fn handle_heartbeat_line(line: &str, membership: &Membership, on_new_coordinator: &impl Fn(u32)) {
    let envelope = match Envelope::from_line(line) {
        Ok(e) => e,
        Err(e) => {
            debug!("malformed heartbeat dropped: {}", e);
            return;
        }
    };
    membership.record_heartbeat(envelope.id);
    match envelope.heartbeat_coord_id() {
        Ok(sender_coord_id) => {
            if membership.adopt_coord_id(sender_coord_id) {
                info!("adopting coordinator {} from heartbeat", sender_coord_id);
                on_new_coordinator(sender_coord_id);
            }
        }
        Err(e) => debug!("malformed heartbeat payload: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(id: u32, num_procs: u32) -> Config {
        Config {
            id,
            num_procs,
            master_port: 0,
            peer_port: 0,
            heartbeat_port: 0,
            heartbeat_interval: Duration::from_millis(200),
            alive_interval: Duration::from_millis(250),
            timeout: Duration::from_millis(10),
            log_dir: "/tmp".into(),
        }
    }

    #[test]
    fn self_is_always_alive() {
        let m = Membership::new(&test_config(1, 3));
        assert_eq!(m.alive_set(), vec![1]);
    }

    #[test]
    fn recorded_heartbeat_makes_peer_alive() {
        let m = Membership::new(&test_config(0, 3));
        m.record_heartbeat(1);
        let mut alive = m.alive_set();
        alive.sort();
        assert_eq!(alive, vec![0, 1]);
    }

    #[test]
    fn coord_id_only_increases() {
        let m = Membership::new(&test_config(0, 3));
        assert!(m.adopt_coord_id(2));
        assert_eq!(m.coord_id(), 2);
        assert!(!m.adopt_coord_id(1));
        assert_eq!(m.coord_id(), 2);
        assert!(m.adopt_coord_id(5));
        assert_eq!(m.coord_id(), 5);
    }

    #[test]
    fn is_coordinator_tracks_coord_id() {
        let m = Membership::new(&test_config(2, 3));
        assert!(!m.is_coordinator());
        m.adopt_coord_id(2);
        assert!(m.is_coordinator());
    }
}
