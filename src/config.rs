//!
//! config.rs
//! Command-line options and logging set-up for a single playlist-3pc
//! process. Uses the clap crate to collect the (small, fixed) positional
//! argument list, and the log + stderrlog crates to initialize the
//! application to use trace!()/debug!()/info!() etc. from the log crate.
//!
use std::fs;
use std::time::Duration;

use clap::{App, Arg};

use crate::error::{Error, Result};

/// Base port for peer-facing sockets. Port numbers are always START_PORT + id.
pub const START_PORT: u16 = 20000;

/// Base port for heartbeat sockets. Port numbers are always END_PORT - id.
pub const END_PORT: u16 = 29999;

/// Duration between heartbeat broadcasts.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(200);

/// Maximum time since the last heartbeat from a peer for which it is still
/// considered alive. Kept > HEARTBEAT_INTERVAL (1.25x by default) so that a
/// single dropped heartbeat does not itself trigger a false failure.
pub const ALIVE_INTERVAL: Duration = Duration::from_millis(250);

/// Per-message network read deadline.
pub const TIMEOUT: Duration = Duration::from_millis(10);

/// Immutable configuration for one process, built once at start-up and
/// shared by reference with every task. There are no ambient globals beyond
/// this value and the explicit, lock-guarded `RuntimeState` it seeds.
#[derive(Clone, Debug)]
pub struct Config {
    pub id: u32,
    pub num_procs: u32,
    pub master_port: u16,
    pub peer_port: u16,
    pub heartbeat_port: u16,
    pub heartbeat_interval: Duration,
    pub alive_interval: Duration,
    pub timeout: Duration,
    pub log_dir: String,
}

impl Config {
    /// Parses `<id> <num_procs> <master_port>` from argv and returns the
    /// resulting configuration, or a fatal `InvalidConfig` error.
    pub fn from_args() -> Result<Config> {
        let matches = App::new("playlist-3pc")
            .version("0.1.0")
            .about("Replicated playlist store committed via non-blocking three-phase commit")
            .arg(
                Arg::with_name("id")
                    .help("This process's id, in 0..num_procs")
                    .required(true)
                    .index(1),
            )
            .arg(
                Arg::with_name("num_procs")
                    .help("Total number of processes in the system")
                    .required(true)
                    .index(2),
            )
            .arg(
                Arg::with_name("master_port")
                    .help("Port the master process connects on")
                    .required(true)
                    .index(3),
            )
            .arg(
                Arg::with_name("log_dir")
                    .long("log-dir")
                    .takes_value(true)
                    .required(false)
                    .help("Directory for this process's DT-log (default ./logs/)"),
            )
            .arg(
                Arg::with_name("verbosity")
                    .short("v")
                    .multiple(true)
                    .required(false)
                    .help("Increase log verbosity (repeatable)"),
            )
            .get_matches();

        let parse_u32 = |name: &str| -> Result<u32> {
            matches
                .value_of(name)
                .unwrap()
                .parse::<u32>()
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", name, e)))
        };

        let id = parse_u32("id")?;
        let num_procs = parse_u32("num_procs")?;
        if num_procs == 0 {
            return Err(Error::InvalidConfig("num_procs must be > 0".into()));
        }
        if id >= num_procs {
            return Err(Error::InvalidConfig(format!(
                "id {} out of range for num_procs {}",
                id, num_procs
            )));
        }

        let master_port: u16 = matches
            .value_of("master_port")
            .unwrap()
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("master_port: {}", e)))?;

        let log_dir = matches.value_of("log_dir").unwrap_or("./logs/");
        let log_dir = shellexpand::tilde(log_dir).into_owned();
        fs::create_dir_all(&log_dir).map_err(Error::Log)?;

        let verbosity = matches.occurrences_of("verbosity") as usize;
        stderrlog::new()
            .module(module_path!())
            .verbosity(verbosity + 2)
            .timestamp(stderrlog::Timestamp::Millisecond)
            .init()
            .ok();

        Ok(Config {
            id,
            num_procs,
            master_port,
            peer_port: START_PORT + id as u16,
            heartbeat_port: END_PORT - id as u16,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            alive_interval: ALIVE_INTERVAL,
            timeout: TIMEOUT,
            log_dir,
        })
    }

    /// Path of this process's own DT-log file.
    pub fn dt_log_path(&self) -> String {
        format!("{}/dt_log_{}.log", self.log_dir.trim_end_matches('/'), self.id)
    }

    /// Peer-facing address for `peer_id`.
    pub fn peer_addr(&self, peer_id: u32) -> String {
        format!("127.0.0.1:{}", START_PORT + peer_id as u16)
    }

    /// Heartbeat address for `peer_id`.
    pub fn heartbeat_addr(&self, peer_id: u32) -> String {
        format!("127.0.0.1:{}", END_PORT - peer_id as u16)
    }

    /// Participant wait deadline on the coordinator's next directive:
    /// NUM_PROCS * TIMEOUT, since the coordinator must fan out to every peer.
    pub fn participant_deadline(&self) -> Duration {
        self.timeout * self.num_procs
    }
}
