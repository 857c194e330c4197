//!
//! state.rs
//! The one shared runtime-state value threaded explicitly through every
//! task. Everything here is either immutable (`Config`) or guarded by its
//! own short-lived lock; there are no ambient globals.
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::config::Config;
use crate::crash::CrashHooks;
use crate::error::Result;
use crate::membership::Membership;
use crate::message::Op;
use crate::oplog::DtLog;
use crate::playlist::Playlist;

/// The key, op and (optional) value of the single transaction currently in
/// flight on this process, if any. Used only so that a heartbeat-driven
/// election knows which key to run the termination round for;
/// per-connection handlers that are themselves mid-transaction already
/// have this context locally.
pub type PendingTxn = (Op, String, Option<String>);

pub struct RuntimeState {
    pub config: Config,
    pub log: DtLog,
    pub playlist: Playlist,
    pub membership: Membership,
    pub crash_hooks: CrashHooks,
    pending: Mutex<Option<PendingTxn>>,
    /// Server -> master messages other than `resp`, drained opportunistically
    /// between master command reads.
    outbound: Mutex<VecDeque<String>>,
    /// Held by the inter-peer listener across the full handling of one
    /// message; released before the next blocking accept.
    pub protocol_lock: Mutex<()>,
}

impl RuntimeState {
    pub fn new(config: Config) -> Result<RuntimeState> {
        let log = DtLog::open(config.dt_log_path())?;
        let membership = Membership::new(&config);
        Ok(RuntimeState {
            config,
            log,
            playlist: Playlist::new(),
            membership,
            crash_hooks: CrashHooks::new(),
            pending: Mutex::new(None),
            outbound: Mutex::new(VecDeque::new()),
            protocol_lock: Mutex::new(()),
        })
    }

    pub fn set_pending(&self, txn: PendingTxn) {
        *self.pending.lock().unwrap() = Some(txn);
    }

    pub fn clear_pending(&self) {
        *self.pending.lock().unwrap() = None;
    }

    pub fn pending(&self) -> Option<PendingTxn> {
        self.pending.lock().unwrap().clone()
    }

    /// Enqueues one already-formatted (no trailing newline) line for the
    /// master. `ack commit`, `ack abort`, and `coordinator <id>` all travel
    /// this way; `resp` is always returned synchronously instead.
    pub fn enqueue_master(&self, line: impl Into<String>) {
        self.outbound.lock().unwrap().push_back(line.into());
    }

    /// Drains everything currently queued, in FIFO order.
    pub fn drain_master_queue(&self) -> Vec<String> {
        let mut q = self.outbound.lock().unwrap();
        q.drain(..).collect()
    }
}
