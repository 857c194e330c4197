//!
//! crash.rs
//! Crash-injection hooks. Each hook is armed by a
//! master command and consumed at exactly one later protocol point, at
//! which this process really exits (never a panic, never a recoverable
//! error) so an external harness can observe an actual process death.
use std::sync::Mutex;

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParticipantHook {
    BeforeVote,
    AfterVote,
    AfterAck,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinatorHook {
    VoteReq(Vec<u32>),
    PartialPreCommit(Vec<u32>),
    PartialCommit(Vec<u32>),
}

#[derive(Default)]
pub struct CrashHooks {
    participant: Mutex<Option<ParticipantHook>>,
    coordinator: Mutex<Option<CoordinatorHook>>,
}

impl CrashHooks {
    pub fn new() -> CrashHooks {
        CrashHooks::default()
    }

    pub fn arm_participant(&self, hook: ParticipantHook) {
        *self.participant.lock().unwrap() = Some(hook);
    }

    /// Arms a coordinator-side hook. Arming must fail immediately if the
    /// target id list is empty.
    pub fn arm_coordinator(&self, hook: CoordinatorHook) -> Result<()> {
        let ids_empty = match &hook {
            CoordinatorHook::VoteReq(ids)
            | CoordinatorHook::PartialPreCommit(ids)
            | CoordinatorHook::PartialCommit(ids) => ids.is_empty(),
        };
        if ids_empty {
            return Err(Error::InvalidConfig("crash hook requires at least one target id".into()));
        }
        *self.coordinator.lock().unwrap() = Some(hook);
        Ok(())
    }

    /// Takes the armed participant hook if it matches `which`, consuming it.
    pub fn take_participant(&self, which: ParticipantHook) -> bool {
        let mut slot = self.participant.lock().unwrap();
        if slot.as_ref() == Some(&which) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Takes the armed `VoteReq` target list, if any, consuming it.
    pub fn take_vote_req_targets(&self) -> Option<Vec<u32>> {
        let mut slot = self.coordinator.lock().unwrap();
        match slot.take() {
            Some(CoordinatorHook::VoteReq(ids)) => Some(ids),
            other => {
                *slot = other;
                None
            }
        }
    }

    pub fn take_partial_pre_commit_targets(&self) -> Option<Vec<u32>> {
        let mut slot = self.coordinator.lock().unwrap();
        match slot.take() {
            Some(CoordinatorHook::PartialPreCommit(ids)) => Some(ids),
            other => {
                *slot = other;
                None
            }
        }
    }

    pub fn take_partial_commit_targets(&self) -> Option<Vec<u32>> {
        let mut slot = self.coordinator.lock().unwrap();
        match slot.take() {
            Some(CoordinatorHook::PartialCommit(ids)) => Some(ids),
            other => {
                *slot = other;
                None
            }
        }
    }
}

/// Exits the process immediately. Never called from within a panic
/// handler — this is a deliberate, specified fault, not an error.
pub fn crash_now() -> ! {
    log::warn!("crash-injection hook fired, exiting");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arming_with_empty_ids_fails() {
        let hooks = CrashHooks::new();
        assert!(hooks.arm_coordinator(CoordinatorHook::VoteReq(vec![])).is_err());
    }

    #[test]
    fn armed_vote_req_is_taken_once() {
        let hooks = CrashHooks::new();
        hooks.arm_coordinator(CoordinatorHook::VoteReq(vec![1, 2])).unwrap();
        assert_eq!(hooks.take_vote_req_targets(), Some(vec![1, 2]));
        assert_eq!(hooks.take_vote_req_targets(), None);
    }

    #[test]
    fn wrong_kind_is_not_taken() {
        let hooks = CrashHooks::new();
        hooks.arm_coordinator(CoordinatorHook::PartialCommit(vec![1])).unwrap();
        assert_eq!(hooks.take_vote_req_targets(), None);
        assert_eq!(hooks.take_partial_commit_targets(), Some(vec![1]));
    }

    #[test]
    fn participant_hook_matches_exactly() {
        let hooks = CrashHooks::new();
        hooks.arm_participant(ParticipantHook::AfterVote);
        assert!(!hooks.take_participant(ParticipantHook::BeforeVote));
        assert!(hooks.take_participant(ParticipantHook::AfterVote));
        assert!(!hooks.take_participant(ParticipantHook::AfterVote));
    }

}
