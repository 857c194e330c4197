//!
//! vote.rs
//! The voting rule: a deterministic per-process
//! predicate on the proposed value, reproduced verbatim from the reference
//! implementation so that test fixtures behave identically across
//! implementations. Add and delete share the rule; `value` is the URL for
//! `add` and the key itself has no bearing on the vote.
use crate::message::Op;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vote {
    Yes,
    No,
}

/// `no` iff `len(value) > id + 5`. `delete` carries no value to vote on and
/// always votes `yes`.
pub fn vote(id: u32, op: Op, value: Option<&str>) -> Vote {
    match (op, value) {
        (Op::Add, Some(v)) if v.len() as u32 > id + 5 => Vote::No,
        _ => Vote::Yes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_value_is_yes() {
        assert_eq!(vote(0, Op::Add, Some("short")), Vote::Yes);
    }

    #[test]
    fn long_value_is_no_at_low_id() {
        assert_eq!(vote(0, Op::Add, Some("verylongurl")), Vote::No);
    }

    #[test]
    fn higher_id_tolerates_longer_values() {
        // len("verylongurl") == 11, which exceeds 0+5 but not 10+5.
        assert_eq!(vote(10, Op::Add, Some("verylongurl")), Vote::Yes);
    }

    #[test]
    fn boundary_is_inclusive_of_equal_length() {
        // len(value) == id + 5 must still vote yes ("no iff strictly greater").
        let value = "a".repeat(5);
        assert_eq!(vote(0, Op::Add, Some(&value)), Vote::Yes);
        let value = "a".repeat(6);
        assert_eq!(vote(0, Op::Add, Some(&value)), Vote::No);
    }

    #[test]
    fn delete_always_votes_yes() {
        assert_eq!(vote(0, Op::Delete, None), Vote::Yes);
    }

    #[test]
    fn vote_is_deterministic_across_repeats() {
        for _ in 0..5 {
            assert_eq!(vote(2, Op::Add, Some("verylongurl")), Vote::No);
        }
    }
}
