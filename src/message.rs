//!
//! message.rs
//! Wire vocabulary shared by every peer-to-peer and master-facing
//! connection. Two wire shapes travel the network: a JSON envelope for
//! `vote-req`, `get`, and heartbeats, and bare newline-terminated text for
//! every other protocol message.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The mutating operation a transaction performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Add,
    Delete,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Op> {
        match s {
            "add" => Ok(Op::Add),
            "delete" => Ok(Op::Delete),
            other => Err(Error::MalformedMessage(format!("unknown op: {}", other))),
        }
    }
}

/// `{"id": <int>, "rts": <RFC3339 timestamp>, "msg": "<text>"}`, used to
/// carry `vote-req`, `get`, and heartbeat traffic between peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u32,
    pub rts: DateTime<Utc>,
    pub msg: String,
}

impl Envelope {
    pub fn new(id: u32, msg: impl Into<String>) -> Envelope {
        Envelope {
            id,
            rts: Utc::now(),
            msg: msg.into(),
        }
    }

    /// A heartbeat envelope: travels on the dedicated heartbeat port, `msg`
    /// carrying the sender's `coord_id` as decimal text.
    pub fn heartbeat(id: u32, coord_id: u32) -> Envelope {
        Envelope::new(id, coord_id.to_string())
    }

    /// Parses this envelope's `msg` as the `coord_id` of a heartbeat sender.
    pub fn heartbeat_coord_id(&self) -> Result<u32> {
        self.msg
            .parse()
            .map_err(|_| Error::MalformedMessage(format!("bad heartbeat payload: {}", self.msg)))
    }

    pub fn to_line(&self) -> Result<String> {
        let mut s = serde_json::to_string(self)?;
        s.push('\n');
        Ok(s)
    }

    pub fn from_line(line: &str) -> Result<Envelope> {
        serde_json::from_str(line.trim_end())
            .map_err(|e| Error::MalformedMessage(format!("bad envelope: {}", e)))
    }
}

/// The body carried by a peer message, whether wrapped in an `Envelope` or
/// sent as bare text.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerMsg {
    VoteReq { op: Op, key: String, value: Option<String> },
    Get { key: String },
    Yes,
    No,
    Ack,
    PreCommit,
    Commit,
    Abort,
    StateReq { op: Op, key: String, value: Option<String> },
    Resp { value: String },
}

impl PeerMsg {
    /// Renders the message body as space-separated tokens (no trailing
    /// newline; callers append one, or wrap it in an `Envelope`).
    pub fn to_tokens(&self) -> String {
        match self {
            PeerMsg::VoteReq { op, key, value } => render_op("vote-req", *op, key, value),
            PeerMsg::Get { key } => format!("get {}", key),
            PeerMsg::Yes => "yes".to_string(),
            PeerMsg::No => "no".to_string(),
            PeerMsg::Ack => "ack".to_string(),
            PeerMsg::PreCommit => "pre-commit".to_string(),
            PeerMsg::Commit => "commit".to_string(),
            PeerMsg::Abort => "abort".to_string(),
            PeerMsg::StateReq { op, key, value } => render_op("state-req", *op, key, value),
            PeerMsg::Resp { value } => format!("resp {}", value),
        }
    }

    pub fn parse(text: &str) -> Result<PeerMsg> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let bad = || Error::MalformedMessage(format!("bad peer message: {}", text));
        match tokens.as_slice() {
            ["vote-req", op, key] => Ok(PeerMsg::VoteReq { op: Op::parse(op)?, key: key.to_string(), value: None }),
            ["vote-req", op, key, value] => Ok(PeerMsg::VoteReq { op: Op::parse(op)?, key: key.to_string(), value: Some(value.to_string()) }),
            ["get", key] => Ok(PeerMsg::Get { key: key.to_string() }),
            ["yes"] => Ok(PeerMsg::Yes),
            ["no"] => Ok(PeerMsg::No),
            ["ack"] => Ok(PeerMsg::Ack),
            ["pre-commit"] => Ok(PeerMsg::PreCommit),
            ["commit"] => Ok(PeerMsg::Commit),
            ["abort"] => Ok(PeerMsg::Abort),
            ["state-req", op, key] => Ok(PeerMsg::StateReq { op: Op::parse(op)?, key: key.to_string(), value: None }),
            ["state-req", op, key, value] => Ok(PeerMsg::StateReq { op: Op::parse(op)?, key: key.to_string(), value: Some(value.to_string()) }),
            ["resp", value] => Ok(PeerMsg::Resp { value: value.to_string() }),
            _ => Err(bad()),
        }
    }
}

fn render_op(kind: &str, op: Op, key: &str, value: &Option<String>) -> String {
    match value {
        Some(v) => format!("{} {} {} {}", kind, op.as_str(), key, v),
        None => format!("{} {} {}", kind, op.as_str(), key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_vote_req() {
        let m = PeerMsg::VoteReq { op: Op::Add, key: "SongA".into(), value: Some("http://a".into()) };
        let tokens = m.to_tokens();
        assert_eq!(tokens, "vote-req add SongA http://a");
        assert_eq!(PeerMsg::parse(&tokens).unwrap(), m);
    }

    #[test]
    fn round_trips_delete_without_value() {
        let m = PeerMsg::StateReq { op: Op::Delete, key: "SongA".into(), value: None };
        let tokens = m.to_tokens();
        assert_eq!(PeerMsg::parse(&tokens).unwrap(), m);
    }

    #[test]
    fn bare_directives_parse() {
        for (text, expected) in [
            ("yes", PeerMsg::Yes),
            ("no", PeerMsg::No),
            ("ack", PeerMsg::Ack),
            ("pre-commit", PeerMsg::PreCommit),
            ("commit", PeerMsg::Commit),
            ("abort", PeerMsg::Abort),
        ] {
            assert_eq!(PeerMsg::parse(text).unwrap(), expected);
        }
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::new(2, "get SongA");
        let line = env.to_line().unwrap();
        assert!(line.ends_with('\n'));
        let back = Envelope::from_line(&line).unwrap();
        assert_eq!(back.id, 2);
        assert_eq!(back.msg, "get SongA");
    }

    #[test]
    fn heartbeat_envelope_carries_coord_id() {
        let env = Envelope::heartbeat(0, 2);
        assert_eq!(env.heartbeat_coord_id().unwrap(), 2);
    }

    #[test]
    fn malformed_message_is_rejected() {
        assert!(PeerMsg::parse("bogus").is_err());
    }
}
