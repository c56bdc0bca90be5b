//! Core consensus types: terms, log indices, entries, and the RPC messages.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Raft term number (monotonically increasing).
///
/// Terms are logical election epochs. Each term has at most one leader, and
/// a node's term never decreases.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log index (1-indexed, 0 is the sentinel for "before the log").
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Node identifier (unique across the cluster).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raft role (Follower, Candidate, or Leader). Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// A replicated log entry.
///
/// Entry identity is `(index, term)`: two entries at the same index with the
/// same term are the same entry regardless of command payload. This is the
/// log-matching property, and equality/hashing deliberately exclude `command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    /// Opaque command bytes, interpreted by the host's state machine.
    pub command: Bytes,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, command: impl Into<Bytes>) -> Self {
        Self {
            index,
            term,
            command: command.into(),
        }
    }
}

impl PartialEq for LogEntry {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.term == other.term
    }
}

impl Eq for LogEntry {}

impl Hash for LogEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.term.hash(state);
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.index, self.term)
    }
}

/// RequestVote RPC, broadcast by a candidate to gather votes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting the vote
    pub candidate_id: NodeId,

    /// Index of the candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of the candidate's last log entry
    pub last_log_term: Term,
}

/// Reply to RequestVote, sent back to the candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Granter's current term, for the candidate to update itself
    pub term: Term,

    /// The candidate the reply is addressed to
    pub candidate_id: NodeId,

    /// The node that granted or denied the vote
    pub granter_id: NodeId,

    /// True if the candidate received the vote
    pub vote_granted: bool,
}

/// AppendEntries RPC, sent by the leader to replicate entries and as heartbeat.
///
/// An empty `entries` list is a pure heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// Leader's ID
    pub leader_id: NodeId,

    /// The follower this message is addressed to
    pub recipient_id: NodeId,

    /// Index of the log entry immediately preceding the new ones
    pub prev_log_index: LogIndex,

    /// Term of the entry at `prev_log_index`
    pub prev_log_term: Term,

    /// Entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,

    /// Leader's commit index, capped at the last entry sent
    pub leader_commit: LogIndex,
}

/// Reply to AppendEntries, sent back to the leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Follower's current term, for the leader to update itself
    pub term: Term,

    /// The leader the reply is addressed to
    pub leader_id: NodeId,

    /// The follower replying
    pub follower_id: NodeId,

    /// True if the consistency check passed and the entries were merged
    pub success: bool,

    /// Highest index the follower now matches the leader's log at
    /// (0 on rejection)
    pub match_index: LogIndex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_and_index_ordering() {
        assert!(Term(2) > Term(1));
        assert_eq!(Term(5).next(), Term(6));
        assert!(LogIndex(10) > LogIndex(5));
        assert_eq!(LogIndex(5).next(), LogIndex(6));
    }

    #[test]
    fn test_entry_identity_ignores_command() {
        let a = LogEntry::new(LogIndex(3), Term(2), "apply x");
        let b = LogEntry::new(LogIndex(3), Term(2), "apply y");
        assert_eq!(a, b);

        let c = LogEntry::new(LogIndex(3), Term(3), "apply x");
        assert_ne!(a, c);
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(Term(4).to_string(), "T4");
        assert_eq!(LogIndex(9).to_string(), "I9");
        assert_eq!(Role::Candidate.to_string(), "Candidate");
    }
}
