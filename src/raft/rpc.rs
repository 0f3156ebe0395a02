//! Wire messages exchanged between replicas.
//!
//! All indices are 0-based; "no entry yet" cases travel as absent optional
//! fields rather than sentinel values.

use prost::Message;

/// Invoked by candidates to gather votes.
#[derive(Clone, PartialEq, Message)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// Candidate requesting the vote.
    #[prost(string, tag = "2")]
    pub candidate_id: String,
    /// Index of the candidate's last log entry, if any.
    #[prost(uint64, optional, tag = "3")]
    pub last_log_index: Option<u64>,
    /// Term of the candidate's last log entry.
    #[prost(uint64, tag = "4")]
    pub last_log_term: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct RequestVoteResponse {
    /// Current term, for the candidate to update itself.
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// True when the candidate received the vote.
    #[prost(bool, tag = "2")]
    pub vote_granted: bool,
}

/// One command-log entry as shipped between replicas.
#[derive(Clone, PartialEq, Message)]
pub struct CommandEntry {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    /// Tagged command payload, applied by the state machine.
    #[prost(bytes = "vec", tag = "3")]
    pub command: Vec<u8>,
}

/// Cluster member as carried in heartbeats.
#[derive(Clone, PartialEq, Message)]
pub struct ServerEntry {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub addr: String,
    #[prost(bool, tag = "3")]
    pub voter: bool,
}

/// Invoked by the leader to replicate entries; empty `entries` is a
/// heartbeat. The current membership rides along so followers track
/// join/leave without dedicated log traffic.
#[derive(Clone, PartialEq, Message)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// So followers can redirect clients.
    #[prost(string, tag = "2")]
    pub leader_id: String,
    /// Index of the entry immediately preceding the new ones.
    #[prost(uint64, optional, tag = "3")]
    pub prev_log_index: Option<u64>,
    /// Term of the `prev_log_index` entry; meaningful only when the index
    /// is present.
    #[prost(uint64, tag = "4")]
    pub prev_log_term: u64,
    #[prost(message, repeated, tag = "5")]
    pub entries: Vec<CommandEntry>,
    /// Leader's commit index.
    #[prost(uint64, optional, tag = "6")]
    pub leader_commit: Option<u64>,
    #[prost(message, repeated, tag = "7")]
    pub servers: Vec<ServerEntry>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself.
    #[prost(uint64, tag = "1")]
    pub term: u64,
    /// True when the follower matched `prev_log_index`/`prev_log_term`.
    #[prost(bool, tag = "2")]
    pub success: bool,
    /// Follower's last log index, so the leader can converge `next_index`
    /// without probing one step at a time.
    #[prost(uint64, optional, tag = "3")]
    pub last_log_index: Option<u64>,
}

/// Leader-only request to add a voter.
#[derive(Clone, PartialEq, Message)]
pub struct JoinRequest {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub addr: String,
}

/// Leader-only request to remove a voter.
#[derive(Clone, PartialEq, Message)]
pub struct LeaveRequest {
    #[prost(string, tag = "1")]
    pub id: String,
}

/// Empty acknowledgement for membership requests.
#[derive(Clone, PartialEq, Message)]
pub struct Ack {}

/// Prefix frame of a snapshot stream, sent before the FSM snapshot data.
#[derive(Clone, PartialEq, Message)]
pub struct SnapshotHeader {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(string, tag = "2")]
    pub leader_id: String,
    /// Index of the last command covered by the snapshot.
    #[prost(uint64, tag = "3")]
    pub last_included_index: u64,
    /// Term of that command.
    #[prost(uint64, tag = "4")]
    pub last_included_term: u64,
}

impl RequestVoteResponse {
    pub fn grant(term: u64) -> Self {
        RequestVoteResponse {
            term,
            vote_granted: true,
        }
    }

    pub fn deny(term: u64) -> Self {
        RequestVoteResponse {
            term,
            vote_granted: false,
        }
    }
}

impl AppendEntriesRequest {
    /// Returns true when this request carries no entries.
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AppendEntriesResponse {
    pub fn success(term: u64, last_log_index: Option<u64>) -> Self {
        AppendEntriesResponse {
            term,
            success: true,
            last_log_index,
        }
    }

    pub fn failure(term: u64, last_log_index: Option<u64>) -> Self {
        AppendEntriesResponse {
            term,
            success: false,
            last_log_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vote_message_round_trip() {
        let request = RequestVoteRequest {
            term: 5,
            candidate_id: "node-2".to_string(),
            last_log_index: Some(10),
            last_log_term: 4,
        };
        let bytes = request.encode_to_vec();
        let decoded = RequestVoteRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, request);

        let empty_log = RequestVoteRequest {
            term: 1,
            candidate_id: "node-0".to_string(),
            last_log_index: None,
            last_log_term: 0,
        };
        let bytes = empty_log.encode_to_vec();
        let decoded = RequestVoteRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.last_log_index, None);
    }

    #[test]
    fn test_append_entries_round_trip() {
        let request = AppendEntriesRequest {
            term: 3,
            leader_id: "node-0".to_string(),
            prev_log_index: None,
            prev_log_term: 0,
            entries: vec![CommandEntry {
                index: 0,
                term: 3,
                command: vec![0, 1, 2],
            }],
            leader_commit: Some(0),
            servers: vec![ServerEntry {
                id: "node-0".to_string(),
                addr: "127.0.0.1:9000".to_string(),
                voter: true,
            }],
        };
        assert!(!request.is_heartbeat());

        let bytes = request.encode_to_vec();
        let decoded = AppendEntriesRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_response_helpers() {
        let grant = RequestVoteResponse::grant(7);
        assert!(grant.vote_granted);
        assert_eq!(grant.term, 7);

        let failure = AppendEntriesResponse::failure(2, Some(9));
        assert!(!failure.success);
        assert_eq!(failure.last_log_index, Some(9));
    }
}
