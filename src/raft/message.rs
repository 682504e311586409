//! Transport-neutral Raft RPC structures exchanged with the consensus engine.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogType {
    #[default]
    Command,
    Noop,
    Barrier,
    Configuration,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub log_type: LogType,
    pub data: Vec<u8>,
    pub extensions: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader: String,
    pub prev_log_entry: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit_index: u64,
}

impl AppendEntriesRequest {
    /// A heartbeat carries a term and a leader but no log position, no entries
    /// and no commit index.
    ///
    /// The match is on field values alone: a first append on an empty log with
    /// no entries and nothing committed looks exactly like a heartbeat.
    pub fn is_heartbeat(&self) -> bool {
        self.term != 0
            && !self.leader.is_empty()
            && self.prev_log_entry == 0
            && self.prev_log_term == 0
            && self.entries.is_empty()
            && self.leader_commit_index == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub last_log: u64,
    pub success: bool,
    pub no_retry_backoff: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub leadership_transfer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstallSnapshotRequest {
    pub snapshot_version: u32,
    pub term: u64,
    pub leader: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub configuration: Vec<u8>,
    pub configuration_index: u64,
    /// Size of the snapshot payload in bytes.
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TimeoutNowRequest {
    pub term: u64,
    pub leader: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TimeoutNowResponse {
    pub term: u64,
}

/// Requests a peer can send to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftRequest {
    AppendEntries(AppendEntriesRequest),
    RequestVote(RequestVoteRequest),
    InstallSnapshot(InstallSnapshotRequest),
    TimeoutNow(TimeoutNowRequest),
}

impl RaftRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            RaftRequest::AppendEntries(_) => "AppendEntries",
            RaftRequest::RequestVote(_) => "RequestVote",
            RaftRequest::InstallSnapshot(_) => "InstallSnapshot",
            RaftRequest::TimeoutNow(_) => "TimeoutNow",
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, RaftRequest::AppendEntries(req) if req.is_heartbeat())
    }
}

/// Responses the consensus engine hands back for a `RaftRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftResponse {
    AppendEntries(AppendEntriesResponse),
    RequestVote(RequestVoteResponse),
    InstallSnapshot(InstallSnapshotResponse),
    TimeoutNow(TimeoutNowResponse),
}

impl RaftResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            RaftResponse::AppendEntries(_) => "AppendEntries",
            RaftResponse::RequestVote(_) => "RequestVote",
            RaftResponse::InstallSnapshot(_) => "InstallSnapshot",
            RaftResponse::TimeoutNow(_) => "TimeoutNow",
        }
    }
}
