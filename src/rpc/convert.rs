//! Translation between the neutral structures in `crate::raft::message` and
//! their protobuf wire form, plus the persisted peer address encoding.

use prost::Message;

use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogEntry, LogType, RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest,
    TimeoutNowResponse,
};
use crate::rpc::raft as wire;

impl From<LogType> for wire::LogType {
    fn from(log_type: LogType) -> Self {
        match log_type {
            LogType::Command => wire::LogType::Command,
            LogType::Noop => wire::LogType::Noop,
            LogType::Barrier => wire::LogType::Barrier,
            LogType::Configuration => wire::LogType::Configuration,
        }
    }
}

impl From<wire::LogType> for LogType {
    fn from(log_type: wire::LogType) -> Self {
        match log_type {
            wire::LogType::Command => LogType::Command,
            wire::LogType::Noop => LogType::Noop,
            wire::LogType::Barrier => LogType::Barrier,
            wire::LogType::Configuration => LogType::Configuration,
        }
    }
}

impl From<&LogEntry> for wire::LogEntry {
    fn from(entry: &LogEntry) -> Self {
        Self {
            index: entry.index,
            term: entry.term,
            log_type: wire::LogType::from(entry.log_type) as i32,
            data: entry.data.clone(),
            extensions: entry.extensions.clone(),
        }
    }
}

impl From<wire::LogEntry> for LogEntry {
    fn from(entry: wire::LogEntry) -> Self {
        // Unknown log types from newer peers degrade to commands.
        let log_type = wire::LogType::try_from(entry.log_type).unwrap_or(wire::LogType::Command);
        Self {
            index: entry.index,
            term: entry.term,
            log_type: log_type.into(),
            data: entry.data,
            extensions: entry.extensions,
        }
    }
}

impl From<&AppendEntriesRequest> for wire::AppendEntriesRequest {
    fn from(request: &AppendEntriesRequest) -> Self {
        Self {
            term: request.term,
            leader: request.leader.clone(),
            prev_log_entry: request.prev_log_entry,
            prev_log_term: request.prev_log_term,
            entries: request.entries.iter().map(wire::LogEntry::from).collect(),
            leader_commit_index: request.leader_commit_index,
        }
    }
}

impl From<wire::AppendEntriesRequest> for AppendEntriesRequest {
    fn from(request: wire::AppendEntriesRequest) -> Self {
        Self {
            term: request.term,
            leader: request.leader,
            prev_log_entry: request.prev_log_entry,
            prev_log_term: request.prev_log_term,
            entries: request.entries.into_iter().map(LogEntry::from).collect(),
            leader_commit_index: request.leader_commit_index,
        }
    }
}

impl From<AppendEntriesResponse> for wire::AppendEntriesResponse {
    fn from(response: AppendEntriesResponse) -> Self {
        Self {
            term: response.term,
            last_log: response.last_log,
            success: response.success,
            no_retry_backoff: response.no_retry_backoff,
        }
    }
}

impl From<wire::AppendEntriesResponse> for AppendEntriesResponse {
    fn from(response: wire::AppendEntriesResponse) -> Self {
        Self {
            term: response.term,
            last_log: response.last_log,
            success: response.success,
            no_retry_backoff: response.no_retry_backoff,
        }
    }
}

impl From<&RequestVoteRequest> for wire::RequestVoteRequest {
    fn from(request: &RequestVoteRequest) -> Self {
        Self {
            term: request.term,
            candidate: request.candidate.clone(),
            last_log_index: request.last_log_index,
            last_log_term: request.last_log_term,
            leadership_transfer: request.leadership_transfer,
        }
    }
}

impl From<wire::RequestVoteRequest> for RequestVoteRequest {
    fn from(request: wire::RequestVoteRequest) -> Self {
        Self {
            term: request.term,
            candidate: request.candidate,
            last_log_index: request.last_log_index,
            last_log_term: request.last_log_term,
            leadership_transfer: request.leadership_transfer,
        }
    }
}

impl From<RequestVoteResponse> for wire::RequestVoteResponse {
    fn from(response: RequestVoteResponse) -> Self {
        Self {
            term: response.term,
            granted: response.granted,
        }
    }
}

impl From<wire::RequestVoteResponse> for RequestVoteResponse {
    fn from(response: wire::RequestVoteResponse) -> Self {
        Self {
            term: response.term,
            granted: response.granted,
        }
    }
}

impl From<&InstallSnapshotRequest> for wire::InstallSnapshotRequest {
    fn from(request: &InstallSnapshotRequest) -> Self {
        Self {
            snapshot_version: request.snapshot_version,
            term: request.term,
            leader: request.leader.clone(),
            last_log_index: request.last_log_index,
            last_log_term: request.last_log_term,
            configuration: request.configuration.clone(),
            configuration_index: request.configuration_index,
            size: request.size,
        }
    }
}

impl From<wire::InstallSnapshotRequest> for InstallSnapshotRequest {
    fn from(request: wire::InstallSnapshotRequest) -> Self {
        Self {
            snapshot_version: request.snapshot_version,
            term: request.term,
            leader: request.leader,
            last_log_index: request.last_log_index,
            last_log_term: request.last_log_term,
            configuration: request.configuration,
            configuration_index: request.configuration_index,
            size: request.size,
        }
    }
}

impl From<InstallSnapshotResponse> for wire::InstallSnapshotResponse {
    fn from(response: InstallSnapshotResponse) -> Self {
        Self {
            term: response.term,
            success: response.success,
        }
    }
}

impl From<wire::InstallSnapshotResponse> for InstallSnapshotResponse {
    fn from(response: wire::InstallSnapshotResponse) -> Self {
        Self {
            term: response.term,
            success: response.success,
        }
    }
}

impl From<&TimeoutNowRequest> for wire::TimeoutNowRequest {
    fn from(request: &TimeoutNowRequest) -> Self {
        Self {
            term: request.term,
            leader: request.leader.clone(),
        }
    }
}

impl From<wire::TimeoutNowRequest> for TimeoutNowRequest {
    fn from(request: wire::TimeoutNowRequest) -> Self {
        Self {
            term: request.term,
            leader: request.leader,
        }
    }
}

impl From<TimeoutNowResponse> for wire::TimeoutNowResponse {
    fn from(response: TimeoutNowResponse) -> Self {
        Self { term: response.term }
    }
}

impl From<wire::TimeoutNowResponse> for TimeoutNowResponse {
    fn from(response: wire::TimeoutNowResponse) -> Self {
        Self { term: response.term }
    }
}

/// Serializes a peer id into the address form the consensus engine persists.
pub fn encode_peer(id: &str) -> Vec<u8> {
    wire::PeerNameContainer {
        peer_name: id.to_string(),
    }
    .encode_to_vec()
}

/// Inverse of `encode_peer`. Malformed input yields an empty id.
pub fn decode_peer(data: &[u8]) -> String {
    wire::PeerNameContainer::decode(data)
        .map(|container| container.peer_name)
        .unwrap_or_default()
}
