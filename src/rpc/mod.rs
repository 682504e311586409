pub mod convert;
pub mod future;
pub mod pipeline;
pub mod rpc_client;
pub mod rpc_peer_network;
pub mod rpc_server;
pub mod snapshot;

pub mod raft {
    tonic::include_proto!("raft");
}
