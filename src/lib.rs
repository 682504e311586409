pub mod args;
pub mod config;
pub mod errors;
pub mod raft;
pub mod rpc;
pub mod transport;
