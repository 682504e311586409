use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
version = "0.1.0",
about = "Rafting transport - gRPC transport for a Raft consensus engine",
arg_required_else_help = true
)]
pub struct Args {
    #[arg(short = 'n', long = "node-id", help = "Node identifier. (Refer to cluster_config.yaml for node ids)", required = true)]
    pub node_id: String,

    #[arg(short = 'c', long = "cluster-config", value_name = "FILE", required = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve the transport, acknowledging heartbeats from peers
    Serve,
    /// Send a single heartbeat to a peer
    Ping {
        #[arg(short = 'p', long = "peer", help = "Peer node identifier", required = true)]
        peer: String,

        #[arg(short = 't', long = "term", default_value_t = 1)]
        term: u64,
    },
}
