use std::error::Error;
use std::net::SocketAddr;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;

use rafting_transport::args::{Args, Command};
use rafting_transport::config::AppConfig;
use rafting_transport::errors::{RaftError, RaftResult};
use rafting_transport::raft::inbound::InboundRpc;
use rafting_transport::raft::message::{AppendEntriesRequest, AppendEntriesResponse, RaftRequest, RaftResponse};
use rafting_transport::rpc::rpc_client::RaftGrpcClientStub;
use rafting_transport::transport::RaftGrpcTransport;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_logger()?;
    let args = Args::parse();
    info!("Args: {:?}", &args);
    let config = AppConfig::get_configuration(&args.config)?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, shutting down");
        }
        shutdown.cancel();
    });

    let transport = RaftGrpcTransport::with_options(cancel.clone(), args.node_id.clone(), config.options());
    let node_config = config.node(&args.node_id)?;
    for (peer_id, peer_addr) in config.peers(node_config)? {
        transport.add_peer(peer_id, RaftGrpcClientStub::lazy(&peer_addr)?);
    }

    match args.command {
        Command::Serve => {
            let address: SocketAddr = node_config
                .grpc_address
                .parse()
                .map_err(|e| RaftError::BadRequest(format!("Invalid grpc address {}: {e}", node_config.grpc_address)))?;
            serve(&transport, address).await?;
        }
        Command::Ping { peer, term } => ping(&transport, &peer, term).await?,
    }
    Ok(())
}

/// Serves without a consensus engine: heartbeats are acknowledged on the
/// fast path, everything else is rejected.
async fn serve(transport: &RaftGrpcTransport, address: SocketAddr) -> RaftResult<()> {
    transport.set_heartbeat_handler(acknowledge_heartbeat);

    let consumer = transport.consumer();
    let local_id = transport.local_addr().to_string();
    tokio::spawn(async move {
        while let Some(rpc) = consumer.recv().await {
            let kind = rpc.command.kind();
            warn!("Node {local_id} has no consensus engine attached, rejecting {kind}");
            rpc.fail(format!("node {local_id} does not accept {kind} requests"));
        }
    });

    transport.serve(address).await
}

fn acknowledge_heartbeat(rpc: InboundRpc) {
    let term = match &rpc.command {
        RaftRequest::AppendEntries(request) => request.term,
        _ => 0,
    };
    rpc.respond(RaftResponse::AppendEntries(AppendEntriesResponse {
        term,
        success: true,
        ..Default::default()
    }));
}

async fn ping(transport: &RaftGrpcTransport, peer: &str, term: u64) -> RaftResult<()> {
    let heartbeat = AppendEntriesRequest {
        term,
        leader: transport.local_addr().to_string(),
        ..Default::default()
    };
    match transport.append_entries(peer, &heartbeat).await {
        Ok(response) => {
            info!("Heartbeat acknowledged by {peer}: {:?}", response);
            Ok(())
        }
        Err(e) => {
            error!("Heartbeat to {peer} failed: {e}");
            Err(e.into())
        }
    }
}

pub fn setup_logger() -> Result<(), Box<dyn Error>> {
    LogTracer::init()?;
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
