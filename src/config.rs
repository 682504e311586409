use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use config::{Config, Environment, FileFormat};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{RaftError, RaftResult};
use crate::raft::{TransportOptions, INBOUND_QUEUE_CAPACITY, MAX_PIPELINE, SNAPSHOT_CHUNK_SIZE};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default = "default_max_pipeline")]
    pub max_pipeline: usize,
    #[serde(default = "default_snapshot_chunk_size")]
    pub snapshot_chunk_size: usize,
    #[serde(default = "default_inbound_queue_capacity")]
    pub inbound_queue_capacity: usize,
    pub cluster: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub grpc_address: String,
    #[serde(default)]
    pub peers: Vec<String>,
}

fn default_max_pipeline() -> usize {
    MAX_PIPELINE
}

fn default_snapshot_chunk_size() -> usize {
    SNAPSHOT_CHUNK_SIZE
}

fn default_inbound_queue_capacity() -> usize {
    INBOUND_QUEUE_CAPACITY
}

impl AppConfig {
    pub fn get_configuration(config_file: &Path) -> RaftResult<AppConfig> {
        dotenv().ok(); //Load .env file if present, environment variables override the yaml
        let config_path = fs::canonicalize(config_file)
            .with_context(|| format!("Unable to locate configuration file {}", config_file.display()))?;
        let config = Config::builder()
            .add_source(config::File::new(&config_path.display().to_string(), FileFormat::Yaml))
            .add_source(
                Environment::with_prefix("RAFT_TRANSPORT")
                    .try_parsing(true)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("Unable to build configuration")?;

        let app_cfg: AppConfig = config.try_deserialize().context("Unable to deserialize configuration")?;
        info!("Loaded configuration: {:?}", app_cfg);

        Ok(app_cfg)
    }

    pub fn options(&self) -> TransportOptions {
        TransportOptions {
            max_pipeline: self.max_pipeline,
            snapshot_chunk_size: self.snapshot_chunk_size,
            inbound_queue_capacity: self.inbound_queue_capacity,
        }
    }

    pub fn node(&self, node_id: &str) -> RaftResult<&NodeConfig> {
        self.cluster
            .iter()
            .find(|n| n.node_id == node_id)
            .ok_or_else(|| RaftError::BadRequest(format!("Node {node_id} is not part of the cluster configuration")))
    }

    /// Peer id to `http://` endpoint for every peer of `node_config`.
    pub fn peers(&self, node_config: &NodeConfig) -> RaftResult<HashMap<String, String>> {
        node_config
            .peers
            .iter()
            .map(|p| {
                let peer_config = self.node(p)?;
                Ok((peer_config.node_id.to_string(), format!("http://{}", peer_config.grpc_address)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_file_and_dotenv_load() {
        let app_cfg = AppConfig::get_configuration(&PathBuf::from("tests/test_cluster_config.yaml")).unwrap();
        assert_eq!(app_cfg.max_pipeline, 8);
        assert_eq!(app_cfg.snapshot_chunk_size, 1024);
        assert_eq!(app_cfg.cluster.len(), 2);
        assert_eq!(app_cfg.cluster[0].node_id, "node1");
        assert_eq!(app_cfg.cluster[0].grpc_address, "127.0.0.1:7070");
        assert_eq!(app_cfg.cluster[0].peers, vec!["node2".to_string()]);

        assert_eq!(app_cfg.cluster[1].node_id, "node2");
        assert_eq!(app_cfg.cluster[1].grpc_address, "127.0.0.1:8080");
        assert_eq!(app_cfg.cluster[1].peers, vec!["node1".to_string()]);

        let options = app_cfg.options();
        assert_eq!(options.max_pipeline, 8);
        assert_eq!(options.snapshot_chunk_size, 1024);
    }

    #[test]
    fn test_environment_overrides_yaml() {
        // No other test reads the inbound capacity.
        std::env::set_var("RAFT_TRANSPORT__INBOUND_QUEUE_CAPACITY", "3");
        let app_cfg = AppConfig::get_configuration(&PathBuf::from("tests/test_cluster_config.yaml")).unwrap();
        std::env::remove_var("RAFT_TRANSPORT__INBOUND_QUEUE_CAPACITY");
        assert_eq!(app_cfg.inbound_queue_capacity, 3);
        assert_eq!(app_cfg.options().inbound_queue_capacity, 3);
        assert_ne!(app_cfg.inbound_queue_capacity, INBOUND_QUEUE_CAPACITY);
        assert_eq!(app_cfg.max_pipeline, 8);
    }

    #[test]
    fn test_peer_resolution() {
        let app_cfg = AppConfig::get_configuration(&PathBuf::from("tests/test_cluster_config.yaml")).unwrap();
        let node1 = app_cfg.node("node1").unwrap();
        let peers = app_cfg.peers(node1).unwrap();
        assert_eq!(peers.get("node2").map(String::as_str), Some("http://127.0.0.1:8080"));
        assert!(matches!(app_cfg.node("node9"), Err(RaftError::BadRequest(_))));

        let orphan = NodeConfig {
            node_id: "node3".to_string(),
            grpc_address: "127.0.0.1:9090".to_string(),
            peers: vec!["node9".to_string()],
        };
        assert!(app_cfg.peers(&orphan).is_err());
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = AppConfig::get_configuration(&PathBuf::from("tests/no_such_config.yaml")).unwrap_err();
        assert!(matches!(err, RaftError::AnyhowError(_)));
    }
}
