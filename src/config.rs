//! Node configuration
//!
//! A TOML file provides the full configuration; a handful of CLI flags and
//! environment variables override the fields that differ per deployment.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Command line interface for the steward daemon.
#[derive(Parser, Debug)]
#[command(name = "steward")]
#[command(about = "Command-and-control fabric for fleets of intermittently connected nodes")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "steward.toml", env = "STEWARD_CONFIG")]
    pub config: String,

    /// Node name (overrides config file)
    #[arg(long, env = "STEWARD_NODE_NAME")]
    pub node_name: Option<String>,

    /// Broker address (overrides config file)
    #[arg(long, env = "STEWARD_BROKER_ADDRESS")]
    pub broker_address: Option<String>,

    /// Central node name (overrides config file)
    #[arg(long, env = "STEWARD_CENTRAL_NODE")]
    pub central_node_name: Option<String>,

    /// Run the central auth schema on this node
    #[arg(long, env = "STEWARD_CENTRAL_AUTH")]
    pub central_auth: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unique name of this node on the fabric
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Name of the coordinator node owning the canonical ACL and key schemas
    #[serde(default = "default_central_node")]
    pub central_node_name: String,

    /// Node that receives ErrorLog messages from the error kernel
    #[serde(default = "default_central_node")]
    pub error_central_node: String,

    /// Address of the message broker
    #[serde(default = "default_broker_address")]
    pub broker_address: String,

    /// Folder holding the signing keys
    #[serde(default = "default_config_folder")]
    pub config_folder: PathBuf,

    /// Folder holding the durable queue store and the public key file
    #[serde(default = "default_database_folder")]
    pub database_folder: PathBuf,

    /// Root folder for handler file output
    #[serde(default = "default_data_folder")]
    pub subscribers_data_folder: PathBuf,

    /// Folder holding the ingress unix socket
    #[serde(default = "default_socket_folder")]
    pub socket_folder: PathBuf,

    /// Folder scanned at boot for locally handled messages
    #[serde(default = "default_startup_folder")]
    pub startup_folder: PathBuf,

    /// TCP ingress listener address, disabled when unset
    #[serde(default)]
    pub tcp_listener: Option<String>,

    /// HTTP ingress listener address, disabled when unset
    #[serde(default)]
    pub http_listener: Option<String>,

    /// Capacity of the in-memory staging channel
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: usize,

    /// Verify request signatures for methods that require them
    #[serde(default)]
    pub enable_signature_check: bool,

    /// Enforce the distributed ACL on incoming requests
    #[serde(default)]
    pub enable_acl_check: bool,

    /// Maintain the canonical ACL and key schemas on this node
    #[serde(default)]
    pub is_central_auth: bool,

    /// Publish a Hello to central every N seconds, 0 disables
    #[serde(default)]
    pub start_pub_hello_secs: u64,

    /// How often to ask central for ACL and key updates
    #[serde(default = "default_auth_update_interval")]
    pub auth_update_interval_secs: u64,
}

fn default_node_name() -> String {
    "node1".to_string()
}
fn default_central_node() -> String {
    "central".to_string()
}
fn default_broker_address() -> String {
    "nats://127.0.0.1:4222".to_string()
}
fn default_config_folder() -> PathBuf {
    PathBuf::from("./etc")
}
fn default_database_folder() -> PathBuf {
    PathBuf::from("./var/lib")
}
fn default_data_folder() -> PathBuf {
    PathBuf::from("./var/data")
}
fn default_socket_folder() -> PathBuf {
    PathBuf::from("./tmp")
}
fn default_startup_folder() -> PathBuf {
    PathBuf::from("./startup")
}
fn default_ring_buffer_size() -> usize {
    1000
}
fn default_auth_update_interval() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            central_node_name: default_central_node(),
            error_central_node: default_central_node(),
            broker_address: default_broker_address(),
            config_folder: default_config_folder(),
            database_folder: default_database_folder(),
            subscribers_data_folder: default_data_folder(),
            socket_folder: default_socket_folder(),
            startup_folder: default_startup_folder(),
            tcp_listener: None,
            http_listener: None,
            ring_buffer_size: default_ring_buffer_size(),
            enable_signature_check: false,
            enable_acl_check: false,
            is_central_auth: false,
            start_pub_hello_secs: 0,
            auth_update_interval_secs: default_auth_update_interval(),
        }
    }
}

impl Config {
    /// Load the config file when present, then apply CLI overrides.
    pub fn load(cli: &Cli) -> crate::Result<Config> {
        let mut config = if std::path::Path::new(&cli.config).exists() {
            let content = std::fs::read_to_string(&cli.config)?;
            toml::from_str(&content)
                .map_err(|e| crate::StewardError::Config(format!("{}: {e}", cli.config)))?
        } else {
            Config::default()
        };

        if let Some(node_name) = &cli.node_name {
            config.node_name = node_name.clone();
        }
        if let Some(broker) = &cli.broker_address {
            config.broker_address = broker.clone();
        }
        if let Some(central) = &cli.central_node_name {
            config.central_node_name = central.clone();
        }
        if cli.central_auth {
            config.is_central_auth = true;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.central_node_name, "central");
        assert_eq!(c.ring_buffer_size, 1000);
        assert!(!c.enable_signature_check);
    }

    #[test]
    fn test_toml_partial() {
        let c: Config = toml::from_str(
            r#"
            node_name = "ship101"
            broker_address = "nats://broker:4222"
            enable_acl_check = true
            "#,
        )
        .unwrap();
        assert_eq!(c.node_name, "ship101");
        assert_eq!(c.broker_address, "nats://broker:4222");
        assert!(c.enable_acl_check);
        assert_eq!(c.central_node_name, "central");
    }
}
