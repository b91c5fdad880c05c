//! Tunnel configuration loading.
//!
//! One TOML file describes the reverse tunnel:
//!
//! ```toml
//! [reverse-tunnel]
//! host = "tunnel.example.org"
//! port = 20022
//! key = "/etc/wantun/tunnel.key"
//!
//! [wan-tunnel]
//! exclude = "10.31.81.0/24 10.42.0.0/16"
//! ```
//!
//! The node's identity lives in a separate one-line id file; the SSH user
//! presented to the tunnel server is derived from it (`node-<id>`).

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default location of the tunnel config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wantun/config.toml";

/// Default location of the node identity file.
pub const DEFAULT_NODE_ID_PATH: &str = "/etc/wantun/node-id";

/// Immutable per-run tunnel configuration.
///
/// Built once at startup and never mutated afterwards. Subnet entries are
/// opaque CIDR strings; nothing here validates them beyond extraction --
/// an invalid entry is passed through to the tunnel client, which rejects
/// it at launch.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Tunnel server hostname.
    pub host: String,

    /// Tunnel server SSH port.
    pub port: String,

    /// Path to the SSH identity key presented to the server.
    pub key: PathBuf,

    /// Extra options spliced into the SSH invocation.
    pub ssh_options: String,

    /// SSH keepalive probe interval, seconds.
    pub keepalive_interval: u64,

    /// Failed keepalive probes tolerated before the connection drops.
    pub keepalive_count: u32,

    /// SSH user at the tunnel server, derived from the node identity.
    pub remote_user: String,

    /// Operator-supplied subnets to keep off the tunnel.
    pub excludes: Vec<String>,
}

/// On-disk shape of the config file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "reverse-tunnel")]
    reverse_tunnel: ReverseTunnelSection,
    #[serde(rename = "wan-tunnel", default)]
    wan_tunnel: WanTunnelSection,
}

#[derive(Debug, Deserialize)]
struct ReverseTunnelSection {
    host: String,
    port: PortValue,
    key: PathBuf,
    #[serde(rename = "ssh-options", default)]
    ssh_options: String,
    #[serde(rename = "keepalive-interval", default = "default_keepalive_interval")]
    keepalive_interval: u64,
    #[serde(rename = "keepalive-count", default = "default_keepalive_count")]
    keepalive_count: u32,
}

#[derive(Debug, Default, Deserialize)]
struct WanTunnelSection {
    /// Whitespace-separated CIDR list.
    #[serde(default)]
    exclude: String,
}

/// The port key historically appears both quoted and unquoted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortValue {
    Int(u16),
    Str(String),
}

impl PortValue {
    fn into_string(self) -> String {
        match self {
            Self::Int(n) => n.to_string(),
            Self::Str(s) => s,
        }
    }
}

const fn default_keepalive_interval() -> u64 {
    60
}

const fn default_keepalive_count() -> u32 {
    3
}

impl TunnelConfig {
    /// Load the tunnel configuration for one run.
    ///
    /// Reads the node identity from `node_id_path` and the tunnel settings
    /// from `config_path`. Missing required keys surface as parse errors;
    /// optional keys fall back to their documented defaults
    /// (interval 60, count 3, empty ssh-options, empty exclude list).
    pub fn load(config_path: &Path, node_id_path: &Path) -> Result<Self> {
        let node_id = std::fs::read_to_string(node_id_path)
            .map_err(|e| {
                Error::Config(format!(
                    "failed to read node id file {}: {e}",
                    node_id_path.display()
                ))
            })?
            .trim()
            .to_string();
        if node_id.is_empty() {
            return Err(Error::Config(format!(
                "node id file {} is empty",
                node_id_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path).map_err(|e| {
            Error::Config(format!(
                "failed to read config file {}: {e}",
                config_path.display()
            ))
        })?;
        let raw: RawConfig = toml::from_str(&content)?;

        let section = raw.reverse_tunnel;
        Ok(Self {
            host: section.host,
            port: section.port.into_string(),
            key: section.key,
            ssh_options: section.ssh_options,
            keepalive_interval: section.keepalive_interval,
            keepalive_count: section.keepalive_count,
            remote_user: format!("node-{node_id}"),
            excludes: raw
                .wan_tunnel
                .exclude
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Write a config file and node-id file into a temp dir, then load.
    fn load_fixture(config: &str, node_id: &str) -> Result<TunnelConfig> {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let node_id_path = dir.path().join("node-id");
        std::fs::write(&config_path, config).unwrap();
        std::fs::write(&node_id_path, node_id).unwrap();
        TunnelConfig::load(&config_path, &node_id_path)
    }

    const MINIMAL: &str = r#"
[reverse-tunnel]
host = "tunnel.example.org"
port = 20022
key = "/etc/wantun/tunnel.key"
"#;

    #[test]
    fn minimal_config_applies_defaults() {
        let config = load_fixture(MINIMAL, "000048b02d15bc6d\n").unwrap();
        assert_eq!(config.host, "tunnel.example.org");
        assert_eq!(config.port, "20022");
        assert_eq!(config.key, PathBuf::from("/etc/wantun/tunnel.key"));
        assert_eq!(config.ssh_options, "");
        assert_eq!(config.keepalive_interval, 60);
        assert_eq!(config.keepalive_count, 3);
        assert!(config.excludes.is_empty());
    }

    #[test]
    fn node_id_is_trimmed_into_remote_user() {
        let config = load_fixture(MINIMAL, "  000048b02d15bc6d \n").unwrap();
        assert_eq!(config.remote_user, "node-000048b02d15bc6d");
    }

    #[test]
    fn port_accepts_quoted_string() {
        let config = load_fixture(
            r#"
[reverse-tunnel]
host = "tunnel.example.org"
port = "20022"
key = "/etc/wantun/tunnel.key"
"#,
            "n1",
        )
        .unwrap();
        assert_eq!(config.port, "20022");
    }

    #[test]
    fn optional_keys_are_honored() {
        let config = load_fixture(
            r#"
[reverse-tunnel]
host = "tunnel.example.org"
port = 20022
key = "/etc/wantun/tunnel.key"
ssh-options = "-o ProxyCommand=none"
keepalive-interval = 15
keepalive-count = 5
"#,
            "n1",
        )
        .unwrap();
        assert_eq!(config.ssh_options, "-o ProxyCommand=none");
        assert_eq!(config.keepalive_interval, 15);
        assert_eq!(config.keepalive_count, 5);
    }

    #[test]
    fn exclude_list_splits_on_whitespace() {
        let config = load_fixture(
            r#"
[reverse-tunnel]
host = "tunnel.example.org"
port = 20022
key = "/etc/wantun/tunnel.key"

[wan-tunnel]
exclude = """10.31.81.0/24  10.42.0.0/16
10.43.0.0/16"""
"#,
            "n1",
        )
        .unwrap();
        assert_eq!(
            config.excludes,
            vec!["10.31.81.0/24", "10.42.0.0/16", "10.43.0.0/16"]
        );
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let result = load_fixture(
            r#"
[reverse-tunnel]
host = "tunnel.example.org"
port = 20022
"#,
            "n1",
        );
        assert!(matches!(result, Err(Error::Toml(_))));
    }

    #[test]
    fn empty_node_id_is_an_error() {
        let result = load_fixture(MINIMAL, "\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
