//! Server configuration.
//!
//! Loaded once at startup from a TOML file and validated before the server
//! assembles. A missing or invalid field is fatal.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use ipnet::IpNet;
use serde::Deserialize;

use qvpn_core::constants::{DEFAULT_MTU, MAX_MTU, MIN_MTU};
use qvpn_core::error::{Error, Result};

use crate::acl::Action;

/// Main server configuration.
///
/// ```toml
/// listen_addr      = "0.0.0.0:4433"
/// server_name      = "vpn.example.org"
/// cert_file        = "server.crt"
/// key_file         = "server.key"
/// ca_file          = "ca.crt"
/// assign_cidr      = "10.0.0.0/24"
/// advertise_routes = ["10.0.0.0/24"]
/// tun_name         = "qvpn0"
/// mtu              = 1400
/// log_level        = "info"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// host:port for the QUIC listener.
    pub listen_addr: SocketAddr,
    /// SNI / certificate name used in the URI template.
    pub server_name: String,
    /// Server TLS certificate (PEM).
    pub cert_file: PathBuf,
    /// Server TLS private key (PEM).
    pub key_file: PathBuf,
    /// CA bundle for client certificate verification (PEM).
    pub ca_file: PathBuf,
    /// Peer address pool.
    pub assign_cidr: IpNet,
    /// Prefixes pushed to every peer.
    #[serde(default)]
    pub advertise_routes: Vec<IpNet>,
    /// TUN device name (empty = system-assigned).
    #[serde(default)]
    pub tun_name: String,
    /// TUN MTU.
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Diagnostic verbosity: error, warn, info, debug, trace.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Access-control seed state.
    #[serde(default)]
    pub acl: AclConfig,
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Access-control section.
#[derive(Debug, Clone, Deserialize)]
pub struct AclConfig {
    /// Action when no policy matches: "allow" or "deny".
    #[serde(default = "default_action")]
    pub default_action: String,
    /// Static group definitions; the admin collaborator refreshes them at
    /// runtime through the control bridge.
    #[serde(default, rename = "group")]
    pub groups: Vec<GroupConfig>,
}

fn default_action() -> String {
    "deny".to_string()
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            default_action: default_action(),
            groups: Vec::new(),
        }
    }
}

/// One access-control group.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    /// Peer IDs (certificate CNs) belonging to this group.
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, rename = "policy")]
    pub policies: Vec<PolicyConfig>,
}

/// One ordered access-control rule.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    pub priority: i32,
    pub prefix: IpNet,
    pub action: String,
}

impl ServerConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.server_name.is_empty() {
            return Err(Error::Config {
                message: "server_name must not be empty".to_string(),
            });
        }
        if self.listen_addr.port() == 0 {
            return Err(Error::Config {
                message: "listen_addr port must not be 0".to_string(),
            });
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(Error::Config {
                message: format!("mtu {} outside {}..={}", self.mtu, MIN_MTU, MAX_MTU),
            });
        }
        if self.tun_name.len() > 15 {
            return Err(Error::Config {
                message: "tun_name must not exceed 15 characters".to_string(),
            });
        }
        parse_action(&self.acl.default_action)?;
        for group in &self.acl.groups {
            if group.name.is_empty() {
                return Err(Error::Config {
                    message: "acl group name must not be empty".to_string(),
                });
            }
            for policy in &group.policies {
                parse_action(&policy.action)?;
            }
        }
        Ok(())
    }

    /// The access-control default action.
    pub fn default_action(&self) -> Action {
        // Validated at load time
        parse_action(&self.acl.default_action).unwrap_or(Action::Deny)
    }
}

/// Parse "allow"/"deny" (case-insensitive).
pub fn parse_action(s: &str) -> Result<Action> {
    match s.to_ascii_lowercase().as_str() {
        "allow" => Ok(Action::Allow),
        "deny" => Ok(Action::Deny),
        other => Err(Error::Config {
            message: format!("unknown action {other:?}, expected \"allow\" or \"deny\""),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        listen_addr = "0.0.0.0:4433"
        server_name = "vpn.example.org"
        cert_file   = "server.crt"
        key_file    = "server.key"
        ca_file     = "ca.crt"
        assign_cidr = "10.0.0.0/24"
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = ServerConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.listen_addr.port(), 4433);
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.log_level, "info");
        assert!(config.advertise_routes.is_empty());
        assert!(config.tun_name.is_empty());
        assert_eq!(config.default_action(), Action::Deny);
    }

    #[test]
    fn full_config_parses() {
        let toml = r#"
            listen_addr      = "0.0.0.0:4433"
            server_name      = "vpn.example.org"
            cert_file        = "server.crt"
            key_file         = "server.key"
            ca_file          = "ca.crt"
            assign_cidr      = "10.0.0.0/24"
            advertise_routes = ["10.0.0.0/24", "192.168.0.0/16"]
            tun_name         = "qvpn0"
            mtu              = 1380
            log_level        = "debug"

            [acl]
            default_action = "allow"

            [[acl.group]]
            name    = "ops"
            members = ["client-abc12345"]

              [[acl.group.policy]]
              priority = 0
              prefix   = "192.168.0.0/16"
              action   = "deny"
        "#;

        let config = ServerConfig::from_toml(toml).unwrap();
        assert_eq!(config.advertise_routes.len(), 2);
        assert_eq!(config.mtu, 1380);
        assert_eq!(config.default_action(), Action::Allow);
        assert_eq!(config.acl.groups.len(), 1);
        assert_eq!(config.acl.groups[0].members, vec!["client-abc12345"]);
        assert_eq!(config.acl.groups[0].policies[0].priority, 0);
    }

    #[test]
    fn missing_required_field_fails() {
        let toml = r#"
            listen_addr = "0.0.0.0:4433"
            server_name = "vpn.example.org"
        "#;
        assert!(ServerConfig::from_toml(toml).is_err());
    }

    #[test]
    fn invalid_mtu_fails() {
        let toml = format!("{MINIMAL}\nmtu = 100\n");
        assert!(ServerConfig::from_toml(&toml).is_err());

        let toml = format!("{MINIMAL}\nmtu = 20000\n");
        assert!(ServerConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn long_tun_name_fails() {
        let toml = format!("{MINIMAL}\ntun_name = \"a-very-long-interface-name\"\n");
        assert!(ServerConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn unknown_action_fails() {
        let toml = format!("{MINIMAL}\n[acl]\ndefault_action = \"maybe\"\n");
        assert!(ServerConfig::from_toml(&toml).is_err());
    }

    #[test]
    fn invalid_cidr_fails() {
        let toml = r#"
            listen_addr = "0.0.0.0:4433"
            server_name = "vpn.example.org"
            cert_file   = "server.crt"
            key_file    = "server.key"
            ca_file     = "ca.crt"
            assign_cidr = "not-a-prefix"
        "#;
        assert!(ServerConfig::from_toml(toml).is_err());
    }
}
