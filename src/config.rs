use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TorusError};

/// Default location of the daemon configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/torus.toml";

/// Top-level daemon configuration, loaded from a TOML file.
///
/// The `[components]` table maps logical component names to URLs; a
/// component serves at its table entry and proxies resolve peers through
/// the same table. Components absent from the table bind an ephemeral
/// localhost port.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TorusConfig {
    pub components: HashMap<String, String>,
    pub tls: TlsConfig,
    pub auth: Option<AuthConfig>,
    pub system: SystemConfig,
    pub locator: LocatorConfig,
}

/// Paths to the daemon key/cert material (PEM format).
///
/// Both paths must be readable at startup when set; transport encryption
/// itself is handled outside the daemon.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub keyfile: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
}

/// HTTP basic-auth credentials required on the RPC listener when set.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub user: String,
    pub password: String,
}

/// Settings for the system component (partition graph + process groups).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Topology description file; required to start the system component.
    pub topology: Option<PathBuf>,
    /// Snapshot file for crash recovery.
    pub statefile: Option<PathBuf>,
    /// Job launcher program exec'd by process-group leaders.
    pub launcher: PathBuf,
    pub refresh_interval_secs: u64,
    pub reap_interval_secs: u64,
    pub save_interval_secs: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            topology: None,
            statefile: None,
            launcher: PathBuf::from("/usr/bin/mpirun"),
            refresh_interval_secs: 10,
            reap_interval_secs: 2,
            save_interval_secs: 30,
        }
    }
}

impl SystemConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }
}

/// Service-location expiry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryPolicy {
    /// Ping every registered location; unregister on any failure.
    Active,
    /// Unregister when the registration stamp exceeds the expiry window.
    Passive,
}

/// Settings for the service-location component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    pub policy: ExpiryPolicy,
    pub expiry_window_secs: u64,
    pub check_interval_secs: u64,
    pub statefile: Option<PathBuf>,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            policy: ExpiryPolicy::Passive,
            expiry_window_secs: 300,
            check_interval_secs: 30,
            statefile: None,
        }
    }
}

impl LocatorConfig {
    pub fn expiry_window(&self) -> Duration {
        Duration::from_secs(self.expiry_window_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl TorusConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TorusError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// The configured URL for a component, if any.
    pub fn component_url(&self, name: &str) -> Option<&str> {
        self.components.get(name).map(String::as_str)
    }

    /// The address a component should bind.
    ///
    /// Resolved from the `[components]` table entry; a component missing
    /// from the table binds an ephemeral localhost port.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the table entry cannot be resolved
    /// to a socket address.
    pub fn bind_addr(&self, name: &str) -> Result<SocketAddr> {
        let url = match self.component_url(name) {
            Some(url) => url,
            None => return Ok(SocketAddr::from(([127, 0, 0, 1], 0))),
        };
        let host_port = host_port(url).ok_or_else(|| {
            TorusError::Config(format!("component {} has unparseable url {:?}", name, url))
        })?;
        host_port
            .to_socket_addrs()
            .map_err(|e| TorusError::Config(format!("cannot resolve {}: {}", host_port, e)))?
            .next()
            .ok_or_else(|| TorusError::Config(format!("no address for {}", host_port)))
    }
}

/// Extract the `host:port` authority from a component URL.
fn host_port(url: &str) -> Option<&str> {
    let rest = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    let authority = rest.split('/').next()?;
    if authority.is_empty() {
        None
    } else {
        Some(authority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_config_default() {
        let cfg = SystemConfig::default();
        assert_eq!(cfg.launcher, PathBuf::from("/usr/bin/mpirun"));
        assert_eq!(cfg.refresh_interval(), Duration::from_secs(10));
        assert_eq!(cfg.reap_interval(), Duration::from_secs(2));
        assert!(cfg.topology.is_none());
        assert!(cfg.statefile.is_none());
    }

    #[test]
    fn locator_config_default() {
        let cfg = LocatorConfig::default();
        assert_eq!(cfg.policy, ExpiryPolicy::Passive);
        assert_eq!(cfg.expiry_window(), Duration::from_secs(300));
        assert_eq!(cfg.check_interval(), Duration::from_secs(30));
    }

    #[test]
    fn parse_full_config() {
        let cfg: TorusConfig = toml::from_str(
            r#"
            [components]
            system = "https://sn1.example.com:8620"
            service-location = "https://sn1.example.com:8621"

            [tls]
            keyfile = "/etc/torus.key"
            certfile = "/etc/torus.cert"

            [auth]
            user = "torus"
            password = "hunter2"

            [system]
            topology = "/etc/torus-topology.toml"
            statefile = "/var/spool/torus/system.state"
            refresh_interval_secs = 5

            [locator]
            policy = "active"
            check_interval_secs = 10
            "#,
        )
        .expect("config parses");

        assert_eq!(
            cfg.component_url("system"),
            Some("https://sn1.example.com:8620")
        );
        assert_eq!(cfg.tls.keyfile, Some(PathBuf::from("/etc/torus.key")));
        assert_eq!(cfg.auth.as_ref().map(|a| a.user.as_str()), Some("torus"));
        assert_eq!(cfg.system.refresh_interval_secs, 5);
        // unset fields keep their defaults
        assert_eq!(cfg.system.save_interval_secs, 30);
        assert_eq!(cfg.locator.policy, ExpiryPolicy::Active);
        assert_eq!(cfg.locator.expiry_window_secs, 300);
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let cfg: TorusConfig = toml::from_str("").expect("empty config parses");
        assert!(cfg.components.is_empty());
        assert!(cfg.auth.is_none());
        assert_eq!(cfg.locator.policy, ExpiryPolicy::Passive);
    }

    #[test]
    fn bind_addr_unknown_component_is_ephemeral_localhost() {
        let cfg = TorusConfig::default();
        let addr = cfg.bind_addr("system").expect("bind addr");
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 0)));
    }

    #[test]
    fn bind_addr_from_table() {
        let cfg: TorusConfig = toml::from_str(
            r#"
            [components]
            system = "https://127.0.0.1:8620"
            "#,
        )
        .unwrap();
        let addr = cfg.bind_addr("system").expect("bind addr");
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 8620)));
    }

    #[test]
    fn host_port_extraction() {
        assert_eq!(host_port("https://h:1"), Some("h:1"));
        assert_eq!(host_port("http://h:1/path"), Some("h:1"));
        assert_eq!(host_port("h:1"), Some("h:1"));
        assert_eq!(host_port("https://"), None);
    }
}
