//! Configuration file parser for the Deskgate relay
//!
//! Supports deskgate-relay.yml with listen settings, TLS material, the
//! trusted peer list and upstream policy. Command-line flags override file
//! values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use deskgate_shared::protocol::{DEFAULT_PROBE_TIMEOUT_SECS, DEFAULT_RELAY_PORT, DEFAULT_UPSTREAM_TIMEOUT_SECS};

use crate::origin::PeerRule;

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: IpAddr,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTPS material; plain HTTP when absent
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Peers allowed to call the guarded endpoints. Plain entries match the
    /// peer address exactly, `addr/prefix` entries match a network.
    #[serde(default)]
    pub trusted_peers: Vec<String>,

    /// Accept any upstream certificate
    #[serde(default)]
    pub skip_verify: bool,

    /// Timeout for forwarded upstream calls
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Default timeout for reachability probes
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

/// Certificate and key, both PEM
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn default_listen() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    DEFAULT_RELAY_PORT
}

fn default_upstream_timeout() -> u64 {
    DEFAULT_UPSTREAM_TIMEOUT_SECS
}

fn default_probe_timeout() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            tls: None,
            trusted_peers: Vec::new(),
            skip_verify: false,
            upstream_timeout_secs: default_upstream_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

/// Values given on the command line; `None` leaves the file value alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<IpAddr>,
    pub port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub trusted_peers: Vec<String>,
    pub skip_verify: bool,
    pub upstream_timeout_secs: Option<u64>,
}

impl RelayConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: RelayConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply command-line overrides on top of file values
    pub fn apply(mut self, o: Overrides) -> Self {
        if let Some(listen) = o.listen {
            self.listen = listen;
        }
        if let Some(port) = o.port {
            self.port = port;
        }
        match (o.tls_cert, o.tls_key) {
            (Some(cert), Some(key)) => self.tls = Some(TlsConfig { cert, key }),
            (None, None) => {}
            (cert, key) => {
                // Half a pair only replaces that half, validate() catches the rest.
                let current = self.tls.take();
                self.tls = Some(TlsConfig {
                    cert: cert.or_else(|| current.as_ref().map(|t| t.cert.clone())).unwrap_or_default(),
                    key: key.or_else(|| current.as_ref().map(|t| t.key.clone())).unwrap_or_default(),
                });
            }
        }
        if !o.trusted_peers.is_empty() {
            self.trusted_peers = o.trusted_peers;
        }
        if o.skip_verify {
            self.skip_verify = true;
        }
        if let Some(secs) = o.upstream_timeout_secs {
            self.upstream_timeout_secs = secs;
        }
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Invalid listen port 0");
        }
        if self.trusted_peers.is_empty() {
            anyhow::bail!("No trusted peers configured; every request would be refused");
        }
        for peer in &self.trusted_peers {
            PeerRule::parse(peer).map_err(|e| anyhow::anyhow!("{}", e))?;
        }
        if let Some(tls) = &self.tls {
            if tls.cert.as_os_str().is_empty() || tls.key.as_os_str().is_empty() {
                anyhow::bail!("TLS needs both a certificate and a key");
            }
        }
        if self.upstream_timeout_secs == 0 {
            anyhow::bail!("upstream_timeout_secs must be positive");
        }
        if self.probe_timeout_secs == 0 {
            anyhow::bail!("probe_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.port)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<PathBuf> {
        let candidates = [
            "deskgate-relay.yml",
            "deskgate-relay.yaml",
            ".deskgate-relay.yml",
            ".deskgate-relay.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
port: 9443
tls:
  cert: /etc/deskgate/cert.pem
  key: /etc/deskgate/key.pem
trusted_peers: ["10.0.0.5", "172.16.0.0/12"]
skip_verify: true
"#;
        let config: RelayConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 9443);
        assert_eq!(config.trusted_peers.len(), 2);
        assert!(config.skip_verify);
        assert_eq!(config.upstream_timeout_secs, 5);
        assert_eq!(config.probe_timeout_secs, 4);
        assert_eq!(config.tls.as_ref().unwrap().cert, PathBuf::from("/etc/deskgate/cert.pem"));
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config: RelayConfig = serde_yaml::from_str("trusted_peers: [\"127.0.0.1\"]").unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:9090".parse().unwrap());
        assert!(config.tls.is_none());
        assert!(!config.skip_verify);
        assert_eq!(config.upstream_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects() {
        assert!(RelayConfig::default().validate().is_err());

        let config = RelayConfig {
            trusted_peers: vec!["10.0.0.0/40".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RelayConfig {
            trusted_peers: vec!["10.0.0.1".into()],
            ..Default::default()
        }
        .apply(Overrides {
            tls_cert: Some("/tmp/cert.pem".into()),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_win() {
        let config = RelayConfig {
            trusted_peers: vec!["10.0.0.1".into()],
            ..Default::default()
        }
        .apply(Overrides {
            port: Some(8443),
            trusted_peers: vec!["192.168.1.10".into()],
            skip_verify: true,
            upstream_timeout_secs: Some(10),
            ..Default::default()
        });
        assert_eq!(config.port, 8443);
        assert_eq!(config.trusted_peers, vec!["192.168.1.10".to_string()]);
        assert!(config.skip_verify);
        assert_eq!(config.upstream_timeout_secs, 10);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port: 9191\ntrusted_peers:\n  - 127.0.0.1").unwrap();

        let config = RelayConfig::load(file.path()).unwrap();
        assert_eq!(config.port, 9191);
        assert_eq!(config.trusted_peers, vec!["127.0.0.1".to_string()]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = RelayConfig::load(Path::new("/nonexistent/deskgate-relay.yml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
