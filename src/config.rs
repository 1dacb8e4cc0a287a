//! Run configuration
//!
//! [`ProxyConfig`] describes the proxy tpfw feeds (its TPROXY and DNS
//! listeners and the fake-IP block it answers for); [`HostConfig`] describes
//! how this host marks and exempts traffic. Both are immutable for a run and
//! handed by value to every chain builder.

use crate::core::error::{Error, Result};
use crate::utils::get_config_dir;
use crate::validators;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_TPROXY_PORT: u16 = 7893;
pub const DEFAULT_DNS_PORT: u16 = 1053;
pub const DEFAULT_FAKE_IP_RANGE: &str = "198.18.0.0/16";
pub const DEFAULT_TPROXY_MARK: &str = "0x29a/0xffffffff";
pub const DEFAULT_CLASH_USER: &str = "tpclash";
pub const DEFAULT_DIRECT_GROUP: &str = "tpdirect";

/// Values owned by the proxy process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_tproxy_port")]
    pub tproxy_port: u16,
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    #[serde(default = "default_fake_ip_range")]
    pub fake_ip_range: Ipv4Network,
}

/// Values owned by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// fwmark set by TPROXY, `value[/mask]`
    #[serde(default = "default_tproxy_mark")]
    pub tproxy_mark: String,
    /// DNS destinations whose port-53 traffic is redirected to the local resolver
    #[serde(default = "default_hijack_dns")]
    pub hijack_dns: Vec<String>,
    /// User the proxy runs as (uid or name)
    #[serde(default = "default_clash_user")]
    pub clash_user: String,
    /// Group whose traffic bypasses the proxy (gid or name)
    #[serde(default = "default_direct_group")]
    pub direct_group: String,
}

/// On-disk configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub host: HostConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tproxy_port: DEFAULT_TPROXY_PORT,
            dns_port: DEFAULT_DNS_PORT,
            fake_ip_range: default_fake_ip_range(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            tproxy_mark: default_tproxy_mark(),
            hijack_dns: default_hijack_dns(),
            clash_user: default_clash_user(),
            direct_group: default_direct_group(),
        }
    }
}

fn default_tproxy_port() -> u16 {
    DEFAULT_TPROXY_PORT
}

fn default_dns_port() -> u16 {
    DEFAULT_DNS_PORT
}

fn default_fake_ip_range() -> Ipv4Network {
    Ipv4Network::new(std::net::Ipv4Addr::new(198, 18, 0, 0), 16)
        .unwrap_or_else(|_| unreachable!("198.18.0.0/16 is a valid network"))
}

fn default_tproxy_mark() -> String {
    DEFAULT_TPROXY_MARK.to_string()
}

fn default_hijack_dns() -> Vec<String> {
    vec!["0.0.0.0/0".to_string()]
}

fn default_clash_user() -> String {
    DEFAULT_CLASH_USER.to_string()
}

fn default_direct_group() -> String {
    DEFAULT_DIRECT_GROUP.to_string()
}

impl AppConfig {
    /// Rejects values iptables would refuse (or misinterpret) before any rule is touched.
    ///
    /// Hijack targets are normalised to canonical CIDR text.
    pub fn validate(mut self) -> Result<Self> {
        validators::validate_port(self.proxy.tproxy_port)
            .map_err(|m| Error::validation("proxy.tproxy_port", m))?;
        validators::validate_port(self.proxy.dns_port)
            .map_err(|m| Error::validation("proxy.dns_port", m))?;
        validators::validate_fake_ip_range(self.proxy.fake_ip_range)
            .map_err(|m| Error::validation("proxy.fake_ip_range", m))?;

        self.host.tproxy_mark = validators::validate_fwmark(&self.host.tproxy_mark)
            .map_err(|m| Error::validation("host.tproxy_mark", m))?;
        self.host.clash_user = validators::validate_owner(&self.host.clash_user)
            .map_err(|m| Error::validation("host.clash_user", m))?;
        self.host.direct_group = validators::validate_owner(&self.host.direct_group)
            .map_err(|m| Error::validation("host.direct_group", m))?;

        if self.host.hijack_dns.is_empty() {
            return Err(Error::validation(
                "host.hijack_dns",
                "At least one DNS target is required (use 0.0.0.0/0 for all)",
            ));
        }
        self.host.hijack_dns = self
            .host
            .hijack_dns
            .iter()
            .map(|t| validators::validate_hijack_target(t).map(|n| n.to_string()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|m| Error::validation("host.hijack_dns", m))?;

        Ok(self)
    }
}

/// Default config location: `~/.config/tpfw/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads the config file at `path`; a missing file yields the defaults.
///
/// # Errors
///
/// Returns `Err` if the file exists but cannot be read or parsed.
pub async fn load_config(path: &Path) -> Result<AppConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => Ok(serde_json::from_str(&json)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No config at {}, using defaults", path.display());
            Ok(AppConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Saves the config to disk using an atomic write pattern.
/// 1. Writes to a temporary file in the target directory (mode 0o600).
/// 2. Atomically renames to the target path.
///
/// # Errors
///
/// Returns `Err` if the directory cannot be created or the write/rename fails.
pub async fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let target = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::Write;

        std::fs::create_dir_all(&dir)?;
        // tempfile creates the file with mode 0o600 on Unix
        let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&target).map_err(|e| Error::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("config writer panicked: {e}")))??;

    info!("Config saved to {}", path.display());
    Ok(())
}
