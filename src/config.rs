//! `GtmConfig`: the tunables from spec.md §6, loaded layered the way
//! `postgrustql`'s `ServerConfig` does (C8).

use crate::gxid::Gxid;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

fn default_n_max() -> usize {
    16384
}
fn default_control_interval() -> u32 {
    256
}
fn default_gid_max() -> usize {
    256
}
fn default_sid_max() -> usize {
    128
}
fn default_nodestring_max() -> usize {
    1024
}
fn default_synchronous_backup() -> bool {
    false
}
fn default_bind_addr() -> String {
    "127.0.0.1:6666".to_string()
}
fn default_data_dir() -> String {
    "./gtm-data".to_string()
}
/// How far below the eventual stop limit the warning threshold sits, in
/// GXIDs — the same order of magnitude as Postgres's default
/// `autovacuum_freeze_max_age` margin.
fn default_warn_margin() -> u32 {
    10_000_000
}
fn default_stop_margin() -> u32 {
    2_000_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct GtmConfig {
    #[serde(default = "default_n_max")]
    pub n_max: usize,
    #[serde(default = "default_control_interval")]
    pub control_interval: u32,
    #[serde(default = "default_gid_max")]
    pub gid_max: usize,
    #[serde(default = "default_sid_max")]
    pub sid_max: usize,
    #[serde(default = "default_nodestring_max")]
    pub nodestring_max: usize,
    #[serde(default = "default_synchronous_backup")]
    pub synchronous_backup: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub standby_addr: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// GXIDs before the stop limit where the allocator starts warning.
    #[serde(default = "default_warn_margin")]
    pub warn_margin: u32,
    /// GXIDs before wraparound where the allocator refuses to allocate.
    #[serde(default = "default_stop_margin")]
    pub stop_margin: u32,
}

impl Default for GtmConfig {
    fn default() -> Self {
        GtmConfig {
            n_max: default_n_max(),
            control_interval: default_control_interval(),
            gid_max: default_gid_max(),
            sid_max: default_sid_max(),
            nodestring_max: default_nodestring_max(),
            synchronous_backup: default_synchronous_backup(),
            bind_addr: default_bind_addr(),
            standby_addr: None,
            data_dir: default_data_dir(),
            warn_margin: default_warn_margin(),
            stop_margin: default_stop_margin(),
        }
    }
}

impl GtmConfig {
    /// Load configuration with priority: env > config file > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        let config_paths = ["/etc/gtmcore/gtmd.toml", "./gtmd.toml"];
        for path in &config_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                tracing::info!(path, "loaded config file");
                break;
            }
        }

        builder = builder.add_source(Environment::with_prefix("GTM").separator("_"));

        let config = builder.build()?;
        config.try_deserialize()
    }

    #[must_use]
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.bind_addr.parse()
    }

    /// Wraparound limits derived from `oldest_xid` and the configured
    /// margins (spec.md §6 leaves the derivation to autovacuum internals;
    /// this crate applies a fixed offset from whatever `oldest_xid` the
    /// caller currently tracks).
    #[must_use]
    pub fn wraparound_limits(&self, oldest_xid: Gxid) -> crate::allocator::WraparoundLimits {
        let stop_limit = Gxid::new(oldest_xid.raw().wrapping_add(u32::MAX - self.stop_margin));
        let warn_limit = Gxid::new(oldest_xid.raw().wrapping_add(u32::MAX - self.warn_margin));
        crate::allocator::WraparoundLimits {
            vac_limit: Some(oldest_xid),
            warn_limit,
            stop_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = GtmConfig::default();
        assert_eq!(cfg.n_max, 16384);
        assert_eq!(cfg.control_interval, 256);
        assert_eq!(cfg.gid_max, 256);
        assert_eq!(cfg.sid_max, 128);
        assert_eq!(cfg.nodestring_max, 1024);
        assert!(!cfg.synchronous_backup);
        assert_eq!(cfg.bind_addr, "127.0.0.1:6666");
        assert!(cfg.standby_addr.is_none());
    }

    #[test]
    fn bind_addr_parses() {
        let cfg = GtmConfig::default();
        assert!(cfg.bind_addr().is_ok());
    }
}
