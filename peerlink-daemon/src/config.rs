//! Load config from file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use peerlink_core::topology::DEFAULT_PORT;
use peerlink_core::{Endpoint, Topology, TopologyError};
use serde::Deserialize;

/// Daemon configuration. File: --config <path>, ~/.config/peerlink/config.toml or /etc/peerlink/config.toml.
/// Env overrides: PEERLINK_LISTEN_PORT, PEERLINK_IDENTITY, PEERLINK_LOG_LEVEL.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// This node's endpoint name (default: $HOSTNAME or "localhost").
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// Cluster listen port (default 5665).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Tracing filter used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Zone this node belongs to (default: a zone named after the identity).
    #[serde(default)]
    pub local_zone: Option<String>,
    /// Seconds between dial attempts to disconnected endpoints.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneConfig {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub name: String,
    pub zone: String,
    /// Dial this endpoint when set; otherwise wait for it to connect.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_endpoint_port")]
    pub port: u16,
    /// Close connections silent for this long. 0 disables the check.
    #[serde(default)]
    pub keep_alive_secs: f64,
}

fn default_identity() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}
fn default_listen_host() -> String {
    "0.0.0.0".to_owned()
}
fn default_listen_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    "info".to_owned()
}
fn default_reconnect_interval() -> u64 {
    10
}
fn default_endpoint_port() -> u16 {
    DEFAULT_PORT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            log_level: default_log_level(),
            local_zone: None,
            reconnect_interval_secs: default_reconnect_interval(),
            zones: Vec::new(),
            endpoints: Vec::new(),
        }
    }
}

impl Config {
    pub fn local_zone(&self) -> &str {
        self.local_zone.as_deref().unwrap_or(&self.identity)
    }

    /// Apply environment overrides; `lookup` is `std::env::var` outside of tests.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(p) = lookup("PEERLINK_LISTEN_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.listen_port = p;
        }
        if let Some(id) = lookup("PEERLINK_IDENTITY").filter(|s| !s.is_empty()) {
            self.identity = id;
        }
        if let Some(level) = lookup("PEERLINK_LOG_LEVEL").filter(|s| !s.is_empty()) {
            self.log_level = level;
        }
    }

    /// Zones and endpoints from the file, plus the local zone and this node's own
    /// endpoint when they are not listed.
    pub fn build_topology(&self) -> Result<Topology, TopologyError> {
        let local_zone = self.local_zone().to_owned();
        let mut builder = Topology::builder(local_zone.clone());
        for zone in &self.zones {
            builder = builder.zone(zone.name.clone(), zone.parent.as_deref());
        }
        if !builder.has_zone(&local_zone) {
            builder = builder.zone(local_zone.clone(), None);
        }
        for ep in &self.endpoints {
            let mut endpoint =
                Endpoint::new(ep.name.clone(), ep.zone.clone()).with_keep_alive(ep.keep_alive_secs);
            if let Some(host) = &ep.host {
                endpoint = endpoint.with_address(host.clone(), ep.port);
            }
            builder = builder.endpoint(endpoint);
        }
        if !builder.has_endpoint(&self.identity) {
            builder = builder.endpoint(Endpoint::new(self.identity.clone(), local_zone));
        }
        builder.build()
    }
}

/// Load config: default, then config file (if present), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => parse_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => parse_file(&path)?,
            None => Config::default(),
        },
    };
    c.apply_overrides(|key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    parse(&s).with_context(|| format!("parsing config file {}", path.display()))
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
identity = "master1"
listen_port = 5775
local_zone = "master"

[[zones]]
name = "master"

[[zones]]
name = "sat"
parent = "master"

[[endpoints]]
name = "master1"
zone = "master"

[[endpoints]]
name = "sat1"
zone = "sat"
host = "10.0.0.5"
keep_alive_secs = 30
"#;

    #[test]
    fn parses_full_config() {
        let c = parse(SAMPLE).unwrap();
        assert_eq!(c.identity, "master1");
        assert_eq!(c.listen_port, 5775);
        assert_eq!(c.listen_host, "0.0.0.0");
        assert_eq!(c.local_zone(), "master");
        assert_eq!(c.zones.len(), 2);
        assert_eq!(c.endpoints[1].host.as_deref(), Some("10.0.0.5"));
        assert_eq!(c.endpoints[1].port, DEFAULT_PORT);
        assert_eq!(c.endpoints[1].keep_alive_secs, 30.0);
        assert_eq!(c.reconnect_interval_secs, 10);
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(parse("identity = \"a\"\nbogus = 1\n").is_err());
    }

    #[test]
    fn env_overrides_win() {
        let mut c = parse(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("PEERLINK_LISTEN_PORT", "6000"),
            ("PEERLINK_IDENTITY", "master9"),
            ("PEERLINK_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_port, 6000);
        assert_eq!(c.identity, "master9");
        assert_eq!(c.log_level, "debug");
    }

    #[test]
    fn bad_port_override_is_ignored() {
        let mut c = parse(SAMPLE).unwrap();
        c.apply_overrides(|k| (k == "PEERLINK_LISTEN_PORT").then(|| "99999".to_owned()));
        assert_eq!(c.listen_port, 5775);
    }

    #[test]
    fn topology_from_config() {
        let topo = parse(SAMPLE).unwrap().build_topology().unwrap();
        assert_eq!(topo.local_zone().name(), "master");
        let sat1 = topo.endpoint("sat1").unwrap();
        assert_eq!(sat1.host(), Some("10.0.0.5"));
        assert_eq!(sat1.keep_alive(), 30.0);
        assert!(topo.endpoint("master1").is_some());
    }

    #[test]
    fn minimal_config_gets_implicit_local_zone_and_self() {
        let c = parse("identity = \"solo\"\n").unwrap();
        let topo = c.build_topology().unwrap();
        assert_eq!(topo.local_zone().name(), "solo");
        assert_eq!(topo.endpoint("solo").unwrap().zone_name(), "solo");
    }

    #[test]
    fn endpoint_in_unknown_zone_is_an_error() {
        let c = parse(
            "identity = \"a\"\n[[endpoints]]\nname = \"b\"\nzone = \"nowhere\"\n",
        )
        .unwrap();
        assert!(c.build_topology().is_err());
    }
}
