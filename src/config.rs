use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Lowest accepted re-resolution cadence. Resolving involves DNS and
/// possibly traceroute, so anything faster than this is abusive.
pub const SMALLEST_RESOLVE_INTERVAL: Duration = Duration::from_secs(60);
/// Lowest accepted probe cadence.
pub const SMALLEST_PING_INTERVAL: Duration = Duration::from_millis(10);

const DEFAULT_RESOLVE_INTERVAL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

/// A single monitored destination, before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// DNS name, monitored at every address it currently resolves to.
    Host { name: String, host: String },
    /// Literal address, monitored as-is.
    Static { name: String, addr: IpAddr },
    /// The `hop`-th hop on the traceroute path toward `dest`. Zero is this
    /// host, one the first router, and so on. Negative values index from
    /// the last hop before `dest` (-1 is the hop right in front of it).
    Hop { name: String, dest: IpAddr, hop: i32 },
}

impl Target {
    /// Stable human readable name, carried into metrics alongside the
    /// (possibly changing) resolved addresses.
    pub fn metric_name(&self) -> &str {
        match self {
            Target::Host { name, .. }
            | Target::Static { name, .. }
            | Target::Hop { name, .. } => name,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Host { name, host } => write!(f, "host({name}: {host})"),
            Target::Static { name, addr } => write!(f, "static({name}: {addr})"),
            Target::Hop { name, dest, hop } => write!(f, "hop({name}: {hop} towards {dest})"),
        }
    }
}

/// Runtime configuration. Arrives as a complete snapshot; a new snapshot
/// fully replaces the previous target set and intervals.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Destinations to monitor for latency.
    pub targets: Vec<Target>,

    /// How often targets are re-resolved to addresses. Smaller values
    /// track network changes more closely but create more load.
    pub resolve_interval: Duration,

    /// Delay between latency probes to each address.
    pub ping_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            resolve_interval: DEFAULT_RESOLVE_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

impl Config {
    /// Read and validate a config file, clamping intervals to their floors.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut cfg = Self::parse(&raw)?;
        cfg.clamp_floors();
        Ok(cfg)
    }

    /// Parse the JSON representation. Unknown fields are rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let file: FileConfig = serde_json::from_str(raw).context("invalid config json")?;
        file.try_into()
    }

    /// Re-encode into the on-disk JSON shape.
    pub fn to_json(&self) -> Result<String> {
        let file = FileConfig::from(self);
        serde_json::to_string_pretty(&file).context("failed to encode config")
    }

    /// Raise intervals to their minimums, warning about any adjustment.
    pub fn clamp_floors(&mut self) {
        if self.resolve_interval < SMALLEST_RESOLVE_INTERVAL {
            warn!(
                configured = ?self.resolve_interval,
                minimum = ?SMALLEST_RESOLVE_INTERVAL,
                "resolve interval below minimum, clamping"
            );
            self.resolve_interval = SMALLEST_RESOLVE_INTERVAL;
        }
        if self.ping_interval < SMALLEST_PING_INTERVAL {
            warn!(
                configured = ?self.ping_interval,
                minimum = ?SMALLEST_PING_INTERVAL,
                "ping interval below minimum, clamping"
            );
            self.ping_interval = SMALLEST_PING_INTERVAL;
        }
    }
}

/// On-disk JSON shape. Kept separate from [`Config`] because targets are
/// grouped by kind in the file rather than carried as a tagged list.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    hops: Vec<FileHop>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "static")]
    static_ips: Vec<FileStatic>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    hosts: Vec<FileHost>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "resolve-interval"
    )]
    resolve_interval: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "ping-interval"
    )]
    ping_interval: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileHop {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    destination: String,
    hop: i32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileStatic {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    ip: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileHost {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    name: String,
    host: String,
}

impl TryFrom<FileConfig> for Config {
    type Error = anyhow::Error;

    fn try_from(file: FileConfig) -> Result<Self> {
        let mut cfg = Config::default();

        if let Some(raw) = &file.resolve_interval {
            cfg.resolve_interval = humantime::parse_duration(raw)
                .with_context(|| format!("failed to parse 'resolve-interval': {raw:?}"))?;
        }
        if let Some(raw) = &file.ping_interval {
            cfg.ping_interval = humantime::parse_duration(raw)
                .with_context(|| format!("failed to parse 'ping-interval': {raw:?}"))?;
        }

        for (index, hop) in file.hops.iter().enumerate() {
            let dest: IpAddr = hop
                .destination
                .parse()
                .with_context(|| format!("failed to parse 'hops[{index}]' destination"))?;
            if hop.name.is_empty() {
                // There is no useful name to synthesize out of (dest, hop).
                bail!(
                    "hops[{index}] missing 'name': destination {dest}, hop {}",
                    hop.hop
                );
            }
            cfg.targets.push(Target::Hop {
                name: hop.name.clone(),
                dest,
                hop: hop.hop,
            });
        }

        for (index, st) in file.static_ips.iter().enumerate() {
            let addr: IpAddr = st
                .ip
                .parse()
                .with_context(|| format!("failed to parse 'static[{index}]'"))?;
            let name = if st.name.is_empty() {
                format!("static-ip:{addr}")
            } else {
                st.name.clone()
            };
            cfg.targets.push(Target::Static { name, addr });
        }

        for host in &file.hosts {
            let name = if host.name.is_empty() {
                format!("host:{}", host.host)
            } else {
                host.name.clone()
            };
            cfg.targets.push(Target::Host {
                name,
                host: host.host.clone(),
            });
        }

        Ok(cfg)
    }
}

impl From<&Config> for FileConfig {
    fn from(cfg: &Config) -> Self {
        let mut file = FileConfig {
            resolve_interval: Some(humantime::format_duration(cfg.resolve_interval).to_string()),
            ping_interval: Some(humantime::format_duration(cfg.ping_interval).to_string()),
            ..FileConfig::default()
        };
        for target in &cfg.targets {
            match target {
                Target::Hop { name, dest, hop } => file.hops.push(FileHop {
                    name: name.clone(),
                    destination: dest.to_string(),
                    hop: *hop,
                }),
                Target::Static { name, addr } => file.static_ips.push(FileStatic {
                    name: name.clone(),
                    ip: addr.to_string(),
                }),
                Target::Host { name, host } => file.hosts.push(FileHost {
                    name: name.clone(),
                    host: host.clone(),
                }),
            }
        }
        file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_object_uses_defaults() {
        let cfg = Config::parse("{}").unwrap();
        assert!(cfg.targets.is_empty());
        assert_eq!(cfg.resolve_interval, DEFAULT_RESOLVE_INTERVAL);
        assert_eq!(cfg.ping_interval, DEFAULT_PING_INTERVAL);
    }

    #[test]
    fn parse_rejects_bad_input() {
        let cases = [
            // bad hop destination
            r#"{"hops":[{"name":"x","destination":"abc","hop":3}]}"#,
            // hop without a name
            r#"{"hops":[{"destination":"8.8.8.8","hop":3}]}"#,
            // static entry with the wrong shape
            r#"{"static":["abc"]}"#,
            // bad durations
            r#"{"resolve-interval":"abc"}"#,
            r#"{"ping-interval":"abc"}"#,
            // truncated json
            r#"{""#,
            // unknown field
            r#"{"abc":1}"#,
        ];
        for case in cases {
            assert!(Config::parse(case).is_err(), "expected error for {case}");
        }
    }

    #[test]
    fn parse_everything() {
        let cfg = Config::parse(
            r#"{
  "hops":  [ {"name":"isp", "destination":"8.8.8.8", "hop":2} ],
  "static":[ {"ip":"192.168.1.1"} ],
  "hosts": [ {"host":"pkg.go.dev"}, {"name":"dns", "host":"dns.google"} ],
  "resolve-interval":"10m",
  "ping-interval":"5s"
}"#,
        )
        .unwrap();

        assert_eq!(cfg.resolve_interval, Duration::from_secs(600));
        assert_eq!(cfg.ping_interval, Duration::from_secs(5));
        assert_eq!(
            cfg.targets,
            vec![
                Target::Hop {
                    name: "isp".into(),
                    dest: "8.8.8.8".parse().unwrap(),
                    hop: 2,
                },
                Target::Static {
                    name: "static-ip:192.168.1.1".into(),
                    addr: "192.168.1.1".parse().unwrap(),
                },
                Target::Host {
                    name: "host:pkg.go.dev".into(),
                    host: "pkg.go.dev".into(),
                },
                Target::Host {
                    name: "dns".into(),
                    host: "dns.google".into(),
                },
            ]
        );
    }

    #[test]
    fn synthesized_names_are_stable() {
        let cfg = Config::parse(r#"{"static":[{"ip":"10.0.0.1"}]}"#).unwrap();
        assert_eq!(cfg.targets[0].metric_name(), "static-ip:10.0.0.1");
    }

    #[test]
    fn clamp_raises_small_intervals() {
        let mut cfg = Config {
            resolve_interval: Duration::from_secs(1),
            ping_interval: Duration::from_millis(1),
            ..Config::default()
        };
        cfg.clamp_floors();
        assert_eq!(cfg.resolve_interval, SMALLEST_RESOLVE_INTERVAL);
        assert_eq!(cfg.ping_interval, SMALLEST_PING_INTERVAL);
    }

    #[test]
    fn clamp_keeps_valid_intervals() {
        let mut cfg = Config::default();
        cfg.clamp_floors();
        assert_eq!(cfg.resolve_interval, DEFAULT_RESOLVE_INTERVAL);
        assert_eq!(cfg.ping_interval, DEFAULT_PING_INTERVAL);
    }

    #[test]
    fn json_round_trip_is_idempotent() {
        let original = Config::parse(
            r#"{
  "hops":  [ {"name":"isp", "destination":"8.8.4.4", "hop":-1} ],
  "static":[ {"name":"router", "ip":"192.168.1.1"} ],
  "hosts": [ {"name":"dns", "host":"dns.google"} ],
  "resolve-interval":"15m",
  "ping-interval":"1s"
}"#,
        )
        .unwrap();

        let encoded = original.to_json().unwrap();
        let reparsed = Config::parse(&encoded).unwrap();
        assert_eq!(original, reparsed);
    }
}
