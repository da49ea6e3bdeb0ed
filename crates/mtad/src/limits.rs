use runq::UnixTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Which address family connections are restricted to, when a profile
/// pins one.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AddrFamily {
    Inet4,
    Inet6,
}

impl AddrFamily {
    pub fn matches(&self, addr: IpAddr) -> bool {
        match self {
            Self::Inet4 => addr.is_ipv4(),
            Self::Inet6 => addr.is_ipv6(),
        }
    }
}

/// Admission limits for one destination domain. Profiles are looked up
/// by domain name with a fallback to the `default` entry.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LimitProfile {
    #[serde(default = "LimitProfile::default_maxconn_per_host")]
    pub maxconn_per_host: usize,

    #[serde(default = "LimitProfile::default_maxconn_per_domain")]
    pub maxconn_per_domain: usize,

    #[serde(default = "LimitProfile::default_maxconn_per_source")]
    pub maxconn_per_source: usize,

    #[serde(default = "LimitProfile::default_maxconn_per_connector")]
    pub maxconn_per_connector: usize,

    #[serde(default = "LimitProfile::default_maxconn_per_relay")]
    pub maxconn_per_relay: usize,

    #[serde(default = "LimitProfile::default_maxconn_per_route")]
    pub maxconn_per_route: usize,

    #[serde(default, with = "humantime_serde")]
    pub conndelay_host: Duration,

    #[serde(default, with = "humantime_serde")]
    pub conndelay_domain: Duration,

    #[serde(default, with = "humantime_serde")]
    pub conndelay_source: Duration,

    #[serde(default, with = "humantime_serde")]
    pub conndelay_connector: Duration,

    #[serde(default, with = "humantime_serde")]
    pub conndelay_relay: Duration,

    #[serde(default, with = "humantime_serde")]
    pub conndelay_route: Duration,

    #[serde(default, with = "humantime_serde")]
    pub discdelay_route: Duration,

    #[serde(default)]
    pub family: Option<AddrFamily>,
}

impl Default for LimitProfile {
    fn default() -> Self {
        Self {
            maxconn_per_host: Self::default_maxconn_per_host(),
            maxconn_per_domain: Self::default_maxconn_per_domain(),
            maxconn_per_source: Self::default_maxconn_per_source(),
            maxconn_per_connector: Self::default_maxconn_per_connector(),
            maxconn_per_relay: Self::default_maxconn_per_relay(),
            maxconn_per_route: Self::default_maxconn_per_route(),
            conndelay_host: Duration::ZERO,
            conndelay_domain: Duration::ZERO,
            conndelay_source: Duration::ZERO,
            conndelay_connector: Duration::ZERO,
            conndelay_relay: Duration::ZERO,
            conndelay_route: Duration::ZERO,
            discdelay_route: Duration::ZERO,
            family: None,
        }
    }
}

impl LimitProfile {
    fn default_maxconn_per_host() -> usize {
        10
    }

    fn default_maxconn_per_domain() -> usize {
        100
    }

    fn default_maxconn_per_source() -> usize {
        100
    }

    fn default_maxconn_per_connector() -> usize {
        20
    }

    fn default_maxconn_per_relay() -> usize {
        100
    }

    fn default_maxconn_per_route() -> usize {
        5
    }
}

/// Seconds view of a delay, for arithmetic against unix timestamps.
pub fn delay_secs(delay: Duration) -> UnixTime {
    delay.as_secs() as UnixTime
}

#[derive(Debug, thiserror::Error)]
pub enum LimitsError {
    #[error("reading limits file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing limits file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

pub struct LimitsTable {
    profiles: HashMap<String, Arc<LimitProfile>>,
}

impl Default for LimitsTable {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert("default".to_string(), Arc::new(LimitProfile::default()));
        Self { profiles }
    }
}

impl LimitsTable {
    /// Load per-domain profiles from a TOML table of tables. A `default`
    /// entry is synthesized when the file does not provide one.
    pub fn load(path: &Path) -> Result<Self, LimitsError> {
        let text = std::fs::read_to_string(path).map_err(|source| LimitsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let parsed: HashMap<String, LimitProfile> =
            toml::from_str(&text).map_err(|source| LimitsError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        let mut profiles: HashMap<String, Arc<LimitProfile>> = parsed
            .into_iter()
            .map(|(name, profile)| (name.to_ascii_lowercase(), Arc::new(profile)))
            .collect();
        profiles
            .entry("default".to_string())
            .or_insert_with(|| Arc::new(LimitProfile::default()));
        Ok(Self { profiles })
    }

    pub fn with_default(profile: LimitProfile) -> Self {
        let mut profiles = HashMap::new();
        profiles.insert("default".to_string(), Arc::new(profile));
        Self { profiles }
    }

    pub fn insert(&mut self, domain: &str, profile: LimitProfile) {
        self.profiles
            .insert(domain.to_ascii_lowercase(), Arc::new(profile));
    }

    pub fn lookup(&self, domain: &str) -> Arc<LimitProfile> {
        self.profiles
            .get(&domain.to_ascii_lowercase())
            .or_else(|| self.profiles.get("default"))
            .expect("limits table has a default profile")
            .clone()
    }
}
