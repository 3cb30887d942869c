//! Environment driven configuration.
//!
//! Both sides read the usual `EPICS_CA_*` / `EPICS_CAS_*` variables, clamped to
//! the same minimums EPICS base applies. Every value can be overridden after
//! construction; tests do this to run on ephemeral ports with short timers.

use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::warn;

use crate::utils::{interface_broadcast_ips, parse_address_list};

/// Default port for name searches and server circuits
pub const DEFAULT_SERVER_PORT: u16 = 5064;
/// Default port for beacons
pub const DEFAULT_REPEATER_PORT: u16 = 5065;
/// Smallest value accepted for `EPICS_CA_MAX_ARRAY_BYTES`
pub const MINIMUM_MAX_ARRAY_BYTES: usize = 16384;

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparseable value for {name}: '{value}'");
            None
        }
    }
}

fn env_port(name: &str, default: u16) -> u16 {
    env_parse(name).unwrap_or(default).max(5000)
}

fn env_seconds(name: &str, default: f64, minimum: f64) -> Duration {
    Duration::from_secs_f64(env_parse(name).unwrap_or(default).max(minimum))
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| !v.trim().eq_ignore_ascii_case("no"))
        .unwrap_or(default)
}

fn env_max_array_bytes() -> usize {
    env_parse("EPICS_CA_MAX_ARRAY_BYTES")
        .unwrap_or(MINIMUM_MAX_ARRAY_BYTES)
        .max(MINIMUM_MAX_ARRAY_BYTES)
}

/// How the server event dispatcher behaves when a client's send queue backs up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Above the high-water mark, replace the queued update for the same
    /// subscription with the newer one
    #[default]
    LatestValueOnly,
    /// Block the publisher up to the given time for the queue to drain, then
    /// behave as [`BackpressurePolicy::LatestValueOnly`]
    BlockWithTimeout(Duration),
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid backpressure policy '{0}': expected 'latest' or 'block:<ms>'")]
pub struct InvalidPolicy(String);

impl FromStr for BackpressurePolicy {
    type Err = InvalidPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim().to_ascii_lowercase();
        if value == "latest" {
            return Ok(BackpressurePolicy::LatestValueOnly);
        }
        value
            .strip_prefix("block:")
            .and_then(|ms| ms.parse::<u64>().ok())
            .map(|ms| BackpressurePolicy::BlockWithTimeout(Duration::from_millis(ms)))
            .ok_or_else(|| InvalidPolicy(s.to_string()))
    }
}

impl fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackpressurePolicy::LatestValueOnly => write!(f, "latest"),
            BackpressurePolicy::BlockWithTimeout(d) => write!(f, "block:{}", d.as_millis()),
        }
    }
}

/// Settings for a [`crate::client::ClientContext`]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Where search datagrams are sent
    pub search_addresses: Vec<SocketAddr>,
    /// Port to listen for beacons on. `None` disables beacon watching.
    pub beacon_port: Option<u16>,
    /// Idle time on a circuit before an echo is sent
    pub connection_timeout: Duration,
    pub beacon_period: Duration,
    /// The echo must be answered within this many beacon periods
    pub heartbeat_multiple: u32,
    pub connect_timeout: Duration,
    pub search_initial_interval: Duration,
    pub max_search_period: Duration,
    pub search_quota_interval: Duration,
    pub search_datagrams_per_interval: usize,
    pub max_datagram_size: usize,
    pub governor_period: Duration,
    pub governor_batch: usize,
    pub max_array_bytes: usize,
    /// Requests outstanding longer than this are logged
    pub stale_request_age: Duration,
    /// Reported to servers in CLIENT_NAME; defaults to the login name
    pub client_name: Option<String>,
    /// Reported to servers in HOST_NAME; defaults to the host name
    pub host_name: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            search_addresses: Vec::new(),
            beacon_port: Some(DEFAULT_REPEATER_PORT),
            connection_timeout: Duration::from_secs(30),
            beacon_period: Duration::from_secs(15),
            heartbeat_multiple: 2,
            connect_timeout: Duration::from_secs(10),
            search_initial_interval: Duration::from_millis(32),
            max_search_period: Duration::from_secs(300),
            search_quota_interval: Duration::from_millis(100),
            search_datagrams_per_interval: 8,
            max_datagram_size: 1024,
            governor_period: Duration::from_secs(10),
            governor_batch: 100,
            max_array_bytes: MINIMUM_MAX_ARRAY_BYTES,
            stale_request_age: Duration::from_secs(60),
            client_name: None,
            host_name: None,
        }
    }
}

impl ClientConfig {
    /// Read the `EPICS_CA_*` environment
    pub fn from_env() -> Self {
        let server_port = env_port("EPICS_CA_SERVER_PORT", DEFAULT_SERVER_PORT);
        let mut search_addresses = Vec::new();
        if env_flag("EPICS_CA_AUTO_ADDR_LIST", true) {
            search_addresses.extend(
                interface_broadcast_ips()
                    .into_iter()
                    .map(|ip| SocketAddr::new(ip, server_port)),
            );
        }
        if let Ok(list) = env::var("EPICS_CA_ADDR_LIST") {
            search_addresses.extend(parse_address_list(&list, server_port));
        }
        if search_addresses.is_empty() {
            warn!("Empty search address list: no names will be resolved");
        }
        ClientConfig {
            search_addresses,
            beacon_port: Some(env_port("EPICS_CA_REPEATER_PORT", DEFAULT_REPEATER_PORT)),
            connection_timeout: env_seconds("EPICS_CA_CONN_TMO", 30.0, 0.1),
            beacon_period: env_seconds("EPICS_CA_BEACON_PERIOD", 15.0, 0.1),
            max_search_period: env_seconds("EPICS_CA_MAX_SEARCH_PERIOD", 300.0, 60.0),
            max_array_bytes: env_max_array_bytes(),
            ..Default::default()
        }
    }

    pub fn search_addresses(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.search_addresses = addresses;
        self
    }

    pub fn beacon_port(mut self, port: Option<u16>) -> Self {
        self.beacon_port = port;
        self
    }

    pub fn governor(mut self, period: Duration, batch: usize) -> Self {
        self.governor_period = period;
        self.governor_batch = batch.max(1);
        self
    }

    pub fn heartbeat(mut self, idle: Duration, beacon_period: Duration) -> Self {
        self.connection_timeout = idle;
        self.beacon_period = beacon_period;
        self
    }

    /// Time allowed for an echo reply once one has been sent
    pub fn heartbeat_timeout(&self) -> Duration {
        self.beacon_period * self.heartbeat_multiple
    }
}

/// Settings for a [`crate::ServerBuilder`]
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port for circuits. Zero picks any free port.
    pub connection_port: u16,
    /// UDP port for name searches. Zero picks any free port.
    pub search_port: u16,
    pub beacon_port: u16,
    /// Beacon destinations. Empty means interface broadcast addresses.
    pub beacon_addresses: Vec<SocketAddr>,
    pub beacons: bool,
    pub beacon_period: Duration,
    pub backpressure: BackpressurePolicy,
    /// Queue depth above which event updates are coalesced
    pub queue_high_water: usize,
    pub max_array_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            connection_port: DEFAULT_SERVER_PORT,
            search_port: DEFAULT_SERVER_PORT,
            beacon_port: DEFAULT_REPEATER_PORT,
            beacon_addresses: Vec::new(),
            beacons: true,
            beacon_period: Duration::from_secs(15),
            backpressure: BackpressurePolicy::default(),
            queue_high_water: 64,
            max_array_bytes: MINIMUM_MAX_ARRAY_BYTES,
        }
    }
}

impl ServerConfig {
    /// Read the `EPICS_CA_*` and `EPICS_CAS_*` environment
    pub fn from_env() -> Self {
        let port = env_port("EPICS_CA_SERVER_PORT", DEFAULT_SERVER_PORT);
        let beacon_port = env_port("EPICS_CA_REPEATER_PORT", DEFAULT_REPEATER_PORT);
        let backpressure = env::var("EPICS_CAS_EVENT_BACKPRESSURE")
            .ok()
            .and_then(|v| match v.parse() {
                Ok(policy) => Some(policy),
                Err(e) => {
                    warn!("{e}");
                    None
                }
            })
            .unwrap_or_default();
        ServerConfig {
            connection_port: port,
            search_port: port,
            beacon_port,
            beacon_addresses: env::var("EPICS_CAS_BEACON_ADDR_LIST")
                .map(|list| parse_address_list(&list, beacon_port))
                .unwrap_or_default(),
            beacon_period: env_seconds("EPICS_CA_BEACON_PERIOD", 15.0, 0.1),
            backpressure,
            max_array_bytes: env_max_array_bytes(),
            ..Default::default()
        }
    }

    /// Where beacons are sent
    pub fn resolved_beacon_addresses(&self) -> Vec<SocketAddr> {
        if self.beacon_addresses.is_empty() {
            interface_broadcast_ips()
                .into_iter()
                .map(|ip| SocketAddr::new(ip, self.beacon_port))
                .collect()
        } else {
            self.beacon_addresses.clone()
        }
    }
}
