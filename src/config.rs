use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Configuration
// ============================================================================
//
// Every field has a default and can be overridden by a DC_* environment
// variable. Peers are given as `region=url` pairs:
//
//   DC_PEERS="us=http://us.internal:50071,ap=http://ap.internal:50071"
//
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplicationConfig {
    pub local_region: String,
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
    pub max_in_flight: usize,
    #[serde(with = "millis")]
    pub ack_timeout: Duration,
    pub max_pending_envelopes: usize,
    pub listen_addr: SocketAddr,
    /// Peer region -> gRPC endpoint.
    pub peers: BTreeMap<String, String>,
    pub scylla_uri: String,
    pub keyspace: String,
    pub metrics_port: u16,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            local_region: "local".to_string(),
            idle_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(10),
            max_in_flight: 32,
            ack_timeout: Duration::from_secs(10),
            max_pending_envelopes: 1024,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 50071)),
            peers: BTreeMap::new(),
            scylla_uri: "127.0.0.1:9042".to_string(),
            keyspace: "replication_ks".to_string(),
            metrics_port: 9090,
        }
    }
}

impl ReplicationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from defaults plus whatever `lookup` returns for each DC_* key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(region) = lookup("DC_LOCAL_REGION") {
            let region = region.trim().to_string();
            if region.is_empty() || region.contains(['@', ':', ',', '=']) {
                return Err(invalid("DC_LOCAL_REGION", &region, "not a region name"));
            }
            config.local_region = region;
        }
        if let Some(ms) = lookup("DC_IDLE_TIMEOUT_MS") {
            config.idle_timeout = parse_millis("DC_IDLE_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("DC_REQUEST_TIMEOUT_MS") {
            config.request_timeout = parse_millis("DC_REQUEST_TIMEOUT_MS", &ms)?;
        }
        if let Some(ms) = lookup("DC_ACK_TIMEOUT_MS") {
            config.ack_timeout = parse_millis("DC_ACK_TIMEOUT_MS", &ms)?;
        }
        if let Some(n) = lookup("DC_MAX_IN_FLIGHT") {
            config.max_in_flight = parse_positive("DC_MAX_IN_FLIGHT", &n)?;
        }
        if let Some(n) = lookup("DC_MAX_PENDING_ENVELOPES") {
            config.max_pending_envelopes = parse_positive("DC_MAX_PENDING_ENVELOPES", &n)?;
        }
        if let Some(addr) = lookup("DC_LISTEN_ADDR") {
            config.listen_addr = addr
                .trim()
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid("DC_LISTEN_ADDR", &addr, e))?;
        }
        if let Some(peers) = lookup("DC_PEERS") {
            config.peers = parse_peers(&peers)?;
        }
        if let Some(uri) = lookup("DC_SCYLLA_URI") {
            config.scylla_uri = uri;
        }
        if let Some(keyspace) = lookup("DC_KEYSPACE") {
            config.keyspace = keyspace;
        }
        if let Some(port) = lookup("DC_METRICS_PORT") {
            config.metrics_port = port
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| invalid("DC_METRICS_PORT", &port, e))?;
        }

        if config.peers.contains_key(&config.local_region) {
            return Err(invalid(
                "DC_PEERS",
                &config.local_region,
                "the local region cannot be its own peer",
            ));
        }
        Ok(config)
    }
}

fn invalid(key: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_positive(key, value).map(|ms| Duration::from_millis(ms as u64))
}

fn parse_positive(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err(invalid(key, value, "must be greater than zero")),
        Ok(n) => Ok(n),
        Err(e) => Err(invalid(key, value, e)),
    }
}

fn parse_peers(value: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((region, url)) if !region.trim().is_empty() && !url.trim().is_empty() => {
                Ok((region.trim().to_string(), url.trim().to_string()))
            }
            _ => Err(invalid("DC_PEERS", pair, "expected region=url")),
        })
        .collect()
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
