//! Node configuration
//!
//! One `NodeConfig` describes a board: its name and role, the wire format
//! of the deployment, addressing, dedup memory and radio timings. Presets
//! reproduce the demo deployments; everything can be overridden from JSON.
//! Durations are stored in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ble::transport::{AdvertiseParams, ScanFilter, ScanParams};
use crate::codec::ad::{frame_len, ADV_DATA_MAX};
use crate::codec::names::NAME_PREFIX;
use crate::codec::record::record_len;
use crate::codec::{PayloadFormat, ScalarWidth};
use crate::mesh::addressing::{Addressing, Bucketing};
use crate::mesh::relay::{NodeRole, RelaySettings};
use crate::mesh::scheduler::{CycleOrder, SchedulerConfig};
use crate::mesh::seen::{IdentityPolicy, SeenSet};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Named starting points for a node configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Broadcasts its distance and lists the peers it hears.
    Peer,
    /// Raw 2-byte distance sensor, advertise first.
    Sensor,
    /// Forwards 1-byte presence codes from upstream relays.
    Relay,
    /// Buckets sensor distances into presence codes.
    TerminalRelay,
    /// Lights an indicator for presence codes from a given relay.
    Consumer,
    /// Structured-record endpoint addressing a partner node.
    MeshEndpoint,
    /// Structured-record relay with dedup.
    MeshRelay,
}

impl Preset {
    pub const ALL: [Preset; 7] = [
        Preset::Peer,
        Preset::Sensor,
        Preset::Relay,
        Preset::TerminalRelay,
        Preset::Consumer,
        Preset::MeshEndpoint,
        Preset::MeshRelay,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Preset::Peer => "peer",
            Preset::Sensor => "sensor",
            Preset::Relay => "relay",
            Preset::TerminalRelay => "terminal_relay",
            Preset::Consumer => "consumer",
            Preset::MeshEndpoint => "mesh_endpoint",
            Preset::MeshRelay => "mesh_relay",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Broadcast name; also the node id.
    pub name: String,
    pub role: NodeRole,
    /// Format of received frames and of the node's own broadcasts.
    pub format: PayloadFormat,
    /// Format used when re-broadcasting; defaults to `format`.
    pub forward_format: Option<PayloadFormat>,
    /// Only senders whose name starts with this are listened to.
    pub accept_prefix: Option<String>,
    /// Consumer the node addresses its own messages to.
    pub destination: Option<String>,
    /// Relays re-address forwarded messages to this consumer.
    pub forward_to: Option<String>,
    pub bucketing: Option<Bucketing>,
    pub identity: IdentityPolicy,
    pub max_hops: Option<u8>,
    pub seen_capacity: usize,
    pub seen_ttl_ms: Option<u64>,
    pub cycle_order: CycleOrder,
    pub scan_window_ms: u64,
    pub scan_interval_us: u32,
    pub scan_window_us: u32,
    pub active_scan: bool,
    pub advertise_interval_ms: u64,
    pub advertise_timeout_ms: u64,
    pub post_scan_pause_ms: u64,
    pub post_advertise_pause_ms: u64,
    pub peer_capacity: usize,
    /// Peers shown on the screen.
    pub peer_view: usize,
    pub peer_stale_ms: Option<u64>,
    pub sensor_period_ms: u64,
    pub energy_period_ms: u64,
    pub display_refresh_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: NAME_PREFIX.to_string(),
            role: NodeRole::Endpoint,
            format: PayloadFormat::raw(ScalarWidth::I16),
            forward_format: None,
            accept_prefix: Some(NAME_PREFIX.to_string()),
            destination: None,
            forward_to: None,
            bucketing: None,
            identity: IdentityPolicy::default(),
            max_hops: None,
            seen_capacity: 256,
            seen_ttl_ms: Some(30_000),
            cycle_order: CycleOrder::ScanThenAdvertise,
            scan_window_ms: 200,
            scan_interval_us: 30_000,
            scan_window_us: 30_000,
            active_scan: true,
            advertise_interval_ms: 150,
            advertise_timeout_ms: 200,
            post_scan_pause_ms: 250,
            post_advertise_pause_ms: 200,
            peer_capacity: 32,
            peer_view: 4,
            peer_stale_ms: Some(10_000),
            sensor_period_ms: 1_000,
            energy_period_ms: 500,
            display_refresh_ms: 200,
        }
    }
}

impl NodeConfig {
    /// Start from a preset under the given name.
    pub fn preset(preset: Preset, name: &str) -> Self {
        let base = Self {
            name: name.to_string(),
            ..Self::default()
        };
        match preset {
            Preset::Peer => Self {
                bucketing: Some(Bucketing::default()),
                ..base
            },
            Preset::Sensor => Self {
                cycle_order: CycleOrder::AdvertiseThenScan,
                bucketing: Some(Bucketing::default()),
                accept_prefix: None,
                advertise_timeout_ms: 1_000,
                ..base
            },
            Preset::Relay => Self {
                role: NodeRole::Relay,
                format: PayloadFormat::raw(ScalarWidth::I8),
                accept_prefix: Some(format!("{}-R", NAME_PREFIX)),
                // Raw frames carry no sequence number: forget after about a cycle.
                seen_ttl_ms: Some(500),
                ..base
            },
            Preset::TerminalRelay => Self {
                role: NodeRole::TerminalRelay,
                forward_format: Some(PayloadFormat::raw(ScalarWidth::I8)),
                accept_prefix: Some(format!("{}-S", NAME_PREFIX)),
                bucketing: Some(Bucketing::default()),
                seen_ttl_ms: Some(500),
                ..base
            },
            Preset::Consumer => Self {
                format: PayloadFormat::raw(ScalarWidth::I8),
                accept_prefix: Some(format!("{}-R2", NAME_PREFIX)),
                seen_ttl_ms: Some(500),
                ..base
            },
            Preset::MeshEndpoint => Self {
                format: PayloadFormat::obfuscated(),
                cycle_order: CycleOrder::AdvertiseThenScan,
                accept_prefix: Some(format!("{}-R", NAME_PREFIX)),
                bucketing: Some(Bucketing::new(vec![300])),
                advertise_timeout_ms: 500,
                scan_window_ms: 500,
                post_scan_pause_ms: 500,
                post_advertise_pause_ms: 0,
                ..base
            },
            Preset::MeshRelay => Self {
                role: NodeRole::Relay,
                format: PayloadFormat::obfuscated(),
                scan_window_ms: 800,
                advertise_timeout_ms: 500,
                post_scan_pause_ms: 0,
                ..base
            },
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_json_pretty()?)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("name is empty".into()));
        }
        for format in [Some(self.format), self.forward_format].into_iter().flatten() {
            self.check_frame_budget(format)?;
        }
        if let Some(bucketing) = &self.bucketing {
            if !bucketing.is_valid() {
                return Err(ConfigError::Invalid(format!(
                    "bucketing thresholds must be non-empty and strictly ascending: {:?}",
                    bucketing.thresholds
                )));
            }
        }
        if self.role == NodeRole::TerminalRelay {
            let Some(bucketing) = &self.bucketing else {
                return Err(ConfigError::Invalid("terminal relay needs bucketing".into()));
            };
            let width = self.forward_format().width();
            if i32::from(bucketing.max_code()) > width.max() {
                return Err(ConfigError::Invalid(format!(
                    "{} buckets do not fit the {}-byte forward payload",
                    bucketing.bucket_count(),
                    width.bytes()
                )));
            }
        }
        if self.seen_capacity == 0 {
            return Err(ConfigError::Invalid("seen_capacity must be positive".into()));
        }
        if self.scan_window_ms == 0 {
            return Err(ConfigError::Invalid("scan_window_ms must be positive".into()));
        }
        if self.advertise_interval_ms == 0 || self.advertise_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "advertise interval and timeout must be positive".into(),
            ));
        }
        if self.scan_window_us > self.scan_interval_us {
            return Err(ConfigError::Invalid(format!(
                "scan window {} us exceeds scan interval {} us",
                self.scan_window_us, self.scan_interval_us
            )));
        }
        Ok(())
    }

    /// The largest frame this node can emit in `format` must fit.
    fn check_frame_budget(&self, format: PayloadFormat) -> Result<(), ConfigError> {
        let opaque = match format {
            PayloadFormat::RawScalar { width } => width.bytes(),
            PayloadFormat::Obfuscated { width, id_len, .. } => record_len(id_len, id_len, width),
        };
        let size = frame_len(self.name.len(), opaque);
        if size > ADV_DATA_MAX {
            return Err(ConfigError::Invalid(format!(
                "name '{}' leaves no room: frames up to {} bytes, limit {}",
                self.name, size, ADV_DATA_MAX
            )));
        }
        Ok(())
    }

    pub fn forward_format(&self) -> PayloadFormat {
        self.forward_format.unwrap_or(self.format)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            scan: ScanParams {
                duration: Duration::from_millis(self.scan_window_ms),
                interval_us: self.scan_interval_us,
                window_us: self.scan_window_us,
                active: self.active_scan,
                filter: ScanFilter {
                    name_prefix: self.accept_prefix.clone(),
                    exclude_name: Some(self.name.clone()),
                },
            },
            advertise: AdvertiseParams {
                interval: Duration::from_millis(self.advertise_interval_ms),
                timeout: Duration::from_millis(self.advertise_timeout_ms),
                connectable: false,
            },
            order: self.cycle_order,
            post_scan_pause: Duration::from_millis(self.post_scan_pause_ms),
            post_advertise_pause: Duration::from_millis(self.post_advertise_pause_ms),
        }
    }

    pub fn addressing(&self) -> Addressing {
        Addressing::new(&self.name, self.accept_prefix.clone(), self.format.id_len())
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            role: self.role,
            identity: self.identity,
            max_hops: self.max_hops,
            forward_to: self.forward_to.clone(),
            bucketing: self.bucketing.clone(),
        }
    }

    pub fn seen_set(&self) -> SeenSet {
        SeenSet::new(self.seen_capacity, self.seen_ttl_ms.map(Duration::from_millis))
    }

    pub fn peer_stale_after(&self) -> Option<Duration> {
        self.peer_stale_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_presets_are_valid() {
        for preset in Preset::ALL {
            let config = NodeConfig::preset(preset, "STeaMi-X1");
            config
                .validate()
                .unwrap_or_else(|e| panic!("{} invalid: {}", preset.as_str(), e));
            assert_eq!(Preset::parse(preset.as_str()), Some(preset));
        }
        assert_eq!(Preset::parse("gateway"), None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = NodeConfig::from_json_str(
            r#"{ "name": "STeaMi-R1", "role": "relay", "max_hops": 3 }"#,
        )
        .unwrap();
        assert_eq!(config.name, "STeaMi-R1");
        assert_eq!(config.role, NodeRole::Relay);
        assert_eq!(config.max_hops, Some(3));
        assert_eq!(config.scan_window_ms, 200);
        assert_eq!(config.format, PayloadFormat::raw(ScalarWidth::I16));
    }

    #[test]
    fn test_format_from_json() {
        let config = NodeConfig::from_json_str(
            r#"{ "name": "STeaMi-R1",
                 "format": { "kind": "obfuscated", "key": 90, "width": "i16", "id_len": 4 } }"#,
        )
        .unwrap();
        assert_eq!(config.format.id_len(), Some(4));
        assert_eq!(config.addressing().wire_id(), "i-R1");
    }

    #[test]
    fn test_long_name_rejected_for_records() {
        let mut config = NodeConfig::preset(Preset::MeshRelay, "STeaMi-R1");
        assert!(config.validate().is_ok());
        config.name = "STeaMi-Relay-Kitchen".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_bucketing_rejected() {
        let mut config = NodeConfig::preset(Preset::TerminalRelay, "STeaMi-R");
        config.bucketing = Some(Bucketing::new(vec![600, 300]));
        assert!(config.validate().is_err());
        config.bucketing = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bucket_codes_must_fit_forward_width() {
        let mut config = NodeConfig::preset(Preset::TerminalRelay, "STeaMi-R");
        config.bucketing = Some(Bucketing::new((1..=127).map(|i| i * 10).collect()));
        assert!(config.validate().is_ok());

        config.bucketing = Some(Bucketing::new((1..=200).map(|i| i * 10).collect()));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.forward_format = Some(PayloadFormat::raw(ScalarWidth::I16));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_distance_presets_bucket_deliveries() {
        for preset in [Preset::Peer, Preset::Sensor, Preset::TerminalRelay] {
            let config = NodeConfig::preset(preset, "STeaMi-X1");
            assert_eq!(config.bucketing, Some(Bucketing::default()), "{}", preset.as_str());
        }
        // Relays and consumers carry presence codes already.
        for preset in [Preset::Relay, Preset::Consumer] {
            assert!(NodeConfig::preset(preset, "STeaMi-X1").bucketing.is_none());
        }
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            NodeConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            NodeConfig::from_json_str(r#"{ "role": "gateway" }"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.json");
        let config = NodeConfig::preset(Preset::TerminalRelay, "STeaMi-R");
        config.save(&path).unwrap();
        assert_eq!(NodeConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            NodeConfig::from_file(&dir.path().join("absent.json")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_scheduler_params() {
        let config = NodeConfig::preset(Preset::Sensor, "STeaMi-S");
        let scheduler = config.scheduler();
        assert_eq!(scheduler.order, CycleOrder::AdvertiseThenScan);
        assert_eq!(scheduler.advertise.timeout, Duration::from_millis(1_000));
        assert!(!scheduler.advertise.connectable);
        assert_eq!(scheduler.scan.filter.exclude_name.as_deref(), Some("STeaMi-S"));
    }
}
