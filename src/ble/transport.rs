//! Radio trait definitions and core types
//!
//! Defines the half-duplex radio interface the channel scheduler owns.
//! The simulated air implements it; a hardware backend would too.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RadioError;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

/// A received advertising frame.
#[derive(Debug, Clone)]
pub struct RawAdvertisement {
    /// Complete local name carried by the frame, if any.
    pub name: Option<String>,
    /// Raw advertising data (all AD structures).
    pub data: Vec<u8>,
    /// Received signal strength indicator (if available).
    pub rssi: Option<i16>,
    /// Address of the advertising device.
    pub source_address: BleAddress,
}

/// Name-based admission filter applied while scanning.
///
/// Frames without a name are always rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Only names starting with this prefix are reported.
    pub name_prefix: Option<String>,
    /// Name that is never reported (usually our own).
    pub exclude_name: Option<String>,
}

impl ScanFilter {
    pub fn accepts(&self, name: Option<&str>) -> bool {
        let Some(name) = name else {
            return false;
        };
        if self.exclude_name.as_deref() == Some(name) {
            return false;
        }
        match &self.name_prefix {
            Some(prefix) => name.starts_with(prefix.as_str()),
            None => true,
        }
    }
}

/// Parameters of one scan window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanParams {
    /// Total duration of the window.
    pub duration: Duration,
    /// Controller scan interval in microseconds.
    pub interval_us: u32,
    /// Controller scan window in microseconds.
    pub window_us: u32,
    /// Active scanning (scan requests) enabled.
    pub active: bool,
    pub filter: ScanFilter,
}

/// Parameters of one advertise window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertiseParams {
    /// Interval between two emissions of the same frame.
    pub interval: Duration,
    /// Time after which the advertisement stops.
    pub timeout: Duration,
    /// Non-connectable advertisements always end by timeout.
    pub connectable: bool,
}

/// What the shared radio is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioState {
    Idle,
    Scanning,
    Advertising,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioState::Idle => write!(f, "idle"),
            RadioState::Scanning => write!(f, "scanning"),
            RadioState::Advertising => write!(f, "advertising"),
        }
    }
}

/// A time-bounded, lazily consumed sequence of advertisements.
#[async_trait]
pub trait ScanSession: Send {
    /// Next matching advertisement, or `None` once the window has elapsed.
    async fn next(&mut self) -> Option<RawAdvertisement>;
}

/// A single half-duplex radio: it listens or transmits, never both.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Open a scan window.
    async fn scan(&self, params: ScanParams) -> Result<Box<dyn ScanSession>, RadioError>;

    /// Broadcast `data` until the advertisement completes or times out.
    ///
    /// `Err(RadioError::AdvertiseTimeout)` is how a non-connectable
    /// advertisement ends.
    async fn advertise(&self, data: &[u8], params: AdvertiseParams) -> Result<(), RadioError>;

    /// This radio's address.
    fn address(&self) -> &BleAddress;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ble_address_equality() {
        let addr1 = BleAddress::Real([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let addr2 = BleAddress::Real([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let addr3 = BleAddress::Real([0xFF, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(addr1, addr2);
        assert_ne!(addr1, addr3);

        let sim1 = BleAddress::Simulated(Uuid::nil());
        assert_ne!(addr1, sim1);
    }

    #[test]
    fn test_filter_requires_name() {
        let filter = ScanFilter::default();
        assert!(!filter.accepts(None));
        assert!(filter.accepts(Some("anything")));
    }

    #[test]
    fn test_filter_prefix_and_self() {
        let filter = ScanFilter {
            name_prefix: Some("STeaMi".into()),
            exclude_name: Some("STeaMi-R1".into()),
        };
        assert!(filter.accepts(Some("STeaMi-S1")));
        assert!(!filter.accepts(Some("STeaMi-R1")));
        assert!(!filter.accepts(Some("Nord")));
    }
}
