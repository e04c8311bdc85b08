//! BLE radio layer for the advertising mesh
//!
//! Provides the half-duplex radio abstraction the scheduler drives, and an
//! in-process simulated air for tests and demos.

pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// Normal end of a non-connectable advertisement.
    #[error("Advertisement timed out")]
    AdvertiseTimeout,

    #[error("Radio busy: {0}")]
    Busy(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("Advertising error: {0}")]
    AdvertisingError(String),

    #[error("Advertisement exceeds {max} bytes ({size})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Radio closed")]
    Closed,
}
