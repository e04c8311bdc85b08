//! In-process radio simulator
//!
//! Provides a simulated air where several radios advertise and scan
//! entirely in-process. A radio only hears frames emitted while one of its
//! scan windows is open, which is what makes the duty cycle matter.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

use super::transport::{
    AdvertiseParams, BleAddress, Radio, RadioState, RawAdvertisement, ScanFilter, ScanParams,
    ScanSession,
};
use super::RadioError;
use crate::codec::ad::{self, ADV_DATA_MAX};

const STATE_IDLE: u8 = 0;
const STATE_SCANNING: u8 = 1;
const STATE_ADVERTISING: u8 = 2;

fn state_from_u8(raw: u8) -> RadioState {
    match raw {
        STATE_SCANNING => RadioState::Scanning,
        STATE_ADVERTISING => RadioState::Advertising,
        _ => RadioState::Idle,
    }
}

/// One frame travelling through the simulated air.
#[derive(Debug, Clone)]
struct AirFrame {
    data: Vec<u8>,
    source: BleAddress,
}

/// The simulated "air": a shared medium every simulated radio transmits
/// into and listens on.
pub struct SimAir {
    tx: broadcast::Sender<AirFrame>,
    /// Probability that a receiver misses a frame, with its generator.
    loss: Option<(f64, Mutex<StdRng>)>,
}

impl SimAir {
    /// Create a lossless air.
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(256);
        Arc::new(Self { tx, loss: None })
    }

    /// Create an air where each receiver misses a frame with the given
    /// probability. The seed makes runs reproducible.
    pub fn with_loss(probability: f64, seed: u64) -> Arc<Self> {
        let (tx, _) = broadcast::channel(256);
        Arc::new(Self {
            tx,
            loss: Some((probability.clamp(0.0, 1.0), Mutex::new(StdRng::seed_from_u64(seed)))),
        })
    }

    /// Create a new radio attached to this air.
    pub fn create_radio(self: &Arc<Self>) -> SimRadio {
        SimRadio {
            address: BleAddress::Simulated(Uuid::new_v4()),
            air: Arc::clone(self),
            state: Arc::new(AtomicU8::new(STATE_IDLE)),
            activity: Arc::new(Mutex::new(Vec::new())),
            rssi: -50,
        }
    }

    fn drops_frame(&self) -> bool {
        match &self.loss {
            Some((probability, rng)) => match rng.lock() {
                Ok(mut rng) => rng.gen_bool(*probability),
                Err(_) => false,
            },
            None => false,
        }
    }
}

/// One closed scan or advertise interval, as recorded by a simulated radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioActivity {
    pub state: RadioState,
    pub started: Instant,
    pub ended: Instant,
}

impl RadioActivity {
    /// Whether two intervals share any instant.
    pub fn overlaps(&self, other: &RadioActivity) -> bool {
        self.started < other.ended && other.started < self.ended
    }
}

/// Marks the radio busy for as long as it lives and logs the interval
/// when dropped.
struct ActivityGuard {
    state: Arc<AtomicU8>,
    activity: Arc<Mutex<Vec<RadioActivity>>>,
    kind: RadioState,
    started: Instant,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.state.store(STATE_IDLE, Ordering::SeqCst);
        if let Ok(mut log) = self.activity.lock() {
            log.push(RadioActivity {
                state: self.kind,
                started: self.started,
                ended: Instant::now(),
            });
        }
    }
}

/// A simulated half-duplex radio.
pub struct SimRadio {
    address: BleAddress,
    air: Arc<SimAir>,
    state: Arc<AtomicU8>,
    activity: Arc<Mutex<Vec<RadioActivity>>>,
    rssi: i16,
}

impl SimRadio {
    /// Set the RSSI reported for frames this radio receives.
    pub fn set_rssi(&mut self, rssi: i16) {
        self.rssi = rssi;
    }

    /// Current radio state.
    pub fn state(&self) -> RadioState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    /// All closed scan/advertise intervals so far, oldest first.
    pub fn activity(&self) -> Vec<RadioActivity> {
        match self.activity.lock() {
            Ok(log) => log.clone(),
            Err(_) => Vec::new(),
        }
    }

    fn acquire(&self, kind: RadioState, raw: u8) -> Result<ActivityGuard, RadioError> {
        self.state
            .compare_exchange(STATE_IDLE, raw, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|current| {
                RadioError::Busy(format!("cannot start {}, radio is {}", kind, state_from_u8(current)))
            })?;
        Ok(ActivityGuard {
            state: Arc::clone(&self.state),
            activity: Arc::clone(&self.activity),
            kind,
            started: Instant::now(),
        })
    }
}

/// Scan window over the simulated air.
pub struct SimScanSession {
    rx: broadcast::Receiver<AirFrame>,
    air: Arc<SimAir>,
    own_address: BleAddress,
    filter: ScanFilter,
    deadline: Instant,
    rssi: i16,
    guard: Option<ActivityGuard>,
}

impl SimScanSession {
    fn close(&mut self) {
        self.guard.take();
    }
}

#[async_trait]
impl ScanSession for SimScanSession {
    async fn next(&mut self) -> Option<RawAdvertisement> {
        self.guard.as_ref()?;
        loop {
            let frame = match tokio::time::timeout_at(self.deadline, self.rx.recv()).await {
                Err(_) => {
                    self.close();
                    return None;
                }
                Ok(Ok(frame)) => frame,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    log::warn!("Scanner lagged, {} frames lost", skipped);
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    self.close();
                    return None;
                }
            };

            if frame.source == self.own_address || self.air.drops_frame() {
                continue;
            }
            let name = ad::local_name(&frame.data);
            if !self.filter.accepts(name.as_deref()) {
                continue;
            }
            return Some(RawAdvertisement {
                name,
                data: frame.data,
                rssi: Some(self.rssi),
                source_address: frame.source,
            });
        }
    }
}

#[async_trait]
impl Radio for SimRadio {
    async fn scan(&self, params: ScanParams) -> Result<Box<dyn ScanSession>, RadioError> {
        let guard = self.acquire(RadioState::Scanning, STATE_SCANNING)?;
        let deadline = guard.started + params.duration;
        Ok(Box::new(SimScanSession {
            rx: self.air.tx.subscribe(),
            air: Arc::clone(&self.air),
            own_address: self.address.clone(),
            filter: params.filter,
            deadline,
            rssi: self.rssi,
            guard: Some(guard),
        }))
    }

    async fn advertise(&self, data: &[u8], params: AdvertiseParams) -> Result<(), RadioError> {
        if data.len() > ADV_DATA_MAX {
            return Err(RadioError::PayloadTooLarge {
                size: data.len(),
                max: ADV_DATA_MAX,
            });
        }
        let guard = self.acquire(RadioState::Advertising, STATE_ADVERTISING)?;
        let deadline = guard.started + params.timeout;
        let interval = params.interval.max(Duration::from_millis(1));
        let frame = AirFrame {
            data: data.to_vec(),
            source: self.address.clone(),
        };

        loop {
            // No receiver is not an error: nobody happens to be listening.
            let _ = self.air.tx.send(frame.clone());
            let next = Instant::now() + interval;
            if next >= deadline {
                tokio::time::sleep_until(deadline).await;
                break;
            }
            tokio::time::sleep_until(next).await;
        }
        drop(guard);

        // The simulated air has no centrals, so nothing ever connects.
        Err(RadioError::AdvertiseTimeout)
    }

    fn address(&self) -> &BleAddress {
        &self.address
    }
}
