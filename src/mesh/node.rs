//! A complete mesh node
//!
//! `MeshNode::run` drives four cooperating tasks until shutdown: distance
//! sampling, energy sampling, the radio cycle and the status screen. Only
//! the radio task touches the radio; the relay engine (seen-set and
//! outbound slot) lives inside it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use super::peers::{PeerSnapshot, PeerTable};
use super::relay::{Delivery, Disposition, NodeRole, RelayEngine, RelayStats};
use super::scheduler::{AdvertiseOutcome, ChannelScheduler, CycleHandler, CycleStats};
use super::summary::SummaryView;
use crate::ble::transport::{Radio, RawAdvertisement};
use crate::codec::{Codec, Message, Packet};
use crate::config::{ConfigError, NodeConfig};
use crate::hal::{Display, DistanceSensor, FuelGauge, IndicatorBank};

/// Board peripherals handed to a node. Any of them may be absent.
#[derive(Default)]
pub struct Peripherals {
    pub sensor: Option<Box<dyn DistanceSensor>>,
    pub gauge: Option<Box<dyn FuelGauge>>,
    pub display: Option<Box<dyn Display>>,
    pub indicators: IndicatorBank,
}

/// Counters collected when a node stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeReport {
    pub cycles: CycleStats,
    pub relay: RelayStats,
    pub decode_errors: u64,
    pub deliveries: u64,
    pub sensor_errors: u64,
}

/// Read-only view on a running node.
#[derive(Clone)]
pub struct NodeHandle {
    peers: Arc<Mutex<PeerTable>>,
    own_value: watch::Receiver<Option<i32>>,
    current: watch::Receiver<f32>,
    delivery: watch::Receiver<Option<Delivery>>,
}

impl NodeHandle {
    pub async fn recent_peers(&self, k: usize) -> Vec<PeerSnapshot> {
        self.peers.lock().await.recent(k, Instant::now())
    }

    pub async fn peer_value(&self, name: &str) -> Option<i32> {
        self.peers.lock().await.get(name).map(|entry| entry.value)
    }

    /// Last good distance reading.
    pub fn own_value(&self) -> Option<i32> {
        *self.own_value.borrow()
    }

    pub fn current_ma(&self) -> f32 {
        *self.current.borrow()
    }

    /// Most recent message addressed to this node.
    pub fn last_delivery(&self) -> Option<Delivery> {
        self.delivery.borrow().clone()
    }
}

pub struct MeshNode {
    config: NodeConfig,
    radio: Arc<dyn Radio>,
    peripherals: Peripherals,
    peers: Arc<Mutex<PeerTable>>,
    own_value: watch::Sender<Option<i32>>,
    current: watch::Sender<f32>,
    delivery: watch::Sender<Option<Delivery>>,
}

impl MeshNode {
    pub fn new(
        config: NodeConfig,
        radio: Arc<dyn Radio>,
        peripherals: Peripherals,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let peers = PeerTable::new(config.peer_capacity, config.peer_stale_after());
        Ok(Self {
            config,
            radio,
            peripherals,
            peers: Arc::new(Mutex::new(peers)),
            own_value: watch::channel(None).0,
            current: watch::channel(0.0).0,
            delivery: watch::channel(None).0,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            peers: Arc::clone(&self.peers),
            own_value: self.own_value.subscribe(),
            current: self.current.subscribe(),
            delivery: self.delivery.subscribe(),
        }
    }

    /// Run until `shutdown` carries `true` or its sender is dropped.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> NodeReport {
        let MeshNode {
            config,
            radio,
            peripherals,
            peers,
            own_value,
            current,
            delivery,
        } = self;
        let Peripherals {
            sensor,
            gauge,
            display,
            indicators,
        } = peripherals;
        log::info!(
            "Node {} starting as {:?} ({:?})",
            config.name,
            config.role,
            config.cycle_order
        );

        let screen = ScreenSource {
            name: config.name.clone(),
            peers: Arc::clone(&peers),
            peer_view: config.peer_view,
            own_value: own_value.subscribe(),
            current: gauge.is_some().then(|| current.subscribe()),
        };
        let mut handler = NodeHandler::new(&config, peers, indicators, own_value.subscribe(), delivery);
        let mut scheduler = ChannelScheduler::new(radio, config.scheduler());

        let (sensor_errors, cycles, (), ()) = tokio::join!(
            sample_distance(
                sensor,
                own_value,
                Duration::from_millis(config.sensor_period_ms),
                shutdown.clone()
            ),
            scheduler.run(&mut handler, shutdown.clone()),
            sample_energy(
                gauge,
                current,
                Duration::from_millis(config.energy_period_ms),
                shutdown.clone()
            ),
            refresh_display(
                display,
                screen,
                Duration::from_millis(config.display_refresh_ms),
                shutdown
            ),
        );
        handler.release_indicator();

        let report = NodeReport {
            cycles,
            relay: handler.engine.stats(),
            decode_errors: handler.decode_errors,
            deliveries: handler.deliveries,
            sensor_errors,
        };
        log::info!("Node {} stopped: {:?}", config.name, report);
        report
    }
}

/// Sleep for `period`; true when the node should stop.
async fn wait_or_stop(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let closed = tokio::select! {
        _ = tokio::time::sleep(period) => false,
        changed = shutdown.changed() => changed.is_err(),
    };
    closed || *shutdown.borrow()
}

/// Failed reads keep the last good value.
async fn sample_distance(
    sensor: Option<Box<dyn DistanceSensor>>,
    out: watch::Sender<Option<i32>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let Some(mut sensor) = sensor else {
        return 0;
    };
    let mut errors = 0;
    loop {
        match sensor.read() {
            Ok(value) => {
                out.send_replace(Some(value));
            }
            Err(e) => {
                errors += 1;
                log::warn!("Distance read failed, keeping last value: {}", e);
            }
        }
        if wait_or_stop(period, &mut shutdown).await {
            return errors;
        }
    }
}

/// Failed reads report 0 mA.
async fn sample_energy(
    gauge: Option<Box<dyn FuelGauge>>,
    out: watch::Sender<f32>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(mut gauge) = gauge else {
        return;
    };
    loop {
        let current = match gauge.current_average() {
            Ok(current) => current,
            Err(e) => {
                log::warn!("Energy read failed: {}", e);
                0.0
            }
        };
        out.send_replace(current);
        if wait_or_stop(period, &mut shutdown).await {
            return;
        }
    }
}

/// What the screen task reads from.
struct ScreenSource {
    name: String,
    peers: Arc<Mutex<PeerTable>>,
    peer_view: usize,
    own_value: watch::Receiver<Option<i32>>,
    /// Absent without a fuel gauge.
    current: Option<watch::Receiver<f32>>,
}

impl ScreenSource {
    async fn view(&self) -> SummaryView {
        let now = Instant::now();
        let peers = {
            let mut table = self.peers.lock().await;
            table.prune(now);
            table.recent(self.peer_view, now)
        };
        SummaryView {
            name: self.name.clone(),
            own_value: *self.own_value.borrow(),
            current_ma: self.current.as_ref().map(|rx| *rx.borrow()),
            peers,
        }
    }
}

async fn refresh_display(
    display: Option<Box<dyn Display>>,
    source: ScreenSource,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(mut display) = display else {
        return;
    };
    loop {
        let view = source.view().await;
        if let Err(e) = view.render(display.as_mut()) {
            log::warn!("Display refresh failed: {}", e);
        }
        if wait_or_stop(period, &mut shutdown).await {
            return;
        }
    }
}

/// Role behaviour plugged into the scheduler.
struct NodeHandler {
    name: String,
    role: NodeRole,
    codec: Codec,
    forward_codec: Codec,
    destination: Option<String>,
    engine: RelayEngine,
    peers: Arc<Mutex<PeerTable>>,
    indicators: IndicatorBank,
    own_value: watch::Receiver<Option<i32>>,
    delivery: watch::Sender<Option<Delivery>>,
    /// Code to light once the scan window closes.
    pending_code: Option<u8>,
    /// Indicator held on until the next advertise phase ends.
    lit: Option<u8>,
    decode_errors: u64,
    deliveries: u64,
}

impl NodeHandler {
    fn new(
        config: &NodeConfig,
        peers: Arc<Mutex<PeerTable>>,
        indicators: IndicatorBank,
        own_value: watch::Receiver<Option<i32>>,
        delivery: watch::Sender<Option<Delivery>>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            role: config.role,
            codec: Codec::new(config.format),
            forward_codec: Codec::new(config.forward_format()),
            destination: config.destination.clone(),
            engine: RelayEngine::new(config.relay_settings(), config.addressing(), config.seen_set()),
            peers,
            indicators,
            own_value,
            delivery,
            pending_code: None,
            lit: None,
            decode_errors: 0,
            deliveries: 0,
        }
    }

    fn deliver(&mut self, delivery: Delivery) {
        log::info!(
            "{} received {} from {}",
            self.name,
            delivery.payload,
            delivery.source_id
        );
        self.deliveries += 1;
        if self.role == NodeRole::Endpoint {
            self.pending_code = delivery.code;
        }
        self.delivery.send_replace(Some(delivery));
    }

    fn light_indicator(&mut self, code: u8) {
        self.release_indicator();
        if self.indicators.set(code, true) {
            self.lit = Some(code);
        }
    }

    fn release_indicator(&mut self) {
        if let Some(code) = self.lit.take() {
            self.indicators.set(code, false);
        }
    }

    /// Re-broadcast frame for relays; lights the indicator for its code.
    fn forward_frame(&mut self) -> Option<Vec<u8>> {
        let pending = self.engine.take_forward()?;
        let packet = Packet::new(self.name.clone(), pending.message);
        match self.forward_codec.encode(&packet) {
            Ok(frame) => {
                log::info!(
                    "{} relays {} from {} (hop {})",
                    self.name,
                    packet.message.payload,
                    packet.message.source_id,
                    packet.message.hop_count
                );
                if let Some(code) = pending.code {
                    self.light_indicator(code);
                }
                Some(frame)
            }
            Err(e) => {
                log::warn!("Cannot re-encode forward from {}: {}", packet.message.source_id, e);
                None
            }
        }
    }

    /// Frame carrying our own latest reading, if there is one.
    fn own_frame(&self) -> Option<Vec<u8>> {
        let value = (*self.own_value.borrow())?;
        let mut message = Message::new(self.name.clone(), value);
        if let Some(destination) = &self.destination {
            message = message.to(destination.clone());
        }
        match self.codec.encode(&Packet::new(self.name.clone(), message)) {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::warn!("Cannot encode own reading {}: {}", value, e);
                None
            }
        }
    }
}

#[async_trait]
impl CycleHandler for NodeHandler {
    async fn on_advertisement(&mut self, adv: RawAdvertisement) {
        let packet = match self.codec.decode(&adv.data) {
            Ok(packet) => packet,
            Err(e) => {
                self.decode_errors += 1;
                log::debug!(
                    "Dropping frame {} from {:?}: {}",
                    hex::encode(&adv.data),
                    adv.name,
                    e
                );
                return;
            }
        };

        let now = Instant::now();
        match self.engine.process(&packet, now) {
            Disposition::Ignored(reason) => {
                log::debug!("Ignoring frame from {} ({:?})", packet.sender, reason);
            }
            Disposition::Duplicate => {
                self.peers
                    .lock()
                    .await
                    .upsert(&packet.message.source_id, packet.message.payload, now);
            }
            Disposition::Accepted { delivery, .. } => {
                self.peers
                    .lock()
                    .await
                    .upsert(&packet.message.source_id, packet.message.payload, now);
                if let Some(delivery) = delivery {
                    self.deliver(delivery);
                }
            }
        }
    }

    async fn on_scan_closed(&mut self) {
        if let Some(code) = self.pending_code.take() {
            self.light_indicator(code);
        }
    }

    async fn next_outbound(&mut self) -> Option<Vec<u8>> {
        let frame = if self.role.relays() {
            self.forward_frame()
        } else {
            self.own_frame()
        };
        // No advertise window this cycle: the phase ends here.
        if frame.is_none() {
            self.release_indicator();
        }
        frame
    }

    async fn on_advertise_finished(&mut self, _outcome: &AdvertiseOutcome) {
        self.release_indicator();
    }
}
