//! Channel scheduler
//!
//! The only owner of the radio. Every cycle is a scan phase and an
//! advertise phase run one after the other; the radio is never asked to do
//! both at once and nothing waits for a peer to answer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::ble::transport::{AdvertiseParams, Radio, RadioState, RawAdvertisement, ScanParams};
use crate::ble::RadioError;

/// Which phase opens a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOrder {
    /// Listen first, then re-broadcast what was heard (relays, peers).
    #[default]
    ScanThenAdvertise,
    /// Broadcast own value first, then listen (sensing endpoints).
    AdvertiseThenScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Scan,
    Advertise,
}

impl CycleOrder {
    fn phases(self) -> [Phase; 2] {
        match self {
            CycleOrder::ScanThenAdvertise => [Phase::Scan, Phase::Advertise],
            CycleOrder::AdvertiseThenScan => [Phase::Advertise, Phase::Scan],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub scan: ScanParams,
    pub advertise: AdvertiseParams,
    pub order: CycleOrder,
    /// Sleep after each scan window.
    pub post_scan_pause: Duration,
    /// Sleep after each advertise phase, whether or not anything was sent.
    pub post_advertise_pause: Duration,
}

/// How an advertise window ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertiseOutcome {
    /// A central connected before the timeout.
    Completed,
    /// The usual end of a non-connectable broadcast.
    TimedOut,
    Failed(RadioError),
}

/// Role-specific behaviour plugged into the scheduler.
#[async_trait]
pub trait CycleHandler: Send {
    /// Called for every advertisement seen during a scan window.
    async fn on_advertisement(&mut self, adv: RawAdvertisement);

    /// Called once the scan window is closed.
    async fn on_scan_closed(&mut self) {}

    /// Frame to broadcast in this cycle's advertise window, if any.
    async fn next_outbound(&mut self) -> Option<Vec<u8>>;

    /// Called after an advertise window, before the pause.
    async fn on_advertise_finished(&mut self, _outcome: &AdvertiseOutcome) {}
}

/// What happened during one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub received: usize,
    pub scan_failed: bool,
    /// `None` when the handler had nothing to send.
    pub advertised: Option<AdvertiseOutcome>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycles: u64,
    pub scan_windows: u64,
    pub advertise_windows: u64,
    pub advertise_timeouts: u64,
    pub advertise_failures: u64,
    pub scan_failures: u64,
    /// Advertisements handed to the handler.
    pub packets: u64,
}

pub struct ChannelScheduler<R: Radio + ?Sized> {
    radio: Arc<R>,
    config: SchedulerConfig,
    state: RadioState,
    stats: CycleStats,
}

impl<R: Radio + ?Sized> ChannelScheduler<R> {
    pub fn new(radio: Arc<R>, config: SchedulerConfig) -> Self {
        Self {
            radio,
            config,
            state: RadioState::Idle,
            stats: CycleStats::default(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// What the scheduler currently has the radio doing.
    pub fn state(&self) -> RadioState {
        self.state
    }

    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    /// Run one full cycle in the configured order.
    pub async fn run_cycle<H>(&mut self, handler: &mut H) -> CycleReport
    where
        H: CycleHandler + ?Sized,
    {
        let mut report = CycleReport::default();
        for phase in self.config.order.phases() {
            self.run_phase(phase, handler, &mut report).await;
        }
        self.stats.cycles += 1;
        report
    }

    /// Cycle until `shutdown` carries `true` or its sender is dropped.
    /// The signal is observed between phases.
    pub async fn run<H>(&mut self, handler: &mut H, shutdown: watch::Receiver<bool>) -> CycleStats
    where
        H: CycleHandler + ?Sized,
    {
        log::info!("Channel scheduler started ({:?})", self.config.order);
        'cycles: loop {
            let mut report = CycleReport::default();
            for phase in self.config.order.phases() {
                if stop_requested(&shutdown) {
                    break 'cycles;
                }
                self.run_phase(phase, handler, &mut report).await;
            }
            self.stats.cycles += 1;
            log::debug!(
                "Cycle {} done: {} received, advertised {:?}",
                self.stats.cycles,
                report.received,
                report.advertised
            );
        }
        log::info!("Channel scheduler stopped after {} cycles", self.stats.cycles);
        self.stats
    }

    async fn run_phase<H>(&mut self, phase: Phase, handler: &mut H, report: &mut CycleReport)
    where
        H: CycleHandler + ?Sized,
    {
        match phase {
            Phase::Scan => {
                let (received, failed) = self.scan_phase(handler).await;
                report.received += received;
                report.scan_failed |= failed;
            }
            Phase::Advertise => {
                report.advertised = self.advertise_phase(handler).await;
            }
        }
    }

    async fn scan_phase<H>(&mut self, handler: &mut H) -> (usize, bool)
    where
        H: CycleHandler + ?Sized,
    {
        self.stats.scan_windows += 1;
        self.state = RadioState::Scanning;
        let mut received = 0;
        let mut failed = false;

        match self.radio.scan(self.config.scan.clone()).await {
            Ok(mut session) => {
                while let Some(adv) = session.next().await {
                    received += 1;
                    handler.on_advertisement(adv).await;
                }
            }
            Err(e) => {
                log::warn!("Scan failed: {}", e);
                self.stats.scan_failures += 1;
                failed = true;
                // Keep the duty cycle even without a window.
                tokio::time::sleep(self.config.scan.duration).await;
            }
        }

        self.state = RadioState::Idle;
        self.stats.packets += received as u64;
        handler.on_scan_closed().await;
        tokio::time::sleep(self.config.post_scan_pause).await;
        (received, failed)
    }

    async fn advertise_phase<H>(&mut self, handler: &mut H) -> Option<AdvertiseOutcome>
    where
        H: CycleHandler + ?Sized,
    {
        let outcome = match handler.next_outbound().await {
            Some(frame) => {
                self.stats.advertise_windows += 1;
                self.state = RadioState::Advertising;
                log::debug!("Advertising {}", hex::encode(&frame));
                let result = self.radio.advertise(&frame, self.config.advertise).await;
                self.state = RadioState::Idle;

                let outcome = match result {
                    Ok(()) => AdvertiseOutcome::Completed,
                    Err(RadioError::AdvertiseTimeout) => {
                        self.stats.advertise_timeouts += 1;
                        AdvertiseOutcome::TimedOut
                    }
                    Err(e) => {
                        log::warn!("Advertise failed: {}", e);
                        self.stats.advertise_failures += 1;
                        AdvertiseOutcome::Failed(e)
                    }
                };
                handler.on_advertise_finished(&outcome).await;
                Some(outcome)
            }
            None => None,
        };
        tokio::time::sleep(self.config.post_advertise_pause).await;
        outcome
    }
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    match shutdown.has_changed() {
        Ok(_) => *shutdown.borrow(),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::SimAir;
    use crate::ble::transport::{BleAddress, ScanFilter, ScanSession};
    use crate::codec::ad::build_frame;
    use tokio::time::Instant;

    fn config(order: CycleOrder) -> SchedulerConfig {
        SchedulerConfig {
            scan: ScanParams {
                duration: Duration::from_millis(200),
                interval_us: 30_000,
                window_us: 30_000,
                active: true,
                filter: ScanFilter::default(),
            },
            advertise: AdvertiseParams {
                interval: Duration::from_millis(150),
                timeout: Duration::from_millis(200),
                connectable: false,
            },
            order,
            post_scan_pause: Duration::from_millis(250),
            post_advertise_pause: Duration::from_millis(200),
        }
    }

    #[derive(Default)]
    struct Recorder {
        outbound: Option<Vec<u8>>,
        heard: Vec<String>,
        scans_closed: usize,
        outcomes: Vec<AdvertiseOutcome>,
    }

    #[async_trait]
    impl CycleHandler for Recorder {
        async fn on_advertisement(&mut self, adv: RawAdvertisement) {
            self.heard.push(adv.name.unwrap_or_default());
        }

        async fn on_scan_closed(&mut self) {
            self.scans_closed += 1;
        }

        async fn next_outbound(&mut self) -> Option<Vec<u8>> {
            self.outbound.clone()
        }

        async fn on_advertise_finished(&mut self, outcome: &AdvertiseOutcome) {
            self.outcomes.push(outcome.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_never_overlap() {
        let air = SimAir::new();
        let radio = Arc::new(air.create_radio());
        let mut scheduler = ChannelScheduler::new(Arc::clone(&radio), config(CycleOrder::ScanThenAdvertise));
        let mut handler = Recorder {
            outbound: Some(build_frame("STeaMi-R", &[0x00]).unwrap()),
            ..Default::default()
        };

        for _ in 0..5 {
            scheduler.run_cycle(&mut handler).await;
        }

        let stats = scheduler.stats();
        assert_eq!(stats.cycles, 5);
        assert_eq!(stats.scan_windows, 5);
        assert!(stats.advertise_windows <= 5);
        assert_eq!(stats.advertise_timeouts, stats.advertise_windows);
        assert_eq!(handler.scans_closed, 5);

        let activity = radio.activity();
        let scans = activity.iter().filter(|a| a.state == RadioState::Scanning).count();
        let adverts = activity.iter().filter(|a| a.state == RadioState::Advertising).count();
        assert_eq!(scans, 5);
        assert_eq!(adverts as u64, stats.advertise_windows);
        for (i, a) in activity.iter().enumerate() {
            for b in &activity[i + 1..] {
                assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
            }
        }
        assert_eq!(scheduler.state(), RadioState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_duration_follows_config() {
        let air = SimAir::new();
        let radio = Arc::new(air.create_radio());
        let mut scheduler = ChannelScheduler::new(radio, config(CycleOrder::ScanThenAdvertise));
        let mut handler = Recorder {
            outbound: Some(build_frame("STeaMi-R", &[0x00]).unwrap()),
            ..Default::default()
        };

        let start = Instant::now();
        scheduler.run_cycle(&mut handler).await;
        // 200 scan + 250 pause + 200 advertise + 200 pause
        assert_eq!(start.elapsed(), Duration::from_millis(850));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_to_send_skips_radio() {
        let air = SimAir::new();
        let radio = Arc::new(air.create_radio());
        let mut scheduler = ChannelScheduler::new(Arc::clone(&radio), config(CycleOrder::ScanThenAdvertise));
        let mut handler = Recorder::default();

        let report = scheduler.run_cycle(&mut handler).await;
        assert_eq!(report.advertised, None);
        assert_eq!(scheduler.stats().advertise_windows, 0);
        assert!(handler.outcomes.is_empty());
        assert!(radio.activity().iter().all(|a| a.state == RadioState::Scanning));
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertise_first_order() {
        let air = SimAir::new();
        let radio = Arc::new(air.create_radio());
        let mut scheduler = ChannelScheduler::new(Arc::clone(&radio), config(CycleOrder::AdvertiseThenScan));
        let mut handler = Recorder {
            outbound: Some(build_frame("STeaMi-S", &[0xFA, 0x00]).unwrap()),
            ..Default::default()
        };

        let report = scheduler.run_cycle(&mut handler).await;
        assert_eq!(report.advertised, Some(AdvertiseOutcome::TimedOut));
        let activity = radio.activity();
        assert_eq!(activity[0].state, RadioState::Advertising);
        assert_eq!(activity[1].state, RadioState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_nodes_hear_each_other() {
        let air = SimAir::new();
        let sensor = Arc::new(air.create_radio());
        let relay = Arc::new(air.create_radio());
        let mut sensor_sched = ChannelScheduler::new(sensor, config(CycleOrder::AdvertiseThenScan));
        let mut relay_sched = ChannelScheduler::new(relay, config(CycleOrder::ScanThenAdvertise));
        let mut sensor_handler = Recorder {
            outbound: Some(build_frame("STeaMi-S", &[0xFA, 0x00]).unwrap()),
            ..Default::default()
        };
        let mut relay_handler = Recorder::default();

        tokio::join!(
            async {
                for _ in 0..3 {
                    sensor_sched.run_cycle(&mut sensor_handler).await;
                }
            },
            async {
                for _ in 0..3 {
                    relay_sched.run_cycle(&mut relay_handler).await;
                }
            }
        );

        assert!(!relay_handler.heard.is_empty());
        assert!(relay_handler.heard.iter().all(|name| name == "STeaMi-S"));
        assert!(sensor_handler.heard.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_frame_is_never_transmitted() {
        let air = SimAir::new();
        let radio = Arc::new(air.create_radio());
        let listener = air.create_radio();
        let mut scheduler = ChannelScheduler::new(radio, config(CycleOrder::AdvertiseThenScan));
        let mut handler = Recorder {
            outbound: Some(vec![0x02; 40]),
            ..Default::default()
        };

        let mut session = listener.scan(config(CycleOrder::ScanThenAdvertise).scan).await.unwrap();
        let report = scheduler.run_cycle(&mut handler).await;

        assert!(matches!(
            report.advertised,
            Some(AdvertiseOutcome::Failed(RadioError::PayloadTooLarge { size: 40, max: 31 }))
        ));
        assert_eq!(scheduler.stats().advertise_failures, 1);
        assert!(session.next().await.is_none());
    }

    struct DeadRadio {
        address: BleAddress,
    }

    #[async_trait]
    impl Radio for DeadRadio {
        async fn scan(&self, _params: ScanParams) -> Result<Box<dyn ScanSession>, RadioError> {
            Err(RadioError::ScanError("controller not ready".into()))
        }

        async fn advertise(&self, _data: &[u8], _params: AdvertiseParams) -> Result<(), RadioError> {
            Err(RadioError::AdvertisingError("controller not ready".into()))
        }

        fn address(&self) -> &BleAddress {
            &self.address
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_errors_do_not_stop_cycling() {
        let radio: Arc<dyn Radio> = Arc::new(DeadRadio {
            address: BleAddress::Real([0; 6]),
        });
        let mut scheduler = ChannelScheduler::new(radio, config(CycleOrder::ScanThenAdvertise));
        let mut handler = Recorder {
            outbound: Some(vec![0x01]),
            ..Default::default()
        };

        let start = Instant::now();
        for _ in 0..3 {
            let report = scheduler.run_cycle(&mut handler).await;
            assert!(report.scan_failed);
        }
        let stats = scheduler.stats();
        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.scan_failures, 3);
        assert_eq!(stats.advertise_failures, 3);
        assert_eq!(handler.scans_closed, 3);
        // Failed scans still take their window; failed adverts return at once.
        assert_eq!(start.elapsed(), Duration::from_millis(3 * 650));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_signal() {
        let air = SimAir::new();
        let radio = Arc::new(air.create_radio());
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut scheduler = ChannelScheduler::new(radio, config(CycleOrder::ScanThenAdvertise));
            let mut handler = Recorder::default();
            scheduler.run(&mut handler, stop_rx).await
        });

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        stop_tx.send(true).unwrap();
        let stats = task.await.unwrap();
        assert!(stats.cycles >= 2);
        assert!(stats.scan_windows >= stats.cycles);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_sender_dropped() {
        let air = SimAir::new();
        let radio = Arc::new(air.create_radio());
        let (stop_tx, stop_rx) = watch::channel(false);
        drop(stop_tx);

        let mut scheduler = ChannelScheduler::new(radio, config(CycleOrder::ScanThenAdvertise));
        let stats = scheduler.run(&mut Recorder::default(), stop_rx).await;
        assert_eq!(stats.cycles, 0);
    }
}
