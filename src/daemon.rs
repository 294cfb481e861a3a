use anyhow::{Context, Result};
use log::{debug, error, info};
use macaddr::MacAddr6;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::Config;
use crate::distance::{distance_category, format_distance};
use crate::presence::{Intent, Observation, PresenceEngine};
use crate::scanner::{BluetoothScanner, ReplayScanner, ScanEvent};
use crate::session::{dispatch, DryRunSession, SessionController};
use crate::validation::{probe_device, StartupError};

const EVENT_QUEUE_SIZE: usize = 256;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Counters reported when tracking ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackSummary {
    pub samples: u64,
    pub stale: u64,
    pub locks: u64,
    pub unlocks: u64,
}

/// Why the tracking loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEnd {
    Interrupted,
    ScannerClosed,
}

/// Single consumer of scan events for one target device
pub struct Tracker<S: SessionController> {
    target: MacAddr6,
    device_name: Option<String>,
    engine: PresenceEngine,
    session: S,
    summary: TrackSummary,
}

impl<S: SessionController> Tracker<S> {
    pub fn new(target: MacAddr6, engine: PresenceEngine, session: S) -> Self {
        Tracker {
            target,
            device_name: None,
            engine,
            session,
            summary: TrackSummary::default(),
        }
    }

    pub fn with_device_name(mut self, name: Option<String>) -> Self {
        self.device_name = name;
        self
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn engine(&self) -> &PresenceEngine {
        &self.engine
    }

    pub fn summary(&self) -> TrackSummary {
        self.summary
    }

    /// Feed one scan event through the engine and dispatch the resulting intent
    pub fn handle_event(&mut self, event: ScanEvent) -> Option<Intent> {
        if event.address() != self.target {
            return None;
        }

        let sample = match event {
            ScanEvent::Discovered { name, .. } => {
                if name.is_some() {
                    self.device_name = name;
                }
                return None;
            }
            ScanEvent::Signal(sample) => sample,
        };

        self.summary.samples += 1;

        let (distance_cm, intent) = match self.engine.observe(&sample) {
            Observation::Stale => {
                self.summary.stale += 1;
                return None;
            }
            Observation::Decided {
                distance_cm,
                intent,
            } => (distance_cm, intent),
        };

        info!(
            "Device found: {} ({}), RSSI: {} dBm, Distance: {} [{}]",
            self.device_name.as_deref().unwrap_or("unknown"),
            self.target,
            sample.rssi_dbm,
            format_distance(distance_cm),
            distance_category(distance_cm)
        );

        match intent {
            Some(Intent::Unlock) => {
                info!(
                    "Device is close enough: {}, unlocking",
                    format_distance(distance_cm)
                );
                self.summary.unlocks += 1;
            }
            Some(Intent::Lock) => {
                info!("User too far away: {}, locking", format_distance(distance_cm));
                self.summary.locks += 1;
            }
            None => {
                debug!("No transition, state: {:?}", self.engine.state());
            }
        }

        if let Some(intent) = intent {
            dispatch(&mut self.session, intent);
        }

        intent
    }

    /// Consume events until the channel closes or `running` is cleared
    pub async fn track(
        &mut self,
        rx: &mut mpsc::Receiver<ScanEvent>,
        running: &AtomicBool,
    ) -> TrackEnd {
        while running.load(Ordering::SeqCst) {
            match timeout(POLL_INTERVAL, rx.recv()).await {
                Err(_) => continue,
                Ok(Some(event)) => {
                    self.handle_event(event);
                }
                Ok(None) => return TrackEnd::ScannerClosed,
            }
        }
        TrackEnd::Interrupted
    }
}

/// Probe for the device, then track it until interrupted
pub async fn run<S: SessionController>(
    config: &Config,
    session: S,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
    let scanner = BluetoothScanner::new(config.scanner.command.clone());
    let scanner_running = running.clone();
    let scanner_handle = tokio::spawn(async move {
        if let Err(e) = scanner.run(tx, scanner_running).await {
            error!("Scanner error: {:#}", e);
        }
    });

    run_with(config, session, rx, scanner_handle, running).await
}

/// Daemon body over an already started scanner task
pub async fn run_with<S: SessionController>(
    config: &Config,
    mut session: S,
    mut rx: mpsc::Receiver<ScanEvent>,
    scanner_handle: JoinHandle<()>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let target = config.device_address()?;

    let probe_timeout = Duration::from_secs(config.device.probe_timeout_secs);
    let probe = match probe_device(&mut rx, target, probe_timeout, &running).await {
        Ok(probe) => probe,
        Err(StartupError::Interrupted(_)) => {
            info!("Interrupted during startup, exiting.");
            drop(rx);
            join_scanner(scanner_handle).await;
            return Ok(());
        }
        Err(e) => {
            session.notify("AuraLock couldn't find the band. AuraLock will exit now until next restart.");
            error!("{}. Exiting.", e);
            running.store(false, Ordering::SeqCst);
            drop(rx);
            join_scanner(scanner_handle).await;
            return Err(e.into());
        }
    };

    session.notify(&format!(
        "AuraLock found the band and started successfully.\n\nDevice Name: {}\n\nDevice MAC: {}",
        probe.name.as_deref().unwrap_or("unknown"),
        probe.address
    ));

    let engine = PresenceEngine::new(config.calibration, config.policy);
    let mut tracker = Tracker::new(probe.address, engine, session).with_device_name(probe.name);

    info!("Tracking started. Press Ctrl+C to stop.");
    let end = tracker.track(&mut rx, &running).await;

    running.store(false, Ordering::SeqCst);
    drop(rx);
    join_scanner(scanner_handle).await;

    let summary = tracker.summary();
    info!(
        "Tracking stopped. Samples: {}, Stale: {}, Locks: {}, Unlocks: {}",
        summary.samples, summary.stale, summary.locks, summary.unlocks
    );

    match end {
        TrackEnd::Interrupted => {
            info!("Stopping scan due to interrupt...");
            Ok(())
        }
        TrackEnd::ScannerClosed => {
            tracker
                .session
                .notify("AuraLock lost the Bluetooth scanner. AuraLock will exit now until next restart.");
            error!("Scanner stopped unexpectedly. Exiting.");
            anyhow::bail!("Scanner stopped unexpectedly")
        }
    }
}

async fn join_scanner(handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        error!("Scanner task failed: {}", e);
    }
}

/// Feed a recorded sample file through the engine without touching the session
pub async fn replay(config: &Config, path: PathBuf) -> Result<DryRunSession> {
    let target = config.device_address()?;
    let running = Arc::new(AtomicBool::new(true));

    let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_SIZE);
    let scanner = ReplayScanner::new(path);
    let scanner_running = running.clone();
    let scanner_handle =
        tokio::spawn(async move { scanner.run(tx, scanner_running).await });

    let engine = PresenceEngine::new(config.calibration, config.policy);
    let mut tracker = Tracker::new(target, engine, DryRunSession::new());
    tracker.track(&mut rx, &running).await;

    scanner_handle
        .await
        .context("Replay task panicked")??;

    let summary = tracker.summary();
    info!(
        "Replay finished. Samples: {}, Stale: {}, Locks: {}, Unlocks: {}",
        summary.samples, summary.stale, summary.locks, summary.unlocks
    );

    Ok(tracker.session)
}
