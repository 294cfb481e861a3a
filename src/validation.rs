use log::{debug, info};
use macaddr::MacAddr6;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

use crate::scanner::ScanEvent;

/// Result of the startup presence probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub address: MacAddr6,
    /// Name reported by the scanner, if the device advertised one
    pub name: Option<String>,
}

/// Errors that are fatal and should stop startup
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartupError {
    #[error("device {address} was not seen within {timeout_secs}s")]
    DeviceNotFound { address: MacAddr6, timeout_secs: u64 },
    #[error("scanner stopped before device {0} was seen")]
    ScannerClosed(MacAddr6),
    #[error("interrupted while looking for device {0}")]
    Interrupted(MacAddr6),
}

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Wait until the target device shows up in the scan stream
///
/// Events for other devices are skipped. Nothing seen during the probe is handed
/// to the presence engine.
pub async fn probe_device(
    rx: &mut mpsc::Receiver<ScanEvent>,
    target: MacAddr6,
    probe_timeout: Duration,
    running: &AtomicBool,
) -> Result<ProbeResult, StartupError> {
    info!(
        "Looking for device {} (timeout {}s)",
        target,
        probe_timeout.as_secs()
    );

    let deadline = Instant::now() + probe_timeout;

    loop {
        if !running.load(Ordering::SeqCst) {
            return Err(StartupError::Interrupted(target));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(StartupError::DeviceNotFound {
                address: target,
                timeout_secs: probe_timeout.as_secs(),
            });
        }

        match timeout(remaining.min(POLL_INTERVAL), rx.recv()).await {
            Err(_) => continue,
            Ok(None) => return Err(StartupError::ScannerClosed(target)),
            Ok(Some(event)) if event.address() == target => {
                let name = match event {
                    ScanEvent::Discovered { name, .. } => name,
                    ScanEvent::Signal(_) => None,
                };
                info!(
                    "Found device {} ({})",
                    name.as_deref().unwrap_or("unknown"),
                    target
                );
                return Ok(ProbeResult {
                    address: target,
                    name,
                });
            }
            Ok(Some(event)) => {
                debug!("Ignoring device {} during probe", event.address());
            }
        }
    }
}
