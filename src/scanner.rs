use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// One signal strength reading for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(with = "mac_string")]
    pub device_id: MacAddr6,
    pub rssi_dbm: f64,
    pub observed_at: DateTime<Utc>,
}

/// Events forwarded from a scanner to the daemon
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// Device announced itself, possibly without a signal reading
    Discovered {
        address: MacAddr6,
        name: Option<String>,
    },
    Signal(Sample),
}

impl ScanEvent {
    pub fn address(&self) -> MacAddr6 {
        match self {
            ScanEvent::Discovered { address, .. } => *address,
            ScanEvent::Signal(sample) => sample.device_id,
        }
    }
}

mod mac_string {
    use macaddr::MacAddr6;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mac: &MacAddr6, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(mac)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MacAddr6, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Scans via a `bluetoothctl` child process
pub struct BluetoothScanner {
    command: Vec<String>,
}

impl BluetoothScanner {
    pub fn new(command: Vec<String>) -> Self {
        BluetoothScanner { command }
    }

    pub async fn run(&self, tx: mpsc::Sender<ScanEvent>, running: Arc<AtomicBool>) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .context("Scanner command is empty")?;

        info!("Starting scanner: {}", self.command.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start scanner command: {}", program))?;

        // Closing stdin makes bluetoothctl quit, so keep it open for the whole scan
        let mut stdin = child.stdin.take().context("Scanner stdin unavailable")?;
        stdin
            .write_all(b"scan on\n")
            .await
            .context("Failed to start discovery")?;
        stdin.flush().await?;

        let stdout = child.stdout.take().context("Scanner stdout unavailable")?;
        let mut lines = BufReader::new(stdout).lines();

        while running.load(Ordering::SeqCst) {
            match timeout(Duration::from_millis(500), lines.next_line()).await {
                Err(_) => continue,
                Ok(Ok(Some(line))) => {
                    if let Some(event) = parse_bluetoothctl_line(&line, Utc::now()) {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Ok(None)) => {
                    warn!("Scanner process closed its output");
                    break;
                }
                Ok(Err(e)) => return Err(e).context("Failed to read scanner output"),
            }
        }

        if let Err(e) = stdin.write_all(b"scan off\nquit\n").await {
            debug!("Scanner already gone: {}", e);
        }
        if let Err(e) = child.kill().await {
            debug!("Failed to kill scanner: {}", e);
        }

        info!("Scanner stopped");
        Ok(())
    }
}

/// Parse one line of `bluetoothctl` output
///
/// Handles `[NEW] Device <addr> <name>`, `[CHG] Device <addr> RSSI: <n>`
/// (including the newer `RSSI: 0xffffffb5 (-75)` form) and name/alias changes.
/// Colour escapes and prompts around the record are ignored.
pub fn parse_bluetoothctl_line(line: &str, observed_at: DateTime<Utc>) -> Option<ScanEvent> {
    let clean = strip_ansi(line);

    let (is_new, record) = if let Some(idx) = clean.find("[NEW] Device ") {
        (true, &clean[idx + "[NEW] Device ".len()..])
    } else if let Some(idx) = clean.find("[CHG] Device ") {
        (false, &clean[idx + "[CHG] Device ".len()..])
    } else {
        return None;
    };

    let record = record.trim();
    let (addr, rest) = match record.split_once(' ') {
        Some((addr, rest)) => (addr, rest.trim()),
        None => (record, ""),
    };
    let address: MacAddr6 = addr.parse().ok()?;

    if is_new {
        return Some(ScanEvent::Discovered {
            address,
            name: device_name(rest),
        });
    }

    if let Some(value) = rest.strip_prefix("RSSI:") {
        let rssi_dbm = parse_rssi(value)?;
        return Some(ScanEvent::Signal(Sample {
            device_id: address,
            rssi_dbm,
            observed_at,
        }));
    }

    if let Some(name) = rest
        .strip_prefix("Name:")
        .or_else(|| rest.strip_prefix("Alias:"))
    {
        return Some(ScanEvent::Discovered {
            address,
            name: device_name(name.trim()),
        });
    }

    None
}

fn parse_rssi(value: &str) -> Option<f64> {
    let value = value.trim();
    // Newer BlueZ: "0xffffffb5 (-75)"
    if let (Some(open), Some(close)) = (value.find('('), value.rfind(')')) {
        if open < close {
            return value[open + 1..close].trim().parse::<i32>().ok().map(f64::from);
        }
    }
    let token = value.split_whitespace().next()?;
    token.parse::<i32>().ok().map(f64::from)
}

/// bluetoothctl uses the dashed address as the name of anonymous devices
fn device_name(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.parse::<MacAddr6>().is_ok() {
        None
    } else {
        Some(raw.to_string())
    }
}

fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => {
                if chars.peek() == Some(&'[') {
                    chars.next();
                    // CSI sequence ends at the first byte in '@'..='~'
                    for c in chars.by_ref() {
                        if ('@'..='~').contains(&c) {
                            break;
                        }
                    }
                }
            }
            '\r' | '\u{1}' | '\u{2}' => {}
            _ => out.push(c),
        }
    }

    out
}

/// Replays samples recorded as JSON lines
pub struct ReplayScanner {
    path: PathBuf,
}

impl ReplayScanner {
    pub fn new(path: PathBuf) -> Self {
        ReplayScanner { path }
    }

    pub async fn run(&self, tx: mpsc::Sender<ScanEvent>, running: Arc<AtomicBool>) -> Result<()> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read replay file: {:?}", self.path))?;
        let samples = parse_replay(&content)?;

        info!("Replaying {} samples from {:?}", samples.len(), self.path);

        for sample in samples {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            if tx.send(ScanEvent::Signal(sample)).await.is_err() {
                break;
            }
        }

        Ok(())
    }
}

/// Parse a JSON-lines sample recording. Blank lines and `#` comments are skipped.
pub fn parse_replay(content: &str) -> Result<Vec<Sample>> {
    let mut samples = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let sample: Sample = serde_json::from_str(line)
            .with_context(|| format!("Invalid sample on line {}", idx + 1))?;
        samples.push(sample);
    }

    Ok(samples)
}
