//! Distance estimation from RSSI signal strength
//!
//! Uses the Log-Distance Path Loss Model:
//! distance = 10 ^ ((rssi_at_1m - rssi) / (10 * n))
//!
//! Where:
//! - rssi_at_1m: Reference signal strength at 1 meter (dBm)
//! - rssi: Measured signal strength (dBm)
//! - n: Path loss exponent (environment dependent)

use serde::{Deserialize, Serialize};

/// Calibration of the signal-to-distance mapping, fixed for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    /// Reference signal strength at 1 meter (dBm)
    pub rssi_at_1m: f64,
    /// Environment factor (2.0=free space, 3.0=indoor, 4.0=dense obstacles)
    pub path_loss_exponent: f64,
}

/// Estimate distance in centimeters from RSSI
///
/// An RSSI of exactly `0` is the scanner's "no usable signal" marker and maps to
/// `f64::INFINITY`. No clamping or rounding is applied.
pub fn estimate_distance_cm(rssi_dbm: f64, params: &CalibrationParams) -> f64 {
    if rssi_dbm == 0.0 {
        return f64::INFINITY;
    }

    let exponent = (params.rssi_at_1m - rssi_dbm) / (10.0 * params.path_loss_exponent);
    10.0_f64.powf(exponent) * 100.0
}

/// Get a human-readable distance category
pub fn distance_category(distance_cm: f64) -> &'static str {
    match distance_cm {
        d if d < 50.0 => "at desk (<0.5m)",
        d if d < 150.0 => "close (0.5-1.5m)",
        d if d < 300.0 => "in room (1.5-3m)",
        d if d < 1000.0 => "far (3-10m)",
        _ => "out of range (>10m)",
    }
}

/// Format distance for log lines, two decimals in centimeters
pub fn format_distance(distance_cm: f64) -> String {
    if distance_cm.is_infinite() {
        "inf cm".to_string()
    } else {
        format!("{:.2} cm", distance_cm)
    }
}

/// Typical path loss exponents for different environments
pub mod environments {
    pub const FREE_SPACE: f64 = 2.0;
    pub const OPEN_INDOOR: f64 = 2.5;
    pub const TYPICAL_INDOOR: f64 = 3.0;
    pub const DENSE_INDOOR: f64 = 3.5;
    pub const HEAVY_OBSTACLES: f64 = 4.0;
}
