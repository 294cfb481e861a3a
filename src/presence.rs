use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::distance::{estimate_distance_cm, CalibrationParams};
use crate::scanner::Sample;

/// Distance thresholds and debounce window for lock decisions
///
/// `nearby_distance_cm <= away_distance_cm` must hold; the band between the two
/// is a dead zone where nothing changes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyThresholds {
    pub nearby_distance_cm: f64,
    pub away_distance_cm: f64,
    pub away_duration_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
}

/// What the engine wants the session controller to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Lock,
    Unlock,
}

/// Engine runtime state. `away_since` is the start of the current uninterrupted
/// run of samples beyond the away threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceState {
    pub lock_state: LockState,
    pub away_since: Option<DateTime<Utc>>,
}

impl PresenceState {
    pub fn new() -> Self {
        PresenceState {
            lock_state: LockState::Unlocked,
            away_since: None,
        }
    }

    pub fn with_lock_state(lock_state: LockState) -> Self {
        PresenceState {
            lock_state,
            away_since: None,
        }
    }
}

impl Default for PresenceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply one distance sample to the state
///
/// Nearby is inclusive (`d <= nearby`), away is strict (`d > away`). Anything in
/// between clears the away timer. A lock fires only once the away condition has
/// lasted longer than `away_duration_secs`, and the timer is consumed either way.
pub fn transition(
    state: PresenceState,
    distance_cm: f64,
    now: DateTime<Utc>,
    thresholds: &PolicyThresholds,
) -> (PresenceState, Option<Intent>) {
    if distance_cm <= thresholds.nearby_distance_cm {
        let intent = match state.lock_state {
            LockState::Locked => Some(Intent::Unlock),
            LockState::Unlocked => None,
        };
        return (PresenceState::with_lock_state(LockState::Unlocked), intent);
    }

    if distance_cm > thresholds.away_distance_cm {
        let since = match state.away_since {
            None => {
                return (
                    PresenceState {
                        lock_state: state.lock_state,
                        away_since: Some(now),
                    },
                    None,
                );
            }
            Some(since) => since,
        };

        if elapsed_secs(since, now) > thresholds.away_duration_secs {
            let intent = match state.lock_state {
                LockState::Unlocked => Some(Intent::Lock),
                LockState::Locked => None,
            };
            return (PresenceState::with_lock_state(LockState::Locked), intent);
        }

        return (state, None);
    }

    // Dead zone
    (PresenceState::with_lock_state(state.lock_state), None)
}

fn elapsed_secs(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let elapsed = now - since;
    // Nanoseconds overflow after ~292 years
    match elapsed.num_nanoseconds() {
        Some(ns) => ns as f64 / 1e9,
        None => elapsed.num_milliseconds() as f64 / 1000.0,
    }
}

/// Result of feeding one sample to the engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// Sample was older than the last processed one and was dropped
    Stale,
    Decided {
        distance_cm: f64,
        intent: Option<Intent>,
    },
}

/// Owns the presence state for the single intake path and guards sample order
pub struct PresenceEngine {
    calibration: CalibrationParams,
    thresholds: PolicyThresholds,
    state: PresenceState,
    last_observed: Option<DateTime<Utc>>,
}

impl PresenceEngine {
    pub fn new(calibration: CalibrationParams, thresholds: PolicyThresholds) -> Self {
        PresenceEngine {
            calibration,
            thresholds,
            state: PresenceState::new(),
            last_observed: None,
        }
    }

    pub fn with_state(mut self, state: PresenceState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn observe(&mut self, sample: &Sample) -> Observation {
        if let Some(last) = self.last_observed {
            if sample.observed_at < last {
                debug!(
                    "Discarding out-of-order sample from {} at {} (last processed {})",
                    sample.device_id, sample.observed_at, last
                );
                return Observation::Stale;
            }
        }
        self.last_observed = Some(sample.observed_at);

        let distance_cm = estimate_distance_cm(sample.rssi_dbm, &self.calibration);
        let (next, intent) = transition(self.state, distance_cm, sample.observed_at, &self.thresholds);
        self.state = next;

        Observation::Decided { distance_cm, intent }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use macaddr::MacAddr6;

    fn thresholds() -> PolicyThresholds {
        PolicyThresholds {
            nearby_distance_cm: 100.0,
            away_distance_cm: 300.0,
            away_duration_secs: 5.0,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn run(
        mut state: PresenceState,
        samples: &[(f64, i64)],
    ) -> (PresenceState, Vec<Option<Intent>>) {
        let mut intents = Vec::new();
        for &(d, t) in samples {
            let (next, intent) = transition(state, d, at(t), &thresholds());
            state = next;
            intents.push(intent);
        }
        (state, intents)
    }

    #[test]
    fn test_nearby_unlocks_once() {
        let (state, intents) = run(
            PresenceState::with_lock_state(LockState::Locked),
            &[(50.0, 0), (50.0, 2)],
        );
        assert_eq!(intents, vec![Some(Intent::Unlock), None]);
        assert_eq!(state.lock_state, LockState::Unlocked);
    }

    #[test]
    fn test_sustained_away_locks() {
        let (state, intents) = run(PresenceState::new(), &[(350.0, 0), (400.0, 3)]);
        assert_eq!(intents, vec![None, None]);
        assert_eq!(state.away_since, Some(at(0)));

        let (state, intent) = transition(state, 320.0, at(6), &thresholds());
        assert_eq!(intent, Some(Intent::Lock));
        assert_eq!(state.lock_state, LockState::Locked);
        assert_eq!(state.away_since, None);
    }

    #[test]
    fn test_dead_zone_restarts_debounce() {
        let (state, intents) = run(
            PresenceState::new(),
            &[(350.0, 0), (400.0, 3), (150.0, 4), (320.0, 6)],
        );
        assert_eq!(intents, vec![None, None, None, None]);
        assert_eq!(state.away_since, Some(at(6)));

        // Full window measured from t=6
        let (state, intent) = transition(state, 320.0, at(10), &thresholds());
        assert_eq!(intent, None);
        let (state, intent) = transition(state, 320.0, at(12), &thresholds());
        assert_eq!(intent, Some(Intent::Lock));
        assert_eq!(state.lock_state, LockState::Locked);
    }

    #[test]
    fn test_nearby_boundary_is_inclusive() {
        let locked = PresenceState::with_lock_state(LockState::Locked);
        let (state, intent) = transition(locked, 100.0, at(0), &thresholds());
        assert_eq!(intent, Some(Intent::Unlock));
        assert_eq!(state.lock_state, LockState::Unlocked);
    }

    #[test]
    fn test_away_boundary_is_dead_zone() {
        let state = PresenceState {
            lock_state: LockState::Unlocked,
            away_since: Some(at(0)),
        };
        let (state, intent) = transition(state, 300.0, at(10), &thresholds());
        assert_eq!(intent, None);
        assert_eq!(state.away_since, None);
        assert_eq!(state.lock_state, LockState::Unlocked);
    }

    #[test]
    fn test_dead_zone_never_transitions() {
        for lock_state in [LockState::Locked, LockState::Unlocked] {
            for away_since in [None, Some(at(-60))] {
                for d in [100.5, 150.0, 299.9, 300.0] {
                    let state = PresenceState {
                        lock_state,
                        away_since,
                    };
                    let (next, intent) = transition(state, d, at(0), &thresholds());
                    assert_eq!(intent, None);
                    assert_eq!(next.lock_state, lock_state);
                    assert_eq!(next.away_since, None);
                }
            }
        }
    }

    #[test]
    fn test_single_far_sample_is_debounced() {
        let (state, intents) = run(PresenceState::new(), &[(1000.0, 0), (250.0, 1), (1000.0, 60)]);
        assert_eq!(intents, vec![None, None, None]);
        assert_eq!(state.lock_state, LockState::Unlocked);
    }

    #[test]
    fn test_elapsed_must_exceed_duration() {
        let (_, intents) = run(PresenceState::new(), &[(400.0, 0), (400.0, 5)]);
        assert_eq!(intents, vec![None, None]);
    }

    #[test]
    fn test_sub_millisecond_overshoot_locks() {
        let state = PresenceState {
            lock_state: LockState::Unlocked,
            away_since: Some(at(0)),
        };
        let now = at(5) + Duration::microseconds(900);
        let (next, intent) = transition(state, 400.0, now, &thresholds());
        assert_eq!(intent, Some(Intent::Lock));
        assert_eq!(next.lock_state, LockState::Locked);

        let now = at(5) + Duration::nanoseconds(1);
        let (_, intent) = transition(state, 400.0, now, &thresholds());
        assert_eq!(intent, Some(Intent::Lock));
    }

    #[test]
    fn test_repeated_samples_toggle_once() {
        let samples: Vec<(f64, i64)> = (0..20).map(|t| (f64::INFINITY, t)).collect();
        let (state, intents) = run(PresenceState::new(), &samples);
        let locks = intents.iter().filter(|i| **i == Some(Intent::Lock)).count();
        assert_eq!(locks, 1);
        assert_eq!(state.lock_state, LockState::Locked);

        let samples: Vec<(f64, i64)> = (20..40).map(|t| (10.0, t)).collect();
        let (_, intents) = run(state, &samples);
        let unlocks = intents.iter().filter(|i| **i == Some(Intent::Unlock)).count();
        assert_eq!(unlocks, 1);
        assert_eq!(intents[0], Some(Intent::Unlock));
    }

    #[test]
    fn test_lock_timer_consumed_when_already_locked() {
        // Engine already believes Locked: the window elapses without an intent
        let state = PresenceState {
            lock_state: LockState::Locked,
            away_since: Some(at(0)),
        };
        let (state, intent) = transition(state, 500.0, at(6), &thresholds());
        assert_eq!(intent, None);
        assert_eq!(state.away_since, None);
        assert_eq!(state.lock_state, LockState::Locked);
    }

    fn sample(rssi_dbm: f64, secs: i64) -> Sample {
        Sample {
            device_id: MacAddr6::new(0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF),
            rssi_dbm,
            observed_at: at(secs),
        }
    }

    fn engine() -> PresenceEngine {
        let calibration = CalibrationParams {
            rssi_at_1m: -60.0,
            path_loss_exponent: 2.0,
        };
        PresenceEngine::new(calibration, thresholds())
    }

    #[test]
    fn test_engine_converts_rssi() {
        let mut engine = engine().with_state(PresenceState::with_lock_state(LockState::Locked));
        let observation = engine.observe(&sample(-60.0, 0));
        assert_eq!(
            observation,
            Observation::Decided {
                distance_cm: 100.0,
                intent: Some(Intent::Unlock),
            }
        );
        assert_eq!(engine.state().lock_state, LockState::Unlocked);
    }

    #[test]
    fn test_engine_zero_rssi_counts_as_away() {
        let mut engine = engine();
        engine.observe(&sample(0.0, 0));
        assert_eq!(engine.state().away_since, Some(at(0)));
        let observation = engine.observe(&sample(0.0, 6));
        assert!(matches!(
            observation,
            Observation::Decided {
                intent: Some(Intent::Lock),
                ..
            }
        ));
    }

    #[test]
    fn test_engine_discards_out_of_order() {
        let mut engine = engine();
        // -80 dBm is 1000 cm: starts the away timer
        engine.observe(&sample(-80.0, 10));
        assert_eq!(engine.state().away_since, Some(at(10)));

        // Older dead-zone sample must not clear the timer
        assert_eq!(engine.observe(&sample(-66.0, 5)), Observation::Stale);
        assert_eq!(engine.state().away_since, Some(at(10)));

        // Equal timestamp is still in order
        assert!(matches!(
            engine.observe(&sample(-80.0, 10)),
            Observation::Decided { intent: None, .. }
        ));
        assert!(matches!(
            engine.observe(&sample(-80.0, 16)),
            Observation::Decided {
                intent: Some(Intent::Lock),
                ..
            }
        ));
    }
}
