pub mod config;
pub mod daemon;
pub mod distance;
pub mod presence;
pub mod scanner;
pub mod session;
pub mod validation;

pub use config::Config;
pub use distance::estimate_distance_cm;
pub use presence::{transition, Intent, LockState, PresenceEngine, PresenceState};
