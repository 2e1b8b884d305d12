//! Daemon cadences.

use std::time::Duration;

/// How often each background task runs.
///
/// The defaults suit a live deployment; experiment drivers and tests
/// tighten them to converge faster.
#[derive(Debug, Clone)]
pub struct Config {
    pub stabilize_interval: Duration,
    pub fix_fingers_interval: Duration,
    pub check_predecessor_interval: Duration,
    pub migrate_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stabilize_interval: Duration::from_secs(1),
            fix_fingers_interval: Duration::from_secs(1),
            check_predecessor_interval: Duration::from_secs(2),
            migrate_interval: Duration::from_secs(5),
        }
    }
}
