use crate::metrics::PendingUpdates;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub reporting: Duration,
    pub liveness: Duration,
    pub update_check: Duration,
}

/// Process-wide state shared by the coordinator, timers and handlers.
/// Each field has a single writer:
/// - `connected`: transport pump
/// - `reported_first_time`, `cycles_completed`: reporting engine
/// - `pending_updates`: update checker
#[derive(Debug, Clone)]
pub struct ReportingState {
    pub connected: bool,
    pub reported_first_time: bool,
    pub cycles_completed: u64,
    pub pending_updates: PendingUpdates,
    pub cadence: Cadence,
}

impl ReportingState {
    pub fn new(cadence: Cadence) -> Self {
        Self {
            connected: false,
            reported_first_time: false,
            cycles_completed: 0,
            pending_updates: PendingUpdates::default(),
            cadence,
        }
    }
}
