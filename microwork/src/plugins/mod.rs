//! Stock plugins: liveness pings, hardware stats and subscriber introspection.

pub mod hardwarestat;
pub mod healthcheck;
pub mod substats;

pub use hardwarestat::{CpuStat, HardwareReport, HardwareStat, MemStat};
pub use healthcheck::HealthCheck;
pub use substats::{SubscriberReport, SubscriberStats};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::plugin::MIN_INTERVAL;

/// Report period shared between a plugin and its timer, in whole
/// milliseconds and never below `MIN_INTERVAL`
#[derive(Debug)]
pub(crate) struct Period(AtomicU64);

impl Period {
    pub(crate) fn new(period: Duration) -> Self {
        Self(AtomicU64::new(Self::millis(period)))
    }

    pub(crate) fn get(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn set(&self, period: Duration) {
        self.0.store(Self::millis(period), Ordering::SeqCst);
    }

    fn millis(period: Duration) -> u64 {
        period.max(MIN_INTERVAL).as_millis() as u64
    }
}
