use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::System;

use super::Period;
use crate::error::Result;
use crate::plugin::{upgrade, AutoReport, Plugin, Reporter, StatCollector};
use crate::service::{MicroService, WeakService};

/// Topic hardware reports are published on
pub const STATUS_TOPIC: &str = "microwork.node.status";

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Core count and 1/5/15 minute load averages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuStat {
    pub cpus: usize,
    pub load: [f64; 3],
}

/// Memory in bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemStat {
    pub used: u64,
    pub free: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareReport {
    pub cpu: CpuStat,
    pub mem: MemStat,
}

/// Publishes host CPU and memory stats on `microwork.node.status`
pub struct HardwareStat {
    service: WeakService,
    interval: Period,
    system: Mutex<System>,
    autoreport: AutoReport,
}

impl HardwareStat {
    pub fn new(service: &MicroService) -> Self {
        Self {
            service: service.downgrade(),
            interval: Period::new(DEFAULT_INTERVAL),
            system: Mutex::new(System::new()),
            autoreport: AutoReport::new(),
        }
    }

    pub fn with_interval(self, interval: Duration) -> Self {
        self.interval.set(interval);
        self
    }

    /// Takes effect on the next `autoreport_hardware_stats`
    pub fn set_interval(&self, interval: Duration) {
        self.interval.set(interval);
    }

    pub fn cpu_stat(&self) -> CpuStat {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu_all();
        let load = System::load_average();
        CpuStat {
            cpus: system.cpus().len(),
            load: [load.one, load.five, load.fifteen],
        }
    }

    pub fn mem_stat(&self) -> MemStat {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        let total = system.total_memory();
        let free = match system.available_memory() {
            0 => system.free_memory(),
            available => available,
        }
        .min(total);
        MemStat {
            used: total - free,
            free,
            total,
        }
    }

    pub fn hw_stat(&self) -> HardwareReport {
        HardwareReport {
            cpu: self.cpu_stat(),
            mem: self.mem_stat(),
        }
    }

    /// Send one hardware report
    pub async fn report_hardware_stats(&self) -> Result<()> {
        self.report().await
    }

    /// Send a report every interval until stopped
    pub fn autoreport_hardware_stats(self: &Arc<Self>) {
        self.autoreport.start(self);
    }

    pub fn stop_autoreport_hardware_stats(&self) {
        self.autoreport.stop();
    }

    pub fn is_autoreporting(&self) -> bool {
        self.autoreport.is_running()
    }
}

impl std::fmt::Debug for HardwareStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareStat")
            .field("interval", &self.interval.get())
            .field("autoreport", &self.autoreport)
            .finish()
    }
}

#[async_trait]
impl Plugin for HardwareStat {
    fn name(&self) -> &str {
        "hardware_stat"
    }

    async fn on_stop(&self) {
        self.stop_autoreport_hardware_stats();
    }
}

#[async_trait]
impl StatCollector for HardwareStat {
    type Stat = HardwareReport;

    async fn collect(&self) -> Result<HardwareReport> {
        Ok(self.hw_stat())
    }
}

#[async_trait]
impl Reporter for HardwareStat {
    fn topic(&self) -> &str {
        STATUS_TOPIC
    }

    fn interval(&self) -> Duration {
        self.interval.get()
    }

    async fn payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.collect().await?)?)
    }

    fn service(&self) -> Result<MicroService> {
        upgrade(&self.service)
    }
}
