// Resource ceilings gating new workload spawns.

use std::sync::Arc;

use tracing::debug;

use crate::config::Settings;
use crate::orchestrator::{bytes_to_gb, parse_memory_limit, Orchestrator};

/// OS memory readings in GB. `None` means the reading is unavailable,
/// which never blocks a spawn.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryReadings {
    pub total_gb: Option<f64>,
    pub available_gb: Option<f64>,
}

impl MemoryReadings {
    /// Read from the OS. sys-info reports kilobytes.
    pub fn from_os() -> Self {
        match sys_info::mem_info() {
            Ok(info) => {
                let kb_to_gb = |kb: u64| kb as f64 / 1024.0 / 1024.0;
                let avail = if info.avail > 0 { info.avail } else { info.free };
                Self {
                    total_gb: (info.total > 0).then(|| kb_to_gb(info.total)),
                    available_gb: (avail > 0).then(|| kb_to_gb(avail)),
                }
            }
            Err(e) => {
                debug!("OS memory unreadable: {e}");
                Self::default()
            }
        }
    }
}

pub struct ResourceCeilings {
    settings: Arc<Settings>,
}

impl ResourceCeilings {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self { settings }
    }

    /// Whether one more workload fits. `Err` carries the denial reason.
    pub async fn check(&self, orchestrator: &Arc<dyn Orchestrator>) -> Result<(), String> {
        let readings = MemoryReadings::from_os();
        let limits = &self.settings.pool.resources;
        // Only pay for the stats round-trip when a total ceiling is set.
        let workloads_mem_gb = if limits.max_total_memory_gb > 0.0 {
            orchestrator.memory_used_gb().await
        } else {
            0.0
        };
        let limit_gb = bytes_to_gb(parse_memory_limit(&self.settings.containers.memory_limit));
        evaluate(readings, workloads_mem_gb, limit_gb, limits)
    }
}

/// Pure ceiling evaluation; unavailable readings count as plenty.
pub fn evaluate(
    readings: MemoryReadings,
    workloads_mem_gb: f64,
    workload_limit_gb: f64,
    limits: &crate::config::PoolResourceSettings,
) -> Result<(), String> {
    if let Some(available) = readings.available_gb {
        if available < limits.min_free_memory_gb {
            return Err(format!(
                "low free memory ({available:.1}GB < {:.1}GB)",
                limits.min_free_memory_gb
            ));
        }
    }

    if limits.max_total_memory_gb > 0.0
        && workloads_mem_gb + workload_limit_gb > limits.max_total_memory_gb
    {
        return Err(format!(
            "max workload memory ({workloads_mem_gb:.1}GB + {workload_limit_gb:.1}GB > {:.1}GB)",
            limits.max_total_memory_gb
        ));
    }

    if limits.max_memory_percent > 0.0 {
        if let (Some(total), Some(available)) = (readings.total_gb, readings.available_gb) {
            if total > 0.0 {
                let used = 1.0 - available / total;
                if used > limits.max_memory_percent {
                    return Err(format!(
                        "max memory percent ({:.0}% > {:.0}%)",
                        used * 100.0,
                        limits.max_memory_percent * 100.0
                    ));
                }
            }
        }
    }

    Ok(())
}
