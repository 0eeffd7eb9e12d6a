//! Per-CPU busy percentages.

use sysinfo::System;

/// Key of the aggregate reading across every CPU.
pub const AGGREGATE_CPU: &str = "cpu";

/// Source of CPU usage readings.
pub trait CpuSource: Send {
    /// Busy percentage of the aggregate and of each CPU since the previous
    /// call, keyed [`AGGREGATE_CPU`], `cpu0`, `cpu1`, ...
    fn usage(&mut self) -> Vec<(String, f64)>;
}

/// [`CpuSource`] backed by `sysinfo`.
pub struct SysinfoCpu {
    system: System,
}

impl SysinfoCpu {
    /// Take the baseline reading the first delta is measured against.
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SysinfoCpu {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SysinfoCpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoCpu")
            .field("cpus", &self.system.cpus().len())
            .finish_non_exhaustive()
    }
}

impl CpuSource for SysinfoCpu {
    fn usage(&mut self) -> Vec<(String, f64)> {
        self.system.refresh_cpu_usage();
        let mut readings = Vec::with_capacity(self.system.cpus().len() + 1);
        readings.push((
            AGGREGATE_CPU.to_string(),
            round_percent(self.system.global_cpu_usage()),
        ));
        readings.extend(
            self.system
                .cpus()
                .iter()
                .map(|cpu| (cpu.name().to_string(), round_percent(cpu.cpu_usage()))),
        );
        readings
    }
}

/// Round to two decimals.
#[must_use]
pub fn round_percent(percent: f32) -> f64 {
    (f64::from(percent) * 100.0).round() / 100.0
}
