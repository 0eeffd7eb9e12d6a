//! Periodic host sampler with read-abuse detection.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::cpu::{CpuSource, SysinfoCpu, AGGREGATE_CPU};
use super::disk::{discover, BlockDevice, DiskCounters};
use super::error::MetricsError;
use crate::watch::Severity;

/// Sampler tuning.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub interval: Duration,
    /// Samples in the read-rate moving average.
    pub window: usize,
    pub read_warning_bytes: f64,
    pub read_critical_bytes: f64,
    pub cpu_warning_percent: f64,
    pub cpu_critical_percent: f64,
    pub sys_root: PathBuf,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            window: 10,
            read_warning_bytes: 150.0 * 1024.0,
            read_critical_bytes: 10.0 * 1024.0 * 1024.0,
            cpu_warning_percent: 35.0,
            cpu_critical_percent: 85.0,
            sys_root: PathBuf::from("/sys"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuUsage {
    pub cpu: String,
    pub percent: f64,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskRate {
    pub device: String,
    pub read_bytes_per_sec: f64,
    pub write_bytes_per_sec: f64,
}

/// Sustained read throughput above a threshold on one disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadAbuse {
    pub device: String,
    pub average_bytes_per_sec: f64,
    pub severity: Severity,
}

/// One sampling tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Sample {
    pub cpus: Vec<CpuUsage>,
    pub disks: Vec<DiskRate>,
    pub abuse: Vec<ReadAbuse>,
}

impl Sample {
    /// Highest severity among per-CPU usages and read abuse.
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.cpus
            .iter()
            .filter(|c| c.cpu != AGGREGATE_CPU)
            .map(|c| c.severity)
            .chain(self.abuse.iter().map(|a| a.severity))
            .max()
            .unwrap_or(Severity::Info)
    }
}

fn classify(value: f64, warning: f64, critical: f64) -> Severity {
    if value > critical {
        Severity::Critical
    } else if value > warning {
        Severity::Warning
    } else {
        Severity::Info
    }
}

/// Host CPU and disk sampler. Shares nothing with the watch engine.
pub struct HostSampler {
    config: SamplerConfig,
    devices: Vec<BlockDevice>,
    cpu: Box<dyn CpuSource>,
    disk: HashMap<String, DiskCounters>,
    history: HashMap<String, VecDeque<f64>>,
}

impl HostSampler {
    /// Discover devices and take the baseline reading.
    ///
    /// # Errors
    ///
    /// Returns an error if `/sys/block` cannot be read.
    pub fn new(config: SamplerConfig) -> Result<Self, MetricsError> {
        Self::with_cpu_source(config, Box::new(SysinfoCpu::new()))
    }

    /// Like [`HostSampler::new`] with CPU readings taken from `cpu`.
    ///
    /// # Errors
    ///
    /// Returns an error if `/sys/block` cannot be read.
    pub fn with_cpu_source(
        config: SamplerConfig,
        cpu: Box<dyn CpuSource>,
    ) -> Result<Self, MetricsError> {
        let devices = discover(&config.sys_root)?;
        let mut disk = HashMap::new();
        for device in &devices {
            match device.read() {
                Ok(counters) => {
                    disk.insert(device.name.clone(), counters);
                }
                Err(e) => tracing::debug!(device = %device.name, error = %e, "Skipping device"),
            }
        }
        Ok(Self {
            config,
            devices,
            cpu,
            disk,
            history: HashMap::new(),
        })
    }

    /// Read counters again and compute usage since the previous reading.
    /// Unreadable devices are skipped.
    pub fn sample(&mut self, elapsed: Duration) -> Sample {
        let mut sample = Sample::default();

        for (name, percent) in self.cpu.usage() {
            sample.cpus.push(CpuUsage {
                cpu: name,
                percent,
                severity: classify(
                    percent,
                    self.config.cpu_warning_percent,
                    self.config.cpu_critical_percent,
                ),
            });
        }

        let window = self.config.window.max(1);
        for device in &self.devices {
            let now = match device.read() {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!(device = %device.name, error = %e, "Skipping device");
                    continue;
                }
            };
            let Some(previous) = self.disk.insert(device.name.clone(), now) else {
                continue;
            };
            let (read, write) = now.rates_since(&previous, elapsed);
            sample.disks.push(DiskRate {
                device: device.name.clone(),
                read_bytes_per_sec: read,
                write_bytes_per_sec: write,
            });

            if !device.is_disk() {
                continue;
            }
            let history = self.history.entry(device.name.clone()).or_default();
            history.push_back(read);
            while history.len() > window {
                history.pop_front();
            }
            if history.len() < window {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let average = history.iter().sum::<f64>() / window as f64;
            let severity = classify(
                average,
                self.config.read_warning_bytes,
                self.config.read_critical_bytes,
            );
            if severity > Severity::Info {
                sample.abuse.push(ReadAbuse {
                    device: device.name.clone(),
                    average_bytes_per_sec: average,
                    severity,
                });
            }
        }

        sample
    }

    /// Sample every interval until `cancel` fires, logging what it finds.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.tick().await;
        let mut last = Instant::now();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = Instant::now();
            log_sample(&self.sample(now.duration_since(last)));
            last = now;
        }
        tracing::debug!("Host sampler stopped");
    }
}

impl std::fmt::Debug for HostSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostSampler")
            .field("config", &self.config)
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

fn log_sample(sample: &Sample) {
    let usage: Vec<String> = sample
        .cpus
        .iter()
        .map(|c| format!("{}={:.2}%", c.cpu, c.percent))
        .collect();
    let usage = usage.join(" ");
    match sample.cpus.iter().filter(|c| c.cpu != AGGREGATE_CPU).map(|c| c.severity).max() {
        Some(Severity::Critical) => tracing::error!(usage = %usage, "CPU usage critical"),
        Some(Severity::Warning) => tracing::warn!(usage = %usage, "CPU usage high"),
        _ => tracing::debug!(usage = %usage, "CPU usage"),
    }

    for abuse in &sample.abuse {
        let kib = abuse.average_bytes_per_sec / 1024.0;
        match abuse.severity {
            Severity::Critical => {
                tracing::error!(device = %abuse.device, kib_per_sec = kib, "Read abuse");
            }
            _ => tracing::warn!(device = %abuse.device, kib_per_sec = kib, "Elevated disk reads"),
        }
    }
}
