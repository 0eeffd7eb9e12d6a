//! Host CPU and disk throughput sampling.

mod cpu;
mod disk;
mod error;
mod sampler;

pub use cpu::{round_percent, CpuSource, SysinfoCpu, AGGREGATE_CPU};
pub use disk::{discover, parse_block_stat, BlockDevice, DiskCounters, SECTOR_SIZE};
pub use error::MetricsError;
pub use sampler::{CpuUsage, DiskRate, HostSampler, ReadAbuse, Sample, SamplerConfig};
