//! Block device throughput from `/sys/block`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::MetricsError;

/// Bytes per sector as reported by the block layer.
pub const SECTOR_SIZE: u64 = 512;

/// Cumulative sector counters of one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCounters {
    pub sectors_read: u64,
    pub sectors_written: u64,
}

impl DiskCounters {
    /// Read and write bytes per second between `previous` and `self`.
    #[must_use]
    pub fn rates_since(&self, previous: &Self, elapsed: Duration) -> (f64, f64) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return (0.0, 0.0);
        }
        let bytes = |now: u64, before: u64| {
            #[allow(clippy::cast_precision_loss)]
            let delta = now.saturating_sub(before).saturating_mul(SECTOR_SIZE) as f64;
            delta / secs
        };
        (
            bytes(self.sectors_read, previous.sectors_read),
            bytes(self.sectors_written, previous.sectors_written),
        )
    }
}

/// A disk or partition with a `stat` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    /// Owning disk, for partitions.
    pub disk: Option<String>,
    pub stat_path: PathBuf,
}

impl BlockDevice {
    /// Whether this is a whole disk rather than a partition.
    #[must_use]
    pub fn is_disk(&self) -> bool {
        self.disk.is_none()
    }

    /// Current counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the stat file cannot be read or parsed.
    pub fn read(&self) -> Result<DiskCounters, MetricsError> {
        let content =
            std::fs::read_to_string(&self.stat_path).map_err(|source| MetricsError::Read {
                path: self.stat_path.clone(),
                source,
            })?;
        parse_block_stat(&content).map_err(|reason| MetricsError::Parse {
            path: self.stat_path.clone(),
            reason,
        })
    }
}

/// Parse a block `stat` line: field 2 is sectors read, field 6 sectors
/// written.
///
/// # Errors
///
/// Returns a reason when fields are missing or not numbers.
pub fn parse_block_stat(content: &str) -> Result<DiskCounters, String> {
    let fields: Vec<&str> = content.split_whitespace().collect();
    if fields.len() < 7 {
        return Err(format!("expected at least 7 fields, found {}", fields.len()));
    }
    let field = |i: usize| {
        fields[i]
            .parse::<u64>()
            .map_err(|e| format!("field {i}: {e}"))
    };
    Ok(DiskCounters {
        sectors_read: field(2)?,
        sectors_written: field(6)?,
    })
}

/// List disks under `<sys_root>/block` and their partitions. Loop devices
/// are skipped.
///
/// # Errors
///
/// Returns an error if the block directory cannot be listed.
pub fn discover(sys_root: &Path) -> Result<Vec<BlockDevice>, MetricsError> {
    let block = sys_root.join("block");
    let entries = std::fs::read_dir(&block).map_err(|source| MetricsError::Read {
        path: block.clone(),
        source,
    })?;

    let mut disks: Vec<String> = entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| !name.starts_with("loop"))
        .collect();
    disks.sort();

    let mut devices = Vec::new();
    for disk in disks {
        let dir = block.join(&disk);
        let stat_path = dir.join("stat");
        if !stat_path.is_file() {
            continue;
        }
        devices.push(BlockDevice {
            name: disk.clone(),
            disk: None,
            stat_path,
        });

        let Ok(children) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut partitions: Vec<String> = children
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| name.starts_with(&disk) && dir.join(name).join("stat").is_file())
            .collect();
        partitions.sort();
        devices.extend(partitions.into_iter().map(|name| BlockDevice {
            stat_path: dir.join(&name).join("stat"),
            name,
            disk: Some(disk.clone()),
        }));
    }
    tracing::debug!(count = devices.len(), "Discovered block devices");
    Ok(devices)
}
