//! Host capacity as seen from `/proc`.

use std::fs;

/// Used when the open-files limit cannot be read.
pub const FALLBACK_FD_LIMIT: u64 = 1024;
pub const LOW_MEMORY_THRESHOLD_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HostCapacity {
    /// `None` when the amount of RAM is unknown.
    pub physical_memory_bytes: Option<u64>,
    pub fd_limit: u64,
}

impl HostCapacity {
    pub fn probe() -> Self {
        let physical_memory_bytes = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|contents| parse_meminfo_total(&contents));
        let fd_limit = fs::read_to_string("/proc/self/limits")
            .ok()
            .and_then(|contents| parse_open_files_limit(&contents))
            .unwrap_or(FALLBACK_FD_LIMIT);
        Self {
            physical_memory_bytes,
            fd_limit,
        }
    }

    /// Unknown memory never counts as low.
    pub fn is_low_memory(&self) -> bool {
        self.physical_memory_bytes
            .is_some_and(|bytes| bytes < LOW_MEMORY_THRESHOLD_BYTES)
    }
}

/// `MemTotal` from `/proc/meminfo`, in bytes.
pub fn parse_meminfo_total(contents: &str) -> Option<u64> {
    for line in contents.lines() {
        let Some(rest) = line.strip_prefix("MemTotal:") else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let value = parts.next()?.parse::<u64>().ok()?;
        return match parts.next() {
            Some("kB") | None => Some(value.saturating_mul(1024)),
            Some(_) => None,
        };
    }
    None
}

/// Soft "Max open files" limit from `/proc/self/limits`.
pub fn parse_open_files_limit(contents: &str) -> Option<u64> {
    for line in contents.lines() {
        let Some(rest) = line.strip_prefix("Max open files") else {
            continue;
        };
        let soft = rest.split_whitespace().next()?;
        if soft == "unlimited" {
            return Some(u64::MAX);
        }
        return soft.parse::<u64>().ok();
    }
    None
}
