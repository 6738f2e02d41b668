//! Operating-system metrics used for load shedding and resource health.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

/// Virtual memory snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub percent: f64,
}

/// Usage of the filesystem holding a path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub mount_point: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub percent: f64,
}

/// Source of OS-level metrics.
pub trait SystemMetricsProvider: Send + Sync {
    /// Global CPU usage in percent.
    fn cpu_percent(&self) -> f64;

    fn virtual_memory(&self) -> MemoryInfo;

    /// Usage of the disk containing `path`, if it can be determined.
    fn disk_usage(&self, path: &Path) -> Option<DiskUsage>;

    /// Open file descriptors of this process.
    fn open_fd_count(&self) -> Option<u64>;

    /// Open TCP connections on the host.
    fn connection_count(&self) -> Option<u64>;

    /// Database pool connections in use, if the process has a database.
    fn db_connection_count(&self) -> Option<u64> {
        None
    }
}

/// [`SystemMetricsProvider`] backed by `sysinfo` and `/proc`.
pub struct SysinfoProvider {
    system: Mutex<System>,
    disks: Mutex<Disks>,
}

impl SysinfoProvider {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing()
                    .with_cpu(CpuRefreshKind::everything())
                    .with_memory(MemoryRefreshKind::everything()),
            )),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }
}

impl Default for SysinfoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMetricsProvider for SysinfoProvider {
    fn cpu_percent(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_cpu_all();
        system.global_cpu_usage() as f64
    }

    fn virtual_memory(&self) -> MemoryInfo {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total_bytes = system.total_memory();
        let used_bytes = system.used_memory();
        MemoryInfo {
            total_bytes,
            used_bytes,
            percent: percent_of(used_bytes, total_bytes),
        }
    }

    fn disk_usage(&self, path: &Path) -> Option<DiskUsage> {
        let mut disks = self.disks.lock();
        disks.refresh(true);

        // Longest matching mount point wins.
        let path = path.to_string_lossy();
        let disk = disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point().to_string_lossy().as_ref()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())?;

        let total_bytes = disk.total_space();
        let available_bytes = disk.available_space();
        Some(DiskUsage {
            mount_point: disk.mount_point().to_path_buf(),
            total_bytes,
            available_bytes,
            percent: percent_of(total_bytes.saturating_sub(available_bytes), total_bytes),
        })
    }

    fn open_fd_count(&self) -> Option<u64> {
        proc_fd_count()
    }

    fn connection_count(&self) -> Option<u64> {
        proc_tcp_connections()
    }
}

fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

#[cfg(target_os = "linux")]
fn proc_fd_count() -> Option<u64> {
    std::fs::read_dir("/proc/self/fd")
        .ok()
        .map(|entries| entries.count() as u64)
}

#[cfg(not(target_os = "linux"))]
fn proc_fd_count() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn proc_tcp_connections() -> Option<u64> {
    let mut total = None;
    for file in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(file) {
            let rows = content.lines().skip(1).filter(|l| !l.trim().is_empty()).count();
            *total.get_or_insert(0) += rows as u64;
        }
    }
    total
}

#[cfg(not(target_os = "linux"))]
fn proc_tcp_connections() -> Option<u64> {
    None
}

/// Provider returning values set by the caller. Used for tests and dry runs.
#[derive(Debug, Default)]
pub struct StaticMetricsProvider {
    values: Mutex<StaticValues>,
}

#[derive(Debug, Clone, Default)]
struct StaticValues {
    cpu: f64,
    memory: f64,
    disk: Option<f64>,
    fds: Option<u64>,
    connections: Option<u64>,
}

impl StaticMetricsProvider {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self {
            values: Mutex::new(StaticValues {
                cpu,
                memory,
                ..Default::default()
            }),
        }
    }

    pub fn set_cpu(&self, cpu: f64) {
        self.values.lock().cpu = cpu;
    }

    pub fn set_memory(&self, memory: f64) {
        self.values.lock().memory = memory;
    }

    pub fn set_disk(&self, percent: f64) {
        self.values.lock().disk = Some(percent);
    }

    pub fn set_open_fds(&self, count: u64) {
        self.values.lock().fds = Some(count);
    }

    pub fn set_connections(&self, count: u64) {
        self.values.lock().connections = Some(count);
    }
}

impl SystemMetricsProvider for StaticMetricsProvider {
    fn cpu_percent(&self) -> f64 {
        self.values.lock().cpu
    }

    fn virtual_memory(&self) -> MemoryInfo {
        let percent = self.values.lock().memory;
        MemoryInfo {
            total_bytes: 100,
            used_bytes: percent.round() as u64,
            percent,
        }
    }

    fn disk_usage(&self, path: &Path) -> Option<DiskUsage> {
        self.values.lock().disk.map(|percent| DiskUsage {
            mount_point: path.to_path_buf(),
            total_bytes: 100,
            available_bytes: (100.0 - percent).max(0.0).round() as u64,
            percent,
        })
    }

    fn open_fd_count(&self) -> Option<u64> {
        self.values.lock().fds
    }

    fn connection_count(&self) -> Option<u64> {
        self.values.lock().connections
    }
}
