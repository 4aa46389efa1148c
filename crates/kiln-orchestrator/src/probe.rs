//! Accelerator memory probing.
//!
//! Two strategies, in order of preference:
//!
//! 1. [`NvmlProbe`] — queries the NVIDIA driver through `nvidia-smi`. This is
//!    the accurate view: it includes allocations made by engine worker
//!    subprocesses that in-process allocator statistics never see.
//! 2. [`HostMemoryProbe`] — host memory via `sysinfo`, used as a
//!    unified-memory approximation when no NVIDIA driver answers.
//!
//! Probing uses process invocation rather than linking driver libraries at
//! compile time, keeping the crate buildable on machines without CUDA.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use kiln_core::GpuStatus;
use parking_lot::Mutex;
use sysinfo::{Disks, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, info};

/// A cheap, synchronous sampler of accelerator memory.
pub trait MemoryProbe: Send + Sync {
    /// Sample `(total, used, free)` in MB.
    fn gpu_status(&self) -> GpuStatus;
}

/// Pick the best probe available on this host.
pub fn detect() -> Arc<dyn MemoryProbe> {
    if NvmlProbe::available() {
        info!("memory probe: nvidia-smi driver query");
        Arc::new(NvmlProbe)
    } else {
        info!("memory probe: host memory fallback (no NVIDIA driver visible)");
        Arc::new(HostMemoryProbe)
    }
}

/// Driver-accurate probe backed by `nvidia-smi`.
pub struct NvmlProbe;

impl NvmlProbe {
    /// Whether `nvidia-smi` answers on this host.
    pub fn available() -> bool {
        Path::new("/dev/nvidia0").exists()
            || Command::new("nvidia-smi")
                .arg("--list-gpus")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
    }

    fn query() -> Option<GpuStatus> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=memory.total,memory.used,memory.free",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .ok()?;

        if !output.status.success() {
            return None;
        }

        // nvidia-smi reports MiB; one line per device, first device wins.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.trim().lines().next()?;
        let mut fields = line.split(',').map(|f| f.trim().parse::<u64>());

        let total = fields.next()?.ok()?;
        let used = fields.next()?.ok()?;
        let free = fields.next()?.ok()?;
        Some(GpuStatus::new(total, used, free))
    }
}

impl MemoryProbe for NvmlProbe {
    fn gpu_status(&self) -> GpuStatus {
        match Self::query() {
            Some(status) => status,
            None => {
                debug!("nvidia-smi query failed, reporting unavailable");
                GpuStatus::unavailable()
            }
        }
    }
}

/// Host-memory fallback probe.
///
/// Treats system RAM as unified accelerator memory. Under-reports memory
/// held by engine subprocesses on discrete-GPU hosts, which is why the
/// driver probe is preferred whenever it answers.
pub struct HostMemoryProbe;

impl MemoryProbe for HostMemoryProbe {
    fn gpu_status(&self) -> GpuStatus {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let total = sys.total_memory() / 1024 / 1024;
        let free = sys.available_memory() / 1024 / 1024;
        let used = total.saturating_sub(free);
        GpuStatus::new(total, used, free)
    }
}

/// A probe returning a settable snapshot. Used by tests and by dev setups
/// with no accelerator where a fixed budget is simpler than host memory.
#[derive(Clone)]
pub struct StaticProbe {
    status: Arc<Mutex<GpuStatus>>,
}

impl StaticProbe {
    pub fn new(status: GpuStatus) -> Self {
        Self {
            status: Arc::new(Mutex::new(status)),
        }
    }

    /// Replace the snapshot returned by subsequent samples.
    pub fn set(&self, status: GpuStatus) {
        *self.status.lock() = status;
    }

    /// Mark `mb` as freed: moves that amount from `used` to `free`.
    pub fn release(&self, mb: u64) {
        let mut status = self.status.lock();
        status.used_mb = status.used_mb.saturating_sub(mb);
        status.free_mb = (status.free_mb + mb).min(status.total_mb);
    }

    /// Mark `mb` as consumed: moves that amount from `free` to `used`.
    pub fn consume(&self, mb: u64) {
        let mut status = self.status.lock();
        status.free_mb = status.free_mb.saturating_sub(mb);
        status.used_mb = (status.used_mb + mb).min(status.total_mb);
    }
}

impl MemoryProbe for StaticProbe {
    fn gpu_status(&self) -> GpuStatus {
        *self.status.lock()
    }
}

/// Disk usage of the partition holding the model weight cache, in GB.
///
/// Returns `None` when the cache path matches no mounted disk.
pub fn cache_disk_usage() -> Option<(f64, f64, f64)> {
    let cache_dir = std::env::var("HF_HOME").map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
        Path::new(&home).join(".cache").join("huggingface")
    });

    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|d| cache_dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())?;

    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    let total = disk.total_space() as f64 / GB;
    let free = disk.available_space() as f64 / GB;
    let used = total - free;
    Some((total, used, free))
}
