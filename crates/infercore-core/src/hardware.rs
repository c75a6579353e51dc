//! Hardware Probe (C1).
//!
//! Detects available devices, memory, and accelerators and returns a
//! capability snapshot, cached for a short interval to avoid repeated
//! syscalls. Probe failures are non-fatal: a minimum `{CPU}` capability is
//! always returned.
//!
//! CPU count comes from `num_cpus::get()`; memory totals come from
//! `sysinfo`, both behind a `parking_lot::RwLock`-guarded cache.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::DeviceKind;

const CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub id: String,
    pub mem_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareCapabilities {
    pub total_mem_bytes: u64,
    pub avail_mem_bytes: u64,
    pub devices: Vec<DeviceInfo>,
    pub cuda_available: bool,
}

impl HardwareCapabilities {
    fn cpu_only() -> Self {
        Self {
            total_mem_bytes: 0,
            avail_mem_bytes: 0,
            devices: vec![DeviceInfo { kind: DeviceKind::Cpu, id: "cpu0".into(), mem_bytes: 0 }],
            cuda_available: false,
        }
    }

    pub fn has_device(&self, kind: &DeviceKind) -> bool {
        self.devices.iter().any(|d| &d.kind == kind)
    }
}

struct Cached {
    value: HardwareCapabilities,
    at: Instant,
}

/// Process-wide probe with a short-TTL cache, constructed explicitly at
/// startup as an owned object rather than a `lazy_static`/`OnceCell`.
pub struct HardwareProbe {
    cache: RwLock<Option<Cached>>,
}

impl Default for HardwareProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareProbe {
    pub fn new() -> Self {
        Self { cache: RwLock::new(None) }
    }

    /// Returns the cached snapshot if still fresh, otherwise probes again.
    /// Never fails: on any detection error the minimum `{CPU}` capability
    /// is returned instead.
    pub fn detect(&self) -> HardwareCapabilities {
        if let Some(cached) = self.cache.read().as_ref() {
            if cached.at.elapsed() < CACHE_TTL {
                return cached.value.clone();
            }
        }

        let value = Self::probe();
        *self.cache.write() = Some(Cached { value: value.clone(), at: Instant::now() });
        value
    }

    fn probe() -> HardwareCapabilities {
        let mut sys = System::new();
        sys.refresh_memory();
        let total_mem_bytes = sys.total_memory();
        let avail_mem_bytes = sys.available_memory();

        if total_mem_bytes == 0 {
            tracing::warn!(event = "hardware_probe_degraded", "memory probe returned 0, falling back to CPU-only capability");
            return HardwareCapabilities::cpu_only();
        }

        let cpu_count = num_cpus::get().max(1);
        let mut devices = vec![DeviceInfo {
            kind: DeviceKind::Cpu,
            id: "cpu0".into(),
            mem_bytes: avail_mem_bytes,
        }];

        // The core has no native FFI of its own (§1 scope); CUDA/Metal/
        // ROCm/TPU/NPU presence is reported by the runner backends
        // through their own capability probes and merged in by whatever
        // assembles the inventory at startup. We still surface a
        // `cuda_available` bit here based on the most common discovery
        // signal (a CUDA driver library present on the loader path) so
        // selection's filter (§4.3 #2) has something to check even before
        // any GGUF/ONNX runner reports in.
        let cuda_available = Self::cuda_driver_present();
        if cuda_available {
            devices.push(DeviceInfo { kind: DeviceKind::Cuda, id: "cuda0".into(), mem_bytes: 0 });
        }

        tracing::info!(
            event = "hardware_probe",
            total_mem_bytes,
            avail_mem_bytes,
            cpu_count,
            cuda_available,
            "hardware capabilities detected"
        );

        HardwareCapabilities { total_mem_bytes, avail_mem_bytes, devices, cuda_available }
    }

    #[cfg(target_os = "linux")]
    fn cuda_driver_present() -> bool {
        std::path::Path::new("/usr/lib/x86_64-linux-gnu/libcuda.so").exists()
            || std::path::Path::new("/usr/lib/libcuda.so").exists()
    }

    #[cfg(not(target_os = "linux"))]
    fn cuda_driver_present() -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_always_reports_cpu() {
        let probe = HardwareProbe::new();
        let caps = probe.detect();
        assert!(caps.has_device(&DeviceKind::Cpu));
    }

    #[test]
    fn detect_caches_within_ttl() {
        let probe = HardwareProbe::new();
        let first = probe.detect();
        let second = probe.detect();
        assert_eq!(first.total_mem_bytes, second.total_mem_bytes);
    }

    #[test]
    fn cpu_only_fallback_has_zero_memory_but_one_device() {
        let caps = HardwareCapabilities::cpu_only();
        assert_eq!(caps.devices.len(), 1);
        assert!(caps.has_device(&DeviceKind::Cpu));
    }
}
