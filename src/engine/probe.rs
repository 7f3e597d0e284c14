//! Process-wide hardware capability probe.
//!
//! Picks the best CPU kernel variant from an ordered candidate list (falling back to
//! the generic build) and enumerates GPUs when compiled with the `cuda` feature.
//! The probe runs once; [`capabilities`] returns the cached result.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::info;

/// CPU kernel variants, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuVariant {
    X86Avx512,
    X86Avx2,
    Arm64Neon,
    Generic,
}

/// Order in which variants are tried.
pub const CANDIDATES: [CpuVariant; 4] = [
    CpuVariant::X86Avx512,
    CpuVariant::X86Avx2,
    CpuVariant::Arm64Neon,
    CpuVariant::Generic,
];

impl CpuVariant {
    pub fn name(&self) -> &'static str {
        match self {
            CpuVariant::X86Avx512 => "x86-avx512",
            CpuVariant::X86Avx2 => "x86-avx2",
            CpuVariant::Arm64Neon => "arm64-neon",
            CpuVariant::Generic => "generic",
        }
    }

    /// Whether the running CPU can execute this variant.
    pub fn supported(&self) -> bool {
        match self {
            #[cfg(target_arch = "x86_64")]
            CpuVariant::X86Avx512 => std::arch::is_x86_feature_detected!("avx512f"),
            #[cfg(target_arch = "x86_64")]
            CpuVariant::X86Avx2 => {
                std::arch::is_x86_feature_detected!("avx2")
                    && std::arch::is_x86_feature_detected!("fma")
            }
            #[cfg(target_arch = "aarch64")]
            CpuVariant::Arm64Neon => std::arch::is_aarch64_feature_detected!("neon"),
            CpuVariant::Generic => true,
            #[allow(unreachable_patterns)]
            _ => false,
        }
    }
}

/// Information about a single GPU device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDeviceInfo {
    /// Device index.
    pub id: usize,

    /// Device name.
    pub name: String,

    /// Total VRAM in bytes (0 if unknown).
    pub total_vram: usize,
}

/// Result of the capability probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub cpu_variant: CpuVariant,
    pub logical_cpus: usize,
    pub gpu_devices: Vec<GpuDeviceInfo>,
    pub target: String,
}

impl Capabilities {
    pub fn gpu_count(&self) -> usize {
        self.gpu_devices.len()
    }
}

/// First candidate accepted by `supported`, or [`CpuVariant::Generic`].
pub fn resolve_variant(supported: impl Fn(CpuVariant) -> bool) -> CpuVariant {
    CANDIDATES
        .iter()
        .copied()
        .find(|v| supported(*v))
        .unwrap_or(CpuVariant::Generic)
}

/// Run the probe. Prefer [`capabilities`], which caches the result.
pub fn probe() -> Capabilities {
    let cpu_variant = resolve_variant(|v| v.supported());
    let logical_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let gpu_devices = detect_gpus();

    info!(
        cpu_variant = cpu_variant.name(),
        logical_cpus,
        gpus = gpu_devices.len(),
        "Capability probe complete"
    );

    Capabilities {
        cpu_variant,
        logical_cpus,
        gpu_devices,
        target: env!("ONDEVICE_TARGET").to_string(),
    }
}

static CAPABILITIES: OnceLock<Capabilities> = OnceLock::new();

/// Process-wide probe result.
pub fn capabilities() -> &'static Capabilities {
    CAPABILITIES.get_or_init(probe)
}

#[cfg(feature = "cuda")]
fn detect_gpus() -> Vec<GpuDeviceInfo> {
    use cudarc::driver::result;
    use tracing::warn;

    if let Err(e) = result::init() {
        warn!(error = %e, "CUDA driver unavailable, running in CPU-only mode");
        return Vec::new();
    }
    let count = match result::device::get_count() {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "Failed to count CUDA devices");
            return Vec::new();
        }
    };

    (0..count)
        .map(|ordinal| {
            let total_vram = result::device::get(ordinal)
                .ok()
                .and_then(|dev| unsafe { result::device::total_mem(dev) }.ok())
                .unwrap_or(0);
            GpuDeviceInfo {
                id: ordinal as usize,
                name: format!("cuda:{ordinal}"),
                total_vram,
            }
        })
        .collect()
}

#[cfg(not(feature = "cuda"))]
fn detect_gpus() -> Vec<GpuDeviceInfo> {
    info!("CUDA not enabled, running in CPU-only mode");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_first_supported() {
        let v = resolve_variant(|v| matches!(v, CpuVariant::X86Avx2 | CpuVariant::Generic));
        assert_eq!(v, CpuVariant::X86Avx2);
    }

    #[test]
    fn test_resolve_falls_back_to_generic() {
        assert_eq!(resolve_variant(|_| false), CpuVariant::Generic);
    }

    #[test]
    fn test_capabilities_cached() {
        let a = capabilities() as *const Capabilities;
        let b = capabilities() as *const Capabilities;
        assert_eq!(a, b);
        assert!(capabilities().cpu_variant.supported());
        assert!(capabilities().logical_cpus >= 1);
    }
}
