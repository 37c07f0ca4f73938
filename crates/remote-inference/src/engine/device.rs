//! Host device probing (GPUs via NVML, CPU cores, RAM).

use nvml_wrapper::Nvml;
use sysinfo::System;
use tracing::{debug, info};

use super::types::{DeviceInfo, VramUsage};

/// Probe the host. `gpu_layers` is how many layers the engine asks to offload;
/// offloading is only reported when a GPU is actually present.
pub fn probe(gpu_layers: u32) -> DeviceInfo {
    let (gpu_devices, vram) = probe_gpus();
    let gpu = !gpu_devices.is_empty();
    DeviceInfo {
        gpu,
        gpu_offloading: gpu && gpu_layers > 0,
        gpu_devices,
        vram,
        cpu_cores: num_cpus::get(),
    }
}

fn probe_gpus() -> (Vec<String>, Option<VramUsage>) {
    let nvml = match Nvml::init() {
        Ok(nvml) => nvml,
        Err(e) => {
            debug!("NVML unavailable: {}", e);
            return (Vec::new(), None);
        }
    };
    let count = nvml.device_count().unwrap_or(0);
    let mut names = Vec::with_capacity(count as usize);
    let mut total = VramUsage { total: 0, used: 0, free: 0 };
    let mut any_memory = false;

    for index in 0..count {
        let Ok(device) = nvml.device_by_index(index) else {
            continue;
        };
        names.push(device.name().unwrap_or_else(|_| format!("GPU {}", index)));
        if let Ok(memory) = device.memory_info() {
            total.total += memory.total;
            total.used += memory.used;
            total.free += memory.free;
            any_memory = true;
        }
    }
    (names, any_memory.then_some(total))
}

/// Layers to offload when `GPU_LAYERS=auto`, sized by the first GPU's VRAM.
pub fn auto_gpu_layers() -> u32 {
    if let Ok(nvml) = Nvml::init() {
        if let Ok(first_gpu) = nvml.device_by_index(0) {
            if let Ok(memory) = first_gpu.memory_info() {
                let vram_gb = memory.total / 1024 / 1024 / 1024;
                let layers = match vram_gb {
                    0..=4 => 12,
                    5..=8 => 20,
                    9..=12 => 32,
                    13..=16 => 40,
                    _ => 99,
                };
                info!("Auto‑detected GPU layers: {} ({} GB VRAM)", layers, vram_gb);
                return layers;
            }
        }
    }
    debug!("No GPU detected, running on CPU");
    0
}

/// Threads to give the backend when `THREADS=auto`.
pub fn auto_threads() -> u32 {
    let cores = num_cpus::get() as u32;
    match cores {
        1..=2 => 1,
        3..=4 => (cores * 2) / 3,
        5..=8 => (cores * 3) / 5,
        9..=16 => cores / 2,
        17..=32 => (cores * 2) / 5,
        _ => 16,
    }
}

/// Total system RAM in bytes.
pub fn total_memory_bytes() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory()
}
