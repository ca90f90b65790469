//! GPU discovery and the metrics sampler.
//!
//! Real hardware is enumerated by a helper binary that prints a JSON device
//! list on stdout; development setups advertise synthetic devices instead.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use fleet_core::model::{Gpu, GpuMetrics};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::state::AgentRuntime;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

const SYNTHETIC_VRAM: u64 = 24 * 1024 * 1024 * 1024;

/// Enumerate devices by running the helper binary.
pub async fn detect_gpus(renderer_path: &Path) -> anyhow::Result<Vec<Gpu>> {
    let output = tokio::process::Command::new(renderer_path)
        .arg("--dump-gpus")
        .output()
        .await
        .with_context(|| format!("failed to run {}", renderer_path.display()))?;

    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            renderer_path.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let gpus: Vec<Gpu> = serde_json::from_slice(&output.stdout)
        .with_context(|| format!("invalid device list from {}", renderer_path.display()))?;
    if gpus.is_empty() {
        bail!("{} reported no devices", renderer_path.display());
    }

    info!("detected {} GPUs", gpus.len());
    Ok(gpus)
}

/// A uniform list of 24 GB development devices.
pub fn synthetic_gpus(count: u32) -> Vec<Gpu> {
    (0..count)
        .map(|i| Gpu {
            name: "Synthetic".to_string(),
            vendor: "Fleet".to_string(),
            pci_bus: format!("0000:{:02x}:00.0", i),
            driver_version: "0.0".to_string(),
            vram: SYNTHETIC_VRAM,
            tags: vec![],
            metrics: GpuMetrics::default(),
        })
        .collect()
}

/// Refresh per-device metrics until cancellation. VRAM use is derived from
/// the registry's live reservations; the remaining metrics keep whatever the
/// enumeration reported.
pub async fn run_sampler(runtime: Arc<AgentRuntime>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                let reservations = runtime.registry.reservations();
                runtime.with_gpus_mut(|gpus| {
                    for (index, gpu) in gpus.iter_mut().enumerate() {
                        let reserved = reservations
                            .get(&(index as u32))
                            .copied()
                            .unwrap_or(0);
                        gpu.metrics.vram_used = reserved.min(gpu.vram);
                    }
                });
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_gpus_shape() {
        let gpus = synthetic_gpus(3);
        assert_eq!(gpus.len(), 3);
        assert_eq!(gpus[0].vram, SYNTHETIC_VRAM);
        assert_ne!(gpus[0].pci_bus, gpus[2].pci_bus);
        assert_eq!(gpus[1].metrics.vram_used, 0);
    }

    #[test]
    fn test_synthetic_gpus_zero() {
        assert!(synthetic_gpus(0).is_empty());
    }
}
