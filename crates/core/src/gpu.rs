//! GPU set algebra: selection and reservation arithmetic over an agent's
//! ordered device list. Used by the controller's matcher and by the agent's
//! own capacity accounting, so the math must agree on both sides.

use crate::error::Error;
use crate::model::{Gpu, GpuRequirement, SessionGpu};

/// An ordered device list plus per-device free-VRAM accounting.
#[derive(Debug, Clone)]
pub struct GpuSet {
    gpus: Vec<Gpu>,
    /// Free bytes per device, positionally matching `gpus`.
    available: Vec<u64>,
}

/// A committed subset of a [`GpuSet`], describing one session's reservation.
#[derive(Debug, Clone)]
pub struct SelectedGpuSet {
    gpus: Vec<SessionGpu>,
}

impl SelectedGpuSet {
    pub fn gpus(&self) -> &[SessionGpu] {
        &self.gpus
    }

    pub fn into_gpus(self) -> Vec<SessionGpu> {
        self.gpus
    }
}

impl GpuSet {
    pub fn new(gpus: Vec<Gpu>) -> Self {
        let available = gpus.iter().map(|g| g.vram).collect();
        Self { gpus, available }
    }

    pub fn count(&self) -> usize {
        self.gpus.len()
    }

    pub fn total_vram(&self) -> u64 {
        self.gpus.iter().map(|g| g.vram).sum()
    }

    pub fn gpus(&self) -> &[Gpu] {
        &self.gpus
    }

    pub fn available(&self, index: u32) -> Option<u64> {
        self.available.get(index as usize).copied()
    }

    /// Reserve VRAM in place. Errors leave the set untouched, so a failed
    /// select never corrupts the accounting.
    pub fn select(&mut self, reservations: &[SessionGpu]) -> Result<SelectedGpuSet, Error> {
        let mut staged = self.available.clone();
        for r in reservations {
            let slot = staged
                .get_mut(r.index as usize)
                .ok_or(Error::GpuIndexOutOfRange(r.index))?;
            if *slot < r.vram_reserved {
                return Err(Error::GpuOvercommitted {
                    index: r.index,
                    requested: r.vram_reserved,
                    available: *slot,
                });
            }
            *slot -= r.vram_reserved;
        }
        self.available = staged;
        Ok(SelectedGpuSet { gpus: reservations.to_vec() })
    }

    /// Release a previous reservation, clamped to each device's capacity.
    pub fn release(&mut self, reservations: &[SessionGpu]) {
        for r in reservations {
            if let (Some(slot), Some(gpu)) = (
                self.available.get_mut(r.index as usize),
                self.gpus.get(r.index as usize),
            ) {
                *slot = (*slot + r.vram_reserved).min(gpu.vram);
            }
        }
    }

    /// Non-mutating candidate search: for each requirement, in the order
    /// given, take the lowest-indexed device not yet chosen that satisfies
    /// vendor, tags, and free VRAM. Deterministic for a fixed set.
    pub fn find(&self, requirements: &[GpuRequirement]) -> Option<SelectedGpuSet> {
        if requirements.is_empty() {
            return None;
        }

        let mut staged = self.available.clone();
        let mut taken = vec![false; self.gpus.len()];
        let mut selection = Vec::with_capacity(requirements.len());

        'next_requirement: for req in requirements {
            for (index, gpu) in self.gpus.iter().enumerate() {
                if taken[index] || !requirement_matches(req, gpu) {
                    continue;
                }
                if staged[index] < req.vram_at_least {
                    continue;
                }
                taken[index] = true;
                staged[index] -= req.vram_at_least;
                selection.push(SessionGpu {
                    index: index as u32,
                    vram_reserved: req.vram_at_least,
                });
                continue 'next_requirement;
            }
            return None;
        }

        Some(SelectedGpuSet { gpus: selection })
    }
}

/// Vendor and tag predicate; VRAM is checked against the live accounting.
fn requirement_matches(req: &GpuRequirement, gpu: &Gpu) -> bool {
    if let Some(vendor) = &req.vendor {
        if !vendor.eq_ignore_ascii_case(&gpu.vendor) {
            return false;
        }
    }
    req.tags.iter().all(|tag| gpu.tags.contains(tag))
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1 << 30;

    fn gpu(name: &str, vram: u64) -> Gpu {
        Gpu {
            name: name.to_string(),
            vendor: "TestVendor".to_string(),
            pci_bus: "0000:00:00.0".to_string(),
            driver_version: "1.0".to_string(),
            vram,
            tags: vec![],
            metrics: Default::default(),
        }
    }

    fn require(vram: u64) -> GpuRequirement {
        GpuRequirement { vram_at_least: vram, ..Default::default() }
    }

    #[test]
    fn test_find_prefers_lowest_index() {
        let set = GpuSet::new(vec![gpu("a", 24 * GB), gpu("b", 24 * GB)]);
        let selected = set.find(&[require(8 * GB)]).unwrap();
        assert_eq!(selected.gpus(), &[SessionGpu { index: 0, vram_reserved: 8 * GB }]);
    }

    #[test]
    fn test_find_assigns_distinct_devices() {
        let set = GpuSet::new(vec![gpu("a", 24 * GB), gpu("b", 24 * GB)]);
        let selected = set.find(&[require(8 * GB), require(8 * GB)]).unwrap();
        let indices: Vec<u32> = selected.gpus().iter().map(|g| g.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_find_skips_busy_device() {
        let mut set = GpuSet::new(vec![gpu("a", 24 * GB), gpu("b", 24 * GB)]);
        set.select(&[SessionGpu { index: 0, vram_reserved: 20 * GB }]).unwrap();
        let selected = set.find(&[require(8 * GB)]).unwrap();
        assert_eq!(selected.gpus()[0].index, 1);
    }

    #[test]
    fn test_find_fails_when_nothing_fits() {
        let set = GpuSet::new(vec![gpu("a", 8 * GB)]);
        assert!(set.find(&[require(16 * GB)]).is_none());
    }

    #[test]
    fn test_find_empty_requirements_is_no_match() {
        let set = GpuSet::new(vec![gpu("a", 8 * GB)]);
        assert!(set.find(&[]).is_none());
    }

    #[test]
    fn test_find_does_not_mutate() {
        let set = GpuSet::new(vec![gpu("a", 24 * GB)]);
        set.find(&[require(8 * GB)]).unwrap();
        assert_eq!(set.available(0), Some(24 * GB));
    }

    #[test]
    fn test_find_vendor_filter() {
        let mut nv = gpu("a", 24 * GB);
        nv.vendor = "NVIDIA".to_string();
        let set = GpuSet::new(vec![nv]);

        let mut req = require(8 * GB);
        req.vendor = Some("nvidia".to_string());
        assert!(set.find(std::slice::from_ref(&req)).is_some());

        req.vendor = Some("AMD".to_string());
        assert!(set.find(&[req]).is_none());
    }

    #[test]
    fn test_find_tag_filter() {
        let mut tagged = gpu("a", 24 * GB);
        tagged.tags = vec!["nvlink".to_string(), "fp8".to_string()];
        let set = GpuSet::new(vec![tagged]);

        let mut req = require(8 * GB);
        req.tags = vec!["fp8".to_string()];
        assert!(set.find(std::slice::from_ref(&req)).is_some());

        req.tags = vec!["fp8".to_string(), "mig".to_string()];
        assert!(set.find(&[req]).is_none());
    }

    #[test]
    fn test_select_deducts_and_release_restores() {
        let mut set = GpuSet::new(vec![gpu("a", 24 * GB)]);
        let reservation = [SessionGpu { index: 0, vram_reserved: 16 * GB }];
        set.select(&reservation).unwrap();
        assert_eq!(set.available(0), Some(8 * GB));
        set.release(&reservation);
        assert_eq!(set.available(0), Some(24 * GB));
    }

    #[test]
    fn test_select_overcommit_errors_and_leaves_set_untouched() {
        let mut set = GpuSet::new(vec![gpu("a", 8 * GB), gpu("b", 8 * GB)]);
        let err = set
            .select(&[
                SessionGpu { index: 1, vram_reserved: 4 * GB },
                SessionGpu { index: 0, vram_reserved: 12 * GB },
            ])
            .unwrap_err();
        assert!(matches!(err, Error::GpuOvercommitted { index: 0, .. }));
        // The partial deduction on index 1 must have been rolled back.
        assert_eq!(set.available(1), Some(8 * GB));
    }

    #[test]
    fn test_select_out_of_range() {
        let mut set = GpuSet::new(vec![gpu("a", 8 * GB)]);
        let err = set.select(&[SessionGpu { index: 3, vram_reserved: GB }]).unwrap_err();
        assert!(matches!(err, Error::GpuIndexOutOfRange(3)));
    }
}
