//! Shared agent state handed to HTTP handlers and background loops.

use std::collections::BTreeMap;
use std::sync::Mutex;

use fleet_core::gpu::GpuSet;
use fleet_core::model::{Gpu, GpuMetrics};
use uuid::Uuid;

use crate::registry::SessionRegistry;

pub struct AgentRuntime {
    pub hostname: String,
    /// Address clients reach this agent on; the `--expose` value when
    /// controller-connected, otherwise the local bind address.
    pub address: String,
    pub version: String,
    pub pool_id: Option<Uuid>,
    pub labels: BTreeMap<String, String>,
    pub taints: BTreeMap<String, String>,
    /// Device list with live metrics; written by the sampler, copied out by
    /// readers. Never held across an await point.
    gpus: Mutex<Vec<Gpu>>,
    pub registry: SessionRegistry,
    /// When connected to a controller, sessions only arrive via assignment
    /// and the local request endpoint is not mounted.
    pub controller_connected: bool,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hostname: String,
        address: String,
        pool_id: Option<Uuid>,
        labels: BTreeMap<String, String>,
        taints: BTreeMap<String, String>,
        gpus: Vec<Gpu>,
        registry: SessionRegistry,
        controller_connected: bool,
    ) -> Self {
        Self {
            hostname,
            address,
            version: env!("CARGO_PKG_VERSION").to_string(),
            pool_id,
            labels,
            taints,
            gpus: Mutex::new(gpus),
            registry,
            controller_connected,
        }
    }

    pub fn snapshot_gpus(&self) -> Vec<Gpu> {
        self.gpus.lock().expect("gpu lock").clone()
    }

    pub fn snapshot_gpu_metrics(&self) -> Vec<GpuMetrics> {
        self.gpus
            .lock()
            .expect("gpu lock")
            .iter()
            .map(|g| g.metrics.clone())
            .collect()
    }

    /// Apply sampled metrics under the lock; `update` runs synchronously.
    pub fn with_gpus_mut(&self, update: impl FnOnce(&mut Vec<Gpu>)) {
        update(&mut self.gpus.lock().expect("gpu lock"));
    }

    /// The device set with current session reservations already deducted,
    /// for local capacity decisions.
    pub fn free_gpu_set(&self) -> GpuSet {
        let mut set = GpuSet::new(self.snapshot_gpus());
        let reservations: Vec<fleet_core::model::SessionGpu> = self
            .registry
            .reservations()
            .into_iter()
            .map(|(index, vram_reserved)| fleet_core::model::SessionGpu { index, vram_reserved })
            .collect();
        if set.select(&reservations).is_err() {
            // Accounting drift; report no capacity rather than overcommit.
            tracing::warn!("session reservations exceed device capacity");
            let empty = GpuSet::new(vec![]);
            return empty;
        }
        set
    }
}
