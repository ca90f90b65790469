//! Fleet-wide aggregation: counts by state, per-GPU-name VRAM totals, and
//! free-VRAM percentiles over GB-sized buckets.

use std::collections::{BTreeMap, HashMap};

use fleet_core::model::Gpu;
use serde::Serialize;
use sqlx::types::Json;

use super::error::StoreError;
use super::Store;

const GB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Percentiles {
    pub p10: i64,
    pub p25: i64,
    pub p50: i64,
    pub p75: i64,
    pub p90: i64,
    pub p100: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct AggregatedData {
    pub agents: i64,
    pub agents_by_state: HashMap<String, i64>,
    pub sessions: i64,
    pub sessions_by_state: HashMap<String, i64>,

    pub gpus: i64,
    pub gpus_by_name: HashMap<String, i64>,
    pub vram: u64,
    pub vram_by_name: HashMap<String, u64>,
    pub vram_used: u64,
    pub vram_used_by_name: HashMap<String, u64>,

    /// Mean GPU utilization in percent, fleet-wide and per device name.
    pub utilization: f64,
    pub utilization_by_name: HashMap<String, f64>,
    /// Mean power draw in watts.
    pub power_draw_w: f64,
    pub power_draw_w_by_name: HashMap<String, f64>,

    pub vram_gb_available: Percentiles,
    pub vram_gb_available_by_name: HashMap<String, Percentiles>,
}

impl Store {
    /// One snapshot of the whole fleet, computed from active agents only.
    pub async fn aggregate_data(&self) -> Result<AggregatedData, StoreError> {
        let mut data = AggregatedData {
            agents: sqlx::query_scalar("SELECT COUNT(*) FROM agents")
                .fetch_one(self.pool())
                .await?,
            sessions: sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
                .fetch_one(self.pool())
                .await?,
            ..Default::default()
        };

        let agent_counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT state::text, COUNT(*) FROM agents GROUP BY state")
                .fetch_all(self.pool())
                .await?;
        data.agents_by_state = agent_counts.into_iter().collect();

        let session_counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT state::text, COUNT(*) FROM sessions GROUP BY state")
                .fetch_all(self.pool())
                .await?;
        data.sessions_by_state = session_counts.into_iter().collect();

        let gpu_lists: Vec<Json<Vec<Gpu>>> =
            sqlx::query_scalar("SELECT gpus FROM agents WHERE state = 'active'")
                .fetch_all(self.pool())
                .await?;

        fold_gpu_stats(gpu_lists.iter().map(|l| l.0.as_slice()), &mut data);
        Ok(data)
    }
}

/// Fold per-agent GPU lists into the aggregate. Pure so the arithmetic is
/// testable without a database.
pub(crate) fn fold_gpu_stats<'a>(
    gpu_lists: impl Iterator<Item = &'a [Gpu]>,
    data: &mut AggregatedData,
) {
    let mut free_gb: BTreeMap<i64, i64> = BTreeMap::new();
    let mut free_gb_by_name: HashMap<String, BTreeMap<i64, i64>> = HashMap::new();
    let mut utilization_sum: u64 = 0;
    let mut utilization_by_name: HashMap<String, u64> = HashMap::new();
    let mut power_sum_mw: u64 = 0;
    let mut power_by_name_mw: HashMap<String, u64> = HashMap::new();

    for gpus in gpu_lists {
        data.gpus += gpus.len() as i64;
        for gpu in gpus {
            *data.gpus_by_name.entry(gpu.name.clone()).or_default() += 1;
            data.vram += gpu.vram;
            *data.vram_by_name.entry(gpu.name.clone()).or_default() += gpu.vram;
            data.vram_used += gpu.metrics.vram_used;
            *data.vram_used_by_name.entry(gpu.name.clone()).or_default() +=
                gpu.metrics.vram_used;

            let gb = (gpu.vram.saturating_sub(gpu.metrics.vram_used) / GB) as i64;
            *free_gb.entry(gb).or_default() += 1;
            *free_gb_by_name.entry(gpu.name.clone()).or_default().entry(gb).or_default() += 1;

            utilization_sum += gpu.metrics.utilization_gpu as u64;
            *utilization_by_name.entry(gpu.name.clone()).or_default() +=
                gpu.metrics.utilization_gpu as u64;
            power_sum_mw += gpu.metrics.power_draw_mw;
            *power_by_name_mw.entry(gpu.name.clone()).or_default() += gpu.metrics.power_draw_mw;
        }
    }

    if data.gpus == 0 {
        return;
    }

    data.utilization = utilization_sum as f64 / data.gpus as f64;
    data.power_draw_w = power_sum_mw as f64 / 1000.0 / data.gpus as f64;
    for (name, count) in &data.gpus_by_name {
        let count = *count as f64;
        data.utilization_by_name
            .insert(name.clone(), utilization_by_name[name] as f64 / count);
        data.power_draw_w_by_name
            .insert(name.clone(), power_by_name_mw[name] as f64 / 1000.0 / count);
    }

    data.vram_gb_available = calculate_percentiles(&free_gb);
    for (name, buckets) in &free_gb_by_name {
        data.vram_gb_available_by_name
            .insert(name.clone(), calculate_percentiles(buckets));
    }
}

/// Nearest-rank percentiles over GB-bucket counts: for each target p, the
/// smallest bucket key whose cumulative count reaches ceil(p * total).
pub(crate) fn calculate_percentiles(buckets: &BTreeMap<i64, i64>) -> Percentiles {
    let total: i64 = buckets.values().sum();
    if total == 0 {
        return Percentiles::default();
    }

    let entries: Vec<(i64, i64)> = buckets.iter().map(|(k, c)| (*k, *c)).collect();
    let mut result = Percentiles { p100: entries[entries.len() - 1].0, ..Default::default() };

    let mut cumulative = 0_i64;
    let mut position = 0_usize;
    let mut key = entries[0].0;

    let mut walk_to = |percent: i64| -> i64 {
        let threshold = (total * percent + 99) / 100;
        while cumulative < threshold && position < entries.len() {
            key = entries[position].0;
            cumulative += entries[position].1;
            position += 1;
        }
        key
    };

    result.p10 = walk_to(10);
    result.p25 = walk_to(25);
    result.p50 = walk_to(50);
    result.p75 = walk_to(75);
    result.p90 = walk_to(90);
    result
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::model::GpuMetrics;

    fn buckets(pairs: &[(i64, i64)]) -> BTreeMap<i64, i64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_percentiles_free_vram_multiset() {
        // Free-VRAM multiset [4, 4, 4, 8, 8, 16] GB.
        let p = calculate_percentiles(&buckets(&[(4, 3), (8, 2), (16, 1)]));
        assert_eq!(p.p10, 4);
        assert_eq!(p.p25, 4);
        assert_eq!(p.p50, 4);
        assert_eq!(p.p75, 8);
        assert_eq!(p.p90, 16);
        assert_eq!(p.p100, 16);
    }

    #[test]
    fn test_percentiles_single_bucket() {
        let p = calculate_percentiles(&buckets(&[(24, 10)]));
        assert_eq!(p, Percentiles { p10: 24, p25: 24, p50: 24, p75: 24, p90: 24, p100: 24 });
    }

    #[test]
    fn test_percentiles_empty() {
        let p = calculate_percentiles(&BTreeMap::new());
        assert_eq!(p, Percentiles::default());
    }

    #[test]
    fn test_percentiles_monotone_in_p() {
        let p = calculate_percentiles(&buckets(&[(1, 7), (2, 1), (5, 3), (9, 2), (30, 4)]));
        assert!(p.p10 <= p.p25);
        assert!(p.p25 <= p.p50);
        assert!(p.p50 <= p.p75);
        assert!(p.p75 <= p.p90);
        assert!(p.p90 <= p.p100);
    }

    fn gpu(name: &str, vram_gb: u64, used_gb: u64, utilization: u32, power_mw: u64) -> Gpu {
        Gpu {
            name: name.to_string(),
            vendor: "TestVendor".to_string(),
            pci_bus: String::new(),
            driver_version: String::new(),
            vram: vram_gb * (1 << 30),
            tags: vec![],
            metrics: GpuMetrics {
                utilization_gpu: utilization,
                vram_used: used_gb * (1 << 30),
                power_draw_mw: power_mw,
                temperature_c: 60,
            },
        }
    }

    #[test]
    fn test_fold_gpu_stats_totals_and_means() {
        let a = vec![gpu("L4", 24, 8, 50, 70_000), gpu("L4", 24, 0, 10, 30_000)];
        let b = vec![gpu("H100", 80, 40, 90, 350_000)];
        let mut data = AggregatedData::default();
        fold_gpu_stats([a.as_slice(), b.as_slice()].into_iter(), &mut data);

        assert_eq!(data.gpus, 3);
        assert_eq!(data.gpus_by_name["L4"], 2);
        assert_eq!(data.vram, 128 * (1 << 30));
        assert_eq!(data.vram_used, 48 * (1 << 30));
        assert!((data.utilization - 50.0).abs() < 1e-9);
        assert!((data.utilization_by_name["L4"] - 30.0).abs() < 1e-9);
        assert!((data.power_draw_w_by_name["H100"] - 350.0).abs() < 1e-9);

        // Free GB multiset is [16, 24, 40].
        assert_eq!(data.vram_gb_available.p10, 16);
        assert_eq!(data.vram_gb_available.p100, 40);
        assert_eq!(data.vram_gb_available_by_name["H100"].p50, 40);
    }

    #[test]
    fn test_fold_gpu_stats_no_gpus() {
        let mut data = AggregatedData::default();
        fold_gpu_stats(std::iter::empty(), &mut data);
        assert_eq!(data.gpus, 0);
        assert_eq!(data.vram_gb_available, Percentiles::default());
    }
}
