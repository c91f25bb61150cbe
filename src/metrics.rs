/// Live metrics for the TUI visualizer.
///
/// When `SimConfig::live_metrics_path` is set, the `Gpu` writes a JSON
/// snapshot there at kernel start, every `metrics_interval` cycles and at
/// kernel end. The viz binary polls the file and re-renders the dashboard.
/// Writes are atomic (write to .tmp then rename) to avoid torn reads.
use serde::{Deserialize, Serialize};

pub const DEFAULT_METRICS_PATH: &str = "/tmp/cusim_live.json";

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// One compute unit at the time of the snapshot.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct CuSnapshot {
    pub id: usize,
    pub resident_wgs: usize,
    pub resident_wfs: usize,
    /// Work-groups retired since the CU was built
    pub wgs_completed: u64,
    pub insts_issued: u64,
    pub peak_resident_wgs: usize,
    /// Pipeline is flushed and waiting for a restart
    pub paused: bool,
    /// Made progress on its last tick
    pub active: bool,
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct LiveMetrics {
    /// "idle" | "running" | "complete"
    pub status: String,
    pub kernel_name: String,
    pub dispatch_policy: String,
    /// Grid size in work-items [x, y, z]
    pub grid: [u32; 3],
    /// Work-group size in work-items [x, y, z]
    pub work_group: [u32; 3],
    pub cycle: u64,
    pub wgs_total: usize,
    pub wgs_dispatched: usize,
    pub wgs_completed: usize,
    /// Dispatched but not yet reported complete
    pub wgs_in_flight: usize,
    /// Index = CU id
    pub cus: Vec<CuSnapshot>,
    /// Memory requests answered so far
    pub memory_served: u64,
    /// Unix timestamp in ms when this snapshot was written
    pub timestamp_ms: u64,
}

impl LiveMetrics {
    /// Fraction of the grid that has finished, in [0, 1].
    pub fn progress(&self) -> f64 {
        if self.wgs_total == 0 {
            return 0.0;
        }
        self.wgs_completed as f64 / self.wgs_total as f64
    }
}

// ---------------------------------------------------------------------------
// I/O helpers
// ---------------------------------------------------------------------------

/// Atomically write metrics to `path`.
/// Uses a .tmp intermediate file + rename to avoid torn reads by the viz.
pub fn write_metrics(path: &str, metrics: &LiveMetrics) {
    let json = match serde_json::to_string(metrics) {
        Ok(json) => json,
        Err(err) => {
            log::warn!("could not serialize live metrics: {err}");
            return;
        }
    };
    let tmp = format!("{path}.tmp");
    if let Err(err) = std::fs::write(&tmp, &json).and_then(|_| std::fs::rename(&tmp, path)) {
        log::warn!("could not write live metrics to {path}: {err}");
    }
}

/// Read the latest metrics snapshot. Returns None if the file doesn't exist
/// or can't be parsed (e.g. no simulation has run yet).
pub fn read_metrics(path: &str) -> Option<LiveMetrics> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Returns current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_survives_a_write_read_cycle() {
        let path = std::env::temp_dir().join(format!("cusim_metrics_{}.json", std::process::id()));
        let path = path.to_str().unwrap().to_string();
        let metrics = LiveMetrics {
            status: "running".into(),
            kernel_name: "saxpy".into(),
            wgs_total: 8,
            wgs_completed: 2,
            cus: vec![CuSnapshot {
                id: 0,
                resident_wgs: 3,
                ..CuSnapshot::default()
            }],
            ..LiveMetrics::default()
        };
        write_metrics(&path, &metrics);
        assert_eq!(read_metrics(&path), Some(metrics.clone()));
        assert!((metrics.progress() - 0.25).abs() < 1e-9);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_reads_as_none() {
        assert!(read_metrics("/nonexistent/cusim.json").is_none());
    }
}
