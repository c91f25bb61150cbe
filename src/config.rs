/// Hardware and simulation configuration.
///
/// All structs are plain serde types so a whole `SimConfig` can be loaded from
/// a JSON file. Presets mirror real parts; every consumer calls `validate()`
/// before building anything from a config.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchPolicy;
use crate::error::ConfigError;
use crate::kernel::WAVEFRONT_SIZE;
use crate::resource::pool::{LDS_GRANULARITY, SGPR_GRANULARITY, VGPR_GRANULARITY};

/// Size of a per-CU resource. `Unlimited` is only meant for permissive
/// experiments where a resource should never be the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capacity {
    Limited(u32),
    Unlimited,
}

impl Capacity {
    pub fn limit(&self) -> Option<u32> {
        match self {
            Capacity::Limited(n) => Some(*n),
            Capacity::Unlimited => None,
        }
    }
}

/// Optional wavefront-sampling fast path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Completed wavefronts ignored before collecting samples
    pub warmup: usize,
    /// Length of the long window; the short window is half of it
    pub window: usize,
    /// Maximum relative difference between the two window means
    pub threshold: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            warmup: 1024,
            window: 1024,
            threshold: 0.03,
        }
    }
}

/// Compute unit hardware configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CuConfig {
    pub simd_count: usize,
    /// Wavefront slots per SIMD
    pub wf_pool_sizes: Vec<Capacity>,
    /// Vector registers per SIMD (counted per lane times 64 lanes)
    pub vgpr_counts: Vec<Capacity>,
    pub sgpr_count: Capacity,
    pub lds_bytes: Capacity,
    pub log2_cache_line_size: u32,
    /// Instruction buffer size per wavefront
    pub inst_buffer_bytes: usize,
    /// Vector memory transactions allowed in flight per CU
    pub in_flight_vector_mem_limit: usize,
    /// Cycles an instruction spends in a SIMD's execute stage
    pub valu_latency: u32,
    pub vmem_inst_pipeline_depth: usize,
    pub vmem_trans_pipeline_depth: usize,
    /// Capacity of the buffers behind the two vector-memory pipelines
    pub vmem_buffer_size: usize,
    pub barrier_buffer_size: usize,
    /// Consecutive idle cycles before the scheduler reports no progress
    pub idle_cycles_before_sleep: u32,
    pub port_capacity: usize,
    pub sampling: Option<SamplingConfig>,
}

impl CuConfig {
    /// GCN3 (Fiji-class) compute unit.
    pub fn gcn3() -> Self {
        CuConfig {
            simd_count: 4,
            wf_pool_sizes: vec![Capacity::Limited(10); 4],
            vgpr_counts: vec![Capacity::Limited(16384); 4],
            sgpr_count: Capacity::Limited(3200),
            lds_bytes: Capacity::Limited(64 * 1024),
            log2_cache_line_size: 6,
            inst_buffer_bytes: 256,
            in_flight_vector_mem_limit: 512,
            valu_latency: 4,
            vmem_inst_pipeline_depth: 6,
            vmem_trans_pipeline_depth: 60,
            vmem_buffer_size: 8,
            barrier_buffer_size: 16,
            idle_cycles_before_sleep: 4,
            port_capacity: 4,
            sampling: None,
        }
    }

    /// Same CU shape with `slots` wavefront slots per SIMD and no register or
    /// LDS limits.
    pub fn unlimited_registers(simd_count: usize, slots: u32) -> Self {
        CuConfig {
            simd_count,
            wf_pool_sizes: vec![Capacity::Limited(slots); simd_count],
            vgpr_counts: vec![Capacity::Unlimited; simd_count],
            sgpr_count: Capacity::Unlimited,
            lds_bytes: Capacity::Unlimited,
            ..Self::gcn3()
        }
    }

    pub fn cache_line_size(&self) -> u64 {
        1 << self.log2_cache_line_size
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simd_count == 0 {
            return Err(ConfigError::NoSimdUnits);
        }
        if self.wf_pool_sizes.len() != self.simd_count {
            return Err(ConfigError::PerSimdLengthMismatch {
                what: "wavefront pool sizes",
                expected: self.simd_count,
                actual: self.wf_pool_sizes.len(),
            });
        }
        if self.vgpr_counts.len() != self.simd_count {
            return Err(ConfigError::PerSimdLengthMismatch {
                what: "VGPR counts",
                expected: self.simd_count,
                actual: self.vgpr_counts.len(),
            });
        }
        check_granularity("SGPR", self.sgpr_count, SGPR_GRANULARITY)?;
        for count in &self.vgpr_counts {
            check_granularity("VGPR", *count, VGPR_GRANULARITY * WAVEFRONT_SIZE)?;
        }
        check_granularity("LDS", self.lds_bytes, LDS_GRANULARITY)?;
        if !(2..=12).contains(&self.log2_cache_line_size) {
            return Err(ConfigError::BadCacheLineSize(self.log2_cache_line_size));
        }
        for (value, name) in [
            (self.inst_buffer_bytes, "instruction buffer size"),
            (self.in_flight_vector_mem_limit, "in-flight vector memory limit"),
            (self.vmem_inst_pipeline_depth, "vector memory instruction pipeline depth"),
            (self.vmem_trans_pipeline_depth, "vector memory transaction pipeline depth"),
            (self.vmem_buffer_size, "vector memory buffer size"),
            (self.barrier_buffer_size, "barrier buffer size"),
            (self.port_capacity, "port capacity"),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if let Some(s) = &self.sampling {
            if s.window < 2 {
                return Err(ConfigError::Zero("sampling window"));
            }
        }
        Ok(())
    }
}

fn check_granularity(resource: &'static str, capacity: Capacity, granularity: u32) -> Result<(), ConfigError> {
    match capacity {
        Capacity::Limited(count) if count % granularity != 0 => Err(ConfigError::NotMultipleOfGranularity {
            resource,
            count,
            granularity,
        }),
        _ => Ok(()),
    }
}

impl Default for CuConfig {
    fn default() -> Self {
        Self::gcn3()
    }
}

/// Command-processor side dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub policy: DispatchPolicy,
    /// Cycles spent after sending a work-group, indexed by its wavefront
    /// count (clamped to the last entry)
    pub latency_table: Vec<u32>,
    /// Cycles between the last work-group completion and the kernel response
    pub kernel_overhead: u32,
    pub port_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            policy: DispatchPolicy::RoundRobin,
            latency_table: vec![0, 4, 4, 4, 4, 8, 8, 8, 8, 12, 12, 12, 12, 16, 16, 16, 16],
            kernel_overhead: 1600,
            port_capacity: 4,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.latency_table.is_empty() {
            return Err(ConfigError::EmptyLatencyTable);
        }
        if self.port_capacity == 0 {
            return Err(ConfigError::Zero("dispatcher port capacity"));
        }
        Ok(())
    }

    /// Dispatch cost of a work-group with `wavefronts` wavefronts.
    pub fn latency_for(&self, wavefronts: usize) -> u32 {
        let idx = wavefronts.min(self.latency_table.len() - 1);
        self.latency_table[idx]
    }
}

/// Fixed-latency memory used to close the loop around the CUs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub latency: u64,
    /// Outstanding requests accepted per link
    pub port_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            latency: 100,
            port_capacity: 64,
        }
    }
}

/// Everything needed to build a `Gpu`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub num_cus: usize,
    pub cu: CuConfig,
    pub dispatcher: DispatcherConfig,
    pub memory: MemoryConfig,
    /// Give up on a kernel after this many cycles
    pub max_cycles: u64,
    /// Write live JSON snapshots here for the viz binary
    pub live_metrics_path: Option<String>,
    pub metrics_interval: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            num_cus: 4,
            cu: CuConfig::gcn3(),
            dispatcher: DispatcherConfig::default(),
            memory: MemoryConfig::default(),
            max_cycles: 10_000_000,
            live_metrics_path: None,
            metrics_interval: 1000,
        }
    }
}

impl SimConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_cus == 0 {
            return Err(ConfigError::Zero("CU count"));
        }
        if self.metrics_interval == 0 {
            return Err(ConfigError::Zero("metrics interval"));
        }
        if self.memory.port_capacity == 0 {
            return Err(ConfigError::Zero("memory port capacity"));
        }
        self.cu.validate()?;
        self.dispatcher.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcn3_preset_is_valid() {
        assert!(CuConfig::gcn3().validate().is_ok());
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_mismatched_per_simd_lists() {
        let mut c = CuConfig::gcn3();
        c.vgpr_counts.pop();
        assert!(matches!(
            c.validate(),
            Err(ConfigError::PerSimdLengthMismatch { what: "VGPR counts", .. })
        ));
    }

    #[test]
    fn rejects_capacities_off_granularity() {
        let mut c = CuConfig::gcn3();
        c.vgpr_counts[2] = Capacity::Limited(16384 + 64);
        assert!(matches!(
            c.validate(),
            Err(ConfigError::NotMultipleOfGranularity { resource: "VGPR", granularity: 256, .. })
        ));

        let c = CuConfig {
            lds_bytes: Capacity::Limited(1000),
            ..CuConfig::gcn3()
        };
        assert!(matches!(
            c.validate(),
            Err(ConfigError::NotMultipleOfGranularity { resource: "LDS", count: 1000, .. })
        ));
    }

    #[test]
    fn rejects_zero_simds() {
        let c = CuConfig {
            simd_count: 0,
            ..CuConfig::gcn3()
        };
        assert!(matches!(c.validate(), Err(ConfigError::NoSimdUnits)));
    }

    #[test]
    fn loads_partial_json_over_defaults() {
        let json = r#"{
            "num_cus": 2,
            "cu": { "sgpr_count": "unlimited", "lds_bytes": { "limited": 32768 } },
            "dispatcher": { "policy": "partition", "kernel_overhead": 10 }
        }"#;
        let c = SimConfig::from_json_str(json).unwrap();
        assert_eq!(c.num_cus, 2);
        assert_eq!(c.cu.sgpr_count, Capacity::Unlimited);
        assert_eq!(c.cu.lds_bytes, Capacity::Limited(32768));
        assert_eq!(c.cu.simd_count, 4);
        assert_eq!(c.dispatcher.policy, DispatchPolicy::Partition);
        assert_eq!(c.dispatcher.kernel_overhead, 10);
    }

    #[test]
    fn latency_lookup_clamps_to_last_entry() {
        let d = DispatcherConfig {
            latency_table: vec![0, 2, 3],
            ..DispatcherConfig::default()
        };
        assert_eq!(d.latency_for(1), 2);
        assert_eq!(d.latency_for(40), 3);
    }

    #[test]
    fn empty_latency_table_is_rejected() {
        let d = DispatcherConfig {
            latency_table: vec![],
            ..DispatcherConfig::default()
        };
        assert!(matches!(d.validate(), Err(ConfigError::EmptyLatencyTable)));
    }
}
