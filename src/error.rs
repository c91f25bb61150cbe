/// Error types.
///
/// Only setup-time failures are errors. Running out of registers or finding a
/// port full are normal "try again next cycle" outcomes and never show up here;
/// broken protocol invariants panic at the point of detection.
use thiserror::Error;

use crate::cu::CuId;

/// Invalid configuration detected while constructing a component.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{resource} capacity {count} is not a multiple of its granularity {granularity}")]
    NotMultipleOfGranularity {
        resource: &'static str,
        count: u32,
        granularity: u32,
    },

    #[error("a compute unit needs at least one SIMD unit")]
    NoSimdUnits,

    #[error("expected {expected} per-SIMD entries for {what}, got {actual}")]
    PerSimdLengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("compute unit {0} is already registered")]
    DuplicateCu(CuId),

    #[error("dispatch latency table must not be empty")]
    EmptyLatencyTable,

    #[error("cache line size 2^{0} is out of range")]
    BadCacheLineSize(u32),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Returned when a kernel is handed to a dispatcher that is still busy.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher is already dispatching kernel {0}")]
    AlreadyDispatching(String),

    #[error("kernel {kernel} has an empty work-group size {x}x{y}x{z}")]
    EmptyWorkGroup { kernel: String, x: u32, y: u32, z: u32 },
}

/// Failure of a whole simulation run.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("kernel {kernel} did not complete within {cycles} cycles")]
    CycleLimitExceeded { kernel: String, cycles: u64 },
}
