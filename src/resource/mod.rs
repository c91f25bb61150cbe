/// Compute-unit resource accounting: allocation masks and the per-CU pool the
/// dispatcher reserves work-group resources from.
pub mod mask;
pub mod pool;

pub use mask::{AllocStatus, ResourceMask};
pub use pool::{CuResource, CuResourcePool};

/// Number of allocation granules `amount` occupies (rounded up).
pub fn units_occupy(amount: u32, granularity: u32) -> usize {
    if granularity == 0 {
        return amount as usize;
    }
    amount.div_ceil(granularity) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_partial_granules_up() {
        assert_eq!(units_occupy(0, 16), 0);
        assert_eq!(units_occupy(16, 16), 1);
        assert_eq!(units_occupy(17, 16), 2);
        assert_eq!(units_occupy(300, 256), 2);
    }
}
