/// Work-group dispatch.
///
/// A `Dispatcher` walks one kernel at a time. It asks a `DispatchAlgorithm`
/// for the next placement, sends the placed work-group to its CU, and counts
/// completions until the whole grid has finished. Two strategies exist:
///   - RoundRobin: the next work-group goes to the first CU, starting after
///     the one that accepted the previous work-group, with room for it
///   - Partition:  the grid is cut into one contiguous chunk per CU; a CU
///     whose chunk is used up helps with another chunk's pending work-group
pub mod algorithm;
pub mod dispatcher;

use serde::{Deserialize, Serialize};

use crate::kernel::WorkGroupDesc;
use crate::protocol::{ReqId, WfDispatchLocation};

pub use algorithm::{DispatchAlgorithm, PartitionAlgorithm, RoundRobinAlgorithm};
pub use dispatcher::Dispatcher;

/// A work-group whose resources are reserved on a CU.
#[derive(Debug, Clone)]
pub struct DispatchLocation {
    /// Id of the reservation; reused as the map request id
    pub id: ReqId,
    /// Index of the CU in the resource pool
    pub cu_index: usize,
    pub wg: WorkGroupDesc,
    pub locations: Vec<WfDispatchLocation>,
}

/// Selectable dispatch strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    #[default]
    RoundRobin,
    Partition,
}

impl DispatchPolicy {
    pub fn build(self) -> Box<dyn DispatchAlgorithm> {
        match self {
            DispatchPolicy::RoundRobin => Box::new(RoundRobinAlgorithm::new()),
            DispatchPolicy::Partition => Box::new(PartitionAlgorithm::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DispatchPolicy::RoundRobin => "round-robin",
            DispatchPolicy::Partition => "partition",
        }
    }
}
