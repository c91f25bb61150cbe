/// Placement strategies.
///
/// An algorithm owns the resource view of every registered CU. `next` either
/// returns a work-group whose resources are now reserved, or `None` when
/// nothing fits this cycle; the caller simply polls again later.
use crate::config::CuConfig;
use crate::cu::CuId;
use crate::error::ConfigError;
use crate::kernel::{GridBuilder, KernelLaunch, WorkGroupDesc};
use crate::port::Sender;
use crate::protocol::{MapWgReq, ReqId, WfDispatchLocation};
use crate::resource::CuResourcePool;

use super::DispatchLocation;

pub trait DispatchAlgorithm {
    fn register_cu(
        &mut self,
        cu: CuId,
        config: &CuConfig,
        port: Sender<MapWgReq>,
    ) -> Result<(), ConfigError>;

    fn start_new_kernel(&mut self, launch: KernelLaunch);

    /// Work-groups in the current kernel's grid.
    fn num_wg(&self) -> usize;

    /// Some work-group of the current kernel has not been placed yet.
    fn has_next(&self) -> bool;

    fn next(&mut self) -> Option<DispatchLocation>;

    fn free_resources(&mut self, location: &DispatchLocation);

    fn pool(&self) -> &CuResourcePool;

    fn name(&self) -> &'static str;
}

/// Try to reserve `wg` on CU `index` under a fresh id.
fn try_place(
    pool: &mut CuResourcePool,
    index: usize,
    wg: &WorkGroupDesc,
    launch: &KernelLaunch,
) -> Option<(ReqId, Vec<WfDispatchLocation>)> {
    let id = ReqId::fresh();
    pool.cu_mut(index)
        .reserve_resource_for_wg(id, wg, &launch.code_object)
        .map(|locations| (id, locations))
}

// ---------------------------------------------------------------------------
// Round-robin
// ---------------------------------------------------------------------------

/// Tries every CU once per poll, starting after the last CU that accepted.
/// The work-group that did not fit is held and offered again next poll.
#[derive(Default)]
pub struct RoundRobinAlgorithm {
    pool: CuResourcePool,
    grid: Option<GridBuilder>,
    held: Option<WorkGroupDesc>,
    next_cu: usize,
    num_wg: usize,
    dispatched: usize,
}

impl RoundRobinAlgorithm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DispatchAlgorithm for RoundRobinAlgorithm {
    fn register_cu(
        &mut self,
        cu: CuId,
        config: &CuConfig,
        port: Sender<MapWgReq>,
    ) -> Result<(), ConfigError> {
        self.pool.register_cu(cu, config, port)
    }

    fn start_new_kernel(&mut self, launch: KernelLaunch) {
        let grid = GridBuilder::new(launch);
        self.num_wg = grid.num_wg();
        self.grid = Some(grid);
        self.held = None;
        self.dispatched = 0;
    }

    fn num_wg(&self) -> usize {
        self.num_wg
    }

    fn has_next(&self) -> bool {
        self.dispatched < self.num_wg
    }

    fn next(&mut self) -> Option<DispatchLocation> {
        if !self.has_next() {
            return None;
        }
        let grid = self.grid.as_mut()?;
        if self.held.is_none() {
            self.held = grid.next_wg();
        }
        let wg = self.held.as_ref()?;

        let num_cu = self.pool.num_cu();
        for i in 0..num_cu {
            let index = (self.next_cu + i) % num_cu;
            if let Some((id, locations)) = try_place(&mut self.pool, index, wg, grid.launch()) {
                self.next_cu = (index + 1) % num_cu;
                self.dispatched += 1;
                let wg = self.held.take()?;
                return Some(DispatchLocation {
                    id,
                    cu_index: index,
                    wg,
                    locations,
                });
            }
        }
        None
    }

    fn free_resources(&mut self, location: &DispatchLocation) {
        self.pool
            .cu_mut(location.cu_index)
            .free_resources_for_wg(location.id);
    }

    fn pool(&self) -> &CuResourcePool {
        &self.pool
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

// ---------------------------------------------------------------------------
// Partition
// ---------------------------------------------------------------------------

struct Partition {
    grid: GridBuilder,
    dispatched: usize,
}

/// Gives CU `i` the `i`-th contiguous chunk of the grid. A CU whose chunk is
/// exhausted takes the pending work-group of any other chunk.
#[derive(Default)]
pub struct PartitionAlgorithm {
    pool: CuResourcePool,
    partitions: Vec<Partition>,
    /// Pending work-group of each partition
    current: Vec<Option<WorkGroupDesc>>,
    next_partition: usize,
    num_wg: usize,
    per_partition: usize,
    dispatched: usize,
}

impl PartitionAlgorithm {
    pub fn new() -> Self {
        Self::default()
    }

    /// The partition whose pending work-group CU `index` should try.
    fn next_wg(&mut self, index: usize) -> Option<usize> {
        if self.partitions[index].dispatched >= self.per_partition {
            return self.current.iter().position(Option::is_some);
        }
        if self.current[index].is_none() {
            self.current[index] = self.partitions[index].grid.next_wg();
        }
        self.current[index].as_ref().map(|_| index)
    }
}

impl DispatchAlgorithm for PartitionAlgorithm {
    fn register_cu(
        &mut self,
        cu: CuId,
        config: &CuConfig,
        port: Sender<MapWgReq>,
    ) -> Result<(), ConfigError> {
        self.pool.register_cu(cu, config, port)
    }

    fn start_new_kernel(&mut self, launch: KernelLaunch) {
        let num_cu = self.pool.num_cu().max(1);
        self.num_wg = GridBuilder::new(launch.clone()).num_wg();
        self.per_partition = self.num_wg.div_ceil(num_cu);
        self.partitions = (0..num_cu)
            .map(|i| {
                let mut grid = GridBuilder::new(launch.clone());
                grid.skip(i * self.per_partition);
                Partition { grid, dispatched: 0 }
            })
            .collect();
        self.current = vec![None; num_cu];
        self.next_partition = 0;
        self.dispatched = 0;
    }

    fn num_wg(&self) -> usize {
        self.num_wg
    }

    fn has_next(&self) -> bool {
        self.dispatched < self.num_wg
    }

    fn next(&mut self) -> Option<DispatchLocation> {
        if !self.has_next() || self.pool.num_cu() == 0 {
            return None;
        }
        let n = self.partitions.len();
        for offset in 0..n {
            let index = (offset + self.next_partition) % n;
            let Some(from) = self.next_wg(index) else {
                continue;
            };
            let wg = self.current[from].as_ref()?;
            let launch = self.partitions[from].grid.launch();
            let Some((id, locations)) = try_place(&mut self.pool, index, wg, launch) else {
                continue;
            };
            let wg = self.current[from].take()?;
            self.partitions[from].dispatched += 1;
            self.dispatched += 1;
            self.next_partition = index + 1;
            return Some(DispatchLocation {
                id,
                cu_index: index,
                wg,
                locations,
            });
        }
        None
    }

    fn free_resources(&mut self, location: &DispatchLocation) {
        self.pool
            .cu_mut(location.cu_index)
            .free_resources_for_wg(location.id);
    }

    fn pool(&self) -> &CuResourcePool {
        &self.pool
    }

    fn name(&self) -> &'static str {
        "partition"
    }
}
