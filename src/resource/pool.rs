/// Per-CU resource bookkeeping used by the dispatcher.
///
/// A work-group is placed only if all of its resources fit at once: SGPRs for
/// every wavefront, one LDS region for the group, and a SIMD with a free
/// wavefront slot plus enough VGPRs for every wavefront. Each attempt marks
/// cells `ToReserve`; success promotes them to `Reserved`, any failure rolls
/// every kind back to `Free`.
use std::collections::HashMap;

use super::mask::{AllocStatus, ResourceMask};
use super::units_occupy;
use crate::config::{Capacity, CuConfig};
use crate::cu::CuId;
use crate::error::ConfigError;
use crate::kernel::{CodeObject, WorkGroupDesc, WAVEFRONT_SIZE};
use crate::port::Sender;
use crate::protocol::{MapWgReq, ReqId, WfDispatchLocation};

/// Scalar registers per SGPR mask cell.
pub const SGPR_GRANULARITY: u32 = 16;
/// Vector registers (per lane) per VGPR mask cell.
pub const VGPR_GRANULARITY: u32 = 4;
/// Bytes per LDS mask cell.
pub const LDS_GRANULARITY: u32 = 256;

/// Cells held by one placed work-group.
#[derive(Debug, Clone)]
struct Reservation {
    locations: Vec<WfDispatchLocation>,
    sgpr_units: usize,
    vgpr_units: usize,
    lds_units: usize,
}

/// Capacities are checked against their granularity by `CuConfig::validate`.
fn build_mask(capacity: Capacity, granularity: u32) -> ResourceMask {
    match capacity {
        Capacity::Unlimited => ResourceMask::unlimited(),
        Capacity::Limited(count) => ResourceMask::limited((count / granularity) as usize),
    }
}

/// Resource view of one CU.
#[derive(Debug)]
pub struct CuResource {
    cu: CuId,
    port: Sender<MapWgReq>,
    /// Free wavefront slots per SIMD, `None` when unlimited
    wf_pool_free: Vec<Option<u32>>,
    sreg_mask: ResourceMask,
    vreg_masks: Vec<ResourceMask>,
    lds_mask: ResourceMask,
    next_simd: usize,
    reserved: HashMap<ReqId, Reservation>,
}

impl CuResource {
    pub fn new(cu: CuId, config: &CuConfig, port: Sender<MapWgReq>) -> Result<Self, ConfigError> {
        config.validate()?;
        let vreg_masks = config
            .vgpr_counts
            .iter()
            .map(|c| build_mask(*c, VGPR_GRANULARITY * WAVEFRONT_SIZE))
            .collect();
        Ok(CuResource {
            cu,
            port,
            wf_pool_free: config.wf_pool_sizes.iter().map(Capacity::limit).collect(),
            sreg_mask: build_mask(config.sgpr_count, SGPR_GRANULARITY),
            vreg_masks,
            lds_mask: build_mask(config.lds_bytes, LDS_GRANULARITY),
            next_simd: 0,
            reserved: HashMap::new(),
        })
    }

    pub fn id(&self) -> CuId {
        self.cu
    }

    /// Where map-work-group requests for this CU are sent.
    pub fn port(&self) -> &Sender<MapWgReq> {
        &self.port
    }

    pub fn reserved_wg_count(&self) -> usize {
        self.reserved.len()
    }

    pub fn free_wf_slots(&self, simd: usize) -> Option<u32> {
        self.wf_pool_free[simd]
    }

    pub fn sgpr_status_count(&self, status: AllocStatus) -> usize {
        self.sreg_mask.status_count(status)
    }

    pub fn vgpr_status_count(&self, simd: usize, status: AllocStatus) -> usize {
        self.vreg_masks[simd].status_count(status)
    }

    pub fn lds_status_count(&self, status: AllocStatus) -> usize {
        self.lds_mask.status_count(status)
    }

    /// Try to place `wg` on this CU. On success the cells are `Reserved`
    /// under `id` and one location per wavefront is returned. On failure
    /// nothing stays reserved.
    pub fn reserve_resource_for_wg(
        &mut self,
        id: ReqId,
        wg: &WorkGroupDesc,
        co: &CodeObject,
    ) -> Option<Vec<WfDispatchLocation>> {
        if self.reserved.contains_key(&id) {
            panic!("{}: reserving work-group {id} twice", self.cu);
        }

        let mut locations = vec![
            WfDispatchLocation {
                simd_id: 0,
                sgpr_offset: 0,
                vgpr_offset: 0,
                lds_offset: 0,
            };
            wg.wavefronts.len()
        ];
        let sgpr_units = units_occupy(co.sgpr_count, SGPR_GRANULARITY);
        let vgpr_units = units_occupy(co.vgpr_count, VGPR_GRANULARITY);
        let lds_units = units_occupy(co.group_segment_bytes, LDS_GRANULARITY);

        let ok = self.within_sgpr_limit(sgpr_units, &mut locations)
            && self.within_lds_limit(lds_units, &mut locations)
            && self.match_wfs_with_simds(vgpr_units, &mut locations);
        if !ok {
            self.clear_temp_reservation();
            return None;
        }

        for loc in &locations {
            if let Some(free) = &mut self.wf_pool_free[loc.simd_id] {
                *free -= 1;
            }
        }
        self.convert_all(AllocStatus::ToReserve, AllocStatus::Reserved);
        self.reserved.insert(
            id,
            Reservation {
                locations: locations.clone(),
                sgpr_units,
                vgpr_units,
                lds_units,
            },
        );
        Some(locations)
    }

    fn within_sgpr_limit(&mut self, units: usize, locations: &mut [WfDispatchLocation]) -> bool {
        for loc in locations.iter_mut() {
            let Some(offset) = self.sreg_mask.reserve(units) else {
                return false;
            };
            loc.sgpr_offset = offset as u32 * SGPR_GRANULARITY * 4;
        }
        true
    }

    fn within_lds_limit(&mut self, units: usize, locations: &mut [WfDispatchLocation]) -> bool {
        let Some(offset) = self.lds_mask.reserve(units) else {
            return false;
        };
        for loc in locations.iter_mut() {
            loc.lds_offset = offset as u32 * LDS_GRANULARITY;
        }
        true
    }

    /// Give each wavefront a SIMD, rotating the starting SIMD so consecutive
    /// wavefronts spread across the CU.
    fn match_wfs_with_simds(&mut self, units: usize, locations: &mut [WfDispatchLocation]) -> bool {
        let simds = self.wf_pool_free.len();
        let mut slots_used = vec![0u32; simds];

        for loc in locations.iter_mut() {
            let mut found = false;
            for _ in 0..simds {
                let simd = self.next_simd;
                self.next_simd = (self.next_simd + 1) % simds;

                let has_slot = match self.wf_pool_free[simd] {
                    Some(free) => free > slots_used[simd],
                    None => true,
                };
                if !has_slot {
                    continue;
                }
                if let Some(offset) = self.vreg_masks[simd].reserve(units) {
                    slots_used[simd] += 1;
                    loc.simd_id = simd;
                    loc.vgpr_offset = offset as u32 * VGPR_GRANULARITY * 4;
                    found = true;
                    break;
                }
            }
            if !found {
                return false;
            }
        }
        true
    }

    fn convert_all(&mut self, from: AllocStatus, to: AllocStatus) {
        self.sreg_mask.convert_status(from, to);
        self.lds_mask.convert_status(from, to);
        for m in &mut self.vreg_masks {
            m.convert_status(from, to);
        }
    }

    fn clear_temp_reservation(&mut self) {
        self.convert_all(AllocStatus::ToReserve, AllocStatus::Free);
    }

    /// Release everything held by the work-group placed under `id`.
    pub fn free_resources_for_wg(&mut self, id: ReqId) {
        let Some(r) = self.reserved.remove(&id) else {
            panic!("{}: freeing work-group {id} that was never placed here", self.cu);
        };

        if let Some(first) = r.locations.first() {
            self.lds_mask
                .free((first.lds_offset / LDS_GRANULARITY) as usize, r.lds_units);
        }
        for loc in &r.locations {
            if let Some(free) = &mut self.wf_pool_free[loc.simd_id] {
                *free += 1;
            }
            self.sreg_mask
                .free((loc.sgpr_offset / 4 / SGPR_GRANULARITY) as usize, r.sgpr_units);
            self.vreg_masks[loc.simd_id]
                .free((loc.vgpr_offset / 4 / VGPR_GRANULARITY) as usize, r.vgpr_units);
        }
    }
}

/// All CUs a dispatcher can place work on, in registration order.
#[derive(Debug, Default)]
pub struct CuResourcePool {
    cus: Vec<CuResource>,
}

impl CuResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_cu(
        &mut self,
        cu: CuId,
        config: &CuConfig,
        port: Sender<MapWgReq>,
    ) -> Result<(), ConfigError> {
        if self.cus.iter().any(|r| r.id() == cu) {
            return Err(ConfigError::DuplicateCu(cu));
        }
        self.cus.push(CuResource::new(cu, config, port)?);
        Ok(())
    }

    pub fn num_cu(&self) -> usize {
        self.cus.len()
    }

    pub fn cu(&self, index: usize) -> &CuResource {
        &self.cus[index]
    }

    pub fn cu_mut(&mut self, index: usize) -> &mut CuResource {
        &mut self.cus[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &CuResource> {
        self.cus.iter()
    }
}
