/// Kernel definitions and launch configuration.
///
/// A kernel launch names a code object and a dispatch packet (grid and
/// work-group sizes). The `GridBuilder` walks the launch grid and cuts it into
/// work-groups, each of which is further cut into 64-lane wavefronts.
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Number of lanes in one wavefront.
pub const WAVEFRONT_SIZE: u32 = 64;

/// 3D dimension used for grid sizes, work-group sizes and work-group ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Dim3 { x, y, z }
    }

    /// Convenience constructor for 1D configs
    pub fn x(x: u32) -> Self {
        Dim3 { x, y: 1, z: 1 }
    }

    pub fn size(&self) -> u32 {
        self.x * self.y * self.z
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// The loaded kernel binary plus the resource counts the compiler declared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeObject {
    pub name: String,
    /// Scalar registers per wavefront
    pub sgpr_count: u32,
    /// Vector registers per work-item
    pub vgpr_count: u32,
    /// LDS bytes per work-group
    pub group_segment_bytes: u32,
    /// Offset of the first instruction from the kernel object address
    pub entry_byte_offset: u64,
    /// Raw instruction bytes, starting at the kernel object address
    pub code: Vec<u8>,
}

impl CodeObject {
    pub fn new(name: &str, code: Vec<u8>) -> Self {
        CodeObject {
            name: name.to_string(),
            sgpr_count: 16,
            vgpr_count: 4,
            group_segment_bytes: 0,
            entry_byte_offset: 0,
            code,
        }
    }

    pub fn with_resources(mut self, sgprs: u32, vgprs: u32, lds_bytes: u32) -> Self {
        self.sgpr_count = sgprs;
        self.vgpr_count = vgprs;
        self.group_segment_bytes = lds_bytes;
        self
    }
}

/// HSA-style kernel dispatch packet: what to run and over which grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPacket {
    /// Grid size in work-items
    pub grid_size: Dim3,
    /// Work-group size in work-items
    pub workgroup_size: Dim3,
    /// Address the code object is loaded at
    pub kernel_object: u64,
    pub kernarg_address: u64,
}

impl DispatchPacket {
    pub fn new(grid_size: Dim3, workgroup_size: Dim3) -> Self {
        DispatchPacket {
            grid_size,
            workgroup_size,
            kernel_object: 0,
            kernarg_address: 0,
        }
    }

    /// Number of work-groups along each axis (edge groups may be partial).
    pub fn workgroup_count(&self) -> Dim3 {
        Dim3::new(
            self.grid_size.x.div_ceil(self.workgroup_size.x),
            self.grid_size.y.div_ceil(self.workgroup_size.y),
            self.grid_size.z.div_ceil(self.workgroup_size.z),
        )
    }
}

/// Predicate deciding whether a work-group belongs to this launch. Used to
/// split one grid across several GPUs.
pub type WgFilter = Rc<dyn Fn(&DispatchPacket, &WorkGroupDesc) -> bool>;

/// Everything the dispatcher needs to walk a kernel's grid.
#[derive(Clone)]
pub struct KernelLaunch {
    pub code_object: Rc<CodeObject>,
    pub packet: DispatchPacket,
    pub packet_address: u64,
    pub filter: Option<WgFilter>,
}

impl KernelLaunch {
    pub fn new(code_object: CodeObject, packet: DispatchPacket) -> Self {
        KernelLaunch {
            code_object: Rc::new(code_object),
            packet,
            packet_address: 0,
            filter: None,
        }
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&DispatchPacket, &WorkGroupDesc) -> bool + 'static,
    {
        self.filter = Some(Rc::new(filter));
        self
    }

    /// Address of the first instruction.
    pub fn entry_pc(&self) -> u64 {
        self.packet.kernel_object + self.code_object.entry_byte_offset
    }

    /// One past the last byte of the kernel binary.
    pub fn code_end_pc(&self) -> u64 {
        self.packet.kernel_object + self.code_object.code.len() as u64
    }
}

impl fmt::Debug for KernelLaunch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelLaunch")
            .field("kernel", &self.code_object.name)
            .field("packet", &self.packet)
            .field("packet_address", &self.packet_address)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Static description of one wavefront inside a work-group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavefrontDesc {
    /// Flattened in-work-group id of lane 0
    pub first_wi_flat_id: u32,
    /// Lanes backed by an existing work-item
    pub init_exec_mask: u64,
}

/// Static description of one work-group, as produced by the grid builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkGroupDesc {
    pub id: Dim3,
    /// Nominal work-group size from the packet
    pub size: Dim3,
    /// Actual size; smaller than `size` for edge groups
    pub curr_size: Dim3,
    pub wavefronts: Vec<WavefrontDesc>,
}

impl WorkGroupDesc {
    fn new(id: Dim3, size: Dim3, curr_size: Dim3) -> Self {
        WorkGroupDesc {
            id,
            size,
            curr_size,
            wavefronts: Vec::new(),
        }
    }

    /// Group work-items into wavefronts by their flattened in-group id.
    fn form_wavefronts(&mut self) {
        let mut masks: BTreeMap<u32, u64> = BTreeMap::new();
        for z in 0..self.curr_size.z {
            for y in 0..self.curr_size.y {
                for x in 0..self.curr_size.x {
                    let flat = z * self.size.x * self.size.y + y * self.size.x + x;
                    *masks.entry(flat / WAVEFRONT_SIZE).or_default() |=
                        1u64 << (flat % WAVEFRONT_SIZE);
                }
            }
        }
        self.wavefronts = masks
            .into_iter()
            .map(|(wave, mask)| WavefrontDesc {
                first_wi_flat_id: wave * WAVEFRONT_SIZE,
                init_exec_mask: mask,
            })
            .collect();
    }

    /// Local (x, y, z) id of an in-group flattened work-item id.
    pub fn local_id(&self, flat: u32) -> Dim3 {
        let plane = self.size.x * self.size.y;
        Dim3::new(flat % plane % self.size.x, flat % plane / self.size.x, flat / plane)
    }
}

/// Walks a launch grid in X-fastest, then Y, then Z order.
pub struct GridBuilder {
    launch: KernelLaunch,
    num_wg: usize,
    next: Dim3,
    done: bool,
}

impl GridBuilder {
    pub fn new(launch: KernelLaunch) -> Self {
        let mut b = GridBuilder {
            launch,
            num_wg: 0,
            next: Dim3::default(),
            done: false,
        };
        b.num_wg = b.count_wg();
        b
    }

    pub fn launch(&self) -> &KernelLaunch {
        &self.launch
    }

    /// Total number of work-groups that pass the filter.
    pub fn num_wg(&self) -> usize {
        self.num_wg
    }

    fn count_wg(&self) -> usize {
        let count = self.launch.packet.workgroup_count();
        let Some(filter) = &self.launch.filter else {
            return count.size() as usize;
        };

        let mut n = 0;
        for z in 0..count.z {
            for y in 0..count.y {
                for x in 0..count.x {
                    let wg = self.describe(Dim3::new(x, y, z), false);
                    if filter(&self.launch.packet, &wg) {
                        n += 1;
                    }
                }
            }
        }
        n
    }

    fn describe(&self, id: Dim3, with_wavefronts: bool) -> WorkGroupDesc {
        let p = &self.launch.packet;
        let curr = Dim3::new(
            (p.grid_size.x - id.x * p.workgroup_size.x).min(p.workgroup_size.x),
            (p.grid_size.y - id.y * p.workgroup_size.y).min(p.workgroup_size.y),
            (p.grid_size.z - id.z * p.workgroup_size.z).min(p.workgroup_size.z),
        );
        let mut wg = WorkGroupDesc::new(id, p.workgroup_size, curr);
        if with_wavefronts {
            wg.form_wavefronts();
        }
        wg
    }

    fn advance(&mut self) {
        let count = self.launch.packet.workgroup_count();
        self.next.x += 1;
        if self.next.x >= count.x {
            self.next.x = 0;
            self.next.y += 1;
            if self.next.y >= count.y {
                self.next.y = 0;
                self.next.z += 1;
                if self.next.z >= count.z {
                    self.done = true;
                }
            }
        }
    }

    /// Next work-group in grid order, or `None` once the grid is exhausted.
    pub fn next_wg(&mut self) -> Option<WorkGroupDesc> {
        if self.launch.packet.workgroup_count().size() == 0 {
            return None;
        }
        while !self.done {
            let id = self.next;
            self.advance();
            let wg = self.describe(id, true);
            match &self.launch.filter {
                Some(filter) if !filter(&self.launch.packet, &wg) => continue,
                _ => return Some(wg),
            }
        }
        None
    }

    pub fn skip(&mut self, n: usize) {
        for _ in 0..n {
            if self.next_wg().is_none() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(grid: Dim3, wg: Dim3) -> KernelLaunch {
        KernelLaunch::new(CodeObject::new("k", vec![0; 8]), DispatchPacket::new(grid, wg))
    }

    #[test]
    fn iterates_x_fastest() {
        let mut b = GridBuilder::new(launch(Dim3::new(128, 2, 1), Dim3::new(64, 1, 1)));
        let ids: Vec<Dim3> = std::iter::from_fn(|| b.next_wg()).map(|wg| wg.id).collect();
        assert_eq!(
            ids,
            vec![
                Dim3::new(0, 0, 0),
                Dim3::new(1, 0, 0),
                Dim3::new(0, 1, 0),
                Dim3::new(1, 1, 0)
            ]
        );
        assert_eq!(b.num_wg(), 4);
    }

    #[test]
    fn partial_edge_group_has_partial_exec_mask() {
        let mut b = GridBuilder::new(launch(Dim3::x(100), Dim3::x(128)));
        let wg = b.next_wg().unwrap();
        assert_eq!(wg.curr_size, Dim3::x(100));
        assert_eq!(wg.wavefronts.len(), 2);
        assert_eq!(wg.wavefronts[0].init_exec_mask, u64::MAX);
        assert_eq!(wg.wavefronts[1].init_exec_mask, (1u64 << 36) - 1);
        assert_eq!(wg.wavefronts[1].first_wi_flat_id, 64);
        assert!(b.next_wg().is_none());
    }

    #[test]
    fn filter_restricts_count_and_iteration() {
        let l = launch(Dim3::x(64 * 6), Dim3::x(64)).with_filter(|_, wg| wg.id.x % 2 == 0);
        let mut b = GridBuilder::new(l);
        assert_eq!(b.num_wg(), 3);
        let ids: Vec<u32> = std::iter::from_fn(|| b.next_wg()).map(|wg| wg.id.x).collect();
        assert_eq!(ids, vec![0, 2, 4]);
    }

    #[test]
    fn skip_moves_the_cursor() {
        let mut b = GridBuilder::new(launch(Dim3::x(64 * 5), Dim3::x(64)));
        b.skip(3);
        assert_eq!(b.next_wg().unwrap().id.x, 3);
    }

    #[test]
    fn local_id_unflattens() {
        let mut b = GridBuilder::new(launch(Dim3::new(8, 8, 2), Dim3::new(8, 8, 2)));
        let wg = b.next_wg().unwrap();
        assert_eq!(wg.local_id(8 * 8 + 8 + 3), Dim3::new(3, 1, 1));
        assert_eq!(wg.wavefronts.len(), 2);
    }
}
