/// Wavefront slots of one SIMD.
use crate::config::Capacity;
use crate::protocol::ReqId;
use crate::wavefront::WfRef;

#[derive(Debug, Clone)]
pub struct WavefrontPool {
    pub simd_id: usize,
    capacity: Option<usize>,
    wfs: Vec<WfRef>,
}

impl WavefrontPool {
    pub fn new(simd_id: usize, capacity: Capacity) -> Self {
        WavefrontPool {
            simd_id,
            capacity: capacity.limit().map(|c| c as usize),
            wfs: Vec::new(),
        }
    }

    /// Free slots, `None` when unlimited.
    pub fn available_slots(&self) -> Option<usize> {
        self.capacity.map(|c| c.saturating_sub(self.wfs.len()))
    }

    pub fn has_room(&self, count: usize) -> bool {
        self.available_slots().is_none_or(|free| free >= count)
    }

    pub fn add(&mut self, wf: WfRef) {
        if !self.has_room(1) {
            panic!("SIMD {} wavefront pool overflow adding {wf}", self.simd_id);
        }
        self.wfs.push(wf);
    }

    /// Drop every wavefront of the given work-group.
    pub fn remove_wg(&mut self, wg: ReqId) {
        self.wfs.retain(|wf| wf.wg != wg);
    }

    pub fn wfs(&self) -> &[WfRef] {
        &self.wfs
    }

    pub fn len(&self) -> usize {
        self.wfs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wfs.is_empty()
    }
}
