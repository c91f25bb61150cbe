/// Runtime state of wavefronts and the work-groups that own them.
///
/// A `WorkGroup` owns its wavefronts and its LDS storage. Everything else in
/// a CU (wavefront pools, pipeline stages, in-flight memory records) refers to
/// a wavefront through a `WfRef`, a plain (work-group, index) pair.
use std::fmt;

use crate::isa::Instruction;
use crate::kernel::{CodeObject, KernelLaunch, WavefrontDesc, WorkGroupDesc};
use crate::port::Sender;
use crate::protocol::{MapWgReq, ReqId, WfDispatchLocation, WgCompletionMsg};

/// Instruction fetch granule. Fetches are aligned to it and the instruction
/// buffer is trimmed in whole granules.
pub const INST_FETCH_BYTES: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WfRef {
    /// Id of the map request that placed the work-group
    pub wg: ReqId,
    pub index: usize,
}

impl fmt::Display for WfRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wg{}/wf{}", self.wg, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WfState {
    /// Eligible for decode and issue
    Ready,
    /// Its instruction is in a functional unit or being evaluated
    Running,
    AtBarrier,
    Completed,
    /// Retired by the sampling fast path at a predicted time
    SampledCompleted,
}

impl fmt::Display for WfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WfState::Ready            => write!(f, "Ready"),
            WfState::Running          => write!(f, "Running"),
            WfState::AtBarrier        => write!(f, "AtBarrier"),
            WfState::Completed        => write!(f, "Completed"),
            WfState::SampledCompleted => write!(f, "SampledCompleted"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Wavefront {
    placement: WfDispatchLocation,
    pub first_wi_flat_id: u32,
    pub init_exec_mask: u64,
    /// Registers declared by the code object, cleared on completion
    pub sgpr_count: u32,
    pub vgpr_count: u32,

    pub state: WfState,
    pub pc: u64,
    pub exec: u64,

    pub inst_buffer: Vec<u8>,
    pub inst_buffer_start_pc: u64,
    pub is_fetching: bool,
    pub last_fetch_time: u64,

    /// Decoded, waiting for the issue arbiter
    pub inst_to_issue: Option<Instruction>,
    /// Issued and not yet retired
    pub dynamic_inst: Option<Instruction>,

    pub outstanding_scalar_mem: u32,
    pub outstanding_vector_mem: u32,

    /// Terminated after a decode fault
    pub killed: bool,
    pub dispatch_time: u64,
    pub finish_time: Option<u64>,
    pub sampled_deadline: Option<u64>,
}

impl Wavefront {
    pub fn new(desc: &WavefrontDesc, placement: WfDispatchLocation, co: &CodeObject) -> Self {
        Wavefront {
            placement,
            first_wi_flat_id: desc.first_wi_flat_id,
            init_exec_mask: desc.init_exec_mask,
            sgpr_count: co.sgpr_count,
            vgpr_count: co.vgpr_count,
            state: WfState::Ready,
            pc: 0,
            exec: 0,
            inst_buffer: Vec::new(),
            inst_buffer_start_pc: 0,
            is_fetching: false,
            last_fetch_time: 0,
            inst_to_issue: None,
            dynamic_inst: None,
            outstanding_scalar_mem: 0,
            outstanding_vector_mem: 0,
            killed: false,
            dispatch_time: 0,
            finish_time: None,
            sampled_deadline: None,
        }
    }

    pub fn placement(&self) -> &WfDispatchLocation {
        &self.placement
    }

    pub fn simd_id(&self) -> usize {
        self.placement.simd_id
    }

    pub fn sreg_offset(&self) -> u32 {
        self.placement.sgpr_offset
    }

    pub fn vreg_offset(&self) -> u32 {
        self.placement.vgpr_offset
    }

    pub fn lds_offset(&self) -> u32 {
        self.placement.lds_offset
    }

    /// The issued instruction, panicking if there is none.
    pub fn inst(&self) -> &Instruction {
        match &self.dynamic_inst {
            Some(inst) => inst,
            None => panic!("wavefront at pc {:#x} has no issued instruction", self.pc),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, WfState::Completed | WfState::SampledCompleted)
    }

    pub fn inst_buffer_end(&self) -> u64 {
        self.inst_buffer_start_pc + self.inst_buffer.len() as u64
    }

    /// Aligned address of the next fetch granule.
    pub fn next_fetch_address(&self) -> u64 {
        let addr = if self.inst_buffer.is_empty() {
            self.pc
        } else {
            self.inst_buffer_end()
        };
        addr & !(INST_FETCH_BYTES - 1)
    }

    /// Instruction bytes available from the PC onwards.
    pub fn bytes_at_pc(&self) -> &[u8] {
        if self.pc < self.inst_buffer_start_pc || self.pc > self.inst_buffer_end() {
            return &[];
        }
        &self.inst_buffer[(self.pc - self.inst_buffer_start_pc) as usize..]
    }

    /// Retire the issued instruction: step past it and become ready again.
    pub fn update_pc_and_set_ready(&mut self) {
        self.state = WfState::Ready;
        self.advance_pc();
    }

    /// Step past the issued instruction without changing the state.
    pub fn advance_pc(&mut self) {
        self.pc += self.inst().byte_size as u64;
        self.trim_inst_buffer();
    }

    /// Drop whole fetch granules the PC has moved past. A PC outside the
    /// buffer (taken branch) discards the buffer.
    pub fn trim_inst_buffer(&mut self) {
        if self.inst_buffer.is_empty() {
            return;
        }
        if self.pc < self.inst_buffer_start_pc || self.pc > self.inst_buffer_end() {
            self.inst_buffer.clear();
            self.inst_buffer_start_pc = self.pc & !(INST_FETCH_BYTES - 1);
            return;
        }
        let whole = ((self.pc - self.inst_buffer_start_pc) / INST_FETCH_BYTES) * INST_FETCH_BYTES;
        let whole = whole.min(self.inst_buffer.len() as u64 / INST_FETCH_BYTES * INST_FETCH_BYTES);
        if whole > 0 {
            self.inst_buffer.drain(..whole as usize);
            self.inst_buffer_start_pc += whole;
        }
    }
}

/// A work-group resident on a CU.
#[derive(Debug)]
pub struct WorkGroup {
    pub map_req_id: ReqId,
    pub desc: WorkGroupDesc,
    pub launch: KernelLaunch,
    pub wfs: Vec<Wavefront>,
    pub lds: Vec<u8>,
    pub reply_to: Sender<WgCompletionMsg>,
}

impl WorkGroup {
    pub fn from_map_req(req: MapWgReq) -> Self {
        let co = &req.launch.code_object;
        let wfs = req
            .work_group
            .wavefronts
            .iter()
            .zip(&req.locations)
            .map(|(desc, loc)| Wavefront::new(desc, *loc, co))
            .collect();
        WorkGroup {
            map_req_id: req.id,
            lds: vec![0; co.group_segment_bytes as usize],
            desc: req.work_group,
            launch: req.launch,
            wfs,
            reply_to: req.reply_to,
        }
    }

    pub fn wf_ref(&self, index: usize) -> WfRef {
        WfRef {
            wg: self.map_req_id,
            index,
        }
    }

    pub fn wf_refs(&self) -> impl Iterator<Item = WfRef> + '_ {
        (0..self.wfs.len()).map(|i| self.wf_ref(i))
    }

    pub fn all_others_completed(&self, index: usize) -> bool {
        self.wfs
            .iter()
            .enumerate()
            .all(|(i, wf)| i == index || wf.state == WfState::Completed)
    }

    /// Every other wavefront either waits at the barrier or has finished.
    pub fn all_others_at_barrier(&self, index: usize) -> bool {
        self.wfs.iter().enumerate().all(|(i, wf)| {
            i == index || matches!(wf.state, WfState::AtBarrier | WfState::Completed)
        })
    }

    pub fn is_completed(&self) -> bool {
        self.wfs.iter().all(|wf| wf.state == WfState::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::Instruction;
    use crate::kernel::{Dim3, DispatchPacket};
    use crate::port::channel;

    fn wavefront() -> Wavefront {
        let desc = WavefrontDesc {
            first_wi_flat_id: 0,
            init_exec_mask: u64::MAX,
        };
        let loc = WfDispatchLocation {
            simd_id: 1,
            sgpr_offset: 64,
            vgpr_offset: 16,
            lds_offset: 0,
        };
        Wavefront::new(&desc, loc, &CodeObject::new("k", vec![]))
    }

    #[test]
    fn retiring_steps_pc_and_trims_whole_granules() {
        let mut wf = wavefront();
        wf.inst_buffer = vec![0; 128];
        wf.inst_buffer_start_pc = 0x1000;
        wf.pc = 0x1000 + 60;
        wf.dynamic_inst = Some(Instruction::end_pgm());
        wf.state = WfState::Running;

        wf.update_pc_and_set_ready();
        assert_eq!(wf.state, WfState::Ready);
        assert_eq!(wf.pc, 0x1040);
        assert_eq!(wf.inst_buffer_start_pc, 0x1040);
        assert_eq!(wf.inst_buffer.len(), 64);
        assert_eq!(wf.bytes_at_pc().len(), 64);
    }

    #[test]
    fn branch_outside_buffer_discards_it() {
        let mut wf = wavefront();
        wf.inst_buffer = vec![0; 64];
        wf.inst_buffer_start_pc = 0x1040;
        wf.pc = 0x1008;
        wf.trim_inst_buffer();
        assert!(wf.inst_buffer.is_empty());
        assert_eq!(wf.inst_buffer_start_pc, 0x1000);
        assert!(wf.bytes_at_pc().is_empty());
    }

    #[test]
    fn placement_is_fixed_at_construction() {
        let wf = wavefront();
        assert_eq!(wf.simd_id(), 1);
        assert_eq!(wf.sreg_offset(), 64);
        assert_eq!(wf.vreg_offset(), 16);
    }

    #[test]
    fn completion_checks_ignore_the_caller() {
        let (tx, _rx) = channel("done", 1);
        let packet = DispatchPacket::new(Dim3::x(192), Dim3::x(192));
        let launch = KernelLaunch::new(CodeObject::new("k", vec![]), packet);
        let work_group = crate::kernel::GridBuilder::new(launch.clone()).next_wg().unwrap();
        let locations = vec![
            WfDispatchLocation {
                simd_id: 0,
                sgpr_offset: 0,
                vgpr_offset: 0,
                lds_offset: 0
            };
            3
        ];
        let mut wg = WorkGroup::from_map_req(MapWgReq {
            id: ReqId(9),
            launch,
            work_group,
            locations,
            reply_to: tx,
        });
        assert_eq!(wg.wfs.len(), 3);
        wg.wfs[1].state = WfState::Completed;
        wg.wfs[2].state = WfState::AtBarrier;
        assert!(!wg.all_others_completed(0));
        assert!(wg.all_others_at_barrier(0));
        wg.wfs[2].state = WfState::Completed;
        assert!(wg.all_others_completed(0));
        assert!(!wg.is_completed());
        assert_eq!(wg.wf_ref(2), WfRef { wg: ReqId(9), index: 2 });
    }
}
