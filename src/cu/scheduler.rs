/// Per-CU wavefront scheduler.
///
/// Each cycle, in order: retire sampled work-groups whose predicted time has
/// come, evaluate the control instructions held internally (end of program,
/// barrier, wait-count, no-op), decode for every ready wavefront, issue the
/// arbiter's grants to the functional units, and start at most one
/// instruction fetch.
use std::collections::VecDeque;

use crate::config::CuConfig;
use crate::isa::{DecodeError, ExeUnit, InstKind, Instruction};
use crate::protocol::{MemReq, ReadReq, ReqId, WgCompletionMsg};
use crate::wavefront::{WfRef, WfState, INST_FETCH_BYTES};

use super::arbiter::{FetchArbiter, IssueArbiter};
use super::inflight::InstFetchInfo;
use super::units::Units;
use super::CuState;

/// Bytes the decoder needs before it is worth trying.
const MIN_DECODE_BYTES: usize = 4;

#[derive(Debug)]
pub struct Scheduler {
    issue_arbiter: IssueArbiter,
    fetch_arbiter: FetchArbiter,
    /// Wavefronts whose special instruction is being evaluated
    internal_executing: Vec<WfRef>,
    barrier_buffer: Vec<WfRef>,
    barrier_buffer_size: usize,
    cycles_no_progress: u32,
    stop_after: u32,
    /// Work-groups retired by prediction, with the cycle they finish at
    sampled: Vec<(ReqId, u64)>,
}

impl Scheduler {
    pub fn new(config: &CuConfig) -> Self {
        Scheduler {
            issue_arbiter: IssueArbiter::new(),
            fetch_arbiter: FetchArbiter::new(config.inst_buffer_bytes),
            internal_executing: Vec::new(),
            barrier_buffer: Vec::new(),
            barrier_buffer_size: config.barrier_buffer_size,
            cycles_no_progress: 0,
            stop_after: config.idle_cycles_before_sleep,
            sampled: Vec::new(),
        }
    }

    /// One scheduling cycle. Returns false once nothing has moved for more
    /// than the configured number of consecutive cycles.
    pub fn run(&mut self, state: &mut CuState, units: &mut Units) -> bool {
        let mut progress = self.retire_sampled(state);
        progress |= self.evaluate_internal(state);
        progress |= self.decode(state);
        progress |= self.issue(state, units);
        progress |= self.fetch(state);

        if progress {
            self.cycles_no_progress = 0;
        } else {
            self.cycles_no_progress = self.cycles_no_progress.saturating_add(1);
        }
        self.cycles_no_progress <= self.stop_after
    }

    /// Drop all internal evaluation and barrier state. The CU resets the
    /// wavefronts themselves.
    pub fn flush(&mut self) {
        self.internal_executing.clear();
        self.barrier_buffer.clear();
        self.cycles_no_progress = 0;
    }

    /// Track a work-group admitted on the sampling fast path.
    pub fn add_sampled(&mut self, wg: ReqId, finish_at: u64) {
        self.sampled.push((wg, finish_at));
    }

    pub fn barrier_buffer(&self) -> &[WfRef] {
        &self.barrier_buffer
    }

    pub fn internal_executing(&self) -> &[WfRef] {
        &self.internal_executing
    }

    pub fn sampled_pending(&self) -> usize {
        self.sampled.len()
    }

    // -----------------------------------------------------------------------
    // Sampled work-groups
    // -----------------------------------------------------------------------

    fn retire_sampled(&mut self, state: &mut CuState) -> bool {
        if self.sampled.is_empty() {
            return false;
        }
        let now = state.now;
        let mut progress = false;
        let mut waiting = Vec::new();
        for (wg, finish_at) in std::mem::take(&mut self.sampled) {
            if finish_at > now {
                waiting.push((wg, finish_at));
                continue;
            }
            let Some(group) = state.work_groups.get_mut(&wg) else {
                panic!("{}: sampled work-group {wg} is not resident", state.id);
            };
            let msg = WgCompletionMsg {
                rsp_to: vec![group.map_req_id],
            };
            if group.reply_to.send(msg).is_err() {
                state.send_blocked = true;
                waiting.push((wg, finish_at));
                continue;
            }
            for wf in &mut group.wfs {
                wf.state = WfState::Completed;
                wf.finish_time = Some(now);
            }
            state.stats.wfs_sampled += group.wfs.len() as u64;
            clear_wg(state, wg);
            progress = true;
        }
        self.sampled = waiting;
        progress
    }

    // -----------------------------------------------------------------------
    // Special instructions
    // -----------------------------------------------------------------------

    fn evaluate_internal(&mut self, state: &mut CuState) -> bool {
        let mut progress = false;
        let mut pending: VecDeque<WfRef> = std::mem::take(&mut self.internal_executing).into();
        let mut keep = Vec::new();

        while let Some(r) = pending.pop_front() {
            let Some(kind) = state.try_wf(r).map(|wf| wf.inst().kind) else {
                continue;
            };
            let (moved, done) = match kind {
                InstKind::EndPgm => self.eval_end_pgm(state, r, &mut pending, &mut keep),
                InstKind::Barrier => self.eval_barrier(state, r, &mut pending, &mut keep),
                InstKind::WaitCnt { vmcnt, lgkmcnt } => eval_wait_cnt(state, r, vmcnt, lgkmcnt),
                _ => {
                    state.wf_mut(r).update_pc_and_set_ready();
                    (true, true)
                }
            };
            progress |= moved;
            if !done {
                keep.push(r);
            }
        }

        self.internal_executing = keep;
        progress
    }

    fn eval_end_pgm(
        &mut self,
        state: &mut CuState,
        r: WfRef,
        pending: &mut VecDeque<WfRef>,
        keep: &mut Vec<WfRef>,
    ) -> (bool, bool) {
        let wf = state.wf(r);
        if wf.outstanding_scalar_mem > 0 || wf.outstanding_vector_mem > 0 {
            return (false, false);
        }

        let wg = &state.work_groups[&r.wg];
        if wg.all_others_completed(r.index) {
            let msg = WgCompletionMsg {
                rsp_to: vec![wg.map_req_id],
            };
            if wg.reply_to.send(msg).is_err() {
                state.send_blocked = true;
                return (false, false);
            }
            finish_wf(state, r);
            self.barrier_buffer.retain(|b| b.wg != r.wg);
            clear_wg(state, r.wg);
            return (true, true);
        }

        let releases_barrier = wg.all_others_at_barrier(r.index);
        finish_wf(state, r);
        if releases_barrier {
            self.pass_barrier(state, r.wg, pending, keep);
        }
        (true, true)
    }

    fn eval_barrier(
        &mut self,
        state: &mut CuState,
        r: WfRef,
        pending: &mut VecDeque<WfRef>,
        keep: &mut Vec<WfRef>,
    ) -> (bool, bool) {
        state.wf_mut(r).state = WfState::AtBarrier;

        if state.work_groups[&r.wg].all_others_at_barrier(r.index) {
            self.pass_barrier(state, r.wg, pending, keep);
            return (true, true);
        }
        if self.barrier_buffer.len() < self.barrier_buffer_size {
            self.barrier_buffer.push(r);
            return (true, true);
        }
        (false, false)
    }

    /// Release every wavefront of `wg` waiting at the barrier.
    fn pass_barrier(
        &mut self,
        state: &mut CuState,
        wg: ReqId,
        pending: &mut VecDeque<WfRef>,
        keep: &mut Vec<WfRef>,
    ) {
        let Some(group) = state.work_groups.get_mut(&wg) else {
            panic!("{}: barrier of unknown work-group {wg}", state.id);
        };
        let mut released = Vec::new();
        for i in 0..group.wfs.len() {
            if group.wfs[i].state == WfState::AtBarrier {
                group.wfs[i].update_pc_and_set_ready();
                released.push(group.wf_ref(i));
            }
        }
        self.barrier_buffer.retain(|r| !released.contains(r));
        pending.retain(|r| !released.contains(r));
        keep.retain(|r| !released.contains(r));
        log::trace!("{}: work-group {wg} passed a barrier ({} released)", state.id, released.len());
    }

    // -----------------------------------------------------------------------
    // Decode, issue, fetch
    // -----------------------------------------------------------------------

    fn decode(&mut self, state: &mut CuState) -> bool {
        let refs: Vec<WfRef> = state
            .wf_pools
            .iter()
            .flat_map(|p| p.wfs().iter().copied())
            .collect();

        let mut progress = false;
        for r in refs {
            let Some(wg) = state.work_groups.get_mut(&r.wg) else {
                continue;
            };
            let code_end = wg.launch.code_end_pc();
            let wf = &mut wg.wfs[r.index];
            if wf.state != WfState::Ready || wf.inst_to_issue.is_some() {
                continue;
            }
            if wf.pc >= code_end {
                wf.inst_to_issue = Some(Instruction::end_pgm());
                progress = true;
                continue;
            }

            let bytes = wf.bytes_at_pc();
            if bytes.len() < MIN_DECODE_BYTES {
                continue;
            }
            match state.decoder.decode(bytes) {
                Ok(inst) => {
                    wf.inst_to_issue = Some(inst);
                    progress = true;
                }
                Err(DecodeError::Incomplete { .. }) => {}
                Err(e) => {
                    log::error!("{}: {r} at pc {:#x}: {e}; terminating wavefront", state.id, wf.pc);
                    wf.killed = true;
                    wf.inst_to_issue = Some(Instruction::end_pgm());
                    progress = true;
                }
            }
        }
        progress
    }

    fn issue(&mut self, state: &mut CuState, units: &mut Units) -> bool {
        let mut progress = false;
        for r in self.issue_arbiter.arbitrate(state) {
            let wf = state.wf_mut(r);
            let Some(exe) = wf.inst_to_issue.as_ref().map(|i| i.exe_unit) else {
                continue;
            };

            if exe == ExeUnit::Special {
                wf.dynamic_inst = wf.inst_to_issue.take();
                wf.state = WfState::Running;
                self.internal_executing.push(r);
                progress = true;
                continue;
            }

            let unit = units.unit_for(exe, wf.simd_id());
            if !unit.can_accept_wave() {
                continue;
            }
            wf.dynamic_inst = wf.inst_to_issue.take();
            wf.state = WfState::Running;
            unit.accept_wave(r);
            state.stats.insts_issued += 1;
            progress = true;
        }
        progress
    }

    fn fetch(&mut self, state: &mut CuState) -> bool {
        let Some(r) = self.fetch_arbiter.arbitrate(state) else {
            return false;
        };
        let wf = state.wf_mut(r);
        if wf.inst_buffer.is_empty() {
            wf.inst_buffer_start_pc = wf.pc & !(INST_FETCH_BYTES - 1);
        }
        let req = ReadReq::new(wf.next_fetch_address(), INST_FETCH_BYTES);

        if state.inst_mem.req.send(MemReq::Read(req.clone())).is_err() {
            state.send_blocked = true;
            return false;
        }
        state.wf_mut(r).is_fetching = true;
        state.in_flight.fetch.push_back(InstFetchInfo { wf: r, req });
        true
    }
}

fn eval_wait_cnt(state: &mut CuState, r: WfRef, vmcnt: u32, lgkmcnt: u32) -> (bool, bool) {
    let wf = state.wf_mut(r);
    if wf.outstanding_scalar_mem <= lgkmcnt && wf.outstanding_vector_mem <= vmcnt {
        wf.update_pc_and_set_ready();
        return (true, true);
    }
    (false, false)
}

/// Mark a wavefront completed and return its registers to zero.
fn finish_wf(state: &mut CuState, r: WfRef) {
    let now = state.now;
    let wf = state.wf_mut(r);
    wf.state = WfState::Completed;
    wf.finish_time = Some(now);
    let duration = now.saturating_sub(wf.dispatch_time);
    let (soff, sgprs) = (wf.sreg_offset(), wf.sgpr_count);
    let (simd, voff, vgprs) = (wf.simd_id(), wf.vreg_offset(), wf.vgpr_count);
    let killed = wf.killed;

    state.sregs.clear(soff, sgprs);
    state.vregs[simd].clear(voff, vgprs);
    state.stats.wfs_completed += 1;
    if let Some(sampler) = &mut state.sampler {
        if !killed {
            sampler.collect(duration);
        }
    }
    log::trace!("{}: {r} completed after {duration} cycles", state.id);
}

/// Remove a finished work-group from the CU.
fn clear_wg(state: &mut CuState, wg: ReqId) {
    for pool in &mut state.wf_pools {
        pool.remove_wg(wg);
    }
    if state.work_groups.remove(&wg).is_none() {
        panic!("{}: clearing unknown work-group {wg}", state.id);
    }
    state.stats.wgs_completed += 1;
    log::debug!("{}: work-group {wg} completed", state.id);
}
