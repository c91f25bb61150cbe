/// Compute unit timing model.
///
/// A CU accepts work-groups whose resources the dispatcher already reserved,
/// runs their wavefronts through a scheduler and a set of functional units,
/// and reports each finished work-group back to the dispatcher.
///
/// Each cycle runs four phases in a fixed order:
///
/// 1. the functional units, then the scheduler (skipped while paused);
/// 2. one pending response to the controller;
/// 3. one message from each input port: map requests and memory responses
///    only while running or replaying, control requests always;
/// 4. flush and restart handling.
///
/// A flush moves every in-flight memory record into a shadow buffer, resets
/// all unfinished wavefronts to `Ready` and pauses the CU. A restart replays
/// the shadow buffer under fresh request ids, one record per class per cycle,
/// and resumes once it is empty.
mod arbiter;
mod coalescer;
mod inflight;
mod pool;
mod sampling;
mod scheduler;
mod units;
mod vmem;
mod wf_dispatcher;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::Serialize;

use crate::config::CuConfig;
use crate::error::ConfigError;
use crate::isa::{Alu, Decoder, ExecContext, RegisterFile, SimpleRegisterFile};
use crate::memory::{link, MemEndpoint, MemLink};
use crate::port::{channel, Receiver, Sender};
use crate::protocol::{CuControlReq, CuControlRsp, MapWgReq, MemReq, MemRsp, ReqId};
use crate::wavefront::{WfRef, WfState, Wavefront, WorkGroup};

pub use coalescer::Coalescer;
pub use inflight::{InFlight, InstFetchInfo, LaneInfo, ScalarMemAccessInfo, VectorMemAccessInfo};
pub use pool::WavefrontPool;
pub use sampling::WfSampler;
pub use scheduler::Scheduler;

use units::Units;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CuId(pub usize);

impl fmt::Display for CuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CU{}", self.0)
    }
}

/// Running counters of one CU.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CuStats {
    pub wgs_admitted: u64,
    pub wgs_completed: u64,
    pub wfs_completed: u64,
    /// Wavefronts retired by prediction instead of simulation
    pub wfs_sampled: u64,
    pub peak_resident_wgs: usize,
    pub insts_issued: u64,
    /// Memory responses that matched no in-flight record
    pub stale_responses: u64,
}

// ---------------------------------------------------------------------------
// State shared by the scheduler and the functional units
// ---------------------------------------------------------------------------

pub struct CuState {
    pub id: CuId,
    pub now: u64,
    pub config: CuConfig,
    pub work_groups: BTreeMap<ReqId, WorkGroup>,
    pub wf_pools: Vec<WavefrontPool>,
    pub sregs: Box<dyn RegisterFile>,
    /// One vector register file per SIMD
    pub vregs: Vec<Box<dyn RegisterFile>>,
    pub decoder: Box<dyn Decoder>,
    pub alu: Box<dyn Alu>,
    pub in_flight: InFlight,
    pub inst_mem: MemLink,
    pub scalar_mem: MemLink,
    pub vector_mem: MemLink,
    pub sampler: Option<WfSampler>,
    pub stats: CuStats,
    /// Some send failed this cycle because the destination was full
    pub send_blocked: bool,
}

impl CuState {
    pub fn try_wf(&self, r: WfRef) -> Option<&Wavefront> {
        self.work_groups.get(&r.wg).and_then(|wg| wg.wfs.get(r.index))
    }

    pub fn try_wf_mut(&mut self, r: WfRef) -> Option<&mut Wavefront> {
        self.work_groups.get_mut(&r.wg).and_then(|wg| wg.wfs.get_mut(r.index))
    }

    pub fn wf(&self, r: WfRef) -> &Wavefront {
        match self.try_wf(r) {
            Some(wf) => wf,
            None => panic!("{}: {r} is not resident", self.id),
        }
    }

    pub fn wf_mut(&mut self, r: WfRef) -> &mut Wavefront {
        let id = self.id;
        match self.try_wf_mut(r) {
            Some(wf) => wf,
            None => panic!("{id}: {r} is not resident"),
        }
    }

    /// Run `f` with the ALU and everything an instruction of `r` may touch.
    pub fn with_exec_context<R>(
        &mut self,
        r: WfRef,
        f: impl FnOnce(&dyn Alu, &mut ExecContext<'_>) -> R,
    ) -> R {
        let CuState {
            id,
            work_groups,
            sregs,
            vregs,
            alu,
            ..
        } = self;
        let Some(wg) = work_groups.get_mut(&r.wg) else {
            panic!("{id}: {r} is not resident");
        };
        let WorkGroup { wfs, lds, .. } = wg;
        let wf = &mut wfs[r.index];
        let simd = wf.simd_id();
        let mut ctx = ExecContext {
            wf,
            sregs: &mut **sregs,
            vregs: &mut *vregs[simd],
            lds: lds.as_mut_slice(),
        };
        f(&**alu, &mut ctx)
    }
}

// ---------------------------------------------------------------------------
// Compute unit
// ---------------------------------------------------------------------------

/// The outside ends of a CU's ports.
#[derive(Debug)]
pub struct CuHandles {
    pub map: Sender<MapWgReq>,
    pub control: Sender<CuControlReq>,
    pub control_rsp: Receiver<CuControlRsp>,
    pub inst_mem: MemEndpoint,
    pub scalar_mem: MemEndpoint,
    pub vector_mem: MemEndpoint,
}

pub struct ComputeUnit {
    state: CuState,
    units: Units,
    scheduler: Scheduler,
    map_rx: Receiver<MapWgReq>,
    ctrl_rx: Receiver<CuControlReq>,
    ctrl_tx: Sender<CuControlRsp>,
    ctrl_out: VecDeque<CuControlRsp>,
    pending_flush: Option<ReqId>,
    paused: bool,
    sending_shadow: bool,
    shadow: InFlight,
    active: bool,
}

impl ComputeUnit {
    pub fn new(
        id: CuId,
        config: &CuConfig,
        decoder: Box<dyn Decoder>,
        alu: Box<dyn Alu>,
    ) -> Result<(Self, CuHandles), ConfigError> {
        config.validate()?;
        let cap = config.port_capacity;
        let (map_tx, map_rx) = channel(format!("{id}.map"), cap);
        let (ctrl_req_tx, ctrl_rx) = channel(format!("{id}.ctrl"), cap);
        let (ctrl_tx, ctrl_rsp_rx) = channel(format!("{id}.ctrl_rsp"), cap);
        let (inst_mem, inst_end) = link(&format!("{id}.inst_mem"), cap);
        let (scalar_mem, scalar_end) = link(&format!("{id}.scalar_mem"), cap);
        let (vector_mem, vector_end) = link(&format!("{id}.vector_mem"), cap);

        let state = CuState {
            id,
            now: 0,
            config: config.clone(),
            work_groups: BTreeMap::new(),
            wf_pools: config
                .wf_pool_sizes
                .iter()
                .enumerate()
                .map(|(simd, cap)| WavefrontPool::new(simd, *cap))
                .collect(),
            sregs: Box::new(SimpleRegisterFile::scalar(config.sgpr_count.limit())),
            vregs: config
                .vgpr_counts
                .iter()
                .map(|c| Box::new(SimpleRegisterFile::vector(c.limit())) as Box<dyn RegisterFile>)
                .collect(),
            decoder,
            alu,
            in_flight: InFlight::default(),
            inst_mem,
            scalar_mem,
            vector_mem,
            sampler: config.sampling.clone().map(WfSampler::new),
            stats: CuStats::default(),
            send_blocked: false,
        };

        let cu = ComputeUnit {
            units: Units::new(config),
            scheduler: Scheduler::new(config),
            state,
            map_rx,
            ctrl_rx,
            ctrl_tx,
            ctrl_out: VecDeque::new(),
            pending_flush: None,
            paused: false,
            sending_shadow: false,
            shadow: InFlight::default(),
            active: false,
        };
        let handles = CuHandles {
            map: map_tx,
            control: ctrl_req_tx,
            control_rsp: ctrl_rsp_rx,
            inst_mem: inst_end,
            scalar_mem: scalar_end,
            vector_mem: vector_end,
        };
        Ok((cu, handles))
    }

    pub fn id(&self) -> CuId {
        self.state.id
    }

    pub fn state(&self) -> &CuState {
        &self.state
    }

    pub fn stats(&self) -> &CuStats {
        &self.state.stats
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.state.in_flight
    }

    pub fn shadow(&self) -> &InFlight {
        &self.shadow
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_sending_shadow(&self) -> bool {
        self.sending_shadow
    }

    /// Whether the last tick moved anything.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn resident_wgs(&self) -> usize {
        self.state.work_groups.len()
    }

    pub fn resident_wfs(&self) -> usize {
        self.state.wf_pools.iter().map(WavefrontPool::len).sum()
    }

    /// No resident work and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.state.work_groups.is_empty()
            && self.state.in_flight.is_empty()
            && self.shadow.is_empty()
            && self.units.is_idle()
    }

    /// Whether ticking this cycle could change anything. A CU that made no
    /// progress sleeps until a message reaches one of its ports.
    pub fn needs_tick(&self) -> bool {
        self.active
            || self.state.send_blocked
            || self.scheduler.sampled_pending() > 0
            || !self.ctrl_out.is_empty()
            || self.pending_flush.is_some()
            || self.sending_shadow
            || !self.map_rx.is_empty()
            || !self.ctrl_rx.is_empty()
            || !self.state.inst_mem.rsp.is_empty()
            || !self.state.scalar_mem.rsp.is_empty()
            || !self.state.vector_mem.rsp.is_empty()
    }

    pub fn tick(&mut self, now: u64) -> bool {
        self.state.now = now;
        self.state.send_blocked = false;

        let mut progress = self.run_pipeline();
        progress |= self.send_to_controller();
        progress |= self.process_input();
        progress |= self.do_flush();

        self.active = progress;
        progress
    }

    fn run_pipeline(&mut self) -> bool {
        if self.paused {
            return false;
        }
        let mut progress = self.units.run(&mut self.state);
        progress |= self.scheduler.run(&mut self.state, &mut self.units);
        progress
    }

    fn send_to_controller(&mut self) -> bool {
        let Some(rsp) = self.ctrl_out.pop_front() else {
            return false;
        };
        match self.ctrl_tx.send(rsp) {
            Ok(()) => true,
            Err(back) => {
                self.ctrl_out.push_front(back.0);
                false
            }
        }
    }

    fn process_input(&mut self) -> bool {
        let mut progress = false;
        if !self.paused || self.sending_shadow {
            progress |= self.process_map_req();
            progress |= self.process_inst_mem();
            progress |= self.process_scalar_mem();
            progress |= self.process_vector_mem();
        }
        progress |= self.process_control();
        progress
    }

    // -----------------------------------------------------------------------
    // Work-group admission
    // -----------------------------------------------------------------------

    fn process_map_req(&mut self) -> bool {
        let fits = {
            let Some(req) = self.map_rx.peek() else {
                return false;
            };
            let mut needed = vec![0usize; self.state.wf_pools.len()];
            for loc in &req.locations {
                needed[loc.simd_id] += 1;
            }
            needed
                .iter()
                .zip(&self.state.wf_pools)
                .all(|(n, pool)| pool.has_room(*n))
        };
        if !fits {
            return false;
        }
        let Some(req) = self.map_rx.retrieve() else {
            return false;
        };
        self.admit(req);
        true
    }

    fn admit(&mut self, req: MapWgReq) {
        let id = self.state.id;
        let wg = WorkGroup::from_map_req(req);
        let wg_id = wg.map_req_id;
        log::debug!(
            "{id}: admitting work-group {wg_id} {} ({} wavefronts)",
            wg.desc.id,
            wg.wfs.len()
        );
        let refs: Vec<WfRef> = wg.wf_refs().collect();
        let simds: Vec<usize> = wg.wfs.iter().map(Wavefront::simd_id).collect();
        self.state.work_groups.insert(wg_id, wg);
        self.state.stats.wgs_admitted += 1;
        self.state.stats.peak_resident_wgs = self
            .state
            .stats
            .peak_resident_wgs
            .max(self.state.work_groups.len());

        let prediction = self.state.sampler.as_ref().and_then(WfSampler::predict);
        if let Some(duration) = prediction {
            let now = self.state.now;
            for &r in &refs {
                let wf = self.state.wf_mut(r);
                wf.state = WfState::SampledCompleted;
                wf.dispatch_time = now;
                wf.sampled_deadline = Some(now + duration);
            }
            self.scheduler.add_sampled(wg_id, now + duration);
            return;
        }

        for (r, simd) in refs.into_iter().zip(simds) {
            self.state.wf_pools[simd].add(r);
            wf_dispatcher::dispatch_wf(&mut self.state, r);
        }
    }

    // -----------------------------------------------------------------------
    // Memory responses
    // -----------------------------------------------------------------------

    fn drop_stale(&mut self, port: &str, rsp_to: ReqId) {
        log::debug!("{}: dropping stale {port} response to {rsp_to}", self.state.id);
        self.state.stats.stale_responses += 1;
    }

    fn process_inst_mem(&mut self) -> bool {
        let Some(rsp) = self.state.inst_mem.rsp.retrieve() else {
            return false;
        };
        let MemRsp::DataReady { rsp_to, data } = rsp else {
            panic!("{}: instruction memory sent a write acknowledgement", self.state.id);
        };
        if self.state.in_flight.fetch.front().map(|i| i.req.id) != Some(rsp_to) {
            self.drop_stale("fetch", rsp_to);
            return true;
        }
        let Some(info) = self.state.in_flight.fetch.pop_front() else {
            return true;
        };

        let now = self.state.now;
        if let Some(wf) = self.state.try_wf_mut(info.wf) {
            if info.address() == wf.inst_buffer_end() {
                wf.inst_buffer.extend_from_slice(&data);
            }
            wf.is_fetching = false;
            wf.last_fetch_time = now;
        }
        true
    }

    fn process_scalar_mem(&mut self) -> bool {
        let Some(rsp) = self.state.scalar_mem.rsp.retrieve() else {
            return false;
        };
        let MemRsp::DataReady { rsp_to, data } = rsp else {
            panic!("{}: scalar memory sent a write acknowledgement", self.state.id);
        };
        if self.state.in_flight.scalar.front().map(|i| i.req.id) != Some(rsp_to) {
            self.drop_stale("scalar", rsp_to);
            return true;
        }
        let Some(info) = self.state.in_flight.scalar.pop_front() else {
            return true;
        };

        let soff = self.state.wf(info.wf).sreg_offset();
        self.state.sregs.write(soff, info.dst_sgpr, 0, &data);
        if !info.req.can_wait_for_coalesce {
            self.state.wf_mut(info.wf).outstanding_scalar_mem -= 1;
        }
        true
    }

    fn process_vector_mem(&mut self) -> bool {
        let Some(rsp) = self.state.vector_mem.rsp.retrieve() else {
            return false;
        };
        let rsp_to = rsp.rsp_to();
        let matches = match (self.state.in_flight.vector.front(), &rsp) {
            (Some(info), MemRsp::DataReady { .. }) => {
                matches!(&info.req, MemReq::Read(r) if r.id == rsp_to)
            }
            (Some(info), MemRsp::WriteDone { .. }) => {
                matches!(&info.req, MemReq::Write(w) if w.id == rsp_to)
            }
            (None, _) => false,
        };
        if !matches {
            self.drop_stale("vector", rsp_to);
            return true;
        }
        let Some(info) = self.state.in_flight.vector.pop_front() else {
            return true;
        };

        if let MemRsp::DataReady { data, .. } = &rsp {
            let wf = self.state.wf(info.wf);
            let (simd, voff) = (wf.simd_id(), wf.vreg_offset());
            for lane in &info.lanes {
                let len = 4 * lane.reg_count as usize;
                let Some(bytes) = data.get(lane.offset..lane.offset + len) else {
                    panic!(
                        "{}: lane {} reads past the {}-byte response",
                        self.state.id,
                        lane.lane,
                        data.len()
                    );
                };
                self.state.vregs[simd].write(voff, lane.reg, lane.lane, bytes);
            }
        }

        if !info.req.can_wait_for_coalesce() {
            let wf = self.state.wf_mut(info.wf);
            wf.outstanding_vector_mem -= 1;
            wf.outstanding_scalar_mem -= 1;
        }
        true
    }

    // -----------------------------------------------------------------------
    // Flush and restart
    // -----------------------------------------------------------------------

    fn process_control(&mut self) -> bool {
        let Some(req) = self.ctrl_rx.retrieve() else {
            return false;
        };
        match req {
            CuControlReq::Flush { id } => {
                log::debug!("{}: flush requested", self.state.id);
                self.pending_flush = Some(id);
            }
            CuControlReq::Restart { id } => {
                if !self.paused {
                    panic!("{}: restart without a prior flush", self.state.id);
                }
                log::debug!(
                    "{}: restarting, replaying {} shadow records",
                    self.state.id,
                    self.shadow.len()
                );
                self.sending_shadow = true;
                let rsp = CuControlRsp::RestartDone { rsp_to: id };
                if let Err(back) = self.ctrl_tx.send(rsp) {
                    self.ctrl_out.push_back(back.0);
                }
            }
        }
        true
    }

    fn do_flush(&mut self) -> bool {
        let mut progress = false;
        if let Some(id) = self.pending_flush.take() {
            if self.sending_shadow {
                self.state.in_flight.append(&mut self.shadow);
                self.sending_shadow = false;
            }
            self.flush_pipeline(id);
            progress = true;
        }
        if self.sending_shadow {
            progress |= self.send_shadow();
        }
        progress
    }

    fn flush_pipeline(&mut self, id: ReqId) {
        let mut drained = self.state.in_flight.take_all();
        self.shadow = InFlight::default();
        self.shadow.append(&mut drained);

        for wg in self.state.work_groups.values_mut() {
            for wf in wg.wfs.iter_mut().filter(|wf| !wf.is_done()) {
                wf.state = WfState::Ready;
                wf.is_fetching = false;
            }
        }
        self.scheduler.flush();
        self.units.flush();
        self.paused = true;
        self.ctrl_out.push_back(CuControlRsp::FlushDone { rsp_to: id });
        log::debug!(
            "{}: flushed, {} records moved to the shadow buffer",
            self.state.id,
            self.shadow.len()
        );
    }

    /// Send at most one shadow record per class; resume once all are out.
    fn send_shadow(&mut self) -> bool {
        if self.shadow.is_empty() {
            self.sending_shadow = false;
            self.paused = false;
            log::debug!("{}: resumed", self.state.id);
            return true;
        }

        let mut progress = false;
        if let Some(mut info) = self.shadow.scalar.pop_front() {
            info.req.id = ReqId::fresh();
            match self.state.scalar_mem.req.send(MemReq::Read(info.req.clone())) {
                Ok(()) => {
                    self.state.in_flight.scalar.push_back(info);
                    progress = true;
                }
                Err(_) => self.shadow.scalar.push_front(info),
            }
        }
        if let Some(mut info) = self.shadow.vector.pop_front() {
            info.req.set_id(ReqId::fresh());
            match self.state.vector_mem.req.send(info.req.clone()) {
                Ok(()) => {
                    self.state.in_flight.vector.push_back(info);
                    progress = true;
                }
                Err(_) => self.shadow.vector.push_front(info),
            }
        }
        if let Some(mut info) = self.shadow.fetch.pop_front() {
            info.req.id = ReqId::fresh();
            match self.state.inst_mem.req.send(MemReq::Read(info.req.clone())) {
                Ok(()) => {
                    self.state.in_flight.fetch.push_back(info);
                    progress = true;
                }
                Err(_) => self.shadow.fetch.push_front(info),
            }
        }
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Capacity;
    use crate::cu::arbiter::{DstSpan, IssueArbiter};
    use crate::isa::micro::{Asm, MicroAlu, MicroDecoder};
    use crate::wavefront::WfState;
    use crate::kernel::{CodeObject, Dim3, DispatchPacket, GridBuilder, KernelLaunch};
    use crate::memory::FixedLatencyMemory;
    use crate::protocol::{WfDispatchLocation, WgCompletionMsg};

    fn at(sgpr_offset: u32, vgpr_offset: u32) -> WfDispatchLocation {
        WfDispatchLocation {
            simd_id: 0,
            sgpr_offset,
            vgpr_offset,
            lds_offset: 0,
        }
    }

    struct Rig {
        cu: ComputeUnit,
        control: Sender<CuControlReq>,
        control_rsp: Receiver<CuControlRsp>,
        map: Sender<MapWgReq>,
        memory: FixedLatencyMemory,
        done_tx: Sender<WgCompletionMsg>,
        done_rx: Receiver<WgCompletionMsg>,
        now: u64,
    }

    impl Rig {
        fn new(latency: u64) -> Self {
            let config = CuConfig::unlimited_registers(1, 4);
            let (cu, handles) =
                ComputeUnit::new(CuId(0), &config, Box::new(MicroDecoder), Box::new(MicroAlu)).unwrap();
            let mut memory = FixedLatencyMemory::new(latency);
            memory.attach(handles.inst_mem);
            memory.attach(handles.scalar_mem);
            memory.attach(handles.vector_mem);
            let (done_tx, done_rx) = channel("done", 8);
            Rig {
                cu,
                control: handles.control,
                control_rsp: handles.control_rsp,
                map: handles.map,
                memory,
                done_tx,
                done_rx,
                now: 0,
            }
        }

        /// Map a single-wavefront work-group running `code`.
        fn map(&mut self, code: Vec<u8>) -> ReqId {
            self.map_group(code, vec![at(0, 0)])
        }

        /// Map one work-group with a wavefront per location.
        fn map_group(&mut self, code: Vec<u8>, locations: Vec<WfDispatchLocation>) -> ReqId {
            let size = 64 * locations.len() as u32;
            let launch = KernelLaunch::new(
                CodeObject::new("k", code),
                DispatchPacket::new(Dim3::x(size), Dim3::x(size)),
            );
            let work_group = GridBuilder::new(launch.clone()).next_wg().unwrap();
            let id = ReqId::fresh();
            let req = MapWgReq {
                id,
                launch,
                work_group,
                locations,
                reply_to: self.done_tx.clone(),
            };
            self.map.send(req).unwrap();
            id
        }

        fn step(&mut self) {
            self.cu.tick(self.now);
            self.memory.tick(self.now);
            self.now += 1;
        }

        fn run_until(&mut self, limit: u64, mut done: impl FnMut(&mut Rig) -> bool) {
            for _ in 0..limit {
                if done(self) {
                    return;
                }
                self.step();
            }
            panic!("condition not reached within {limit} cycles");
        }
    }

    #[test]
    fn single_wavefront_completes_and_reports() {
        let mut rig = Rig::new(10);
        let id = rig.map(Asm::new().v_add(1, 0, 3).s_nop().s_endpgm().build());
        rig.step();
        let cu: &ComputeUnit = &rig.cu;
        assert!(!cu.is_idle());
        rig.run_until(500, |r| !r.done_rx.is_empty());
        let cu: &ComputeUnit = &rig.cu;
        assert!(cu.is_idle());

        assert_eq!(rig.done_rx.retrieve(), Some(WgCompletionMsg { rsp_to: vec![id] }));
        assert_eq!(rig.cu.resident_wgs(), 0);
        assert_eq!(rig.cu.resident_wfs(), 0);
        assert_eq!(rig.cu.stats().wfs_completed, 1);
        assert_eq!(rig.cu.stats().wgs_completed, 1);
    }

    #[test]
    fn undecodable_word_terminates_the_wavefront() {
        let mut rig = Rig::new(5);
        let id = rig.map(vec![0xff, 0, 0, 0, 0, 0, 0, 0]);
        rig.run_until(300, |r| !r.done_rx.is_empty());
        assert_eq!(rig.done_rx.retrieve().unwrap().rsp_to, vec![id]);
    }

    #[test]
    fn running_off_the_code_ends_the_program() {
        let mut rig = Rig::new(5);
        let id = rig.map(Asm::new().s_nop().build());
        rig.run_until(300, |r| !r.done_rx.is_empty());
        assert_eq!(rig.done_rx.retrieve().unwrap().rsp_to, vec![id]);
    }

    #[test]
    fn flush_parks_in_flight_records_and_restart_replays_them() {
        let mut rig = Rig::new(40);
        let code = Asm::new()
            .v_lshl(2, 0, 2)
            .flat_load(1, 2, 0)
            .s_waitcnt(0, 0)
            .s_endpgm()
            .build();
        rig.map(code);
        rig.run_until(500, |r| !r.cu.in_flight().vector.is_empty());

        let before: usize = rig.cu.in_flight().len();
        rig.control.send(CuControlReq::flush()).unwrap();
        rig.run_until(50, |r| !r.control_rsp.is_empty());
        assert!(matches!(rig.control_rsp.retrieve(), Some(CuControlRsp::FlushDone { .. })));
        assert!(rig.cu.is_paused());
        assert!(rig.cu.in_flight().is_empty());
        assert_eq!(rig.cu.shadow().len(), before);
        let old_ids = rig.cu.shadow().ids();

        // responses to the drained requests are ignored while paused
        for _ in 0..60 {
            rig.step();
        }
        assert_eq!(rig.cu.shadow().len(), before);

        rig.control.send(CuControlReq::restart()).unwrap();
        rig.run_until(50, |r| !r.control_rsp.is_empty());
        assert!(matches!(rig.control_rsp.retrieve(), Some(CuControlRsp::RestartDone { .. })));
        rig.run_until(50, |r| !r.cu.is_paused());
        assert!(rig.cu.shadow().is_empty());
        let new_ids = rig.cu.in_flight().ids();
        assert!(new_ids.iter().all(|id| !old_ids.contains(id)));

        rig.run_until(1000, |r| !r.done_rx.is_empty());
        assert_eq!(rig.cu.stats().wfs_completed, 1);
    }

    #[test]
    fn barrier_releases_every_wavefront_in_the_same_cycle() {
        let mut rig = Rig::new(3);
        let code = Asm::new().s_barrier().s_endpgm().build();
        let id = rig.map_group(code, (0..4).map(|i| at(i * 64, i * 256)).collect());

        let mut saw_waiting = false;
        rig.run_until(500, |r| {
            if let Some(wg) = r.cu.state.work_groups.get(&id) {
                let waiting = wg.wfs.iter().filter(|wf| wf.state == WfState::AtBarrier).count();
                let passed = wg.wfs.iter().filter(|wf| wf.pc > 0).count();
                saw_waiting |= waiting > 0;
                assert!(waiting == 0 || passed == 0, "{waiting} waiting while {passed} passed");
            }
            !r.done_rx.is_empty()
        });
        assert!(saw_waiting);
        assert_eq!(rig.done_rx.retrieve().unwrap().rsp_to, vec![id]);
        assert_eq!(rig.cu.stats().wfs_completed, 4);
    }

    #[test]
    fn issue_never_grants_overlapping_destinations() {
        let mut rig = Rig::new(3);
        // both wavefronts share one register window
        rig.map_group(Asm::new().s_endpgm().build(), vec![at(0, 0), at(0, 0)]);
        rig.run_until(20, |r| r.cu.resident_wfs() == 2);

        let decode = |code: Vec<u8>| MicroDecoder.decode(&code).unwrap();
        let refs = rig.cu.state.wf_pools[0].wfs().to_vec();
        let offer = |state: &mut CuState, valu: Vec<u8>, lds: Vec<u8>| {
            for (r, code) in refs.iter().zip([valu, lds]) {
                let wf = state.wf_mut(*r);
                wf.state = WfState::Ready;
                wf.inst_to_issue = Some(decode(code));
            }
            IssueArbiter::new().arbitrate(state)
        };

        let state = &mut rig.cu.state;
        let granted = offer(state, Asm::new().v_add(1, 0, 3).build(), Asm::new().ds_read(1, 0).build());
        assert_eq!(granted.len(), 1);

        let granted = offer(state, Asm::new().v_add(1, 0, 3).build(), Asm::new().ds_read(5, 0).build());
        assert_eq!(granted.len(), 2);
        let spans: Vec<_> = granted.iter().filter_map(|r| DstSpan::of(state.wf(*r))).collect();
        assert!(!spans[0].overlaps(&spans[1]));
    }

    #[test]
    #[should_panic(expected = "restart without a prior flush")]
    fn restart_without_flush_panics() {
        let mut rig = Rig::new(5);
        rig.control.send(CuControlReq::restart()).unwrap();
        rig.step();
    }

    #[test]
    fn construction_rejects_sgprs_off_granularity() {
        let config = CuConfig {
            sgpr_count: Capacity::Limited(40),
            ..CuConfig::gcn3()
        };
        let err = ComputeUnit::new(CuId(1), &config, Box::new(MicroDecoder), Box::new(MicroAlu))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::NotMultipleOfGranularity { resource: "SGPR", .. }));
    }

    #[test]
    fn map_request_waits_for_a_free_slot() {
        let config = CuConfig {
            wf_pool_sizes: vec![Capacity::Limited(1)],
            ..CuConfig::unlimited_registers(1, 1)
        };
        let (mut cu, handles) =
            ComputeUnit::new(CuId(3), &config, Box::new(MicroDecoder), Box::new(MicroAlu)).unwrap();
        let mut memory = FixedLatencyMemory::new(2);
        memory.attach(handles.inst_mem);
        memory.attach(handles.scalar_mem);
        memory.attach(handles.vector_mem);
        let (done_tx, done_rx) = channel("done", 8);

        let launch = KernelLaunch::new(
            CodeObject::new("k", Asm::new().s_nop().s_endpgm().build()),
            DispatchPacket::new(Dim3::x(128), Dim3::x(64)),
        );
        let mut grid = GridBuilder::new(launch.clone());
        for _ in 0..2 {
            let req = MapWgReq {
                id: ReqId::fresh(),
                launch: launch.clone(),
                work_group: grid.next_wg().unwrap(),
                locations: vec![WfDispatchLocation {
                    simd_id: 0,
                    sgpr_offset: 0,
                    vgpr_offset: 0,
                    lds_offset: 0,
                }],
                reply_to: done_tx.clone(),
            };
            handles.map.send(req).unwrap();
        }

        for now in 0..500 {
            cu.tick(now);
            memory.tick(now);
            assert!(cu.resident_wgs() <= 1);
            if done_rx.len() == 2 {
                break;
            }
        }
        assert_eq!(done_rx.len(), 2);
        assert_eq!(cu.stats().peak_resident_wgs, 1);
    }
}
