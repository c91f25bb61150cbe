/// Vector memory unit.
///
/// Instructions first travel an instruction pipeline. At its end the
/// coalescer expands an instruction into cache-line transactions, which are
/// recorded as in flight at once and then travel a transaction pipeline, one
/// per cycle, before being sent to memory. An instruction whose expansion
/// would push the CU past its in-flight transaction limit waits at the end of
/// the instruction pipeline.
use std::collections::VecDeque;

use crate::config::CuConfig;
use crate::isa::InstKind;
use crate::protocol::MemReq;
use crate::wavefront::WfRef;

use super::coalescer::Coalescer;
use super::units::{Pipeline, SubComponent};
use super::CuState;

#[derive(Debug)]
pub struct VectorMemoryUnit {
    coalescer: Coalescer,
    inst_pipeline: Pipeline<WfRef>,
    transactions_waiting: VecDeque<MemReq>,
    trans_pipeline: Pipeline<MemReq>,
}

impl VectorMemoryUnit {
    pub fn new(config: &CuConfig) -> Self {
        VectorMemoryUnit {
            coalescer: Coalescer::new(config.log2_cache_line_size),
            inst_pipeline: Pipeline::new(config.vmem_inst_pipeline_depth, config.vmem_buffer_size),
            transactions_waiting: VecDeque::new(),
            trans_pipeline: Pipeline::new(config.vmem_trans_pipeline_depth, config.vmem_buffer_size),
        }
    }

    fn send_request(&mut self, state: &mut CuState) -> bool {
        let Some(req) = self.trans_pipeline.peek() else {
            return false;
        };
        match state.vector_mem.req.send(req.clone()) {
            Ok(()) => {
                self.trans_pipeline.pop();
                true
            }
            Err(_) => {
                state.send_blocked = true;
                false
            }
        }
    }

    fn inst_to_transaction(&mut self, state: &mut CuState) -> bool {
        if !self.transactions_waiting.is_empty() {
            if !self.trans_pipeline.can_accept() {
                return false;
            }
            if let Some(req) = self.transactions_waiting.pop_front() {
                self.trans_pipeline.accept(req);
            }
            return true;
        }
        self.execute(state)
    }

    fn execute(&mut self, state: &mut CuState) -> bool {
        let Some(&r) = self.inst_pipeline.peek() else {
            return false;
        };
        let inst = state.wf(r).inst().clone();
        let is_store = match inst.kind {
            InstKind::VectorLoad => false,
            InstKind::VectorStore => true,
            other => panic!("{} ({other:?}) cannot run in the vector memory unit", inst.name),
        };

        let lanes = state.with_exec_context(r, |alu, ctx| alu.vector_mem_operands(&inst, ctx));
        let transactions = self.coalescer.generate(r, &lanes, is_store);

        if !transactions.is_empty() {
            if transactions.len() + state.in_flight.vector.len() > state.config.in_flight_vector_mem_limit {
                log::trace!("{}: {r} waits for in-flight vector transactions to drain", state.id);
                return false;
            }
            let wf = state.wf_mut(r);
            wf.outstanding_vector_mem += 1;
            wf.outstanding_scalar_mem += 1;
            for t in transactions {
                self.transactions_waiting.push_back(t.req.clone());
                state.in_flight.vector.push_back(t);
            }
        }

        self.inst_pipeline.pop();
        state.wf_mut(r).update_pc_and_set_ready();
        true
    }

    pub fn transactions_queued(&self) -> usize {
        self.transactions_waiting.len()
    }
}

impl SubComponent for VectorMemoryUnit {
    fn name(&self) -> &str {
        "vmem"
    }

    fn can_accept_wave(&self) -> bool {
        self.inst_pipeline.can_accept()
    }

    fn accept_wave(&mut self, wf: WfRef) {
        self.inst_pipeline.accept(wf);
    }

    fn run(&mut self, state: &mut CuState) -> bool {
        let mut progress = self.send_request(state);
        progress |= self.trans_pipeline.tick();
        progress |= self.inst_to_transaction(state);
        progress |= self.inst_pipeline.tick();
        progress
    }

    fn flush(&mut self) {
        self.inst_pipeline.clear();
        self.trans_pipeline.clear();
        self.transactions_waiting.clear();
    }

    fn is_idle(&self) -> bool {
        self.inst_pipeline.is_empty() && self.trans_pipeline.is_empty() && self.transactions_waiting.is_empty()
    }
}
