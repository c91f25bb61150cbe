/// Issue and fetch arbitration.
///
/// Issue is loose round-robin: one wavefront pool is visited per cycle, in
/// rotation, and inside the pool the starting wavefront rotates too, so every
/// wavefront with a decoded instruction is eventually offered. At most one
/// wavefront per functional-unit class is granted per cycle, and never two
/// whose destination registers overlap.
///
/// Fetch is oldest-first: the wavefront that last received instruction bytes
/// longest ago wins.
use std::ops::Range;

use crate::isa::{ExeUnit, RegFileKind};
use crate::wavefront::{WfRef, WfState, Wavefront};

use super::CuState;

/// Destination register bytes an instruction writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DstSpan {
    pub file: RegFileKind,
    /// SIMD whose vector file is written; 0 for the scalar file
    pub simd: usize,
    pub bytes: Range<u32>,
}

impl DstSpan {
    pub fn of(wf: &Wavefront) -> Option<DstSpan> {
        let dst = wf.inst_to_issue.as_ref()?.dst?;
        let (simd, base) = match dst.file {
            RegFileKind::Scalar => (0, wf.sreg_offset()),
            RegFileKind::Vector => (wf.simd_id(), wf.vreg_offset()),
        };
        let start = base + dst.first * 4;
        Some(DstSpan {
            file: dst.file,
            simd,
            bytes: start..start + dst.count * 4,
        })
    }

    pub fn overlaps(&self, other: &DstSpan) -> bool {
        self.file == other.file
            && self.simd == other.simd
            && self.bytes.start < other.bytes.end
            && other.bytes.start < self.bytes.end
    }
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct IssueArbiter {
    last_pool: Option<usize>,
    /// Rotating start position inside each pool
    start: Vec<usize>,
}

impl IssueArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arbitrate(&mut self, state: &CuState) -> Vec<WfRef> {
        let pools = state.wf_pools.len();
        if pools == 0 {
            return vec![];
        }
        if self.start.len() != pools {
            self.start = vec![0; pools];
        }
        let pool_idx = self.last_pool.map_or(0, |p| (p + 1) % pools);
        self.last_pool = Some(pool_idx);

        let wfs = state.wf_pools[pool_idx].wfs();
        if wfs.is_empty() {
            return vec![];
        }
        let start = self.start[pool_idx] % wfs.len();

        let mut units: Vec<ExeUnit> = Vec::new();
        let mut spans: Vec<DstSpan> = Vec::new();
        let mut granted = Vec::new();
        for i in 0..wfs.len() {
            let r = wfs[(start + i) % wfs.len()];
            let wf = state.wf(r);
            if wf.state != WfState::Ready {
                continue;
            }
            let Some(inst) = &wf.inst_to_issue else {
                continue;
            };
            if units.contains(&inst.exe_unit) {
                continue;
            }
            let span = DstSpan::of(wf);
            if let Some(span) = &span {
                if spans.iter().any(|s| s.overlaps(span)) {
                    continue;
                }
            }
            units.push(inst.exe_unit);
            spans.extend(span);
            granted.push(r);
        }

        self.start[pool_idx] = (start + 1) % wfs.len();
        granted
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FetchArbiter {
    inst_buffer_bytes: usize,
}

impl FetchArbiter {
    pub fn new(inst_buffer_bytes: usize) -> Self {
        FetchArbiter { inst_buffer_bytes }
    }

    fn eligible(&self, state: &CuState, r: WfRef) -> bool {
        let wg = &state.work_groups[&r.wg];
        let wf = &wg.wfs[r.index];
        !wf.is_fetching
            && !wf.is_done()
            && wf.inst_buffer.len() < self.inst_buffer_bytes
            && wf.next_fetch_address() < wg.launch.code_end_pc()
    }

    /// At most one wavefront to fetch for this cycle.
    pub fn arbitrate(&self, state: &CuState) -> Option<WfRef> {
        state
            .wf_pools
            .iter()
            .flat_map(|p| p.wfs().iter().copied())
            .filter(|r| self.eligible(state, *r))
            .min_by_key(|r| state.wf(*r).last_fetch_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(file: RegFileKind, simd: usize, bytes: Range<u32>) -> DstSpan {
        DstSpan { file, simd, bytes }
    }

    #[test]
    fn spans_overlap_only_in_same_file_and_simd() {
        let a = span(RegFileKind::Vector, 0, 0..8);
        assert!(a.overlaps(&span(RegFileKind::Vector, 0, 4..12)));
        assert!(!a.overlaps(&span(RegFileKind::Vector, 0, 8..12)));
        assert!(!a.overlaps(&span(RegFileKind::Vector, 1, 0..8)));
        assert!(!a.overlaps(&span(RegFileKind::Scalar, 0, 0..8)));
    }
}
