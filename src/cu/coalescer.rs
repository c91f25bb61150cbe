/// Vector memory coalescing.
///
/// Every active lane's dwords are bucketed by cache line, in lane order. One
/// bucket becomes one full-line transaction. Loads remember which lane and
/// register each dword goes back to; stores merge their bytes into the
/// line's data and dirty mask. All transactions but the last one of an
/// instruction may wait for coalescing, so the wavefront's outstanding
/// counters only move when the last response arrives.
use crate::isa::LaneAccess;
use crate::protocol::{MemReq, ReadReq, WriteReq};
use crate::wavefront::WfRef;

use super::inflight::{LaneInfo, VectorMemAccessInfo};

#[derive(Debug, Clone, Copy)]
pub struct Coalescer {
    log2_line: u32,
}

impl Coalescer {
    pub fn new(log2_line: u32) -> Self {
        Coalescer { log2_line }
    }

    pub fn line_size(&self) -> u64 {
        1 << self.log2_line
    }

    fn line_of(&self, addr: u64) -> u64 {
        addr & !(self.line_size() - 1)
    }

    fn offset_in_line(&self, addr: u64) -> usize {
        (addr & (self.line_size() - 1)) as usize
    }

    fn check_fits(&self, addr: u64, len: usize) {
        if self.offset_in_line(addr) + len > self.line_size() as usize {
            panic!("access of {len} bytes at {addr:#x} crosses a cache line");
        }
    }

    pub fn generate(&self, wf: WfRef, lanes: &[LaneAccess], is_store: bool) -> Vec<VectorMemAccessInfo> {
        let mut transactions = if is_store {
            self.write_transactions(wf, lanes)
        } else {
            self.read_transactions(wf, lanes)
        };

        let last = transactions.len().saturating_sub(1);
        for (i, t) in transactions.iter_mut().enumerate() {
            let wait = i != last;
            match &mut t.req {
                MemReq::Read(r) => r.can_wait_for_coalesce = wait,
                MemReq::Write(w) => w.can_wait_for_coalesce = wait,
            }
        }
        transactions
    }

    fn read_transactions(&self, wf: WfRef, lanes: &[LaneAccess]) -> Vec<VectorMemAccessInfo> {
        let mut out: Vec<VectorMemAccessInfo> = Vec::new();
        for access in lanes {
            for j in 0..access.reg_count {
                let addr = access.address + 4 * j as u64;
                self.check_fits(addr, 4);
                let line = self.line_of(addr);
                let lane = LaneInfo {
                    lane: access.lane,
                    reg: access.reg + j,
                    reg_count: 1,
                    offset: self.offset_in_line(addr),
                };
                match out.iter_mut().find(|t| t.req.address() == line) {
                    Some(t) => t.lanes.push(lane),
                    None => out.push(VectorMemAccessInfo {
                        wf,
                        req: MemReq::Read(ReadReq::new(line, self.line_size())),
                        lanes: vec![lane],
                    }),
                }
            }
        }
        out
    }

    fn write_transactions(&self, wf: WfRef, lanes: &[LaneAccess]) -> Vec<VectorMemAccessInfo> {
        let mut reqs: Vec<WriteReq> = Vec::new();
        for access in lanes {
            for j in 0..access.reg_count as usize {
                let addr = access.address + 4 * j as u64;
                self.check_fits(addr, 4);
                let line = self.line_of(addr);
                let idx = match reqs.iter().position(|r| r.address == line) {
                    Some(idx) => idx,
                    None => {
                        reqs.push(WriteReq::new(line, self.line_size() as usize));
                        reqs.len() - 1
                    }
                };
                let offset = self.offset_in_line(addr);
                let bytes = access.data.get(4 * j..4 * j + 4).unwrap_or(&[0; 4]);
                let req = &mut reqs[idx];
                req.data[offset..offset + 4].copy_from_slice(bytes);
                req.dirty_mask[offset..offset + 4].fill(true);
            }
        }
        reqs.into_iter()
            .map(|w| VectorMemAccessInfo {
                wf,
                req: MemReq::Write(w),
                lanes: Vec::new(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReqId;

    const WF: WfRef = WfRef { wg: ReqId(1), index: 0 };

    fn load_lane(lane: usize, address: u64) -> LaneAccess {
        LaneAccess {
            lane,
            address,
            reg: 2,
            reg_count: 1,
            data: Vec::new(),
        }
    }

    #[test]
    fn contiguous_dwords_make_one_transaction_per_line() {
        let lanes: Vec<LaneAccess> = (0..64).map(|l| load_lane(l, 0x1000 + 4 * l as u64)).collect();
        let ts = Coalescer::new(6).generate(WF, &lanes, false);
        assert_eq!(ts.len(), 4);
        for (i, t) in ts.iter().enumerate() {
            assert_eq!(t.req.address(), 0x1000 + 64 * i as u64);
            assert_eq!(t.lanes.len(), 16);
            assert_eq!(t.lanes[0].lane, 16 * i);
            assert_eq!(t.lanes[3].offset, 12);
            assert_eq!(t.req.can_wait_for_coalesce(), i != 3);
        }
    }

    #[test]
    fn same_line_lanes_share_a_transaction_regardless_of_order() {
        let lanes = vec![
            load_lane(0, 0x80),
            load_lane(1, 0x0),
            load_lane(2, 0x84),
            load_lane(3, 0x3c),
        ];
        let ts = Coalescer::new(6).generate(WF, &lanes, false);
        assert_eq!(ts.len(), 2);
        assert_eq!(ts[0].req.address(), 0x80);
        let lanes0: Vec<usize> = ts[0].lanes.iter().map(|l| l.lane).collect();
        assert_eq!(lanes0, vec![0, 2]);
        let lanes1: Vec<usize> = ts[1].lanes.iter().map(|l| l.lane).collect();
        assert_eq!(lanes1, vec![1, 3]);
    }

    #[test]
    fn stores_merge_bytes_and_dirty_mask() {
        let lanes = vec![
            LaneAccess { lane: 0, address: 0x40, reg: 1, reg_count: 1, data: vec![1, 2, 3, 4] },
            LaneAccess { lane: 5, address: 0x48, reg: 1, reg_count: 1, data: vec![5, 6, 7, 8] },
            // overlapping lane wins by lane order
            LaneAccess { lane: 9, address: 0x48, reg: 1, reg_count: 1, data: vec![9, 9, 9, 9] },
        ];
        let ts = Coalescer::new(6).generate(WF, &lanes, true);
        assert_eq!(ts.len(), 1);
        let MemReq::Write(w) = &ts[0].req else {
            panic!("expected a write");
        };
        assert_eq!(w.address, 0x40);
        assert_eq!(&w.data[0..4], &[1, 2, 3, 4]);
        assert_eq!(&w.data[8..12], &[9, 9, 9, 9]);
        assert_eq!(w.dirty_mask.iter().filter(|d| **d).count(), 8);
        assert!(!w.dirty_mask[4]);
        assert!(!w.can_wait_for_coalesce);
    }

    #[test]
    fn no_active_lanes_means_no_transactions() {
        assert!(Coalescer::new(6).generate(WF, &[], false).is_empty());
    }
}
