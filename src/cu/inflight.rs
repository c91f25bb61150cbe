/// Records of memory requests a CU is waiting on.
///
/// Each request class has its own FIFO, matching the in-order responses of
/// its memory port: the oldest record is always the one the next response
/// answers. A response naming any other id is stale (sent before a flush) and
/// is dropped.
use std::collections::VecDeque;

use crate::protocol::{MemReq, ReadReq, ReqId};
use crate::wavefront::WfRef;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstFetchInfo {
    pub wf: WfRef,
    pub req: ReadReq,
}

impl InstFetchInfo {
    pub fn address(&self) -> u64 {
        self.req.address
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarMemAccessInfo {
    pub wf: WfRef,
    pub req: ReadReq,
    /// First SGPR written by the response
    pub dst_sgpr: u32,
}

/// Where one lane's data lives inside a vector transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneInfo {
    pub lane: usize,
    pub reg: u32,
    pub reg_count: u32,
    /// Byte offset of the lane's data inside the cache line
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorMemAccessInfo {
    pub wf: WfRef,
    pub req: MemReq,
    pub lanes: Vec<LaneInfo>,
}

/// The three in-flight queues of a CU. Also used as the shadow buffer that
/// holds drained records between a flush and a restart.
#[derive(Debug, Default, Clone)]
pub struct InFlight {
    pub fetch: VecDeque<InstFetchInfo>,
    pub scalar: VecDeque<ScalarMemAccessInfo>,
    pub vector: VecDeque<VectorMemAccessInfo>,
}

impl InFlight {
    pub fn take_all(&mut self) -> InFlight {
        std::mem::take(self)
    }

    /// Move every record of `other` behind the records already queued here.
    pub fn append(&mut self, other: &mut InFlight) {
        self.fetch.append(&mut other.fetch);
        self.scalar.append(&mut other.scalar);
        self.vector.append(&mut other.vector);
    }

    pub fn len(&self) -> usize {
        self.fetch.len() + self.scalar.len() + self.vector.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every queued request, fetches first.
    pub fn ids(&self) -> Vec<ReqId> {
        self.fetch
            .iter()
            .map(|i| i.req.id)
            .chain(self.scalar.iter().map(|i| i.req.id))
            .chain(self.vector.iter().map(|i| i.req.id()))
            .collect()
    }
}
