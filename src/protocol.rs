/// Messages exchanged over ports.
///
/// CU boundary: map-work-group requests from the dispatcher, work-group
/// completion messages back to it, and pipeline flush/restart control from an
/// external controller. Kernel boundary: launch responses to the driver.
/// Memory boundary: read/write requests and their responses.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::kernel::{KernelLaunch, WorkGroupDesc};
use crate::port::Sender;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique message id. Responses name the request they answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReqId(pub u64);

impl ReqId {
    pub fn fresh() -> Self {
        ReqId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Dispatcher <-> CU
// ---------------------------------------------------------------------------

/// Where one wavefront of a work-group has been placed inside a CU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WfDispatchLocation {
    pub simd_id: usize,
    /// Byte offset into the scalar register file
    pub sgpr_offset: u32,
    /// Byte offset into each lane of the SIMD's vector register file
    pub vgpr_offset: u32,
    /// Byte offset into the CU's LDS
    pub lds_offset: u32,
}

/// Asks a CU to run a work-group whose resources were already reserved.
#[derive(Debug, Clone)]
pub struct MapWgReq {
    pub id: ReqId,
    pub launch: KernelLaunch,
    pub work_group: WorkGroupDesc,
    /// One entry per wavefront, same order as `work_group.wavefronts`
    pub locations: Vec<WfDispatchLocation>,
    /// Where the completion message has to go
    pub reply_to: Sender<WgCompletionMsg>,
}

/// Reports finished work-groups, naming the map requests that placed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgCompletionMsg {
    pub rsp_to: Vec<ReqId>,
}

// ---------------------------------------------------------------------------
// Controller <-> CU
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuControlReq {
    /// Drain in-flight memory traffic into shadow buffers and pause.
    Flush { id: ReqId },
    /// Replay the shadow buffers and resume.
    Restart { id: ReqId },
}

impl CuControlReq {
    pub fn flush() -> Self {
        CuControlReq::Flush { id: ReqId::fresh() }
    }

    pub fn restart() -> Self {
        CuControlReq::Restart { id: ReqId::fresh() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuControlRsp {
    FlushDone { rsp_to: ReqId },
    RestartDone { rsp_to: ReqId },
}

// ---------------------------------------------------------------------------
// Driver <-> dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LaunchKernelReq {
    pub id: ReqId,
    pub launch: KernelLaunch,
}

impl LaunchKernelReq {
    pub fn new(launch: KernelLaunch) -> Self {
        LaunchKernelReq {
            id: ReqId::fresh(),
            launch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchKernelRsp {
    pub rsp_to: ReqId,
}

// ---------------------------------------------------------------------------
// CU <-> memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReq {
    pub id: ReqId,
    pub address: u64,
    pub byte_size: u64,
    /// More transactions of the same instruction follow this one
    pub can_wait_for_coalesce: bool,
}

impl ReadReq {
    pub fn new(address: u64, byte_size: u64) -> Self {
        ReadReq {
            id: ReqId::fresh(),
            address,
            byte_size,
            can_wait_for_coalesce: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReq {
    pub id: ReqId,
    pub address: u64,
    pub data: Vec<u8>,
    /// Which bytes of `data` are actually written
    pub dirty_mask: Vec<bool>,
    pub can_wait_for_coalesce: bool,
}

impl WriteReq {
    pub fn new(address: u64, line_size: usize) -> Self {
        WriteReq {
            id: ReqId::fresh(),
            address,
            data: vec![0; line_size],
            dirty_mask: vec![false; line_size],
            can_wait_for_coalesce: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemReq {
    Read(ReadReq),
    Write(WriteReq),
}

impl MemReq {
    pub fn id(&self) -> ReqId {
        match self {
            MemReq::Read(r) => r.id,
            MemReq::Write(w) => w.id,
        }
    }

    pub fn set_id(&mut self, id: ReqId) {
        match self {
            MemReq::Read(r) => r.id = id,
            MemReq::Write(w) => w.id = id,
        }
    }

    pub fn address(&self) -> u64 {
        match self {
            MemReq::Read(r) => r.address,
            MemReq::Write(w) => w.address,
        }
    }

    pub fn can_wait_for_coalesce(&self) -> bool {
        match self {
            MemReq::Read(r) => r.can_wait_for_coalesce,
            MemReq::Write(w) => w.can_wait_for_coalesce,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemRsp {
    DataReady { rsp_to: ReqId, data: Vec<u8> },
    WriteDone { rsp_to: ReqId },
}

impl MemRsp {
    pub fn rsp_to(&self) -> ReqId {
        match self {
            MemRsp::DataReady { rsp_to, .. } | MemRsp::WriteDone { rsp_to } => *rsp_to,
        }
    }
}
