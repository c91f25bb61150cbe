/// Capabilities the timing core consumes but does not implement itself.
///
/// The pipeline only needs to know which functional unit an instruction goes
/// to, how many bytes it occupies, what it writes, and (for memory
/// instructions) which addresses it touches. The bit-level meaning of each
/// opcode lives behind the `Alu` trait and the binary format behind the
/// `Decoder` trait. `micro` provides a small reference ISA implementing both.
pub mod micro;

use thiserror::Error;

use crate::kernel::WAVEFRONT_SIZE;
use crate::wavefront::Wavefront;

/// Functional unit class an instruction is issued to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExeUnit {
    Branch,
    Scalar,
    Valu,
    VMem,
    Lds,
    /// Control instructions evaluated by the scheduler itself
    Special,
}

impl std::fmt::Display for ExeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExeUnit::Branch  => write!(f, "Branch"),
            ExeUnit::Scalar  => write!(f, "Scalar"),
            ExeUnit::Valu    => write!(f, "VALU"),
            ExeUnit::VMem    => write!(f, "VMem"),
            ExeUnit::Lds     => write!(f, "LDS"),
            ExeUnit::Special => write!(f, "Special"),
        }
    }
}

/// What the pipeline has to do with an instruction beyond handing it to the ALU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstKind {
    EndPgm,
    Barrier,
    WaitCnt { vmcnt: u32, lgkmcnt: u32 },
    /// Any other control instruction; it just advances the PC
    Nop,
    ScalarAlu,
    ScalarLoad,
    Branch,
    VectorAlu,
    VectorLoad,
    VectorStore,
    Lds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegFileKind {
    Scalar,
    Vector,
}

/// Destination registers of an instruction, relative to the wavefront's
/// register window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegRange {
    pub file: RegFileKind,
    pub first: u32,
    pub count: u32,
}

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub name: &'static str,
    pub kind: InstKind,
    pub exe_unit: ExeUnit,
    pub byte_size: u32,
    pub dst: Option<RegRange>,
    /// Raw operand fields, interpreted only by the ALU
    pub operands: [u8; 3],
}

impl Instruction {
    /// The end-of-program substituted when a wavefront runs off its code
    /// object or hits an undecodable word.
    pub fn end_pgm() -> Self {
        Instruction {
            name: "s_endpgm",
            kind: InstKind::EndPgm,
            exe_unit: ExeUnit::Special,
            byte_size: 4,
            dst: None,
            operands: [0; 3],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("need {needed} bytes to decode, only {available} available")]
    Incomplete { needed: usize, available: usize },

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("invalid operand in {name}: {detail}")]
    InvalidOperand { name: &'static str, detail: String },
}

pub trait Decoder {
    fn decode(&self, bytes: &[u8]) -> Result<Instruction, DecodeError>;
}

// ---------------------------------------------------------------------------
// Register files
// ---------------------------------------------------------------------------

/// Scalar and vector register storage, addressed by the wavefront's byte
/// offset, a register index and a lane.
pub trait RegisterFile {
    fn read(&self, wave_offset: u32, reg: u32, lane: usize, byte_count: usize) -> Vec<u8>;
    fn write(&mut self, wave_offset: u32, reg: u32, lane: usize, data: &[u8]);

    fn read_u32(&self, wave_offset: u32, reg: u32, lane: usize) -> u32 {
        let b = self.read(wave_offset, reg, lane, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn write_u32(&mut self, wave_offset: u32, reg: u32, lane: usize, value: u32) {
        self.write(wave_offset, reg, lane, &value.to_le_bytes());
    }

    /// Zero `count` registers starting at the wavefront's offset, in every lane.
    fn clear(&mut self, wave_offset: u32, count: u32);
}

/// Flat byte storage per lane. A scalar file has one lane, a vector file 64.
/// Without a byte limit the storage grows on demand.
#[derive(Debug, Clone)]
pub struct SimpleRegisterFile {
    lanes: Vec<Vec<u8>>,
    bytes_per_lane: Option<usize>,
}

impl SimpleRegisterFile {
    pub fn new(lanes: usize, bytes_per_lane: Option<usize>) -> Self {
        SimpleRegisterFile {
            lanes: vec![vec![0; bytes_per_lane.unwrap_or(0)]; lanes],
            bytes_per_lane,
        }
    }

    /// `count` 32-bit scalar registers.
    pub fn scalar(count: Option<u32>) -> Self {
        Self::new(1, count.map(|c| c as usize * 4))
    }

    /// `count` 32-bit vector registers, counted across all 64 lanes.
    pub fn vector(count: Option<u32>) -> Self {
        Self::new(
            WAVEFRONT_SIZE as usize,
            count.map(|c| c as usize * 4 / WAVEFRONT_SIZE as usize),
        )
    }

    fn ensure(&mut self, lane: usize, end: usize) {
        let storage = &mut self.lanes[lane];
        if end > storage.len() {
            match self.bytes_per_lane {
                Some(limit) => panic!(
                    "register access up to byte {end} exceeds the {limit}-byte register file"
                ),
                None => storage.resize(end, 0),
            }
        }
    }
}

impl RegisterFile for SimpleRegisterFile {
    fn read(&self, wave_offset: u32, reg: u32, lane: usize, byte_count: usize) -> Vec<u8> {
        let start = (wave_offset + reg * 4) as usize;
        let storage = &self.lanes[lane];
        (start..start + byte_count)
            .map(|i| storage.get(i).copied().unwrap_or(0))
            .collect()
    }

    fn write(&mut self, wave_offset: u32, reg: u32, lane: usize, data: &[u8]) {
        let start = (wave_offset + reg * 4) as usize;
        self.ensure(lane, start + data.len());
        self.lanes[lane][start..start + data.len()].copy_from_slice(data);
    }

    fn clear(&mut self, wave_offset: u32, count: u32) {
        let start = wave_offset as usize;
        let len = count as usize * 4;
        for storage in &mut self.lanes {
            let end = (start + len).min(storage.len());
            if start < end {
                storage[start..end].fill(0);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ALU
// ---------------------------------------------------------------------------

/// Architectural state one instruction may touch.
pub struct ExecContext<'a> {
    pub wf: &'a mut Wavefront,
    pub sregs: &'a mut dyn RegisterFile,
    pub vregs: &'a mut dyn RegisterFile,
    pub lds: &'a mut [u8],
}

/// Memory operand of a scalar load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarLoadOperand {
    pub address: u64,
    pub dst_reg: u32,
    pub dwords: u32,
}

/// One lane of a vector memory instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneAccess {
    pub lane: usize,
    pub address: u64,
    /// First destination (load) or source (store) vector register
    pub reg: u32,
    pub reg_count: u32,
    /// Store data, `4 * reg_count` bytes; empty for loads
    pub data: Vec<u8>,
}

pub trait Alu {
    /// Perform the side effects of a non-memory instruction.
    fn execute(&self, inst: &Instruction, ctx: &mut ExecContext<'_>);

    fn scalar_load_operand(&self, inst: &Instruction, ctx: &ExecContext<'_>) -> ScalarLoadOperand;

    /// Per-lane addresses (and data for stores) of the active lanes.
    fn vector_mem_operands(&self, inst: &Instruction, ctx: &ExecContext<'_>) -> Vec<LaneAccess>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_file_round_trips_at_wave_offset() {
        let mut rf = SimpleRegisterFile::scalar(Some(64));
        rf.write_u32(64, 3, 0, 0xdead_beef);
        assert_eq!(rf.read_u32(64, 3, 0), 0xdead_beef);
        assert_eq!(rf.read_u32(0, 19, 0), 0xdead_beef);
    }

    #[test]
    fn unlimited_vector_file_grows_and_reads_zero_beyond_end() {
        let mut rf = SimpleRegisterFile::vector(None);
        assert_eq!(rf.read_u32(4096, 0, 63), 0);
        rf.write_u32(4096, 1, 63, 7);
        assert_eq!(rf.read_u32(4096, 1, 63), 7);
        assert_eq!(rf.read_u32(4096, 1, 62), 0);
    }

    #[test]
    fn clear_zeroes_window_in_all_lanes() {
        let mut rf = SimpleRegisterFile::vector(Some(256 * 64));
        for lane in 0..64 {
            rf.write_u32(16, 0, lane, 1);
            rf.write_u32(16, 2, lane, 2);
        }
        rf.clear(16, 2);
        assert_eq!(rf.read_u32(16, 0, 5), 0);
        assert_eq!(rf.read_u32(16, 2, 5), 2);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn limited_file_rejects_out_of_range_write() {
        let mut rf = SimpleRegisterFile::scalar(Some(4));
        rf.write_u32(0, 4, 0, 1);
    }
}
