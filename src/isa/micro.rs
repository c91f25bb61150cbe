/// A tiny reference ISA for driving the timing model.
///
/// Every instruction is one little-endian 32-bit word `[opcode, a, b, c]`.
/// 64-bit scalar operands are register pairs `s[n]:s[n+1]`. Branch offsets are
/// signed 16-bit word counts taken from bytes `b, c` and are relative to the
/// next instruction.
///
/// | opcode | mnemonic         | effect                                   |
/// |--------|------------------|------------------------------------------|
/// | 0x00   | s_endpgm         |                                          |
/// | 0x01   | s_barrier        |                                          |
/// | 0x02   | s_waitcnt        | a = vmcnt, b = lgkmcnt                   |
/// | 0x03   | s_nop            |                                          |
/// | 0x10   | s_add            | s[a] = s[b] + (c as i8)                  |
/// | 0x11   | s_mov            | s[a] = b + c << 8                        |
/// | 0x12   | s_load_dword     | s[a .. a+b] = mem[s[c]:s[c+1]]           |
/// | 0x13   | s_lshl           | s[a] = s[b] << c                         |
/// | 0x14   | s_add_u32        | s[a] = s[b] + s[c]                       |
/// | 0x20   | v_add            | v[a] = v[b] + (c as i8)                  |
/// | 0x21   | v_lshl           | v[a] = v[b] << c                         |
/// | 0x22   | v_add_s          | v[a] = v[b] + s[c]                       |
/// | 0x23   | v_add_u32        | v[a] = v[b] + v[c]                       |
/// | 0x30   | flat_load_dword  | v[a] = mem[s[c]:s[c+1] + v[b]]           |
/// | 0x31   | flat_store_dword | mem[s[c]:s[c+1] + v[b]] = v[a]           |
/// | 0x40   | ds_write         | lds[v[b]] = v[a]                         |
/// | 0x41   | ds_read          | v[a] = lds[v[b]]                         |
/// | 0x50   | s_branch         | pc += 4 * off                            |
/// | 0x51   | s_cbranch_nz     | if s[a] != 0 { pc += 4 * off }           |
use super::{
    Alu, DecodeError, Decoder, ExeUnit, ExecContext, InstKind, Instruction, LaneAccess,
    RegFileKind, RegRange, ScalarLoadOperand,
};
use crate::kernel::WAVEFRONT_SIZE;

const WORD: usize = 4;
const MAX_SLOAD_DWORDS: u8 = 16;

fn inst(
    name: &'static str,
    kind: InstKind,
    exe_unit: ExeUnit,
    dst: Option<RegRange>,
    operands: [u8; 3],
) -> Instruction {
    Instruction {
        name,
        kind,
        exe_unit,
        byte_size: WORD as u32,
        dst,
        operands,
    }
}

fn sdst(first: u8, count: u32) -> Option<RegRange> {
    Some(RegRange {
        file: RegFileKind::Scalar,
        first: first as u32,
        count,
    })
}

fn vdst(first: u8) -> Option<RegRange> {
    Some(RegRange {
        file: RegFileKind::Vector,
        first: first as u32,
        count: 1,
    })
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MicroDecoder;

impl Decoder for MicroDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Instruction, DecodeError> {
        if bytes.len() < WORD {
            return Err(DecodeError::Incomplete {
                needed: WORD,
                available: bytes.len(),
            });
        }
        let [op, a, b, c] = [bytes[0], bytes[1], bytes[2], bytes[3]];
        let ops = [a, b, c];
        use ExeUnit::*;
        let decoded = match op {
            0x00 => Instruction::end_pgm(),
            0x01 => inst("s_barrier", InstKind::Barrier, Special, None, ops),
            0x02 => inst(
                "s_waitcnt",
                InstKind::WaitCnt {
                    vmcnt: a as u32,
                    lgkmcnt: b as u32,
                },
                Special,
                None,
                ops,
            ),
            0x03 => inst("s_nop", InstKind::Nop, Special, None, ops),
            0x10 => inst("s_add", InstKind::ScalarAlu, Scalar, sdst(a, 1), ops),
            0x11 => inst("s_mov", InstKind::ScalarAlu, Scalar, sdst(a, 1), ops),
            0x12 => {
                if b == 0 || b > MAX_SLOAD_DWORDS {
                    return Err(DecodeError::InvalidOperand {
                        name: "s_load_dword",
                        detail: format!("{b} dwords"),
                    });
                }
                inst("s_load_dword", InstKind::ScalarLoad, Scalar, sdst(a, b as u32), ops)
            }
            0x13 => inst("s_lshl", InstKind::ScalarAlu, Scalar, sdst(a, 1), ops),
            0x14 => inst("s_add_u32", InstKind::ScalarAlu, Scalar, sdst(a, 1), ops),
            0x20 => inst("v_add", InstKind::VectorAlu, Valu, vdst(a), ops),
            0x21 => inst("v_lshl", InstKind::VectorAlu, Valu, vdst(a), ops),
            0x22 => inst("v_add_s", InstKind::VectorAlu, Valu, vdst(a), ops),
            0x23 => inst("v_add_u32", InstKind::VectorAlu, Valu, vdst(a), ops),
            0x30 => inst("flat_load_dword", InstKind::VectorLoad, VMem, vdst(a), ops),
            0x31 => inst("flat_store_dword", InstKind::VectorStore, VMem, None, ops),
            0x40 => inst("ds_write", InstKind::Lds, Lds, None, ops),
            0x41 => inst("ds_read", InstKind::Lds, Lds, vdst(a), ops),
            0x50 => inst("s_branch", InstKind::Branch, Branch, None, ops),
            0x51 => inst("s_cbranch_nz", InstKind::Branch, Branch, None, ops),
            other => return Err(DecodeError::UnknownOpcode(other)),
        };
        Ok(decoded)
    }
}

/// Executes the micro ISA.
#[derive(Debug, Default, Clone, Copy)]
pub struct MicroAlu;

fn sreg64(ctx: &ExecContext<'_>, reg: u8) -> u64 {
    let off = ctx.wf.sreg_offset();
    let lo = ctx.sregs.read_u32(off, reg as u32, 0) as u64;
    let hi = ctx.sregs.read_u32(off, reg as u32 + 1, 0) as u64;
    hi << 32 | lo
}

fn branch_offset(inst: &Instruction) -> i64 {
    i16::from_le_bytes([inst.operands[1], inst.operands[2]]) as i64
}

fn active_lanes(exec: u64) -> impl Iterator<Item = usize> {
    (0..WAVEFRONT_SIZE as usize).filter(move |lane| exec & (1 << lane) != 0)
}

impl MicroAlu {
    fn run_scalar(&self, inst: &Instruction, ctx: &mut ExecContext<'_>) {
        let [a, b, c] = inst.operands;
        let off = ctx.wf.sreg_offset();
        let value = match inst.name {
            "s_add" => ctx
                .sregs
                .read_u32(off, b as u32, 0)
                .wrapping_add(c as i8 as i32 as u32),
            "s_mov" => u16::from_le_bytes([b, c]) as u32,
            "s_lshl" => ctx.sregs.read_u32(off, b as u32, 0).wrapping_shl(c as u32),
            "s_add_u32" => ctx
                .sregs
                .read_u32(off, b as u32, 0)
                .wrapping_add(ctx.sregs.read_u32(off, c as u32, 0)),
            other => panic!("{other} is not a scalar ALU instruction"),
        };
        ctx.sregs.write_u32(off, a as u32, 0, value);
    }

    fn run_vector(&self, inst: &Instruction, ctx: &mut ExecContext<'_>) {
        let [a, b, c] = inst.operands;
        let soff = ctx.wf.sreg_offset();
        let voff = ctx.wf.vreg_offset();
        let scalar = ctx.sregs.read_u32(soff, c as u32, 0);
        for lane in active_lanes(ctx.wf.exec) {
            let src = ctx.vregs.read_u32(voff, b as u32, lane);
            let value = match inst.name {
                "v_add" => src.wrapping_add(c as i8 as i32 as u32),
                "v_lshl" => src.wrapping_shl(c as u32),
                "v_add_s" => src.wrapping_add(scalar),
                "v_add_u32" => src.wrapping_add(ctx.vregs.read_u32(voff, c as u32, lane)),
                other => panic!("{other} is not a vector ALU instruction"),
            };
            ctx.vregs.write_u32(voff, a as u32, lane, value);
        }
    }

    fn run_branch(&self, inst: &Instruction, ctx: &mut ExecContext<'_>) {
        let taken = match inst.name {
            "s_branch" => true,
            _ => {
                let cond = inst.operands[0] as u32;
                ctx.sregs.read_u32(ctx.wf.sreg_offset(), cond, 0) != 0
            }
        };
        if taken {
            let delta = branch_offset(inst) * WORD as i64;
            ctx.wf.pc = ctx.wf.pc.wrapping_add_signed(delta);
        }
    }

    fn run_lds(&self, inst: &Instruction, ctx: &mut ExecContext<'_>) {
        let [a, b, _] = inst.operands;
        let voff = ctx.wf.vreg_offset();
        let base = ctx.wf.lds_offset() as usize;
        for lane in active_lanes(ctx.wf.exec) {
            let addr = ctx.vregs.read_u32(voff, b as u32, lane) as usize;
            let Some(range) = ctx.lds.get(addr..addr + WORD).map(|_| addr..addr + WORD) else {
                log::warn!(
                    "{} lane {lane}: LDS address {addr:#x} (window base {base:#x}) out of range",
                    inst.name
                );
                continue;
            };
            if inst.name == "ds_write" {
                let data = ctx.vregs.read(voff, a as u32, lane, WORD);
                ctx.lds[range].copy_from_slice(&data);
            } else {
                let data = ctx.lds[range].to_vec();
                ctx.vregs.write(voff, a as u32, lane, &data);
            }
        }
    }
}

impl Alu for MicroAlu {
    fn execute(&self, inst: &Instruction, ctx: &mut ExecContext<'_>) {
        match inst.kind {
            InstKind::ScalarAlu => self.run_scalar(inst, ctx),
            InstKind::VectorAlu => self.run_vector(inst, ctx),
            InstKind::Branch => self.run_branch(inst, ctx),
            InstKind::Lds => self.run_lds(inst, ctx),
            _ => {}
        }
    }

    fn scalar_load_operand(&self, inst: &Instruction, ctx: &ExecContext<'_>) -> ScalarLoadOperand {
        let [a, b, c] = inst.operands;
        ScalarLoadOperand {
            address: sreg64(ctx, c),
            dst_reg: a as u32,
            dwords: b as u32,
        }
    }

    fn vector_mem_operands(&self, inst: &Instruction, ctx: &ExecContext<'_>) -> Vec<LaneAccess> {
        let [a, b, c] = inst.operands;
        let base = sreg64(ctx, c);
        let voff = ctx.wf.vreg_offset();
        let is_store = inst.kind == InstKind::VectorStore;
        active_lanes(ctx.wf.exec)
            .map(|lane| LaneAccess {
                lane,
                address: base + ctx.vregs.read_u32(voff, b as u32, lane) as u64,
                reg: a as u32,
                reg_count: 1,
                data: if is_store {
                    ctx.vregs.read(voff, a as u32, lane, WORD)
                } else {
                    Vec::new()
                },
            })
            .collect()
    }
}

/// Builds micro ISA programs.
#[derive(Debug, Default, Clone)]
pub struct Asm {
    words: Vec<[u8; 4]>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, word: [u8; 4]) -> Self {
        self.words.push(word);
        self
    }

    /// Number of instructions emitted so far.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn build(self) -> Vec<u8> {
        self.words.concat()
    }

    pub fn s_endpgm(self) -> Self {
        self.push([0x00, 0, 0, 0])
    }

    pub fn s_barrier(self) -> Self {
        self.push([0x01, 0, 0, 0])
    }

    pub fn s_waitcnt(self, vmcnt: u8, lgkmcnt: u8) -> Self {
        self.push([0x02, vmcnt, lgkmcnt, 0])
    }

    pub fn s_nop(self) -> Self {
        self.push([0x03, 0, 0, 0])
    }

    pub fn s_add(self, dst: u8, src: u8, imm: i8) -> Self {
        self.push([0x10, dst, src, imm as u8])
    }

    pub fn s_mov(self, dst: u8, imm: u16) -> Self {
        let [lo, hi] = imm.to_le_bytes();
        self.push([0x11, dst, lo, hi])
    }

    pub fn s_load(self, dst: u8, dwords: u8, addr_pair: u8) -> Self {
        self.push([0x12, dst, dwords, addr_pair])
    }

    pub fn s_lshl(self, dst: u8, src: u8, shift: u8) -> Self {
        self.push([0x13, dst, src, shift])
    }

    pub fn s_add_u32(self, dst: u8, src0: u8, src1: u8) -> Self {
        self.push([0x14, dst, src0, src1])
    }

    pub fn v_add(self, dst: u8, src: u8, imm: i8) -> Self {
        self.push([0x20, dst, src, imm as u8])
    }

    pub fn v_lshl(self, dst: u8, src: u8, shift: u8) -> Self {
        self.push([0x21, dst, src, shift])
    }

    pub fn v_add_s(self, dst: u8, src: u8, sreg: u8) -> Self {
        self.push([0x22, dst, src, sreg])
    }

    pub fn v_add_u32(self, dst: u8, src0: u8, src1: u8) -> Self {
        self.push([0x23, dst, src0, src1])
    }

    pub fn flat_load(self, dst: u8, offset_vreg: u8, base_pair: u8) -> Self {
        self.push([0x30, dst, offset_vreg, base_pair])
    }

    pub fn flat_store(self, data: u8, offset_vreg: u8, base_pair: u8) -> Self {
        self.push([0x31, data, offset_vreg, base_pair])
    }

    pub fn ds_write(self, data: u8, addr_vreg: u8) -> Self {
        self.push([0x40, data, addr_vreg, 0])
    }

    pub fn ds_read(self, dst: u8, addr_vreg: u8) -> Self {
        self.push([0x41, dst, addr_vreg, 0])
    }

    pub fn s_branch(self, offset: i16) -> Self {
        let [lo, hi] = offset.to_le_bytes();
        self.push([0x50, 0, lo, hi])
    }

    pub fn s_cbranch_nz(self, cond: u8, offset: i16) -> Self {
        let [lo, hi] = offset.to_le_bytes();
        self.push([0x51, cond, lo, hi])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_exe_unit_classes() {
        let code = Asm::new()
            .s_add(0, 0, 1)
            .v_add(1, 1, 1)
            .flat_load(2, 1, 0)
            .ds_write(1, 1)
            .s_branch(-2)
            .s_waitcnt(0, 0)
            .build();
        let d = MicroDecoder;
        let units: Vec<ExeUnit> = code
            .chunks(4)
            .map(|w| d.decode(w).unwrap().exe_unit)
            .collect();
        assert_eq!(
            units,
            vec![
                ExeUnit::Scalar,
                ExeUnit::Valu,
                ExeUnit::VMem,
                ExeUnit::Lds,
                ExeUnit::Branch,
                ExeUnit::Special
            ]
        );
    }

    #[test]
    fn waitcnt_carries_limits() {
        let code = Asm::new().s_waitcnt(3, 1).build();
        let i = MicroDecoder.decode(&code).unwrap();
        assert_eq!(i.kind, InstKind::WaitCnt { vmcnt: 3, lgkmcnt: 1 });
    }

    #[test]
    fn short_window_is_incomplete() {
        assert_eq!(
            MicroDecoder.decode(&[0x10, 0]),
            Err(DecodeError::Incomplete {
                needed: 4,
                available: 2
            })
        );
    }

    #[test]
    fn unknown_opcode_is_reported() {
        assert_eq!(
            MicroDecoder.decode(&[0xff, 0, 0, 0]),
            Err(DecodeError::UnknownOpcode(0xff))
        );
    }

    #[test]
    fn scalar_load_width_is_validated() {
        let code = Asm::new().s_load(4, 0, 0).build();
        assert!(matches!(
            MicroDecoder.decode(&code),
            Err(DecodeError::InvalidOperand { .. })
        ));
        let code = Asm::new().s_load(4, 2, 0).build();
        let i = MicroDecoder.decode(&code).unwrap();
        assert_eq!(i.dst.unwrap().count, 2);
    }
}
