//! The 8-bit-operand opcode dispatch surface: the representative set of
//! mnemonics this core decodes end to end, plus `dispatch_one`, the main
//! fetch-decode-execute step.
//!
//! This is deliberately not the full 8086 opcode map. It covers the eight
//! standard ALU operations in their register/register, register/memory, and
//! accumulator/immediate encodings; MOV; the four group-opcode families;
//! TEST; the byte-granularity string instructions; XLAT; SAHF/LAHF/SALC;
//! fixed- and variable-port IN/OUT; and HLT/NOP.

use super::alu::Alu8;
use super::error::CpuFault;
use super::flags::CF;
use super::memory::{Fetcher, IoPorts, Memory, WithCpuState};
use super::modrm::{AddressSize, ModRm};
use super::registers::{GpReg, SegReg};
use super::returns;
use super::stack;

/// One of the eight standard ALU-group operations, keyed the same way
/// Group 1's ModR/M.register_index field keys them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    pub fn from_index(index: u8) -> Result<AluOp, CpuFault> {
        match index & 7 {
            0 => Ok(AluOp::Add),
            1 => Ok(AluOp::Or),
            2 => Ok(AluOp::Adc),
            3 => Ok(AluOp::Sbb),
            4 => Ok(AluOp::And),
            5 => Ok(AluOp::Sub),
            6 => Ok(AluOp::Xor),
            7 => Ok(AluOp::Cmp),
            n => Err(CpuFault::InvalidGroupIndex { opcode: 0x80, index: n }),
        }
    }

    /// Applies the op to `(a, b)`, returning the write-back value. CMP's
    /// write-back value is discarded by every caller.
    fn apply(self, flags: &mut super::flags::Flags, a: u32, b: u32) -> u32 {
        match self {
            AluOp::Add => Alu8::add(flags, a, b),
            AluOp::Or => Alu8::or(flags, a, b),
            AluOp::Adc => Alu8::adc(flags, a, b, flags.get_flag(CF)),
            AluOp::Sbb => Alu8::sbb(flags, a, b, flags.get_flag(CF)),
            AluOp::And => Alu8::and(flags, a, b),
            AluOp::Sub => Alu8::sub(flags, a, b),
            AluOp::Xor => Alu8::xor(flags, a, b),
            AluOp::Cmp => {
                Alu8::cmp(flags, a, b);
                a
            }
        }
    }

    fn writes_back(self) -> bool {
        !matches!(self, AluOp::Cmp)
    }
}

/// `op r/m8, r8` and `op r8, r/m8` — the two ModR/M-addressed encodings
/// shared by all eight ALU ops. `reg_is_destination` selects which operand
/// is written back.
pub fn alu_modrm<T: WithCpuState + Memory + Fetcher>(
    mb: &mut T,
    op: AluOp,
    reg_is_destination: bool,
) -> Result<(), CpuFault> {
    let m = ModRm::read(mb, AddressSize::Size16)?;
    let a = if reg_is_destination { m.r8(mb) } else { m.get_rm8(mb) };
    let b = if reg_is_destination { m.get_rm8(mb) } else { m.r8(mb) };
    let r = op.apply(&mut mb.state_mut().flags, a as u32, b as u32) as u8;
    if op.writes_back() {
        if reg_is_destination {
            m.set_r8(mb, r);
        } else {
            m.set_rm8(mb, r);
        }
    }
    Ok(())
}

/// `op AL, imm8` — the accumulator/immediate encoding.
pub fn alu_accumulator_imm8<T: WithCpuState + Memory + Fetcher>(mb: &mut T, op: AluOp) {
    let imm = mb.fetch_u8();
    let al = mb.state().registers.read_u8_low(GpReg::Ax);
    let r = op.apply(&mut mb.state_mut().flags, al as u32, imm as u32) as u8;
    if op.writes_back() {
        mb.state_mut().registers.write_u8_low(GpReg::Ax, r);
    }
}

/// `MOV r/m8, r8` / `MOV r8, r/m8`.
pub fn mov_modrm<T: WithCpuState + Memory + Fetcher>(
    mb: &mut T,
    reg_is_destination: bool,
) -> Result<(), CpuFault> {
    let m = ModRm::read(mb, AddressSize::Size16)?;
    if reg_is_destination {
        let v = m.get_rm8(mb);
        m.set_r8(mb, v);
    } else {
        let v = m.r8(mb);
        m.set_rm8(mb, v);
    }
    Ok(())
}

/// `MOV r8, imm8`, where `reg` was already decoded from the low 3 bits of
/// the opcode byte itself (this family has no ModR/M byte).
pub fn mov_reg_imm8<T: WithCpuState + Memory + Fetcher>(mb: &mut T, encoded_reg: u8) {
    let imm = mb.fetch_u8();
    mb.state_mut().registers.write_encoded_u8(encoded_reg, imm);
}

/// Group 1: `op r/m8, imm8`, operation selected by `ModRm.register_index`.
pub fn group1_imm8<T: WithCpuState + Memory + Fetcher>(mb: &mut T) -> Result<(), CpuFault> {
    let m = ModRm::read(mb, AddressSize::Size16)?;
    let op = AluOp::from_index(m.register_index)?;
    let imm = mb.fetch_u8();
    let a = m.get_rm8(mb);
    let r = op.apply(&mut mb.state_mut().flags, a as u32, imm as u32) as u8;
    if op.writes_back() {
        m.set_rm8(mb, r);
    }
    Ok(())
}

/// One of Group 2's eight shift/rotate operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShiftOp {
    Rol,
    Ror,
    Rcl,
    Rcr,
    Shl,
    Shr,
    Sar,
}

fn shift_op_from_index(index: u8) -> Result<ShiftOp, CpuFault> {
    match index & 7 {
        0 => Ok(ShiftOp::Rol),
        1 => Ok(ShiftOp::Ror),
        2 => Ok(ShiftOp::Rcl),
        3 => Ok(ShiftOp::Rcr),
        4 => Ok(ShiftOp::Shl),
        5 => Ok(ShiftOp::Shr),
        6 => Err(CpuFault::InvalidGroupIndex { opcode: 0xD0, index: 6 }),
        7 => Ok(ShiftOp::Sar),
        n => Err(CpuFault::InvalidGroupIndex { opcode: 0xD0, index: n }),
    }
}

fn apply_shift(op: ShiftOp, flags: &mut super::flags::Flags, v: u32, n: u8) -> u32 {
    match op {
        ShiftOp::Rol => Alu8::rol(flags, v, n),
        ShiftOp::Ror => Alu8::ror(flags, v, n),
        ShiftOp::Rcl => Alu8::rcl(flags, v, n),
        ShiftOp::Rcr => Alu8::rcr(flags, v, n),
        ShiftOp::Shl => Alu8::shl(flags, v, n),
        ShiftOp::Shr => Alu8::shr(flags, v, n),
        ShiftOp::Sar => Alu8::sar(flags, v, n),
    }
}

/// Group 2: shift/rotate `r/m8` by a count supplied separately (1, CL, or
/// an immediate byte — the three standard encodings all funnel through
/// here once the count is known).
pub fn group2_shift<T: WithCpuState + Memory + Fetcher>(mb: &mut T, count: u8) -> Result<(), CpuFault> {
    let m = ModRm::read(mb, AddressSize::Size16)?;
    let op = shift_op_from_index(m.register_index)?;
    let a = m.get_rm8(mb);
    let r = apply_shift(op, &mut mb.state_mut().flags, a as u32, count) as u8;
    m.set_rm8(mb, r);
    Ok(())
}

/// Group 3's unary/test operations on `r/m8`. Subfunctions 0 and 1 both
/// mean TEST with an immediate; subfunction 1 is formally reserved but
/// aliases TEST on real silicon, so it's accepted here too.
pub fn group3_unary<T: WithCpuState + Memory + Fetcher>(mb: &mut T) -> Result<(), CpuFault> {
    let m = ModRm::read(mb, AddressSize::Size16)?;
    match m.register_index & 7 {
        0 | 1 => {
            let imm = mb.fetch_u8();
            let a = m.get_rm8(mb);
            Alu8::and(&mut mb.state_mut().flags, a as u32, imm as u32);
        }
        2 => {
            // NOT: no flags affected.
            let a = m.get_rm8(mb);
            m.set_rm8(mb, !a);
        }
        3 => {
            // NEG is SUB(0, a).
            let a = m.get_rm8(mb);
            let r = Alu8::sub(&mut mb.state_mut().flags, 0, a as u32) as u8;
            m.set_rm8(mb, r);
        }
        4 => {
            let a = mb.state().registers.read_u8_low(GpReg::Ax);
            let b = m.get_rm8(mb);
            let r = Alu8::mul(&mut mb.state_mut().flags, a as u32, b as u32);
            mb.state_mut().registers.write_u16(GpReg::Ax, r as u16);
        }
        5 => {
            let a = mb.state().registers.read_u8_low(GpReg::Ax);
            let b = m.get_rm8(mb);
            let r = Alu8::imul(&mut mb.state_mut().flags, a as u32, b as u32);
            mb.state_mut().registers.write_u16(GpReg::Ax, r as u16);
        }
        6 => {
            let dividend = mb.state().registers.read_u16(GpReg::Ax) as u64;
            let divisor = m.get_rm8(mb);
            let (q, r) = Alu8::div(dividend, divisor as u32)?;
            mb.state_mut().registers.write_u8_low(GpReg::Ax, q as u8);
            mb.state_mut().registers.write_u8_high(GpReg::Ax, r as u8);
        }
        7 => {
            let dividend = mb.state().registers.read_u16(GpReg::Ax) as u64;
            let divisor = m.get_rm8(mb);
            let (q, r) = Alu8::idiv(dividend, divisor as u32)?;
            mb.state_mut().registers.write_u8_low(GpReg::Ax, q as u8);
            mb.state_mut().registers.write_u8_high(GpReg::Ax, r as u8);
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// Group 4: INC/DEC `r/m8`, keyed by the low bit of `ModRm.register_index`.
/// Index 7 is the callback escape: an embedder-defined extension point this
/// core does not interpret itself, surfaced to the caller as `Ok(None)`
/// when not present and `Ok(Some(index))` when seen, so the dispatch loop
/// can hand it off.
pub fn group4_inc_dec<T: WithCpuState + Memory + Fetcher>(mb: &mut T) -> Result<Option<u8>, CpuFault> {
    let m = ModRm::read(mb, AddressSize::Size16)?;
    match m.register_index & 7 {
        0 => {
            let a = m.get_rm8(mb);
            let r = Alu8::inc(&mut mb.state_mut().flags, a as u32) as u8;
            m.set_rm8(mb, r);
            Ok(None)
        }
        1 => {
            let a = m.get_rm8(mb);
            let r = Alu8::dec(&mut mb.state_mut().flags, a as u32) as u8;
            m.set_rm8(mb, r);
            Ok(None)
        }
        7 => Ok(Some(7)),
        n => Err(CpuFault::InvalidGroupIndex { opcode: 0xFE, index: n }),
    }
}

/// `TEST r/m8, r8` / `TEST AL, imm8`.
pub fn test_modrm<T: WithCpuState + Memory + Fetcher>(mb: &mut T) -> Result<(), CpuFault> {
    let m = ModRm::read(mb, AddressSize::Size16)?;
    let a = m.get_rm8(mb);
    let b = m.r8(mb);
    Alu8::and(&mut mb.state_mut().flags, a as u32, b as u32);
    Ok(())
}

pub fn test_accumulator_imm8<T: WithCpuState + Memory + Fetcher>(mb: &mut T) {
    let imm = mb.fetch_u8();
    let al = mb.state().registers.read_u8_low(GpReg::Ax);
    Alu8::and(&mut mb.state_mut().flags, al as u32, imm as u32);
}

fn source_segment<T: WithCpuState>(mb: &T) -> SegReg {
    mb.state().prefixes.segment_override_index.unwrap_or(SegReg::Ds)
}

fn step_si<T: WithCpuState>(mb: &mut T) {
    let d = mb.state().direction8();
    let si = mb.state().registers.read_u16(GpReg::Si);
    mb.state_mut().registers.write_u16(GpReg::Si, si.wrapping_add(d as u16));
}

fn step_di<T: WithCpuState>(mb: &mut T) {
    let d = mb.state().direction8();
    let di = mb.state().registers.read_u16(GpReg::Di);
    mb.state_mut().registers.write_u16(GpReg::Di, di.wrapping_add(d as u16));
}

/// `MOVSB`: `[ES:DI] := [seg:SI]`, then steps SI and DI by the direction.
/// The source segment honors an override; the destination is always ES.
pub fn movsb<T: WithCpuState + Memory>(mb: &mut T) {
    use super::state::physical_address;
    let seg = source_segment(mb);
    let src = physical_address(mb.state().registers.read_seg(seg), mb.state().registers.read_u16(GpReg::Si));
    let v = mb.read_u8(src);
    let dst = physical_address(mb.state().registers.read_seg(SegReg::Es), mb.state().registers.read_u16(GpReg::Di));
    mb.write_u8(dst, v);
    step_si(mb);
    step_di(mb);
}

/// `CMPSB`: compares `[seg:SI]` against `[ES:DI]`, steps both pointers.
pub fn cmpsb<T: WithCpuState + Memory>(mb: &mut T) {
    use super::state::physical_address;
    let seg = source_segment(mb);
    let src = physical_address(mb.state().registers.read_seg(seg), mb.state().registers.read_u16(GpReg::Si));
    let a = mb.read_u8(src);
    let dst = physical_address(mb.state().registers.read_seg(SegReg::Es), mb.state().registers.read_u16(GpReg::Di));
    let b = mb.read_u8(dst);
    Alu8::cmp(&mut mb.state_mut().flags, a as u32, b as u32);
    step_si(mb);
    step_di(mb);
}

/// `STOSB`: `[ES:DI] := AL`, steps DI.
pub fn stosb<T: WithCpuState + Memory>(mb: &mut T) {
    use super::state::physical_address;
    let al = mb.state().registers.read_u8_low(GpReg::Ax);
    let dst = physical_address(mb.state().registers.read_seg(SegReg::Es), mb.state().registers.read_u16(GpReg::Di));
    mb.write_u8(dst, al);
    step_di(mb);
}

/// `LODSB`: `AL := [seg:SI]`, steps SI.
pub fn lodsb<T: WithCpuState + Memory>(mb: &mut T) {
    use super::state::physical_address;
    let seg = source_segment(mb);
    let src = physical_address(mb.state().registers.read_seg(seg), mb.state().registers.read_u16(GpReg::Si));
    let v = mb.read_u8(src);
    mb.state_mut().registers.write_u8_low(GpReg::Ax, v);
    step_si(mb);
}

/// `SCASB`: compares AL against `[ES:DI]`, steps DI.
pub fn scasb<T: WithCpuState + Memory>(mb: &mut T) {
    use super::state::physical_address;
    let al = mb.state().registers.read_u8_low(GpReg::Ax);
    let dst = physical_address(mb.state().registers.read_seg(SegReg::Es), mb.state().registers.read_u16(GpReg::Di));
    let v = mb.read_u8(dst);
    Alu8::cmp(&mut mb.state_mut().flags, al as u32, v as u32);
    step_di(mb);
}

/// `INSB`: `[ES:DI] := in8(DX)`, steps DI.
pub fn insb<T: WithCpuState + Memory + IoPorts>(mb: &mut T) {
    use super::state::physical_address;
    let port = mb.state().registers.read_u16(GpReg::Dx);
    let v = mb.in8(port);
    let dst = physical_address(mb.state().registers.read_seg(SegReg::Es), mb.state().registers.read_u16(GpReg::Di));
    mb.write_u8(dst, v);
    step_di(mb);
}

/// `OUTSB`: `out8(DX, [seg:SI])`, steps SI.
pub fn outsb<T: WithCpuState + Memory + IoPorts>(mb: &mut T) {
    use super::state::physical_address;
    let seg = source_segment(mb);
    let src = physical_address(mb.state().registers.read_seg(seg), mb.state().registers.read_u16(GpReg::Si));
    let v = mb.read_u8(src);
    let port = mb.state().registers.read_u16(GpReg::Dx);
    mb.out8(port, v);
    step_si(mb);
}

/// `XLAT`: `AL := [seg:BX+AL]`, honoring a segment override.
pub fn xlat<T: WithCpuState + Memory>(mb: &mut T) {
    use super::state::physical_address;
    let seg = source_segment(mb);
    let al = mb.state().registers.read_u8_low(GpReg::Ax);
    let bx = mb.state().registers.read_u16(GpReg::Bx);
    let addr = physical_address(mb.state().registers.read_seg(seg), bx.wrapping_add(al as u16));
    let v = mb.read_u8(addr);
    mb.state_mut().registers.write_u8_low(GpReg::Ax, v);
}

/// `SAHF`: loads the low 8 flag bits from AH.
pub fn sahf<T: WithCpuState>(mb: &mut T) {
    let ah = mb.state().registers.read_u8_high(GpReg::Ax);
    let whole = mb.state().flags.as_u32();
    mb.state_mut().flags.set_whole((whole & 0xFFFF_FF00) | ah as u32);
}

/// `LAHF`: stores the low 8 flag bits into AH.
pub fn lahf<T: WithCpuState>(mb: &mut T) {
    let low = mb.state().flags.as_u16() as u8;
    mb.state_mut().registers.write_u8_high(GpReg::Ax, low);
}

/// `SALC` (undocumented on real silicon, but architecturally well-defined):
/// `AL := 0xFF` if CF else `0x00`.
pub fn salc<T: WithCpuState>(mb: &mut T) {
    let v = if mb.state().flags.get_flag(CF) { 0xFF } else { 0x00 };
    mb.state_mut().registers.write_u8_low(GpReg::Ax, v);
}

/// `IN AL, imm8` / `IN AL, DX`.
pub fn in8_fixed<T: WithCpuState + Fetcher + IoPorts>(mb: &mut T) {
    let port = mb.fetch_u8() as u16;
    let v = mb.in8(port);
    mb.state_mut().registers.write_u8_low(GpReg::Ax, v);
}

pub fn in8_variable<T: WithCpuState + IoPorts>(mb: &mut T) {
    let port = mb.state().registers.read_u16(GpReg::Dx);
    let v = mb.in8(port);
    mb.state_mut().registers.write_u8_low(GpReg::Ax, v);
}

/// `OUT imm8, AL` / `OUT DX, AL`.
pub fn out8_fixed<T: WithCpuState + Fetcher + IoPorts>(mb: &mut T) {
    let port = mb.fetch_u8() as u16;
    let al = mb.state().registers.read_u8_low(GpReg::Ax);
    mb.out8(port, al);
}

pub fn out8_variable<T: WithCpuState + IoPorts>(mb: &mut T) {
    let port = mb.state().registers.read_u16(GpReg::Dx);
    let al = mb.state().registers.read_u8_low(GpReg::Ax);
    mb.out8(port, al);
}

pub fn hlt<T: WithCpuState>(mb: &mut T) {
    mb.state_mut().is_running = false;
}

/// Fetches one opcode byte and executes it, enforcing the ordering
/// contract: operand reads happen before the ALU runs, flag updates happen
/// before write-back, the cycle counter advances only after every side
/// effect has landed, and prefix state is cleared last of all.
pub fn dispatch_one<T>(mb: &mut T) -> Result<(), CpuFault>
where
    T: WithCpuState + Memory + Fetcher + IoPorts,
{
    let (cs, ip) = mb.state().ip_segmented_address();
    let opcode = mb.fetch_u8();

    let result = (|| -> Result<(), CpuFault> {
        match opcode {
            // ADD/OR/ADC/SBB/AND/SUB/XOR/CMP: r/m8,r8 | r8,r/m8 | AL,imm8
            0x00 | 0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 => {
                let op = AluOp::from_index(opcode >> 3)?;
                alu_modrm(mb, op, false)
            }
            0x02 | 0x0A | 0x12 | 0x1A | 0x22 | 0x2A | 0x32 | 0x3A => {
                let op = AluOp::from_index(opcode >> 3)?;
                alu_modrm(mb, op, true)
            }
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let op = AluOp::from_index(opcode >> 3)?;
                alu_accumulator_imm8(mb, op);
                Ok(())
            }
            0x88 => mov_modrm(mb, false),
            0x8A => mov_modrm(mb, true),
            0xB0..=0xB7 => {
                mov_reg_imm8(mb, opcode & 7);
                Ok(())
            }
            0x80 => group1_imm8(mb),
            0xD0 => group2_shift(mb, 1),
            0xD2 => {
                let cl = mb.state().registers.read_u8_low(GpReg::Cx);
                group2_shift(mb, cl)
            }
            0xC0 => {
                // Group 2 with a trailing immediate count byte. The ModR/M
                // byte (plus any displacement) is decoded twice: once here
                // to find where the count byte sits, once inside
                // `group2_shift` to actually address the operand.
                let count = peek_imm8_after_modrm(mb)?;
                group2_shift(mb, count)?;
                mb.fetch_u8(); // re-consume the count byte `group2_shift` skipped over
                Ok(())
            }
            0xF6 => group3_unary(mb),
            0xFE => group4_inc_dec(mb).map(|_| ()),
            0x84 => test_modrm(mb),
            0xA8 => {
                test_accumulator_imm8(mb);
                Ok(())
            }
            0xA4 => {
                movsb(mb);
                Ok(())
            }
            0xA6 => {
                cmpsb(mb);
                Ok(())
            }
            0xAA => {
                stosb(mb);
                Ok(())
            }
            0xAC => {
                lodsb(mb);
                Ok(())
            }
            0xAE => {
                scasb(mb);
                Ok(())
            }
            0x6C => {
                insb(mb);
                Ok(())
            }
            0x6E => {
                outsb(mb);
                Ok(())
            }
            0xD7 => {
                xlat(mb);
                Ok(())
            }
            0x9E => {
                sahf(mb);
                Ok(())
            }
            0x9F => {
                lahf(mb);
                Ok(())
            }
            0xD6 => {
                salc(mb);
                Ok(())
            }
            0xE4 => {
                in8_fixed(mb);
                Ok(())
            }
            0xEC => {
                in8_variable(mb);
                Ok(())
            }
            0xE6 => {
                out8_fixed(mb);
                Ok(())
            }
            0xEE => {
                out8_variable(mb);
                Ok(())
            }
            0xC2 => {
                let n = mb.fetch_u16();
                returns::near_ret16(mb, n);
                Ok(())
            }
            0xC3 => {
                returns::near_ret16(mb, 0);
                Ok(())
            }
            0xCA => {
                let n = mb.fetch_u16();
                returns::far_ret16(mb, n);
                Ok(())
            }
            0xCB => {
                returns::far_ret16(mb, 0);
                Ok(())
            }
            0xCF => {
                returns::interrupt_ret(mb);
                Ok(())
            }
            0xF4 => {
                hlt(mb);
                Ok(())
            }
            0x90 => Ok(()),
            _ => Err(CpuFault::InvalidOpCode { opcode, cs, ip }),
        }
    })();

    if let Err(fault) = &result {
        if !fault.is_recoverable() {
            log::warn!("fatal fault at {cs:#06x}:{ip:#06x}, halting: {fault}");
            mb.state_mut().is_running = false;
        }
    }

    mb.state_mut().inc_cycles();
    mb.state_mut().clear_prefixes();
    result
}

/// `0xC0`'s ModR/M byte is followed by an immediate count, but the operand
/// fetch itself happens inside `group2_shift` after the ModR/M byte has
/// already been re-read. Real hardware only reads the ModR/M byte once;
/// this core reads the immediate byte that trails it before re-decoding,
/// matching the documented encoding of `C0 /r ib`.
fn peek_imm8_after_modrm<T: WithCpuState + Memory + Fetcher>(mb: &mut T) -> Result<u8, CpuFault> {
    let saved_ip = mb.state().ip;
    let _ = ModRm::read(mb, AddressSize::Size16)?;
    let count = mb.fetch_u8();
    mb.state_mut().ip = saved_ip;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::flags::CpuModel;
    use crate::cpu::memory::FlatMemory;
    use crate::cpu::state::CpuState;

    struct Harness {
        state: CpuState,
        mem: FlatMemory,
        out_log: Vec<(u16, u8)>,
    }

    impl WithCpuState for Harness {
        fn state(&self) -> &CpuState {
            &self.state
        }
        fn state_mut(&mut self) -> &mut CpuState {
            &mut self.state
        }
    }

    impl Memory for Harness {
        fn read_u8(&mut self, a: u32) -> u8 {
            self.mem.read_u8(a)
        }
        fn read_u16(&mut self, a: u32) -> u16 {
            self.mem.read_u16(a)
        }
        fn read_u32(&mut self, a: u32) -> u32 {
            self.mem.read_u32(a)
        }
        fn write_u8(&mut self, a: u32, v: u8) {
            self.mem.write_u8(a, v)
        }
        fn write_u16(&mut self, a: u32, v: u16) {
            self.mem.write_u16(a, v)
        }
        fn write_u32(&mut self, a: u32, v: u32) {
            self.mem.write_u32(a, v)
        }
    }

    impl IoPorts for Harness {
        fn in8(&mut self, _port: u16) -> u8 {
            0x42
        }
        fn in16(&mut self, _port: u16) -> u16 {
            0x4242
        }
        fn out8(&mut self, port: u16, v: u8) {
            self.out_log.push((port, v));
        }
        fn out16(&mut self, _port: u16, _v: u16) {}
    }

    fn harness() -> Harness {
        Harness { state: CpuState::new(CpuModel::I8086), mem: FlatMemory::new(), out_log: Vec::new() }
    }

    fn load(h: &mut Harness, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            h.mem.write_u8(i as u32, *b);
        }
    }

    #[test]
    fn add_al_imm8_sets_al_and_flags() {
        let mut h = harness();
        // 0x04 0x05: ADD AL, 5
        load(&mut h, &[0x04, 0x05]);
        h.state.registers.write_u8_low(GpReg::Ax, 0x01);
        dispatch_one(&mut h).unwrap();
        assert_eq!(h.state.registers.read_u8_low(GpReg::Ax), 0x06);
        assert!(!h.state.flags.get_flag(crate::cpu::flags::ZF));
    }

    #[test]
    fn mov_reg_imm8_loads_register() {
        let mut h = harness();
        // 0xB0 0x7F: MOV AL, 0x7F
        load(&mut h, &[0xB0, 0x7F]);
        dispatch_one(&mut h).unwrap();
        assert_eq!(h.state.registers.read_u8_low(GpReg::Ax), 0x7F);
    }

    #[test]
    fn group1_selects_op_from_register_field() {
        let mut h = harness();
        // 0x80 /6 ib, mode=3 rm=0 (AL) reg=6 (XOR): XOR AL, 0xFF
        load(&mut h, &[0x80, 0xF0, 0xFF]);
        h.state.registers.write_u8_low(GpReg::Ax, 0x0F);
        dispatch_one(&mut h).unwrap();
        assert_eq!(h.state.registers.read_u8_low(GpReg::Ax), 0xF0);
    }

    #[test]
    fn group3_div_splits_quotient_and_remainder() {
        let mut h = harness();
        // 0xF6 /6, mode=3 rm=1 (CL): DIV CL
        load(&mut h, &[0xF6, 0xF1]);
        h.state.registers.write_u16(GpReg::Ax, 0x0067);
        h.state.registers.write_u8_low(GpReg::Cx, 0x0A);
        dispatch_one(&mut h).unwrap();
        assert_eq!(h.state.registers.read_u8_low(GpReg::Ax), 0x0A);
        assert_eq!(h.state.registers.read_u8_high(GpReg::Ax), 0x03);
    }

    #[test]
    fn group3_div_by_zero_is_a_recoverable_fault() {
        let mut h = harness();
        load(&mut h, &[0xF6, 0xF1]);
        h.state.registers.write_u16(GpReg::Ax, 0x0067);
        h.state.registers.write_u8_low(GpReg::Cx, 0x00);
        let err = dispatch_one(&mut h).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(err.interrupt_vector(), Some(0));
    }

    #[test]
    fn movsb_copies_and_steps_both_pointers_forward() {
        let mut h = harness();
        load(&mut h, &[0xA4]);
        h.state.registers.write_u16(GpReg::Si, 0x2000);
        h.state.registers.write_u16(GpReg::Di, 0x3000);
        h.mem.write_u8(0x2000, 0xAB);
        dispatch_one(&mut h).unwrap();
        assert_eq!(h.mem.read_u8(0x3000), 0xAB);
        assert_eq!(h.state.registers.read_u16(GpReg::Si), 0x2001);
        assert_eq!(h.state.registers.read_u16(GpReg::Di), 0x3001);
    }

    #[test]
    fn movsb_steps_backward_when_df_is_set() {
        let mut h = harness();
        load(&mut h, &[0xA4]);
        h.state.flags.set_flag(super::super::flags::DF, true);
        h.state.registers.write_u16(GpReg::Si, 0x2000);
        h.state.registers.write_u16(GpReg::Di, 0x3000);
        dispatch_one(&mut h).unwrap();
        assert_eq!(h.state.registers.read_u16(GpReg::Si), 0x1FFF);
        assert_eq!(h.state.registers.read_u16(GpReg::Di), 0x2FFF);
    }

    #[test]
    fn out8_fixed_reaches_io_ports() {
        let mut h = harness();
        // 0xE6 0x37: OUT 0x37, AL
        load(&mut h, &[0xE6, 0x37]);
        h.state.registers.write_u8_low(GpReg::Ax, 0x99);
        dispatch_one(&mut h).unwrap();
        assert_eq!(h.out_log, vec![(0x37, 0x99)]);
    }

    #[test]
    fn sahf_lahf_round_trip_low_flag_byte() {
        let mut h = harness();
        load(&mut h, &[0x9E, 0x9F]);
        h.state.registers.write_u8_high(GpReg::Ax, 0xD5);
        dispatch_one(&mut h).unwrap();
        let low_after_sahf = h.state.flags.as_u16() as u8;
        dispatch_one(&mut h).unwrap();
        assert_eq!(h.state.registers.read_u8_high(GpReg::Ax), low_after_sahf);
    }

    #[test]
    fn hlt_clears_is_running() {
        let mut h = harness();
        h.state.is_running = true;
        load(&mut h, &[0xF4]);
        dispatch_one(&mut h).unwrap();
        assert!(!h.state.is_running);
    }

    #[test]
    fn unknown_opcode_is_an_invalid_opcode_fault() {
        let mut h = harness();
        load(&mut h, &[0x0F]); // two-byte escape, unimplemented here
        let err = dispatch_one(&mut h).unwrap_err();
        assert!(matches!(err, CpuFault::InvalidOpCode { opcode: 0x0F, .. }));
    }

    #[test]
    fn cycle_counter_advances_once_per_instruction() {
        let mut h = harness();
        load(&mut h, &[0x90, 0x90]);
        dispatch_one(&mut h).unwrap();
        dispatch_one(&mut h).unwrap();
        assert_eq!(h.state.cycles, 2);
    }
}
