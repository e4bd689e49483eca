//! ModR/M and SIB byte decoding: the effective-address resolver shared by
//! every memory-referencing opcode in the dispatch surface.

use super::error::CpuFault;
use super::memory::{Fetcher, Memory, WithCpuState};
use super::registers::{GpReg, SegReg};
use super::state::physical_address;

/// Whether the instruction stream is using 16-bit or 32-bit addressing.
/// A real 8086 only ever has 16-bit addressing; 32-bit addressing is the
/// 80386 extension this core also models per the base spec.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum AddressSize {
    Size16,
    Size32,
}

const GP_ORDER: [GpReg; 8] = [
    GpReg::Ax,
    GpReg::Cx,
    GpReg::Dx,
    GpReg::Bx,
    GpReg::Sp,
    GpReg::Bp,
    GpReg::Si,
    GpReg::Di,
];

fn gp(index: u8) -> GpReg {
    GP_ORDER[(index & 7) as usize]
}

/// Decoded state after a `ModRm::read` call.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct ModRm {
    pub register_index: u8,
    pub rm_index: u8,
    pub memory_offset: Option<u16>,
    pub memory_address: Option<u32>,
}

impl ModRm {
    pub fn read<T>(mb: &mut T, address_size: AddressSize) -> Result<ModRm, CpuFault>
    where
        T: WithCpuState + Memory + Fetcher,
    {
        let m = mb.fetch_u8();
        let mode = m >> 6;
        let register_index = (m >> 3) & 7;
        let rm_index = m & 7;

        if mode == 3 {
            return Ok(ModRm { register_index, rm_index, memory_offset: None, memory_address: None });
        }

        let memory_offset = match address_size {
            AddressSize::Size16 => Self::offset16(mb, mode, rm_index)?,
            AddressSize::Size32 => Self::offset32(mb, mode, rm_index)?,
        };

        let segment_index = mb
            .state()
            .prefixes
            .segment_override_index
            .unwrap_or_else(|| default_segment(mode, rm_index));
        let segment = mb.state().registers.read_seg(segment_index);
        let memory_address = physical_address(segment, memory_offset);

        Ok(ModRm {
            register_index,
            rm_index,
            memory_offset: Some(memory_offset),
            memory_address: Some(memory_address),
        })
    }

    fn offset16<T>(mb: &mut T, mode: u8, rm_index: u8) -> Result<u16, CpuFault>
    where
        T: WithCpuState + Memory + Fetcher,
    {
        let regs = &mb.state().registers;
        let base_offset: u16 = match rm_index {
            0 => regs.read_u16(GpReg::Bx).wrapping_add(regs.read_u16(GpReg::Si)),
            1 => regs.read_u16(GpReg::Bx).wrapping_add(regs.read_u16(GpReg::Di)),
            2 => regs.read_u16(GpReg::Bp).wrapping_add(regs.read_u16(GpReg::Si)),
            3 => regs.read_u16(GpReg::Bp).wrapping_add(regs.read_u16(GpReg::Di)),
            4 => regs.read_u16(GpReg::Si),
            5 => regs.read_u16(GpReg::Di),
            6 => {
                if mode == 0 {
                    0 // filled in below by the direct fetch_u16
                } else {
                    regs.read_u16(GpReg::Bp)
                }
            }
            7 => regs.read_u16(GpReg::Bx),
            _ => return Err(CpuFault::InvalidMode { mode: rm_index }),
        };
        let base_offset = if rm_index == 6 && mode == 0 { mb.fetch_u16() } else { base_offset };
        let displacement: u16 = match mode {
            1 => sign_extend_u8(mb.fetch_u8()),
            2 => mb.fetch_u16(),
            _ => 0,
        };
        Ok(base_offset.wrapping_add(displacement))
    }

    fn offset32<T>(mb: &mut T, mode: u8, rm_index: u8) -> Result<u16, CpuFault>
    where
        T: WithCpuState + Memory + Fetcher,
    {
        let base_offset: u32 = if rm_index == 4 {
            Self::sib(mb, mode)?
        } else if rm_index == 5 && mode == 0 {
            mb.fetch_u32()
        } else {
            mb.state().registers.read_u32(gp(rm_index))
        };
        let displacement: u32 = match mode {
            1 => sign_extend_u8(mb.fetch_u8()) as u32,
            2 => mb.fetch_u32(),
            _ => 0,
        };
        let offset32 = base_offset.wrapping_add(displacement);
        if offset32 > 0xFFFF {
            return Err(CpuFault::GeneralProtectionFault { offset: offset32 });
        }
        Ok(offset32 as u16)
    }

    fn sib<T>(mb: &mut T, mode: u8) -> Result<u32, CpuFault>
    where
        T: WithCpuState + Memory + Fetcher,
    {
        let sib = mb.fetch_u8();
        let scale = 1u32 << (sib >> 6);
        let index_reg = (sib >> 3) & 7;
        let base_reg = sib & 7;
        let index_value = if index_reg == 4 { 0 } else { mb.state().registers.read_u32(gp(index_reg)) };
        let base_value = if base_reg == 5 && mode == 0 {
            mb.fetch_u32()
        } else {
            mb.state().registers.read_u32(gp(base_reg))
        };
        Ok(base_value.wrapping_add(scale.wrapping_mul(index_value)))
    }

    pub fn get_rm8<T: WithCpuState + Memory>(&self, mb: &mut T) -> u8 {
        match self.memory_address {
            Some(addr) => mb.read_u8(addr),
            None => mb.state().registers.read_encoded_u8(self.rm_index),
        }
    }

    pub fn set_rm8<T: WithCpuState + Memory>(&self, mb: &mut T, v: u8) {
        match self.memory_address {
            Some(addr) => mb.write_u8(addr, v),
            None => mb.state_mut().registers.write_encoded_u8(self.rm_index, v),
        }
    }

    pub fn get_rm16<T: WithCpuState + Memory>(&self, mb: &mut T) -> u16 {
        match self.memory_address {
            Some(addr) => mb.read_u16(addr),
            None => mb.state().registers.read_u16(gp(self.rm_index)),
        }
    }

    pub fn set_rm16<T: WithCpuState + Memory>(&self, mb: &mut T, v: u16) {
        match self.memory_address {
            Some(addr) => mb.write_u16(addr, v),
            None => mb.state_mut().registers.write_u16(gp(self.rm_index), v),
        }
    }

    pub fn get_rm32<T: WithCpuState + Memory>(&self, mb: &mut T) -> u32 {
        match self.memory_address {
            Some(addr) => mb.read_u32(addr),
            None => mb.state().registers.read_u32(gp(self.rm_index)),
        }
    }

    pub fn set_rm32<T: WithCpuState + Memory>(&self, mb: &mut T, v: u32) {
        match self.memory_address {
            Some(addr) => mb.write_u32(addr, v),
            None => mb.state_mut().registers.write_u32(gp(self.rm_index), v),
        }
    }

    pub fn r8<T: WithCpuState>(&self, mb: &T) -> u8 {
        mb.state().registers.read_encoded_u8(self.register_index)
    }

    pub fn set_r8<T: WithCpuState>(&self, mb: &mut T, v: u8) {
        mb.state_mut().registers.write_encoded_u8(self.register_index, v);
    }

    pub fn r16<T: WithCpuState>(&self, mb: &T) -> u16 {
        mb.state().registers.read_u16(gp(self.register_index))
    }

    pub fn set_r16<T: WithCpuState>(&self, mb: &mut T, v: u16) {
        mb.state_mut().registers.write_u16(gp(self.register_index), v);
    }

    pub fn r32<T: WithCpuState>(&self, mb: &T) -> u32 {
        mb.state().registers.read_u32(gp(self.register_index))
    }

    pub fn set_r32<T: WithCpuState>(&self, mb: &mut T, v: u32) {
        mb.state_mut().registers.write_u32(gp(self.register_index), v);
    }

    pub fn segment_register<T: WithCpuState>(&self, mb: &T) -> u16 {
        mb.state().registers.read_seg(segreg(self.register_index))
    }

    pub fn set_segment_register<T: WithCpuState>(&self, mb: &mut T, v: u16) {
        mb.state_mut().registers.write_seg(segreg(self.register_index), v);
    }

    /// `true` when this ModR/M byte encoded a register operand (mode==3),
    /// i.e. there is no memory address to fall back on.
    pub fn is_register(&self) -> bool {
        self.memory_address.is_none()
    }
}

fn sign_extend_u8(v: u8) -> u16 {
    v as i8 as i16 as u16
}

fn default_segment(mode: u8, rm_index: u8) -> SegReg {
    match rm_index {
        0 | 1 => SegReg::Ds,
        2 | 3 => SegReg::Ss,
        4 | 5 => SegReg::Ds,
        6 => if mode == 0 { SegReg::Ds } else { SegReg::Ss },
        7 => SegReg::Ds,
        _ => SegReg::Ds,
    }
}

fn segreg(index: u8) -> SegReg {
    match index & 7 {
        0 => SegReg::Es,
        1 => SegReg::Cs,
        2 => SegReg::Ss,
        3 => SegReg::Ds,
        4 => SegReg::Fs,
        _ => SegReg::Gs,
    }
}
