//! Aggregate architectural state: registers, flags, instruction pointer,
//! cycle counter, and the per-instruction prefix fields.

use super::flags::{CpuModel, Flags};
use super::registers::{RegisterFile, SegReg};

/// Per-instruction prefix state. Both fields are "absent / present(value)"
/// and are reset by `clear_prefixes` at the boundary of every architectural
/// instruction; see universal invariant 7.
#[derive(Debug, Eq, PartialEq, Copy, Clone, Default)]
pub struct Prefixes {
    /// REPE/REPNE predicate: `Some(true)` for REPE/REPZ, `Some(false)` for
    /// REPNE/REPNZ, `None` when no repeat prefix has been seen.
    pub continue_zero_flag_value: Option<bool>,
    /// Segment register that overrides the default segment for the next
    /// effective-address resolution.
    pub segment_override_index: Option<SegReg>,
}

/// The CPU's full architectural state, exclusive of memory.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct CpuState {
    pub registers: RegisterFile,
    pub flags: Flags,
    pub ip: u16,
    pub cycles: u64,
    pub prefixes: Prefixes,
    pub is_running: bool,
}

impl CpuState {
    pub fn new(model: CpuModel) -> CpuState {
        CpuState {
            registers: RegisterFile::new(),
            flags: Flags::new(model),
            ip: 0,
            cycles: 0,
            prefixes: Prefixes::default(),
            is_running: false,
        }
    }

    pub fn inc_cycles(&mut self) {
        self.cycles += 1;
    }

    pub fn clear_prefixes(&mut self) {
        self.prefixes = Prefixes::default();
    }

    /// `(CS, IP)`.
    pub fn ip_segmented_address(&self) -> (u16, u16) {
        (self.registers.read_seg(SegReg::Cs), self.ip)
    }

    pub fn physical_ip(&self) -> u32 {
        physical_address(self.registers.read_seg(SegReg::Cs), self.ip)
    }

    pub fn physical_ss_sp(&self) -> u32 {
        let sp = self.registers.read_u16(super::registers::GpReg::Sp);
        physical_address(self.registers.read_seg(SegReg::Ss), sp)
    }

    fn direction(&self, width: u32) -> i32 {
        if self.flags.get_flag(super::flags::DF) {
            -(width as i32)
        } else {
            width as i32
        }
    }

    pub fn direction8(&self) -> i32 {
        self.direction(1)
    }

    pub fn direction16(&self) -> i32 {
        self.direction(2)
    }

    pub fn direction32(&self) -> i32 {
        self.direction(4)
    }

    /// The canonical textual register/flag dump used by diagnostics and
    /// tests. Field order is fixed: cycles, CS:IP, the eight 32-bit general
    /// registers, the five non-SS segment registers, then the flags word
    /// and its letter dump.
    pub fn dump(&self) -> String {
        use super::registers::GpReg::*;
        let regs = &self.registers;
        let (cs, ip) = self.ip_segmented_address();
        format!(
            "Cycles={} CS:IP={:04X}:{:04X}/{:05X} EAX={:08X} EBX={:08X} ECX={:08X} EDX={:08X} ESI={:08X} EDI={:08X} EBP={:08X} ESP={:08X} SS={:04X} DS={:04X} ES={:04X} FS={:04X} GS={:04X} flags={:08X} ({})",
            self.cycles,
            cs,
            ip,
            self.physical_ip(),
            regs.read_u32(Ax),
            regs.read_u32(Bx),
            regs.read_u32(Cx),
            regs.read_u32(Dx),
            regs.read_u32(Si),
            regs.read_u32(Di),
            regs.read_u32(Bp),
            regs.read_u32(Sp),
            regs.read_seg(SegReg::Ss),
            regs.read_seg(SegReg::Ds),
            regs.read_seg(SegReg::Es),
            regs.read_seg(SegReg::Fs),
            regs.read_seg(SegReg::Gs),
            self.flags.as_u32(),
            self.flags.dump(),
        )
    }
}

pub fn physical_address(segment: u16, offset: u16) -> u32 {
    ((segment as u32) << 4) + (offset as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_address_matches_segment_shift_formula() {
        assert_eq!(physical_address(0x1000, 0x0210), 0x10210);
    }

    #[test]
    fn direction_follows_df() {
        let mut state = CpuState::new(CpuModel::I8086);
        assert_eq!(state.direction8(), 1);
        state.flags.set_flag(super::super::flags::DF, true);
        assert_eq!(state.direction8(), -1);
        assert_eq!(state.direction16(), -2);
        assert_eq!(state.direction32(), -4);
    }

    #[test]
    fn clear_prefixes_resets_both_fields() {
        let mut state = CpuState::new(CpuModel::I8086);
        state.prefixes.continue_zero_flag_value = Some(true);
        state.prefixes.segment_override_index = Some(SegReg::Es);
        state.clear_prefixes();
        assert_eq!(state.prefixes, Prefixes::default());
    }
}
