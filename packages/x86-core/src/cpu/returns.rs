//! Near/far RET and IRET, built on top of `stack`.

use super::memory::{Memory, WithCpuState};
use super::registers::SegReg;
use super::stack;

/// Pops a 16-bit IP, then discards `n` bytes from the stack.
pub fn near_ret16<T: WithCpuState + Memory>(mb: &mut T, n: u16) {
    let ip = stack::pop16(mb);
    mb.state_mut().ip = ip;
    stack::discard(mb, n);
}

/// Pops a 32-bit value and truncates it into IP, then discards `n` bytes.
pub fn near_ret32<T: WithCpuState + Memory>(mb: &mut T, n: u16) {
    let ip = stack::pop32(mb);
    mb.state_mut().ip = ip as u16;
    stack::discard(mb, n);
}

/// Pops (IP, CS) as a segmented address, then discards `n` bytes.
pub fn far_ret16<T: WithCpuState + Memory>(mb: &mut T, n: u16) {
    let (cs, ip) = stack::pop_segmented_address(mb);
    mb.state_mut().ip = ip;
    mb.state_mut().registers.write_seg(SegReg::Cs, cs);
    stack::discard(mb, n);
}

/// Pops a 32-bit segmented address (IP truncated to 16 bits, CS takes only
/// the low 16 bits of its slot), then discards `n + 2` bytes.
pub fn far_ret32<T: WithCpuState + Memory>(mb: &mut T, n: u16) {
    let ip32 = stack::pop32(mb);
    let cs32 = stack::pop32(mb);
    mb.state_mut().ip = ip32 as u16;
    mb.state_mut().registers.write_seg(SegReg::Cs, cs32 as u16);
    stack::discard(mb, n.wrapping_add(2));
}

/// Pops (IP, CS) then a 16-bit flags word, re-applying the model sanitizer.
pub fn interrupt_ret<T: WithCpuState + Memory>(mb: &mut T) {
    let (cs, ip) = stack::pop_segmented_address(mb);
    mb.state_mut().ip = ip;
    mb.state_mut().registers.write_seg(SegReg::Cs, cs);
    let flags_word = stack::pop16(mb);
    mb.state_mut().flags.set_whole(flags_word as u32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::flags::CpuModel;
    use crate::cpu::memory::FlatMemory;
    use crate::cpu::registers::GpReg;
    use crate::cpu::state::CpuState;

    struct Harness {
        state: CpuState,
        mem: FlatMemory,
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

    fn harness() -> Harness {
        Harness { state: CpuState::new(CpuModel::I8086), mem: FlatMemory::new() }
    }

    #[test]
    fn s6_far_ret16_with_extra_pop() {
        let mut h = harness();
        h.state.registers.write_u16(GpReg::Sp, 0x1000);
        stack::push16(&mut h, 0x0F00); // CS (pushed second, ends up above IP)
        stack::push16(&mut h, 0x0100); // IP (top of stack)
        let sp_before = h.state.registers.read_u16(GpReg::Sp);

        far_ret16(&mut h, 2);

        assert_eq!(h.state.registers.read_seg(SegReg::Cs), 0x0F00);
        assert_eq!(h.state.ip, 0x0100);
        let sp_after = h.state.registers.read_u16(GpReg::Sp);
        assert_eq!(sp_after.wrapping_sub(sp_before), 6);
    }

    #[test]
    fn s8_interrupt_ret_restores_masked_flags() {
        let mut h = harness();
        h.state.flags = crate::cpu::flags::Flags::new(CpuModel::I286);
        h.state.registers.write_u16(GpReg::Sp, 0x1000);
        stack::push16(&mut h, 0xFFFF); // flags (popped last)
        stack::push16(&mut h, 0x5678); // CS
        stack::push16(&mut h, 0x1234); // IP

        interrupt_ret(&mut h);

        assert_eq!(h.state.ip, 0x1234);
        assert_eq!(h.state.registers.read_seg(SegReg::Cs), 0x5678);
        assert_eq!(h.state.flags.as_u32(), 0x0002);
    }
}
