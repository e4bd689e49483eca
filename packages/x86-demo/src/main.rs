//! A thin CLI harness: loads a flat binary image at a chosen segment, wires
//! up a 1MiB memory and a handful of logged I/O ports, and runs the core
//! until it halts or faults.

use std::env;
use std::fs;
use std::process::ExitCode;

use log::{error, info, warn};

use x86_core::cpu::error::CpuFault;
use x86_core::cpu::flags::CpuModel;
use x86_core::cpu::instructions8::dispatch_one;
use x86_core::cpu::ivt;
use x86_core::cpu::memory::{IoPorts, Memory, WithCpuState};
use x86_core::cpu::registers::SegReg;
use x86_core::cpu::state::CpuState;

struct Machine {
    state: CpuState,
    memory: Vec<u8>,
}

impl Machine {
    fn new(model: CpuModel) -> Machine {
        Machine { state: CpuState::new(model), memory: vec![0; 0x10_0000] }
    }

    fn addr(a: u32) -> usize {
        (a & 0xF_FFFF) as usize
    }
}

impl WithCpuState for Machine {
    fn state(&self) -> &CpuState {
        &self.state
    }
    fn state_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }
}

impl Memory for Machine {
    fn read_u8(&mut self, addr: u32) -> u8 {
        self.memory[Self::addr(addr)]
    }

    fn read_u16(&mut self, addr: u32) -> u16 {
        let i = Self::addr(addr);
        u16::from_le_bytes([self.memory[i], self.memory[(i + 1) & 0xF_FFFF]])
    }

    fn read_u32(&mut self, addr: u32) -> u32 {
        let i = Self::addr(addr);
        let mut b = [0u8; 4];
        for (k, slot) in b.iter_mut().enumerate() {
            *slot = self.memory[(i + k) & 0xF_FFFF];
        }
        u32::from_le_bytes(b)
    }

    fn write_u8(&mut self, addr: u32, v: u8) {
        let i = Self::addr(addr);
        self.memory[i] = v;
    }

    fn write_u16(&mut self, addr: u32, v: u16) {
        let i = Self::addr(addr);
        let b = v.to_le_bytes();
        self.memory[i] = b[0];
        self.memory[(i + 1) & 0xF_FFFF] = b[1];
    }

    fn write_u32(&mut self, addr: u32, v: u32) {
        let i = Self::addr(addr);
        let b = v.to_le_bytes();
        for (k, byte) in b.iter().enumerate() {
            self.memory[(i + k) & 0xF_FFFF] = *byte;
        }
    }
}

/// Ports are logged and otherwise inert; no real device model is wired up.
impl IoPorts for Machine {
    fn in8(&mut self, port: u16) -> u8 {
        info!("IN8 from port {:#06x} (no device attached, returning 0xFF)", port);
        0xFF
    }

    fn in16(&mut self, port: u16) -> u16 {
        info!("IN16 from port {:#06x} (no device attached, returning 0xFFFF)", port);
        0xFFFF
    }

    fn out8(&mut self, port: u16, v: u8) {
        info!("OUT8 port {:#06x} <- {:#04x}", port, v);
    }

    fn out16(&mut self, port: u16, v: u16) {
        info!("OUT16 port {:#06x} <- {:#06x}", port, v);
    }
}

struct Args {
    model: CpuModel,
    image_path: String,
    load_segment: u16,
}

fn parse_args() -> Result<Args, String> {
    let mut model = CpuModel::I8086;
    let mut load_segment: u16 = 0x0000;
    let mut image_path: Option<String> = None;

    let mut raw = env::args().skip(1);
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--model" => {
                let v = raw.next().ok_or("--model requires a value")?;
                model = match v.as_str() {
                    "8086" => CpuModel::I8086,
                    "286" => CpuModel::I286,
                    "386" => CpuModel::I386,
                    other => return Err(format!("unknown model {other:?}, expected 8086/286/386")),
                };
            }
            "--segment" => {
                let v = raw.next().ok_or("--segment requires a value")?;
                load_segment = u16::from_str_radix(v.trim_start_matches("0x"), 16)
                    .map_err(|e| format!("invalid --segment value: {e}"))?;
            }
            other if image_path.is_none() => image_path = Some(other.to_string()),
            other => return Err(format!("unexpected argument {other:?}")),
        }
    }

    Ok(Args {
        model,
        image_path: image_path.ok_or("usage: x86-demo [--model 8086|286|386] [--segment hex] <image>")?,
        load_segment,
    })
}

fn run(args: Args) -> Result<Machine, (Machine, CpuFault)> {
    let mut machine = Machine::new(args.model);
    let image = fs::read(&args.image_path).unwrap_or_else(|e| {
        error!("failed to read {:?}: {e}", args.image_path);
        std::process::exit(1);
    });

    let base = x86_core::cpu::state::physical_address(args.load_segment, 0);
    for (i, byte) in image.iter().enumerate() {
        machine.memory[Machine::addr(base + i as u32)] = *byte;
    }

    // Vector 0 is reserved for divide errors and is otherwise unpopulated;
    // leaving the rest of the table zeroed means an unhandled interrupt
    // would vector through CS:IP 0000:0000, which is intentional for this
    // harness since there is no interrupt controller behind it.
    ivt::write_vector(&mut machine, 0, 0, 0);

    machine.state.registers.write_seg(SegReg::Cs, args.load_segment);
    machine.state.ip = 0;
    machine.state.is_running = true;

    info!("starting at {}", machine.state.dump());

    while machine.state.is_running {
        if let Err(fault) = dispatch_one(&mut machine) {
            if fault.is_recoverable() {
                warn!("recoverable fault: {fault} (no interrupt controller attached, halting)");
            } else {
                warn!("fatal fault: {fault}");
            }
            return Err((machine, fault));
        }
    }

    Ok(machine)
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match parse_args() {
        Ok(a) => a,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    match run(args) {
        Ok(machine) => {
            info!("halted cleanly: {}", machine.state.dump());
            ExitCode::SUCCESS
        }
        Err((machine, _fault)) => {
            info!("stopped on fault: {}", machine.state.dump());
            ExitCode::FAILURE
        }
    }
}
