//! Z80 single board computer emulation
//!
//! The machine pairs a Z80 CPU core (the `z80emu` crate) with a banked MMU
//! multiplexing four 1 MiB memory regions, a four channel counter/timer with
//! vectored interrupts, a scan code keyboard, an FDC style floppy controller,
//! and a CGA compatible text display, all reached over a shared I/O port bus.
//!
//! `SbcSystem` owns the CPU and the peripherals and advances everything from
//! a single cooperative tick loop: a bounded batch of CPU instructions, then
//! one counter/timer tick. Input polling and display refresh belong to the
//! frontend driving the loop.

pub mod bus;
pub mod cga;
pub mod ctc;
pub mod floppy;
pub mod keyboard;
mod machine;
pub mod mmu;

use std::path::Path;

use thiserror::Error;
use z80emu::host::TsCounter;
use z80emu::{Cpu, CpuDebugFn, Prefix, StkReg16, Z80NMOS};

pub use cga::{TextCell, TextFrame, TEXT_COLS, TEXT_ROWS};
pub use machine::SbcMachine;

/// CPU instructions executed per orchestrator tick.
pub const INSTRUCTIONS_PER_TICK: u32 = 1000;

/// T-state budget approximating one tick's worth of instructions.
const SLICE_TSTATES: i32 = 8 * INSTRUCTIONS_PER_TICK as i32;

#[derive(Debug, Error)]
pub enum SbcError {
    #[error("write to ROM at address {0:#06x}")]
    RomWrite(u16),
    #[error("no such floppy drive {0}")]
    InvalidDrive(usize),
    #[error("image larger than its region: {0} bytes")]
    ImageTooLarge(usize),
    #[error("image i/o: {0}")]
    Image(#[from] std::io::Error),
}

/// CPU register snapshot for tracing and the debug report.
#[derive(Debug, Clone, Copy)]
pub struct Registers {
    pub pc: u16,
    pub sp: u16,
    pub a: u8,
    pub bc: u16,
    pub de: u16,
    pub hl: u16,
    pub ix: u16,
    pub iy: u16,
    pub halted: bool,
}

/// The complete system: CPU core plus the peripheral complex.
pub struct SbcSystem {
    cpu: Z80NMOS,
    pub machine: SbcMachine,
    ticks: u64,
    debug: bool,
    trace: bool,
}

impl SbcSystem {
    /// Create a powered-on system with nothing loaded.
    pub fn new() -> Self {
        let mut cpu = Z80NMOS::default();
        cpu.reset();

        Self {
            cpu,
            machine: SbcMachine::new(),
            ticks: 0,
            debug: false,
            trace: false,
        }
    }

    /// Enable debug instrumentation (per instruction stack sampling).
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Enable trace mode (one instruction per tick).
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    /// Run one orchestrator tick: a bounded CPU slice, then a CTC tick.
    ///
    /// Reports any fatal fault the slice latched (a ROM write or an NVRAM
    /// flush failure); the machine must not be ticked further after that.
    pub fn step(&mut self) -> Result<(), SbcError> {
        if self.trace || self.debug {
            // Single stepping: trace wants one instruction per tick, debug
            // wants the stack pointer sampled at instruction granularity
            let budget = if self.trace { 1 } else { INSTRUCTIONS_PER_TICK };
            for _ in 0..budget {
                let mut clock = TsCounter::<i32>::default();
                let _ = self
                    .cpu
                    .execute_next(&mut self.machine, &mut clock, None::<CpuDebugFn>);
                if self.debug {
                    self.machine.mmu.record_sp(self.cpu.get_sp());
                }
            }
        } else {
            let mut clock = TsCounter::<i32>::default();
            let _ = self
                .cpu
                .execute_with_limit(&mut self.machine, &mut clock, SLICE_TSTATES);
        }

        self.machine.ctc.tick();
        self.ticks += 1;

        match self.machine.mmu.take_fault() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// Number of ticks executed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Whether the CPU is sitting in HALT.
    pub fn halted(&self) -> bool {
        self.cpu.is_halt()
    }

    /// Snapshot the CPU registers.
    pub fn registers(&self) -> Registers {
        Registers {
            pc: self.cpu.get_pc(),
            sp: self.cpu.get_sp(),
            a: self.cpu.get_acc(),
            bc: self.cpu.get_reg16(StkReg16::BC),
            de: self.cpu.get_reg16(StkReg16::DE),
            hl: self.cpu.get_reg16(StkReg16::HL),
            ix: self.cpu.get_index16(Prefix::Xdd),
            iy: self.cpu.get_index16(Prefix::Yfd),
            halted: self.cpu.is_halt(),
        }
    }

    /// Queue a host key for the keyboard controller.
    pub fn put_key(&mut self, key: u8) {
        self.machine.keyboard.put_key(key);
    }

    /// Scan the text framebuffer out into a decoded frame.
    pub fn render(&self) -> TextFrame {
        self.machine.cga.render(self.machine.mmu.isa())
    }

    /// Issue a raw port read (the I/O test surface).
    pub fn port_input(&mut self, port: u16) -> u8 {
        self.machine.bus_input(port)
    }

    /// Issue a raw port write (the I/O test surface).
    pub fn port_output(&mut self, port: u16, data: u8) {
        self.machine.bus_output(port, data);
    }

    /// Load the BIOS image into ROM.
    pub fn load_rom(&mut self, path: impl AsRef<Path>) -> Result<(), SbcError> {
        self.machine.mmu.load_rom(path)
    }

    /// Load the NVRAM image; it is flushed back on every NVRAM store.
    pub fn load_nvram(&mut self, path: impl AsRef<Path>) -> Result<(), SbcError> {
        self.machine.mmu.load_nvram(path)
    }

    /// Load a program image at the TPA base. Returns its length.
    pub fn load_tpa(&mut self, path: impl AsRef<Path>) -> Result<usize, SbcError> {
        self.machine.mmu.load_tpa(path)
    }

    /// Attach a floppy image to a drive.
    pub fn attach_floppy(&mut self, drive: usize, path: impl AsRef<Path>) -> Result<(), SbcError> {
        self.machine.floppy.load_image(drive, path)
    }

    /// Write every attached floppy image back to disk.
    pub fn save_floppy_images(&self) -> Result<(), SbcError> {
        self.machine.floppy.save_attached_images()
    }
}

impl Default for SbcSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system_with_rom(rom: &[u8]) -> SbcSystem {
        let mut sys = SbcSystem::new();
        sys.machine.mmu.load_rom_bytes(rom).unwrap();
        sys
    }

    #[test]
    fn test_trace_mode_single_steps() {
        let mut sys = system_with_rom(&[0x00, 0x3E, 0x42, 0x76]); // NOP; LD A,0x42; HALT
        sys.set_trace(true);

        sys.step().unwrap();
        assert_eq!(sys.registers().pc, 0x0001);

        sys.step().unwrap();
        assert_eq!(sys.registers().pc, 0x0003);
        assert_eq!(sys.registers().a, 0x42);
    }

    #[test]
    fn test_slice_runs_to_halt() {
        let mut sys = system_with_rom(&[0x3E, 0x42, 0x76]);

        sys.step().unwrap();
        assert!(sys.halted());
        assert_eq!(sys.registers().a, 0x42);
    }

    #[test]
    fn test_rom_write_is_fatal() {
        // LD A,0x01; LD (0x1234),A with ROM as the primary mapping
        let mut sys = system_with_rom(&[0x3E, 0x01, 0x32, 0x34, 0x12, 0x76]);

        let result = sys.step();
        assert!(matches!(result, Err(SbcError::RomWrite(0x1234))));
    }

    #[test]
    fn test_ctc_interrupt_round_trip() {
        // Boot code maps the upper 32 KiB to RAM for a stack, programs CTC
        // channel 0 for a vectored interrupt, and halts. The handler loads a
        // marker, returns with RETI, and the main flow halts again.
        #[rustfmt::skip]
        let mut rom = vec![
            0x3E, 0x02,       // LD A,0x02
            0xD3, 0x00,       // OUT (0x00),A   upper 32 KiB RAM overlay
            0x31, 0xFF, 0xFF, // LD SP,0xFFFF
            0xAF,             // XOR A
            0xED, 0x47,       // LD I,A
            0xED, 0x5E,       // IM 2
            0x3E, 0x80,       // LD A,0x80
            0xD3, 0x10,       // OUT (0x10),A   vector base 0x80
            0x3E, 0x85,       // LD A,0x85
            0xD3, 0x10,       // OUT (0x10),A   interrupt enable + constant follows
            0x3E, 0x01,       // LD A,0x01
            0xD3, 0x10,       // OUT (0x10),A   time constant 1
            0xFB,             // EI
            0x76,             // HALT
            0x3E, 0xAA,       // LD A,0xAA
            0x76,             // HALT
        ];
        rom.resize(0x60, 0x00);
        rom.extend_from_slice(&[0x3E, 0x55, 0xED, 0x4D]); // LD A,0x55; RETI
        rom.resize(0x80, 0x00);
        rom.extend_from_slice(&[0x60, 0x00]); // vector table entry -> 0x0060

        let mut sys = system_with_rom(&rom);

        let mut serviced = false;
        for _ in 0..100 {
            sys.step().unwrap();
            if sys.halted() && sys.registers().a == 0xAA {
                serviced = true;
                break;
            }
        }

        assert!(serviced, "interrupt never serviced");
        // Return address was pushed through the RAM overlay
        assert_eq!(sys.registers().sp, 0xFFFF);
        assert!(!sys.machine.ctc.is_asserted());
    }

    #[test]
    fn test_render_reflects_framebuffer() {
        let mut sys = SbcSystem::new();

        sys.machine.mmu.isa_mut()[cga::FB_BASE] = 0x41;
        sys.machine.mmu.isa_mut()[cga::FB_BASE + 1] = 0x07;
        sys.port_output(0x03D4, 0x0E);
        sys.port_output(0x03D5, 0x00);
        sys.port_output(0x03D4, 0x0F);
        sys.port_output(0x03D5, 0x05);

        let frame = sys.render();
        assert_eq!(frame.cells[0].glyph, 0x41);
        assert_eq!(frame.cells[0].fore, 7);
        assert_eq!(frame.cells[0].back, 0);
        assert_eq!(frame.cursor_row, 0);
        assert_eq!(frame.cursor_col, 5);
    }

    #[test]
    fn test_guest_writes_framebuffer_through_isa_window() {
        // Program pokes 'Z' into the frame buffer through the 0xF000 window
        #[rustfmt::skip]
        let rom = [
            0x3E, 0x04,       // LD A,0x04
            0xD3, 0x00,       // OUT (0x00),A   enable the ISA window
            0x3E, 0xB8,       // LD A,0xB8
            0xD3, 0x03,       // OUT (0x03),A   window bank 0xB8 (0xB8000)
            0x3E, 0x5A,       // LD A,'Z'
            0x32, 0x00, 0xF0, // LD (0xF000),A
            0x76,             // HALT
        ];

        let mut sys = system_with_rom(&rom);
        sys.step().unwrap();

        assert!(sys.halted());
        assert_eq!(sys.render().cells[0].glyph, 0x5A);
    }

    #[test]
    fn test_debug_mode_records_stack() {
        // CALL pushes a return address, so the stack sees traffic
        #[rustfmt::skip]
        let mut rom = vec![
            0x3E, 0x02,       // LD A,0x02
            0xD3, 0x00,       // OUT (0x00),A
            0x31, 0x00, 0xD0, // LD SP,0xD000
            0xCD, 0x20, 0x00, // CALL 0x0020
            0x76,             // HALT
        ];
        rom.resize(0x20, 0x00);
        rom.push(0xC9); // RET

        let mut sys = system_with_rom(&rom);
        sys.set_debug(true);
        sys.step().unwrap();

        let report = sys.machine.mmu.stack_usage_report();
        assert!(report.contains("BDOS"), "report was: {}", report);
    }

    #[test]
    fn test_port_surface_for_io_testing() {
        let mut sys = SbcSystem::new();

        sys.port_output(0x0002, 0x15);
        assert_eq!(sys.port_input(0x0002), 0x15);
        assert_eq!(sys.port_input(0x0300), 0x00);
    }
}
