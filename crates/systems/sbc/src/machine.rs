//! Machine wiring
//!
//! `SbcMachine` owns every peripheral and is the CPU core's entire view of
//! the outside world: memory callbacks go to the MMU, port callbacks go to
//! the I/O bus, and the interrupt line, vector fetch, and RETI notification
//! connect to the CTC.

use core::num::NonZeroU16;

use z80emu::{Io, Memory};

use crate::bus::{self, IoDevice};
use crate::cga::Cga;
use crate::ctc::Ctc;
use crate::floppy::Floppy;
use crate::keyboard::Keyboard;
use crate::mmu::Mmu;

/// The peripheral complex around the CPU.
pub struct SbcMachine {
    pub mmu: Mmu,
    pub ctc: Ctc,
    pub keyboard: Keyboard,
    pub floppy: Floppy,
    pub cga: Cga,
}

impl SbcMachine {
    /// Create the machine with every device in its power-on state.
    pub fn new() -> Self {
        Self {
            mmu: Mmu::new(),
            ctc: Ctc::new(),
            keyboard: Keyboard::new(),
            floppy: Floppy::new(),
            cga: Cga::new(),
        }
    }

    /// Dispatch a port read across the device chain.
    pub fn bus_input(&mut self, port: u16) -> u8 {
        let mut devices: [&mut dyn IoDevice; 5] = [
            &mut self.mmu,
            &mut self.ctc,
            &mut self.keyboard,
            &mut self.floppy,
            &mut self.cga,
        ];
        bus::bus_input(&mut devices, port)
    }

    /// Dispatch a port write across the device chain.
    pub fn bus_output(&mut self, port: u16, data: u8) -> bool {
        let mut devices: [&mut dyn IoDevice; 5] = [
            &mut self.mmu,
            &mut self.ctc,
            &mut self.keyboard,
            &mut self.floppy,
            &mut self.cga,
        ];
        bus::bus_output(&mut devices, port, data)
    }
}

impl Default for SbcMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory for SbcMachine {
    type Timestamp = i32;

    fn read_debug(&self, address: u16) -> u8 {
        self.mmu.read(address)
    }

    fn read_mem(&self, address: u16, _ts: i32) -> u8 {
        self.mmu.read(address)
    }

    fn read_mem16(&self, address: u16, _ts: i32) -> u16 {
        u16::from_le_bytes([
            self.mmu.read(address),
            self.mmu.read(address.wrapping_add(1)),
        ])
    }

    fn read_opcode(&mut self, pc: u16, _ir: u16, _ts: i32) -> u8 {
        self.mmu.read(pc)
    }

    fn write_mem(&mut self, address: u16, value: u8, _ts: i32) {
        self.mmu.write(address, value);
    }
}

impl Io for SbcMachine {
    type Timestamp = i32;
    type WrIoBreak = ();
    type RetiBreak = ();

    fn read_io(&mut self, port: u16, _ts: i32) -> (u8, Option<NonZeroU16>) {
        (self.bus_input(port), None)
    }

    fn write_io(&mut self, port: u16, data: u8, _ts: i32) -> (Option<()>, Option<NonZeroU16>) {
        self.bus_output(port, data);
        (None, None)
    }

    fn is_irq(&mut self, _ts: i32) -> bool {
        self.ctc.is_asserted()
    }

    fn irq_data(&mut self, _pc: u16, _ts: i32) -> (u8, Option<NonZeroU16>) {
        (self.ctc.interrupt_vector(), None)
    }

    fn reti(&mut self, _address: u16, _ts: i32) -> Option<()> {
        self.ctc.reti_notify();
        None
    }
}
