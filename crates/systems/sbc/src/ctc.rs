//! Four channel counter/timer
//!
//! Each channel counts down from a programmable time constant, either on
//! every Nth bus tick (timer mode, prescaled by 16 or 256) or on external
//! trigger pulses (counter mode). A channel that reaches zero can raise the
//! shared interrupt line; on acknowledge the CPU is handed a mode 2 vector
//! derived from the programmed vector base and the channel number, and the
//! interrupt is retired when the service routine executes RETI.

use log::debug;

use crate::bus::IoDevice;

const PORT_BASE: u16 = 0x0010;

/// Number of counter/timer channels.
pub const CHANNEL_COUNT: usize = 4;

// Control word bits
const CTRL_CONTROL: u8 = 0x01;
const CTRL_RESET: u8 = 0x02;
const CTRL_CONSTANT: u8 = 0x04;
const CTRL_TRIGGER: u8 = 0x08;
const CTRL_SCALER: u8 = 0x20;
const CTRL_MODE: u8 = 0x40;
const CTRL_INTERRUPT: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Start counting as soon as a time constant is loaded.
    Automatic,
    /// Wait for a trigger pulse before starting.
    Pulse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelMode {
    Timer,
    Counter,
}

/// Interrupt line state: a two step protocol between "some channel wants
/// service" and "the CPU acknowledged and is running channel N's handler".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntState {
    Idle,
    /// The line is held; the CPU has not acknowledged yet.
    Asserted,
    /// The CPU acknowledged and is servicing this channel.
    Servicing(usize),
}

/// Single counter/timer channel.
#[derive(Debug, Clone)]
struct Channel {
    trigger: Trigger,
    scaler: u16,
    mode: ChannelMode,
    interrupt_enabled: bool,
    /// Programmed time constant (a written 0 means 256).
    constant: u16,
    /// Current count; -1 while the channel is stopped.
    count: i16,
    scaler_count: u8,
    interrupt_pending: bool,
    /// The next port write is the time constant.
    awaiting_constant: bool,
}

impl Channel {
    fn new() -> Self {
        Self {
            trigger: Trigger::Automatic,
            scaler: 16,
            mode: ChannelMode::Timer,
            interrupt_enabled: false,
            constant: 256,
            count: -1,
            scaler_count: 0,
            interrupt_pending: false,
            awaiting_constant: false,
        }
    }
}

/// Four channel counter/timer with a shared vectored interrupt.
pub struct Ctc {
    channels: [Channel; CHANNEL_COUNT],
    state: IntState,
    /// Mode 2 vector base (low three bits always zero).
    vector_base: u8,
    /// Set by the CPU's RETI notification, applied on the next tick.
    reti_latch: bool,
}

impl Ctc {
    /// Create a CTC with all channels stopped.
    pub fn new() -> Self {
        Self {
            channels: [Channel::new(), Channel::new(), Channel::new(), Channel::new()],
            state: IntState::Idle,
            vector_base: 0x00,
            reti_latch: false,
        }
    }

    /// Advance all channels by one bus tick.
    pub fn tick(&mut self) {
        if self.reti_latch {
            self.end_interrupt();
        }

        for index in 0..CHANNEL_COUNT {
            {
                let channel = &mut self.channels[index];
                channel.scaler_count = channel.scaler_count.wrapping_sub(1);

                if channel.count < 0 {
                    continue;
                }

                if channel.mode == ChannelMode::Timer
                    && channel.scaler_count as u16 % channel.scaler == 0
                {
                    channel.count -= 1;
                }

                if channel.count == 0 {
                    if channel.interrupt_enabled {
                        channel.interrupt_pending = true;
                    }

                    // Automatic trigger and counter mode channels free run
                    if channel.trigger == Trigger::Automatic || channel.mode == ChannelMode::Counter
                    {
                        channel.count = channel.constant as i16;
                    }
                }
            }

            if self.state == IntState::Idle && self.channels[index].interrupt_pending {
                self.state = IntState::Asserted;
            }
        }
    }

    /// Whether the interrupt line is currently held waiting for acknowledge.
    pub fn is_asserted(&self) -> bool {
        self.state == IntState::Asserted
    }

    /// Interrupt acknowledge: assign the interrupt and return the vector.
    ///
    /// Channels are prioritized by index; the lowest pending channel wins.
    pub fn interrupt_vector(&mut self) -> u8 {
        for index in 0..CHANNEL_COUNT {
            if self.channels[index].interrupt_pending {
                self.state = IntState::Servicing(index);
                return self.vector_base + 2 * index as u8;
            }
        }

        self.vector_base
    }

    /// The CPU executed RETI; the interrupt retires on the next tick.
    pub fn reti_notify(&mut self) {
        self.reti_latch = true;
    }

    fn end_interrupt(&mut self) {
        self.reti_latch = false;

        match self.state {
            IntState::Servicing(index) => {
                self.channels[index].interrupt_pending = false;
                self.state = IntState::Idle;
            }
            // RETI with nothing acknowledged drops the assertion; a channel
            // still pending re-asserts on the next tick
            IntState::Asserted => self.state = IntState::Idle,
            IntState::Idle => {}
        }
    }

    fn write_channel(&mut self, index: usize, data: u8) {
        let channel = &mut self.channels[index];

        if channel.awaiting_constant {
            channel.constant = if data == 0 { 256 } else { data as u16 };
            channel.awaiting_constant = false;

            // A stopped automatic or counter mode channel arms immediately
            if (channel.trigger == Trigger::Automatic || channel.mode == ChannelMode::Counter)
                && channel.count == -1
            {
                channel.count = channel.constant as i16;
            }

            return;
        }

        if data & CTRL_CONTROL == 0 {
            self.vector_base = data & 0xF8;
            debug!("ctc: vector base {:#04x}", self.vector_base);
            return;
        }

        channel.trigger = if data & CTRL_TRIGGER != 0 {
            Trigger::Pulse
        } else {
            Trigger::Automatic
        };
        channel.scaler = if data & CTRL_SCALER != 0 { 256 } else { 16 };
        channel.mode = if data & CTRL_MODE != 0 {
            ChannelMode::Counter
        } else {
            ChannelMode::Timer
        };
        channel.interrupt_enabled = data & CTRL_INTERRUPT != 0;

        if data & CTRL_CONSTANT != 0 {
            channel.awaiting_constant = true;
        }

        if data & CTRL_RESET != 0 {
            channel.count = -1;
            channel.scaler_count = 255;
        }
    }
}

impl Default for Ctc {
    fn default() -> Self {
        Self::new()
    }
}

impl IoDevice for Ctc {
    fn input(&mut self, port: u16) -> Option<u8> {
        if port & 0xFFFC != PORT_BASE {
            return None;
        }

        let channel = (port & 0x000F) as usize;
        Some(self.channels[channel].count as u8)
    }

    fn output(&mut self, port: u16, data: u8) -> bool {
        if port & 0xFFFC != PORT_BASE {
            return false;
        }

        self.write_channel((port & 0x000F) as usize, data);
        true
    }
}
