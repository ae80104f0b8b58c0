//! STM32 measurement fabric for the sampling pipeline.
//!
//! The Touch Sensing Controller plays the oscillation counter: a charge-
//! transfer acquisition counts pulses until the sample capacitor reaches
//! threshold, and a finger on the electrode lowers that count. A basic timer
//! (TIM16, present on every supported family) paces the measurement windows
//! and raises the poll interrupt.
//!
//! Registers are accessed directly through the PAC rather than through a HAL
//! singleton. There is no way to guarantee this crate resolves the same PAC
//! version as the application's HAL, so taking ownership of the peripheral
//! from the caller would only give a false sense of exclusivity. Nothing
//! else in the application may touch the TSC or TIM16 registers.

#[cfg(feature = "stm32f0x1")]
use stm32f0::stm32f0x1 as pac;
#[cfg(feature = "stm32f303")]
use stm32f3::stm32f303 as pac;

use crate::sense::SenseHardware;
use crate::{ChannelId, Reading, MAX_CHANNELS};

/// TSC wiring for one capacitive pad: the analog group it lives on, the
/// group channel holding the sample capacitor, and the group channel tied
/// to the electrode.
#[derive(Clone, Copy, Debug)]
pub struct Pad {
    /// Analog group, 1..=6.
    pub group: u8,
    /// Sample-capacitor channel within the group, 1..=4.
    pub sample: u8,
    /// Electrode channel within the group, 1..=4.
    pub electrode: u8,
}

#[derive(Clone, Copy, Debug)]
pub enum ClockPrescaler {
    Hclk = 0b000,
    HclkDiv2 = 0b001,
    HclkDiv4 = 0b010,
    HclkDiv8 = 0b011,
    HclkDiv16 = 0b100,
    HclkDiv32 = 0b101,
    HclkDiv64 = 0b110,
    HclkDiv128 = 0b111,
}

#[derive(Clone, Copy, Debug)]
pub enum MaxCount {
    U255 = 0b000,
    U511 = 0b001,
    U1023 = 0b010,
    U2047 = 0b011,
    U4095 = 0b100,
    U8191 = 0b101,
    U16383 = 0b110,
}

impl MaxCount {
    pub fn to_count(self) -> u16 {
        match self {
            Self::U255 => 255,
            Self::U511 => 511,
            Self::U1023 => 1023,
            Self::U2047 => 2047,
            Self::U4095 => 4095,
            Self::U8191 => 8191,
            Self::U16383 => 16383,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TscConfig {
    pub clock_prescale: ClockPrescaler,
    pub max_count: MaxCount,
    /// Charge and discharge pulse lengths, in TSC clock cycles, 1..=16.
    pub charge_cycles: u8,
}

impl TscConfig {
    const fn default() -> Self {
        Self {
            clock_prescale: ClockPrescaler::HclkDiv16,
            max_count: MaxCount::U8191,
            charge_cycles: 2,
        }
    }
}

pub const DEFAULT_TSC_CONFIG: TscConfig = TscConfig::default();

pub struct TscOscillator {
    tsc: &'static pac::tsc::RegisterBlock,
    tim: &'static pac::tim16::RegisterBlock,
    pads: [Option<Pad>; MAX_CHANNELS],
    current: Option<Pad>,
    max_count: u16,
}

// The `&'static RegisterBlock` handles are not `Send` on their own (the PAC
// register blocks are not `Sync`), but the app owns the sole `TscOscillator`
// inside a `cortex_m::interrupt::Mutex` static and nothing else touches the
// TSC or TIM16 registers (see the module note above). Access therefore only
// ever happens from within a critical section, which is exactly the exclusivity
// `Send` requires here.
unsafe impl Send for TscOscillator {}

impl TscOscillator {
    /// Bring up the TSC and the window timer.
    ///
    /// `pads` maps each channel slot to its TSC wiring; disabled channels
    /// stay `None`. `tim_clk` is the timer's input clock and `poll_freq`
    /// the desired measurement windows per second.
    pub fn new(
        pads: [Option<Pad>; MAX_CHANNELS],
        config: TscConfig,
        tim_clk: u32,
        poll_freq: u32,
    ) -> Self {
        let rcc = unsafe { &*pac::RCC::ptr() };
        rcc.ahbenr.modify(|_, w| w.tscen().set_bit());
        rcc.ahbrstr.modify(|_, w| w.tscrst().set_bit());
        rcc.ahbrstr.modify(|_, w| w.tscrst().clear_bit());
        rcc.apb2enr.modify(|_, w| w.tim16en().set_bit());

        let tsc = unsafe { &*pac::TSC::ptr() };
        let pulse = (config.charge_cycles - 1) & 0xf;
        tsc.cr.write(|w| unsafe {
            w.ctph()
                .bits(pulse)
                .ctpl()
                .bits(pulse)
                .sse()
                .set_bit()
                .ssd()
                .bits(16)
                .pgpsc()
                .bits(config.clock_prescale as u8)
                .mcv()
                .bits(config.max_count as u8)
                .tsce()
                .set_bit()
        });

        let tim = unsafe { &*pac::TIM16::ptr() };
        let window = tim_clk / poll_freq;
        let psc = (window >> 16) as u16;
        let arr = (window / (psc as u32 + 1)) as u16;
        tim.psc.write(|w| unsafe { w.bits(psc as u32) });
        tim.arr.write(|w| unsafe { w.bits(arr as u32) });
        tim.egr.write(|w| w.ug().set_bit());
        tim.sr.modify(|_, w| w.uif().clear_bit());
        tim.cr1.modify(|_, w| w.cen().set_bit());

        Self {
            tsc,
            tim,
            pads,
            current: None,
            max_count: config.max_count.to_count(),
        }
    }

    /// Enable the window-timer update interrupt.
    pub fn listen(&mut self) {
        self.tim.dier.modify(|_, w| w.uie().set_bit());
    }

    /// Disable the window-timer update interrupt.
    pub fn unlisten(&mut self) {
        self.tim.dier.modify(|_, w| w.uie().clear_bit());
    }

    fn group_complete(&self, group: u8) -> bool {
        (self.tsc.iogcsr.read().bits() >> 16) & (1 << (group - 1)) != 0
    }
}

impl SenseHardware for TscOscillator {
    fn select(&mut self, channel: ChannelId) {
        self.current = self.pads[channel.index()];
    }

    fn restart(&mut self) {
        if let Some(pad) = self.current {
            let group = 1u32 << (pad.group - 1);
            let sample = 1u32 << ((pad.group - 1) * 4 + pad.sample - 1);
            let electrode = 1u32 << ((pad.group - 1) * 4 + pad.electrode - 1);
            self.tsc.iogcsr.write(|w| unsafe { w.bits(group) });
            self.tsc.ioscr.write(|w| unsafe { w.bits(sample) });
            self.tsc.ioccr.write(|w| unsafe { w.bits(electrode) });

            self.tsc.icr.write(|w| {
                w.eoaic().set_bit() // end-of-acquisition
                    .mceic().set_bit() // max-count-error
            });
            self.tsc.cr.modify(|_, w| w.iodef().clear_bit());
            self.tsc.cr.modify(|_, w| w.start().set_bit());
        }

        self.tim.cnt.write(|w| unsafe { w.bits(0) });
        self.tim.sr.modify(|_, w| w.uif().clear_bit());
    }

    fn window_elapsed(&mut self) -> bool {
        if self.tim.sr.read().uif().bit_is_set() {
            self.tim.sr.modify(|_, w| w.uif().clear_bit());
            true
        } else {
            false
        }
    }

    fn count(&self) -> Reading {
        let Some(pad) = self.current else {
            return self.max_count + 1;
        };
        // A group that never completed hit max count: the acquisition gave
        // up before the sample capacitor charged. Saturate high, which
        // reads as "no finger."
        if !self.group_complete(pad.group) {
            return self.max_count + 1;
        }
        match pad.group {
            1 => self.tsc.iog1cr.read().cnt().bits(),
            2 => self.tsc.iog2cr.read().cnt().bits(),
            3 => self.tsc.iog3cr.read().cnt().bits(),
            4 => self.tsc.iog4cr.read().cnt().bits(),
            5 => self.tsc.iog5cr.read().cnt().bits(),
            6 => self.tsc.iog6cr.read().cnt().bits(),
            _ => self.max_count + 1,
        }
    }
}
