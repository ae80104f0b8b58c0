#![allow(dead_code)]
#![cfg_attr(not(test), no_std)]

pub mod calibrate;
pub mod sense;
pub mod store;
#[cfg(any(feature = "stm32f0x1", feature = "stm32f303"))]
pub mod tsc;

pub use calibrate::{CalPrompt, CalStatus, Rating};
pub use sense::{CapSense, SenseHardware};
pub use store::ThresholdStore;

/// A filtered oscillation count. A finger on a pad raises its capacitance
/// and lowers the count.
pub type Reading = u16;

/// Number of channel slots; boards may enable any subset.
pub const MAX_CHANNELS: usize = 4;

/// Rotating bins per channel used to estimate the unpressed baseline.
pub const NUM_BINS: usize = 2;

/// Full press-and-release passes collected per channel during calibration.
pub const CAL_TRIALS: usize = 3;

/// A validated channel index, 0..MAX_CHANNELS.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelId(u8);

impl ChannelId {
    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < MAX_CHANNELS {
            Some(Self(index))
        } else {
            None
        }
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// The set of channels a board actually wires up.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelSet(u8);

impl ChannelSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self((1 << MAX_CHANNELS) - 1)
    }

    pub const fn with(self, channel: ChannelId) -> Self {
        Self(self.0 | 1 << channel.0)
    }

    pub const fn contains(self, channel: ChannelId) -> bool {
        self.0 & 1 << channel.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Lowest enabled channel, if any.
    pub fn first(self) -> Option<ChannelId> {
        self.iter().next()
    }

    /// Next enabled channel strictly after `channel`, without wrapping.
    pub fn next_after(self, channel: ChannelId) -> Option<ChannelId> {
        self.iter().find(|c| c.0 > channel.0)
    }

    pub fn iter(self) -> impl Iterator<Item = ChannelId> {
        (0..MAX_CHANNELS as u8)
            .filter_map(ChannelId::new)
            .filter(move |c| self.contains(*c))
    }
}

/// Static configuration for the sensing pipeline.
#[derive(Clone, Copy, Debug)]
pub struct SenseConfig {
    /// Channels wired to pads on this board.
    pub channels: ChannelSet,
    /// Effective window of the exponential moving-average filter.
    pub filter_length: u16,
    /// Consecutive not-held polls required before a new press can latch.
    pub debounce_polls: u8,
    /// Floor for the detection threshold, so a collapsed baseline can never
    /// make every sample look pressed.
    pub min_threshold: Reading,
    /// Ticks between baseline bin rotations.
    pub ticks_per_bin: u32,
    /// Ticks a press must persist before the baseline is allowed to track it.
    pub long_hold_ticks: u32,
}

impl SenseConfig {
    const fn default() -> Self {
        Self {
            channels: ChannelSet::all(),
            filter_length: 4,
            debounce_polls: 10,
            min_threshold: 4,
            ticks_per_bin: 50,
            long_hold_ticks: 3000,
        }
    }

    /// Ticks for every bin to rotate out, plus one. Calibration waits this
    /// long per phase so no stale pressed data survives into a measurement.
    pub const fn settle_ticks(&self) -> u32 {
        self.ticks_per_bin * NUM_BINS as u32 + 1
    }
}

pub const DEFAULT_SENSE_CONFIG: SenseConfig = SenseConfig::default();

/// Rejected static configuration. Fatal at init.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    NoChannels,
    ZeroFilterLength,
    ZeroBinInterval,
}
