//! The sampling pipeline: channel scanning, filtering, press detection, and
//! baseline tracking.
//!
//! `poll` runs inside the platform's timer-overflow interrupt, once per
//! measurement window. Everything else runs in the main loop; callers there
//! must mask the poll interrupt around any call that reads and modifies
//! state (`take_button`, `calibrate_step`).

use crate::calibrate::{CalPrompt, CalStatus, Calibration, Rating};
use crate::store::{self, ThresholdStore};
use crate::{ChannelId, ConfigError, Reading, SenseConfig, MAX_CHANNELS, NUM_BINS};

/// The measurement fabric: one oscillation counter multiplexed across the
/// pads, gated by a window timer.
pub trait SenseHardware {
    /// Route the counter to the given pad.
    fn select(&mut self, channel: ChannelId);

    /// Zero the oscillation counter and the window timer and start counting.
    fn restart(&mut self);

    /// Check and clear the window-elapsed condition.
    fn window_elapsed(&mut self) -> bool;

    /// Oscillation count accumulated in the current window.
    fn count(&self) -> Reading;
}

#[derive(Clone, Copy, Default)]
pub(crate) struct ChannelState {
    pub(crate) reading: Reading,
    pub(crate) baseline: Reading,
    pub(crate) sensitivity: Reading,
    pub(crate) bins: [Reading; NUM_BINS],
}

pub struct CapSense<H: SenseHardware> {
    hw: H,
    config: SenseConfig,
    channels: [ChannelState; MAX_CHANNELS],
    /// Channel currently routed to the counter.
    current: ChannelId,
    first: ChannelId,
    current_bin: usize,
    /// Whether a press edge occurred during each bin's window.
    down_in_bin: [bool; NUM_BINS],
    last_bin_ticks: u32,
    last_button_ticks: u32,
    /// Consecutive polls with no button held, saturating.
    last_down_polls: u8,
    holding: Option<ChannelId>,
    latched: Option<ChannelId>,
    ratings: [Rating; MAX_CHANNELS],
    pub(crate) cal: Option<Calibration>,
}

impl<H: SenseHardware> CapSense<H> {
    /// Readings, bins, and baselines all start at zero, which keeps every
    /// channel above threshold (nothing latches) until the bins fill in.
    pub fn new(config: SenseConfig, hw: H, ticks: u32) -> Result<Self, ConfigError> {
        if config.filter_length == 0 {
            return Err(ConfigError::ZeroFilterLength);
        }
        if config.ticks_per_bin == 0 {
            return Err(ConfigError::ZeroBinInterval);
        }
        let first = config.channels.first().ok_or(ConfigError::NoChannels)?;

        let mut sense = Self {
            hw,
            config,
            channels: [ChannelState::default(); MAX_CHANNELS],
            current: first,
            first,
            current_bin: 0,
            down_in_bin: [false; NUM_BINS],
            last_bin_ticks: ticks,
            last_button_ticks: 0,
            last_down_polls: u8::MAX,
            holding: None,
            latched: None,
            ratings: [Rating::Fail; MAX_CHANNELS],
            cal: None,
        };
        sense.hw.select(first);
        sense.hw.restart();
        Ok(sense)
    }

    /// Load the per-channel threshold sensitivities persisted by calibration.
    pub fn load_thresholds<S: ThresholdStore>(&mut self, store: &mut S) {
        let mut buf = [0u8; store::THRESHOLD_LEN];
        store.read(store::THRESHOLD_ADDR, &mut buf);
        let mut values = [0; MAX_CHANNELS];
        store::decode_readings(&buf, &mut values);
        for (state, value) in self.channels.iter_mut().zip(values) {
            state.sensitivity = value;
        }
    }

    /// Timer-overflow interrupt entry point.
    ///
    /// Returns true when a measurement window had elapsed and a sample was
    /// processed for the scanned channel.
    pub fn poll(&mut self, ticks: u32) -> bool {
        if !self.hw.window_elapsed() {
            return false;
        }

        let raw = self.hw.count();
        let channel = self.current;
        let state = self.channels[channel.index()];

        // The detection boundary tracks baseline drift but never drops
        // below the floor.
        let threshold = if state.baseline > state.sensitivity {
            (state.baseline - state.sensitivity).max(self.config.min_threshold)
        } else {
            self.config.min_threshold
        };

        // IIR low-pass, effective window of filter_length samples.
        let step = (raw as i32 - state.reading as i32) / self.config.filter_length as i32;
        let reading = (state.reading as i32 + step) as Reading;
        self.channels[channel.index()].reading = reading;

        if reading < threshold {
            if self.latched.is_none()
                && self.holding.is_none()
                && self.last_down_polls > self.config.debounce_polls
            {
                // Falling edge: this channel is now the pressed button.
                self.latched = Some(channel);
                self.holding = Some(channel);
                self.last_button_ticks = ticks;
                self.last_down_polls = 0;
                self.down_in_bin[self.current_bin] = true;
            }
        } else {
            if self.holding == Some(channel) {
                self.holding = None;
            }
            if self.holding.is_none() {
                self.last_down_polls = self.last_down_polls.saturating_add(1);
            }
        }

        // Raise the current bin's peak, unless a press is in progress that
        // has not yet persisted past the long-hold limit. The long-hold
        // escape lets the baseline eventually track a permanently covered
        // pad instead of freezing forever.
        if self.baseline_may_track(ticks) {
            let peak = &mut self.channels[channel.index()].bins[self.current_bin];
            if reading > *peak {
                *peak = reading;
            }
        }

        if let Some(cal) = self.cal.as_mut() {
            cal.observe(channel, reading);
        }

        if ticks.wrapping_sub(self.last_bin_ticks) >= self.config.ticks_per_bin {
            self.rotate_bins(ticks);
        }

        self.advance();
        true
    }

    /// Post-interrupt integrity hook. A window that expired again before the
    /// handler returned means the in-flight count is corrupt; start the
    /// measurement over instead of trusting it.
    pub fn poll_done(&mut self) {
        if self.hw.window_elapsed() {
            #[cfg(feature = "defmt")]
            defmt::warn!("capsense: poll overrun, measurement restarted");
            self.hw.restart();
        }
    }

    fn baseline_may_track(&self, ticks: u32) -> bool {
        let unpressed =
            self.holding.is_none() && self.last_down_polls > self.config.debounce_polls;
        let long_hold =
            ticks.wrapping_sub(self.last_button_ticks) >= self.config.long_hold_ticks;
        unpressed || long_hold
    }

    /// Advance to the next bin: the retiring windows define the new
    /// baseline, and the incoming bin starts from the freshest estimate.
    fn rotate_bins(&mut self, ticks: u32) {
        self.current_bin += 1;
        if self.current_bin >= NUM_BINS {
            self.current_bin = 0;
        }

        let track = self.baseline_may_track(ticks);
        for channel in self.config.channels.iter() {
            let state = &mut self.channels[channel.index()];
            let mut max = state.bins[0];
            for bin in 1..NUM_BINS {
                if state.bins[bin] > max {
                    max = state.bins[bin];
                }
            }
            state.baseline = max;
            // Seed the new bin with the latest reading, unless that reading
            // is a held press, which must not depress the baseline.
            state.bins[self.current_bin] = if track { state.reading } else { state.baseline };
        }

        self.last_bin_ticks = ticks;
        self.down_in_bin[self.current_bin] = false;
    }

    /// Move the scanner to the next enabled channel and restart its window.
    fn advance(&mut self) {
        let next = match self.config.channels.next_after(self.current) {
            Some(channel) => channel,
            None => self.first,
        };
        self.current = next;
        self.hw.select(next);
        self.hw.restart();
    }

    /// Most recent filtered count for a channel.
    pub fn reading(&self, channel: ChannelId) -> Reading {
        self.channels[channel.index()].reading
    }

    /// Current unpressed reference level for a channel.
    pub fn baseline(&self, channel: ChannelId) -> Reading {
        self.channels[channel.index()].baseline
    }

    pub fn sensitivity(&self, channel: ChannelId) -> Reading {
        self.channels[channel.index()].sensitivity
    }

    /// Channel currently pressed and not yet released, if any.
    pub fn held(&self) -> Option<ChannelId> {
        self.holding
    }

    /// Whether a press edge has occurred during the current bin's window.
    pub fn down_in_current_bin(&self) -> bool {
        self.down_in_bin[self.current_bin]
    }

    /// Quality rating from the most recent calibration pass.
    pub fn rating(&self, channel: ChannelId) -> Rating {
        self.ratings[channel.index()]
    }

    pub fn config(&self) -> &SenseConfig {
        &self.config
    }

    /// Take the most recent unconsumed press, clearing the slot.
    ///
    /// Call with the poll interrupt masked.
    pub fn take_button(&mut self) -> Option<ChannelId> {
        self.latched.take()
    }

    /// Begin a guided calibration pass. Sampling continues while it runs.
    pub fn start_calibration(&mut self, ticks: u32) {
        self.cal = Some(Calibration::start(self.first, ticks));
    }

    /// What the operator should be doing right now, while calibration runs.
    pub fn calibration_prompt(&self) -> Option<CalPrompt> {
        self.cal.as_ref().map(Calibration::prompt)
    }

    /// Drive calibration by one step, from the main loop, with the poll
    /// interrupt masked. Once `Done` is returned the computed thresholds are
    /// active and persisted, and per-channel ratings are readable.
    pub fn calibrate_step<S: ThresholdStore>(
        &mut self,
        ticks: u32,
        store: &mut S,
    ) -> CalStatus {
        // Keep the one-slot queue drained, as a normal consumer would.
        self.take_button();

        let Some(mut cal) = self.cal.take() else {
            return CalStatus::Done;
        };
        let status = cal.step(ticks, &self.config, &mut self.channels, &mut self.ratings, store);
        if let CalStatus::Running = status {
            self.cal = Some(cal);
        }
        status
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::store::{self as layout, MemStore};
    use crate::{ChannelSet, DEFAULT_SENSE_CONFIG};

    pub struct MockHw {
        pub counts: [Reading; MAX_CHANNELS],
        pub selected: ChannelId,
        pub pending_windows: u32,
        pub restarts: u32,
        pub selections: Vec<usize>,
    }

    impl MockHw {
        pub fn new() -> Self {
            Self {
                counts: [1000; MAX_CHANNELS],
                selected: ChannelId::new(0).unwrap(),
                pending_windows: 0,
                restarts: 0,
                selections: Vec::new(),
            }
        }
    }

    impl SenseHardware for MockHw {
        fn select(&mut self, channel: ChannelId) {
            self.selected = channel;
            self.selections.push(channel.index());
        }

        fn restart(&mut self) {
            self.restarts += 1;
        }

        fn window_elapsed(&mut self) -> bool {
            if self.pending_windows > 0 {
                self.pending_windows -= 1;
                true
            } else {
                false
            }
        }

        fn count(&self) -> Reading {
            self.counts[self.selected.index()]
        }
    }

    fn one_channel_config() -> SenseConfig {
        SenseConfig {
            channels: ChannelSet::empty().with(ChannelId::new(0).unwrap()),
            filter_length: 1,
            debounce_polls: 3,
            min_threshold: 4,
            ticks_per_bin: 10,
            long_hold_ticks: 1_000_000,
        }
    }

    pub fn rig(config: SenseConfig, sensitivities: [Reading; MAX_CHANNELS]) -> CapSense<MockHw> {
        let mut sense = CapSense::new(config, MockHw::new(), 0).unwrap();
        let mut store = MemStore::new();
        let mut buf = [0u8; layout::THRESHOLD_LEN];
        layout::encode_readings(&sensitivities, &mut buf);
        store.write(layout::THRESHOLD_ADDR, &buf);
        sense.load_thresholds(&mut store);
        sense
    }

    /// Feed `polls` identical samples, advancing one tick per poll.
    pub fn feed(sense: &mut CapSense<MockHw>, ticks: &mut u32, count: Reading, polls: u32) {
        for _ in 0..polls {
            sense.hw.counts = [count; MAX_CHANNELS];
            sense.hw.pending_windows = 1;
            sense.poll(*ticks);
            *ticks += 1;
        }
    }

    #[test]
    pub fn filter_converges_to_raw() {
        let config = SenseConfig {
            filter_length: 2,
            ..one_channel_config()
        };
        let mut sense = rig(config, [100, 0, 0, 0]);
        let mut ticks = 0;

        feed(&mut sense, &mut ticks, 1000, 64);
        let reading = sense.reading(ChannelId::new(0).unwrap());
        assert!(1000 - reading <= 1, "filter stalled at {}", reading);

        // Approach from above behaves the same.
        feed(&mut sense, &mut ticks, 600, 64);
        let reading = sense.reading(ChannelId::new(0).unwrap());
        assert!(reading - 600 <= 1, "filter stalled at {}", reading);
    }

    #[test]
    pub fn press_latches_and_clears() {
        let ch0 = ChannelId::new(0).unwrap();
        let mut sense = rig(one_channel_config(), [100, 0, 0, 0]);
        let mut ticks = 0;

        // Establish a baseline of 1000, detection threshold 900.
        feed(&mut sense, &mut ticks, 1000, 15);
        assert_eq!(sense.baseline(ch0), 1000);
        assert_eq!(sense.take_button(), None);

        feed(&mut sense, &mut ticks, 850, 1);
        assert_eq!(sense.held(), Some(ch0));
        assert!(sense.down_in_current_bin());
        assert_eq!(sense.take_button(), Some(ch0));
        // Idempotent: nothing new latched since.
        assert_eq!(sense.take_button(), None);

        feed(&mut sense, &mut ticks, 1000, 1);
        assert_eq!(sense.held(), None);
    }

    #[test]
    pub fn debounce_blocks_early_relatch() {
        let ch0 = ChannelId::new(0).unwrap();
        let mut sense = rig(one_channel_config(), [100, 0, 0, 0]);
        let mut ticks = 0;

        feed(&mut sense, &mut ticks, 1000, 15);
        feed(&mut sense, &mut ticks, 850, 1);
        assert_eq!(sense.take_button(), Some(ch0));

        // Release counts as the first not-held poll; two more make three,
        // which is not beyond debounce_polls = 3.
        feed(&mut sense, &mut ticks, 1000, 3);
        feed(&mut sense, &mut ticks, 850, 1);
        assert_eq!(sense.take_button(), None, "latched inside debounce window");

        // A fourth not-held poll satisfies the debounce, and the next press
        // latches.
        feed(&mut sense, &mut ticks, 1000, 1);
        feed(&mut sense, &mut ticks, 850, 1);
        assert_eq!(sense.take_button(), Some(ch0));
    }

    #[test]
    pub fn held_press_does_not_depress_baseline() {
        let ch0 = ChannelId::new(0).unwrap();
        let mut sense = rig(one_channel_config(), [100, 0, 0, 0]);
        let mut ticks = 0;

        feed(&mut sense, &mut ticks, 1000, 15);
        assert_eq!(sense.baseline(ch0), 1000);

        // Hold across many bin rotations.
        feed(&mut sense, &mut ticks, 850, 100);
        assert_eq!(sense.held(), Some(ch0));
        assert_eq!(sense.baseline(ch0), 1000, "held press dragged baseline");

        // Released and drifting up: baseline follows within one rotation.
        feed(&mut sense, &mut ticks, 1100, 15);
        assert_eq!(sense.baseline(ch0), 1100);
    }

    #[test]
    pub fn long_hold_lets_baseline_track() {
        let ch0 = ChannelId::new(0).unwrap();
        let config = SenseConfig {
            long_hold_ticks: 20,
            ..one_channel_config()
        };
        let mut sense = rig(config, [100, 0, 0, 0]);
        let mut ticks = 0;

        feed(&mut sense, &mut ticks, 1000, 15);
        // Held well past the long-hold limit: the stuck pad becomes the new
        // normal.
        feed(&mut sense, &mut ticks, 850, 60);
        assert_eq!(sense.baseline(ch0), 850);
    }

    #[test]
    pub fn round_robin_visits_only_enabled_channels() {
        let config = SenseConfig {
            channels: ChannelSet::empty()
                .with(ChannelId::new(0).unwrap())
                .with(ChannelId::new(2).unwrap()),
            ..one_channel_config()
        };
        let mut sense = rig(config, [0; MAX_CHANNELS]);
        let mut ticks = 0;

        feed(&mut sense, &mut ticks, 1000, 6);
        // First selection happens at init, then one advance per poll.
        assert_eq!(sense.hw.selections, vec![0, 2, 0, 2, 0, 2, 0]);
    }

    #[test]
    pub fn overrun_discards_the_inflight_measurement() {
        let mut sense = rig(one_channel_config(), [100, 0, 0, 0]);

        // Two windows expire before the handler finishes: the second one
        // means the count being accumulated is corrupt.
        sense.hw.pending_windows = 2;
        assert!(sense.poll(0));
        let restarts = sense.hw.restarts;
        sense.poll_done();
        assert_eq!(sense.hw.restarts, restarts + 1);

        // A clean pass restarts nothing.
        sense.hw.pending_windows = 1;
        assert!(sense.poll(1));
        let restarts = sense.hw.restarts;
        sense.poll_done();
        assert_eq!(sense.hw.restarts, restarts);
    }

    #[test]
    pub fn no_window_no_sample() {
        let mut sense = rig(one_channel_config(), [100, 0, 0, 0]);
        assert!(!sense.poll(0));
    }

    #[test]
    pub fn empty_channel_set_is_rejected() {
        let config = SenseConfig {
            channels: ChannelSet::empty(),
            ..DEFAULT_SENSE_CONFIG
        };
        assert_eq!(
            CapSense::new(config, MockHw::new(), 0).err(),
            Some(ConfigError::NoChannels)
        );
    }

    #[test]
    pub fn thresholds_survive_reload() {
        let values = [310, 0, 65535, 42];
        let sense = rig(DEFAULT_SENSE_CONFIG, values);
        for (i, value) in values.iter().enumerate() {
            assert_eq!(sense.sensitivity(ChannelId::new(i as u8).unwrap()), *value);
        }
    }
}
