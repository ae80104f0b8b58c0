//! Guided self-calibration.
//!
//! The operator is walked through an idle period, then three press-and-
//! release passes over every enabled channel, then a closing idle period.
//! Sampling keeps running throughout; the sample processor feeds per-channel
//! minima into the accumulators here. The closing computation turns the
//! collected excursions into per-channel thresholds with a quality rating,
//! and persists both the thresholds and the raw statistics.

use crate::sense::ChannelState;
use crate::store as layout;
use crate::store::ThresholdStore;
use crate::{ChannelId, Reading, SenseConfig, CAL_TRIALS, MAX_CHANNELS};

/// How reliably a channel's press can be told apart from idle noise and
/// from presses on its neighbors.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Rating {
    /// Indistinguishable from crosstalk or noise; threshold is best-effort.
    Fail,
    /// Usable, but only a firm press clears the margins.
    Ok,
    /// Clear separation on every margin.
    Great,
}

/// Whether calibration needs more steps.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalStatus {
    Running,
    Done,
}

/// What the operator should be doing right now. For the UI.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CalPrompt {
    /// Keep clear of all pads.
    HandsOff,
    /// Press and release the given pad, once, during this window.
    Press(ChannelId),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CalState {
    Start,
    WaitIdle,
    PressAndRelease,
    Done,
}

/// Transient calibration state; exists only while a pass is running.
pub(crate) struct Calibration {
    state: CalState,
    first: ChannelId,
    cal_channel: ChannelId,
    /// Completed full passes over the enabled channels.
    trial: usize,
    state_start_ticks: u32,
    /// Largest excursion per channel while nothing should be pressed.
    max_waiting: [Reading; MAX_CHANNELS],
    /// Largest excursion per channel while a *different* channel was being
    /// pressed: crosstalk.
    max_others: [Reading; MAX_CHANNELS],
    /// Largest excursion on the channel being intentionally pressed, per
    /// trial.
    max_holding: [[Reading; CAL_TRIALS]; MAX_CHANNELS],
    /// Running minimum reading since the last reset, fed by the sample
    /// processor.
    min_reading: [Reading; MAX_CHANNELS],
}

impl Calibration {
    pub(crate) fn start(first: ChannelId, ticks: u32) -> Self {
        Self {
            state: CalState::Start,
            first,
            cal_channel: first,
            trial: 0,
            state_start_ticks: ticks,
            max_waiting: [0; MAX_CHANNELS],
            max_others: [0; MAX_CHANNELS],
            max_holding: [[0; CAL_TRIALS]; MAX_CHANNELS],
            min_reading: [Reading::MAX; MAX_CHANNELS],
        }
    }

    /// Called by the sample processor for every sample while calibration is
    /// running.
    pub(crate) fn observe(&mut self, channel: ChannelId, reading: Reading) {
        if matches!(self.state, CalState::WaitIdle | CalState::PressAndRelease) {
            let slot = &mut self.min_reading[channel.index()];
            *slot = (*slot).min(reading);
        }
    }

    pub(crate) fn prompt(&self) -> CalPrompt {
        match self.state {
            CalState::PressAndRelease => CalPrompt::Press(self.cal_channel),
            _ => CalPrompt::HandsOff,
        }
    }

    pub(crate) fn step<S: ThresholdStore>(
        &mut self,
        ticks: u32,
        config: &SenseConfig,
        channels: &mut [ChannelState; MAX_CHANNELS],
        ratings: &mut [Rating; MAX_CHANNELS],
        store: &mut S,
    ) -> CalStatus {
        match self.state {
            CalState::Start => self.on_start(ticks),
            CalState::WaitIdle => self.on_wait_idle(ticks, config, channels),
            CalState::PressAndRelease => self.on_press_window(ticks, config, channels),
            CalState::Done => {}
        }

        if self.state == CalState::Done {
            self.finish(config, channels, ratings, store);
            CalStatus::Done
        } else {
            CalStatus::Running
        }
    }

    fn enter(&mut self, state: CalState, ticks: u32) {
        self.state = state;
        self.state_start_ticks = ticks;
        // Each measurement window starts its minima from scratch.
        if matches!(state, CalState::WaitIdle | CalState::PressAndRelease) {
            self.min_reading = [Reading::MAX; MAX_CHANNELS];
        }
    }

    fn settled(&self, ticks: u32, config: &SenseConfig) -> bool {
        ticks.wrapping_sub(self.state_start_ticks) > config.settle_ticks()
    }

    fn on_start(&mut self, ticks: u32) {
        self.cal_channel = self.first;
        self.trial = 0;
        self.max_waiting = [0; MAX_CHANNELS];
        self.max_others = [0; MAX_CHANNELS];
        self.max_holding = [[0; CAL_TRIALS]; MAX_CHANNELS];
        #[cfg(feature = "defmt")]
        defmt::debug!("calibration: waiting for idle");
        self.enter(CalState::WaitIdle, ticks);
    }

    fn on_wait_idle(
        &mut self,
        ticks: u32,
        config: &SenseConfig,
        channels: &[ChannelState; MAX_CHANNELS],
    ) {
        if !self.settled(ticks, config) {
            return;
        }

        // Record how far each channel strayed below baseline with nothing
        // pressed.
        for channel in config.channels.iter() {
            let i = channel.index();
            let excursion = channels[i].baseline.saturating_sub(self.min_reading[i]);
            self.max_waiting[i] = self.max_waiting[i].max(excursion);
        }

        if self.trial == 0 {
            #[cfg(feature = "defmt")]
            defmt::debug!("calibration: press channel {}", self.cal_channel);
            self.enter(CalState::PressAndRelease, ticks);
        } else {
            self.enter(CalState::Done, ticks);
        }
    }

    fn on_press_window(
        &mut self,
        ticks: u32,
        config: &SenseConfig,
        channels: &[ChannelState; MAX_CHANNELS],
    ) {
        if !self.settled(ticks, config) {
            return;
        }

        // The exercised channel's excursion is its press strength for this
        // trial; everyone else's is crosstalk.
        for channel in config.channels.iter() {
            let i = channel.index();
            let excursion = channels[i].baseline.saturating_sub(self.min_reading[i]);
            if channel == self.cal_channel {
                let slot = &mut self.max_holding[i][self.trial];
                *slot = (*slot).max(excursion);
            } else {
                self.max_others[i] = self.max_others[i].max(excursion);
            }
        }

        match config.channels.next_after(self.cal_channel) {
            Some(next) => {
                self.cal_channel = next;
                self.enter(CalState::PressAndRelease, ticks);
            }
            None => {
                // Full pass complete; run the channels again or take the
                // closing idle measurement.
                self.cal_channel = self.first;
                self.trial += 1;
                if self.trial >= CAL_TRIALS {
                    #[cfg(feature = "defmt")]
                    defmt::debug!("calibration: closing idle measurement");
                    self.enter(CalState::WaitIdle, ticks);
                } else {
                    self.enter(CalState::PressAndRelease, ticks);
                }
            }
        }
        #[cfg(feature = "defmt")]
        if self.state == CalState::PressAndRelease {
            defmt::debug!("calibration: press channel {}", self.cal_channel);
        }
    }

    /// Turn the collected excursions into thresholds and ratings, and
    /// persist everything.
    fn finish<S: ThresholdStore>(
        &self,
        config: &SenseConfig,
        channels: &mut [ChannelState; MAX_CHANNELS],
        ratings: &mut [Rating; MAX_CHANNELS],
        store: &mut S,
    ) {
        let min_thresh = config.min_threshold;
        let mut thresholds = [0 as Reading; MAX_CHANNELS];

        for (i, (state, rating)) in channels.iter_mut().zip(ratings.iter_mut()).enumerate() {
            let enabled = ChannelId::new(i as u8)
                .map_or(false, |channel| config.channels.contains(channel));
            if !enabled {
                // Placeholders; never consulted in normal operation.
                state.sensitivity = 0;
                *rating = Rating::Fail;
                continue;
            }

            let max_waiting = self.max_waiting[i];
            let max_others = self.max_others[i];
            // Weakest and strongest of this channel's own presses.
            let min_me = *self.max_holding[i].iter().min().unwrap_or(&0);
            let max_me = *self.max_holding[i].iter().max().unwrap_or(&0);

            if max_others as u32 + 2 * min_thresh as u32 >= min_me as u32
                || max_waiting as u32 + 2 * min_thresh as u32 >= min_me as u32
            {
                // A neighbor's press, or plain idle noise, reaches as deep
                // as this channel's weakest press. Aim between the hardest
                // press and idle so at least that much registers.
                *rating = Rating::Fail;
                state.sensitivity = (max_me / 2 + max_waiting / 2).saturating_sub(min_thresh);
            } else {
                // Recognize the weakest observed press, less a margin.
                state.sensitivity = min_me - min_thresh;
                *rating = if max_others > min_me
                    || max_others > min_me - 2 * min_thresh
                    || max_waiting > min_me
                    || max_waiting > min_me - min_thresh
                {
                    Rating::Ok
                } else {
                    Rating::Great
                };
            }
            thresholds[i] = state.sensitivity;

            #[cfg(feature = "defmt")]
            defmt::info!(
                "calibration: channel {} threshold={} rating={}",
                i,
                state.sensitivity,
                *rating
            );
        }

        let mut buf = [0u8; layout::THRESHOLD_LEN];
        layout::encode_readings(&thresholds, &mut buf);
        store.write(layout::THRESHOLD_ADDR, &buf);

        // Raw excursions at the bottom of the store for bench read-out,
        // overwriting whatever was there.
        const BLOCK: usize = MAX_CHANNELS * 2;
        let mut diag = [0u8; BLOCK];
        layout::encode_readings(&self.max_waiting, &mut diag);
        store.write(layout::DIAG_ADDR, &diag);
        layout::encode_readings(&self.max_others, &mut diag);
        store.write(layout::DIAG_ADDR + BLOCK as u16, &diag);
        let mut holding = [0u8; MAX_CHANNELS * CAL_TRIALS * 2];
        for (i, trials) in self.max_holding.iter().enumerate() {
            layout::encode_readings(trials, &mut holding[i * CAL_TRIALS * 2..][..CAL_TRIALS * 2]);
        }
        store.write(layout::DIAG_ADDR + 2 * BLOCK as u16, &holding);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sense::test::{feed, rig};
    use crate::store::MemStore;
    use crate::ChannelSet;

    fn ch(index: u8) -> ChannelId {
        ChannelId::new(index).unwrap()
    }

    fn single_channel_config() -> SenseConfig {
        SenseConfig {
            channels: ChannelSet::empty().with(ch(0)),
            filter_length: 1,
            debounce_polls: 3,
            min_threshold: 4,
            ticks_per_bin: 10,
            long_hold_ticks: 1_000_000,
        }
    }

    fn done_calibration(config: &SenseConfig) -> Calibration {
        let mut cal = Calibration::start(config.channels.first().unwrap(), 0);
        cal.state = CalState::Done;
        cal
    }

    #[test]
    fn clean_separation_rates_great() {
        let config = single_channel_config();
        let mut cal = done_calibration(&config);
        cal.max_waiting[0] = 2;
        cal.max_others[0] = 1;
        cal.max_holding[0] = [20, 22, 21];

        let mut channels = [ChannelState::default(); MAX_CHANNELS];
        let mut ratings = [Rating::Fail; MAX_CHANNELS];
        let mut store = MemStore::new();
        cal.finish(&config, &mut channels, &mut ratings, &mut store);

        // Weakest press 20, margin 4.
        assert_eq!(channels[0].sensitivity, 16);
        assert_eq!(ratings[0], Rating::Great);
    }

    #[test]
    fn crosstalk_overlap_rates_fail_with_fallback_threshold() {
        let config = single_channel_config();
        let mut cal = done_calibration(&config);
        cal.max_waiting[0] = 3;
        cal.max_others[0] = 12;
        cal.max_holding[0] = [18, 25, 20];

        let mut channels = [ChannelState::default(); MAX_CHANNELS];
        let mut ratings = [Rating::Fail; MAX_CHANNELS];
        let mut store = MemStore::new();
        cal.finish(&config, &mut channels, &mut ratings, &mut store);

        // 12 + 2*4 = 20 >= 18: the weakest press is inside the crosstalk
        // band. Fallback splits hardest press (25) against idle noise (3).
        assert_eq!(ratings[0], Rating::Fail);
        assert_eq!(channels[0].sensitivity, 25 / 2 + 3 / 2 - 4);
    }

    #[test]
    fn disabled_channels_get_placeholder_results() {
        let config = single_channel_config();
        let mut cal = done_calibration(&config);
        cal.max_holding[0] = [20, 22, 21];

        let mut channels = [ChannelState::default(); MAX_CHANNELS];
        channels[3].sensitivity = 77;
        let mut ratings = [Rating::Great; MAX_CHANNELS];
        let mut store = MemStore::new();
        cal.finish(&config, &mut channels, &mut ratings, &mut store);

        assert_eq!(channels[3].sensitivity, 0);
        assert_eq!(ratings[3], Rating::Fail);
    }

    #[test]
    fn results_and_diagnostics_are_persisted() {
        let config = single_channel_config();
        let mut cal = done_calibration(&config);
        cal.max_waiting[0] = 2;
        cal.max_others[0] = 1;
        cal.max_holding[0] = [20, 22, 21];

        let mut channels = [ChannelState::default(); MAX_CHANNELS];
        let mut ratings = [Rating::Fail; MAX_CHANNELS];
        let mut store = MemStore::new();
        cal.finish(&config, &mut channels, &mut ratings, &mut store);

        let mut buf = [0u8; crate::store::THRESHOLD_LEN];
        store.read(crate::store::THRESHOLD_ADDR, &mut buf);
        let mut thresholds = [0; MAX_CHANNELS];
        crate::store::decode_readings(&buf, &mut thresholds);
        assert_eq!(thresholds, [16, 0, 0, 0]);

        // max_waiting, then max_others, then max_holding from address 0.
        let mut diag = [0u8; crate::store::DIAG_LEN];
        store.read(crate::store::DIAG_ADDR, &mut diag);
        let mut words = [0u16; crate::store::DIAG_LEN / 2];
        crate::store::decode_readings(&diag, &mut words);
        assert_eq!(words[0], 2); // max_waiting[0]
        assert_eq!(words[4], 1); // max_others[0]
        assert_eq!(words[8..11], [20, 22, 21]); // max_holding[0]
    }

    /// Run the whole protocol against a scripted operator: idle reads 1000,
    /// a press reads 900 against a settled baseline of 1000.
    #[test]
    fn full_pass_over_one_channel() {
        let config = single_channel_config();
        // Seed a plausible sensitivity so presses register mid-calibration.
        let mut sense = rig(config, [50, 0, 0, 0]);
        let mut store = MemStore::new();
        let mut ticks = 0u32;

        // Let the baseline settle at 1000 first.
        feed(&mut sense, &mut ticks, 1000, 15);
        assert_eq!(sense.baseline(ch(0)), 1000);

        sense.start_calibration(ticks);
        let mut saw_press_prompt = false;
        let mut iterations = 0;
        loop {
            let count = match sense.calibration_prompt() {
                Some(CalPrompt::Press(_)) => {
                    saw_press_prompt = true;
                    900
                }
                _ => 1000,
            };
            feed(&mut sense, &mut ticks, count, 1);
            if sense.calibrate_step(ticks, &mut store) == CalStatus::Done {
                break;
            }
            iterations += 1;
            assert!(iterations < 1000, "calibration never finished");
        }
        assert!(saw_press_prompt);

        // Three trials each saw a clean 100-count excursion.
        assert_eq!(sense.sensitivity(ch(0)), 96);
        assert_eq!(sense.rating(ch(0)), Rating::Great);

        // Persisted thresholds match the live ones.
        let mut buf = [0u8; layout::THRESHOLD_LEN];
        store.read(layout::THRESHOLD_ADDR, &mut buf);
        let mut thresholds = [0; MAX_CHANNELS];
        layout::decode_readings(&buf, &mut thresholds);
        assert_eq!(thresholds, [96, 0, 0, 0]);

        // A drained latch: calibration consumed any presses it provoked.
        assert_eq!(sense.take_button(), None);
    }
}
