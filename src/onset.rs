use crate::model::song::{OnsetEvent, PitchSample};
use crate::stream::{PitchSource, Publisher, Subscription};
use log::debug;
use std::sync::{Arc, Mutex};

/// Number of consecutive invalid frames before a held note is
/// considered released.
const SILENCE_RELEASE_FRAMES: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct OnsetConfig {
    /// Minimum linear volume for a frame to count as valid.
    pub volume_threshold: f64,
    /// Minimum extractor confidence for a frame to count as valid.
    pub precision_threshold: f64,
    /// Same-note retriggers inside this window are suppressed.
    pub debounce_ms: f64,
    pub min_midi_note: i32,
    pub max_midi_note: i32,
}

impl Default for OnsetConfig {
    fn default() -> Self {
        Self {
            volume_threshold: 0.05,
            precision_threshold: 0.5,
            debounce_ms: 80.0,
            min_midi_note: 21,
            max_midi_note: 108,
        }
    }
}

#[derive(Debug)]
struct DetectorState {
    last_onset_note: i32,
    last_onset_time: Option<f64>,
    is_note_active: bool,
    silence_frames: u32,
}

impl DetectorState {
    fn new() -> Self {
        Self {
            last_onset_note: -1,
            last_onset_time: None,
            is_note_active: false,
            silence_frames: 0,
        }
    }

    fn step(&mut self, config: &OnsetConfig, sample: &PitchSample) -> Option<OnsetEvent> {
        let valid = sample.midi_note >= config.min_midi_note
            && sample.midi_note <= config.max_midi_note
            && sample.volume_linear >= config.volume_threshold
            && sample.precision >= config.precision_threshold
            && sample.frequency_hz > 0.0;

        if !valid {
            self.silence_frames += 1;
            if self.silence_frames >= SILENCE_RELEASE_FRAMES {
                self.is_note_active = false;
            }
            return None;
        }

        self.silence_frames = 0;

        // A fresh attack after release, or a pitch change while holding.
        // A repeated sample of the held note is neither and stays quiet.
        let candidate = !self.is_note_active || sample.midi_note != self.last_onset_note;
        self.is_note_active = true;
        if !candidate {
            return None;
        }

        if sample.midi_note == self.last_onset_note {
            if let Some(last) = self.last_onset_time {
                if (sample.timestamp - last) * 1000.0 < config.debounce_ms {
                    debug!(
                        "Debounced retrigger of {} at {:.3}s",
                        sample.midi_note, sample.timestamp
                    );
                    return None;
                }
            }
        }

        self.last_onset_note = sample.midi_note;
        self.last_onset_time = Some(sample.timestamp);
        Some(OnsetEvent {
            midi_note: sample.midi_note,
            frequency_hz: sample.frequency_hz,
            volume: sample.volume_linear,
            timestamp: sample.timestamp,
        })
    }
}

/// Framewise filter turning a pitch-sample stream into discrete note
/// onsets with hysteresis and debouncing.
///
/// The detector does no time-based work of its own; it runs entirely on
/// the cadence of the upstream sample stream, pushed via `attach` or
/// pulled via `process`.
pub struct OnsetDetector {
    config: OnsetConfig,
    state: Arc<Mutex<DetectorState>>,
    onsets: Publisher<OnsetEvent>,
    subscription: Mutex<Option<Subscription>>,
}

impl Default for OnsetDetector {
    fn default() -> Self {
        Self::new(OnsetConfig::default())
    }
}

impl OnsetDetector {
    pub fn new(config: OnsetConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(DetectorState::new())),
            onsets: Publisher::new(),
            subscription: Mutex::new(None),
        }
    }

    /// The downstream onset stream. Clones share the subscriber list.
    pub fn onsets(&self) -> Publisher<OnsetEvent> {
        self.onsets.clone()
    }

    /// Feeds one frame and publishes/returns the onset it produced, if
    /// any. This is the pull-mode entry; `attach` wires the same logic
    /// to a push source.
    pub fn process(&self, sample: &PitchSample) -> Option<OnsetEvent> {
        let onset = self.state.lock().unwrap().step(&self.config, sample);
        if let Some(onset) = onset {
            self.onsets.publish(&onset);
        }
        onset
    }

    /// Subscribes to a sample source, replacing any prior source and
    /// resetting detector state.
    pub fn attach(&self, source: &dyn PitchSource) {
        self.detach();
        self.reset();

        let config = self.config;
        let state = Arc::clone(&self.state);
        let onsets = self.onsets.clone();
        let subscription = source.subscribe_samples(Box::new(move |sample| {
            let onset = state.lock().unwrap().step(&config, sample);
            if let Some(onset) = onset {
                onsets.publish(&onset);
            }
        }));

        *self.subscription.lock().unwrap() = Some(subscription);
    }

    /// Cancels the current sample subscription, if any.
    pub fn detach(&self) {
        if let Some(subscription) = self.subscription.lock().unwrap().take() {
            subscription.cancel();
        }
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap() = DetectorState::new();
    }
}
