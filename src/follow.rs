use crate::model::song::{Note, OnsetEvent};
use crate::stream::{Publisher, Subscription};
use log::{debug, info};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// How many score positions past the expected one a stray onset may
/// match before it counts as unmatched.
const LOOKAHEAD: usize = 3;

/// Intervals shorter than this (seconds) carry no usable tempo signal.
const MIN_INTERVAL: f64 = 0.01;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FollowError {
    #[error("cannot start following without a score")]
    NoScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowState {
    Idle,
    Following,
    /// A rest was just crossed; speed updates hold until the performer
    /// plays again.
    WaitingForOnset,
}

#[derive(Debug, Clone, Copy)]
pub struct FollowConfig {
    /// EMA smoothing weight for new speed estimates.
    pub ema_alpha: f64,
    pub min_speed: f64,
    pub max_speed: f64,
    /// Pitch slack, in semitones, for matching an onset to the score.
    pub note_match_tolerance: u8,
    /// Gap between consecutive melody notes that counts as a rest.
    pub rest_threshold_seconds: f64,
    /// Consecutive unmatched onsets before the speed starts decaying.
    pub unmatched_threshold: u32,
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            ema_alpha: 0.3,
            min_speed: 0.25,
            max_speed: 4.0,
            note_match_tolerance: 2,
            rest_threshold_seconds: 1.0,
            unmatched_threshold: 3,
        }
    }
}

type SpeedCallback = Arc<dyn Fn(f64) + Send + Sync>;
type StateCallback = Arc<dyn Fn(FollowState) + Send + Sync>;

#[derive(Default)]
struct Effects {
    speeds: Vec<f64>,
    states: Vec<FollowState>,
    stopped: bool,
}

struct FollowInner {
    config: FollowConfig,
    state: FollowState,
    score: Vec<Note>,
    expected_index: usize,
    speed_factor: f64,
    last_onset_time: Option<f64>,
    unmatched_count: u32,
    on_speed: Option<SpeedCallback>,
    on_state: Option<StateCallback>,
    subscription: Option<Subscription>,
}

impl FollowInner {
    fn new(config: FollowConfig) -> Self {
        Self {
            config,
            state: FollowState::Idle,
            score: Vec::new(),
            expected_index: 0,
            speed_factor: 1.0,
            last_onset_time: None,
            unmatched_count: 0,
            on_speed: None,
            on_state: None,
            subscription: None,
        }
    }

    fn set_state(&mut self, state: FollowState, effects: &mut Effects) {
        if self.state != state {
            self.state = state;
            effects.states.push(state);
        }
    }

    fn on_onset(&mut self, onset: &OnsetEvent, effects: &mut Effects) {
        if self.state == FollowState::Idle {
            return;
        }
        if self.expected_index >= self.score.len() {
            self.finish(effects);
            return;
        }

        match self.find_match(onset.midi_note) {
            Some(index) => self.on_match(index, onset, effects),
            None => self.on_unmatched(onset, effects),
        }
    }

    fn find_match(&self, midi_note: i32) -> Option<usize> {
        let tolerance = i32::from(self.config.note_match_tolerance);
        let end = (self.expected_index + 1 + LOOKAHEAD).min(self.score.len());
        (self.expected_index..end)
            .find(|&i| (midi_note - i32::from(self.score[i].note_number)).abs() <= tolerance)
    }

    fn on_match(&mut self, index: usize, onset: &OnsetEvent, effects: &mut Effects) {
        self.unmatched_count = 0;
        let was_waiting = self.state == FollowState::WaitingForOnset;
        if was_waiting {
            // The performer is back after the rest. The elapsed interval
            // spans the rest and says nothing about tempo, so this onset
            // only re-anchors the clock.
            self.set_state(FollowState::Following, effects);
        }

        self.expected_index = index;

        if !was_waiting {
            if let Some(last) = self.last_onset_time {
                if self.expected_index > 0 {
                    let actual = onset.timestamp - last;
                    let expected = self.score[self.expected_index].start_seconds
                        - self.score[self.expected_index - 1].start_seconds;
                    if actual > MIN_INTERVAL && expected > MIN_INTERVAL {
                        let raw =
                            (expected / actual).clamp(self.config.min_speed, self.config.max_speed);
                        self.speed_factor = self.config.ema_alpha * raw
                            + (1.0 - self.config.ema_alpha) * self.speed_factor;
                        effects.speeds.push(self.speed_factor);
                        debug!(
                            "Matched note {} at index {}: raw {:.3}, smoothed {:.3}",
                            onset.midi_note, self.expected_index, raw, self.speed_factor
                        );
                    }
                }
            }
        }

        self.last_onset_time = Some(onset.timestamp);
        self.expected_index += 1;
        self.rest_check(effects);
    }

    fn on_unmatched(&mut self, onset: &OnsetEvent, effects: &mut Effects) {
        self.unmatched_count += 1;
        debug!(
            "Unmatched onset {} ({} in a row)",
            onset.midi_note, self.unmatched_count
        );
        if self.unmatched_count >= self.config.unmatched_threshold {
            // Ease off: the same EMA step with a 10%-slower target.
            let target = self.speed_factor * 0.9;
            self.speed_factor = self.config.ema_alpha * target
                + (1.0 - self.config.ema_alpha) * self.speed_factor;
            effects.speeds.push(self.speed_factor);
        }
    }

    fn rest_check(&mut self, effects: &mut Effects) {
        if self.expected_index == 0 || self.expected_index >= self.score.len() {
            return;
        }
        let gap = self.score[self.expected_index].start_seconds
            - self.score[self.expected_index - 1].end_seconds;
        if gap >= self.config.rest_threshold_seconds {
            debug!("Rest of {:.2}s ahead, waiting for the performer", gap);
            self.set_state(FollowState::WaitingForOnset, effects);
        }
    }

    fn finish(&mut self, effects: &mut Effects) {
        self.speed_factor = 1.0;
        self.last_onset_time = None;
        effects.speeds.push(1.0);
        self.set_state(FollowState::Idle, effects);
        effects.stopped = true;
    }
}

/// Onset-driven controller that estimates how fast the performer is
/// moving through the melody and steers the accompaniment's speed
/// factor after it.
///
/// Callbacks fire synchronously on the thread delivering onsets; wiring
/// `on_speed_changed` to `Player::set_speed` closes the follow loop.
pub struct FollowController {
    inner: Arc<Mutex<FollowInner>>,
}

impl Default for FollowController {
    fn default() -> Self {
        Self::new(FollowConfig::default())
    }
}

impl FollowController {
    pub fn new(config: FollowConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FollowInner::new(config))),
        }
    }

    /// Stores a copy of the melody line, sorted by start time.
    pub fn load_score(&self, notes: &[Note]) {
        let mut score = notes.to_vec();
        score.sort_by(|a, b| a.start_seconds.total_cmp(&b.start_seconds));
        let mut inner = self.inner.lock().unwrap();
        inner.score = score;
        inner.expected_index = 0;
        inner.last_onset_time = None;
        inner.unmatched_count = 0;
        info!("Follow score loaded: {} melody notes", inner.score.len());
    }

    /// Resets counters and subscribes to the onset stream. A start with
    /// an empty score is refused; a start while already following is a
    /// no-op.
    pub fn start(&self, onsets: &Publisher<OnsetEvent>) -> Result<(), FollowError> {
        let mut effects = Effects::default();
        let on_state = {
            let mut inner = self.inner.lock().unwrap();
            if inner.score.is_empty() {
                return Err(FollowError::NoScore);
            }
            if inner.state != FollowState::Idle {
                return Ok(());
            }

            inner.expected_index = 0;
            inner.unmatched_count = 0;
            inner.last_onset_time = None;
            inner.speed_factor = 1.0;
            inner.set_state(FollowState::Following, &mut effects);

            let handler_inner = Arc::clone(&self.inner);
            inner.subscription =
                Some(onsets.subscribe(move |onset: &OnsetEvent| deliver(&handler_inner, onset)));
            inner.on_state.clone()
        };

        if let Some(callback) = on_state {
            for state in effects.states {
                callback(state);
            }
        }
        info!("Follow mode started..!");
        Ok(())
    }

    /// Unsubscribes, restores speed 1.0 and goes idle. Synchronous: no
    /// callback fires after this returns.
    pub fn stop(&self) {
        let mut effects = Effects::default();
        let (on_speed, on_state, subscription) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == FollowState::Idle {
                return;
            }
            inner.finish(&mut effects);
            (
                inner.on_speed.clone(),
                inner.on_state.clone(),
                inner.subscription.take(),
            )
        };

        emit(&effects, &on_speed, &on_state);
        drop(subscription);
        info!("Follow mode stopped..!");
    }

    /// Repositions the expected melody note, e.g. after the transport
    /// seeked. The interval anchor is cleared so the next onset cannot
    /// produce a bogus estimate.
    pub fn resume_from_index(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.expected_index = index.min(inner.score.len());
        inner.last_onset_time = None;
        inner.unmatched_count = 0;
        debug!("Follow resumed from score index {}", inner.expected_index);
    }

    pub fn speed_factor(&self) -> f64 {
        self.inner.lock().unwrap().speed_factor
    }

    pub fn state(&self) -> FollowState {
        self.inner.lock().unwrap().state
    }

    pub fn set_on_speed_changed(&self, callback: impl Fn(f64) + Send + Sync + 'static) {
        self.inner.lock().unwrap().on_speed = Some(Arc::new(callback));
    }

    pub fn set_on_state_changed(&self, callback: impl Fn(FollowState) + Send + Sync + 'static) {
        self.inner.lock().unwrap().on_state = Some(Arc::new(callback));
    }
}

fn deliver(inner: &Arc<Mutex<FollowInner>>, onset: &OnsetEvent) {
    let mut effects = Effects::default();
    let (on_speed, on_state, subscription) = {
        let mut guard = inner.lock().unwrap();
        guard.on_onset(onset, &mut effects);
        let subscription = if effects.stopped {
            guard.subscription.take()
        } else {
            None
        };
        (guard.on_speed.clone(), guard.on_state.clone(), subscription)
    };

    emit(&effects, &on_speed, &on_state);
    drop(subscription);
}

fn emit(effects: &Effects, on_speed: &Option<SpeedCallback>, on_state: &Option<StateCallback>) {
    if let Some(callback) = on_speed {
        for speed in &effects.speeds {
            callback(*speed);
        }
    }
    if let Some(callback) = on_state {
        for state in &effects.states {
            callback(*state);
        }
    }
}
