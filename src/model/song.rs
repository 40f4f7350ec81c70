use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A paired note range with both tick and wall-clock endpoints.
///
/// Velocity is always > 0: a note-on with velocity 0 is treated as a
/// note-off during compilation and never produces a `Note`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Note {
    pub note_number: u8,
    pub velocity: u8,
    pub channel: u8,
    pub start_tick: u64,
    pub end_tick: u64,
    pub start_seconds: f64,
    pub end_seconds: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Tempo,
    TimeSignature,
    ProgramChange,
    ControlChange,
    PitchBend,
    NoteOff,
    NoteOn,
    EndOfTrack,
}

impl EventKind {
    /// Tie-break for events sharing a tick: meta changes apply first,
    /// then channel state, and every note-off lands before any note-on
    /// so a re-attacked note never overlaps itself on a boundary.
    pub fn priority(self) -> u8 {
        match self {
            EventKind::Tempo => 0,
            EventKind::TimeSignature => 1,
            EventKind::ProgramChange => 2,
            EventKind::ControlChange => 3,
            EventKind::PitchBend => 4,
            EventKind::NoteOff => 5,
            EventKind::NoteOn => 6,
            EventKind::EndOfTrack => 7,
        }
    }
}

/// One dispatchable action on the global timeline.
///
/// `channel` is -1 for meta events. `track_index` is carried on every
/// event because real-world files routinely point several logical tracks
/// at the same MIDI channel; per-voice control keys off the track, never
/// the channel.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TimelineEvent {
    pub kind: EventKind,
    pub tick: u64,
    pub seconds: f64,
    pub channel: i8,
    pub track_index: usize,
    pub data1: u8,
    pub data2: u8,
}

impl TimelineEvent {
    pub fn sort_key(&self) -> (u64, u8) {
        (self.tick, self.kind.priority())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TempoChange {
    pub tick: u64,
    pub seconds: f64,
    pub microseconds_per_beat: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TimeSignatureChange {
    pub tick: u64,
    pub seconds: f64,
    pub numerator: u8,
    pub denominator: u8,
}

/// A logically grouped subset of the song. Owns its notes and events;
/// the same events are also present by value in the global timeline.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Track {
    pub index: usize,
    pub name: String,
    pub channels: BTreeSet<u8>,
    pub program_by_channel: BTreeMap<u8, u8>,
    pub notes: Vec<Note>,
    pub events: Vec<TimelineEvent>,
    pub is_muted: bool,
    pub volume: f64,
}

impl Track {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            name: String::new(),
            channels: BTreeSet::new(),
            program_by_channel: BTreeMap::new(),
            notes: Vec::new(),
            events: Vec::new(),
            is_muted: false,
            volume: 1.0,
        }
    }
}

/// A fully compiled song. Immutable after compilation except for
/// `Track::is_muted` and `Track::volume`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Song {
    pub file_name: String,
    pub format: u8,
    pub ticks_per_beat: u32,
    pub tracks: Vec<Track>,
    pub timeline: Vec<TimelineEvent>,
    pub tempo_changes: Vec<TempoChange>,
    pub time_signature_changes: Vec<TimeSignatureChange>,
    pub total_ticks: u64,
    pub total_seconds: f64,
}

impl Song {
    pub fn note_count(&self) -> usize {
        self.tracks.iter().map(|t| t.notes.len()).sum()
    }
}

/// One frame from the microphone pitch extractor.
///
/// `midi_note` is -1 when no pitch was detected. `timestamp` is in
/// seconds on the extractor's own clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitchSample {
    pub frequency_hz: f64,
    pub midi_note: i32,
    pub volume_linear: f64,
    pub volume_dbfs: f64,
    pub precision: f64,
    pub timestamp: f64,
}

/// A discrete note attack distilled from the pitch-sample stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnsetEvent {
    pub midi_note: i32,
    pub frequency_hz: f64,
    pub volume: f64,
    pub timestamp: f64,
}
