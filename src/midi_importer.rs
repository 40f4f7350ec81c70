use crate::model::song::*;
use crate::tempo_map::{TempoMap, DEFAULT_MICROS_PER_BEAT};
use anyhow::Context;
use log::{debug, warn};
use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("not a standard MIDI file (bad header)")]
    Header,
    #[error("unexpected end of MIDI data")]
    Truncated,
    #[error("unsupported MIDI feature: {0}")]
    UnsupportedFormat(String),
}

/// Reads and compiles a MIDI file from disk.
pub fn import_midi_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Song> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read MIDI file {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("<unknown>");

    parse(&bytes, file_name).map_err(Into::into)
}

/// Decodes SMF bytes and compiles them into a `Song`.
pub fn parse(bytes: &[u8], file_name: &str) -> Result<Song, ParseError> {
    if !bytes.starts_with(b"MThd") {
        return Err(ParseError::Header);
    }

    let smf = Smf::parse(bytes).map_err(|e| {
        warn!("SMF decode failed for '{}': {}..!", file_name, e);
        ParseError::Truncated
    })?;

    compile(&smf, file_name)
}

/// Compiles decoded per-track delta-time events into a fully timed song.
///
/// Pass 1 collects every tempo and time-signature change across all
/// tracks and builds the tempo map. Pass 2 walks each track again,
/// pairing note-ons with note-offs and emitting timeline events, then
/// applies wall-clock times with the sequential segment walk.
pub fn compile(smf: &Smf, file_name: &str) -> Result<Song, ParseError> {
    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(t) => u32::from(t.as_int()),
        Timing::Timecode(..) => {
            return Err(ParseError::UnsupportedFormat(
                "SMPTE timecode timing".to_string(),
            ));
        }
    };

    let format = match smf.header.format {
        Format::SingleTrack => 0,
        Format::Parallel => 1,
        Format::Sequential => 2,
    };

    debug!(
        "Compiling '{}': format {}, {} ticks/beat, {} tracks",
        file_name,
        format,
        ticks_per_beat,
        smf.tracks.len()
    );

    // Pass 1: global timing.
    let mut raw_tempos: Vec<(u64, u32)> = Vec::new();
    let mut raw_signatures: Vec<(u64, u8, u8)> = Vec::new();

    for track in &smf.tracks {
        let mut abs_tick = 0u64;
        for event in track {
            abs_tick = abs_tick.saturating_add(u64::from(event.delta.as_int()));
            match event.kind {
                TrackEventKind::Meta(MetaMessage::Tempo(micros)) => {
                    raw_tempos.push((abs_tick, micros.as_int()));
                }
                TrackEventKind::Meta(MetaMessage::TimeSignature(num, denom_exp, _, _)) => {
                    let denominator = 1u16
                        .checked_shl(u32::from(denom_exp))
                        .map(|d| d.min(u16::from(u8::MAX)) as u8)
                        .unwrap_or(u8::MAX);
                    raw_signatures.push((abs_tick, num, denominator));
                }
                _ => {}
            }
        }
    }

    raw_tempos.sort_by_key(|&(tick, _)| tick);
    raw_signatures.sort_by_key(|&(tick, _, _)| tick);

    if raw_tempos.first().map_or(true, |&(tick, _)| tick != 0) {
        debug!("No tempo at tick 0, assuming {} us/beat", DEFAULT_MICROS_PER_BEAT);
        raw_tempos.insert(0, (0, DEFAULT_MICROS_PER_BEAT));
    }

    // Colliding tempo ticks keep the later change.
    let mut tempo_changes: Vec<TempoChange> = Vec::with_capacity(raw_tempos.len());
    for (tick, micros) in raw_tempos {
        match tempo_changes.last_mut() {
            Some(last) if last.tick == tick => last.microseconds_per_beat = micros,
            _ => tempo_changes.push(TempoChange {
                tick,
                seconds: 0.0,
                microseconds_per_beat: micros,
            }),
        }
    }

    let tempo_map = TempoMap::new(ticks_per_beat, tempo_changes);

    let time_signature_changes: Vec<TimeSignatureChange> = raw_signatures
        .into_iter()
        .map(|(tick, numerator, denominator)| TimeSignatureChange {
            tick,
            seconds: tempo_map.tick_to_seconds(tick),
            numerator,
            denominator,
        })
        .collect();

    // Pass 2: per-track compilation.
    let mut tracks: Vec<Track> = Vec::with_capacity(smf.tracks.len());
    let mut total_ticks = 0u64;

    for (track_index, raw_track) in smf.tracks.iter().enumerate() {
        let mut track = Track::new(track_index);
        let mut pending: HashMap<(u8, u8), (u8, u64)> = HashMap::new();
        let mut abs_tick = 0u64;

        for event in raw_track {
            abs_tick = abs_tick.saturating_add(u64::from(event.delta.as_int()));

            match event.kind {
                TrackEventKind::Midi { channel, message } => {
                    let ch = channel.as_int();
                    track.channels.insert(ch);

                    match message {
                        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                            if pending
                                .insert((ch, key.as_int()), (vel.as_int(), abs_tick))
                                .is_some()
                            {
                                // Badly formed file: the earlier note-on is
                                // abandoned and never produces a paired note.
                                debug!(
                                    "Duplicate note-on for {} ch{} at tick {}, replacing..!",
                                    key, ch, abs_tick
                                );
                            }
                            track.events.push(TimelineEvent {
                                kind: EventKind::NoteOn,
                                tick: abs_tick,
                                seconds: 0.0,
                                channel: ch as i8,
                                track_index,
                                data1: key.as_int(),
                                data2: vel.as_int(),
                            });
                        }
                        MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                            close_note(&mut track, &mut pending, ch, key.as_int(), abs_tick);
                            track.events.push(TimelineEvent {
                                kind: EventKind::NoteOff,
                                tick: abs_tick,
                                seconds: 0.0,
                                channel: ch as i8,
                                track_index,
                                data1: key.as_int(),
                                data2: 0,
                            });
                        }
                        MidiMessage::ProgramChange { program } => {
                            track.program_by_channel.insert(ch, program.as_int());
                            track.events.push(TimelineEvent {
                                kind: EventKind::ProgramChange,
                                tick: abs_tick,
                                seconds: 0.0,
                                channel: ch as i8,
                                track_index,
                                data1: program.as_int(),
                                data2: 0,
                            });
                        }
                        MidiMessage::Controller { controller, value } => {
                            track.events.push(TimelineEvent {
                                kind: EventKind::ControlChange,
                                tick: abs_tick,
                                seconds: 0.0,
                                channel: ch as i8,
                                track_index,
                                data1: controller.as_int(),
                                data2: value.as_int(),
                            });
                        }
                        MidiMessage::PitchBend { bend } => {
                            let raw = bend.0.as_int();
                            track.events.push(TimelineEvent {
                                kind: EventKind::PitchBend,
                                tick: abs_tick,
                                seconds: 0.0,
                                channel: ch as i8,
                                track_index,
                                data1: (raw & 0x7F) as u8,
                                data2: (raw >> 7) as u8,
                            });
                        }
                        _ => {}
                    }
                }
                TrackEventKind::Meta(meta) => match meta {
                    MetaMessage::TrackName(name) => {
                        if track.name.is_empty() {
                            track.name = String::from_utf8_lossy(name).into_owned();
                            debug!("Track {} name: {}", track_index, track.name);
                        }
                    }
                    MetaMessage::Tempo(_) => {
                        track.events.push(meta_event(EventKind::Tempo, abs_tick, track_index));
                    }
                    MetaMessage::TimeSignature(..) => {
                        track
                            .events
                            .push(meta_event(EventKind::TimeSignature, abs_tick, track_index));
                    }
                    MetaMessage::EndOfTrack => {
                        track
                            .events
                            .push(meta_event(EventKind::EndOfTrack, abs_tick, track_index));
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        // Unpaired note-ons are tolerated; the timeline keeps the note-on
        // event but no paired note is produced.
        for ((ch, key), (_, start_tick)) in pending.drain() {
            debug!(
                "Unclosed note-on for {} ch{} at tick {} in track {}",
                key, ch, start_tick, track_index
            );
        }

        track.notes.sort_by_key(|n| n.start_tick);
        track.events.sort_by_key(TimelineEvent::sort_key);
        tempo_map.apply_times_to_events(&mut track.events);
        tempo_map.apply_times_to_notes(&mut track.notes);

        total_ticks = total_ticks.max(abs_tick);
        tracks.push(track);
    }

    let mut timeline: Vec<TimelineEvent> = tracks
        .iter()
        .flat_map(|t| t.events.iter().copied())
        .collect();
    timeline.sort_by_key(TimelineEvent::sort_key);

    let total_seconds = tempo_map.tick_to_seconds(total_ticks);

    Ok(Song {
        file_name: file_name.to_string(),
        format,
        ticks_per_beat,
        tracks,
        timeline,
        tempo_changes: tempo_map.changes().to_vec(),
        time_signature_changes,
        total_ticks,
        total_seconds,
    })
}

fn close_note(
    track: &mut Track,
    pending: &mut HashMap<(u8, u8), (u8, u64)>,
    ch: u8,
    key: u8,
    abs_tick: u64,
) {
    if let Some((velocity, start_tick)) = pending.remove(&(ch, key)) {
        track.notes.push(Note {
            note_number: key,
            velocity,
            channel: ch,
            start_tick,
            end_tick: abs_tick,
            start_seconds: 0.0,
            end_seconds: 0.0,
        });
    } else {
        debug!("Orphaned note-off for {} ch{} at tick {}..!", key, ch, abs_tick);
    }
}

fn meta_event(kind: EventKind, tick: u64, track_index: usize) -> TimelineEvent {
    TimelineEvent {
        kind,
        tick,
        seconds: 0.0,
        channel: -1,
        track_index,
        data1: 0,
        data2: 0,
    }
}
