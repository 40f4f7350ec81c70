use crate::model::song::{Note, TempoChange, TimelineEvent};

pub const DEFAULT_MICROS_PER_BEAT: u32 = 500_000;
const MICROS_PER_SECOND: f64 = 1_000_000.0;
const MICROSECONDS_PER_MINUTE: f64 = 60_000_000.0;

/// Bidirectional tick/seconds mapping under piecewise-constant tempo.
///
/// Each segment stores the absolute wall-clock second at which it begins,
/// computed from the preceding segment's tempo, so conversions inside a
/// segment are a single linear step. All arithmetic is `f64`.
#[derive(Debug, Clone)]
pub struct TempoMap {
    ticks_per_beat: f64,
    changes: Vec<TempoChange>,
}

impl TempoMap {
    /// Builds the map from a sorted, strictly-increasing change list.
    /// A missing entry at tick 0 gets the 500000 us/beat default.
    pub fn new(ticks_per_beat: u32, mut changes: Vec<TempoChange>) -> Self {
        if changes.first().map_or(true, |c| c.tick != 0) {
            changes.insert(
                0,
                TempoChange {
                    tick: 0,
                    seconds: 0.0,
                    microseconds_per_beat: DEFAULT_MICROS_PER_BEAT,
                },
            );
        }

        let ticks_per_beat = f64::from(ticks_per_beat.max(1));
        let mut seconds = 0.0;
        let mut prev_tick = 0u64;
        let mut prev_micros = changes[0].microseconds_per_beat;

        for change in changes.iter_mut() {
            seconds += (change.tick - prev_tick) as f64 * f64::from(prev_micros)
                / (ticks_per_beat * MICROS_PER_SECOND);
            change.seconds = seconds;
            prev_tick = change.tick;
            prev_micros = change.microseconds_per_beat;
        }

        Self {
            ticks_per_beat,
            changes,
        }
    }

    pub fn changes(&self) -> &[TempoChange] {
        &self.changes
    }

    pub fn tick_to_seconds(&self, tick: u64) -> f64 {
        let segment = &self.changes[self.segment_for_tick(tick)];
        segment.seconds
            + (tick - segment.tick) as f64 * f64::from(segment.microseconds_per_beat)
                / (self.ticks_per_beat * MICROS_PER_SECOND)
    }

    pub fn seconds_to_tick(&self, seconds: f64) -> u64 {
        if seconds <= 0.0 {
            return 0;
        }
        let index = self
            .changes
            .partition_point(|c| c.seconds <= seconds)
            .saturating_sub(1);
        let segment = &self.changes[index];
        let ticks = (seconds - segment.seconds) * self.ticks_per_beat * MICROS_PER_SECOND
            / f64::from(segment.microseconds_per_beat);
        segment.tick + ticks.round() as u64
    }

    pub fn bpm_at_tick(&self, tick: u64) -> f64 {
        let segment = &self.changes[self.segment_for_tick(tick)];
        MICROSECONDS_PER_MINUTE / f64::from(segment.microseconds_per_beat)
    }

    /// Fills `seconds` on already-sorted events with a single sequential
    /// walk, advancing the segment cursor monotonically. Compilation is
    /// required to use this path rather than per-event binary search.
    pub fn apply_times_to_events(&self, events: &mut [TimelineEvent]) {
        let mut segment = 0usize;
        for event in events.iter_mut() {
            segment = self.advance_segment(segment, event.tick);
            event.seconds = self.seconds_in_segment(segment, event.tick);
        }
    }

    /// Same sequential walk over notes sorted by `start_tick`. End ticks
    /// are not monotone across notes, so each end is resolved by a local
    /// forward scan from the start's segment without moving the cursor.
    pub fn apply_times_to_notes(&self, notes: &mut [Note]) {
        let mut segment = 0usize;
        for note in notes.iter_mut() {
            segment = self.advance_segment(segment, note.start_tick);
            note.start_seconds = self.seconds_in_segment(segment, note.start_tick);
            let end_segment = self.advance_segment(segment, note.end_tick);
            note.end_seconds = self.seconds_in_segment(end_segment, note.end_tick);
        }
    }

    fn segment_for_tick(&self, tick: u64) -> usize {
        self.changes
            .partition_point(|c| c.tick <= tick)
            .saturating_sub(1)
    }

    fn advance_segment(&self, mut segment: usize, tick: u64) -> usize {
        while segment + 1 < self.changes.len() && self.changes[segment + 1].tick <= tick {
            segment += 1;
        }
        segment
    }

    fn seconds_in_segment(&self, segment: usize, tick: u64) -> f64 {
        let change = &self.changes[segment];
        change.seconds
            + (tick - change.tick) as f64 * f64::from(change.microseconds_per_beat)
                / (self.ticks_per_beat * MICROS_PER_SECOND)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn change(tick: u64, micros: u32) -> TempoChange {
        TempoChange {
            tick,
            seconds: 0.0,
            microseconds_per_beat: micros,
        }
    }

    #[test]
    fn single_tempo_mapping() {
        env_logger::try_init().unwrap_or(());

        let map = TempoMap::new(480, vec![change(0, 500_000)]);
        assert_eq!(map.tick_to_seconds(480), 0.5);
        assert_eq!(map.tick_to_seconds(960), 1.0);
        assert_eq!(map.bpm_at_tick(0), 120.0);
    }

    #[test]
    fn tempo_change_mid_song() {
        env_logger::try_init().unwrap_or(());

        // 120 BPM for two beats, then 240 BPM.
        let map = TempoMap::new(480, vec![change(0, 500_000), change(960, 250_000)]);
        assert_eq!(map.tick_to_seconds(960), 1.0);
        assert_eq!(map.tick_to_seconds(1440), 1.25);
        assert_eq!(map.bpm_at_tick(959), 120.0);
        assert_eq!(map.bpm_at_tick(960), 240.0);
    }

    #[test]
    fn missing_anchor_gets_default_tempo() {
        let map = TempoMap::new(480, vec![change(960, 250_000)]);
        assert_eq!(map.changes()[0].microseconds_per_beat, DEFAULT_MICROS_PER_BEAT);
        assert_eq!(map.tick_to_seconds(960), 1.0);
    }

    #[test]
    fn segment_seconds_are_consistent() {
        let map = TempoMap::new(
            96,
            vec![change(0, 600_000), change(384, 300_000), change(768, 1_000_000)],
        );

        for pair in map.changes().windows(2) {
            let expected = (pair[1].tick - pair[0].tick) as f64
                * f64::from(pair[0].microseconds_per_beat)
                / (96.0 * 1_000_000.0);
            assert_eq!(pair[1].seconds - pair[0].seconds, expected);
        }
    }

    #[test]
    fn seconds_to_tick_inverts_tick_to_seconds() {
        let map = TempoMap::new(
            480,
            vec![change(0, 500_000), change(960, 250_000), change(1920, 750_000)],
        );

        for tick in 0..=2400u64 {
            assert_eq!(map.seconds_to_tick(map.tick_to_seconds(tick)), tick);
        }
    }

    #[test]
    fn seconds_before_zero_clamp_to_tick_zero() {
        let map = TempoMap::new(480, vec![change(0, 500_000)]);
        assert_eq!(map.seconds_to_tick(-1.0), 0);
        assert_eq!(map.seconds_to_tick(0.0), 0);
    }

    #[test]
    fn sequential_walk_matches_binary_search() {
        let map = TempoMap::new(
            480,
            vec![change(0, 500_000), change(960, 250_000), change(1920, 750_000)],
        );

        let mut events: Vec<TimelineEvent> = (0..50)
            .map(|i| TimelineEvent {
                kind: crate::model::song::EventKind::NoteOn,
                tick: i * 60,
                seconds: 0.0,
                channel: 0,
                track_index: 0,
                data1: 60,
                data2: 100,
            })
            .collect();
        map.apply_times_to_events(&mut events);

        for event in &events {
            assert_eq!(event.seconds, map.tick_to_seconds(event.tick));
        }

        let mut notes = vec![
            Note {
                note_number: 60,
                velocity: 100,
                channel: 0,
                start_tick: 0,
                end_tick: 2400,
                start_seconds: 0.0,
                end_seconds: 0.0,
            },
            Note {
                note_number: 62,
                velocity: 100,
                channel: 0,
                start_tick: 480,
                end_tick: 600,
                start_seconds: 0.0,
                end_seconds: 0.0,
            },
        ];
        map.apply_times_to_notes(&mut notes);

        for note in &notes {
            assert_eq!(note.start_seconds, map.tick_to_seconds(note.start_tick));
            assert_eq!(note.end_seconds, map.tick_to_seconds(note.end_tick));
            assert!(note.end_seconds >= note.start_seconds);
        }
    }
}
