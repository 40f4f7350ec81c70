use crate::model::song::{EventKind, Song, TimelineEvent};
use crate::synth::{Synth, SynthError};
use crate::tempo_map::TempoMap;
use log::{debug, info, warn};
use spin_sleep::{SpinSleeper, SpinStrategy};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const MIN_SPEED: f64 = 0.25;
pub const MAX_SPEED: f64 = 4.0;

const TICK_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

enum ControlMsg {
    Resume,
    Pause,
    Stop,
}

#[derive(Debug, Clone, Copy)]
struct TrackControl {
    muted: bool,
    volume: f64,
}

/// Playback core: position, cursor, speed and per-track controls.
///
/// Everything lives behind one mutex shared by the ticker thread and the
/// transport API, which serializes external mutators with dispatch. No
/// two events are ever dispatched concurrently.
struct Transport {
    song: Option<Arc<Song>>,
    tempo: Option<TempoMap>,
    state: PlaybackState,
    current_seconds: f64,
    cursor: usize,
    speed: f64,
    controls: Vec<TrackControl>,
}

impl Transport {
    fn new() -> Self {
        Self {
            song: None,
            tempo: None,
            state: PlaybackState::Stopped,
            current_seconds: 0.0,
            cursor: 0,
            speed: 1.0,
            controls: Vec::new(),
        }
    }

    fn load(&mut self, song: Arc<Song>) {
        self.controls = song
            .tracks
            .iter()
            .map(|t| TrackControl {
                muted: t.is_muted,
                volume: t.volume,
            })
            .collect();
        self.tempo = Some(TempoMap::new(song.ticks_per_beat, song.tempo_changes.clone()));
        self.song = Some(song);
        self.state = PlaybackState::Stopped;
        self.current_seconds = 0.0;
        self.cursor = 0;
    }

    /// One ticker step: advance the playhead by scaled wall time and
    /// dispatch every due event in timeline order. Returns true when the
    /// end of the song was reached.
    fn advance(&mut self, delta_wall: f64, synth: &dyn Synth) -> bool {
        if self.state != PlaybackState::Playing {
            return false;
        }
        let song = match &self.song {
            Some(song) => Arc::clone(song),
            None => return false,
        };

        self.current_seconds += delta_wall * self.speed;
        if self.current_seconds >= song.total_seconds {
            self.halt(synth);
            return true;
        }

        while let Some(event) = song.timeline.get(self.cursor) {
            if event.seconds > self.current_seconds {
                break;
            }
            self.dispatch(event, synth);
            self.cursor += 1;
        }

        false
    }

    fn dispatch(&self, event: &TimelineEvent, synth: &dyn Synth) {
        match event.kind {
            EventKind::NoteOn => {
                let Some(control) = self.controls.get(event.track_index) else {
                    warn!("Event for unknown track {}..!", event.track_index);
                    return;
                };
                if control.muted {
                    return;
                }
                let velocity =
                    (f64::from(event.data2) * control.volume).round().clamp(0.0, 127.0) as u8;
                if velocity == 0 {
                    return;
                }
                synth.note_on(event.channel as u8, event.data1, velocity);
            }
            // Offs go through even for muted tracks so a mute toggled
            // mid-note can never leave it hanging.
            EventKind::NoteOff => synth.note_off(event.channel as u8, event.data1),
            EventKind::ProgramChange => synth.set_instrument(event.channel as u8, 0, event.data1),
            // The synth abstraction is intentionally minimal; everything
            // else is dropped.
            _ => {}
        }
    }

    fn seek(&mut self, seconds: f64, synth: &dyn Synth) {
        let song = match &self.song {
            Some(song) => Arc::clone(song),
            None => return,
        };

        self.current_seconds = seconds.clamp(0.0, song.total_seconds);
        synth.all_notes_off();
        self.cursor = song
            .timeline
            .partition_point(|e| e.seconds <= self.current_seconds);

        // Replay skipped program changes so channels land on the right
        // instrument after the jump.
        for event in &song.timeline[..self.cursor] {
            if event.kind == EventKind::ProgramChange {
                synth.set_instrument(event.channel as u8, 0, event.data1);
            }
        }

        debug!(
            "Seeked to {:.3}s (cursor {} of {})",
            self.current_seconds,
            self.cursor,
            song.timeline.len()
        );
    }

    fn halt(&mut self, synth: &dyn Synth) {
        self.state = PlaybackState::Stopped;
        self.current_seconds = 0.0;
        self.cursor = 0;
        synth.all_notes_off();
    }

    fn total_seconds(&self) -> f64 {
        self.song.as_ref().map_or(0.0, |s| s.total_seconds)
    }

    fn bpm(&self) -> Option<f64> {
        let tempo = self.tempo.as_ref()?;
        Some(tempo.bpm_at_tick(tempo.seconds_to_tick(self.current_seconds)))
    }
}

/// Time-driven event dispatcher over a compiled song.
///
/// A worker thread ticks every 5 ms while playing; `play`, `pause`,
/// `stop`, `seek` and the track controls are safe to call from any
/// thread. Synth failures never halt the playhead.
pub struct Player<S: Synth> {
    synth: Arc<S>,
    transport: Arc<Mutex<Transport>>,
    control_tx: Mutex<Option<Sender<ControlMsg>>>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Synth + 'static> Player<S> {
    pub fn new(synth: S) -> Self {
        Self {
            synth: Arc::new(synth),
            transport: Arc::new(Mutex::new(Transport::new())),
            control_tx: Mutex::new(None),
            worker_handle: Mutex::new(None),
        }
    }

    /// Replaces the loaded song, stopping any current playback.
    pub fn load_song(&self, song: Song) {
        self.stop();
        let name = song.file_name.clone();
        let events = song.timeline.len();
        self.transport.lock().unwrap().load(Arc::new(song));
        info!("Loaded song '{}' with {} timeline events..!", name, events);
    }

    pub fn load_soundfont(&self, path: &Path) -> Result<(), SynthError> {
        self.synth.load_soundfont(path)
    }

    /// Starts or resumes playback. Silently ignored when no song is
    /// loaded, the synth is not ready, or playback is already running.
    pub fn play(&self) {
        {
            let mut transport = self.transport.lock().unwrap();
            match transport.state {
                PlaybackState::Playing => return,
                PlaybackState::Paused => {
                    transport.state = PlaybackState::Playing;
                    drop(transport);
                    self.send(ControlMsg::Resume);
                    debug!("Playback resumed");
                    return;
                }
                PlaybackState::Stopped => {
                    if transport.song.is_none() {
                        debug!("play ignored: no song loaded..!");
                        return;
                    }
                    if !self.synth.is_ready() {
                        debug!("play ignored: synth is not ready..!");
                        return;
                    }
                    transport.state = PlaybackState::Playing;
                }
            }
        }

        // A previous worker that ran to the end of the song has already
        // exited; reap it before spawning the next one.
        if let Some(handle) = self.worker_handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        let (tx, rx) = mpsc::channel();
        *self.control_tx.lock().unwrap() = Some(tx);

        let transport = Arc::clone(&self.transport);
        let synth = Arc::clone(&self.synth);
        let handle = thread::spawn(move || run_ticker(transport, synth, rx));
        *self.worker_handle.lock().unwrap() = Some(handle);
        info!("Playback started..!");
    }

    pub fn pause(&self) {
        {
            let mut transport = self.transport.lock().unwrap();
            if transport.state != PlaybackState::Playing {
                return;
            }
            transport.state = PlaybackState::Paused;
        }
        self.send(ControlMsg::Pause);
        self.synth.all_notes_off();
        info!("Playback paused..!");
    }

    /// Stops playback and rewinds. Returns after the ticker has halted.
    pub fn stop(&self) {
        let tx = self.control_tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(ControlMsg::Stop);
        }
        if let Some(handle) = self.worker_handle.lock().unwrap().take() {
            let _ = handle.join();
            debug!("Playback thread joined..!");
        }
        self.transport.lock().unwrap().halt(self.synth.as_ref());
    }

    pub fn seek(&self, seconds: f64) {
        self.transport
            .lock()
            .unwrap()
            .seek(seconds, self.synth.as_ref());
    }

    pub fn set_speed(&self, factor: f64) {
        let clamped = factor.clamp(MIN_SPEED, MAX_SPEED);
        self.transport.lock().unwrap().speed = clamped;
        debug!("Playback speed set to {:.3}", clamped);
    }

    pub fn speed(&self) -> f64 {
        self.transport.lock().unwrap().speed
    }

    pub fn toggle_track_mute(&self, track_index: usize) {
        let mut transport = self.transport.lock().unwrap();
        let Some(control) = transport.controls.get_mut(track_index) else {
            warn!("toggle_track_mute: no track {}..!", track_index);
            return;
        };
        control.muted = !control.muted;
        let muted = control.muted;
        // Silence whatever the track had sounding; its future note-offs
        // still go through.
        if muted && transport.state == PlaybackState::Playing {
            self.synth.all_notes_off();
        }
        info!("Track {} {}..!", track_index, if muted { "muted" } else { "unmuted" });
    }

    pub fn set_track_volume(&self, track_index: usize, volume: f64) {
        let mut transport = self.transport.lock().unwrap();
        let Some(control) = transport.controls.get_mut(track_index) else {
            warn!("set_track_volume: no track {}..!", track_index);
            return;
        };
        control.volume = volume.clamp(0.0, 1.0);
    }

    pub fn is_track_muted(&self, track_index: usize) -> Option<bool> {
        self.transport
            .lock()
            .unwrap()
            .controls
            .get(track_index)
            .map(|c| c.muted)
    }

    pub fn state(&self) -> PlaybackState {
        self.transport.lock().unwrap().state
    }

    pub fn current_seconds(&self) -> f64 {
        self.transport.lock().unwrap().current_seconds
    }

    pub fn progress(&self) -> f64 {
        let transport = self.transport.lock().unwrap();
        let total = transport.total_seconds();
        if total <= 0.0 {
            0.0
        } else {
            (transport.current_seconds / total).clamp(0.0, 1.0)
        }
    }

    pub fn current_bpm(&self) -> Option<f64> {
        self.transport.lock().unwrap().bpm()
    }

    /// Final teardown: halts playback and releases the synth's native
    /// resources. The player must not be used afterwards.
    pub fn shutdown(&self) {
        self.stop();
        self.synth.shutdown();
    }

    fn send(&self, msg: ControlMsg) {
        if let Some(tx) = self.control_tx.lock().unwrap().as_ref() {
            let _ = tx.send(msg);
        }
    }
}

fn run_ticker<S: Synth>(
    transport: Arc<Mutex<Transport>>,
    synth: Arc<S>,
    rx: Receiver<ControlMsg>,
) {
    let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
    let mut last_wall = Instant::now();
    let mut paused = false;

    loop {
        while let Ok(msg) = rx.try_recv() {
            match msg {
                ControlMsg::Stop => return,
                ControlMsg::Pause => paused = true,
                ControlMsg::Resume => {
                    paused = false;
                    last_wall = Instant::now();
                }
            }
        }

        if paused {
            // Ticker idles here until resumed or stopped.
            match rx.recv() {
                Ok(ControlMsg::Resume) => {
                    paused = false;
                    last_wall = Instant::now();
                }
                Ok(ControlMsg::Pause) => {}
                Ok(ControlMsg::Stop) | Err(_) => return,
            }
            continue;
        }

        let now = Instant::now();
        let delta = now.duration_since(last_wall).as_secs_f64();
        last_wall = now;

        let finished = transport
            .lock()
            .unwrap()
            .advance(delta, synth.as_ref());
        if finished {
            info!("Playback reached the end of the song..!");
            return;
        }

        sleeper.sleep(TICK_INTERVAL);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::song::{TempoChange, Track};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum SynthCall {
        NoteOn(u8, u8, u8),
        NoteOff(u8, u8),
        Instrument(u8, u8, u8),
        AllOff,
    }

    #[derive(Default, Clone)]
    struct MockSynth {
        calls: Arc<Mutex<Vec<SynthCall>>>,
    }

    impl MockSynth {
        fn calls(&self) -> Vec<SynthCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Synth for MockSynth {
        fn load_soundfont(&self, _path: &Path) -> Result<(), SynthError> {
            Ok(())
        }
        fn set_instrument(&self, channel: u8, bank: u8, program: u8) {
            self.calls
                .lock()
                .unwrap()
                .push(SynthCall::Instrument(channel, bank, program));
        }
        fn note_on(&self, channel: u8, note: u8, velocity: u8) {
            self.calls
                .lock()
                .unwrap()
                .push(SynthCall::NoteOn(channel, note, velocity));
        }
        fn note_off(&self, channel: u8, note: u8) {
            self.calls
                .lock()
                .unwrap()
                .push(SynthCall::NoteOff(channel, note));
        }
        fn all_notes_off(&self) {
            self.calls.lock().unwrap().push(SynthCall::AllOff);
        }
        fn is_ready(&self) -> bool {
            true
        }
    }

    fn event(
        kind: EventKind,
        tick: u64,
        channel: i8,
        track_index: usize,
        data1: u8,
        data2: u8,
    ) -> TimelineEvent {
        TimelineEvent {
            kind,
            tick,
            seconds: 0.0,
            channel,
            track_index,
            data1,
            data2,
        }
    }

    /// Builds a song at 120 BPM / 480 tpb from per-track event lists.
    fn song_with(per_track: Vec<Vec<TimelineEvent>>, total_ticks: u64) -> Song {
        let tempo_map = TempoMap::new(
            480,
            vec![TempoChange {
                tick: 0,
                seconds: 0.0,
                microseconds_per_beat: 500_000,
            }],
        );

        let mut tracks = Vec::new();
        let mut timeline = Vec::new();
        for (index, mut events) in per_track.into_iter().enumerate() {
            events.sort_by_key(TimelineEvent::sort_key);
            tempo_map.apply_times_to_events(&mut events);
            let mut track = Track::new(index);
            track.events = events.clone();
            timeline.extend(events);
            tracks.push(track);
        }
        timeline.sort_by_key(TimelineEvent::sort_key);

        Song {
            file_name: "test.mid".to_string(),
            format: 1,
            ticks_per_beat: 480,
            tracks,
            timeline,
            tempo_changes: tempo_map.changes().to_vec(),
            time_signature_changes: Vec::new(),
            total_ticks,
            total_seconds: tempo_map.tick_to_seconds(total_ticks),
        }
    }

    fn playing_transport(song: Song) -> Transport {
        let mut transport = Transport::new();
        transport.load(Arc::new(song));
        transport.state = PlaybackState::Playing;
        transport
    }

    #[test]
    fn dispatches_in_order_and_scales_velocity() {
        env_logger::try_init().unwrap_or(());

        let song = song_with(
            vec![vec![
                event(EventKind::NoteOn, 0, 0, 0, 60, 100),
                event(EventKind::NoteOff, 480, 0, 0, 60, 0),
            ]],
            960,
        );
        let synth = MockSynth::default();
        let mut transport = playing_transport(song);
        transport.controls[0].volume = 0.5;

        assert!(!transport.advance(0.6, &synth));
        assert_eq!(
            synth.calls(),
            vec![SynthCall::NoteOn(0, 60, 50), SynthCall::NoteOff(0, 60)]
        );
    }

    #[test]
    fn zero_scaled_velocity_is_dropped() {
        let song = song_with(vec![vec![event(EventKind::NoteOn, 0, 0, 0, 60, 100)]], 960);
        let synth = MockSynth::default();
        let mut transport = playing_transport(song);
        transport.controls[0].volume = 0.0;

        transport.advance(0.1, &synth);
        assert!(synth.calls().is_empty());
    }

    #[test]
    fn muted_track_keeps_siblings_on_shared_channel() {
        // Two tracks both talking to channel 0; muting one must not
        // silence the other, and its own note-offs must still go out.
        let song = song_with(
            vec![
                vec![
                    event(EventKind::NoteOn, 0, 0, 0, 60, 100),
                    event(EventKind::NoteOff, 480, 0, 0, 60, 0),
                ],
                vec![event(EventKind::NoteOn, 240, 0, 1, 64, 90)],
            ],
            960,
        );
        let synth = MockSynth::default();
        let mut transport = playing_transport(song);
        transport.controls[0].muted = true;

        transport.advance(0.6, &synth);
        assert_eq!(
            synth.calls(),
            vec![SynthCall::NoteOn(0, 64, 90), SynthCall::NoteOff(0, 60)]
        );
    }

    #[test]
    fn seek_reapplies_program_changes_once() {
        let song = song_with(
            vec![vec![
                event(EventKind::ProgramChange, 0, 0, 0, 41, 0),
                event(EventKind::NoteOn, 4800, 0, 0, 60, 100),
                event(EventKind::NoteOn, 5280, 0, 0, 62, 100),
            ]],
            5760,
        );
        let synth = MockSynth::default();
        let mut transport = playing_transport(song);

        // Jump past the first note before any playback.
        transport.seek(5.2, &synth);
        assert_eq!(
            synth.calls(),
            vec![SynthCall::AllOff, SynthCall::Instrument(0, 0, 41)]
        );

        // Only the note after the seek point is dispatched, with the
        // instrument applied before it.
        transport.advance(0.4, &synth);
        assert_eq!(
            synth.calls(),
            vec![
                SynthCall::AllOff,
                SynthCall::Instrument(0, 0, 41),
                SynthCall::NoteOn(0, 62, 100)
            ]
        );
    }

    #[test]
    fn no_event_before_seek_target_is_dispatched() {
        let song = song_with(
            vec![vec![
                event(EventKind::NoteOn, 0, 0, 0, 60, 100),
                event(EventKind::NoteOn, 480, 0, 0, 62, 100),
                event(EventKind::NoteOn, 960, 0, 0, 64, 100),
            ]],
            1920,
        );
        let synth = MockSynth::default();
        let mut transport = playing_transport(song);

        transport.seek(0.9, &synth);
        transport.advance(1.0, &synth);

        for call in synth.calls() {
            if let SynthCall::NoteOn(_, note, _) = call {
                assert_eq!(note, 64, "event from before the seek target leaked through");
            }
        }
    }

    #[test]
    fn end_of_song_halts_and_rewinds() {
        let song = song_with(vec![vec![event(EventKind::NoteOn, 0, 0, 0, 60, 100)]], 480);
        let synth = MockSynth::default();
        let mut transport = playing_transport(song);

        assert!(transport.advance(1.0, &synth));
        assert_eq!(transport.state, PlaybackState::Stopped);
        assert_eq!(transport.current_seconds, 0.0);
        assert_eq!(transport.cursor, 0);
        assert_eq!(synth.calls(), vec![SynthCall::AllOff]);
    }

    #[test]
    fn position_and_cursor_are_monotone_while_playing() {
        let song = song_with(
            vec![(0..20)
                .map(|i| event(EventKind::NoteOn, i * 96, 0, 0, 60, 100))
                .collect()],
            9600,
        );
        let synth = MockSynth::default();
        let mut transport = playing_transport(song);

        let mut last_seconds = 0.0;
        let mut last_cursor = 0;
        for _ in 0..50 {
            transport.advance(0.05, &synth);
            assert!(transport.current_seconds >= last_seconds);
            assert!(transport.cursor >= last_cursor);
            last_seconds = transport.current_seconds;
            last_cursor = transport.cursor;
        }
    }

    #[test]
    fn speed_scales_wall_clock() {
        let song = song_with(vec![Vec::new()], 9600);
        let synth = MockSynth::default();
        let mut transport = playing_transport(song);
        transport.speed = 2.0;

        transport.advance(0.5, &synth);
        assert_eq!(transport.current_seconds, 1.0);
    }

    #[test]
    fn player_speed_is_clamped() {
        let player = Player::new(MockSynth::default());
        player.set_speed(100.0);
        assert_eq!(player.speed(), MAX_SPEED);
        player.set_speed(0.0);
        assert_eq!(player.speed(), MIN_SPEED);
    }

    #[test]
    fn play_without_song_is_a_noop() {
        let player = Player::new(MockSynth::default());
        player.play();
        assert_eq!(player.state(), PlaybackState::Stopped);
    }

    #[test]
    fn player_transport_smoke() {
        env_logger::try_init().unwrap_or(());

        let synth = MockSynth::default();
        // One far-off note so the song cannot finish under the test.
        let song = song_with(vec![vec![event(EventKind::NoteOn, 9600, 0, 0, 60, 100)]], 9600);

        let player = Player::new(synth);
        player.load_song(song);

        player.play();
        assert_eq!(player.state(), PlaybackState::Playing);
        thread::sleep(Duration::from_millis(40));
        assert!(player.current_seconds() > 0.0);

        player.pause();
        assert_eq!(player.state(), PlaybackState::Paused);
        let at_pause = player.current_seconds();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(player.current_seconds(), at_pause);

        player.play();
        assert_eq!(player.state(), PlaybackState::Playing);

        player.stop();
        assert_eq!(player.state(), PlaybackState::Stopped);
        assert_eq!(player.current_seconds(), 0.0);
        assert!(player.progress() == 0.0);
    }
}
