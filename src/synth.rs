use log::{debug, info};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SynthError {
    #[error("soundfont load failed: {0}")]
    SoundFontLoad(String),
    #[error("synth backend error: {0}")]
    Backend(String),
}

/// Abstract sink for MIDI commands.
///
/// The three realtime operations must not block; failures there are the
/// implementation's to swallow. A failed `load_soundfont` is non-fatal
/// for the engine: playback still advances, but `note_on` stays a no-op
/// until `is_ready` reports true.
pub trait Synth: Send + Sync {
    fn load_soundfont(&self, path: &Path) -> Result<(), SynthError>;

    fn set_instrument(&self, channel: u8, bank: u8, program: u8);

    fn note_on(&self, channel: u8, note: u8, velocity: u8);

    fn note_off(&self, channel: u8, note: u8);

    fn all_notes_off(&self);

    fn is_ready(&self) -> bool;

    /// Silences everything and releases native resources. Called once,
    /// after which no other operation may be issued.
    fn shutdown(&self) {
        self.all_notes_off();
    }
}

/// Synth stand-in that logs commands instead of producing audio.
/// Lets the player run end-to-end without an audio backend.
#[derive(Debug)]
pub struct ConsoleSynth {
    ready: AtomicBool,
}

impl Default for ConsoleSynth {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleSynth {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(true),
        }
    }
}

impl Synth for ConsoleSynth {
    fn load_soundfont(&self, path: &Path) -> Result<(), SynthError> {
        info!("Pretending to load soundfont '{}'..!", path.display());
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn set_instrument(&self, channel: u8, bank: u8, program: u8) {
        debug!("set_instrument ch{} bank{} program{}", channel, bank, program);
    }

    fn note_on(&self, channel: u8, note: u8, velocity: u8) {
        debug!("note_on ch{} note{} vel{}", channel, note, velocity);
    }

    fn note_off(&self, channel: u8, note: u8) {
        debug!("note_off ch{} note{}", channel, note);
    }

    fn all_notes_off(&self) {
        debug!("all_notes_off");
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
