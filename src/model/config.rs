use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "accompanist",
    about = "Inspect and play a MIDI file through the accompaniment engine"
)]
pub struct Args {
    /// Path to the target MIDI file.
    pub midi: PathBuf,

    /// Dry run (print the first dry_run_max timeline events and exit).
    #[arg(short, long, default_value_t = false)]
    pub dry_run: bool,

    /// Maximum events to print in dry run.
    #[arg(long, default_value_t = 80)]
    pub dry_run_max: usize,

    /// Playback speed factor, clamped to [0.25, 4.0].
    #[arg(short, long, default_value_t = 1.0)]
    pub speed: f64,

    /// Track index to mute before playback. Repeatable.
    #[arg(short, long = "mute")]
    pub mute: Vec<usize>,

    /// Soundfont to load into the synth before playback.
    #[arg(long)]
    pub soundfont: Option<PathBuf>,

    /// Write the compiled song as JSON to this path and exit.
    #[arg(long = "export-json")]
    pub export_json: Option<PathBuf>,
}
