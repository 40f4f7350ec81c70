use accompanist::{
    format_clock, import_midi_file, Args, ConsoleSynth, PlaybackState, Player,
};
use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("Importing MIDI file: '{}'...", args.midi.display());
    let song = import_midi_file(&args.midi)?;

    info!(
        "Compiled '{}': format {}, {} ticks/beat, {} tracks, {} notes, {} ({} tempo changes)",
        song.file_name,
        song.format,
        song.ticks_per_beat,
        song.tracks.len(),
        song.note_count(),
        format_clock(song.total_seconds),
        song.tempo_changes.len()
    );
    for track in &song.tracks {
        info!(
            "  track {}: '{}' | {} notes | channels {:?} | programs {:?}",
            track.index,
            if track.name.is_empty() { "<unnamed>" } else { track.name.as_str() },
            track.notes.len(),
            track.channels,
            track.program_by_channel
        );
    }

    if let Some(path) = &args.export_json {
        let json = serde_json::to_string_pretty(&song)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Exported song JSON to '{}'..!", path.display());
        return Ok(());
    }

    if args.dry_run {
        info!("Previewing at most {} events..!", args.dry_run_max);
        for (i, event) in song.timeline.iter().enumerate() {
            if i >= args.dry_run_max {
                break;
            }
            info!(
                "Event {}: {:?} tick={} t={} ch={} track={} data=({}, {})",
                i,
                event.kind,
                event.tick,
                format_clock(event.seconds),
                event.channel,
                event.track_index,
                event.data1,
                event.data2
            );
        }
        return Ok(());
    }

    let player = Player::new(ConsoleSynth::new());
    if let Some(soundfont) = &args.soundfont {
        if let Err(why) = player.load_soundfont(soundfont) {
            warn!("Soundfont load failed, playing without it: {}", why);
        }
    }

    player.load_song(song);
    player.set_speed(args.speed);
    for track_index in &args.mute {
        player.toggle_track_mute(*track_index);
    }

    let player = Arc::new(player);
    let player_for_handler = Arc::clone(&player);
    ctrlc::set_handler(move || {
        warn!("Ctrl-C received, stopping playback..!");
        player_for_handler.stop();
    })
    .expect("Error setting Ctrl-C handler..!");

    player.play();
    while player.state() != PlaybackState::Stopped {
        thread::sleep(Duration::from_millis(50));
    }

    player.shutdown();
    info!("Playback finished, exiting..!");

    Ok(())
}
