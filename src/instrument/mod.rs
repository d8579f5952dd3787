/// Instrument handle contract plus the fixed row-to-pitch tables for each
/// track kind. The transport only ever talks to instruments through this
/// trait, so backend quirks stay out of the tick loop.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::track::TrackKind;

/// A sound-producing object a track's events are routed to. Calls are
/// fire-and-forget from the scheduler's perspective; `delay` is how far in
/// the future the note should start (lookahead), which backends apply as
/// precisely as they can. Any call may fail (device gone, port closed) -
/// the caller is expected to log and carry on, never to abort a tick.
pub trait InstrumentHandle: Send {
    fn trigger_attack(&mut self, pitch: u8, delay: Duration, velocity: f32) -> Result<()>;

    /// Release a named voice, or the most recent one when `pitch` is None.
    fn trigger_release(&mut self, pitch: Option<u8>, delay: Duration) -> Result<()>;

    /// Attack plus scheduled release in one call. Multiple pitches sound
    /// as a simultaneous chord.
    fn trigger_attack_release(
        &mut self,
        pitches: &[u8],
        duration: Duration,
        delay: Duration,
        velocity: f32,
    ) -> Result<()>;

    /// Best-effort "stop everything now". Must not fail just because
    /// nothing is sounding.
    fn release_all(&mut self) -> Result<()>;
}

/// Shared, swappable handle slot. The mutex also serializes handle
/// replacement against the transport tick, so a handle is never swapped
/// out from under a trigger in flight.
pub type SharedHandle = Arc<Mutex<Box<dyn InstrumentHandle>>>;

pub fn shared(handle: impl InstrumentHandle + 'static) -> SharedHandle {
    Arc::new(Mutex::new(Box::new(handle)))
}

/// One handle slot per track kind. Cloning shares the slots.
#[derive(Clone)]
pub struct InstrumentRack {
    drums: SharedHandle,
    bass: SharedHandle,
    rhythm: SharedHandle,
    lead: SharedHandle,
}

impl InstrumentRack {
    pub fn new(
        drums: SharedHandle,
        bass: SharedHandle,
        rhythm: SharedHandle,
        lead: SharedHandle,
    ) -> Self {
        Self {
            drums,
            bass,
            rhythm,
            lead,
        }
    }

    pub fn handle(&self, kind: TrackKind) -> &SharedHandle {
        match kind {
            TrackKind::Drums => &self.drums,
            TrackKind::Bass => &self.bass,
            TrackKind::Rhythm => &self.rhythm,
            TrackKind::Lead => &self.lead,
        }
    }

    /// Replace the handle for one kind. Blocks until any in-flight trigger
    /// on the old handle completes.
    pub fn set_handle(&self, kind: TrackKind, handle: Box<dyn InstrumentHandle>) {
        *self.handle(kind).lock().unwrap() = handle;
    }

    /// Best-effort release on every handle; failures are logged, never
    /// propagated.
    pub fn release_all(&self) {
        for kind in TrackKind::TICK_ORDER {
            if let Err(err) = self.handle(kind).lock().unwrap().release_all() {
                log::warn!("{} release-all failed: {:#}", kind.label(), err);
            }
        }
    }
}

/// Drum rows map to the sampler notes the original kit used.
const DRUM_PITCHES: [u8; 4] = [36, 38, 40, 41]; // C2 D2 E2 F2

/// MIDI note for row `index` of a track kind. Bass rows are the C2..B2
/// chromatic octave, rhythm C3..B3, lead C4..B5.
pub fn row_pitch(kind: TrackKind, index: usize) -> u8 {
    debug_assert!(index < kind.rows(), "row index out of range");
    match kind {
        TrackKind::Drums => DRUM_PITCHES[index],
        TrackKind::Bass => 36 + index as u8,
        TrackKind::Rhythm => 48 + index as u8,
        TrackKind::Lead => 60 + index as u8,
    }
}

pub fn row_label(kind: TrackKind, index: usize) -> String {
    match kind {
        TrackKind::Drums => ["Kick", "Snare", "Hat", "Open"][index].to_string(),
        _ => midi_note_name(row_pitch(kind, index)),
    }
}

/// Loudness normalization for chords: each extra simultaneous voice gets
/// proportionally less velocity, floored so no note becomes inaudible.
pub fn chord_velocity(voice_count: usize) -> f32 {
    (1.0 / voice_count.max(1) as f32).max(0.05)
}

pub fn midi_note_to_frequency(note: u8) -> f32 {
    440.0 * 2.0_f32.powf((note as f32 - 69.0) / 12.0)
}

pub fn midi_note_name(note: u8) -> String {
    let note_names = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    let octave = (note / 12) as i32 - 1;
    let note_index = (note % 12) as usize;
    format!("{}{}", note_names[note_index], octave)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_pitch_tables() {
        assert_eq!(row_pitch(TrackKind::Drums, 0), 36);
        assert_eq!(row_pitch(TrackKind::Drums, 3), 41);
        assert_eq!(row_pitch(TrackKind::Bass, 0), 36);
        assert_eq!(row_pitch(TrackKind::Bass, 11), 47);
        assert_eq!(row_pitch(TrackKind::Rhythm, 0), 48);
        assert_eq!(row_pitch(TrackKind::Lead, 23), 83);
    }

    #[test]
    fn test_chord_velocity_normalization() {
        assert_eq!(chord_velocity(1), 1.0);
        assert_eq!(chord_velocity(2), 0.5);
        assert_eq!(chord_velocity(3), 1.0 / 3.0);
        // Floor keeps huge chords audible.
        assert_eq!(chord_velocity(40), 0.05);
        assert_eq!(chord_velocity(0), 1.0);
    }

    #[test]
    fn test_note_names() {
        assert_eq!(midi_note_name(60), "C4");
        assert_eq!(midi_note_name(36), "C2");
        assert_eq!(row_label(TrackKind::Drums, 1), "Snare");
        assert_eq!(row_label(TrackKind::Lead, 0), "C4");
    }
}
