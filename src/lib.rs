/// beatgrid - a step-sequencer drum machine core
///
/// The library provides the pieces the GUI binary is assembled from:
/// - Track model and editing engine for point/span note events
/// - Transport scheduler walking the shared loop with lookahead timing
/// - Instrument handle contract plus cpal synth and midir MIDI backends
/// - A session aggregate tying tracks, transport and instruments together

pub mod audio;
pub mod instrument;
pub mod midi;
pub mod session;
pub mod track;
pub mod transport;

// Re-export commonly used types
pub use audio::{AudioEngine, SynthHandle, SynthProfile, Waveform};
pub use instrument::{
    chord_velocity, midi_note_name, midi_note_to_frequency, row_label, row_pitch, shared,
    InstrumentHandle, InstrumentRack, SharedHandle,
};
pub use midi::MidiHandle;
pub use session::SequencerSession;
pub use track::{EditOutcome, Event, Patterns, Track, TrackKind, STEPS_PER_BAR};
pub use transport::{Transport, TransportEvent, MAX_BPM, MIN_BPM};
