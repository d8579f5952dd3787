/// Top-level aggregate owning the four tracks, the instrument rack and
/// the transport. The UI mutates tracks only through this type; the
/// transport thread shares the patterns behind the mutex.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::instrument::{row_pitch, InstrumentRack};
use crate::track::{EditOutcome, Event, Patterns, Track, TrackKind, STEPS_PER_BAR};
use crate::transport::{Transport, TransportEvent};

pub struct SequencerSession {
    patterns: Arc<Mutex<Patterns>>,
    rack: InstrumentRack,
    transport: Transport,
}

impl SequencerSession {
    pub fn new(bars: usize, rack: InstrumentRack) -> Self {
        let patterns = Arc::new(Mutex::new(Patterns::new(bars)));
        let transport = Transport::new(Arc::clone(&patterns), rack.clone());
        Self {
            patterns,
            rack,
            transport,
        }
    }

    // Transport lifecycle.

    pub fn start(&mut self) {
        self.transport.start();
    }

    pub fn stop(&mut self) {
        self.transport.stop();
    }

    pub fn is_running(&self) -> bool {
        self.transport.is_running()
    }

    pub fn bpm(&self) -> f32 {
        self.transport.bpm()
    }

    pub fn set_bpm(&self, bpm: f32) {
        self.transport.set_bpm(bpm);
    }

    pub fn poll_events(&self) -> Vec<TransportEvent> {
        self.transport.poll_events()
    }

    // Editing. Each operation returns what changed so the view can patch
    // itself without rescanning.

    pub fn toggle_single(&self, kind: TrackKind, step: usize, index: usize) -> EditOutcome {
        self.patterns
            .lock()
            .unwrap()
            .track_mut(kind)
            .toggle_single(step, index)
    }

    pub fn toggle_span(
        &self,
        kind: TrackKind,
        start_step: usize,
        end_step: usize,
        index: usize,
    ) -> EditOutcome {
        self.patterns
            .lock()
            .unwrap()
            .track_mut(kind)
            .toggle_span(start_step, end_step, index)
    }

    pub fn clear_track(&self, kind: TrackKind) -> Vec<Event> {
        // Also silence the instrument so a clear never leaves a span
        // ringing to its scheduled end.
        let removed = self.patterns.lock().unwrap().track_mut(kind).clear();
        if let Err(err) = self.rack.handle(kind).lock().unwrap().release_all() {
            log::warn!("{} release-all failed: {:#}", kind.label(), err);
        }
        removed
    }

    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        self.patterns
            .lock()
            .unwrap()
            .track_mut(kind)
            .set_enabled(enabled);
    }

    pub fn loop_bars(&self) -> usize {
        self.patterns.lock().unwrap().loop_length_steps() / STEPS_PER_BAR
    }

    /// Resize every track. The tick schedule is derived from the loop
    /// length, so a running transport is stopped first and restarted on
    /// the new length.
    pub fn set_loop_bars(&mut self, bars: usize) -> Vec<(TrackKind, Vec<Event>)> {
        debug_assert!(bars > 0);
        let was_running = self.is_running();
        if was_running {
            self.transport.stop();
        }
        let removed = self
            .patterns
            .lock()
            .unwrap()
            .set_loop_length_steps(bars * STEPS_PER_BAR);
        if was_running {
            self.transport.start();
        }
        removed
    }

    /// Live pad press: sound the row immediately and, while the transport
    /// runs, record it at the current step unless that cell is already
    /// occupied. Returns the recorded event, if any.
    pub fn pad_press(&self, kind: TrackKind, index: usize) -> Option<Event> {
        let pitch = row_pitch(kind, index);
        // An eighth note, matching the original pads' feel.
        let duration = Duration::from_secs_f64(60.0 / f64::from(self.bpm()) / 2.0);
        if let Err(err) = self.rack.handle(kind).lock().unwrap().trigger_attack_release(
            &[pitch],
            duration,
            Duration::ZERO,
            1.0,
        ) {
            log::warn!("{} pad trigger failed: {:#}", kind.label(), err);
        }

        if !self.is_running() {
            return None;
        }
        let step = self.transport.current_step();
        self.patterns
            .lock()
            .unwrap()
            .track_mut(kind)
            .record_point(step, index)
    }

    /// Read access for rendering: runs `f` with the track locked.
    pub fn with_track<R>(&self, kind: TrackKind, f: impl FnOnce(&Track) -> R) -> R {
        f(self.patterns.lock().unwrap().track(kind))
    }

    pub fn rack(&self) -> &InstrumentRack {
        &self.rack
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{shared, InstrumentHandle};
    use anyhow::Result;

    #[derive(Default)]
    struct Null;

    impl InstrumentHandle for Null {
        fn trigger_attack(&mut self, _: u8, _: Duration, _: f32) -> Result<()> {
            Ok(())
        }
        fn trigger_release(&mut self, _: Option<u8>, _: Duration) -> Result<()> {
            Ok(())
        }
        fn trigger_attack_release(&mut self, _: &[u8], _: Duration, _: Duration, _: f32) -> Result<()> {
            Ok(())
        }
        fn release_all(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn session(bars: usize) -> SequencerSession {
        SequencerSession::new(
            bars,
            InstrumentRack::new(
                shared(Null),
                shared(Null),
                shared(Null),
                shared(Null),
            ),
        )
    }

    #[test]
    fn test_edit_and_read_back() {
        let s = session(1);
        let out = s.toggle_single(TrackKind::Drums, 4, 2);
        assert!(out.added.is_some());
        assert!(s.with_track(TrackKind::Drums, |t| t.has_event_at(4, 2)));
    }

    #[test]
    fn test_pad_press_only_records_while_running() {
        let mut s = session(1);
        assert!(s.pad_press(TrackKind::Drums, 1).is_none());
        assert!(s.with_track(TrackKind::Drums, |t| t.events().is_empty()));

        s.start();
        let first = s.pad_press(TrackKind::Drums, 1);
        assert!(first.is_some());
        // Same cell twice does not duplicate.
        let step = first.unwrap().start();
        let again = s.pad_press(TrackKind::Drums, 1);
        if let Some(ev) = again {
            assert_ne!(ev.start(), step);
        }
        s.stop();
    }

    #[test]
    fn test_set_loop_bars_resizes_all_tracks() {
        let mut s = session(2);
        s.toggle_single(TrackKind::Drums, 20, 0);
        s.toggle_span(TrackKind::Bass, 14, 20, 3);
        let removed = s.set_loop_bars(1);
        let dropped_drums = removed
            .iter()
            .find(|(k, _)| *k == TrackKind::Drums)
            .map(|(_, evs)| evs.len())
            .unwrap();
        assert_eq!(dropped_drums, 1);
        assert_eq!(s.loop_bars(), 1);
        // The bass span survived, clamped to the new boundary.
        s.with_track(TrackKind::Bass, |t| {
            assert_eq!(t.events().len(), 1);
            assert_eq!(t.events()[0].end(), 15);
        });
    }

    #[test]
    fn test_set_loop_bars_restarts_running_transport() {
        let mut s = session(1);
        s.start();
        s.set_loop_bars(2);
        assert!(s.is_running());
        s.stop();
        assert!(!s.is_running());
    }

    #[test]
    fn test_clear_track_is_scoped() {
        let s = session(1);
        s.toggle_single(TrackKind::Drums, 0, 0);
        s.toggle_single(TrackKind::Rhythm, 0, 0);
        s.clear_track(TrackKind::Drums);
        assert!(s.with_track(TrackKind::Drums, |t| t.events().is_empty()));
        assert_eq!(s.with_track(TrackKind::Rhythm, |t| t.events().len()), 1);
    }
}
