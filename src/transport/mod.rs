/// Transport scheduler - walks the shared patterns once per sixteenth-note
/// slot on a dedicated thread and fires trigger commands at the instrument
/// rack, with highlight notifications flowing back to the UI over a
/// channel.
///
/// Slot boundaries are derived from a fixed epoch (`next = prev + dur`),
/// never from "now", so timing does not drift; the thread wakes a little
/// ahead of each boundary and passes the residual delay to the handles so
/// the audio backend can start voices exactly on the boundary.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::instrument::{chord_velocity, row_pitch, InstrumentRack};
use crate::track::{Patterns, TrackKind};

pub const MIN_BPM: f32 = 40.0;
pub const MAX_BPM: f32 = 240.0;

/// How far ahead of a slot boundary the tick fires. Within this window the
/// handles own the fine timing.
const LOOKAHEAD: Duration = Duration::from_millis(10);

/// Notifications the UI polls each frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// `kind`'s playhead moved to `current`; `previous` is what to
    /// unhighlight (None right after a start).
    Step {
        kind: TrackKind,
        current: usize,
        previous: Option<usize>,
    },
    /// Transport stopped; all highlights should clear.
    Cleared,
}

/// One note command aimed at a track's instrument. Several pitches mean a
/// simultaneous chord.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub kind: TrackKind,
    pub pitches: Vec<u8>,
    pub duration: Duration,
    pub velocity: f32,
}

/// Everything one slot owes the outside world, computed under the
/// patterns lock and dispatched after it is released.
fn collect_triggers(patterns: &Patterns, step: usize, step_secs: f64) -> Vec<Trigger> {
    let step_dur = Duration::from_secs_f64(step_secs);
    let mut triggers = Vec::new();

    for kind in TrackKind::TICK_ORDER {
        let track = patterns.track(kind);
        if !track.enabled() {
            continue;
        }
        let starting: Vec<_> = track
            .events()
            .iter()
            .filter(|ev| ev.start() == step)
            .collect();
        if starting.is_empty() {
            continue;
        }

        if kind == TrackKind::Rhythm {
            // Chord batching: everything starting this slot shares one
            // velocity derived from the total voice count, grouped by
            // duration so each group is a single polyphonic call.
            let velocity = chord_velocity(starting.len());
            let mut durations: Vec<usize> = starting.iter().map(|ev| ev.duration_steps()).collect();
            durations.sort_unstable();
            durations.dedup();
            for dur_steps in durations {
                let pitches: Vec<u8> = starting
                    .iter()
                    .filter(|ev| ev.duration_steps() == dur_steps)
                    .map(|ev| row_pitch(kind, ev.index()))
                    .collect();
                triggers.push(Trigger {
                    kind,
                    pitches,
                    duration: step_dur * dur_steps as u32,
                    velocity,
                });
            }
        } else {
            // One explicit-duration call per event. Spans get their whole
            // length up front; there is no separate release tick to miss.
            for ev in starting {
                triggers.push(Trigger {
                    kind,
                    pitches: vec![row_pitch(kind, ev.index())],
                    duration: step_dur * ev.duration_steps() as u32,
                    velocity: 1.0,
                });
            }
        }
    }
    triggers
}

fn dispatch(rack: &InstrumentRack, trigger: &Trigger, delay: Duration) {
    let mut handle = rack.handle(trigger.kind).lock().unwrap();
    if let Err(err) = handle.trigger_attack_release(
        &trigger.pitches,
        trigger.duration,
        delay,
        trigger.velocity,
    ) {
        // One bad note must never stop the loop.
        log::warn!("{} trigger failed: {:#}", trigger.kind.label(), err);
    }
}

pub struct Transport {
    patterns: Arc<Mutex<Patterns>>,
    rack: InstrumentRack,
    bpm: Arc<Mutex<f32>>,
    running: Arc<AtomicBool>,
    /// Bumped on every stop so ticks from a previous run can never fire
    /// into a new one.
    generation: Arc<AtomicU64>,
    current_step: Arc<AtomicUsize>,
    sender: Sender<TransportEvent>,
    receiver: Receiver<TransportEvent>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Transport {
    pub fn new(patterns: Arc<Mutex<Patterns>>, rack: InstrumentRack) -> Self {
        let (sender, receiver) = channel();
        Self {
            patterns,
            rack,
            bpm: Arc::new(Mutex::new(120.0)),
            running: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            current_step: Arc::new(AtomicUsize::new(0)),
            sender,
            receiver,
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Step the playhead sits on right now. The live-recording path reads
    /// this to place pad hits.
    pub fn current_step(&self) -> usize {
        self.current_step.load(Ordering::SeqCst)
    }

    pub fn bpm(&self) -> f32 {
        *self.bpm.lock().unwrap()
    }

    /// Takes effect on the next slot boundary; already-fired slots are
    /// untouched. Clamped so a zero or negative tempo cannot produce a
    /// broken step duration.
    pub fn set_bpm(&self, bpm: f32) {
        *self.bpm.lock().unwrap() = bpm.clamp(MIN_BPM, MAX_BPM);
    }

    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        self.current_step.store(0, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        let my_gen = self.generation.load(Ordering::SeqCst);
        log::debug!("transport started (gen {})", my_gen);

        let patterns = Arc::clone(&self.patterns);
        let rack = self.rack.clone();
        let bpm = Arc::clone(&self.bpm);
        let running = Arc::clone(&self.running);
        let generation = Arc::clone(&self.generation);
        let current_step = Arc::clone(&self.current_step);
        let sender = self.sender.clone();

        self.worker = Some(thread::spawn(move || {
            let mut step = 0usize;
            let mut previous: Option<usize> = None;
            let mut boundary = Instant::now() + LOOKAHEAD;

            loop {
                // Sleep up to the lookahead window, bailing the moment a
                // stop lands.
                loop {
                    if !running.load(Ordering::SeqCst)
                        || generation.load(Ordering::SeqCst) != my_gen
                    {
                        return;
                    }
                    if Instant::now() + LOOKAHEAD >= boundary {
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }

                let step_secs = 60.0 / f64::from(*bpm.lock().unwrap()) / 4.0;
                let (triggers, loop_len) = {
                    let patterns = patterns.lock().unwrap();
                    (
                        collect_triggers(&patterns, step, step_secs),
                        patterns.loop_length_steps(),
                    )
                };

                // A stop may have landed while we held the lock; no
                // audible work after that.
                if !running.load(Ordering::SeqCst) || generation.load(Ordering::SeqCst) != my_gen {
                    return;
                }

                let delay = boundary.saturating_duration_since(Instant::now());
                for trigger in &triggers {
                    dispatch(&rack, trigger, delay);
                }
                for kind in TrackKind::TICK_ORDER {
                    let _ = sender.send(TransportEvent::Step {
                        kind,
                        current: step,
                        previous,
                    });
                }

                previous = Some(step);
                step = (step + 1) % loop_len.max(1);
                current_step.store(step, Ordering::SeqCst);
                boundary += Duration::from_secs_f64(step_secs);
            }
        }));
    }

    /// Stop playback: cancel all future slots, silence every instrument,
    /// clear highlights and rewind to step 0.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.rack.release_all();
        let _ = self.sender.send(TransportEvent::Cleared);
        self.current_step.store(0, Ordering::SeqCst);
        log::debug!("transport stopped");
    }

    pub fn poll_events(&self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{shared, InstrumentHandle};
    use anyhow::{bail, Result};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        AttackRelease(Vec<u8>, Duration, f32),
        ReleaseAll,
    }

    #[derive(Clone)]
    struct Recorder {
        calls: Arc<Mutex<Vec<Call>>>,
        fail: bool,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                fail: true,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl InstrumentHandle for Recorder {
        fn trigger_attack(&mut self, _pitch: u8, _delay: Duration, _velocity: f32) -> Result<()> {
            Ok(())
        }

        fn trigger_release(&mut self, _pitch: Option<u8>, _delay: Duration) -> Result<()> {
            Ok(())
        }

        fn trigger_attack_release(
            &mut self,
            pitches: &[u8],
            duration: Duration,
            _delay: Duration,
            velocity: f32,
        ) -> Result<()> {
            if self.fail {
                bail!("audio device unavailable");
            }
            self.calls
                .lock()
                .unwrap()
                .push(Call::AttackRelease(pitches.to_vec(), duration, velocity));
            Ok(())
        }

        fn release_all(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push(Call::ReleaseAll);
            Ok(())
        }
    }

    fn rack_of(drums: Recorder, bass: Recorder, rhythm: Recorder, lead: Recorder) -> InstrumentRack {
        InstrumentRack::new(shared(drums), shared(bass), shared(rhythm), shared(lead))
    }

    const STEP_SECS: f64 = 0.125; // 120 bpm

    #[test]
    fn test_collect_point_events() {
        let mut patterns = Patterns::new(1);
        patterns.track_mut(TrackKind::Drums).toggle_single(0, 0);
        patterns.track_mut(TrackKind::Drums).toggle_single(0, 2);
        let triggers = collect_triggers(&patterns, 0, STEP_SECS);
        // Drums fire one command per hit, a step's duration each.
        assert_eq!(triggers.len(), 2);
        assert_eq!(triggers[0].pitches, vec![36]);
        assert_eq!(triggers[1].pitches, vec![40]);
        assert_eq!(triggers[0].duration, Duration::from_secs_f64(STEP_SECS));
        assert!(collect_triggers(&patterns, 1, STEP_SECS).is_empty());
    }

    #[test]
    fn test_collect_span_fires_once_with_full_duration() {
        let mut patterns = Patterns::new(1);
        patterns.track_mut(TrackKind::Bass).toggle_span(4, 7, 0);
        let triggers = collect_triggers(&patterns, 4, STEP_SECS);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].duration, Duration::from_secs_f64(STEP_SECS * 4.0));
        // Nothing fires mid-span or at its end; the duration covered it.
        assert!(collect_triggers(&patterns, 5, STEP_SECS).is_empty());
        assert!(collect_triggers(&patterns, 7, STEP_SECS).is_empty());
    }

    #[test]
    fn test_collect_rhythm_chord_batch() {
        let mut patterns = Patterns::new(1);
        let rhythm = patterns.track_mut(TrackKind::Rhythm);
        rhythm.toggle_single(2, 0);
        rhythm.toggle_single(2, 4);
        rhythm.toggle_single(2, 7);
        let triggers = collect_triggers(&patterns, 2, STEP_SECS);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].pitches, vec![48, 52, 55]);
        assert!((triggers[0].velocity - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_collect_skips_disabled_tracks() {
        let mut patterns = Patterns::new(1);
        patterns.track_mut(TrackKind::Drums).toggle_single(0, 0);
        patterns.track_mut(TrackKind::Drums).set_enabled(false);
        assert!(collect_triggers(&patterns, 0, STEP_SECS).is_empty());
    }

    #[test]
    fn test_tick_order_is_fixed() {
        let mut patterns = Patterns::new(1);
        patterns.track_mut(TrackKind::Rhythm).toggle_single(0, 0);
        patterns.track_mut(TrackKind::Lead).toggle_single(0, 0);
        patterns.track_mut(TrackKind::Drums).toggle_single(0, 0);
        patterns.track_mut(TrackKind::Bass).toggle_single(0, 0);
        let kinds: Vec<_> = collect_triggers(&patterns, 0, STEP_SECS)
            .iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TrackKind::Drums,
                TrackKind::Bass,
                TrackKind::Lead,
                TrackKind::Rhythm
            ]
        );
    }

    #[test]
    fn test_loop_visits_every_step_in_order_then_wraps() {
        let patterns = Arc::new(Mutex::new(Patterns::new(1)));
        let rack = rack_of(
            Recorder::new(),
            Recorder::new(),
            Recorder::new(),
            Recorder::new(),
        );
        let mut transport = Transport::new(patterns, rack);
        transport.set_bpm(240.0); // 62.5ms per step
        transport.start();
        thread::sleep(Duration::from_millis(1200)); // > one 16-step loop
        transport.stop();

        let steps: Vec<usize> = transport
            .poll_events()
            .iter()
            .filter_map(|ev| match ev {
                TransportEvent::Step {
                    kind: TrackKind::Drums,
                    current,
                    ..
                } => Some(*current),
                _ => None,
            })
            .collect();
        assert!(steps.len() > 16, "expected a full loop, got {:?}", steps);
        for (i, step) in steps.iter().enumerate() {
            assert_eq!(*step, i % 16);
        }
        assert_eq!(transport.current_step(), 0);
    }

    #[test]
    fn test_stop_releases_all_handles() {
        let drums = Recorder::new();
        let bass = Recorder::new();
        let patterns = Arc::new(Mutex::new(Patterns::new(1)));
        patterns
            .lock()
            .unwrap()
            .track_mut(TrackKind::Bass)
            .toggle_span(0, 15, 0);
        let mut transport = Transport::new(
            Arc::clone(&patterns),
            rack_of(drums.clone(), bass.clone(), Recorder::new(), Recorder::new()),
        );
        transport.start();
        thread::sleep(Duration::from_millis(150));
        transport.stop();

        let calls = bass.calls();
        assert!(calls
            .iter()
            .any(|c| matches!(c, Call::AttackRelease(_, _, _))));
        assert_eq!(calls.last(), Some(&Call::ReleaseAll));
        assert_eq!(drums.calls(), vec![Call::ReleaseAll]);
        // Highlights were cleared.
        assert!(transport
            .poll_events()
            .iter()
            .any(|ev| *ev == TransportEvent::Cleared));
    }

    #[test]
    fn test_failing_handle_does_not_stall_the_loop() {
        let drums = Recorder::failing();
        let lead = Recorder::new();
        let patterns = Arc::new(Mutex::new(Patterns::new(1)));
        {
            let mut patterns = patterns.lock().unwrap();
            patterns.track_mut(TrackKind::Drums).toggle_single(0, 0);
            patterns.track_mut(TrackKind::Lead).toggle_single(0, 0);
        }
        let mut transport = Transport::new(
            Arc::clone(&patterns),
            rack_of(drums, Recorder::new(), Recorder::new(), lead.clone()),
        );
        transport.start();
        thread::sleep(Duration::from_millis(150));
        transport.stop();
        // The drum failure was swallowed; lead still fired.
        assert!(lead
            .calls()
            .iter()
            .any(|c| matches!(c, Call::AttackRelease(_, _, _))));
    }

    #[test]
    fn test_bpm_clamped() {
        let patterns = Arc::new(Mutex::new(Patterns::new(1)));
        let rack = rack_of(
            Recorder::new(),
            Recorder::new(),
            Recorder::new(),
            Recorder::new(),
        );
        let transport = Transport::new(patterns, rack);
        transport.set_bpm(0.0);
        assert_eq!(transport.bpm(), MIN_BPM);
        transport.set_bpm(-10.0);
        assert_eq!(transport.bpm(), MIN_BPM);
        transport.set_bpm(10_000.0);
        assert_eq!(transport.bpm(), MAX_BPM);
    }
}
