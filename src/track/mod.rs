/// Track model and editing engine - event storage for one instrument's
/// timeline plus the toggle operations the grid UI drives it with.
/// This is instrument-agnostic; polyphony is a per-track property.

pub const STEPS_PER_BAR: usize = 16;

/// Which instrument a track belongs to. Fixes its row count, polyphony
/// rule and pitch mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Drums,
    Bass,
    Rhythm,
    Lead,
}

impl TrackKind {
    /// Track processing order inside one transport tick. Fixed so
    /// highlight notifications arrive deterministically.
    pub const TICK_ORDER: [TrackKind; 4] = [
        TrackKind::Drums,
        TrackKind::Bass,
        TrackKind::Lead,
        TrackKind::Rhythm,
    ];

    pub fn rows(self) -> usize {
        match self {
            TrackKind::Drums => 4,
            TrackKind::Bass => 12,
            TrackKind::Rhythm => 12,
            TrackKind::Lead => 24,
        }
    }

    pub fn is_polyphonic(self) -> bool {
        matches!(self, TrackKind::Drums | TrackKind::Rhythm)
    }

    pub fn label(self) -> &'static str {
        match self {
            TrackKind::Drums => "Drums",
            TrackKind::Bass => "Bass",
            TrackKind::Rhythm => "Rhythm",
            TrackKind::Lead => "Lead",
        }
    }
}

/// One stored note. `Point` is an instantaneous trigger, `Span` sustains
/// over an inclusive step range; `start_step == end_step` is the
/// degenerate single-step span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Point { step: usize, index: usize },
    Span { start_step: usize, end_step: usize, index: usize },
}

impl Event {
    pub fn index(&self) -> usize {
        match *self {
            Event::Point { index, .. } | Event::Span { index, .. } => index,
        }
    }

    /// First step the event occupies.
    pub fn start(&self) -> usize {
        match *self {
            Event::Point { step, .. } => step,
            Event::Span { start_step, .. } => start_step,
        }
    }

    /// Last step the event occupies (inclusive).
    pub fn end(&self) -> usize {
        match *self {
            Event::Point { step, .. } => step,
            Event::Span { end_step, .. } => end_step,
        }
    }

    pub fn duration_steps(&self) -> usize {
        self.end() - self.start() + 1
    }

    pub fn covers(&self, step: usize) -> bool {
        self.start() <= step && step <= self.end()
    }

    /// Inclusive range intersection test.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start() <= end && self.end() >= start
    }
}

/// What one editing operation did, so a view can patch itself
/// incrementally instead of re-scanning the whole grid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditOutcome {
    pub added: Option<Event>,
    pub removed: Vec<Event>,
}

/// One instrument's timeline: a loop of `length_steps` sixteenth-note
/// slots and the events placed on it.
#[derive(Debug, Clone)]
pub struct Track {
    length_steps: usize,
    events: Vec<Event>,
    enabled: bool,
    polyphonic: bool,
}

impl Track {
    pub fn new(length_steps: usize, polyphonic: bool) -> Self {
        debug_assert!(length_steps > 0 && length_steps % STEPS_PER_BAR == 0);
        Self {
            length_steps,
            events: Vec::new(),
            enabled: true,
            polyphonic,
        }
    }

    pub fn for_kind(kind: TrackKind, bars: usize) -> Self {
        Self::new(bars * STEPS_PER_BAR, kind.is_polyphonic())
    }

    pub fn length_steps(&self) -> usize {
        self.length_steps
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_polyphonic(&self) -> bool {
        self.polyphonic
    }

    /// Whether any event occupies `(step, index)`. Used by grid rendering
    /// and by the live-recording path to avoid duplicates.
    pub fn has_event_at(&self, step: usize, index: usize) -> bool {
        self.events
            .iter()
            .any(|ev| ev.index() == index && ev.covers(step))
    }

    /// Toggle a single cell. An exact single-step event at `(step, index)`
    /// toggles off. Otherwise a point is added; monophonic tracks first
    /// evict whatever covers `step` on any row (a same-row span covering
    /// the cell is replaced by the point, not merely toggled), so one note
    /// sounds at a time. Polyphonic tracks leave other rows untouched.
    pub fn toggle_single(&mut self, step: usize, index: usize) -> EditOutcome {
        debug_assert!(step < self.length_steps, "step out of range");

        let exact_cell =
            |ev: &Event| ev.index() == index && ev.start() == step && ev.end() == step;
        if self.events.iter().any(exact_cell) {
            let removed = self.drain_matching(exact_cell);
            return EditOutcome {
                added: None,
                removed,
            };
        }

        let removed = if self.polyphonic {
            // Only this row may conflict; a covering same-row span still
            // gives way to the new point.
            self.drain_matching(|ev| ev.index() == index && ev.covers(step))
        } else {
            self.drain_matching(|ev| ev.covers(step))
        };
        let added = Event::Point { step, index };
        self.events.push(added);
        EditOutcome {
            added: Some(added),
            removed,
        }
    }

    /// Toggle a dragged range. Two phases: if any event on the same row
    /// overlaps the range, remove every such event entirely (its full
    /// stored range, not just the dragged part) and stop. Otherwise evict
    /// conflicting events (all rows when monophonic, same row only when
    /// polyphonic) and insert the new span.
    pub fn toggle_span(&mut self, start_step: usize, end_step: usize, index: usize) -> EditOutcome {
        debug_assert!(start_step <= end_step);
        debug_assert!(end_step < self.length_steps, "step out of range");

        let same_row_overlap =
            |ev: &Event| ev.index() == index && ev.overlaps(start_step, end_step);
        if self.events.iter().any(same_row_overlap) {
            let removed = self.drain_matching(same_row_overlap);
            return EditOutcome {
                added: None,
                removed,
            };
        }

        let removed = if self.polyphonic {
            // No same-row overlap and other rows are independent, so
            // nothing to evict.
            Vec::new()
        } else {
            self.drain_matching(|ev| ev.overlaps(start_step, end_step))
        };
        let added = Event::Span {
            start_step,
            end_step,
            index,
        };
        self.events.push(added);
        EditOutcome {
            added: Some(added),
            removed,
        }
    }

    /// Change the loop length. Events starting at or past the new end are
    /// dropped; a span that starts inside but runs past it keeps its
    /// still-valid portion with `end_step` clamped. Returns the dropped
    /// events.
    pub fn set_length(&mut self, new_length_steps: usize) -> Vec<Event> {
        debug_assert!(new_length_steps > 0);

        let removed = self.drain_matching(|ev| ev.start() >= new_length_steps);
        for ev in &mut self.events {
            if let Event::Span { end_step, .. } = ev {
                if *end_step >= new_length_steps {
                    *end_step = new_length_steps - 1;
                }
            }
        }
        self.length_steps = new_length_steps;
        removed
    }

    /// Remove every event. Returns what was removed.
    pub fn clear(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Append a point event if the cell is empty. The live-recording path:
    /// drum pads write into the track mid-playback through this.
    pub fn record_point(&mut self, step: usize, index: usize) -> Option<Event> {
        debug_assert!(step < self.length_steps, "step out of range");
        if self.has_event_at(step, index) {
            return None;
        }
        let ev = Event::Point { step, index };
        self.events.push(ev);
        Some(ev)
    }

    fn drain_matching(&mut self, mut pred: impl FnMut(&Event) -> bool) -> Vec<Event> {
        let mut removed = Vec::new();
        self.events.retain(|ev| {
            if pred(ev) {
                removed.push(*ev);
                false
            } else {
                true
            }
        });
        removed
    }
}

/// The four tracks of one session. All tracks share one loop length; the
/// drum track's is the canonical one the transport wraps on.
#[derive(Debug, Clone)]
pub struct Patterns {
    drums: Track,
    bass: Track,
    rhythm: Track,
    lead: Track,
}

impl Patterns {
    pub fn new(bars: usize) -> Self {
        Self {
            drums: Track::for_kind(TrackKind::Drums, bars),
            bass: Track::for_kind(TrackKind::Bass, bars),
            rhythm: Track::for_kind(TrackKind::Rhythm, bars),
            lead: Track::for_kind(TrackKind::Lead, bars),
        }
    }

    pub fn track(&self, kind: TrackKind) -> &Track {
        match kind {
            TrackKind::Drums => &self.drums,
            TrackKind::Bass => &self.bass,
            TrackKind::Rhythm => &self.rhythm,
            TrackKind::Lead => &self.lead,
        }
    }

    pub fn track_mut(&mut self, kind: TrackKind) -> &mut Track {
        match kind {
            TrackKind::Drums => &mut self.drums,
            TrackKind::Bass => &mut self.bass,
            TrackKind::Rhythm => &mut self.rhythm,
            TrackKind::Lead => &mut self.lead,
        }
    }

    pub fn loop_length_steps(&self) -> usize {
        self.drums.length_steps()
    }

    /// Resize every track to the same new length. Returns the events each
    /// track dropped, in tick order, so a view can unpaint them.
    pub fn set_loop_length_steps(&mut self, steps: usize) -> Vec<(TrackKind, Vec<Event>)> {
        TrackKind::TICK_ORDER
            .iter()
            .map(|&kind| (kind, self.track_mut(kind).set_length(steps)))
            .collect()
    }
}
