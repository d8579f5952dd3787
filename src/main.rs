#[cfg(feature = "gui")]
use eframe::egui;

#[cfg(feature = "gui")]
use beatgrid::{
    shared, AudioEngine, InstrumentHandle, InstrumentRack, MidiHandle, SequencerSession,
    SynthProfile, TrackKind, TransportEvent, Waveform, MAX_BPM, MIN_BPM,
};

#[cfg(feature = "gui")]
fn main() -> Result<(), eframe::Error> {
    env_logger::init();
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1100.0, 760.0])
            .with_title("Beatgrid - Drum Machine"),
        ..Default::default()
    };

    eframe::run_native(
        "Beatgrid",
        options,
        Box::new(|_cc| Ok(Box::new(BeatgridApp::new()))),
    )
}

#[cfg(not(feature = "gui"))]
fn main() {
    eprintln!("This binary requires the 'gui' feature to be enabled");
    std::process::exit(1);
}

/// Fallback handle when no audio device is available: triggers succeed
/// silently so the transport stays controllable.
#[cfg(feature = "gui")]
struct Silent;

#[cfg(feature = "gui")]
impl InstrumentHandle for Silent {
    fn trigger_attack(&mut self, _: u8, _: std::time::Duration, _: f32) -> anyhow::Result<()> {
        Ok(())
    }
    fn trigger_release(&mut self, _: Option<u8>, _: std::time::Duration) -> anyhow::Result<()> {
        Ok(())
    }
    fn trigger_attack_release(
        &mut self,
        _: &[u8],
        _: std::time::Duration,
        _: std::time::Duration,
        _: f32,
    ) -> anyhow::Result<()> {
        Ok(())
    }
    fn release_all(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(feature = "gui")]
fn kind_slot(kind: TrackKind) -> usize {
    TrackKind::TICK_ORDER
        .iter()
        .position(|&k| k == kind)
        .unwrap()
}

/// In-progress span drag on a monophonic grid.
#[cfg(feature = "gui")]
struct DragState {
    kind: TrackKind,
    index: usize,
    start_step: usize,
    current_step: usize,
}

#[cfg(feature = "gui")]
struct BeatgridApp {
    session: SequencerSession,
    audio: Option<AudioEngine>,

    // UI state
    active_tab: TrackKind,
    current_steps: [Option<usize>; 4],
    drag: Option<DragState>,
    available_midi_ports: Vec<String>,
    selected_port: Option<usize>,
}

#[cfg(feature = "gui")]
impl BeatgridApp {
    fn new() -> Self {
        let mut audio = match AudioEngine::new() {
            Ok(engine) => Some(engine),
            Err(err) => {
                log::warn!("audio unavailable, running silent: {:#}", err);
                None
            }
        };
        let rack = match audio.as_mut() {
            Some(engine) => InstrumentRack::new(
                shared(engine.handle(SynthProfile::DrumKit)),
                shared(engine.handle(SynthProfile::Melodic(Waveform::Saw))),
                shared(engine.handle(SynthProfile::Melodic(Waveform::Square))),
                shared(engine.handle(SynthProfile::Melodic(Waveform::Sine))),
            ),
            None => InstrumentRack::new(shared(Silent), shared(Silent), shared(Silent), shared(Silent)),
        };

        Self {
            session: SequencerSession::new(1, rack),
            audio,
            active_tab: TrackKind::Drums,
            current_steps: [None; 4],
            drag: None,
            available_midi_ports: MidiHandle::available_ports(),
            selected_port: None,
        }
    }

    fn handle_transport_events(&mut self) {
        for event in self.session.poll_events() {
            match event {
                TransportEvent::Step { kind, current, .. } => {
                    self.current_steps[kind_slot(kind)] = Some(current);
                }
                TransportEvent::Cleared => {
                    self.current_steps = [None; 4];
                }
            }
        }
    }

    fn route_lead_to_midi(&mut self, port_index: usize) {
        let mut handle = MidiHandle::new(0);
        match handle.connect(port_index) {
            Ok(()) => {
                self.session
                    .rack()
                    .set_handle(TrackKind::Lead, Box::new(handle));
                self.selected_port = Some(port_index);
            }
            Err(err) => log::warn!("MIDI connect failed: {:#}", err),
        }
    }

    fn route_lead_to_synth(&mut self) {
        if let Some(engine) = self.audio.as_mut() {
            self.session.rack().set_handle(
                TrackKind::Lead,
                Box::new(engine.handle(SynthProfile::Melodic(Waveform::Sine))),
            );
        } else {
            self.session.rack().set_handle(TrackKind::Lead, Box::new(Silent));
        }
        self.selected_port = None;
    }

    fn transport_bar(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            let is_running = self.session.is_running();
            if is_running {
                if ui.button("⏹ Stop").clicked() {
                    self.session.stop();
                }
            } else if ui.button("▶ Play").clicked() {
                self.session.start();
            }

            ui.add_space(20.0);

            ui.label("BPM:");
            let mut bpm = self.session.bpm();
            if ui
                .add(egui::Slider::new(&mut bpm, MIN_BPM..=MAX_BPM).step_by(1.0))
                .changed()
            {
                self.session.set_bpm(bpm);
            }

            ui.add_space(20.0);

            ui.label("Bars:");
            let current_bars = self.session.loop_bars();
            for bars in [1, 2, 4] {
                if ui
                    .selectable_label(current_bars == bars, format!("{}", bars))
                    .clicked()
                    && current_bars != bars
                {
                    self.session.set_loop_bars(bars);
                }
            }

            ui.add_space(20.0);

            if ui.button("Clear").clicked() {
                self.session.clear_track(self.active_tab);
            }

            let mut enabled = self
                .session
                .with_track(self.active_tab, |t| t.enabled());
            if ui.checkbox(&mut enabled, "Enabled").changed() {
                self.session.set_track_enabled(self.active_tab, enabled);
            }
        });
    }

    fn tab_bar(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            for kind in [
                TrackKind::Drums,
                TrackKind::Bass,
                TrackKind::Rhythm,
                TrackKind::Lead,
            ] {
                if ui
                    .selectable_label(self.active_tab == kind, kind.label())
                    .clicked()
                {
                    self.active_tab = kind;
                    self.drag = None;
                }
            }
        });
    }

    fn drum_pads(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            for index in 0..TrackKind::Drums.rows() {
                let label = beatgrid::row_label(TrackKind::Drums, index);
                if ui
                    .add(egui::Button::new(label).min_size(egui::vec2(80.0, 40.0)))
                    .clicked()
                {
                    self.session.pad_press(TrackKind::Drums, index);
                }
            }
        });
    }

    fn cell_color(active: bool, is_current: bool, is_beat: bool) -> egui::Color32 {
        if is_current && active {
            egui::Color32::from_rgb(120, 220, 120)
        } else if is_current {
            egui::Color32::from_rgb(70, 120, 70)
        } else if active {
            egui::Color32::from_rgb(60, 60, 200)
        } else if is_beat {
            egui::Color32::from_rgb(55, 55, 55)
        } else {
            egui::Color32::from_rgb(40, 40, 40)
        }
    }

    fn grid(&mut self, ui: &mut egui::Ui, kind: TrackKind) {
        let (length, events, polyphonic) = self.session.with_track(kind, |t| {
            (t.length_steps(), t.events().to_vec(), t.is_polyphonic())
        });
        let is_running = self.session.is_running();
        let current = self.current_steps[kind_slot(kind)];
        let cell = egui::vec2(if length > 32 { 18.0 } else { 28.0 }, 18.0);

        egui::ScrollArea::both().show(ui, |ui| {
            for index in 0..kind.rows() {
                ui.horizontal(|ui| {
                    ui.add_sized(
                        egui::vec2(44.0, cell.y),
                        egui::Label::new(beatgrid::row_label(kind, index)),
                    );
                    for step in 0..length {
                        let mut active = events
                            .iter()
                            .any(|ev| ev.index() == index && ev.covers(step));
                        // Preview the span being dragged.
                        if let Some(drag) = &self.drag {
                            if drag.kind == kind && drag.index == index {
                                let lo = drag.start_step.min(drag.current_step);
                                let hi = drag.start_step.max(drag.current_step);
                                if (lo..=hi).contains(&step) {
                                    active = true;
                                }
                            }
                        }
                        let is_current = is_running && current == Some(step);
                        let color = Self::cell_color(active, is_current, step % 4 == 0);
                        let response = ui.add(
                            egui::Button::new("")
                                .min_size(cell)
                                .fill(color)
                                .rounding(2.0),
                        );

                        if polyphonic {
                            if response.clicked() {
                                self.session.toggle_single(kind, step, index);
                            }
                        } else if response.is_pointer_button_down_on() {
                            match &mut self.drag {
                                Some(drag) if drag.kind == kind && drag.index == index => {
                                    drag.current_step = step;
                                }
                                Some(_) => {}
                                None => {
                                    self.drag = Some(DragState {
                                        kind,
                                        index,
                                        start_step: step,
                                        current_step: step,
                                    });
                                }
                            }
                        }
                    }
                });
            }
        });

        // Commit a monophonic drag on mouse release, even off-grid.
        if !polyphonic && ui.input(|i| i.pointer.primary_released()) {
            if let Some(drag) = self.drag.take() {
                let start = drag.start_step.min(drag.current_step);
                let end = drag.start_step.max(drag.current_step);
                self.session.toggle_span(drag.kind, start, end, drag.index);
            }
        }
    }

    fn midi_section(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            ui.label("MIDI (lead):");
            if self.available_midi_ports.is_empty() {
                ui.label("No MIDI ports available");
                return;
            }
            let mut picked = None;
            egui::ComboBox::from_label("")
                .selected_text(
                    self.selected_port
                        .map(|i| self.available_midi_ports[i].as_str())
                        .unwrap_or("Built-in synth"),
                )
                .show_ui(ui, |ui| {
                    for (i, port_name) in self.available_midi_ports.iter().enumerate() {
                        if ui
                            .selectable_label(self.selected_port == Some(i), port_name)
                            .clicked()
                        {
                            picked = Some(i);
                        }
                    }
                });
            if let Some(port_index) = picked {
                self.route_lead_to_midi(port_index);
            }
            if self.selected_port.is_some() && ui.button("Use synth").clicked() {
                self.route_lead_to_synth();
            }
        });
    }
}

#[cfg(feature = "gui")]
impl eframe::App for BeatgridApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        ctx.request_repaint();

        self.handle_transport_events();

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("Beatgrid");
            ui.add_space(8.0);

            self.transport_bar(ui);
            ui.add_space(8.0);
            self.midi_section(ui);
            ui.separator();

            self.tab_bar(ui);
            ui.add_space(8.0);

            if self.active_tab == TrackKind::Drums {
                self.drum_pads(ui);
                ui.add_space(8.0);
            }

            self.grid(ui, self.active_tab);

            ui.separator();
            if self.active_tab.is_polyphonic() {
                ui.label("Click cells to toggle steps");
            } else {
                ui.label("Click to toggle a step, drag along a row to draw a held note");
            }
            if self.audio.is_none() {
                ui.colored_label(
                    egui::Color32::YELLOW,
                    "⚠ No audio output device - running silent",
                );
            }
        });
    }
}
