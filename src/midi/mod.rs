/// MIDI output using midir, wrapped as an instrument handle so tracks can
/// be routed to hardware instead of the built-in synth. Note-offs for
/// explicit-duration triggers are sent from a short-lived helper thread,
/// so the transport tick never waits on them.
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use midir::{MidiOutput, MidiOutputConnection};

use crate::instrument::InstrumentHandle;

const CLIENT_NAME: &str = "beatgrid";
/// CC 123: all notes off.
const ALL_NOTES_OFF: u8 = 123;

pub struct MidiHandle {
    connection: Arc<Mutex<Option<MidiOutputConnection>>>,
    channel: u8,
}

impl MidiHandle {
    pub fn new(channel: u8) -> Self {
        debug_assert!(channel < 16);
        Self {
            connection: Arc::new(Mutex::new(None)),
            channel,
        }
    }

    pub fn available_ports() -> Vec<String> {
        match MidiOutput::new(CLIENT_NAME) {
            Ok(midi_out) => midi_out
                .ports()
                .iter()
                .filter_map(|p| midi_out.port_name(p).ok())
                .collect(),
            Err(_) => vec![],
        }
    }

    pub fn connect(&mut self, port_index: usize) -> Result<()> {
        let midi_out = MidiOutput::new(CLIENT_NAME).context("creating MIDI output")?;
        let ports = midi_out.ports();
        let port = ports
            .get(port_index)
            .ok_or_else(|| anyhow!("invalid MIDI port index {}", port_index))?;
        let connection = midi_out
            .connect(port, CLIENT_NAME)
            .map_err(|e| anyhow!("connecting to MIDI port: {}", e))?;
        *self.connection.lock().unwrap() = Some(connection);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.lock().unwrap().is_some()
    }

    pub fn disconnect(&mut self) {
        *self.connection.lock().unwrap() = None;
    }

    fn send(connection: &Arc<Mutex<Option<MidiOutputConnection>>>, message: &[u8]) -> Result<()> {
        let mut guard = connection.lock().unwrap();
        let conn = guard
            .as_mut()
            .ok_or_else(|| anyhow!("no MIDI port connected"))?;
        conn.send(message)
            .map_err(|e| anyhow!("sending MIDI message: {}", e))
    }

    fn note_on(&self, pitch: u8, velocity: u8) -> Result<()> {
        Self::send(&self.connection, &[0x90 | self.channel, pitch, velocity])
    }

    fn note_off(connection: &Arc<Mutex<Option<MidiOutputConnection>>>, channel: u8, pitch: u8) -> Result<()> {
        Self::send(connection, &[0x80 | channel, pitch, 0])
    }
}

fn as_midi_velocity(velocity: f32) -> u8 {
    (velocity.clamp(0.0, 1.0) * 127.0).round() as u8
}

impl InstrumentHandle for MidiHandle {
    fn trigger_attack(&mut self, pitch: u8, delay: Duration, velocity: f32) -> Result<()> {
        // MIDI has no scheduled delivery; a sub-lookahead delay is
        // accepted as immediate.
        let _ = delay;
        self.note_on(pitch, as_midi_velocity(velocity))
    }

    fn trigger_release(&mut self, pitch: Option<u8>, _delay: Duration) -> Result<()> {
        match pitch {
            Some(pitch) => Self::note_off(&self.connection, self.channel, pitch),
            None => self.release_all(),
        }
    }

    fn trigger_attack_release(
        &mut self,
        pitches: &[u8],
        duration: Duration,
        _delay: Duration,
        velocity: f32,
    ) -> Result<()> {
        let velocity = as_midi_velocity(velocity);
        for &pitch in pitches {
            self.note_on(pitch, velocity)?;
        }
        let connection = Arc::clone(&self.connection);
        let channel = self.channel;
        let pitches = pitches.to_vec();
        thread::spawn(move || {
            thread::sleep(duration);
            for pitch in pitches {
                if let Err(err) = MidiHandle::note_off(&connection, channel, pitch) {
                    log::warn!("MIDI note-off failed: {:#}", err);
                }
            }
        });
        Ok(())
    }

    fn release_all(&mut self) -> Result<()> {
        // Not an error when no port is connected; there is nothing to
        // silence.
        if !self.is_connected() {
            return Ok(());
        }
        Self::send(&self.connection, &[0xB0 | self.channel, ALL_NOTES_OFF, 0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_velocity_mapping() {
        assert_eq!(as_midi_velocity(0.0), 0);
        assert_eq!(as_midi_velocity(1.0), 127);
        assert_eq!(as_midi_velocity(0.5), 64);
        assert_eq!(as_midi_velocity(2.0), 127);
    }

    #[test]
    fn test_unconnected_handle_fails_to_trigger_but_releases_quietly() {
        let mut handle = MidiHandle::new(0);
        assert!(!handle.is_connected());
        assert!(handle.trigger_attack(60, Duration::ZERO, 1.0).is_err());
        assert!(handle.release_all().is_ok());
    }
}
