/// Audio output using cpal. One output stream mixes a shared voice bank;
/// each track kind gets a `SynthHandle` that spawns voices into the bank.
/// Voices carry a delayed-start sample counter so the transport's
/// lookahead lands notes exactly on the slot boundary.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::instrument::{midi_note_to_frequency, InstrumentHandle};

const ATTACK_SECS: f32 = 0.005;
const RELEASE_SECS: f32 = 0.03;
/// Per-voice headroom so a few simultaneous voices do not clip.
const VOICE_GAIN: f32 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Saw,
    Square,
    Noise,
}

/// What a handle's voices sound like. `Melodic` honors the requested
/// duration; `DrumKit` maps the four kit pitches to fixed percussive
/// decays instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SynthProfile {
    Melodic(Waveform),
    DrumKit,
}

struct Voice {
    owner: usize,
    pitch: u8,
    waveform: Waveform,
    freq: f32,
    phase: f32,
    amp: f32,
    noise_state: u32,
    /// Samples to wait before the voice starts sounding.
    delay_samples: u64,
    /// Samples of sustain left before auto-release; None = held until an
    /// explicit release.
    sustain_left: Option<u64>,
    attack_left: u64,
    release_left: u64,
    releasing: bool,
}

impl Voice {
    fn release(&mut self, sample_rate: f32) {
        if !self.releasing {
            self.releasing = true;
            self.release_left = (RELEASE_SECS * sample_rate) as u64;
        }
    }

    /// Render one sample and advance; false when the voice is finished.
    fn next_sample(&mut self, sample_rate: f32) -> (f32, bool) {
        if self.delay_samples > 0 {
            self.delay_samples -= 1;
            return (0.0, true);
        }

        let raw = match self.waveform {
            Waveform::Sine => (self.phase * 2.0 * std::f32::consts::PI).sin(),
            Waveform::Saw => 2.0 * self.phase - 1.0,
            Waveform::Square => {
                if self.phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Noise => {
                // xorshift, cheap per-voice noise
                self.noise_state ^= self.noise_state << 13;
                self.noise_state ^= self.noise_state >> 17;
                self.noise_state ^= self.noise_state << 5;
                (self.noise_state as f32 / u32::MAX as f32) * 2.0 - 1.0
            }
        };
        self.phase += self.freq / sample_rate;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }

        let attack_total = (ATTACK_SECS * sample_rate) as u64;
        let env = if self.attack_left > 0 {
            self.attack_left -= 1;
            1.0 - self.attack_left as f32 / attack_total.max(1) as f32
        } else if self.releasing {
            if self.release_left == 0 {
                return (0.0, false);
            }
            self.release_left -= 1;
            self.release_left as f32 / (RELEASE_SECS * sample_rate).max(1.0)
        } else {
            if let Some(left) = &mut self.sustain_left {
                if *left == 0 {
                    self.release(sample_rate);
                } else {
                    *left -= 1;
                }
            }
            1.0
        };

        (raw * env * self.amp, true)
    }
}

struct VoiceBank {
    voices: Vec<Voice>,
}

/// Owns the cpal stream. Keep it alive for as long as sound should play;
/// handles stay valid but silent without it.
pub struct AudioEngine {
    _stream: cpal::Stream,
    bank: Arc<Mutex<VoiceBank>>,
    sample_rate: f32,
    next_owner: usize,
}

impl AudioEngine {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default audio output device"))?;
        let config = device
            .default_output_config()
            .context("querying default output config")?;
        if config.sample_format() != cpal::SampleFormat::F32 {
            return Err(anyhow!(
                "unsupported sample format {:?}",
                config.sample_format()
            ));
        }
        let sample_rate = config.sample_rate().0 as f32;
        let channels = config.channels() as usize;

        let bank = Arc::new(Mutex::new(VoiceBank { voices: Vec::new() }));
        let callback_bank = Arc::clone(&bank);
        let stream = device
            .build_output_stream(
                &config.into(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut bank = callback_bank.lock().unwrap();
                    for frame in data.chunks_mut(channels) {
                        let mut mixed = 0.0;
                        bank.voices.retain_mut(|voice| {
                            let (sample, alive) = voice.next_sample(sample_rate);
                            mixed += sample;
                            alive
                        });
                        for sample in frame.iter_mut() {
                            *sample = mixed;
                        }
                    }
                },
                |err| log::error!("audio stream error: {}", err),
                None,
            )
            .context("building audio output stream")?;
        stream.play().context("starting audio output stream")?;

        Ok(Self {
            _stream: stream,
            bank,
            sample_rate,
            next_owner: 0,
        })
    }

    /// A new handle feeding the shared bank. Handles are `Send` and can be
    /// triggered from the transport thread.
    pub fn handle(&mut self, profile: SynthProfile) -> SynthHandle {
        let owner = self.next_owner;
        self.next_owner += 1;
        SynthHandle {
            owner,
            profile,
            bank: Arc::clone(&self.bank),
            sample_rate: self.sample_rate,
        }
    }
}

pub struct SynthHandle {
    owner: usize,
    profile: SynthProfile,
    bank: Arc<Mutex<VoiceBank>>,
    sample_rate: f32,
}

impl SynthHandle {
    /// (waveform, frequency, fixed decay override) for one pitch.
    fn voice_shape(&self, pitch: u8) -> (Waveform, f32, Option<f32>) {
        match self.profile {
            SynthProfile::Melodic(waveform) => (waveform, midi_note_to_frequency(pitch), None),
            SynthProfile::DrumKit => match pitch {
                36 => (Waveform::Sine, 55.0, Some(0.2)),  // kick
                38 => (Waveform::Noise, 0.0, Some(0.15)), // snare
                40 => (Waveform::Noise, 0.0, Some(0.05)), // closed hat
                _ => (Waveform::Noise, 0.0, Some(0.3)),   // open hat
            },
        }
    }

    fn spawn(&self, pitch: u8, delay: Duration, sustain: Option<Duration>, velocity: f32) {
        let (waveform, freq, decay) = self.voice_shape(pitch);
        let sustain = decay.map(Duration::from_secs_f32).or(sustain);
        let voice = Voice {
            owner: self.owner,
            pitch,
            waveform,
            freq,
            phase: 0.0,
            amp: velocity.clamp(0.0, 1.0) * VOICE_GAIN,
            noise_state: 0x9e37_79b9 ^ u32::from(pitch),
            delay_samples: (delay.as_secs_f64() * f64::from(self.sample_rate)) as u64,
            sustain_left: sustain.map(|d| (d.as_secs_f64() * f64::from(self.sample_rate)) as u64),
            attack_left: (ATTACK_SECS * self.sample_rate) as u64,
            release_left: 0,
            releasing: false,
        };
        self.bank.lock().unwrap().voices.push(voice);
    }
}

impl InstrumentHandle for SynthHandle {
    fn trigger_attack(&mut self, pitch: u8, delay: Duration, velocity: f32) -> Result<()> {
        self.spawn(pitch, delay, None, velocity);
        Ok(())
    }

    fn trigger_release(&mut self, pitch: Option<u8>, _delay: Duration) -> Result<()> {
        let sample_rate = self.sample_rate;
        let mut bank = self.bank.lock().unwrap();
        // Most recent matching voice, monophonic-style.
        if let Some(voice) = bank
            .voices
            .iter_mut()
            .rev()
            .find(|v| v.owner == self.owner && pitch.map_or(true, |p| v.pitch == p))
        {
            voice.release(sample_rate);
        }
        Ok(())
    }

    fn trigger_attack_release(
        &mut self,
        pitches: &[u8],
        duration: Duration,
        delay: Duration,
        velocity: f32,
    ) -> Result<()> {
        for &pitch in pitches {
            self.spawn(pitch, delay, Some(duration), velocity);
        }
        Ok(())
    }

    fn release_all(&mut self) -> Result<()> {
        let sample_rate = self.sample_rate;
        let mut bank = self.bank.lock().unwrap();
        for voice in bank.voices.iter_mut().filter(|v| v.owner == self.owner) {
            voice.release(sample_rate);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_voice(waveform: Waveform, sustain: Option<u64>) -> Voice {
        Voice {
            owner: 0,
            pitch: 60,
            waveform,
            freq: 440.0,
            phase: 0.0,
            amp: VOICE_GAIN,
            noise_state: 1,
            delay_samples: 0,
            sustain_left: sustain,
            attack_left: 0,
            release_left: 0,
            releasing: false,
        }
    }

    #[test]
    fn test_delayed_voice_is_silent_until_start() {
        let mut voice = test_voice(Waveform::Sine, None);
        voice.delay_samples = 3;
        for _ in 0..3 {
            let (sample, alive) = voice.next_sample(48_000.0);
            assert_eq!(sample, 0.0);
            assert!(alive);
        }
        let mut heard = false;
        for _ in 0..100 {
            let (sample, _) = voice.next_sample(48_000.0);
            if sample.abs() > 0.0 {
                heard = true;
            }
        }
        assert!(heard);
    }

    #[test]
    fn test_voice_releases_after_sustain() {
        let sample_rate = 1_000.0;
        let mut voice = test_voice(Waveform::Sine, Some(10));
        let mut steps = 0;
        loop {
            let (_, alive) = voice.next_sample(sample_rate);
            if !alive {
                break;
            }
            steps += 1;
            assert!(steps < 10_000, "voice never finished");
        }
        // Sustain plus the release tail.
        assert!(steps >= 10);
    }

    #[test]
    fn test_release_only_arms_once() {
        let mut voice = test_voice(Waveform::Saw, None);
        voice.release(1_000.0);
        let left = voice.release_left;
        voice.next_sample(1_000.0);
        voice.release(1_000.0);
        assert!(voice.release_left < left);
    }
}
