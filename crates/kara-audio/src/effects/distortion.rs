//! Waveshaping distortion with optional bit reduction and ring modulation.

use super::DistortionPreset;
use kara_core::{AudioFormat, Frames};
use kara_node::{NodeError, NodeInfo, ParameterInfo, ProcessBuffer, Processor};
use std::f32::consts::TAU;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveShape {
    SoftClip,
    HardClip,
    Foldback,
}

/// Parameter set a preset expands to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistortionSettings {
    pub drive_db: f32,
    pub shape: WaveShape,
    /// Quantise to this many bits (0 = off)
    pub bits: u32,
    /// Hold each sample this many times (1 = off)
    pub decimation: usize,
    /// Ring modulator frequency in Hz (0 = off)
    pub ring_hz: f32,
    /// Lowpass on the shaped signal
    pub tone_hz: f32,
    pub mix: f32,
}

impl Default for DistortionSettings {
    fn default() -> Self {
        Self {
            drive_db: 12.0,
            shape: WaveShape::SoftClip,
            bits: 0,
            decimation: 1,
            ring_hz: 0.0,
            tone_hz: 8000.0,
            mix: 0.5,
        }
    }
}

impl DistortionPreset {
    pub fn settings(self) -> DistortionSettings {
        let base = DistortionSettings::default();
        match self {
            Self::DrumsBitBrush => DistortionSettings {
                drive_db: 6.0,
                bits: 6,
                tone_hz: 6000.0,
                ..base
            },
            Self::DrumsLoFi => DistortionSettings {
                drive_db: 9.0,
                bits: 8,
                decimation: 4,
                tone_hz: 4000.0,
                ..base
            },
            Self::MultiBrokenSpeaker => DistortionSettings {
                drive_db: 24.0,
                shape: WaveShape::HardClip,
                tone_hz: 2500.0,
                mix: 0.8,
                ..base
            },
            Self::MultiDecimated => DistortionSettings {
                drive_db: 3.0,
                decimation: 8,
                mix: 1.0,
                ..base
            },
            Self::MultiDistortedCubed => DistortionSettings {
                drive_db: 18.0,
                shape: WaveShape::Foldback,
                mix: 0.7,
                ..base
            },
            Self::SpeechAlienChatter => DistortionSettings {
                drive_db: 6.0,
                ring_hz: 90.0,
                mix: 0.8,
                ..base
            },
            Self::SpeechGoldenPi => DistortionSettings {
                drive_db: 9.0,
                ring_hz: 314.159,
                tone_hz: 5000.0,
                mix: 0.6,
                ..base
            },
            Self::SpeechRadioTower => DistortionSettings {
                drive_db: 15.0,
                shape: WaveShape::HardClip,
                tone_hz: 3000.0,
                mix: 1.0,
                ..base
            },
            Self::SpeechWaves => DistortionSettings {
                drive_db: 6.0,
                ring_hz: 4.0,
                mix: 0.5,
                ..base
            },
        }
    }
}

const PARAM_DRIVE: u32 = 0;
const PARAM_TONE: u32 = 1;
const PARAM_MIX: u32 = 2;

/// Per-channel state.
#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    tone: f32,
    held: f32,
    hold_count: usize,
}

pub struct DistortionProcessor {
    settings: DistortionSettings,
    channels: Vec<ChannelState>,
    sample_rate: f32,
    tone_coeff: f32,
    ring_phase: f32,
    info: NodeInfo,
}

impl DistortionProcessor {
    pub fn new(preset: Option<DistortionPreset>) -> Self {
        Self {
            settings: preset.map(DistortionPreset::settings).unwrap_or_default(),
            channels: Vec::new(),
            sample_rate: 48000.0,
            tone_coeff: 1.0,
            ring_phase: 0.0,
            info: NodeInfo::new("Distortion", "effect"),
        }
    }

    pub fn load_preset(&mut self, preset: DistortionPreset) {
        self.settings = preset.settings();
        self.recalculate_tone_coeff();
    }

    pub const fn settings(&self) -> &DistortionSettings {
        &self.settings
    }

    fn recalculate_tone_coeff(&mut self) {
        let normalized = (self.settings.tone_hz / self.sample_rate).min(0.5);
        self.tone_coeff = 1.0 - (-TAU * normalized).exp();
    }

    #[inline]
    fn shape(&self, x: f32) -> f32 {
        match self.settings.shape {
            WaveShape::SoftClip => x.tanh(),
            WaveShape::HardClip => x.clamp(-1.0, 1.0),
            WaveShape::Foldback => {
                let mut y = x;
                // At most eight folds per sample
                for _ in 0..8 {
                    if y > 1.0 {
                        y = 2.0 - y;
                    } else if y < -1.0 {
                        y = -2.0 - y;
                    } else {
                        break;
                    }
                }
                y.clamp(-1.0, 1.0)
            }
        }
    }
}

impl Processor for DistortionProcessor {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn initialize(&mut self, format: AudioFormat, _max_block_size: Frames) -> Result<(), NodeError> {
        self.sample_rate = format.sample_rate as f32;
        self.channels = vec![ChannelState::default(); format.channel_count];
        self.ring_phase = 0.0;
        self.recalculate_tone_coeff();
        Ok(())
    }

    fn process(&mut self, audio: &mut ProcessBuffer) -> Result<(), NodeError> {
        let channels = audio.input_channels;
        if channels == 0 || channels != self.channels.len() {
            return Err(NodeError::ProcessingFailed(format!(
                "Distortion initialized for {} channels, got {channels}",
                self.channels.len()
            )));
        }

        let drive = 10.0_f32.powf(self.settings.drive_db / 20.0);
        let levels = if self.settings.bits > 0 {
            2.0_f32.powi(self.settings.bits as i32 - 1)
        } else {
            0.0
        };
        let decimation = self.settings.decimation.max(1);
        let ring_step = TAU * self.settings.ring_hz / self.sample_rate;
        let mix = self.settings.mix;
        let tone_coeff = self.tone_coeff;

        let len = audio.frames * channels;
        for (out_frame, in_frame) in audio.output[..len]
            .chunks_exact_mut(channels)
            .zip(audio.input[..len].chunks_exact(channels))
        {
            let ring = if self.settings.ring_hz > 0.0 {
                self.ring_phase.sin()
            } else {
                1.0
            };
            self.ring_phase = (self.ring_phase + ring_step) % TAU;

            for ch in 0..channels {
                let dry = in_frame[ch];
                let mut wet = self.shape(dry * drive) * ring;
                if levels > 0.0 {
                    wet = (wet * levels).round() / levels;
                }

                let state = &mut self.channels[ch];
                if state.hold_count == 0 {
                    state.held = wet;
                }
                state.hold_count = (state.hold_count + 1) % decimation;
                state.tone += tone_coeff * (state.held - state.tone);

                out_frame[ch] = dry * (1.0 - mix) + state.tone * mix;
            }
        }
        Ok(())
    }

    fn set_parameter(&mut self, id: u32, value: f32) -> Result<(), NodeError> {
        match id {
            PARAM_DRIVE => self.settings.drive_db = value.clamp(-12.0, 40.0),
            PARAM_TONE => {
                self.settings.tone_hz = value.clamp(200.0, 20000.0);
                self.recalculate_tone_coeff();
            }
            PARAM_MIX => self.settings.mix = value.clamp(0.0, 1.0),
            _ => {
                return Err(NodeError::InvalidParameter(format!(
                    "Unknown parameter ID: {id}"
                )));
            }
        }
        Ok(())
    }

    fn get_parameter(&self, id: u32) -> Result<f32, NodeError> {
        match id {
            PARAM_DRIVE => Ok(self.settings.drive_db),
            PARAM_TONE => Ok(self.settings.tone_hz),
            PARAM_MIX => Ok(self.settings.mix),
            _ => Err(NodeError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            ))),
        }
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![
            ParameterInfo {
                id: PARAM_DRIVE,
                name: "Drive (dB)".to_string(),
                min_value: -12.0,
                max_value: 40.0,
                default_value: 12.0,
            },
            ParameterInfo {
                id: PARAM_TONE,
                name: "Tone (Hz)".to_string(),
                min_value: 200.0,
                max_value: 20000.0,
                default_value: 8000.0,
            },
            ParameterInfo {
                id: PARAM_MIX,
                name: "Mix".to_string(),
                min_value: 0.0,
                max_value: 1.0,
                default_value: 0.5,
            },
        ]
    }

    fn reset(&mut self) {
        self.channels.fill(ChannelState::default());
        self.ring_phase = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(dist: &mut DistortionProcessor, input: &[f32]) -> Vec<f32> {
        let mut output = vec![0.0; input.len()];
        let mut buffer = ProcessBuffer {
            input,
            output: &mut output,
            frames: input.len(),
            input_channels: 1,
            output_channels: 1,
        };
        dist.process(&mut buffer).unwrap();
        output
    }

    #[test]
    fn test_output_stays_bounded() {
        for &preset in DistortionPreset::ALL {
            let mut dist = DistortionProcessor::new(Some(preset));
            dist.initialize(AudioFormat::float32(48000, 1), 512).unwrap();
            let input: Vec<f32> = (0..512).map(|i| ((i as f32) * 0.05).sin() * 4.0).collect();
            let output = run(&mut dist, &input);
            let bound = 4.0 * (1.0 - preset.settings().mix) + 1.0 + 1e-4;
            assert!(
                output.iter().all(|s| s.is_finite() && s.abs() <= bound),
                "{preset:?} exceeded {bound}"
            );
        }
    }

    #[test]
    fn test_preset_changes_settings() {
        let mut dist = DistortionProcessor::new(None);
        assert_eq!(*dist.settings(), DistortionSettings::default());
        dist.load_preset(DistortionPreset::SpeechGoldenPi);
        assert!(dist.settings().ring_hz > 0.0);
    }

    #[test]
    fn test_silence_in_silence_out() {
        let mut dist = DistortionProcessor::new(Some(DistortionPreset::SpeechRadioTower));
        dist.initialize(AudioFormat::float32(48000, 1), 64).unwrap();
        assert!(run(&mut dist, &[0.0; 64]).iter().all(|&s| s == 0.0));
    }
}
