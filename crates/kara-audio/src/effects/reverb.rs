//! Algorithmic reverb.
//!
//! Freeverb topology: parallel damped combs into series allpasses. The input
//! is summed to mono for the tank and the tail is spread back to every
//! channel with a small per-channel offset in the allpass tuning.

use super::ReverbPreset;
use super::dsp::{AllpassFilter, CombFilter};
use kara_core::{AudioFormat, Frames};
use kara_node::{NodeError, NodeInfo, ParameterInfo, ProcessBuffer, Processor};

/// Comb delay times at 44.1 kHz, mutually prime.
const COMB_TUNINGS_44K: [usize; 8] = [1116, 1188, 1277, 1356, 1422, 1491, 1557, 1617];
/// Allpass delay times at 44.1 kHz.
const ALLPASS_TUNINGS_44K: [usize; 4] = [556, 441, 341, 225];
const STEREO_SPREAD: usize = 23;
const REFERENCE_RATE: f32 = 44100.0;

fn scale_to_rate(samples: usize, target_rate: f32) -> usize {
    ((samples as f32 * target_rate / REFERENCE_RATE).round() as usize).max(1)
}

/// Tank parameters a preset expands to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReverbSettings {
    pub room_size: f32,
    pub decay: f32,
    pub damping: f32,
    pub mix: f32,
}

impl Default for ReverbSettings {
    fn default() -> Self {
        Self {
            room_size: 0.5,
            decay: 0.5,
            damping: 0.5,
            mix: 0.3,
        }
    }
}

impl ReverbPreset {
    pub fn settings(self) -> ReverbSettings {
        let (room_size, decay, damping, mix) = match self {
            Self::SmallRoom => (0.2, 0.3, 0.6, 0.25),
            Self::MediumRoom => (0.4, 0.4, 0.5, 0.3),
            Self::LargeRoom => (0.6, 0.5, 0.5, 0.35),
            Self::MediumHall => (0.7, 0.6, 0.4, 0.35),
            Self::LargeHall => (0.85, 0.75, 0.35, 0.4),
            Self::Plate => (0.5, 0.6, 0.1, 0.35),
            Self::MediumChamber => (0.5, 0.5, 0.45, 0.3),
            Self::LargeChamber => (0.7, 0.6, 0.4, 0.35),
            Self::Cathedral => (0.95, 0.9, 0.25, 0.5),
        };
        ReverbSettings {
            room_size,
            decay,
            damping,
            mix,
        }
    }
}

const PARAM_ROOM: u32 = 0;
const PARAM_DECAY: u32 = 1;
const PARAM_DAMPING: u32 = 2;
const PARAM_MIX: u32 = 3;

pub struct ReverbProcessor {
    settings: ReverbSettings,
    combs: Vec<CombFilter>,
    /// One allpass chain per output channel
    allpasses: Vec<Vec<AllpassFilter>>,
    info: NodeInfo,
}

impl ReverbProcessor {
    pub fn new(preset: Option<ReverbPreset>) -> Self {
        Self {
            settings: preset.map(ReverbPreset::settings).unwrap_or_default(),
            combs: Vec::new(),
            allpasses: Vec::new(),
            info: NodeInfo::new("Reverb", "effect"),
        }
    }

    pub fn load_preset(&mut self, preset: ReverbPreset) {
        self.settings = preset.settings();
        self.update_combs();
    }

    pub const fn settings(&self) -> &ReverbSettings {
        &self.settings
    }

    fn update_combs(&mut self) {
        let scaled_room = 0.28 + self.settings.room_size * 0.7;
        let feedback = scaled_room + self.settings.decay * (0.98 - scaled_room);
        for comb in &mut self.combs {
            comb.set_feedback(feedback);
            comb.set_damp(self.settings.damping);
        }
    }
}

impl Processor for ReverbProcessor {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn initialize(&mut self, format: AudioFormat, _max_block_size: Frames) -> Result<(), NodeError> {
        let rate = format.sample_rate as f32;
        self.combs = COMB_TUNINGS_44K
            .iter()
            .map(|&t| CombFilter::new(scale_to_rate(t, rate)))
            .collect();
        self.allpasses = (0..format.channel_count)
            .map(|ch| {
                ALLPASS_TUNINGS_44K
                    .iter()
                    .map(|&t| AllpassFilter::new(scale_to_rate(t + ch * STEREO_SPREAD, rate)))
                    .collect()
            })
            .collect();
        self.update_combs();
        Ok(())
    }

    fn process(&mut self, audio: &mut ProcessBuffer) -> Result<(), NodeError> {
        let channels = audio.input_channels;
        if channels == 0 || channels != self.allpasses.len() {
            return Err(NodeError::ProcessingFailed(format!(
                "Reverb initialized for {} channels, got {channels}",
                self.allpasses.len()
            )));
        }

        let mix = self.settings.mix;
        let input_scale = 1.0 / channels as f32;
        let len = audio.frames * channels;
        for (out_frame, in_frame) in audio.output[..len]
            .chunks_exact_mut(channels)
            .zip(audio.input[..len].chunks_exact(channels))
        {
            let mono = in_frame.iter().sum::<f32>() * input_scale;
            let mut tank = 0.0;
            for comb in &mut self.combs {
                tank += comb.process(mono);
            }
            tank *= 0.125;

            for ((out, &dry), chain) in out_frame.iter_mut().zip(in_frame).zip(&mut self.allpasses) {
                let mut wet = tank;
                for allpass in chain.iter_mut() {
                    wet = allpass.process(wet);
                }
                *out = dry * (1.0 - mix) + wet * mix;
            }
        }
        Ok(())
    }

    fn set_parameter(&mut self, id: u32, value: f32) -> Result<(), NodeError> {
        let value = value.clamp(0.0, 1.0);
        match id {
            PARAM_ROOM => self.settings.room_size = value,
            PARAM_DECAY => self.settings.decay = value,
            PARAM_DAMPING => self.settings.damping = value,
            PARAM_MIX => self.settings.mix = value,
            _ => {
                return Err(NodeError::InvalidParameter(format!(
                    "Unknown parameter ID: {id}"
                )));
            }
        }
        self.update_combs();
        Ok(())
    }

    fn get_parameter(&self, id: u32) -> Result<f32, NodeError> {
        match id {
            PARAM_ROOM => Ok(self.settings.room_size),
            PARAM_DECAY => Ok(self.settings.decay),
            PARAM_DAMPING => Ok(self.settings.damping),
            PARAM_MIX => Ok(self.settings.mix),
            _ => Err(NodeError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            ))),
        }
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        ["Room Size", "Decay", "Damping", "Mix"]
            .iter()
            .zip([PARAM_ROOM, PARAM_DECAY, PARAM_DAMPING, PARAM_MIX])
            .map(|(name, id)| ParameterInfo {
                id,
                name: (*name).to_string(),
                min_value: 0.0,
                max_value: 1.0,
                default_value: 0.5,
            })
            .collect()
    }

    fn reset(&mut self) {
        for comb in &mut self.combs {
            comb.clear();
        }
        for allpass in self.allpasses.iter_mut().flatten() {
            allpass.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_impulse_produces_finite_tail() {
        let mut reverb = ReverbProcessor::new(Some(ReverbPreset::Cathedral));
        reverb.initialize(AudioFormat::float32(48000, 2), 8192).unwrap();

        let frames = 8192;
        let mut input = vec![0.0; frames * 2];
        input[0] = 1.0;
        input[1] = 1.0;
        let mut output = vec![0.0; frames * 2];
        let mut buffer = ProcessBuffer {
            input: &input,
            output: &mut output,
            frames,
            input_channels: 2,
            output_channels: 2,
        };
        reverb.process(&mut buffer).unwrap();

        assert!(output.iter().all(|s| s.is_finite()));
        let tail_energy: f32 = output[4000..].iter().map(|s| s * s).sum();
        assert!(tail_energy > 0.0);
        // spread makes the channels differ
        assert!(output.chunks_exact(2).any(|f| (f[0] - f[1]).abs() > 1e-6));
    }

    #[test]
    fn test_presets_differ() {
        assert_ne!(
            ReverbPreset::SmallRoom.settings(),
            ReverbPreset::Cathedral.settings()
        );
        let mut reverb = ReverbProcessor::new(None);
        assert_eq!(*reverb.settings(), ReverbSettings::default());
        reverb.load_preset(ReverbPreset::Plate);
        assert_eq!(reverb.get_parameter(PARAM_DAMPING).unwrap(), 0.1);
    }
}
