//! Mixer processor - folds the capture chain to mono and adds the backing track.

use kara_comms::SharedGain;
use kara_core::{AudioFormat, ChannelCount, Frames, Sample};
use kara_node::{NodeError, NodeInfo, ParameterInfo, ProcessBuffer, Processor};
use std::sync::Arc;

/// Shared mixer controls and the optional backing track.
///
/// The backing track is mono at the device sample rate and loops for as
/// long as the chain runs.
#[derive(Clone, Default)]
pub struct MixerSettings {
    pub voice_gain: Arc<SharedGain>,
    pub backing_gain: Arc<SharedGain>,
    pub backing: Option<Arc<[Sample]>>,
}

/// Capture sink: mono mix of the voice chain plus background music.
///
/// ## Signal Flow
///
/// ```text
/// voice (N ch) --[downmix]--[voice gain]--\
///                                          >-- mono out (tap point)
/// backing (mono, looped) --[backing gain]-/
/// ```
///
/// ## Parameters
///
/// - **0**: Voice gain (0.0 to 2.0, default 1.0)
/// - **1**: Backing gain (0.0 to 2.0, default 1.0)
pub struct MixerProcessor {
    settings: MixerSettings,
    backing_position: usize,
    info: NodeInfo,
}

impl MixerProcessor {
    pub fn new(settings: MixerSettings) -> Self {
        Self {
            settings,
            backing_position: 0,
            info: NodeInfo::new("Mixer", "mixer"),
        }
    }
}

impl Processor for MixerProcessor {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn initialize(&mut self, _format: AudioFormat, _max_block_size: Frames) -> Result<(), NodeError> {
        self.backing_position = 0;
        Ok(())
    }

    fn output_channels(&self, _input_channels: ChannelCount) -> ChannelCount {
        1
    }

    fn process(&mut self, audio: &mut ProcessBuffer) -> Result<(), NodeError> {
        let channels = audio.input_channels.max(1);
        if audio.output.len() < audio.frames || audio.input.len() < audio.frames * channels {
            return Err(NodeError::ProcessingFailed(format!(
                "Mixer needs {} frames, got {} in / {} out",
                audio.frames,
                audio.input.len() / channels,
                audio.output.len()
            )));
        }

        let voice_gain = self.settings.voice_gain.get() / channels as Sample;
        for (out, frame) in audio.output[..audio.frames]
            .iter_mut()
            .zip(audio.input.chunks_exact(channels))
        {
            *out = frame.iter().sum::<Sample>() * voice_gain;
        }

        if let Some(backing) = &self.settings.backing {
            if !backing.is_empty() {
                let gain = self.settings.backing_gain.get();
                for out in &mut audio.output[..audio.frames] {
                    *out += backing[self.backing_position] * gain;
                    self.backing_position = (self.backing_position + 1) % backing.len();
                }
            }
        }

        Ok(())
    }

    fn set_parameter(&mut self, id: u32, value: f32) -> Result<(), NodeError> {
        let clamped = value.clamp(0.0, 2.0);
        match id {
            0 => self.settings.voice_gain.set(clamped),
            1 => self.settings.backing_gain.set(clamped),
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
            0 => Ok(self.settings.voice_gain.get()),
            1 => Ok(self.settings.backing_gain.get()),
            _ => Err(NodeError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            ))),
        }
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![
            ParameterInfo {
                id: 0,
                name: "Voice Gain".to_string(),
                min_value: 0.0,
                max_value: 2.0,
                default_value: 1.0,
            },
            ParameterInfo {
                id: 1,
                name: "Backing Gain".to_string(),
                min_value: 0.0,
                max_value: 2.0,
                default_value: 1.0,
            },
        ]
    }

    fn reset(&mut self) {
        self.backing_position = 0;
    }
}
