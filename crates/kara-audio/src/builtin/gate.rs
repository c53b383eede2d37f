//! Mute gate - gain stage between the capture input and the effect.

use kara_comms::SharedGain;
use kara_core::{AudioFormat, Frames};
use kara_node::{NodeError, NodeInfo, ParameterInfo, ProcessBuffer, Processor};
use std::sync::Arc;

/// Gain stage whose value is shared with the control thread.
///
/// Muting is a gain change on the live chain, never a topology change: the
/// controller flips the shared value between 0.0 and 1.0 and the next block
/// picks it up.
///
/// ## Parameter Range
///
/// Gain: 0.0 to 2.0 (linear)
/// - 0.0 = muted
/// - 1.0 = unity gain (default)
pub struct GateProcessor {
    gain: Arc<SharedGain>,
    info: NodeInfo,
}

impl GateProcessor {
    pub fn new(gain: Arc<SharedGain>) -> Self {
        Self {
            gain,
            info: NodeInfo::new("Gate", "gate"),
        }
    }
}

impl Processor for GateProcessor {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn initialize(&mut self, _format: AudioFormat, _max_block_size: Frames) -> Result<(), NodeError> {
        Ok(())
    }

    fn process(&mut self, audio: &mut ProcessBuffer) -> Result<(), NodeError> {
        let gain = self.gain.get();
        let len = audio.frames * audio.output_channels;
        if audio.input.len() < len || audio.output.len() < len {
            return Err(NodeError::ProcessingFailed(format!(
                "Gate needs {len} samples, got {} in / {} out",
                audio.input.len(),
                audio.output.len()
            )));
        }

        for (out, &sample) in audio.output[..len].iter_mut().zip(&audio.input[..len]) {
            *out = sample * gain;
        }
        Ok(())
    }

    fn set_parameter(&mut self, id: u32, value: f32) -> Result<(), NodeError> {
        match id {
            0 => {
                self.gain.set(value.clamp(0.0, 2.0));
                Ok(())
            }
            _ => Err(NodeError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            ))),
        }
    }

    fn get_parameter(&self, id: u32) -> Result<f32, NodeError> {
        match id {
            0 => Ok(self.gain.get()),
            _ => Err(NodeError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            ))),
        }
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![ParameterInfo {
            id: 0,
            name: "Gain".to_string(),
            min_value: 0.0,
            max_value: 2.0,
            default_value: 1.0,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(gate: &mut GateProcessor, input: &[f32]) -> Vec<f32> {
        let mut output = vec![0.0; input.len()];
        let mut buffer = ProcessBuffer {
            input,
            output: &mut output,
            frames: input.len(),
            input_channels: 1,
            output_channels: 1,
        };
        gate.process(&mut buffer).unwrap();
        output
    }

    #[test]
    fn test_gate_follows_shared_gain() {
        let gain = Arc::new(SharedGain::default());
        let mut gate = GateProcessor::new(Arc::clone(&gain));
        assert_eq!(run(&mut gate, &[0.5, -0.5]), vec![0.5, -0.5]);

        gain.set(0.0);
        assert_eq!(run(&mut gate, &[0.5, -0.5]), vec![0.0, -0.0]);
    }

    #[test]
    fn test_gate_parameter_clamped() {
        let gain = Arc::new(SharedGain::default());
        let mut gate = GateProcessor::new(Arc::clone(&gain));
        gate.set_parameter(0, 5.0).unwrap();
        assert_eq!(gain.get(), 2.0);
        assert!(gate.set_parameter(1, 0.0).is_err());
    }
}
