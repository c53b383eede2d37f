//! Three-band equalizer (low shelf, mid peak, high shelf).

use super::dsp::{Biquad, high_shelf_coefficients, low_shelf_coefficients, peaking_coefficients};
use kara_core::{AudioFormat, Frames};
use kara_node::{NodeError, NodeInfo, ParameterInfo, ProcessBuffer, Processor};

const PARAM_LOW_GAIN: u32 = 0;
const PARAM_MID_GAIN: u32 = 1;
const PARAM_HIGH_GAIN: u32 = 2;
const PARAM_MID_FREQ: u32 = 3;

const LOW_FREQ: f32 = 120.0;
const HIGH_FREQ: f32 = 6000.0;
const MID_Q: f32 = 1.0;
const GAIN_RANGE_DB: f32 = 12.0;

#[derive(Debug, Clone, Default)]
struct ChannelFilters {
    low: Biquad,
    mid: Biquad,
    high: Biquad,
}

/// Flat by default; gains are set through parameters.
///
/// # Parameters
///
/// - **0** low gain (dB, ±12, shelf at 120 Hz)
/// - **1** mid gain (dB, ±12)
/// - **2** high gain (dB, ±12, shelf at 6 kHz)
/// - **3** mid frequency (Hz, 200-5000)
pub struct EqualizerProcessor {
    filters: Vec<ChannelFilters>,
    low_gain: f32,
    mid_gain: f32,
    high_gain: f32,
    mid_freq: f32,
    sample_rate: f32,
    info: NodeInfo,
}

impl Default for EqualizerProcessor {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            low_gain: 0.0,
            mid_gain: 0.0,
            high_gain: 0.0,
            mid_freq: 1000.0,
            sample_rate: 48000.0,
            info: NodeInfo::new("Equalizer", "effect"),
        }
    }
}

impl EqualizerProcessor {
    fn update_coefficients(&mut self) {
        let low = low_shelf_coefficients(LOW_FREQ, self.low_gain, self.sample_rate);
        let mid = peaking_coefficients(self.mid_freq, MID_Q, self.mid_gain, self.sample_rate);
        let high = high_shelf_coefficients(HIGH_FREQ, self.high_gain, self.sample_rate);
        for channel in &mut self.filters {
            channel.low.set_coefficients(low);
            channel.mid.set_coefficients(mid);
            channel.high.set_coefficients(high);
        }
    }
}

impl Processor for EqualizerProcessor {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn initialize(&mut self, format: AudioFormat, _max_block_size: Frames) -> Result<(), NodeError> {
        self.sample_rate = format.sample_rate as f32;
        self.filters = vec![ChannelFilters::default(); format.channel_count];
        self.update_coefficients();
        Ok(())
    }

    fn process(&mut self, audio: &mut ProcessBuffer) -> Result<(), NodeError> {
        let channels = audio.input_channels;
        if channels == 0 || channels != self.filters.len() {
            return Err(NodeError::ProcessingFailed(format!(
                "Equalizer initialized for {} channels, got {channels}",
                self.filters.len()
            )));
        }

        let len = audio.frames * channels;
        for (out_frame, in_frame) in audio.output[..len]
            .chunks_exact_mut(channels)
            .zip(audio.input[..len].chunks_exact(channels))
        {
            for ((out, &x), f) in out_frame.iter_mut().zip(in_frame).zip(&mut self.filters) {
                *out = f.high.process(f.mid.process(f.low.process(x)));
            }
        }
        Ok(())
    }

    fn set_parameter(&mut self, id: u32, value: f32) -> Result<(), NodeError> {
        let gain = value.clamp(-GAIN_RANGE_DB, GAIN_RANGE_DB);
        match id {
            PARAM_LOW_GAIN => self.low_gain = gain,
            PARAM_MID_GAIN => self.mid_gain = gain,
            PARAM_HIGH_GAIN => self.high_gain = gain,
            PARAM_MID_FREQ => self.mid_freq = value.clamp(200.0, 5000.0),
            _ => {
                return Err(NodeError::InvalidParameter(format!(
                    "Unknown parameter ID: {id}"
                )));
            }
        }
        self.update_coefficients();
        Ok(())
    }

    fn get_parameter(&self, id: u32) -> Result<f32, NodeError> {
        match id {
            PARAM_LOW_GAIN => Ok(self.low_gain),
            PARAM_MID_GAIN => Ok(self.mid_gain),
            PARAM_HIGH_GAIN => Ok(self.high_gain),
            PARAM_MID_FREQ => Ok(self.mid_freq),
            _ => Err(NodeError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            ))),
        }
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        let band = |id, name: &str| ParameterInfo {
            id,
            name: name.to_string(),
            min_value: -GAIN_RANGE_DB,
            max_value: GAIN_RANGE_DB,
            default_value: 0.0,
        };
        vec![
            band(PARAM_LOW_GAIN, "Low Gain (dB)"),
            band(PARAM_MID_GAIN, "Mid Gain (dB)"),
            band(PARAM_HIGH_GAIN, "High Gain (dB)"),
            ParameterInfo {
                id: PARAM_MID_FREQ,
                name: "Mid Frequency (Hz)".to_string(),
                min_value: 200.0,
                max_value: 5000.0,
                default_value: 1000.0,
            },
        ]
    }

    fn reset(&mut self) {
        for channel in &mut self.filters {
            channel.low.clear();
            channel.mid.clear();
            channel.high.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn run(eq: &mut EqualizerProcessor, input: &[f32], channels: usize) -> Vec<f32> {
        let mut output = vec![0.0; input.len()];
        let mut buffer = ProcessBuffer {
            input,
            output: &mut output,
            frames: input.len() / channels,
            input_channels: channels,
            output_channels: channels,
        };
        eq.process(&mut buffer).unwrap();
        output
    }

    #[test]
    fn test_flat_eq_passes_signal() {
        let mut eq = EqualizerProcessor::default();
        eq.initialize(AudioFormat::float32(48000, 2), 256).unwrap();
        let input: Vec<f32> = (0..256).map(|i| ((i as f32) * 0.1).sin() * 0.5).collect();
        let output = run(&mut eq, &input, 2);
        for (a, b) in input.iter().zip(&output) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_low_cut_attenuates_dc() {
        let mut eq = EqualizerProcessor::default();
        eq.initialize(AudioFormat::float32(48000, 1), 4096).unwrap();
        eq.set_parameter(PARAM_LOW_GAIN, -12.0).unwrap();
        let output = run(&mut eq, &[1.0; 4096], 1);
        assert!(output[4095] < 0.3);
    }

    #[test]
    fn test_gain_clamped() {
        let mut eq = EqualizerProcessor::default();
        eq.set_parameter(PARAM_HIGH_GAIN, 40.0).unwrap();
        assert_eq!(eq.get_parameter(PARAM_HIGH_GAIN).unwrap(), GAIN_RANGE_DB);
        assert_eq!(eq.parameters().len(), 4);
    }
}
