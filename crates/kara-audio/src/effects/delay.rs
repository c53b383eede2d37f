//! Feedback delay.

use super::dsp::DelayLine;
use super::{DelayTime, MAX_DELAY_SECONDS};
use kara_core::{AudioFormat, Frames};
use kara_node::{NodeError, NodeInfo, ParameterInfo, ProcessBuffer, Processor};

const PARAM_TIME: u32 = 0;
const PARAM_FEEDBACK: u32 = 1;
const PARAM_MIX: u32 = 2;

/// Echo with feedback, one delay line per channel.
///
/// # Parameters
///
/// - **0** time: seconds (up to 2.0)
/// - **1** feedback: 0.0-0.95
/// - **2** mix: 0.0-1.0 wet/dry
pub struct DelayProcessor {
    lines: Vec<DelayLine>,
    time: f32,
    delay_samples: usize,
    feedback: f32,
    mix: f32,
    sample_rate: f32,
    info: NodeInfo,
}

impl DelayProcessor {
    pub fn new(time: DelayTime) -> Self {
        Self {
            lines: Vec::new(),
            time: time.seconds(),
            delay_samples: 0,
            feedback: 0.5,
            mix: 0.5,
            sample_rate: 48000.0,
            info: NodeInfo::new("Delay", "effect"),
        }
    }

    fn update_delay_samples(&mut self) {
        self.delay_samples = ((self.time * self.sample_rate).round() as usize).max(1);
    }
}

impl Processor for DelayProcessor {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn initialize(&mut self, format: AudioFormat, _max_block_size: Frames) -> Result<(), NodeError> {
        self.sample_rate = format.sample_rate as f32;
        let capacity = (MAX_DELAY_SECONDS * self.sample_rate).ceil() as usize;
        self.lines = vec![DelayLine::new(capacity); format.channel_count];
        self.update_delay_samples();
        Ok(())
    }

    fn process(&mut self, audio: &mut ProcessBuffer) -> Result<(), NodeError> {
        let channels = audio.input_channels;
        if channels == 0 || channels != self.lines.len() {
            return Err(NodeError::ProcessingFailed(format!(
                "Delay initialized for {} channels, got {channels}",
                self.lines.len()
            )));
        }

        let len = audio.frames * channels;
        for (out_frame, in_frame) in audio.output[..len]
            .chunks_exact_mut(channels)
            .zip(audio.input[..len].chunks_exact(channels))
        {
            for ((out, &dry), line) in out_frame.iter_mut().zip(in_frame).zip(&mut self.lines) {
                let wet = line.read(self.delay_samples - 1);
                line.write(dry + wet * self.feedback);
                *out = dry * (1.0 - self.mix) + wet * self.mix;
            }
        }
        Ok(())
    }

    fn set_parameter(&mut self, id: u32, value: f32) -> Result<(), NodeError> {
        match id {
            PARAM_TIME => {
                let time = DelayTime::new(value)
                    .map_err(|e| NodeError::InvalidParameter(e.to_string()))?;
                self.time = time.seconds();
                self.update_delay_samples();
            }
            PARAM_FEEDBACK => self.feedback = value.clamp(0.0, 0.95),
            PARAM_MIX => self.mix = value.clamp(0.0, 1.0),
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
            PARAM_TIME => Ok(self.time),
            PARAM_FEEDBACK => Ok(self.feedback),
            PARAM_MIX => Ok(self.mix),
            _ => Err(NodeError::InvalidParameter(format!(
                "Unknown parameter ID: {id}"
            ))),
        }
    }

    fn parameters(&self) -> Vec<ParameterInfo> {
        vec![
            ParameterInfo {
                id: PARAM_TIME,
                name: "Time".to_string(),
                min_value: 0.001,
                max_value: MAX_DELAY_SECONDS,
                default_value: 1.0,
            },
            ParameterInfo {
                id: PARAM_FEEDBACK,
                name: "Feedback".to_string(),
                min_value: 0.0,
                max_value: 0.95,
                default_value: 0.5,
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
        for line in &mut self.lines {
            line.clear();
        }
    }
}
