//! Processing node abstraction.
//!
//! Every node in an audio graph is realised at start time as a boxed
//! [`Processor`]. Sources, the mute gate, effects and sinks all implement the
//! same trait so the render chain can run them without knowing what they are.

use kara_core::{AudioFormat, ChannelCount, Frames, Sample};

/// Interleaved audio handed to a processor for one block.
///
/// `input` is empty for source nodes that generate their own signal.
pub struct ProcessBuffer<'a> {
    pub input: &'a [Sample],
    pub output: &'a mut [Sample],
    pub frames: Frames,
    pub input_channels: ChannelCount,
    pub output_channels: ChannelCount,
}

impl ProcessBuffer<'_> {
    /// Copy input to output, channel counts permitting. Missing channels are zeroed.
    pub fn pass_through(&mut self) {
        if self.input_channels == self.output_channels && self.input.len() >= self.output.len() {
            let len = self.output.len();
            self.output.copy_from_slice(&self.input[..len]);
            return;
        }
        for frame in 0..self.frames {
            for ch in 0..self.output_channels {
                self.output[frame * self.output_channels + ch] = if ch < self.input_channels {
                    self.input
                        .get(frame * self.input_channels + ch)
                        .copied()
                        .unwrap_or(0.0)
                } else {
                    0.0
                };
            }
        }
    }
}

/// Information about a parameter
#[derive(Debug, Clone)]
pub struct ParameterInfo {
    pub id: u32,
    pub name: String,
    pub min_value: f32,
    pub max_value: f32,
    pub default_value: f32,
}

/// Processor metadata
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub kind: String,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
        }
    }
}

/// Realtime processing capability of a graph node.
///
/// `process` runs on the device's realtime thread: implementations must not
/// allocate, lock, or log there. All buffers are sized in `initialize`.
pub trait Processor: Send {
    /// Get processor information
    fn info(&self) -> &NodeInfo;

    /// Prepare for processing `format` (the node's input format) in blocks
    /// of at most `max_block_size` frames.
    fn initialize(&mut self, format: AudioFormat, max_block_size: Frames)
    -> Result<(), NodeError>;

    /// Channel count this node produces for the given input channel count.
    fn output_channels(&self, input_channels: ChannelCount) -> ChannelCount {
        input_channels
    }

    /// Process one block
    fn process(&mut self, audio: &mut ProcessBuffer) -> Result<(), NodeError>;

    /// Set a parameter value
    fn set_parameter(&mut self, id: u32, value: f32) -> Result<(), NodeError> {
        Err(NodeError::InvalidParameter(format!(
            "{} has no parameter {id} (value {value})",
            self.info().name
        )))
    }

    /// Get a parameter value
    fn get_parameter(&self, id: u32) -> Result<f32, NodeError> {
        Err(NodeError::InvalidParameter(format!(
            "{} has no parameter {id}",
            self.info().name
        )))
    }

    /// Get all parameters
    fn parameters(&self) -> Vec<ParameterInfo> {
        Vec::new()
    }

    /// Clear internal state (delay lines, filter memory)
    fn reset(&mut self) {}
}

/// Node-related errors
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Node initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Node processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}
