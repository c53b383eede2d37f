//! Device endpoints: the capture input source and the playback output sink.

use kara_core::{AudioFormat, Frames};
use kara_node::{NodeError, NodeInfo, ProcessBuffer, Processor};

/// Forwards the device's captured input into the chain.
pub struct InputProcessor {
    info: NodeInfo,
}

impl Default for InputProcessor {
    fn default() -> Self {
        Self {
            info: NodeInfo::new("Input", "input"),
        }
    }
}

impl Processor for InputProcessor {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn initialize(&mut self, _format: AudioFormat, _max_block_size: Frames) -> Result<(), NodeError> {
        Ok(())
    }

    fn process(&mut self, audio: &mut ProcessBuffer) -> Result<(), NodeError> {
        audio.pass_through();
        Ok(())
    }
}

/// Terminal node of the playback chain. The render chain maps its output
/// onto the device channels.
pub struct OutputProcessor {
    info: NodeInfo,
}

impl Default for OutputProcessor {
    fn default() -> Self {
        Self {
            info: NodeInfo::new("Output", "output"),
        }
    }
}

impl Processor for OutputProcessor {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn initialize(&mut self, _format: AudioFormat, _max_block_size: Frames) -> Result<(), NodeError> {
        Ok(())
    }

    fn process(&mut self, audio: &mut ProcessBuffer) -> Result<(), NodeError> {
        audio.pass_through();
        Ok(())
    }
}
