//! Player processor - loops a decoded source buffer.

use kara_core::{AudioBuffer, AudioFormat, ChannelCount, Frames};
use kara_node::{NodeError, NodeInfo, ProcessBuffer, Processor};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Play/pause flag and position shared with the control thread.
///
/// Pausing only clears the flag; the runtime keeps rendering silence and the
/// position stays where it was, so resuming continues from the same frame.
#[derive(Debug, Default)]
pub struct Transport {
    playing: AtomicBool,
    position: AtomicU64,
}

impl Transport {
    pub fn play(&self) {
        self.playing.store(true, Ordering::Release);
    }

    pub fn pause(&self) {
        self.playing.store(false, Ordering::Release);
    }

    /// Stop and rewind to the first frame.
    pub fn stop(&self) {
        self.playing.store(false, Ordering::Release);
        self.position.store(0, Ordering::Release);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Frames rendered since the last rewind.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }
}

/// Source material plus its transport.
#[derive(Clone)]
pub struct PlayerHandle {
    pub buffer: Arc<AudioBuffer>,
    pub transport: Arc<Transport>,
}

impl PlayerHandle {
    /// `buffer` must already be at the device sample rate.
    pub fn new(buffer: AudioBuffer) -> Self {
        Self {
            buffer: Arc::new(buffer.to_interleaved()),
            transport: Arc::new(Transport::default()),
        }
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::float32(
            self.buffer.format().sample_rate,
            self.buffer.format().channel_count,
        )
    }
}

/// Looping whole-buffer playback.
///
/// The buffer is shared immutably with the control thread; the position is
/// read at the start of each block and published at the end.
pub struct PlayerProcessor {
    handle: PlayerHandle,
    info: NodeInfo,
}

impl PlayerProcessor {
    pub fn new(handle: PlayerHandle) -> Self {
        Self {
            handle,
            info: NodeInfo::new("Player", "player"),
        }
    }
}

impl Processor for PlayerProcessor {
    fn info(&self) -> &NodeInfo {
        &self.info
    }

    fn initialize(&mut self, format: AudioFormat, _max_block_size: Frames) -> Result<(), NodeError> {
        let own = self.handle.format();
        if own.sample_rate != format.sample_rate {
            return Err(NodeError::InitializationFailed(format!(
                "Player buffer is {} Hz but the chain runs at {} Hz",
                own.sample_rate, format.sample_rate
            )));
        }
        Ok(())
    }

    fn output_channels(&self, _input_channels: ChannelCount) -> ChannelCount {
        self.handle.buffer.format().channel_count
    }

    fn process(&mut self, audio: &mut ProcessBuffer) -> Result<(), NodeError> {
        let channels = self.handle.buffer.format().channel_count;
        let len = audio.frames * channels;
        if audio.output.len() < len {
            return Err(NodeError::ProcessingFailed(format!(
                "Player output has {} samples, need {len}",
                audio.output.len()
            )));
        }

        let transport = &self.handle.transport;
        let samples = self.handle.buffer.samples();
        let frame_count = self.handle.buffer.frame_count();
        if !transport.is_playing() || frame_count == 0 {
            audio.output[..len].fill(0.0);
            return Ok(());
        }

        let mut position = transport.position.load(Ordering::Acquire);
        for frame in audio.output[..len].chunks_exact_mut(channels) {
            let start = (position % frame_count as u64) as usize * channels;
            frame.copy_from_slice(&samples[start..start + channels]);
            position += 1;
        }
        transport.position.store(position, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(player: &mut PlayerProcessor, frames: usize) -> Vec<f32> {
        let channels = player.output_channels(0);
        let mut output = vec![9.0; frames * channels];
        let mut buffer = ProcessBuffer {
            input: &[],
            output: &mut output,
            frames,
            input_channels: 0,
            output_channels: channels,
        };
        player.process(&mut buffer).unwrap();
        output
    }

    fn stereo_ramp() -> PlayerHandle {
        let format = AudioFormat::float32(48000, 2);
        PlayerHandle::new(
            AudioBuffer::from_samples(format, vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3]).unwrap(),
        )
    }

    #[test]
    fn test_silent_until_played() {
        let handle = stereo_ramp();
        let mut player = PlayerProcessor::new(handle.clone());
        assert_eq!(render(&mut player, 2), vec![0.0; 4]);
        assert_eq!(handle.transport.position(), 0);
    }

    #[test]
    fn test_loops_over_buffer() {
        let handle = stereo_ramp();
        let mut player = PlayerProcessor::new(handle.clone());
        handle.transport.play();
        let out = render(&mut player, 4);
        assert_eq!(out, vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3, 0.1, -0.1]);
        assert_eq!(handle.transport.position(), 4);
    }

    #[test]
    fn test_pause_keeps_position() {
        let handle = stereo_ramp();
        let mut player = PlayerProcessor::new(handle.clone());
        handle.transport.play();
        render(&mut player, 2);
        handle.transport.pause();
        render(&mut player, 2);
        assert_eq!(handle.transport.position(), 2);
        handle.transport.play();
        assert_eq!(render(&mut player, 1), vec![0.3, -0.3]);
    }

    #[test]
    fn test_rejects_rate_mismatch() {
        let mut player = PlayerProcessor::new(stereo_ramp());
        assert!(player.initialize(AudioFormat::float32(44100, 2), 256).is_err());
        assert!(player.initialize(AudioFormat::float32(48000, 2), 256).is_ok());
    }
}
