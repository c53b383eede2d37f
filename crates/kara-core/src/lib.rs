//! Core types, formats, and buffers shared across the kara crates.
//!
//! Everything that crosses a crate boundary as audio data is described here:
//! the scalar aliases, [`AudioFormat`], and the owned [`AudioBuffer`].

use serde::{Deserialize, Serialize};

/// Sample rate in Hz
pub type SampleRate = u32;

/// Number of audio frames (samples per channel)
pub type Frames = usize;

/// Audio sample type (all internal processing is 32-bit float)
pub type Sample = f32;

/// Number of audio channels
pub type ChannelCount = usize;

/// Common sample rates
pub mod sample_rates {
    use super::SampleRate;

    /// 44.1 kHz sample rate (CD quality)
    pub const SR_44100: SampleRate = 44100;
    /// 48 kHz sample rate (professional audio standard)
    pub const SR_48000: SampleRate = 48000;
}

/// Audio buffer block sizes
pub mod block_sizes {
    use super::Frames;

    /// 128 frames per block (low latency, ~2.7ms @ 48kHz)
    pub const BLOCK_128: Frames = 128;
    /// 256 frames per block (balanced, ~5.3ms @ 48kHz)
    pub const BLOCK_256: Frames = 256;
    /// 512 frames per block (higher latency, ~10.7ms @ 48kHz)
    pub const BLOCK_512: Frames = 512;
}

/// Description of a PCM stream.
///
/// Two formats are *compatible* when sample rate and channel count agree.
/// Bit depth and layout only matter at the edges (files, codecs); the
/// processing path always runs on interleaved `f32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: SampleRate,
    pub channel_count: ChannelCount,
    pub bit_depth: u16,
    pub interleaved: bool,
}

impl AudioFormat {
    /// Interleaved 32-bit float, the format every node processes in.
    pub const fn float32(sample_rate: SampleRate, channel_count: ChannelCount) -> Self {
        Self {
            sample_rate,
            channel_count,
            bit_depth: 32,
            interleaved: true,
        }
    }

    /// Same format with a different channel count.
    pub const fn with_channels(self, channel_count: ChannelCount) -> Self {
        Self {
            channel_count,
            ..self
        }
    }

    pub const fn is_compatible(&self, other: &Self) -> bool {
        self.sample_rate == other.sample_rate && self.channel_count == other.channel_count
    }

    /// Number of samples needed to hold `frames` frames.
    pub const fn samples_for(&self, frames: Frames) -> usize {
        frames * self.channel_count
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::InvalidFormat("sample rate must be non-zero".into()));
        }
        if self.channel_count == 0 {
            return Err(Error::InvalidFormat("channel count must be non-zero".into()));
        }
        Ok(())
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {}-bit {}",
            self.sample_rate,
            self.channel_count,
            self.bit_depth,
            if self.interleaved {
                "interleaved"
            } else {
                "planar"
            }
        )
    }
}

/// Owned block of PCM samples tagged with its format.
///
/// Samples are stored interleaved or planar (channel after channel)
/// according to `format.interleaved`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    format: AudioFormat,
    frames: Frames,
    samples: Vec<Sample>,
}

impl AudioBuffer {
    /// Silent buffer of `frames` frames.
    pub fn silent(format: AudioFormat, frames: Frames) -> Self {
        Self {
            format,
            frames,
            samples: vec![0.0; format.samples_for(frames)],
        }
    }

    /// Wrap existing samples laid out according to `format`.
    pub fn from_samples(format: AudioFormat, samples: Vec<Sample>) -> Result<Self> {
        format.validate()?;
        if samples.len() % format.channel_count != 0 {
            return Err(Error::InvalidFormat(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                format.channel_count
            )));
        }
        Ok(Self {
            format,
            frames: samples.len() / format.channel_count,
            samples,
        })
    }

    pub const fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub const fn frame_count(&self) -> Frames {
        self.frames
    }

    pub const fn is_empty(&self) -> bool {
        self.frames == 0
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [Sample] {
        &mut self.samples
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    /// Duration in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.frames as f64 / f64::from(self.format.sample_rate)
    }

    /// Sample at (`frame`, `channel`) regardless of layout.
    pub fn sample(&self, frame: Frames, channel: ChannelCount) -> Sample {
        if self.format.interleaved {
            self.samples[frame * self.format.channel_count + channel]
        } else {
            self.samples[channel * self.frames + frame]
        }
    }

    /// Copy of this buffer with interleaved layout.
    pub fn to_interleaved(&self) -> Self {
        if self.format.interleaved {
            return self.clone();
        }
        let channels = self.format.channel_count;
        let mut samples = Vec::with_capacity(self.samples.len());
        for frame in 0..self.frames {
            for channel in 0..channels {
                samples.push(self.samples[channel * self.frames + frame]);
            }
        }
        Self {
            format: AudioFormat {
                interleaved: true,
                ..self.format
            },
            frames: self.frames,
            samples,
        }
    }

    /// Average all channels into one.
    pub fn to_mono(&self) -> Self {
        let channels = self.format.channel_count;
        if channels == 1 {
            return self.to_interleaved();
        }
        let scale = 1.0 / channels as Sample;
        let samples = (0..self.frames)
            .map(|frame| (0..channels).map(|ch| self.sample(frame, ch)).sum::<Sample>() * scale)
            .collect();
        Self {
            format: AudioFormat {
                channel_count: 1,
                interleaved: true,
                ..self.format
            },
            frames: self.frames,
            samples,
        }
    }

    /// Append interleaved frames; the buffer must be interleaved.
    pub fn extend_interleaved(&mut self, samples: &[Sample]) -> Result<()> {
        if !self.format.interleaved {
            return Err(Error::InvalidFormat("cannot append to planar buffer".into()));
        }
        if samples.len() % self.format.channel_count != 0 {
            return Err(Error::InvalidFormat("partial frame".into()));
        }
        self.samples.extend_from_slice(samples);
        self.frames += samples.len() / self.format.channel_count;
        Ok(())
    }
}

/// Common error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Format or buffer layout problem
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_compatibility_ignores_bit_depth() {
        let a = AudioFormat::float32(sample_rates::SR_48000, 1);
        let b = AudioFormat {
            bit_depth: 24,
            ..a
        };
        assert!(a.is_compatible(&b));
        assert!(!a.is_compatible(&a.with_channels(2)));
        assert!(!a.is_compatible(&AudioFormat::float32(sample_rates::SR_44100, 1)));
    }

    #[test]
    fn test_buffer_rejects_partial_frames() {
        let format = AudioFormat::float32(48000, 2);
        assert!(AudioBuffer::from_samples(format, vec![0.0; 3]).is_err());
        let buffer = AudioBuffer::from_samples(format, vec![0.0; 4]).unwrap();
        assert_eq!(buffer.frame_count(), 2);
    }

    #[test]
    fn test_planar_access_and_interleave() {
        let format = AudioFormat {
            interleaved: false,
            ..AudioFormat::float32(48000, 2)
        };
        // left: 1, 2, 3 / right: 4, 5, 6
        let buffer = AudioBuffer::from_samples(format, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(buffer.sample(1, 1), 5.0);
        let interleaved = buffer.to_interleaved();
        assert_eq!(interleaved.samples(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_to_mono_averages_channels() {
        let format = AudioFormat::float32(48000, 2);
        let buffer = AudioBuffer::from_samples(format, vec![1.0, 0.0, 0.5, 0.5]).unwrap();
        let mono = buffer.to_mono();
        assert_eq!(mono.format().channel_count, 1);
        assert_eq!(mono.samples(), &[0.5, 0.5]);
    }

    #[test]
    fn test_extend_interleaved() {
        let mut buffer = AudioBuffer::silent(AudioFormat::float32(48000, 1), 0);
        buffer.extend_interleaved(&[0.25; 10]).unwrap();
        assert_eq!(buffer.frame_count(), 10);
        assert!((buffer.duration_secs() - 10.0 / 48000.0).abs() < 1e-12);
    }
}
