//! PCM to lossless packet conversion.
//!
//! Captured buffers are folded to mono, quantized to 24-bit integers and
//! encoded as FLAC with a fixed block of 1152 frames, so each FLAC frame is
//! one packet. Every [`CompressedPacketBuffer`] is a complete, independently
//! decodable FLAC stream.
//!
//! A short last packet is padded with silence to a whole block; the true
//! length travels in [`CompressedPacketBuffer::frames`] and decoding trims
//! the padding off again.

use flacenc::component::BitRepr;
use flacenc::error::Verify;
use kara_core::{AudioBuffer, AudioFormat, ChannelCount, Frames, SampleRate};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Frames carried by one packet.
pub const PACKET_FRAMES: Frames = 1152;

/// Bit depth packets are quantized to.
pub const PACKET_BIT_DEPTH: u16 = 24;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Unsupported conversion: {0}")]
    Unsupported(String),

    #[error("Encoder configuration rejected: {0}")]
    Config(String),

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Decoding failed: {0}")]
    Decode(String),
}

/// Target format of a [`Convertor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketFormat {
    pub sample_rate: SampleRate,
    pub channel_count: ChannelCount,
    pub bit_depth: u16,
    pub frames_per_packet: Frames,
}

impl PacketFormat {
    /// Lossless, 24-bit, mono, 1152 frames per packet.
    pub const fn lossless_mono(sample_rate: SampleRate) -> Self {
        Self {
            sample_rate,
            channel_count: 1,
            bit_depth: PACKET_BIT_DEPTH,
            frames_per_packet: PACKET_FRAMES,
        }
    }
}

/// Encoded bytes plus the bookkeeping a consumer needs to split them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedPacketBuffer {
    pub format: PacketFormat,
    pub bytes: Vec<u8>,
    pub packet_count: usize,
    /// Frames of real audio, excluding the padding of the last packet
    pub frames: Frames,
    /// Chain generation the source audio came from
    pub generation: u32,
}

/// Quantize a float sample in [-1, 1) to a signed integer of `bits` bits.
pub fn quantize_sample(sample: f32, bits: u16) -> i32 {
    let scale = (1_i64 << (bits - 1)) as f64;
    let max = scale - 1.0;
    (f64::from(sample) * scale).round().clamp(-scale, max) as i32
}

/// Inverse of [`quantize_sample`].
pub fn dequantize_sample(value: i32, bits: u16) -> f32 {
    (f64::from(value) / (1_i64 << (bits - 1)) as f64) as f32
}

/// Stateless PCM to FLAC convertor for one input format.
pub struct Convertor {
    input: AudioFormat,
    target: PacketFormat,
    encoder: flacenc::error::Verified<flacenc::config::Encoder>,
}

impl Convertor {
    pub fn new(input: AudioFormat, target: PacketFormat) -> Result<Self, CodecError> {
        input
            .validate()
            .map_err(|e| CodecError::Unsupported(e.to_string()))?;
        if input.sample_rate != target.sample_rate {
            return Err(CodecError::Unsupported(format!(
                "input runs at {} Hz, packets at {} Hz",
                input.sample_rate, target.sample_rate
            )));
        }
        if target.channel_count != 1 {
            return Err(CodecError::Unsupported(format!(
                "{} channel packets, only mono is produced",
                target.channel_count
            )));
        }
        if !(8..=24).contains(&target.bit_depth) {
            return Err(CodecError::Unsupported(format!(
                "{}-bit packets",
                target.bit_depth
            )));
        }

        let mut config = flacenc::config::Encoder::default();
        config.block_size = target.frames_per_packet;
        let encoder = config
            .into_verified()
            .map_err(|(_, e)| CodecError::Config(e.to_string()))?;

        Ok(Self {
            input,
            target,
            encoder,
        })
    }

    pub const fn input_format(&self) -> AudioFormat {
        self.input
    }

    pub const fn target(&self) -> PacketFormat {
        self.target
    }

    /// Mono downmix quantized to the target bit depth.
    pub fn quantize(&self, buffer: &AudioBuffer) -> Vec<i32> {
        buffer
            .to_mono()
            .samples()
            .iter()
            .map(|&s| quantize_sample(s, self.target.bit_depth))
            .collect()
    }

    /// Float rendition of what the packets will decode to.
    pub fn quantized_buffer(&self, buffer: &AudioBuffer) -> AudioBuffer {
        let samples = self
            .quantize(buffer)
            .into_iter()
            .map(|k| dequantize_sample(k, self.target.bit_depth))
            .collect();
        let format = AudioFormat::float32(self.target.sample_rate, 1);
        AudioBuffer::from_samples(format, samples)
            .unwrap_or_else(|_| AudioBuffer::silent(format, 0))
    }

    /// Encode `buffer` into one FLAC stream.
    pub fn convert(
        &self,
        buffer: &AudioBuffer,
        generation: u32,
    ) -> Result<CompressedPacketBuffer, CodecError> {
        let format = buffer.format();
        if !format.is_compatible(&self.input) {
            return Err(CodecError::Unsupported(format!(
                "convertor expects {}, got {format}",
                self.input
            )));
        }

        let mut samples = self.quantize(buffer);
        let frames = samples.len();
        if frames == 0 {
            return Ok(CompressedPacketBuffer {
                format: self.target,
                bytes: Vec::new(),
                packet_count: 0,
                frames: 0,
                generation,
            });
        }

        let packet_count = frames.div_ceil(self.target.frames_per_packet);
        samples.resize(packet_count * self.target.frames_per_packet, 0);

        let source = flacenc::source::MemSource::from_samples(
            &samples,
            1,
            usize::from(self.target.bit_depth),
            self.target.sample_rate as usize,
        );
        let stream = flacenc::encode_with_fixed_block_size(
            &self.encoder,
            source,
            self.target.frames_per_packet,
        )
        .map_err(|e| CodecError::Encode(e.to_string()))?;

        let mut sink = flacenc::bitsink::ByteSink::new();
        stream
            .write(&mut sink)
            .map_err(|e| CodecError::Encode(e.to_string()))?;

        Ok(CompressedPacketBuffer {
            format: self.target,
            bytes: sink.as_slice().to_vec(),
            packet_count,
            frames,
            generation,
        })
    }
}

/// Decode one packet buffer back to float PCM.
pub fn decode_packets(packets: &CompressedPacketBuffer) -> Result<AudioBuffer, CodecError> {
    let format = AudioFormat::float32(packets.format.sample_rate, packets.format.channel_count);
    if packets.bytes.is_empty() {
        return Ok(AudioBuffer::silent(format, 0));
    }

    let mss = MediaSourceStream::new(
        Box::new(Cursor::new(packets.bytes.clone())),
        Default::default(),
    );
    let mut hint = Hint::new();
    hint.with_extension("flac");

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    let mut reader = probed.format;

    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| CodecError::Decode("no audio track".to_string()))?;
    let track_id = track.id;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| CodecError::Decode(e.to_string()))?;

    let mut samples = Vec::with_capacity(packets.frames * packets.format.channel_count);
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(CodecError::Decode(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = decoder
            .decode(&packet)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        if sample_buf.is_none() {
            let spec = *decoded.spec();
            sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }
        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }
    }

    let expected = packets.frames * packets.format.channel_count;
    if samples.len() < expected {
        return Err(CodecError::Decode(format!(
            "stream holds {} samples, {expected} expected",
            samples.len()
        )));
    }
    samples.truncate(expected);
    AudioBuffer::from_samples(format, samples).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_clamps_and_rounds() {
        assert_eq!(quantize_sample(0.0, 24), 0);
        assert_eq!(quantize_sample(1.0, 24), (1 << 23) - 1);
        assert_eq!(quantize_sample(-1.0, 24), -(1 << 23));
        assert_eq!(quantize_sample(-4.0, 24), -(1 << 23));
        assert_eq!(quantize_sample(0.5, 24), 1 << 22);
        assert_eq!(dequantize_sample(1 << 22, 24), 0.5);
    }

    #[test]
    fn test_rejects_unsupported_targets() {
        let input = AudioFormat::float32(48000, 1);
        assert!(Convertor::new(input, PacketFormat::lossless_mono(44100)).is_err());
        let stereo = PacketFormat {
            channel_count: 2,
            ..PacketFormat::lossless_mono(48000)
        };
        assert!(Convertor::new(input, stereo).is_err());
        assert!(Convertor::new(input, PacketFormat::lossless_mono(48000)).is_ok());
    }

    #[test]
    fn test_packet_accounting() {
        let input = AudioFormat::float32(48000, 1);
        let convertor = Convertor::new(input, PacketFormat::lossless_mono(48000)).unwrap();
        let buffer = AudioBuffer::silent(input, PACKET_FRAMES * 2 + 10);
        let packets = convertor.convert(&buffer, 4).unwrap();
        assert_eq!(packets.packet_count, 3);
        assert_eq!(packets.frames, PACKET_FRAMES * 2 + 10);
        assert_eq!(packets.generation, 4);
        assert_eq!(&packets.bytes[..4], b"fLaC");
    }

    #[test]
    fn test_round_trip_is_exact_after_quantization() {
        let input = AudioFormat::float32(48000, 2);
        let frames = PACKET_FRAMES * 3 + 100;
        let samples: Vec<f32> = (0..frames * 2)
            .map(|i| ((i as f32) * 0.013).sin() * 0.8)
            .collect();
        let buffer = AudioBuffer::from_samples(input, samples).unwrap();

        let convertor = Convertor::new(input, PacketFormat::lossless_mono(48000)).unwrap();
        let packets = convertor.convert(&buffer, 0).unwrap();
        let decoded = decode_packets(&packets).unwrap();

        assert_eq!(decoded.frame_count(), frames);
        assert_eq!(decoded.samples(), convertor.quantized_buffer(&buffer).samples());
    }

    #[test]
    fn test_short_buffers_decode_to_their_own_length() {
        let input = AudioFormat::float32(44100, 1);
        let convertor = Convertor::new(input, PacketFormat::lossless_mono(44100)).unwrap();
        for frames in [777, 500, 10, PACKET_FRAMES * 2 + 10] {
            let samples: Vec<f32> = (0..frames).map(|i| ((i as f32) * 0.07).sin() * 0.5).collect();
            let buffer = AudioBuffer::from_samples(input, samples).unwrap();
            let packets = convertor.convert(&buffer, 1).unwrap();
            assert_eq!(packets.frames, frames);
            assert_eq!(packets.packet_count, frames.div_ceil(PACKET_FRAMES));

            let decoded = decode_packets(&packets).unwrap();
            assert_eq!(decoded.frame_count(), frames, "{frames} frames");
            assert_eq!(decoded.samples(), convertor.quantized_buffer(&buffer).samples());
        }
    }

    #[test]
    fn test_rejects_mismatched_buffer() {
        let convertor = Convertor::new(
            AudioFormat::float32(48000, 1),
            PacketFormat::lossless_mono(48000),
        )
        .unwrap();
        let buffer = AudioBuffer::silent(AudioFormat::float32(48000, 2), 16);
        assert!(matches!(
            convertor.convert(&buffer, 0),
            Err(CodecError::Unsupported(_))
        ));
    }
}
