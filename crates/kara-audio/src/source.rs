//! Source acquisition: decode a file (or take a buffer) and bring it to the
//! device sample rate before it reaches the player.

use dasp::Signal;
use dasp::interpolate::linear::Linear;
use dasp::signal;
use kara_core::{AudioBuffer, AudioFormat, Sample, SampleRate};
use std::fs::File;
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Where playback material comes from.
#[derive(Debug, Clone)]
pub enum AudioResource {
    File(PathBuf),
    Buffer(AudioBuffer),
}

impl From<PathBuf> for AudioResource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&Path> for AudioResource {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

impl From<AudioBuffer> for AudioResource {
    fn from(buffer: AudioBuffer) -> Self {
        Self::Buffer(buffer)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported audio in {path}: {reason}")]
    Unsupported { path: PathBuf, reason: String },

    #[error("Cannot create destination {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("Source contains no audio")]
    Empty,

    #[error(transparent)]
    Format(#[from] kara_core::Error),
}

/// Decode `resource` and resample it to `sample_rate`. The result is
/// interleaved float PCM.
pub fn prepare(resource: AudioResource, sample_rate: SampleRate) -> Result<AudioBuffer, ResourceError> {
    let buffer = match resource {
        AudioResource::File(path) => decode_file(&path)?,
        AudioResource::Buffer(buffer) => {
            buffer.format().validate()?;
            buffer.to_interleaved()
        }
    };
    if buffer.is_empty() {
        return Err(ResourceError::Empty);
    }
    Ok(resample(&buffer, sample_rate))
}

/// Decode an entire audio file to interleaved f32.
pub fn decode_file(path: &Path) -> Result<AudioBuffer, ResourceError> {
    let unsupported = |reason: String| ResourceError::Unsupported {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path).map_err(|source| ResourceError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| unsupported(e.to_string()))?;
    let mut reader = probed.format;

    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| unsupported("no audio track found".to_string()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| unsupported("unknown sample rate".to_string()))?;
    let channels = track.codec_params.channels.map_or(2, |c| c.count());

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| unsupported(e.to_string()))?;

    let mut samples: Vec<Sample> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading packet from {}: {}", path.display(), e);
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!("Error decoding packet from {}: {}", path.display(), e);
                continue;
            }
        };
        if sample_buf.is_none() {
            let spec = *decoded.spec();
            sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }
        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }
    }

    tracing::info!(
        "Decoded {}: {} frames, {} Hz, {} ch",
        path.display(),
        samples.len() / channels.max(1),
        sample_rate,
        channels
    );
    Ok(AudioBuffer::from_samples(
        AudioFormat::float32(sample_rate, channels),
        samples,
    )?)
}

/// Linear-interpolation resample of an interleaved buffer.
///
/// Returns a copy when the rate already matches.
pub fn resample(buffer: &AudioBuffer, target_rate: SampleRate) -> AudioBuffer {
    let source = buffer.to_interleaved();
    let format = *source.format();
    if format.sample_rate == target_rate || source.is_empty() {
        return source;
    }

    let channels = format.channel_count;
    let frames = source.frame_count();
    let out_frames =
        ((frames as u64 * u64::from(target_rate)).div_ceil(u64::from(format.sample_rate))) as usize;

    let mut out = vec![0.0; out_frames * channels];
    for ch in 0..channels {
        let mut channel = signal::from_iter((0..frames).map(|f| source.sample(f, ch)));
        let first = channel.next();
        let second = channel.next();
        let converted = channel
            .from_hz_to_hz(
                Linear::new(first, second),
                f64::from(format.sample_rate),
                f64::from(target_rate),
            )
            .take(out_frames);
        for (frame, sample) in converted.enumerate() {
            out[frame * channels + ch] = sample;
        }
    }

    tracing::debug!(
        "Resampled {} frames at {} Hz to {} frames at {} Hz",
        frames,
        format.sample_rate,
        out_frames,
        target_rate
    );
    AudioBuffer::from_samples(AudioFormat::float32(target_rate, channels), out)
        .unwrap_or_else(|_| AudioBuffer::silent(AudioFormat::float32(target_rate, channels), 0))
}

/// Sine test signal written to every channel of `format`.
pub fn sine_wave(frequency: f32, seconds: f32, amplitude: f32, format: AudioFormat) -> AudioBuffer {
    let channels = format.channel_count.max(1);
    let frames = (seconds.max(0.0) * format.sample_rate as f32) as usize;
    let step = std::f32::consts::TAU * frequency / format.sample_rate as f32;
    let mut samples = Vec::with_capacity(frames * channels);
    for frame in 0..frames {
        let value = (step * frame as f32).sin() * amplitude;
        samples.extend(std::iter::repeat_n(value, channels));
    }
    AudioBuffer::from_samples(AudioFormat::float32(format.sample_rate, channels), samples)
        .unwrap_or_else(|_| AudioBuffer::silent(format, 0))
}
