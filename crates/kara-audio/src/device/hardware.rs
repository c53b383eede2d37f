//! cpal-backed device.

use super::{AudioDevice, DeviceError, Renderer};
use crate::session::{SessionSignal, SignalSender};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    SampleFormat, Stream, StreamConfig, SupportedStreamConfig, SupportedStreamConfigRange,
};
use kara_comms::rtrb;
use kara_core::{AudioFormat, Frames, Sample};
use smallvec::SmallVec;

/// Which directions a [`CpalDevice`] opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    /// Output stream only.
    Playback,
    /// Input stream, plus an output stream carrying the render output when
    /// `monitor` is set.
    Capture { monitor: bool },
}

/// Render periods are split into pieces of at most this many frames when the
/// host hands the input callback more than the requested block.
const MAX_CAPTURE_FRAMES: Frames = 4096;

pub struct CpalDevice {
    role: DeviceRole,
    block_size: Option<Frames>,
    name: String,
    input: Option<(cpal::Device, StreamConfig)>,
    output: Option<(cpal::Device, StreamConfig)>,
    streams: SmallVec<[Stream; 2]>,
    signals: Option<SignalSender>,
}

impl CpalDevice {
    /// Acquire the default host devices for `role`.
    ///
    /// `block_size` requests a fixed hardware period; `None` lets the host pick.
    pub fn new(role: DeviceRole, block_size: Option<Frames>) -> Result<Self, DeviceError> {
        let mut device = Self {
            role,
            block_size,
            name: String::new(),
            input: None,
            output: None,
            streams: SmallVec::new(),
            signals: None,
        };
        device.acquire()?;
        Ok(device)
    }

    /// Route stream-level failures (device unplugged) to a session coordinator.
    #[must_use]
    pub fn with_signals(mut self, signals: SignalSender) -> Self {
        self.signals = Some(signals);
        self
    }

    fn buffer_size(&self) -> cpal::BufferSize {
        self.block_size.map_or(cpal::BufferSize::Default, |frames| {
            cpal::BufferSize::Fixed(frames as u32)
        })
    }

    fn acquire(&mut self) -> Result<(), DeviceError> {
        let host = cpal::default_host();
        tracing::debug!("Using audio host: {}", host.id().name());

        self.input = None;
        self.output = None;

        if let DeviceRole::Capture { .. } = self.role {
            let device = host
                .default_input_device()
                .ok_or_else(|| DeviceError::Unavailable("no input device".to_string()))?;
            let default = device
                .default_input_config()
                .map_err(|e| DeviceError::Config(e.to_string()))?;
            let ranges = device
                .supported_input_configs()
                .map_err(|e| DeviceError::Config(e.to_string()))?;
            let supported = f32_config(default, ranges)?;
            let config = StreamConfig {
                channels: supported.channels(),
                sample_rate: supported.sample_rate(),
                buffer_size: self.buffer_size(),
            };
            self.name = device.name().unwrap_or_else(|_| "input".to_string());
            tracing::info!("Using input device: {} ({:?})", self.name, config);
            self.input = Some((device, config));
        }

        let wants_output = match self.role {
            DeviceRole::Playback => true,
            DeviceRole::Capture { monitor } => monitor,
        };
        if wants_output {
            let device = host
                .default_output_device()
                .ok_or_else(|| DeviceError::Unavailable("no output device".to_string()))?;
            let default = device
                .default_output_config()
                .map_err(|e| DeviceError::Config(e.to_string()))?;
            let ranges = device
                .supported_output_configs()
                .map_err(|e| DeviceError::Config(e.to_string()))?;
            let supported = f32_config(default, ranges)?;
            // The monitor runs at the capture rate; there is no resampler on
            // the realtime path.
            let sample_rate = self
                .input
                .as_ref()
                .map_or(supported.sample_rate(), |(_, config)| config.sample_rate);
            let config = StreamConfig {
                channels: supported.channels(),
                sample_rate,
                buffer_size: self.buffer_size(),
            };
            let name = device.name().unwrap_or_else(|_| "output".to_string());
            tracing::info!("Using output device: {} ({:?})", name, config);
            if self.name.is_empty() {
                self.name = name;
            }
            self.output = Some((device, config));
        }
        Ok(())
    }

    fn error_callback(&self) -> impl FnMut(cpal::StreamError) + Send + 'static {
        let signals = self.signals.clone();
        move |err| {
            tracing::error!("Audio stream error: {}", err);
            if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                if let Some(signals) = &signals {
                    let _ = signals.send(SessionSignal::ConfigurationChanged);
                }
            }
        }
    }

    fn build_playback(&self, mut renderer: Box<dyn Renderer>) -> Result<Stream, DeviceError> {
        let (device, config) = self.output.as_ref().ok_or(DeviceError::NotOpen)?;
        device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    renderer.render(&[], data);
                },
                self.error_callback(),
                None,
            )
            .map_err(|e| DeviceError::Stream(e.to_string()))
    }

    fn build_capture(
        &self,
        mut renderer: Box<dyn Renderer>,
    ) -> Result<SmallVec<[Stream; 2]>, DeviceError> {
        let (input_device, input_config) = self.input.as_ref().ok_or(DeviceError::NotOpen)?;
        let in_channels = input_config.channels as usize;
        let out_channels = self
            .output
            .as_ref()
            .map_or(in_channels, |(_, config)| config.channels as usize);

        let (mut monitor_tx, monitor_rx) = if self.output.is_some() {
            let capacity = MAX_CAPTURE_FRAMES * out_channels * 4;
            let (tx, rx) = rtrb::RingBuffer::<Sample>::new(capacity);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        // IMPORTANT: pre-allocated so the input callback never allocates
        let mut scratch = vec![0.0; MAX_CAPTURE_FRAMES * out_channels];

        let mut streams = SmallVec::new();
        let input_stream = input_device
            .build_input_stream(
                input_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for chunk in data.chunks(MAX_CAPTURE_FRAMES * in_channels) {
                        let frames = chunk.len() / in_channels;
                        let out = &mut scratch[..frames * out_channels];
                        renderer.render(chunk, out);
                        if let Some(tx) = monitor_tx.as_mut() {
                            // Overflow drops monitor samples, never blocks.
                            for &sample in out.iter() {
                                if tx.push(sample).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                },
                self.error_callback(),
                None,
            )
            .map_err(|e| DeviceError::Stream(e.to_string()))?;
        streams.push(input_stream);

        if let (Some((output_device, output_config)), Some(mut rx)) =
            (self.output.as_ref(), monitor_rx)
        {
            let output_stream = output_device
                .build_output_stream(
                    output_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        for sample in data.iter_mut() {
                            *sample = rx.pop().unwrap_or(0.0);
                        }
                    },
                    self.error_callback(),
                    None,
                )
                .map_err(|e| DeviceError::Stream(e.to_string()))?;
            streams.push(output_stream);
        }
        Ok(streams)
    }
}

/// The streams are built for `f32` samples. Keep the default config when it
/// already is, otherwise take an `f32` range at the default rate, preferring
/// the default channel count.
fn f32_config(
    default: SupportedStreamConfig,
    supported: impl Iterator<Item = SupportedStreamConfigRange>,
) -> Result<SupportedStreamConfig, DeviceError> {
    if default.sample_format() == SampleFormat::F32 {
        return Ok(default);
    }
    let rate = default.sample_rate();
    supported
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .filter(|c| c.min_sample_rate() <= rate && rate <= c.max_sample_rate())
        .min_by_key(|c| c.channels() != default.channels())
        .map(|c| c.with_sample_rate(rate))
        .ok_or_else(|| {
            DeviceError::Config(format!(
                "device defaults to {:?} and offers no f32 stream at {} Hz",
                default.sample_format(),
                rate.0
            ))
        })
}

fn to_format(config: &StreamConfig) -> AudioFormat {
    AudioFormat::float32(config.sample_rate.0, config.channels as usize)
}

impl AudioDevice for CpalDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_format(&self) -> Option<AudioFormat> {
        self.input.as_ref().map(|(_, config)| to_format(config))
    }

    fn output_format(&self) -> AudioFormat {
        match (&self.output, &self.input) {
            (Some((_, config)), _) => to_format(config),
            // Capture without monitor: the render output is discarded, so it
            // simply mirrors the input layout.
            (None, Some((_, config))) => to_format(config),
            (None, None) => AudioFormat::float32(kara_core::sample_rates::SR_48000, 2),
        }
    }

    fn open(&mut self, renderer: Box<dyn Renderer>) -> Result<(), DeviceError> {
        if !self.streams.is_empty() {
            return Err(DeviceError::AlreadyOpen);
        }

        let streams = match self.role {
            DeviceRole::Playback => {
                let mut streams = SmallVec::new();
                streams.push(self.build_playback(renderer)?);
                streams
            }
            DeviceRole::Capture { .. } => self.build_capture(renderer)?,
        };

        for stream in &streams {
            stream.play().map_err(|e| DeviceError::Stream(e.to_string()))?;
        }
        tracing::info!("Audio stream started on {}", self.name);

        self.streams = streams;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), DeviceError> {
        if self.streams.is_empty() {
            return Err(DeviceError::NotOpen);
        }
        for stream in &self.streams {
            stream.pause().map_err(|e| DeviceError::Stream(e.to_string()))?;
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        if self.streams.is_empty() {
            return Err(DeviceError::NotOpen);
        }
        for stream in &self.streams {
            stream.play().map_err(|e| DeviceError::Stream(e.to_string()))?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.streams.is_empty() {
            return;
        }
        for stream in self.streams.drain(..) {
            if let Err(e) = stream.pause() {
                tracing::warn!("Error pausing stream before close: {}", e);
            }
            drop(stream);
        }
        tracing::info!("Audio stream stopped");
    }

    fn reinitialize(&mut self) -> Result<(), DeviceError> {
        self.close();
        self.acquire()
    }

    fn is_open(&self) -> bool {
        !self.streams.is_empty()
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.close();
    }
}
