//! Caller-driven device for tests and offline rendering.
//!
//! [`OfflineDevice`] is owned by the graph like any other device; the paired
//! [`OfflineDriver`] plays the part of the hardware and pushes periods
//! through whatever renderer is currently open.

use super::{AudioDevice, DeviceError, Renderer};
use kara_core::{AudioFormat, Frames, Sample};
use parking_lot::Mutex;
use std::sync::Arc;

struct OfflineState {
    renderer: Option<Box<dyn Renderer>>,
    paused: bool,
    input_format: Option<AudioFormat>,
    output_format: AudioFormat,
    fail_next_open: Option<String>,
    opens: usize,
    reinitializations: usize,
}

pub struct OfflineDevice {
    name: String,
    shared: Arc<Mutex<OfflineState>>,
}

/// Hardware side of an [`OfflineDevice`].
#[derive(Clone)]
pub struct OfflineDriver {
    shared: Arc<Mutex<OfflineState>>,
}

impl OfflineDevice {
    pub fn new(input_format: Option<AudioFormat>, output_format: AudioFormat) -> (Self, OfflineDriver) {
        let shared = Arc::new(Mutex::new(OfflineState {
            renderer: None,
            paused: false,
            input_format,
            output_format,
            fail_next_open: None,
            opens: 0,
            reinitializations: 0,
        }));
        (
            Self {
                name: "offline".to_string(),
                shared: Arc::clone(&shared),
            },
            OfflineDriver { shared },
        )
    }

    /// Output-only device for playback.
    pub fn playback(output_format: AudioFormat) -> (Self, OfflineDriver) {
        Self::new(None, output_format)
    }

    /// Capture device whose output (the monitor path) has the same format.
    pub fn capture(input_format: AudioFormat) -> (Self, OfflineDriver) {
        Self::new(Some(input_format), input_format)
    }
}

impl AudioDevice for OfflineDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_format(&self) -> Option<AudioFormat> {
        self.shared.lock().input_format
    }

    fn output_format(&self) -> AudioFormat {
        self.shared.lock().output_format
    }

    fn open(&mut self, renderer: Box<dyn Renderer>) -> Result<(), DeviceError> {
        let mut state = self.shared.lock();
        if state.renderer.is_some() {
            return Err(DeviceError::AlreadyOpen);
        }
        if let Some(reason) = state.fail_next_open.take() {
            return Err(DeviceError::Stream(reason));
        }
        state.renderer = Some(renderer);
        state.paused = false;
        state.opens += 1;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), DeviceError> {
        let mut state = self.shared.lock();
        if state.renderer.is_none() {
            return Err(DeviceError::NotOpen);
        }
        state.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        let mut state = self.shared.lock();
        if state.renderer.is_none() {
            return Err(DeviceError::NotOpen);
        }
        state.paused = false;
        Ok(())
    }

    fn close(&mut self) {
        let renderer = {
            let mut state = self.shared.lock();
            state.paused = false;
            state.renderer.take()
        };
        drop(renderer);
    }

    fn reinitialize(&mut self) -> Result<(), DeviceError> {
        self.close();
        self.shared.lock().reinitializations += 1;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.lock().renderer.is_some()
    }
}

impl OfflineDriver {
    /// Render one period from interleaved `input` (device input format).
    ///
    /// Returns the device output, or `None` when nothing is open or the
    /// device is paused.
    pub fn pump(&self, input: &[Sample]) -> Option<Vec<Sample>> {
        let mut state = self.shared.lock();
        let in_channels = state.input_format.map_or(0, |f| f.channel_count);
        let out_channels = state.output_format.channel_count;
        if state.paused {
            return None;
        }
        let frames = if in_channels > 0 {
            input.len() / in_channels
        } else {
            0
        };
        let renderer = state.renderer.as_mut()?;
        let mut output = vec![0.0; frames * out_channels];
        renderer.render(input, &mut output);
        Some(output)
    }

    /// Render `frames` frames with silent (or no) input.
    pub fn pump_frames(&self, frames: Frames) -> Option<Vec<Sample>> {
        let (in_channels, out_channels) = {
            let state = self.shared.lock();
            (
                state.input_format.map_or(0, |f| f.channel_count),
                state.output_format.channel_count,
            )
        };
        if in_channels > 0 {
            return self.pump(&vec![0.0; frames * in_channels]);
        }

        let mut state = self.shared.lock();
        if state.paused {
            return None;
        }
        let renderer = state.renderer.as_mut()?;
        let mut output = vec![0.0; frames * out_channels];
        renderer.render(&[], &mut output);
        Some(output)
    }

    pub fn is_running(&self) -> bool {
        let state = self.shared.lock();
        state.renderer.is_some() && !state.paused
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Make the next `open` fail, as a device that refuses to start would.
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        self.shared.lock().fail_next_open = Some(reason.into());
    }

    /// Simulate a route change to a device with a different input format.
    pub fn set_input_format(&self, format: Option<AudioFormat>) {
        self.shared.lock().input_format = format;
    }

    pub fn set_output_format(&self, format: AudioFormat) {
        self.shared.lock().output_format = format;
    }

    /// Number of successful opens.
    pub fn opens(&self) -> usize {
        self.shared.lock().opens
    }

    pub fn reinitializations(&self) -> usize {
        self.shared.lock().reinitializations
    }
}
