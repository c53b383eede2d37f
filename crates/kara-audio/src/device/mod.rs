//! Audio device abstraction.
//!
//! A device owns the realtime thread. The graph compiles its nodes into a
//! [`Renderer`] and hands it to [`AudioDevice::open`]; from then on the device
//! calls `render` once per hardware period until the device is closed.

pub mod hardware;
pub mod offline;

pub use hardware::{CpalDevice, DeviceRole};
pub use offline::{OfflineDevice, OfflineDriver};

use kara_core::{AudioFormat, Sample};

/// Realtime render callback.
///
/// `input` holds interleaved captured samples in the device input format
/// (empty for output-only devices). `output` receives interleaved samples in
/// the device output format.
///
/// REAL-TIME SAFE: implementations must not allocate, lock, or log.
pub trait Renderer: Send {
    fn render(&mut self, input: &[Sample], output: &mut [Sample]);
}

/// The runtime a graph runs on.
pub trait AudioDevice {
    /// Human readable device name
    fn name(&self) -> &str;

    /// Capture format, `None` for output-only devices.
    fn input_format(&self) -> Option<AudioFormat>;

    /// Format the renderer must produce.
    fn output_format(&self) -> AudioFormat;

    /// Start calling `renderer` on the realtime thread.
    fn open(&mut self, renderer: Box<dyn Renderer>) -> Result<(), DeviceError>;

    /// Suspend callbacks, keeping the renderer.
    fn pause(&mut self) -> Result<(), DeviceError>;

    /// Resume callbacks after [`pause`](Self::pause).
    fn resume(&mut self) -> Result<(), DeviceError>;

    /// Stop callbacks and drop the renderer. Idempotent.
    ///
    /// When this returns no render call is in flight.
    fn close(&mut self);

    /// Drop and re-acquire the underlying device handle (after the platform
    /// media services were reset). Closes the device first.
    fn reinitialize(&mut self) -> Result<(), DeviceError>;

    fn is_open(&self) -> bool;
}

/// Device-related errors
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No audio device available: {0}")]
    Unavailable(String),

    #[error("Unsupported device configuration: {0}")]
    Config(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Device is not open")]
    NotOpen,

    #[error("Device is already open")]
    AlreadyOpen,
}
