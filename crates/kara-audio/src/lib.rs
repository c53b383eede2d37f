//! Karaoke audio engine.
//!
//! This crate provides the audio graph and its realtime render chain, the
//! playback and capture controllers built on it, the capture persistence
//! path (tap ring, worker, WAV and lossless packet output), and session
//! interruption handling. Devices are abstracted behind [`AudioDevice`] with a
//! cpal implementation for hardware and an offline one for deterministic runs.

pub mod builtin;
pub mod capture;
pub mod codec;
pub mod config;
pub mod device;
pub mod effects;
pub mod graph;
pub mod persist;
pub mod playback;
pub mod session;
pub mod source;

pub use capture::{CaptureController, CaptureError, CaptureReport, RecordingState};
pub use codec::{CompressedPacketBuffer, Convertor, PacketFormat, decode_packets};
pub use config::{ConfigError, EngineConfig};
pub use device::{AudioDevice, CpalDevice, DeviceError, DeviceRole, OfflineDevice, OfflineDriver};
pub use effects::{DelayTime, EffectError, EffectSpec};
pub use graph::{AudioGraph, GraphError, NodeId, NodeKind};
pub use persist::{Destination, FrameSink, MemorySink, WavFileSink, WriteError};
pub use playback::{PlaybackController, PlaybackError, PlaybackState};
pub use session::{
    AudioSession, DesktopSession, InterruptionState, SessionCategory, SessionConfigError,
    SessionCoordinator, SessionHandle, SessionSignal, SignalSender,
};
pub use source::{AudioResource, ResourceError};
