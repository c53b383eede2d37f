//! Microphone capture: input -> mute gate -> effect -> mixer, with the
//! mixer output tapped and persisted by a worker thread.

use crate::builtin::MixerSettings;
use crate::codec::{CodecError, CompressedPacketBuffer, Convertor, PACKET_FRAMES, PacketFormat};
use crate::config::EngineConfig;
use crate::device::AudioDevice;
use crate::effects::EffectSpec;
use crate::graph::{AudioGraph, GraphError, NodeId, NodeKind, RuntimeState};
use crate::persist::{Destination, PersistenceWorker, WorkerReport, WorkerSettings};
use crate::session::{self, Interruptible, SessionCategory, SessionHandle};
use crate::source::{self, ResourceError};
use crossbeam_channel::{Receiver, Sender};
use kara_comms::{LevelMeter, SharedGain, StateListener, TapConsumer, tap_channel};
use kara_core::{AudioBuffer, AudioFormat, Sample};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    #[default]
    Stopped,
    Recording,
    Paused,
    /// Resumed, waiting for the runtime to render again
    Resuming,
}

/// Totals of one capture session.
pub type CaptureReport = WorkerReport;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Capture device has no input")]
    NoInput,

    #[error("Cannot spawn persistence worker: {0}")]
    Worker(#[source] std::io::Error),
}

pub struct CaptureController {
    graph: AudioGraph,
    config: EngineConfig,
    session: Option<SessionHandle>,
    state: RecordingState,
    effect: EffectSpec,
    gate_gain: Arc<SharedGain>,
    mixer: MixerSettings,
    input_node: Option<NodeId>,
    gate_node: Option<NodeId>,
    mixer_node: Option<NodeId>,
    generation: u32,
    worker: Option<PersistenceWorker>,
    /// Format the destination was opened with
    recording_format: Option<AudioFormat>,
    packets: (Sender<CompressedPacketBuffer>, Receiver<CompressedPacketBuffer>),
    resume_mark: u64,
    listener: Option<Box<dyn StateListener<RecordingState>>>,
}

impl CaptureController {
    pub fn new(device: Box<dyn AudioDevice>, config: &EngineConfig) -> Self {
        let graph = AudioGraph::new(device, config.block_size);
        graph.set_output_gain(config.monitor_gain);
        Self {
            graph,
            config: config.clone(),
            session: None,
            state: RecordingState::Stopped,
            effect: config.default_effect,
            gate_gain: Arc::new(SharedGain::new(1.0)),
            mixer: MixerSettings::default(),
            input_node: None,
            gate_node: None,
            mixer_node: None,
            generation: 0,
            worker: None,
            recording_format: None,
            packets: crossbeam_channel::bounded(config.packet_queue.max(1)),
            resume_mark: 0,
            listener: None,
        }
    }

    pub fn set_session(&mut self, session: SessionHandle) {
        self.session = Some(session);
    }

    pub fn set_listener(&mut self, listener: impl StateListener<RecordingState> + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub const fn state(&self) -> RecordingState {
        self.state
    }

    pub const fn effect(&self) -> EffectSpec {
        self.effect
    }

    pub const fn graph(&self) -> &AudioGraph {
        &self.graph
    }

    /// Generation of the chain currently feeding the tap.
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Mono float at the capture sample rate.
    pub fn mix_format(&self) -> Result<AudioFormat, CaptureError> {
        let input = self.graph.input_format().ok_or(CaptureError::NoInput)?;
        Ok(AudioFormat::float32(input.sample_rate, 1))
    }

    /// Receiver of compressed packet buffers produced while recording with
    /// compression.
    pub fn packets(&self) -> Receiver<CompressedPacketBuffer> {
        self.packets.1.clone()
    }

    /// Start recording into `destination`. No-op unless stopped.
    pub fn start(&mut self, destination: impl Into<Destination>, compress: bool) -> Result<(), CaptureError> {
        if self.state != RecordingState::Stopped {
            return Ok(());
        }
        let format = self.mix_format()?;
        let sink = destination.into().open(format)?;
        let (convertor, chunk_frames) = if compress {
            let convertor = Convertor::new(format, PacketFormat::lossless_mono(format.sample_rate))?;
            (Some(convertor), self.config.packets_per_buffer * PACKET_FRAMES)
        } else {
            (None, self.config.tap_frames)
        };

        self.build()?;
        let ring = self.arm_tap()?;
        session::acquire(self.session.as_ref(), SessionCategory::PlayAndRecord);
        if let Err(e) = self.graph.start() {
            self.graph.remove_tap();
            session::release(self.session.as_ref(), SessionCategory::PlayAndRecord);
            return Err(e.into());
        }

        let settings = WorkerSettings {
            format,
            chunk_frames,
            poll_interval: self.config.worker_poll_interval(),
        };
        let worker = PersistenceWorker::spawn(
            settings,
            ring,
            sink,
            convertor,
            compress.then(|| self.packets.0.clone()),
        );
        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                self.recording_format = Some(format);
            }
            Err(e) => {
                self.graph.stop();
                session::release(self.session.as_ref(), SessionCategory::PlayAndRecord);
                return Err(CaptureError::Worker(e));
            }
        }

        tracing::info!(
            "Recording started ({}, effect '{}', compress: {})",
            format,
            self.effect,
            compress
        );
        self.set_state(RecordingState::Recording);
        Ok(())
    }

    /// Suspend the runtime. No-op unless recording.
    pub fn pause(&mut self) -> Result<(), GraphError> {
        if !matches!(self.state, RecordingState::Recording | RecordingState::Resuming) {
            return Ok(());
        }
        self.graph.pause()?;
        self.set_state(RecordingState::Paused);
        Ok(())
    }

    /// No-op unless paused.
    pub fn resume(&mut self) -> Result<(), GraphError> {
        if self.state != RecordingState::Paused {
            return Ok(());
        }
        self.resume_mark = self.graph.frames_rendered();
        self.rearm_lost_tap()?;
        session::acquire(self.session.as_ref(), SessionCategory::PlayAndRecord);
        self.graph.start()?;
        self.set_state(RecordingState::Resuming);
        Ok(())
    }

    /// Confirm a pending resume once the runtime has rendered again.
    pub fn poll(&mut self) {
        if self.state == RecordingState::Resuming && self.graph.frames_rendered() > self.resume_mark {
            self.set_state(RecordingState::Recording);
        }
    }

    /// Stop recording, drain everything captured so far into the
    /// destination and finalize it. `None` when nothing was recording.
    pub fn stop(&mut self) -> Option<CaptureReport> {
        if self.state == RecordingState::Stopped {
            return None;
        }
        self.graph.stop();
        self.graph.remove_tap();
        let report = self.worker.take().map(PersistenceWorker::finish);
        self.recording_format = None;
        session::release(self.session.as_ref(), SessionCategory::PlayAndRecord);
        if let Some(report) = &report {
            tracing::info!(
                "Recording stopped: {} frames, {} write errors, {} packets",
                report.frames_written,
                report.write_errors,
                report.packets_produced
            );
        }
        self.set_state(RecordingState::Stopped);
        report
    }

    /// Swap the effect. While recording the chain is rebuilt and restarted
    /// under a new generation; while paused it is rebuilt and left stopped
    /// until [`resume`](Self::resume).
    pub fn change_effect(&mut self, effect: EffectSpec) -> Result<(), GraphError> {
        tracing::info!("Capture effect: {} -> {}", self.effect, effect);
        self.effect = effect;
        self.rebuild_now(false)
    }

    /// Silence the microphone without touching the graph.
    pub fn switch_muted(&self, muted: bool) {
        self.gate_gain.set(if muted { 0.0 } else { 1.0 });
        tracing::debug!("Microphone {}", if muted { "muted" } else { "live" });
    }

    pub fn is_muted(&self) -> bool {
        self.gate_gain.get() == 0.0
    }

    /// Background music summed into the recording, looped. `None` removes
    /// it. Takes effect immediately when recording (new generation).
    pub fn set_backing_track(&mut self, track: Option<AudioBuffer>) -> Result<(), CaptureError> {
        let format = self.mix_format()?;
        self.mixer.backing = track.map(|buffer| -> Arc<[Sample]> {
            source::resample(&buffer, format.sample_rate)
                .to_mono()
                .into_samples()
                .into()
        });
        Ok(self.rebuild_now(true)?)
    }

    pub fn set_backing_gain(&self, gain: f32) {
        self.mixer.backing_gain.set(gain.max(0.0));
    }

    /// Level of the mixer output sent to the device (0 keeps the
    /// microphone off the speakers).
    pub fn set_monitor_gain(&self, gain: f32) {
        self.graph.set_output_gain(gain);
    }

    pub fn monitor_gain(&self) -> f32 {
        self.graph.output_gain()
    }

    pub fn output_level(&mut self) -> LevelMeter {
        self.graph.output_level()
    }

    fn rebuild_now(&mut self, refresh_mixer: bool) -> Result<(), GraphError> {
        if refresh_mixer {
            self.graph.stop();
            if let Some(id) = self.mixer_node.take() {
                if self.graph.node(id).is_some() {
                    self.graph.detach(id)?;
                }
            }
        }
        if let Err(e) = self.check_recording_format() {
            self.stop();
            return Err(e);
        }
        match self.state {
            RecordingState::Stopped => Ok(()),
            RecordingState::Paused => self.restage(),
            RecordingState::Recording | RecordingState::Resuming => {
                self.restage()?;
                session::acquire(self.session.as_ref(), SessionCategory::PlayAndRecord);
                if let Err(e) = self.graph.start() {
                    // Runtime is down; resume retries the start
                    self.set_state(RecordingState::Paused);
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Rebuild with the runtime stopped and hand the new generation's ring
    /// to the worker.
    fn restage(&mut self) -> Result<(), GraphError> {
        self.graph.stop();
        self.build()?;
        let ring = self.arm_tap()?;
        if let Some(worker) = &self.worker {
            worker.switch_ring(ring);
        }
        Ok(())
    }

    /// A failed start drops the chain together with the tap it carried.
    /// Arm a fresh ring so the retried start is still persisted.
    fn rearm_lost_tap(&mut self) -> Result<(), GraphError> {
        if self.worker.is_none()
            || self.graph.has_tap()
            || self.graph.runtime_state() != RuntimeState::Stopped
        {
            return Ok(());
        }
        let ring = self.arm_tap()?;
        if let Some(worker) = &self.worker {
            worker.switch_ring(ring);
        }
        Ok(())
    }

    /// The destination header carries the rate it was opened with, so a
    /// device change to another rate cannot continue the same recording.
    fn check_recording_format(&self) -> Result<(), GraphError> {
        let Some(recording) = self.recording_format else {
            return Ok(());
        };
        let current = self
            .graph
            .input_format()
            .map(|input| AudioFormat::float32(input.sample_rate, 1));
        if current == Some(recording) {
            return Ok(());
        }
        tracing::warn!(
            "Input changed from {} to {:?} while recording, stopping",
            recording,
            current
        );
        Err(GraphError::FormatMismatch(format!(
            "recording is {recording}, device input is now {current:?}"
        )))
    }

    /// Input -> gate -> [effect] -> mixer, with the runtime stopped.
    fn build(&mut self) -> Result<(), GraphError> {
        self.graph.stop();
        self.graph.reset()?;
        let format = self
            .graph
            .input_format()
            .ok_or_else(|| GraphError::InvalidTopology("device has no input".to_string()))?;

        let gate_gain = Arc::clone(&self.gate_gain);
        let mixer = self.mixer.clone();
        let input = self
            .graph
            .ensure_node(&mut self.input_node, "input", || NodeKind::Input)?;
        let gate = self
            .graph
            .ensure_node(&mut self.gate_node, "mute", || NodeKind::Gate(gate_gain))?;
        let sink = self
            .graph
            .ensure_node(&mut self.mixer_node, "mixer", || NodeKind::Mixer(mixer))?;

        self.graph.connect(input, gate, format)?;
        self.graph.splice_effect(gate, sink, self.effect, format)?;
        Ok(())
    }

    fn arm_tap(&mut self) -> Result<TapConsumer, GraphError> {
        let sink = self
            .mixer_node
            .ok_or_else(|| GraphError::InvalidTopology("no mixer to tap".to_string()))?;
        self.generation += 1;
        let (producer, consumer) = tap_channel(self.generation, self.config.tap_ring_blocks);
        self.graph.install_tap(sink, producer)?;
        tracing::debug!("Tap armed for generation {}", self.generation);
        Ok(consumer)
    }

    fn set_state(&mut self, state: RecordingState) {
        if self.state == state {
            return;
        }
        tracing::debug!("Capture: {:?} -> {:?}", self.state, state);
        self.state = state;
        if let Some(listener) = self.listener.as_mut() {
            listener.state_changed(state);
        }
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Interruptible for CaptureController {
    fn label(&self) -> &'static str {
        "capture"
    }

    fn is_running(&self) -> bool {
        matches!(self.state, RecordingState::Recording | RecordingState::Resuming)
    }

    fn is_active(&self) -> bool {
        self.state != RecordingState::Stopped
    }

    fn suspend(&mut self) -> Result<(), GraphError> {
        self.pause()
    }

    fn resume(&mut self) -> Result<(), GraphError> {
        Self::resume(self)
    }

    fn poll(&mut self) {
        Self::poll(self);
    }

    fn rebuild(&mut self) -> Result<(), GraphError> {
        self.rebuild_now(false)
    }

    fn reset_all(&mut self) -> Result<(), GraphError> {
        self.graph.reset_all()?;
        self.input_node = None;
        self.gate_node = None;
        self.mixer_node = None;
        self.rebuild_now(false)
    }
}
