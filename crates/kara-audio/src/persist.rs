//! Persistence path for captured audio.
//!
//! The render thread only pushes [`TapBlock`](kara_comms::TapBlock)s into a
//! ring. A [`PersistenceWorker`] thread drains the ring, assembles fixed-size
//! buffers, optionally encodes them, and writes them to a [`FrameSink`].
//!
//! Each chain generation gets its own ring. The worker only moves on to the
//! next ring once the current one is finished (producer dropped and every
//! block read), so buffers from two chains never share a write.

use crate::codec::{CompressedPacketBuffer, Convertor};
use crate::source::ResourceError;
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use kara_comms::TapConsumer;
use kara_core::{AudioBuffer, AudioFormat, Frames, Sample};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("WAV write failed: {0}")]
    Wav(#[from] hound::Error),

    #[error("Buffer format {got} does not match sink format {expected}")]
    Format { expected: AudioFormat, got: AudioFormat },

    #[error("Sink already finalized")]
    Closed,
}

/// Where assembled capture buffers end up.
pub trait FrameSink: Send {
    /// Persist one buffer produced by chain `generation`.
    fn write(&mut self, buffer: &AudioBuffer, generation: u32) -> Result<(), WriteError>;

    /// Flush and close. Further writes fail with [`WriteError::Closed`].
    fn finalize(&mut self) -> Result<(), WriteError>;
}

/// Capture destination handed to the capture controller.
pub enum Destination {
    /// WAV file in the mixer format
    File(PathBuf),
    Sink(Box<dyn FrameSink>),
}

impl Destination {
    pub(crate) fn open(self, format: AudioFormat) -> Result<Box<dyn FrameSink>, ResourceError> {
        match self {
            Self::File(path) => Ok(Box::new(WavFileSink::create(&path, format)?)),
            Self::Sink(sink) => Ok(sink),
        }
    }
}

impl From<PathBuf> for Destination {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

/// 32-bit float WAV file.
pub struct WavFileSink {
    path: PathBuf,
    format: AudioFormat,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
}

impl WavFileSink {
    pub fn create(path: &Path, format: AudioFormat) -> Result<Self, ResourceError> {
        let spec = hound::WavSpec {
            channels: format.channel_count as u16,
            sample_rate: format.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec).map_err(|source| ResourceError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Recording to {} ({})", path.display(), format);
        Ok(Self {
            path: path.to_path_buf(),
            format,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSink for WavFileSink {
    fn write(&mut self, buffer: &AudioBuffer, _generation: u32) -> Result<(), WriteError> {
        if !buffer.format().is_compatible(&self.format) {
            return Err(WriteError::Format {
                expected: self.format,
                got: *buffer.format(),
            });
        }
        let writer = self.writer.as_mut().ok_or(WriteError::Closed)?;
        for &sample in buffer.to_interleaved().samples() {
            writer.write_sample(sample)?;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), WriteError> {
        let writer = self.writer.take().ok_or(WriteError::Closed)?;
        writer.finalize()?;
        tracing::info!("Finalized {}", self.path.display());
        Ok(())
    }
}

/// A buffer written to a [`MemorySink`], with its chain generation.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenBuffer {
    pub generation: u32,
    pub buffer: AudioBuffer,
}

/// In-memory sink. Clones share storage, so one clone can be handed to the
/// capture controller while another inspects what was written.
#[derive(Clone, Default)]
pub struct MemorySink {
    written: Arc<Mutex<Vec<WrittenBuffer>>>,
    finalized: Arc<Mutex<bool>>,
    /// Fail every write, for exercising the error path
    fail_writes: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose writes always fail.
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn buffers(&self) -> Vec<WrittenBuffer> {
        self.written.lock().clone()
    }

    /// All written samples in write order.
    pub fn samples(&self) -> Vec<Sample> {
        self.written
            .lock()
            .iter()
            .flat_map(|w| w.buffer.samples().iter().copied())
            .collect()
    }

    pub fn is_finalized(&self) -> bool {
        *self.finalized.lock()
    }
}

impl FrameSink for MemorySink {
    fn write(&mut self, buffer: &AudioBuffer, generation: u32) -> Result<(), WriteError> {
        if *self.finalized.lock() {
            return Err(WriteError::Closed);
        }
        if self.fail_writes {
            return Err(WriteError::Wav(hound::Error::IoError(std::io::Error::other(
                "disk full",
            ))));
        }
        self.written.lock().push(WrittenBuffer {
            generation,
            buffer: buffer.clone(),
        });
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), WriteError> {
        *self.finalized.lock() = true;
        Ok(())
    }
}

/// Totals reported when a worker shuts down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub frames_written: u64,
    pub buffers_written: u64,
    pub write_errors: u64,
    pub packets_produced: u64,
    pub packet_buffers_dropped: u64,
    pub encode_errors: u64,
    pub dropped_tap_buffers: u64,
    /// Generations in the order their buffers reached the sink
    pub generations: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Format of the tap blocks (the mixer output)
    pub format: AudioFormat,
    /// Frames per assembled buffer
    pub chunk_frames: Frames,
    pub poll_interval: Duration,
}

enum WorkerCommand {
    Ring(TapConsumer),
    Shutdown,
}

/// Handle to the persistence thread.
pub struct PersistenceWorker {
    commands: Sender<WorkerCommand>,
    handle: Option<JoinHandle<WorkerReport>>,
}

impl PersistenceWorker {
    /// Spawn the worker reading from `first_ring`.
    pub fn spawn(
        settings: WorkerSettings,
        first_ring: TapConsumer,
        sink: Box<dyn FrameSink>,
        convertor: Option<Convertor>,
        packets: Option<Sender<CompressedPacketBuffer>>,
    ) -> std::io::Result<Self> {
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let state = WorkerState {
            assembly: Vec::with_capacity(settings.chunk_frames * settings.format.channel_count),
            assembly_generation: first_ring.generation(),
            settings,
            sink,
            convertor,
            packets,
            report: WorkerReport::default(),
        };
        let handle = std::thread::Builder::new()
            .name("kara-persist".to_string())
            .spawn(move || state.run(first_ring, &command_rx))?;
        Ok(Self {
            commands,
            handle: Some(handle),
        })
    }

    /// Queue the ring of the next chain generation.
    pub fn switch_ring(&self, ring: TapConsumer) {
        if self.commands.send(WorkerCommand::Ring(ring)).is_err() {
            tracing::warn!("Persistence worker is gone; ring discarded");
        }
    }

    /// Drain every queued ring, finalize the sink and return the totals.
    ///
    /// Producers must already be dropped (runtime stopped), otherwise the
    /// remaining blocks of a live ring are abandoned.
    pub fn finish(mut self) -> WorkerReport {
        self.join()
    }

    fn join(&mut self) -> WorkerReport {
        let _ = self.commands.send(WorkerCommand::Shutdown);
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(report)) => report,
            Some(Err(_)) => {
                tracing::error!("Persistence worker panicked");
                WorkerReport::default()
            }
            None => WorkerReport::default(),
        }
    }
}

impl Drop for PersistenceWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.join();
        }
    }
}

struct WorkerState {
    settings: WorkerSettings,
    sink: Box<dyn FrameSink>,
    convertor: Option<Convertor>,
    packets: Option<Sender<CompressedPacketBuffer>>,
    assembly: Vec<Sample>,
    assembly_generation: u32,
    report: WorkerReport,
}

impl WorkerState {
    fn run(mut self, first_ring: TapConsumer, commands: &Receiver<WorkerCommand>) -> WorkerReport {
        let mut current = Some(first_ring);
        let mut queued: VecDeque<TapConsumer> = VecDeque::new();
        let mut shutting_down = false;

        loop {
            loop {
                match commands.try_recv() {
                    Ok(WorkerCommand::Ring(ring)) => queued.push_back(ring),
                    Ok(WorkerCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                        shutting_down = true;
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }

            let mut progressed = false;
            if let Some(ring) = current.as_mut() {
                while let Some(block) = ring.pop() {
                    progressed = true;
                    self.push_block(block.generation, block.data());
                }
                if ring.is_finished() || (shutting_down && !progressed) {
                    if !ring.is_finished() {
                        tracing::warn!(
                            "Abandoning live tap ring of generation {}",
                            ring.generation()
                        );
                    }
                    self.retire_ring(ring);
                    current = queued.pop_front();
                    progressed = true;
                }
            } else if let Some(ring) = queued.pop_front() {
                current = Some(ring);
                progressed = true;
            }

            if shutting_down && current.is_none() && queued.is_empty() {
                break;
            }
            if !progressed {
                std::thread::sleep(self.settings.poll_interval);
            }
        }

        if let Err(e) = self.sink.finalize() {
            tracing::error!("Failed to finalize capture destination: {}", e);
            self.report.write_errors += 1;
        }
        tracing::info!(
            "Persistence worker done: {} frames in {} buffers, {} write errors, {} dropped tap buffers",
            self.report.frames_written,
            self.report.buffers_written,
            self.report.write_errors,
            self.report.dropped_tap_buffers
        );
        self.report
    }

    fn retire_ring(&mut self, ring: &TapConsumer) {
        self.flush_partial();
        let dropped = ring.dropped_buffers();
        if dropped > 0 {
            tracing::warn!(
                "Tap ring of generation {} dropped {} buffers",
                ring.generation(),
                dropped
            );
        }
        self.report.dropped_tap_buffers += dropped;
    }

    fn push_block(&mut self, generation: u32, samples: &[Sample]) {
        if generation != self.assembly_generation {
            self.flush_partial();
            self.assembly_generation = generation;
        }

        let chunk_samples = self.settings.chunk_frames * self.settings.format.channel_count;
        let mut rest = samples;
        while !rest.is_empty() {
            let room = chunk_samples - self.assembly.len();
            let take = room.min(rest.len());
            self.assembly.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.assembly.len() == chunk_samples {
                self.emit();
            }
        }
    }

    fn flush_partial(&mut self) {
        if !self.assembly.is_empty() {
            self.emit();
        }
    }

    fn emit(&mut self) {
        let samples = std::mem::replace(
            &mut self.assembly,
            Vec::with_capacity(self.settings.chunk_frames * self.settings.format.channel_count),
        );
        let generation = self.assembly_generation;
        let buffer = match AudioBuffer::from_samples(self.settings.format, samples) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::error!("Dropping malformed capture buffer: {}", e);
                self.report.write_errors += 1;
                return;
            }
        };

        if let Some(convertor) = &self.convertor {
            match convertor.convert(&buffer, generation) {
                Ok(packets) => {
                    self.report.packets_produced += packets.packet_count as u64;
                    if let Some(tx) = &self.packets {
                        match tx.try_send(packets) {
                            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                            Err(TrySendError::Full(_)) => {
                                tracing::warn!("Packet queue full, dropping compressed buffer");
                                self.report.packet_buffers_dropped += 1;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("Encoding capture buffer failed: {}", e);
                    self.report.encode_errors += 1;
                }
            }
        }

        match self.sink.write(&buffer, generation) {
            Ok(()) => {
                self.report.frames_written += buffer.frame_count() as u64;
                self.report.buffers_written += 1;
                self.report.generations.push(generation);
            }
            Err(e) => {
                tracing::error!("Capture write failed, buffer dropped: {}", e);
                self.report.write_errors += 1;
            }
        }
    }
}
