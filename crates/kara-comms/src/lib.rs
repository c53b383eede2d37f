//! Lockless communication primitives between the realtime render thread and
//! the control/worker threads.
//!
//! - [`tap_channel`]: SPSC ring carrying captured audio out of the render callback
//! - [`meter_channel`]: triple-buffered level meter for the control thread
//! - [`SharedGain`]: atomically updated gain value
//! - [`StateListener`]: single-slot state-change notification

pub use rtrb;
pub use triple_buffer;

use crossbeam_channel::Sender;
use kara_core::{ChannelCount, Frames, Sample};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Samples carried by one [`TapBlock`].
pub const TAP_BLOCK_SAMPLES: usize = 1024;

/// Fixed-capacity block of interleaved samples pushed by the tap.
///
/// `generation` identifies the render chain that produced the block, so a
/// consumer can tell the output of a rebuilt chain from the one it replaced.
#[derive(Clone, Copy)]
pub struct TapBlock {
    pub generation: u32,
    pub channels: ChannelCount,
    pub frames: Frames,
    pub samples: [Sample; TAP_BLOCK_SAMPLES],
}

impl TapBlock {
    /// The valid interleaved samples of this block.
    pub fn data(&self) -> &[Sample] {
        &self.samples[..self.frames * self.channels]
    }
}

/// Realtime side of the capture tap.
pub struct TapProducer {
    generation: u32,
    producer: rtrb::Producer<TapBlock>,
    dropped: Arc<AtomicU64>,
}

impl TapProducer {
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Push one interleaved buffer, split into blocks.
    ///
    /// Never blocks. If the ring cannot take the whole buffer it is dropped
    /// and counted; partial buffers are never written.
    ///
    /// REAL-TIME SAFE: no allocation, no locks.
    pub fn write(&mut self, samples: &[Sample], channels: ChannelCount) -> bool {
        if channels == 0 || samples.is_empty() {
            return true;
        }
        let frames_per_block = TAP_BLOCK_SAMPLES / channels;
        let frames = samples.len() / channels;
        let needed = frames.div_ceil(frames_per_block);
        if self.producer.slots() < needed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        for chunk in samples.chunks(frames_per_block * channels) {
            let mut block = TapBlock {
                generation: self.generation,
                channels,
                frames: chunk.len() / channels,
                samples: [0.0; TAP_BLOCK_SAMPLES],
            };
            block.samples[..chunk.len()].copy_from_slice(chunk);
            // Capacity was checked above and only this side pushes.
            let _ = self.producer.push(block);
        }
        true
    }
}

/// Worker side of the capture tap.
pub struct TapConsumer {
    generation: u32,
    consumer: rtrb::Consumer<TapBlock>,
    dropped: Arc<AtomicU64>,
}

impl TapConsumer {
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    pub fn pop(&mut self) -> Option<TapBlock> {
        self.consumer.pop().ok()
    }

    /// The producer is gone and every block has been read.
    pub fn is_finished(&self) -> bool {
        self.consumer.is_abandoned() && self.consumer.slots() == 0
    }

    /// Buffers the producer had to drop because the ring was full.
    pub fn dropped_buffers(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a tap ring holding `capacity_blocks` blocks for one chain generation.
pub fn tap_channel(generation: u32, capacity_blocks: usize) -> (TapProducer, TapConsumer) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity_blocks.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        TapProducer {
            generation,
            producer,
            dropped: Arc::clone(&dropped),
        },
        TapConsumer {
            generation,
            consumer,
            dropped,
        },
    )
}

/// Level of the most recently rendered block.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LevelMeter {
    pub peak: Sample,
    pub rms: Sample,
}

impl LevelMeter {
    pub fn measure(samples: &[Sample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut peak: Sample = 0.0;
        let mut sum = 0.0;
        for &s in samples {
            peak = peak.max(s.abs());
            sum += s * s;
        }
        Self {
            peak,
            rms: (sum / samples.len() as Sample).sqrt(),
        }
    }
}

/// Render-side meter publisher.
pub type MeterWriter = triple_buffer::Input<LevelMeter>;
/// Control-side meter reader.
pub type MeterReader = triple_buffer::Output<LevelMeter>;

pub fn meter_channel() -> (MeterWriter, MeterReader) {
    triple_buffer::TripleBuffer::new(&LevelMeter::default()).split()
}

/// Gain shared between the control thread and the render thread.
///
/// Stored as the bit pattern of an `f32` so reads and writes are single
/// atomic operations.
#[derive(Debug)]
pub struct SharedGain {
    bits: AtomicU32,
}

impl SharedGain {
    pub fn new(gain: f32) -> Self {
        Self {
            bits: AtomicU32::new(gain.to_bits()),
        }
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn set(&self, gain: f32) {
        self.bits.store(gain.to_bits(), Ordering::Release);
    }
}

impl Default for SharedGain {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Receives every state transition of a controller.
///
/// Invoked synchronously on the control thread.
pub trait StateListener<S> {
    fn state_changed(&mut self, state: S);
}

impl<S, F: FnMut(S)> StateListener<S> for F {
    fn state_changed(&mut self, state: S) {
        self(state);
    }
}

/// Forwards transitions into a crossbeam channel.
pub struct ChannelListener<S>(pub Sender<S>);

impl<S> StateListener<S> for ChannelListener<S> {
    fn state_changed(&mut self, state: S) {
        // A closed receiver just means nobody is watching any more.
        let _ = self.0.send(state);
    }
}
