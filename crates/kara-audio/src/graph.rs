//! Audio processing graph.
//!
//! The graph owns a small set of named nodes and the directed connections
//! between them, plus the device the compiled chain runs on. Topology is only
//! mutable while the runtime is stopped; `start` validates that the nodes form
//! one unbranched source-to-sink path, instantiates a processor per node and
//! hands the resulting [`RenderChain`] to the device.

use crate::builtin::{
    GateProcessor, InputProcessor, MixerProcessor, MixerSettings, OutputProcessor, PlayerHandle,
    PlayerProcessor,
};
use crate::device::{AudioDevice, DeviceError, Renderer};
use crate::effects::EffectSpec;
use kara_comms::{LevelMeter, MeterReader, MeterWriter, SharedGain, TapProducer, meter_channel};
use kara_core::{AudioFormat, ChannelCount, Frames, Sample};
use kara_node::{NodeError, ProcessBuffer, Processor};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub type NodeId = usize;

/// What a node does once the chain is compiled.
#[derive(Clone)]
pub enum NodeKind {
    /// Device capture input.
    Input,
    /// Looping playback of a decoded buffer.
    Player(PlayerHandle),
    /// Mute gate.
    Gate(Arc<SharedGain>),
    Effect(EffectSpec),
    /// Capture mix-down plus backing track.
    Mixer(MixerSettings),
    /// Device playback output.
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Source,
    Gate,
    Effect,
    Sink,
}

impl NodeKind {
    pub const fn role(&self) -> NodeRole {
        match self {
            Self::Input | Self::Player(_) => NodeRole::Source,
            Self::Gate(_) => NodeRole::Gate,
            Self::Effect(_) => NodeRole::Effect,
            Self::Mixer(_) | Self::Output => NodeRole::Sink,
        }
    }

    /// Permanent nodes survive [`AudioGraph::reset`].
    pub const fn is_permanent(&self) -> bool {
        !matches!(self, Self::Effect(_))
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Player(_) => "player",
            Self::Gate(_) => "gate",
            Self::Effect(_) => "effect",
            Self::Mixer(_) => "mixer",
            Self::Output => "output",
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Effect(spec) => write!(f, "Effect({spec})"),
            other => f.write_str(other.label()),
        }
    }
}

/// A node registered with the graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    id: NodeId,
    name: String,
    kind: NodeKind,
}

impl GraphNode {
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn kind(&self) -> &NodeKind {
        &self.kind
    }

    #[must_use]
    pub const fn role(&self) -> NodeRole {
        self.kind.role()
    }
}

/// Directed edge carrying `format`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub from: NodeId,
    pub to: NodeId,
    pub format: AudioFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeState {
    #[default]
    Stopped,
    Running,
    Paused,
}

/// Call counters, for verifying that an operation did not touch topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphStats {
    pub attach_calls: u64,
    pub detach_calls: u64,
    pub starts: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Topology cannot change while the runtime is engaged")]
    RuntimeEngaged,

    #[error("Audio engine failed to start: {0}")]
    EngineStartFailure(#[source] DeviceError),

    #[error("Node failed to initialize: {0}")]
    Node(#[from] NodeError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// The audio processing graph
pub struct AudioGraph {
    device: Box<dyn AudioDevice>,
    nodes: HashMap<NodeId, GraphNode>,
    connections: Vec<Connection>,
    next_id: NodeId,
    block_size: Frames,

    tap: Option<(NodeId, TapProducer)>,
    output_gain: Arc<SharedGain>,
    frames_rendered: Arc<AtomicU64>,
    meter: Option<MeterReader>,

    state: RuntimeState,
    stats: GraphStats,
}

impl AudioGraph {
    pub fn new(device: Box<dyn AudioDevice>, block_size: Frames) -> Self {
        Self {
            device,
            nodes: HashMap::new(),
            connections: Vec::new(),
            next_id: 0,
            block_size: block_size.max(1),
            tap: None,
            output_gain: Arc::new(SharedGain::default()),
            frames_rendered: Arc::new(AtomicU64::new(0)),
            meter: None,
            state: RuntimeState::Stopped,
            stats: GraphStats::default(),
        }
    }

    fn ensure_stopped(&self) -> Result<(), GraphError> {
        if self.state == RuntimeState::Stopped {
            Ok(())
        } else {
            Err(GraphError::RuntimeEngaged)
        }
    }

    fn node_ref(&self, id: NodeId) -> Result<&GraphNode, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))
    }

    /// Register a node so it can be connected.
    pub fn attach(&mut self, name: impl Into<String>, kind: NodeKind) -> Result<NodeId, GraphError> {
        self.ensure_stopped()?;
        let id = self.next_id;
        self.next_id += 1;
        let name = name.into();
        tracing::debug!("Attached node {} '{}' ({:?})", id, name, kind);
        self.nodes.insert(id, GraphNode { id, name, kind });
        self.stats.attach_calls += 1;
        Ok(id)
    }

    /// Remove a node and every connection touching it
    pub fn detach(&mut self, id: NodeId) -> Result<GraphNode, GraphError> {
        self.ensure_stopped()?;
        let node = self.nodes.remove(&id).ok_or(GraphError::UnknownNode(id))?;
        self.connections.retain(|c| c.from != id && c.to != id);
        if self.tap.as_ref().is_some_and(|(tap_node, _)| *tap_node == id) {
            self.tap = None;
        }
        self.stats.detach_calls += 1;
        tracing::debug!("Detached node {} '{}'", id, node.name);
        Ok(node)
    }

    /// Detach every non-permanent node and clear all connections. The device
    /// handle is kept.
    pub fn reset(&mut self) -> Result<(), GraphError> {
        self.ensure_stopped()?;
        let transient: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| !n.kind.is_permanent())
            .map(GraphNode::id)
            .collect();
        for id in transient {
            self.detach(id)?;
        }
        self.connections.clear();
        tracing::debug!("Graph reset ({} permanent nodes kept)", self.nodes.len());
        Ok(())
    }

    /// Stop the runtime, drop every node and the tap, and re-acquire the
    /// device handle.
    pub fn reset_all(&mut self) -> Result<(), GraphError> {
        self.stop();
        let count = self.nodes.len() as u64;
        self.nodes.clear();
        self.connections.clear();
        self.tap = None;
        self.stats.detach_calls += count;
        self.device.reinitialize()?;
        tracing::info!("Graph fully reset, device reinitialized");
        Ok(())
    }

    /// Create the edge `from -> to` carrying `format`.
    pub fn connect(&mut self, from: NodeId, to: NodeId, format: AudioFormat) -> Result<(), GraphError> {
        self.ensure_stopped()?;
        let from_node = self.node_ref(from)?;
        let to_node = self.node_ref(to)?;

        if from == to {
            return Err(GraphError::InvalidTopology(format!("self loop on node {from}")));
        }
        if from_node.role() == NodeRole::Sink {
            return Err(GraphError::InvalidTopology(format!(
                "sink '{}' cannot have outgoing edges",
                from_node.name
            )));
        }
        if to_node.role() == NodeRole::Source {
            return Err(GraphError::InvalidTopology(format!(
                "source '{}' cannot have incoming edges",
                to_node.name
            )));
        }
        if self.connections.iter().any(|c| c.from == from) {
            return Err(GraphError::InvalidTopology(format!(
                "'{}' already has an outgoing edge",
                from_node.name
            )));
        }
        if self.connections.iter().any(|c| c.to == to) {
            return Err(GraphError::InvalidTopology(format!(
                "'{}' already has an incoming edge",
                to_node.name
            )));
        }

        self.check_format(from_node, to_node, format)?;

        let conn = Connection { from, to, format };
        self.connections.push(conn);
        if let Err(cycle) = self.topological_sort() {
            self.connections.pop();
            return Err(GraphError::InvalidTopology(format!(
                "edge {from} -> {to} creates a cycle through {cycle:?}"
            )));
        }

        tracing::debug!("Connected {} -> {} ({})", from, to, format);
        Ok(())
    }

    fn check_format(
        &self,
        from: &GraphNode,
        to: &GraphNode,
        format: AudioFormat,
    ) -> Result<(), GraphError> {
        format
            .validate()
            .map_err(|e| GraphError::FormatMismatch(e.to_string()))?;

        let mismatch = |what: &str, expected: AudioFormat| {
            GraphError::FormatMismatch(format!("{what} expects {expected}, edge carries {format}"))
        };

        // Fixed output formats of sources
        match &from.kind {
            NodeKind::Input => {
                let device_input = self.device.input_format().ok_or_else(|| {
                    GraphError::FormatMismatch("device has no input".to_string())
                })?;
                if !device_input.is_compatible(&format) {
                    return Err(mismatch("device input", device_input));
                }
            }
            NodeKind::Player(handle) => {
                if !handle.format().is_compatible(&format) {
                    return Err(mismatch("player buffer", handle.format()));
                }
            }
            _ => {}
        }

        // Sinks run at the device rate
        if to.role() == NodeRole::Sink {
            let rate = self.device.output_format().sample_rate;
            if format.sample_rate != rate {
                return Err(GraphError::FormatMismatch(format!(
                    "'{}' runs at {rate} Hz, edge carries {format}",
                    to.name
                )));
            }
        }

        // Pass-through nodes forward their input format unchanged
        for node in [from, to] {
            if !matches!(node.role(), NodeRole::Gate | NodeRole::Effect) {
                continue;
            }
            if let Some(existing) = self
                .connections
                .iter()
                .find(|c| c.from == node.id || c.to == node.id)
            {
                if !existing.format.is_compatible(&format) {
                    return Err(mismatch(&format!("'{}'", node.name), existing.format));
                }
            }
        }
        Ok(())
    }

    /// Remove the edge `from -> to`. Returns whether it existed.
    pub fn disconnect(&mut self, from: NodeId, to: NodeId) -> Result<bool, GraphError> {
        self.ensure_stopped()?;
        let before = self.connections.len();
        self.connections.retain(|c| !(c.from == from && c.to == to));
        let removed = self.connections.len() != before;
        if removed {
            tracing::debug!("Disconnected {} -> {}", from, to);
        }
        Ok(removed)
    }

    /// Id of the node in `slot`, attaching a fresh one if the slot is empty
    /// or its node is gone (after [`reset_all`](Self::reset_all)).
    pub fn ensure_node(
        &mut self,
        slot: &mut Option<NodeId>,
        name: &str,
        kind: impl FnOnce() -> NodeKind,
    ) -> Result<NodeId, GraphError> {
        if let Some(id) = *slot {
            if self.nodes.contains_key(&id) {
                return Ok(id);
            }
        }
        let id = self.attach(name, kind())?;
        *slot = Some(id);
        Ok(id)
    }

    /// Connect `upstream` to `sink`, through a single effect node unless
    /// `effect` is [`EffectSpec::None`]. Returns the effect node.
    pub fn splice_effect(
        &mut self,
        upstream: NodeId,
        sink: NodeId,
        effect: EffectSpec,
        format: AudioFormat,
    ) -> Result<Option<NodeId>, GraphError> {
        if effect.is_none() {
            self.connect(upstream, sink, format)?;
            return Ok(None);
        }
        let id = self.attach(effect.name(), NodeKind::Effect(effect))?;
        self.connect(upstream, id, format)?;
        self.connect(id, sink, format)?;
        Ok(Some(id))
    }

    /// Perform topological sort using Kahn's algorithm
    ///
    /// Complexity: O(V + E) where V = nodes, E = edges
    ///
    /// Returns Ok(order) if graph is acyclic, `Err(remaining_nodes)` if cycles exist.
    fn topological_sort(&self) -> Result<Vec<NodeId>, Vec<NodeId>> {
        let mut in_degree: HashMap<NodeId, usize> = HashMap::with_capacity(self.nodes.len());
        for &id in self.nodes.keys() {
            in_degree.insert(id, 0);
        }

        let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::with_capacity(self.nodes.len());
        for conn in &self.connections {
            *in_degree.entry(conn.to).or_insert(0) += 1;
            adjacency.entry(conn.from).or_default().push(conn.to);
        }

        // Min-heap keeps the order deterministic
        let mut queue: BinaryHeap<Reverse<NodeId>> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&id, _)| Reverse(id))
            .collect();

        let mut result = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(node_id)) = queue.pop() {
            result.push(node_id);
            if let Some(outgoing) = adjacency.get(&node_id) {
                for &to_id in outgoing {
                    if let Some(degree) = in_degree.get_mut(&to_id) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push(Reverse(to_id));
                        }
                    }
                }
            }
        }

        if result.len() == self.nodes.len() {
            Ok(result)
        } else {
            let processed: HashSet<NodeId> = result.into_iter().collect();
            let mut remaining: Vec<NodeId> = self
                .nodes
                .keys()
                .filter(|id| !processed.contains(id))
                .copied()
                .collect();
            remaining.sort_unstable();
            Err(remaining)
        }
    }

    /// The node ids from source to sink, if the graph is one complete chain.
    pub fn chain(&self) -> Result<Vec<NodeId>, GraphError> {
        let order = self.topological_sort().map_err(|cycle| {
            GraphError::InvalidTopology(format!("cycle through {cycle:?}"))
        })?;

        let (Some(&first), Some(&last)) = (order.first(), order.last()) else {
            return Err(GraphError::InvalidTopology("graph is empty".to_string()));
        };
        let sources = self
            .nodes
            .values()
            .filter(|n| n.role() == NodeRole::Source)
            .count();
        if sources != 1 {
            return Err(GraphError::InvalidTopology(format!(
                "expected exactly one source, found {sources}"
            )));
        }
        if self.nodes[&first].role() != NodeRole::Source {
            return Err(GraphError::InvalidTopology(format!(
                "'{}' is not connected to the source",
                self.nodes[&first].name
            )));
        }
        if self.nodes[&last].role() != NodeRole::Sink {
            return Err(GraphError::InvalidTopology(format!(
                "chain ends at '{}', not a sink",
                self.nodes[&last].name
            )));
        }
        for pair in order.windows(2) {
            if !self
                .connections
                .iter()
                .any(|c| c.from == pair[0] && c.to == pair[1])
            {
                return Err(GraphError::InvalidTopology(format!(
                    "'{}' is not connected to '{}'",
                    self.nodes[&pair[0]].name, self.nodes[&pair[1]].name
                )));
            }
        }
        Ok(order)
    }

    /// Engage the runtime. Resumes it when paused.
    pub fn start(&mut self) -> Result<(), GraphError> {
        match self.state {
            RuntimeState::Running => return Ok(()),
            RuntimeState::Paused => {
                self.device.resume().map_err(GraphError::EngineStartFailure)?;
                self.state = RuntimeState::Running;
                tracing::debug!("Graph runtime resumed");
                return Ok(());
            }
            RuntimeState::Stopped => {}
        }

        let order = self.chain()?;
        let (meter_writer, meter_reader) = meter_channel();
        let mut chain = self.compile(&order, meter_writer)?;

        if let Some((tap_node, producer)) = self.tap.take() {
            if let Some(index) = order.iter().position(|&id| id == tap_node) {
                chain.tap = Some((index, producer));
            }
        }

        tracing::info!(
            "Starting graph on '{}': {}",
            self.device.name(),
            order
                .iter()
                .map(|id| self.nodes[id].name.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        self.device
            .open(Box::new(chain))
            .map_err(GraphError::EngineStartFailure)?;
        self.meter = Some(meter_reader);
        self.state = RuntimeState::Running;
        self.stats.starts += 1;
        Ok(())
    }

    fn compile(&self, order: &[NodeId], meter: MeterWriter) -> Result<RenderChain, GraphError> {
        let device_input = self.device.input_format();
        let device_output = self.device.output_format();

        let mut stages = Vec::with_capacity(order.len());
        let mut format: Option<AudioFormat> = None;
        for &id in order {
            let node = &self.nodes[&id];
            let mut processor: Box<dyn Processor> = match &node.kind {
                NodeKind::Input => Box::new(InputProcessor::default()),
                NodeKind::Player(handle) => Box::new(PlayerProcessor::new(handle.clone())),
                NodeKind::Gate(gain) => Box::new(GateProcessor::new(Arc::clone(gain))),
                NodeKind::Effect(spec) => spec.instantiate().ok_or_else(|| {
                    GraphError::InvalidTopology(format!("effect node '{}' has no effect", node.name))
                })?,
                NodeKind::Mixer(settings) => Box::new(MixerProcessor::new(settings.clone())),
                NodeKind::Output => Box::new(OutputProcessor::default()),
            };

            let input = match (&node.kind, format) {
                (NodeKind::Input, _) => device_input.ok_or_else(|| {
                    GraphError::InvalidTopology("device has no input".to_string())
                })?,
                (NodeKind::Player(handle), _) => handle.format(),
                (_, Some(upstream)) => upstream,
                (_, None) => {
                    return Err(GraphError::InvalidTopology(format!(
                        "'{}' has no upstream format",
                        node.name
                    )));
                }
            };
            processor.initialize(input, self.block_size)?;

            let in_channels = match node.kind {
                NodeKind::Player(_) => 0,
                _ => input.channel_count,
            };
            let out_channels = processor.output_channels(input.channel_count);
            format = Some(input.with_channels(out_channels));
            stages.push(Stage {
                processor,
                in_channels,
                out_channels,
            });
        }

        Ok(RenderChain::new(
            stages,
            self.block_size,
            device_input.map_or(0, |f| f.channel_count),
            device_output.channel_count,
            meter,
            Arc::clone(&self.output_gain),
            Arc::clone(&self.frames_rendered),
        ))
    }

    /// Suspend the runtime, keeping the compiled chain. No-op unless running.
    pub fn pause(&mut self) -> Result<(), GraphError> {
        if self.state != RuntimeState::Running {
            return Ok(());
        }
        self.device.pause()?;
        self.state = RuntimeState::Paused;
        tracing::debug!("Graph runtime paused");
        Ok(())
    }

    /// Halt the runtime. Idempotent; the render chain is dropped on return.
    pub fn stop(&mut self) {
        if self.state == RuntimeState::Stopped {
            return;
        }
        self.device.close();
        self.state = RuntimeState::Stopped;
        tracing::debug!("Graph runtime stopped");
    }

    /// Tap the output of `node` on the next start.
    pub fn install_tap(&mut self, node: NodeId, producer: TapProducer) -> Result<(), GraphError> {
        self.ensure_stopped()?;
        if self.node_ref(node)?.role() != NodeRole::Sink {
            return Err(GraphError::InvalidTopology(format!(
                "tap must sit on a sink, '{}' is not one",
                self.nodes[&node].name
            )));
        }
        self.tap = Some((node, producer));
        Ok(())
    }

    /// Take back a tap that has not been handed to a running chain.
    pub fn remove_tap(&mut self) -> Option<TapProducer> {
        self.tap.take().map(|(_, producer)| producer)
    }

    pub fn has_tap(&self) -> bool {
        self.tap.is_some()
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(&id)
    }

    /// Nodes in id order
    pub fn nodes(&self) -> Vec<&GraphNode> {
        let mut nodes: Vec<&GraphNode> = self.nodes.values().collect();
        nodes.sort_unstable_by_key(|n| n.id);
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn effect_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.role() == NodeRole::Effect)
            .count()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub const fn runtime_state(&self) -> RuntimeState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == RuntimeState::Running
    }

    pub const fn stats(&self) -> GraphStats {
        self.stats
    }

    pub const fn block_size(&self) -> Frames {
        self.block_size
    }

    /// Frames rendered by every chain this graph has run.
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    /// Level of the most recently rendered block of the sink.
    pub fn output_level(&mut self) -> LevelMeter {
        self.meter
            .as_mut()
            .map(|reader| *reader.read())
            .unwrap_or_default()
    }

    /// Gain applied when the sink is mapped onto the device output.
    pub fn set_output_gain(&self, gain: f32) {
        self.output_gain.set(gain.max(0.0));
    }

    pub fn output_gain(&self) -> f32 {
        self.output_gain.get()
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    pub fn input_format(&self) -> Option<AudioFormat> {
        self.device.input_format()
    }

    pub fn output_format(&self) -> AudioFormat {
        self.device.output_format()
    }
}

impl Drop for AudioGraph {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Stage {
    processor: Box<dyn Processor>,
    in_channels: ChannelCount,
    out_channels: ChannelCount,
}

/// The realtime side of a started graph.
///
/// REAL-TIME SAFE: every buffer is allocated in `new`; `render` only copies
/// and calls processors.
pub struct RenderChain {
    stages: Vec<Stage>,
    /// Output buffer of each stage, `block_size * out_channels` samples
    buffers: Vec<Vec<Sample>>,
    /// Zero-padded copy of the device input for the first stage
    source_input: Vec<Sample>,
    block_size: Frames,
    device_in_channels: ChannelCount,
    device_out_channels: ChannelCount,
    tap: Option<(usize, TapProducer)>,
    meter: MeterWriter,
    output_gain: Arc<SharedGain>,
    frames_rendered: Arc<AtomicU64>,
}

impl RenderChain {
    fn new(
        stages: Vec<Stage>,
        block_size: Frames,
        device_in_channels: ChannelCount,
        device_out_channels: ChannelCount,
        meter: MeterWriter,
        output_gain: Arc<SharedGain>,
        frames_rendered: Arc<AtomicU64>,
    ) -> Self {
        let buffers = stages
            .iter()
            .map(|s| vec![0.0; block_size * s.out_channels])
            .collect();
        let source_channels = stages.first().map_or(0, |s| s.in_channels);
        Self {
            stages,
            buffers,
            source_input: vec![0.0; block_size * source_channels],
            block_size,
            device_in_channels,
            device_out_channels,
            tap: None,
            meter,
            output_gain,
            frames_rendered,
        }
    }

    fn process_block(&mut self, input: &[Sample], frames: Frames) {
        if let Some(first) = self.stages.first() {
            let len = frames * first.in_channels;
            let copied = len.min(input.len());
            self.source_input[..copied].copy_from_slice(&input[..copied]);
            self.source_input[copied..len].fill(0.0);
        }

        for (index, stage) in self.stages.iter_mut().enumerate() {
            let (before, after) = self.buffers.split_at_mut(index);
            let input: &[Sample] = if index == 0 {
                &self.source_input[..frames * stage.in_channels]
            } else {
                &before[index - 1][..frames * stage.in_channels]
            };
            let output = &mut after[0][..frames * stage.out_channels];

            let mut audio = ProcessBuffer {
                input,
                output,
                frames,
                input_channels: stage.in_channels,
                output_channels: stage.out_channels,
            };
            // Silence on error, nothing can be reported from here
            if stage.processor.process(&mut audio).is_err() {
                audio.output.fill(0.0);
            }

            if let Some((tap_index, producer)) = self.tap.as_mut() {
                if *tap_index == index {
                    // A full ring drops the buffer and counts it
                    let _ = producer.write(&after[0][..frames * stage.out_channels], stage.out_channels);
                }
            }
        }
    }

    fn write_output(&mut self, output: &mut [Sample], frames: Frames) {
        let (Some(stage), Some(buffer)) = (self.stages.last(), self.buffers.last()) else {
            return;
        };
        let sink_channels = stage.out_channels;
        let device_channels = self.device_out_channels;
        if sink_channels == 0 || device_channels == 0 {
            return;
        }

        let rendered = &buffer[..frames * sink_channels];
        self.meter.write(LevelMeter::measure(rendered));

        let gain = self.output_gain.get();
        for (out_frame, in_frame) in output
            .chunks_exact_mut(device_channels)
            .zip(rendered.chunks_exact(sink_channels))
        {
            for (ch, sample) in out_frame.iter_mut().enumerate() {
                let source = if sink_channels == 1 {
                    in_frame[0]
                } else {
                    in_frame.get(ch).copied().unwrap_or(0.0)
                };
                *sample = source * gain;
            }
        }
    }
}

impl Renderer for RenderChain {
    fn render(&mut self, input: &[Sample], output: &mut [Sample]) {
        output.fill(0.0);
        let total_frames = if self.device_out_channels > 0 && !output.is_empty() {
            output.len() / self.device_out_channels
        } else if self.device_in_channels > 0 {
            input.len() / self.device_in_channels
        } else {
            0
        };

        let mut offset = 0;
        while offset < total_frames {
            let frames = (total_frames - offset).min(self.block_size);
            let in_start = (offset * self.device_in_channels).min(input.len());
            let in_end = ((offset + frames) * self.device_in_channels).min(input.len());
            self.process_block(&input[in_start..in_end], frames);

            let out_start = (offset * self.device_out_channels).min(output.len());
            let out_end = ((offset + frames) * self.device_out_channels).min(output.len());
            self.write_output(&mut output[out_start..out_end], frames);

            self.frames_rendered.fetch_add(frames as u64, Ordering::AcqRel);
            offset += frames;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{OfflineDevice, OfflineDriver};
    use crate::effects::DelayTime;
    use kara_comms::tap_channel;
    use kara_core::AudioBuffer;

    fn capture_graph() -> (AudioGraph, OfflineDriver) {
        let (device, driver) = OfflineDevice::capture(AudioFormat::float32(48000, 1));
        (AudioGraph::new(Box::new(device), 64), driver)
    }

    fn playback_graph() -> (AudioGraph, OfflineDriver) {
        let (device, driver) = OfflineDevice::playback(AudioFormat::float32(48000, 2));
        (AudioGraph::new(Box::new(device), 64), driver)
    }

    fn gate(graph: &mut AudioGraph, name: &str) -> NodeId {
        graph
            .attach(name, NodeKind::Gate(Arc::new(SharedGain::default())))
            .unwrap()
    }

    fn mono() -> AudioFormat {
        AudioFormat::float32(48000, 1)
    }

    #[test]
    fn test_empty_graph_topological_sort() {
        let (graph, _driver) = capture_graph();
        let result = graph.topological_sort();
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), Vec::<NodeId>::new());
    }

    #[test]
    fn test_linear_chain_topological_sort() {
        let (mut graph, _driver) = capture_graph();
        let input = graph.attach("input", NodeKind::Input).unwrap();
        let gate = gate(&mut graph, "gate");
        let mixer = graph
            .attach("mixer", NodeKind::Mixer(MixerSettings::default()))
            .unwrap();

        // wire out of id order on purpose
        graph.connect(gate, mixer, mono()).unwrap();
        graph.connect(input, gate, mono()).unwrap();

        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec![input, gate, mixer]);
    }

    #[test]
    fn test_parallel_paths_topological_sort() {
        let (mut graph, _driver) = capture_graph();
        let node_a = gate(&mut graph, "A");
        let node_b = gate(&mut graph, "B");
        let node_c = gate(&mut graph, "C");
        let node_d = gate(&mut graph, "D");

        // A -> B -> D, A -> C -> D (bypassing connect validation)
        for (from, to) in [(node_a, node_b), (node_a, node_c), (node_b, node_d), (node_c, node_d)] {
            graph.connections.push(Connection {
                from,
                to,
                format: mono(),
            });
        }

        let order = graph.topological_sort().unwrap();
        let pos = |id| order.iter().position(|&n| n == id).unwrap();
        assert!(pos(node_a) < pos(node_b));
        assert!(pos(node_a) < pos(node_c));
        assert!(pos(node_b) < pos(node_d));
        assert!(pos(node_c) < pos(node_d));
    }

    #[test]
    fn test_partial_cycle_detection() {
        let (mut graph, _driver) = capture_graph();
        let node_a = gate(&mut graph, "A");
        let node_b = gate(&mut graph, "B");
        let node_c = gate(&mut graph, "C");

        // A -> B -> C -> B
        for (from, to) in [(node_a, node_b), (node_b, node_c), (node_c, node_b)] {
            graph.connections.push(Connection {
                from,
                to,
                format: mono(),
            });
        }

        let remaining = graph.topological_sort().unwrap_err();
        assert_eq!(remaining, vec![node_b, node_c]);
    }

    #[test]
    fn test_connect_rejects_cycle() {
        let (mut graph, _driver) = capture_graph();
        let a = gate(&mut graph, "A");
        let b = gate(&mut graph, "B");
        let c = gate(&mut graph, "C");
        graph.connect(a, b, mono()).unwrap();
        graph.connect(b, c, mono()).unwrap();
        assert!(matches!(
            graph.connect(c, a, mono()),
            Err(GraphError::InvalidTopology(_))
        ));
        assert_eq!(graph.connections().len(), 2);
    }

    #[test]
    fn test_connect_rejects_invalid_edges() {
        let (mut graph, _driver) = capture_graph();
        let input = graph.attach("input", NodeKind::Input).unwrap();
        let a = gate(&mut graph, "A");
        let b = gate(&mut graph, "B");
        let mixer = graph
            .attach("mixer", NodeKind::Mixer(MixerSettings::default()))
            .unwrap();

        assert!(matches!(
            graph.connect(a, a, mono()),
            Err(GraphError::InvalidTopology(_))
        ));
        assert!(matches!(
            graph.connect(a, input, mono()),
            Err(GraphError::InvalidTopology(_))
        ));
        assert!(matches!(
            graph.connect(mixer, a, mono()),
            Err(GraphError::InvalidTopology(_))
        ));
        assert!(matches!(
            graph.connect(a, 99, mono()),
            Err(GraphError::UnknownNode(99))
        ));

        graph.connect(input, a, mono()).unwrap();
        // second outgoing edge from the source
        assert!(matches!(
            graph.connect(input, b, mono()),
            Err(GraphError::InvalidTopology(_))
        ));
        // second incoming edge into A
        assert!(matches!(
            graph.connect(b, a, mono()),
            Err(GraphError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_connect_checks_formats() {
        let (mut graph, _driver) = capture_graph();
        let input = graph.attach("input", NodeKind::Input).unwrap();
        let a = gate(&mut graph, "A");
        let mixer = graph
            .attach("mixer", NodeKind::Mixer(MixerSettings::default()))
            .unwrap();

        // device input is mono
        assert!(matches!(
            graph.connect(input, a, AudioFormat::float32(48000, 2)),
            Err(GraphError::FormatMismatch(_))
        ));
        graph.connect(input, a, mono()).unwrap();
        // A already carries mono at 48 kHz
        assert!(matches!(
            graph.connect(a, mixer, AudioFormat::float32(48000, 2)),
            Err(GraphError::FormatMismatch(_))
        ));
        assert!(matches!(
            graph.connect(a, mixer, AudioFormat::float32(44100, 1)),
            Err(GraphError::FormatMismatch(_))
        ));
        graph.connect(a, mixer, mono()).unwrap();
    }

    #[test]
    fn test_player_format_is_fixed() {
        let (mut graph, _driver) = playback_graph();
        let buffer = AudioBuffer::silent(AudioFormat::float32(48000, 2), 16);
        let player = graph
            .attach("player", NodeKind::Player(PlayerHandle::new(buffer)))
            .unwrap();
        let output = graph.attach("output", NodeKind::Output).unwrap();
        assert!(matches!(
            graph.connect(player, output, mono()),
            Err(GraphError::FormatMismatch(_))
        ));
        graph
            .connect(player, output, AudioFormat::float32(48000, 2))
            .unwrap();
    }

    #[test]
    fn test_splice_effect_and_ensure_node() {
        let (mut graph, _driver) = capture_graph();
        let mut input_slot = None;
        let input = graph
            .ensure_node(&mut input_slot, "input", || NodeKind::Input)
            .unwrap();
        let again = graph
            .ensure_node(&mut input_slot, "input", || NodeKind::Input)
            .unwrap();
        assert_eq!(input, again);
        let mixer = graph
            .attach("mixer", NodeKind::Mixer(MixerSettings::default()))
            .unwrap();

        assert_eq!(
            graph
                .splice_effect(input, mixer, EffectSpec::None, mono())
                .unwrap(),
            None
        );
        assert_eq!(graph.chain().unwrap(), vec![input, mixer]);

        graph.reset().unwrap();
        let delay = graph
            .splice_effect(input, mixer, EffectSpec::Delay(DelayTime::default()), mono())
            .unwrap()
            .unwrap();
        assert_eq!(graph.chain().unwrap(), vec![input, delay, mixer]);
        assert_eq!(graph.effect_count(), 1);

        graph.reset_all().unwrap();
        let fresh = graph
            .ensure_node(&mut input_slot, "input", || NodeKind::Input)
            .unwrap();
        assert_ne!(fresh, input);
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_start_requires_complete_chain() {
        let (mut graph, _driver) = capture_graph();
        assert!(matches!(graph.start(), Err(GraphError::InvalidTopology(_))));

        let input = graph.attach("input", NodeKind::Input).unwrap();
        let a = gate(&mut graph, "A");
        let mixer = graph
            .attach("mixer", NodeKind::Mixer(MixerSettings::default()))
            .unwrap();
        graph.connect(input, a, mono()).unwrap();
        // dangling mixer
        assert!(matches!(graph.start(), Err(GraphError::InvalidTopology(_))));
        assert_eq!(graph.runtime_state(), RuntimeState::Stopped);

        graph.connect(a, mixer, mono()).unwrap();
        graph.start().unwrap();
        assert!(graph.is_running());
    }

    #[test]
    fn test_mutation_rejected_while_engaged() {
        let (mut graph, _driver) = capture_graph();
        let input = graph.attach("input", NodeKind::Input).unwrap();
        let mixer = graph
            .attach("mixer", NodeKind::Mixer(MixerSettings::default()))
            .unwrap();
        graph.connect(input, mixer, mono()).unwrap();
        graph.start().unwrap();

        assert!(matches!(
            graph.attach("late", NodeKind::Effect(EffectSpec::Equalizer)),
            Err(GraphError::RuntimeEngaged)
        ));
        assert!(matches!(graph.reset(), Err(GraphError::RuntimeEngaged)));
        assert!(matches!(
            graph.disconnect(input, mixer),
            Err(GraphError::RuntimeEngaged)
        ));

        graph.pause().unwrap();
        assert!(matches!(graph.detach(input), Err(GraphError::RuntimeEngaged)));

        graph.stop();
        graph.stop();
        assert!(graph.disconnect(input, mixer).unwrap());
    }

    #[test]
    fn test_reset_keeps_permanent_nodes() {
        let (mut graph, _driver) = capture_graph();
        let input = graph.attach("input", NodeKind::Input).unwrap();
        let effect = graph
            .attach("effect", NodeKind::Effect(EffectSpec::Delay(DelayTime::default())))
            .unwrap();
        let mixer = graph
            .attach("mixer", NodeKind::Mixer(MixerSettings::default()))
            .unwrap();
        graph.connect(input, effect, mono()).unwrap();
        graph.connect(effect, mixer, mono()).unwrap();

        graph.reset().unwrap();
        assert!(graph.connections().is_empty());
        assert!(graph.node(effect).is_none());
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.effect_count(), 0);
        assert_eq!(graph.stats().detach_calls, 1);
    }

    #[test]
    fn test_reset_all_drops_everything() {
        let (mut graph, driver) = capture_graph();
        let input = graph.attach("input", NodeKind::Input).unwrap();
        let mixer = graph
            .attach("mixer", NodeKind::Mixer(MixerSettings::default()))
            .unwrap();
        graph.connect(input, mixer, mono()).unwrap();
        let (producer, _consumer) = tap_channel(0, 4);
        graph.install_tap(mixer, producer).unwrap();
        graph.start().unwrap();

        graph.reset_all().unwrap();
        assert_eq!(graph.node_count(), 0);
        assert!(!graph.has_tap());
        assert_eq!(graph.runtime_state(), RuntimeState::Stopped);
        assert_eq!(driver.reinitializations(), 1);
    }

    #[test]
    fn test_render_through_chain_with_tap() {
        let (mut graph, driver) = capture_graph();
        let input = graph.attach("input", NodeKind::Input).unwrap();
        let gain = Arc::new(SharedGain::new(0.5));
        let gate = graph.attach("gate", NodeKind::Gate(Arc::clone(&gain))).unwrap();
        let mixer = graph
            .attach("mixer", NodeKind::Mixer(MixerSettings::default()))
            .unwrap();
        graph.connect(input, gate, mono()).unwrap();
        graph.connect(gate, mixer, mono()).unwrap();
        let (producer, mut consumer) = tap_channel(7, 16);
        graph.install_tap(mixer, producer).unwrap();
        graph.set_output_gain(1.0);
        graph.start().unwrap();

        // 100 frames: one full 64-frame block and a 36-frame remainder
        let input_samples: Vec<Sample> = (0..100).map(|i| i as Sample / 100.0).collect();
        let output = driver.pump(&input_samples).unwrap();
        assert_eq!(output.len(), 100);
        assert_eq!(output[10], 0.05);
        assert_eq!(graph.frames_rendered(), 100);

        let mut tapped = Vec::new();
        while let Some(block) = consumer.pop() {
            assert_eq!(block.generation, 7);
            tapped.extend_from_slice(block.data());
        }
        assert_eq!(tapped, output);

        let level = graph.output_level();
        assert!(level.peak > 0.0);
    }

    #[test]
    fn test_output_gain_and_channel_mapping() {
        let (mut graph, driver) = playback_graph();
        let buffer =
            AudioBuffer::from_samples(AudioFormat::float32(48000, 1), vec![0.5; 32]).unwrap();
        let handle = PlayerHandle::new(buffer);
        let player = graph
            .attach("player", NodeKind::Player(handle.clone()))
            .unwrap();
        let output = graph.attach("output", NodeKind::Output).unwrap();
        graph.connect(player, output, mono()).unwrap();
        graph.set_output_gain(0.5);
        graph.start().unwrap();
        handle.transport.play();

        // mono player mapped to both device channels
        let rendered = driver.pump_frames(8).unwrap();
        assert_eq!(rendered, vec![0.25; 16]);
        assert_eq!(handle.transport.position(), 8);
    }

    #[test]
    fn test_start_failure_is_recoverable() {
        let (mut graph, driver) = capture_graph();
        let input = graph.attach("input", NodeKind::Input).unwrap();
        let mixer = graph
            .attach("mixer", NodeKind::Mixer(MixerSettings::default()))
            .unwrap();
        graph.connect(input, mixer, mono()).unwrap();

        driver.fail_next_open("device busy");
        assert!(matches!(
            graph.start(),
            Err(GraphError::EngineStartFailure(_))
        ));
        assert_eq!(graph.runtime_state(), RuntimeState::Stopped);
        graph.start().unwrap();
        assert!(driver.is_running());
    }

    #[test]
    fn test_pause_and_start_resumes() {
        let (mut graph, driver) = capture_graph();
        let input = graph.attach("input", NodeKind::Input).unwrap();
        let mixer = graph
            .attach("mixer", NodeKind::Mixer(MixerSettings::default()))
            .unwrap();
        graph.connect(input, mixer, mono()).unwrap();

        // pause while stopped is a no-op
        graph.pause().unwrap();
        assert_eq!(graph.runtime_state(), RuntimeState::Stopped);

        graph.start().unwrap();
        graph.pause().unwrap();
        assert!(driver.pump_frames(16).is_none());
        graph.start().unwrap();
        assert!(driver.pump_frames(16).is_some());
        assert_eq!(graph.stats().starts, 1);
        assert_eq!(driver.opens(), 1);
    }
}
