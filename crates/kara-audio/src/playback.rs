//! Looped playback of a decoded source through an optional effect.

use crate::builtin::PlayerHandle;
use crate::config::EngineConfig;
use crate::device::AudioDevice;
use crate::effects::EffectSpec;
use crate::graph::{AudioGraph, GraphError, NodeId, NodeKind};
use crate::session::{self, Interruptible, SessionCategory, SessionHandle};
use crate::source::{self, AudioResource, ResourceError};
use kara_comms::{LevelMeter, StateListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
    /// Resumed, waiting for the runtime to render again
    Resuming,
}

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

pub struct PlaybackController {
    graph: AudioGraph,
    session: Option<SessionHandle>,
    state: PlaybackState,
    effect: EffectSpec,
    player: Option<PlayerHandle>,
    source_node: Option<NodeId>,
    sink_node: Option<NodeId>,
    /// `frames_rendered` when the last resume was requested
    resume_mark: u64,
    listener: Option<Box<dyn StateListener<PlaybackState>>>,
}

impl PlaybackController {
    pub fn new(device: Box<dyn AudioDevice>, config: &EngineConfig) -> Self {
        Self {
            graph: AudioGraph::new(device, config.block_size),
            session: None,
            state: PlaybackState::Stopped,
            effect: config.default_effect,
            player: None,
            source_node: None,
            sink_node: None,
            resume_mark: 0,
            listener: None,
        }
    }

    pub fn set_session(&mut self, session: SessionHandle) {
        self.session = Some(session);
    }

    pub fn set_listener(&mut self, listener: impl StateListener<PlaybackState> + 'static) {
        self.listener = Some(Box::new(listener));
    }

    pub const fn state(&self) -> PlaybackState {
        self.state
    }

    pub const fn effect(&self) -> EffectSpec {
        self.effect
    }

    pub const fn graph(&self) -> &AudioGraph {
        &self.graph
    }

    /// Decode `resource`, rebuild the graph around it and start looping from
    /// the first frame. A source that cannot be decoded leaves the current
    /// state untouched.
    pub fn play(
        &mut self,
        resource: impl Into<AudioResource>,
        effect: EffectSpec,
    ) -> Result<(), PlaybackError> {
        let rate = self.graph.output_format().sample_rate;
        let buffer = source::prepare(resource.into(), rate)?;
        tracing::info!(
            "Playing {:.2}s of audio with effect '{}'",
            buffer.duration_secs(),
            effect
        );

        self.halt();
        if let Some(id) = self.source_node.take() {
            if self.graph.node(id).is_some() {
                self.graph.detach(id)?;
            }
        }
        self.player = Some(PlayerHandle::new(buffer));
        self.effect = effect;

        if let Err(e) = self.build().and_then(|()| self.engage()) {
            self.halt();
            session::release(self.session.as_ref(), SessionCategory::Playback);
            self.set_state(PlaybackState::Stopped);
            return Err(e.into());
        }
        self.set_state(PlaybackState::Playing);
        Ok(())
    }

    /// Pause in place. No-op unless playing.
    pub fn pause(&mut self) -> Result<(), GraphError> {
        if !matches!(self.state, PlaybackState::Playing | PlaybackState::Resuming) {
            return Ok(());
        }
        if let Some(player) = &self.player {
            player.transport.pause();
        }
        self.graph.pause()?;
        self.set_state(PlaybackState::Paused);
        Ok(())
    }

    /// Continue from the paused position. No-op unless paused.
    pub fn resume(&mut self) -> Result<(), GraphError> {
        if self.state != PlaybackState::Paused {
            return Ok(());
        }
        self.resume_mark = self.graph.frames_rendered();
        self.engage()?;
        self.set_state(PlaybackState::Resuming);
        Ok(())
    }

    /// Rewind and stop the runtime. No-op when stopped.
    pub fn stop(&mut self) {
        if self.state == PlaybackState::Stopped {
            return;
        }
        self.halt();
        if let Some(player) = &self.player {
            player.transport.stop();
        }
        session::release(self.session.as_ref(), SessionCategory::Playback);
        self.set_state(PlaybackState::Stopped);
    }

    /// Confirm a pending resume once the runtime has rendered again.
    pub fn poll(&mut self) {
        if self.state == PlaybackState::Resuming && self.graph.frames_rendered() > self.resume_mark
        {
            self.set_state(PlaybackState::Playing);
        }
    }

    /// Swap the effect. While playing the graph is rebuilt and restarted
    /// with the position kept; while paused it is rebuilt and stays stopped.
    pub fn change_effect(&mut self, effect: EffectSpec) -> Result<(), GraphError> {
        if effect == self.effect {
            return Ok(());
        }
        tracing::info!("Playback effect: {} -> {}", self.effect, effect);
        self.effect = effect;
        self.rebuild_now()
    }

    /// Length of one pass through the loaded source.
    pub fn duration_secs(&self) -> f64 {
        self.player.as_ref().map_or(0.0, |p| p.buffer.duration_secs())
    }

    /// Frames rendered into the loop since the last rewind.
    pub fn position(&self) -> u64 {
        self.player.as_ref().map_or(0, |p| p.transport.position())
    }

    pub fn output_level(&mut self) -> LevelMeter {
        self.graph.output_level()
    }

    pub fn set_volume(&self, gain: f32) {
        self.graph.set_output_gain(gain);
    }

    pub fn volume(&self) -> f32 {
        self.graph.output_gain()
    }

    fn rebuild_now(&mut self) -> Result<(), GraphError> {
        match self.state {
            PlaybackState::Stopped => Ok(()),
            PlaybackState::Paused => {
                self.graph.stop();
                self.build()
            }
            PlaybackState::Playing | PlaybackState::Resuming => {
                self.graph.stop();
                self.build()?;
                self.engage()
            }
        }
    }

    /// Player -> [effect] -> output, with the runtime stopped.
    fn build(&mut self) -> Result<(), GraphError> {
        let Some(player) = self.player.clone() else {
            return Err(GraphError::InvalidTopology("no source loaded".to_string()));
        };
        self.graph.stop();
        self.graph.reset()?;

        let format = player.format();
        let source = self
            .graph
            .ensure_node(&mut self.source_node, "player", || NodeKind::Player(player))?;
        let sink = self
            .graph
            .ensure_node(&mut self.sink_node, "output", || NodeKind::Output)?;
        self.graph.splice_effect(source, sink, self.effect, format)?;
        Ok(())
    }

    fn engage(&mut self) -> Result<(), GraphError> {
        session::acquire(self.session.as_ref(), SessionCategory::Playback);
        self.graph.start()?;
        if let Some(player) = &self.player {
            player.transport.play();
        }
        Ok(())
    }

    fn halt(&mut self) {
        if let Some(player) = &self.player {
            player.transport.pause();
        }
        self.graph.stop();
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state == state {
            return;
        }
        tracing::debug!("Playback: {:?} -> {:?}", self.state, state);
        self.state = state;
        if let Some(listener) = self.listener.as_mut() {
            listener.state_changed(state);
        }
    }
}

impl Interruptible for PlaybackController {
    fn label(&self) -> &'static str {
        "playback"
    }

    fn is_running(&self) -> bool {
        matches!(self.state, PlaybackState::Playing | PlaybackState::Resuming)
    }

    fn is_active(&self) -> bool {
        self.state != PlaybackState::Stopped
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
        self.rebuild_now()
    }

    fn reset_all(&mut self) -> Result<(), GraphError> {
        self.graph.reset_all()?;
        self.source_node = None;
        self.sink_node = None;
        if self.player.is_none() {
            return Ok(());
        }
        self.rebuild_now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::OfflineDevice;
    use crate::effects::{DelayTime, ReverbPreset};
    use crate::source::sine_wave;
    use kara_core::AudioFormat;

    fn controller() -> (PlaybackController, crate::device::OfflineDriver) {
        let (device, driver) = OfflineDevice::playback(AudioFormat::float32(48000, 2));
        let config = EngineConfig {
            block_size: 128,
            ..EngineConfig::default()
        };
        (PlaybackController::new(Box::new(device), &config), driver)
    }

    fn tone() -> AudioResource {
        sine_wave(440.0, 0.5, 0.5, AudioFormat::float32(48000, 1)).into()
    }

    #[test]
    fn test_play_pause_resume_keeps_position() {
        let (mut playback, driver) = controller();
        playback.play(tone(), EffectSpec::None).unwrap();
        assert_eq!(playback.state(), PlaybackState::Playing);

        driver.pump_frames(1000).unwrap();
        playback.pause().unwrap();
        assert_eq!(playback.state(), PlaybackState::Paused);
        assert!(driver.pump_frames(1000).is_none());
        let paused_at = playback.position();
        assert_eq!(paused_at, 1000);

        playback.resume().unwrap();
        assert_eq!(playback.state(), PlaybackState::Resuming);
        playback.poll();
        assert_eq!(playback.state(), PlaybackState::Resuming);
        driver.pump_frames(200).unwrap();
        playback.poll();
        assert_eq!(playback.state(), PlaybackState::Playing);
        assert_eq!(playback.position(), paused_at + 200);
    }

    #[test]
    fn test_idle_transitions_are_no_ops() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (mut playback, _driver) = controller();
        playback.set_listener(kara_comms::ChannelListener(tx));

        playback.pause().unwrap();
        playback.resume().unwrap();
        playback.stop();
        assert_eq!(playback.state(), PlaybackState::Stopped);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_listener_sees_every_transition() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (mut playback, driver) = controller();
        playback.set_listener(kara_comms::ChannelListener(tx));

        playback.play(tone(), EffectSpec::None).unwrap();
        playback.pause().unwrap();
        playback.resume().unwrap();
        driver.pump_frames(64).unwrap();
        playback.poll();
        playback.stop();

        let states: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            states,
            vec![
                PlaybackState::Playing,
                PlaybackState::Paused,
                PlaybackState::Resuming,
                PlaybackState::Playing,
                PlaybackState::Stopped,
            ]
        );
        assert_eq!(playback.position(), 0);
    }

    #[test]
    fn test_bad_source_leaves_state_alone() {
        let (mut playback, _driver) = controller();
        playback.play(tone(), EffectSpec::None).unwrap();
        let err = playback
            .play(std::path::PathBuf::from("/missing/song.wav"), EffectSpec::None)
            .unwrap_err();
        assert!(matches!(err, PlaybackError::Resource(_)));
        assert_eq!(playback.state(), PlaybackState::Playing);
        assert!(playback.graph().is_running());
    }

    #[test]
    fn test_change_effect_keeps_one_effect_node_and_position() {
        let (mut playback, driver) = controller();
        playback.play(tone(), EffectSpec::None).unwrap();
        driver.pump_frames(500).unwrap();

        for effect in [
            EffectSpec::Reverb(Some(ReverbPreset::LargeHall)),
            EffectSpec::Delay(DelayTime::new(0.25).unwrap()),
            EffectSpec::Distortion(None),
        ] {
            playback.change_effect(effect).unwrap();
            assert_eq!(playback.graph().effect_count(), 1);
            assert_eq!(playback.graph().node_count(), 3);
        }
        playback.change_effect(EffectSpec::None).unwrap();
        assert_eq!(playback.graph().effect_count(), 0);
        assert!(playback.graph().is_running());
        assert_eq!(playback.position(), 500);
    }

    #[test]
    fn test_resampled_source_plays_at_device_rate() {
        let (mut playback, driver) = controller();
        let source = sine_wave(440.0, 1.0, 0.5, AudioFormat::float32(44100, 1));
        playback.play(source, EffectSpec::None).unwrap();
        let out = driver.pump_frames(256).unwrap();
        assert_eq!(out.len(), 512);
        // mono source is mapped onto both device channels
        assert_eq!(out[100], out[101]);
        assert!(playback.output_level().peak > 0.0);
    }
}
