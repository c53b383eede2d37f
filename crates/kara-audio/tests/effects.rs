//! Effect rebuilds keep the graph a single path with at most one effect.

use kara_audio::effects::{DistortionPreset, ReverbPreset};
use kara_audio::graph::NodeRole;
use kara_audio::{
    AudioGraph, CaptureController, DelayTime, Destination, EffectSpec, EngineConfig, MemorySink,
    OfflineDevice, PlaybackController, RecordingState,
};
use kara_core::AudioFormat;

fn every_effect() -> Vec<EffectSpec> {
    let mut effects = vec![
        EffectSpec::None,
        EffectSpec::Equalizer,
        EffectSpec::Distortion(None),
        EffectSpec::Reverb(None),
        EffectSpec::Delay(DelayTime::new(0.01).unwrap()),
        EffectSpec::Delay(DelayTime::new(2.0).unwrap()),
    ];
    effects.extend(DistortionPreset::ALL.iter().map(|&p| EffectSpec::Distortion(Some(p))));
    effects.extend(ReverbPreset::ALL.iter().map(|&p| EffectSpec::Reverb(Some(p))));
    effects
}

fn assert_single_path(graph: &AudioGraph, effect: EffectSpec) {
    let chain = graph.chain().unwrap();
    assert_eq!(chain.len(), graph.node_count(), "every node is on the path");
    assert_eq!(graph.connections().len(), chain.len() - 1);
    let expected_effects = usize::from(!effect.is_none());
    assert_eq!(graph.effect_count(), expected_effects, "{effect}");
    let roles: Vec<NodeRole> = chain
        .iter()
        .map(|&id| graph.node(id).unwrap().role())
        .collect();
    assert_eq!(roles.first(), Some(&NodeRole::Source));
    assert_eq!(roles.last(), Some(&NodeRole::Sink));
}

#[test]
fn capture_rebuilds_never_accumulate_nodes() {
    let config = EngineConfig {
        block_size: 128,
        worker_poll_ms: 1,
        ..EngineConfig::default()
    };
    let (device, driver) = OfflineDevice::capture(AudioFormat::float32(44100, 2));
    let mut capture = CaptureController::new(Box::new(device), &config);
    capture
        .start(Destination::Sink(Box::new(MemorySink::new())), false)
        .unwrap();

    for _ in 0..3 {
        for effect in every_effect() {
            capture.change_effect(effect).unwrap();
            assert_eq!(capture.state(), RecordingState::Recording);
            assert_single_path(capture.graph(), effect);
            assert!(driver.pump(&[0.1; 256]).is_some());
        }
    }
    let report = capture.stop().unwrap();
    assert_eq!(report.frames_written, (3 * every_effect().len() * 128) as u64);
}

#[test]
fn playback_rebuilds_never_accumulate_nodes() {
    let config = EngineConfig::default();
    let (device, driver) = OfflineDevice::playback(AudioFormat::float32(48000, 2));
    let mut playback = PlaybackController::new(Box::new(device), &config);
    let tone = kara_audio::source::sine_wave(220.0, 0.2, 0.5, AudioFormat::float32(48000, 2));
    playback.play(tone, EffectSpec::None).unwrap();

    for effect in every_effect().into_iter().chain(every_effect()) {
        playback.change_effect(effect).unwrap();
        assert_single_path(playback.graph(), effect);
        assert!(driver.pump_frames(512).is_some());
    }
}

#[test]
fn idle_pause_and_resume_do_nothing() {
    let config = EngineConfig::default();
    let (device, driver) = OfflineDevice::capture(AudioFormat::float32(48000, 1));
    let mut capture = CaptureController::new(Box::new(device), &config);
    let (tx, rx) = crossbeam_channel::unbounded();
    capture.set_listener(kara_comms::ChannelListener(tx));

    capture.pause().unwrap();
    capture.resume().unwrap();
    assert_eq!(capture.state(), RecordingState::Stopped);
    assert!(capture.stop().is_none());
    assert!(rx.try_recv().is_err());
    assert_eq!(driver.opens(), 0);

    capture
        .start(Destination::Sink(Box::new(MemorySink::new())), false)
        .unwrap();
    // resume while recording is also a no-op
    capture.resume().unwrap();
    assert_eq!(capture.state(), RecordingState::Recording);
    assert_eq!(driver.opens(), 1);
    capture.stop();

    let states: Vec<_> = rx.try_iter().collect();
    assert_eq!(states, vec![RecordingState::Recording, RecordingState::Stopped]);
}
