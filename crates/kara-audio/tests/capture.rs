//! Capture path end to end on an offline device.

use kara_audio::codec::PACKET_FRAMES;
use kara_audio::persist::WrittenBuffer;
use kara_audio::{
    CaptureController, Convertor, Destination, EffectSpec, EngineConfig, MemorySink,
    OfflineDevice, OfflineDriver, PacketFormat, RecordingState, decode_packets,
};
use kara_core::{AudioBuffer, AudioFormat, Sample};

const RATE: u32 = 48000;

fn capture(config: EngineConfig) -> (CaptureController, OfflineDriver) {
    let (device, driver) = OfflineDevice::capture(AudioFormat::float32(RATE, 1));
    (CaptureController::new(Box::new(device), &config), driver)
}

fn test_config() -> EngineConfig {
    EngineConfig {
        block_size: 64,
        worker_poll_ms: 1,
        ..EngineConfig::default()
    }
}

/// Deterministic, non-repeating test material.
fn voice(start: usize, frames: usize) -> Vec<Sample> {
    (start..start + frames)
        .map(|i| ((i as f32) * 0.0173).sin() * 0.6 + ((i as f32) * 0.0031).cos() * 0.2)
        .collect()
}

fn pump_all(driver: &OfflineDriver, samples: &[Sample], period: usize) {
    for chunk in samples.chunks(period) {
        assert!(driver.pump(chunk).is_some());
    }
}

#[test]
fn wav_destination_is_bit_exact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("take.wav");
    let (mut capture, driver) = capture(test_config());

    capture.start(path.clone(), false).unwrap();
    let input = voice(0, 10_000);
    pump_all(&driver, &input, 480);
    let report = capture.stop().unwrap();

    assert_eq!(report.frames_written, 10_000);
    assert_eq!(report.write_errors, 0);
    assert_eq!(report.dropped_tap_buffers, 0);

    let mut reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.spec().channels, 1);
    assert_eq!(reader.spec().sample_rate, RATE);
    let written: Vec<f32> = reader.samples::<f32>().map(Result::unwrap).collect();
    assert_eq!(written, input);
}

#[test]
fn compressed_packets_decode_to_quantized_pcm() {
    let (mut capture, driver) = capture(test_config());
    let packets = capture.packets();
    let sink = MemorySink::new();

    capture.start(Destination::Sink(Box::new(sink.clone())), true).unwrap();
    let frames = PACKET_FRAMES * 8 * 2 + 777;
    let input = voice(0, frames);
    pump_all(&driver, &input, 512);
    let report = capture.stop().unwrap();

    let format = AudioFormat::float32(RATE, 1);
    let convertor = Convertor::new(format, PacketFormat::lossless_mono(RATE)).unwrap();
    let expected = convertor.quantized_buffer(&AudioBuffer::from_samples(format, input.clone()).unwrap());

    let mut decoded = Vec::new();
    let mut packet_count = 0;
    for buffer in packets.try_iter() {
        assert!(buffer.frames <= PACKET_FRAMES * 8);
        packet_count += buffer.packet_count;
        decoded.extend_from_slice(decode_packets(&buffer).unwrap().samples());
    }
    assert_eq!(decoded, expected.samples());
    assert_eq!(packet_count as u64, report.packets_produced);
    // 8 + 8 + 1 packets: the tail buffer holds 777 frames
    assert_eq!(packet_count, 17);
    assert_eq!(report.encode_errors, 0);

    // the PCM destination still receives the float mix
    assert_eq!(sink.samples(), input);
}

#[test]
fn effect_changes_never_interleave_generations() {
    let (mut capture, driver) = capture(EngineConfig {
        tap_frames: 1000,
        ..test_config()
    });
    let sink = MemorySink::new();
    capture.start(Destination::Sink(Box::new(sink.clone())), false).unwrap();

    let mut pumped = 0;
    for (round, effect) in [
        EffectSpec::Equalizer,
        EffectSpec::Distortion(None),
        EffectSpec::None,
        EffectSpec::Reverb(None),
    ]
    .into_iter()
    .enumerate()
    {
        let input = voice(pumped, 1500 + round * 100);
        pump_all(&driver, &input, 256);
        pumped += input.len();
        capture.change_effect(effect).unwrap();
        assert_eq!(capture.state(), RecordingState::Recording);
    }
    let tail = voice(pumped, 300);
    pump_all(&driver, &tail, 256);
    pumped += tail.len();
    let report = capture.stop().unwrap();

    let buffers: Vec<WrittenBuffer> = sink.buffers();
    let generations: Vec<u32> = buffers.iter().map(|b| b.generation).collect();
    let mut sorted = generations.clone();
    sorted.sort_unstable();
    assert_eq!(generations, sorted);
    assert_eq!(generations.first(), Some(&1));
    assert_eq!(generations.last(), Some(&5));
    assert_eq!(report.frames_written, pumped as u64);

    // The first generation ran without an effect, so its audio is the input.
    let first: Vec<Sample> = buffers
        .iter()
        .filter(|b| b.generation == 1)
        .flat_map(|b| b.buffer.samples().to_vec())
        .collect();
    assert_eq!(first, voice(0, 1500));
}

#[test]
fn muted_frames_are_silent_and_graph_untouched() {
    let (mut capture, driver) = capture(test_config());
    let sink = MemorySink::new();
    capture.start(Destination::Sink(Box::new(sink.clone())), false).unwrap();
    let stats = capture.graph().stats();

    pump_all(&driver, &voice(0, 640), 128);
    capture.switch_muted(true);
    assert!(capture.is_muted());
    pump_all(&driver, &voice(640, 640), 128);
    capture.switch_muted(false);
    pump_all(&driver, &voice(1280, 640), 128);

    assert_eq!(capture.graph().stats(), stats);
    assert_eq!(capture.generation(), 1);
    capture.stop().unwrap();

    let samples = sink.samples();
    assert_eq!(samples.len(), 1920);
    assert_eq!(&samples[..640], voice(0, 640).as_slice());
    assert!(samples[640..1280].iter().all(|&s| s == 0.0));
    assert_eq!(&samples[1280..], voice(1280, 640).as_slice());
}

#[test]
fn paused_capture_writes_nothing() {
    let (mut capture, driver) = capture(test_config());
    let sink = MemorySink::new();
    capture.start(Destination::Sink(Box::new(sink.clone())), false).unwrap();

    pump_all(&driver, &voice(0, 500), 100);
    capture.pause().unwrap();
    assert!(driver.pump(&voice(500, 100)).is_none());
    capture.resume().unwrap();
    assert_eq!(capture.state(), RecordingState::Resuming);
    pump_all(&driver, &voice(600, 300), 100);
    capture.poll();
    assert_eq!(capture.state(), RecordingState::Recording);

    let report = capture.stop().unwrap();
    assert_eq!(report.frames_written, 800);
    let mut expected = voice(0, 500);
    expected.extend(voice(600, 300));
    assert_eq!(sink.samples(), expected);
}

#[test]
fn write_failures_do_not_stop_capture() {
    let (mut capture, driver) = capture(EngineConfig {
        tap_frames: 100,
        ..test_config()
    });
    capture
        .start(Destination::Sink(Box::new(MemorySink::failing())), false)
        .unwrap();
    pump_all(&driver, &voice(0, 1000), 250);
    assert_eq!(capture.state(), RecordingState::Recording);
    let report = capture.stop().unwrap();
    assert_eq!(report.write_errors, 10);
    assert_eq!(report.frames_written, 0);
}

#[test]
fn failed_restart_is_recovered_by_resume() {
    let (mut capture, driver) = capture(test_config());
    let sink = MemorySink::new();
    capture.start(Destination::Sink(Box::new(sink.clone())), false).unwrap();
    pump_all(&driver, &voice(0, 128), 64);

    driver.fail_next_open("device busy");
    assert!(capture.change_effect(EffectSpec::None).is_err());
    assert_eq!(capture.state(), RecordingState::Paused);
    assert!(!capture.graph().is_running());

    capture.resume().unwrap();
    assert!(capture.graph().is_running());
    let after = voice(128, 512);
    pump_all(&driver, &after, 64);
    let report = capture.stop().unwrap();

    assert_eq!(report.frames_written, 640);
    assert_eq!(report.generations, vec![1, 3]);
    assert_eq!(sink.samples(), voice(0, 640));
}
