//! End-to-end engine tests, driven through the null and loopback backends
//! so no audio hardware is required.

use auricle::attrs::{self, *};
use auricle::{
    open_device, open_loopback_device, AudioBuffer, AuricleError, ErrorCode, SampleType, Vec3,
    MAX_SENDS,
};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Force the null backend before the engine singleton initializes, and
/// serialize tests that touch the process-wide current-context slot.
fn init() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        std::env::set_var("AURICLE_DRIVERS", "null");
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn current_slot_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn mono_buffer(frames: usize, sample_rate: u32) -> Arc<AudioBuffer> {
    let samples: Vec<f32> = (0..frames)
        .map(|i| (i as f32 * 0.05).sin() * 0.5)
        .collect();
    AudioBuffer::new(samples, 1, sample_rate)
}

fn stereo_loopback_attrs(frequency: i32) -> Vec<i32> {
    vec![
        ATTR_FORMAT_CHANNELS,
        CHANNELS_STEREO,
        ATTR_FORMAT_TYPE,
        TYPE_F32,
        ATTR_FREQUENCY,
        frequency,
        0,
    ]
}

#[test]
fn open_play_close() {
    init();
    let _current = current_slot_lock();

    let dev = open_device(None).unwrap();
    let ctx = dev
        .create_context(Some(&[
            ATTR_FREQUENCY,
            48000,
            ATTR_MAX_AUXILIARY_SENDS,
            2,
            0,
        ]))
        .unwrap();
    ctx.make_current().unwrap();
    assert_eq!(dev.get_error(), ErrorCode::NoError);
    assert_eq!(dev.query(ATTR_FREQUENCY).unwrap(), 48000);
    assert_eq!(dev.query(ATTR_MAX_AUXILIARY_SENDS).unwrap(), 2);

    let src = ctx.new_source().unwrap();
    src.set_buffer(Some(mono_buffer(4800, 48000))).unwrap();
    src.play().unwrap();
    assert_eq!(dev.get_error(), ErrorCode::NoError);

    // Let the null mixer run a few ticks.
    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(dev.get_error(), ErrorCode::NoError);

    ctx.delete_source(src).unwrap();
    auricle::make_current(None).unwrap();
    assert!(auricle::current_context().is_none());

    ctx.destroy().unwrap();
    let stale = dev.clone();
    dev.close().unwrap();
    assert!(matches!(
        stale.query(ATTR_FREQUENCY),
        Err(AuricleError::InvalidDevice)
    ));
}

#[test]
fn loopback_render() {
    init();

    let dev = open_loopback_device().unwrap();
    assert!(dev.is_render_format_supported(44100, CHANNELS_STEREO, TYPE_F32));
    assert!(!dev.is_render_format_supported(4000, CHANNELS_STEREO, TYPE_F32));

    let ctx = dev
        .create_context(Some(&stereo_loopback_attrs(44100)))
        .unwrap();

    let src = ctx.new_source().unwrap();
    src.set_buffer(Some(mono_buffer(44100, 44100))).unwrap();
    src.play().unwrap();

    let mut out = vec![0.0f32; 1024 * 2];
    dev.render_samples(&mut out, 1024).unwrap();
    assert_eq!(dev.get_error(), ErrorCode::NoError);
    assert!(out.iter().any(|&s| s != 0.0), "rendered audio is silent");

    // The negotiated render format reads back through the query surface.
    assert_eq!(dev.query(ATTR_FORMAT_CHANNELS).unwrap(), CHANNELS_STEREO);
    assert_eq!(dev.query(ATTR_FORMAT_TYPE).unwrap(), TYPE_F32);
    assert_eq!(dev.query(ATTR_FREQUENCY).unwrap(), 44100);

    ctx.destroy().unwrap();
    dev.close().unwrap();
}

#[test]
fn attribute_clamp() {
    init();

    let dev = open_device(None).unwrap();
    let ctx = dev
        .create_context(Some(&[ATTR_MAX_AUXILIARY_SENDS, 99, 0]))
        .unwrap();
    assert_eq!(
        dev.query(ATTR_MAX_AUXILIARY_SENDS).unwrap(),
        MAX_SENDS as i32
    );
    ctx.destroy().unwrap();
    dev.close().unwrap();
}

#[test]
fn suspend_batches_writes_into_one_tick() {
    init();

    let dev = open_loopback_device().unwrap();
    let ctx = dev
        .create_context(Some(&stereo_loopback_attrs(48000)))
        .unwrap();

    let src = ctx.new_source().unwrap();
    src.set_buffer(Some(mono_buffer(48000, 48000))).unwrap();
    src.set_looping(true).unwrap();
    src.play().unwrap();

    let mut out = vec![0.0f32; 512 * 2];
    dev.render_samples(&mut out, 512).unwrap();

    let committed = src.committed_props().unwrap();
    assert_eq!(committed.gain, 1.0);
    assert_eq!(committed.pitch, 1.0);
    let commits_before = ctx.commit_count();

    ctx.suspend().unwrap();
    src.set_gain(0.5).unwrap();
    src.set_pitch(2.0).unwrap();

    // Deferred writes stay invisible across ticks.
    dev.render_samples(&mut out, 512).unwrap();
    let committed = src.committed_props().unwrap();
    assert_eq!(committed.gain, 1.0);
    assert_eq!(committed.pitch, 1.0);
    assert_eq!(ctx.commit_count(), commits_before);

    ctx.process().unwrap();
    dev.render_samples(&mut out, 512).unwrap();

    // Both writes landed, and in exactly one commit.
    let committed = src.committed_props().unwrap();
    assert_eq!(committed.gain, 0.5);
    assert_eq!(committed.pitch, 2.0);
    assert_eq!(ctx.commit_count(), commits_before + 1);

    ctx.destroy().unwrap();
    dev.close().unwrap();
}

#[test]
fn reset_with_hrtf_request() {
    init();

    let dev = open_device(None).unwrap();
    dev.reset(Some(&[ATTR_HRTF, TRUE, ATTR_HRTF_ID, 0, 0])).unwrap();

    assert_eq!(dev.query(ATTR_HRTF).unwrap(), TRUE);
    assert_eq!(dev.query(ATTR_HRTF_STATUS).unwrap(), HRTF_ENABLED);
    // The device locks to the data set's native rate.
    assert_eq!(dev.query(ATTR_FREQUENCY).unwrap(), 44100);
    assert!(!dev.hrtf_specifier().unwrap().is_empty());
    assert!(dev.query(ATTR_NUM_HRTF_SPECIFIERS).unwrap() >= 1);

    dev.close().unwrap();
}

#[test]
fn all_attributes_round_trip_through_reset() {
    init();

    let dev = open_device(None).unwrap();
    let ctx = dev.create_context(None).unwrap();

    let before = dev.all_attributes().unwrap();
    assert_eq!(before.last(), Some(&0));
    assert_eq!(
        before.len() as i32,
        dev.query(ATTR_ATTRIBUTES_SIZE).unwrap()
    );

    dev.reset(Some(&before)).unwrap();
    let after = dev.all_attributes().unwrap();
    assert_eq!(before, after);

    ctx.destroy().unwrap();
    dev.close().unwrap();
}

#[test]
fn reset_with_zero_frequency_is_ignored() {
    init();

    let dev = open_device(None).unwrap();
    let before = dev.query(ATTR_FREQUENCY).unwrap();
    dev.reset(Some(&[ATTR_FREQUENCY, 0, 0])).unwrap();
    assert_eq!(dev.query(ATTR_FREQUENCY).unwrap(), before);
    dev.close().unwrap();
}

#[test]
fn loopback_ambisonic_validation() {
    init();

    let dev = open_loopback_device().unwrap();

    // FuMa cannot express fourth-order ambisonics.
    let result = dev.create_context(Some(&[
        ATTR_FORMAT_CHANNELS,
        CHANNELS_BFORMAT3D,
        ATTR_FORMAT_TYPE,
        TYPE_F32,
        ATTR_FREQUENCY,
        48000,
        ATTR_AMBISONIC_LAYOUT,
        AMBI_FUMA,
        ATTR_AMBISONIC_SCALING,
        AMBI_FUMA,
        ATTR_AMBISONIC_ORDER,
        4,
        0,
    ]));
    assert!(matches!(result, Err(AuricleError::InvalidValue(_))));
    assert_eq!(dev.get_error(), ErrorCode::InvalidValue);

    // A missing render format is invalid outright.
    assert!(matches!(
        dev.create_context(None),
        Err(AuricleError::InvalidValue(_))
    ));

    // Third-order ACN works and reads back.
    let ctx = dev
        .create_context(Some(&[
            ATTR_FORMAT_CHANNELS,
            CHANNELS_BFORMAT3D,
            ATTR_FORMAT_TYPE,
            TYPE_F32,
            ATTR_FREQUENCY,
            48000,
            ATTR_AMBISONIC_LAYOUT,
            AMBI_ACN,
            ATTR_AMBISONIC_SCALING,
            AMBI_SN3D,
            ATTR_AMBISONIC_ORDER,
            3,
            0,
        ]))
        .unwrap();
    assert_eq!(dev.query(ATTR_AMBISONIC_ORDER).unwrap(), 3);
    assert_eq!(dev.query(ATTR_AMBISONIC_LAYOUT).unwrap(), AMBI_ACN);

    ctx.destroy().unwrap();
    dev.close().unwrap();
}

#[test]
fn send_count_change_preserves_playback() {
    init();

    let dev = open_loopback_device().unwrap();
    let mut attrs_with_sends = stereo_loopback_attrs(48000);
    attrs_with_sends.pop();
    attrs_with_sends.extend_from_slice(&[ATTR_MAX_AUXILIARY_SENDS, 2, 0]);
    let ctx = dev.create_context(Some(&attrs_with_sends)).unwrap();
    assert_eq!(dev.query(ATTR_MAX_AUXILIARY_SENDS).unwrap(), 2);

    let src = ctx.new_source().unwrap();
    src.set_buffer(Some(mono_buffer(48000, 48000))).unwrap();
    src.set_looping(true).unwrap();
    src.play().unwrap();

    let mut out = vec![0.0f32; 256 * 2];
    dev.render_samples(&mut out, 256).unwrap();
    assert_eq!(src.state(), auricle::SourceState::Playing);

    // Grow the send count; the active voice must survive.
    let mut grow = stereo_loopback_attrs(48000);
    grow.pop();
    grow.extend_from_slice(&[ATTR_MAX_AUXILIARY_SENDS, 4, 0]);
    dev.reset(Some(&grow)).unwrap();
    assert_eq!(dev.query(ATTR_MAX_AUXILIARY_SENDS).unwrap(), 4);

    dev.render_samples(&mut out, 256).unwrap();
    assert_eq!(src.state(), auricle::SourceState::Playing);
    assert!(out.iter().any(|&s| s != 0.0), "voice died across reset");

    let committed = src.committed_props().unwrap();
    assert_eq!(committed.sends.len(), 4);
    // The new send slots carry default routing.
    assert_eq!(committed.sends[2], auricle::SendParams::default());
    assert_eq!(committed.sends[3], auricle::SendParams::default());
    assert_eq!(src.props().sends.len(), 4);

    ctx.destroy().unwrap();
    dev.close().unwrap();
}

#[test]
fn clock_is_monotone_across_resets() {
    init();

    let dev = open_loopback_device().unwrap();
    let ctx = dev
        .create_context(Some(&stereo_loopback_attrs(48000)))
        .unwrap();

    let mut out = vec![0.0f32; 1024 * 2];
    dev.render_samples(&mut out, 1024).unwrap();
    let t1 = dev.clock_ns().unwrap();
    assert!(t1 > 0);

    // A frequency change must not move the clock backwards.
    dev.reset(Some(&stereo_loopback_attrs(8000))).unwrap();
    let t2 = dev.clock_ns().unwrap();
    assert!(t2 >= t1);

    dev.render_samples(&mut out, 1024).unwrap();
    let t3 = dev.clock_ns().unwrap();
    assert!(t3 > t2);

    let (clock, latency) = dev.clock_latency_ns().unwrap();
    assert!(clock >= t3);
    assert!(latency >= 0);

    ctx.destroy().unwrap();
    dev.close().unwrap();
}

#[test]
fn effect_slot_routing() {
    init();

    let dev = open_loopback_device().unwrap();
    let ctx = dev
        .create_context(Some(&stereo_loopback_attrs(48000)))
        .unwrap();

    let slot = ctx.new_effect_slot().unwrap();
    slot.set_effect(&auricle::EffectProps {
        kind: auricle::EffectKind::Echo,
        delay: 0.005,
        feedback: 0.3,
        ..auricle::EffectProps::default()
    })
    .unwrap();
    slot.set_gain(0.8).unwrap();

    let src = ctx.new_source().unwrap();
    src.set_buffer(Some(mono_buffer(48000, 48000))).unwrap();
    src.set_looping(true).unwrap();
    src.set_send(0, Some(&slot), 0.5).unwrap();
    // A send index past the device's count is rejected.
    assert!(matches!(
        src.set_send(MAX_SENDS, None, 1.0),
        Err(AuricleError::InvalidValue(_))
    ));
    src.play().unwrap();

    let mut out = vec![0.0f32; 1024 * 2];
    dev.render_samples(&mut out, 1024).unwrap();
    assert!(out.iter().any(|&s| s != 0.0));

    ctx.delete_effect_slot(slot).unwrap();
    dev.render_samples(&mut out, 256).unwrap();

    ctx.destroy().unwrap();
    dev.close().unwrap();
}

#[test]
fn thread_local_context_slots() {
    init();
    let _current = current_slot_lock();

    let dev = open_loopback_device().unwrap();
    let ctx = dev
        .create_context(Some(&stereo_loopback_attrs(48000)))
        .unwrap();

    ctx.set_thread_context().unwrap();
    assert_eq!(auricle::thread_context(), Some(ctx.clone()));
    assert_eq!(auricle::current_context(), Some(ctx.clone()));

    // Another thread sees no thread-local context.
    let seen = {
        let handle = std::thread::spawn(auricle::thread_context);
        handle.join().unwrap()
    };
    assert!(seen.is_none());

    // A global make-current clears the calling thread's slot.
    ctx.make_current().unwrap();
    assert!(auricle::thread_context().is_none());
    assert_eq!(auricle::current_context(), Some(ctx.clone()));

    auricle::make_current(None).unwrap();
    assert!(auricle::current_context().is_none());

    ctx.destroy().unwrap();
    dev.close().unwrap();
}

#[test]
fn stale_context_handles_are_rejected() {
    init();

    let dev = open_loopback_device().unwrap();
    let ctx = dev
        .create_context(Some(&stereo_loopback_attrs(48000)))
        .unwrap();
    let stale = ctx.clone();
    ctx.destroy().unwrap();

    assert!(matches!(
        stale.new_source(),
        Err(AuricleError::InvalidContext)
    ));
    assert!(matches!(
        auricle::make_current(Some(&stale)),
        Err(AuricleError::InvalidContext)
    ));

    dev.close().unwrap();
}

#[test]
fn capture_without_backend_fails_cleanly() {
    init();

    // With drivers restricted to null there is no capture backend.
    let result = auricle::open_capture_device(
        None,
        48000,
        auricle::ChannelLayout::Mono,
        SampleType::F32,
        1024,
    );
    assert!(matches!(result, Err(AuricleError::InvalidValue(_))));
}

#[test]
fn source_property_validation() {
    init();

    let dev = open_loopback_device().unwrap();
    let ctx = dev
        .create_context(Some(&stereo_loopback_attrs(48000)))
        .unwrap();
    let src = ctx.new_source().unwrap();

    assert!(matches!(
        src.set_gain(-1.0),
        Err(AuricleError::InvalidValue(_))
    ));
    assert_eq!(dev.get_error(), ErrorCode::InvalidValue);
    assert!(matches!(
        src.set_pitch(0.0),
        Err(AuricleError::InvalidValue(_))
    ));

    src.set_position(Vec3::new(1.0, 2.0, 3.0)).unwrap();
    src.set_gain(0.25).unwrap();
    let props = src.props();
    assert_eq!(props.position, Vec3::new(1.0, 2.0, 3.0));
    assert_eq!(props.gain, 0.25);

    // Unknown query enums latch InvalidEnum.
    assert!(matches!(
        dev.query(0x7F7F),
        Err(AuricleError::InvalidEnum(_))
    ));
    assert_eq!(dev.get_error(), ErrorCode::InvalidEnum);

    ctx.destroy().unwrap();
    dev.close().unwrap();
}

#[test]
fn async_events_reach_the_callback() {
    init();

    let dev = open_loopback_device().unwrap();
    let ctx = dev
        .create_context(Some(&stereo_loopback_attrs(48000)))
        .unwrap();

    let events: Arc<Mutex<Vec<auricle::AsyncEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    ctx.set_event_callback(Some(move |event: &auricle::AsyncEvent| {
        sink.lock().unwrap().push(event.clone());
    }))
    .unwrap();

    // A short, non-looping buffer runs dry inside one render.
    let src = ctx.new_source().unwrap();
    src.set_buffer(Some(mono_buffer(256, 48000))).unwrap();
    src.play().unwrap();

    let mut out = vec![0.0f32; 1024 * 2];
    dev.render_samples(&mut out, 1024).unwrap();
    assert_eq!(src.state(), auricle::SourceState::Stopped);

    std::thread::sleep(Duration::from_millis(100));
    let seen = events.lock().unwrap();
    assert!(seen.iter().any(|e| matches!(
        e,
        auricle::AsyncEvent::SourceStateChanged {
            state: auricle::SourceState::Stopped,
            ..
        }
    )));

    drop(seen);
    ctx.destroy().unwrap();
    dev.close().unwrap();
}

#[test]
fn no_device_queries_and_enumeration() {
    init();

    assert_eq!(
        auricle::query_no_device(attrs::ATTR_MAJOR_VERSION).unwrap(),
        1
    );
    assert!(auricle::query_no_device(attrs::ATTR_FREQUENCY).is_err());

    // The null backend enumerates exactly one playback device, and the
    // default specifier is the first entry.
    let names = auricle::all_device_names();
    assert_eq!(names, vec!["No Output".to_string()]);
    assert_eq!(
        auricle::default_all_devices_specifier().as_deref(),
        Some("No Output")
    );

    assert!(auricle::is_extension_present("AUR_SOFT_loopback"));
}
