//! Devices: handles to output backends, their negotiated format, and the
//! mix graph the real-time thread renders into.
//!
//! All format and routing mutation happens in `update_device_params`,
//! under the device state lock with the backend stopped. The state lock
//! doubles as the gate against the mix callback: the callback only ever
//! `try_lock`s it.

use crate::attrs::{self, has_attributes};
use crate::backend::{Backend, BackendKind};
use crate::buffer::AudioBuffer;
use crate::context::Context;
use crate::effect::{EffectProps, FilterProps};
use crate::error::{AuricleError, Result};
use crate::format::{
    AmbiLayout, AmbiScaling, ChannelLayout, DeviceFormat, DeviceType, SampleType, BUFFER_SIZE,
    DEFAULT_NUM_UPDATES, DEFAULT_OUTPUT_RATE, DEFAULT_SENDS, DEFAULT_UPDATE_SIZE, MAX_AMBI_ORDER,
    MAX_SENDS, MIN_OUTPUT_RATE, SPEED_OF_SOUND,
};
use crate::hrtf::{self, Hrtf, HrtfEntry, HrtfRequest, HrtfStatus};
use crate::limiter::{self, Compressor};
use crate::registry::{self, engine};
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) const VERSION_MAJOR: i32 = 1;
pub(crate) const VERSION_MINOR: i32 = 1;

pub(crate) const DITHER_RNG_SEED: u32 = 22222;

/// Slab of app-owned objects addressed by non-zero integer ids.
#[derive(Debug)]
pub(crate) struct IdPool<T> {
    items: HashMap<u32, T>,
    next_id: u32,
}

impl<T> IdPool<T> {
    pub fn new() -> IdPool<T> {
        IdPool {
            items: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn insert(&mut self, item: T) -> u32 {
        self.insert_with(|_| item)
    }

    pub fn insert_with(&mut self, build: impl FnOnce(u32) -> T) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.items.insert(id, build(id));
        id
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.items.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.items.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.items.values()
    }
}

/// A window of channels in the device mix buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BufView {
    pub offset: usize,
    pub count: usize,
}

/// Post-processing applied between the dry bus and the real output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PostProcess {
    Direct,
    Hrtf,
    Uhj,
    Bs2b,
}

/// The mixer-facing buffer layout: one storage block with three channel
/// views over it. When the renderer produces no separate first-order or
/// real bus, those views alias the dry view.
#[derive(Debug)]
pub(crate) struct MixGraph {
    pub buffer: Vec<Vec<f32>>,
    pub dry: BufView,
    pub foa: BufView,
    pub real: BufView,
}

impl MixGraph {
    pub fn empty() -> MixGraph {
        MixGraph {
            buffer: Vec::new(),
            dry: BufView::default(),
            foa: BufView::default(),
            real: BufView::default(),
        }
    }

    pub fn real_channel_count(&self) -> usize {
        self.real.count
    }
}

/// Device state guarded by the state lock (the "backend lock"): the
/// backend instance, negotiated format, and everything the mix graph is
/// built from.
pub(crate) struct DeviceState {
    pub backend: Option<Box<dyn Backend>>,
    pub name: String,
    pub fmt: DeviceFormat,
    pub sources_max: u32,
    pub num_mono_sources: u32,
    pub num_stereo_sources: u32,
    pub slots_max: u32,
    pub num_aux_sends: usize,
    pub hrtf_status: HrtfStatus,
    pub hrtf: Option<Arc<Hrtf>>,
    pub hrtf_list: Vec<HrtfEntry>,
    pub limiter: Option<Compressor>,
    /// The application's last OUTPUT_LIMITER request (TRUE/FALSE/DONT_CARE).
    pub limiter_request: i32,
    pub dither_depth: f32,
    pub dither_seed: u32,
    pub fixed_latency_ns: u64,
    pub avg_speaker_dist: f32,
    pub post_process: PostProcess,
    pub mix: MixGraph,
}

impl DeviceState {
    fn new() -> DeviceState {
        DeviceState {
            backend: None,
            name: String::new(),
            fmt: DeviceFormat::default(),
            sources_max: 256,
            num_mono_sources: 255,
            num_stereo_sources: 1,
            slots_max: 64,
            num_aux_sends: DEFAULT_SENDS,
            hrtf_status: HrtfStatus::Disabled,
            hrtf: None,
            hrtf_list: Vec::new(),
            limiter: None,
            limiter_request: attrs::DONT_CARE,
            dither_depth: 0.0,
            dither_seed: DITHER_RNG_SEED,
            fixed_latency_ns: 0,
            avg_speaker_dist: 0.0,
            post_process: PostProcess::Direct,
            mix: MixGraph::empty(),
        }
    }
}

pub(crate) struct DeviceInner {
    pub dev_type: DeviceType,
    pub connected: AtomicBool,
    pub running: AtomicBool,
    pub paused: AtomicBool,
    pub last_error: AtomicU32,
    /// Mix-generation counter: odd while a tick is in flight, even
    /// between ticks. Seqlock guard for the clock pair below.
    pub mix_count: AtomicU32,
    pub samples_done: AtomicU32,
    pub clock_base_ns: AtomicU64,
    pub state: Mutex<DeviceState>,
    pub contexts: Mutex<Vec<Context>>,
    pub buffers: Mutex<IdPool<Arc<AudioBuffer>>>,
    pub filters: Mutex<IdPool<FilterProps>>,
    pub effects: Mutex<IdPool<EffectProps>>,
}

impl DeviceInner {
    fn new(dev_type: DeviceType) -> Arc<DeviceInner> {
        Arc::new(DeviceInner {
            dev_type,
            connected: AtomicBool::new(true),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            last_error: AtomicU32::new(0),
            mix_count: AtomicU32::new(0),
            samples_done: AtomicU32::new(0),
            clock_base_ns: AtomicU64::new(0),
            state: Mutex::new(DeviceState::new()),
            contexts: Mutex::new(Vec::new()),
            buffers: Mutex::new(IdPool::new()),
            filters: Mutex::new(IdPool::new()),
            effects: Mutex::new(IdPool::new()),
        })
    }

    /// Mark the device disconnected and fan the event out to every
    /// context. Safe to call from backend error callbacks.
    pub fn disconnect(&self, reason: &str) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        warn!("Device disconnected: {}", reason);
        self.running.store(false, Ordering::Release);
        for ctx in self.contexts.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            ctx.post_disconnect(reason);
        }
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner()).len();
        if buffers > 0 {
            warn!("{} buffer(s) not deleted", buffers);
        }
        let filters = self.filters.lock().unwrap_or_else(|e| e.into_inner()).len();
        if filters > 0 {
            warn!("{} filter(s) not deleted", filters);
        }
        let effects = self.effects.lock().unwrap_or_else(|e| e.into_inner()).len();
        if effects > 0 {
            warn!("{} effect(s) not deleted", effects);
        }
    }
}

/// Handle to an open device. Cheap to clone; every operation re-verifies
/// the handle against the live-device registry.
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
}

impl PartialEq for Device {
    fn eq(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("type", &self.inner.dev_type)
            .finish()
    }
}

/// Open a playback device by name, or the preferred backend's default.
pub fn open_device(name: Option<&str>) -> Result<Device> {
    let engine = engine();
    let Some(playback) = engine.playback else {
        return Err(registry::latch_null(AuricleError::InvalidValue(
            "no playback backend available".into(),
        )));
    };

    // Empty and well-known alias names select the default device.
    let name = name.filter(|n| !n.is_empty() && !n.eq_ignore_ascii_case("default"));

    let inner = DeviceInner::new(DeviceType::Playback);
    {
        let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.limiter_request = attrs::TRUE;
        apply_open_config(&mut state, name, engine);

        let mut backend = playback
            .factory
            .create(Arc::downgrade(&inner), BackendKind::Playback)
            .ok_or(AuricleError::OutOfMemory)
            .map_err(registry::latch_null)?;
        state.name = backend.open(name).map_err(registry::latch_null)?;
        state.backend = Some(backend);

        apply_ambi_format_config(&mut state, engine);
    }

    let device = Device { inner };
    registry::register_device(&device);
    info!("Created playback device \"{}\"", device.name_unchecked());
    Ok(device)
}

/// Open a capture device with a fixed format and a ring of `samples`
/// frames.
pub fn open_capture_device(
    name: Option<&str>,
    frequency: u32,
    channels: ChannelLayout,
    sample_type: SampleType,
    samples: usize,
) -> Result<Device> {
    let engine = engine();
    let Some(capture) = engine.capture else {
        return Err(registry::latch_null(AuricleError::InvalidValue(
            "no capture backend available".into(),
        )));
    };
    if samples == 0 || frequency < MIN_OUTPUT_RATE {
        return Err(registry::latch_null(AuricleError::InvalidValue(
            "capture frequency or buffer size out of range".into(),
        )));
    }

    let name = name.filter(|n| !n.is_empty() && !n.eq_ignore_ascii_case("default"));

    let inner = DeviceInner::new(DeviceType::Capture);
    {
        let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.fmt.frequency = frequency;
        state.fmt.channels = channels;
        state.fmt.sample_type = sample_type;
        state.fmt.requests = crate::format::RequestFlags {
            channels: true,
            sample_type: true,
            frequency: true,
        };
        state.fmt.update_size = samples as u32;
        state.fmt.num_updates = 1;

        let mut backend = capture
            .factory
            .create(Arc::downgrade(&inner), BackendKind::Capture)
            .ok_or(AuricleError::OutOfMemory)
            .map_err(registry::latch_null)?;
        state.name = backend.open(name).map_err(registry::latch_null)?;
        if !backend.reset(&mut state.fmt) {
            return Err(registry::latch_null(AuricleError::Backend(
                "capture format negotiation failed".into(),
            )));
        }
        state.backend = Some(backend);
    }

    let device = Device { inner };
    registry::register_device(&device);
    info!("Created capture device \"{}\"", device.name_unchecked());
    Ok(device)
}

/// Open a loopback device for manual rendering.
pub fn open_loopback_device() -> Result<Device> {
    let engine = engine();

    let inner = DeviceInner::new(DeviceType::Loopback);
    {
        let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.fmt.update_size = 0;
        state.fmt.num_updates = 0;
        apply_source_and_send_config(&mut state, None, engine);

        let mut backend = crate::backend::loopback_factory()
            .create(Arc::downgrade(&inner), BackendKind::Playback)
            .ok_or(AuricleError::OutOfMemory)
            .map_err(registry::latch_null)?;
        state.name = backend.open(None).map_err(registry::latch_null)?;
        state.backend = Some(backend);
    }

    let device = Device { inner };
    registry::register_device(&device);
    debug!("Created loopback device");
    Ok(device)
}

/// The `channels`/`sample-type`/`frequency`/`periods`/`period_size`/
/// `sources`/`slots`/`sends` config keys applied at open.
fn apply_open_config(
    state: &mut DeviceState,
    name: Option<&str>,
    engine: &'static registry::EngineGlobals,
) {
    let cfg = &engine.config;

    if let Some(fmt) = cfg.value_str(name, "channels") {
        match ChannelLayout::from_config_name(&fmt) {
            Some((layout, order)) => {
                state.fmt.channels = layout;
                state.fmt.ambi_order = order;
                state.fmt.requests.channels = true;
            }
            None => error!("Unsupported channels: {}", fmt),
        }
    }
    if let Some(fmt) = cfg.value_str(name, "sample-type") {
        match SampleType::from_config_name(&fmt) {
            Some(ty) => {
                state.fmt.sample_type = ty;
                state.fmt.requests.sample_type = true;
            }
            None => error!("Unsupported sample-type: {}", fmt),
        }
    }
    if let Some(freq) = cfg.value_u32(name, "frequency") {
        if freq > 0 {
            let freq = freq.max(MIN_OUTPUT_RATE);
            state.fmt.num_updates = (state.fmt.num_updates * freq + state.fmt.frequency / 2)
                / state.fmt.frequency;
            state.fmt.frequency = freq;
            state.fmt.requests.frequency = true;
        }
    }

    if let Some(periods) = cfg.value_u32(name, "periods") {
        state.fmt.num_updates = periods;
    }
    state.fmt.num_updates = state.fmt.num_updates.clamp(2, 16);

    if let Some(size) = cfg.value_u32(name, "period_size") {
        state.fmt.update_size = size;
    }
    state.fmt.update_size = state.fmt.update_size.clamp(64, 8192);
    if engine.cpu_caps.simd {
        state.fmt.update_size = (state.fmt.update_size + 3) & !3;
    }

    apply_source_and_send_config(state, name, engine);
}

fn apply_source_and_send_config(
    state: &mut DeviceState,
    name: Option<&str>,
    engine: &'static registry::EngineGlobals,
) {
    let cfg = &engine.config;

    if let Some(sources) = cfg.value_u32(name, "sources") {
        state.sources_max = if sources == 0 { 256 } else { sources };
    }
    if let Some(slots) = cfg.value_u32(name, "slots") {
        state.slots_max = if slots == 0 { 64 } else { slots };
    }
    if let Some(sends) = cfg.value_i32(name, "sends") {
        state.num_aux_sends = (DEFAULT_SENDS).min(sends.clamp(0, MAX_SENDS as i32) as usize);
    }

    state.num_stereo_sources = 1;
    state.num_mono_sources = state.sources_max - state.num_stereo_sources;
}

fn apply_ambi_format_config(state: &mut DeviceState, engine: &'static registry::EngineGlobals) {
    let Some(fmt) = engine.config.value_str(Some(&state.name), "ambi-format") else {
        return;
    };
    match fmt.as_str() {
        "fuma" => {
            if state.fmt.ambi_order > 3 {
                error!(
                    "FuMa is incompatible with order {} ambisonics (third-order max)",
                    state.fmt.ambi_order
                );
            } else {
                state.fmt.ambi_layout = AmbiLayout::FuMa;
                state.fmt.ambi_scaling = AmbiScaling::FuMa;
            }
        }
        "acn+sn3d" => {
            state.fmt.ambi_layout = AmbiLayout::Acn;
            state.fmt.ambi_scaling = AmbiScaling::SN3D;
        }
        "acn+n3d" => {
            state.fmt.ambi_layout = AmbiLayout::Acn;
            state.fmt.ambi_scaling = AmbiScaling::N3D;
        }
        other => error!("Unsupported ambi-format: {}", other),
    }
}

impl Device {
    fn verify(&self) -> Result<()> {
        if registry::verify_device(self) {
            Ok(())
        } else {
            Err(registry::latch_null(AuricleError::InvalidDevice))
        }
    }

    pub(crate) fn latch(&self, err: AuricleError) -> AuricleError {
        registry::set_error(Some(&self.inner), err.code());
        err
    }

    fn name_unchecked(&self) -> String {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .name
            .clone()
    }

    pub fn device_type(&self) -> DeviceType {
        self.inner.dev_type
    }

    pub fn name(&self) -> Result<String> {
        self.verify()?;
        Ok(self.name_unchecked())
    }

    /// Read and clear the device's latched error code.
    pub fn get_error(&self) -> crate::error::ErrorCode {
        if registry::verify_device(self) {
            crate::error::ErrorCode::from_raw(self.inner.last_error.swap(0, Ordering::AcqRel))
        } else {
            registry::null_device_error()
        }
    }

    /// Create a context on this device, negotiating the attribute list.
    pub fn create_context(&self, attr_list: Option<&[i32]>) -> Result<Context> {
        // The registry lock is held while taking the state lock so an
        // asynchronous close cannot strand the new context.
        let list = registry::list_guard();
        if !registry::verify_device_in(&list, self) {
            return Err(registry::latch_null(AuricleError::InvalidDevice));
        }
        if self.inner.dev_type == DeviceType::Capture
            || !self.inner.connected.load(Ordering::Acquire)
        {
            drop(list);
            return Err(self.latch(AuricleError::InvalidDevice));
        }
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        drop(list);

        self.inner.last_error.store(0, Ordering::Release);

        if let Err(err) = update_device_params(&self.inner, &mut state, attr_list) {
            let code = err.code();
            if code == crate::error::ErrorCode::InvalidDevice {
                drop(state);
                self.inner.disconnect("Device update failure");
            }
            return Err(self.latch(err));
        }

        let ctx = Context::create(self.clone(), &state);
        self.inner
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ctx.clone());
        drop(state);

        ctx.finish_init();
        debug!("Created context on \"{}\"", self.name_unchecked());
        Ok(ctx)
    }

    /// Reset the device to a new attribute configuration, re-plumbing the
    /// mix graph and every context.
    pub fn reset(&self, attr_list: Option<&[i32]>) -> Result<()> {
        let list = registry::list_guard();
        if !registry::verify_device_in(&list, self) {
            return Err(registry::latch_null(AuricleError::InvalidDevice));
        }
        if self.inner.dev_type == DeviceType::Capture {
            drop(list);
            return Err(self.latch(AuricleError::InvalidDevice));
        }
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        drop(list);

        // Force the mixer to stop since we're resetting; also clear the
        // connected state so lost devices can attempt recovery.
        if self.inner.running.swap(false, Ordering::AcqRel) {
            if let Some(backend) = state.backend.as_mut() {
                backend.stop();
            }
        }
        self.inner.connected.store(true, Ordering::Release);

        match update_device_params(&self.inner, &mut state, attr_list) {
            Ok(()) => Ok(()),
            Err(err) => {
                let code = err.code();
                drop(state);
                if code == crate::error::ErrorCode::InvalidDevice {
                    self.inner.disconnect("Device start failure");
                }
                Err(self.latch(err))
            }
        }
    }

    /// Close the device: splice it out of the registry, release every
    /// context, and stop the backend.
    pub fn close(self) -> Result<()> {
        let mut list = registry::list_guard();
        if !registry::verify_device_in(&list, &self) {
            return Err(registry::latch_null(AuricleError::InvalidDevice));
        }
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        registry::unregister_in(&mut list, &self);
        drop(list);

        let contexts: Vec<Context> = self
            .inner
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for ctx in contexts {
            warn!("Releasing context on device close");
            ctx.release(&mut state);
        }

        if self.inner.running.swap(false, Ordering::AcqRel) {
            if let Some(backend) = state.backend.as_mut() {
                backend.stop();
            }
        }
        drop(state);
        Ok(())
    }

    /// Stop mixing without tearing down the device. Sticky until `resume`.
    pub fn pause(&self) -> Result<()> {
        self.verify()?;
        if self.inner.dev_type != DeviceType::Playback {
            return Err(self.latch(AuricleError::InvalidDevice));
        }
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if self.inner.running.swap(false, Ordering::AcqRel) {
            if let Some(backend) = state.backend.as_mut() {
                backend.stop();
            }
        }
        self.inner.paused.store(true, Ordering::Release);
        Ok(())
    }

    /// Restart mixing after a pause, when at least one context exists.
    pub fn resume(&self) -> Result<()> {
        self.verify()?;
        if self.inner.dev_type != DeviceType::Playback {
            return Err(self.latch(AuricleError::InvalidDevice));
        }
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if !self.inner.paused.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if self
            .inner
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
        {
            return Ok(());
        }
        let started = state.backend.as_mut().map(|b| b.start()).unwrap_or(false);
        drop(state);
        if !started {
            self.inner.disconnect("Device start failure");
            return Err(self.latch(AuricleError::InvalidDevice));
        }
        self.inner.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Register a PCM buffer with the device, returning its id.
    pub fn new_buffer(&self, data: Arc<AudioBuffer>) -> Result<u32> {
        self.verify()?;
        Ok(self
            .inner
            .buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(data))
    }

    pub fn delete_buffer(&self, id: u32) -> Result<()> {
        self.verify()?;
        self.inner
            .buffers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| self.latch(AuricleError::InvalidValue(format!("no buffer {}", id))))
    }

    pub fn new_filter(&self) -> Result<u32> {
        self.verify()?;
        Ok(self
            .inner
            .filters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(FilterProps::default()))
    }

    pub fn set_filter(&self, id: u32, props: FilterProps) -> Result<()> {
        self.verify()?;
        let mut filters = self.inner.filters.lock().unwrap_or_else(|e| e.into_inner());
        match filters.get_mut(id) {
            Some(slot) => {
                *slot = props;
                Ok(())
            }
            None => Err(self.latch(AuricleError::InvalidValue(format!("no filter {}", id)))),
        }
    }

    pub fn delete_filter(&self, id: u32) -> Result<()> {
        self.verify()?;
        self.inner
            .filters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| self.latch(AuricleError::InvalidValue(format!("no filter {}", id))))
    }

    pub fn new_effect(&self) -> Result<u32> {
        self.verify()?;
        Ok(self
            .inner
            .effects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(EffectProps::default()))
    }

    pub fn set_effect(&self, id: u32, props: EffectProps) -> Result<()> {
        self.verify()?;
        let mut effects = self.inner.effects.lock().unwrap_or_else(|e| e.into_inner());
        match effects.get_mut(id) {
            Some(slot) => {
                *slot = props;
                Ok(())
            }
            None => Err(self.latch(AuricleError::InvalidValue(format!("no effect {}", id)))),
        }
    }

    pub fn effect_props(&self, id: u32) -> Result<EffectProps> {
        self.verify()?;
        let effects = self.inner.effects.lock().unwrap_or_else(|e| e.into_inner());
        effects
            .get(id)
            .cloned()
            .ok_or_else(|| self.latch(AuricleError::InvalidValue(format!("no effect {}", id))))
    }

    pub fn delete_effect(&self, id: u32) -> Result<()> {
        self.verify()?;
        self.inner
            .effects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| self.latch(AuricleError::InvalidValue(format!("no effect {}", id))))
    }

    /// Scalar device query.
    pub fn query(&self, param: i32) -> Result<i32> {
        self.verify()?;
        let inner = &self.inner;

        if inner.dev_type == DeviceType::Capture {
            return match param {
                attrs::ATTR_MAJOR_VERSION => Ok(VERSION_MAJOR),
                attrs::ATTR_MINOR_VERSION => Ok(VERSION_MINOR),
                attrs::ATTR_ATTRIBUTES_SIZE => Ok(9),
                attrs::ATTR_CAPTURE_SAMPLES => {
                    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                    Ok(state
                        .backend
                        .as_mut()
                        .map(|b| b.available_samples() as i32)
                        .unwrap_or(0))
                }
                attrs::ATTR_CONNECTED => Ok(inner.connected.load(Ordering::Acquire) as i32),
                other => Err(self.latch(AuricleError::InvalidEnum(other))),
            };
        }

        let state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let loopback = inner.dev_type == DeviceType::Loopback;
        match param {
            attrs::ATTR_MAJOR_VERSION => Ok(VERSION_MAJOR),
            attrs::ATTR_MINOR_VERSION => Ok(VERSION_MINOR),
            attrs::ATTR_ATTRIBUTES_SIZE => Ok(attr_vector_len(&state, loopback) as i32),
            attrs::ATTR_ALL_ATTRIBUTES => Err(self.latch(AuricleError::InvalidValue(
                "the attribute vector is returned by all_attributes".into(),
            ))),
            attrs::ATTR_FREQUENCY => Ok(state.fmt.frequency as i32),
            attrs::ATTR_REFRESH => {
                if loopback {
                    return Err(self.latch(AuricleError::InvalidDevice));
                }
                Ok((state.fmt.frequency / state.fmt.update_size.max(1)) as i32)
            }
            attrs::ATTR_SYNC => {
                if loopback {
                    return Err(self.latch(AuricleError::InvalidDevice));
                }
                Ok(attrs::FALSE)
            }
            attrs::ATTR_FORMAT_CHANNELS => {
                if !loopback {
                    return Err(self.latch(AuricleError::InvalidDevice));
                }
                Ok(state.fmt.channels.token())
            }
            attrs::ATTR_FORMAT_TYPE => {
                if !loopback {
                    return Err(self.latch(AuricleError::InvalidDevice));
                }
                Ok(state.fmt.sample_type.token())
            }
            attrs::ATTR_AMBISONIC_LAYOUT => {
                if !loopback || state.fmt.channels != ChannelLayout::Ambi3D {
                    return Err(self.latch(AuricleError::InvalidDevice));
                }
                Ok(state.fmt.ambi_layout.token())
            }
            attrs::ATTR_AMBISONIC_SCALING => {
                if !loopback || state.fmt.channels != ChannelLayout::Ambi3D {
                    return Err(self.latch(AuricleError::InvalidDevice));
                }
                Ok(state.fmt.ambi_scaling.token())
            }
            attrs::ATTR_AMBISONIC_ORDER => {
                if !loopback || state.fmt.channels != ChannelLayout::Ambi3D {
                    return Err(self.latch(AuricleError::InvalidDevice));
                }
                Ok(state.fmt.ambi_order as i32)
            }
            attrs::ATTR_MONO_SOURCES => Ok(state.num_mono_sources as i32),
            attrs::ATTR_STEREO_SOURCES => Ok(state.num_stereo_sources as i32),
            attrs::ATTR_MAX_AUXILIARY_SENDS => Ok(state.num_aux_sends as i32),
            attrs::ATTR_CONNECTED => Ok(inner.connected.load(Ordering::Acquire) as i32),
            attrs::ATTR_HRTF => Ok(state.hrtf.is_some() as i32),
            attrs::ATTR_HRTF_STATUS => Ok(state.hrtf_status.token()),
            attrs::ATTR_NUM_HRTF_SPECIFIERS => {
                drop(state);
                let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                let name = state.name.clone();
                state.hrtf_list = hrtf::enumerate(Some(&name), &engine().config);
                Ok(state.hrtf_list.len() as i32)
            }
            attrs::ATTR_OUTPUT_LIMITER => Ok(state.limiter.is_some() as i32),
            attrs::ATTR_MAX_AMBISONIC_ORDER => Ok(MAX_AMBI_ORDER as i32),
            other => Err(self.latch(AuricleError::InvalidEnum(other))),
        }
    }

    /// The full attribute vector: `(token, value)` pairs, zero-terminated.
    pub fn all_attributes(&self) -> Result<Vec<i32>> {
        self.verify()?;
        let inner = &self.inner;

        if inner.dev_type == DeviceType::Capture {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            let available = state
                .backend
                .as_mut()
                .map(|b| b.available_samples() as i32)
                .unwrap_or(0);
            return Ok(vec![
                attrs::ATTR_MAJOR_VERSION,
                VERSION_MAJOR,
                attrs::ATTR_MINOR_VERSION,
                VERSION_MINOR,
                attrs::ATTR_CAPTURE_SAMPLES,
                available,
                attrs::ATTR_CONNECTED,
                inner.connected.load(Ordering::Acquire) as i32,
                0,
            ]);
        }

        let state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(build_attr_vector(
            &state,
            inner.dev_type == DeviceType::Loopback,
            None,
        ))
    }

    /// The attribute vector of the 64-bit query: everything from
    /// `all_attributes` plus device clock and latency.
    pub fn all_attributes_64(&self) -> Result<Vec<i64>> {
        self.verify()?;
        let inner = &self.inner;
        if inner.dev_type == DeviceType::Capture {
            return Ok(self.all_attributes()?.iter().map(|&v| v as i64).collect());
        }
        let state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let clock = read_clock_ns(inner, &state);
        let latency = total_latency_ns(&state);
        let vector = build_attr_vector(
            &state,
            inner.dev_type == DeviceType::Loopback,
            Some((clock, latency)),
        );
        Ok(vector.iter().map(|&v| v as i64).collect())
    }

    /// The device clock in nanoseconds, read with seqlock semantics so it
    /// is consistent against a concurrent mix tick.
    pub fn clock_ns(&self) -> Result<i64> {
        self.verify()?;
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(read_clock_ns(&self.inner, &state) as i64)
    }

    /// Device clock plus the fixed output latency, both in nanoseconds.
    pub fn clock_latency_ns(&self) -> Result<(i64, i64)> {
        self.verify()?;
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok((
            read_clock_ns(&self.inner, &state) as i64,
            total_latency_ns(&state) as i64,
        ))
    }

    /// Whether a loopback device could render the given format.
    pub fn is_render_format_supported(&self, frequency: u32, channels: i32, sample_type: i32) -> bool {
        if self.verify().is_err() {
            return false;
        }
        if self.inner.dev_type != DeviceType::Loopback {
            registry::set_error(Some(&self.inner), crate::error::ErrorCode::InvalidDevice);
            return false;
        }
        if frequency < MIN_OUTPUT_RATE {
            registry::set_error(Some(&self.inner), crate::error::ErrorCode::InvalidValue);
            return false;
        }
        ChannelLayout::from_token(channels).is_some() && SampleType::from_token(sample_type).is_some()
    }

    /// Render `frames` frames into `out` as interleaved f32, using the
    /// format negotiated at context creation. Loopback devices only.
    pub fn render_samples(&self, out: &mut [f32], frames: usize) -> Result<()> {
        self.verify()?;
        if self.inner.dev_type != DeviceType::Loopback {
            return Err(self.latch(AuricleError::InvalidDevice));
        }
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fmt.sample_type != SampleType::F32 {
            return Err(self.latch(AuricleError::InvalidValue(
                "loopback device is not in float format".into(),
            )));
        }
        if out.len() < frames * state.mix.real_channel_count() {
            return Err(self.latch(AuricleError::InvalidValue(
                "output slice too small for frame count".into(),
            )));
        }
        crate::mixer::mix_data(
            &self.inner,
            &mut state,
            crate::mixer::MixOut::F32(out),
            frames,
        );
        Ok(())
    }

    /// `render_samples` for devices negotiated to 16-bit output.
    pub fn render_samples_i16(&self, out: &mut [i16], frames: usize) -> Result<()> {
        self.verify()?;
        if self.inner.dev_type != DeviceType::Loopback {
            return Err(self.latch(AuricleError::InvalidDevice));
        }
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.fmt.sample_type != SampleType::I16 {
            return Err(self.latch(AuricleError::InvalidValue(
                "loopback device is not in 16-bit format".into(),
            )));
        }
        if out.len() < frames * state.mix.real_channel_count() {
            return Err(self.latch(AuricleError::InvalidValue(
                "output slice too small for frame count".into(),
            )));
        }
        crate::mixer::mix_data(
            &self.inner,
            &mut state,
            crate::mixer::MixOut::I16(out),
            frames,
        );
        Ok(())
    }

    pub fn capture_start(&self) -> Result<()> {
        self.verify()?;
        if self.inner.dev_type != DeviceType::Capture {
            return Err(self.latch(AuricleError::InvalidDevice));
        }
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if !self.inner.connected.load(Ordering::Acquire) {
            return Err(self.latch(AuricleError::InvalidDevice));
        }
        if self.inner.running.load(Ordering::Acquire) {
            return Ok(());
        }
        let started = state.backend.as_mut().map(|b| b.start()).unwrap_or(false);
        drop(state);
        if started {
            self.inner.running.store(true, Ordering::Release);
            Ok(())
        } else {
            self.inner.disconnect("Device start failure");
            Err(self.latch(AuricleError::InvalidDevice))
        }
    }

    pub fn capture_stop(&self) -> Result<()> {
        self.verify()?;
        if self.inner.dev_type != DeviceType::Capture {
            return Err(self.latch(AuricleError::InvalidDevice));
        }
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if self.inner.running.swap(false, Ordering::AcqRel) {
            if let Some(backend) = state.backend.as_mut() {
                backend.stop();
            }
        }
        Ok(())
    }

    /// Pop `out.len() / channels` captured frames. Fails with
    /// `InvalidValue` when fewer are available.
    pub fn capture_samples(&self, out: &mut [f32]) -> Result<()> {
        self.verify()?;
        if self.inner.dev_type != DeviceType::Capture {
            return Err(self.latch(AuricleError::InvalidDevice));
        }
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let result = state
            .backend
            .as_mut()
            .map(|b| b.capture_samples(out))
            .unwrap_or_else(|| Err(AuricleError::InvalidValue("no capture backend".into())));
        drop(state);
        result.map_err(|e| self.latch(e))
    }

    /// Names of the HRTF data sets available to this device.
    pub fn hrtf_specifiers(&self) -> Result<Vec<String>> {
        self.verify()?;
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let name = state.name.clone();
        state.hrtf_list = hrtf::enumerate(Some(&name), &engine().config);
        Ok(state.hrtf_list.iter().map(|e| e.name.clone()).collect())
    }

    /// Name of the active HRTF data set, or empty when disabled.
    pub fn hrtf_specifier(&self) -> Result<String> {
        self.verify()?;
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .hrtf
            .as_ref()
            .map(|h| h.name.clone())
            .unwrap_or_default())
    }
}

fn attr_vector_len(state: &DeviceState, loopback: bool) -> usize {
    // (token, value) pairs plus the terminator.
    let pairs = if loopback && state.fmt.channels == ChannelLayout::Ambi3D {
        15
    } else {
        12
    };
    pairs * 2 + 1
}

fn build_attr_vector(
    state: &DeviceState,
    loopback: bool,
    clock: Option<(u64, u64)>,
) -> Vec<i32> {
    let mut values = Vec::with_capacity(attr_vector_len(state, loopback) + 4);
    let mut push = |token: i32, value: i32| {
        values.push(token);
        values.push(value);
    };

    push(attrs::ATTR_MAJOR_VERSION, VERSION_MAJOR);
    push(attrs::ATTR_MINOR_VERSION, VERSION_MINOR);
    push(attrs::ATTR_FREQUENCY, state.fmt.frequency as i32);
    if !loopback {
        push(
            attrs::ATTR_REFRESH,
            (state.fmt.frequency / state.fmt.update_size.max(1)) as i32,
        );
        push(attrs::ATTR_SYNC, attrs::FALSE);
    } else {
        if state.fmt.channels == ChannelLayout::Ambi3D {
            push(attrs::ATTR_AMBISONIC_LAYOUT, state.fmt.ambi_layout.token());
            push(attrs::ATTR_AMBISONIC_SCALING, state.fmt.ambi_scaling.token());
            push(attrs::ATTR_AMBISONIC_ORDER, state.fmt.ambi_order as i32);
        }
        push(attrs::ATTR_FORMAT_CHANNELS, state.fmt.channels.token());
        push(attrs::ATTR_FORMAT_TYPE, state.fmt.sample_type.token());
    }
    push(attrs::ATTR_MONO_SOURCES, state.num_mono_sources as i32);
    push(attrs::ATTR_STEREO_SOURCES, state.num_stereo_sources as i32);
    push(attrs::ATTR_MAX_AUXILIARY_SENDS, state.num_aux_sends as i32);
    push(attrs::ATTR_HRTF, state.hrtf.is_some() as i32);
    push(attrs::ATTR_HRTF_STATUS, state.hrtf_status.token());
    push(attrs::ATTR_OUTPUT_LIMITER, state.limiter.is_some() as i32);
    if let Some((clock_ns, latency_ns)) = clock {
        push(attrs::ATTR_DEVICE_CLOCK, clock_ns as i32);
        push(attrs::ATTR_DEVICE_LATENCY, latency_ns as i32);
    } else {
        push(attrs::ATTR_MAX_AMBISONIC_ORDER, MAX_AMBI_ORDER as i32);
    }
    values.push(0);
    values
}

/// Seqlock read of `(clock_base, samples_done)` against the mixer.
fn read_clock_ns(inner: &DeviceInner, state: &DeviceState) -> u64 {
    loop {
        let before = inner.mix_count.load(Ordering::Acquire);
        if before & 1 != 0 {
            std::thread::yield_now();
            continue;
        }
        let base = inner.clock_base_ns.load(Ordering::Relaxed);
        let done = inner.samples_done.load(Ordering::Relaxed);
        let after = inner.mix_count.load(Ordering::Acquire);
        if before == after {
            let freq = state.fmt.frequency.max(1) as u64;
            return base + done as u64 * 1_000_000_000 / freq;
        }
    }
}

fn total_latency_ns(state: &DeviceState) -> u64 {
    let freq = state.fmt.frequency.max(1) as u64;
    let buffered = state.fmt.update_size as u64 * state.fmt.num_updates as u64;
    state.fixed_latency_ns + buffered * 1_000_000_000 / freq
}

/// Advance the clock base over the samples done so far and reset the
/// counter; bumps the mix count twice to stay even. Must not run while
/// the device is mixing.
pub(crate) fn update_clock_base(inner: &DeviceInner, frequency: u32) {
    inner.mix_count.fetch_add(1, Ordering::Release);
    let done = inner.samples_done.swap(0, Ordering::Relaxed) as u64;
    inner
        .clock_base_ns
        .fetch_add(done * 1_000_000_000 / frequency.max(1) as u64, Ordering::Relaxed);
    inner.mix_count.fetch_add(1, Ordering::Release);
}

struct ParsedAttrs {
    schans: Option<ChannelLayout>,
    stype: Option<SampleType>,
    freq: u32,
    alayout: Option<AmbiLayout>,
    ascale: Option<AmbiScaling>,
    aorder: u32,
    num_mono: i64,
    num_stereo: i64,
    hrtf_appreq: HrtfRequest,
    hrtf_id: i32,
    gain_limiter: i32,
}

/// Attribute negotiation: the critical-path reconfiguration algorithm.
/// Re-plumbs the device format, mix graph, and voice pools, then re-wires
/// every context so mixing resumes seamlessly.
pub(crate) fn update_device_params(
    inner: &Arc<DeviceInner>,
    state: &mut DeviceState,
    attr_list: Option<&[i32]>,
) -> Result<()> {
    let engine = engine();
    let cfg = &engine.config;
    let loopback = inner.dev_type == DeviceType::Loopback;
    let devname = if loopback { None } else { Some(state.name.clone()) };
    let devname = devname.as_deref();

    let old_sends = state.num_aux_sends;
    let mut new_sends = old_sends as i64;
    let mut hrtf_appreq = HrtfRequest::Default;
    let mut hrtf_id: i32 = -1;
    let mut gain_limiter = state.limiter_request;

    if loopback && !has_attributes(attr_list) {
        warn!("Missing attributes for loopback device");
        return Err(AuricleError::InvalidValue(
            "loopback devices require a render format".into(),
        ));
    }

    if has_attributes(attr_list) {
        let parsed = parse_attr_list(attr_list.unwrap(), state, &mut new_sends)?;

        if !loopback && inner.running.swap(false, Ordering::AcqRel) {
            if let Some(backend) = state.backend.as_mut() {
                backend.stop();
            }
        }

        if loopback {
            validate_loopback_attrs(&parsed)?;
        }

        if inner.running.swap(false, Ordering::AcqRel) {
            if let Some(backend) = state.backend.as_mut() {
                backend.stop();
            }
        }
        update_clock_base(inner, state.fmt.frequency);

        if !loopback {
            state.fmt.num_updates = DEFAULT_NUM_UPDATES;
            state.fmt.update_size = DEFAULT_UPDATE_SIZE;
            state.fmt.frequency = DEFAULT_OUTPUT_RATE;

            // Priority: attribute list < device config < global config.
            let mut freq = parsed.freq;
            if let Some(f) = cfg.value_u32(devname, "frequency") {
                freq = f;
            }
            if freq < 1 {
                state.fmt.requests.frequency = false;
            } else {
                let freq = freq.max(MIN_OUTPUT_RATE);
                state.fmt.num_updates = (state.fmt.num_updates * freq
                    + state.fmt.num_updates / 2)
                    / state.fmt.frequency;
                state.fmt.frequency = freq;
                state.fmt.requests.frequency = true;
            }

            if let Some(periods) = cfg.value_u32(devname, "periods") {
                state.fmt.num_updates = periods;
            }
            state.fmt.num_updates = state.fmt.num_updates.clamp(2, 16);

            if let Some(size) = cfg.value_u32(devname, "period_size") {
                state.fmt.update_size = size;
            }
            state.fmt.update_size = state.fmt.update_size.clamp(64, 8192);
            // SSE and NEON do best with the update size a multiple of 4.
            if engine.cpu_caps.simd {
                state.fmt.update_size = (state.fmt.update_size + 3) & !3;
            }
        } else {
            state.fmt.frequency = parsed.freq;
            state.fmt.channels = parsed.schans.unwrap();
            state.fmt.sample_type = parsed.stype.unwrap();
            if state.fmt.channels == ChannelLayout::Ambi3D {
                state.fmt.ambi_order = parsed.aorder;
                state.fmt.ambi_layout = parsed.alayout.unwrap();
                state.fmt.ambi_scaling = parsed.ascale.unwrap();
            }
        }

        // Source budgets: max = mono + stereo, stereo <= max, default 256.
        let mut num_mono = parsed.num_mono.min(i64::MAX - parsed.num_stereo);
        let mut num_stereo = parsed.num_stereo;
        num_mono += num_stereo;
        match cfg.value_i64(devname, "sources") {
            Some(cfg_sources) => {
                num_mono = if cfg_sources <= 0 { 256 } else { cfg_sources };
            }
            None => num_mono = num_mono.max(256),
        }
        num_stereo = num_stereo.min(num_mono);
        num_mono -= num_stereo;
        state.sources_max = (num_mono + num_stereo) as u32;
        state.num_mono_sources = num_mono as u32;
        state.num_stereo_sources = num_stereo as u32;

        new_sends = match cfg.value_i64(devname, "sends") {
            Some(cfg_sends) => new_sends.min(cfg_sends.clamp(0, MAX_SENDS as i64)),
            None => new_sends,
        };

        hrtf_appreq = parsed.hrtf_appreq;
        hrtf_id = parsed.hrtf_id;
        gain_limiter = parsed.gain_limiter;
    }

    if inner.running.load(Ordering::Acquire) {
        return Ok(());
    }

    // Tear down the old mix graph before renegotiating.
    state.mix = MixGraph::empty();
    state.post_process = PostProcess::Direct;
    update_clock_base(inner, state.fmt.frequency);
    state.fixed_latency_ns = 0;
    state.dither_seed = DITHER_RNG_SEED;

    // HRTF resolution: config beats the application request.
    state.hrtf_status = HrtfStatus::Disabled;
    let mut hrtf_userreq = HrtfRequest::Default;
    if !loopback {
        if let Some(pref) = cfg.value_str(devname, "hrtf") {
            hrtf_userreq = match pref.to_ascii_lowercase().as_str() {
                "true" => HrtfRequest::Enable,
                "false" => HrtfRequest::Disable,
                "auto" => HrtfRequest::Default,
                other => {
                    error!("Unexpected hrtf config value: {}", other);
                    HrtfRequest::Default
                }
            };
        }

        let wanted = hrtf_userreq == HrtfRequest::Enable
            || (hrtf_userreq != HrtfRequest::Disable && hrtf_appreq == HrtfRequest::Enable);
        if wanted {
            if state.hrtf_list.is_empty() {
                state.hrtf_list = hrtf::enumerate(devname, cfg);
            }
            let entry = if hrtf_id >= 0 && (hrtf_id as usize) < state.hrtf_list.len() {
                state.hrtf_list.get(hrtf_id as usize)
            } else {
                state.hrtf_list.first()
            };
            match entry.and_then(hrtf::load) {
                Some(loaded) => {
                    state.fmt.channels = ChannelLayout::Stereo;
                    state.fmt.ambi_order = 0;
                    state.fmt.frequency = loaded.sample_rate;
                    state.fmt.requests.channels = true;
                    state.fmt.requests.frequency = true;
                    state.hrtf = Some(loaded);
                }
                None => {
                    state.hrtf = None;
                    state.hrtf_status = HrtfStatus::UnsupportedFormat;
                }
            }
        } else {
            state.hrtf = None;
        }
    }

    let old_freq = state.fmt.frequency;
    let old_chans = state.fmt.channels;
    let old_type = state.fmt.sample_type;

    trace!(
        "Pre-reset: {}{}, {}{}, {}{}hz, {} update size x{}",
        if state.fmt.requests.channels { "*" } else { "" },
        state.fmt.channels.label(),
        if state.fmt.requests.sample_type { "*" } else { "" },
        state.fmt.sample_type.label(),
        if state.fmt.requests.frequency { "*" } else { "" },
        state.fmt.frequency,
        state.fmt.update_size,
        state.fmt.num_updates,
    );

    {
        let DeviceState { backend, fmt, .. } = state;
        let ok = backend.as_mut().map(|b| b.reset(fmt)).unwrap_or(false);
        if !ok {
            return Err(AuricleError::Backend("device reset failure".into()));
        }
    }

    // A request the backend rewrote is demoted to a preference.
    if state.fmt.channels != old_chans && state.fmt.requests.channels {
        error!(
            "Failed to set {}, got {} instead",
            old_chans.label(),
            state.fmt.channels.label()
        );
        state.fmt.requests.channels = false;
    }
    if state.fmt.sample_type != old_type && state.fmt.requests.sample_type {
        error!(
            "Failed to set {}, got {} instead",
            old_type.label(),
            state.fmt.sample_type.label()
        );
        state.fmt.requests.sample_type = false;
    }
    if state.fmt.frequency != old_freq && state.fmt.requests.frequency {
        error!(
            "Failed to set {}hz, got {}hz instead",
            old_freq, state.fmt.frequency
        );
        state.fmt.requests.frequency = false;
    }

    trace!(
        "Post-reset: {}, {}, {}hz, {} update size x{}",
        state.fmt.channels.label(),
        state.fmt.sample_type.label(),
        state.fmt.frequency,
        state.fmt.update_size,
        state.fmt.num_updates,
    );

    // HRTF survives only if the backend kept the format it needs.
    if let Some(h) = &state.hrtf {
        if state.fmt.channels == ChannelLayout::Stereo && state.fmt.frequency == h.sample_rate {
            state.hrtf_status = HrtfStatus::Enabled;
        } else {
            state.hrtf = None;
            state.hrtf_status = HrtfStatus::UnsupportedFormat;
        }
    }

    init_renderer(state, engine);
    trace!(
        "Channel config, Dry: {}, FOA: {}, Real: {}",
        state.mix.dry.count,
        state.mix.foa.count,
        state.mix.real.count,
    );

    state.num_aux_sends = new_sends as usize;
    trace!(
        "Max sources: {} ({} + {}), effect slots: {}, sends: {}",
        state.sources_max,
        state.num_mono_sources,
        state.num_stereo_sources,
        state.slots_max,
        state.num_aux_sends,
    );

    // Dithering: enabled by default; depth 0 derives from the sample type.
    state.dither_depth = 0.0;
    if cfg.bool_or(devname, "dither", true) {
        let mut depth = cfg.value_i32(devname, "dither-depth").unwrap_or(0);
        if depth <= 0 {
            depth = match state.fmt.sample_type {
                SampleType::I8 | SampleType::U8 => 8,
                SampleType::I16 | SampleType::U16 => 16,
                _ => 0,
            };
        }
        if depth > 0 {
            let depth = depth.clamp(2, 24);
            state.dither_depth = 2.0f32.powi(depth - 1);
        }
    }
    if state.dither_depth > 0.0 {
        trace!("Dithering enabled ({})", state.dither_depth);
    } else {
        trace!("Dithering disabled");
    }

    // Output limiter: DONT_CARE means "integer output only".
    state.limiter_request = gain_limiter;
    let mut limiter_on = match cfg.value_bool(devname, "output-limiter") {
        Some(v) => {
            if v {
                attrs::TRUE
            } else {
                attrs::FALSE
            }
        }
        None => gain_limiter,
    };
    if limiter_on == attrs::DONT_CARE {
        limiter_on = if state.fmt.sample_type.is_integer() {
            attrs::TRUE
        } else {
            attrs::FALSE
        };
    }
    if limiter_on != attrs::FALSE {
        let threshold_db = limiter::device_threshold_db(state.fmt.sample_type, state.dither_depth);
        let compressor = Compressor::new(
            state.fmt.channel_count(),
            state.fmt.frequency,
            threshold_db,
        );
        state.fixed_latency_ns +=
            compressor.look_ahead() as u64 * 1_000_000_000 / state.fmt.frequency.max(1) as u64;
        state.limiter = Some(compressor);
    } else {
        state.limiter = None;
    }
    trace!(
        "Output limiter {}",
        if state.limiter.is_some() { "enabled" } else { "disabled" }
    );
    trace!("Fixed device latency: {}ns", state.fixed_latency_ns);

    // Re-wire every context to the new graph. Failures are collected so
    // replacement send arrays land before this function reports them.
    let mut update_failed = false;
    let contexts: Vec<Context> = inner
        .contexts
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    for ctx in &contexts {
        if !ctx.rewire_after_reset(state, old_sends) {
            update_failed = true;
        }
    }
    if update_failed {
        return Err(AuricleError::Backend("effect state update failure".into()));
    }

    if !inner.paused.load(Ordering::Acquire) {
        let started = state.backend.as_mut().map(|b| b.start()).unwrap_or(false);
        if !started {
            return Err(AuricleError::Backend("device start failure".into()));
        }
        inner.running.store(true, Ordering::Release);
    }

    Ok(())
}

fn parse_attr_list(
    list: &[i32],
    state: &DeviceState,
    new_sends: &mut i64,
) -> Result<ParsedAttrs> {
    let mut parsed = ParsedAttrs {
        schans: None,
        stype: None,
        freq: 0,
        alayout: None,
        ascale: None,
        aorder: 0,
        num_mono: state.num_mono_sources as i64,
        num_stereo: state.num_stereo_sources as i64,
        hrtf_appreq: HrtfRequest::Default,
        hrtf_id: -1,
        gain_limiter: state.limiter_request,
    };

    for (token, value) in attrs::pairs(list) {
        match token {
            attrs::ATTR_FORMAT_CHANNELS => {
                trace!("FORMAT_CHANNELS = {:#x}", value);
                parsed.schans = ChannelLayout::from_token(value);
                if parsed.schans.is_none() {
                    return Err(AuricleError::InvalidValue(format!(
                        "bad channel layout token {:#x}",
                        value
                    )));
                }
            }
            attrs::ATTR_FORMAT_TYPE => {
                trace!("FORMAT_TYPE = {:#x}", value);
                parsed.stype = SampleType::from_token(value);
                if parsed.stype.is_none() {
                    return Err(AuricleError::InvalidValue(format!(
                        "bad sample type token {:#x}",
                        value
                    )));
                }
            }
            attrs::ATTR_FREQUENCY => {
                trace!("FREQUENCY = {}", value);
                parsed.freq = value.max(0) as u32;
            }
            attrs::ATTR_AMBISONIC_LAYOUT => {
                trace!("AMBISONIC_LAYOUT = {:#x}", value);
                parsed.alayout = AmbiLayout::from_token(value);
                if parsed.alayout.is_none() {
                    return Err(AuricleError::InvalidValue(format!(
                        "bad ambisonic layout token {:#x}",
                        value
                    )));
                }
            }
            attrs::ATTR_AMBISONIC_SCALING => {
                trace!("AMBISONIC_SCALING = {:#x}", value);
                parsed.ascale = AmbiScaling::from_token(value);
                if parsed.ascale.is_none() {
                    return Err(AuricleError::InvalidValue(format!(
                        "bad ambisonic scaling token {:#x}",
                        value
                    )));
                }
            }
            attrs::ATTR_AMBISONIC_ORDER => {
                trace!("AMBISONIC_ORDER = {}", value);
                parsed.aorder = value.max(0) as u32;
            }
            attrs::ATTR_MONO_SOURCES => {
                trace!("MONO_SOURCES = {}", value);
                parsed.num_mono = value.max(0) as i64;
            }
            attrs::ATTR_STEREO_SOURCES => {
                trace!("STEREO_SOURCES = {}", value);
                parsed.num_stereo = value.max(0) as i64;
            }
            attrs::ATTR_MAX_AUXILIARY_SENDS => {
                trace!("MAX_AUXILIARY_SENDS = {}", value);
                *new_sends = value.clamp(0, MAX_SENDS as i32) as i64;
            }
            attrs::ATTR_HRTF => {
                trace!("HRTF = {}", value);
                parsed.hrtf_appreq = match value {
                    attrs::FALSE => HrtfRequest::Disable,
                    attrs::TRUE => HrtfRequest::Enable,
                    _ => HrtfRequest::Default,
                };
            }
            attrs::ATTR_HRTF_ID => {
                trace!("HRTF_ID = {}", value);
                parsed.hrtf_id = value;
            }
            attrs::ATTR_OUTPUT_LIMITER => {
                trace!("OUTPUT_LIMITER = {}", value);
                parsed.gain_limiter = value;
            }
            other => {
                trace!("{:#06x} = {} (ignored)", other, value);
            }
        }
    }

    Ok(parsed)
}

fn validate_loopback_attrs(parsed: &ParsedAttrs) -> Result<()> {
    let invalid = |msg: &str| Err(AuricleError::InvalidValue(msg.into()));

    let Some(schans) = parsed.schans else {
        return invalid("loopback format needs a channel layout");
    };
    if parsed.stype.is_none() {
        return invalid("loopback format needs a sample type");
    }
    if parsed.freq < MIN_OUTPUT_RATE {
        return invalid("loopback frequency below the minimum output rate");
    }
    if schans == ChannelLayout::Ambi3D {
        let (Some(alayout), Some(ascale)) = (parsed.alayout, parsed.ascale) else {
            return invalid("ambisonic loopback needs layout and scaling");
        };
        if parsed.aorder < 1 || parsed.aorder > MAX_AMBI_ORDER {
            return invalid("ambisonic order out of range");
        }
        if (alayout == AmbiLayout::FuMa || ascale == AmbiScaling::FuMa) && parsed.aorder > 3 {
            return invalid("FuMa is limited to third-order ambisonics");
        }
    }
    Ok(())
}

/// Rebuild the channel views and mix storage for the negotiated format.
fn init_renderer(state: &mut DeviceState, engine: &'static registry::EngineGlobals) {
    let cfg = &engine.config;
    let count = state.fmt.channel_count();

    state.post_process = if state.hrtf.is_some() {
        PostProcess::Hrtf
    } else if state.fmt.channels == ChannelLayout::Stereo && cfg.bool_or(None, "uhj", false) {
        PostProcess::Uhj
    } else if state.fmt.channels == ChannelLayout::Stereo
        && cfg.value_i32(None, "cf_level").is_some_and(|l| (1..=6).contains(&l))
    {
        PostProcess::Bs2b
    } else {
        PostProcess::Direct
    };

    // With binaural post-processing the dry bus is first-order ambisonic
    // and the real output is a separate stereo pair; otherwise the dry
    // bus is the device layout and the other views alias it.
    let (dry_count, separate_real) = match state.post_process {
        PostProcess::Hrtf => (4, true),
        _ => (count, false),
    };

    let dry = BufView {
        offset: 0,
        count: dry_count,
    };
    let foa = dry;
    let real = if separate_real {
        BufView {
            offset: dry_count,
            count,
        }
    } else {
        dry
    };

    let total = dry.count + if separate_real { real.count } else { 0 };
    state.mix = MixGraph {
        buffer: vec![vec![0.0; BUFFER_SIZE]; total],
        dry,
        foa,
        real,
    };

    state.avg_speaker_dist = match state.fmt.channels {
        ChannelLayout::Quad
        | ChannelLayout::X51
        | ChannelLayout::X51Rear
        | ChannelLayout::X61
        | ChannelLayout::X71 => 1.5,
        _ => 0.0,
    };
}

/// Near-field compensation coefficient for carried-over voices.
pub(crate) fn nfc_coefficient(state: &DeviceState) -> f32 {
    if state.avg_speaker_dist > 0.0 {
        SPEED_OF_SOUND / (state.avg_speaker_dist * state.fmt.frequency as f32)
    } else {
        0.0
    }
}
