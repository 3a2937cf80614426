//! Contexts: the per-application-state half of a device.
//!
//! A context owns its sources, effect slots, listener, and voice pool, and
//! runs the deferred-update protocol that publishes staged property images
//! to the mixer so a batch of writes becomes visible in one mix tick.

use crate::device::{Device, DeviceState};
use crate::effect::{self, EffectProps, EffectSlot, EffectSlotInner, EffectSlotProps};
use crate::error::{AuricleError, Result};
use crate::events::{self, AsyncEvent, EventCallback};
use crate::format::SPEED_OF_SOUND;
use crate::listener::{Listener, ListenerProps};
use crate::math::Vec3;
use crate::props::{PropPool, UpdateSlot};
use crate::registry::{self, engine};
use crate::source::{Source, SourceInner, SourceState};
use crate::voice::{VoicePool, VoiceProps};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceModel {
    None,
    Inverse,
    #[default]
    InverseClamped,
    Linear,
    LinearClamped,
    Exponent,
    ExponentClamped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextProps {
    pub distance_model: DistanceModel,
    pub source_distance_model: bool,
    pub doppler_factor: f32,
    pub doppler_velocity: f32,
    pub speed_of_sound: f32,
    pub meters_per_unit: f32,
}

impl Default for ContextProps {
    fn default() -> Self {
        Self {
            distance_model: DistanceModel::default(),
            source_distance_model: false,
            doppler_factor: 1.0,
            doppler_velocity: 1.0,
            speed_of_sound: SPEED_OF_SOUND,
            meters_per_unit: crate::format::DEFAULT_METERS_PER_UNIT,
        }
    }
}

pub(crate) struct ContextInner {
    pub device: Device,
    pub props_clean: AtomicBool,
    pub defer_updates: AtomicBool,
    /// While set, the mixer skips update consumption so a deferred batch
    /// lands in a single tick.
    pub hold_updates: AtomicBool,
    /// Staged context properties; doubles as the context prop lock.
    pub staged: Mutex<ContextProps>,
    pub update: UpdateSlot<ContextProps>,
    pub free_context_props: PropPool<ContextProps>,
    /// Committed image, touched only by the mixer.
    pub params: Mutex<ContextProps>,
    pub gain_boost: f32,
    pub listener: Listener,
    pub sources: Mutex<crate::device::IdPool<Arc<SourceInner>>>,
    pub slots: Mutex<Vec<Arc<EffectSlotInner>>>,
    /// Snapshot of the slots the mixer processes, republished whole on
    /// every membership change.
    pub active_slots: Mutex<Arc<Vec<Arc<EffectSlotInner>>>>,
    pub free_listener_props: PropPool<ListenerProps>,
    pub free_slot_props: PropPool<EffectSlotProps>,
    pub free_voice_props: PropPool<VoiceProps>,
    pub voices: Mutex<VoicePool>,
    pub events_tx: crossbeam_channel::Sender<AsyncEvent>,
    pub event_thread: Mutex<Option<JoinHandle<()>>>,
    pub event_callback: Arc<Mutex<Option<Arc<EventCallback>>>>,
    pub default_slot: Option<Arc<EffectSlotInner>>,
    next_slot_id: AtomicU32,
    /// Ticks in which the mixer consumed at least one pending update.
    pub commit_count: AtomicU64,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let count = self.free_context_props.drain()
            + self.free_listener_props.drain()
            + self.free_slot_props.drain()
            + self.free_voice_props.drain();
        debug!("Freed {} recycled property block(s)", count);

        let sources = self.sources.lock().unwrap_or_else(|e| e.into_inner()).len();
        if sources > 0 {
            warn!("{} source(s) not deleted", sources);
        }
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner()).len();
        if slots > 0 {
            warn!("{} effect slot(s) not deleted", slots);
        }
    }
}

/// Handle to a context. Cheap to clone; operations re-verify the handle.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl PartialEq for Context {
    fn eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

impl Context {
    /// Build a context adopting the device's negotiated format. Runs with
    /// the device state lock held.
    pub(crate) fn create(device: Device, state: &DeviceState) -> Context {
        let engine = engine();
        let cfg = &engine.config;

        let mut gain_boost = 1.0f32;
        if let Some(db) = cfg.value_f32(Some(&state.name), "volume-adjust") {
            if db.is_finite() {
                let clamped = db.clamp(-24.0, 24.0);
                if clamped != db {
                    warn!("volume-adjust clamped: {}, range: +/-24", db);
                }
                gain_boost = 10.0f32.powf(clamped / 20.0);
                debug!("volume-adjust gain: {}", gain_boost);
            } else {
                log::error!("volume-adjust must be finite: {}", db);
            }
        }

        // The default slot routes sources that never set a send target.
        let default_slot = match (
            &engine.default_effect,
            device.inner.dev_type == crate::format::DeviceType::Playback,
        ) {
            (Some(effect), true) => {
                let slot = EffectSlotInner::new(1);
                {
                    let mut staged = slot.staged.lock().unwrap_or_else(|e| e.into_inner());
                    staged.effect = effect.clone();
                }
                let mut dsp = slot.dsp.lock().unwrap_or_else(|e| e.into_inner());
                dsp.state = effect::create_state(effect.kind);
                dsp.out_count = state.mix.dry.count;
                if !dsp.state.device_update(&state.fmt, state.mix.dry.count) {
                    log::error!("Failed to initialize the default effect slot");
                    drop(dsp);
                    None
                } else {
                    dsp.params.effect = effect.clone();
                    dsp.state.update(effect, state.fmt.frequency);
                    drop(dsp);
                    Some(slot)
                }
            }
            _ => None,
        };

        let (events_tx, events_rx) = events::channel();
        let event_callback: Arc<Mutex<Option<Arc<EventCallback>>>> = Arc::new(Mutex::new(None));
        let event_thread = events::start_thread(events_rx, event_callback.clone());

        let active: Vec<Arc<EffectSlotInner>> = default_slot.iter().cloned().collect();

        let inner = Arc::new(ContextInner {
            device,
            props_clean: AtomicBool::new(true),
            defer_updates: AtomicBool::new(false),
            hold_updates: AtomicBool::new(false),
            staged: Mutex::new(ContextProps::default()),
            update: UpdateSlot::new(),
            free_context_props: PropPool::new(),
            params: Mutex::new(ContextProps::default()),
            gain_boost,
            listener: Listener::new(),
            sources: Mutex::new(crate::device::IdPool::new()),
            slots: Mutex::new(Vec::new()),
            active_slots: Mutex::new(Arc::new(active)),
            free_listener_props: PropPool::new(),
            free_slot_props: PropPool::new(),
            free_voice_props: PropPool::new(),
            voices: Mutex::new(VoicePool::new(256, state.num_aux_sends)),
            events_tx,
            event_thread: Mutex::new(Some(event_thread)),
            event_callback,
            default_slot,
            next_slot_id: AtomicU32::new(2),
            commit_count: AtomicU64::new(0),
        });

        let ctx = Context { inner };
        ctx.update_context_props();
        ctx.update_listener_props();
        ctx
    }

    /// Post-creation work done after the device state lock drops.
    pub(crate) fn finish_init(&self) {
        if let Some(slot) = &self.inner.default_slot {
            self.update_slot_props(slot);
        }
    }

    pub(crate) fn verify(&self) -> Result<()> {
        if registry::verify_context(self) {
            Ok(())
        } else {
            Err(registry::latch_null(AuricleError::InvalidContext))
        }
    }

    pub(crate) fn latch(&self, err: AuricleError) -> AuricleError {
        registry::set_error(Some(&self.inner.device.inner), err.code());
        err
    }

    /// The device this context renders on.
    pub fn device(&self) -> Result<Device> {
        self.verify()?;
        Ok(self.inner.device.clone())
    }

    /// Make this context the process-wide current context.
    pub fn make_current(&self) -> Result<()> {
        registry::make_current(Some(self))
    }

    /// Make this context current for the calling thread only.
    pub fn set_thread_context(&self) -> Result<()> {
        registry::set_thread_context(Some(self))
    }

    /// Begin deferring property publication. Writes stage as usual but
    /// nothing reaches the mixer until `process`.
    pub fn suspend(&self) -> Result<()> {
        if !engine().suspend_defers {
            return Ok(());
        }
        self.verify()?;
        self.inner.defer_updates.store(true, Ordering::Release);
        Ok(())
    }

    /// Publish everything staged since `suspend` so the whole batch
    /// becomes visible in one mix tick.
    pub fn process(&self) -> Result<()> {
        if !engine().suspend_defers {
            return Ok(());
        }
        self.verify()?;
        self.process_updates();
        Ok(())
    }

    fn process_updates(&self) {
        let inner = &self.inner;
        let _prop = inner.staged.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.defer_updates.swap(false, Ordering::AcqRel) {
            return;
        }

        // Park the mixer's update consumption, wait out any in-flight
        // tick, then declare every dirty object at once.
        inner.hold_updates.store(true, Ordering::Release);
        while inner.device.inner.mix_count.load(Ordering::Acquire) & 1 != 0 {
            std::thread::yield_now();
        }

        if !inner.props_clean.swap(true, Ordering::AcqRel) {
            self.publish_context_props(&_prop);
        }
        if !inner.listener.props_clean.swap(true, Ordering::AcqRel) {
            self.publish_listener_props();
        }
        self.update_all_effect_slot_props();
        self.update_all_source_props();

        inner.hold_updates.store(false, Ordering::Release);
    }

    /// Release everything tied to the mixer; runs under the device state
    /// lock with this context already removed from the device list.
    pub(crate) fn release(&self, _state: &mut DeviceState) {
        registry::clear_current_if(self);

        // The kill message must not be dropped on a full queue; a blocking
        // send is fine here since the consumer is draining.
        let _ = self.inner.events_tx.send(AsyncEvent::Shutdown);
        if let Some(thread) = self
            .inner
            .event_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = thread.join();
        }

        let mut voices = self.inner.voices.lock().unwrap_or_else(|e| e.into_inner());
        for voice in voices.voices_mut() {
            voice.deactivate();
        }
    }

    /// Tear this context down and detach it from its device.
    pub fn destroy(self) -> Result<()> {
        let list = registry::list_guard();
        if !registry::verify_context_in(&list, &self) {
            return Err(registry::latch_null(AuricleError::InvalidContext));
        }
        let device = self.inner.device.clone();
        let mut state = device.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        drop(list);

        let remaining = {
            let mut contexts = device
                .inner
                .contexts
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            contexts.retain(|c| c != &self);
            contexts.len()
        };
        self.release(&mut state);

        if remaining == 0 && device.inner.running.swap(false, Ordering::AcqRel) {
            if let Some(backend) = state.backend.as_mut() {
                backend.stop();
            }
        }
        Ok(())
    }

    /// Receive async mixer events (source state changes, disconnects).
    pub fn set_event_callback<F>(&self, callback: Option<F>) -> Result<()>
    where
        F: Fn(&AsyncEvent) + Send + Sync + 'static,
    {
        self.verify()?;
        *self
            .inner
            .event_callback
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = callback.map(|f| Arc::new(f) as Arc<EventCallback>);
        Ok(())
    }

    /// Ticks in which the mixer consumed pending updates. Diagnostic
    /// counter for observing commit batching.
    pub fn commit_count(&self) -> u64 {
        self.inner.commit_count.load(Ordering::Acquire)
    }

    // -- context & listener properties ------------------------------------

    pub fn set_distance_model(&self, model: DistanceModel) -> Result<()> {
        self.set_context_staged(|p| p.distance_model = model)
    }

    pub fn set_source_distance_model(&self, enabled: bool) -> Result<()> {
        self.set_context_staged(|p| p.source_distance_model = enabled)
    }

    pub fn set_doppler_factor(&self, factor: f32) -> Result<()> {
        if !(factor >= 0.0) {
            self.verify()?;
            return Err(self.latch(AuricleError::InvalidValue(format!(
                "doppler factor {}",
                factor
            ))));
        }
        self.set_context_staged(|p| p.doppler_factor = factor)
    }

    pub fn set_doppler_velocity(&self, velocity: f32) -> Result<()> {
        if !(velocity > 0.0) {
            self.verify()?;
            return Err(self.latch(AuricleError::InvalidValue(format!(
                "doppler velocity {}",
                velocity
            ))));
        }
        self.set_context_staged(|p| p.doppler_velocity = velocity)
    }

    pub fn set_speed_of_sound(&self, speed: f32) -> Result<()> {
        if !(speed > 0.0) {
            self.verify()?;
            return Err(self.latch(AuricleError::InvalidValue(format!(
                "speed of sound {}",
                speed
            ))));
        }
        self.set_context_staged(|p| p.speed_of_sound = speed)
    }

    pub fn set_meters_per_unit(&self, meters: f32) -> Result<()> {
        if !(meters > 0.0) {
            self.verify()?;
            return Err(self.latch(AuricleError::InvalidValue(format!(
                "meters per unit {}",
                meters
            ))));
        }
        self.set_context_staged(|p| p.meters_per_unit = meters)
    }

    pub fn context_props(&self) -> Result<ContextProps> {
        self.verify()?;
        Ok(self
            .inner
            .staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn set_context_staged(&self, mutate: impl FnOnce(&mut ContextProps)) -> Result<()> {
        self.verify()?;
        let staged = {
            let mut staged = self.inner.staged.lock().unwrap_or_else(|e| e.into_inner());
            mutate(&mut staged);
            staged
        };
        self.inner.props_clean.store(false, Ordering::Release);
        if !self.inner.defer_updates.load(Ordering::Acquire) {
            self.inner.props_clean.store(true, Ordering::Release);
            self.publish_context_props(&staged);
        }
        Ok(())
    }

    fn publish_context_props(&self, staged: &ContextProps) {
        let mut block = self.inner.free_context_props.acquire();
        *block = staged.clone();
        if let Some(old) = self.inner.update.publish(block) {
            self.inner.free_context_props.recycle(old);
        }
    }

    pub(crate) fn update_context_props(&self) {
        let staged = self
            .inner
            .staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        self.publish_context_props(&staged);
    }

    pub fn set_listener_gain(&self, gain: f32) -> Result<()> {
        if !(gain >= 0.0) {
            self.verify()?;
            return Err(self.latch(AuricleError::InvalidValue(format!(
                "listener gain {}",
                gain
            ))));
        }
        self.set_listener_staged(|p| p.gain = gain)
    }

    pub fn set_listener_position(&self, position: Vec3) -> Result<()> {
        self.set_listener_staged(|p| p.pose.position = position)
    }

    pub fn set_listener_velocity(&self, velocity: Vec3) -> Result<()> {
        self.set_listener_staged(|p| p.velocity = velocity)
    }

    pub fn set_listener_orientation(&self, rotation: crate::math::Quat) -> Result<()> {
        self.set_listener_staged(|p| p.pose.rotation = rotation)
    }

    pub fn listener_props(&self) -> Result<ListenerProps> {
        self.verify()?;
        Ok(self
            .inner
            .listener
            .staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn set_listener_staged(&self, mutate: impl FnOnce(&mut ListenerProps)) -> Result<()> {
        self.verify()?;
        {
            let mut staged = self
                .inner
                .listener
                .staged
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            mutate(&mut staged);
        }
        self.inner.listener.props_clean.store(false, Ordering::Release);
        if !self.inner.defer_updates.load(Ordering::Acquire) {
            self.inner.listener.props_clean.store(true, Ordering::Release);
            self.publish_listener_props();
        }
        Ok(())
    }

    fn publish_listener_props(&self) {
        let listener = &self.inner.listener;
        let staged = listener
            .staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut block = self.inner.free_listener_props.acquire();
        *block = staged;
        if let Some(old) = listener.update.publish(block) {
            self.inner.free_listener_props.recycle(old);
        }
    }

    pub(crate) fn update_listener_props(&self) {
        self.publish_listener_props();
    }

    // -- sources -----------------------------------------------------------

    pub fn new_source(&self) -> Result<Source> {
        self.verify()?;
        let num_sends;
        let sources_max;
        {
            let state = self
                .inner
                .device
                .inner
                .state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            num_sends = state.num_aux_sends;
            sources_max = state.sources_max;
        }
        let mut sources = self.inner.sources.lock().unwrap_or_else(|e| e.into_inner());
        if sources.len() >= sources_max as usize {
            return Err(self.latch(AuricleError::OutOfMemory));
        }
        let id = sources.insert_with(|id| SourceInner::new(id, num_sends));
        let inner = sources.get(id).unwrap().clone();
        Ok(Source {
            ctx: self.clone(),
            inner,
        })
    }

    pub fn delete_source(&self, source: Source) -> Result<()> {
        self.verify()?;
        {
            let mut voices = self.inner.voices.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(voice) = voices.find_by_source(source.inner.id) {
                voice.deactivate();
            }
        }
        self.inner
            .sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(source.inner.id)
            .map(|_| ())
            .ok_or_else(|| {
                self.latch(AuricleError::InvalidValue(format!(
                    "no source {}",
                    source.inner.id
                )))
            })
    }

    pub(crate) fn mark_source_dirty(&self, source: &Arc<SourceInner>) {
        source.props_clean.store(false, Ordering::Release);
        if !self.inner.defer_updates.load(Ordering::Acquire) {
            source.props_clean.store(true, Ordering::Release);
            self.update_source_props(source);
        }
    }

    /// Publish a source's staged properties into its bound voice.
    pub(crate) fn update_source_props(&self, source: &Arc<SourceInner>) {
        let staged = source
            .staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut voices = self.inner.voices.lock().unwrap_or_else(|e| e.into_inner());
        let num_sends = voices.num_sends();
        if let Some(voice) = voices.find_by_source(source.id) {
            let mut block = self.inner.free_voice_props.acquire();
            *block = staged.to_voice_props();
            block.sends.truncate(num_sends);
            block
                .sends
                .resize_with(num_sends, crate::source::SendParams::default);
            if let Some(old) = voice.update.publish(block) {
                self.inner.free_voice_props.recycle(old);
            }
        }
    }

    pub(crate) fn source_play(&self, source: &Arc<SourceInner>) -> Result<()> {
        let buffer = source
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(buffer) = buffer else {
            // Nothing to play; the source goes straight to stopped.
            source
                .state
                .store(SourceState::Stopped as u32, Ordering::Release);
            return Ok(());
        };

        // Staged props are snapshotted before the pool lock; the lock
        // order is always staged, then voices.
        let staged = source
            .staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut voices = self.inner.voices.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(voice) = voices.find_by_source(source.id) {
            // Resuming from pause keeps the cursor.
            voice.playing.store(true, Ordering::Release);
            source
                .state
                .store(SourceState::Playing as u32, Ordering::Release);
            return Ok(());
        }

        let num_sends = voices.num_sends();
        let Some(voice) = voices.find_free() else {
            return Err(self.latch(AuricleError::OutOfMemory));
        };

        voice.position.store(0, Ordering::Relaxed);
        voice.position_frac.store(0, Ordering::Relaxed);
        voice.current_buffer.store(0, Ordering::Relaxed);
        voice.loop_buffer.store(0, Ordering::Relaxed);
        voice.num_channels = buffer.channels() as usize;
        voice.sample_size = std::mem::size_of::<f32>();
        voice.buffer = Some(buffer);
        voice.offset = 0;
        voice.prev_samples = [0.0; crate::voice::PREV_SAMPLES];
        voice.resample_state = 0.0;

        let mut props = staged.to_voice_props();
        props.sends.truncate(num_sends);
        props
            .sends
            .resize_with(num_sends, crate::source::SendParams::default);
        let mut block = self.inner.free_voice_props.acquire();
        *block = props;
        if let Some(old) = voice.update.publish(block) {
            self.inner.free_voice_props.recycle(old);
        }

        voice.playing.store(true, Ordering::Release);
        voice.source_id.store(source.id, Ordering::Release);
        source
            .state
            .store(SourceState::Playing as u32, Ordering::Release);
        events::post(
            &self.inner.events_tx,
            AsyncEvent::SourceStateChanged {
                source: source.id,
                state: SourceState::Playing,
            },
        );
        Ok(())
    }

    pub(crate) fn source_pause(&self, source: &Arc<SourceInner>) -> Result<()> {
        let mut voices = self.inner.voices.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(voice) = voices.find_by_source(source.id) {
            voice.playing.store(false, Ordering::Release);
            source
                .state
                .store(SourceState::Paused as u32, Ordering::Release);
        }
        Ok(())
    }

    pub(crate) fn source_stop(&self, source: &Arc<SourceInner>, to: SourceState) -> Result<()> {
        {
            let mut voices = self.inner.voices.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(voice) = voices.find_by_source(source.id) {
                voice.deactivate();
            }
        }
        source.state.store(to as u32, Ordering::Release);
        events::post(
            &self.inner.events_tx,
            AsyncEvent::SourceStateChanged {
                source: source.id,
                state: to,
            },
        );
        Ok(())
    }

    pub(crate) fn source_is_bound(&self, source_id: u32) -> bool {
        self.inner
            .voices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .source_is_bound(source_id)
    }

    pub(crate) fn source_committed_props(&self, source_id: u32) -> Option<VoiceProps> {
        let mut voices = self.inner.voices.lock().unwrap_or_else(|e| e.into_inner());
        voices
            .find_by_source(source_id)
            .map(|voice| voice.props.clone())
    }

    fn update_all_source_props(&self) {
        let sources: Vec<Arc<SourceInner>> = self
            .inner
            .sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for source in sources {
            if !source.props_clean.swap(true, Ordering::AcqRel) {
                self.update_source_props(&source);
            }
        }
    }

    // -- effect slots ------------------------------------------------------

    pub fn new_effect_slot(&self) -> Result<EffectSlot> {
        self.verify()?;
        let state = self
            .inner
            .device
            .inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.len() >= state.slots_max as usize {
            return Err(self.latch(AuricleError::OutOfMemory));
        }
        let id = self.inner.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let slot = EffectSlotInner::new(id);
        {
            let mut dsp = slot.dsp.lock().unwrap_or_else(|e| e.into_inner());
            dsp.out_count = state.mix.dry.count;
        }
        slots.push(slot.clone());
        drop(slots);
        drop(state);

        self.republish_active_slots();
        Ok(EffectSlot {
            ctx: self.clone(),
            inner: slot,
        })
    }

    pub fn delete_effect_slot(&self, slot: EffectSlot) -> Result<()> {
        self.verify()?;
        let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        let before = slots.len();
        slots.retain(|s| !Arc::ptr_eq(s, &slot.inner));
        let removed = slots.len() != before;
        drop(slots);
        if !removed {
            return Err(self.latch(AuricleError::InvalidValue(format!(
                "no effect slot {}",
                slot.inner.id
            ))));
        }
        self.republish_active_slots();
        Ok(())
    }

    pub(crate) fn slot_set_effect(
        &self,
        slot: &Arc<EffectSlotInner>,
        effect: &EffectProps,
    ) -> Result<()> {
        // Device state first: the DSP rebind needs the negotiated format.
        let state = self
            .inner
            .device
            .inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        {
            let mut dsp = slot.dsp.lock().unwrap_or_else(|e| e.into_inner());
            let kind_changed = dsp.params.effect.kind != effect.kind;
            if kind_changed {
                dsp.state = effect::create_state(effect.kind);
            }
            dsp.out_count = state.mix.dry.count;
            if !dsp.state.device_update(&state.fmt, state.mix.dry.count) {
                return Err(self.latch(AuricleError::InvalidValue(
                    "effect state rejected the device format".into(),
                )));
            }
        }
        drop(state);

        {
            let mut staged = slot.staged.lock().unwrap_or_else(|e| e.into_inner());
            staged.effect = effect.clone();
        }
        self.mark_slot_dirty(slot);
        Ok(())
    }

    pub(crate) fn mark_slot_dirty(&self, slot: &Arc<EffectSlotInner>) {
        slot.props_clean.store(false, Ordering::Release);
        if !self.inner.defer_updates.load(Ordering::Acquire) {
            slot.props_clean.store(true, Ordering::Release);
            self.update_slot_props(slot);
        }
    }

    pub(crate) fn update_slot_props(&self, slot: &Arc<EffectSlotInner>) {
        let staged = slot.staged.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut block = self.inner.free_slot_props.acquire();
        *block = staged;
        if let Some(old) = slot.update.publish(block) {
            self.inner.free_slot_props.recycle(old);
        }
    }

    fn update_all_effect_slot_props(&self) {
        let slots: Vec<Arc<EffectSlotInner>> = {
            let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
            self.inner
                .default_slot
                .iter()
                .cloned()
                .chain(slots.iter().cloned())
                .collect()
        };
        for slot in slots {
            if !slot.props_clean.swap(true, Ordering::AcqRel) {
                self.update_slot_props(&slot);
            }
        }
    }

    fn republish_active_slots(&self) {
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot: Vec<Arc<EffectSlotInner>> = self
            .inner
            .default_slot
            .iter()
            .cloned()
            .chain(slots.iter().cloned())
            .collect();
        drop(slots);
        *self
            .inner
            .active_slots
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
    }

    // -- device reset plumbing ---------------------------------------------

    /// Re-wire this context after `update_device_params` rebuilt the mix
    /// graph. Returns false when any effect state rejected the new format.
    pub(crate) fn rewire_after_reset(&self, state: &mut DeviceState, old_sends: usize) -> bool {
        let mut ok = true;
        let fmt = state.fmt.clone();
        let dry_count = state.mix.dry.count;
        let new_sends = state.num_aux_sends;

        if let Some(slot) = &self.inner.default_slot {
            let mut dsp = slot.dsp.lock().unwrap_or_else(|e| e.into_inner());
            dsp.out_count = dry_count;
            if !dsp.state.device_update(&fmt, dry_count) {
                ok = false;
            } else {
                drop(dsp);
                self.update_slot_props(slot);
            }
        }

        let _prop = self.inner.staged.lock().unwrap_or_else(|e| e.into_inner());

        {
            let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
            for slot in slots.iter() {
                let mut dsp = slot.dsp.lock().unwrap_or_else(|e| e.into_inner());
                dsp.out_count = dry_count;
                if !dsp.state.device_update(&fmt, dry_count) {
                    ok = false;
                    continue;
                }
                drop(dsp);
                self.update_slot_props(slot);
            }
        }

        {
            let sources = self.inner.sources.lock().unwrap_or_else(|e| e.into_inner());
            for source in sources.values() {
                if old_sends != new_sends {
                    let mut staged = source.staged.lock().unwrap_or_else(|e| e.into_inner());
                    staged.sends.truncate(new_sends);
                    staged
                        .sends
                        .resize_with(new_sends, crate::source::SendParams::default);
                }
                source.props_clean.store(false, Ordering::Release);
            }
        }

        // Pending voice property blocks were sized for the old send
        // count; drop the recycled ones and respecify active voices.
        self.inner.free_voice_props.drain();
        {
            let mut voices = self.inner.voices.lock().unwrap_or_else(|e| e.into_inner());
            let max_voices = voices.max_voices();
            voices.reallocate(max_voices, new_sends);
            let w1 = crate::device::nfc_coefficient(state);
            for voice in voices.voices_mut() {
                drop(voice.update.take());
                if voice.is_active() && w1 > 0.0 {
                    voice.direct.nfc_w1 = w1;
                }
            }
        }

        self.inner.props_clean.store(true, Ordering::Release);
        self.publish_context_props(&_prop);
        self.inner.listener.props_clean.store(true, Ordering::Release);
        self.publish_listener_props();
        drop(_prop);
        self.update_all_source_props();

        ok
    }

    /// Called from the device's disconnect path: stop every voice and
    /// surface the loss through the event queue.
    pub(crate) fn post_disconnect(&self, reason: &str) {
        {
            let mut voices = self.inner.voices.lock().unwrap_or_else(|e| e.into_inner());
            for voice in voices.voices_mut() {
                if voice.is_active() {
                    let source = voice.source_id.load(Ordering::Acquire);
                    voice.deactivate();
                    events::post(
                        &self.inner.events_tx,
                        AsyncEvent::SourceStateChanged {
                            source,
                            state: SourceState::Stopped,
                        },
                    );
                }
            }
        }
        events::post(
            &self.inner.events_tx,
            AsyncEvent::DeviceDisconnected {
                reason: reason.to_string(),
            },
        );
    }
}
