//! Sources: application-visible emitters of buffered PCM.
//!
//! A source carries a staged property image mutated by API setters and a
//! clean flag; publication to the mixer goes through the bound voice's
//! update slot (see the context's deferred-update protocol). The send
//! array always matches the owning device's auxiliary send count.

use crate::buffer::AudioBuffer;
use crate::context::Context;
use crate::error::{AuricleError, Result};
use crate::format::{HIGHPASS_FREQ_REF, LOWPASS_FREQ_REF};
use crate::math::Vec3;
use crate::voice::VoiceProps;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SourceState {
    Initial = 0,
    Playing = 1,
    Paused = 2,
    Stopped = 3,
}

impl SourceState {
    pub(crate) fn from_raw(raw: u32) -> SourceState {
        match raw {
            1 => SourceState::Playing,
            2 => SourceState::Paused,
            3 => SourceState::Stopped,
            _ => SourceState::Initial,
        }
    }
}

/// One auxiliary routing from a source to an effect slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SendParams {
    /// Target effect slot id; `None` routes nowhere.
    pub slot: Option<u32>,
    pub gain: f32,
    pub gain_hf: f32,
    pub hf_reference: f32,
    pub gain_lf: f32,
    pub lf_reference: f32,
}

impl Default for SendParams {
    fn default() -> Self {
        Self {
            slot: None,
            gain: 1.0,
            gain_hf: 1.0,
            hf_reference: LOWPASS_FREQ_REF,
            gain_lf: 1.0,
            lf_reference: HIGHPASS_FREQ_REF,
        }
    }
}

/// Staged source properties.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceProps {
    pub gain: f32,
    pub pitch: f32,
    pub position: Vec3,
    pub velocity: Vec3,
    pub direction: Vec3,
    pub relative: bool,
    pub looping: bool,
    pub reference_distance: f32,
    pub max_distance: f32,
    pub rolloff_factor: f32,
    pub cone_inner_angle: f32,
    pub cone_outer_angle: f32,
    pub cone_outer_gain: f32,
    pub sends: Vec<SendParams>,
}

impl Default for SourceProps {
    fn default() -> Self {
        Self {
            gain: 1.0,
            pitch: 1.0,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            direction: Vec3::ZERO,
            relative: false,
            looping: false,
            reference_distance: 1.0,
            max_distance: f32::MAX,
            rolloff_factor: 1.0,
            cone_inner_angle: 360.0,
            cone_outer_angle: 360.0,
            cone_outer_gain: 0.0,
            sends: Vec::new(),
        }
    }
}

impl SourceProps {
    pub(crate) fn with_sends(num_sends: usize) -> SourceProps {
        SourceProps {
            sends: vec![SendParams::default(); num_sends],
            ..SourceProps::default()
        }
    }

    pub(crate) fn to_voice_props(&self) -> VoiceProps {
        VoiceProps {
            gain: self.gain,
            pitch: self.pitch,
            position: self.position,
            velocity: self.velocity,
            direction: self.direction,
            relative: self.relative,
            looping: self.looping,
            sends: self.sends.clone(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SourceInner {
    pub id: u32,
    pub staged: Mutex<SourceProps>,
    pub props_clean: AtomicBool,
    pub state: AtomicU32,
    pub buffer: Mutex<Option<Arc<AudioBuffer>>>,
}

impl SourceInner {
    pub fn new(id: u32, num_sends: usize) -> Arc<SourceInner> {
        Arc::new(SourceInner {
            id,
            staged: Mutex::new(SourceProps::with_sends(num_sends)),
            props_clean: AtomicBool::new(true),
            state: AtomicU32::new(SourceState::Initial as u32),
            buffer: Mutex::new(None),
        })
    }
}

/// Handle to a source. Cheap to clone; operations re-verify the owning
/// context on every call.
#[derive(Clone)]
pub struct Source {
    pub(crate) ctx: Context,
    pub(crate) inner: Arc<SourceInner>,
}

impl Source {
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Attach (or detach) the PCM data this source plays. Only allowed
    /// while the source is not playing or paused.
    pub fn set_buffer(&self, buffer: Option<Arc<AudioBuffer>>) -> Result<()> {
        self.ctx.verify()?;
        match self.state() {
            SourceState::Playing | SourceState::Paused => {
                Err(self.ctx.latch(AuricleError::InvalidValue(
                    "source buffer is immutable while playing".into(),
                )))
            }
            _ => {
                *self.inner.buffer.lock().unwrap_or_else(|e| e.into_inner()) = buffer;
                Ok(())
            }
        }
    }

    pub fn set_gain(&self, gain: f32) -> Result<()> {
        if !(gain >= 0.0) {
            self.ctx.verify()?;
            return Err(self
                .ctx
                .latch(AuricleError::InvalidValue(format!("gain {}", gain))));
        }
        self.set_staged(|p| p.gain = gain)
    }

    pub fn set_pitch(&self, pitch: f32) -> Result<()> {
        if !(pitch > 0.0) {
            self.ctx.verify()?;
            return Err(self
                .ctx
                .latch(AuricleError::InvalidValue(format!("pitch {}", pitch))));
        }
        self.set_staged(|p| p.pitch = pitch)
    }

    pub fn set_position(&self, position: Vec3) -> Result<()> {
        self.set_staged(|p| p.position = position)
    }

    pub fn set_velocity(&self, velocity: Vec3) -> Result<()> {
        self.set_staged(|p| p.velocity = velocity)
    }

    pub fn set_direction(&self, direction: Vec3) -> Result<()> {
        self.set_staged(|p| p.direction = direction)
    }

    pub fn set_relative(&self, relative: bool) -> Result<()> {
        self.set_staged(|p| p.relative = relative)
    }

    pub fn set_looping(&self, looping: bool) -> Result<()> {
        self.set_staged(|p| p.looping = looping)
    }

    /// Route auxiliary send `index` to `slot` with the given wet gain.
    /// `index` must be below the device's negotiated send count.
    pub fn set_send(&self, index: usize, slot: Option<&crate::effect::EffectSlot>, gain: f32) -> Result<()> {
        self.ctx.verify()?;
        let slot_id = slot.map(|s| s.id());
        let num_sends = self
            .inner
            .staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sends
            .len();
        if index >= num_sends {
            return Err(self.ctx.latch(AuricleError::InvalidValue(format!(
                "send index {} exceeds device send count {}",
                index, num_sends
            ))));
        }
        if !(gain >= 0.0) {
            return Err(self
                .ctx
                .latch(AuricleError::InvalidValue(format!("send gain {}", gain))));
        }
        self.set_staged(|p| {
            p.sends[index].slot = slot_id;
            p.sends[index].gain = gain;
        })
    }

    pub fn play(&self) -> Result<()> {
        self.ctx.verify()?;
        self.ctx.source_play(&self.inner)
    }

    pub fn pause(&self) -> Result<()> {
        self.ctx.verify()?;
        self.ctx.source_pause(&self.inner)
    }

    pub fn stop(&self) -> Result<()> {
        self.ctx.verify()?;
        self.ctx.source_stop(&self.inner, SourceState::Stopped)
    }

    pub fn rewind(&self) -> Result<()> {
        self.ctx.verify()?;
        self.ctx.source_stop(&self.inner, SourceState::Initial)
    }

    /// Current playback state. A playing source whose voice has finished
    /// on the mixer thread reads back as stopped.
    pub fn state(&self) -> SourceState {
        let state = SourceState::from_raw(self.inner.state.load(Ordering::Acquire));
        if state == SourceState::Playing && !self.ctx.source_is_bound(self.inner.id) {
            self.inner
                .state
                .store(SourceState::Stopped as u32, Ordering::Release);
            return SourceState::Stopped;
        }
        state
    }

    /// Snapshot of the staged property image.
    pub fn props(&self) -> SourceProps {
        self.inner
            .staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The committed image the mixer is currently using, when a voice is
    /// bound. Diagnostic introspection; see the deferred-update protocol.
    pub fn committed_props(&self) -> Option<VoiceProps> {
        self.ctx.source_committed_props(self.inner.id)
    }

    fn set_staged(&self, mutate: impl FnOnce(&mut SourceProps)) -> Result<()> {
        self.ctx.verify()?;
        {
            let mut staged = self.inner.staged.lock().unwrap_or_else(|e| e.into_inner());
            mutate(&mut staged);
        }
        self.ctx.mark_source_dirty(&self.inner);
        Ok(())
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source").field("id", &self.inner.id).finish()
    }
}
