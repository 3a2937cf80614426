//! Effects, effect slots, and filters.
//!
//! Slots are stateful DSP units shared across sources via their sends.
//! The engine core cares about their lifecycle and property protocol; the
//! DSP behind [`EffectState`] is deliberately small.

use crate::context::Context;
use crate::error::{AuricleError, Result};
use crate::format::DeviceFormat;
use crate::props::UpdateSlot;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectKind {
    Null,
    Reverb,
    Echo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectProps {
    pub kind: EffectKind,
    pub gain: f32,
    /// Reverb decay / echo feedback horizon, seconds.
    pub decay_time: f32,
    /// Pre-delay, seconds.
    pub delay: f32,
    pub feedback: f32,
    pub damping: f32,
}

impl Default for EffectProps {
    fn default() -> Self {
        Self {
            kind: EffectKind::Null,
            gain: 1.0,
            decay_time: 1.49,
            delay: 0.1,
            feedback: 0.5,
            damping: 0.5,
        }
    }
}

/// Resolve a `default-reverb` config/environment preset name.
pub(crate) fn reverb_preset(name: &str) -> Option<EffectProps> {
    let props = |decay: f32, damping: f32| EffectProps {
        kind: EffectKind::Reverb,
        decay_time: decay,
        damping,
        ..EffectProps::default()
    };
    match name.to_ascii_lowercase().as_str() {
        "generic" => Some(props(1.49, 0.5)),
        "room" => Some(props(0.4, 0.7)),
        "hall" | "concerthall" => Some(props(3.92, 0.3)),
        "cave" => Some(props(2.91, 0.2)),
        "auditorium" => Some(props(4.32, 0.4)),
        "none" | "off" => None,
        other => {
            log::warn!("Unknown reverb preset \"{}\"", other);
            None
        }
    }
}

/// Filter kinds applied on the direct or send paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Null,
    LowPass,
    HighPass,
    BandPass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterProps {
    pub kind: FilterKind,
    pub gain: f32,
    pub gain_hf: f32,
    pub gain_lf: f32,
}

impl Default for FilterProps {
    fn default() -> Self {
        Self {
            kind: FilterKind::Null,
            gain: 1.0,
            gain_hf: 1.0,
            gain_lf: 1.0,
        }
    }
}

/// The DSP behind an effect slot. `device_update` re-binds the state to a
/// freshly negotiated device format and must succeed for the reset to
/// succeed; `update` consumes committed property changes; `process` adds
/// `frames` of wet output into the dry bus.
pub(crate) trait EffectState: Send {
    fn device_update(&mut self, fmt: &DeviceFormat, out_channels: usize) -> bool;
    fn update(&mut self, props: &EffectProps, frequency: u32);
    fn process(&mut self, frames: usize, wet_in: &[f32], out: &mut [Vec<f32>], out_count: usize);
}

pub(crate) fn create_state(kind: EffectKind) -> Box<dyn EffectState> {
    match kind {
        EffectKind::Null => Box::new(NullState),
        EffectKind::Echo => Box::new(EchoState::default()),
        EffectKind::Reverb => Box::new(ReverbState::default()),
    }
}

struct NullState;

impl EffectState for NullState {
    fn device_update(&mut self, _fmt: &DeviceFormat, _out_channels: usize) -> bool {
        true
    }

    fn update(&mut self, _props: &EffectProps, _frequency: u32) {}

    fn process(&mut self, _frames: usize, _wet_in: &[f32], _out: &mut [Vec<f32>], _count: usize) {}
}

#[derive(Default)]
struct EchoState {
    line: Vec<f32>,
    pos: usize,
    feedback: f32,
    gain: f32,
}

impl EffectState for EchoState {
    fn device_update(&mut self, fmt: &DeviceFormat, _out_channels: usize) -> bool {
        // Line length is rebuilt from the committed delay on the next
        // update; size for the default here so process never indexes an
        // empty line.
        let len = ((EffectProps::default().delay * fmt.frequency as f32) as usize).max(1);
        self.line = vec![0.0; len];
        self.pos = 0;
        true
    }

    fn update(&mut self, props: &EffectProps, frequency: u32) {
        let len = ((props.delay * frequency as f32) as usize).max(1);
        if len != self.line.len() {
            self.line = vec![0.0; len];
            self.pos = 0;
        }
        self.feedback = props.feedback.clamp(0.0, 0.99);
        self.gain = props.gain;
    }

    fn process(&mut self, frames: usize, wet_in: &[f32], out: &mut [Vec<f32>], out_count: usize) {
        if self.line.is_empty() {
            return;
        }
        for i in 0..frames {
            let delayed = self.line[self.pos];
            self.line[self.pos] = wet_in[i] + delayed * self.feedback;
            self.pos = (self.pos + 1) % self.line.len();

            let sample = delayed * self.gain;
            for buf in out.iter_mut().take(out_count) {
                buf[i] += sample;
            }
        }
    }
}

#[derive(Default)]
struct ReverbState {
    lines: [Vec<f32>; 2],
    pos: [usize; 2],
    decay_gain: [f32; 2],
    damp: f32,
    filt: [f32; 2],
    gain: f32,
}

impl EffectState for ReverbState {
    fn device_update(&mut self, fmt: &DeviceFormat, _out_channels: usize) -> bool {
        let base = fmt.frequency as f32;
        self.lines = [
            vec![0.0; (base * 0.0297) as usize + 1],
            vec![0.0; (base * 0.0419) as usize + 1],
        ];
        self.pos = [0; 2];
        self.filt = [0.0; 2];
        true
    }

    fn update(&mut self, props: &EffectProps, frequency: u32) {
        // Feedback per line for a -60dB decay over decay_time.
        let t60 = props.decay_time.max(0.1);
        for (i, line) in self.lines.iter().enumerate() {
            let loop_secs = line.len() as f32 / frequency.max(1) as f32;
            self.decay_gain[i] = 0.001f32.powf(loop_secs / t60);
        }
        self.damp = props.damping.clamp(0.0, 1.0);
        self.gain = props.gain;
    }

    fn process(&mut self, frames: usize, wet_in: &[f32], out: &mut [Vec<f32>], out_count: usize) {
        if self.lines[0].is_empty() {
            return;
        }
        for i in 0..frames {
            let mut sample = 0.0;
            for l in 0..2 {
                let len = self.lines[l].len();
                let delayed = self.lines[l][self.pos[l]];
                self.filt[l] = delayed + self.damp * (self.filt[l] - delayed);
                self.lines[l][self.pos[l]] = wet_in[i] + self.filt[l] * self.decay_gain[l];
                self.pos[l] = (self.pos[l] + 1) % len;
                sample += delayed * 0.5;
            }
            let sample = sample * self.gain;
            for buf in out.iter_mut().take(out_count) {
                buf[i] += sample;
            }
        }
    }
}

/// Staged/committed properties of an effect slot.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectSlotProps {
    pub gain: f32,
    pub auxiliary_send_auto: bool,
    pub effect: EffectProps,
}

impl Default for EffectSlotProps {
    fn default() -> Self {
        Self {
            gain: 1.0,
            auxiliary_send_auto: true,
            effect: EffectProps::default(),
        }
    }
}

/// Mixer-side state of a slot: the DSP object, the committed property
/// image, the wet accumulation buffer, and the dry-bus binding.
pub(crate) struct SlotDsp {
    pub state: Box<dyn EffectState>,
    pub params: EffectSlotProps,
    pub wet: Vec<f32>,
    pub out_count: usize,
}

pub(crate) struct EffectSlotInner {
    pub id: u32,
    pub staged: Mutex<EffectSlotProps>,
    pub props_clean: AtomicBool,
    pub update: UpdateSlot<EffectSlotProps>,
    pub dsp: Mutex<SlotDsp>,
}

impl EffectSlotInner {
    pub fn new(id: u32) -> Arc<EffectSlotInner> {
        Arc::new(EffectSlotInner {
            id,
            staged: Mutex::new(EffectSlotProps::default()),
            props_clean: AtomicBool::new(true),
            update: UpdateSlot::new(),
            dsp: Mutex::new(SlotDsp {
                state: create_state(EffectKind::Null),
                params: EffectSlotProps::default(),
                wet: vec![0.0; crate::format::BUFFER_SIZE],
                out_count: 0,
            }),
        })
    }
}

impl std::fmt::Debug for EffectSlotInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectSlotInner").field("id", &self.id).finish()
    }
}

/// Handle to an auxiliary effect slot.
#[derive(Clone)]
pub struct EffectSlot {
    pub(crate) ctx: Context,
    pub(crate) inner: Arc<EffectSlotInner>,
}

impl EffectSlot {
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Load an effect into the slot, swapping the DSP state when the kind
    /// changes. Fails with `InvalidValue` for effects disabled by the
    /// `excludefx` config.
    pub fn set_effect(&self, effect: &EffectProps) -> Result<()> {
        self.ctx.verify()?;
        if crate::registry::engine().disabled_effects.contains(&effect.kind) {
            return Err(self.ctx.latch(AuricleError::InvalidValue(format!(
                "effect {:?} is disabled by configuration",
                effect.kind
            ))));
        }
        self.ctx.slot_set_effect(&self.inner, effect)
    }

    pub fn set_gain(&self, gain: f32) -> Result<()> {
        self.ctx.verify()?;
        if !(0.0..=1.0).contains(&gain) {
            return Err(self
                .ctx
                .latch(AuricleError::InvalidValue(format!("slot gain {}", gain))));
        }
        {
            let mut staged = self.inner.staged.lock().unwrap_or_else(|e| e.into_inner());
            staged.gain = gain;
        }
        self.ctx.mark_slot_dirty(&self.inner);
        Ok(())
    }

    pub fn set_send_auto(&self, auto: bool) -> Result<()> {
        self.ctx.verify()?;
        {
            let mut staged = self.inner.staged.lock().unwrap_or_else(|e| e.into_inner());
            staged.auxiliary_send_auto = auto;
        }
        self.ctx.mark_slot_dirty(&self.inner);
        Ok(())
    }

    pub fn props(&self) -> EffectSlotProps {
        self.inner
            .staged
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl std::fmt::Debug for EffectSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectSlot").field("id", &self.inner.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverb_presets_resolve() {
        let hall = reverb_preset("hall").unwrap();
        assert_eq!(hall.kind, EffectKind::Reverb);
        assert!(hall.decay_time > 3.0);
        assert!(reverb_preset("off").is_none());
        assert!(reverb_preset("no-such-preset").is_none());
    }

    #[test]
    fn echo_produces_delayed_output() {
        let fmt = DeviceFormat {
            frequency: 1000,
            ..DeviceFormat::default()
        };
        let mut state = EchoState::default();
        assert!(state.device_update(&fmt, 2));
        state.update(
            &EffectProps {
                kind: EffectKind::Echo,
                delay: 0.01,
                feedback: 0.0,
                gain: 1.0,
                ..EffectProps::default()
            },
            fmt.frequency,
        );

        let mut wet = vec![0.0f32; 64];
        wet[0] = 1.0;
        let mut out = vec![vec![0.0f32; 64]; 2];
        state.process(64, &wet, &mut out, 2);

        // The impulse surfaces after the 10-sample delay line.
        assert_eq!(out[0][0], 0.0);
        assert!(out[0][10] > 0.9);
        assert_eq!(out[0][10], out[1][10]);
    }
}
