//! Mixer-side playback voices and the voice pool.
//!
//! A source in the playing state is bound to exactly one voice. The pool is
//! resized only under the device state lock with the backend stopped;
//! resizing preserves every field of voices whose source id is non-zero so
//! playback continues seamlessly across a device reset.

use crate::buffer::AudioBuffer;
use crate::math::Vec3;
use crate::props::UpdateSlot;
use crate::source::SendParams;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Fixed-point fraction bits for the resampling position.
pub(crate) const FRACTION_BITS: u32 = 12;
pub(crate) const FRACTION_ONE: u32 = 1 << FRACTION_BITS;

/// History samples kept across chunk boundaries for interpolation.
pub(crate) const PREV_SAMPLES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampler {
    Point,
    #[default]
    Linear,
}

/// Per-voice direct-path parameters.
#[derive(Debug, Clone, Default)]
pub(crate) struct DirectParams {
    /// Gain per output channel of the dry bus.
    pub gains: Vec<f32>,
    /// Near-field compensation filter coefficient; 0 disables the filter.
    pub nfc_w1: f32,
}

/// The property image a voice mixes with. Published from the owning
/// source's staged properties through the update slot, applied by the
/// mixer at a tick boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceProps {
    pub gain: f32,
    pub pitch: f32,
    pub position: Vec3,
    pub velocity: Vec3,
    pub direction: Vec3,
    pub relative: bool,
    pub looping: bool,
    pub sends: Vec<SendParams>,
}

impl Default for VoiceProps {
    fn default() -> Self {
        Self {
            gain: 1.0,
            pitch: 1.0,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            direction: Vec3::ZERO,
            relative: false,
            looping: false,
            sends: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Voice {
    /// Owning source id; 0 marks the voice free.
    pub source_id: AtomicU32,
    pub playing: AtomicBool,
    /// Playback cursor in frames, plus the fixed-point fraction.
    pub position: AtomicUsize,
    pub position_frac: AtomicU32,
    /// Buffer-queue cursors. With single-buffer sources these stay at the
    /// queue head but survive pool reallocation like everything else.
    pub current_buffer: AtomicUsize,
    pub loop_buffer: AtomicUsize,
    pub update: UpdateSlot<VoiceProps>,
    /// Committed image, touched only by the mixer.
    pub props: VoiceProps,
    pub buffer: Option<Arc<AudioBuffer>>,
    pub num_channels: usize,
    pub sample_size: usize,
    /// Fixed-point resampling increment per output frame.
    pub step: u32,
    pub resampler: Resampler,
    pub flags: u32,
    pub offset: u64,
    pub prev_samples: [f32; PREV_SAMPLES],
    pub resample_state: f32,
    pub direct: DirectParams,
    /// Wet-path parameters, one per auxiliary send.
    pub sends: Vec<SendParams>,
}

impl Voice {
    pub fn new(num_sends: usize) -> Voice {
        let mut props = VoiceProps::default();
        props.sends = vec![SendParams::default(); num_sends];
        Voice {
            source_id: AtomicU32::new(0),
            playing: AtomicBool::new(false),
            position: AtomicUsize::new(0),
            position_frac: AtomicU32::new(0),
            current_buffer: AtomicUsize::new(0),
            loop_buffer: AtomicUsize::new(0),
            update: UpdateSlot::new(),
            props,
            buffer: None,
            num_channels: 0,
            sample_size: 0,
            step: FRACTION_ONE,
            resampler: Resampler::default(),
            flags: 0,
            offset: 0,
            prev_samples: [0.0; PREV_SAMPLES],
            resample_state: 0.0,
            direct: DirectParams::default(),
            sends: vec![SendParams::default(); num_sends],
        }
    }

    /// Build a replacement voice in a new pool, carrying over the old
    /// voice's state. The pending update transfers (the old slot is left
    /// empty) and send storage beyond the carried count is defaulted.
    fn carry(old: &Voice, old_sends: usize, new_sends: usize) -> Voice {
        let mut voice = Voice::new(new_sends);
        let keep = old_sends.min(new_sends);

        if let Some(pending) = old.update.take() {
            voice.update.publish(pending);
        }

        voice
            .source_id
            .store(old.source_id.load(Ordering::Relaxed), Ordering::Relaxed);
        voice
            .playing
            .store(old.playing.load(Ordering::Relaxed), Ordering::Relaxed);
        voice
            .position
            .store(old.position.load(Ordering::Relaxed), Ordering::Relaxed);
        voice
            .position_frac
            .store(old.position_frac.load(Ordering::Relaxed), Ordering::Relaxed);
        voice.current_buffer.store(
            old.current_buffer.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        voice
            .loop_buffer
            .store(old.loop_buffer.load(Ordering::Relaxed), Ordering::Relaxed);

        voice.props = old.props.clone();
        voice.props.sends.truncate(keep);
        voice
            .props
            .sends
            .resize_with(new_sends, SendParams::default);

        voice.buffer = old.buffer.clone();
        voice.num_channels = old.num_channels;
        voice.sample_size = old.sample_size;
        voice.step = old.step;
        voice.resampler = old.resampler;
        voice.flags = old.flags;
        voice.offset = old.offset;
        voice.prev_samples = old.prev_samples;
        voice.resample_state = old.resample_state;
        voice.direct = old.direct.clone();

        voice.sends[..keep].clone_from_slice(&old.sends[..keep]);

        voice
    }

    pub fn is_active(&self) -> bool {
        self.source_id.load(Ordering::Acquire) != 0
    }

    /// Unbind the voice from its source and clear any pending update.
    pub fn deactivate(&self) {
        self.playing.store(false, Ordering::Relaxed);
        self.source_id.store(0, Ordering::Release);
        drop(self.update.take());
    }
}

#[derive(Debug)]
pub(crate) struct VoicePool {
    voices: Vec<Voice>,
    num_sends: usize,
    /// Live high-water mark; voices past this index have never been used.
    voice_count: usize,
}

impl VoicePool {
    pub fn new(max_voices: usize, num_sends: usize) -> VoicePool {
        VoicePool {
            voices: (0..max_voices).map(|_| Voice::new(num_sends)).collect(),
            num_sends,
            voice_count: 0,
        }
    }

    pub fn num_sends(&self) -> usize {
        self.num_sends
    }

    pub fn max_voices(&self) -> usize {
        self.voices.len()
    }

    pub fn voice_count(&self) -> usize {
        self.voice_count
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn voices_mut(&mut self) -> &mut [Voice] {
        &mut self.voices
    }

    /// Resize the pool for a new voice count and send width, preserving
    /// active voices. Must run with the backend stopped.
    pub fn reallocate(&mut self, max_voices: usize, new_sends: usize) {
        if max_voices == self.voices.len() && new_sends == self.num_sends {
            return;
        }

        let carry_count = self.voice_count.min(max_voices);
        let mut voices: Vec<Voice> = Vec::with_capacity(max_voices);
        for old in &self.voices[..carry_count] {
            voices.push(Voice::carry(old, self.num_sends, new_sends));
        }
        while voices.len() < max_voices {
            voices.push(Voice::new(new_sends));
        }

        // Old voices deinit here: buffer references and any update block
        // not already transferred are released.
        self.voices = voices;
        self.num_sends = new_sends;
        self.voice_count = self.voice_count.min(max_voices);
    }

    /// Claim a free voice, growing the live count as needed.
    pub fn find_free(&mut self) -> Option<&mut Voice> {
        let idx = self
            .voices
            .iter()
            .position(|v| v.source_id.load(Ordering::Acquire) == 0)?;
        self.voice_count = self.voice_count.max(idx + 1);
        Some(&mut self.voices[idx])
    }

    pub fn find_by_source(&mut self, source_id: u32) -> Option<&mut Voice> {
        self.voices
            .iter_mut()
            .take(self.voice_count)
            .find(|v| v.source_id.load(Ordering::Acquire) == source_id)
    }

    pub fn source_is_bound(&self, source_id: u32) -> bool {
        self.voices
            .iter()
            .take(self.voice_count)
            .any(|v| v.source_id.load(Ordering::Acquire) == source_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activate(pool: &mut VoicePool, source_id: u32, position: usize) {
        let voice = pool.find_free().unwrap();
        voice.source_id.store(source_id, Ordering::Relaxed);
        voice.playing.store(true, Ordering::Relaxed);
        voice.position.store(position, Ordering::Relaxed);
        voice.props.gain = 0.25;
    }

    #[test]
    fn reallocate_preserves_active_voices() {
        let mut pool = VoicePool::new(256, 2);
        activate(&mut pool, 41, 1000);
        activate(&mut pool, 42, 2000);
        pool.voices_mut()[0].sends[0].gain = 0.5;

        pool.reallocate(256, 4);

        assert_eq!(pool.num_sends(), 4);
        let v0 = &pool.voices()[0];
        assert_eq!(v0.source_id.load(Ordering::Relaxed), 41);
        assert_eq!(v0.position.load(Ordering::Relaxed), 1000);
        assert_eq!(v0.props.gain, 0.25);
        assert_eq!(v0.sends.len(), 4);
        assert_eq!(v0.sends[0].gain, 0.5);
        // Send slots past the carried width are default-initialized.
        assert_eq!(v0.sends[2], SendParams::default());
        assert_eq!(v0.sends[3], SendParams::default());
        assert_eq!(v0.props.sends.len(), 4);
        assert_eq!(v0.props.sends[3], SendParams::default());

        let v1 = &pool.voices()[1];
        assert_eq!(v1.source_id.load(Ordering::Relaxed), 42);
        assert_eq!(v1.position.load(Ordering::Relaxed), 2000);
    }

    #[test]
    fn reallocate_transfers_pending_updates() {
        let mut pool = VoicePool::new(8, 2);
        activate(&mut pool, 7, 0);
        let mut props = VoiceProps::default();
        props.gain = 0.75;
        pool.voices_mut()[0].update.publish(Box::new(props));

        pool.reallocate(8, 4);

        let pending = pool.voices()[0].update.take().unwrap();
        assert_eq!(pending.gain, 0.75);
    }

    #[test]
    fn shrink_clamps_live_count() {
        let mut pool = VoicePool::new(8, 2);
        for id in 1..=6 {
            activate(&mut pool, id, 0);
        }
        assert_eq!(pool.voice_count(), 6);

        pool.reallocate(4, 2);
        assert_eq!(pool.max_voices(), 4);
        assert_eq!(pool.voice_count(), 4);
        assert!(pool.source_is_bound(4));
        assert!(!pool.source_is_bound(5));
    }

    #[test]
    fn same_shape_reallocate_is_a_no_op() {
        let mut pool = VoicePool::new(16, 2);
        activate(&mut pool, 9, 123);
        pool.reallocate(16, 2);
        assert_eq!(pool.voices()[0].source_id.load(Ordering::Relaxed), 9);
        assert_eq!(pool.voices()[0].position.load(Ordering::Relaxed), 123);
    }
}
