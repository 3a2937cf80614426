//! The mix tick.
//!
//! Runs on the backend's real-time thread (or the caller's thread for
//! loopback rendering), always with the device state lock held. Each tick
//! bumps the mix counter to odd, consumes pending property updates unless
//! a context is mid-publication, mixes every active voice and effect slot,
//! and bumps the counter back to even.

use crate::context::Context;
use crate::device::{DeviceInner, DeviceState, PostProcess};
use crate::events::{self, AsyncEvent};
use crate::format::BUFFER_SIZE;
use crate::source::SourceState;
use crate::voice::{Voice, FRACTION_BITS, FRACTION_ONE};
use std::sync::atomic::Ordering;

pub(crate) enum MixOut<'a> {
    /// Mix and advance state, discarding the rendered audio.
    Discard,
    F32(&'a mut [f32]),
    I16(&'a mut [i16]),
}

/// Render `frames` frames of device output.
pub(crate) fn mix_data(
    device: &DeviceInner,
    state: &mut DeviceState,
    mut out: MixOut,
    frames: usize,
) {
    let mut done = 0usize;
    while done < frames {
        let todo = (frames - done).min(BUFFER_SIZE);
        mix_chunk(device, state, &mut out, done, todo);
        done += todo;
    }
}

fn mix_chunk(
    device: &DeviceInner,
    state: &mut DeviceState,
    out: &mut MixOut,
    out_offset: usize,
    todo: usize,
) {
    device.mix_count.fetch_add(1, Ordering::Release);

    for channel in state.mix.buffer.iter_mut() {
        channel[..todo].fill(0.0);
    }

    {
        let contexts = device
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for ctx in contexts.iter() {
            mix_context(ctx, state, todo);
        }
    }

    fold_down(state, todo);

    // Limiter runs on the real output just before conversion.
    {
        let DeviceState { limiter, mix, .. } = &mut *state;
        if let Some(limiter) = limiter.as_mut() {
            let real = mix.real;
            limiter.process(&mut mix.buffer[real.offset..real.offset + real.count], todo);
        }
    }

    write_output(state, out, out_offset, todo);

    device
        .samples_done
        .fetch_add(todo as u32, Ordering::Relaxed);
    device.mix_count.fetch_add(1, Ordering::Release);
}

/// Consume one context's pending updates (unless held) and mix its
/// voices and effect slots.
fn mix_context(ctx: &Context, state: &mut DeviceState, todo: usize) {
    let inner = &ctx.inner;

    let mut voices = inner.voices.lock().unwrap_or_else(|e| e.into_inner());

    if !inner.hold_updates.load(Ordering::Acquire) {
        let mut applied = false;

        if let Some(block) = inner.update.take() {
            *inner.params.lock().unwrap_or_else(|e| e.into_inner()) = (*block).clone();
            inner.free_context_props.recycle(block);
            applied = true;
        }
        if let Some(block) = inner.listener.update.take() {
            *inner
                .listener
                .params
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = (*block).clone();
            inner.free_listener_props.recycle(block);
            applied = true;
        }

        let slots = inner
            .active_slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for slot in slots.iter() {
            if let Some(block) = slot.update.take() {
                let mut dsp = slot.dsp.lock().unwrap_or_else(|e| e.into_inner());
                dsp.params = (*block).clone();
                let props = dsp.params.effect.clone();
                dsp.state.update(&props, state.fmt.frequency);
                inner.free_slot_props.recycle(block);
                applied = true;
            }
        }

        let count = voices.voice_count();
        for voice in &mut voices.voices_mut()[..count] {
            if let Some(block) = voice.update.take() {
                voice.props = (*block).clone();
                inner.free_voice_props.recycle(block);
                applied = true;
            }
        }

        if applied {
            inner.commit_count.fetch_add(1, Ordering::Release);
        }
    }

    let listener_gain = inner
        .listener
        .params
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .gain;
    let ctx_params = inner.params.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let base_gain = listener_gain * inner.gain_boost;

    let count = voices.voice_count();
    for voice in &mut voices.voices_mut()[..count] {
        if voice.is_active() && voice.playing.load(Ordering::Acquire) {
            mix_voice(voice, state, &ctx_params, base_gain, todo, inner);
        }
    }
    drop(voices);

    // Effect slots take the freshly mixed dry bus as their wet input and
    // add their output back onto it.
    let slots = inner
        .active_slots
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    let boost = crate::registry::engine().reverb_boost;
    let dry = state.mix.dry;
    for slot in slots.iter() {
        let mut dsp = slot.dsp.lock().unwrap_or_else(|e| e.into_inner());
        let mut gain = dsp.params.gain;
        if dsp.params.effect.kind == crate::effect::EffectKind::Reverb {
            gain *= boost;
        }
        if gain <= 0.0 {
            continue;
        }

        dsp.wet.resize(BUFFER_SIZE, 0.0);
        let scale = gain / dry.count.max(1) as f32;
        for i in 0..todo {
            let mut sum = 0.0;
            for c in 0..dry.count {
                sum += state.mix.buffer[dry.offset + c][i];
            }
            dsp.wet[i] = sum * scale;
        }

        let crate::effect::SlotDsp {
            state: effect_state,
            wet,
            out_count,
            ..
        } = &mut *dsp;
        let out = &mut state.mix.buffer[dry.offset..dry.offset + dry.count];
        effect_state.process(todo, wet, out, (*out_count).min(dry.count));
    }
}

fn mix_voice(
    voice: &mut Voice,
    state: &mut DeviceState,
    ctx_params: &crate::context::ContextProps,
    base_gain: f32,
    todo: usize,
    ctx: &crate::context::ContextInner,
) {
    let Some(buffer) = voice.buffer.clone() else {
        voice.deactivate();
        return;
    };
    let total = buffer.frames();
    if total == 0 {
        finish_voice(voice, ctx);
        return;
    }

    let props = &voice.props;
    let gain = props.gain * base_gain * distance_gain(props, ctx_params);

    // Fixed-point resampling step for this tick's pitch.
    let ratio = props.pitch as f64 * buffer.sample_rate() as f64 / state.fmt.frequency as f64;
    voice.step = ((ratio * FRACTION_ONE as f64) as u32).clamp(1, 255 * FRACTION_ONE);

    let mut pos = voice.position.load(Ordering::Relaxed);
    let mut frac = voice.position_frac.load(Ordering::Relaxed);
    let dry = state.mix.dry;
    let src_channels = buffer.channels() as usize;
    let mut finished = false;

    for i in 0..todo {
        if pos >= total {
            if props.looping {
                pos %= total;
                events::post(
                    &ctx.events_tx,
                    AsyncEvent::BufferCompleted {
                        source: voice.source_id.load(Ordering::Relaxed),
                    },
                );
            } else {
                finished = true;
                break;
            }
        }

        let frame = buffer.frame(pos);
        let next = if pos + 1 < total {
            buffer.frame(pos + 1)
        } else if props.looping {
            buffer.frame(0)
        } else {
            frame
        };
        let t = match voice.resampler {
            crate::voice::Resampler::Point => 0.0,
            crate::voice::Resampler::Linear => frac as f32 / FRACTION_ONE as f32,
        };

        for c in 0..dry.count {
            let sc = c % src_channels;
            let s0 = frame.get(sc).copied().unwrap_or(0.0);
            let s1 = next.get(sc).copied().unwrap_or(s0);
            let sample = s0 + (s1 - s0) * t;
            let spread = if src_channels == 1 { 0.707_106_77 } else { 1.0 };
            state.mix.buffer[dry.offset + c][i] += sample * spread * gain;
        }

        frac += voice.step;
        pos += (frac >> FRACTION_BITS) as usize;
        frac &= FRACTION_ONE - 1;
    }

    voice.position.store(pos, Ordering::Relaxed);
    voice.position_frac.store(frac, Ordering::Relaxed);
    voice.offset = voice.offset.wrapping_add(todo as u64);
    if let Some(last) = buffer.frame(pos.min(total - 1)).first() {
        voice.prev_samples.rotate_right(1);
        voice.prev_samples[0] = *last;
    }

    if finished {
        finish_voice(voice, ctx);
    }
}

/// A voice that ran out of data stops here, on the mixer thread; the
/// owning source observes the unbind on its next state read.
fn finish_voice(voice: &mut Voice, ctx: &crate::context::ContextInner) {
    let source = voice.source_id.load(Ordering::Relaxed);
    voice.deactivate();
    events::post(&ctx.events_tx, AsyncEvent::BufferCompleted { source });
    events::post(
        &ctx.events_tx,
        AsyncEvent::SourceStateChanged {
            source,
            state: SourceState::Stopped,
        },
    );
}

fn distance_gain(
    props: &crate::voice::VoiceProps,
    ctx_params: &crate::context::ContextProps,
) -> f32 {
    use crate::context::DistanceModel;

    if props.relative {
        return 1.0;
    }
    let distance = props.position.length();
    match ctx_params.distance_model {
        DistanceModel::None => 1.0,
        DistanceModel::Inverse | DistanceModel::InverseClamped => {
            let reference = 1.0f32;
            let clamped = distance.max(reference);
            reference / (reference + (clamped - reference))
        }
        DistanceModel::Linear | DistanceModel::LinearClamped => {
            (1.0 - (distance / 100.0)).clamp(0.0, 1.0)
        }
        DistanceModel::Exponent | DistanceModel::ExponentClamped => {
            let clamped = distance.max(1.0);
            1.0 / clamped
        }
    }
}

/// Collapse the dry bus into the real output when they are separate
/// (binaural and matrixed stereo modes).
fn fold_down(state: &mut DeviceState, todo: usize) {
    let dry = state.mix.dry;
    let real = state.mix.real;
    if real == dry {
        return;
    }

    match state.post_process {
        PostProcess::Hrtf => {
            // First-order bus to binaural stereo: W +/- a share of Y.
            for i in 0..todo {
                let w = state.mix.buffer[dry.offset][i];
                let y = if dry.count > 1 {
                    state.mix.buffer[dry.offset + 1][i]
                } else {
                    0.0
                };
                state.mix.buffer[real.offset][i] = w + 0.5 * y;
                if real.count > 1 {
                    state.mix.buffer[real.offset + 1][i] = w - 0.5 * y;
                }
            }
        }
        _ => {
            for c in 0..real.count {
                let src = dry.offset + c.min(dry.count.saturating_sub(1));
                for i in 0..todo {
                    state.mix.buffer[real.offset + c][i] = state.mix.buffer[src][i];
                }
            }
        }
    }
}

fn write_output(state: &mut DeviceState, out: &mut MixOut, out_offset: usize, todo: usize) {
    let real = state.mix.real;
    let channels = real.count;

    match out {
        MixOut::Discard => {}
        MixOut::F32(buf) => {
            let start = out_offset * channels;
            for i in 0..todo {
                for c in 0..channels {
                    let idx = start + i * channels + c;
                    if idx < buf.len() {
                        buf[idx] = state.mix.buffer[real.offset + c][i];
                    }
                }
            }
        }
        MixOut::I16(buf) => {
            let start = out_offset * channels;
            let dither = state.dither_depth;
            for i in 0..todo {
                for c in 0..channels {
                    let idx = start + i * channels + c;
                    if idx >= buf.len() {
                        continue;
                    }
                    let mut sample = state.mix.buffer[real.offset + c][i] * 32768.0;
                    if dither > 0.0 {
                        // TPDF noise sized to the configured dither depth.
                        let r1 = next_rand(&mut state.dither_seed);
                        let r2 = next_rand(&mut state.dither_seed);
                        sample += (r1 - r2) * 32768.0 / dither;
                    }
                    buf[idx] = sample.round().clamp(-32768.0, 32767.0) as i16;
                }
            }
        }
    }
}

fn next_rand(seed: &mut u32) -> f32 {
    *seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
    (*seed >> 8) as f32 / (1 << 24) as f32
}
