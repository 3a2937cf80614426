//! Single-band output limiter.
//!
//! Prevents clipping on integer output formats. The device creates one
//! compressor per reset targeting a threshold just under full scale; its
//! look-ahead contributes to the device's fixed latency.

/// A one-band look-ahead compressor with an infinite ratio above threshold.
#[derive(Debug)]
pub struct Compressor {
    channels: usize,
    threshold: f32,
    attack_coeff: f32,
    release_coeff: f32,
    look_ahead: u32,
    envelope: f32,
    delay: Vec<Vec<f32>>,
    delay_pos: usize,
}

impl Compressor {
    /// `threshold_db` is the ceiling in dBFS (typically slightly negative).
    pub fn new(channels: usize, sample_rate: u32, threshold_db: f32) -> Compressor {
        let attack = 0.001f32;
        let release = 0.200f32;
        let look_ahead = (sample_rate as f32 * 0.002) as u32;

        Compressor {
            channels,
            threshold: 10.0f32.powf(threshold_db / 20.0),
            attack_coeff: (-1.0 / (attack * sample_rate as f32)).exp(),
            release_coeff: (-1.0 / (release * sample_rate as f32)).exp(),
            look_ahead,
            envelope: 0.0,
            delay: vec![vec![0.0; look_ahead as usize]; channels],
            delay_pos: 0,
        }
    }

    /// Look-ahead depth in samples; adds to the device's fixed latency.
    pub fn look_ahead(&self) -> u32 {
        self.look_ahead
    }

    /// Process `frames` frames in place. `bufs` holds one buffer per
    /// channel; only the first `self.channels` buffers are touched.
    pub fn process(&mut self, bufs: &mut [Vec<f32>], frames: usize) {
        let channels = self.channels.min(bufs.len());
        if channels == 0 || self.look_ahead == 0 {
            return;
        }
        let depth = self.look_ahead as usize;

        for i in 0..frames {
            // Peak across channels at the incoming edge.
            let mut peak = 0.0f32;
            for buf in bufs.iter().take(channels) {
                peak = peak.max(buf[i].abs());
            }

            let coeff = if peak > self.envelope {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope = peak + coeff * (self.envelope - peak);

            let gain = if self.envelope > self.threshold {
                self.threshold / self.envelope
            } else {
                1.0
            };

            // Delay each channel by the look-ahead and apply the gain that
            // the newest sample computed, so reductions land before peaks.
            for (c, buf) in bufs.iter_mut().take(channels).enumerate() {
                let delayed = self.delay[c][self.delay_pos];
                self.delay[c][self.delay_pos] = buf[i];
                buf[i] = delayed * gain;
            }
            self.delay_pos = (self.delay_pos + 1) % depth;
        }
    }
}

/// The limiter threshold for a device: full scale minus one LSB of the
/// output sample type, minus one dither step when dithering is active.
/// Returned in dBFS for `Compressor::new`.
pub fn device_threshold_db(sample_type: crate::format::SampleType, dither_depth: f32) -> f32 {
    use crate::format::SampleType;

    let mut threshold = match sample_type {
        SampleType::I8 | SampleType::U8 => 127.0 / 128.0,
        SampleType::I16 | SampleType::U16 => 32767.0 / 32768.0,
        _ => 1.0,
    };
    if dither_depth > 0.0 {
        threshold -= 1.0 / dither_depth;
    }
    threshold.log10() * 20.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleType;

    #[test]
    fn threshold_accounts_for_lsb_and_dither() {
        let t16 = device_threshold_db(SampleType::I16, 0.0);
        assert!(t16 < 0.0 && t16 > -0.01);

        let t8 = device_threshold_db(SampleType::U8, 128.0);
        let expected = ((127.0f32 / 128.0) - (1.0 / 128.0)).log10() * 20.0;
        assert!((t8 - expected).abs() < 1e-5);

        assert_eq!(device_threshold_db(SampleType::F32, 0.0), 0.0);
    }

    #[test]
    fn limits_sustained_overs() {
        let sample_rate = 8000;
        let mut comp = Compressor::new(1, sample_rate, -0.1);
        let mut bufs = vec![vec![2.0f32; 1024]];

        // Run a few blocks so the envelope settles.
        for _ in 0..4 {
            comp.process(&mut bufs, 1024);
            bufs[0].fill(2.0);
        }
        comp.process(&mut bufs, 1024);

        let tail = &bufs[0][512..];
        assert!(tail.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn look_ahead_scales_with_rate() {
        assert_eq!(Compressor::new(2, 48000, 0.0).look_ahead(), 96);
        assert_eq!(Compressor::new(2, 8000, 0.0).look_ahead(), 16);
    }
}
