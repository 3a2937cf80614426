//! PCM buffers referenced by sources.

use std::sync::Arc;

/// Immutable interleaved f32 PCM data. Sources hold a reference; the mixer
/// reads it on the real-time thread without copying.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Arc<AudioBuffer> {
        assert!(channels > 0, "audio data needs at least one channel");
        Arc::new(AudioBuffer {
            samples,
            channels,
            sample_rate,
        })
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Length in frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// One interleaved frame, or silence past the end.
    pub(crate) fn frame(&self, index: usize) -> &[f32] {
        let ch = self.channels as usize;
        let start = index * ch;
        if start + ch <= self.samples.len() {
            &self.samples[start..start + ch]
        } else {
            &[]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_count_interleaved_data() {
        let buf = AudioBuffer::new(vec![0.0; 96], 2, 48000);
        assert_eq!(buf.frames(), 48);
        assert_eq!(buf.frame(0).len(), 2);
        assert_eq!(buf.frame(48), &[] as &[f32]);
    }
}
