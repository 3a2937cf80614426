//! The wave-file backend: mixes on a timer and writes the output to a WAV
//! file named by the `[wave] file` config key.

use super::{Backend, BackendFactory, BackendKind};
use crate::device::DeviceInner;
use crate::error::{AuricleError, Result};
use crate::format::{DeviceFormat, SampleType};
use crate::mixer::MixOut;
use hound::{SampleFormat, WavSpec, WavWriter};
use log::{debug, error};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) const DEVICE_NAME: &str = "Wave File Writer";

pub(crate) struct WaveFactory;

impl BackendFactory for WaveFactory {
    fn init(&self) -> bool {
        // Only usable when an output file is configured.
        crate::registry::raw_config()
            .value_str(None, "wave/file")
            .is_some()
    }

    fn supports(&self, kind: BackendKind) -> bool {
        kind == BackendKind::Playback
    }

    fn probe(&self, kind: BackendKind) -> Vec<String> {
        match kind {
            BackendKind::Playback => vec![DEVICE_NAME.to_string()],
            BackendKind::Capture => Vec::new(),
        }
    }

    fn create(&self, device: Weak<DeviceInner>, kind: BackendKind) -> Option<Box<dyn Backend>> {
        if kind != BackendKind::Playback {
            return None;
        }
        Some(Box::new(WaveBackend {
            device,
            path: None,
            run: Arc::new(AtomicBool::new(false)),
            thread: None,
            fmt: DeviceFormat::default(),
        }))
    }
}

struct WaveBackend {
    device: Weak<DeviceInner>,
    path: Option<PathBuf>,
    run: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    fmt: DeviceFormat,
}

impl Backend for WaveBackend {
    fn open(&mut self, name: Option<&str>) -> Result<String> {
        if let Some(n) = name {
            if n != DEVICE_NAME {
                return Err(AuricleError::InvalidValue(format!(
                    "unknown wave device \"{}\"",
                    n
                )));
            }
        }
        let path = crate::registry::raw_config()
            .value_str(None, "wave/file")
            .ok_or_else(|| {
                AuricleError::Configuration("no wave output file configured".into())
            })?;
        self.path = Some(PathBuf::from(path));
        Ok(DEVICE_NAME.to_string())
    }

    fn reset(&mut self, fmt: &mut DeviceFormat) -> bool {
        // WAV stores 16-bit PCM or 32-bit float here; coerce anything else
        // and let the caller clear the unhonoured request flag.
        fmt.sample_type = if fmt.sample_type.is_integer() {
            SampleType::I16
        } else {
            SampleType::F32
        };
        self.fmt = fmt.clone();
        true
    }

    fn start(&mut self) -> bool {
        if self.thread.is_some() {
            return true;
        }
        let Some(path) = self.path.clone() else {
            return false;
        };

        let spec = WavSpec {
            channels: self.fmt.channel_count() as u16,
            sample_rate: self.fmt.frequency,
            bits_per_sample: match self.fmt.sample_type {
                SampleType::I16 => 16,
                _ => 32,
            },
            sample_format: match self.fmt.sample_type {
                SampleType::I16 => SampleFormat::Int,
                _ => SampleFormat::Float,
            },
        };
        let mut writer = match WavWriter::create(&path, spec) {
            Ok(w) => w,
            Err(e) => {
                error!("Failed to create wave file {:?}: {}", path, e);
                return false;
            }
        };

        self.run.store(true, Ordering::Release);
        let run = self.run.clone();
        let device = self.device.clone();
        let frames = self.fmt.update_size as usize;
        let channels = self.fmt.channel_count();
        let float_out = spec.sample_format == SampleFormat::Float;
        let interval = Duration::from_secs_f64(self.fmt.update_size as f64 / self.fmt.frequency as f64);

        let thread = std::thread::Builder::new()
            .name("auricle-wave".into())
            .spawn(move || {
                debug!("Wave writer started: {:?}", spec);
                let mut f32_buf = vec![0.0f32; frames * channels];
                let mut i16_buf = vec![0i16; frames * channels];
                loop {
                    std::thread::sleep(interval);
                    if !run.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(dev) = device.upgrade() else {
                        break;
                    };
                    let Ok(mut state) = dev.state.try_lock() else {
                        continue;
                    };
                    if float_out {
                        crate::mixer::mix_data(&dev, &mut state, MixOut::F32(&mut f32_buf), frames);
                        drop(state);
                        for &s in &f32_buf {
                            let _ = writer.write_sample(s);
                        }
                    } else {
                        crate::mixer::mix_data(&dev, &mut state, MixOut::I16(&mut i16_buf), frames);
                        drop(state);
                        for &s in &i16_buf {
                            let _ = writer.write_sample(s);
                        }
                    }
                }
                if let Err(e) = writer.finalize() {
                    error!("Failed to finalize wave file: {}", e);
                }
                debug!("Wave writer stopped");
            });

        match thread {
            Ok(handle) => {
                self.thread = Some(handle);
                true
            }
            Err(e) => {
                error!("Failed to spawn wave writer thread: {}", e);
                self.run.store(false, Ordering::Release);
                false
            }
        }
    }

    fn stop(&mut self) {
        self.run.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WaveBackend {
    fn drop(&mut self) {
        self.stop();
    }
}
