//! The null backend: a timer-paced mixer with no output anywhere.

use super::{Backend, BackendFactory, BackendKind};
use crate::device::DeviceInner;
use crate::error::{AuricleError, Result};
use crate::format::DeviceFormat;
use crate::mixer::MixOut;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) const DEVICE_NAME: &str = "No Output";

pub(crate) struct NullFactory;

impl BackendFactory for NullFactory {
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
        Some(Box::new(NullBackend {
            device,
            run: Arc::new(AtomicBool::new(false)),
            thread: None,
            frequency: crate::format::DEFAULT_OUTPUT_RATE,
            update_size: crate::format::DEFAULT_UPDATE_SIZE,
        }))
    }
}

struct NullBackend {
    device: Weak<DeviceInner>,
    run: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    frequency: u32,
    update_size: u32,
}

impl Backend for NullBackend {
    fn open(&mut self, name: Option<&str>) -> Result<String> {
        match name {
            None => Ok(DEVICE_NAME.to_string()),
            Some(n) if n == DEVICE_NAME => Ok(DEVICE_NAME.to_string()),
            Some(other) => Err(AuricleError::InvalidValue(format!(
                "unknown null device \"{}\"",
                other
            ))),
        }
    }

    fn reset(&mut self, fmt: &mut DeviceFormat) -> bool {
        // Test hook: force a negotiation failure.
        if std::env::var("AURICLE_NULL_FAIL_RESET").is_ok_and(|v| v == "1") {
            return false;
        }
        // Every request is honoured; cache the tick shape for the pacer.
        self.frequency = fmt.frequency;
        self.update_size = fmt.update_size;
        true
    }

    fn start(&mut self) -> bool {
        if self.thread.is_some() {
            return true;
        }
        self.run.store(true, Ordering::Release);

        let rt_prio = crate::registry::engine().rt_prio;
        if rt_prio != 0 {
            debug!("rt-prio {} requested; not applied to the null mixer", rt_prio);
        }

        let run = self.run.clone();
        let device = self.device.clone();
        let frames = self.update_size as usize;
        let interval = Duration::from_secs_f64(self.update_size as f64 / self.frequency as f64);

        let thread = std::thread::Builder::new()
            .name("auricle-mixer".into())
            .spawn(move || {
                debug!("Null mixer started: {} frame ticks", frames);
                loop {
                    std::thread::sleep(interval);
                    if !run.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(dev) = device.upgrade() else {
                        break;
                    };
                    // Contended state means a caller is reconfiguring; skip
                    // the tick rather than wait.
                    if let Ok(mut state) = dev.state.try_lock() {
                        crate::mixer::mix_data(&dev, &mut state, MixOut::Discard, frames);
                    };
                }
                debug!("Null mixer stopped");
            });

        match thread {
            Ok(handle) => {
                self.thread = Some(handle);
                true
            }
            Err(e) => {
                log::error!("Failed to spawn null mixer thread: {}", e);
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

impl Drop for NullBackend {
    fn drop(&mut self) {
        self.stop();
    }
}
