//! The loopback backend: no thread, no OS device. The application drives
//! mixing itself through `Device::render_samples`.

use super::{Backend, BackendFactory, BackendKind};
use crate::device::DeviceInner;
use crate::error::Result;
use crate::format::DeviceFormat;
use std::sync::Weak;

pub(crate) const DEVICE_NAME: &str = "Loopback";

pub(crate) struct LoopbackFactory;

impl BackendFactory for LoopbackFactory {
    fn supports(&self, kind: BackendKind) -> bool {
        kind == BackendKind::Playback
    }

    fn probe(&self, _kind: BackendKind) -> Vec<String> {
        Vec::new()
    }

    fn create(&self, _device: Weak<DeviceInner>, kind: BackendKind) -> Option<Box<dyn Backend>> {
        (kind == BackendKind::Playback).then(|| Box::new(LoopbackBackend) as Box<dyn Backend>)
    }
}

struct LoopbackBackend;

impl Backend for LoopbackBackend {
    fn open(&mut self, _name: Option<&str>) -> Result<String> {
        Ok(DEVICE_NAME.to_string())
    }

    fn reset(&mut self, _fmt: &mut DeviceFormat) -> bool {
        // The application chose the render format; everything is honoured.
        true
    }

    fn start(&mut self) -> bool {
        true
    }

    fn stop(&mut self) {}
}
