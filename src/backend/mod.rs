//! Pluggable audio backend abstraction.
//!
//! A backend owns the OS-facing half of a device: it negotiates the final
//! output format on `reset`, and while started it drives the mix callback
//! (or, for capture, fills the sample ring). The compile-time table lists
//! playback/capture backends in preference order; the `drivers`
//! config/environment list can reorder or remove entries at first use.
//! Loopback is not listed; loopback devices are opened explicitly.

pub mod cpal_backend;
pub mod loopback;
pub mod null;
pub mod wave;

use crate::device::DeviceInner;
use crate::error::{AuricleError, Result};
use crate::format::DeviceFormat;
use std::sync::Weak;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Playback,
    Capture,
}

/// One backend instance, owned by its device.
pub(crate) trait Backend: Send {
    /// Open the named OS device (or the default), returning the resolved
    /// device name.
    fn open(&mut self, name: Option<&str>) -> Result<String>;

    /// Negotiate the device format. The backend may rewrite fields it
    /// cannot honour; returning false fails the reset entirely.
    fn reset(&mut self, fmt: &mut DeviceFormat) -> bool;

    fn start(&mut self) -> bool;

    /// Synchronous stop; the mix callback has ceased when this returns.
    fn stop(&mut self);

    /// Capture only: frames ready to read.
    fn available_samples(&mut self) -> usize {
        0
    }

    /// Capture only: pop `out.len() / channels` frames of interleaved f32.
    fn capture_samples(&mut self, _out: &mut [f32]) -> Result<()> {
        Err(AuricleError::InvalidValue("not a capture backend".into()))
    }
}

/// Constructor-side of a backend. The global table stores factories, not
/// instances.
pub(crate) trait BackendFactory: Send + Sync {
    fn init(&self) -> bool {
        true
    }

    fn supports(&self, kind: BackendKind) -> bool;

    fn probe(&self, kind: BackendKind) -> Vec<String>;

    fn create(&self, device: Weak<DeviceInner>, kind: BackendKind) -> Option<Box<dyn Backend>>;
}

#[derive(Clone, Copy)]
pub(crate) struct BackendEntry {
    pub name: &'static str,
    pub factory: &'static (dyn BackendFactory + 'static),
}

/// Compile-time backend table, in default preference order.
pub(crate) fn backend_table() -> Vec<BackendEntry> {
    vec![
        BackendEntry {
            name: "cpal",
            factory: &cpal_backend::CpalFactory,
        },
        BackendEntry {
            name: "wave",
            factory: &wave::WaveFactory,
        },
        BackendEntry {
            name: "null",
            factory: &null::NullFactory,
        },
    ]
}

pub(crate) fn loopback_factory() -> &'static (dyn BackendFactory + 'static) {
    &loopback::LoopbackFactory
}

/// Apply a `drivers` list to the table. Entries named in the list move to
/// the front in list order; a `-name` entry deletes that backend; unless
/// the list ends with a trailing comma, backends it never mentions are
/// dropped.
pub(crate) fn apply_driver_list(table: &mut Vec<BackendEntry>, list: &str) {
    let mut kept = 0usize;
    let mut endlist = true;

    for item in list.split(',') {
        let item = item.trim();
        if item.is_empty() {
            endlist = false;
            continue;
        }
        endlist = true;

        let (delete, name) = match item.strip_prefix('-') {
            Some(rest) => (true, rest.trim()),
            None => (false, item),
        };

        let found = table[kept..].iter().position(|e| e.name == name);
        let Some(offset) = found else {
            continue;
        };

        if delete {
            table.remove(kept + offset);
        } else {
            let entry = table.remove(kept + offset);
            table.insert(kept, entry);
            kept += 1;
        }
    }

    if endlist {
        table.truncate(kept);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(table: &[BackendEntry]) -> Vec<&'static str> {
        table.iter().map(|e| e.name).collect()
    }

    #[test]
    fn driver_list_reorders_and_truncates() {
        let mut table = backend_table();
        apply_driver_list(&mut table, "null");
        assert_eq!(names(&table), ["null"]);
    }

    #[test]
    fn trailing_comma_keeps_the_tail() {
        let mut table = backend_table();
        apply_driver_list(&mut table, "null,");
        assert_eq!(names(&table), ["null", "cpal", "wave"]);
    }

    #[test]
    fn minus_prefix_removes_entries() {
        let mut table = backend_table();
        apply_driver_list(&mut table, "-wave,");
        assert_eq!(names(&table), ["cpal", "null"]);
    }

    #[test]
    fn unknown_names_are_ignored() {
        let mut table = backend_table();
        apply_driver_list(&mut table, "pulse,null,");
        assert_eq!(names(&table), ["null", "cpal", "wave"]);
    }

    #[test]
    fn empty_list_changes_nothing() {
        let mut table = backend_table();
        apply_driver_list(&mut table, "");
        assert_eq!(names(&table), ["cpal", "wave", "null"]);
    }
}
