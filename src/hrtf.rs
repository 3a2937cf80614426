//! HRTF enumeration and loading.
//!
//! The engine core only negotiates HRTF state: enumerate what is available,
//! load a data set, and force the device format to the set's native rate.
//! The convolution itself happens behind the renderer interface.

use crate::config::Config;
use crate::error::{AuricleError, Result};
use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;

const FILE_MAGIC: &[u8; 8] = b"AURHRTF\0";

/// One entry of the enumerated HRTF list, as reported to applications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HrtfEntry {
    pub name: String,
    /// `None` for the built-in data set.
    pub path: Option<PathBuf>,
}

/// A loaded HRTF data set. Devices using it render binaurally to stereo at
/// the set's native sample rate.
#[derive(Debug)]
pub struct Hrtf {
    pub name: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HrtfStatus {
    Disabled,
    Enabled,
    Denied,
    Required,
    UnsupportedFormat,
}

impl HrtfStatus {
    pub fn token(self) -> i32 {
        match self {
            HrtfStatus::Disabled => crate::attrs::HRTF_DISABLED,
            HrtfStatus::Enabled => crate::attrs::HRTF_ENABLED,
            HrtfStatus::Denied => crate::attrs::HRTF_DENIED,
            HrtfStatus::Required => crate::attrs::HRTF_REQUIRED,
            HrtfStatus::UnsupportedFormat => crate::attrs::HRTF_UNSUPPORTED_FORMAT,
        }
    }
}

/// Application/config preference for HRTF rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HrtfRequest {
    Default,
    Enable,
    Disable,
}

/// Enumerate the HRTF data sets available to a device: the built-in set
/// plus any `.aurhrtf` files under the user data directory, honouring the
/// per-device `hrtf-paths` config key.
pub fn enumerate(device_name: Option<&str>, config: &Config) -> Vec<HrtfEntry> {
    let mut list = vec![HrtfEntry {
        name: "Built-In HRTF".into(),
        path: None,
    }];

    let mut dirs: Vec<PathBuf> = Vec::new();
    if let Some(paths) = config.value_str(device_name, "hrtf-paths") {
        dirs.extend(paths.split(',').map(|p| PathBuf::from(p.trim())));
    }
    if let Some(mut data) = dirs::data_dir() {
        data.push("auricle");
        data.push("hrtf");
        dirs.push(data);
    }

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("aurhrtf") {
                continue;
            }
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unnamed")
                .to_string();
            if list.iter().any(|e| e.name == name) {
                continue;
            }
            list.push(HrtfEntry {
                name,
                path: Some(path),
            });
        }
    }

    debug!("Enumerated {} HRTF data set(s)", list.len());
    list
}

/// Load an enumerated entry. Returns `None` (with a warning) on any error
/// so HRTF resolution can fall back to "unsupported format".
pub fn load(entry: &HrtfEntry) -> Option<Arc<Hrtf>> {
    match &entry.path {
        None => Some(Arc::new(Hrtf {
            name: entry.name.clone(),
            sample_rate: 44100,
        })),
        Some(path) => match load_file(path) {
            Ok(sample_rate) => Some(Arc::new(Hrtf {
                name: entry.name.clone(),
                sample_rate,
            })),
            Err(e) => {
                warn!("Failed to load HRTF {:?}: {}", path, e);
                None
            }
        },
    }
}

fn load_file(path: &PathBuf) -> Result<u32> {
    let data = std::fs::read(path)?;
    if data.len() < 12 || &data[..8] != FILE_MAGIC {
        return Err(AuricleError::InvalidValue(format!(
            "{:?} is not an HRTF data file",
            path
        )));
    }
    let rate = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    if !(crate::format::MIN_OUTPUT_RATE..=192_000).contains(&rate) {
        return Err(AuricleError::InvalidValue(format!(
            "HRTF sample rate {} out of range",
            rate
        )));
    }
    Ok(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_is_always_first() {
        let cfg = Config::default();
        let list = enumerate(None, &cfg);
        assert!(!list.is_empty());
        assert_eq!(list[0].name, "Built-In HRTF");
        assert!(list[0].path.is_none());
    }

    #[test]
    fn builtin_loads_at_native_rate() {
        let hrtf = load(&HrtfEntry {
            name: "Built-In HRTF".into(),
            path: None,
        })
        .unwrap();
        assert_eq!(hrtf.sample_rate, 44100);
    }

    #[test]
    fn rejects_files_without_magic() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.aurhrtf");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"not an hrtf")
            .unwrap();

        assert!(load(&HrtfEntry {
            name: "bogus".into(),
            path: Some(path),
        })
        .is_none());
    }

    #[test]
    fn reads_sample_rate_from_header() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.aurhrtf");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(FILE_MAGIC).unwrap();
        f.write_all(&48000u32.to_le_bytes()).unwrap();

        let hrtf = load(&HrtfEntry {
            name: "custom".into(),
            path: Some(path),
        })
        .unwrap();
        assert_eq!(hrtf.sample_rate, 48000);
    }
}
