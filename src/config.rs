//! Installation configuration.
//!
//! Settings load once, at first engine use, from a TOML file:
//! `$AURICLE_CONF` if set, otherwise `<config dir>/auricle/auricle.toml`.
//! Keys live in the top-level `[general]` table, with per-device overrides
//! under `[device."<name>"]`; a handful of keys use their own sections
//! (`[reverb]`, `[wave]`). Lookup priority is device section, then general.

use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    #[serde(flatten)]
    general: toml::Table,
    device: HashMap<String, toml::Table>,
    reverb: toml::Table,
    wave: toml::Table,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    file: ConfigFile,
}

impl Config {
    /// Load the installation configuration, falling back to defaults when
    /// no file exists or it fails to parse.
    pub fn load() -> Config {
        let path = config_path();
        let Some(path) = path else {
            debug!("No config directory available, using defaults");
            return Config::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match Config::from_str(&contents) {
                Ok(cfg) => {
                    debug!("Loaded config from {:?}", path);
                    cfg
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?}: {}", path, e);
                    Config::default()
                }
            },
            Err(_) => {
                debug!("Config file {:?} not found, using defaults", path);
                Config::default()
            }
        }
    }

    pub fn from_str(contents: &str) -> Result<Config, toml::de::Error> {
        let file: ConfigFile = toml::from_str(contents)?;
        Ok(Config { file })
    }

    fn lookup(&self, device: Option<&str>, key: &str) -> Option<&toml::Value> {
        if let Some((section, rest)) = key.split_once('/') {
            let table = match section {
                "reverb" => &self.file.reverb,
                "wave" => &self.file.wave,
                _ => return None,
            };
            return table.get(rest);
        }

        if let Some(name) = device {
            if let Some(value) = self.file.device.get(name).and_then(|t| t.get(key)) {
                return Some(value);
            }
        }
        self.file.general.get(key)
    }

    pub fn value_str(&self, device: Option<&str>, key: &str) -> Option<String> {
        match self.lookup(device, key)? {
            toml::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn value_i64(&self, device: Option<&str>, key: &str) -> Option<i64> {
        match self.lookup(device, key)? {
            toml::Value::Integer(i) => Some(*i),
            toml::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn value_u32(&self, device: Option<&str>, key: &str) -> Option<u32> {
        self.value_i64(device, key)
            .and_then(|v| u32::try_from(v).ok())
    }

    pub fn value_i32(&self, device: Option<&str>, key: &str) -> Option<i32> {
        self.value_i64(device, key)
            .and_then(|v| i32::try_from(v).ok())
    }

    pub fn value_f32(&self, device: Option<&str>, key: &str) -> Option<f32> {
        match self.lookup(device, key)? {
            toml::Value::Float(f) => Some(*f as f32),
            toml::Value::Integer(i) => Some(*i as f32),
            toml::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn value_bool(&self, device: Option<&str>, key: &str) -> Option<bool> {
        match self.lookup(device, key)? {
            toml::Value::Boolean(b) => Some(*b),
            toml::Value::Integer(i) => Some(*i != 0),
            toml::Value::String(s) => match s.trim() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// `value_bool` with a default, mirroring how most boolean keys are read.
    pub fn bool_or(&self, device: Option<&str>, key: &str, default: bool) -> bool {
        self.value_bool(device, key).unwrap_or(default)
    }
}

fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("AURICLE_CONF") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let mut dir = dirs::config_dir()?;
    dir.push("auricle");
    dir.push("auricle.toml");
    Some(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
frequency = 48000
period_size = 512
dither = true
drivers = "null,"

[reverb]
boost = 3.0

[device."Front Speakers"]
frequency = 44100
channels = "stereo"
"#;

    #[test]
    fn general_lookup() {
        let cfg = Config::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.value_u32(None, "frequency"), Some(48000));
        assert_eq!(cfg.value_u32(None, "period_size"), Some(512));
        assert_eq!(cfg.value_bool(None, "dither"), Some(true));
        assert_eq!(cfg.value_str(None, "drivers").as_deref(), Some("null,"));
        assert_eq!(cfg.value_u32(None, "periods"), None);
    }

    #[test]
    fn device_section_overrides_general() {
        let cfg = Config::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.value_u32(Some("Front Speakers"), "frequency"), Some(44100));
        // Keys absent from the device section fall through to general.
        assert_eq!(cfg.value_u32(Some("Front Speakers"), "period_size"), Some(512));
        assert_eq!(
            cfg.value_str(Some("Front Speakers"), "channels").as_deref(),
            Some("stereo")
        );
    }

    #[test]
    fn sectioned_keys() {
        let cfg = Config::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.value_f32(None, "reverb/boost"), Some(3.0));
        assert_eq!(cfg.value_str(None, "wave/file"), None);
    }

    #[test]
    fn loads_from_file() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auricle.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "sources = 64").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let cfg = Config::from_str(&contents).unwrap();
        assert_eq!(cfg.value_u32(None, "sources"), Some(64));
    }

    #[test]
    fn bad_file_yields_error() {
        assert!(Config::from_str("frequency = [[[").is_err());
    }
}
