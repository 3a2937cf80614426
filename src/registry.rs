//! Process-wide engine state: the live-device registry, current-context
//! slots, and the lazily-initialized engine configuration.

use crate::backend::{self, BackendEntry, BackendKind};
use crate::config::Config;
use crate::context::Context;
use crate::device::{Device, DeviceInner};
use crate::effect::{EffectKind, EffectProps};
use crate::error::{AuricleError, ErrorCode, Result};
use log::{debug, error, info, warn};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

static DEVICE_LIST: Mutex<Vec<Device>> = Mutex::new(Vec::new());
static GLOBAL_CONTEXT: Mutex<Option<Context>> = Mutex::new(None);
static LAST_NULL_ERROR: AtomicU32 = AtomicU32::new(0);
static ENGINE: OnceLock<EngineGlobals> = OnceLock::new();
static RAW_CONFIG: OnceLock<Config> = OnceLock::new();

/// Extensions the engine reports.
pub const EXTENSIONS: &str = "AUR_EXT_capture AUR_EXT_deferred_updates AUR_EXT_disconnect \
     AUR_EXT_thread_local_context AUR_SOFT_device_clock AUR_SOFT_HRTF AUR_SOFT_loopback \
     AUR_SOFT_output_limiter AUR_SOFT_pause_device";

pub fn is_extension_present(name: &str) -> bool {
    EXTENSIONS
        .split_ascii_whitespace()
        .any(|ext| ext.eq_ignore_ascii_case(name))
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CpuCaps {
    /// SSE or NEON available and not masked by `disable-cpu-exts`.
    pub simd: bool,
}

pub(crate) struct EngineGlobals {
    pub config: Config,
    pub playback: Option<BackendEntry>,
    pub capture: Option<BackendEntry>,
    pub suspend_defers: bool,
    pub trap_error: bool,
    pub reverb_boost: f32,
    pub default_effect: Option<EffectProps>,
    pub disabled_effects: Vec<EffectKind>,
    pub cpu_caps: CpuCaps,
    pub rt_prio: i32,
}

/// The configuration file, loaded once. Available before (and during)
/// engine init so backend factories can consult it.
pub(crate) fn raw_config() -> &'static Config {
    RAW_CONFIG.get_or_init(Config::load)
}

/// One-time engine initialization: configuration, environment, and
/// backend selection.
pub(crate) fn engine() -> &'static EngineGlobals {
    ENGINE.get_or_init(init_engine)
}

fn init_engine() -> EngineGlobals {
    let config = raw_config().clone();

    // Cap the log facade's level when asked; the application's logger
    // still decides where records go.
    if let Ok(level) = std::env::var("AURICLE_LOGLEVEL") {
        let filter = match level.trim() {
            "0" => Some(log::LevelFilter::Off),
            "1" => Some(log::LevelFilter::Error),
            "2" => Some(log::LevelFilter::Warn),
            "3" => Some(log::LevelFilter::Info),
            "4" => Some(log::LevelFilter::Trace),
            _ => None,
        };
        if let Some(filter) = filter {
            log::set_max_level(filter);
        }
    }

    info!("Initializing auricle v{}", env!("CARGO_PKG_VERSION"));

    let mut suspend_defers = true;
    if let Ok(value) = std::env::var("AURICLE_SUSPEND_CONTEXT") {
        if value.eq_ignore_ascii_case("ignore") {
            suspend_defers = false;
            debug!("Selected context suspend behavior, \"ignore\"");
        } else if !value.is_empty() {
            error!("Unhandled context suspend behavior setting: \"{}\"", value);
        }
    }

    let mut simd = cfg!(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64"));
    let disable_exts = std::env::var("AURICLE_DISABLE_CPU_EXTS")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| config.value_str(None, "disable-cpu-exts"));
    if let Some(list) = disable_exts {
        for ext in list.split(',') {
            match ext.trim().to_ascii_lowercase().as_str() {
                "all" | "sse" | "neon" => simd = false,
                "" => {}
                other => warn!("Invalid CPU extension \"{}\"", other),
            }
        }
    }

    let env_trap = std::env::var("AURICLE_TRAP_ERROR")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);
    let trap_error = config.bool_or(None, "trap-alc-error", env_trap);

    let mut reverb_boost = 1.0f32;
    if let Some(db) = config.value_f32(None, "reverb/boost") {
        reverb_boost *= 10.0f32.powf(db / 20.0);
    }

    let rt_prio = config.value_i32(None, "rt-prio").unwrap_or(0);

    let mut table = backend::backend_table();
    {
        let names: Vec<&str> = table.iter().map(|e| e.name).collect();
        debug!("Supported backends: {}", names.join(", "));
    }
    let drivers = std::env::var("AURICLE_DRIVERS")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| config.value_str(None, "drivers"));
    if let Some(list) = drivers {
        backend::apply_driver_list(&mut table, &list);
    }

    let mut playback: Option<BackendEntry> = None;
    let mut capture: Option<BackendEntry> = None;
    for entry in table {
        if playback.is_some() && capture.is_some() {
            break;
        }
        if !entry.factory.init() {
            warn!("Failed to initialize backend \"{}\"", entry.name);
            continue;
        }
        debug!("Initialized backend \"{}\"", entry.name);
        if playback.is_none() && entry.factory.supports(BackendKind::Playback) {
            info!("Added \"{}\" for playback", entry.name);
            playback = Some(entry);
        }
        if capture.is_none() && entry.factory.supports(BackendKind::Capture) {
            info!("Added \"{}\" for capture", entry.name);
            capture = Some(entry);
        }
    }
    if playback.is_none() {
        warn!("No playback backend available!");
    }
    if capture.is_none() {
        warn!("No capture backend available!");
    }

    let mut disabled_effects = Vec::new();
    if let Some(list) = config.value_str(None, "excludefx") {
        for name in list.split(',') {
            match name.trim().to_ascii_lowercase().as_str() {
                "reverb" => disabled_effects.push(EffectKind::Reverb),
                "echo" => disabled_effects.push(EffectKind::Echo),
                "" => {}
                other => warn!("Unknown effect \"{}\" in excludefx", other),
            }
        }
    }

    let mut default_effect = None;
    let preset = std::env::var("AURICLE_DEFAULT_REVERB")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| config.value_str(None, "default-reverb"));
    if let Some(name) = preset {
        default_effect = crate::effect::reverb_preset(&name)
            .filter(|e| !disabled_effects.contains(&e.kind));
    }

    EngineGlobals {
        config,
        playback,
        capture,
        suspend_defers,
        trap_error,
        reverb_boost,
        default_effect,
        disabled_effects,
        cpu_caps: CpuCaps { simd },
        rt_prio,
    }
}

// -- device registry -------------------------------------------------------

pub(crate) fn list_guard() -> MutexGuard<'static, Vec<Device>> {
    DEVICE_LIST.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn verify_device_in(list: &[Device], device: &Device) -> bool {
    list.iter().any(|d| d == device)
}

/// Validate a device handle against the live list, as every API entry
/// point does. Stale handles fail verification; they never fault.
pub(crate) fn verify_device(device: &Device) -> bool {
    verify_device_in(&list_guard(), device)
}

pub(crate) fn register_device(device: &Device) {
    list_guard().push(device.clone());
}

pub(crate) fn unregister_in(list: &mut Vec<Device>, device: &Device) {
    list.retain(|d| d != device);
}

pub(crate) fn verify_context_in(list: &[Device], ctx: &Context) -> bool {
    list.iter().any(|device| {
        device
            .inner
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|c| c == ctx)
    })
}

/// Validate a context handle by scanning every device's context list.
pub(crate) fn verify_context(ctx: &Context) -> bool {
    verify_context_in(&list_guard(), ctx)
}

/// Devices of every playback backend, in enumeration order.
pub fn all_device_names() -> Vec<String> {
    engine()
        .playback
        .map(|e| e.factory.probe(BackendKind::Playback))
        .unwrap_or_default()
}

pub fn capture_device_names() -> Vec<String> {
    engine()
        .capture
        .map(|e| e.factory.probe(BackendKind::Capture))
        .unwrap_or_default()
}

/// The default playback device specifier: the first probed entry.
pub fn default_all_devices_specifier() -> Option<String> {
    all_device_names().into_iter().next()
}

pub fn default_capture_device_specifier() -> Option<String> {
    capture_device_names().into_iter().next()
}

// -- current-context slots --------------------------------------------------

struct ThreadSlot(Option<Context>);

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        // Thread exiting with a context still current; the reference is
        // released here.
        if self.0.take().is_some() {
            warn!("Context current for exiting thread, possible leak");
        }
    }
}

thread_local! {
    static THREAD_CONTEXT: RefCell<ThreadSlot> = const { RefCell::new(ThreadSlot(None)) };
}

/// Make `ctx` the process-wide current context (or clear it with `None`),
/// dropping any thread-local context the calling thread held.
pub fn make_current(ctx: Option<&Context>) -> Result<()> {
    if let Some(c) = ctx {
        if !verify_context(c) {
            return Err(latch_null(AuricleError::InvalidContext));
        }
    }
    *GLOBAL_CONTEXT.lock().unwrap_or_else(|e| e.into_inner()) = ctx.cloned();

    THREAD_CONTEXT.with(|slot| {
        if slot.borrow_mut().0.take().is_some() {
            debug!("Cleared thread-local context on make_current");
        }
    });
    Ok(())
}

/// Make `ctx` current for the calling thread only.
pub fn set_thread_context(ctx: Option<&Context>) -> Result<()> {
    if let Some(c) = ctx {
        if !verify_context(c) {
            return Err(latch_null(AuricleError::InvalidContext));
        }
    }
    THREAD_CONTEXT.with(|slot| {
        slot.borrow_mut().0 = ctx.cloned();
    });
    Ok(())
}

/// The context current for this thread: the thread slot if set, else the
/// process-wide slot.
pub fn current_context() -> Option<Context> {
    let local = THREAD_CONTEXT.with(|slot| slot.borrow().0.clone());
    if local.is_some() {
        return local;
    }
    // The global slot is read under the registry lock so the reference
    // cannot race a concurrent destroy.
    let _list = list_guard();
    GLOBAL_CONTEXT
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// The calling thread's thread-local context, if any.
pub fn thread_context() -> Option<Context> {
    THREAD_CONTEXT.with(|slot| slot.borrow().0.clone())
}

/// Drop current-context references to a context being released.
pub(crate) fn clear_current_if(ctx: &Context) {
    {
        let mut global = GLOBAL_CONTEXT.lock().unwrap_or_else(|e| e.into_inner());
        if global.as_ref().is_some_and(|c| c == ctx) {
            *global = None;
        }
    }
    THREAD_CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.0.as_ref().is_some_and(|c| c == ctx) {
            warn!("Context released while current on thread");
            slot.0 = None;
        }
    });
}

// -- error latching ---------------------------------------------------------

/// Latch an error on a device, or process-wide with no device.
pub(crate) fn set_error(device: Option<&DeviceInner>, code: ErrorCode) {
    warn!("Error generated, code {:#06x}", code.raw());
    if ENGINE.get().is_some_and(|e| e.trap_error) {
        panic!("trapped engine error {:?}", code);
    }
    match device {
        Some(dev) => dev.last_error.store(code.raw(), Ordering::Release),
        None => LAST_NULL_ERROR.store(code.raw(), Ordering::Release),
    }
}

pub(crate) fn latch_null(err: AuricleError) -> AuricleError {
    set_error(None, err.code());
    err
}

/// Read and clear the process-wide error latched by operations that had
/// no valid device.
pub fn null_device_error() -> ErrorCode {
    ErrorCode::from_raw(LAST_NULL_ERROR.swap(0, Ordering::AcqRel))
}

/// Version/device-independent queries, available without a device.
pub fn query_no_device(param: i32) -> Result<i32> {
    use crate::attrs;
    match param {
        attrs::ATTR_MAJOR_VERSION => Ok(crate::device::VERSION_MAJOR),
        attrs::ATTR_MINOR_VERSION => Ok(crate::device::VERSION_MINOR),
        attrs::ATTR_ATTRIBUTES_SIZE
        | attrs::ATTR_ALL_ATTRIBUTES
        | attrs::ATTR_FREQUENCY
        | attrs::ATTR_REFRESH
        | attrs::ATTR_SYNC
        | attrs::ATTR_MONO_SOURCES
        | attrs::ATTR_STEREO_SOURCES
        | attrs::ATTR_CAPTURE_SAMPLES
        | attrs::ATTR_FORMAT_CHANNELS
        | attrs::ATTR_FORMAT_TYPE
        | attrs::ATTR_AMBISONIC_LAYOUT
        | attrs::ATTR_AMBISONIC_SCALING
        | attrs::ATTR_AMBISONIC_ORDER
        | attrs::ATTR_MAX_AMBISONIC_ORDER => Err(latch_null(AuricleError::InvalidDevice)),
        other => Err(latch_null(AuricleError::InvalidEnum(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_lookup_is_case_insensitive() {
        assert!(is_extension_present("AUR_SOFT_loopback"));
        assert!(is_extension_present("aur_soft_LOOPBACK"));
        assert!(!is_extension_present("AUR_SOFT_nonexistent"));
    }

    #[test]
    fn no_device_queries() {
        assert_eq!(
            query_no_device(crate::attrs::ATTR_MAJOR_VERSION).unwrap(),
            crate::device::VERSION_MAJOR
        );
        assert!(query_no_device(crate::attrs::ATTR_FREQUENCY).is_err());
        assert!(query_no_device(0x7F7F).is_err());
        // Both failures latched process-wide; read-and-clear.
        assert_ne!(null_device_error(), ErrorCode::NoError);
        assert_eq!(null_device_error(), ErrorCode::NoError);
    }
}
