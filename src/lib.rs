//! Auricle - 3D positional audio engine core
//!
//! Applications open a [`Device`], create [`Context`]s bound to it,
//! generate [`Source`]s referencing [`AudioBuffer`]s of PCM data, route
//! sources through auxiliary [`EffectSlot`]s, and hear the result mixed in
//! real time on the backend's audio thread.
//!
//! # Architecture
//!
//! - **Caller threads**: stage property changes on sources, the listener,
//!   and effect slots; [`Context::suspend`]/[`Context::process`] batch a
//!   group of writes so the mixer observes them in a single tick.
//! - **Mixer thread**: one per running device, driven by the backend. It
//!   consumes committed properties through lock-free update slots and
//!   never waits on a caller-held lock.

pub mod attrs;
pub mod backend;
pub mod buffer;
pub mod config;
pub mod context;
pub mod device;
pub mod effect;
pub mod error;
pub mod events;
pub mod format;
pub mod hrtf;
pub mod limiter;
pub mod listener;
pub mod math;
mod mixer;
mod props;
mod registry;
pub mod source;
pub mod voice;

pub use buffer::AudioBuffer;
pub use context::{Context, ContextProps, DistanceModel};
pub use device::{open_capture_device, open_device, open_loopback_device, Device};
pub use effect::{EffectKind, EffectProps, EffectSlot, FilterKind, FilterProps};
pub use error::{AuricleError, ErrorCode, Result};
pub use events::AsyncEvent;
pub use format::{
    AmbiLayout, AmbiScaling, ChannelLayout, DeviceFormat, DeviceType, SampleType, MAX_SENDS,
};
pub use hrtf::HrtfStatus;
pub use listener::ListenerProps;
pub use math::{Pose, Quat, Vec3};
pub use registry::{
    all_device_names, capture_device_names, current_context, default_all_devices_specifier,
    default_capture_device_specifier, is_extension_present, make_current, null_device_error,
    query_no_device, set_thread_context, thread_context, EXTENSIONS,
};
pub use source::{SendParams, Source, SourceProps, SourceState};
pub use voice::VoiceProps;
