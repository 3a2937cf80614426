//! The per-context listener.

use crate::math::{Pose, Vec3};
use crate::props::{PropPool, UpdateSlot};
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct ListenerProps {
    pub pose: Pose,
    pub velocity: Vec3,
    pub gain: f32,
}

impl Default for ListenerProps {
    fn default() -> Self {
        Self {
            pose: Pose::identity(),
            velocity: Vec3::ZERO,
            gain: 1.0,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Listener {
    /// Staged image, mutated by API setters under the context prop lock.
    pub staged: Mutex<ListenerProps>,
    /// Set when staged and published images agree.
    pub props_clean: AtomicBool,
    pub update: UpdateSlot<ListenerProps>,
    pub free: PropPool<ListenerProps>,
    /// Committed image, touched only by the mixer.
    pub params: Mutex<ListenerProps>,
}

impl Listener {
    pub fn new() -> Listener {
        Listener {
            staged: Mutex::new(ListenerProps::default()),
            props_clean: AtomicBool::new(true),
            update: UpdateSlot::new(),
            free: PropPool::new(),
            params: Mutex::new(ListenerProps::default()),
        }
    }
}
