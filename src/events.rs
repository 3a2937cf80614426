//! Async events delivered from the mixer to application code.
//!
//! The mixer pushes events with a non-blocking send into a bounded channel;
//! a per-context consumer thread pops them and invokes the application's
//! callback. A full queue drops the event with a warning rather than stall
//! the mix.

use crate::source::SourceState;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Queue depth for each context's event channel.
pub(crate) const EVENT_QUEUE_DEPTH: usize = 511;

#[derive(Debug, Clone, PartialEq)]
pub enum AsyncEvent {
    /// A source changed playback state on the mixer thread (e.g. ran out
    /// of data and stopped).
    SourceStateChanged { source: u32, state: SourceState },
    /// A source finished one pass over its buffer.
    BufferCompleted { source: u32 },
    /// The device lost its backend.
    DeviceDisconnected { reason: String },
    /// Internal: stops the event thread.
    #[doc(hidden)]
    Shutdown,
}

pub type EventCallback = dyn Fn(&AsyncEvent) + Send + Sync;

pub(crate) fn channel() -> (Sender<AsyncEvent>, Receiver<AsyncEvent>) {
    crossbeam_channel::bounded(EVENT_QUEUE_DEPTH)
}

/// Non-blocking push used from the mixer thread.
pub(crate) fn post(sender: &Sender<AsyncEvent>, event: AsyncEvent) {
    if sender.try_send(event).is_err() {
        warn!("Async event queue full, dropping event");
    }
}

/// Spawn the per-context event consumer thread.
pub(crate) fn start_thread(
    receiver: Receiver<AsyncEvent>,
    callback: Arc<Mutex<Option<Arc<EventCallback>>>>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("auricle-events".into())
        .spawn(move || {
            debug!("Event thread started");
            while let Ok(event) = receiver.recv() {
                if matches!(event, AsyncEvent::Shutdown) {
                    break;
                }
                let cb = callback.lock().unwrap_or_else(|e| e.into_inner()).clone();
                if let Some(cb) = cb {
                    cb(&event);
                }
            }
            debug!("Event thread stopped");
        })
        .expect("failed to spawn event thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn thread_delivers_events_then_shuts_down() {
        let (tx, rx) = channel();
        let callback: Arc<Mutex<Option<Arc<EventCallback>>>> = Arc::new(Mutex::new(None));
        let seen = Arc::new(AtomicUsize::new(0));

        let seen2 = seen.clone();
        *callback.lock().unwrap() = Some(Arc::new(move |event: &AsyncEvent| {
            if matches!(event, AsyncEvent::BufferCompleted { source: 7 }) {
                seen2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let handle = start_thread(rx, callback);
        post(&tx, AsyncEvent::BufferCompleted { source: 7 });
        post(&tx, AsyncEvent::Shutdown);
        handle.join().unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
