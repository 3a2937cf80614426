//! Device-disconnect semantics, isolated in their own test binary because
//! the backend failure is injected through the process environment.

use auricle::attrs::*;
use auricle::{open_device, AsyncEvent, AuricleError, ErrorCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn failed_reset_disconnects_the_device() {
    std::env::set_var("AURICLE_DRIVERS", "null");
    let _ = env_logger::builder().is_test(true).try_init();

    let dev = open_device(None).unwrap();
    let ctx = dev.create_context(None).unwrap();

    let events: Arc<Mutex<Vec<AsyncEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    ctx.set_event_callback(Some(move |event: &AsyncEvent| {
        sink.lock().unwrap().push(event.clone());
    }))
    .unwrap();

    assert_eq!(dev.query(ATTR_CONNECTED).unwrap(), 1);

    // Force the backend to reject the next negotiation.
    std::env::set_var("AURICLE_NULL_FAIL_RESET", "1");
    let result = dev.reset(None);
    std::env::remove_var("AURICLE_NULL_FAIL_RESET");

    assert!(matches!(result, Err(AuricleError::Backend(_))));
    assert_eq!(dev.get_error(), ErrorCode::InvalidDevice);
    assert_eq!(dev.query(ATTR_CONNECTED).unwrap(), 0);

    // Existing contexts stay valid; queries keep reporting state.
    assert!(ctx.context_props().is_ok());
    assert!(dev.query(ATTR_FREQUENCY).unwrap() > 0);

    // The loss surfaced through the async event queue.
    std::thread::sleep(Duration::from_millis(100));
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, AsyncEvent::DeviceDisconnected { .. })));

    // A later reset can recover the device.
    dev.reset(None).unwrap();
    assert_eq!(dev.query(ATTR_CONNECTED).unwrap(), 1);
    assert_eq!(dev.get_error(), ErrorCode::NoError);

    ctx.destroy().unwrap();
    dev.close().unwrap();
}
