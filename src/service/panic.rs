//! Best-effort description of a handler panic.
//!
//! `catch_unwind` only yields the panic payload. The location comes from a
//! process-wide panic hook that records the latest panic location on the
//! panicking thread; the hook chains to whatever hook was installed before.

use std::any::Any;
use std::cell::RefCell;
use std::sync::Once;

thread_local! {
    static LAST_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

/// Install the location-recording hook. Idempotent.
pub(crate) fn install_location_hook() {
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                let at = format!("{}:{}:{}", location.file(), location.line(), location.column());
                LAST_LOCATION.with(|slot| *slot.borrow_mut() = Some(at));
            }
            previous(info);
        }));
    });
}

/// Take the location of the latest panic on this thread.
pub(crate) fn take_location() -> Option<String> {
    LAST_LOCATION.with(|slot| slot.borrow_mut().take())
}

/// Text carried by a panic payload.
pub(crate) fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Message of the error reply sent for a handler panic.
pub(crate) fn describe(path: &str, location: Option<&str>, payload: &(dyn Any + Send)) -> String {
    format!(
        "A fatal error has occurred. {}: {} {}",
        path,
        location.unwrap_or("unknown location"),
        payload_message(payload)
    )
}
