//! Global key listener wired to the core input controller.

use std::sync::Arc;

use quorate_core::{ControlKey, InputController};
use rdev::{EventType, Key};
use tracing::{error, warn};

/// Map a configured trigger name to an rdev key. Unknown names fall back to
/// right Alt with a log so the app stays usable.
pub fn trigger_key_from_name(name: &str) -> Key {
    match name.trim().to_ascii_lowercase().as_str() {
        "alt_r" | "altgr" | "ralt" => Key::AltGr,
        "alt" | "alt_l" => Key::Alt,
        "caps_lock" | "capslock" => Key::CapsLock,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        other => {
            warn!(configured = other, "unknown trigger key, using right Alt");
            Key::AltGr
        }
    }
}

fn classify(key: Key, trigger: Key) -> ControlKey {
    if key == trigger {
        return ControlKey::Trigger;
    }
    match key {
        Key::ShiftLeft | Key::ShiftRight => ControlKey::Shift,
        Key::Escape => ControlKey::Escape,
        _ => ControlKey::Other,
    }
}

/// Run the OS hook on its own thread; events stream into the controller for
/// the rest of the process lifetime.
pub fn spawn_listener(controller: Arc<InputController>, trigger: Key) {
    std::thread::Builder::new()
        .name("quorate-keys".into())
        .spawn(move || {
            let result = rdev::listen(move |event| match event.event_type {
                EventType::KeyPress(key) => controller.on_key_press(classify(key, trigger)),
                EventType::KeyRelease(key) => controller.on_key_release(classify(key, trigger)),
                _ => {}
            });
            if let Err(e) = result {
                error!("key listener failed: {e:?}");
            }
        })
        .expect("spawn key listener thread");
}
