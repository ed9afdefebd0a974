//! Trigger-key state machine.
//!
//! Raw key events come in from the OS listener; recording intents come out
//! through the hooks. Hold-to-record is the normal path, a quick double-tap
//! latches toggle mode, and Shift+Escape is the always-available emergency
//! reset. Every transition happens under one mutex, but the hooks run after
//! the lock is released — a hook that re-enters the controller must not
//! deadlock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

/// Keys the controller cares about; the host maps raw OS key codes to these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    Trigger,
    Shift,
    Escape,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Recording,
    ToggleRecording,
}

/// Intent callbacks fired by the controller.
#[derive(Clone)]
pub struct InputHooks {
    pub on_start: Arc<dyn Fn() + Send + Sync>,
    pub on_stop: Arc<dyn Fn() + Send + Sync>,
    pub on_emergency_reset: Arc<dyn Fn() + Send + Sync>,
}

struct ControllerState {
    phase: Phase,
    last_press: Option<Instant>,
    trigger_down: bool,
    shift_down: bool,
    /// Bumped on every toggle entry/exit so a stale timeout thread no-ops.
    toggle_generation: u64,
}

enum Action {
    Start,
    Stop,
    Emergency { stop_first: bool },
    None,
}

pub struct InputController {
    double_tap_threshold: Duration,
    toggle_timeout: Duration,
    state: Mutex<ControllerState>,
    hooks: InputHooks,
}

impl InputController {
    pub fn new(double_tap_threshold: Duration, toggle_timeout: Duration, hooks: InputHooks) -> Self {
        Self {
            double_tap_threshold,
            toggle_timeout,
            state: Mutex::new(ControllerState {
                phase: Phase::Idle,
                last_press: None,
                trigger_down: false,
                shift_down: false,
                toggle_generation: 0,
            }),
            hooks,
        }
    }

    pub fn on_key_press(self: &Arc<Self>, key: ControlKey) {
        self.on_key_press_at(key, Instant::now());
    }

    pub fn on_key_release(self: &Arc<Self>, key: ControlKey) {
        self.on_key_release_at(key, Instant::now());
    }

    pub fn on_key_press_at(self: &Arc<Self>, key: ControlKey, now: Instant) {
        let action = {
            let mut state = self.state.lock();
            match key {
                ControlKey::Shift => {
                    state.shift_down = true;
                    Action::None
                }
                ControlKey::Escape if state.shift_down => {
                    let stop_first = state.phase != Phase::Idle;
                    state.phase = Phase::Idle;
                    state.trigger_down = false;
                    state.toggle_generation += 1;
                    Action::Emergency { stop_first }
                }
                ControlKey::Trigger => {
                    if state.trigger_down {
                        // OS auto-repeat; the physical key is still held.
                        Action::None
                    } else {
                        state.trigger_down = true;
                        let double_tap = state
                            .last_press
                            .map(|t| now.duration_since(t) < self.double_tap_threshold)
                            .unwrap_or(false);
                        state.last_press = Some(now);
                        match state.phase {
                            Phase::Idle if double_tap => {
                                state.phase = Phase::ToggleRecording;
                                state.toggle_generation += 1;
                                let generation = state.toggle_generation;
                                self.spawn_toggle_timeout(generation);
                                info!("double tap — toggle recording");
                                Action::Start
                            }
                            Phase::Idle => {
                                state.phase = Phase::Recording;
                                Action::Start
                            }
                            Phase::ToggleRecording => {
                                state.phase = Phase::Idle;
                                state.toggle_generation += 1;
                                Action::Stop
                            }
                            Phase::Recording => Action::None,
                        }
                    }
                }
                _ => Action::None,
            }
        };
        self.fire(action);
    }

    pub fn on_key_release_at(self: &Arc<Self>, key: ControlKey, _now: Instant) {
        let action = {
            let mut state = self.state.lock();
            match key {
                ControlKey::Shift => {
                    state.shift_down = false;
                    Action::None
                }
                ControlKey::Trigger => {
                    state.trigger_down = false;
                    if state.phase == Phase::Recording {
                        state.phase = Phase::Idle;
                        Action::Stop
                    } else {
                        // Toggle mode ignores the release.
                        Action::None
                    }
                }
                _ => Action::None,
            }
        };
        self.fire(action);
    }

    fn spawn_toggle_timeout(self: &Arc<Self>, generation: u64) {
        let controller = Arc::clone(self);
        let timeout = self.toggle_timeout;
        std::thread::Builder::new()
            .name("quorate-toggle-timeout".into())
            .spawn(move || {
                std::thread::sleep(timeout);
                controller.expire_toggle(generation);
            })
            .ok();
    }

    fn expire_toggle(self: &Arc<Self>, generation: u64) {
        let action = {
            let mut state = self.state.lock();
            if state.phase == Phase::ToggleRecording && state.toggle_generation == generation {
                state.phase = Phase::Idle;
                state.toggle_generation += 1;
                info!("toggle recording safety timeout");
                Action::Stop
            } else {
                Action::None
            }
        };
        self.fire(action);
    }

    /// Test hook: force the safety timeout for the current toggle, if any.
    #[cfg(test)]
    fn force_toggle_timeout(self: &Arc<Self>) {
        let generation = self.state.lock().toggle_generation;
        self.expire_toggle(generation);
    }

    fn fire(&self, action: Action) {
        // The lock is released before any hook runs.
        match action {
            Action::Start => (self.hooks.on_start)(),
            Action::Stop => (self.hooks.on_stop)(),
            Action::Emergency { stop_first } => {
                debug!(stop_first, "emergency reset");
                if stop_first {
                    (self.hooks.on_stop)();
                }
                (self.hooks.on_emergency_reset)();
            }
            Action::None => {}
        }
    }
}
