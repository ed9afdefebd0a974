//! Input device resolution.
//!
//! Configured device names rarely match the OS strings exactly (drivers love
//! suffixes like "(2- USB Audio)"), so resolution is fuzzy, in order:
//!
//! 1. case-insensitive exact match
//! 2. configured name contained in the device name
//! 3. device name contained in the configured name
//!
//! Unmatched configured devices are skipped with a log; the engine starts
//! with whichever devices resolved.

use serde::{Deserialize, Serialize};

/// Metadata about an audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
}

/// Resolve a configured name against the available device names.
///
/// Returns the index of the first match per the three-step rule above.
pub fn resolve_device<S: AsRef<str>>(configured: &str, available: &[S]) -> Option<usize> {
    let wanted = configured.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }

    let lowered: Vec<String> = available
        .iter()
        .map(|n| n.as_ref().trim().to_lowercase())
        .collect();

    if let Some(idx) = lowered.iter().position(|n| *n == wanted) {
        return Some(idx);
    }
    if let Some(idx) = lowered.iter().position(|n| n.contains(&wanted)) {
        return Some(idx);
    }
    lowered.iter().position(|n| !n.is_empty() && wanted.contains(n.as_str()))
}

/// List all available audio input devices on the system.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                let is_default = default_name.as_deref() == Some(name.as_str());
                DeviceInfo { name, is_default }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}
