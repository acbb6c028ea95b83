//! Audio device enumeration.

use serde::{Deserialize, Serialize};

/// Which side of the conversation a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default for its direction.
    pub is_default: bool,
    pub direction: DeviceDirection,
}

/// Default device first, then alphabetical.
fn sort_devices(list: &mut [DeviceInfo]) {
    list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
}

/// List available microphones. Empty if cpal is unavailable.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    match host.input_devices() {
        Ok(devices) => collect(devices, default_name, DeviceDirection::Input),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            default_only(default_name, DeviceDirection::Input)
        }
    }
}

/// List available speakers. Empty if cpal is unavailable.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    match host.output_devices() {
        Ok(devices) => collect(devices, default_name, DeviceDirection::Output),
        Err(e) => {
            tracing::warn!("failed to enumerate output devices: {e}");
            default_only(default_name, DeviceDirection::Output)
        }
    }
}

#[cfg(feature = "audio-cpal")]
fn collect(
    devices: impl Iterator<Item = cpal::Device>,
    default_name: Option<String>,
    direction: DeviceDirection,
) -> Vec<DeviceInfo> {
    use cpal::traits::DeviceTrait;

    let mut list: Vec<DeviceInfo> = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Device {}", idx + 1));
            DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                direction,
            }
        })
        .collect();
    sort_devices(&mut list);
    list
}

#[cfg(feature = "audio-cpal")]
fn default_only(default_name: Option<String>, direction: DeviceDirection) -> Vec<DeviceInfo> {
    default_name
        .map(|name| DeviceInfo {
            name,
            is_default: true,
            direction,
        })
        .into_iter()
        .collect()
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}
