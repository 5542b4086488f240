//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

/// Which side of the device a listing or lookup refers to.
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
    pub direction: DeviceDirection,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
    /// Highest channel count among supported configurations.
    pub max_channels: u16,
    /// Sample rate of the device's default configuration (Hz).
    pub default_sample_rate: u32,
    /// Whether any supported configuration covers the fixed 44.1 kHz rate.
    pub supports_native_rate: bool,
    /// Heuristic flag for inputs that capture system/output audio.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "mixage stereo",
    "mezcla estereo",
    "mix stereo",
];

/// Best-effort heuristic for loopback/monitor capture devices.
///
/// A repeater listening to its own output re-triggers on every playback.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Order listings: defaults first, then by name.
fn sort_listing(list: &mut [DeviceInfo]) {
    list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
}

#[cfg(feature = "audio-cpal")]
mod host {
    use cpal::traits::{DeviceTrait, HostTrait};
    use cpal::{Device, DevicesError, Host, SupportedStreamConfigRange};
    use tracing::{info, warn};

    use super::{is_loopback_like_name, sort_listing, DeviceDirection, DeviceInfo};
    use crate::audio::SAMPLE_RATE;
    use crate::error::{RepeaterError, Result};

    fn devices_for(host: &Host, direction: DeviceDirection) -> std::result::Result<Vec<Device>, DevicesError> {
        Ok(match direction {
            DeviceDirection::Input => host.input_devices()?.collect(),
            DeviceDirection::Output => host.output_devices()?.collect(),
        })
    }

    fn default_for(host: &Host, direction: DeviceDirection) -> Option<Device> {
        match direction {
            DeviceDirection::Input => host.default_input_device(),
            DeviceDirection::Output => host.default_output_device(),
        }
    }

    fn describe(
        device: &Device,
        direction: DeviceDirection,
        default_name: Option<&str>,
        idx: usize,
    ) -> DeviceInfo {
        let name = device.name().unwrap_or_else(|_| match direction {
            DeviceDirection::Input => format!("Input Device {}", idx + 1),
            DeviceDirection::Output => format!("Output Device {}", idx + 1),
        });

        let ranges: Vec<SupportedStreamConfigRange> = match direction {
            DeviceDirection::Input => device
                .supported_input_configs()
                .map(|it| it.collect())
                .unwrap_or_default(),
            DeviceDirection::Output => device
                .supported_output_configs()
                .map(|it| it.collect())
                .unwrap_or_default(),
        };
        let max_channels = ranges.iter().map(|r| r.channels()).max().unwrap_or(0);
        let supports_native_rate = ranges.iter().any(|r| {
            r.min_sample_rate().0 <= SAMPLE_RATE && r.max_sample_rate().0 >= SAMPLE_RATE
        });

        let default_config = match direction {
            DeviceDirection::Input => device.default_input_config(),
            DeviceDirection::Output => device.default_output_config(),
        };
        let default_sample_rate = default_config.map(|c| c.sample_rate().0).unwrap_or(0);

        DeviceInfo {
            is_default: default_name == Some(name.as_str()),
            is_loopback_like: direction == DeviceDirection::Input && is_loopback_like_name(&name),
            name,
            direction,
            max_channels,
            default_sample_rate,
            supports_native_rate,
        }
    }

    pub fn list(direction: DeviceDirection) -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default = default_for(&host, direction);
        let default_name = default.as_ref().and_then(|d| d.name().ok());

        match devices_for(&host, direction) {
            Ok(devices) => {
                let mut list = devices
                    .iter()
                    .enumerate()
                    .map(|(idx, device)| describe(device, direction, default_name.as_deref(), idx))
                    .collect::<Vec<_>>();
                sort_listing(&mut list);
                list
            }
            Err(e) => {
                warn!("failed to enumerate {direction:?} devices: {e}");
                default
                    .map(|d| vec![describe(&d, direction, default_name.as_deref(), 0)])
                    .unwrap_or_default()
            }
        }
    }

    /// Resolve a device by exact name, falling back to the default and then
    /// the first available device.
    pub fn select(host: &Host, direction: DeviceDirection, preferred: Option<&str>) -> Result<Device> {
        if let Some(preferred_name) = preferred {
            match devices_for(host, direction) {
                Ok(devices) => {
                    if let Some(found) = devices.into_iter().find(|d| {
                        d.name().map(|n| n == preferred_name).unwrap_or(false)
                    }) {
                        return Ok(found);
                    }
                    warn!(
                        "preferred {direction:?} device '{}' not found, falling back",
                        preferred_name
                    );
                }
                Err(e) => warn!("failed to list {direction:?} devices while resolving preference: {e}"),
            }
        }

        if let Some(device) = default_for(host, direction) {
            return Ok(device);
        }

        let missing = match direction {
            DeviceDirection::Input => RepeaterError::NoDefaultInputDevice,
            DeviceDirection::Output => RepeaterError::NoDefaultOutputDevice,
        };
        let fallback = devices_for(host, direction)
            .map_err(|e| RepeaterError::AudioDevice(e.to_string()))?
            .into_iter()
            .next()
            .ok_or(missing)?;
        info!("no default {direction:?} device, using first available");
        Ok(fallback)
    }
}

#[cfg(feature = "audio-cpal")]
pub(crate) use host::select as select_device;

/// List all audio input devices. Empty when cpal is unavailable.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    host::list(DeviceDirection::Input)
}

/// List all audio output devices. Empty when cpal is unavailable.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    host::list(DeviceDirection::Output)
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}
