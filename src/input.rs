use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::instance::InstanceDevices;
use crate::profile::Profile;

const BY_ID_DIR: &str = "/dev/input/by-id";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    Gamepad,
    Keyboard,
    Mouse,
}

impl DeviceType {
    fn label(self) -> &'static str {
        match self {
            DeviceType::Gamepad => "joystick",
            DeviceType::Keyboard => "keyboard",
            DeviceType::Mouse => "mouse",
        }
    }

    fn from_by_id(name: &str) -> Option<Self> {
        if name.contains("event-joystick") {
            Some(DeviceType::Gamepad)
        } else if name.contains("event-mouse") {
            Some(DeviceType::Mouse)
        } else if name.contains("event-kbd") {
            Some(DeviceType::Keyboard)
        } else {
            None
        }
    }
}

/// An input or audio endpoint as shown to the user: an opaque id plus a
/// readable name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
}

/// Input devices listed per class.
#[derive(Debug, Default)]
pub struct InputDevices {
    pub joysticks: Vec<DeviceInfo>,
    pub mice: Vec<DeviceInfo>,
    pub keyboards: Vec<DeviceInfo>,
}

/// Resolves which device nodes an instance owns.
///
/// Resolution is a pure function of the profile and the player number, apart
/// from the host filesystem lookups that validate a configured node. A node
/// that is configured but unusable degrades to "no device" so the instance
/// still launches.
pub struct DeviceAllocator;

impl DeviceAllocator {
    /// Joystick node for `index` (1-based player number).
    pub fn device_for(profile: &Profile, index: usize) -> Option<PathBuf> {
        Self::node_for(profile.per_player_device_ids(), index, DeviceType::Gamepad)
    }

    pub fn devices_for(profile: &Profile, index: usize) -> InstanceDevices {
        InstanceDevices {
            joystick: Self::device_for(profile, index),
            mouse: Self::node_for(profile.per_player_mouse_ids(), index, DeviceType::Mouse),
            keyboard: Self::node_for(
                profile.per_player_keyboard_ids(),
                index,
                DeviceType::Keyboard,
            ),
            audio_sink: configured(profile.per_player_audio_sinks(), index).map(str::to_string),
        }
    }

    fn node_for(ids: &[String], index: usize, kind: DeviceType) -> Option<PathBuf> {
        let id = configured(ids, index)?;
        let path = Path::new(id);
        match std::fs::metadata(path) {
            Ok(meta) if meta.file_type().is_char_device() => Some(path.to_path_buf()),
            Ok(_) => {
                log::warn!(
                    "Instance {index}: {} '{id}' is not a character device, running without it",
                    kind.label()
                );
                None
            }
            Err(_) => {
                log::warn!(
                    "Instance {index}: {} '{id}' not found on host, running without it",
                    kind.label()
                );
                None
            }
        }
    }
}

/// The trimmed id stored for player `index`, if any.
fn configured(ids: &[String], index: usize) -> Option<&str> {
    let id = ids.get(index.checked_sub(1)?)?.trim();
    (!id.is_empty()).then_some(id)
}

/// Lists event devices under `/dev/input/by-id`, sorted by name per class.
pub fn list_input_devices() -> InputDevices {
    list_input_devices_in(Path::new(BY_ID_DIR))
}

fn list_input_devices_in(dir: &Path) -> InputDevices {
    let mut devices = InputDevices::default();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return devices;
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name().to_string_lossy().to_string();
        let Some(kind) = DeviceType::from_by_id(&file_name) else {
            continue;
        };
        let path = entry.path();
        let info = DeviceInfo {
            name: evdev_name(&path).unwrap_or_else(|| readable_name(&file_name)),
            id: path.to_string_lossy().to_string(),
        };
        match kind {
            DeviceType::Gamepad => devices.joysticks.push(info),
            DeviceType::Mouse => devices.mice.push(info),
            DeviceType::Keyboard => devices.keyboards.push(info),
        }
    }

    for list in [
        &mut devices.joysticks,
        &mut devices.mice,
        &mut devices.keyboards,
    ] {
        list.sort_by(|a, b| a.name.cmp(&b.name));
    }
    devices
}

/// Name reported by the kernel, with well known controller vendors spelled
/// out. Needs read access to the node, which regular users often lack.
fn evdev_name(path: &Path) -> Option<String> {
    let dev = evdev::Device::open(path).ok()?;
    let name = dev.name().unwrap_or_default().trim().to_string();
    let vendor = match dev.input_id().vendor() {
        0x045e => "Xbox Controller",
        0x054c => "PS Controller",
        0x057e => "NT Pro Controller",
        0x28de => "Steam Input",
        _ => "",
    };
    match (name.is_empty(), vendor.is_empty()) {
        (true, true) => None,
        (true, false) => Some(vendor.to_string()),
        (false, true) => Some(name),
        (false, false) => Some(format!("{vendor} ({name})")),
    }
}

/// Derives a display name from a by-id link such as
/// `usb-Logitech_Gamepad_F310-event-joystick`.
fn readable_name(file_name: &str) -> String {
    let mut name = file_name.strip_prefix("usb-").unwrap_or(file_name).to_string();
    for suffix in ["-event-joystick", "-event-mouse", "-event-kbd"] {
        if let Some(pos) = name.find(suffix) {
            name.truncate(pos);
        }
    }
    if let Some(pos) = name.rfind("-if") {
        if name[pos + 3..].chars().all(|c| c.is_ascii_digit()) {
            name.truncate(pos);
        }
    }
    name.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Audio sinks as reported by `pactl list sinks`.
pub fn list_audio_sinks() -> Vec<DeviceInfo> {
    match Command::new("pactl").args(["list", "sinks"]).output() {
        Ok(output) if output.status.success() => {
            parse_pactl_sinks(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            log::warn!(
                "pactl failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Vec::new()
        }
        Err(e) => {
            log::warn!("Could not run pactl: {e}");
            Vec::new()
        }
    }
}

fn parse_pactl_sinks(output: &str) -> Vec<DeviceInfo> {
    let mut sinks = Vec::new();
    let mut name: Option<String> = None;
    let mut desc: Option<String> = None;
    let mut flush = |name: &mut Option<String>, desc: &mut Option<String>| {
        if let Some(id) = name.take() {
            sinks.push(DeviceInfo {
                name: desc.take().unwrap_or_else(|| id.clone()),
                id,
            });
        }
        *desc = None;
    };

    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("Sink #") {
            flush(&mut name, &mut desc);
        } else if let Some(value) = line.strip_prefix("Name:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Description:") {
            desc = Some(value.trim().to_string());
        }
    }
    flush(&mut name, &mut desc);

    sinks.sort_by(|a, b| a.name.cmp(&b.name));
    sinks
}
