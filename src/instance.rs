use std::path::{Path, PathBuf};

use crate::profile::{LayoutMode, Profile, SplitOrientation};

/// One launched player. Created by the orchestrator right before launch and
/// dropped when the session ends.
#[derive(Clone, Debug)]
pub struct Instance {
    /// Player number (1-based); selects device bindings and the prefix name.
    pub index: usize,
    /// Position among the instances launched this session (1-based); selects
    /// the screen region.
    pub slot: usize,
    pub prefix_dir: PathBuf,
    pub log_path: PathBuf,
    pub pid: Option<u32>,
    pub devices: InstanceDevices,
}

/// Device nodes resolved for an instance. Fixed once the instance exists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceDevices {
    pub joystick: Option<PathBuf>,
    pub mouse: Option<PathBuf>,
    pub keyboard: Option<PathBuf>,
    pub audio_sink: Option<String>,
}

impl InstanceDevices {
    /// Every device node that must be re-exposed inside the sandbox.
    pub fn nodes(&self) -> impl Iterator<Item = &PathBuf> {
        [&self.joystick, &self.mouse, &self.keyboard]
            .into_iter()
            .flatten()
    }
}

impl Instance {
    pub fn new(
        profile: &Profile,
        index: usize,
        slot: usize,
        prefix_base: &Path,
        log_dir: &Path,
    ) -> Self {
        let name = format!("{}_instance_{index}", profile.game_name());
        Instance {
            index,
            slot,
            prefix_dir: prefix_base.join(&name),
            log_path: log_dir.join(format!("{name}.log")),
            pid: None,
            devices: InstanceDevices::default(),
        }
    }

    /// Window size for this instance. Always derived from the profile, never
    /// stored.
    pub fn dimensions(&self, profile: &Profile) -> (u32, u32) {
        instance_dimensions(
            profile.display_width(),
            profile.display_height(),
            profile.layout_mode(),
            profile.split_orientation(),
            profile.effective_player_count(),
            self.slot,
        )
    }
}

/// Splits the aggregate display area between `count` instances.
///
/// Horizontal places two players side by side; three players put the first
/// one across the top half with the other two sharing the bottom half.
/// Vertical is the transposed arrangement. Four players always get a 2x2 grid.
pub fn instance_dimensions(
    width: u32,
    height: u32,
    layout: LayoutMode,
    orientation: Option<SplitOrientation>,
    count: usize,
    slot: usize,
) -> (u32, u32) {
    if layout == LayoutMode::None || count <= 1 {
        return (width, height);
    }
    let orientation = orientation.unwrap_or(SplitOrientation::Horizontal);
    match (count, orientation) {
        (2, SplitOrientation::Horizontal) => (width / 2, height),
        (2, SplitOrientation::Vertical) => (width, height / 2),
        (3, SplitOrientation::Horizontal) if slot == 1 => (width, height / 2),
        (3, SplitOrientation::Vertical) if slot == 1 => (width / 2, height),
        _ => (width / 2, height / 2),
    }
}
