use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::error::LaunchError;
use crate::util::{SanitizePath, get_screen_resolution};

pub const MAX_PLAYERS: usize = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutMode {
    #[default]
    None,
    #[serde(alias = "splitscreen")]
    SplitScreen,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitOrientation {
    Horizontal,
    Vertical,
}

/// On-disk shape of a profile. Nothing here is trusted until it has gone
/// through [`Profile::new`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSpec {
    pub game_name: String,
    pub executable_path: Option<PathBuf>,
    pub executable_args: Vec<String>,
    pub runtime_version: Option<String>,
    pub player_count: usize,
    pub display_width: Option<u32>,
    pub display_height: Option<u32>,
    pub layout_mode: LayoutMode,
    pub split_orientation: Option<SplitOrientation>,
    pub per_player_device_ids: Vec<String>,
    pub per_player_mouse_ids: Vec<String>,
    pub per_player_keyboard_ids: Vec<String>,
    pub per_player_audio_sinks: Vec<String>,
    pub environment_overrides: BTreeMap<String, String>,
    pub selected_players: Vec<usize>,
}

/// A validated launch request. Read-only once constructed.
#[derive(Clone, Debug)]
pub struct Profile {
    game_name: String,
    executable_path: Option<PathBuf>,
    executable_args: Vec<String>,
    runtime_version: Option<String>,
    player_count: usize,
    display_width: u32,
    display_height: u32,
    layout_mode: LayoutMode,
    split_orientation: Option<SplitOrientation>,
    per_player_device_ids: Vec<String>,
    per_player_mouse_ids: Vec<String>,
    per_player_keyboard_ids: Vec<String>,
    per_player_audio_sinks: Vec<String>,
    environment_overrides: BTreeMap<String, String>,
    selected_players: Vec<usize>,
}

impl Profile {
    pub fn new(spec: ProfileSpec) -> Result<Self, LaunchError> {
        let invalid = |msg: String| Err(LaunchError::ProfileInvalid(msg));

        let game_name = spec.game_name.sanitize_path();
        if game_name.is_empty() {
            return invalid("game name is empty".into());
        }
        if !(1..=MAX_PLAYERS).contains(&spec.player_count) {
            return invalid(format!(
                "player count {} outside 1..={MAX_PLAYERS}",
                spec.player_count
            ));
        }
        let (display_width, display_height) = match (spec.display_width, spec.display_height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            (w, h) => {
                return invalid(format!(
                    "display size must be positive, got {}x{}",
                    w.unwrap_or(0),
                    h.unwrap_or(0)
                ));
            }
        };
        if spec.layout_mode == LayoutMode::SplitScreen && spec.split_orientation.is_none() {
            return invalid("split-screen layout requires an orientation".into());
        }

        let mut selected_players = spec.selected_players;
        selected_players.sort_unstable();
        selected_players.dedup();
        if let Some(bad) = selected_players
            .iter()
            .find(|p| **p == 0 || **p > spec.player_count)
        {
            return invalid(format!(
                "selected player {bad} outside 1..={}",
                spec.player_count
            ));
        }

        // "None" is what the editor writes for a native title
        let runtime_version = spec
            .runtime_version
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("none"));

        Ok(Profile {
            game_name,
            executable_path: spec.executable_path,
            executable_args: spec.executable_args,
            runtime_version,
            player_count: spec.player_count,
            display_width,
            display_height,
            layout_mode: spec.layout_mode,
            split_orientation: spec.split_orientation,
            per_player_device_ids: spec.per_player_device_ids,
            per_player_mouse_ids: spec.per_player_mouse_ids,
            per_player_keyboard_ids: spec.per_player_keyboard_ids,
            per_player_audio_sinks: spec.per_player_audio_sinks,
            environment_overrides: spec.environment_overrides,
            selected_players,
        })
    }

    /// Loads a JSON profile. A missing display size is filled in from the
    /// current screen before validation.
    pub fn load(path: &Path) -> Result<Self, LaunchError> {
        let file = File::open(path).map_err(|e| LaunchError::io(path, e))?;
        let mut spec: ProfileSpec = serde_json::from_reader(BufReader::new(file))?;
        if spec.display_width.is_none() || spec.display_height.is_none() {
            let (w, h) = get_screen_resolution();
            spec.display_width.get_or_insert(w);
            spec.display_height.get_or_insert(h);
        }
        Profile::new(spec)
    }

    pub fn game_name(&self) -> &str {
        &self.game_name
    }

    pub fn executable_path(&self) -> Option<&Path> {
        self.executable_path.as_deref()
    }

    /// The target binary, which every real launch needs.
    pub fn require_executable(&self) -> Result<&Path, LaunchError> {
        self.executable_path().ok_or_else(|| {
            LaunchError::ProfileInvalid(format!("no executable set for '{}'", self.game_name))
        })
    }

    pub fn executable_args(&self) -> &[String] {
        &self.executable_args
    }

    pub fn runtime_version(&self) -> Option<&str> {
        self.runtime_version.as_deref()
    }

    pub fn is_native(&self) -> bool {
        self.runtime_version.is_none()
    }

    pub fn display_width(&self) -> u32 {
        self.display_width
    }

    pub fn display_height(&self) -> u32 {
        self.display_height
    }

    pub fn layout_mode(&self) -> LayoutMode {
        self.layout_mode
    }

    pub fn split_orientation(&self) -> Option<SplitOrientation> {
        self.split_orientation
    }

    pub fn per_player_device_ids(&self) -> &[String] {
        &self.per_player_device_ids
    }

    pub fn per_player_mouse_ids(&self) -> &[String] {
        &self.per_player_mouse_ids
    }

    pub fn per_player_keyboard_ids(&self) -> &[String] {
        &self.per_player_keyboard_ids
    }

    pub fn per_player_audio_sinks(&self) -> &[String] {
        &self.per_player_audio_sinks
    }

    pub fn environment_overrides(&self) -> &BTreeMap<String, String> {
        &self.environment_overrides
    }

    pub fn effective_player_count(&self) -> usize {
        if self.selected_players.is_empty() {
            self.player_count
        } else {
            self.selected_players.len()
        }
    }

    /// Player numbers to launch, in launch order.
    pub fn players_to_launch(&self) -> Vec<usize> {
        if self.selected_players.is_empty() {
            (1..=self.player_count).collect()
        } else {
            self.selected_players.clone()
        }
    }

    /// Returns a copy restricted to the given players.
    pub fn with_selected_players(&self, players: Vec<usize>) -> Result<Self, LaunchError> {
        let mut spec = self.to_spec();
        spec.selected_players = players;
        Profile::new(spec)
    }

    fn to_spec(&self) -> ProfileSpec {
        ProfileSpec {
            game_name: self.game_name.clone(),
            executable_path: self.executable_path.clone(),
            executable_args: self.executable_args.clone(),
            runtime_version: self.runtime_version.clone(),
            player_count: self.player_count,
            display_width: Some(self.display_width),
            display_height: Some(self.display_height),
            layout_mode: self.layout_mode,
            split_orientation: self.split_orientation,
            per_player_device_ids: self.per_player_device_ids.clone(),
            per_player_mouse_ids: self.per_player_mouse_ids.clone(),
            per_player_keyboard_ids: self.per_player_keyboard_ids.clone(),
            per_player_audio_sinks: self.per_player_audio_sinks.clone(),
            environment_overrides: self.environment_overrides.clone(),
            selected_players: self.selected_players.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_spec(players: usize) -> ProfileSpec {
    ProfileSpec {
        game_name: "Test Game".to_string(),
        executable_path: Some(PathBuf::from("/games/test/game.exe")),
        player_count: players,
        display_width: Some(1920),
        display_height: Some(1080),
        ..Default::default()
    }
}
