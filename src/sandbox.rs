use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::LaunchConfig;
use crate::instance::Instance;
use crate::profile::Profile;
use crate::util::ProtonInstall;

/// Value of `SDL_JOYSTICK_DEVICE` for an instance that owns no controller.
pub const NO_DEVICE: &str = "/dev/null";

/// Directory whose contents are replaced by an empty tmpfs in every sandbox.
pub const INPUT_DEVICE_DIR: &str = "/dev/input";

/// Builds the argument vector that runs one instance: the namespace wrapper
/// outside, the compositor inside it, and the game (or Proton running the
/// game) inside the compositor.
pub struct SandboxCommandBuilder<'a> {
    cfg: &'a LaunchConfig,
}

impl<'a> SandboxCommandBuilder<'a> {
    pub fn new(cfg: &'a LaunchConfig) -> Self {
        SandboxCommandBuilder { cfg }
    }

    pub fn build(
        &self,
        profile: &Profile,
        instance: &Instance,
        runtime: Option<&Path>,
    ) -> Vec<String> {
        let mut argv = self.namespace_args(profile, instance);
        argv.extend(self.compositor_args(profile, instance, runtime));
        argv
    }

    fn namespace_args(&self, profile: &Profile, instance: &Instance) -> Vec<String> {
        let mut args: Vec<String> = vec![self.cfg.sandbox_command.clone()];
        let mut push = |parts: &[&str]| args.extend(parts.iter().map(|p| p.to_string()));

        push(&["--dev-bind", "/", "/"]);
        push(&["--proc", "/proc"]);
        push(&["--tmpfs", "/tmp"]);
        push(&["--tmpfs", INPUT_DEVICE_DIR]);

        // Only nodes assigned to this instance reappear under the emptied
        // device directory.
        for node in instance.devices.nodes() {
            let node = node.to_string_lossy().to_string();
            push(&["--dev-bind", node.as_str(), node.as_str()]);
        }
        if instance.devices.joystick.is_none() {
            log::info!(
                "Instance {}: no controller bound, {INPUT_DEVICE_DIR} stays empty of joysticks",
                instance.index
            );
        }

        let workdir = profile
            .executable_path()
            .and_then(Path::parent)
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(|dir| dir.to_string_lossy().to_string())
            .unwrap_or_else(|| "/".to_string());
        push(&["--chdir", workdir.as_str()]);

        args
    }

    fn compositor_args(
        &self,
        profile: &Profile,
        instance: &Instance,
        runtime: Option<&Path>,
    ) -> Vec<String> {
        let (width, height) = instance.dimensions(profile);
        let mut args = vec![
            self.cfg.compositor_command.clone(),
            "-W".to_string(),
            width.to_string(),
            "-H".to_string(),
            height.to_string(),
            "-f".to_string(),
            "--".to_string(),
        ];

        if let Some(runtime) = runtime {
            args.push(runtime.to_string_lossy().to_string());
            args.push("run".to_string());
        }
        match profile.executable_path() {
            Some(exec) => args.push(exec.to_string_lossy().to_string()),
            None => log::warn!(
                "Instance {}: no executable in profile, command has no target",
                instance.index
            ),
        }
        args.extend(profile.executable_args().iter().cloned());
        args
    }
}

/// Proton variables, present only when the game runs through a runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeEnvironment {
    pub client_install_path: PathBuf,
    pub compat_data_path: PathBuf,
    pub wine_prefix: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub dxvk_async: bool,
}

/// Everything an instance adds to the inherited environment.
///
/// [`InstanceEnvironment::vars`] emits runtime variables first, then device
/// routing, then audio, then the profile overrides, so overrides shadow every
/// default.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceEnvironment {
    pub runtime: Option<RuntimeEnvironment>,
    pub joystick_device: Option<PathBuf>,
    pub audio_sink: Option<String>,
    pub overrides: BTreeMap<String, String>,
}

impl InstanceEnvironment {
    pub fn prepare(
        profile: &Profile,
        instance: &Instance,
        runtime: Option<&ProtonInstall>,
        cfg: &LaunchConfig,
    ) -> Self {
        let runtime = runtime.map(|install| RuntimeEnvironment {
            client_install_path: install.root_path.clone(),
            compat_data_path: instance.prefix_dir.clone(),
            wine_prefix: instance.prefix_dir.join("pfx"),
            log_dir: cfg.runtime_logging.then(|| cfg.log_dir.clone()),
            dxvk_async: cfg.dxvk_async,
        });
        InstanceEnvironment {
            runtime,
            joystick_device: instance.devices.joystick.clone(),
            audio_sink: instance.devices.audio_sink.clone(),
            overrides: profile.environment_overrides().clone(),
        }
    }

    pub fn vars(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = Vec::new();
        let mut set = |key: &str, value: String| vars.push((key.to_string(), value));
        let display = |p: &Path| p.to_string_lossy().to_string();

        if let Some(rt) = &self.runtime {
            set(
                "STEAM_COMPAT_CLIENT_INSTALL_PATH",
                display(&rt.client_install_path),
            );
            set("STEAM_COMPAT_DATA_PATH", display(&rt.compat_data_path));
            set("WINEPREFIX", display(&rt.wine_prefix));
            if rt.dxvk_async {
                set("DXVK_ASYNC", "1".to_string());
            }
            if let Some(log_dir) = &rt.log_dir {
                set("PROTON_LOG", "1".to_string());
                set("PROTON_LOG_DIR", display(log_dir));
            }
        }

        set(
            "SDL_JOYSTICK_DEVICE",
            self.joystick_device
                .as_deref()
                .map(display)
                .unwrap_or_else(|| NO_DEVICE.to_string()),
        );
        // hidraw nodes live outside /dev/input and would bypass the isolation
        set("SDL_JOYSTICK_HIDAPI", "0".to_string());
        set("PROTON_DISABLE_HIDRAW", "1".to_string());

        if let Some(sink) = &self.audio_sink {
            set("PULSE_SINK", sink.clone());
        }

        for (key, value) in &self.overrides {
            set(key.as_str(), value.clone());
        }
        vars
    }
}
