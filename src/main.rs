mod config;
mod error;
mod input;
mod instance;
mod launch;
mod paths;
mod profile;
mod sandbox;
mod supervisor;
mod util;

use std::path::{Path, PathBuf};

use crate::config::LaunchConfig;
use crate::error::LaunchError;
use crate::input::{list_audio_sinks, list_input_devices};
use crate::launch::{CancelToken, Orchestrator};
use crate::paths::PATH_RES;
use crate::profile::Profile;
use crate::util::*;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        println!("{}", USAGE_TEXT);
        std::process::exit(0);
    }

    let cfg = match LaunchConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if args.iter().any(|arg| arg == "--list-runtimes") {
        let resolver = RuntimeResolver::discover(&cfg.extra_library_roots);
        if resolver.roots().is_empty() {
            eprintln!("No Steam library folders found");
        }
        for version in resolver.list_installed() {
            println!("{version}");
        }
        std::process::exit(0);
    }

    if args.iter().any(|arg| arg == "--list-devices") {
        print_devices();
        std::process::exit(0);
    }

    let mut selected = Vec::new();
    if let Some(players_index) = args.iter().position(|arg| arg == "--players") {
        match args.get(players_index + 1).map(|s| parse_players(s)) {
            Some(Some(players)) => selected = players,
            _ => {
                eprintln!("{}", USAGE_TEXT);
                std::process::exit(1);
            }
        }
    }

    let Some(profile_path) = profile_arg(&args) else {
        eprintln!("{}", USAGE_TEXT);
        std::process::exit(1);
    };

    match run(cfg, &profile_path, selected) {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    }
}

/// Runs one session. `Ok(false)` means nothing could be launched.
fn run(cfg: LaunchConfig, profile_path: &Path, selected: Vec<usize>) -> Result<bool, LaunchError> {
    let mut profile = Profile::load(profile_path)?;
    if !selected.is_empty() {
        profile = profile.with_selected_players(selected)?;
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        log::warn!("Failed to install signal handler: {e}");
    }

    let mut kwin = KwinScript::default();
    if cfg.enable_kwin_script && is_kde_desktop() && profile.effective_player_count() > 1 {
        let script =
            PATH_RES.join(kwin_script_name(profile.layout_mode(), profile.split_orientation()));
        if let Err(e) = kwin.start(&script) {
            log::warn!("KWin layout script not loaded: {e}");
        }
    }

    let resolver = RuntimeResolver::discover(&cfg.extra_library_roots);
    let mut orchestrator = Orchestrator::new(cfg, resolver, cancel);
    let result = orchestrator.run(&profile);

    if let Err(e) = kwin.stop() {
        log::warn!("Failed to unload KWin script: {e}");
    }

    let report = result?;
    println!(
        "[SPLITCOOP] launched {} of {} instance(s)",
        report.launched.len(),
        report.requested
    );
    if !report.is_complete() && !report.cancelled {
        for (index, reason) in &report.failed {
            println!("[SPLITCOOP] instance {index} failed: {reason}");
        }
        log::warn!(
            "{} of {} instance(s) did not launch",
            report.requested - report.launched.len(),
            report.requested
        );
    }
    Ok(!report.launched.is_empty())
}

fn print_devices() {
    let devices = list_input_devices();
    for (label, list) in [
        ("Gamepads", &devices.joysticks),
        ("Mice", &devices.mice),
        ("Keyboards", &devices.keyboards),
    ] {
        println!("{label}:");
        for dev in list {
            println!("    {}  ({})", dev.id, dev.name);
        }
    }
    println!("Audio sinks:");
    for sink in list_audio_sinks() {
        println!("    {}  ({})", sink.id, sink.name);
    }
}

/// First argument that is neither a flag nor the value of `--players`.
fn profile_arg(args: &[String]) -> Option<PathBuf> {
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "--players" {
            skip_next = true;
            continue;
        }
        if !arg.starts_with("--") {
            return Some(PathBuf::from(arg));
        }
    }
    None
}

fn parse_players(value: &str) -> Option<Vec<usize>> {
    value
        .split(',')
        .map(|p| p.trim().parse::<usize>().ok())
        .collect()
}

static USAGE_TEXT: &str = r#"
Usage: splitcoop [OPTIONS] <profile.json>

Options:
    --players <list>      Launch only the given players, e.g. 1,3
    --list-runtimes       Print the Proton versions found in the Steam libraries
    --list-devices        Print input devices and audio sinks usable in a profile
    -h, --help            Show this message

Set RUST_LOG=debug for the full launch commands.
"#;
