use std::error::Error;
use std::path::Path;
use x11rb::connection::Connection;

use crate::profile::{LayoutMode, SplitOrientation};

pub fn get_screen_resolution() -> (u32, u32) {
    if let Ok(conn) = x11rb::connect(None) {
        if let Some(screen) = conn.0.setup().roots.get(conn.1) {
            log::info!(
                "Got screen resolution: {}x{}",
                screen.width_in_pixels,
                screen.height_in_pixels
            );
            return (
                screen.width_in_pixels as u32,
                screen.height_in_pixels as u32,
            );
        }
    }
    log::warn!("Failed to detect screen resolution, using 1920x1080");
    (1920, 1080)
}

pub fn is_kde_desktop() -> bool {
    std::env::var("XDG_CURRENT_DESKTOP")
        .map(|desktop| desktop.contains("KDE"))
        .unwrap_or(false)
}

/// KWin script that tiles the compositor windows for a layout.
pub fn kwin_script_name(layout: LayoutMode, orientation: Option<SplitOrientation>) -> &'static str {
    match (layout, orientation) {
        (LayoutMode::SplitScreen, Some(SplitOrientation::Vertical)) => "splitcoop_vertical.js",
        (LayoutMode::SplitScreen, _) => "splitcoop_horizontal.js",
        (LayoutMode::None, _) => "splitcoop_fullscreen.js",
    }
}

/// Window layout helper loaded into the running KWin session for the length
/// of a launch. Remembers the script id it registered so exactly that script
/// is unloaded again.
#[derive(Default)]
pub struct KwinScript {
    script_id: Option<i32>,
}

impl KwinScript {
    pub fn start(&mut self, file: &Path) -> Result<(), Box<dyn Error>> {
        log::info!("Loading KWin script {}...", file.display());
        if !file.exists() {
            return Err(format!("Script file {} doesn't exist", file.display()).into());
        }

        let conn = zbus::blocking::Connection::session()?;
        let proxy = zbus::blocking::Proxy::new(
            &conn,
            "org.kde.KWin",
            "/Scripting",
            "org.kde.kwin.Scripting",
        )?;

        let script_id: i32 = proxy.call(
            "loadScript",
            &(file.to_string_lossy().into_owned(), "splitcoop"),
        )?;
        log::info!("Script loaded as id {script_id}. Starting...");

        let _: () = proxy.call("start", &())?;
        self.script_id = Some(script_id);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), Box<dyn Error>> {
        if self.script_id.take().is_none() {
            return Ok(());
        }
        log::info!("Unloading KWin script...");
        let conn = zbus::blocking::Connection::session()?;
        let proxy = zbus::blocking::Proxy::new(
            &conn,
            "org.kde.KWin",
            "/Scripting",
            "org.kde.kwin.Scripting",
        )?;
        let _: bool = proxy.call("unloadScript", &("splitcoop",))?;
        log::info!("Script unloaded.");
        Ok(())
    }
}
