// Re-export all utility functions from submodules
mod filesystem;
mod lock;
mod proton;
mod sys;

pub use filesystem::SanitizePath;

pub use lock::SessionLock;

pub use proton::{ProtonInstall, RuntimeResolver};

pub use sys::{KwinScript, get_screen_resolution, is_kde_desktop, kwin_script_name};
