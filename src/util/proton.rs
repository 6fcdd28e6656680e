use crate::error::LaunchError;
use crate::paths::PATH_HOME;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Subdirectories of a library root that may hold Proton builds: Steam's own
/// tool installs, then custom compatibility tools.
const SEARCH_DIRS: [&str; 2] = ["steamapps/common", "compatibilitytools.d"];

/// Launcher script every Proton build ships at its top level.
const PROTON_SCRIPT: &str = "proton";

/// A Proton launcher plus the Steam root it was found under. The root is what
/// Proton expects in `STEAM_COMPAT_CLIENT_INSTALL_PATH`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtonInstall {
    pub executable: PathBuf,
    pub root_path: PathBuf,
}

/// Looks up Proton versions across Steam library roots.
///
/// Lookups are memoized per version for the lifetime of the resolver, misses
/// included, since every instance of a session asks for the same version.
pub struct RuntimeResolver {
    roots: Vec<PathBuf>,
    cache: HashMap<String, Option<ProtonInstall>>,
}

impl RuntimeResolver {
    /// Uses exactly the given roots, skipping the ones that do not exist.
    pub fn with_roots(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut seen = HashSet::new();
        let roots = roots
            .into_iter()
            .filter(|root| root.is_dir())
            .filter(|root| {
                let canonical = root.canonicalize().unwrap_or_else(|_| root.clone());
                seen.insert(canonical)
            })
            .collect::<Vec<_>>();
        log::debug!("Runtime library roots: {roots:?}");
        RuntimeResolver {
            roots,
            cache: HashMap::new(),
        }
    }

    /// The well-known Steam locations, then `extra`, then whatever library
    /// folders the Steam client itself reports.
    pub fn discover(extra: &[PathBuf]) -> Self {
        let mut roots = default_library_roots();
        roots.extend(extra.iter().cloned());
        roots.extend(steam_library_roots());
        Self::with_roots(roots)
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn resolve(&mut self, version: &str) -> Result<ProtonInstall, LaunchError> {
        if let Some(cached) = self.cache.get(version) {
            return match cached {
                Some(install) => {
                    log::debug!("Proton '{version}' found in cache: {:?}", install.executable);
                    Ok(install.clone())
                }
                None => Err(LaunchError::RuntimeNotFound(version.to_string())),
            };
        }

        log::info!("Searching for Proton: {version}...");
        let found = self
            .roots
            .iter()
            .find_map(|root| search_root(root, version));
        self.cache.insert(version.to_string(), found.clone());

        match found {
            Some(install) => {
                log::info!("Proton '{version}' found at {}", install.executable.display());
                Ok(install)
            }
            None => Err(LaunchError::RuntimeNotFound(version.to_string())),
        }
    }

    /// Names of every Proton build under the configured roots, sorted.
    pub fn list_installed(&self) -> BTreeSet<String> {
        let mut installed = BTreeSet::new();
        for root in &self.roots {
            for dir in SEARCH_DIRS {
                let dir = root.join(dir);
                if !dir.is_dir() {
                    continue;
                }
                for entry in WalkDir::new(&dir)
                    .min_depth(1)
                    .max_depth(1)
                    .follow_links(true)
                    .into_iter()
                    .flatten()
                {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if entry.file_type().is_dir()
                        && name.to_lowercase().contains("proton")
                        && entry.path().join(PROTON_SCRIPT).exists()
                    {
                        installed.insert(name);
                    }
                }
            }
        }
        log::info!("Found Proton versions: {installed:?}");
        installed
    }
}

/// Directory names a version string may be installed under.
fn version_names(version: &str) -> Vec<String> {
    let mut names = vec![
        version.to_string(),
        format!("Proton {version}"),
        format!("GE-Proton{version}"),
    ];
    if version == "Experimental" {
        names.push("Proton - Experimental".to_string());
    }
    names
}

fn search_root(root: &Path, version: &str) -> Option<ProtonInstall> {
    let names = version_names(version);
    SEARCH_DIRS
        .iter()
        .map(|dir| root.join(dir))
        .filter(|dir| dir.is_dir())
        .find_map(|dir| {
            names
                .iter()
                .map(|name| dir.join(name).join(PROTON_SCRIPT))
                .find(|script| script.exists())
        })
        .map(|executable| ProtonInstall {
            executable,
            root_path: root.to_path_buf(),
        })
}

fn default_library_roots() -> Vec<PathBuf> {
    [
        ".steam/root",
        ".local/share/Steam",
        ".steam/steam",
        ".steam/debian-installation",
        ".var/app/com.valvesoftware.Steam/data/Steam",
    ]
    .iter()
    .map(|rel| PATH_HOME.join(rel))
    .collect()
}

/// Library folders registered with the Steam client, if it is installed.
fn steam_library_roots() -> Vec<PathBuf> {
    let steam_dir = match steamlocate::SteamDir::locate() {
        Ok(dir) => dir,
        Err(e) => {
            log::debug!("Steam installation not located: {e}");
            return Vec::new();
        }
    };
    let mut roots = vec![steam_dir.path().to_path_buf()];
    match steam_dir.libraries() {
        Ok(libraries) => {
            roots.extend(libraries.flatten().map(|lib| lib.path().to_path_buf()));
        }
        Err(e) => log::debug!("Failed to read Steam library folders: {e}"),
    }
    roots
}
