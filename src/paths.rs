use std::path::PathBuf;
use std::sync::LazyLock;

pub static PATH_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
});

/// `$XDG_CONFIG_HOME/splitcoop`, holding `config.json` and the KWin scripts.
pub static PATH_APP: LazyLock<PathBuf> = LazyLock::new(|| {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PATH_HOME.join(".config"))
        .join("splitcoop")
});

/// Per-session scratch data such as lock files and instance logs.
pub static PATH_CACHE: LazyLock<PathBuf> = LazyLock::new(|| {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PATH_HOME.join(".cache"))
        .join("splitcoop")
});

pub static PATH_PREFIXES: LazyLock<PathBuf> =
    LazyLock::new(|| PATH_HOME.join("Games/splitcoop/prefixes"));

pub static PATH_RES: LazyLock<PathBuf> = LazyLock::new(|| PATH_APP.join("res"));
