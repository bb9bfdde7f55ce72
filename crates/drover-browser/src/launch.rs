use std::path::{Path, PathBuf};

use drover_core::AppError;
use serde::{Deserialize, Serialize};

/// Well-known Chrome/Chromium locations, checked in order.
const CHROME_CANDIDATES: &[&str] = &[
    // Snap (Ubuntu default). The /snap/bin wrapper strips headless flags,
    // so point at the real binary inside the snap.
    "/snap/chromium/current/usr/lib/chromium-browser/chrome",
    // Flatpak
    "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
    // Common apt / manual installs
    "/usr/bin/google-chrome-stable",
    "/usr/bin/google-chrome",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
];

const BASE_ARGS: &[&str] = &[
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--disable-extensions",
    "--disable-popup-blocking",
    "--disable-translate",
    "--no-first-run",
];

/// How each pooled Chromium process is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchOptions {
    /// Explicit binary. `None` means search [`CHROME_CANDIDATES`], then let
    /// chromiumoxide do its own lookup.
    pub chrome_executable: Option<PathBuf>,
    pub headless: bool,
    pub no_sandbox: bool,
    /// Parent directory for per-browser profiles. Every launched browser gets
    /// its own subdirectory so concurrent processes never share a profile.
    pub profile_root: PathBuf,
    pub extra_args: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            chrome_executable: None,
            headless: true,
            no_sandbox: true,
            profile_root: std::env::temp_dir().join("drover-profiles"),
            extra_args: Vec::new(),
        }
    }
}

impl LaunchOptions {
    /// Read launch options from the environment.
    ///
    /// - `CHROME_BIN`: explicit browser binary
    /// - `DROVER_BROWSER_HEADLESS`: `true`/`false` (default `true`)
    /// - `DROVER_BROWSER_ARGS`: extra flags, whitespace separated
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut options = Self::default();
        if let Some(bin) = lookup("CHROME_BIN") {
            options.chrome_executable = Some(PathBuf::from(bin));
        }
        if let Some(raw) = lookup("DROVER_BROWSER_HEADLESS") {
            options.headless = raw.trim().parse().map_err(|_| {
                AppError::ConfigError(format!(
                    "Invalid DROVER_BROWSER_HEADLESS '{raw}': expected true or false"
                ))
            })?;
        }
        if let Some(raw) = lookup("DROVER_BROWSER_ARGS") {
            options.extra_args = raw.split_whitespace().map(String::from).collect();
        }
        Ok(options)
    }

    /// The binary to launch: the configured one if it exists, otherwise the
    /// first well-known location present on this machine.
    pub fn resolve_executable(&self) -> Option<PathBuf> {
        self.resolve_executable_with(|path| path.exists())
    }

    fn resolve_executable_with(&self, exists: impl Fn(&Path) -> bool) -> Option<PathBuf> {
        if let Some(path) = &self.chrome_executable {
            if exists(path) {
                return Some(path.clone());
            }
            tracing::warn!(path = %path.display(), "Configured Chrome binary not found, searching defaults");
        }
        CHROME_CANDIDATES
            .iter()
            .map(PathBuf::from)
            .find(|p| exists(p))
    }

    /// Command-line flags for one browser process. Headless mode is not a
    /// flag here; the launcher sets it from [`headless`](Self::headless).
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(BASE_ARGS.len() + self.extra_args.len());
        args.extend(BASE_ARGS.iter().map(|a| a.to_string()));
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Profile directory for the browser with the given pool id.
    pub fn profile_dir(&self, resource_id: u64) -> PathBuf {
        self.profile_root
            .join(format!("{}-{resource_id}", std::process::id()))
    }
}
