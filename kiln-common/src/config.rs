// kiln-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::error::{KilnError, Result};

// Fallback when KILN_PREFIX is not set or is empty.
const DEFAULT_FALLBACK_KILN_ROOT: &str = "/opt/kiln";
const DEFAULT_FETCH_ATTEMPTS: u32 = 3;
const MAX_DEFAULT_JOBS: usize = 6;

#[derive(Debug, Clone)]
pub struct Config {
    pub kiln_root: PathBuf,
    pub formula_dir: PathBuf,
    pub cache_root: PathBuf,
    pub stage_timeout: Option<Duration>,
    pub jobs: usize,
    pub fetch_attempts: u32,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading kiln configuration");

        let kiln_root = env::var("KILN_PREFIX")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                debug!(
                    "KILN_PREFIX not set or empty, falling back to default: {}",
                    DEFAULT_FALLBACK_KILN_ROOT
                );
                PathBuf::from(DEFAULT_FALLBACK_KILN_ROOT)
            });
        debug!("Effective KILN_PREFIX set to: {}", kiln_root.display());

        let mut config = Self::with_root(kiln_root);

        if let Some(dir) = non_empty_var("KILN_FORMULA_PATH") {
            config.formula_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty_var("KILN_CACHE") {
            config.cache_root = PathBuf::from(dir);
        }
        if let Some(raw) = non_empty_var("KILN_STAGE_TIMEOUT") {
            config.stage_timeout = Some(parse_timeout(&raw)?);
        }
        if let Some(raw) = non_empty_var("KILN_JOBS") {
            config.jobs = raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    KilnError::Config(format!("KILN_JOBS must be a positive integer, got '{raw}'"))
                })?;
        }
        if let Some(raw) = non_empty_var("KILN_FETCH_ATTEMPTS") {
            config.fetch_attempts = raw
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    KilnError::Config(format!(
                        "KILN_FETCH_ATTEMPTS must be a positive integer, got '{raw}'"
                    ))
                })?;
        }

        debug!("Configuration loaded successfully: {:?}", config);
        Ok(config)
    }

    /// A configuration rooted at `kiln_root` with every other setting at its default.
    pub fn with_root(kiln_root: impl Into<PathBuf>) -> Self {
        let kiln_root = kiln_root.into();
        Self {
            formula_dir: kiln_root.join("Library").join("Formula"),
            cache_root: kiln_root.join("kiln_cache"),
            kiln_root,
            stage_timeout: None,
            jobs: default_jobs(),
            fetch_attempts: DEFAULT_FETCH_ATTEMPTS,
        }
    }

    pub fn kiln_root(&self) -> &Path {
        &self.kiln_root
    }

    pub fn formula_dir(&self) -> &Path {
        &self.formula_dir
    }

    pub fn cellar_dir(&self) -> PathBuf {
        self.kiln_root.join("Cellar")
    }

    pub fn opt_dir(&self) -> PathBuf {
        self.kiln_root.join("opt")
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.kiln_root.join("etc")
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_root
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_root.join("downloads")
    }

    pub fn build_root(&self) -> PathBuf {
        self.kiln_root.join("tmp").join("build")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.kiln_root.join("kiln_logs")
    }

    pub fn formula_cellar_dir(&self, formula_name: &str) -> PathBuf {
        self.cellar_dir().join(formula_name)
    }

    pub fn formula_keg_path(&self, formula_name: &str, version: &str) -> PathBuf {
        self.formula_cellar_dir(formula_name).join(version)
    }

    pub fn formula_opt_path(&self, formula_name: &str) -> PathBuf {
        self.opt_dir().join(formula_name)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn parse_timeout(raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim()).map_err(|e| {
        KilnError::Config(format!("Invalid KILN_STAGE_TIMEOUT '{raw}': {e}"))
    })
}

/// Concurrent formula builds when nothing is configured: physical cores less one, clamped to 1..=6.
pub fn default_jobs() -> usize {
    std::cmp::max(1, num_cpus::get_physical().saturating_sub(1)).min(MAX_DEFAULT_JOBS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_derive_from_root() {
        let config = Config::with_root("/tmp/kiln-root");
        assert_eq!(
            config.formula_keg_path("opencilk", "3.0"),
            PathBuf::from("/tmp/kiln-root/Cellar/opencilk/3.0")
        );
        assert_eq!(
            config.formula_opt_path("xz"),
            PathBuf::from("/tmp/kiln-root/opt/xz")
        );
        assert_eq!(
            config.downloads_dir(),
            PathBuf::from("/tmp/kiln-root/kiln_cache/downloads")
        );
        assert_eq!(config.fetch_attempts, 3);
        assert!(config.jobs >= 1 && config.jobs <= MAX_DEFAULT_JOBS);
    }

    #[test]
    fn timeouts_use_humantime_syntax() {
        assert_eq!(parse_timeout("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_timeout("2h 30m").unwrap(), Duration::from_secs(9000));
        assert!(parse_timeout("soon").is_err());
    }
}
