// kiln-core/src/build/devtools.rs
//! Host toolchain discovery. Everything found here ends up in a [`PlatformProfile`]; nothing
//! downstream inspects the host again.

use std::cmp::Ordering;
use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use kiln_common::error::{KilnError, Result};
use kiln_common::model::platform::{
    capability, fact, Arch, FlagOverrides, OsFamily, PlatformProfile,
};
use tracing::{debug, instrument};

const DEFAULT_CLT_PATH: &str = "/Library/Developer/CommandLineTools";

/// Builds the profile of the running host, rooted at `prefix_root`.
#[instrument(skip_all)]
pub fn detect_platform(prefix_root: &Path) -> PlatformProfile {
    let os = OsFamily::current();
    let mut platform = PlatformProfile::new(os, Arch::current(), prefix_root)
        .with_flag_overrides(FlagOverrides::from_env());

    if let Some(kernel) = capture("uname", &["-r"]).and_then(|r| major(&r)) {
        platform = platform.with_fact(fact::KERNEL_VERSION, kernel);
    }

    if os == OsFamily::MacOs {
        platform = detect_apple_toolchain(platform);
    }

    if let Ok(cc) = find_compiler("cc") {
        let resolved = cc.canonicalize().unwrap_or(cc);
        let is_clang = os == OsFamily::MacOs
            || resolved
                .file_name()
                .is_some_and(|n| n.to_string_lossy().contains("clang"));
        if is_clang {
            platform = platform.with_capability(capability::COMPILER_CLANG);
        }
    }

    debug!(
        "Detected platform: {} {} capabilities={:?} facts={:?}",
        platform.os, platform.arch, platform.capabilities, platform.facts
    );
    platform
}

fn detect_apple_toolchain(mut platform: PlatformProfile) -> PlatformProfile {
    let macos = get_macos_version();
    if let Some(version) = &macos {
        platform = platform.with_fact(fact::MACOS_VERSION, version.clone());
    }

    let clt = Path::new(DEFAULT_CLT_PATH);
    let clt_installed = clt.join("usr").join("bin").join("clang").is_file();
    if clt_installed {
        platform = platform
            .with_capability(capability::CLT_INSTALLED)
            .with_fact(fact::CLT_PATH, DEFAULT_CLT_PATH);
    }

    let developer_dir = env::var("DEVELOPER_DIR")
        .ok()
        .filter(|d| !d.trim().is_empty())
        .or_else(|| capture("xcode-select", &["-p"]));
    if let Some(dir) = developer_dir {
        if dir.contains(".app/") && Path::new(&dir).is_dir() {
            platform = platform.with_capability(capability::XCODE_INSTALLED);
        }
    }

    if let Ok(sdk) = find_sdk_path() {
        platform = platform.with_fact(fact::SDK_PATH, sdk.to_string_lossy());
        if macos
            .as_deref()
            .is_some_and(|v| compare_versions(v, "10.15") != Ordering::Less)
        {
            platform = platform.with_capability(capability::SYSTEM_FFI_HEADERS);
        }
    }

    if clt_installed
        && macos
            .as_deref()
            .is_some_and(|v| compare_versions(v, "10.14") != Ordering::Less)
    {
        platform = platform.with_capability(capability::CLT_SEPARATE_HEADER_PACKAGE);
    }
    platform
}

pub fn find_compiler(name: &str) -> Result<PathBuf> {
    let env_var_name = match name {
        "cc" => "CC",
        "c++" | "cxx" => "CXX",
        _ => "",
    };
    if !env_var_name.is_empty() {
        if let Ok(compiler_path) = env::var(env_var_name) {
            let path = PathBuf::from(&compiler_path);
            if path.is_file() {
                debug!("Using compiler from env var {}: {}", env_var_name, path.display());
                return Ok(path);
            }
            debug!(
                "Env var {} points to non-existent file: {}",
                env_var_name, compiler_path
            );
        }
    }

    if cfg!(target_os = "macos") {
        if let Some(found) = capture("xcrun", &["--find", name]) {
            let path = PathBuf::from(found);
            if path.is_file() {
                debug!("Found compiler via xcrun: {}", path.display());
                return Ok(path);
            }
        }
    }

    debug!("Falling back to searching PATH for '{name}'");
    which::which(name).map_err(|e| {
        KilnError::NotFound(format!("Failed to find compiler '{name}' on PATH: {e}"))
    })
}

/// `SDKROOT` if it points somewhere, otherwise whatever `xcrun --show-sdk-path` reports.
pub fn find_sdk_path() -> Result<PathBuf> {
    if let Ok(root) = env::var("SDKROOT") {
        let path = PathBuf::from(root);
        if path.is_dir() {
            return Ok(path);
        }
    }
    debug!("Attempting to find macOS SDK path using xcrun");
    match capture("xcrun", &["--show-sdk-path"]) {
        Some(path) if path != "/" => {
            let sdk_path = PathBuf::from(path);
            if sdk_path.exists() {
                Ok(sdk_path)
            } else {
                Err(KilnError::NotFound(format!(
                    "SDK path reported by xcrun does not exist: {}",
                    sdk_path.display()
                )))
            }
        }
        _ => Err(KilnError::NotFound(
            "xcrun returned no SDK path. Is Xcode or Command Line Tools installed?".to_string(),
        )),
    }
}

/// The macOS version in the spelling SDKs use: `14` from Big Sur on, `10.15` before.
pub fn get_macos_version() -> Option<String> {
    let full = capture("sw_vers", &["-productVersion"])?;
    let version = normalize_macos_version(&full);
    debug!("Found macOS version: {full} (normalized: {version})");
    Some(version)
}

fn normalize_macos_version(full: &str) -> String {
    let parts: Vec<&str> = full.trim().split('.').collect();
    match parts.as_slice() {
        [major, ..] if major.parse::<u32>().is_ok_and(|m| m >= 11) => major.to_string(),
        [major, minor, ..] => format!("{major}.{minor}"),
        _ => full.trim().to_string(),
    }
}

fn major(version: &str) -> Option<String> {
    let digits: String = version.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}

/// Numeric comparison of dotted versions; missing components count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ordering = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn capture(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .output();
    match output {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
            (!text.is_empty()).then_some(text)
        }
        Ok(out) => {
            debug!(
                "'{} {}' failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
            None
        }
        Err(e) => {
            debug!("Failed to execute '{}': {}", program, e);
            None
        }
    }
}
