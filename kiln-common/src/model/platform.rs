// kiln-common/src/model/platform.rs
//! The target platform as an explicit value. Everything host-specific that influences a build
//! (OS family, architecture, SDK locations, capability flags, externally supplied compiler flags)
//! is captured here once per run and handed to pure functions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

/// Well-known capability names. The set is open: formulas may test any string.
pub mod capability {
    pub const SYSTEM_FFI_HEADERS: &str = "system-ffi-headers";
    pub const CLT_INSTALLED: &str = "clt-installed";
    pub const XCODE_INSTALLED: &str = "xcode-installed";
    pub const CLT_SEPARATE_HEADER_PACKAGE: &str = "clt-separate-header-package";
    pub const COMPILER_CLANG: &str = "compiler-clang";
}

/// Well-known fact names.
pub mod fact {
    pub const SDK_PATH: &str = "sdk_path";
    pub const CLT_PATH: &str = "clt_path";
    pub const MACOS_VERSION: &str = "macos_version";
    pub const KERNEL_VERSION: &str = "kernel_version";
    pub const FFI_INCLUDE_DIR: &str = "ffi_include_dir";
    pub const FFI_LIBRARY_DIR: &str = "ffi_library_dir";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    MacOs,
    Linux,
    Other,
}

impl OsFamily {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            OsFamily::MacOs
        } else if cfg!(target_os = "linux") {
            OsFamily::Linux
        } else {
            OsFamily::Other
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::MacOs => write!(f, "macos"),
            OsFamily::Linux => write!(f, "linux"),
            OsFamily::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    Arm64,
    X86_64,
    Aarch64,
    Other,
}

impl Arch {
    pub fn current() -> Self {
        match std::env::consts::ARCH {
            "x86_64" => Arch::X86_64,
            // Apple calls it arm64, everyone else aarch64
            "aarch64" if cfg!(target_os = "macos") => Arch::Arm64,
            "aarch64" => Arch::Aarch64,
            _ => Arch::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
            Arch::Other => "unknown",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiler/linker flags supplied from the environment. Appended to synthesized arguments, never
/// substituted for them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagOverrides {
    pub cflags: Option<String>,
    pub cxxflags: Option<String>,
    pub ldflags: Option<String>,
}

impl FlagOverrides {
    pub fn from_env() -> Self {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            cflags: read("CFLAGS"),
            cxxflags: read("CXXFLAGS"),
            ldflags: read("LDFLAGS"),
        }
    }
}

/// `arch-vendor-system[version]`, e.g. `arm64-apple-darwin24` or `x86_64-unknown-linux-gnu`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetTriple {
    pub arch: String,
    pub vendor: String,
    pub system: String,
    #[serde(default)]
    pub version: String,
}

impl TargetTriple {
    pub fn new(
        arch: impl Into<String>,
        vendor: impl Into<String>,
        system: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            arch: arch.into(),
            vendor: vendor.into(),
            system: system.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for TargetTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}{}",
            self.arch, self.vendor, self.system, self.version
        )
    }
}

/// macOS releases toolchain config files are written for, newest first, with the major version
/// of the Darwin kernel each one ships.
pub const KNOWN_MACOS_VERSIONS: &[(&str, &str)] = &[
    ("26", "25"),
    ("15", "24"),
    ("14", "23"),
    ("13", "22"),
    ("12", "21"),
    ("11", "20"),
    ("10.15", "19"),
    ("10.14", "18"),
];

/// A triple a config file is generated for, plus the SDK version its content targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigTarget {
    pub triple: TargetTriple,
    /// `None` for the unversioned fallback and for non-Apple targets.
    pub sdk_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformProfile {
    pub os: OsFamily,
    pub arch: Arch,
    pub prefix_root: PathBuf,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
    #[serde(default)]
    pub flag_overrides: FlagOverrides,
}

impl PlatformProfile {
    pub fn new(os: OsFamily, arch: Arch, prefix_root: impl Into<PathBuf>) -> Self {
        Self {
            os,
            arch,
            prefix_root: prefix_root.into(),
            capabilities: BTreeSet::new(),
            facts: BTreeMap::new(),
            flag_overrides: FlagOverrides::default(),
        }
    }

    pub fn with_capability(mut self, name: impl Into<String>) -> Self {
        self.capabilities.insert(name.into());
        self
    }

    pub fn with_fact(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.facts.insert(name.into(), value.into());
        self
    }

    pub fn with_flag_overrides(mut self, flags: FlagOverrides) -> Self {
        self.flag_overrides = flags;
        self
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }

    pub fn fact(&self, name: &str) -> Option<&str> {
        self.facts.get(name).map(String::as_str)
    }

    pub fn require_fact(&self, name: &str) -> Result<&str> {
        self.fact(name).ok_or_else(|| KilnError::MissingPlatformFact {
            fact: name.to_string(),
        })
    }

    pub fn prefix_root(&self) -> &Path {
        &self.prefix_root
    }

    pub fn keg_path(&self, name: &str, version: &str) -> PathBuf {
        self.prefix_root.join("Cellar").join(name).join(version)
    }

    pub fn opt_path(&self, name: &str) -> PathBuf {
        self.prefix_root.join("opt").join(name)
    }

    /// The triple of the host itself.
    pub fn host_triple(&self) -> TargetTriple {
        match self.os {
            OsFamily::MacOs => TargetTriple::new(
                self.arch.as_str(),
                "apple",
                "darwin",
                self.fact(fact::KERNEL_VERSION).unwrap_or_default(),
            ),
            OsFamily::Linux => TargetTriple::new(self.arch.as_str(), "unknown", "linux", "-gnu"),
            OsFamily::Other => TargetTriple::new(self.arch.as_str(), "unknown", "unknown", ""),
        }
    }

    /// Targets per-triple toolchain config files are generated for.
    ///
    /// On macOS this is every Apple arch (plus the host arch) for both the `darwin<kernel>` and
    /// `macosx<version>` spellings of every release in [`KNOWN_MACOS_VERSIONS`] and of the
    /// running OS, so the files keep working across OS upgrades, plus an unversioned fallback
    /// for each arch. Elsewhere it is only the host triple.
    pub fn config_targets(&self) -> Vec<ConfigTarget> {
        if self.os != OsFamily::MacOs {
            return vec![ConfigTarget {
                triple: self.host_triple(),
                sdk_version: None,
            }];
        }

        let mut arches: BTreeSet<&str> = ["arm64", "x86_64", "aarch64"].into_iter().collect();
        arches.insert(self.arch.as_str());

        let mut releases: Vec<(&str, &str)> = KNOWN_MACOS_VERSIONS.to_vec();
        if let (Some(macos), Some(kernel)) = (
            self.fact(fact::MACOS_VERSION),
            self.fact(fact::KERNEL_VERSION),
        ) {
            releases.push((macos, kernel));
        }

        let mut targets = BTreeSet::new();
        for arch in arches {
            for &(macos, kernel) in &releases {
                for (system, version) in [("darwin", kernel), ("macosx", macos)] {
                    targets.insert(ConfigTarget {
                        triple: TargetTriple::new(arch, "apple", system, version),
                        sdk_version: Some(macos.to_string()),
                    });
                }
            }
            for system in ["darwin", "macosx"] {
                targets.insert(ConfigTarget {
                    triple: TargetTriple::new(arch, "apple", system, ""),
                    sdk_version: None,
                });
            }
        }
        targets.into_iter().collect()
    }
}
