// kiln-common/src/model/artifact.rs
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::platform::TargetTriple;
use super::recipe::ConfigKind;

/// Non-fatal problems noticed while installing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallWarning {
    /// The installed product could not report its own version.
    IntrospectionWarning { command: String, reason: String },
}

impl fmt::Display for InstallWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallWarning::IntrospectionWarning { command, reason } => {
                write!(f, "could not introspect installed product with '{command}': {reason}")
            }
        }
    }
}

/// Record of a completed build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledArtifact {
    pub name: String,
    pub version: String,
    pub prefix: PathBuf,
    #[serde(default)]
    pub introspected_version: Option<String>,
    #[serde(default)]
    pub warnings: Vec<InstallWarning>,
}

impl InstalledArtifact {
    pub fn new(name: impl Into<String>, version: impl Into<String>, prefix: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            prefix: prefix.into(),
            introspected_version: None,
            warnings: Vec::new(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.prefix.join("bin")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.prefix.join("lib")
    }

    pub fn include_dir(&self) -> PathBuf {
        self.prefix.join("include")
    }

    pub fn share_dir(&self) -> PathBuf {
        self.prefix.join("share")
    }

    pub fn libexec_dir(&self) -> PathBuf {
        self.prefix.join("libexec")
    }

    /// The introspected version if there is one, the declared version otherwise.
    pub fn effective_version(&self) -> &str {
        self.introspected_version.as_deref().unwrap_or(&self.version)
    }

    pub fn soversion(&self) -> Option<String> {
        soversion(self.effective_version())
    }
}

/// Library ABI version derived from a product version: the major number, with a `git` suffix
/// kept for development snapshots and an `-rcN` suffix kept for release candidates.
///
/// `19.1.7` -> `19`, `20.0.0git` -> `20git`, `19.1.0-rc3` -> `19-rc3`.
pub fn soversion(version: &str) -> Option<String> {
    let version = version.trim();
    let major = match semver::Version::parse(version) {
        Ok(v) => v.major.to_string(),
        Err(_) => {
            let digits: String = version.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                return None;
            }
            digits
        }
    };
    let mut so = major;
    if version.ends_with("git") {
        so.push_str("git");
    } else if let Some(idx) = version.rfind("-rc") {
        let suffix = &version[idx..];
        if suffix[3..].chars().all(|c| c.is_ascii_digit()) {
            so.push_str(suffix);
        }
    }
    Some(so)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigOutcome {
    Written,
    Unchanged,
}

/// A generated configuration file keyed by (triple, kind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigArtifact {
    pub triple: TargetTriple,
    pub kind: ConfigKind,
    pub path: PathBuf,
    pub content: String,
    pub outcome: ConfigOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soversion_keeps_git_and_rc_suffixes() {
        assert_eq!(soversion("19.1.7").as_deref(), Some("19"));
        assert_eq!(soversion("20.0.0git").as_deref(), Some("20git"));
        assert_eq!(soversion("19.1.0-rc3").as_deref(), Some("19-rc3"));
        assert_eq!(soversion("19.1.0-rc").as_deref(), Some("19-rc"));
        assert_eq!(soversion("garbage"), None);
    }

    #[test]
    fn artifact_prefers_introspected_version() {
        let mut artifact = InstalledArtifact::new("opencilk", "3.0", "/opt/kiln/Cellar/opencilk/3.0");
        assert_eq!(artifact.soversion(), Some("3".into()));
        artifact.introspected_version = Some("19.1.7".into());
        assert_eq!(artifact.soversion(), Some("19".into()));
        assert_eq!(artifact.lib_dir(), PathBuf::from("/opt/kiln/Cellar/opencilk/3.0/lib"));
    }
}
