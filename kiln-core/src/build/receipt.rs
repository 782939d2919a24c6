// kiln-core/src/build/receipt.rs
use std::path::Path;

use chrono::{DateTime, Utc};
use kiln_aio::json_io::{read_json, write_json};
use kiln_common::error::{KilnError, Result};
use kiln_common::model::artifact::{InstallWarning, InstalledArtifact};
use kiln_common::model::formula::FormulaSpec;
use kiln_common::model::platform::{Arch, OsFamily, PlatformProfile};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltOn {
    pub os: OsFamily,
    pub arch: Arch,
}

/// Written into the keg once a build reached `Done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub installed_at: DateTime<Utc>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub head_revision: Option<String>,
    pub built_on: BuiltOn,
    #[serde(default)]
    pub introspected_version: Option<String>,
    #[serde(default)]
    pub warnings: Vec<InstallWarning>,
}

impl InstallReceipt {
    pub fn new(
        artifact: &InstalledArtifact,
        platform: &PlatformProfile,
        source_url: Option<&str>,
        head_revision: Option<&str>,
    ) -> Self {
        Self {
            name: artifact.name.clone(),
            version: artifact.version.clone(),
            installed_at: Utc::now(),
            source_url: source_url.map(str::to_string),
            head_revision: head_revision.map(str::to_string),
            built_on: BuiltOn {
                os: platform.os,
                arch: platform.arch,
            },
            introspected_version: artifact.introspected_version.clone(),
            warnings: artifact.warnings.clone(),
        }
    }

    pub fn write(&self, keg: &Path) -> Result<()> {
        let path = keg.join(RECEIPT_FILE);
        debug!("Writing install receipt: {}", path.display());
        write_json(&path, self)
    }

    pub fn read(keg: &Path) -> Result<Self> {
        read_json(&keg.join(RECEIPT_FILE))
    }
}

/// The installed artifact of `spec`, reconstructed from its keg's receipt.
pub fn installed_artifact(spec: &FormulaSpec, platform: &PlatformProfile) -> Result<InstalledArtifact> {
    let keg = platform.keg_path(&spec.name, &spec.version);
    if !keg.join(RECEIPT_FILE).is_file() {
        return Err(KilnError::NotFound(format!(
            "'{}' {} is not installed (no receipt in {})",
            spec.name,
            spec.version,
            keg.display()
        )));
    }
    let receipt = InstallReceipt::read(&keg)?;
    let mut artifact = InstalledArtifact::new(receipt.name, receipt.version, keg);
    artifact.introspected_version = receipt.introspected_version;
    artifact.warnings = receipt.warnings;
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_restores_the_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let platform = PlatformProfile::new(OsFamily::Linux, Arch::X86_64, dir.path());
        let spec: FormulaSpec = serde_json::from_value(serde_json::json!({
            "name": "zstd",
            "version": "1.5.7",
            "sources": [{
                "url": "https://example.org/zstd.tar.gz",
                "sha256": "0e23756c05c97596009f6a2d8d1625ed34fe556a44067413089d4ca321a0c4d7"
            }]
        }))
        .unwrap();
        assert!(matches!(
            installed_artifact(&spec, &platform),
            Err(KilnError::NotFound(_))
        ));

        let keg = platform.keg_path("zstd", "1.5.7");
        let mut artifact = InstalledArtifact::new("zstd", "1.5.7", &keg);
        artifact.introspected_version = Some("1.5.7".into());
        InstallReceipt::new(&artifact, &platform, Some("https://example.org/zstd.tar.gz"), None)
            .write(&keg)
            .unwrap();

        let raw = std::fs::read_to_string(keg.join(RECEIPT_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(DateTime::parse_from_rfc3339(json["installed_at"].as_str().unwrap()).is_ok());
        assert_eq!(installed_artifact(&spec, &platform).unwrap(), artifact);
    }
}
