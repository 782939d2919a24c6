// kiln-common/src/model/formula.rs
use std::fmt;

use serde::{Deserialize, Serialize};

use super::recipe::{BuildRecipe, ConfigFileRule, TestRecipe};
use crate::dependency::Dependency;
use crate::error::{KilnError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub url: String,
    pub sha256: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
    /// Subdirectory of the source tree to extract into; `None` for the tree root.
    #[serde(default)]
    pub stage_as: Option<String>,
}

impl SourceDescriptor {
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.url.as_str()).chain(self.mirrors.iter().map(String::as_str))
    }
}

/// A version-control reference used for HEAD builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsRef {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
}

fn default_strip() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub id: Option<String>,
    pub url: String,
    pub sha256: String,
    #[serde(default = "default_strip")]
    pub strip: usize,
}

impl Patch {
    /// Stable identifier used in `PatchError`s: the declared id, or position and hash prefix.
    pub fn patch_id(&self, index: usize) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => {
                let short: String = self.sha256.chars().take(12).collect();
                format!("patch-{}-{}", index + 1, short)
            }
        }
    }
}

/// An in-place regex substitution applied to a file of the source tree after patching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEdit {
    pub path: String,
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub source: SourceDescriptor,
    #[serde(default)]
    pub patches: Vec<Patch>,
    #[serde(default)]
    pub build: BuildRecipe,
    /// Hoisted onto the parent formula's node in the dependency graph.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LicenseExpr {
    Id(String),
    With { license: String, with: String },
    AllOf { all_of: Vec<LicenseExpr> },
    AnyOf { any_of: Vec<LicenseExpr> },
}

impl fmt::Display for LicenseExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |items: &[LicenseExpr], sep: &str| {
            items
                .iter()
                .map(|l| match l {
                    LicenseExpr::AllOf { .. } | LicenseExpr::AnyOf { .. } => format!("({l})"),
                    _ => l.to_string(),
                })
                .collect::<Vec<_>>()
                .join(sep)
        };
        match self {
            LicenseExpr::Id(id) => write!(f, "{id}"),
            LicenseExpr::With { license, with } => write!(f, "{license} WITH {with}"),
            LicenseExpr::AllOf { all_of } => write!(f, "{}", join(all_of, " AND ")),
            LicenseExpr::AnyOf { any_of } => write!(f, "{}", join(any_of, " OR ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
    #[serde(default)]
    pub head: Option<VcsRef>,
    #[serde(default)]
    pub license: Option<LicenseExpr>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub patches: Vec<Patch>,
    #[serde(default)]
    pub source_edits: Vec<SourceEdit>,
    #[serde(default)]
    pub build: BuildRecipe,
    #[serde(default)]
    pub config_files: Vec<ConfigFileRule>,
    #[serde(default)]
    pub test: TestRecipe,
    #[serde(default)]
    pub keg_only: Option<String>,
    #[serde(default)]
    pub caveats: Option<String>,
}

impl FormulaSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn main_source(&self) -> Option<&SourceDescriptor> {
        self.sources.first()
    }

    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(KilnError::ValidationError(
                "formula name must not be empty".to_string(),
            ));
        }
        if self.version.trim().is_empty() {
            return Err(KilnError::ValidationError(format!(
                "formula '{}' has an empty version",
                self.name
            )));
        }
        if self.sources.is_empty() && self.head.is_none() {
            return Err(KilnError::ValidationError(format!(
                "formula '{}' declares no source and no head",
                self.name
            )));
        }
        let hashes = self
            .sources
            .iter()
            .map(|s| (s.url.as_str(), s.sha256.as_str()))
            .chain(self.patches.iter().map(|p| (p.url.as_str(), p.sha256.as_str())))
            .chain(self.resources.iter().flat_map(|r| {
                std::iter::once((r.source.url.as_str(), r.source.sha256.as_str()))
                    .chain(r.patches.iter().map(|p| (p.url.as_str(), p.sha256.as_str())))
            }));
        for (url, sha) in hashes {
            if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(KilnError::ValidationError(format!(
                    "formula '{}': '{}' does not declare a valid sha256 (got '{}')",
                    self.name, url, sha
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for resource in &self.resources {
            if !seen.insert(resource.name.as_str()) {
                return Err(KilnError::ValidationError(format!(
                    "formula '{}' declares resource '{}' twice",
                    self.name, resource.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "0e23756c05c97596009f6a2d8d1625ed34fe556a44067413089d4ca321a0c4d7";

    fn minimal() -> FormulaSpec {
        serde_json::from_value(serde_json::json!({
            "name": "zstd",
            "version": "1.5.7",
            "sources": [{ "url": "https://example.org/zstd-1.5.7.tar.gz", "sha256": SHA }],
        }))
        .unwrap()
    }

    #[test]
    fn minimal_formula_validates() {
        let spec = minimal();
        spec.validate().unwrap();
        assert_eq!(spec.main_source().unwrap().urls().count(), 1);
    }

    #[test]
    fn bad_hash_is_rejected() {
        let mut spec = minimal();
        spec.sources[0].sha256 = "abc".into();
        assert!(matches!(spec.validate(), Err(KilnError::ValidationError(_))));
    }

    #[test]
    fn license_expressions_render() {
        let license: LicenseExpr = serde_json::from_str(
            r#"{ "all_of": ["MIT", { "license": "Apache-2.0", "with": "LLVM-exception" }] }"#,
        )
        .unwrap();
        assert_eq!(license.to_string(), "MIT AND Apache-2.0 WITH LLVM-exception");
    }

    #[test]
    fn patch_ids_fall_back_to_position_and_hash() {
        let patch = Patch {
            id: None,
            url: "https://example.org/fix.patch".into(),
            sha256: SHA.into(),
            strip: 1,
        };
        assert_eq!(patch.patch_id(0), "patch-1-0e23756c05c9");
    }
}
