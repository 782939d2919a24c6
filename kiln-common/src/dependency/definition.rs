// kiln-common/src/dependency/definition.rs
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::model::platform::OsFamily;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DependencyTag: u8 {
        const RUNTIME     = 0b00000001;
        const BUILD       = 0b00000010;
        const TEST        = 0b00000100;
        const OPTIONAL    = 0b00001000;
        const RECOMMENDED = 0b00010000;
    }
}

impl Default for DependencyTag {
    fn default() -> Self {
        Self::RUNTIME
    }
}

impl fmt::Display for DependencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub tags: DependencyTag,
    /// Only applies on this OS family.
    #[serde(default)]
    pub os: Option<OsFamily>,
    /// Provided by the system on macOS; only a real edge elsewhere.
    #[serde(default)]
    pub uses_from_macos: bool,
}

impl Dependency {
    pub fn new_runtime(name: impl Into<String>) -> Self {
        Self::new_with_tags(name, DependencyTag::RUNTIME)
    }

    pub fn new_with_tags(name: impl Into<String>, tags: DependencyTag) -> Self {
        Self {
            name: name.into(),
            tags,
            os: None,
            uses_from_macos: false,
        }
    }

    pub fn only_on(mut self, os: OsFamily) -> Self {
        self.os = Some(os);
        self
    }

    pub fn applies_to(&self, os: OsFamily) -> bool {
        if self.uses_from_macos && os == OsFamily::MacOs {
            return false;
        }
        self.os.map_or(true, |only| only == os)
    }

    /// Whether this edge gates the build of the formula declaring it.
    ///
    /// Test-only edges never do. Optional edges only when optional dependencies were requested.
    pub fn gates_build(&self, include_optional: bool) -> bool {
        let ordering = DependencyTag::RUNTIME | DependencyTag::BUILD | DependencyTag::RECOMMENDED;
        if self.tags.contains(DependencyTag::OPTIONAL) {
            return include_optional;
        }
        self.tags.intersects(ordering)
    }
}
