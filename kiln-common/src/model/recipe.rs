// kiln-common/src/model/recipe.rs
//! Declarative build, post-install, config-file and test recipes of a formula.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::platform::{Arch, OsFamily, PlatformProfile};

// --- Conditions ---

/// A predicate over the platform profile. Used to guard argument rules, extra stages, config
/// files and verification checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    #[default]
    Always,
    Os(OsFamily),
    NotOs(OsFamily),
    Arch(Arch),
    Capability(String),
    NotCapability(String),
    Fact(String),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn holds(&self, platform: &PlatformProfile) -> bool {
        match self {
            Condition::Always => true,
            Condition::Os(os) => platform.os == *os,
            Condition::NotOs(os) => platform.os != *os,
            Condition::Arch(arch) => platform.arch == *arch,
            Condition::Capability(name) => platform.has_capability(name),
            Condition::NotCapability(name) => !platform.has_capability(name),
            Condition::Fact(name) => platform.fact(name).is_some(),
            Condition::All(all) => all.iter().all(|c| c.holds(platform)),
            Condition::Any(any) => any.iter().any(|c| c.holds(platform)),
            Condition::Not(inner) => !inner.holds(platform),
        }
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Condition::Always)
    }
}

// --- Build recipe ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmakeGenerator {
    #[default]
    Ninja,
    UnixMakefiles,
}

impl CmakeGenerator {
    pub fn cmake_name(&self) -> &'static str {
        match self {
            CmakeGenerator::Ninja => "Ninja",
            CmakeGenerator::UnixMakefiles => "Unix Makefiles",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildSystem {
    Cmake {
        #[serde(default)]
        generator: CmakeGenerator,
    },
    Autotools,
}

impl Default for BuildSystem {
    fn default() -> Self {
        BuildSystem::Cmake {
            generator: CmakeGenerator::default(),
        }
    }
}

/// Which invocation an argument ends up in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgBucket {
    #[default]
    Primary,
    Runtimes,
    Builtins,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgRule {
    #[serde(default)]
    pub bucket: ArgBucket,
    #[serde(default)]
    pub when: Condition,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagSource {
    Cflags,
    Cxxflags,
    Ldflags,
}

/// Turns an environment flag override into an argument, e.g. `-DCMAKE_C_FLAGS={value}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagInjection {
    pub source: FlagSource,
    pub template: String,
}

impl FlagInjection {
    pub fn new(source: FlagSource, template: impl Into<String>) -> Self {
        Self {
            source,
            template: template.into(),
        }
    }
}

/// Definition names the secondary buckets are folded into on the primary command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedArgNames {
    pub runtimes: String,
    pub builtins: String,
}

impl Default for NestedArgNames {
    fn default() -> Self {
        Self {
            runtimes: "RUNTIMES_CMAKE_ARGS".to_string(),
            builtins: "BUILTINS_CMAKE_ARGS".to_string(),
        }
    }
}

/// A command run after install whose trimmed stdout is the installed product's version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Introspection {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PostInstallAction {
    /// Creates `link` pointing at `target` (relative targets stay relative).
    Symlink { link: String, target: String },
    /// Copies files matching `pattern` (relative to the source tree) into `dest`.
    InstallGlob { pattern: String, dest: String },
    /// Runs an arbitrary command in the keg.
    Run {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostInstallStep {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub when: Condition,
    #[serde(flatten)]
    pub action: PostInstallAction,
}

impl PostInstallStep {
    pub fn stage_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.action {
            PostInstallAction::Symlink { link, .. } => format!("symlink:{link}"),
            PostInstallAction::InstallGlob { dest, .. } => format!("install:{dest}"),
            PostInstallAction::Run { program, .. } => {
                let base = program.rsplit('/').next().unwrap_or(program);
                format!("run:{base}")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecipe {
    #[serde(default)]
    pub system: BuildSystem,
    /// Directory (relative to the source tree) holding the top-level build script.
    #[serde(default)]
    pub source_subdir: Option<String>,
    #[serde(default)]
    pub args: Vec<ArgRule>,
    /// `None` selects the build system's defaults.
    #[serde(default)]
    pub flag_injections: Option<Vec<FlagInjection>>,
    #[serde(default)]
    pub nested_args: NestedArgNames,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub introspect: Option<Introspection>,
    #[serde(default)]
    pub post_install: Vec<PostInstallStep>,
}

impl BuildRecipe {
    pub fn effective_flag_injections(&self) -> Vec<FlagInjection> {
        if let Some(custom) = &self.flag_injections {
            return custom.clone();
        }
        match self.system {
            BuildSystem::Cmake { .. } => vec![
                FlagInjection::new(FlagSource::Cflags, "-DCMAKE_C_FLAGS={value}"),
                FlagInjection::new(FlagSource::Cxxflags, "-DCMAKE_CXX_FLAGS={value}"),
            ],
            BuildSystem::Autotools => vec![
                FlagInjection::new(FlagSource::Cflags, "CFLAGS={value}"),
                FlagInjection::new(FlagSource::Cxxflags, "CXXFLAGS={value}"),
                FlagInjection::new(FlagSource::Ldflags, "LDFLAGS={value}"),
            ],
        }
    }
}

// --- Post-install config files ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    /// Per-triple clang configuration file, `<triple>.cfg`.
    ClangConfig,
    /// Shell environment snippet, `<triple>.env`.
    Environment,
}

impl ConfigKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigKind::ClangConfig => "cfg",
            ConfigKind::Environment => "env",
        }
    }
}

impl std::fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigKind::ClangConfig => write!(f, "clang-config"),
            ConfigKind::Environment => write!(f, "environment"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFileRule {
    pub kind: ConfigKind,
    /// Directory relative to the install root, e.g. `etc/clang`.
    pub dir: String,
    #[serde(default)]
    pub when: Condition,
    /// Content template; `{sysroot}`, `{triple}` and the artifact placeholders are available.
    pub content: String,
}

// --- Test recipe ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMatch {
    Equals(String),
    Contains(String),
    Matches(String),
}

fn default_trim() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectation {
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub output: Option<OutputMatch>,
    /// Match against stdout followed by stderr (`2>&1`).
    #[serde(default)]
    pub merge_stderr: bool,
    #[serde(default = "default_trim")]
    pub trim: bool,
}

impl Default for Expectation {
    fn default() -> Self {
        Self {
            exit_code: 0,
            output: None,
            merge_stderr: false,
            trim: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum CheckKind {
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        expect: Expectation,
    },
    /// Fails if any path matching `pattern` (relative to the keg) exists.
    NoFilesMatching { pattern: String },
    /// Inspects the dynamic libraries a binary (relative to the scratch dir or absolute) links.
    Links {
        binary: String,
        #[serde(default)]
        includes: Vec<String>,
        #[serde(default)]
        excludes: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    #[serde(default)]
    pub requires: Condition,
    #[serde(flatten)]
    pub kind: CheckKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecipe {
    #[serde(default)]
    pub files: Vec<TestFile>,
    #[serde(default)]
    pub checks: Vec<Check>,
}
