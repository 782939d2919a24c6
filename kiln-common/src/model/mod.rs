// src/model/mod.rs
// Declares the modules within the model directory.
pub mod artifact;
pub mod formula;
pub mod platform;
pub mod recipe;
pub mod template;

// Re-export
pub use artifact::{ConfigArtifact, ConfigOutcome, InstallWarning, InstalledArtifact};
pub use formula::{FormulaSpec, LicenseExpr, Patch, Resource, SourceDescriptor, SourceEdit, VcsRef};
pub use platform::{Arch, ConfigTarget, FlagOverrides, OsFamily, PlatformProfile, TargetTriple};
pub use recipe::{
    ArgBucket, ArgRule, BuildRecipe, BuildSystem, Check, CheckKind, CmakeGenerator, Condition,
    ConfigFileRule, ConfigKind, Expectation, OutputMatch, PostInstallAction, PostInstallStep,
    TestRecipe,
};
