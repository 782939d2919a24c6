// kiln-core/src/synth/mod.rs
//! Turns a formula's declarative argument rules and a [`PlatformProfile`] into the concrete
//! argument lists handed to the build system. Nothing in here touches the host.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_common::error::{KilnError, Result};
use kiln_common::model::artifact::InstalledArtifact;
use kiln_common::model::formula::{FormulaSpec, Resource};
use kiln_common::model::platform::PlatformProfile;
use kiln_common::model::recipe::{ArgBucket, BuildRecipe, BuildSystem, FlagSource};
use kiln_common::model::template;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Synthesized arguments, split by the invocation they end up in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentSet {
    pub primary: Vec<String>,
    pub runtimes: Vec<String>,
    pub builtins: Vec<String>,
}

impl ArgumentSet {
    pub fn bucket(&self, bucket: ArgBucket) -> &[String] {
        match bucket {
            ArgBucket::Primary => &self.primary,
            ArgBucket::Runtimes => &self.runtimes,
            ArgBucket::Builtins => &self.builtins,
        }
    }

    pub fn bucket_mut(&mut self, bucket: ArgBucket) -> &mut Vec<String> {
        match bucket {
            ArgBucket::Primary => &mut self.primary,
            ArgBucket::Runtimes => &mut self.runtimes,
            ArgBucket::Builtins => &mut self.builtins,
        }
    }

    /// The primary arguments with the secondary buckets folded in as `-D<NAME>=a;b;c`.
    ///
    /// Only CMake recipes fold. Every non-empty bucket is folded, including one that holds
    /// nothing but flag overrides.
    pub fn configure_args(&self, recipe: &BuildRecipe) -> Vec<String> {
        let mut args = self.primary.clone();
        if !matches!(recipe.system, BuildSystem::Cmake { .. }) {
            return args;
        }
        for (bucket, name) in [
            (ArgBucket::Runtimes, &recipe.nested_args.runtimes),
            (ArgBucket::Builtins, &recipe.nested_args.builtins),
        ] {
            let values = self.bucket(bucket);
            if !values.is_empty() {
                args.push(format!("-D{}={}", name, values.join(";")));
            }
        }
        args
    }
}

/// What the placeholders of a formula's templates resolve to.
///
/// `{prefix}` and the keg subdirectories (`{bin}`, `{lib}`, `{include}`, `{share}`, `{libexec}`,
/// `{sbin}`), `{etc}` of the install root, `{opt:NAME}`, `{fact:NAME}` / `{fact:NAME|default}`,
/// plus whatever extra keys the caller adds with [`Placeholders::with`].
#[derive(Debug, Clone)]
pub struct Placeholders<'a> {
    platform: &'a PlatformProfile,
    prefix: PathBuf,
    extra: BTreeMap<String, String>,
}

impl<'a> Placeholders<'a> {
    /// Placeholders for a formula that is about to be built into its keg.
    pub fn for_formula(spec: &FormulaSpec, platform: &'a PlatformProfile) -> Self {
        Self {
            platform,
            prefix: platform.keg_path(&spec.name, &spec.version),
            extra: BTreeMap::new(),
        }
    }

    /// Placeholders for an installed product; adds `{version}` and, if derivable, `{soversion}`.
    pub fn for_artifact(artifact: &InstalledArtifact, platform: &'a PlatformProfile) -> Self {
        let mut placeholders = Self {
            platform,
            prefix: artifact.prefix.clone(),
            extra: BTreeMap::new(),
        };
        placeholders
            .extra
            .insert("version".to_string(), artifact.effective_version().to_string());
        if let Some(so) = artifact.soversion() {
            placeholders.extra.insert("soversion".to_string(), so);
        }
        placeholders
    }

    pub fn with(mut self, key: impl Into<String>, value: impl AsRef<str>) -> Self {
        self.extra.insert(key.into(), value.as_ref().to_string());
        self
    }

    pub fn with_path(self, key: impl Into<String>, value: &Path) -> Self {
        self.with(key, value.to_string_lossy())
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn platform(&self) -> &PlatformProfile {
        self.platform
    }

    pub fn resolve(&self, key: &str, default: Option<&str>) -> Result<String> {
        let path = |p: PathBuf| p.to_string_lossy().into_owned();
        match key {
            "prefix" => return Ok(path(self.prefix.clone())),
            "bin" | "lib" | "include" | "share" | "libexec" | "sbin" => {
                return Ok(path(self.prefix.join(key)))
            }
            "etc" => return Ok(path(self.platform.prefix_root().join("etc"))),
            "prefix_root" => return Ok(path(self.platform.prefix_root().to_path_buf())),
            _ => {}
        }
        if let Some(name) = key.strip_prefix("opt:") {
            return Ok(path(self.platform.opt_path(name)));
        }
        if let Some(name) = key.strip_prefix("fact:") {
            return match (self.platform.fact(name), default) {
                (Some(value), _) => Ok(value.to_string()),
                (None, Some(default)) => Ok(default.to_string()),
                (None, None) => Err(KilnError::MissingPlatformFact {
                    fact: name.to_string(),
                }),
            };
        }
        if let Some(value) = self.extra.get(key) {
            return Ok(value.clone());
        }
        default.map(str::to_string).ok_or_else(|| {
            KilnError::Template(format!("Unknown placeholder '{{{key}}}'"))
        })
    }

    pub fn expand(&self, input: &str) -> Result<String> {
        template::expand(input, |key, default| self.resolve(key, default))
    }

    pub fn expand_all(&self, inputs: &[String]) -> Result<Vec<String>> {
        inputs.iter().map(|input| self.expand(input)).collect()
    }
}

/// Synthesizes the build arguments of `spec` for `platform`.
#[instrument(skip_all, fields(formula = %spec.name, os = %platform.os))]
pub fn synthesize(spec: &FormulaSpec, platform: &PlatformProfile) -> Result<ArgumentSet> {
    let placeholders = Placeholders::for_formula(spec, platform);
    synthesize_recipe(&spec.build, &placeholders)
}

/// Synthesizes the arguments of a resource built after its parent was installed as `artifact`.
/// `buildpath` is the root of the parent's source tree.
#[instrument(skip_all, fields(resource = %resource.name))]
pub fn synthesize_resource(
    resource: &Resource,
    platform: &PlatformProfile,
    artifact: &InstalledArtifact,
    buildpath: &Path,
) -> Result<ArgumentSet> {
    let placeholders =
        Placeholders::for_artifact(artifact, platform).with_path("buildpath", buildpath);
    synthesize_recipe(&resource.build, &placeholders)
}

fn synthesize_recipe(recipe: &BuildRecipe, placeholders: &Placeholders<'_>) -> Result<ArgumentSet> {
    let platform = placeholders.platform();
    let mut set = ArgumentSet {
        primary: standard_args(&recipe.system, placeholders.prefix()),
        ..ArgumentSet::default()
    };

    for rule in &recipe.args {
        if !rule.when.holds(platform) {
            debug!("Skipping {:?} rule, condition {:?} does not hold", rule.bucket, rule.when);
            continue;
        }
        let expanded = placeholders.expand_all(&rule.args)?;
        set.bucket_mut(rule.bucket).extend(expanded);
    }

    let overrides = &platform.flag_overrides;
    for injection in recipe.effective_flag_injections() {
        let value = match injection.source {
            FlagSource::Cflags => overrides.cflags.as_deref(),
            FlagSource::Cxxflags => overrides.cxxflags.as_deref(),
            FlagSource::Ldflags => overrides.ldflags.as_deref(),
        };
        let Some(value) = value else { continue };
        let arg = template::expand(&injection.template, |key, default| match key {
            "value" => Ok(value.to_string()),
            other => placeholders.resolve(other, default),
        })?;
        for bucket in [ArgBucket::Primary, ArgBucket::Runtimes, ArgBucket::Builtins] {
            set.bucket_mut(bucket).push(arg.clone());
        }
    }

    debug!(
        "Synthesized {} primary, {} runtimes, {} builtins argument(s)",
        set.primary.len(),
        set.runtimes.len(),
        set.builtins.len()
    );
    Ok(set)
}

fn standard_args(system: &BuildSystem, prefix: &Path) -> Vec<String> {
    let prefix = prefix.display();
    match system {
        BuildSystem::Cmake { .. } => vec![
            format!("-DCMAKE_INSTALL_PREFIX={prefix}"),
            "-DCMAKE_INSTALL_LIBDIR=lib".to_string(),
            "-DCMAKE_BUILD_TYPE=Release".to_string(),
            "-DCMAKE_FIND_FRAMEWORK=LAST".to_string(),
            "-DCMAKE_VERBOSE_MAKEFILE=ON".to_string(),
            "-Wno-dev".to_string(),
        ],
        BuildSystem::Autotools => vec![
            format!("--prefix={prefix}"),
            format!("--libdir={prefix}/lib"),
            "--disable-debug".to_string(),
            "--disable-dependency-tracking".to_string(),
        ],
    }
}
