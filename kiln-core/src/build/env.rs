// kiln-core/src/build/env.rs
use std::collections::BTreeMap;
use std::path::PathBuf;

use kiln_common::error::Result;
use kiln_common::model::artifact::InstalledArtifact;
use kiln_common::model::formula::FormulaSpec;
use kiln_common::model::platform::{fact, OsFamily, PlatformProfile};
use tracing::debug;

use crate::synth::Placeholders;

const DEFAULT_SYSTEM_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";

// Passed through from the invoking environment, everything else is dropped.
const INHERITED_VARS: &[&str] = &["HOME", "USER", "LOGNAME", "SHELL", "TMPDIR", "LANG", "LC_ALL", "TERM"];

/// The complete environment build commands run with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildEnvironment {
    vars: BTreeMap<String, String>,
}

impl BuildEnvironment {
    /// Environment for building `spec`: dependency `opt` prefixes first on the search paths,
    /// parallelism from `jobs`, flag overrides, `SDKROOT` when known and the recipe's own
    /// (templated) variables last.
    pub fn for_formula(spec: &FormulaSpec, platform: &PlatformProfile, jobs: usize) -> Result<Self> {
        Self::from_parts(spec, platform, jobs, |key| std::env::var(key).ok())
    }

    /// Environment for smoke checks of an installed product: its own `bin` first on `PATH`.
    pub fn for_tests(artifact: &InstalledArtifact, platform: &PlatformProfile) -> Self {
        let mut vars = inherited_vars(|key| std::env::var(key).ok());
        let path = [
            artifact.bin_dir().to_string_lossy().into_owned(),
            platform.prefix_root().join("bin").to_string_lossy().into_owned(),
            vars.remove("PATH")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PATH.to_string()),
        ];
        vars.insert("PATH".to_string(), path.join(":"));
        if platform.os == OsFamily::MacOs {
            if let Some(sdk) = platform.fact(fact::SDK_PATH) {
                vars.insert("SDKROOT".to_string(), sdk.to_string());
            }
        }
        Self { vars }
    }

    fn from_parts(
        spec: &FormulaSpec,
        platform: &PlatformProfile,
        jobs: usize,
        inherited: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut vars = inherited_vars(&inherited);
        vars.remove("PATH");

        let dep_prefixes: Vec<PathBuf> = spec
            .dependencies
            .iter()
            .chain(spec.resources.iter().flat_map(|r| r.dependencies.iter()))
            .filter(|dep| dep.applies_to(platform.os) && dep.gates_build(true))
            .map(|dep| platform.opt_path(&dep.name))
            .collect();

        let mut path: Vec<String> = dep_prefixes
            .iter()
            .map(|p| p.join("bin").to_string_lossy().into_owned())
            .collect();
        path.push(platform.prefix_root().join("bin").to_string_lossy().into_owned());
        path.push(inherited("PATH").unwrap_or_else(|| DEFAULT_SYSTEM_PATH.to_string()));
        vars.insert("PATH".to_string(), path.join(":"));

        if !dep_prefixes.is_empty() {
            vars.insert("CMAKE_PREFIX_PATH".to_string(), join_paths(dep_prefixes.iter().cloned()));
            vars.insert(
                "PKG_CONFIG_PATH".to_string(),
                join_paths(
                    dep_prefixes
                        .iter()
                        .flat_map(|p| [p.join("lib/pkgconfig"), p.join("share/pkgconfig")]),
                ),
            );
        }

        let jobs = jobs.max(1);
        vars.insert("CMAKE_BUILD_PARALLEL_LEVEL".to_string(), jobs.to_string());
        vars.insert("MAKEFLAGS".to_string(), format!("-j{jobs}"));

        let overrides = &platform.flag_overrides;
        for (key, value) in [
            ("CFLAGS", &overrides.cflags),
            ("CXXFLAGS", &overrides.cxxflags),
            ("LDFLAGS", &overrides.ldflags),
        ] {
            if let Some(value) = value {
                vars.insert(key.to_string(), value.clone());
            }
        }

        if platform.os == OsFamily::MacOs {
            if let Some(sdk) = platform.fact(fact::SDK_PATH) {
                vars.insert("SDKROOT".to_string(), sdk.to_string());
            }
        }

        let placeholders = Placeholders::for_formula(spec, platform);
        for (key, value) in &spec.build.env {
            vars.insert(key.clone(), placeholders.expand(value)?);
        }

        debug!("Build environment for {}: {:?}", spec.name, vars.keys().collect::<Vec<_>>());
        Ok(Self { vars })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn into_vars(self) -> BTreeMap<String, String> {
        self.vars
    }
}

fn inherited_vars(inherited: impl Fn(&str) -> Option<String>) -> BTreeMap<String, String> {
    INHERITED_VARS
        .iter()
        .chain(std::iter::once(&"PATH"))
        .filter_map(|key| inherited(key).map(|value| (key.to_string(), value)))
        .collect()
}

fn join_paths(paths: impl Iterator<Item = PathBuf>) -> String {
    paths
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":")
}
