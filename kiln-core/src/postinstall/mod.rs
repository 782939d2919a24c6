// kiln-core/src/postinstall/mod.rs
//! Per-triple configuration files generated after install, written only when their content
//! changed.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use kiln_aio::fs::atomic_write_file;
use kiln_common::error::Result;
use kiln_common::model::artifact::{ConfigArtifact, ConfigOutcome, InstalledArtifact};
use kiln_common::model::formula::FormulaSpec;
use kiln_common::model::platform::{capability, fact, ConfigTarget, OsFamily, PlatformProfile};
use kiln_common::pipeline::PipelineEvent;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use crate::build::devtools::compare_versions;
use crate::synth::Placeholders;

const DEFAULT_CLT_PATH: &str = "/Library/Developer/CommandLineTools";
// Oldest SDK shipped under a versioned name.
const FIRST_VERSIONED_SDK: &str = "10.14";

/// Generates configuration files. One instance is shared by every worker of a run; writes to
/// the same path are serialized through its per-path locks.
#[derive(Debug, Default)]
pub struct Configurator {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    events: Option<broadcast::Sender<PipelineEvent>>,
}

impl Configurator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: broadcast::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Makes sure every config file `spec` declares for `platform` exists with the expected
    /// content. Files that already match are left alone.
    #[instrument(skip_all, fields(formula = %spec.name))]
    pub fn ensure_config(
        &self,
        spec: &FormulaSpec,
        artifact: &InstalledArtifact,
        platform: &PlatformProfile,
    ) -> Result<Vec<ConfigArtifact>> {
        let mut artifacts = Vec::new();
        let targets = platform.config_targets();

        for rule in spec.config_files.iter().filter(|r| r.when.holds(platform)) {
            let dir = platform.prefix_root().join(&rule.dir);
            for target in &targets {
                let triple = target.triple.to_string();
                let path = dir.join(format!("{triple}.{}", rule.kind.extension()));
                let content = Placeholders::for_artifact(artifact, platform)
                    .with("sysroot", sysroot_for(target, platform))
                    .with("triple", &triple)
                    .expand(&rule.content)?;

                let outcome = self.write_if_changed(&path, &content)?;
                if outcome == ConfigOutcome::Written {
                    info!("[{}] wrote {}", spec.name, path.display());
                    if let Some(tx) = &self.events {
                        let _ = tx.send(PipelineEvent::ConfigWritten {
                            target_id: spec.name.clone(),
                            path: path.to_string_lossy().into_owned(),
                        });
                    }
                }
                artifacts.push(ConfigArtifact {
                    triple: target.triple.clone(),
                    kind: rule.kind,
                    path,
                    content,
                    outcome,
                });
            }
        }
        debug!(
            "[{}] {} config file(s) checked, {} written",
            spec.name,
            artifacts.len(),
            artifacts.iter().filter(|a| a.outcome == ConfigOutcome::Written).count()
        );
        Ok(artifacts)
    }

    fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    fn write_if_changed(&self, path: &Path, content: &str) -> Result<ConfigOutcome> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        match std::fs::read(path) {
            Ok(existing) if existing == content.as_bytes() => return Ok(ConfigOutcome::Unchanged),
            Ok(_) => debug!("{} diverged from the expected content", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        atomic_write_file(path, content.as_bytes())?;
        Ok(ConfigOutcome::Written)
    }
}

/// The SDK root a config file for `target` points the compiler at.
///
/// The unversioned fallback uses the unversioned SDK of the command line tools, as does any
/// target older than the running OS when the tools ship their headers separately. Versioned
/// targets from 10.14 on use the matching versioned SDK; anything older, and every non-Apple
/// target, uses `/`.
pub fn sysroot_for(target: &ConfigTarget, platform: &PlatformProfile) -> String {
    if platform.os != OsFamily::MacOs {
        return "/".to_string();
    }
    let clt = platform.fact(fact::CLT_PATH).unwrap_or(DEFAULT_CLT_PATH);
    let unversioned = format!("{clt}/SDKs/MacOSX.sdk");
    let Some(version) = &target.sdk_version else {
        return unversioned;
    };
    let newer_os = platform
        .fact(fact::MACOS_VERSION)
        .is_some_and(|current| compare_versions(current, version) == Ordering::Greater);
    if newer_os && platform.has_capability(capability::CLT_SEPARATE_HEADER_PACKAGE) {
        unversioned
    } else if compare_versions(version, FIRST_VERSIONED_SDK) != Ordering::Less {
        format!("{clt}/SDKs/MacOSX{version}.sdk")
    } else {
        "/".to_string()
    }
}
