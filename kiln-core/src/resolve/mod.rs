// kiln-core/src/resolve/mod.rs
//! Turns a formula's declared sources into a verified, extracted and patched source tree.

pub mod patch;

use std::path::{Path, PathBuf};

use futures::future::try_join_all;
use kiln_aio::extract::extract_archive_async;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::formula::{FormulaSpec, Patch, Resource, SourceDescriptor};
use kiln_common::model::platform::PlatformProfile;
use kiln_common::pipeline::PipelineEvent;
use kiln_net::validation::file_name_of;
use kiln_net::{fetch_verified, Fetcher, HttpFetcher, RetryPolicy};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use self::patch::{apply_patch, apply_source_edits};
use crate::synth::Placeholders;

const RESOURCES_DIR: &str = ".kiln-resources";

/// What to resolve, and for which platform (source edits may reference install paths).
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub formula: &'a FormulaSpec,
    pub platform: &'a PlatformProfile,
    /// Clone the formula's `head` reference instead of fetching its release archives.
    pub head: bool,
}

/// An extracted and patched source tree. The backing directory is removed when this is dropped.
#[derive(Debug)]
pub struct SourceTree {
    dir: TempDir,
    head_revision: Option<String>,
    source_url: Option<String>,
}

impl SourceTree {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Where resource `name` was extracted.
    pub fn resource_dir(&self, name: &str) -> PathBuf {
        self.dir.path().join(RESOURCES_DIR).join(name)
    }

    /// The commit checked out for a HEAD build.
    pub fn head_revision(&self) -> Option<&str> {
        self.head_revision.as_deref()
    }

    /// The URL the main source came from.
    pub fn source_url(&self) -> Option<&str> {
        self.source_url.as_deref()
    }

    /// Wraps an existing directory, e.g. for tests that prepare a tree by hand.
    pub fn from_dir(dir: TempDir) -> Self {
        Self {
            dir,
            head_revision: None,
            source_url: None,
        }
    }
}

pub struct ArchiveResolver<F: Fetcher = HttpFetcher> {
    fetcher: F,
    downloads_dir: PathBuf,
    build_root: PathBuf,
    policy: RetryPolicy,
    events: Option<broadcast::Sender<PipelineEvent>>,
}

impl ArchiveResolver<HttpFetcher> {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self::with_fetcher(
            HttpFetcher::new()?,
            config.downloads_dir(),
            config.build_root(),
        )
        .with_policy(RetryPolicy::with_attempts(config.fetch_attempts)))
    }
}

impl<F: Fetcher> ArchiveResolver<F> {
    pub fn with_fetcher(
        fetcher: F,
        downloads_dir: impl Into<PathBuf>,
        build_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fetcher,
            downloads_dir: downloads_dir.into(),
            build_root: build_root.into(),
            policy: RetryPolicy::default(),
            events: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    #[instrument(skip_all, fields(formula = %request.formula.name, head = request.head))]
    pub async fn resolve(&self, request: &ResolveRequest<'_>) -> Result<SourceTree> {
        let spec = request.formula;
        tokio::fs::create_dir_all(&self.build_root).await?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", spec.name, spec.version))
            .tempdir_in(&self.build_root)?;
        let root = dir.path().to_path_buf();
        debug!("Resolving {} into {}", spec.name, root.display());

        let mut tree = SourceTree::from_dir(dir);
        if request.head {
            let vcs = spec.head.clone().ok_or_else(|| {
                KilnError::ValidationError(format!("formula '{}' has no head reference", spec.name))
            })?;
            let dest = root.clone();
            info!("Cloning {} for a HEAD build", vcs.url);
            let revision = tokio::task::spawn_blocking(move || {
                kiln_aio::git2::clone_at(
                    &vcs.url,
                    &dest,
                    vcs.branch.as_deref(),
                    vcs.revision.as_deref(),
                )
            })
            .await
            .map_err(|e| KilnError::Generic(format!("JoinError in git clone: {e}")))??;
            tree.head_revision = Some(revision);
            tree.source_url = spec.head.as_ref().map(|h| h.url.clone());
        } else {
            for source in &spec.sources {
                let dest = match &source.stage_as {
                    Some(sub) => root.join(sub),
                    None => root.clone(),
                };
                self.fetch_and_extract(&spec.name, &archive_cache_name(spec, source), source, &dest)
                    .await?;
            }
            tree.source_url = spec.main_source().map(|s| s.url.clone());
        }

        self.apply_patches(spec, &spec.patches, &root).await?;
        let placeholders = Placeholders::for_formula(spec, request.platform);
        apply_source_edits(&root, &spec.source_edits, &placeholders)?;

        try_join_all(
            spec.resources
                .iter()
                .map(|resource| self.resolve_resource(spec, resource, &root)),
        )
        .await?;

        debug!("Source tree for {} ready at {}", spec.name, root.display());
        Ok(tree)
    }

    async fn resolve_resource(&self, spec: &FormulaSpec, resource: &Resource, root: &Path) -> Result<()> {
        let dest = root.join(RESOURCES_DIR).join(&resource.name);
        let cache_name = format!(
            "{}--{}--{}",
            spec.name,
            resource.name,
            file_name_of(&resource.source.url).unwrap_or_else(|| "source".to_string())
        );
        self.fetch_and_extract(&spec.name, &cache_name, &resource.source, &dest)
            .await?;
        self.apply_patches(spec, &resource.patches, &dest).await
    }

    async fn fetch_and_extract(
        &self,
        target_id: &str,
        cache_name: &str,
        source: &SourceDescriptor,
        dest: &Path,
    ) -> Result<()> {
        let urls: Vec<&str> = source.urls().collect();
        let archive = self
            .fetch(target_id, &urls, &source.sha256, cache_name)
            .await?;
        tokio::fs::create_dir_all(dest).await?;
        let stripped = extract_archive_async(&archive, dest).await?;
        debug!(
            "Extracted {} into {} (stripped root: {:?})",
            archive.display(),
            dest.display(),
            stripped
        );
        Ok(())
    }

    async fn apply_patches(&self, spec: &FormulaSpec, patches: &[Patch], tree: &Path) -> Result<()> {
        for (index, patch) in patches.iter().enumerate() {
            let patch_id = patch.patch_id(index);
            let cache_name = format!("{}--{}.patch", spec.name, patch_id.replace('/', "_"));
            let file = self
                .fetch(&spec.name, &[patch.url.as_str()], &patch.sha256, &cache_name)
                .await?;
            apply_patch(tree, &file, patch.strip, &patch_id).await?;
        }
        Ok(())
    }

    async fn fetch(&self, target_id: &str, urls: &[&str], sha256: &str, cache_name: &str) -> Result<PathBuf> {
        let primary = urls.first().copied().unwrap_or_default().to_string();
        self.emit(PipelineEvent::FetchStarted {
            target_id: target_id.to_string(),
            url: primary.clone(),
        });
        let cache_path = self.downloads_dir.join(cache_name);
        let fetched = fetch_verified(
            &self.fetcher,
            urls,
            sha256,
            &cache_path,
            &self.policy,
            |url, attempt, error| {
                warn!("[{}] retrying {} (attempt {}): {}", target_id, url, attempt, error);
                self.emit(PipelineEvent::FetchRetry {
                    target_id: target_id.to_string(),
                    url: url.to_string(),
                    attempt,
                    error: error.to_string(),
                });
            },
        )
        .await?;
        self.emit(PipelineEvent::FetchFinished {
            target_id: target_id.to_string(),
            url: primary,
        });
        Ok(fetched)
    }
}

fn archive_cache_name(spec: &FormulaSpec, source: &SourceDescriptor) -> String {
    let file = file_name_of(&source.url).unwrap_or_else(|| "source".to_string());
    format!("{}-{}--{}", spec.name, spec.version, file)
}
