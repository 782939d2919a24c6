// kiln-core/src/pipeline/worker.rs
use std::collections::BTreeSet;
use std::sync::Arc;

use kiln_common::config::Config;
use kiln_common::dependency::PlanEntry;
use kiln_common::error::Result;
use kiln_common::model::platform::PlatformProfile;
use kiln_common::pipeline::PipelineEvent;
use kiln_net::{Fetcher, HttpFetcher};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::engine::FormulaJob;
use crate::build::{BuildExecutor, CommandRunner, ProcessRunner};
use crate::postinstall::Configurator;
use crate::resolve::{ArchiveResolver, ResolveRequest};
use crate::synth::synthesize;
use crate::verify::VerificationHarness;

/// Resolve, synthesize, build, configure and optionally verify one formula.
pub struct InstallJob<R: CommandRunner = ProcessRunner, F: Fetcher = HttpFetcher> {
    platform: Arc<PlatformProfile>,
    resolver: ArchiveResolver<F>,
    executor: BuildExecutor<R>,
    configurator: Configurator,
    harness: Option<VerificationHarness<R>>,
    runtime: Handle,
    head: BTreeSet<String>,
    events: Option<broadcast::Sender<PipelineEvent>>,
}

impl InstallJob<ProcessRunner, HttpFetcher> {
    /// The job the CLI runs. `runtime` drives the downloads; it must not be the thread the
    /// pool is waited on from.
    pub fn new(
        config: &Config,
        platform: Arc<PlatformProfile>,
        runtime: Handle,
        event_tx: broadcast::Sender<PipelineEvent>,
    ) -> Result<Self> {
        Ok(Self::with_parts(
            platform,
            ArchiveResolver::new(config)?.with_events(event_tx.clone()),
            BuildExecutor::new(config)
                .with_parallelism(config.jobs)
                .with_events(event_tx.clone()),
            Configurator::new().with_events(event_tx.clone()),
            runtime,
        )
        .with_events(event_tx))
    }

    /// Runs the formula's smoke checks after installing it.
    pub fn verifying(mut self, config: &Config) -> Self {
        self.harness = Some(VerificationHarness::new(config));
        self
    }
}

impl<R: CommandRunner, F: Fetcher> InstallJob<R, F> {
    pub fn with_parts(
        platform: Arc<PlatformProfile>,
        resolver: ArchiveResolver<F>,
        executor: BuildExecutor<R>,
        configurator: Configurator,
        runtime: Handle,
    ) -> Self {
        Self {
            platform,
            resolver,
            executor,
            configurator,
            harness: None,
            runtime,
            head: BTreeSet::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_harness(mut self, harness: VerificationHarness<R>) -> Self {
        self.harness = Some(harness);
        self
    }

    /// Formulas built from their `head` reference instead of release archives.
    pub fn with_head<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.head.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn executor(&self) -> &BuildExecutor<R> {
        &self.executor
    }
}

impl<R, F> FormulaJob for InstallJob<R, F>
where
    R: CommandRunner + 'static,
    F: Fetcher + 'static,
{
    #[instrument(skip_all, fields(formula = %entry.name()))]
    fn run(&self, entry: &PlanEntry) -> Result<()> {
        let spec = &entry.formula;
        let platform = &*self.platform;

        // Argument errors (a missing platform fact) surface before anything is downloaded.
        let args = synthesize(spec, platform)?;

        let request = ResolveRequest {
            formula: spec,
            platform,
            head: self.head.contains(&spec.name),
        };
        let tree = self.runtime.block_on(self.resolver.resolve(&request))?;
        debug!("[{}] sources ready in {}", spec.name, tree.path().display());

        let artifact = self.executor.execute(spec, &tree, &args, platform)?;
        drop(tree);

        self.configurator.ensure_config(spec, &artifact, platform)?;

        // A failed smoke check is reported; the install it checked stays in place.
        if let Some(harness) = &self.harness {
            let outcome = harness
                .verify(&artifact, &spec.test, platform)
                .and_then(|report| report.status());
            if let Err(e) = outcome {
                warn!("[{}] {}", spec.name, e);
                if let Some(tx) = &self.events {
                    let _ = tx.send(PipelineEvent::LogWarn {
                        message: format!("[{}] {}", spec.name, e),
                    });
                }
            }
        }
        if let Some(caveats) = &spec.caveats {
            info!("[{}] caveats:\n{}", spec.name, caveats.trim_end());
        }
        Ok(())
    }
}
