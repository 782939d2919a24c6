// kiln-core/src/build/executor.rs
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_aio::fs::{copy_file, create_dir_all, create_symlink, remove_directory_recursive};
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::artifact::{InstallWarning, InstalledArtifact};
use kiln_common::model::formula::{FormulaSpec, Resource};
use kiln_common::model::platform::PlatformProfile;
use kiln_common::model::recipe::{BuildRecipe, BuildSystem, PostInstallAction, PostInstallStep};
use kiln_common::pipeline::{BuildState, PipelineEvent, Stage, StageFailure};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

use super::env::BuildEnvironment;
use super::receipt::InstallReceipt;
use super::runner::{CommandRunner, Invocation, ProcessRunner};
use crate::resolve::SourceTree;
use crate::synth::{synthesize_resource, ArgumentSet, Placeholders};

/// Name of the scoped build directory created inside the source directory.
pub const WORK_DIR_NAME: &str = "kiln-build";

/// Drives one formula through Configure, Build, Install and its extra stages.
pub struct BuildExecutor<R: CommandRunner = ProcessRunner> {
    runner: R,
    stage_timeout: Option<Duration>,
    parallelism: usize,
    events: Option<broadcast::Sender<PipelineEvent>>,
}

impl BuildExecutor<ProcessRunner> {
    pub fn new(config: &Config) -> Self {
        Self::with_runner(ProcessRunner, config.stage_timeout)
    }
}

impl<R: CommandRunner> BuildExecutor<R> {
    pub fn with_runner(runner: R, stage_timeout: Option<Duration>) -> Self {
        Self {
            runner,
            stage_timeout,
            parallelism: num_cpus::get(),
            events: None,
        }
    }

    pub fn with_parallelism(mut self, jobs: usize) -> Self {
        self.parallelism = jobs.max(1);
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Builds `spec` from `tree` into its keg.
    ///
    /// Stops at the first failing stage with `StageFailed`; nothing after it runs. A keg left by
    /// an earlier install is set aside when Installing starts and put back if the build fails.
    /// On success the keg carries an install receipt and `opt/<name>` points at it.
    #[instrument(skip_all, fields(formula = %spec.name, version = %spec.version))]
    pub fn execute(
        &self,
        spec: &FormulaSpec,
        tree: &SourceTree,
        args: &ArgumentSet,
        platform: &PlatformProfile,
    ) -> Result<InstalledArtifact> {
        let keg = platform.keg_path(&spec.name, &spec.version);
        let mut driver = StageDriver::new(self, &spec.name);
        let env = driver.check(
            BuildEnvironment::for_formula(spec, platform, self.parallelism).map(|e| e.into_vars()),
        )?;
        let mut swap = KegSwap::new(&keg);

        let src_dir = source_dir(tree.path(), spec.build.source_subdir.as_deref());
        {
            let work = driver.check(ScopedWorkDir::create(&src_dir))?;
            let commands = stage_commands(
                &spec.build,
                &src_dir,
                work.path(),
                args.configure_args(&spec.build),
                &env,
            );
            driver.run(BuildState::Configuring, &commands.configure)?;
            driver.run(BuildState::Building, &commands.build)?;
            let installing = driver.enter(BuildState::Installing)?;
            driver.check(swap.set_aside())?;
            driver.invoke(installing, &commands.install)?;
        }

        let mut artifact = InstalledArtifact::new(&spec.name, &spec.version, &keg);
        self.introspect(spec, platform, &env, &mut artifact);

        let placeholders =
            Placeholders::for_artifact(&artifact, platform).with_path("buildpath", tree.path());
        for step in spec.build.post_install.iter().filter(|s| s.when.holds(platform)) {
            self.post_install_step(&mut driver, step, tree.path(), &placeholders, &env)?;
        }

        for resource in &spec.resources {
            self.build_resource(&mut driver, resource, tree, &artifact, platform, &env)?;
        }

        driver.check(
            InstallReceipt::new(&artifact, platform, tree.source_url(), tree.head_revision())
                .write(&keg),
        )?;
        driver.check(create_symlink(&keg, &platform.opt_path(&spec.name)))?;
        driver.finish()?;
        swap.commit();
        info!("[{}] installed into {}", spec.name, keg.display());
        Ok(artifact)
    }

    fn introspect(
        &self,
        spec: &FormulaSpec,
        platform: &PlatformProfile,
        env: &BTreeMap<String, String>,
        artifact: &mut InstalledArtifact,
    ) {
        let Some(introspection) = &spec.build.introspect else {
            return;
        };
        let placeholders = Placeholders::for_artifact(artifact, platform);
        let invocation = placeholders.expand(&introspection.program).and_then(|program| {
            Ok(Invocation::new(program, artifact.prefix())
                .args(placeholders.expand_all(&introspection.args)?)
                .envs(env.clone()))
        });

        let (command, reason) = match invocation {
            Err(e) => (introspection.program.clone(), e.to_string()),
            Ok(invocation) => {
                let reason = match self.runner.run(&invocation, self.stage_timeout) {
                    Ok(outcome) if outcome.success() => {
                        let version = outcome.stdout.trim();
                        if !version.is_empty() {
                            debug!("[{}] introspected version {}", spec.name, version);
                            artifact.introspected_version = Some(version.to_string());
                            return;
                        }
                        "command printed no version".to_string()
                    }
                    Ok(outcome) => outcome
                        .failure(self.stage_timeout)
                        .map(|f| f.to_string())
                        .unwrap_or_default(),
                    Err(e) => e.to_string(),
                };
                (invocation.to_string(), reason)
            }
        };

        let warning = InstallWarning::IntrospectionWarning { command, reason };
        warn!("[{}] {}", spec.name, warning);
        self.emit(PipelineEvent::LogWarn {
            message: format!("[{}] {}", spec.name, warning),
        });
        artifact.warnings.push(warning);
    }

    fn post_install_step(
        &self,
        driver: &mut StageDriver<'_, R>,
        step: &PostInstallStep,
        tree_root: &Path,
        placeholders: &Placeholders<'_>,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let state = BuildState::PostInstall(step.stage_name());
        match &step.action {
            PostInstallAction::Run { program, args } => {
                let invocation = Invocation::new(placeholders.expand(program)?, placeholders.prefix())
                    .args(placeholders.expand_all(args)?)
                    .envs(env.clone());
                driver.run(state, &invocation)
            }
            PostInstallAction::Symlink { link, target } => driver.step(state, || {
                let link = in_keg(placeholders.prefix(), &placeholders.expand(link)?);
                let target = placeholders.expand(target)?;
                create_symlink(Path::new(&target), &link)
            }),
            PostInstallAction::InstallGlob { pattern, dest } => driver.step(state, || {
                let pattern = placeholders.expand(pattern)?;
                let dest = in_keg(placeholders.prefix(), &placeholders.expand(dest)?);
                install_glob(tree_root, &pattern, &dest)
            }),
        }
    }

    fn build_resource(
        &self,
        driver: &mut StageDriver<'_, R>,
        resource: &Resource,
        tree: &SourceTree,
        artifact: &InstalledArtifact,
        platform: &PlatformProfile,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let stage = |suffix: &str| BuildState::PostInstall(format!("{}:{}", resource.name, suffix));
        let configuring = driver.enter(stage("configure"))?;
        let src_dir = source_dir(
            &tree.resource_dir(&resource.name),
            resource.build.source_subdir.as_deref(),
        );
        let args = driver.check(synthesize_resource(resource, platform, artifact, tree.path()))?;
        let work = driver.check(ScopedWorkDir::create(&src_dir))?;
        let commands = stage_commands(
            &resource.build,
            &src_dir,
            work.path(),
            args.configure_args(&resource.build),
            env,
        );
        driver.invoke(configuring, &commands.configure)?;
        driver.run(stage("build"), &commands.build)?;
        driver.run(stage("install"), &commands.install)
    }
}

/// Tracks the state machine of one build and turns command outcomes into transitions.
struct StageDriver<'a, R: CommandRunner> {
    executor: &'a BuildExecutor<R>,
    formula: &'a str,
    state: BuildState,
}

impl<'a, R: CommandRunner> StageDriver<'a, R> {
    fn new(executor: &'a BuildExecutor<R>, formula: &'a str) -> Self {
        Self {
            executor,
            formula,
            state: BuildState::Pending,
        }
    }

    fn enter(&mut self, next: BuildState) -> Result<Stage> {
        self.state = self.state.clone().advance(next)?;
        let stage = self.current_stage();
        self.executor.emit(PipelineEvent::StageStarted {
            target_id: self.formula.to_string(),
            stage: stage.clone(),
        });
        Ok(stage)
    }

    fn current_stage(&self) -> Stage {
        self.state.stage().unwrap_or(Stage::Pending)
    }

    fn finished(&self, stage: Stage) {
        self.executor.emit(PipelineEvent::StageFinished {
            target_id: self.formula.to_string(),
            stage,
        });
    }

    fn run(&mut self, next: BuildState, invocation: &Invocation) -> Result<()> {
        let stage = self.enter(next)?;
        self.invoke(stage, invocation)
    }

    /// Runs the command of the stage already entered.
    fn invoke(&mut self, stage: Stage, invocation: &Invocation) -> Result<()> {
        info!("[{}] {}: {}", self.formula, stage, invocation);
        let timeout = self.executor.stage_timeout;
        let outcome = match self.executor.runner.run(invocation, timeout) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail(StageFailure::Spawn(e.to_string()), String::new())),
        };
        if let Some(failure) = outcome.failure(timeout) {
            return Err(self.fail(failure, outcome.combined_output()));
        }
        self.finished(stage);
        Ok(())
    }

    /// Fails the current stage when `result` is an error.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.fail(StageFailure::Spawn(e.to_string()), String::new()))
    }

    /// Runs an in-process step as a stage; any error fails the stage.
    fn step(&mut self, next: BuildState, action: impl FnOnce() -> Result<()>) -> Result<()> {
        let stage = self.enter(next)?;
        debug!("[{}] {}", self.formula, stage);
        self.check(action())?;
        self.finished(stage);
        Ok(())
    }

    fn fail(&mut self, failure: StageFailure, output: String) -> KilnError {
        let stage = self.current_stage();
        match self.state.clone().fail(failure.clone()) {
            Ok(failed) => self.state = failed,
            Err(e) => return e,
        }
        error!("[{}] {} failed: {}", self.formula, stage, failure);
        KilnError::StageFailed {
            formula: self.formula.to_string(),
            stage,
            failure,
            output,
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.state = self.state.clone().advance(BuildState::Done)?;
        Ok(())
    }
}

struct StageCommands {
    configure: Invocation,
    build: Invocation,
    install: Invocation,
}

fn stage_commands(
    recipe: &BuildRecipe,
    src_dir: &Path,
    work_dir: &Path,
    configure_args: Vec<String>,
    env: &BTreeMap<String, String>,
) -> StageCommands {
    let src = src_dir.to_string_lossy().into_owned();
    let at_work = |program: &str| Invocation::new(program, work_dir).envs(env.clone());
    match &recipe.system {
        BuildSystem::Cmake { generator } => StageCommands {
            configure: at_work("cmake")
                .args(["-G", generator.cmake_name()])
                .arg(src)
                .args(configure_args),
            build: at_work("cmake").args(["--build", "."]),
            install: at_work("cmake").args(["--build", ".", "--target", "install"]),
        },
        BuildSystem::Autotools => StageCommands {
            configure: at_work(&format!("{src}/configure")).args(configure_args),
            build: at_work("make"),
            install: at_work("make").arg("install"),
        },
    }
}

fn source_dir(root: &Path, subdir: Option<&str>) -> PathBuf {
    match subdir {
        Some(sub) => root.join(sub),
        None => root.to_path_buf(),
    }
}

fn in_keg(keg: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        keg.join(path)
    }
}

/// Copies everything matching `pattern` (relative to `tree_root`) into `dest`. Matched
/// directories are copied with their contents.
fn install_glob(tree_root: &Path, pattern: &str, dest: &Path) -> Result<()> {
    let full = tree_root.join(pattern);
    let matches = glob::glob(&full.to_string_lossy())
        .map_err(|e| KilnError::ValidationError(format!("Invalid glob '{pattern}': {e}")))?;
    let mut copied = 0usize;
    for entry in matches {
        let path = entry.map_err(|e| {
            KilnError::IoError(format!("Cannot read {}: {}", e.path().display(), e.error()))
        })?;
        let Some(name) = path.file_name() else { continue };
        if path.is_dir() {
            for item in WalkDir::new(&path) {
                let item = item.map_err(|e| KilnError::IoError(e.to_string()))?;
                if item.file_type().is_file() {
                    let rel = item.path().strip_prefix(&path).unwrap_or(item.path());
                    copy_file(item.path(), &dest.join(name).join(rel))?;
                    copied += 1;
                }
            }
        } else {
            copy_file(&path, &dest.join(name))?;
            copied += 1;
        }
    }
    if copied == 0 {
        return Err(KilnError::NotFound(format!(
            "'{pattern}' matched no files in {}",
            tree_root.display()
        )));
    }
    debug!("Installed {} file(s) matching '{}' into {}", copied, pattern, dest.display());
    Ok(())
}

/// Keeps a keg from an earlier install aside while the new one is built.
///
/// Dropped without `commit`, the partial new keg is removed and the old one renamed back.
struct KegSwap {
    keg: PathBuf,
    backup: Option<PathBuf>,
    armed: bool,
}

impl KegSwap {
    fn new(keg: &Path) -> Self {
        Self {
            keg: keg.to_path_buf(),
            backup: None,
            armed: false,
        }
    }

    fn set_aside(&mut self) -> Result<()> {
        self.armed = true;
        if self.keg.symlink_metadata().is_err() {
            return Ok(());
        }
        let name = self
            .keg
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let backup = self.keg.with_file_name(format!(".{name}.kiln-previous"));
        remove_directory_recursive(&backup)?;
        debug!("Moving previous keg {} aside", self.keg.display());
        std::fs::rename(&self.keg, &backup)?;
        self.backup = Some(backup);
        Ok(())
    }

    fn commit(mut self) {
        self.armed = false;
        if let Some(backup) = self.backup.take() {
            if let Err(e) = remove_directory_recursive(&backup) {
                warn!("Failed to remove previous keg {}: {}", backup.display(), e);
            }
        }
    }
}

impl Drop for KegSwap {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = remove_directory_recursive(&self.keg) {
            warn!("Failed to remove partial keg {}: {}", self.keg.display(), e);
            return;
        }
        if let Some(backup) = self.backup.take() {
            match std::fs::rename(&backup, &self.keg) {
                Ok(()) => debug!("Restored previous keg {}", self.keg.display()),
                Err(e) => warn!(
                    "Failed to restore previous keg {} from {}: {}",
                    self.keg.display(),
                    backup.display(),
                    e
                ),
            }
        }
    }
}

/// A freshly created `kiln-build` directory, removed again when dropped.
struct ScopedWorkDir(PathBuf);

impl ScopedWorkDir {
    fn create(src_dir: &Path) -> Result<Self> {
        let path = src_dir.join(WORK_DIR_NAME);
        remove_directory_recursive(&path)?;
        create_dir_all(&path)?;
        Ok(Self(path))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for ScopedWorkDir {
    fn drop(&mut self) {
        if let Err(e) = remove_directory_recursive(&self.0) {
            warn!("Failed to remove build directory {}: {}", self.0.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use kiln_common::model::platform::{Arch, OsFamily};

    use super::*;
    use crate::build::runner::scripted::{exit, ScriptedRunner};
    use crate::build::runner::CommandOutcome;
    use crate::synth::synthesize;

    const SHA: &str = "0e23756c05c97596009f6a2d8d1625ed34fe556a44067413089d4ca321a0c4d7";

    fn is_install(inv: &Invocation) -> bool {
        inv.args.iter().any(|a| a == "install")
    }

    fn formula(extra_build: serde_json::Value) -> FormulaSpec {
        let mut build = serde_json::json!({ "source_subdir": "llvm" });
        if let (Some(base), Some(extra)) = (build.as_object_mut(), extra_build.as_object()) {
            base.extend(extra.clone());
        }
        serde_json::from_value(serde_json::json!({
            "name": "opencilk",
            "version": "3.0",
            "sources": [{ "url": "https://example.org/opencilk.tar.gz", "sha256": SHA }],
            "build": build,
        }))
        .unwrap()
    }

    struct Fixture {
        prefix: tempfile::TempDir,
        tree: SourceTree,
        platform: PlatformProfile,
    }

    fn fixture() -> Fixture {
        let prefix = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("llvm")).unwrap();
        std::fs::write(src.path().join("LICENSE.TXT"), "license\n").unwrap();
        let platform = PlatformProfile::new(OsFamily::Linux, Arch::X86_64, prefix.path());
        Fixture {
            prefix,
            tree: SourceTree::from_dir(src),
            platform,
        }
    }

    /// Answers every command with success and lays out a keg on install.
    fn installing_runner(keg: PathBuf) -> ScriptedRunner {
        ScriptedRunner::new(move |inv| {
            if is_install(inv) {
                std::fs::create_dir_all(keg.join("lib")).unwrap();
                std::fs::write(keg.join("lib").join("libLLVM.so"), "elf").unwrap();
            }
            exit(0, "")
        })
    }

    fn run(
        fx: &Fixture,
        spec: &FormulaSpec,
        runner: ScriptedRunner,
        timeout: Option<Duration>,
    ) -> (Result<InstalledArtifact>, Vec<Invocation>) {
        let args = synthesize(spec, &fx.platform).unwrap();
        let executor = BuildExecutor::with_runner(runner, timeout).with_parallelism(2);
        let result = executor.execute(spec, &fx.tree, &args, &fx.platform);
        (result, executor.runner().calls())
    }

    #[test]
    fn cmake_stages_run_in_order_in_a_scoped_work_dir() {
        let fx = fixture();
        let spec = formula(serde_json::json!({}));
        let keg = fx.platform.keg_path("opencilk", "3.0");
        let (result, calls) = run(&fx, &spec, installing_runner(keg.clone()), None);
        let artifact = result.unwrap();

        let src = fx.tree.path().join("llvm");
        let work = src.join(WORK_DIR_NAME);
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].program, "cmake");
        assert_eq!(&calls[0].args[..3], &["-G".to_string(), "Ninja".into(), src.to_string_lossy().into_owned()]);
        assert!(calls[0].args.contains(&format!("-DCMAKE_INSTALL_PREFIX={}", keg.display())));
        assert_eq!(calls[1].args, vec!["--build", "."]);
        assert_eq!(calls[2].args, vec!["--build", ".", "--target", "install"]);
        assert!(calls.iter().all(|c| c.cwd == work));
        assert_eq!(calls[0].env.get("MAKEFLAGS").map(String::as_str), Some("-j2"));
        assert!(!work.exists());

        assert_eq!(artifact.prefix(), keg.as_path());
        assert!(keg.join(super::super::receipt::RECEIPT_FILE).is_file());
        assert_eq!(std::fs::read_link(fx.platform.opt_path("opencilk")).unwrap(), keg);
        drop(fx.prefix);
    }

    #[test]
    fn build_failure_stops_before_install() {
        let fx = fixture();
        let spec = formula(serde_json::json!({}));
        let runner = ScriptedRunner::new(|inv| {
            if inv.args == ["--build", "."] {
                CommandOutcome {
                    exit_code: Some(1),
                    timed_out: false,
                    stdout: "[12/4000] Building CXX object".into(),
                    stderr: "error: no member named 'x'".into(),
                }
            } else {
                exit(0, "")
            }
        });
        let (result, calls) = run(&fx, &spec, runner, None);
        match result {
            Err(KilnError::StageFailed { stage, failure, output, .. }) => {
                assert_eq!(stage, Stage::Building);
                assert_eq!(failure, StageFailure::ExitCode(1));
                assert!(output.contains("no member named"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.len(), 2);
        assert!(!fx.tree.path().join("llvm").join(WORK_DIR_NAME).exists());
        assert!(!fx.platform.keg_path("opencilk", "3.0").exists());
    }

    #[test]
    fn timeouts_fail_the_running_stage() {
        let fx = fixture();
        let spec = formula(serde_json::json!({}));
        let limit = Duration::from_secs(5);
        let runner = ScriptedRunner::new(|inv| {
            if inv.args.iter().any(|a| a == "-G") {
                CommandOutcome {
                    exit_code: None,
                    timed_out: true,
                    stdout: String::new(),
                    stderr: String::new(),
                }
            } else {
                exit(0, "")
            }
        });
        let (result, calls) = run(&fx, &spec, runner, Some(limit));
        assert!(matches!(
            result,
            Err(KilnError::StageFailed { stage: Stage::Configuring, failure: StageFailure::Timeout(d), .. })
                if d == limit
        ));
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn failed_introspection_is_only_a_warning() {
        let fx = fixture();
        let spec = formula(serde_json::json!({
            "introspect": { "program": "{bin}/llvm-config", "args": ["--version"] }
        }));
        let keg = fx.platform.keg_path("opencilk", "3.0");
        let installer = installing_runner(keg.clone());
        let runner = ScriptedRunner::new(move |inv| {
            if inv.program.ends_with("llvm-config") {
                exit(127, "")
            } else {
                installer.respond(inv)
            }
        });
        let (result, _) = run(&fx, &spec, runner, None);
        let artifact = result.unwrap();
        assert_eq!(artifact.introspected_version, None);
        assert!(matches!(
            &artifact.warnings[..],
            [InstallWarning::IntrospectionWarning { command, .. }] if command.ends_with("llvm-config --version")
        ));
        assert!(keg.join(super::super::receipt::RECEIPT_FILE).is_file());
    }

    #[test]
    fn post_install_steps_see_the_introspected_soversion() {
        let fx = fixture();
        let spec = formula(serde_json::json!({
            "introspect": { "program": "{bin}/llvm-config", "args": ["--version"] },
            "post_install": [
                { "step": "symlink", "link": "lib/libLLVM-{soversion}.so", "target": "libLLVM.so" },
                { "step": "install_glob", "pattern": "LICENSE.TXT", "dest": "share/doc" }
            ]
        }));
        let keg = fx.platform.keg_path("opencilk", "3.0");
        let installer = installing_runner(keg.clone());
        let runner = ScriptedRunner::new(move |inv| {
            if inv.program.ends_with("llvm-config") {
                exit(0, "19.1.7\n")
            } else {
                installer.respond(inv)
            }
        });
        let (result, _) = run(&fx, &spec, runner, None);
        let artifact = result.unwrap();
        assert_eq!(artifact.introspected_version.as_deref(), Some("19.1.7"));
        assert_eq!(
            std::fs::read_link(keg.join("lib/libLLVM-19.so")).unwrap(),
            PathBuf::from("libLLVM.so")
        );
        assert!(keg.join("share/doc/LICENSE.TXT").is_file());
    }

    #[test]
    fn failing_post_install_step_is_a_named_stage_failure() {
        let fx = fixture();
        let spec = formula(serde_json::json!({
            "post_install": [{ "name": "docs", "step": "install_glob", "pattern": "*.md", "dest": "share" }]
        }));
        let keg = fx.platform.keg_path("opencilk", "3.0");
        let (result, _) = run(&fx, &spec, installing_runner(keg.clone()), None);
        assert!(matches!(
            result,
            Err(KilnError::StageFailed { stage: Stage::PostInstall(name), failure: StageFailure::Spawn(_), .. })
                if name == "docs"
        ));
        assert!(!keg.join(super::super::receipt::RECEIPT_FILE).exists());
    }

    #[test]
    fn resources_get_three_stages_each() {
        let fx = fixture();
        let mut spec = formula(serde_json::json!({}));
        spec.resources = vec![serde_json::from_value(serde_json::json!({
            "name": "cheetah",
            "source": { "url": "https://example.org/cheetah.tar.gz", "sha256": SHA },
            "build": { "args": [{ "args": ["-DCMAKE_C_COMPILER={bin}/clang"] }] }
        }))
        .unwrap()];
        std::fs::create_dir_all(fx.tree.resource_dir("cheetah")).unwrap();

        let keg = fx.platform.keg_path("opencilk", "3.0");
        let (tx, mut rx) = broadcast::channel(64);
        let args = synthesize(&spec, &fx.platform).unwrap();
        let executor = BuildExecutor::with_runner(installing_runner(keg.clone()), None).with_events(tx);
        executor.execute(&spec, &fx.tree, &args, &fx.platform).unwrap();

        let calls = executor.runner().calls();
        assert_eq!(calls.len(), 6);
        let resource_work = fx.tree.resource_dir("cheetah").join(WORK_DIR_NAME);
        assert!(calls[3..].iter().all(|c| c.cwd == resource_work));
        assert!(calls[3].args.contains(&format!("-DCMAKE_C_COMPILER={}/bin/clang", keg.display())));

        let mut started = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::StageStarted { stage, .. } = event {
                started.push(stage.to_string());
            }
        }
        assert_eq!(
            started,
            vec![
                "Configuring",
                "Building",
                "Installing",
                "PostInstall(cheetah:configure)",
                "PostInstall(cheetah:build)",
                "PostInstall(cheetah:install)",
            ]
        );
    }

    fn previous_keg(fx: &Fixture) -> PathBuf {
        let keg = fx.platform.keg_path("opencilk", "3.0");
        std::fs::create_dir_all(keg.join("bin")).unwrap();
        std::fs::write(keg.join("bin/clang"), "old clang").unwrap();
        create_symlink(&keg, &fx.platform.opt_path("opencilk")).unwrap();
        keg
    }

    fn cellar_entries(keg: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(keg.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn failed_install_restores_the_previous_keg() {
        let fx = fixture();
        let spec = formula(serde_json::json!({}));
        let keg = previous_keg(&fx);
        let partial = keg.clone();
        let runner = ScriptedRunner::new(move |inv| {
            if is_install(inv) {
                std::fs::create_dir_all(partial.join("lib")).unwrap();
                std::fs::write(partial.join("lib/libLLVM.so"), "half").unwrap();
                exit(2, "")
            } else {
                exit(0, "")
            }
        });
        let (result, _) = run(&fx, &spec, runner, None);
        assert!(matches!(
            result,
            Err(KilnError::StageFailed { stage: Stage::Installing, failure: StageFailure::ExitCode(2), .. })
        ));
        assert_eq!(std::fs::read_to_string(keg.join("bin/clang")).unwrap(), "old clang");
        assert!(!keg.join("lib").exists());
        assert_eq!(std::fs::read_link(fx.platform.opt_path("opencilk")).unwrap(), keg);
        assert_eq!(cellar_entries(&keg), vec!["3.0"]);
    }

    #[test]
    fn failed_post_install_step_also_restores_the_previous_keg() {
        let fx = fixture();
        let spec = formula(serde_json::json!({
            "post_install": [{ "name": "docs", "step": "install_glob", "pattern": "*.md", "dest": "share" }]
        }));
        let keg = previous_keg(&fx);
        let (result, _) = run(&fx, &spec, installing_runner(keg.clone()), None);
        assert!(result.is_err());
        assert!(keg.join("bin/clang").is_file());
        assert!(!keg.join("lib/libLLVM.so").exists());
        assert_eq!(cellar_entries(&keg), vec!["3.0"]);
    }

    #[test]
    fn successful_install_replaces_the_previous_keg() {
        let fx = fixture();
        let spec = formula(serde_json::json!({}));
        let keg = previous_keg(&fx);
        let (result, _) = run(&fx, &spec, installing_runner(keg.clone()), None);
        result.unwrap();
        assert!(!keg.join("bin/clang").exists());
        assert!(keg.join("lib/libLLVM.so").is_file());
        assert_eq!(cellar_entries(&keg), vec!["3.0"]);
    }

    #[test]
    fn unsynthesizable_resource_fails_its_configure_stage() {
        let fx = fixture();
        let mut spec = formula(serde_json::json!({}));
        spec.resources = vec![serde_json::from_value(serde_json::json!({
            "name": "cheetah",
            "source": { "url": "https://example.org/cheetah.tar.gz", "sha256": SHA },
            "build": { "args": [{ "args": ["-DCHEETAH_SYSROOT={fact:sysroot_override}"] }] }
        }))
        .unwrap()];
        std::fs::create_dir_all(fx.tree.resource_dir("cheetah")).unwrap();

        let keg = fx.platform.keg_path("opencilk", "3.0");
        let (tx, mut rx) = broadcast::channel(64);
        let args = synthesize(&spec, &fx.platform).unwrap();
        let executor = BuildExecutor::with_runner(installing_runner(keg.clone()), None).with_events(tx);
        let result = executor.execute(&spec, &fx.tree, &args, &fx.platform);

        match result {
            Err(KilnError::StageFailed { stage, failure: StageFailure::Spawn(reason), .. }) => {
                assert_eq!(stage, Stage::PostInstall("cheetah:configure".into()));
                assert!(reason.contains("sysroot_override"), "{reason}");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(executor.runner().calls().len(), 3);
        assert!(!keg.exists());

        let mut last_started = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                PipelineEvent::StageStarted { stage, .. } => last_started = Some(stage),
                PipelineEvent::StageFinished { stage, .. } => {
                    assert_ne!(stage, Stage::PostInstall("cheetah:configure".into()))
                }
                _ => {}
            }
        }
        assert_eq!(last_started, Some(Stage::PostInstall("cheetah:configure".into())));
    }

    #[test]
    fn install_glob_copies_directories_and_reports_bad_patterns() {
        let tree = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tree.path().join("utils/vim/syntax")).unwrap();
        std::fs::write(tree.path().join("utils/vim/syntax/llvm.vim"), "syn").unwrap();

        install_glob(tree.path(), "utils/vim/*", dest.path()).unwrap();
        assert!(dest.path().join("syntax/llvm.vim").is_file());

        assert!(matches!(
            install_glob(tree.path(), "utils/[", dest.path()),
            Err(KilnError::ValidationError(_))
        ));
        assert!(matches!(
            install_glob(tree.path(), "utils/*.el", dest.path()),
            Err(KilnError::NotFound(_))
        ));
    }
}
