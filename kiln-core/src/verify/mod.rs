// kiln-core/src/verify/mod.rs
//! Smoke checks against an installed product.
//!
//! Every check of a recipe runs, whatever happened to the ones before it; the report decides
//! afterwards whether the product passed. A failed verification never touches the keg.

pub mod linkage;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::artifact::InstalledArtifact;
use kiln_common::model::platform::PlatformProfile;
use kiln_common::model::recipe::{Check, CheckKind, Expectation, OutputMatch, TestRecipe};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

pub use self::linkage::linked_libraries;
use crate::build::{BuildEnvironment, CommandRunner, Invocation, ProcessRunner};
use crate::synth::Placeholders;

// Lines of command output quoted in a failure reason.
const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed { reason: String },
    Skipped { reason: String },
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Passed => write!(f, "passed"),
            CheckStatus::Failed { reason } => write!(f, "failed: {reason}"),
            CheckStatus::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    #[serde(flatten)]
    pub status: CheckStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub formula: String,
    pub results: Vec<CheckResult>,
}

impl VerificationReport {
    fn count(&self, pred: impl Fn(&CheckStatus) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.status)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|s| matches!(s, CheckStatus::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, CheckStatus::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, CheckStatus::Skipped { .. }))
    }

    pub fn failed_checks(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| matches!(r.status, CheckStatus::Failed { .. }))
            .map(|r| r.name.clone())
            .collect()
    }

    /// `VerificationFailed` naming every failed check, if there is one.
    pub fn status(&self) -> Result<()> {
        let failed_checks = self.failed_checks();
        if failed_checks.is_empty() {
            Ok(())
        } else {
            Err(KilnError::VerificationFailed { failed_checks })
        }
    }

    pub fn into_result(self) -> Result<Self> {
        self.status().map(|()| self)
    }
}

/// Runs the checks of a [`TestRecipe`] in a scratch directory.
pub struct VerificationHarness<R: CommandRunner = ProcessRunner> {
    runner: R,
    timeout: Option<Duration>,
}

impl VerificationHarness<ProcessRunner> {
    pub fn new(config: &Config) -> Self {
        Self::with_runner(ProcessRunner, config.stage_timeout)
    }
}

impl<R: CommandRunner> VerificationHarness<R> {
    pub fn with_runner(runner: R, timeout: Option<Duration>) -> Self {
        Self { runner, timeout }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Runs every check of `recipe` against `artifact`.
    ///
    /// `Err` only when the scratch directory cannot be prepared; check failures end up in the
    /// report.
    #[instrument(skip_all, fields(formula = %artifact.name))]
    pub fn verify(
        &self,
        artifact: &InstalledArtifact,
        recipe: &TestRecipe,
        platform: &PlatformProfile,
    ) -> Result<VerificationReport> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-test-", artifact.name))
            .tempdir()?;
        let placeholders = Placeholders::for_artifact(artifact, platform)
            .with_path("testpath", scratch.path());

        for file in &recipe.files {
            let path = scratch.path().join(placeholders.expand(&file.path)?);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, placeholders.expand(&file.content)?)?;
            debug!("Wrote test file {}", path.display());
        }

        let env = BuildEnvironment::for_tests(artifact, platform).into_vars();
        let ctx = CheckContext {
            scratch: scratch.path(),
            keg: artifact.prefix(),
            placeholders: &placeholders,
            env: &env,
        };

        let mut results = Vec::with_capacity(recipe.checks.len());
        for check in &recipe.checks {
            let status = if check.requires.holds(platform) {
                self.run_check(check, &ctx)
            } else {
                CheckStatus::Skipped {
                    reason: "requirement not met on this platform".to_string(),
                }
            };
            match &status {
                CheckStatus::Failed { reason } => {
                    warn!("[{}] check '{}' failed: {}", artifact.name, check.name, reason)
                }
                other => debug!("[{}] check '{}' {}", artifact.name, check.name, other),
            }
            results.push(CheckResult {
                name: check.name.clone(),
                status,
            });
        }

        let report = VerificationReport {
            formula: artifact.name.clone(),
            results,
        };
        info!(
            "[{}] verification: {} passed, {} failed, {} skipped",
            artifact.name,
            report.passed(),
            report.failed(),
            report.skipped()
        );
        Ok(report)
    }

    fn run_check(&self, check: &Check, ctx: &CheckContext<'_>) -> CheckStatus {
        let result = match &check.kind {
            CheckKind::Command {
                program,
                args,
                expect,
            } => self.command_check(program, args, expect, ctx),
            CheckKind::NoFilesMatching { pattern } => no_files_matching(pattern, ctx),
            CheckKind::Links {
                binary,
                includes,
                excludes,
            } => links_check(binary, includes, excludes, ctx),
        };
        match result {
            Ok(()) => CheckStatus::Passed,
            Err(reason) => CheckStatus::Failed { reason },
        }
    }

    fn command_check(
        &self,
        program: &str,
        args: &[String],
        expect: &Expectation,
        ctx: &CheckContext<'_>,
    ) -> std::result::Result<(), String> {
        let program = ctx.expand(program)?;
        let args = ctx.placeholders.expand_all(args).map_err(|e| e.to_string())?;
        let invocation = Invocation::new(ctx.scratch_path(&program), ctx.scratch)
            .args(args)
            .envs(ctx.env.clone());
        debug!("Running check command: {}", invocation);

        let outcome = self
            .runner
            .run(&invocation, self.timeout)
            .map_err(|e| e.to_string())?;
        if outcome.timed_out {
            return Err(format!("'{invocation}' timed out"));
        }
        if outcome.exit_code != Some(expect.exit_code) {
            let code = outcome
                .exit_code
                .map_or_else(|| "a signal".to_string(), |c| format!("exit code {c}"));
            return Err(format!(
                "'{invocation}' ended with {code}, expected exit code {}{}",
                expect.exit_code,
                quoted_tail(&outcome.combined_output())
            ));
        }

        let Some(expected) = &expect.output else {
            return Ok(());
        };
        let mut output = outcome.stdout.clone();
        if expect.merge_stderr {
            output.push_str(&outcome.stderr);
        }
        let output = if expect.trim { output.trim() } else { output.as_str() };
        output_matches(expected, output)
    }
}

struct CheckContext<'a> {
    scratch: &'a Path,
    keg: &'a Path,
    placeholders: &'a Placeholders<'a>,
    env: &'a BTreeMap<String, String>,
}

impl CheckContext<'_> {
    fn expand(&self, input: &str) -> std::result::Result<String, String> {
        self.placeholders.expand(input).map_err(|e| e.to_string())
    }

    /// Relative paths with a directory part (`./a.out`, `out/bin`) live in the scratch dir;
    /// bare names are left for `PATH`.
    fn scratch_path(&self, program: &str) -> String {
        let path = Path::new(program);
        if path.is_relative() && path.components().count() > 1 {
            self.scratch.join(path).to_string_lossy().into_owned()
        } else {
            program.to_string()
        }
    }
}

fn output_matches(expected: &OutputMatch, output: &str) -> std::result::Result<(), String> {
    let matched = match expected {
        OutputMatch::Equals(want) => output == want,
        OutputMatch::Contains(want) => output.contains(want.as_str()),
        OutputMatch::Matches(pattern) => Regex::new(pattern)
            .map_err(|e| format!("invalid pattern '{pattern}': {e}"))?
            .is_match(output),
    };
    if matched {
        return Ok(());
    }
    let wanted = match expected {
        OutputMatch::Equals(want) => format!("output equal to '{want}'"),
        OutputMatch::Contains(want) => format!("output containing '{want}'"),
        OutputMatch::Matches(pattern) => format!("output matching /{pattern}/"),
    };
    Err(format!("expected {wanted}{}", quoted_tail(output)))
}

fn no_files_matching(pattern: &str, ctx: &CheckContext<'_>) -> std::result::Result<(), String> {
    let pattern = ctx.expand(pattern)?;
    let full = ctx.keg.join(&pattern);
    let found: Vec<PathBuf> = glob::glob(&full.to_string_lossy())
        .map_err(|e| format!("invalid pattern '{pattern}': {e}"))?
        .filter_map(|entry| entry.ok())
        .collect();
    if found.is_empty() {
        return Ok(());
    }
    let listed: Vec<String> = found
        .iter()
        .take(5)
        .map(|p| p.strip_prefix(ctx.keg).unwrap_or(p).display().to_string())
        .collect();
    Err(format!(
        "{} file(s) match '{pattern}': {}",
        found.len(),
        listed.join(", ")
    ))
}

fn links_check(
    binary: &str,
    includes: &[String],
    excludes: &[String],
    ctx: &CheckContext<'_>,
) -> std::result::Result<(), String> {
    let binary = ctx.scratch.join(ctx.expand(binary)?);
    let libraries = linked_libraries(&binary).map_err(|e| e.to_string())?;

    let mut problems = Vec::new();
    for include in includes {
        let include = ctx.expand(include)?;
        if !libraries.iter().any(|lib| library_is(lib, &include)) {
            problems.push(format!("does not link {include}"));
        }
    }
    for exclude in excludes {
        let re = Regex::new(exclude).map_err(|e| format!("invalid pattern '{exclude}': {e}"))?;
        problems.extend(
            libraries
                .iter()
                .filter(|lib| re.is_match(lib))
                .map(|lib| format!("links {lib}")),
        );
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(format!("{}: {}", binary.display(), problems.join("; ")))
    }
}

/// `wanted` names `library` exactly, by file name or as a trailing path.
fn library_is(library: &str, wanted: &str) -> bool {
    library == wanted
        || Path::new(library).file_name().is_some_and(|n| n == wanted)
        || library.ends_with(&format!("/{}", wanted.trim_start_matches('/')))
}

fn quoted_tail(output: &str) -> String {
    let lines: Vec<&str> = output.trim_end().lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let tail = &lines[lines.len().saturating_sub(OUTPUT_TAIL_LINES)..];
    format!("\n{}", tail.join("\n"))
}

#[cfg(test)]
mod tests {
    use kiln_common::model::platform::{capability, Arch, OsFamily};

    use super::*;
    use crate::build::runner::scripted::{exit, ScriptedRunner};
    use crate::build::CommandOutcome;

    fn recipe(value: serde_json::Value) -> TestRecipe {
        serde_json::from_value(value).unwrap()
    }

    fn setup() -> (tempfile::TempDir, PlatformProfile, InstalledArtifact) {
        let root = tempfile::tempdir().unwrap();
        let platform = PlatformProfile::new(OsFamily::Linux, Arch::X86_64, root.path());
        let keg = platform.keg_path("opencilk", "3.0");
        std::fs::create_dir_all(keg.join("bin")).unwrap();
        std::fs::create_dir_all(keg.join("lib")).unwrap();
        let artifact = InstalledArtifact::new("opencilk", "3.0", keg);
        (root, platform, artifact)
    }

    fn cilk_runner() -> ScriptedRunner {
        ScriptedRunner::new(|inv| {
            if inv.program.ends_with("/cilktest") {
                exit(0, "fib(20) = 6765\n")
            } else if inv.program.ends_with("cilktest_san") {
                CommandOutcome {
                    exit_code: Some(0),
                    timed_out: false,
                    stdout: "fib(20) = 6765\n".into(),
                    stderr: "Cilksan detected 0 distinct races.\n".into(),
                }
            } else {
                exit(0, "")
            }
        })
    }

    #[test]
    fn all_checks_pass_and_files_are_written() {
        let (_root, platform, artifact) = setup();
        let recipe = recipe(serde_json::json!({
            "files": [{ "path": "fib.c", "content": "int main() {{ return 0; }}\n" }],
            "checks": [
                { "name": "compile", "check": "command", "program": "{bin}/clang",
                  "args": ["-fopencilk", "{testpath}/fib.c", "-o", "cilktest"] },
                { "name": "fib", "check": "command", "program": "./cilktest",
                  "expect": { "output": { "equals": "fib(20) = 6765" } } },
                { "name": "cilksan", "check": "command", "program": "./cilktest_san",
                  "expect": { "merge_stderr": true,
                              "output": { "matches": "Cilksan detected 0 distinct races" } } }
            ]
        }));
        let harness = VerificationHarness::with_runner(cilk_runner(), None);
        let report = harness.verify(&artifact, &recipe, &platform).unwrap();
        assert_eq!(report.passed(), 3, "{report:?}");
        assert!(report.status().is_ok());

        let calls = harness.runner().calls();
        assert_eq!(calls[0].program, artifact.bin_dir().join("clang").to_string_lossy());
        let scratch = &calls[0].cwd;
        assert_eq!(calls[0].args[1], scratch.join("fib.c").to_string_lossy());
        assert!(calls[1].program.starts_with(&*scratch.to_string_lossy()));
        // The scratch directory is gone once the report exists.
        assert!(!scratch.exists());
    }

    #[test]
    fn failures_are_collected_and_later_checks_still_run() {
        let (_root, platform, artifact) = setup();
        let recipe = recipe(serde_json::json!({
            "checks": [
                { "name": "wrong-output", "check": "command", "program": "./cilktest",
                  "expect": { "output": { "equals": "fib(20) = 6766" } } },
                { "name": "crashes", "check": "command", "program": "./crash" },
                { "name": "still-runs", "check": "command", "program": "./cilktest",
                  "expect": { "output": { "contains": "6765" } } }
            ]
        }));
        let runner = ScriptedRunner::new(|inv| {
            if inv.program.ends_with("/crash") {
                exit(139, "segmentation fault")
            } else {
                exit(0, "fib(20) = 6765\n")
            }
        });
        let report = VerificationHarness::with_runner(runner, None)
            .verify(&artifact, &recipe, &platform)
            .unwrap();
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.results[2].status, CheckStatus::Passed);
        match &report.results[1].status {
            CheckStatus::Failed { reason } => {
                assert!(reason.contains("exit code 139"), "{reason}");
                assert!(reason.contains("segmentation fault"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match report.status() {
            Err(KilnError::VerificationFailed { failed_checks }) => {
                assert_eq!(failed_checks, ["wrong-output", "crashes"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unmet_requirements_skip_the_check() {
        let (_root, platform, artifact) = setup();
        let recipe = recipe(serde_json::json!({
            "checks": [
                { "name": "ffi", "check": "command", "program": "./ffi",
                  "requires": { "capability": capability::SYSTEM_FFI_HEADERS } },
                { "name": "mac-only", "check": "no_files_matching", "pattern": "lib/libc++*",
                  "requires": { "os": "macos" } }
            ]
        }));
        let harness = VerificationHarness::with_runner(cilk_runner(), None);
        let report = harness.verify(&artifact, &recipe, &platform).unwrap();
        assert_eq!(report.skipped(), 2);
        assert!(report.status().is_ok());
        assert!(harness.runner().calls().is_empty());
    }

    #[test]
    fn stray_files_in_the_keg_fail_the_check() {
        let (_root, platform, artifact) = setup();
        let recipe = recipe(serde_json::json!({
            "checks": [
                { "name": "no-libcxx", "check": "no_files_matching", "pattern": "lib/libc++*" },
                { "name": "no-libunwind", "check": "no_files_matching", "pattern": "lib/libunwind*" }
            ]
        }));
        std::fs::write(artifact.lib_dir().join("libc++.dylib"), "").unwrap();
        let report = VerificationHarness::with_runner(cilk_runner(), None)
            .verify(&artifact, &recipe, &platform)
            .unwrap();
        assert!(matches!(&report.results[0].status,
            CheckStatus::Failed { reason } if reason.contains("lib/libc++.dylib")));
        assert_eq!(report.results[1].status, CheckStatus::Passed);
    }

    #[test]
    fn unreadable_binaries_fail_the_links_check() {
        let (_root, platform, artifact) = setup();
        let recipe = recipe(serde_json::json!({
            "files": [{ "path": "cilktest", "content": "#!/bin/sh\n" }],
            "checks": [{ "name": "links", "check": "links", "binary": "cilktest",
                         "excludes": ["libstdc\\+\\+"] }]
        }));
        let report = VerificationHarness::with_runner(cilk_runner(), None)
            .verify(&artifact, &recipe, &platform)
            .unwrap();
        assert_eq!(report.failed(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn links_check_reads_real_binaries() {
        let (_root, platform, artifact) = setup();
        let exe = std::env::current_exe().unwrap();
        let recipe = recipe(serde_json::json!({
            "checks": [
                { "name": "libc", "check": "links", "binary": exe,
                  "excludes": ["^libstdc\\+\\+", "^libatomic"] },
                { "name": "wants-cilkrts", "check": "links", "binary": exe,
                  "includes": ["libopencilk.so"] }
            ]
        }));
        let report = VerificationHarness::with_runner(cilk_runner(), None)
            .verify(&artifact, &recipe, &platform)
            .unwrap();
        assert_eq!(report.results[0].status, CheckStatus::Passed);
        assert!(matches!(&report.results[1].status,
            CheckStatus::Failed { reason } if reason.contains("does not link libopencilk.so")));
    }

    #[test]
    fn library_names_match_by_file_name_or_suffix() {
        assert!(library_is("/usr/lib/libSystem.B.dylib", "libSystem.B.dylib"));
        assert!(library_is("@rpath/lib/libopencilk.dylib", "lib/libopencilk.dylib"));
        assert!(library_is("libc.so.6", "libc.so.6"));
        assert!(!library_is("libc.so.6", "libc.so"));
    }
}
