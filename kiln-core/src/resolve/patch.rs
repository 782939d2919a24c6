// kiln-core/src/resolve/patch.rs
use std::collections::BTreeMap;
use std::path::Path;

use kiln_aio::fs::atomic_write_file;
use kiln_aio::process::run_command_async;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::formula::SourceEdit;
use regex::Regex;
use tracing::{debug, error};

use crate::synth::Placeholders;

/// Applies a unified diff to `tree` with `patch -p<strip>`.
///
/// The patch is dry-run first so a patch that does not apply leaves the tree untouched.
pub async fn apply_patch(tree: &Path, patch_file: &Path, strip: usize, patch_id: &str) -> Result<()> {
    let mut args = vec![
        format!("-p{strip}"),
        "--batch".to_string(),
        "--forward".to_string(),
        "-i".to_string(),
        patch_file.to_string_lossy().into_owned(),
    ];
    let env = BTreeMap::new();

    args.push("--dry-run".to_string());
    let dry_run = run_command_async("patch", &args, Some(tree), &env).await?;
    if !dry_run.status.success() {
        let reason = patch_output(&dry_run.stdout, &dry_run.stderr);
        error!("Patch '{}' does not apply: {}", patch_id, reason);
        return Err(KilnError::Patch {
            patch_id: patch_id.to_string(),
            reason,
        });
    }

    args.pop();
    let applied = run_command_async("patch", &args, Some(tree), &env).await?;
    if !applied.status.success() {
        return Err(KilnError::Patch {
            patch_id: patch_id.to_string(),
            reason: patch_output(&applied.stdout, &applied.stderr),
        });
    }
    debug!("Applied patch '{}' to {}", patch_id, tree.display());
    Ok(())
}

fn patch_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stdout).trim().to_string();
    let err = String::from_utf8_lossy(stderr);
    if !err.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(err.trim());
    }
    if text.is_empty() {
        text = "patch exited unsuccessfully".to_string();
    }
    text
}

/// Applies regex substitutions to files of the source tree, in order. `replacement` is expanded
/// with `placeholders` first; `$1`-style group references are left to the regex engine.
pub fn apply_source_edits(
    tree: &Path,
    edits: &[SourceEdit],
    placeholders: &Placeholders<'_>,
) -> Result<()> {
    for edit in edits {
        let edit_id = format!("edit:{}", edit.path);
        let fail = |reason: String| KilnError::Patch {
            patch_id: edit_id.clone(),
            reason,
        };

        let re = Regex::new(&edit.pattern)
            .map_err(|e| fail(format!("invalid pattern '{}': {e}", edit.pattern)))?;
        let replacement = placeholders.expand(&edit.replacement)?;
        let path = tree.join(&edit.path);
        let original = std::fs::read_to_string(&path)
            .map_err(|e| fail(format!("cannot read {}: {e}", path.display())))?;
        if !re.is_match(&original) {
            return Err(fail(format!("pattern '{}' matched nothing", edit.pattern)));
        }
        let edited = re.replace_all(&original, replacement.as_str());
        atomic_write_file(&path, edited.as_bytes())?;
        debug!("Applied source edit to {}", path.display());
    }
    Ok(())
}
