// kiln-aio/src/git2.rs
//! Synchronous Git operations using git2, for HEAD builds.
use std::path::Path;

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{FetchOptions, Oid, Repository};
use kiln_common::error::{KilnError, Result};
use tracing::{debug, error};

/// Clones `url` into `dest` and checks out `revision` (a commit, tag or any revspec) or, failing
/// that, the tip of `branch` or the remote's default branch. Returns the checked out commit id.
/// Contains blocking network and filesystem I/O.
pub fn clone_at(
    url: &str,
    dest: &Path,
    branch: Option<&str>,
    revision: Option<&str>,
) -> Result<String> {
    debug!(
        "Cloning {} into {} (branch: {:?}, revision: {:?})",
        url,
        dest.display(),
        branch,
        revision
    );

    let mut builder = RepoBuilder::new();
    builder.fetch_options(FetchOptions::new());
    if let Some(branch) = branch {
        builder.branch(branch);
    }
    let repo = builder.clone(url, dest).map_err(|e| {
        error!("Failed to clone {}: {}", url, e);
        KilnError::Generic(format!("Failed to clone '{url}': {e}"))
    })?;

    if let Some(revision) = revision {
        checkout_revision(&repo, revision)?;
    }
    let head = head_commit(&repo)?;
    debug!("Checked out {} at {}", url, head);
    Ok(head.to_string())
}

fn checkout_revision(repo: &Repository, revision: &str) -> Result<()> {
    let object = repo.revparse_single(revision).map_err(|e| {
        KilnError::Generic(format!("Revision '{revision}' not found: {e}"))
    })?;
    repo.checkout_tree(&object, Some(CheckoutBuilder::new().force()))?;
    let commit = object.peel_to_commit()?;
    repo.set_head_detached(commit.id())?;
    Ok(())
}

fn head_commit(repo: &Repository) -> Result<Oid> {
    Ok(repo.head()?.peel_to_commit()?.id())
}
