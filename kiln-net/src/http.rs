// kiln-net/src/http.rs
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_aio::checksum::verify_checksum_async;
use kiln_common::error::{KilnError, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::Client;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::retry::RetryPolicy;
use crate::validation::validate_url;

const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT_STRING: &str = "kiln formula builder (Rust)";

/// Transfers the bytes behind a URL into a local file.
///
/// Implementations report transient conditions with errors for which
/// [`KilnError::is_transient`] holds; everything else is treated as permanent.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &Path) -> impl Future<Output = Result<()>> + Send;
}

/// `https://` through reqwest, `file://` by copying.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_http_client()?,
        })
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let parsed = validate_url(url)?;
        if parsed.scheme() == "file" {
            let src = parsed.to_file_path().map_err(|_| {
                KilnError::ValidationError(format!("'{url}' is not a local file path"))
            })?;
            debug!("Copying local source {} -> {}", src.display(), dest.display());
            fs::copy(&src, dest).await?;
            return Ok(());
        }

        let mut response = self
            .client
            .get(parsed)
            .send()
            .await?
            .error_for_status()
            .inspect_err(|e| debug!("HTTP error for {}: {}", url, e))?;
        debug!("Received HTTP status: {} for {}", response.status(), url);

        let mut file = File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        debug!("Wrote {} bytes from {} to {}", written, url, dest.display());
        Ok(())
    }
}

fn build_http_client() -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(KilnError::from)
}

/// Fetches the first URL that yields content into `cache_path` and verifies it against
/// `sha256`. Mirrors are tried in order after the primary.
///
/// A cached file whose hash verifies is reused without fetching. A hash mismatch is fatal:
/// the download is removed and no further URL is tried. Transient failures are retried per
/// `policy`; `on_retry(url, attempt, error)` is called before each retry.
pub async fn fetch_verified<F: Fetcher>(
    fetcher: &F,
    urls: &[&str],
    sha256: &str,
    cache_path: &Path,
    policy: &RetryPolicy,
    mut on_retry: impl FnMut(&str, u32, &KilnError),
) -> Result<PathBuf> {
    let primary = urls.first().copied().unwrap_or_default();

    if cache_path.is_file() {
        match verify_checksum_async(cache_path, sha256, primary).await {
            Ok(()) => {
                debug!("Using valid cached file: {}", cache_path.display());
                return Ok(cache_path.to_path_buf());
            }
            Err(e) => {
                debug!(
                    "Cached file {} is stale ({}). Refetching.",
                    cache_path.display(),
                    e
                );
                if let Err(remove_err) = fs::remove_file(cache_path).await {
                    warn!(
                        "Failed to remove stale cached file {}: {}",
                        cache_path.display(),
                        remove_err
                    );
                }
            }
        }
    }

    if let Some(parent) = cache_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_path = cache_path.with_file_name(format!(
        ".{}.download",
        cache_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
    ));

    let mut last_error: Option<KilnError> = None;
    for url in urls {
        debug!("Attempting download from: {}", url);
        let fetched = policy
            .run(url, |attempt, e| on_retry(url, attempt, e), |_| async {
                let _ = fs::remove_file(&temp_path).await;
                fetcher.fetch(url, &temp_path).await
            })
            .await;
        if let Err(e) = fetched {
            error!("Download attempt failed from {}: {}", url, e);
            let _ = fs::remove_file(&temp_path).await;
            last_error = Some(e);
            continue;
        }

        if let Err(e) = verify_checksum_async(&temp_path, sha256, url).await {
            error!("{}", e);
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        fs::rename(&temp_path, cache_path).await?;
        debug!("Moved verified file to {}", cache_path.display());
        return Ok(cache_path.to_path_buf());
    }

    Err(last_error.unwrap_or_else(|| {
        KilnError::Fetch {
            url: primary.to_string(),
            attempts: 0,
            reason: "no URL to fetch from".to_string(),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_urls_are_copied() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, "payload").unwrap();
        let dest = dir.path().join("dest.txt");
        let url = format!("file://{}", src.display());
        HttpFetcher::new().unwrap().fetch(&url, &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "payload");
    }

    #[tokio::test]
    async fn plain_http_is_refused_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let err = HttpFetcher::new()
            .unwrap()
            .fetch("http://example.org/x", &dir.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::ValidationError(_)));
        assert!(!err.is_transient());
    }
}
