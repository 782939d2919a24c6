use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use kiln_common::error::{KilnError, Result};
use kiln_net::{fetch_verified, Fetcher, RetryPolicy};

// sha256("hello\n")
const HELLO: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

/// Fails the first `failures` calls with a transient error, then serves `payload`.
struct FlakyFetcher {
    failures: u32,
    calls: AtomicU32,
    payload: &'static str,
    seen: Mutex<Vec<String>>,
}

impl FlakyFetcher {
    fn new(failures: u32, payload: &'static str) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            payload,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for FlakyFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        self.seen.lock().unwrap().push(url.to_string());
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if url.contains("gone") {
            return Err(KilnError::NotFound(format!("{url}: 404")));
        }
        if n < self.failures {
            return Err(std::io::Error::from(std::io::ErrorKind::TimedOut).into());
        }
        std::fs::write(dest, self.payload)?;
        Ok(())
    }
}

#[tokio::test]
async fn transient_failure_is_retried_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("downloads").join("hello.txt");
    let fetcher = FlakyFetcher::new(2, "hello\n");
    let mut retries = Vec::new();

    let path = fetch_verified(
        &fetcher,
        &["https://example.org/hello.txt"],
        HELLO,
        &cache,
        &RetryPolicy::immediate(3),
        |url, attempt, _| retries.push((url.to_string(), attempt)),
    )
    .await
    .unwrap();

    assert_eq!(path, cache);
    assert_eq!(std::fs::read_to_string(&cache).unwrap(), "hello\n");
    assert_eq!(fetcher.calls(), 3);
    assert_eq!(retries.len(), 2);
    assert!(!dir.path().join("downloads").join(".hello.txt.download").exists());
}

#[tokio::test]
async fn exhausted_retries_surface_fetch_error() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = FlakyFetcher::new(u32::MAX, "hello\n");
    let err = fetch_verified(
        &fetcher,
        &["https://example.org/hello.txt"],
        HELLO,
        &dir.path().join("hello.txt"),
        &RetryPolicy::immediate(3),
        |_, _, _| {},
    )
    .await
    .unwrap_err();
    assert!(matches!(err, KilnError::Fetch { attempts: 3, .. }));
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test]
async fn hash_mismatch_is_fatal_and_leaves_nothing_cached() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("hello.txt");
    let fetcher = FlakyFetcher::new(0, "tampered\n");
    let err = fetch_verified(
        &fetcher,
        &["https://example.org/hello.txt", "https://mirror.example.org/hello.txt"],
        HELLO,
        &cache,
        &RetryPolicy::immediate(3),
        |_, _, _| {},
    )
    .await
    .unwrap_err();
    match err {
        KilnError::Integrity { url, expected, .. } => {
            assert_eq!(url, "https://example.org/hello.txt");
            assert_eq!(expected, HELLO);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(fetcher.calls(), 1, "integrity failures are not retried");
    assert!(!cache.exists());
}

#[tokio::test]
async fn permanent_failure_falls_through_to_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = FlakyFetcher::new(0, "hello\n");
    fetch_verified(
        &fetcher,
        &["https://gone.example.org/hello.txt", "https://mirror.example.org/hello.txt"],
        HELLO,
        &dir.path().join("hello.txt"),
        &RetryPolicy::immediate(3),
        |_, _, _| {},
    )
    .await
    .unwrap();
    let seen = fetcher.seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            "https://gone.example.org/hello.txt".to_string(),
            "https://mirror.example.org/hello.txt".to_string()
        ]
    );
}

#[tokio::test]
async fn verified_cache_entry_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("hello.txt");
    std::fs::write(&cache, "hello\n").unwrap();
    let fetcher = FlakyFetcher::new(0, "unused");
    fetch_verified(
        &fetcher,
        &["https://example.org/hello.txt"],
        HELLO,
        &cache,
        &RetryPolicy::immediate(3),
        |_, _, _| {},
    )
    .await
    .unwrap();
    assert_eq!(fetcher.calls(), 0);
}
