// kiln-net/src/validation.rs
use kiln_common::error::{KilnError, Result};
use url::Url;

/// Only `https://` downloads and local `file://` sources are accepted.
pub fn validate_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str).map_err(|e| {
        KilnError::ValidationError(format!("Failed to parse URL '{url_str}': {e}"))
    })?;
    match url.scheme() {
        "https" | "file" => Ok(url),
        other => Err(KilnError::ValidationError(format!(
            "Invalid URL scheme for '{url_str}': must be https or file, but got '{other}'"
        ))),
    }
}

/// The last path segment of a URL, used to name cache entries.
pub fn file_name_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .next_back()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_https_and_file_only() {
        assert!(validate_url("https://github.com/OpenCilk/opencilk-project/archive/v3.0.tar.gz").is_ok());
        assert!(validate_url("file:///tmp/src.tar.gz").is_ok());
        assert!(matches!(
            validate_url("http://example.org/x.tar.gz"),
            Err(KilnError::ValidationError(_))
        ));
        assert!(validate_url("not a url").is_err());
    }

    #[test]
    fn file_names_come_from_the_last_segment() {
        assert_eq!(
            file_name_of("https://example.org/a/b/zstd-1.5.7.tar.gz?x=1").as_deref(),
            Some("zstd-1.5.7.tar.gz")
        );
        assert_eq!(file_name_of("https://example.org/"), None);
    }
}
