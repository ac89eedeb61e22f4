// kiln-net/src/validation.rs
use kiln_common::error::{KilnError, Result};
use url::Url;

/// Validates a URL, ensuring it uses the HTTPS scheme.
pub fn validate_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str).map_err(|e| KilnError::Fetch {
        url: url_str.to_string(),
        reason: format!("not a valid URL: {e}"),
    })?;
    if url.scheme() == "https" {
        Ok(url)
    } else {
        Err(KilnError::Fetch {
            url: url_str.to_string(),
            reason: format!("scheme must be https, got '{}'", url.scheme()),
        })
    }
}

/// Last path segment of the URL, used to name the cached download.
pub fn archive_file_name(url_str: &str, fallback: &str) -> String {
    Url::parse(url_str)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segs| segs.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}
