// kiln-net/src/http.rs
use std::fmt::Display;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use futures::{Stream, StreamExt};
use kiln_common::error::{KilnError, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::Client;
use tokio::fs::File as TokioFile;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use crate::validation::validate_url;

const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT_STRING: &str = "kiln package installer (Rust)";

/// Transport for source archives. `fetch` writes the body to `dest` and
/// returns the number of bytes written.
pub trait SourceFetcher: Send + Sync + 'static {
    fn fetch(&self, url: &str, dest: &Path) -> impl Future<Output = Result<u64>> + Send;
}

pub fn build_http_client() -> Result<Client> {
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

/// Streams HTTPS downloads with reqwest.
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

impl SourceFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> impl Future<Output = Result<u64>> + Send {
        async move {
            validate_url(url)?;
            let fetch_err = |reason: String| KilnError::Fetch {
                url: url.to_string(),
                reason,
            };

            let response = self.client.get(url).send().await.map_err(|e| {
                debug!("HTTP request failed for {url}: {e}");
                fetch_err(e.to_string())
            })?;
            let status = response.status();
            debug!("Received HTTP status: {} for {}", status, url);
            if !status.is_success() {
                error!("HTTP error {} for URL {}", status, url);
                return Err(fetch_err(format!("HTTP status {status}")));
            }

            let expected_len = response.content_length();
            let mut file = TokioFile::create(dest).await?;
            let written = write_stream(response.bytes_stream(), &mut file, expected_len, url).await?;
            file.sync_all().await?;
            debug!("Wrote {} bytes from {} to {}", written, url, dest.display());
            Ok(written)
        }
    }
}

/// Copies a byte stream into `writer`. A stream error, or fewer bytes than
/// `expected_len`, is a `Fetch` error.
pub async fn write_stream<S, B, E, W>(
    mut stream: S,
    writer: &mut W,
    expected_len: Option<u64>,
    url: &str,
) -> Result<u64>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
    W: AsyncWrite + Unpin,
{
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| KilnError::Fetch {
            url: url.to_string(),
            reason: format!("connection interrupted after {written} bytes: {e}"),
        })?;
        let bytes = chunk.as_ref();
        writer.write_all(bytes).await?;
        written += bytes.len() as u64;
    }
    writer.flush().await?;

    if let Some(expected) = expected_len {
        if written < expected {
            error!("Truncated download from {}: {} of {} bytes", url, written, expected);
            return Err(KilnError::Fetch {
                url: url.to_string(),
                reason: format!("truncated download: received {written} of {expected} bytes"),
            });
        }
    }
    Ok(written)
}
