//! HTTP document fetching.
//!
//! One GET with an identifying user-agent, a 30 second ceiling, at most
//! five redirects, and a 100 MB body cap (oversized bodies are truncated
//! at the cap, not failed). Only http and https URLs are accepted.

use std::time::Duration;

use reqwest::redirect;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::ActivityError;

/// Identifying user-agent: product, version, contact URL.
pub const USER_AGENT: &str = concat!(
    "granary/",
    env!("CARGO_PKG_VERSION"),
    " (+https://github.com/granary-dev/granary)"
);

/// Accept header sent with document fetches.
pub const ACCEPT_HEADER: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Response bodies are truncated at this many bytes.
pub const MAX_RESPONSE_BYTES: usize = 100 * 1024 * 1024;

/// Hard ceiling on one fetch.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Redirects followed before giving up.
const REDIRECT_LIMIT: usize = 5;

/// A fetched payload and the content type the server declared.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FetchedDocument {
    pub content: Vec<u8>,
    pub content_type: String,
}

/// Build the shared fetch client.
pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(FETCH_TIMEOUT)
        .redirect(redirect::Policy::limited(REDIRECT_LIMIT))
        .gzip(true)
        .brotli(true)
        .build()
        .unwrap_or_default()
}

/// Fetch one document.
pub async fn fetch_document(
    client: &reqwest::Client,
    url: &str,
    cancel: &CancellationToken,
) -> Result<FetchedDocument, ActivityError> {
    let parsed = Url::parse(url)
        .map_err(|e| ActivityError::InvalidInput(format!("invalid URL {url:?}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ActivityError::InvalidInput(format!(
            "unsupported URL scheme {:?}",
            parsed.scheme()
        )));
    }
    if cancel.is_cancelled() {
        return Err(ActivityError::Cancelled);
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(ActivityError::Cancelled),
        result = client
            .get(parsed)
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .send() => result.map_err(|e| ActivityError::UpstreamUnavailable(e.to_string()))?,
    };

    let status = response.status();
    if !status.is_success() {
        return Err(ActivityError::UpstreamUnavailable(format!(
            "HTTP {status} from {url}"
        )));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    // Stream the body so the size cap holds without buffering past it and
    // cancellation lands between chunks.
    let mut content: Vec<u8> = Vec::new();
    let mut response = response;
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(ActivityError::Cancelled),
            chunk = response.chunk() => {
                chunk.map_err(|e| ActivityError::UpstreamUnavailable(e.to_string()))?
            }
        };
        let Some(chunk) = chunk else { break };

        let remaining = MAX_RESPONSE_BYTES - content.len();
        if chunk.len() >= remaining {
            content.extend_from_slice(&chunk[..remaining]);
            debug!("response from {} truncated at {} bytes", url, MAX_RESPONSE_BYTES);
            break;
        }
        content.extend_from_slice(&chunk);
    }

    debug!(
        "fetched {} ({} bytes, {})",
        url,
        content.len(),
        content_type
    );
    Ok(FetchedDocument {
        content,
        content_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_non_http_schemes() {
        let client = build_client();
        let cancel = CancellationToken::new();
        let err = fetch_document(&client, "ftp://example.com/file", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::InvalidInput(_)));

        let err = fetch_document(&client, "file:///etc/passwd", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_rejects_malformed_url() {
        let client = build_client();
        let cancel = CancellationToken::new();
        let err = fetch_document(&client, "not a url", &cancel).await.unwrap_err();
        assert!(matches!(err, ActivityError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let client = build_client();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fetch_document(&client, "http://127.0.0.1:9/never", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::Cancelled));
    }
}
