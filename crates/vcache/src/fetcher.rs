// Segment fetcher: downloads one remote resource to one local file with
// manual redirect following, per-connection timeouts, and cooperative
// cancellation. A partially written file is always removed on failure so a
// truncated segment can never be mistaken for a complete one.

use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::LOCATION;
use reqwest::{Client, Response, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::{CacheProxyConfig, TRANSFER_BUFFER_SIZE};
use crate::error::DownloadError;

#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Downloads `url` to `dest`, returning the number of bytes written.
    /// Observes `token` before and during the transfer; an interrupted or
    /// failed transfer leaves no file behind.
    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError>;
}

pub struct SegmentFetcher {
    client: Client,
    max_redirects: u32,
}

impl SegmentFetcher {
    pub fn new(config: &CacheProxyConfig) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(config.headers.clone())
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            // Redirects are followed manually so the hop bound is exact.
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
            .build()?;
        Ok(Self {
            client,
            max_redirects: config.max_redirects,
        })
    }

    /// Opens a connection to `url`, following up to `max_redirects` hops.
    async fn open(&self, url: &str) -> Result<Response, DownloadError> {
        let mut current =
            Url::parse(url).map_err(|e| DownloadError::invalid_url(url, e.to_string()))?;
        let mut hops = 0u32;

        loop {
            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(classify_network)?;

            let status = response.status();
            if is_redirect(status) {
                hops += 1;
                if hops > self.max_redirects {
                    return Err(DownloadError::RedirectLimit {
                        hops,
                        url: url.to_string(),
                    });
                }
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        DownloadError::http_status(status, current.as_str(), "redirect")
                    })?;
                let next = current.join(location).map_err(|e| {
                    DownloadError::invalid_url(location, e.to_string())
                })?;
                trace!(from = %current, to = %next, hop = hops, "Following redirect");
                current = next;
                continue;
            }

            if !status.is_success() {
                return Err(DownloadError::http_status(status, current.as_str(), "fetch"));
            }
            return Ok(response);
        }
    }

    async fn stream_to_file(
        &self,
        response: Response,
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let file = File::create(dest).await?;
        let mut writer = BufWriter::with_capacity(TRANSFER_BUFFER_SIZE, file);
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            if token.is_cancelled() {
                remove_partial(dest).await;
                return Err(DownloadError::Cancelled);
            }
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    remove_partial(dest).await;
                    return Err(classify_network(e));
                }
            };
            if let Err(e) = writer.write_all(&chunk).await {
                remove_partial(dest).await;
                return Err(DownloadError::Io { source: e });
            }
            written += chunk.len() as u64;
        }

        if let Err(e) = writer.flush().await {
            remove_partial(dest).await;
            return Err(DownloadError::Io { source: e });
        }
        Ok(written)
    }
}

#[async_trait]
impl ResourceFetcher for SegmentFetcher {
    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let response = self.open(url).await?;
        let written = self.stream_to_file(response, dest, token).await?;
        debug!(url = %url, dest = %dest.display(), bytes = written, "Fetched resource");
        Ok(written)
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::SEE_OTHER
    )
}

fn classify_network(e: reqwest::Error) -> DownloadError {
    if e.is_timeout() {
        DownloadError::timeout(e.to_string())
    } else {
        DownloadError::Network { source: e }
    }
}

async fn remove_partial(dest: &Path) {
    if let Err(e) = tokio::fs::remove_file(dest).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(dest = %dest.display(), error = %e, "Failed to remove partial file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_fetcher() -> SegmentFetcher {
        SegmentFetcher::new(&CacheProxyConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn fetch_writes_body_to_destination() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/seg_0.ts")
            .with_status(200)
            .with_body(b"segment-bytes")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("seg_0.ts");
        let fetcher = test_fetcher();
        let written = fetcher
            .fetch_to_file(&format!("{}/seg_0.ts", server.url()), &dest, &CancellationToken::new())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(written, 13);
        assert_eq!(std::fs::read(&dest).unwrap(), b"segment-bytes");
    }

    #[tokio::test]
    async fn three_redirects_then_ok_succeeds() {
        let mut server = mockito::Server::new_async().await;
        for hop in 0..3 {
            server
                .mock("GET", format!("/r{hop}").as_str())
                .with_status(302)
                .with_header("location", &format!("{}/r{}", server.url(), hop + 1))
                .create_async()
                .await;
        }
        server
            .mock("GET", "/r3")
            .with_status(200)
            .with_body(b"payload")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.ts");
        let fetcher = test_fetcher();
        let written = fetcher
            .fetch_to_file(&format!("{}/r0", server.url()), &dest, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 7);
    }

    #[tokio::test]
    async fn four_redirects_fails_with_redirect_limit() {
        let mut server = mockito::Server::new_async().await;
        for hop in 0..4 {
            server
                .mock("GET", format!("/r{hop}").as_str())
                .with_status(302)
                .with_header("location", &format!("{}/r{}", server.url(), hop + 1))
                .create_async()
                .await;
        }
        server
            .mock("GET", "/r4")
            .with_status(200)
            .with_body(b"payload")
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.ts");
        let fetcher = test_fetcher();
        let err = fetcher
            .fetch_to_file(&format!("{}/r0", server.url()), &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::RedirectLimit { hops: 4, .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn error_status_creates_no_file() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing.ts")
            .with_status(404)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing.ts");
        let fetcher = test_fetcher();
        let err = fetcher
            .fetch_to_file(
                &format!("{}/missing.ts", server.url()),
                &dest,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::HttpStatus {
                status: StatusCode::NOT_FOUND,
                ..
            }
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn malformed_url_is_reported_as_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = test_fetcher();
        let err = fetcher
            .fetch_to_file("seg_0.ts", &dir.path().join("seg_0.ts"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_skippable());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.ts");
        let fetcher = test_fetcher();
        let token = CancellationToken::new();
        token.cancel();
        let err = fetcher
            .fetch_to_file("http://127.0.0.1:9/never", &dest, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn write_failure_removes_partial_file() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/seg.ts")
            .with_status(200)
            .with_body(vec![0u8; 4096])
            .create_async()
            .await;

        // Destination directory vanishes before the fetch, so the create
        // fails; the fetcher must not leave anything behind.
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("gone").join("seg.ts");
        let fetcher = test_fetcher();
        let err = fetcher
            .fetch_to_file(&format!("{}/seg.ts", server.url()), &dest, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Io { .. }));
        assert!(!dest.exists());
    }
}
