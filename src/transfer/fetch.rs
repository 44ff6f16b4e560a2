//! Fetch-with-progress capability

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One file to fetch into `dest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub dest: PathBuf,
    /// Bytes already present in `dest`; 0 truncates
    pub offset: u64,
}

/// Emitted once per received chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Bytes in `dest` so far, including the resume offset
    pub bytes_so_far: u64,
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Final length of `dest`
    pub bytes: u64,
    /// The stop token fired before the body was complete
    pub stopped: bool,
    /// A non-zero offset was discarded and the file fetched from byte zero
    pub restarted: bool,
}

/// Streams a remote file to disk, reporting progress per chunk
///
/// Capability contract: with `supports_range() == false` the caller must
/// not pass a non-zero offset; byte-exact continuation after a pause is only
/// guaranteed when ranges are supported. Implementations check `stop` between
/// chunks and return `stopped: true` instead of an error.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn supports_range(&self) -> bool;

    async fn fetch(
        &self,
        request: FetchRequest,
        progress: mpsc::UnboundedSender<ChunkProgress>,
        stop: CancellationToken,
    ) -> Result<FetchOutcome>;
}

/// HTTP fetcher using `Range` requests for resumption
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("offlaine-manager/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn supports_range(&self) -> bool {
        true
    }

    async fn fetch(
        &self,
        request: FetchRequest,
        progress: mpsc::UnboundedSender<ChunkProgress>,
        stop: CancellationToken,
    ) -> Result<FetchOutcome> {
        let mut offset = request.offset;
        let mut builder = self.client.get(&request.url);
        if offset > 0 {
            builder = builder.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            _ = stop.cancelled() => {
                return Ok(FetchOutcome { bytes: offset, stopped: true, restarted: false });
            }
            response = builder.send() => response
                .with_context(|| format!("Request failed: {}", request.url))?,
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            return already_complete(&request, response.headers(), &progress);
        }
        if !status.is_success() {
            anyhow::bail!("Server returned {} for {}", status, request.url);
        }

        // A 200 to a range request means the server ignored it
        let restarted = offset > 0 && status != StatusCode::PARTIAL_CONTENT;
        if restarted {
            tracing::warn!(
                url = %request.url,
                offset,
                "Server ignored range request, restarting from zero"
            );
            offset = 0;
        }

        let total_bytes = response.content_length().map(|len| len + offset);

        let mut file = if offset > 0 {
            fs::OpenOptions::new()
                .append(true)
                .open(&request.dest)
                .await
                .with_context(|| format!("Failed to open partial file: {:?}", request.dest))?
        } else {
            fs::File::create(&request.dest)
                .await
                .with_context(|| format!("Failed to create file: {:?}", request.dest))?
        };

        let mut written = offset;
        let mut stream = response.bytes_stream();
        loop {
            // A body that has ended is complete even if stop fired meanwhile
            let chunk = tokio::select! {
                biased;
                chunk = stream.next() => chunk,
                _ = stop.cancelled() => {
                    file.flush().await?;
                    return Ok(FetchOutcome { bytes: written, stopped: true, restarted });
                }
            };

            let Some(chunk) = chunk else { break };
            let bytes = chunk.with_context(|| format!("Read failed: {}", request.url))?;
            file.write_all(&bytes)
                .await
                .with_context(|| format!("Write failed: {:?}", request.dest))?;

            written += bytes.len() as u64;
            // Receiver gone means nobody is watching; keep downloading
            let _ = progress.send(ChunkProgress {
                bytes_so_far: written,
                total_bytes,
            });
        }

        file.flush().await?;
        file.sync_all().await?;

        Ok(FetchOutcome {
            bytes: written,
            stopped: false,
            restarted,
        })
    }
}

/// A 416 to `bytes=N-` means the partial file already holds the whole body,
/// as long as the server's `Content-Range: bytes */total` agrees
fn already_complete(
    request: &FetchRequest,
    headers: &reqwest::header::HeaderMap,
    progress: &mpsc::UnboundedSender<ChunkProgress>,
) -> Result<FetchOutcome> {
    let total = headers
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(unsatisfied_range_total);

    if let Some(total) = total
        && total != request.offset
    {
        anyhow::bail!(
            "Partial file holds {} bytes but {} is {} bytes long",
            request.offset,
            request.url,
            total
        );
    }

    tracing::debug!(url = %request.url, bytes = request.offset, "Partial file already complete");
    let _ = progress.send(ChunkProgress {
        bytes_so_far: request.offset,
        total_bytes: Some(request.offset),
    });
    Ok(FetchOutcome {
        bytes: request.offset,
        stopped: false,
        restarted: false,
    })
}

/// Total length from a `bytes */<total>` content range
fn unsatisfied_range_total(value: &str) -> Option<u64> {
    value.trim().strip_prefix("bytes */")?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsatisfied_range_total() {
        assert_eq!(unsatisfied_range_total("bytes */4096"), Some(4096));
        assert_eq!(unsatisfied_range_total(" bytes */12 "), Some(12));
        assert_eq!(unsatisfied_range_total("bytes 0-9/12"), None);
        assert_eq!(unsatisfied_range_total("bytes */*"), None);
    }
}
