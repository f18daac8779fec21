// Copyright 2024 Red Hat, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Base-ISO downloader.
//!
//! The teacher's `download.rs` fetches user-facing artifacts (disk images,
//! PXE files) with GPG signature verification, decompression, and a
//! resumable on-disk cache. Signature verification and the rest of that
//! production hardening is out of this component's scope per spec.md §1;
//! what's kept is the shape of `source.rs`'s `http_get`: a GET with bounded
//! exponential-backoff retries on the status codes `curl --retry` treats as
//! transient, rewritten against `reqwest`'s async client since this service
//! is a `tokio`/`axum` daemon rather than a one-shot CLI.

use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;

/// Matches `curl --retry`'s default set of retryable HTTP status codes.
const RETRY_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Debug, Clone, Copy)]
pub enum FetchRetries {
    None,
    Finite(NonZeroU32),
    Infinite,
}

impl Default for FetchRetries {
    fn default() -> Self {
        // Three retries is enough to ride out a transient mirror hiccup
        // without stalling startup population indefinitely.
        Self::Finite(NonZeroU32::new(3).unwrap())
    }
}

/// "The thing that can fetch a base ISO by URL into a local file." A trait
/// per the REDESIGN FLAG in spec.md §9: one real implementor backed by
/// `reqwest`, and a fake used by Image Store tests so they don't need
/// network access.
#[async_trait::async_trait]
pub trait BaseImageDownloader: Send + Sync {
    async fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ReqwestDownloader {
    client: Client,
    retries: FetchRetries,
}

impl ReqwestDownloader {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: new_http_client()?,
            retries: FetchRetries::default(),
        })
    }

    pub fn with_retries(retries: FetchRetries) -> Result<Self> {
        Ok(Self {
            client: new_http_client()?,
            retries,
        })
    }
}

#[async_trait::async_trait]
impl BaseImageDownloader for ReqwestDownloader {
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let resp = http_get(&self.client, url, self.retries).await?;
        let mut stream = resp.bytes_stream();
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))?;
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("reading body of {url}"))?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("writing {}", dest.display()))?;
        }
        file.flush().await.context("flushing downloaded file")?;
        Ok(())
    }
}

/// Builds the shared HTTP client used for base-ISO and nmstate-archive
/// downloads.
pub fn new_http_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .context("building HTTP client")
}

/// `GET`s `url`, retrying on the status codes in [`RETRY_STATUS_CODES`] with
/// capped exponential backoff, matching `curl --retry`'s semantics.
pub async fn http_get(client: &Client, url: &str, retries: FetchRetries) -> Result<reqwest::Response> {
    let mut delay = Duration::from_secs(1);
    let (infinite, mut tries) = match retries {
        FetchRetries::Infinite => (true, 0),
        FetchRetries::Finite(n) => (false, n.get() + 1),
        FetchRetries::None => (false, 1),
    };

    loop {
        let err: anyhow::Error = match client.get(url).send().await {
            Err(err) => err.into(),
            Ok(resp) => match resp.status() {
                StatusCode::OK => return Ok(resp),
                s if RETRY_STATUS_CODES.contains(&s.as_u16()) => {
                    anyhow::anyhow!("HTTP {} {}", s.as_u16(), s.canonical_reason().unwrap_or(""))
                }
                s => bail!("fetching '{url}' failed: HTTP {s}"),
            },
        };

        if !infinite {
            tries -= 1;
            if tries == 0 {
                return Err(err).with_context(|| format!("fetching '{url}'"));
            }
        }

        tracing::warn!(url, error = %err, "fetch failed, retrying in {:?}", delay);
        tokio::time::sleep(delay).await;
        delay = std::cmp::min(delay * 2, Duration::from_secs(10 * 60));
    }
}

/// A deterministic fake used by Image Store tests: "downloads" by copying a
/// pre-seeded local file, so `populate` can be exercised without a network
/// stack or a real RHCOS mirror.
#[derive(Debug, Default, Clone)]
pub struct FakeDownloader;

#[async_trait::async_trait]
impl BaseImageDownloader for FakeDownloader {
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        // Treat the "URL" as a local path; this fake only ever serves
        // tests, which always pass a `file://`-free local path.
        let src = url.strip_prefix("file://").unwrap_or(url);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src, dest)
            .await
            .with_context(|| format!("copying fixture {src} to {}", dest.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_http_client() {
        let _ = new_http_client().unwrap();
    }

    #[tokio::test]
    async fn test_fake_downloader_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.iso");
        tokio::fs::write(&src, b"fake-iso-bytes").await.unwrap();
        let dest = dir.path().join("nested/dest.iso");
        FakeDownloader
            .download(src.to_str().unwrap(), &dest)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"fake-iso-bytes");
    }
}
