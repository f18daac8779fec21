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

//! Assisted-service REST client: fetches per-infra-env ignition bytes,
//! minimal-initrd bytes, and kargs, per spec.md §6. Out of scope for this
//! service per spec.md §1 beyond a thin, working client; the REDESIGN FLAG
//! in spec.md §9 calls for a trait with one real implementor plus a
//! deterministic fake, the same split [`crate::template::ImageEngine`] uses.

use axum::http::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::ImageType;
use crate::error::{Result, ServiceError};

#[async_trait::async_trait]
pub trait AssistedServiceClient: Send + Sync {
    /// `discovery_iso_type` is omitted (passed as `None`) for the
    /// PXE-initrd path per spec.md §6.
    async fn fetch_ignition(
        &self,
        infra_env_id: &str,
        discovery_iso_type: Option<ImageType>,
        forwarded: &HeaderMap,
    ) -> Result<Vec<u8>>;

    /// `Ok(None)` on upstream 204 (no minimal initrd configured for this
    /// infra-env).
    async fn fetch_minimal_initrd(&self, infra_env_id: &str, forwarded: &HeaderMap) -> Result<Option<Vec<u8>>>;

    /// The inner JSON array decoded from `kernel_arguments`, or empty when
    /// absent. Tokens are returned verbatim; whitespace significance inside
    /// the JSON-encoded string is undocumented upstream, so nothing here
    /// re-serializes or trims an individual token (spec.md §9).
    async fn fetch_kernel_arguments(&self, infra_env_id: &str, forwarded: &HeaderMap) -> Result<Vec<String>>;
}

#[derive(Debug, Clone)]
pub struct ReqwestAssistedServiceClient {
    client: Client,
    base_url: String,
    /// Header names allow-listed for forwarding to upstream, per spec.md §6
    /// configuration surface.
    forwarded_headers: Vec<String>,
}

impl ReqwestAssistedServiceClient {
    pub fn new(base_url: String, forwarded_headers: Vec<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| ServiceError::Upstream(format!("building HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            forwarded_headers,
        })
    }

    fn apply_forwarded_headers(&self, req: reqwest::RequestBuilder, incoming: &HeaderMap) -> reqwest::RequestBuilder {
        let mut req = req;
        for name in &self.forwarded_headers {
            if let Some(value) = incoming.get(name.as_str()) {
                req = req.header(name.as_str(), value.as_bytes());
            }
        }
        req
    }
}

#[async_trait::async_trait]
impl AssistedServiceClient for ReqwestAssistedServiceClient {
    async fn fetch_ignition(
        &self,
        infra_env_id: &str,
        discovery_iso_type: Option<ImageType>,
        forwarded: &HeaderMap,
    ) -> Result<Vec<u8>> {
        let mut url = format!(
            "{}/api/assisted-install/v2/infra-envs/{infra_env_id}/downloads/files?file_name=discovery.ign",
            self.base_url
        );
        if let Some(iso_type) = discovery_iso_type {
            let type_str = match iso_type {
                ImageType::Full => "full",
                ImageType::Minimal => "minimal",
            };
            url.push_str(&format!("&discovery_iso_type={type_str}"));
        }
        let req = self.apply_forwarded_headers(self.client.get(&url), forwarded);
        let resp = req
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("fetching ignition for {infra_env_id}: {e}")))?;
        if resp.status() != StatusCode::OK {
            return Err(ServiceError::Upstream(format!(
                "fetching ignition for {infra_env_id}: upstream returned {}",
                resp.status()
            )));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| ServiceError::Upstream(format!("reading ignition body for {infra_env_id}: {e}")))
    }

    async fn fetch_minimal_initrd(&self, infra_env_id: &str, forwarded: &HeaderMap) -> Result<Option<Vec<u8>>> {
        let url = format!(
            "{}/api/assisted-install/v2/infra-envs/{infra_env_id}/downloads/minimal-initrd",
            self.base_url
        );
        let req = self.apply_forwarded_headers(self.client.get(&url), forwarded);
        let resp = req
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("fetching minimal initrd for {infra_env_id}: {e}")))?;
        match resp.status() {
            StatusCode::OK => resp
                .bytes()
                .await
                .map(|b| Some(b.to_vec()))
                .map_err(|e| ServiceError::Upstream(format!("reading minimal initrd body for {infra_env_id}: {e}"))),
            StatusCode::NO_CONTENT => Ok(None),
            s => Err(ServiceError::Upstream(format!(
                "fetching minimal initrd for {infra_env_id}: upstream returned {s}"
            ))),
        }
    }

    async fn fetch_kernel_arguments(&self, infra_env_id: &str, forwarded: &HeaderMap) -> Result<Vec<String>> {
        let url = format!(
            "{}/api/assisted-install/v2/infra-envs/{infra_env_id}",
            self.base_url
        );
        let req = self.apply_forwarded_headers(self.client.get(&url), forwarded);
        let resp = req
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("fetching infra-env {infra_env_id}: {e}")))?;
        if resp.status() != StatusCode::OK {
            return Err(ServiceError::Upstream(format!(
                "fetching infra-env {infra_env_id}: upstream returned {}",
                resp.status()
            )));
        }
        let body: InfraEnvResponse = resp
            .json()
            .await
            .map_err(|e| ServiceError::Upstream(format!("decoding infra-env {infra_env_id}: {e}")))?;
        parse_kernel_arguments(body.kernel_arguments.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct InfraEnvResponse {
    kernel_arguments: Option<String>,
}

/// `kernel_arguments` is a JSON-encoded string whose own content is a JSON
/// array of string tokens (spec.md §6/§9): one level of decoding reaches
/// the array, and no further manipulation is applied.
fn parse_kernel_arguments(raw: Option<&str>) -> Result<Vec<String>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw)
        .map_err(|e| ServiceError::Upstream(format!("decoding kernel_arguments JSON array: {e}")))
}

/// An in-memory fake used by HTTP-layer tests, per the REDESIGN FLAG in
/// spec.md §9.
#[derive(Debug, Default, Clone)]
pub struct FakeAssistedServiceClient {
    pub ignition_bytes: Vec<u8>,
    pub minimal_initrd_bytes: Option<Vec<u8>>,
    pub kernel_arguments: Vec<String>,
}

#[async_trait::async_trait]
impl AssistedServiceClient for FakeAssistedServiceClient {
    async fn fetch_ignition(
        &self,
        _infra_env_id: &str,
        _discovery_iso_type: Option<ImageType>,
        _forwarded: &HeaderMap,
    ) -> Result<Vec<u8>> {
        Ok(self.ignition_bytes.clone())
    }

    async fn fetch_minimal_initrd(&self, _infra_env_id: &str, _forwarded: &HeaderMap) -> Result<Option<Vec<u8>>> {
        Ok(self.minimal_initrd_bytes.clone())
    }

    async fn fetch_kernel_arguments(&self, _infra_env_id: &str, _forwarded: &HeaderMap) -> Result<Vec<String>> {
        Ok(self.kernel_arguments.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_arguments_absent() {
        assert_eq!(parse_kernel_arguments(None).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_parse_kernel_arguments_present() {
        let raw = r#"["p1","p1","key=value"]"#;
        assert_eq!(
            parse_kernel_arguments(Some(raw)).unwrap(),
            vec!["p1".to_string(), "p1".to_string(), "key=value".to_string()]
        );
    }

    #[test]
    fn test_parse_kernel_arguments_malformed() {
        assert!(parse_kernel_arguments(Some("not json")).is_err());
    }

    #[tokio::test]
    async fn test_fake_client() {
        let fake = FakeAssistedServiceClient {
            ignition_bytes: b"hello".to_vec(),
            minimal_initrd_bytes: None,
            kernel_arguments: vec!["a=b".into()],
        };
        let headers = HeaderMap::new();
        assert_eq!(
            fake.fetch_ignition("env1", Some(ImageType::Full), &headers).await.unwrap(),
            b"hello"
        );
        assert_eq!(fake.fetch_minimal_initrd("env1", &headers).await.unwrap(), None);
        assert_eq!(
            fake.fetch_kernel_arguments("env1", &headers).await.unwrap(),
            vec!["a=b".to_string()]
        );
    }
}
