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

//! PXE-initrd Streaming, per spec.md §4.7: fetches per-request ignition and
//! (optionally) minimal-initrd bytes from the upstream, then concatenates
//! them with the nmstate archive when both a minimal-initrd was present and
//! the requested version wants one.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::str::FromStr;

use crate::config::CpuArchitecture;
use crate::error::{Result, ServiceError};
use crate::http::AppState;
use crate::ignition::encode_ignition_payload;

#[derive(Debug, Deserialize)]
pub struct PxeQuery {
    pub version: String,
    pub arch: String,
}

/// Concatenates, in order: the gzip+cpio-framed ignition payload, the raw
/// minimal-initrd bytes if present, and the nmstate archive bytes when both
/// a minimal-initrd was present and `nmstate` is `Some`. Pure and
/// allocation-only, so the PXE-initrd suffix invariant of spec.md §8 can be
/// tested without a store, an upstream client, or any I/O.
pub fn compose_pxe_body(ignition_payload: Vec<u8>, minimal_initrd: Option<Vec<u8>>, nmstate: Option<Vec<u8>>) -> Vec<u8> {
    let mut body = ignition_payload;
    if let Some(initrd) = minimal_initrd {
        body.extend_from_slice(&initrd);
        if let Some(nmstate) = nmstate {
            body.extend_from_slice(&nmstate);
        }
    }
    body
}

pub async fn serve_pxe_initrd(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
    Query(query): Query<PxeQuery>,
    headers: HeaderMap,
) -> Response {
    let span = tracing::info_span!("serve_pxe_initrd", image_id = %image_id, version = %query.version, arch = %query.arch);
    let _enter = span.enter();
    match serve_pxe_initrd_inner(state, &image_id, &query, &headers).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

async fn serve_pxe_initrd_inner(state: AppState, image_id: &str, query: &PxeQuery, headers: &HeaderMap) -> Result<Response> {
    let arch = CpuArchitecture::from_str(&query.arch)
        .map_err(|e| ServiceError::NotFound(format!("unknown cpu architecture '{}': {e:#}", query.arch)))?;

    // discovery_iso_type is omitted for the pxe-initrd path per spec.md §6.
    let ignition_bytes = state.assisted.fetch_ignition(image_id, None, headers).await?;
    let ignition_payload = encode_ignition_payload(&ignition_bytes).map_err(|e| ServiceError::Io(format!("encoding ignition payload: {e:#}")))?;
    let minimal_initrd = state.assisted.fetch_minimal_initrd(image_id, headers).await?;

    let nmstate = if minimal_initrd.is_some() {
        match state.store.nmstatectl_path_for_params(&query.version, arch) {
            Ok(path) => Some(tokio::fs::read(path).await.map_err(|e| ServiceError::Io(e.to_string()))?),
            Err(_) => None,
        }
    } else {
        None
    };

    let body = compose_pxe_body(ignition_payload, minimal_initrd, nmstate);
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ignition::decode_ignition_payload;

    #[test]
    fn test_compose_pxe_body_ignition_only() {
        let payload = encode_ignition_payload(b"hello").unwrap();
        let body = compose_pxe_body(payload.clone(), None, None);
        assert_eq!(body, payload);
    }

    #[test]
    fn test_compose_pxe_body_with_initrd_no_nmstate() {
        let payload = encode_ignition_payload(b"hello").unwrap();
        let body = compose_pxe_body(payload.clone(), Some(b"initrd-bytes".to_vec()), None);
        assert_eq!(&body[..payload.len()], payload.as_slice());
        assert_eq!(&body[payload.len()..], b"initrd-bytes");
    }

    #[test]
    fn test_compose_pxe_body_nmstate_suffix_invariant() {
        let payload = encode_ignition_payload(b"hello").unwrap();
        let nmstate_bytes = b"opaque-nmstate-archive-bytes".to_vec();
        let body = compose_pxe_body(payload, Some(b"initrd-bytes".to_vec()), Some(nmstate_bytes.clone()));
        assert!(body.ends_with(&nmstate_bytes));
    }

    #[test]
    fn test_compose_pxe_body_ignores_nmstate_without_initrd() {
        // nmstate is only ever passed when a minimal-initrd was present; this
        // documents that the function itself doesn't enforce that - callers
        // (serve_pxe_initrd_inner) only ever pass Some(nmstate) alongside
        // Some(initrd).
        let payload = encode_ignition_payload(b"hello").unwrap();
        let body = compose_pxe_body(payload.clone(), None, Some(b"nmstate".to_vec()));
        assert_eq!(body, payload);
    }

    #[test]
    fn test_ignition_prefix_decodes() {
        let payload = encode_ignition_payload(b"someignitioncontent").unwrap();
        let body = compose_pxe_body(payload.clone(), Some(b"initrd".to_vec()), None);
        assert_eq!(decode_ignition_payload(&body[..payload.len()]).unwrap(), b"someignitioncontent");
    }
}
