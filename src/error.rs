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

//! The error taxonomy of spec.md §7, closed over the kinds that can cross
//! the HTTP boundary. Internal plumbing keeps using `anyhow::Error`, the way
//! the teacher does throughout its CLI; this enum exists at the seam between
//! the synchronous mutation engine and the HTTP layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Unknown (version, arch), or a file missing inside an ISO.
    #[error("not found: {0}")]
    NotFound(String),

    /// The ignition or ramdisk overlay does not fit within its reserved
    /// area. Indicates an operator-side sizing misconfiguration.
    #[error("overlay too large: {0}")]
    OverlayTooLarge(String),

    /// ISO structure inconsistency or invalid `OffsetRecord`. Fatal at
    /// template-build time for the affected key.
    #[error("malformed ISO: {0}")]
    Malformed(String),

    /// An upstream REST call (assisted-service) failed.
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// The request itself is not servable regardless of upstream state
    /// (e.g. s390x + minimal, s390x + kargs). Surfaced as 400.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The caller's request was canceled; no response should be written
    /// past this point. Carried as a variant rather than silently dropped
    /// so call sites can match on it explicitly.
    #[error("request canceled")]
    Canceled,

    /// Transient I/O failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::OverlayTooLarge(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Malformed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Canceled => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Catch-all conversion from the engine's internal `anyhow::Error`.
/// `OverlayTooLarge`, `NotFound` and `Malformed` are raised explicitly at
/// their point of detection; anything that reaches this conversion
/// unclassified is treated as a transient `Io` failure, matching spec.md
/// §7's default policy for unclassified errors.
impl From<anyhow::Error> for ServiceError {
    fn from(e: anyhow::Error) -> Self {
        Self::Io(format!("{e:#}"))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if matches!(self, Self::OverlayTooLarge(_)) {
            tracing::error!(error = %self, "overlay too large; check operator-side sizing");
        } else if matches!(self, Self::Malformed(_)) {
            tracing::error!(error = %self, "template key malformed");
        }
        if matches!(self, Self::Canceled) {
            // No response should be written past cancellation.
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        let status = self.status_code();
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
