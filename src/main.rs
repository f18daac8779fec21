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

//! Service entrypoint: parses configuration, populates the Image Store,
//! and serves the two HTTP endpoints until a shutdown signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use image_service::config::ServiceConfig;
use image_service::download::ReqwestDownloader;
use image_service::http::{router, AppState};
use image_service::store;
use image_service::template::RhcosImageEngine;
use image_service::upstream::ReqwestAssistedServiceClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ServiceConfig::parse();

    tracing::info!(
        work_dir = %config.work_dir.display(),
        listen_address = %config.listen_address,
        "starting image service"
    );

    let engine = Arc::new(RhcosImageEngine::new());
    let downloader = Arc::new(ReqwestDownloader::new().context("building base ISO downloader")?);
    let store = store::populate(&config, engine, downloader)
        .await
        .context("populating image store")?;
    tracing::info!(
        built_templates = store.known_keys().count(),
        "image store populated"
    );

    let assisted = Arc::new(
        ReqwestAssistedServiceClient::new(config.assisted_service_url.clone(), config.forwarded_headers.clone())
            .context("building assisted-service client")?,
    );

    let state = AppState {
        store: Arc::new(store),
        assisted,
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .with_context(|| format!("binding {}", config.listen_address))?;
    tracing::info!(address = %config.listen_address, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    Ok(())
}

/// Waits for SIGINT (Ctrl-C) or, on Unix, SIGTERM, whichever comes first.
/// Container orchestrators send SIGTERM on pod teardown; responding to it
/// lets in-flight responses drain via axum's graceful shutdown rather than
/// being hard-killed mid-stream.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
