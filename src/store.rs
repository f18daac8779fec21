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

//! Image Store: populates and owns the set of built templates, per
//! spec.md §4.5.
//!
//! `populate` iterates one `BaseImage` per `(VersionKey, ImageType)` pair
//! ("for each configured BaseImage" - spec.md §4.5), downloading and
//! templating `full.iso` and `minimal.iso` independently, since
//! `VersionEntry` configures a distinct URL for each and the data model's
//! `BaseImage` carries an `image_type`. See DESIGN.md for the full
//! rationale. After `populate` returns the store is wrapped in an `Arc` and
//! never mutated again, so lookups need no synchronization (spec.md §5).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;

use crate::config::{CpuArchitecture, ImageType, ServiceConfig, VersionEntry};
use crate::download::BaseImageDownloader;
use crate::template::{derive_rootfs_url, ImageEngine, Template};

pub type VersionKey = (String, CpuArchitecture);

#[derive(Debug, Clone)]
struct StoreEntry {
    template: Template,
    base_iso_url: String,
}

/// The frozen, post-`populate` set of built templates and nmstate archives.
/// Every method here is a lock-free read.
#[derive(Debug, Default)]
pub struct ImageStore {
    entries: HashMap<(VersionKey, ImageType), StoreEntry>,
    nmstate: HashMap<VersionKey, PathBuf>,
}

impl ImageStore {
    pub fn path_for_params(&self, version: &str, arch: CpuArchitecture, image_type: ImageType) -> Result<&Path> {
        self.entries
            .get(&((version.to_string(), arch), image_type))
            .map(|e| e.template.path.as_path())
            .with_context(|| format!("no template for {version}/{arch}/{image_type:?}"))
    }

    pub fn template_for_params(&self, version: &str, arch: CpuArchitecture, image_type: ImageType) -> Result<&Template> {
        self.entries
            .get(&((version.to_string(), arch), image_type))
            .map(|e| &e.template)
            .with_context(|| format!("no template for {version}/{arch}/{image_type:?}"))
    }

    pub fn nmstatectl_path_for_params(&self, version: &str, arch: CpuArchitecture) -> Result<&Path> {
        self.nmstate
            .get(&(version.to_string(), arch))
            .map(|p| p.as_path())
            .with_context(|| format!("no nmstate archive for {version}/{arch}"))
    }

    pub fn base_iso_url(&self, version: &str, arch: CpuArchitecture, image_type: ImageType) -> Result<&str> {
        self.entries
            .get(&((version.to_string(), arch), image_type))
            .map(|e| e.base_iso_url.as_str())
            .with_context(|| format!("no base ISO URL for {version}/{arch}/{image_type:?}"))
    }

    pub fn known_keys(&self) -> impl Iterator<Item = &(VersionKey, ImageType)> {
        self.entries.keys()
    }
}

/// One template-building unit of work: one `(VersionEntry, ImageType)` pair.
struct BuildJob {
    entry: VersionEntry,
    image_type: ImageType,
    url: String,
}

/// Downloads each configured base ISO, drives the Template Builder, and
/// returns the frozen store. Per spec.md §7, a failure for one key is
/// logged and that key is omitted rather than failing the whole process.
pub async fn populate(
    config: &ServiceConfig,
    engine: Arc<dyn ImageEngine>,
    downloader: Arc<dyn BaseImageDownloader>,
) -> Result<ImageStore> {
    let versions = config.versions().context("loading VERSIONS_CONFIG")?;
    let work_dir = config.work_dir.clone();
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_builds.max(1)));

    let mut jobs = Vec::new();
    for entry in &versions {
        if entry.cpu_architecture.is_s390x() {
            // s390x is explicitly excluded from minimal-ISO generation,
            // per spec.md §1; no template is built for it.
            continue;
        }
        jobs.push(BuildJob {
            entry: entry.clone(),
            image_type: ImageType::Full,
            url: entry.full_iso_url.clone(),
        });
        jobs.push(BuildJob {
            entry: entry.clone(),
            image_type: ImageType::Minimal,
            url: entry.minimal_iso_url.clone(),
        });
    }

    let mut handles = Vec::new();
    for job in jobs {
        let semaphore = semaphore.clone();
        let engine = engine.clone();
        let downloader = downloader.clone();
        let work_dir = work_dir.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            let result = build_one(&work_dir, &job, engine, downloader.as_ref()).await;
            (job.entry.openshift_version.clone(), job.entry.cpu_architecture, job.image_type, job.url, result)
        }));
    }

    let mut entries = HashMap::new();
    for handle in handles {
        let (version, arch, image_type, url, result) = handle.await.context("template build task panicked")?;
        match result {
            Ok(template) => {
                entries.insert(((version, arch), image_type), StoreEntry { template, base_iso_url: url });
            }
            Err(err) => {
                tracing::error!(version, %arch, ?image_type, error = %err, "template build failed; key omitted from store");
            }
        }
    }

    let mut nmstate = HashMap::new();
    let mut seen_nmstate_keys = std::collections::HashSet::new();
    for entry in &versions {
        if entry.cpu_architecture.is_s390x() || !entry.wants_nmstate_archive() {
            continue;
        }
        let key = (entry.openshift_version.clone(), entry.cpu_architecture);
        if !seen_nmstate_keys.insert(key.clone()) {
            continue;
        }
        let Some(url) = entry.nmstate_archive_url.as_deref() else {
            tracing::warn!(
                version = %entry.openshift_version,
                arch = %entry.cpu_architecture,
                "version requests nmstate archive but no nmstate_archive_url configured"
            );
            continue;
        };
        let dest = nmstate_path(&work_dir, &key.0, key.1);
        match downloader.download(url, &dest).await {
            Ok(()) => {
                nmstate.insert(key, dest);
            }
            Err(err) => {
                tracing::error!(version = %entry.openshift_version, arch = %entry.cpu_architecture, error = %err, "nmstate archive download failed");
            }
        }
    }

    Ok(ImageStore { entries, nmstate })
}

fn template_path(work_dir: &Path, version: &str, arch: CpuArchitecture, image_type: ImageType) -> PathBuf {
    let suffix = match image_type {
        ImageType::Full => "full",
        ImageType::Minimal => "minimal",
    };
    work_dir.join("templates").join(format!("{version}-{arch}-{suffix}.iso"))
}

fn nmstate_path(work_dir: &Path, version: &str, arch: CpuArchitecture) -> PathBuf {
    work_dir.join("nmstate").join(format!("{version}-{arch}.tar.gz"))
}

async fn build_one(
    work_dir: &Path,
    job: &BuildJob,
    engine: Arc<dyn ImageEngine>,
    downloader: &dyn BaseImageDownloader,
) -> Result<Template> {
    let base_dir = work_dir.join("base");
    let base_iso_suffix = match job.image_type {
        ImageType::Full => "full",
        ImageType::Minimal => "minimal",
    };
    let base_iso_path = base_dir.join(format!(
        "{}-{}-{}.iso",
        job.entry.openshift_version, job.entry.cpu_architecture, base_iso_suffix
    ));
    downloader
        .download(&job.url, &base_iso_path)
        .await
        .with_context(|| format!("downloading base ISO from {}", job.url))?;

    let output_path = template_path(work_dir, &job.entry.openshift_version, job.entry.cpu_architecture, job.image_type);
    let scratch_parent = work_dir.join("scratch");
    let rootfs_url = derive_rootfs_url(&job.url)?;
    let arch = job.entry.cpu_architecture;

    tokio::task::spawn_blocking(move || {
        engine.build_template(&base_iso_path, &output_path, &scratch_parent, &rootfs_url, arch)
    })
    .await
    .context("template build task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuArchitecture;
    use crate::download::FakeDownloader;
    use crate::template::FakeImageEngine;

    fn sample_config(work_dir: &Path, versions: &[VersionEntry]) -> ServiceConfig {
        ServiceConfig {
            work_dir: work_dir.to_path_buf(),
            assisted_service_url: "http://localhost".into(),
            image_service_base_url: None,
            listen_address: "0.0.0.0:8080".into(),
            versions_config: serde_json::to_string(versions).unwrap(),
            max_concurrent_builds: 2,
            forwarded_headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_populate_builds_full_and_minimal() {
        let work_dir = tempfile::tempdir().unwrap();
        let fixture_full = work_dir.path().join("fixture-full.iso");
        let fixture_minimal = work_dir.path().join("fixture-minimal.iso");
        tokio::fs::write(&fixture_full, b"full").await.unwrap();
        tokio::fs::write(&fixture_minimal, b"minimal").await.unwrap();

        let entry = VersionEntry {
            openshift_version: "4.18".into(),
            cpu_architecture: CpuArchitecture::X86_64,
            full_iso_url: fixture_full.to_str().unwrap().to_string(),
            minimal_iso_url: fixture_minimal.to_str().unwrap().to_string(),
            nmstate_archive_url: None,
        };
        let config = sample_config(work_dir.path(), &[entry]);

        let store = populate(&config, Arc::new(FakeImageEngine), Arc::new(FakeDownloader))
            .await
            .unwrap();

        assert!(store.path_for_params("4.18", CpuArchitecture::X86_64, ImageType::Full).is_ok());
        assert!(store.path_for_params("4.18", CpuArchitecture::X86_64, ImageType::Minimal).is_ok());
        assert!(store.path_for_params("4.18", CpuArchitecture::Arm64, ImageType::Full).is_err());
    }

    #[tokio::test]
    async fn test_populate_skips_s390x() {
        let work_dir = tempfile::tempdir().unwrap();
        let fixture = work_dir.path().join("fixture.iso");
        tokio::fs::write(&fixture, b"x").await.unwrap();
        let entry = VersionEntry {
            openshift_version: "4.18".into(),
            cpu_architecture: CpuArchitecture::S390x,
            full_iso_url: fixture.to_str().unwrap().to_string(),
            minimal_iso_url: fixture.to_str().unwrap().to_string(),
            nmstate_archive_url: None,
        };
        let config = sample_config(work_dir.path(), &[entry]);
        let store = populate(&config, Arc::new(FakeImageEngine), Arc::new(FakeDownloader))
            .await
            .unwrap();
        assert!(store.path_for_params("4.18", CpuArchitecture::S390x, ImageType::Full).is_err());
    }

    #[tokio::test]
    async fn test_populate_downloads_nmstate_archive_once() {
        let work_dir = tempfile::tempdir().unwrap();
        let fixture = work_dir.path().join("fixture.iso");
        tokio::fs::write(&fixture, b"x").await.unwrap();
        let nmstate_fixture = work_dir.path().join("nmstate-fixture.tar.gz");
        tokio::fs::write(&nmstate_fixture, b"nmstate-bytes").await.unwrap();

        let entry = VersionEntry {
            openshift_version: "4.18".into(),
            cpu_architecture: CpuArchitecture::X86_64,
            full_iso_url: fixture.to_str().unwrap().to_string(),
            minimal_iso_url: fixture.to_str().unwrap().to_string(),
            nmstate_archive_url: Some(nmstate_fixture.to_str().unwrap().to_string()),
        };
        let config = sample_config(work_dir.path(), &[entry]);
        let store = populate(&config, Arc::new(FakeImageEngine), Arc::new(FakeDownloader))
            .await
            .unwrap();
        let path = store.nmstatectl_path_for_params("4.18", CpuArchitecture::X86_64).unwrap();
        assert_eq!(tokio::fs::read(path).await.unwrap(), b"nmstate-bytes");
    }
}
