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

//! Command-line and environment configuration, following the teacher's use
//! of `clap`'s derive API but serving a daemon rather than a one-shot CLI.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Error};
use clap::Parser;
use serde::Deserialize;

pub const IGNITION_PADDING: u64 = 256 * 1024;
pub const RAMDISK_PADDING: u64 = 1024 * 1024;
pub const MIN_NMSTATE_VERSION: (u32, u32) = (4, 18);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuArchitecture {
    X86_64,
    Arm64,
    Ppc64le,
    S390x,
}

impl CpuArchitecture {
    pub fn is_s390x(&self) -> bool {
        matches!(self, Self::S390x)
    }
}

impl fmt::Display for CpuArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
            Self::Ppc64le => "ppc64le",
            Self::S390x => "s390x",
        };
        f.write_str(s)
    }
}

impl FromStr for CpuArchitecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" => Ok(Self::X86_64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "ppc64le" => Ok(Self::Ppc64le),
            "s390x" => Ok(Self::S390x),
            other => bail!("unknown CPU architecture '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Full,
    Minimal,
}

impl FromStr for ImageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "minimal" => Ok(Self::Minimal),
            other => bail!("unknown image type '{other}'"),
        }
    }
}

/// One configured base image: the `(version, arch)` key plus where to
/// download it from. Supplied to the service as a JSON array via
/// `--versions-config`/`VERSIONS_CONFIG`, since a list of this shape doesn't
/// fit comfortably as repeated CLI flags.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct VersionEntry {
    pub openshift_version: String,
    pub cpu_architecture: CpuArchitecture,
    pub full_iso_url: String,
    pub minimal_iso_url: String,
    /// Where to fetch the nmstate tooling archive for this key, when
    /// `wants_nmstate_archive()`. Absent entries simply never get one.
    #[serde(default)]
    pub nmstate_archive_url: Option<String>,
}

impl VersionEntry {
    /// `(major, minor)` parsed from a leading `X.Y` prefix of
    /// `openshift_version`. Non-numeric or missing components are treated
    /// as `0`, which only affects the nmstate-archive gate.
    pub fn version_major_minor(&self) -> (u32, u32) {
        let mut parts = self.openshift_version.splitn(3, '.');
        let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        (major, minor)
    }

    pub fn wants_nmstate_archive(&self) -> bool {
        self.version_major_minor() >= MIN_NMSTATE_VERSION
    }
}

#[derive(Parser, Debug, Clone)]
#[clap(name = "image-service", version)]
pub struct ServiceConfig {
    /// Directory used for downloaded base ISOs, built templates, nmstate
    /// archives, and per-request scratch space.
    #[clap(long, env = "WORK_DIR")]
    pub work_dir: PathBuf,

    /// Base URL of the assisted-service REST API consumed for per-tenant
    /// overlay data.
    #[clap(long, env = "ASSISTED_SERVICE_URL")]
    pub assisted_service_url: String,

    /// Base URL at which this service's own endpoints are externally
    /// reachable; used only for informational logging.
    #[clap(long, env = "IMAGE_SERVICE_BASE_URL")]
    pub image_service_base_url: Option<String>,

    /// Address to bind the HTTP listener to.
    #[clap(long, env = "LISTEN_ADDRESS", default_value = "0.0.0.0:8080")]
    pub listen_address: String,

    /// JSON array of `VersionEntry`, e.g.
    /// `[{"openshift_version":"4.18","cpu_architecture":"x86_64",...}]`.
    #[clap(long, env = "VERSIONS_CONFIG")]
    pub versions_config: String,

    /// Upper bound on concurrent template materializations during startup
    /// population.
    #[clap(long, env = "MAX_CONCURRENT_BUILDS", default_value_t = 1)]
    pub max_concurrent_builds: usize,

    /// Comma-separated list of request header names forwarded verbatim to
    /// the assisted-service upstream.
    #[clap(long, env = "FORWARDED_HEADERS", value_delimiter = ',')]
    pub forwarded_headers: Vec<String>,
}

impl ServiceConfig {
    pub fn versions(&self) -> anyhow::Result<Vec<VersionEntry>> {
        Ok(serde_json::from_str(&self.versions_config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_architecture_roundtrip() {
        for s in ["x86_64", "arm64", "ppc64le", "s390x"] {
            assert_eq!(s.parse::<CpuArchitecture>().unwrap().to_string(), s);
        }
        assert!("bogus".parse::<CpuArchitecture>().is_err());
    }

    #[test]
    fn test_nmstate_gate() {
        let mut entry = VersionEntry {
            openshift_version: "4.18".into(),
            cpu_architecture: CpuArchitecture::X86_64,
            full_iso_url: String::new(),
            minimal_iso_url: String::new(),
            nmstate_archive_url: None,
        };
        assert!(entry.wants_nmstate_archive());
        entry.openshift_version = "4.17".into();
        assert!(!entry.wants_nmstate_archive());
        entry.openshift_version = "5.0".into();
        assert!(entry.wants_nmstate_archive());
    }
}
