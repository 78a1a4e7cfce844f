// Copyright 2024 Red Hat
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

//! The on-disk cache of full ISOs, minimal-ISO templates, and extracted
//! `nmstatectl` archives, keyed by (openshiftVersion, cpuArchitecture).

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::catalog::{Catalog, CatalogEntry, CpuArchitecture};
use crate::download::{download_to_path, RequestOptions};
use crate::miniso_builder;
use crate::nmstate;
use crate::iso9660;

/// Accepted volume-identifier prefixes for a downloaded full ISO.
const ACCEPTED_VOLUME_PREFIXES: &[&str] = &["rhcos-", "fedora-coreos-", "scos-"];

/// Minimum OpenShift version for which nmstatectl extraction is
/// attempted. Versions below this never shipped a static-networking
/// capable live system.
const NMSTATE_MIN_VERSION: &str = "4.18.0-ec.0";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("downloading {openshift_version}/{arch}: {source}")]
    DownloadFailed {
        openshift_version: String,
        arch: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error(
        "{openshift_version}/{arch}: volume identifier {actual:?} does not begin with an accepted prefix"
    )]
    VolumeIdInvalid {
        openshift_version: String,
        arch: &'static str,
        actual: String,
    },
    #[error("{openshift_version}/{arch}: nmstate extraction failed: {source}")]
    NmstateExtractionFailed {
        openshift_version: String,
        arch: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("{openshift_version}/{arch}: minimal-ISO build failed: {source}")]
    BuildFailed {
        openshift_version: String,
        arch: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// The kind of on-disk artifact a store path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Full,
    Minimal,
}

impl ImageType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Minimal => "minimal",
        }
    }
}

/// Struct-typed configuration for [`ImageStore::new`]. Reaches the core
/// as already-parsed values; no environment or file parsing happens
/// below this boundary.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub catalog: Catalog,
    pub request_options: RequestOptions,
}

pub struct ImageStore {
    data_dir: PathBuf,
    catalog: Catalog,
    request_options: RequestOptions,
}

impl ImageStore {
    /// Validate `config.catalog` and construct a store. Performs no I/O.
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.catalog.validate()?;
        Ok(Self {
            data_dir: config.data_dir,
            catalog: config.catalog,
            request_options: config.request_options,
        })
    }

    /// For each catalog entry, concurrently download (if missing),
    /// validate, extract nmstate, and (re)build the minimal-ISO
    /// template. Cancels the remaining work at the first error observed
    /// among the scoped threads; every thread is still joined, but
    /// results after the first failure are discarded.
    pub fn populate(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating {}", self.data_dir.display()))?;

        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .catalog
                .entries
                .iter()
                .map(|entry| scope.spawn(|| self.populate_one(entry)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("populate worker panicked"))
                .collect()
        });

        for result in &results {
            if let Err(e) = result {
                self.cleanup().ok();
                return Err(anyhow::anyhow!("{e:#}"));
            }
        }

        self.cleanup()?;
        Ok(())
    }

    fn populate_one(&self, entry: &CatalogEntry) -> Result<()> {
        let arch = entry.cpu_architecture.as_str();
        let full_path = self.path_for_params(ImageType::Full, entry);

        if !full_path.is_file() {
            eprintln!(
                "Downloading {} {arch} from {}",
                entry.openshift_version, entry.url
            );
            download_to_path(&entry.url, &full_path, &self.request_options).map_err(|source| {
                StoreError::DownloadFailed {
                    openshift_version: entry.openshift_version.clone(),
                    arch,
                    source,
                }
            })?;
        }

        eprintln!("Validating volume identifier for {} {arch}", entry.openshift_version);
        let volume_id = iso9660::volume_identifier(&full_path).with_context(|| {
            format!("reading volume identifier of {}", full_path.display())
        })?;
        if !ACCEPTED_VOLUME_PREFIXES
            .iter()
            .any(|prefix| volume_id.starts_with(prefix))
        {
            let _ = fs::remove_file(&full_path);
            return Err(StoreError::VolumeIdInvalid {
                openshift_version: entry.openshift_version.clone(),
                arch,
                actual: volume_id,
            }
            .into());
        }

        let nmstate_path = self.nmstatectl_path_for_params(entry);
        if version_at_least(&entry.version, NMSTATE_MIN_VERSION) && !nmstate_path.is_file() {
            eprintln!("Extracting nmstatectl for {} {arch}", entry.openshift_version);
            let archive = (|| -> Result<Vec<u8>> {
                let mut iso = iso9660::IsoFs::from_file(
                    fs::File::open(&full_path)
                        .with_context(|| format!("opening {}", full_path.display()))?,
                )?;
                nmstate::extract_nmstatectl_archive(&mut iso)
            })()
            .map_err(|source| StoreError::NmstateExtractionFailed {
                openshift_version: entry.openshift_version.clone(),
                arch,
                source,
            })?;
            fs::write(&nmstate_path, &archive)
                .with_context(|| format!("writing {}", nmstate_path.display()))?;
        }

        eprintln!("Building minimal ISO for {} {arch}", entry.openshift_version);
        let minimal_path = self.path_for_params(ImageType::Minimal, entry);
        let root_fs_url = format!(
            "{openshift_version}/{version}/{arch}/rootfs.img",
            openshift_version = entry.openshift_version,
            version = entry.version,
        );
        let nmstate_cache = nmstate_path.is_file().then_some(nmstate_path.as_path());
        miniso_builder::build(
            &full_path,
            &minimal_path,
            &root_fs_url,
            arch,
            nmstate_cache,
        )
        .map_err(|source| StoreError::BuildFailed {
            openshift_version: entry.openshift_version.clone(),
            arch,
            source,
        })?;

        Ok(())
    }

    /// Deterministic on-disk path for `image_type` and `entry`.
    pub fn path_for_params(&self, image_type: ImageType, entry: &CatalogEntry) -> PathBuf {
        self.data_dir.join(format!(
            "rhcos-{}-iso-{}-{}-{}.iso",
            image_type.as_str(),
            entry.openshift_version,
            entry.version,
            entry.cpu_architecture.as_str(),
        ))
    }

    fn nmstatectl_path_for_params(&self, entry: &CatalogEntry) -> PathBuf {
        self.data_dir.join(format!(
            "nmstatectl-{}-{}-{}",
            entry.openshift_version,
            entry.version,
            entry.cpu_architecture.as_str(),
        ))
    }

    pub fn nmstatectl_path(
        &self,
        openshift_version: &str,
        arch: CpuArchitecture,
    ) -> Result<PathBuf> {
        let entry = self
            .catalog
            .find(openshift_version, arch)
            .with_context(|| format!("no catalog entry for {openshift_version}/{}", arch.as_str()))?;
        let path = self.nmstatectl_path_for_params(entry);
        if !path.is_file() {
            anyhow::bail!("no nmstatectl cached for {openshift_version}/{}", arch.as_str());
        }
        Ok(path)
    }

    pub fn have_version(&self, openshift_version: &str, arch: CpuArchitecture) -> bool {
        self.catalog.find(openshift_version, arch).is_some()
    }

    pub fn is_ove_image(&self, openshift_version: &str, arch: CpuArchitecture) -> bool {
        self.catalog
            .find(openshift_version, arch)
            .map(|e| e.ove)
            .unwrap_or(false)
    }

    /// Delete every file under `data_dir` whose name doesn't derive from
    /// a current catalog entry.
    fn cleanup(&self) -> Result<()> {
        let mut keep = std::collections::HashSet::new();
        for entry in &self.catalog.entries {
            keep.insert(self.path_for_params(ImageType::Full, entry));
            keep.insert(self.path_for_params(ImageType::Minimal, entry));
            keep.insert(self.nmstatectl_path_for_params(entry));
        }

        for dir_entry in walkdir::WalkDir::new(&self.data_dir)
            .min_depth(1)
            .max_depth(1)
        {
            let dir_entry = dir_entry.context("walking data directory")?;
            let path = dir_entry.path();
            if !dir_entry.file_type().is_file() {
                continue;
            }
            if path.extension().map(|e| e == "partial").unwrap_or(false) {
                continue;
            }
            if !keep.contains(path) {
                eprintln!("Removing stale file {}", path.display());
                fs::remove_file(path)
                    .with_context(|| format!("removing {}", path.display()))?;
            }
        }
        Ok(())
    }
}

/// Compare dotted/hyphenated version strings lexicographically by their
/// numeric segments. Good enough to compare OpenShift release versions
/// like "4.18.0-ec.0" against "4.9.0": split on non-digit runs and
/// compare pairwise as integers.
fn version_at_least(version: &str, minimum: &str) -> bool {
    let segs = |s: &str| -> Vec<u64> {
        s.split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().unwrap_or(0))
            .collect()
    };
    segs(version) >= segs(minimum)
}
