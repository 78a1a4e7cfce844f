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

//! The catalog: the JSON array of bootable images the store is told to
//! serve.

use std::collections::HashSet;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

/// CPU architecture of a catalog entry, as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuArchitecture {
    X86_64,
    Arm64,
    Ppc64le,
    S390x,
}

impl CpuArchitecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
            Self::Ppc64le => "ppc64le",
            Self::S390x => "s390x",
        }
    }
}

/// One element of the catalog JSON array.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub openshift_version: String,
    pub cpu_architecture: CpuArchitecture,
    pub url: String,
    pub version: String,
    #[serde(default)]
    pub ove: bool,
}

/// The full catalog. Identity of an entry is `(openshift_version,
/// cpu_architecture)`; that tuple is required to be unique.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    pub entries: Vec<CatalogEntry>,
}

/// The catalog, or one of its entries, is malformed.
/// Fatal at startup; `ImageStore::new` returns this before any I/O happens.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog is empty")]
    Empty,
    #[error("catalog entry for ({openshift_version}, {arch}) has an empty version string")]
    EmptyVersion {
        openshift_version: String,
        arch: &'static str,
    },
    #[error("catalog entry for ({openshift_version}, {arch}) has a malformed URL: {source}")]
    MalformedUrl {
        openshift_version: String,
        arch: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error(
        "duplicate catalog entry for (openshift_version={openshift_version}, cpu_architecture={arch})"
    )]
    Duplicate {
        openshift_version: String,
        arch: &'static str,
    },
}

impl Catalog {
    /// Parse a catalog from its on-disk JSON representation.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let catalog: Catalog =
            serde_json::from_slice(data).context("decoding catalog JSON")?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Validate: non-empty catalog, non-empty `version`, well-formed
    /// `url`, and unique (openshiftVersion, cpuArchitecture) identity.
    pub fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(CatalogError::Empty.into());
        }
        let mut seen: HashSet<(&str, CpuArchitecture)> = HashSet::new();
        for entry in &self.entries {
            let arch = entry.cpu_architecture.as_str();
            if entry.version.is_empty() {
                return Err(CatalogError::EmptyVersion {
                    openshift_version: entry.openshift_version.clone(),
                    arch,
                }
                .into());
            }
            Url::parse(&entry.url).map_err(|source| CatalogError::MalformedUrl {
                openshift_version: entry.openshift_version.clone(),
                arch,
                source,
            })?;
            if !seen.insert((entry.openshift_version.as_str(), entry.cpu_architecture)) {
                return Err(CatalogError::Duplicate {
                    openshift_version: entry.openshift_version.clone(),
                    arch,
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn find(
        &self,
        openshift_version: &str,
        arch: CpuArchitecture,
    ) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .find(|e| e.openshift_version == openshift_version && e.cpu_architecture == arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ov: &str, arch: &str, url: &str, version: &str) -> String {
        format!(
            r#"{{"openshift_version":"{ov}","cpu_architecture":"{arch}","url":"{url}","version":"{version}"}}"#
        )
    }

    #[test]
    fn parses_valid_catalog() {
        let json = format!(
            "[{}]",
            entry("4.18", "x86_64", "https://example.com/a.iso", "418.92-0")
        );
        let catalog = Catalog::from_json(json.as_bytes()).unwrap();
        assert_eq!(catalog.entries.len(), 1);
        assert!(catalog.find("4.18", CpuArchitecture::X86_64).is_some());
        assert!(catalog.find("4.18", CpuArchitecture::Arm64).is_none());
    }

    #[test]
    fn rejects_empty_catalog() {
        let err = Catalog::from_json(b"[]").unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn rejects_empty_version() {
        let json = format!(
            "[{}]",
            entry("4.18", "x86_64", "https://example.com/a.iso", "")
        );
        Catalog::from_json(json.as_bytes()).unwrap_err();
    }

    #[test]
    fn rejects_malformed_url() {
        let json = format!("[{}]", entry("4.18", "x86_64", "not-a-url", "418.92-0"));
        Catalog::from_json(json.as_bytes()).unwrap_err();
    }

    #[test]
    fn rejects_duplicate_identity() {
        let json = format!(
            "[{},{}]",
            entry("4.18", "x86_64", "https://example.com/a.iso", "418.92-0"),
            entry("4.18", "x86_64", "https://example.com/b.iso", "418.93-0"),
        );
        let err = Catalog::from_json(json.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
