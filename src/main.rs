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

//! A thin CLI wrapper over the store library: parse a catalog and a
//! data directory, populate the cache, and report readiness. The HTTP
//! surface this would normally sit behind is out of scope here.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use rhcos_image_service::catalog::Catalog;
use rhcos_image_service::download::RequestOptions;
use rhcos_image_service::store::{ImageStore, StoreConfig};

#[derive(Parser)]
#[clap(version)]
struct Cli {
    /// Path to the catalog JSON file
    #[clap(long, value_name = "path")]
    catalog: PathBuf,

    /// Directory the cache lives in
    #[clap(long, value_name = "path")]
    data_dir: PathBuf,

    /// Path to an extra CA certificate bundle for HTTPS downloads
    #[clap(long, value_name = "path")]
    ca_cert_file: Option<PathBuf>,

    /// Skip TLS certificate verification (testing only)
    #[clap(long)]
    insecure_skip_tls: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let catalog_data = fs::read(&cli.catalog)
        .with_context(|| format!("reading catalog {}", cli.catalog.display()))?;
    let catalog = Catalog::from_json(&catalog_data)
        .with_context(|| format!("parsing catalog {}", cli.catalog.display()))?;

    let store = ImageStore::new(StoreConfig {
        data_dir: cli.data_dir.clone(),
        catalog,
        request_options: RequestOptions {
            ca_cert_file: cli.ca_cert_file,
            insecure_skip_tls: cli.insecure_skip_tls,
            ..Default::default()
        },
    })?;

    eprintln!("Populating image cache at {}", cli.data_dir.display());
    store.populate()?;
    eprintln!("Ready");
    Ok(())
}
