//! Blob storage for uploaded spreadsheets and the catalog of registered
//! datasets. Both are local-filesystem stand-ins for hosted services.

use crate::data::{self, SpreadsheetFormat};
use crate::normalize::Normalizer;
use crate::types::CensusRecord;
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `path` and return a URL that `fetch` accepts.
    fn put(&self, path: &str, bytes: &[u8]) -> Result<String>;

    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || path.is_empty() {
            bail!("Invalid storage path: {:?}", path);
        }
        Ok(self.root.join(relative))
    }
}

impl BlobStore for LocalBlobStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<String> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create storage directory: {:?}", parent))?;
        }
        fs::write(&target, bytes)
            .with_context(|| format!("Failed to write blob: {:?}", target))?;
        let absolute = fs::canonicalize(&target)
            .with_context(|| format!("Failed to resolve blob path: {:?}", target))?;
        Ok(format!("file://{}", absolute.display()))
    }

    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let path = url
            .strip_prefix("file://")
            .ok_or_else(|| anyhow!("Local store cannot fetch {}", url))?;
        fs::read(path).with_context(|| format!("Failed to read blob: {}", path))
    }
}

/// Fetch a dataset URL: `file://` through the store, `http(s)://` over the network.
pub async fn fetch_url(store: &dyn BlobStore, url: &str) -> Result<Vec<u8>> {
    if url.starts_with("http://") || url.starts_with("https://") {
        let response = reqwest::get(url)
            .await
            .with_context(|| format!("Failed to download dataset from {}", url))?;
        if !response.status().is_success() {
            bail!("Dataset download from {} failed with status {}", url, response.status());
        }
        let bytes = response.bytes().await.context("Failed to read dataset body")?;
        Ok(bytes.to_vec())
    } else {
        store.fetch(url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub uploaded_by: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
}

/// JSON-file collection of dataset entries.
pub struct DatasetCatalog {
    path: PathBuf,
}

impl DatasetCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_store(store: &LocalBlobStore) -> Self {
        Self::new(store.root().join("catalog.json"))
    }

    pub fn list(&self) -> Result<Vec<DatasetEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read dataset catalog: {:?}", self.path))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse dataset catalog: {:?}", self.path))
    }

    pub fn add(&self, entry: DatasetEntry) -> Result<DatasetEntry> {
        let mut entries = self.list()?;
        entries.push(entry.clone());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&entries)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write dataset catalog: {:?}", self.path))?;
        Ok(entry)
    }

    /// Most recent by `uploaded_at`; ties go to the entry added last.
    pub fn latest(&self) -> Result<Option<DatasetEntry>> {
        Ok(self
            .list()?
            .into_iter()
            .enumerate()
            .max_by_key(|(i, e)| (e.uploaded_at, *i))
            .map(|(_, e)| e))
    }
}

/// Validate, store and register an uploaded spreadsheet.
pub fn upload_dataset(
    store: &dyn BlobStore,
    catalog: &DatasetCatalog,
    file_name: &str,
    bytes: &[u8],
    uploaded_by: &str,
) -> Result<DatasetEntry> {
    let name = Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid file name: {:?}", file_name))?;
    let format = SpreadsheetFormat::from_path(Path::new(name))?;
    let rows = data::read_rows(bytes, format)
        .with_context(|| format!("{} is not a readable spreadsheet", name))?;

    let url = store.put(&format!("datasets/{}", name), bytes)?;
    let entry = catalog.add(DatasetEntry {
        id: uuid::Uuid::new_v4().to_string(),
        title: name.to_string(),
        url,
        uploaded_by: Some(uploaded_by.to_string()),
        uploaded_at: Utc::now(),
        description: Some(format!("Dataset con {} filas", rows.len())),
    })?;

    info!(title = %entry.title, rows = rows.len(), "dataset uploaded");
    Ok(entry)
}

/// Load and normalize the most recent dataset, or `None` if nothing is registered.
pub async fn load_latest(
    store: &dyn BlobStore,
    catalog: &DatasetCatalog,
    normalizer: &Normalizer,
) -> Result<Option<(DatasetEntry, Vec<CensusRecord>)>> {
    let Some(entry) = catalog.latest()? else {
        warn!("no datasets registered yet");
        return Ok(None);
    };

    let bytes = fetch_url(store, &entry.url).await?;
    let format = SpreadsheetFormat::from_path(Path::new(&entry.title))
        .or_else(|_| SpreadsheetFormat::from_path(Path::new(&entry.url)))?;
    let rows = data::read_rows(&bytes, format)?;
    let (records, report) = normalizer.normalize(&rows);

    info!(
        title = %entry.title,
        records = records.len(),
        repaired = report.repaired_cells(),
        "loaded latest dataset"
    );
    Ok(Some((entry, records)))
}
