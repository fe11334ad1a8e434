//! Spreadsheet source adapter
//!
//! Fetches the ledger workbook by file id. Backends:
//! - `GraphDriveSource` - Microsoft Graph drive items (production)
//! - `LocalFileSource` - a directory of `.xlsx` files (development, CLI)
//! - `CachedSource` - TTL cache in front of either

pub mod credentials;
pub mod graph;

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ImportError;

pub use credentials::{CredentialProvider, RefreshTokenProvider, StaticToken};
pub use graph::GraphDriveSource;

/// `"<driveId>!<itemId>"` identifier of a drive item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileId {
    drive_id: String,
    item_id: String,
}

impl FileId {
    pub fn drive_id(&self) -> &str {
        &self.drive_id
    }

    /// The full identifier; drive items are addressed by it
    pub fn item_id(&self) -> &str {
        &self.item_id
    }
}

impl FromStr for FileId {
    type Err = ImportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.split_once('!') {
            Some((drive, item)) if !drive.is_empty() && !item.is_empty() && !item.contains('!') => {
                Ok(Self {
                    drive_id: drive.to_string(),
                    item_id: s.to_string(),
                })
            }
            _ => Err(ImportError::SourceUnavailable(format!(
                "invalid file id '{}', expected '<driveId>!<itemId>'",
                s
            ))),
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.item_id)
    }
}

/// What the source knows about a document besides its bytes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

/// A fetched workbook
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub metadata: SourceMetadata,
    pub bytes: Arc<Vec<u8>>,
}

/// Where ledger workbooks come from
#[async_trait]
pub trait SpreadsheetSource: Send + Sync {
    /// Fetch a document; `refresh` bypasses any cache
    async fn fetch(&self, file_id: &FileId, refresh: bool) -> Result<SourceDocument, ImportError>;

    fn name(&self) -> &'static str;
}

// ==========================================================================
// Local files
// ==========================================================================

/// Reads `<dir>/<file name>` where the file name is the item part of the id,
/// or `<dir>/<whole id>` when that file exists
pub struct LocalFileSource {
    dir: PathBuf,
}

impl LocalFileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Resolve inside `dir` only; absolute paths and `..` are refused
    fn path_for(&self, file_id: &FileId) -> Result<PathBuf, ImportError> {
        let whole = file_id.item_id();
        if let Some(relative) = contained(whole) {
            let path = self.dir.join(relative);
            if path.exists() {
                return Ok(path);
            }
        }
        let item = whole.split_once('!').map(|(_, item)| item).unwrap_or(whole);
        contained(item)
            .map(|relative| self.dir.join(relative))
            .ok_or_else(|| {
                ImportError::SourceUnavailable(format!(
                    "file id '{}' resolves outside {}",
                    whole,
                    self.dir.display()
                ))
            })
    }
}

/// `name` as a relative path made only of plain components
fn contained(name: &str) -> Option<&Path> {
    let path = Path::new(name);
    path.components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then_some(path)
}

#[async_trait]
impl SpreadsheetSource for LocalFileSource {
    async fn fetch(&self, file_id: &FileId, _refresh: bool) -> Result<SourceDocument, ImportError> {
        let path = self.path_for(file_id)?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            ImportError::SourceUnavailable(format!("cannot read {}: {}", path.display(), e))
        })?;
        debug!("Read {} bytes from {}", bytes.len(), path.display());

        Ok(SourceDocument {
            metadata: SourceMetadata {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size: Some(bytes.len() as u64),
                last_modified: None,
            },
            bytes: Arc::new(bytes),
        })
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

// ==========================================================================
// Cache
// ==========================================================================

struct CacheEntry {
    document: SourceDocument,
    fetched_at: Instant,
}

/// TTL cache of fetched documents, keyed by file id
pub struct CachedSource<S> {
    inner: S,
    ttl: Duration,
    entries: RwLock<HashMap<FileId, CacheEntry>>,
}

impl<S: SpreadsheetSource> CachedSource<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, file_id: &FileId) -> Option<SourceDocument> {
        let entries = self.entries.read();
        let entry = entries.get(file_id)?;
        (entry.fetched_at.elapsed() < self.ttl).then(|| entry.document.clone())
    }
}

#[async_trait]
impl<S: SpreadsheetSource> SpreadsheetSource for CachedSource<S> {
    async fn fetch(&self, file_id: &FileId, refresh: bool) -> Result<SourceDocument, ImportError> {
        if !refresh {
            if let Some(document) = self.cached(file_id) {
                debug!("Cache hit for {}", file_id);
                return Ok(document);
            }
        }

        let document = self.inner.fetch(file_id, refresh).await?;
        info!(
            "Fetched '{}' ({} bytes) via {}",
            document.metadata.name,
            document.bytes.len(),
            self.inner.name()
        );
        self.entries.write().insert(
            file_id.clone(),
            CacheEntry {
                document: document.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(document)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
