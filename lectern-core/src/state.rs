//! Per-book reading state persisted between sessions.
//!
//! Each book gets one JSON record under the state directory, named by its
//! book id:
//!
//! ```json
//! {
//!   "version": 1,
//!   "book": { "id": "…", "path": "/books/dune", "title": "Dune" },
//!   "position": { "spine_index": 3, "cfi": "epubcfi(/6/8!/4/1:120)", "percentage": 41.2 },
//!   "layout": { "mode": "paginated", "font_size": 16.0, "columns": "auto" },
//!   "annotations": []
//! }
//! ```

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::anchor::Annotation;
use crate::config::ColumnMode;
use crate::{BookId, BookInfo, LayoutMode};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedReadingState {
    pub mode: LayoutMode,
    pub spine_index: usize,
    /// First character on screen, as `epubcfi(...)`. Preferred over the
    /// percentage when restoring.
    pub cfi: Option<String>,
    /// Book-wide reading progress in `[0, 100]`.
    pub percentage: f64,
    pub font_size: Option<f64>,
    pub columns: Option<ColumnMode>,
    pub annotations: Vec<Annotation>,
}

impl Default for PersistedReadingState {
    fn default() -> Self {
        Self {
            mode: LayoutMode::Paginated,
            spine_index: 0,
            cfi: None,
            percentage: 0.0,
            font_size: None,
            columns: None,
            annotations: Vec::new(),
        }
    }
}

pub trait StateStore: Send + Sync {
    fn load(&self, book: &BookInfo) -> Result<Option<PersistedReadingState>>;
    fn save(&self, book: &BookInfo, state: &PersistedReadingState) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct BookRecord {
    id: BookId,
    path: PathBuf,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct PositionRecord {
    spine_index: usize,
    cfi: Option<String>,
    percentage: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct LayoutRecord {
    mode: LayoutMode,
    font_size: Option<f64>,
    columns: Option<ColumnMode>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateRecord {
    version: u32,
    book: BookRecord,
    #[serde(default)]
    position: PositionRecord,
    #[serde(default)]
    layout: LayoutRecord,
    #[serde(default)]
    annotations: Vec<Annotation>,
}

impl StateRecord {
    fn new(book: &BookInfo, state: &PersistedReadingState) -> Self {
        Self {
            version: STATE_VERSION,
            book: BookRecord {
                id: book.id,
                path: book.path.clone(),
                title: book.metadata.title.clone(),
            },
            position: PositionRecord {
                spine_index: state.spine_index,
                cfi: state.cfi.clone(),
                percentage: state.percentage,
            },
            layout: LayoutRecord {
                mode: state.mode,
                font_size: state.font_size,
                columns: state.columns,
            },
            annotations: state.annotations.clone(),
        }
    }

    fn into_state(self) -> PersistedReadingState {
        PersistedReadingState {
            mode: self.layout.mode,
            spine_index: self.position.spine_index,
            cfi: self.position.cfi,
            percentage: self.position.percentage,
            font_size: self.layout.font_size,
            columns: self.layout.columns,
            annotations: self.annotations,
        }
    }
}

/// JSON records on disk, one per book, replaced atomically on save.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self { root })
    }

    fn record_path(&self, book: &BookInfo) -> PathBuf {
        self.root.join(format!("{}.json", book.id))
    }
}

impl StateStore for FileStateStore {
    fn load(&self, book: &BookInfo) -> Result<Option<PersistedReadingState>> {
        let path = self.record_path(book);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read state record {:?}", path))
            }
        };
        let record: StateRecord = serde_json::from_str(&raw)
            .with_context(|| format!("failed to decode state record {:?}", path))?;
        if record.version != STATE_VERSION {
            warn!(?path, version = record.version, "ignoring state record of another version");
            return Ok(None);
        }
        if record.book.id != book.id {
            warn!(?path, "state record belongs to another book");
            return Ok(None);
        }
        debug!(?path, spine = record.position.spine_index, "reading state loaded");
        Ok(Some(record.into_state()))
    }

    fn save(&self, book: &BookInfo, state: &PersistedReadingState) -> Result<()> {
        let path = self.record_path(book);
        let staged = path.with_extension("json.partial");
        let payload = serde_json::to_vec_pretty(&StateRecord::new(book, state))?;
        fs::write(&staged, payload)
            .with_context(|| format!("failed to stage state record {:?}", staged))?;
        fs::rename(&staged, &path)
            .with_context(|| format!("failed to replace state record {:?}", path))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<HashMap<BookId, PersistedReadingState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, book: &BookInfo) -> Result<Option<PersistedReadingState>> {
        Ok(self.inner.lock().get(&book.id).cloned())
    }

    fn save(&self, book: &BookInfo, state: &PersistedReadingState) -> Result<()> {
        self.inner.lock().insert(book.id, state.clone());
        Ok(())
    }
}
