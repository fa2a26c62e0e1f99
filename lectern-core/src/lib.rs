use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod anchor;
pub mod config;
pub mod controller;
pub mod error;
pub mod gesture;
pub mod location;
pub mod paginator;
pub mod scroller;
pub mod state;
pub mod surface;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use anchor::{
    merge_rects, AnchorOutcome, AnchorScheduler, AnchorStatus, AnchorTrigger, AnchoredHighlight,
    Annotation, AnnotationSelector, HighlightAnchor, SelectorTier, TextOffsetRange, TextQuote,
};
pub use config::{
    AnchorConfig, ColumnMode, GestureConfig, LayoutConfig, ReaderConfig, WindowConfig,
};
pub use controller::{Command, ReaderController};
pub use error::{ChapterLoadFailure, ErrorKind, ReaderError};
pub use gesture::{GestureEngine, GestureState, GestureTick, PageGeometry};
pub use location::{Cfi, LocationPath, PathPoint};
pub use paginator::{ChapterPageInfo, PagePosition, Paginator};
pub use scroller::Scroller;
pub use state::{FileStateStore, MemoryStateStore, PersistedReadingState, StateStore};
pub use surface::{
    BookProvider, ChapterGeometry, ChapterStore, ContentHandle, ContentSurface, Placeholder,
    SurfaceLayout, Translation, Viewport,
};
pub use window::{ChapterWindow, Direction, LoadingFlag, WindowManager, WindowPlan, WindowReport};

pub type BookId = Uuid;

static BOOK_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3f0d6c2e-8a41-5b7e-9c1d-2e6f4a8b0c57").expect("valid namespace UUID")
});

/// Stable identifier for a book on disk, derived from its canonical path.
pub fn book_id_for_path(path: &Path) -> BookId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&BOOK_NAMESPACE, rendered.as_bytes())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BookMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
}

/// One entry of the book's reading order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpineItem {
    pub index: usize,
    pub href: String,
    pub linear: bool,
}

#[derive(Debug, Clone)]
pub struct BookInfo {
    pub id: BookId,
    pub path: PathBuf,
    pub spine: Vec<SpineItem>,
    pub metadata: BookMetadata,
}

impl BookInfo {
    pub fn chapter_count(&self) -> usize {
        self.spine.len()
    }

    /// Looks up a spine index by href, ignoring any `#fragment`.
    pub fn spine_index_for_href(&self, href: &str) -> Option<usize> {
        let (path, _) = split_fragment(href);
        self.spine
            .iter()
            .find(|item| item.href == path || item.href.ends_with(&format!("/{path}")))
            .map(|item| item.index)
    }
}

/// Splits `chapter.xhtml#note-3` into `("chapter.xhtml", Some("note-3"))`.
pub fn split_fragment(href: &str) -> (&str, Option<&str>) {
    match href.split_once('#') {
        Some((path, fragment)) if !fragment.is_empty() => (path, Some(fragment)),
        Some((path, _)) => (path, None),
        None => (href, None),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterContent {
    pub index: usize,
    pub href: String,
    pub markup: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    pub fn translate(&self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }

    pub fn union(&self, other: &Rect) -> Self {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        Self {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }
}

/// A span of a chapter's plain-text rendering, in character offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentRange {
    pub spine_index: usize,
    pub start: usize,
    pub end: usize,
}

impl ContentRange {
    pub fn new(spine_index: usize, start: usize, end: usize) -> Self {
        Self {
            spine_index,
            start: start.min(end),
            end: start.max(end),
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutMode {
    #[default]
    Paginated,
    Scrolled,
}

impl LayoutMode {
    pub fn toggled(self) -> Self {
        match self {
            LayoutMode::Paginated => LayoutMode::Scrolled,
            LayoutMode::Scrolled => LayoutMode::Paginated,
        }
    }
}

/// Where the reader currently is, as reported to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub spine_index: usize,
    pub percentage: f64,
    pub page_in_chapter: usize,
    pub total_pages_in_chapter: usize,
    pub page_in_book: usize,
    pub total_pages_in_book: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    Relocated(Location),
    Selected {
        text: String,
        location: String,
        position: Rect,
    },
    Loading(bool),
    Error {
        kind: ErrorKind,
        message: String,
    },
}
