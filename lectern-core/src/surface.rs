//! Collaborator contracts: the measurable content surface and the chapter store.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::location::LocationPath;
use crate::{BookInfo, ChapterContent, ContentRange, LayoutMode, Rect};

/// Opaque handle to a chapter materialized on a [`ContentSurface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHandle(u64);

impl ContentHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Position and size of a chapter along the layout axis: horizontal in
/// paginated mode, vertical in scrolled mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChapterGeometry {
    pub offset: f64,
    pub extent: f64,
}

impl ChapterGeometry {
    pub fn end(&self) -> f64 {
        self.offset + self.extent
    }
}

/// What an unloaded chapter leaves behind on the surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Placeholder {
    /// Takes no space; used for column layout.
    Collapsed,
    /// Keeps the given extent so scroll offsets below it do not jump.
    Reserved(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_measurable(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1024.0,
            height: 768.0,
        }
    }
}

/// Layout parameters pushed to the surface whenever they change.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceLayout {
    pub mode: LayoutMode,
    pub viewport: Viewport,
    pub columns: u32,
    pub font_size: f64,
    pub margin: f64,
    pub column_gap: f64,
    pub page_gap: f64,
}

impl SurfaceLayout {
    /// Distance between the starts of two consecutive pages.
    pub fn page_extent(&self) -> f64 {
        self.viewport.width + self.page_gap
    }
}

/// Translation currently applied to the surface's content, in surface pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Translation {
    pub x: f64,
    pub y: f64,
}

/// A host rendering surface that lays out chapter markup and reports geometry.
///
/// Client rectangles are reported in viewport space, i.e. with the current
/// transform already applied.
pub trait ContentSurface: Send {
    fn set_layout(&mut self, layout: &SurfaceLayout);

    fn materialize(&mut self, index: usize, content: &ChapterContent) -> Result<ContentHandle>;

    fn unmaterialize(&mut self, handle: ContentHandle, placeholder: Placeholder);

    fn measure(&self, handle: ContentHandle) -> Option<ChapterGeometry>;

    /// Scrolls the content so that `position` along the layout axis sits at the
    /// viewport origin.
    fn apply_transform(&mut self, position: f64);

    fn applied_offset(&self) -> Translation;

    fn total_scroll_extent(&self) -> Option<f64>;

    fn viewport_extent(&self) -> Option<f64>;

    fn text_content(&self, handle: ContentHandle) -> Option<String>;

    fn resolve_path(&self, handle: ContentHandle, path: &LocationPath) -> Option<ContentRange>;

    fn path_for_range(&self, handle: ContentHandle, range: &ContentRange) -> Option<LocationPath>;

    fn resolve_fragment(&self, handle: ContentHandle, fragment: &str) -> Option<ContentRange>;

    fn client_rects(&self, handle: ContentHandle, range: &ContentRange) -> Vec<Rect>;
}

/// Source of chapter markup, keyed by spine index. Caching is the store's own
/// business.
#[async_trait::async_trait]
pub trait ChapterStore: Send + Sync {
    fn info(&self) -> &BookInfo;

    async fn fetch_chapter(&self, index: usize) -> Result<ChapterContent>;
}

#[async_trait::async_trait]
pub trait BookProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Arc<dyn ChapterStore>>;
}
