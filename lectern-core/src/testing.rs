//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::location::{LocationPath, PathPoint};
use crate::surface::{
    ChapterGeometry, ChapterStore, ContentHandle, ContentSurface, Placeholder, SurfaceLayout,
    Translation, Viewport,
};
use crate::{
    BookInfo, BookMetadata, ChapterContent, ContentRange, LayoutMode, Rect, SpineItem,
};

pub const CHAR_WIDTH: f64 = 8.0;
pub const LINE_HEIGHT: f64 = 16.0;
pub const CHARS_PER_LINE: usize = 10;
pub const CHARS_PER_COLUMN: usize = 100;

pub struct FakeStore {
    info: BookInfo,
    texts: Vec<String>,
    failing: HashSet<usize>,
}

impl FakeStore {
    pub fn new(texts: Vec<String>, failing: &[usize]) -> Self {
        let spine = (0..texts.len())
            .map(|index| SpineItem {
                index,
                href: format!("text/ch{index:02}.xhtml"),
                linear: true,
            })
            .collect();
        Self {
            info: BookInfo {
                id: uuid::Uuid::nil(),
                path: PathBuf::from("/books/fake"),
                spine,
                metadata: BookMetadata::default(),
            },
            texts,
            failing: failing.iter().copied().collect(),
        }
    }

    /// `chapters` chapters of 250 characters each.
    pub fn arc(chapters: usize) -> Arc<dyn ChapterStore> {
        Self::arc_failing(chapters, &[])
    }

    pub fn arc_failing(chapters: usize, failing: &[usize]) -> Arc<dyn ChapterStore> {
        let texts = (0..chapters).map(default_text).collect();
        Arc::new(Self::new(texts, failing))
    }

    pub fn arc_with_texts(texts: Vec<String>) -> Arc<dyn ChapterStore> {
        Arc::new(Self::new(texts, &[]))
    }
}

pub fn default_text(index: usize) -> String {
    let seed = format!("chapter {index:02} ");
    seed.repeat(250 / seed.len() + 1)[..250].to_string()
}

#[async_trait::async_trait]
impl ChapterStore for FakeStore {
    fn info(&self) -> &BookInfo {
        &self.info
    }

    async fn fetch_chapter(&self, index: usize) -> Result<ChapterContent> {
        tokio::task::yield_now().await;
        if self.failing.contains(&index) {
            return Err(anyhow!("chapter {index} unavailable"));
        }
        let markup = self
            .texts
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("chapter {index} out of range"))?;
        Ok(ChapterContent {
            index,
            href: self.info.spine[index].href.clone(),
            markup,
        })
    }
}

struct FakeChapter {
    index: usize,
    text: Vec<char>,
}

/// Lays each chapter out as a run of fixed-size character cells. A column
/// holds `CHARS_PER_COLUMN` characters in lines of `CHARS_PER_LINE`; chapters
/// start on a fresh page.
pub struct FakeSurface {
    layout: Option<SurfaceLayout>,
    chapters: BTreeMap<ContentHandle, FakeChapter>,
    reserved: BTreeMap<usize, f64>,
    placeholders: Vec<Placeholder>,
    position: f64,
    next_handle: u64,
    fail_materialize: HashSet<usize>,
    pub transforms: Vec<f64>,
}

impl FakeSurface {
    pub fn new() -> Self {
        let mut surface = Self::unmeasured();
        surface.set_layout(&SurfaceLayout {
            mode: LayoutMode::Paginated,
            viewport: Viewport::new(400.0, 300.0),
            columns: 1,
            font_size: 16.0,
            margin: 0.0,
            column_gap: 0.0,
            page_gap: 0.0,
        });
        surface
    }

    pub fn unmeasured() -> Self {
        Self {
            layout: None,
            chapters: BTreeMap::new(),
            reserved: BTreeMap::new(),
            placeholders: Vec::new(),
            position: 0.0,
            next_handle: 1,
            fail_materialize: HashSet::new(),
            transforms: Vec::new(),
        }
    }

    pub fn fail_materialize(&mut self, index: usize) {
        self.fail_materialize.insert(index);
    }

    pub fn live_handles(&self) -> usize {
        self.chapters.len()
    }

    pub fn placeholders(&self) -> &[Placeholder] {
        &self.placeholders
    }

    pub fn layout(&self) -> Option<&SurfaceLayout> {
        self.layout.as_ref()
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    fn page_extent(&self, layout: &SurfaceLayout) -> f64 {
        layout.page_extent()
    }

    fn chars_per_page(layout: &SurfaceLayout) -> usize {
        CHARS_PER_COLUMN * layout.columns.max(1) as usize
    }

    fn chapter_extent(&self, layout: &SurfaceLayout, chapter: &FakeChapter) -> f64 {
        match layout.mode {
            LayoutMode::Paginated => {
                let per_page = Self::chars_per_page(layout);
                let pages = chapter.text.len().div_ceil(per_page).max(1);
                pages as f64 * self.page_extent(layout)
            }
            LayoutMode::Scrolled => {
                let lines = chapter.text.len().div_ceil(CHARS_PER_LINE).max(1);
                lines as f64 * LINE_HEIGHT
            }
        }
    }

    /// Offsets of every loaded chapter, in spine order, with reserved
    /// placeholders taking their space. Also returns the total extent.
    fn offsets(&self) -> (Vec<(ContentHandle, usize, ChapterGeometry)>, f64) {
        let Some(layout) = self.layout.as_ref() else {
            return (Vec::new(), 0.0);
        };
        let mut by_index: BTreeMap<usize, Option<(ContentHandle, f64)>> = BTreeMap::new();
        for (handle, chapter) in &self.chapters {
            by_index.insert(
                chapter.index,
                Some((*handle, self.chapter_extent(layout, chapter))),
            );
        }
        if layout.mode == LayoutMode::Scrolled {
            for index in self.reserved.keys() {
                by_index.entry(*index).or_insert(None);
            }
        }

        let mut cursor = 0.0;
        let mut out = Vec::new();
        for (index, entry) in by_index {
            match entry {
                Some((handle, extent)) => {
                    out.push((
                        handle,
                        index,
                        ChapterGeometry {
                            offset: cursor,
                            extent,
                        },
                    ));
                    cursor += extent;
                }
                None => cursor += self.reserved.get(&index).copied().unwrap_or_default(),
            }
        }
        (out, cursor)
    }

    fn geometry(&self, handle: ContentHandle) -> Option<(usize, ChapterGeometry)> {
        self.offsets()
            .0
            .into_iter()
            .find(|(h, _, _)| *h == handle)
            .map(|(_, index, geometry)| (index, geometry))
    }
}

impl ContentSurface for FakeSurface {
    fn set_layout(&mut self, layout: &SurfaceLayout) {
        if !layout.viewport.is_measurable() {
            self.layout = None;
            return;
        }
        if self
            .layout
            .as_ref()
            .is_some_and(|current| current.mode != layout.mode)
        {
            self.reserved.clear();
        }
        self.layout = Some(layout.clone());
    }

    fn materialize(&mut self, index: usize, content: &ChapterContent) -> Result<ContentHandle> {
        if self.fail_materialize.contains(&index) {
            return Err(anyhow!("surface rejected chapter {index}"));
        }
        let handle = ContentHandle::new(self.next_handle);
        self.next_handle += 1;
        self.reserved.remove(&index);
        self.chapters.insert(
            handle,
            FakeChapter {
                index,
                text: content.markup.chars().collect(),
            },
        );
        Ok(handle)
    }

    fn unmaterialize(&mut self, handle: ContentHandle, placeholder: Placeholder) {
        if let Some(chapter) = self.chapters.remove(&handle) {
            if let Placeholder::Reserved(extent) = placeholder {
                self.reserved.insert(chapter.index, extent);
            }
            self.placeholders.push(placeholder);
        }
    }

    fn measure(&self, handle: ContentHandle) -> Option<ChapterGeometry> {
        self.geometry(handle).map(|(_, geometry)| geometry)
    }

    fn apply_transform(&mut self, position: f64) {
        self.position = position;
        self.transforms.push(position);
    }

    fn applied_offset(&self) -> Translation {
        match self.layout.as_ref().map(|l| l.mode) {
            Some(LayoutMode::Scrolled) => Translation {
                x: 0.0,
                y: -self.position,
            },
            _ => Translation {
                x: -self.position,
                y: 0.0,
            },
        }
    }

    fn total_scroll_extent(&self) -> Option<f64> {
        self.layout.as_ref()?;
        Some(self.offsets().1)
    }

    fn viewport_extent(&self) -> Option<f64> {
        let layout = self.layout.as_ref()?;
        Some(match layout.mode {
            LayoutMode::Paginated => layout.viewport.width,
            LayoutMode::Scrolled => layout.viewport.height,
        })
    }

    fn text_content(&self, handle: ContentHandle) -> Option<String> {
        self.chapters
            .get(&handle)
            .map(|chapter| chapter.text.iter().collect())
    }

    fn resolve_path(&self, handle: ContentHandle, path: &LocationPath) -> Option<ContentRange> {
        let chapter = self.chapters.get(&handle)?;
        if path.start.block_index()? != 0 || path.end.block_index()? != 0 {
            return None;
        }
        let len = chapter.text.len();
        if path.start.offset > len || path.end.offset > len {
            return None;
        }
        Some(ContentRange::new(
            chapter.index,
            path.start.offset,
            path.end.offset,
        ))
    }

    fn path_for_range(&self, handle: ContentHandle, range: &ContentRange) -> Option<LocationPath> {
        let chapter = self.chapters.get(&handle)?;
        if range.end > chapter.text.len() {
            return None;
        }
        Some(LocationPath::new(
            PathPoint::new(vec![2, 1], range.start),
            PathPoint::new(vec![2, 1], range.end),
        ))
    }

    fn resolve_fragment(&self, handle: ContentHandle, fragment: &str) -> Option<ContentRange> {
        let chapter = self.chapters.get(&handle)?;
        let text: String = chapter.text.iter().collect();
        let marker = format!("[{fragment}]");
        let byte = text.find(&marker)?;
        let start = text[..byte].chars().count();
        Some(ContentRange::new(
            chapter.index,
            start,
            start + marker.chars().count(),
        ))
    }

    fn client_rects(&self, handle: ContentHandle, range: &ContentRange) -> Vec<Rect> {
        let (Some(layout), Some((_, geometry))) = (self.layout.as_ref(), self.geometry(handle))
        else {
            return Vec::new();
        };
        let translation = self.applied_offset();
        let per_page = Self::chars_per_page(layout);
        let page_extent = self.page_extent(layout);
        (range.start..range.end)
            .map(|i| {
                let rect = match layout.mode {
                    LayoutMode::Paginated => {
                        let page = i / per_page;
                        let within = i % per_page;
                        let column = within / CHARS_PER_COLUMN;
                        let in_column = within % CHARS_PER_COLUMN;
                        Rect::new(
                            geometry.offset
                                + page as f64 * page_extent
                                + column as f64 * (CHARS_PER_LINE as f64 * CHAR_WIDTH + 8.0)
                                + (in_column % CHARS_PER_LINE) as f64 * CHAR_WIDTH,
                            (in_column / CHARS_PER_LINE) as f64 * LINE_HEIGHT,
                            CHAR_WIDTH,
                            LINE_HEIGHT,
                        )
                    }
                    LayoutMode::Scrolled => Rect::new(
                        (i % CHARS_PER_LINE) as f64 * CHAR_WIDTH,
                        geometry.offset + (i / CHARS_PER_LINE) as f64 * LINE_HEIGHT,
                        CHAR_WIDTH,
                        LINE_HEIGHT,
                    ),
                };
                rect.translate(translation.x, translation.y)
            })
            .collect()
    }
}
