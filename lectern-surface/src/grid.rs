//! A monospace content surface: chapters are word-wrapped into a grid of
//! fixed-size cells and laid out as columns (paginated) or one tall strip
//! (scrolled).

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use tracing::{debug, trace};

use lectern_core::{
    ChapterContent, ChapterGeometry, ContentHandle, ContentRange, ContentSurface, LayoutMode,
    LocationPath, PathPoint, Placeholder, Rect, SurfaceLayout, Translation,
};

use crate::markup::{parse_chapter, ParsedChapter};

/// Cell width as a fraction of the font size.
const CELL_ASPECT: f64 = 0.5;

/// One wrapped line, as a half-open char range of the chapter text. Spacer
/// lines between blocks are empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GridLine {
    start: usize,
    end: usize,
}

/// A line of text currently inside the viewport, in viewport pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub spine_index: usize,
    /// Char offset of the first character within the chapter text.
    pub start: usize,
    pub x: f64,
    pub y: f64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Grid {
    mode: LayoutMode,
    columns: usize,
    chars_per_line: usize,
    lines_per_column: usize,
    cell_width: f64,
    line_height: f64,
    margin: f64,
    column_width: f64,
    column_gap: f64,
    page_extent: f64,
    viewport_width: f64,
    viewport_height: f64,
}

impl Grid {
    fn from_layout(layout: &SurfaceLayout) -> Option<Self> {
        if !layout.viewport.is_measurable() || layout.font_size <= 0.0 {
            return None;
        }
        let cell_width = layout.font_size * CELL_ASPECT;
        let line_height = layout.font_size;
        let columns = match layout.mode {
            LayoutMode::Paginated => layout.columns.max(1) as usize,
            LayoutMode::Scrolled => 1,
        };
        let gaps = layout.column_gap * (columns - 1) as f64;
        let usable = (layout.viewport.width - 2.0 * layout.margin - gaps).max(cell_width);
        let column_width = usable / columns as f64;
        let chars_per_line = ((column_width / cell_width).floor() as usize).max(1);
        let lines_per_column =
            (((layout.viewport.height - 2.0 * layout.margin) / line_height).floor() as usize).max(1);
        Some(Self {
            mode: layout.mode,
            columns,
            chars_per_line,
            lines_per_column,
            cell_width,
            line_height,
            margin: layout.margin,
            column_width,
            column_gap: layout.column_gap,
            page_extent: layout.page_extent(),
            viewport_width: layout.viewport.width,
            viewport_height: layout.viewport.height,
        })
    }

    fn extent(&self, lines: usize) -> f64 {
        match self.mode {
            LayoutMode::Paginated => {
                let columns = lines.div_ceil(self.lines_per_column).max(1);
                columns.div_ceil(self.columns) as f64 * self.page_extent
            }
            LayoutMode::Scrolled => lines.max(1) as f64 * self.line_height + 2.0 * self.margin,
        }
    }

    /// Top-left corner of a cell, relative to the chapter origin.
    fn cell_origin(&self, line: usize, column: usize) -> (f64, f64) {
        match self.mode {
            LayoutMode::Paginated => {
                let grid_column = line / self.lines_per_column;
                let row = line % self.lines_per_column;
                let page = grid_column / self.columns;
                let in_page = grid_column % self.columns;
                (
                    page as f64 * self.page_extent
                        + self.margin
                        + in_page as f64 * (self.column_width + self.column_gap)
                        + column as f64 * self.cell_width,
                    self.margin + row as f64 * self.line_height,
                )
            }
            LayoutMode::Scrolled => (
                self.margin + column as f64 * self.cell_width,
                self.margin + line as f64 * self.line_height,
            ),
        }
    }

    fn wrap(&self, chapter: &ParsedChapter, text: &[char]) -> Vec<GridLine> {
        let width = self.chars_per_line;
        let mut lines = Vec::new();
        for (i, block) in chapter.blocks.iter().enumerate() {
            if i > 0 {
                lines.push(GridLine {
                    start: block.start - 1,
                    end: block.start - 1,
                });
            }
            let end = block.end();
            let mut pos = block.start;
            while pos < end {
                let limit = (pos + width).min(end);
                if limit == end {
                    lines.push(GridLine { start: pos, end });
                    break;
                }
                match (pos + 1..=limit).rev().find(|&at| text[at] == ' ') {
                    Some(space) => {
                        lines.push(GridLine { start: pos, end: space });
                        pos = space + 1;
                    }
                    None => {
                        lines.push(GridLine { start: pos, end: limit });
                        pos = limit;
                    }
                }
            }
        }
        lines
    }
}

struct GridChapter {
    index: usize,
    parsed: ParsedChapter,
    text: Vec<char>,
    lines: Vec<GridLine>,
}

impl GridChapter {
    fn line_for(&self, offset: usize) -> Option<usize> {
        self.lines
            .partition_point(|line| line.start <= offset)
            .checked_sub(1)
    }

    fn path_point(&self, offset: usize) -> Option<PathPoint> {
        let (block_index, block) = self.parsed.block_at(offset)?;
        Some(PathPoint::new(
            vec![2 * (block_index + 1), 1],
            offset.saturating_sub(block.start).min(block.len),
        ))
    }

    fn resolve_point(&self, point: &PathPoint) -> Option<usize> {
        let block = self.parsed.blocks.get(point.block_index()?)?;
        (point.offset <= block.len).then(|| block.start + point.offset)
    }
}

/// Content surface backed by a character grid. Rendering reads the visible
/// text back through [`TextGridSurface::visible_runs`].
#[derive(Default)]
pub struct TextGridSurface {
    grid: Option<Grid>,
    chapters: BTreeMap<usize, GridChapter>,
    handles: HashMap<ContentHandle, usize>,
    reserved: BTreeMap<usize, f64>,
    position: f64,
    next_handle: u64,
}

impl TextGridSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cell width and line height in surface pixels, once a layout is set.
    pub fn cell_size(&self) -> Option<(f64, f64)> {
        self.grid.map(|grid| (grid.cell_width, grid.line_height))
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn title(&self, spine_index: usize) -> Option<&str> {
        self.chapters.get(&spine_index)?.parsed.title.as_deref()
    }

    /// Offsets of loaded chapters in spine order, with reserved placeholders
    /// taking their space, plus the total extent.
    fn offsets(&self) -> (Vec<(usize, ChapterGeometry)>, f64) {
        let Some(grid) = self.grid.as_ref() else {
            return (Vec::new(), 0.0);
        };
        let mut by_index: BTreeMap<usize, Option<f64>> = self
            .chapters
            .iter()
            .map(|(index, chapter)| (*index, Some(grid.extent(chapter.lines.len()))))
            .collect();
        if grid.mode == LayoutMode::Scrolled {
            for index in self.reserved.keys() {
                by_index.entry(*index).or_insert(None);
            }
        }

        let mut cursor = 0.0;
        let mut out = Vec::with_capacity(self.chapters.len());
        for (index, extent) in by_index {
            match extent {
                Some(extent) => {
                    out.push((
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

    fn chapter(&self, handle: ContentHandle) -> Option<&GridChapter> {
        self.chapters.get(self.handles.get(&handle)?)
    }

    /// Origin of a chapter on the surface, in content space.
    fn chapter_origin(&self, grid: &Grid, index: usize) -> Option<(f64, f64)> {
        let (offsets, _) = self.offsets();
        let geometry = offsets.iter().find(|(i, _)| *i == index)?.1;
        Some(match grid.mode {
            LayoutMode::Paginated => (geometry.offset, 0.0),
            LayoutMode::Scrolled => (0.0, geometry.offset),
        })
    }

    fn relayout(&mut self) {
        let Some(grid) = self.grid else {
            return;
        };
        for chapter in self.chapters.values_mut() {
            chapter.lines = grid.wrap(&chapter.parsed, &chapter.text);
        }
    }

    /// Lines inside the viewport at the current transform.
    pub fn visible_runs(&self) -> Vec<TextRun> {
        let Some(grid) = self.grid.as_ref() else {
            return Vec::new();
        };
        let applied = self.applied_offset();
        let (offsets, _) = self.offsets();
        let mut runs = Vec::new();
        for (index, geometry) in offsets {
            let visible = match grid.mode {
                LayoutMode::Paginated => {
                    geometry.offset < self.position + grid.viewport_width
                        && geometry.end() > self.position
                }
                LayoutMode::Scrolled => {
                    geometry.offset < self.position + grid.viewport_height
                        && geometry.end() > self.position
                }
            };
            let Some(chapter) = self.chapters.get(&index).filter(|_| visible) else {
                continue;
            };
            let (origin_x, origin_y) = match grid.mode {
                LayoutMode::Paginated => (geometry.offset, 0.0),
                LayoutMode::Scrolled => (0.0, geometry.offset),
            };
            for (line_index, line) in chapter.lines.iter().enumerate() {
                if line.start == line.end {
                    continue;
                }
                let (x, y) = grid.cell_origin(line_index, 0);
                let x = x + origin_x + applied.x;
                let y = y + origin_y + applied.y;
                let inside = x >= -1e-6
                    && x < grid.viewport_width
                    && y >= -1e-6
                    && y + grid.line_height <= grid.viewport_height + 1e-6;
                if inside {
                    runs.push(TextRun {
                        spine_index: index,
                        start: line.start,
                        x,
                        y,
                        text: chapter.text[line.start..line.end].iter().collect(),
                    });
                }
            }
        }
        runs
    }
}

impl ContentSurface for TextGridSurface {
    fn set_layout(&mut self, layout: &SurfaceLayout) {
        let next = Grid::from_layout(layout);
        if let (Some(current), Some(next)) = (self.grid.as_ref(), next.as_ref()) {
            if current.mode != next.mode {
                self.reserved.clear();
            }
        }
        self.grid = next;
        self.relayout();
        debug!(
            mode = ?layout.mode,
            columns = layout.columns,
            font_size = layout.font_size,
            measurable = self.grid.is_some(),
            "grid layout updated"
        );
    }

    fn materialize(&mut self, index: usize, content: &ChapterContent) -> Result<ContentHandle> {
        let parsed = parse_chapter(&content.markup)
            .with_context(|| format!("failed to lay out chapter {}", content.href))?;
        let text: Vec<char> = parsed.text().chars().collect();
        let lines = self
            .grid
            .map(|grid| grid.wrap(&parsed, &text))
            .unwrap_or_default();

        if let Some(previous) = self.chapters.get(&index) {
            trace!(index = previous.index, "replacing materialized chapter");
            self.handles.retain(|_, i| *i != index);
        }
        self.next_handle += 1;
        let handle = ContentHandle::new(self.next_handle);
        self.reserved.remove(&index);
        self.handles.insert(handle, index);
        self.chapters.insert(
            index,
            GridChapter {
                index,
                parsed,
                text,
                lines,
            },
        );
        Ok(handle)
    }

    fn unmaterialize(&mut self, handle: ContentHandle, placeholder: Placeholder) {
        let Some(index) = self.handles.remove(&handle) else {
            return;
        };
        self.chapters.remove(&index);
        if let Placeholder::Reserved(extent) = placeholder {
            self.reserved.insert(index, extent);
        }
    }

    fn measure(&self, handle: ContentHandle) -> Option<ChapterGeometry> {
        let index = *self.handles.get(&handle)?;
        self.offsets()
            .0
            .into_iter()
            .find(|(i, _)| *i == index)
            .map(|(_, geometry)| geometry)
    }

    fn apply_transform(&mut self, position: f64) {
        self.position = position;
    }

    fn applied_offset(&self) -> Translation {
        match self.grid.as_ref().map(|grid| grid.mode) {
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
        self.grid.as_ref()?;
        Some(self.offsets().1)
    }

    fn viewport_extent(&self) -> Option<f64> {
        let grid = self.grid.as_ref()?;
        Some(match grid.mode {
            LayoutMode::Paginated => grid.viewport_width,
            LayoutMode::Scrolled => grid.viewport_height,
        })
    }

    fn text_content(&self, handle: ContentHandle) -> Option<String> {
        self.chapter(handle).map(|chapter| chapter.text.iter().collect())
    }

    fn resolve_path(&self, handle: ContentHandle, path: &LocationPath) -> Option<ContentRange> {
        let chapter = self.chapter(handle)?;
        let start = chapter.resolve_point(&path.start)?;
        let end = chapter.resolve_point(&path.end)?;
        Some(ContentRange::new(chapter.index, start, end))
    }

    fn path_for_range(&self, handle: ContentHandle, range: &ContentRange) -> Option<LocationPath> {
        let chapter = self.chapter(handle)?;
        if range.end > chapter.text.len() {
            return None;
        }
        Some(LocationPath::new(
            chapter.path_point(range.start)?,
            chapter.path_point(range.end)?,
        ))
    }

    fn resolve_fragment(&self, handle: ContentHandle, fragment: &str) -> Option<ContentRange> {
        let chapter = self.chapter(handle)?;
        let offset = chapter.parsed.anchor(fragment)?;
        Some(ContentRange::new(
            chapter.index,
            offset,
            (offset + 1).min(chapter.text.len()),
        ))
    }

    fn client_rects(&self, handle: ContentHandle, range: &ContentRange) -> Vec<Rect> {
        let (Some(grid), Some(chapter)) = (self.grid.as_ref(), self.chapter(handle)) else {
            return Vec::new();
        };
        let Some((origin_x, origin_y)) = self.chapter_origin(grid, chapter.index) else {
            return Vec::new();
        };
        let applied = self.applied_offset();
        let first = chapter.line_for(range.start).unwrap_or(0);
        chapter.lines[first..]
            .iter()
            .enumerate()
            .take_while(|(_, line)| line.start < range.end)
            .filter_map(|(i, line)| {
                let start = range.start.max(line.start);
                let end = range.end.min(line.end);
                if start >= end {
                    return None;
                }
                let (x, y) = grid.cell_origin(first + i, start - line.start);
                Some(Rect::new(
                    x + origin_x + applied.x,
                    y + origin_y + applied.y,
                    (end - start) as f64 * grid.cell_width,
                    grid.line_height,
                ))
            })
            .collect()
    }
}
