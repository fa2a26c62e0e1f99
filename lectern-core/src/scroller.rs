//! Continuous vertical position tracking for scrolled mode.

use tracing::debug;

use crate::error::ReaderError;
use crate::surface::{ChapterGeometry, ContentSurface};
use crate::window::{ChapterWindow, Direction};

#[derive(Debug, Default)]
pub struct Scroller {
    ready: bool,
    offset: f64,
    viewport_extent: f64,
    content_extent: f64,
    chapters: Vec<(usize, ChapterGeometry)>,
    last_direction: Direction,
}

impl Scroller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn viewport_extent(&self) -> f64 {
        self.viewport_extent
    }

    pub fn content_extent(&self) -> f64 {
        self.content_extent
    }

    pub fn max_offset(&self) -> f64 {
        (self.content_extent - self.viewport_extent).max(0.0)
    }

    pub fn last_direction(&self) -> Direction {
        self.last_direction
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn recalculate(
        &mut self,
        surface: &dyn ContentSurface,
        window: &ChapterWindow,
    ) -> Result<f64, ReaderError> {
        let viewport = surface
            .viewport_extent()
            .filter(|v| *v > 0.0)
            .ok_or(ReaderError::LayoutUnavailable("viewport has no size"))?;
        let content = surface
            .total_scroll_extent()
            .ok_or(ReaderError::LayoutUnavailable("content extent unknown"))?;
        self.viewport_extent = viewport;
        self.content_extent = content;
        self.chapters = window
            .handles()
            .filter_map(|(index, handle)| surface.measure(handle).map(|g| (index, g)))
            .collect();
        self.chapters
            .sort_by(|a, b| a.1.offset.total_cmp(&b.1.offset).then(a.0.cmp(&b.0)));
        self.offset = self.offset.clamp(0.0, self.max_offset());
        self.ready = true;
        debug!(viewport, content, offset = self.offset, "scroller recalculated");
        Ok(self.offset)
    }

    /// Returns whether the offset changed.
    pub fn scroll_by(&mut self, delta: f64) -> bool {
        let before = self.offset;
        self.scroll_to(before + delta);
        self.offset != before
    }

    pub fn scroll_to(&mut self, offset: f64) -> f64 {
        let target = if offset.is_finite() { offset } else { 0.0 };
        let clamped = target.clamp(0.0, self.max_offset());
        self.last_direction = if clamped > self.offset {
            Direction::Forward
        } else if clamped < self.offset {
            Direction::Backward
        } else {
            self.last_direction
        };
        self.offset = clamped;
        clamped
    }

    /// Scroll position as a percentage of the scrollable range.
    pub fn percentage(&self) -> f64 {
        let max = self.max_offset();
        if max <= 0.0 {
            0.0
        } else {
            self.offset / max * 100.0
        }
    }

    pub fn go_to_percentage(&mut self, percentage: f64) -> f64 {
        let p = if percentage.is_finite() {
            percentage.clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.scroll_to(p / 100.0 * self.max_offset())
    }

    /// Chapter under the top edge of the viewport. Reserved placeholders are
    /// not materialized, so an offset inside one maps to the nearest loaded
    /// chapter above it.
    pub fn chapter_at_offset(&self, offset: f64) -> Option<usize> {
        self.chapters
            .iter()
            .rev()
            .find(|(_, geometry)| geometry.offset <= offset + 1e-6)
            .or_else(|| self.chapters.first())
            .map(|(index, _)| *index)
    }

    pub fn current_chapter(&self) -> Option<usize> {
        self.chapter_at_offset(self.offset)
    }

    pub fn chapter_geometry(&self, spine_index: usize) -> Option<ChapterGeometry> {
        self.chapters
            .iter()
            .find(|(index, _)| *index == spine_index)
            .map(|(_, geometry)| *geometry)
    }

    /// Fraction of `spine_index` scrolled past, in `[0, 1]`.
    pub fn chapter_progress(&self, spine_index: usize) -> Option<f64> {
        let geometry = self.chapter_geometry(spine_index)?;
        if geometry.extent <= 0.0 {
            return Some(0.0);
        }
        Some(((self.offset - geometry.offset) / geometry.extent).clamp(0.0, 1.0))
    }

    pub fn offset_for_chapter(&self, spine_index: usize, fraction: f64) -> Option<f64> {
        let geometry = self.chapter_geometry(spine_index)?;
        Some(geometry.offset + geometry.extent * fraction.clamp(0.0, 1.0))
    }
}
