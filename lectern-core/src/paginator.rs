//! Page coordinates over column-laid-out chapters.
//!
//! The surface lays the materialized chapters side by side in columns; a page
//! is one viewport width plus the inter-page gap. Only materialized chapters
//! contribute, so the page space shifts whenever the window changes and the
//! controller re-derives its position by chapter after every window update.

use tracing::{debug, trace};

use crate::config::ColumnMode;
use crate::error::ReaderError;
use crate::surface::{ChapterGeometry, ContentSurface};
use crate::window::ChapterWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePosition {
    pub current_page: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChapterPageInfo {
    pub spine_index: usize,
    pub start_page: usize,
    /// 0-based page within the chapter.
    pub page: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PaginatorState {
    Uninitialized,
    Ready(PagePosition),
}

pub struct Paginator {
    state: PaginatorState,
    column_mode: ColumnMode,
    auto_two_column_min_width: f64,
    page_gap: f64,
    viewport_extent: f64,
    content_extent: f64,
    chapters: Vec<(usize, ChapterGeometry)>,
}

/// `max(1, ceil(content / page_extent))`, or 1 when the content fits.
pub fn count_pages(content_extent: f64, viewport_extent: f64, page_extent: f64) -> usize {
    if content_extent <= viewport_extent || page_extent <= 0.0 {
        return 1;
    }
    ((content_extent / page_extent).ceil() as usize).max(1)
}

impl Paginator {
    pub fn new(column_mode: ColumnMode, page_gap: f64, auto_two_column_min_width: f64) -> Self {
        Self {
            state: PaginatorState::Uninitialized,
            column_mode,
            auto_two_column_min_width,
            page_gap,
            viewport_extent: 0.0,
            content_extent: 0.0,
            chapters: Vec::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, PaginatorState::Ready(_))
    }

    pub fn position(&self) -> Option<PagePosition> {
        match self.state {
            PaginatorState::Ready(position) => Some(position),
            PaginatorState::Uninitialized => None,
        }
    }

    pub fn current_page(&self) -> usize {
        self.position().map(|p| p.current_page).unwrap_or_default()
    }

    pub fn total_pages(&self) -> usize {
        self.position().map(|p| p.total_pages).unwrap_or(1)
    }

    pub fn page_extent(&self) -> f64 {
        self.viewport_extent + self.page_gap
    }

    pub fn viewport_extent(&self) -> f64 {
        self.viewport_extent
    }

    pub fn content_extent(&self) -> f64 {
        self.content_extent
    }

    pub fn column_mode(&self) -> ColumnMode {
        self.column_mode
    }

    pub fn set_column_mode(&mut self, mode: ColumnMode) {
        self.column_mode = mode;
    }

    pub fn set_page_gap(&mut self, gap: f64) {
        self.page_gap = gap.max(0.0);
    }

    pub fn reset(&mut self) {
        self.state = PaginatorState::Uninitialized;
        self.chapters.clear();
    }

    /// Re-measures the surface. The absolute page index is kept and clamped to
    /// the new page count.
    pub fn recalculate(
        &mut self,
        surface: &dyn ContentSurface,
        window: &ChapterWindow,
    ) -> Result<PagePosition, ReaderError> {
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

        let total_pages = count_pages(content, viewport, self.page_extent());
        let current_page = match self.state {
            PaginatorState::Ready(previous) => previous.current_page.min(total_pages - 1),
            PaginatorState::Uninitialized => 0,
        };
        let position = PagePosition {
            current_page,
            total_pages,
        };
        debug!(
            viewport,
            content,
            total_pages,
            current_page,
            chapters = self.chapters.len(),
            "paginator recalculated"
        );
        self.state = PaginatorState::Ready(position);
        Ok(position)
    }

    fn set_current(&mut self, page: usize) -> bool {
        match &mut self.state {
            PaginatorState::Ready(position) => {
                let clamped = page.min(position.total_pages - 1);
                let moved = clamped != position.current_page;
                position.current_page = clamped;
                moved
            }
            PaginatorState::Uninitialized => false,
        }
    }

    /// Returns `false` at the last page; that is the end-of-content signal.
    pub fn next_page(&mut self) -> bool {
        let current = self.current_page();
        self.set_current(current.saturating_add(1))
    }

    /// Returns `false` at page 0.
    pub fn prev_page(&mut self) -> bool {
        match self.current_page().checked_sub(1) {
            Some(page) => self.set_current(page),
            None => false,
        }
    }

    /// Clamps `page` into range and returns the resulting page.
    pub fn go_to_page(&mut self, page: usize) -> usize {
        self.set_current(page);
        self.current_page()
    }

    pub fn go_to_percentage(&mut self, percentage: f64) -> usize {
        let p = if percentage.is_finite() {
            percentage.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let page = (p / 100.0 * self.total_pages() as f64).floor() as usize;
        self.go_to_page(page)
    }

    /// Transform position of a page's left edge.
    pub fn offset_for_page(&self, page: usize) -> f64 {
        page as f64 * self.page_extent()
    }

    pub fn page_for_offset(&self, offset: f64) -> usize {
        let extent = self.page_extent();
        if extent <= 0.0 || offset <= 0.0 {
            return 0;
        }
        ((offset / extent + 1e-6).floor() as usize).min(self.total_pages() - 1)
    }

    fn start_page_of(&self, geometry: &ChapterGeometry) -> usize {
        self.page_for_offset(geometry.offset)
    }

    /// Spine indices of the materialized chapters in layout order.
    pub fn chapters(&self) -> impl Iterator<Item = usize> + '_ {
        self.chapters.iter().map(|(index, _)| *index)
    }

    pub fn chapter_start_page(&self, spine_index: usize) -> Option<usize> {
        self.chapters
            .iter()
            .find(|(index, _)| *index == spine_index)
            .map(|(_, geometry)| self.start_page_of(geometry))
    }

    /// Page number and page count of `global_page` within its chapter. The
    /// chapter ends where the next materialized chapter starts.
    pub fn chapter_page_info(&self, global_page: usize) -> Option<ChapterPageInfo> {
        if !self.is_ready() {
            return None;
        }
        let total_pages = self.total_pages();
        let global_page = global_page.min(total_pages - 1);
        let starts: Vec<(usize, usize)> = self
            .chapters
            .iter()
            .map(|(index, geometry)| (*index, self.start_page_of(geometry)))
            .collect();

        let position = starts
            .iter()
            .rposition(|(_, start)| *start <= global_page)?;
        let (spine_index, start_page) = starts[position];
        let end_page = starts
            .get(position + 1)
            .map(|(_, start)| *start)
            .unwrap_or(total_pages)
            .max(start_page + 1);
        trace!(global_page, spine_index, start_page, end_page, "chapter page info");

        Some(ChapterPageInfo {
            spine_index,
            start_page,
            page: global_page - start_page,
            total: end_page - start_page,
        })
    }

    pub fn chapter_at_page(&self, page: usize) -> Option<usize> {
        self.chapter_page_info(page).map(|info| info.spine_index)
    }

    /// Column count the surface should use while showing `page`. In auto mode
    /// the book's first page is a single-column cover page.
    pub fn required_columns(&self, page: usize) -> u32 {
        match self.column_mode {
            ColumnMode::Single => 1,
            ColumnMode::Double => 2,
            ColumnMode::Auto => {
                let at_cover = page == 0
                    && self
                        .chapters
                        .first()
                        .is_some_and(|(index, _)| *index == 0);
                if at_cover || self.viewport_extent < self.auto_two_column_min_width {
                    1
                } else {
                    2
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;
    use crate::surface::{SurfaceLayout, Viewport};
    use crate::testing::{FakeStore, FakeSurface};
    use crate::window::WindowManager;
    use crate::LayoutMode;

    fn layout(width: f64, columns: u32, gap: f64) -> SurfaceLayout {
        SurfaceLayout {
            mode: LayoutMode::Paginated,
            viewport: Viewport::new(width, 300.0),
            columns,
            font_size: 16.0,
            margin: 0.0,
            column_gap: 0.0,
            page_gap: gap,
        }
    }

    async fn loaded(chapters: usize, target: usize) -> (FakeSurface, WindowManager) {
        let store = FakeStore::arc(chapters);
        let mut surface = FakeSurface::new();
        let mut windows = WindowManager::new(WindowConfig::default());
        windows
            .update(target, LayoutMode::Paginated, &store, &mut surface)
            .await
            .unwrap();
        (surface, windows)
    }

    #[test]
    fn page_count_formula() {
        assert_eq!(count_pages(0.0, 400.0, 420.0), 1);
        assert_eq!(count_pages(400.0, 400.0, 420.0), 1);
        assert_eq!(count_pages(401.0, 400.0, 420.0), 1);
        assert_eq!(count_pages(841.0, 400.0, 420.0), 3);
        for content in [10.0, 999.0, 1260.0, 5000.5] {
            let expected = ((content / 420.0_f64).ceil() as usize).max(1);
            let pages = count_pages(content, 400.0, 420.0);
            assert!(pages == expected || content <= 400.0);
        }
    }

    #[test]
    fn uninitialized_without_measurement() {
        let surface = FakeSurface::unmeasured();
        let mut paginator = Paginator::new(ColumnMode::Single, 0.0, 800.0);
        let err = paginator
            .recalculate(&surface, &ChapterWindow::default())
            .unwrap_err();
        assert!(matches!(err, ReaderError::LayoutUnavailable(_)));
        assert!(!paginator.is_ready());
        assert!(!paginator.next_page());
    }

    #[tokio::test]
    async fn navigation_clamps_and_reports_movement() {
        let (surface, windows) = loaded(3, 0).await;
        let mut paginator = Paginator::new(ColumnMode::Single, 0.0, 800.0);
        let position = paginator.recalculate(&surface, windows.window()).unwrap();
        assert_eq!(position.total_pages, 9);

        assert!(!paginator.prev_page());
        assert!(paginator.next_page());
        assert_eq!(paginator.current_page(), 1);
        assert_eq!(paginator.go_to_page(100), 8);
        assert!(!paginator.next_page());
        assert_eq!(paginator.go_to_page(4), 4);
        assert_eq!(paginator.go_to_page(4), 4);
    }

    #[tokio::test]
    async fn percentage_maps_to_floor() {
        let (surface, windows) = loaded(3, 0).await;
        let mut paginator = Paginator::new(ColumnMode::Single, 0.0, 800.0);
        paginator.recalculate(&surface, windows.window()).unwrap();

        assert_eq!(paginator.go_to_percentage(0.0), 0);
        assert_eq!(paginator.go_to_percentage(50.0), 4);
        assert_eq!(paginator.go_to_percentage(99.0), 8);
        assert_eq!(paginator.go_to_percentage(100.0), 8);
        assert_eq!(paginator.go_to_percentage(-5.0), 0);
    }

    #[tokio::test]
    async fn layout_change_keeps_absolute_page_clamped() {
        let (mut surface, windows) = loaded(10, 0).await;
        let mut paginator = Paginator::new(ColumnMode::Single, 0.0, 800.0);
        let before = paginator.recalculate(&surface, windows.window()).unwrap();
        assert_eq!(before.total_pages, 21);
        paginator.go_to_page(20);

        // doubling the columns halves the pages the chapters need
        surface.set_layout(&layout(400.0, 2, 0.0));
        let after = paginator.recalculate(&surface, windows.window()).unwrap();
        assert_eq!(after.total_pages, 14);
        assert_eq!(after.current_page, 13);

        paginator.go_to_page(5);
        surface.set_layout(&layout(400.0, 1, 0.0));
        let wider = paginator.recalculate(&surface, windows.window()).unwrap();
        assert_eq!(wider.current_page, 5);
    }

    #[tokio::test]
    async fn relayout_clamps_page_fifty_to_last_of_thirty() {
        let store = FakeStore::arc_with_texts(vec!["x".repeat(6000)]);
        let mut surface = FakeSurface::new();
        let mut windows = WindowManager::new(WindowConfig::default());
        windows
            .update(0, LayoutMode::Paginated, &store, &mut surface)
            .await
            .unwrap();
        let mut paginator = Paginator::new(ColumnMode::Single, 0.0, 800.0);
        assert_eq!(paginator.recalculate(&surface, windows.window()).unwrap().total_pages, 60);
        assert_eq!(paginator.go_to_page(50), 50);

        surface.set_layout(&layout(400.0, 2, 0.0));
        let after = paginator.recalculate(&surface, windows.window()).unwrap();
        assert_eq!(
            after,
            PagePosition {
                current_page: 29,
                total_pages: 30
            }
        );
        assert!(!paginator.next_page());
        assert_eq!(paginator.offset_for_page(29), 29.0 * 400.0);
    }

    #[tokio::test]
    async fn page_gap_widens_page_extent() {
        let (mut surface, windows) = loaded(1, 0).await;
        surface.set_layout(&layout(400.0, 1, 20.0));
        let mut paginator = Paginator::new(ColumnMode::Single, 20.0, 800.0);
        let position = paginator.recalculate(&surface, windows.window()).unwrap();
        assert_eq!(paginator.page_extent(), 420.0);
        assert_eq!(position.total_pages, 3);
        assert_eq!(paginator.offset_for_page(2), 840.0);
    }

    #[tokio::test]
    async fn chapter_page_info_uses_next_loaded_chapter() {
        let (surface, windows) = loaded(10, 0).await;
        let mut paginator = Paginator::new(ColumnMode::Single, 0.0, 800.0);
        paginator.recalculate(&surface, windows.window()).unwrap();

        let info = paginator.chapter_page_info(4).unwrap();
        assert_eq!(info.spine_index, 1);
        assert_eq!(info.start_page, 3);
        assert_eq!(info.page, 1);
        assert_eq!(info.total, 3);

        let last = paginator.chapter_page_info(20).unwrap();
        assert_eq!(last.spine_index, 6);
        assert_eq!(last.page, 2);
        assert_eq!(paginator.chapter_start_page(6), Some(18));
        assert_eq!(paginator.chapter_start_page(8), None);
    }

    #[tokio::test]
    async fn auto_columns_single_on_cover_only() {
        let (mut surface, windows) = loaded(4, 0).await;
        surface.set_layout(&layout(1000.0, 1, 0.0));
        let mut paginator = Paginator::new(ColumnMode::Auto, 0.0, 800.0);
        paginator.recalculate(&surface, windows.window()).unwrap();

        assert_eq!(paginator.required_columns(0), 1);
        assert_eq!(paginator.required_columns(1), 2);

        surface.set_layout(&layout(600.0, 1, 0.0));
        paginator.recalculate(&surface, windows.window()).unwrap();
        assert_eq!(paginator.required_columns(3), 1);
    }
}
