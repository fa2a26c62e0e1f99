//! Top-level reading state machine.
//!
//! Owns the chapter window, the paginator/scroller pair and the gesture
//! engine, and is the only writer of the current spine index. Navigation
//! always brings the target's window onto the surface first and positions
//! within it afterwards.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::anchor::{
    AnchorScheduler, AnchorTrigger, AnchoredHighlight, Annotation, AnnotationSelector,
    HighlightAnchor,
};
use crate::config::{ColumnMode, LayoutConfig, ReaderConfig};
use crate::error::ReaderError;
use crate::gesture::{GestureEngine, GestureTick, PageGeometry};
use crate::location::{Cfi, LocationPath};
use crate::paginator::Paginator;
use crate::scroller::Scroller;
use crate::state::{PersistedReadingState, StateStore};
use crate::surface::{BookProvider, ChapterStore, ContentHandle, ContentSurface, Viewport};
use crate::window::{LoadingFlag, WindowManager};
use crate::{split_fragment, BookInfo, ContentRange, LayoutMode, Location, ReaderEvent, Rect};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    NextPage { count: usize },
    PrevPage { count: usize },
    GotoPage { page: usize },
    GotoPercentage { percentage: f64 },
    GotoSpineIndex { index: usize },
    GotoHref { href: String },
    GotoCfi { cfi: String },
    SetMode { mode: LayoutMode },
    ToggleMode,
    ScaleFont { factor: f64 },
    SetFontSize { size: f64 },
    SetColumns { columns: ColumnMode },
    CycleColumns,
    Resize { width: f64, height: f64 },
    ScrollBy { delta: f64 },
    Drag { delta: f64 },
    CancelGesture,
}

/// Where to land inside a chapter once its window is loaded.
#[derive(Debug, Clone, PartialEq)]
enum ChapterTarget {
    Start,
    End,
    Page(usize),
    Fraction(f64),
    Fragment(String),
    Path(LocationPath),
}

const FONT_SIZE_RANGE: (f64, f64) = (8.0, 72.0);

pub struct ReaderController<S: ContentSurface> {
    surface: S,
    state_store: Arc<dyn StateStore>,
    store: Option<Arc<dyn ChapterStore>>,
    layout: LayoutConfig,
    columns: u32,
    windows: WindowManager,
    paginator: Paginator,
    scroller: Scroller,
    gestures: GestureEngine,
    anchor: HighlightAnchor,
    scheduler: AnchorScheduler,
    spine_index: usize,
    annotations: Vec<Annotation>,
    highlights: Vec<AnchoredHighlight>,
    events: Arc<Mutex<Vec<ReaderEvent>>>,
    needs_layout: bool,
    pending_target: Option<(usize, ChapterTarget)>,
    scroll_dirty: bool,
}

impl<S: ContentSurface> ReaderController<S> {
    pub fn new(config: ReaderConfig, surface: S, state_store: Arc<dyn StateStore>) -> Self {
        let layout = config.layout.clone();
        Self {
            surface,
            state_store,
            store: None,
            columns: fixed_columns(layout.columns),
            paginator: Paginator::new(
                layout.columns,
                layout.page_gap,
                layout.auto_two_column_min_width,
            ),
            layout,
            windows: WindowManager::new(config.window),
            scroller: Scroller::new(),
            gestures: GestureEngine::new(config.gesture),
            anchor: HighlightAnchor::new(config.anchor.clone()),
            scheduler: AnchorScheduler::new(config.anchor),
            spine_index: 0,
            annotations: Vec::new(),
            highlights: Vec::new(),
            events: Arc::new(Mutex::new(Vec::new())),
            needs_layout: false,
            pending_target: None,
            scroll_dirty: false,
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ReaderEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn drain_events(&self) -> Vec<ReaderEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn book(&self) -> Option<&BookInfo> {
        self.store.as_deref().map(|store| store.info())
    }

    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    pub fn mode(&self) -> LayoutMode {
        self.layout.mode
    }

    pub fn layout(&self) -> &LayoutConfig {
        &self.layout
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn spine_index(&self) -> usize {
        self.spine_index
    }

    pub fn windows(&self) -> &WindowManager {
        &self.windows
    }

    pub fn loading_flag(&self) -> LoadingFlag {
        self.windows.loading_flag()
    }

    pub fn paginator(&self) -> &Paginator {
        &self.paginator
    }

    pub fn scroller(&self) -> &Scroller {
        &self.scroller
    }

    pub fn gestures(&self) -> &GestureEngine {
        &self.gestures
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn highlights(&self) -> &[AnchoredHighlight] {
        &self.highlights
    }

    /// Current surface offset along the layout axis.
    pub fn transform(&self) -> f64 {
        match self.layout.mode {
            LayoutMode::Paginated if self.gestures.is_busy() => self.gestures.transform(),
            LayoutMode::Paginated => self.paginator.offset_for_page(self.paginator.current_page()),
            LayoutMode::Scrolled => self.scroller.offset(),
        }
    }

    fn emit(&self, event: ReaderEvent) {
        self.events.lock().push(event);
    }

    fn report(&self, err: &ReaderError) {
        self.emit(ReaderEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    fn store(&self) -> Result<Arc<dyn ChapterStore>, ReaderError> {
        self.store.clone().ok_or(ReaderError::NotOpen)
    }

    fn chapter_count(&self) -> usize {
        self.book().map_or(0, BookInfo::chapter_count)
    }

    #[instrument(skip(self, provider))]
    pub async fn open_with<P: BookProvider>(
        &mut self,
        provider: &P,
        path: &Path,
    ) -> Result<(), ReaderError> {
        let store = provider
            .open(path)
            .await
            .map_err(|err| ReaderError::Open(format!("{err:#}")))?;
        self.open(store).await
    }

    /// Opens a book and restores its persisted position, mode and annotations.
    pub async fn open(&mut self, store: Arc<dyn ChapterStore>) -> Result<(), ReaderError> {
        if self.store.is_some() {
            self.close()?;
        }
        let persisted = self
            .state_store
            .load(store.info())
            .map_err(|err| ReaderError::State(format!("{err:#}")))?;
        info!(
            book = %store.info().id,
            chapters = store.info().chapter_count(),
            restored = persisted.is_some(),
            "opening book"
        );
        self.store = Some(store);

        let (spine, target) = match persisted {
            Some(state) => {
                self.layout.mode = state.mode;
                if let Some(size) = state.font_size {
                    self.layout.font_size = size;
                }
                if let Some(columns) = state.columns {
                    self.layout.columns = columns;
                }
                self.annotations = state.annotations;
                let count = self.chapter_count().max(1);
                let spine = state.spine_index.min(count - 1);
                let fraction = (state.percentage / 100.0 * count as f64 - spine as f64).clamp(0.0, 1.0);
                let saved_path = state
                    .cfi
                    .as_deref()
                    .and_then(|cfi| cfi.parse::<Cfi>().ok())
                    .filter(|cfi| cfi.spine_index == spine)
                    .and_then(|cfi| cfi.path);
                let target = match saved_path {
                    Some(path) => ChapterTarget::Path(path),
                    None => ChapterTarget::Fraction(fraction),
                };
                (spine, target)
            }
            None => (0, ChapterTarget::Start),
        };
        self.paginator.set_column_mode(self.layout.columns);
        self.columns = match self.layout.mode {
            LayoutMode::Paginated => fixed_columns(self.layout.columns),
            LayoutMode::Scrolled => 1,
        };
        self.push_layout();
        self.navigate(spine, target).await?;
        Ok(())
    }

    /// Snapshot of what gets persisted for the open book.
    pub fn snapshot(&self) -> PersistedReadingState {
        PersistedReadingState {
            mode: self.layout.mode,
            spine_index: self.spine_index,
            cfi: self.reading_cfi().map(|cfi| cfi.to_string()),
            percentage: self.book_percentage(),
            font_size: Some(self.layout.font_size),
            columns: Some(self.layout.columns),
            annotations: self.annotations.clone(),
        }
    }

    /// Location of the first character on screen in the current chapter.
    pub fn reading_cfi(&self) -> Option<Cfi> {
        let spine = self.spine_index;
        let handle = self.windows.window().handle(spine)?;
        let len = self.surface.text_content(handle)?.chars().count();
        let (edge, horizontal) = match self.layout.mode {
            LayoutMode::Paginated if self.paginator.is_ready() => (
                self.paginator.offset_for_page(self.paginator.current_page()),
                true,
            ),
            LayoutMode::Scrolled if self.scroller.is_ready() => (self.scroller.offset(), false),
            _ => return None,
        };
        // characters before the screen edge precede every character on it
        let on_screen = |offset: usize| {
            self.range_origin(handle, ContentRange::new(spine, offset, offset))
                .is_some_and(|origin| {
                    let lead = if horizontal { origin.x } else { origin.y };
                    lead >= edge - 0.5
                })
        };
        let (mut low, mut high) = (0, len);
        while low < high {
            let mid = low + (high - low) / 2;
            if on_screen(mid) {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        let path = self
            .surface
            .path_for_range(handle, &ContentRange::new(spine, low, low))?;
        Some(Cfi::new(spine, Some(path)))
    }

    pub fn persist(&self) -> Result<(), ReaderError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        self.state_store
            .save(store.info(), &self.snapshot())
            .map_err(|err| ReaderError::State(format!("{err:#}")))
    }

    pub fn close(&mut self) -> Result<(), ReaderError> {
        if self.store.is_none() {
            return Ok(());
        }
        let saved = self.persist();
        self.gestures.cancel();
        self.scheduler.cancel();
        let unloaded = self.windows.unload_all(&mut self.surface);
        self.paginator.reset();
        self.scroller.reset();
        self.highlights.clear();
        self.annotations.clear();
        self.pending_target = None;
        self.spine_index = 0;
        self.store = None;
        info!(unloaded = unloaded.len(), "book closed");
        saved
    }

    pub async fn apply(&mut self, command: Command) -> Result<bool, ReaderError> {
        match command {
            Command::NextPage { count } => self.next_page(count).await,
            Command::PrevPage { count } => self.prev_page(count).await,
            Command::GotoPage { page } => self.goto_page(page).await,
            Command::GotoPercentage { percentage } => self.goto_percentage(percentage).await,
            Command::GotoSpineIndex { index } => self.goto_spine_index(index).await,
            Command::GotoHref { href } => self.goto_href(&href).await,
            Command::GotoCfi { cfi } => self.goto_cfi(&cfi).await,
            Command::SetMode { mode } => self.set_mode(mode).await,
            Command::ToggleMode => self.set_mode(self.layout.mode.toggled()).await,
            Command::ScaleFont { factor } => Ok(self.set_font_size(self.layout.font_size * factor)),
            Command::SetFontSize { size } => Ok(self.set_font_size(size)),
            Command::SetColumns { columns } => Ok(self.set_columns(columns)),
            Command::CycleColumns => {
                let next = match self.layout.columns {
                    ColumnMode::Auto => ColumnMode::Single,
                    ColumnMode::Single => ColumnMode::Double,
                    ColumnMode::Double => ColumnMode::Auto,
                };
                Ok(self.set_columns(next))
            }
            Command::Resize { width, height } => Ok(self.resize(width, height)),
            Command::ScrollBy { delta } => self.scroll_by(delta).await,
            Command::Drag { delta } => Ok(self.drag(delta, Instant::now())),
            Command::CancelGesture => Ok(self.cancel_gesture()),
        }
    }

    #[instrument(skip(self))]
    pub async fn goto_spine_index(&mut self, index: usize) -> Result<bool, ReaderError> {
        let count = self.chapter_count();
        if count == 0 {
            return Ok(false);
        }
        if index >= count {
            let err = ReaderError::InvalidTarget(format!("spine index {index} of {count}"));
            debug!(%err, "clamping");
        }
        self.navigate(index.min(count - 1), ChapterTarget::Start).await
    }

    #[instrument(skip(self))]
    pub async fn goto_href(&mut self, href: &str) -> Result<bool, ReaderError> {
        let spine = self
            .book()
            .ok_or(ReaderError::NotOpen)?
            .spine_index_for_href(href)
            .ok_or_else(|| ReaderError::InvalidTarget(format!("no spine item for `{href}`")))?;
        let target = match split_fragment(href).1 {
            Some(fragment) => ChapterTarget::Fragment(fragment.to_string()),
            None => ChapterTarget::Start,
        };
        self.navigate(spine, target).await
    }

    #[instrument(skip(self))]
    pub async fn goto_cfi(&mut self, cfi: &str) -> Result<bool, ReaderError> {
        let cfi: Cfi = cfi.parse()?;
        let count = self.chapter_count();
        if count == 0 {
            return Ok(false);
        }
        let target = match cfi.path {
            Some(path) => ChapterTarget::Path(path),
            None => ChapterTarget::Start,
        };
        self.navigate(cfi.spine_index.min(count - 1), target).await
    }

    /// Book-wide percentage: the integer part of `p / 100 * chapters` picks the
    /// chapter and the remainder the position inside it.
    #[instrument(skip(self))]
    pub async fn goto_percentage(&mut self, percentage: f64) -> Result<bool, ReaderError> {
        let count = self.chapter_count();
        if count == 0 {
            return Ok(false);
        }
        let p = if percentage.is_finite() {
            percentage.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let position = p / 100.0 * count as f64;
        let spine = (position.floor() as usize).min(count - 1);
        let fraction = (position - spine as f64).clamp(0.0, 1.0);
        self.navigate(spine, ChapterTarget::Fraction(fraction)).await
    }

    /// Absolute page within the materialized content. Paginated mode only.
    pub async fn goto_page(&mut self, page: usize) -> Result<bool, ReaderError> {
        if self.layout.mode != LayoutMode::Paginated || !self.paginator.is_ready() {
            return Ok(false);
        }
        self.cancel_gesture();
        self.show_page(page).await
    }

    pub async fn next_page(&mut self, count: usize) -> Result<bool, ReaderError> {
        let mut moved = false;
        for _ in 0..count.max(1) {
            let step = match self.layout.mode {
                LayoutMode::Paginated => self.step_paginated(true).await?,
                LayoutMode::Scrolled => self.step_scrolled(true).await?,
            };
            if !step {
                break;
            }
            moved = true;
        }
        Ok(moved)
    }

    pub async fn prev_page(&mut self, count: usize) -> Result<bool, ReaderError> {
        let mut moved = false;
        for _ in 0..count.max(1) {
            let step = match self.layout.mode {
                LayoutMode::Paginated => self.step_paginated(false).await?,
                LayoutMode::Scrolled => self.step_scrolled(false).await?,
            };
            if !step {
                break;
            }
            moved = true;
        }
        Ok(moved)
    }

    async fn step_paginated(&mut self, forward: bool) -> Result<bool, ReaderError> {
        if !self.paginator.is_ready() {
            return Ok(false);
        }
        self.cancel_gesture();
        let current = self.paginator.current_page();
        let chapter = self
            .paginator
            .chapter_at_page(current)
            .unwrap_or(self.spine_index);
        let neighbour = if forward {
            Some(current + 1).filter(|page| *page < self.paginator.total_pages())
        } else {
            current.checked_sub(1)
        };
        let adjacent = |spine: usize| {
            spine == chapter
                || if forward {
                    spine == chapter + 1
                } else {
                    spine + 1 == chapter
                }
        };
        if let Some(page) = neighbour {
            if self.paginator.chapter_at_page(page).is_some_and(adjacent) {
                return self.show_page(page).await;
            }
        }
        // Edge of the materialized content, or a gap left by a failed load.
        self.step_into_chapter(chapter, forward).await
    }

    /// Navigates to the first chapter past `from` that materializes.
    async fn step_into_chapter(&mut self, from: usize, forward: bool) -> Result<bool, ReaderError> {
        let candidates: Vec<usize> = if forward {
            (from + 1..self.chapter_count()).collect()
        } else {
            (0..from).rev().collect()
        };
        let target = if forward {
            ChapterTarget::Start
        } else {
            ChapterTarget::End
        };
        for spine in candidates {
            self.navigate(spine, target.clone()).await?;
            if self.windows.window().is_loaded(spine) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn step_scrolled(&mut self, forward: bool) -> Result<bool, ReaderError> {
        if !self.scroller.is_ready() {
            return Ok(false);
        }
        let page = self.scroller.viewport_extent();
        self.scroll_by(if forward { page } else { -page }).await
    }

    /// Scrolled mode only; at either end of the loaded content the adjacent
    /// chapter is brought in.
    pub async fn scroll_by(&mut self, delta: f64) -> Result<bool, ReaderError> {
        if self.layout.mode != LayoutMode::Scrolled || !self.scroller.is_ready() {
            return Ok(false);
        }
        if self.scroller.scroll_by(delta) {
            self.surface.apply_transform(self.scroller.offset());
            self.follow_scroll().await?;
            return Ok(true);
        }
        let loaded: Vec<usize> = self.windows.window().loaded_indices().collect();
        let beyond = if delta > 0.0 {
            loaded
                .last()
                .map(|last| last + 1)
                .filter(|next| *next < self.chapter_count())
        } else {
            loaded.first().and_then(|first| first.checked_sub(1))
        };
        match beyond {
            Some(spine) => {
                let target = if delta > 0.0 {
                    ChapterTarget::Start
                } else {
                    ChapterTarget::End
                };
                self.navigate(spine, target).await
            }
            None => Ok(false),
        }
    }

    /// Re-centres the window when scrolling has crossed into another chapter.
    async fn follow_scroll(&mut self) -> Result<bool, ReaderError> {
        let Some(chapter) = self.scroller.current_chapter() else {
            return Ok(false);
        };
        if chapter != self.spine_index {
            let progress = self.scroller.chapter_progress(chapter).unwrap_or_default();
            self.spine_index = chapter;
            self.load_around(chapter).await?;
            self.position_at(chapter, &ChapterTarget::Fraction(progress));
        }
        self.relocated();
        self.scheduler.request(AnchorTrigger::PageTurn, Instant::now());
        Ok(true)
    }

    /// Feeds drag/wheel input. Paginated mode drives the gesture engine and
    /// leaves the surface to the next `poll`, so inputs within one frame
    /// coalesce; scrolled mode scrolls directly.
    pub fn drag(&mut self, delta: f64, now: Instant) -> bool {
        match self.layout.mode {
            LayoutMode::Paginated => {
                let Some(position) = self.paginator.position() else {
                    return false;
                };
                let geometry = PageGeometry {
                    page_extent: self.paginator.page_extent(),
                    viewport_extent: self.paginator.viewport_extent(),
                    total_extent: self.paginator.content_extent(),
                    current_page: position.current_page,
                    total_pages: position.total_pages,
                };
                self.gestures.on_input(delta, now, geometry);
                self.gestures.frame_pending()
            }
            LayoutMode::Scrolled => {
                if !self.scroller.is_ready() || !self.scroller.scroll_by(-delta) {
                    return false;
                }
                self.surface.apply_transform(self.scroller.offset());
                self.scroll_dirty = true;
                true
            }
        }
    }

    /// Stops any gesture animation and leaves the surface on its page.
    pub fn cancel_gesture(&mut self) -> bool {
        if !self.gestures.cancel() {
            return false;
        }
        if self.layout.mode == LayoutMode::Paginated {
            self.align_paginated();
        }
        true
    }

    /// Drives timers: gesture idle/momentum/snap, deferred layout, scroll
    /// tracking and debounced re-anchoring. Returns whether a redraw is due.
    pub async fn poll(&mut self, now: Instant) -> Result<bool, ReaderError> {
        let mut changed = false;

        if self.needs_layout {
            changed |= self.recalculate();
        }
        changed |= self.apply_pending();

        match self.gestures.tick(now) {
            GestureTick::Idle => {}
            GestureTick::Animating => changed |= self.gestures.on_animation_frame(&mut self.surface),
            GestureTick::Settled { page } => {
                self.gestures.on_animation_frame(&mut self.surface);
                self.show_page(page).await?;
                changed = true;
            }
        }

        if self.scroll_dirty {
            self.scroll_dirty = false;
            changed |= self.follow_scroll().await?;
        }

        if let Some(trigger) = self.scheduler.take_due(now) {
            debug!(?trigger, "re-anchoring");
            self.reanchor();
            changed = true;
        }
        Ok(changed)
    }

    /// Switches layout mode, carrying the reading position over as a
    /// book-wide percentage.
    #[instrument(skip(self))]
    pub async fn set_mode(&mut self, mode: LayoutMode) -> Result<bool, ReaderError> {
        if mode == self.layout.mode {
            return Ok(false);
        }
        let percentage = self.book_percentage();
        self.gestures.cancel();
        self.windows.unload_all(&mut self.surface);
        self.paginator.reset();
        self.scroller.reset();
        self.layout.mode = mode;
        self.columns = match mode {
            LayoutMode::Paginated => fixed_columns(self.layout.columns),
            LayoutMode::Scrolled => 1,
        };
        self.push_layout();
        info!(?mode, percentage, "layout mode changed");
        if self.store.is_none() {
            return Ok(true);
        }
        self.goto_percentage(percentage).await?;
        Ok(true)
    }

    pub fn resize(&mut self, width: f64, height: f64) -> bool {
        let viewport = Viewport::new(width, height);
        if viewport == self.layout.viewport {
            return false;
        }
        self.layout.viewport = viewport;
        self.relayout(AnchorTrigger::Resize);
        true
    }

    pub fn set_font_size(&mut self, size: f64) -> bool {
        let size = size.clamp(FONT_SIZE_RANGE.0, FONT_SIZE_RANGE.1);
        if (size - self.layout.font_size).abs() < f64::EPSILON {
            return false;
        }
        self.layout.font_size = size;
        self.relayout(AnchorTrigger::LayoutChange);
        true
    }

    pub fn set_margin(&mut self, margin: f64) -> bool {
        let margin = margin.max(0.0);
        if (margin - self.layout.margin).abs() < f64::EPSILON {
            return false;
        }
        self.layout.margin = margin;
        self.relayout(AnchorTrigger::LayoutChange);
        true
    }

    pub fn set_columns(&mut self, columns: ColumnMode) -> bool {
        if columns == self.layout.columns {
            return false;
        }
        self.layout.columns = columns;
        self.paginator.set_column_mode(columns);
        if self.layout.mode == LayoutMode::Paginated {
            self.columns = fixed_columns(columns);
        }
        self.relayout(AnchorTrigger::LayoutChange);
        true
    }

    /// Reflows after a layout-affecting change. The absolute page (or scroll
    /// offset) is kept, clamped to the new extent.
    fn relayout(&mut self, trigger: AnchorTrigger) {
        let was_busy = self.gestures.cancel();
        self.push_layout();
        if !self.recalculate() {
            return;
        }
        if self.apply_pending() {
            self.scheduler.request(trigger, Instant::now());
            return;
        }
        if self.layout.mode == LayoutMode::Paginated {
            self.sync_columns_for(self.paginator.current_page());
        }
        self.align();
        if let Some(spine) = self.derived_spine() {
            self.spine_index = spine;
        }
        debug!(?trigger, was_busy, "relayout");
        self.relocated();
        self.scheduler.request(trigger, Instant::now());
    }

    /// Builds a selector for a live selection and emits `Selected`.
    pub fn select(&mut self, range: ContentRange) -> Result<AnnotationSelector, ReaderError> {
        let handle = self.windows.window().handle(range.spine_index).ok_or_else(|| {
            ReaderError::InvalidTarget(format!("chapter {} is not loaded", range.spine_index))
        })?;
        let selector = self
            .anchor
            .describe_range(&self.surface, handle, &range)
            .ok_or_else(|| ReaderError::InvalidTarget(format!("selection {range:?}")))?;
        let position = self
            .anchor
            .rects_for(&self.surface, handle, &range)
            .into_iter()
            .reduce(|acc, rect| acc.union(&rect))
            .unwrap_or_default();
        let location = Cfi::new(range.spine_index, Some(selector.path.clone())).to_string();
        self.emit(ReaderEvent::Selected {
            text: selector.quote.exact.clone(),
            location,
            position,
        });
        Ok(selector)
    }

    pub fn add_annotation(&mut self, annotation: Annotation) -> &[AnchoredHighlight] {
        self.annotations.retain(|existing| existing.id != annotation.id);
        self.annotations.push(annotation);
        self.reanchor()
    }

    pub fn remove_annotation(&mut self, id: &str) -> bool {
        let before = self.annotations.len();
        self.annotations.retain(|annotation| annotation.id != id);
        self.highlights.retain(|highlight| highlight.id != id);
        self.annotations.len() != before
    }

    /// Re-resolves every annotation against the chapters on the surface.
    pub fn reanchor(&mut self) -> &[AnchoredHighlight] {
        self.highlights = self
            .anchor
            .anchor_all(&self.annotations, self.windows.window(), &self.surface);
        &self.highlights
    }

    pub fn location(&self) -> Option<Location> {
        match self.layout.mode {
            LayoutMode::Paginated => {
                let position = self.paginator.position()?;
                let info = self.paginator.chapter_page_info(position.current_page)?;
                Some(Location {
                    spine_index: info.spine_index,
                    percentage: self.book_percentage(),
                    page_in_chapter: info.page,
                    total_pages_in_chapter: info.total,
                    page_in_book: position.current_page,
                    total_pages_in_book: position.total_pages,
                })
            }
            LayoutMode::Scrolled => {
                if !self.scroller.is_ready() {
                    return None;
                }
                let viewport = self.scroller.viewport_extent();
                let spine = self.scroller.current_chapter()?;
                let geometry = self.scroller.chapter_geometry(spine)?;
                let chapter_pages = pages_in(geometry.extent, viewport);
                let book_pages = pages_in(self.scroller.content_extent(), viewport);
                let offset = self.scroller.offset();
                Some(Location {
                    spine_index: spine,
                    percentage: self.book_percentage(),
                    page_in_chapter: (((offset - geometry.offset).max(0.0) / viewport) as usize)
                        .min(chapter_pages - 1),
                    total_pages_in_chapter: chapter_pages,
                    page_in_book: ((offset / viewport) as usize).min(book_pages - 1),
                    total_pages_in_book: book_pages,
                })
            }
        }
    }

    /// Reading progress through the whole book, in `[0, 100]`.
    pub fn book_percentage(&self) -> f64 {
        let count = self.chapter_count();
        if count == 0 {
            return 0.0;
        }
        let fraction = match self.layout.mode {
            LayoutMode::Paginated => self
                .paginator
                .chapter_page_info(self.paginator.current_page())
                .filter(|info| info.spine_index == self.spine_index)
                .map_or(0.0, |info| info.page as f64 / info.total as f64),
            LayoutMode::Scrolled => self
                .scroller
                .chapter_progress(self.spine_index)
                .unwrap_or_default(),
        };
        ((self.spine_index as f64 + fraction) / count as f64 * 100.0).clamp(0.0, 100.0)
    }

    async fn navigate(&mut self, spine: usize, target: ChapterTarget) -> Result<bool, ReaderError> {
        self.cancel_gesture();
        let before = self.location();
        self.load_around(spine).await?;
        if self.position_at(spine, &target) {
            self.spine_index = self.derived_spine().unwrap_or(spine);
        } else if !self.needs_layout {
            warn!(spine, "navigation target is not materialized");
            if let Some(derived) = self.derived_spine() {
                self.spine_index = derived;
            }
        }
        self.relocated();
        self.scheduler.request(AnchorTrigger::PageTurn, Instant::now());
        Ok(self.location() != before)
    }

    /// Shows an absolute page; crossing into another chapter slides the window
    /// and re-derives the page by chapter, since loads before it shift
    /// absolute numbering.
    async fn show_page(&mut self, page: usize) -> Result<bool, ReaderError> {
        let before = (self.spine_index, self.paginator.current_page());
        self.sync_columns_for(page);
        let current = self.paginator.go_to_page(page);
        match self.paginator.chapter_page_info(current) {
            Some(info) if info.spine_index != self.spine_index => {
                self.spine_index = info.spine_index;
                self.load_around(info.spine_index).await?;
                self.position_at(info.spine_index, &ChapterTarget::Page(info.page));
            }
            _ => self.align_paginated(),
        }
        let moved = (self.spine_index, self.paginator.current_page()) != before;
        if moved {
            self.relocated();
            self.scheduler.request(AnchorTrigger::PageTurn, Instant::now());
        }
        Ok(moved)
    }

    async fn load_around(&mut self, spine: usize) -> Result<(), ReaderError> {
        let store = self.store()?;
        self.emit(ReaderEvent::Loading(true));
        let result = self
            .windows
            .update(spine, self.layout.mode, &store, &mut self.surface)
            .await;
        self.emit(ReaderEvent::Loading(false));
        let report = result.inspect_err(|err| self.report(err))?;
        for failure in &report.failures {
            self.report(&ReaderError::from(failure.clone()));
        }
        if report.mutated() {
            self.gestures.cancel();
            self.scheduler
                .request(AnchorTrigger::WindowChange, Instant::now());
        }
        self.recalculate();
        Ok(())
    }

    /// Positions inside `spine`. Returns false when the chapter is not on the
    /// surface; an unmeasurable surface defers the move to `poll`.
    fn position_at(&mut self, spine: usize, target: &ChapterTarget) -> bool {
        if self.needs_layout {
            self.pending_target = Some((spine, target.clone()));
            return false;
        }
        match self.layout.mode {
            LayoutMode::Paginated => {
                let Some(page) = self.page_for_target(spine, target) else {
                    return false;
                };
                let page = if self.sync_columns_for(page) {
                    self.page_for_target(spine, target).unwrap_or(page)
                } else {
                    page
                };
                self.paginator.go_to_page(page);
                self.align_paginated();
            }
            LayoutMode::Scrolled => {
                let Some(offset) = self.offset_for_target(spine, target) else {
                    return false;
                };
                self.scroller.scroll_to(offset);
                self.surface.apply_transform(self.scroller.offset());
            }
        }
        true
    }

    /// Performs a move that was deferred while the surface could not be
    /// measured.
    fn apply_pending(&mut self) -> bool {
        if self.needs_layout {
            return false;
        }
        let Some((spine, target)) = self.pending_target.take() else {
            return false;
        };
        if self.position_at(spine, &target) {
            self.spine_index = self.derived_spine().unwrap_or(spine);
        }
        self.relocated();
        true
    }

    fn page_for_target(&self, spine: usize, target: &ChapterTarget) -> Option<usize> {
        let start = self.paginator.chapter_start_page(spine)?;
        let total = self
            .paginator
            .chapter_page_info(start)
            .map_or(1, |info| info.total);
        let last = start + total - 1;
        let page = match target {
            ChapterTarget::Start => start,
            ChapterTarget::End => last,
            ChapterTarget::Page(page) => start + page,
            ChapterTarget::Fraction(fraction) => {
                start + (fraction * total as f64 + 1e-6).floor() as usize
            }
            ChapterTarget::Fragment(_) | ChapterTarget::Path(_) => self
                .target_origin(spine, target)
                .map_or(start, |origin| self.paginator.page_for_offset(origin.x)),
        };
        Some(page.clamp(start, last))
    }

    fn offset_for_target(&self, spine: usize, target: &ChapterTarget) -> Option<f64> {
        let geometry = self.scroller.chapter_geometry(spine)?;
        Some(match target {
            ChapterTarget::Start | ChapterTarget::Page(_) => geometry.offset,
            ChapterTarget::End => {
                (geometry.end() - self.scroller.viewport_extent()).max(geometry.offset)
            }
            ChapterTarget::Fraction(fraction) => {
                geometry.offset + geometry.extent * fraction.clamp(0.0, 1.0)
            }
            ChapterTarget::Fragment(_) | ChapterTarget::Path(_) => self
                .target_origin(spine, target)
                .map_or(geometry.offset, |origin| origin.y),
        })
    }

    /// First client rect of a fragment or path target, in content space.
    fn target_origin(&self, spine: usize, target: &ChapterTarget) -> Option<Rect> {
        let handle = self.windows.window().handle(spine)?;
        let range = match target {
            ChapterTarget::Fragment(fragment) => self.surface.resolve_fragment(handle, fragment)?,
            ChapterTarget::Path(path) => self.surface.resolve_path(handle, path)?,
            _ => return None,
        };
        self.range_origin(handle, range)
    }

    /// First client rect of `range`, or of the character at its start when it
    /// is empty, in content space.
    fn range_origin(&self, handle: ContentHandle, range: ContentRange) -> Option<Rect> {
        let range = if range.is_empty() {
            ContentRange::new(range.spine_index, range.start, range.start + 1)
        } else {
            range
        };
        let applied = self.surface.applied_offset();
        self.surface
            .client_rects(handle, &range)
            .first()
            .map(|rect| rect.translate(-applied.x, -applied.y))
    }

    fn derived_spine(&self) -> Option<usize> {
        match self.layout.mode {
            LayoutMode::Paginated => self.paginator.chapter_at_page(self.paginator.current_page()),
            LayoutMode::Scrolled => self.scroller.current_chapter(),
        }
    }

    fn push_layout(&mut self) {
        let mut layout = self.layout.surface_layout(self.columns);
        layout.mode = self.layout.mode;
        self.paginator.set_page_gap(layout.page_gap);
        self.surface.set_layout(&layout);
    }

    /// Re-measures for the active mode; false leaves a deferred recalculation
    /// for `poll`.
    fn recalculate(&mut self) -> bool {
        let result = match self.layout.mode {
            LayoutMode::Paginated => self
                .paginator
                .recalculate(&self.surface, self.windows.window())
                .map(|_| ()),
            LayoutMode::Scrolled => self
                .scroller
                .recalculate(&self.surface, self.windows.window())
                .map(|_| ()),
        };
        match result {
            Ok(()) => {
                self.needs_layout = false;
                true
            }
            Err(err) => {
                debug!(%err, "layout not measurable yet");
                self.needs_layout = true;
                false
            }
        }
    }

    /// In auto column mode the book's first page is single-column; moving
    /// onto or off it switches the column count. Returns whether it changed.
    fn sync_columns_for(&mut self, page: usize) -> bool {
        if self.layout.mode != LayoutMode::Paginated {
            return false;
        }
        let wanted = self.paginator.required_columns(page);
        if wanted == self.columns {
            return false;
        }
        debug!(from = self.columns, to = wanted, page, "column count changed");
        self.columns = wanted;
        self.push_layout();
        self.recalculate()
    }

    fn align(&mut self) {
        match self.layout.mode {
            LayoutMode::Paginated => self.align_paginated(),
            LayoutMode::Scrolled => self.surface.apply_transform(self.scroller.offset()),
        }
    }

    fn align_paginated(&mut self) {
        let offset = self.paginator.offset_for_page(self.paginator.current_page());
        self.gestures.align_to(offset);
        self.surface.apply_transform(offset);
    }

    fn relocated(&self) {
        if let Some(location) = self.location() {
            self.emit(ReaderEvent::Relocated(location));
        }
    }
}

fn fixed_columns(mode: ColumnMode) -> u32 {
    match mode {
        ColumnMode::Double => 2,
        ColumnMode::Auto | ColumnMode::Single => 1,
    }
}

fn pages_in(extent: f64, viewport: f64) -> usize {
    if viewport <= 0.0 {
        return 1;
    }
    ((extent / viewport).ceil() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::anchor::AnchorStatus;
    use crate::state::MemoryStateStore;
    use crate::testing::{default_text, FakeStore, FakeSurface};

    fn config(columns: ColumnMode) -> ReaderConfig {
        let mut config = ReaderConfig::default();
        config.layout.viewport = Viewport::new(400.0, 300.0);
        config.layout.columns = columns;
        config
    }

    fn controller(columns: ColumnMode) -> ReaderController<FakeSurface> {
        ReaderController::new(
            config(columns),
            FakeSurface::new(),
            Arc::new(MemoryStateStore::new()),
        )
    }

    async fn opened(chapters: usize) -> ReaderController<FakeSurface> {
        let mut reader = controller(ColumnMode::Single);
        reader.open(FakeStore::arc(chapters)).await.unwrap();
        reader
    }

    fn loaded(reader: &ReaderController<FakeSurface>) -> Vec<usize> {
        reader.windows().window().loaded_indices().collect()
    }

    #[tokio::test]
    async fn open_loads_leading_window() {
        let reader = opened(10).await;
        assert_eq!(loaded(&reader), (0..=6).collect::<Vec<_>>());
        let location = reader.location().unwrap();
        assert_eq!(location.spine_index, 0);
        assert_eq!(location.page_in_book, 0);
        assert_eq!(location.total_pages_in_chapter, 3);

        let events = reader.drain_events();
        assert_eq!(events[0], ReaderEvent::Loading(true));
        assert_eq!(events[1], ReaderEvent::Loading(false));
        assert!(matches!(events.last(), Some(ReaderEvent::Relocated(_))));
        assert!(reader.drain_events().is_empty());
    }

    #[tokio::test]
    async fn page_turns_cross_chapters_and_slide_window() {
        let mut reader = opened(20).await;
        assert!(reader.next_page(3).await.unwrap());
        assert_eq!(reader.spine_index(), 1);
        assert_eq!(reader.location().unwrap().page_in_chapter, 0);

        reader.apply(Command::NextPage { count: 6 }).await.unwrap();
        assert_eq!(reader.spine_index(), 3);
        assert!(reader.windows().window().is_loaded(8));
        assert_eq!(reader.location().unwrap().page_in_book, 9);

        assert!(reader.prev_page(1).await.unwrap());
        let location = reader.location().unwrap();
        assert_eq!(location.spine_index, 2);
        assert_eq!(location.page_in_chapter, 2);
    }

    #[tokio::test]
    async fn jump_by_spine_index_keeps_target_in_window() {
        let mut reader = opened(10).await;
        reader.goto_spine_index(9).await.unwrap();
        assert_eq!(reader.spine_index(), 9);
        assert_eq!(loaded(&reader), (0..=9).collect::<Vec<_>>());
        assert_eq!(reader.location().unwrap().page_in_chapter, 0);
        assert!(reader.next_page(5).await.unwrap());
        assert_eq!(reader.location().unwrap().page_in_chapter, 2);
        assert!(!reader.next_page(1).await.unwrap());

        reader.goto_spine_index(40).await.unwrap();
        assert_eq!(reader.spine_index(), 9);
    }

    #[tokio::test]
    async fn page_numbering_is_rederived_after_window_slides() {
        let mut config = config(ColumnMode::Single);
        config.window.max_loaded_chapters = 7;
        let mut reader =
            ReaderController::new(config, FakeSurface::new(), Arc::new(MemoryStateStore::new()));
        reader.open(FakeStore::arc(30)).await.unwrap();
        reader.goto_spine_index(20).await.unwrap();
        assert_eq!(loaded(&reader), (18..=24).collect::<Vec<_>>());

        reader.goto_page(0).await.unwrap();
        assert_eq!(reader.spine_index(), 18);
        assert_eq!(loaded(&reader), (15..=21).collect::<Vec<_>>());
        assert_eq!(reader.paginator().current_page(), 9);
        assert_eq!(reader.location().unwrap().page_in_chapter, 0);

        assert!(reader.prev_page(1).await.unwrap());
        assert_eq!(reader.spine_index(), 17);
        assert_eq!(reader.location().unwrap().page_in_chapter, 2);
        assert!(reader.windows().window().is_loaded(14));
        assert!(reader.windows().window().len() <= 7);
    }

    #[tokio::test]
    async fn percentage_is_book_wide() {
        let mut reader = opened(10).await;
        reader.goto_percentage(50.0).await.unwrap();
        assert_eq!(reader.spine_index(), 5);
        assert_eq!(reader.location().unwrap().page_in_chapter, 0);
        assert!((reader.book_percentage() - 50.0).abs() < 1e-9);

        reader
            .apply(Command::GotoPercentage { percentage: 55.0 })
            .await
            .unwrap();
        assert_eq!(reader.location().unwrap().page_in_chapter, 1);
        let expected = (5.0 + 1.0 / 3.0) / 10.0 * 100.0;
        assert!((reader.book_percentage() - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn mode_switch_preserves_book_percentage() {
        let mut reader = opened(10).await;
        reader.goto_percentage(55.0).await.unwrap();
        let before = reader.book_percentage();

        reader.apply(Command::ToggleMode).await.unwrap();
        assert_eq!(reader.mode(), LayoutMode::Scrolled);
        assert_eq!(reader.spine_index(), 5);
        assert!((reader.book_percentage() - before).abs() < 1e-6);
        assert_eq!(reader.surface().layout().unwrap().mode, LayoutMode::Scrolled);

        reader.set_mode(LayoutMode::Paginated).await.unwrap();
        assert_eq!(reader.spine_index(), 5);
        assert_eq!(reader.location().unwrap().page_in_chapter, 1);
    }

    #[tokio::test]
    async fn layout_change_clamps_absolute_page() {
        let mut reader = opened(7).await;
        reader.goto_page(20).await.unwrap();
        let position = reader.paginator().position().unwrap();
        assert_eq!((position.current_page, position.total_pages), (20, 21));

        assert!(reader.set_columns(ColumnMode::Double));
        let position = reader.paginator().position().unwrap();
        assert_eq!((position.current_page, position.total_pages), (13, 14));
        assert_eq!(reader.spine_index(), 6);
        assert_eq!(reader.surface().position(), 13.0 * 400.0);
    }

    #[tokio::test]
    async fn column_change_clamps_without_error_event() {
        let mut reader = controller(ColumnMode::Single);
        reader
            .open(FakeStore::arc_with_texts(vec!["x".repeat(6000)]))
            .await
            .unwrap();
        reader.goto_page(50).await.unwrap();
        assert_eq!(reader.paginator().current_page(), 50);
        reader.drain_events();

        assert!(reader.set_columns(ColumnMode::Double));
        let position = reader.paginator().position().unwrap();
        assert_eq!((position.current_page, position.total_pages), (29, 30));
        assert_eq!(reader.surface().position(), 29.0 * 400.0);
        let events = reader.drain_events();
        assert!(events
            .iter()
            .all(|event| !matches!(event, ReaderEvent::Error { .. })));
        match events.last() {
            Some(ReaderEvent::Relocated(location)) => assert_eq!(location.page_in_chapter, 29),
            other => panic!("expected a relocation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn auto_columns_keep_first_page_single_after_widening() {
        let mut config = config(ColumnMode::Auto);
        config.layout.viewport = Viewport::new(600.0, 300.0);
        let mut reader = ReaderController::new(
            config,
            FakeSurface::new(),
            Arc::new(MemoryStateStore::new()),
        );
        reader.open(FakeStore::arc(10)).await.unwrap();
        assert_eq!(reader.columns(), 1);

        assert!(reader.resize(1000.0, 300.0));
        assert_eq!(reader.paginator().current_page(), 0);
        assert_eq!(reader.columns(), 1);
        assert_eq!(reader.surface().layout().unwrap().columns, 1);

        reader.next_page(1).await.unwrap();
        assert_eq!(reader.columns(), 2);
    }

    #[tokio::test]
    async fn resize_keeps_page_and_cancels_gesture() {
        let mut reader = opened(5).await;
        reader.next_page(4).await.unwrap();
        let now = Instant::now();
        reader.drag(-30.0, now);
        assert!(reader.gestures().is_dragging());

        assert!(reader.resize(600.0, 300.0));
        assert!(!reader.gestures().is_busy());
        assert_eq!(reader.paginator().current_page(), 4);
        assert_eq!(reader.surface().position(), 4.0 * 600.0);
        assert!(!reader.resize(600.0, 300.0));
    }

    #[tokio::test]
    async fn auto_columns_single_on_first_page() {
        let mut config = config(ColumnMode::Auto);
        config.layout.viewport = Viewport::new(900.0, 300.0);
        let mut reader = ReaderController::new(
            config,
            FakeSurface::new(),
            Arc::new(MemoryStateStore::new()),
        );
        reader.open(FakeStore::arc(10)).await.unwrap();
        assert_eq!(reader.columns(), 1);

        reader.next_page(1).await.unwrap();
        assert_eq!(reader.columns(), 2);
        assert_eq!(reader.paginator().current_page(), 1);

        reader.prev_page(1).await.unwrap();
        assert_eq!(reader.columns(), 1);
        assert_eq!(reader.paginator().current_page(), 0);
    }

    #[tokio::test]
    async fn drag_settles_on_nearest_page() {
        let mut reader = opened(5).await;
        let start = Instant::now();
        assert!(reader.drag(-250.0, start));
        assert_eq!(reader.surface().position(), 0.0);
        reader.poll(start + Duration::from_millis(16)).await.unwrap();
        assert_eq!(reader.surface().position(), 250.0);

        reader.poll(start + Duration::from_millis(100)).await.unwrap();
        assert!(reader.gestures().is_snapping());
        reader.poll(start + Duration::from_millis(400)).await.unwrap();
        assert!(!reader.gestures().is_busy());
        assert_eq!(reader.paginator().current_page(), 1);
        assert_eq!(reader.surface().position(), 400.0);
    }

    #[tokio::test]
    async fn drags_within_a_frame_apply_one_transform() {
        let mut reader = opened(5).await;
        let applied = reader.surface().transforms.len();
        let start = Instant::now();
        for i in 0..4 {
            assert!(reader.drag(-5.0, start + Duration::from_millis(i)));
        }
        assert_eq!(reader.surface().transforms.len(), applied);

        assert!(reader.poll(start + Duration::from_millis(16)).await.unwrap());
        assert_eq!(reader.surface().transforms[applied..], [20.0]);
        assert!(!reader.gestures().frame_pending());

        reader.poll(start + Duration::from_millis(32)).await.unwrap();
        assert_eq!(reader.surface().transforms.len(), applied + 1);
    }

    #[tokio::test]
    async fn href_and_cfi_land_on_target_page() {
        let mut texts: Vec<String> = (0..6).map(default_text).collect();
        texts[3] = format!("{}[mark]{}", "x".repeat(150), "y".repeat(94));
        let mut reader = controller(ColumnMode::Single);
        reader.open(FakeStore::arc_with_texts(texts)).await.unwrap();

        reader.goto_href("text/ch03.xhtml#mark").await.unwrap();
        let location = reader.location().unwrap();
        assert_eq!((location.spine_index, location.page_in_chapter), (3, 1));

        reader.goto_cfi("epubcfi(/6/6!/2/1:210)").await.unwrap();
        let location = reader.location().unwrap();
        assert_eq!((location.spine_index, location.page_in_chapter), (2, 2));

        assert!(matches!(
            reader.goto_cfi("chapter 2").await,
            Err(ReaderError::InvalidLocation { .. })
        ));
        assert!(matches!(
            reader.goto_href("missing.xhtml").await,
            Err(ReaderError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn selection_and_annotations_anchor_on_poll() {
        let mut reader = opened(5).await;
        reader.drain_events();
        let selector = reader.select(ContentRange::new(0, 10, 20)).unwrap();
        let events = reader.drain_events();
        match &events[..] {
            [ReaderEvent::Selected { text, location, position }] => {
                assert_eq!(text, " chapter 0");
                assert!(location.starts_with("epubcfi(/6/2!/2/1:10"));
                assert!(!position.is_empty());
            }
            other => panic!("unexpected events {other:?}"),
        }

        reader.add_annotation(Annotation {
            id: "a1".into(),
            color_tag: "yellow".into(),
            selector,
        });
        assert_eq!(reader.highlights().len(), 1);
        assert_eq!(reader.highlights()[0].status, AnchorStatus::Anchored);

        reader.next_page(1).await.unwrap();
        let before = reader.highlights().to_vec();
        assert!(reader.poll(Instant::now() + Duration::from_secs(1)).await.unwrap());
        assert_eq!(reader.highlights(), &before[..]);
        assert!(reader.remove_annotation("a1"));
        assert!(reader.highlights().is_empty());
    }

    #[tokio::test]
    async fn state_round_trips_through_store() {
        let states = Arc::new(MemoryStateStore::new());
        let store = FakeStore::arc(10);
        let mut reader =
            ReaderController::new(config(ColumnMode::Single), FakeSurface::new(), states.clone());
        reader.open(Arc::clone(&store)).await.unwrap();
        reader.goto_percentage(55.0).await.unwrap();
        reader.close().unwrap();
        assert!(!reader.is_open());

        let mut reopened =
            ReaderController::new(config(ColumnMode::Single), FakeSurface::new(), states);
        reopened.open(store).await.unwrap();
        let location = reopened.location().unwrap();
        assert_eq!((location.spine_index, location.page_in_chapter), (5, 1));
    }

    #[tokio::test]
    async fn saved_cfi_points_at_first_character_on_screen() {
        let states = Arc::new(MemoryStateStore::new());
        let store = FakeStore::arc(10);
        let mut reader =
            ReaderController::new(config(ColumnMode::Single), FakeSurface::new(), states.clone());
        reader.open(Arc::clone(&store)).await.unwrap();
        reader.goto_spine_index(4).await.unwrap();
        reader.next_page(2).await.unwrap();
        assert_eq!(
            reader.reading_cfi().unwrap().to_string(),
            "epubcfi(/6/10!/2/1:200)"
        );
        reader.close().unwrap();

        let book = store.info();
        let mut saved = states.load(book).unwrap().unwrap();
        assert_eq!(saved.cfi.as_deref(), Some("epubcfi(/6/10!/2/1:200)"));

        // the cfi wins over a stale percentage
        saved.percentage = 40.0;
        states.save(book, &saved).unwrap();
        let mut reopened =
            ReaderController::new(config(ColumnMode::Single), FakeSurface::new(), states);
        reopened.open(store).await.unwrap();
        let location = reopened.location().unwrap();
        assert_eq!((location.spine_index, location.page_in_chapter), (4, 2));
    }

    #[tokio::test]
    async fn failed_chapter_is_reported_not_fatal() {
        let mut reader = controller(ColumnMode::Single);
        reader
            .open(FakeStore::arc_failing(10, &[2]))
            .await
            .unwrap();
        let errors: Vec<_> = reader
            .drain_events()
            .into_iter()
            .filter_map(|event| match event {
                ReaderEvent::Error { kind, .. } => Some(kind),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![crate::ErrorKind::ChapterLoad]);
        assert!(!reader.windows().window().is_loaded(2));

        reader.next_page(6).await.unwrap();
        assert_eq!(reader.spine_index(), 3);
    }

    #[tokio::test]
    async fn busy_window_fails_after_retries() {
        let mut config = config(ColumnMode::Single);
        config.window.busy_retry_attempts = 1;
        config.window.busy_retry_delay = Duration::from_millis(1);
        let mut reader =
            ReaderController::new(config, FakeSurface::new(), Arc::new(MemoryStateStore::new()));
        let flag = reader.loading_flag();
        let _guard = flag.try_acquire().unwrap();
        assert!(matches!(
            reader.open(FakeStore::arc(3)).await,
            Err(ReaderError::WindowBusy)
        ));
    }

    #[tokio::test]
    async fn unmeasurable_surface_defers_positioning() {
        let mut config = config(ColumnMode::Single);
        config.layout.viewport = Viewport::new(0.0, 0.0);
        let mut reader =
            ReaderController::new(config, FakeSurface::new(), Arc::new(MemoryStateStore::new()));
        reader.open(FakeStore::arc(10)).await.unwrap();
        assert!(reader.location().is_none());

        reader.goto_spine_index(4).await.unwrap();
        assert!(reader.resize(400.0, 300.0));
        reader.poll(Instant::now()).await.unwrap();
        assert_eq!(reader.spine_index(), 4);
        assert_eq!(reader.location().unwrap().page_in_chapter, 0);
    }
}
