//! Chapter windowing: which spine indices stay materialized on the surface.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::WindowConfig;
use crate::error::{ChapterLoadFailure, ReaderError};
use crate::surface::{ChapterStore, ContentHandle, ContentSurface, Placeholder};
use crate::LayoutMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Forward,
    Backward,
    #[default]
    None,
}

impl Direction {
    pub fn between(from: usize, to: usize) -> Self {
        match to.cmp(&from) {
            std::cmp::Ordering::Greater => Direction::Forward,
            std::cmp::Ordering::Less => Direction::Backward,
            std::cmp::Ordering::Equal => Direction::None,
        }
    }
}

/// Materialized chapters keyed by spine index. Keeping indices and handles in
/// one map means every loaded index always has a live handle.
#[derive(Debug, Default)]
pub struct ChapterWindow {
    loaded: BTreeMap<usize, ContentHandle>,
    last_accessed: usize,
    direction: Direction,
}

impl ChapterWindow {
    pub fn loaded_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.loaded.keys().copied()
    }

    pub fn handles(&self) -> impl Iterator<Item = (usize, ContentHandle)> + '_ {
        self.loaded.iter().map(|(index, handle)| (*index, *handle))
    }

    pub fn handle(&self, index: usize) -> Option<ContentHandle> {
        self.loaded.get(&index).copied()
    }

    pub fn is_loaded(&self, index: usize) -> bool {
        self.loaded.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    pub fn last_accessed_index(&self) -> usize {
        self.last_accessed
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// Outcome of [`WindowManager::compute_window`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPlan {
    pub window: RangeInclusive<usize>,
    pub to_load: BTreeSet<usize>,
    /// Farthest from the target first.
    pub to_unload: Vec<usize>,
}

impl WindowPlan {
    fn empty() -> Self {
        Self {
            window: 0..=0,
            to_load: BTreeSet::new(),
            to_unload: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowReport {
    pub plan: WindowPlan,
    pub loaded: Vec<usize>,
    pub unloaded: Vec<usize>,
    pub failures: Vec<ChapterLoadFailure>,
}

impl WindowReport {
    /// Whether the surface's content changed.
    pub fn mutated(&self) -> bool {
        !self.loaded.is_empty() || !self.unloaded.is_empty()
    }
}

/// Shared "window update in flight" marker.
#[derive(Debug, Clone, Default)]
pub struct LoadingFlag(Arc<AtomicBool>);

impl LoadingFlag {
    pub fn is_loading(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn try_acquire(&self) -> Option<LoadingGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LoadingGuard(Arc::clone(&self.0)))
    }
}

/// Clears the loading flag on drop.
#[derive(Debug)]
pub struct LoadingGuard(Arc<AtomicBool>);

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct WindowManager {
    config: WindowConfig,
    window: ChapterWindow,
    loading: LoadingFlag,
}

impl WindowManager {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            window: ChapterWindow::default(),
            loading: LoadingFlag::default(),
        }
    }

    pub fn window(&self) -> &ChapterWindow {
        &self.window
    }

    pub fn loading_flag(&self) -> LoadingFlag {
        self.loading.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_loading()
    }

    /// Motion of a request for `target`, relative to the last accessed chapter.
    pub fn direction_to(&self, target: usize) -> Direction {
        if self.window.is_empty() {
            Direction::None
        } else {
            Direction::between(self.window.last_accessed, target)
        }
    }

    pub fn compute_window(&self, target: usize, direction: Direction, total: usize) -> WindowPlan {
        if total == 0 {
            return WindowPlan::empty();
        }
        let target = target.min(total - 1);
        let config = &self.config;

        let jumped = target.abs_diff(self.window.last_accessed) > config.jump_distance;
        let (behind, ahead) = match direction {
            _ if jumped => (config.stationary_behind, config.stationary_ahead),
            Direction::Forward => (config.forward_behind, config.forward_ahead),
            Direction::Backward => (config.backward_behind, config.backward_ahead),
            Direction::None => (config.stationary_behind, config.stationary_ahead),
        };

        let last = total - 1;
        let mut start = target.saturating_sub(behind);
        let mut end = (target + ahead).min(last);
        let min_size = config.min_window_size.min(total);
        if end - start + 1 < min_size {
            if start == 0 {
                end = (min_size - 1).min(last);
            } else if end == last {
                start = (last + 1).saturating_sub(min_size);
            }
        }
        let window = start..=end;

        let to_load: BTreeSet<usize> = window
            .clone()
            .filter(|index| !self.window.is_loaded(*index))
            .collect();

        let projected = self.window.len() + to_load.len();
        let to_unload = if projected > config.max_loaded_chapters {
            let excess = projected - config.max_loaded_chapters;
            let mut candidates: Vec<usize> = self
                .window
                .loaded_indices()
                .filter(|index| !window.contains(index))
                .collect();
            candidates.sort_by_key(|index| (Reverse(index.abs_diff(target)), Reverse(*index)));
            candidates.truncate(excess);
            candidates
        } else {
            Vec::new()
        };

        WindowPlan {
            window,
            to_load,
            to_unload,
        }
    }

    /// Brings the window around `target` onto the surface.
    ///
    /// Per-chapter failures leave a placeholder and are returned in the report.
    #[instrument(skip(self, store, surface))]
    pub async fn update(
        &mut self,
        target: usize,
        mode: LayoutMode,
        store: &Arc<dyn ChapterStore>,
        surface: &mut dyn ContentSurface,
    ) -> Result<WindowReport, ReaderError> {
        let _guard = self.acquire().await?;

        let total = store.info().chapter_count();
        if total == 0 {
            return Ok(WindowReport {
                plan: WindowPlan::empty(),
                loaded: Vec::new(),
                unloaded: Vec::new(),
                failures: Vec::new(),
            });
        }
        let target = target.min(total - 1);
        let direction = self.direction_to(target);
        let plan = self.compute_window(target, direction, total);
        self.window.last_accessed = target;
        self.window.direction = direction;

        let mut unloaded = Vec::with_capacity(plan.to_unload.len());
        for &index in &plan.to_unload {
            if let Some(handle) = self.window.loaded.remove(&index) {
                let placeholder = match mode {
                    LayoutMode::Paginated => Placeholder::Collapsed,
                    LayoutMode::Scrolled => Placeholder::Reserved(
                        surface.measure(handle).map(|g| g.extent).unwrap_or_default(),
                    ),
                };
                surface.unmaterialize(handle, placeholder);
                unloaded.push(index);
            }
        }

        let mut tasks = JoinSet::new();
        for &index in &plan.to_load {
            let store = Arc::clone(store);
            tasks.spawn(async move { (index, store.fetch_chapter(index).await) });
        }

        let mut loaded = Vec::with_capacity(plan.to_load.len());
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(content))) => match surface.materialize(index, &content) {
                    Ok(handle) => {
                        self.window.loaded.insert(index, handle);
                        loaded.push(index);
                    }
                    Err(err) => {
                        warn!(index, ?err, "failed to materialize chapter");
                        failures.push(ChapterLoadFailure {
                            index,
                            message: format!("{err:#}"),
                        });
                    }
                },
                Ok((index, Err(err))) => {
                    warn!(index, ?err, "failed to fetch chapter");
                    failures.push(ChapterLoadFailure {
                        index,
                        message: format!("{err:#}"),
                    });
                }
                Err(err) => warn!(?err, "chapter fetch task aborted"),
            }
        }

        for &index in &plan.to_load {
            let accounted =
                loaded.contains(&index) || failures.iter().any(|failure| failure.index == index);
            if !accounted {
                failures.push(ChapterLoadFailure {
                    index,
                    message: "fetch task aborted".into(),
                });
            }
        }
        loaded.sort_unstable();
        failures.sort_by_key(|failure| failure.index);

        info!(
            target,
            ?direction,
            window = ?plan.window,
            loaded = loaded.len(),
            unloaded = unloaded.len(),
            failed = failures.len(),
            "chapter window updated"
        );

        Ok(WindowReport {
            plan,
            loaded,
            unloaded,
            failures,
        })
    }

    /// Drops every materialized chapter, e.g. when the book closes or the
    /// layout mode changes placeholder semantics.
    pub fn unload_all(&mut self, surface: &mut dyn ContentSurface) -> Vec<usize> {
        let drained: Vec<(usize, ContentHandle)> = std::mem::take(&mut self.window.loaded)
            .into_iter()
            .collect();
        for (_, handle) in &drained {
            surface.unmaterialize(*handle, Placeholder::Collapsed);
        }
        self.window.direction = Direction::None;
        drained.into_iter().map(|(index, _)| index).collect()
    }

    async fn acquire(&self) -> Result<LoadingGuard, ReaderError> {
        let mut delay = self.config.busy_retry_delay;
        for attempt in 0..=self.config.busy_retry_attempts {
            if let Some(guard) = self.loading.try_acquire() {
                return Ok(guard);
            }
            if attempt == self.config.busy_retry_attempts {
                break;
            }
            debug!(attempt, ?delay, "window update in flight, retrying");
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
        Err(ReaderError::WindowBusy)
    }
}
