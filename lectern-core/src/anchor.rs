//! Resolution of persisted annotation selectors into on-screen geometry.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::config::AnchorConfig;
use crate::location::LocationPath;
use crate::surface::{ContentHandle, ContentSurface};
use crate::window::ChapterWindow;
use crate::{ContentRange, Rect};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextQuote {
    pub exact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

impl TextQuote {
    pub fn new(exact: impl Into<String>) -> Self {
        Self {
            exact: exact.into(),
            prefix: None,
            suffix: None,
        }
    }

    pub fn with_context(mut self, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self.suffix = Some(suffix.into());
        self
    }

    pub fn is_usable(&self) -> bool {
        !self.exact.is_empty()
    }
}

/// Character offsets into a chapter's plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextOffsetRange {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationSelector {
    pub spine_index: usize,
    pub path: LocationPath,
    pub quote: TextQuote,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offsets: Option<TextOffsetRange>,
}

/// One layer of a selector, tried in order until one resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorTier<'a> {
    Path(&'a LocationPath),
    Quote(&'a TextQuote),
    Offsets(TextOffsetRange),
}

impl AnnotationSelector {
    pub fn tiers(&self) -> impl Iterator<Item = SelectorTier<'_>> {
        [
            Some(SelectorTier::Path(&self.path)),
            Some(SelectorTier::Quote(&self.quote)).filter(|_| self.quote.is_usable()),
            self.offsets.map(SelectorTier::Offsets),
        ]
        .into_iter()
        .flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub color_tag: String,
    pub selector: AnnotationSelector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStatus {
    Anchored,
    Fuzzy,
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorOutcome {
    pub range: Option<ContentRange>,
    pub status: AnchorStatus,
}

impl AnchorOutcome {
    fn orphaned() -> Self {
        Self {
            range: None,
            status: AnchorStatus::Orphaned,
        }
    }
}

/// Rebuilt on every anchoring pass; rects are in content space.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchoredHighlight {
    pub id: String,
    pub color_tag: String,
    pub spine_index: usize,
    pub range: Option<ContentRange>,
    pub rects: Vec<Rect>,
    pub status: AnchorStatus,
}

impl AnchoredHighlight {
    pub fn is_renderable(&self) -> bool {
        self.status != AnchorStatus::Orphaned && !self.rects.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct HighlightAnchor {
    config: AnchorConfig,
}

impl HighlightAnchor {
    pub fn new(config: AnchorConfig) -> Self {
        Self { config }
    }

    pub fn anchor(
        &self,
        selector: &AnnotationSelector,
        surface: &dyn ContentSurface,
        handle: ContentHandle,
    ) -> AnchorOutcome {
        let mut text: Option<Option<String>> = None;
        for tier in selector.tiers() {
            let resolved = match tier {
                SelectorTier::Path(path) => surface
                    .resolve_path(handle, path)
                    .filter(|range| !range.is_empty())
                    .map(|range| (range, AnchorStatus::Anchored)),
                SelectorTier::Quote(quote) => text
                    .get_or_insert_with(|| surface.text_content(handle))
                    .as_deref()
                    .and_then(|content| find_quote(content, quote))
                    .map(|(start, end)| {
                        (
                            ContentRange::new(selector.spine_index, start, end),
                            AnchorStatus::Fuzzy,
                        )
                    }),
                SelectorTier::Offsets(offsets) => text
                    .get_or_insert_with(|| surface.text_content(handle))
                    .as_deref()
                    .filter(|content| {
                        offsets.start < offsets.end && offsets.end <= content.chars().count()
                    })
                    .map(|_| {
                        (
                            ContentRange::new(selector.spine_index, offsets.start, offsets.end),
                            AnchorStatus::Fuzzy,
                        )
                    }),
            };
            if let Some((range, status)) = resolved {
                trace!(?tier, ?status, "selector resolved");
                return AnchorOutcome {
                    range: Some(range),
                    status,
                };
            }
        }
        AnchorOutcome::orphaned()
    }

    /// Client rects of `range` in content space, merged into line boxes.
    pub fn rects_for(
        &self,
        surface: &dyn ContentSurface,
        handle: ContentHandle,
        range: &ContentRange,
    ) -> Vec<Rect> {
        let applied = surface.applied_offset();
        let rects: Vec<Rect> = surface
            .client_rects(handle, range)
            .into_iter()
            .map(|rect| rect.translate(-applied.x, -applied.y))
            .collect();
        merge_rects(&rects, self.config.merge_epsilon)
    }

    pub fn anchor_highlight(
        &self,
        annotation: &Annotation,
        surface: &dyn ContentSurface,
        handle: ContentHandle,
    ) -> AnchoredHighlight {
        let outcome = self.anchor(&annotation.selector, surface, handle);
        let rects = outcome
            .range
            .map(|range| self.rects_for(surface, handle, &range))
            .unwrap_or_default();
        AnchoredHighlight {
            id: annotation.id.clone(),
            color_tag: annotation.color_tag.clone(),
            spine_index: annotation.selector.spine_index,
            range: outcome.range,
            rects,
            status: outcome.status,
        }
    }

    /// Anchors every annotation whose chapter is materialized. Annotations for
    /// chapters outside the window are skipped, not orphaned.
    #[instrument(skip_all, fields(annotations = annotations.len()))]
    pub fn anchor_all(
        &self,
        annotations: &[Annotation],
        window: &ChapterWindow,
        surface: &dyn ContentSurface,
    ) -> Vec<AnchoredHighlight> {
        let highlights: Vec<AnchoredHighlight> = annotations
            .iter()
            .filter_map(|annotation| {
                let handle = window.handle(annotation.selector.spine_index)?;
                Some(self.anchor_highlight(annotation, surface, handle))
            })
            .collect();
        debug!(
            anchored = highlights.len(),
            orphaned = highlights
                .iter()
                .filter(|h| h.status == AnchorStatus::Orphaned)
                .count(),
            "anchoring pass complete"
        );
        highlights
    }

    /// Builds a selector describing a live selection so it can be persisted.
    pub fn describe_range(
        &self,
        surface: &dyn ContentSurface,
        handle: ContentHandle,
        range: &ContentRange,
    ) -> Option<AnnotationSelector> {
        let text: Vec<char> = surface.text_content(handle)?.chars().collect();
        if range.is_empty() || range.end > text.len() {
            return None;
        }
        let path = surface.path_for_range(handle, range)?;
        let context = self.config.quote_context;
        let exact: String = text[range.start..range.end].iter().collect();
        let prefix: String = text[range.start.saturating_sub(context)..range.start]
            .iter()
            .collect();
        let suffix: String = text[range.end..(range.end + context).min(text.len())]
            .iter()
            .collect();
        Some(AnnotationSelector {
            spine_index: range.spine_index,
            path,
            quote: TextQuote {
                exact,
                prefix: Some(prefix).filter(|p| !p.is_empty()),
                suffix: Some(suffix).filter(|s| !s.is_empty()),
            },
            offsets: Some(TextOffsetRange {
                start: range.start,
                end: range.end,
            }),
        })
    }
}

/// Finds `quote.exact`, preferring the occurrence whose surroundings best
/// match the prefix and suffix. Returns character offsets.
fn find_quote(text: &str, quote: &TextQuote) -> Option<(usize, usize)> {
    if !quote.is_usable() {
        return None;
    }
    let mut best: Option<(usize, usize)> = None;
    for (byte, _) in text.match_indices(quote.exact.as_str()) {
        let score = context_score(text, byte, quote);
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((byte, score));
        }
    }
    let (byte, _) = best?;
    let start = text[..byte].chars().count();
    Some((start, start + quote.exact.chars().count()))
}

fn context_score(text: &str, byte: usize, quote: &TextQuote) -> usize {
    let before = &text[..byte];
    let after = &text[byte + quote.exact.len()..];
    let prefix_score = quote.prefix.as_deref().map_or(0, |prefix| {
        before
            .chars()
            .rev()
            .zip(prefix.chars().rev())
            .take_while(|(a, b)| a == b)
            .count()
    });
    let suffix_score = quote.suffix.as_deref().map_or(0, |suffix| {
        after
            .chars()
            .zip(suffix.chars())
            .take_while(|(a, b)| a == b)
            .count()
    });
    prefix_score + suffix_score
}

fn mergeable(a: &Rect, b: &Rect, epsilon: f64) -> bool {
    let overlaps_vertically = a.y < b.bottom() && b.y < a.bottom();
    let gap = if a.right() < b.x {
        b.x - a.right()
    } else if b.right() < a.x {
        a.x - b.right()
    } else {
        0.0
    };
    overlaps_vertically && gap < epsilon
}

/// Combines rects whose vertical ranges overlap and whose horizontal gap is
/// below `epsilon`, until no pair qualifies. Empty rects are dropped.
pub fn merge_rects(rects: &[Rect], epsilon: f64) -> Vec<Rect> {
    let mut merged: Vec<Rect> = rects.iter().copied().filter(|r| !r.is_empty()).collect();
    loop {
        merged.sort_by(|a, b| a.y.total_cmp(&b.y).then(a.x.total_cmp(&b.x)));
        let mut changed = false;
        let mut out: Vec<Rect> = Vec::with_capacity(merged.len());
        for rect in merged {
            match out.iter_mut().find(|existing| mergeable(existing, &rect, epsilon)) {
                Some(existing) => {
                    *existing = existing.union(&rect);
                    changed = true;
                }
                None => out.push(rect),
            }
        }
        merged = out;
        if !changed {
            return merged;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorTrigger {
    PageTurn,
    Resize,
    LayoutChange,
    WindowChange,
}

/// Debounced re-anchoring requests. The latest request replaces any pending
/// one, including its deadline.
#[derive(Debug, Clone)]
pub struct AnchorScheduler {
    config: AnchorConfig,
    pending: Option<(AnchorTrigger, Instant)>,
}

impl AnchorScheduler {
    pub fn new(config: AnchorConfig) -> Self {
        Self {
            config,
            pending: None,
        }
    }

    fn delay(&self, trigger: AnchorTrigger) -> Duration {
        match trigger {
            AnchorTrigger::PageTurn => self.config.page_turn_delay,
            AnchorTrigger::Resize => self.config.resize_debounce,
            AnchorTrigger::LayoutChange => self.config.reflow_settle,
            AnchorTrigger::WindowChange => self.config.window_settle,
        }
    }

    pub fn request(&mut self, trigger: AnchorTrigger, now: Instant) {
        let deadline = now + self.delay(trigger);
        trace!(?trigger, "re-anchor requested");
        self.pending = Some((trigger, deadline));
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|(_, deadline)| deadline)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn take_due(&mut self, now: Instant) -> Option<AnchorTrigger> {
        match self.pending {
            Some((trigger, deadline)) if deadline <= now => {
                self.pending = None;
                Some(trigger)
            }
            _ => None,
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }
}
