//! Drag, momentum and snap for paginated mode.
//!
//! The engine works on a continuous transform position (pixels from the start
//! of the materialized content) and only talks in pages once the motion comes
//! to rest. Time is passed in by the caller so the host's frame clock drives
//! everything.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::GestureConfig;
use crate::surface::ContentSurface;

/// Frame period for hosts without their own frame clock.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(16);

/// Page geometry captured when a gesture starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    pub page_extent: f64,
    pub viewport_extent: f64,
    pub total_extent: f64,
    pub current_page: usize,
    pub total_pages: usize,
}

impl PageGeometry {
    fn max_offset(&self) -> f64 {
        (self.total_extent - self.viewport_extent).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    delta: f64,
    at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct GestureState {
    pub active: bool,
    pub base_transform: f64,
    pub accumulated_offset: f64,
    velocity_history: VecDeque<Sample>,
    pub cached_max_offset: f64,
    geometry: Option<PageGeometry>,
}

impl GestureState {
    pub fn samples(&self) -> usize {
        self.velocity_history.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Motion {
    Idle,
    Dragging,
    Momentum {
        velocity: f64,
    },
    Snapping {
        from: f64,
        to: f64,
        page: usize,
        started: Instant,
    },
}

/// Result of advancing the engine by one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureTick {
    Idle,
    Animating,
    Settled { page: usize },
}

pub struct GestureEngine {
    config: GestureConfig,
    state: GestureState,
    motion: Motion,
    transform: f64,
    frame_pending: bool,
    idle_deadline: Option<Instant>,
}

impl GestureEngine {
    pub fn new(config: GestureConfig) -> Self {
        Self {
            config,
            state: GestureState::default(),
            motion: Motion::Idle,
            transform: 0.0,
            frame_pending: false,
            idle_deadline: None,
        }
    }

    pub fn state(&self) -> &GestureState {
        &self.state
    }

    pub fn transform(&self) -> f64 {
        self.transform
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self.motion, Motion::Idle)
    }

    pub fn is_dragging(&self) -> bool {
        matches!(self.motion, Motion::Dragging)
    }

    pub fn is_momentum(&self) -> bool {
        matches!(self.motion, Motion::Momentum { .. })
    }

    pub fn is_snapping(&self) -> bool {
        matches!(self.motion, Motion::Snapping { .. })
    }

    pub fn frame_pending(&self) -> bool {
        self.frame_pending
    }

    /// Feeds one drag/wheel delta. Positive deltas move toward earlier pages.
    pub fn on_input(&mut self, delta: f64, now: Instant, geometry: PageGeometry) {
        if !self.state.active {
            if self.is_busy() {
                self.cancel();
            }
            let base = geometry.current_page as f64 * geometry.page_extent;
            self.state = GestureState {
                active: true,
                base_transform: base,
                accumulated_offset: 0.0,
                velocity_history: VecDeque::new(),
                cached_max_offset: geometry.max_offset(),
                geometry: Some(geometry),
            };
            self.motion = Motion::Dragging;
            debug!(base, max = self.state.cached_max_offset, "gesture started");
        }

        self.state.accumulated_offset += delta;
        let raw = self.state.base_transform - self.state.accumulated_offset;
        self.transform = self.rubber_band(raw);

        self.state.velocity_history.push_back(Sample { delta, at: now });
        let window = self.config.velocity_window;
        while self
            .state
            .velocity_history
            .front()
            .is_some_and(|sample| now.duration_since(sample.at) > window)
        {
            self.state.velocity_history.pop_front();
        }

        self.frame_pending = true;
        self.idle_deadline = Some(now + self.config.idle_timeout);
        trace!(delta, transform = self.transform, "gesture input");
    }

    fn rubber_band(&self, raw: f64) -> f64 {
        let max = self.state.cached_max_offset;
        let factor = self.config.rubber_band;
        if raw < 0.0 {
            raw * factor
        } else if raw > max {
            max + (raw - max) * factor
        } else {
            raw
        }
    }

    /// Applies the latest transform to the surface, at most once per frame.
    pub fn on_animation_frame(&mut self, surface: &mut dyn ContentSurface) -> bool {
        if !self.frame_pending {
            return false;
        }
        surface.apply_transform(self.transform);
        self.frame_pending = false;
        true
    }

    /// `Σdelta / Δt` over the newest samples, in px/ms.
    pub fn velocity(&self) -> f64 {
        let history = &self.state.velocity_history;
        let Some(newest) = history.back() else {
            return 0.0;
        };
        let window = self.config.velocity_window;
        let recent: Vec<&Sample> = history
            .iter()
            .rev()
            .take(self.config.velocity_samples)
            .take_while(|sample| newest.at.duration_since(sample.at) <= window)
            .collect();
        let Some(oldest) = recent.last() else {
            return 0.0;
        };
        let elapsed = newest.at.duration_since(oldest.at).as_nanos() as f64 / 1_000_000.0;
        if elapsed <= 0.0 {
            return 0.0;
        }
        recent.iter().map(|sample| sample.delta).sum::<f64>() / elapsed
    }

    /// Advances timers and animations. Call once per frame.
    pub fn tick(&mut self, now: Instant) -> GestureTick {
        match self.motion {
            Motion::Idle => GestureTick::Idle,
            Motion::Dragging => {
                if self.idle_deadline.is_some_and(|deadline| now >= deadline) {
                    self.end_gesture(now)
                } else {
                    GestureTick::Animating
                }
            }
            Motion::Momentum { velocity } => self.step_momentum(velocity, now),
            Motion::Snapping {
                from,
                to,
                page,
                started,
            } => {
                let duration = self.config.snap_duration;
                let elapsed = now.saturating_duration_since(started);
                if duration.is_zero() || elapsed >= duration {
                    return self.finish(to, page);
                }
                let progress = elapsed.as_secs_f64() / duration.as_secs_f64();
                self.transform = from + (to - from) * ease_out_cubic(progress);
                self.frame_pending = true;
                GestureTick::Animating
            }
        }
    }

    /// Release: momentum when the release velocity is strictly above the
    /// threshold, otherwise an immediate snap.
    pub fn end_gesture(&mut self, now: Instant) -> GestureTick {
        if !self.state.active {
            return GestureTick::Idle;
        }
        let velocity = self.velocity();
        self.state.active = false;
        self.idle_deadline = None;
        debug!(velocity, transform = self.transform, "gesture released");

        if velocity.abs() > self.config.velocity_threshold {
            self.motion = Motion::Momentum { velocity };
            GestureTick::Animating
        } else {
            self.snap_to_nearest_page(now)
        }
    }

    fn step_momentum(&mut self, velocity: f64, now: Instant) -> GestureTick {
        let max = self.state.cached_max_offset;
        let mut velocity = velocity;
        self.transform -= velocity;
        velocity *= self.config.friction;
        if self.transform < 0.0 {
            self.transform = 0.0;
            velocity *= -self.config.bounce;
        } else if self.transform > max {
            self.transform = max;
            velocity *= -self.config.bounce;
        }
        self.frame_pending = true;

        if velocity.abs() < self.config.stop_velocity {
            trace!(transform = self.transform, "momentum settled");
            return self.snap_to_nearest_page(now);
        }
        self.motion = Motion::Momentum { velocity };
        GestureTick::Animating
    }

    /// Eases toward the page nearest the current transform.
    pub fn snap_to_nearest_page(&mut self, now: Instant) -> GestureTick {
        let Some(geometry) = self.state.geometry else {
            self.reset();
            return GestureTick::Idle;
        };
        let last = geometry.total_pages.saturating_sub(1);
        let nearest = if geometry.page_extent > 0.0 {
            (self.transform / geometry.page_extent).round().max(0.0) as usize
        } else {
            geometry.current_page
        };
        let page = nearest.min(last);
        let target = page as f64 * geometry.page_extent;

        if (self.transform - target).abs() < 0.5 || self.config.snap_duration.is_zero() {
            return self.finish(target, page);
        }
        self.motion = Motion::Snapping {
            from: self.transform,
            to: target,
            page,
            started: now,
        };
        GestureTick::Animating
    }

    fn finish(&mut self, target: f64, page: usize) -> GestureTick {
        self.transform = target;
        self.frame_pending = true;
        self.reset();
        debug!(page, "gesture settled");
        GestureTick::Settled { page }
    }

    fn reset(&mut self) {
        self.state = GestureState::default();
        self.motion = Motion::Idle;
        self.idle_deadline = None;
    }

    /// Drops pending frames, the idle timer and any momentum. Returns whether
    /// anything was in flight; the caller re-aligns the surface to its page.
    pub fn cancel(&mut self) -> bool {
        let busy = self.is_busy();
        self.frame_pending = false;
        self.reset();
        if busy {
            debug!("gesture cancelled");
        }
        busy
    }

    /// Sets the resting transform without animating, e.g. after a discrete
    /// page turn.
    pub fn align_to(&mut self, transform: f64) {
        self.transform = transform;
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }
}

fn ease_out_cubic(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    1.0 - (1.0 - t).powi(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSurface;

    fn geometry(current_page: usize) -> PageGeometry {
        PageGeometry {
            page_extent: 400.0,
            viewport_extent: 400.0,
            total_extent: 4000.0,
            current_page,
            total_pages: 10,
        }
    }

    fn ms(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    fn run_until_settled(engine: &mut GestureEngine, mut now: Instant) -> (usize, usize) {
        for frame in 0..10_000 {
            now += FRAME_INTERVAL;
            if let GestureTick::Settled { page } = engine.tick(now) {
                return (page, frame);
            }
        }
        panic!("gesture never settled");
    }

    #[test]
    fn drag_tracks_base_minus_offset() {
        let mut engine = GestureEngine::new(GestureConfig::default());
        let t0 = Instant::now();
        engine.on_input(30.0, t0, geometry(3));
        engine.on_input(20.0, ms(t0, 10), geometry(3));
        assert_eq!(engine.state().base_transform, 1200.0);
        assert_eq!(engine.state().accumulated_offset, 50.0);
        assert_eq!(engine.transform(), 1150.0);
        assert_eq!(engine.state().cached_max_offset, 3600.0);
    }

    #[test]
    fn overscroll_is_rubber_banded() {
        let mut engine = GestureEngine::new(GestureConfig::default());
        let t0 = Instant::now();
        engine.on_input(100.0, t0, geometry(0));
        assert!((engine.transform() + 30.0).abs() < 1e-9);

        let mut engine = GestureEngine::new(GestureConfig::default());
        engine.on_input(-100.0, t0, geometry(9));
        assert!((engine.transform() - 3630.0).abs() < 1e-9);
    }

    #[test]
    fn frames_coalesce_inputs() {
        let mut engine = GestureEngine::new(GestureConfig::default());
        let mut surface = FakeSurface::new();
        let t0 = Instant::now();
        for i in 0..4 {
            engine.on_input(-5.0, ms(t0, i), geometry(2));
        }
        assert!(engine.on_animation_frame(&mut surface));
        assert!(!engine.on_animation_frame(&mut surface));
        assert_eq!(surface.transforms, vec![820.0]);
    }

    #[test]
    fn history_keeps_only_recent_samples() {
        let mut engine = GestureEngine::new(GestureConfig::default());
        let t0 = Instant::now();
        engine.on_input(1.0, t0, geometry(2));
        engine.on_input(1.0, ms(t0, 50), geometry(2));
        engine.on_input(1.0, ms(t0, 160), geometry(2));
        assert_eq!(engine.state().samples(), 1);
    }

    #[test]
    fn velocity_at_threshold_snaps_without_momentum() {
        let mut engine = GestureEngine::new(GestureConfig::default());
        let t0 = Instant::now();
        for at in [0, 13, 26, 40] {
            engine.on_input(5.0, ms(t0, at), geometry(5));
        }
        assert!((engine.velocity() - 0.5).abs() < 1e-12);

        assert_eq!(engine.tick(ms(t0, 100)), GestureTick::Animating);
        assert!(engine.is_dragging());
        let tick = engine.tick(ms(t0, 140));
        assert!(!engine.is_momentum());
        assert!(matches!(tick, GestureTick::Animating));
        assert!(engine.is_snapping());

        let (page, _) = run_until_settled(&mut engine, ms(t0, 140));
        assert_eq!(page, 5);
        assert_eq!(engine.transform(), 2000.0);
    }

    #[test]
    fn zero_velocity_snaps_immediately() {
        let mut engine = GestureEngine::new(GestureConfig::default());
        let t0 = Instant::now();
        engine.on_input(-250.0, t0, geometry(1));
        assert_eq!(engine.velocity(), 0.0);
        let tick = engine.end_gesture(ms(t0, 100));
        assert!(!engine.is_momentum());
        assert_eq!(tick, GestureTick::Animating);
        let (page, _) = run_until_settled(&mut engine, ms(t0, 100));
        assert_eq!(page, 2);
    }

    #[test]
    fn fast_flick_runs_momentum_then_snaps() {
        let mut engine = GestureEngine::new(GestureConfig::default());
        let t0 = Instant::now();
        for i in 0..5 {
            engine.on_input(-60.0, ms(t0, i * 10), geometry(2));
        }
        assert!((engine.velocity() + 7.5).abs() < 1e-9);
        engine.end_gesture(ms(t0, 45));
        assert!(engine.is_momentum());

        let (page, frames) = run_until_settled(&mut engine, ms(t0, 45));
        assert!(frames > 10);
        assert!(page > 2);
        assert_eq!(engine.transform(), page as f64 * 400.0);
        assert!(!engine.is_busy());
    }

    #[test]
    fn momentum_bounces_at_edges() {
        let mut engine = GestureEngine::new(GestureConfig::default());
        let t0 = Instant::now();
        for i in 0..5 {
            engine.on_input(60.0, ms(t0, i * 10), geometry(0));
        }
        engine.end_gesture(ms(t0, 45));
        assert!(engine.is_momentum());
        let (page, _) = run_until_settled(&mut engine, ms(t0, 45));
        assert_eq!(page, 0);
        assert_eq!(engine.transform(), 0.0);
    }

    #[test]
    fn cancel_discards_everything() {
        let mut engine = GestureEngine::new(GestureConfig::default());
        let t0 = Instant::now();
        for i in 0..5 {
            engine.on_input(-30.0, ms(t0, i * 10), geometry(2));
        }
        engine.end_gesture(ms(t0, 45));
        assert!(engine.is_momentum());

        assert!(engine.cancel());
        assert!(!engine.is_busy());
        assert!(!engine.frame_pending());
        assert!(engine.idle_deadline().is_none());
        assert_eq!(engine.tick(ms(t0, 60)), GestureTick::Idle);
        assert!(!engine.cancel());
    }

    #[test]
    fn new_input_interrupts_snap() {
        let mut engine = GestureEngine::new(GestureConfig::default());
        let t0 = Instant::now();
        engine.on_input(-150.0, t0, geometry(1));
        engine.end_gesture(ms(t0, 100));
        assert!(engine.is_snapping());

        engine.on_input(-10.0, ms(t0, 120), geometry(1));
        assert!(engine.is_dragging());
        assert_eq!(engine.transform(), 410.0);
    }
}
