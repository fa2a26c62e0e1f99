use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::error::ReaderError;
use crate::surface::{SurfaceLayout, Viewport};
use crate::LayoutMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnMode {
    /// Two columns on wide viewports, except the book's first page.
    #[default]
    Auto,
    Single,
    Double,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub mode: LayoutMode,
    pub columns: ColumnMode,
    pub font_size: f64,
    pub margin: f64,
    pub column_gap: f64,
    pub page_gap: f64,
    pub auto_two_column_min_width: f64,
    pub viewport: Viewport,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            mode: LayoutMode::Paginated,
            columns: ColumnMode::Auto,
            font_size: 16.0,
            margin: 24.0,
            column_gap: 32.0,
            page_gap: 0.0,
            auto_two_column_min_width: 800.0,
            viewport: Viewport::default(),
        }
    }
}

impl LayoutConfig {
    pub fn surface_layout(&self, columns: u32) -> SurfaceLayout {
        SurfaceLayout {
            mode: self.mode,
            viewport: self.viewport,
            columns,
            font_size: self.font_size,
            margin: self.margin,
            column_gap: self.column_gap,
            page_gap: self.page_gap,
        }
    }
}

/// Chapter windowing bounds. The window around a target `t` is
/// `[t - behind, t + ahead]` for the current motion.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub max_loaded_chapters: usize,
    pub min_window_size: usize,
    pub jump_distance: usize,
    pub stationary_behind: usize,
    pub stationary_ahead: usize,
    pub forward_behind: usize,
    pub forward_ahead: usize,
    pub backward_behind: usize,
    pub backward_ahead: usize,
    pub busy_retry_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub busy_retry_delay: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_loaded_chapters: 15,
            min_window_size: 7,
            jump_distance: 2,
            stationary_behind: 2,
            stationary_ahead: 4,
            forward_behind: 1,
            forward_ahead: 5,
            backward_behind: 3,
            backward_ahead: 3,
            busy_retry_attempts: 5,
            busy_retry_delay: Duration::from_millis(50),
        }
    }
}

impl WindowConfig {
    fn widest_span(&self) -> usize {
        [
            self.stationary_behind + self.stationary_ahead,
            self.forward_behind + self.forward_ahead,
            self.backward_behind + self.backward_ahead,
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
            + 1
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GestureConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub velocity_window: Duration,
    pub velocity_samples: usize,
    /// px/ms; momentum starts only when the release velocity is strictly above.
    pub velocity_threshold: f64,
    pub friction: f64,
    pub bounce: f64,
    pub stop_velocity: f64,
    pub rubber_band: f64,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub snap_duration: Duration,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(100),
            velocity_window: Duration::from_millis(100),
            velocity_samples: 5,
            velocity_threshold: 0.5,
            friction: 0.95,
            bounce: 0.3,
            stop_velocity: 0.1,
            rubber_band: 0.3,
            snap_duration: Duration::from_millis(250),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    pub merge_epsilon: f64,
    pub quote_context: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub page_turn_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub resize_debounce: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reflow_settle: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub window_settle: Duration,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            merge_epsilon: 2.0,
            quote_context: 32,
            page_turn_delay: Duration::from_millis(300),
            resize_debounce: Duration::from_millis(100),
            reflow_settle: Duration::from_millis(150),
            window_settle: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub layout: LayoutConfig,
    pub window: WindowConfig,
    pub gesture: GestureConfig,
    pub anchor: AnchorConfig,
}

impl ReaderConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ReaderError> {
        let config: ReaderConfig =
            toml::from_str(input).map_err(|err| ReaderError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a TOML config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ReaderError> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ReaderError> {
        let window = &self.window;
        if window.min_window_size == 0 {
            return Err(ReaderError::Config("window.min_window_size must be positive".into()));
        }
        let needed = window.min_window_size.max(window.widest_span());
        if window.max_loaded_chapters < needed {
            return Err(ReaderError::Config(format!(
                "window.max_loaded_chapters ({}) must be at least the window size ({needed})",
                window.max_loaded_chapters
            )));
        }

        let gesture = &self.gesture;
        if !(0.0..1.0).contains(&gesture.friction) {
            return Err(ReaderError::Config("gesture.friction must be in [0, 1)".into()));
        }
        if !(0.0..=1.0).contains(&gesture.bounce) || !(0.0..=1.0).contains(&gesture.rubber_band) {
            return Err(ReaderError::Config(
                "gesture.bounce and gesture.rubber_band must be in [0, 1]".into(),
            ));
        }
        if gesture.velocity_samples == 0 || gesture.stop_velocity <= 0.0 {
            return Err(ReaderError::Config(
                "gesture.velocity_samples and gesture.stop_velocity must be positive".into(),
            ));
        }

        let layout = &self.layout;
        if layout.font_size <= 0.0 || layout.page_gap < 0.0 || layout.margin < 0.0 {
            return Err(ReaderError::Config(
                "layout.font_size must be positive and gaps/margins non-negative".into(),
            ));
        }
        if self.anchor.merge_epsilon < 0.0 {
            return Err(ReaderError::Config("anchor.merge_epsilon must be non-negative".into()));
        }
        Ok(())
    }
}
