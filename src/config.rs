//! Grid configuration.
//!
//! Every knob has a default matching the documented behavior. A handful can
//! be overridden through `MEDIAGRID_*` environment variables; malformed or
//! zero values are ignored rather than rejected.

use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::anchor::AnchorStrategy;
use crate::error::{GridError, GridResult};
use crate::visibility::CollapsePolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutConfig {
    /// Aspect ratio (width / height) used while a tile's real ratio is unknown.
    pub default_aspect_ratio: f64,
    /// Gap used when the computed style does not declare a usable column gap.
    pub fallback_gap: f64,
    /// Number of layout passes memoized by the layout cache.
    pub cache_capacity: usize,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            default_aspect_ratio: 1.0,
            fallback_gap: 0.0,
            cache_capacity: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    pub load_timeout: Duration,
    pub retry_backoff: Duration,
    /// Local decode failures are retried while the attempt count is below this.
    pub local_retry_attempts: u32,
    /// Consecutive failures after which a tile is marked permanently failed.
    pub max_consecutive_failures: u32,
    /// How often wanted-but-idle tiles are re-offered to the admission predicate.
    pub backup_sweep_interval: Duration,
    /// How often the media event channel is drained once the grid is started.
    pub pump_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(1200),
            local_retry_attempts: 2,
            max_consecutive_failures: 2,
            backup_sweep_interval: Duration::from_secs(1),
            pump_interval: Duration::from_millis(16),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    pub interval: Duration,
    pub ticks_to_stall: u32,
    /// Minimum playback clock advance (seconds) per tick for a tile to count as progressing.
    pub min_advance: f64,
    /// Per-tile stall log rate limit.
    pub log_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2500),
            ticks_to_stall: 3,
            min_advance: 0.1,
            log_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnchorConfig {
    pub strategy: AnchorStrategy,
    pub stabilize_frames: u32,
    pub settle_frames: u32,
    pub max_wait: Duration,
    /// Frames the anchor may be unmeasurable before compensation is abandoned.
    pub missing_frame_allowance: u32,
    /// Center/height movement (px) below which a frame counts as stable.
    pub tolerance_px: f64,
    pub scroll_padding_top: f64,
    pub scroll_padding_bottom: f64,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            strategy: AnchorStrategy::Auto,
            stabilize_frames: 2,
            settle_frames: 1,
            max_wait: Duration::from_millis(600),
            missing_frame_allowance: 2,
            tolerance_px: 0.5,
            scroll_padding_top: 0.0,
            scroll_padding_bottom: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityConfig {
    /// Extra band above and below the viewport, in viewport heights, that counts as "near".
    pub near_margin_viewports: f64,
    pub collapse_policy: CollapsePolicy,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            near_margin_viewports: 1.0,
            collapse_policy: CollapsePolicy::AssumeVisibleIfPreviouslyVisible,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GridConfig {
    pub layout: LayoutConfig,
    pub lifecycle: LifecycleConfig,
    pub watchdog: WatchdogConfig,
    pub anchor: AnchorConfig,
    pub visibility: VisibilityConfig,
}

static GLOBAL_CONFIG: OnceCell<GridConfig> = OnceCell::new();

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map(Duration::from_millis)
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}

impl GridConfig {
    /// Defaults with `MEDIAGRID_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_millis("MEDIAGRID_LOAD_TIMEOUT_MS") {
            config.lifecycle.load_timeout = v;
        }
        if let Some(v) = env_millis("MEDIAGRID_RETRY_BACKOFF_MS") {
            config.lifecycle.retry_backoff = v;
        }
        if let Some(v) = env_millis("MEDIAGRID_WATCHDOG_INTERVAL_MS") {
            config.watchdog.interval = v;
        }
        if let Some(v) = env_u32("MEDIAGRID_TICKS_TO_STALL") {
            config.watchdog.ticks_to_stall = v;
        }
        if let Some(v) = env_f64("MEDIAGRID_NEAR_MARGIN") {
            config.visibility.near_margin_viewports = v;
        }
        if let Some(v) = env_millis("MEDIAGRID_ANCHOR_MAX_WAIT_MS") {
            config.anchor.max_wait = v;
        }
        debug!(?config, "Loaded grid configuration");
        config
    }

    /// Process-wide configuration, read from the environment on first use.
    pub fn global() -> &'static GridConfig {
        GLOBAL_CONFIG.get_or_init(Self::from_env)
    }

    pub fn validate(&self) -> GridResult<()> {
        let ar = self.layout.default_aspect_ratio;
        if !ar.is_finite() || ar <= 0.0 {
            return Err(GridError::config(format!(
                "default aspect ratio must be positive, got {ar}"
            )));
        }
        if self.anchor.stabilize_frames == 0 {
            return Err(GridError::config("stabilize_frames must be at least 1"));
        }
        if self.watchdog.ticks_to_stall == 0 {
            return Err(GridError::config("ticks_to_stall must be at least 1"));
        }
        if self.watchdog.interval.is_zero() {
            return Err(GridError::config("watchdog interval must be non-zero"));
        }
        if self.lifecycle.max_consecutive_failures == 0 {
            return Err(GridError::config(
                "max_consecutive_failures must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = GridConfig::default();
        assert_eq!(config.lifecycle.load_timeout, Duration::from_secs(10));
        assert_eq!(config.lifecycle.retry_backoff, Duration::from_millis(1200));
        assert_eq!(config.watchdog.interval, Duration::from_millis(2500));
        assert_eq!(config.watchdog.ticks_to_stall, 3);
        assert_eq!(config.watchdog.log_interval, Duration::from_secs(60));
        assert_eq!(config.anchor.stabilize_frames, 2);
        assert_eq!(config.anchor.settle_frames, 1);
        assert_eq!(config.anchor.max_wait, Duration::from_millis(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GridConfig::default();
        config.layout.default_aspect_ratio = 0.0;
        assert!(config.validate().is_err());

        let mut config = GridConfig::default();
        config.anchor.stabilize_frames = 0;
        assert!(matches!(
            config.validate(),
            Err(GridError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_env_override_ignores_garbage() {
        std::env::set_var("MEDIAGRID_TICKS_TO_STALL", "not-a-number");
        std::env::set_var("MEDIAGRID_RETRY_BACKOFF_MS", "0");
        std::env::set_var("MEDIAGRID_ANCHOR_MAX_WAIT_MS", "900");
        let config = GridConfig::from_env();
        assert_eq!(config.watchdog.ticks_to_stall, 3);
        assert_eq!(config.lifecycle.retry_backoff, Duration::from_millis(1200));
        assert_eq!(config.anchor.max_wait, Duration::from_millis(900));
        std::env::remove_var("MEDIAGRID_TICKS_TO_STALL");
        std::env::remove_var("MEDIAGRID_RETRY_BACKOFF_MS");
        std::env::remove_var("MEDIAGRID_ANCHOR_MAX_WAIT_MS");
    }
}
