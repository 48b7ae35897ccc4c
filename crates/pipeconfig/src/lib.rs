use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub version: u32,
    #[serde(default)]
    pub app: AppSettings,
    #[serde(default)]
    pub presentation: PresentationSettings,
    #[serde(default)]
    pub windows: BTreeMap<String, WindowSettings>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppSettings {
    #[serde(
        default = "default_update_interval",
        deserialize_with = "deserialize_update_interval"
    )]
    pub update_interval: Duration,
    #[serde(default = "default_max_delta", deserialize_with = "deserialize_max_delta")]
    pub max_delta: Duration,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            update_interval: default_update_interval(),
            max_delta: default_max_delta(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PresentationSettings {
    #[serde(default)]
    pub target_fps: Option<f32>,
    #[serde(default = "default_true")]
    pub render_on_demand: bool,
    #[serde(
        default = "default_engine_update_interval",
        deserialize_with = "deserialize_engine_update_interval"
    )]
    pub engine_update_interval: Duration,
    #[serde(default = "default_true")]
    pub use_present_window: bool,
    /// Hold rendered frames until the display signals the next refresh.
    #[serde(default)]
    pub follow_display_link: bool,
    /// Start the next frame as soon as the previous one is submitted.
    #[serde(default)]
    pub pre_start_frame: bool,
}

impl Default for PresentationSettings {
    fn default() -> Self {
        Self {
            target_fps: None,
            render_on_demand: true,
            engine_update_interval: default_engine_update_interval(),
            use_present_window: true,
            follow_display_link: false,
            pre_start_frame: false,
        }
    }
}

impl PresentationSettings {
    /// Target interval between two presents; `None` when uncapped.
    pub fn target_frame_interval(&self) -> Option<Duration> {
        frame_interval_for(self.target_fps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
pub struct Padding {
    #[serde(default)]
    pub top: f32,
    #[serde(default)]
    pub right: f32,
    #[serde(default)]
    pub bottom: f32,
    #[serde(default)]
    pub left: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WindowSettings {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_density")]
    pub density: f32,
    #[serde(default)]
    pub padding: Padding,
    #[serde(default)]
    pub target_fps: Option<f32>,
    #[serde(default)]
    pub render_on_demand: Option<bool>,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            density: default_density(),
            padding: Padding::default(),
            target_fps: None,
            render_on_demand: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWindow {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub density: f32,
    pub padding: Padding,
    pub frame_interval: Option<Duration>,
    pub render_on_demand: bool,
    pub engine_update_interval: Duration,
    pub use_present_window: bool,
    pub follow_display_link: bool,
    pub pre_start_frame: bool,
}

fn default_true() -> bool {
    true
}

fn default_update_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delta() -> Duration {
    Duration::from_millis(100)
}

fn default_engine_update_interval() -> Duration {
    Duration::from_micros(250)
}

fn default_width() -> u32 {
    1024
}

fn default_height() -> u32 {
    768
}

fn default_density() -> f32 {
    1.0
}

/// Longest frame interval a target frame rate may ask for.
pub const MAX_FRAME_INTERVAL: Duration = Duration::from_secs(3600);

/// Converts a target frame rate into the interval between presents.
///
/// `0` means uncapped. Rates that are negative, not finite, or so low that
/// the interval exceeds [`MAX_FRAME_INTERVAL`] are rejected.
pub fn frame_interval(fps: f32) -> Result<Option<Duration>, ConfigError> {
    if !fps.is_finite() || fps < 0.0 {
        return Err(ConfigError::Invalid(format!(
            "target fps must be a finite value >= 0, got {fps}"
        )));
    }
    if fps == 0.0 {
        return Ok(None);
    }
    let interval = Duration::try_from_secs_f64(1.0 / f64::from(fps))
        .map_err(|err| ConfigError::Invalid(format!("target fps {fps} is out of range: {err}")))?;
    if interval > MAX_FRAME_INTERVAL {
        return Err(ConfigError::Invalid(format!(
            "target fps {fps} is below the minimum of one frame per {}s",
            MAX_FRAME_INTERVAL.as_secs()
        )));
    }
    Ok(Some(interval))
}

fn normalize_fps(value: Option<f32>) -> Option<f32> {
    value.and_then(|fps| if fps > 0.0 { Some(fps) } else { None })
}

// Unvalidated rates resolve to uncapped; `validate` reports them.
fn frame_interval_for(fps: Option<f32>) -> Option<Duration> {
    normalize_fps(fps).and_then(|fps| frame_interval(fps).ok().flatten())
}

fn deserialize_update_interval<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_opt(deserializer).map(|d| d.unwrap_or_else(default_update_interval))
}

fn deserialize_max_delta<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_opt(deserializer).map(|d| d.unwrap_or_else(default_max_delta))
}

fn deserialize_engine_update_interval<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_opt(deserializer)
        .map(|d| d.unwrap_or_else(default_engine_update_interval))
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_secs(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs(v as u64)))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Parses a duration given as a number of seconds (`1.5`) or a
/// human-readable string (`250ms`, `2m`).
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let trimmed = value.trim();
    if let Ok(seconds) = trimmed.parse::<f64>() {
        if seconds.is_nan() || seconds.is_sign_negative() || !seconds.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "duration must be non-negative, got '{trimmed}'"
            )));
        }
        return Ok(Duration::from_secs_f64(seconds));
    }
    humantime::parse_duration(trimmed)
        .map_err(|err| ConfigError::Invalid(format!("invalid duration '{trimmed}': {err}")))
}

fn invalid_reason(err: &ConfigError) -> String {
    match err {
        ConfigError::Invalid(reason) => reason.clone(),
        other => other.to_string(),
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            app: AppSettings::default(),
            presentation: PresentationSettings::default(),
            windows: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: PipelineConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn window_names(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }

    /// Merges per-window overrides with the presentation defaults.
    ///
    /// Unknown names resolve to the default window settings.
    pub fn resolve_window(&self, name: &str) -> ResolvedWindow {
        let fallback = WindowSettings::default();
        let window = self.windows.get(name).unwrap_or(&fallback);
        let fps = normalize_fps(window.target_fps).or(normalize_fps(self.presentation.target_fps));
        ResolvedWindow {
            name: name.to_string(),
            width: window.width,
            height: window.height,
            density: window.density,
            padding: window.padding,
            frame_interval: frame_interval_for(fps),
            render_on_demand: window
                .render_on_demand
                .unwrap_or(self.presentation.render_on_demand),
            engine_update_interval: self.presentation.engine_update_interval,
            use_present_window: self.presentation.use_present_window,
            follow_display_link: self.presentation.follow_display_link,
            pre_start_frame: self.presentation.pre_start_frame,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if self.app.update_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "app.update_interval must be greater than zero".into(),
            ));
        }

        if self.app.max_delta.is_zero() {
            return Err(ConfigError::Invalid(
                "app.max_delta must be greater than zero".into(),
            ));
        }

        if let Some(fps) = self.presentation.target_fps {
            frame_interval(fps).map_err(|err| {
                ConfigError::Invalid(format!("presentation.target_fps: {}", invalid_reason(&err)))
            })?;
        }

        for (name, window) in &self.windows {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("window name may not be empty".into()));
            }

            if window.width == 0 || window.height == 0 {
                return Err(ConfigError::Invalid(format!(
                    "window '{name}' extent must be non-zero, got {}x{}",
                    window.width, window.height
                )));
            }

            if !(window.density > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "window '{name}' density must be > 0"
                )));
            }

            let padding = window.padding;
            if [padding.top, padding.right, padding.bottom, padding.left]
                .iter()
                .any(|value| *value < 0.0)
            {
                return Err(ConfigError::Invalid(format!(
                    "window '{name}' padding must be non-negative"
                )));
            }

            if let Some(fps) = window.target_fps {
                frame_interval(fps).map_err(|err| {
                    ConfigError::Invalid(format!(
                        "window '{name}' target_fps: {}",
                        invalid_reason(&err)
                    ))
                })?;
            }
        }

        Ok(())
    }
}
