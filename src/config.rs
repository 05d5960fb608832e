use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Budget for the smoothed CPU cost of a single protected call.
    #[serde(rename = "max_cpu_time_secs", with = "secs_f64", default = "QuotaConfig::default_max_cpu_time")]
    pub max_cpu_time: Duration,
    /// Weight `n` of the moving average: `avg' = (avg * (n - 1) + current) / n`.
    #[serde(default = "QuotaConfig::default_averaging_window")]
    pub averaging_window: u32,
    /// Engine operations between two sampler firings.
    #[serde(default = "QuotaConfig::default_sample_interval")]
    pub sample_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default = "RuntimeConfig::default_max_call_levels")]
    pub max_call_levels: usize,
    #[serde(default = "RuntimeConfig::default_max_expr_depth")]
    pub max_expr_depth: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotaOverrides {
    pub max_cpu_time: Option<Duration>,
    pub averaging_window: Option<u32>,
    pub sample_interval: Option<u64>,
}

impl QuotaConfig {
    fn default_max_cpu_time() -> Duration {
        Duration::from_millis(4)
    }

    const fn default_averaging_window() -> u32 {
        100
    }

    const fn default_sample_interval() -> u64 {
        500
    }

    pub fn validate(&self) -> Result<()> {
        if self.averaging_window == 0 {
            bail!("averaging_window must be at least 1");
        }
        if self.sample_interval == 0 {
            bail!("sample_interval must be at least 1");
        }
        if self.max_cpu_time.is_zero() {
            bail!("max_cpu_time_secs must be positive");
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &QuotaOverrides) {
        if let Some(max) = overrides.max_cpu_time {
            self.max_cpu_time = max;
        }
        if let Some(window) = overrides.averaging_window {
            self.averaging_window = window;
        }
        if let Some(interval) = overrides.sample_interval {
            self.sample_interval = interval;
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_cpu_time: Self::default_max_cpu_time(),
            averaging_window: Self::default_averaging_window(),
            sample_interval: Self::default_sample_interval(),
        }
    }
}

impl RuntimeConfig {
    const fn default_max_call_levels() -> usize {
        64
    }

    const fn default_max_expr_depth() -> usize {
        64
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        cfg.quota.validate().with_context(|| format!("Invalid quota in {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            quota: QuotaConfig::default(),
            max_call_levels: Self::default_max_call_levels(),
            max_expr_depth: Self::default_max_expr_depth(),
        }
    }
}

impl QuotaOverrides {
    pub fn is_empty(&self) -> bool {
        self.max_cpu_time.is_none() && self.averaging_window.is_none() && self.sample_interval.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.max_cpu_time.is_some() {
            fields.push("max_cpu_time");
        }
        if self.averaging_window.is_some() {
            fields.push("averaging_window");
        }
        if self.sample_interval.is_some() {
            fields.push("sample_interval");
        }
        fields
    }
}

mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
