use crate::config::QuotaOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    max_cpu_ms: Option<u64>,
    window: Option<u32>,
    sample_interval: Option<u64>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args().skip(1))
    }

    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut iter = args.into_iter();
        while let Some(raw_flag) = iter.next() {
            let flag = raw_flag.as_ref();
            if !flag.starts_with("--") {
                bail!("Unexpected argument '{flag}'. Use --max-cpu-ms/--window/--sample-interval with values.");
            }
            let key = &flag[2..];
            let value =
                iter.next().ok_or_else(|| anyhow!("Expected a value after '{flag}'"))?.as_ref().to_string();
            match key {
                "max-cpu-ms" => {
                    let ms = value.parse::<u64>().with_context(|| format!("Invalid max-cpu-ms '{value}'"))?;
                    if ms == 0 {
                        bail!("max-cpu-ms must be positive");
                    }
                    overrides.max_cpu_ms = Some(ms);
                }
                "window" => {
                    let window = value.parse::<u32>().with_context(|| format!("Invalid window '{value}'"))?;
                    if window == 0 {
                        bail!("window must be at least 1");
                    }
                    overrides.window = Some(window);
                }
                "sample-interval" => {
                    let interval =
                        value.parse::<u64>().with_context(|| format!("Invalid sample-interval '{value}'"))?;
                    if interval == 0 {
                        bail!("sample-interval must be at least 1");
                    }
                    overrides.sample_interval = Some(interval);
                }
                _ => bail!("Unknown flag '{flag}'. Supported flags: --max-cpu-ms, --window, --sample-interval."),
            }
        }
        Ok(overrides)
    }

    pub fn into_quota_overrides(self) -> QuotaOverrides {
        QuotaOverrides {
            max_cpu_time: self.max_cpu_ms.map(Duration::from_millis),
            averaging_window: self.window,
            sample_interval: self.sample_interval,
        }
    }
}
