use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rhai::Dynamic;
use serde::{Deserialize, Serialize};

use crate::config::{QuotaConfig, QuotaOverrides, RuntimeConfig};
use crate::error::ScriptFailure;
use crate::instance::Instance;
use crate::libraries::PrintLibrary;
use crate::loader::ScriptLoader;
use crate::registry;
use crate::time::ManualClock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessFixture {
    #[serde(default = "default_mainfile")]
    pub mainfile: String,
    pub scripts: BTreeMap<String, ScriptSource>,
    /// Replaces the runtime quota for this fixture.
    #[serde(default)]
    pub quota: Option<QuotaConfig>,
    /// Drives the instance with a manual clock advancing this many microseconds per reading.
    #[serde(default)]
    pub clock_step_us: Option<u64>,
    #[serde(default)]
    pub steps: Vec<FixtureStep>,
    /// Directory that relative script paths are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ScriptSource {
    Inline { source: String },
    File { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureStep {
    pub kind: StepKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Initialize,
    Hook,
    HookForResult,
    Deinitialize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessOutput {
    pub mainfile: String,
    pub results: Vec<StepResult>,
    pub errored: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step: usize,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

impl HarnessFixture {
    /// Applies command-line overrides to the quota this fixture will run with: its own quota
    /// when it has one, otherwise a copy of `base`.
    pub fn apply_quota_overrides(&mut self, base: &QuotaConfig, overrides: &QuotaOverrides) {
        self.quota.get_or_insert_with(|| base.clone()).apply_overrides(overrides);
    }
}

fn default_mainfile() -> String {
    "main".to_string()
}

pub fn run_fixture(fixture: &HarnessFixture) -> Result<HarnessOutput> {
    run_fixture_with_config(fixture, &RuntimeConfig::default())
}

/// Loads the fixture's scripts, initializes one instance and replays the steps in order.
/// Step 0 is always the initialization. A failing step is reported to the instance the way a
/// host would, so later steps observe the errored state.
pub fn run_fixture_with_config(fixture: &HarnessFixture, config: &RuntimeConfig) -> Result<HarnessOutput> {
    let mut config = config.clone();
    if let Some(quota) = &fixture.quota {
        config.quota = quota.clone();
    }
    config.quota.validate().context("fixture quota")?;

    let mut loader = ScriptLoader::new(&config);
    for (name, script) in &fixture.scripts {
        match script {
            ScriptSource::Inline { source } => {
                loader.add_source(name.as_str(), source.as_str());
            }
            ScriptSource::File { path } => {
                let resolved = match &fixture.base_dir {
                    Some(base) if path.is_relative() => base.join(path),
                    _ => path.clone(),
                };
                loader.add_file(name.as_str(), resolved)?;
            }
        }
    }
    loader.set_mainfile(fixture.mainfile.as_str());
    let scripts = loader.compile()?;

    let mut instance = Instance::new(scripts, &config);
    if let Some(step_us) = fixture.clock_step_us {
        instance = instance.with_clock(Rc::new(ManualClock::new(Duration::from_micros(step_us))));
    }

    let mut results = Vec::with_capacity(fixture.steps.len() + 1);
    let init = instance.initialize();
    results.push(record_step(&mut instance, 0, StepKind::Initialize, "", init.map(|()| Vec::new())));

    for (idx, step) in fixture.steps.iter().enumerate() {
        let outcome = match step.kind {
            StepKind::Initialize => {
                return Err(anyhow!("step {} re-initializes the instance", idx + 1));
            }
            StepKind::Hook => {
                let args = to_dynamic_args(&step.args)?;
                instance.run_script_hook(&step.name, &args).map(|()| Vec::new())
            }
            StepKind::HookForResult => {
                let args = to_dynamic_args(&step.args)?;
                instance.run_script_hook_for_result(&step.name, &args).map(Option::unwrap_or_default)
            }
            StepKind::Deinitialize => {
                instance.deinitialize();
                Ok(Vec::new())
            }
        };
        results.push(record_step(&mut instance, idx + 1, step.kind, &step.name, outcome));
    }

    Ok(HarnessOutput {
        mainfile: fixture.mainfile.clone(),
        results,
        errored: instance.is_errored(),
        active: registry::is_active(instance.id()),
    })
}

fn record_step(
    instance: &mut Instance,
    step: usize,
    kind: StepKind,
    name: &str,
    outcome: Result<Vec<Dynamic>, ScriptFailure>,
) -> StepResult {
    let (ok, message, values) = match outcome {
        Ok(values) => (true, None, values.iter().map(to_json).collect()),
        Err(failure) => {
            instance.report(&failure);
            (false, Some(failure.message()), Vec::new())
        }
    };
    let logs = instance.library_mut::<PrintLibrary>().map(PrintLibrary::take_output).unwrap_or_default();
    StepResult { step, kind, name: name.to_string(), ok, message, values, logs }
}

fn to_dynamic_args(args: &[serde_json::Value]) -> Result<Vec<Dynamic>> {
    args.iter()
        .map(|arg| rhai::serde::to_dynamic(arg).map_err(|err| anyhow!("converting argument {arg}: {err}")))
        .collect()
}

fn to_json(value: &Dynamic) -> serde_json::Value {
    rhai::serde::from_dynamic::<serde_json::Value>(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()))
}

pub fn load_fixture<P: AsRef<Path>>(path: P) -> Result<HarnessFixture> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening fixture '{}'", path.display()))?;
    let mut fixture: HarnessFixture = serde_json::from_reader(file).with_context(|| "parsing fixture JSON")?;
    fixture.base_dir = path.parent().map(Path::to_path_buf);
    Ok(fixture)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(json: &str) -> HarnessFixture {
        serde_json::from_str(json).expect("fixture parses")
    }

    #[test]
    fn script_sources_accept_inline_and_path_forms() {
        let parsed = fixture(
            r#"{ "scripts": { "main": { "source": "let a = 1;" }, "util": { "path": "util.rhai" } } }"#,
        );
        assert_eq!(parsed.mainfile, "main");
        assert!(matches!(parsed.scripts["main"], ScriptSource::Inline { .. }));
        assert!(matches!(parsed.scripts["util"], ScriptSource::File { .. }));
        assert!(parsed.steps.is_empty());
    }

    #[test]
    fn quota_overrides_target_the_quota_that_runs() {
        let base = QuotaConfig { averaging_window: 7, ..QuotaConfig::default() };
        let overrides = QuotaOverrides { sample_interval: Some(3), ..QuotaOverrides::default() };

        let mut inherits = fixture(r#"{ "scripts": { "main": { "source": "" } } }"#);
        inherits.apply_quota_overrides(&base, &overrides);
        let quota = inherits.quota.expect("quota materialized");
        assert_eq!(quota.averaging_window, 7);
        assert_eq!(quota.sample_interval, 3);

        let mut own = fixture(
            r#"{ "scripts": { "main": { "source": "" } }, "quota": { "averaging_window": 2 } }"#,
        );
        own.apply_quota_overrides(&base, &overrides);
        let quota = own.quota.expect("fixture quota kept");
        assert_eq!(quota.averaging_window, 2);
        assert_eq!(quota.sample_interval, 3);
    }

    #[test]
    fn initialization_failure_is_reported_as_step_zero() {
        let parsed = fixture(r#"{ "scripts": { "main": { "source": "throw \"nope\";" } } }"#);
        let output = run_fixture(&parsed).expect("harness runs");
        assert_eq!(output.results.len(), 1);
        assert!(!output.results[0].ok);
        assert_eq!(output.results[0].message.as_deref(), Some("nope"));
        assert!(output.errored);
        assert!(!output.active);
    }
}
