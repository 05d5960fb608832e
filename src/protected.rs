//! Protected execution of script code with cooperative CPU quota enforcement.
//!
//! The engine invokes a progress callback on every operation. [`SamplerSlot`] attaches that
//! callback once per engine; it stays inert until [`ProtectedRunner::run_with_ops`] installs a
//! [`Sampler`] for the duration of one call. The sampler fires every `sample_interval`
//! operations, measures wall time since the call started and terminates the call with
//! [`QUOTA_EXCEEDED_MESSAGE`] once the smoothed cost would exceed the quota.
//!
//! The smoothing is a fixed-weight exponential average, `avg' = (avg * (n - 1) + current) / n`,
//! not a sliding window over the last `n` calls. The stored average is committed exactly once
//! per protected call, after the call returns; the sampler only evaluates the prospective value.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use rhai::{Dynamic, Engine, EvalAltResult};

use crate::config::QuotaConfig;
use crate::error::{ScriptFailure, QUOTA_EXCEEDED_MESSAGE};
use crate::time::Clock;

pub fn moving_average(previous: f64, current: f64, window: u32) -> f64 {
    let n = f64::from(window.max(1));
    (previous * (n - 1.0) + current) / n
}

/// CPU cost bookkeeping shared between an instance, its sampler and the script-facing cpu library.
#[derive(Debug)]
pub struct CpuAccounting {
    current: Cell<f64>,
    average: Cell<f64>,
    max: f64,
    window: u32,
}

impl CpuAccounting {
    pub fn new(quota: &QuotaConfig) -> Self {
        Self {
            current: Cell::new(0.0),
            average: Cell::new(0.0),
            max: quota.max_cpu_time.as_secs_f64(),
            window: quota.averaging_window,
        }
    }

    /// Seconds spent in the current (or most recent) protected call.
    pub fn current(&self) -> f64 {
        self.current.get()
    }

    /// Committed moving average, in seconds.
    pub fn average(&self) -> f64 {
        self.average.get()
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    /// Average that would result from folding in the current sample.
    pub fn moving_average(&self) -> f64 {
        moving_average(self.average.get(), self.current.get(), self.window)
    }

    pub fn used_ratio(&self) -> f64 {
        self.moving_average() / self.max
    }

    fn record(&self, elapsed: Duration) {
        self.current.set(elapsed.as_secs_f64());
    }

    fn commit(&self) {
        self.average.set(self.moving_average());
    }
}

struct Sampler {
    start: Duration,
    clock: Rc<dyn Clock>,
    accounting: Rc<CpuAccounting>,
    interval: u64,
}

/// Single-slot holder for the sampler of the protected call in flight.
#[derive(Clone, Default)]
pub struct SamplerSlot(Rc<RefCell<Option<Sampler>>>);

impl SamplerSlot {
    /// Routes the engine's progress callback through this slot.
    pub fn attach(&self, engine: &mut Engine) {
        let slot = self.clone();
        engine.on_progress(move |ops| slot.sample(ops));
    }

    pub fn is_installed(&self) -> bool {
        self.0.borrow().is_some()
    }

    fn install(&self, sampler: Sampler) -> SamplerGuard {
        let mut slot = self.0.borrow_mut();
        assert!(slot.is_none(), "sampler installed while another protected call is in flight");
        *slot = Some(sampler);
        SamplerGuard { slot: self.clone() }
    }

    fn sample(&self, ops: u64) -> Option<Dynamic> {
        let mut slot = self.0.borrow_mut();
        let sampler = slot.as_ref()?;
        if ops % sampler.interval != 0 {
            return None;
        }
        let elapsed = sampler.clock.now().saturating_sub(sampler.start);
        sampler.accounting.record(elapsed);
        if sampler.accounting.moving_average() > sampler.accounting.max() {
            slot.take();
            return Some(Dynamic::from(QUOTA_EXCEEDED_MESSAGE.to_string()));
        }
        None
    }
}

/// Uninstalls the sampler when the protected call leaves scope, on every exit path.
struct SamplerGuard {
    slot: SamplerSlot,
}

impl Drop for SamplerGuard {
    fn drop(&mut self) {
        self.slot.0.borrow_mut().take();
    }
}

pub struct ProtectedRunner {
    slot: SamplerSlot,
    clock: Rc<dyn Clock>,
    accounting: Rc<CpuAccounting>,
    sample_interval: u64,
}

impl ProtectedRunner {
    pub fn new(slot: SamplerSlot, clock: Rc<dyn Clock>, accounting: Rc<CpuAccounting>, sample_interval: u64) -> Self {
        Self { slot, clock, accounting, sample_interval: sample_interval.max(1) }
    }

    pub fn set_clock(&mut self, clock: Rc<dyn Clock>) {
        self.clock = clock;
    }

    pub fn accounting(&self) -> &Rc<CpuAccounting> {
        &self.accounting
    }

    pub fn sampler_installed(&self) -> bool {
        self.slot.is_installed()
    }

    /// Runs `call` with the sampler installed and converts any raised failure.
    /// `chunk` labels the running code in traces when the failure carries no source.
    pub fn run_with_ops<T>(
        &self,
        chunk: &str,
        call: impl FnOnce() -> Result<T, Box<EvalAltResult>>,
    ) -> Result<T, ScriptFailure> {
        let start = self.clock.now();
        log::debug!("sampling '{chunk}' every {} operations", self.sample_interval);
        let outcome = {
            let _guard = self.slot.install(Sampler {
                start,
                clock: self.clock.clone(),
                accounting: self.accounting.clone(),
                interval: self.sample_interval,
            });
            call()
        };
        self.accounting.record(self.clock.now().saturating_sub(start));
        self.accounting.commit();
        outcome.map_err(|err| ScriptFailure::from_eval(*err, chunk))
    }
}
