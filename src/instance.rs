//! Execution context for one untrusted script.
//!
//! An [`Instance`] moves through `Uninitialized -> Initialized -> (Errored | Deinitialized)`.
//! Every piece of script code it runs goes through the same window: libraries are notified
//! (`prepare`), the current-instance slot is claimed, the code runs under the CPU sampler,
//! libraries are notified again (`cleanup`, with the failure if any) and the slot is released.
//! The first failure poisons the instance: it leaves the registry and refuses further work.

use std::any::Any;
use std::rc::{Rc, Weak};

use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, Scope};

use crate::config::{QuotaConfig, RuntimeConfig};
use crate::error::ScriptFailure;
use crate::hooks::{into_values, is_truthy, HookIter, HookTableHandle, HookValues};
use crate::libraries::{
    CpuLibrary, DataStore, HookLibrary, LibraryContext, LibraryEnv, LibraryEvent, LibraryManager,
    PrintLibrary, ScriptLibrary,
};
use crate::loader::CompiledScripts;
use crate::protected::{CpuAccounting, ProtectedRunner, SamplerSlot};
use crate::registry::{self, ExecutionGuard, InstanceId};
use crate::time::{Clock, SystemClock};

/// Hook label used while the entry script runs.
pub const INITIALIZE_HOOK: &str = "_initialize";
/// Hook label used for ad-hoc function calls.
pub const FUNCTION_HOOK: &str = "_function";

pub type ErrorHandler = Box<dyn FnMut(InstanceId, &str, &str)>;

pub struct Instance {
    id: InstanceId,
    engine: Engine,
    environment: Scope<'static>,
    scripts: CompiledScripts,
    hooks: HookTableHandle,
    libraries: LibraryManager,
    data: DataStore,
    owner: Option<Weak<dyn Any>>,
    config: QuotaConfig,
    runner: ProtectedRunner,
    initialized: bool,
    errored: bool,
    deinitialized: bool,
    error_handler: Option<ErrorHandler>,
}

impl Instance {
    /// Builds an instance with the hook, cpu and print libraries installed.
    pub fn new(scripts: CompiledScripts, config: &RuntimeConfig) -> Self {
        let mut instance = Self::bare(scripts, config);
        instance.install_library(Box::new(HookLibrary::default()));
        instance.install_library(Box::new(CpuLibrary));
        instance.install_library(Box::new(PrintLibrary::default()));
        instance
    }

    /// Builds an instance without any library installed.
    pub fn bare(scripts: CompiledScripts, config: &RuntimeConfig) -> Self {
        if let Err(err) = config.quota.validate() {
            panic!("invalid quota configuration: {err}");
        }
        let id = InstanceId::next();
        let mut engine = Engine::new();
        engine.set_max_call_levels(config.max_call_levels);
        engine.set_max_expr_depths(config.max_expr_depth, config.max_expr_depth);
        engine.set_module_resolver(scripts.resolver());
        let slot = SamplerSlot::default();
        slot.attach(&mut engine);
        let clock: Rc<dyn Clock> = Rc::new(SystemClock::new());
        let accounting = Rc::new(CpuAccounting::new(&config.quota));
        let runner = ProtectedRunner::new(slot, clock, accounting, config.quota.sample_interval);
        Self {
            id,
            engine,
            environment: Scope::new(),
            scripts,
            hooks: HookTableHandle::new(),
            libraries: LibraryManager::default(),
            data: DataStore::default(),
            owner: None,
            config: config.quota.clone(),
            runner,
            initialized: false,
            errored: false,
            deinitialized: false,
            error_handler: None,
        }
    }

    pub fn with_library(mut self, library: Box<dyn ScriptLibrary>) -> Self {
        self.install_library(library);
        self
    }

    pub fn with_clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.runner.set_clock(clock);
        self
    }

    pub fn with_owner(mut self, owner: Weak<dyn Any>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn install_library(&mut self, library: Box<dyn ScriptLibrary>) {
        assert!(!self.initialized, "libraries must be installed before initialize");
        let env = LibraryEnv {
            instance: self.id,
            hooks: self.hooks.clone(),
            accounting: self.runner.accounting().clone(),
        };
        self.libraries.install(library, &mut self.engine, &env);
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    pub fn is_deinitialized(&self) -> bool {
        self.deinitialized
    }

    pub fn scripts(&self) -> &CompiledScripts {
        &self.scripts
    }

    pub fn hooks(&self) -> &HookTableHandle {
        &self.hooks
    }

    pub fn quota(&self) -> &QuotaConfig {
        &self.config
    }

    /// Variables the entry script runs against; hosts may seed constants before `initialize`.
    pub fn environment(&self) -> &Scope<'static> {
        &self.environment
    }

    pub fn environment_mut(&mut self) -> &mut Scope<'static> {
        &mut self.environment
    }

    pub fn data_store(&self) -> &DataStore {
        &self.data
    }

    pub fn data_store_mut(&mut self) -> &mut DataStore {
        &mut self.data
    }

    pub fn owner(&self) -> Option<Rc<dyn Any>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    pub fn libraries(&self) -> &LibraryManager {
        &self.libraries
    }

    pub fn library<T: ScriptLibrary + 'static>(&self) -> Option<&T> {
        self.libraries.get::<T>()
    }

    pub fn library_mut<T: ScriptLibrary + 'static>(&mut self) -> Option<&mut T> {
        self.libraries.get_mut::<T>()
    }

    pub fn set_error_handler(&mut self, handler: impl FnMut(InstanceId, &str, &str) + 'static) {
        self.error_handler = Some(Box::new(handler));
    }

    pub fn clear_error_handler(&mut self) {
        self.error_handler = None;
    }

    pub fn cpu_current(&self) -> f64 {
        self.runner.accounting().current()
    }

    pub fn cpu_average(&self) -> f64 {
        self.runner.accounting().average()
    }

    /// Average that folding the current sample into the committed one would give.
    pub fn moving_cpu_average(&self) -> f64 {
        self.runner.accounting().moving_average()
    }

    pub fn sampler_active(&self) -> bool {
        self.runner.sampler_installed()
    }

    /// Runs the entry script. May be called once; a failure leaves the instance errored and
    /// outside the registry.
    pub fn initialize(&mut self) -> Result<(), ScriptFailure> {
        assert!(!self.initialized, "instance {} initialized twice", self.id);
        self.initialized = true;
        self.notify(LibraryEvent::Initialize);

        let guard = self.prepare(INITIALIZE_HOOK);
        let main = self.scripts.main_ast();
        let outcome = self
            .runner
            .run_with_ops(self.scripts.mainfile(), || self.engine.run_ast_with_scope(&mut self.environment, main));
        match outcome {
            Ok(()) => {
                registry::insert(self.id);
                self.cleanup(INITIALIZE_HOOK, guard, None);
                log::info!("[instance:{}] initialized '{}'", self.id, self.scripts.mainfile());
                Ok(())
            }
            Err(failure) => {
                self.mark_errored();
                self.cleanup(INITIALIZE_HOOK, guard, Some(&failure));
                log::error!("[instance:{}] initialization failed: {failure}", self.id);
                Err(failure)
            }
        }
    }

    /// Lazily dispatches `hook` to its handlers, one outcome per handler.
    pub fn iterate(&mut self, hook: &str, args: &[Dynamic]) -> HookIter<'_> {
        assert!(self.initialized, "instance {} ran hook '{hook}' before initialize", self.id);
        HookIter::new(self, hook, args)
    }

    /// Runs every handler of `hook`, stopping at the first failure.
    pub fn run_script_hook(&mut self, hook: &str, args: &[Dynamic]) -> Result<(), ScriptFailure> {
        for outcome in self.iterate(hook, args) {
            outcome?;
        }
        Ok(())
    }

    /// Runs handlers of `hook` until one returns values whose first element is truthy.
    pub fn run_script_hook_for_result(
        &mut self,
        hook: &str,
        args: &[Dynamic],
    ) -> Result<Option<HookValues>, ScriptFailure> {
        for outcome in self.iterate(hook, args) {
            let values = outcome?;
            if values.first().is_some_and(is_truthy) {
                return Ok(Some(values));
            }
        }
        Ok(None)
    }

    /// Calls a script-owned callable outside the hook table and returns its raw result.
    pub fn run_function(&mut self, function: &FnPtr, args: &[Dynamic]) -> Result<Dynamic, ScriptFailure> {
        assert!(self.initialized, "instance {} ran a function before initialize", self.id);
        assert!(!self.errored, "instance {} ran a function after it errored", self.id);
        self.call_handler(FUNCTION_HOOK, function, None, args.to_vec())
    }

    /// Like [`Instance::run_function`], returning the result as a value list.
    pub fn run_function_t(&mut self, function: &FnPtr, args: &[Dynamic]) -> Result<HookValues, ScriptFailure> {
        self.run_function(function, args).map(into_values)
    }

    /// Notifies libraries, leaves the registry and refuses any further execution.
    /// Repeated calls are no-ops apart from keeping the instance errored.
    pub fn deinitialize(&mut self) {
        if !self.deinitialized {
            self.deinitialized = true;
            self.notify(LibraryEvent::Deinitialize);
            if registry::remove(self.id) {
                log::info!("[instance:{}] deinitialized", self.id);
            }
        }
        self.errored = true;
    }

    /// Top-level failure sink for host integration points. A custom handler replaces the
    /// default teardown entirely.
    pub fn error(&mut self, message: &str, trace: &str) {
        if let Some(mut handler) = self.error_handler.take() {
            handler(self.id, message, trace);
            if self.error_handler.is_none() {
                self.error_handler = Some(handler);
            }
            return;
        }
        log::error!("[instance:{}] {message}\n{trace}", self.id);
        self.deinitialize();
    }

    /// Routes a failure returned by one of the run operations through [`Instance::error`].
    pub fn report(&mut self, failure: &ScriptFailure) {
        self.error(&failure.message(), &failure.trace);
    }

    /// One prepare/execute/cleanup step; marks the instance errored on failure. `script` names
    /// the script whose functions the handler is resolved against.
    pub(crate) fn call_handler(
        &mut self,
        hook: &str,
        handler: &FnPtr,
        script: Option<&str>,
        args: Vec<Dynamic>,
    ) -> Result<Dynamic, ScriptFailure> {
        let guard = self.prepare(hook);
        let functions = self.scripts.functions_for(script);
        let engine = &self.engine;
        let outcome = self.runner.run_with_ops(hook, || -> Result<Dynamic, Box<EvalAltResult>> {
            handler.call(engine, functions, args)
        });
        if outcome.is_err() {
            self.mark_errored();
        }
        self.cleanup(hook, guard, outcome.as_ref().err());
        outcome
    }

    fn prepare(&mut self, hook: &str) -> ExecutionGuard {
        self.notify(LibraryEvent::Prepare { hook });
        registry::enter(self.id)
    }

    fn cleanup(&mut self, hook: &str, guard: ExecutionGuard, failure: Option<&ScriptFailure>) {
        self.notify(LibraryEvent::Cleanup { hook, failure });
        drop(guard);
    }

    fn notify(&mut self, event: LibraryEvent<'_>) {
        let mut ctx = LibraryContext { instance: self.id, data: &mut self.data };
        self.libraries.notify(event, &mut ctx);
    }

    fn mark_errored(&mut self) {
        self.errored = true;
        registry::remove(self.id);
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        registry::remove(self.id);
    }
}
