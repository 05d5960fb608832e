use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::Result;
use rhai::{Engine, FnPtr, NativeCallContext};

use crate::error::ScriptFailure;
use crate::hooks::HookTableHandle;
use crate::protected::CpuAccounting;
use crate::registry::InstanceId;

/// Lifecycle points at which registered libraries are notified.
#[derive(Debug, Clone, Copy)]
pub enum LibraryEvent<'a> {
    Initialize,
    Prepare { hook: &'a str },
    Cleanup { hook: &'a str, failure: Option<&'a ScriptFailure> },
    Deinitialize,
}

impl LibraryEvent<'_> {
    pub fn label(&self) -> &'static str {
        match self {
            LibraryEvent::Initialize => "initialize",
            LibraryEvent::Prepare { .. } => "prepare",
            LibraryEvent::Cleanup { .. } => "cleanup",
            LibraryEvent::Deinitialize => "deinitialize",
        }
    }
}

/// Per-library state owned by an instance, keyed by library name.
#[derive(Default)]
pub struct DataStore {
    entries: HashMap<&'static str, Box<dyn Any>>,
}

impl DataStore {
    pub fn insert<T: Any>(&mut self, library: &'static str, value: T) {
        self.entries.insert(library, Box::new(value));
    }

    pub fn get<T: Any>(&self, library: &str) -> Option<&T> {
        self.entries.get(library).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any>(&mut self, library: &str) -> Option<&mut T> {
        self.entries.get_mut(library).and_then(|value| value.downcast_mut::<T>())
    }

    /// Returns the library's state, creating a default one when missing or of another type.
    pub fn get_or_default<T: Any + Default>(&mut self, library: &'static str) -> &mut T {
        let entry = self.entries.entry(library).or_insert_with(|| Box::new(T::default()));
        if !entry.is::<T>() {
            *entry = Box::new(T::default());
        }
        entry.downcast_mut::<T>().expect("entry was just replaced with the requested type")
    }

    pub fn remove(&mut self, library: &str) -> bool {
        self.entries.remove(library).is_some()
    }

    pub fn contains(&self, library: &str) -> bool {
        self.entries.contains_key(library)
    }
}

/// Handles a library receives when it is installed into an instance's engine.
#[derive(Clone)]
pub struct LibraryEnv {
    pub instance: InstanceId,
    pub hooks: HookTableHandle,
    pub accounting: Rc<CpuAccounting>,
}

pub struct LibraryContext<'a> {
    pub instance: InstanceId,
    pub data: &'a mut DataStore,
}

/// A capability exposed to scripts, with hooks into the instance lifecycle.
pub trait ScriptLibrary: Any {
    fn name(&self) -> &'static str;

    fn install(&mut self, _engine: &mut Engine, _env: &LibraryEnv) {}

    fn initialize(&mut self, _ctx: &mut LibraryContext<'_>) -> Result<()> {
        Ok(())
    }

    fn prepare(&mut self, _ctx: &mut LibraryContext<'_>, _hook: &str) -> Result<()> {
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut LibraryContext<'_>, _hook: &str, _failure: Option<&ScriptFailure>) -> Result<()> {
        Ok(())
    }

    fn deinitialize(&mut self, _ctx: &mut LibraryContext<'_>) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Broadcasts lifecycle events to every installed library, in installation order.
#[derive(Default)]
pub struct LibraryManager {
    libraries: Vec<Box<dyn ScriptLibrary>>,
}

impl LibraryManager {
    pub fn install(&mut self, mut library: Box<dyn ScriptLibrary>, engine: &mut Engine, env: &LibraryEnv) {
        library.install(engine, env);
        log::debug!("[instance:{}] installed library '{}'", env.instance, library.name());
        self.libraries.push(library);
    }

    /// A failing listener is logged and skipped; the remaining listeners are still notified.
    pub fn notify(&mut self, event: LibraryEvent<'_>, ctx: &mut LibraryContext<'_>) {
        for library in &mut self.libraries {
            let result = match event {
                LibraryEvent::Initialize => library.initialize(ctx),
                LibraryEvent::Prepare { hook } => library.prepare(ctx, hook),
                LibraryEvent::Cleanup { hook, failure } => library.cleanup(ctx, hook, failure),
                LibraryEvent::Deinitialize => library.deinitialize(ctx),
            };
            if let Err(err) = result {
                log::warn!("[library:{}] {} failed: {err:?}", library.name(), event.label());
            }
        }
    }

    pub fn get<T: ScriptLibrary + 'static>(&self) -> Option<&T> {
        self.libraries.iter().find_map(|library| library.as_any().downcast_ref::<T>())
    }

    pub fn get_mut<T: ScriptLibrary + 'static>(&mut self) -> Option<&mut T> {
        self.libraries.iter_mut().find_map(|library| library.as_any_mut().downcast_mut::<T>())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.libraries.iter().map(|library| library.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }
}

/// `hook_add(hook, name, fn)` / `hook_remove(hook, name)` for scripts.
#[derive(Default)]
pub struct HookLibrary {
    hooks: Option<HookTableHandle>,
}

impl ScriptLibrary for HookLibrary {
    fn name(&self) -> &'static str {
        "hook"
    }

    fn install(&mut self, engine: &mut Engine, env: &LibraryEnv) {
        let hooks = env.hooks.clone();
        engine.register_fn("hook_add", move |ctx: NativeCallContext, hook: &str, name: &str, handler: FnPtr| {
            hooks.borrow_mut().add_from(hook, name, handler, ctx.source().map(str::to_string));
        });
        let hooks = env.hooks.clone();
        engine.register_fn("hook_remove", move |hook: &str, name: &str| hooks.borrow_mut().remove(hook, name));
        self.hooks = Some(env.hooks.clone());
    }

    fn deinitialize(&mut self, _ctx: &mut LibraryContext<'_>) -> Result<()> {
        if let Some(hooks) = &self.hooks {
            hooks.borrow_mut().clear();
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Read-only view of the instance's CPU accounting: `cpu_current()`, `cpu_average()`,
/// `cpu_max()` and `cpu_used_ratio()`, all in seconds except the ratio.
#[derive(Default)]
pub struct CpuLibrary;

impl ScriptLibrary for CpuLibrary {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn install(&mut self, engine: &mut Engine, env: &LibraryEnv) {
        let accounting = env.accounting.clone();
        engine.register_fn("cpu_current", move || accounting.current());
        let accounting = env.accounting.clone();
        engine.register_fn("cpu_average", move || accounting.moving_average());
        let accounting = env.accounting.clone();
        engine.register_fn("cpu_max", move || accounting.max());
        let accounting = env.accounting.clone();
        engine.register_fn("cpu_used_ratio", move || accounting.used_ratio());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PrintStats {
    pub last_call_lines: usize,
    pub total_lines: usize,
}

/// Routes `print`/`debug` to the log and buffers printed lines for the host.
#[derive(Default)]
pub struct PrintLibrary {
    lines: Rc<RefCell<Vec<String>>>,
    mark: usize,
}

impl PrintLibrary {
    pub fn take_output(&mut self) -> Vec<String> {
        self.mark = 0;
        std::mem::take(&mut *self.lines.borrow_mut())
    }

    pub fn output(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }
}

impl ScriptLibrary for PrintLibrary {
    fn name(&self) -> &'static str {
        "print"
    }

    fn install(&mut self, engine: &mut Engine, env: &LibraryEnv) {
        let id = env.instance;
        let lines = self.lines.clone();
        engine.on_print(move |text| {
            log::info!("[script:{id}] {text}");
            lines.borrow_mut().push(text.to_string());
        });
        engine.on_debug(move |text, source, pos| {
            let src_info = source.map_or_else(String::new, |s| format!(" in '{s}'"));
            let pos_info = if pos.is_none() { String::new() } else { format!(" @ {pos}") };
            log::debug!("[script:{id}]{src_info}{pos_info}: {text}");
        });
    }

    fn prepare(&mut self, ctx: &mut LibraryContext<'_>, _hook: &str) -> Result<()> {
        self.mark = self.lines.borrow().len();
        ctx.data.get_or_default::<PrintStats>(self.name()).last_call_lines = 0;
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut LibraryContext<'_>, _hook: &str, _failure: Option<&ScriptFailure>) -> Result<()> {
        let printed = self.lines.borrow().len().saturating_sub(self.mark);
        let stats = ctx.data.get_or_default::<PrintStats>(self.name());
        stats.last_call_lines = printed;
        stats.total_lines += printed;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
