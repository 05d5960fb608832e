pub mod cli;
pub mod config;
pub mod error;
pub mod hooks;
pub mod instance;
pub mod libraries;
pub mod loader;
pub mod protected;
pub mod registry;
pub mod script_harness;
pub mod time;

pub use config::{QuotaConfig, RuntimeConfig};
pub use error::{ScriptError, ScriptFailure, QUOTA_EXCEEDED_MESSAGE};
pub use hooks::{HookIter, HookOutcome, HookValues};
pub use instance::Instance;
pub use libraries::{LibraryContext, LibraryEnv, LibraryEvent, ScriptLibrary};
pub use loader::{CompiledScripts, ScriptLoader};
pub use registry::{active_instances, current_instance, InstanceId};
