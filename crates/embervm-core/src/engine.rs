//! The call/return contract the bridge relies on from the wrapped engine.
//!
//! The engine is treated as an opaque external collaborator: bytecode
//! parsing, JIT/static compilation, the garbage collector, and the managed
//! heap all live behind this trait. The bridge only ever calls the engine
//! through these documented operations — never by reconstructing internal
//! object layouts.

use std::path::PathBuf;
use std::time::Duration;

use crate::value::Value;

/// Opaque reference to a module the engine has prepared for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleRef(u64);

impl ModuleRef {
    /// Wrap an engine-assigned module id.
    pub const fn new(raw: u64) -> Self {
        ModuleRef(raw)
    }

    /// The engine-assigned id.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Where module bytecode comes from.
///
/// `Static` models a statically linked build: nothing is read, the load is a
/// validity check, and downstream logic is source-agnostic because all three
/// converge on the same loaded phase.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// Bytecode file on disk
    File(PathBuf),
    /// Bytecode already in memory
    Memory(Vec<u8>),
    /// Code statically linked into the host binary
    Static,
}

impl ModuleSource {
    /// True for a statically linked module.
    pub fn is_static(&self) -> bool {
        matches!(self, ModuleSource::Static)
    }
}

/// Module resolution/preparation failures.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// The source did not resolve to readable bytecode
    #[error("not found: {0}")]
    NotFound(String),
    /// The bytes were readable but not a valid module
    #[error("parse error: {0}")]
    Parse(String),
}

/// Failure of the engine's one-time global bring-up or sys init.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct EngineInitError(pub String);

/// An exception raised by managed code and caught at the embedding boundary.
///
/// Never allowed to propagate as a native fault; the bridge converts it into
/// an error value plus a stringified record.
#[derive(Debug, Clone)]
pub struct ManagedException {
    /// The raised managed value, as seen from the host
    pub value: Value,
    /// Stringified call stack, outermost frame last
    pub stack: Vec<String>,
}

impl ManagedException {
    /// Exception raising a string value, with no stack.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            value: Value::Str(message.into()),
            stack: Vec::new(),
        }
    }

    /// Render value plus stack the way an uncaught-exception report reads.
    pub fn render(&self) -> String {
        let mut out = self.value.to_string();
        for frame in &self.stack {
            out.push_str("\nCalled from ");
            out.push_str(frame);
        }
        out
    }
}

/// Native stack base handed to the collector when a thread registers.
///
/// The collector scans from this address down to the thread's current stack
/// pointer, so it must be a real stack address near the top of the thread's
/// managed-call window — a heap address or null makes managed references on
/// the stack invisible to collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBase(usize);

impl StackBase {
    /// Capture the address of a marker local in the registering frame.
    pub fn from_marker<T>(marker: &T) -> Self {
        StackBase(marker as *const T as usize)
    }

    /// The raw address.
    pub fn addr(&self) -> usize {
        self.0
    }
}

/// Contract between the bridge and the wrapped execution engine.
///
/// Implementations are process-global by nature: `global_init` must be
/// idempotent so that VM restart within one process reuses the already
/// initialized engine instead of re-initializing it.
pub trait Engine: Send + Sync + 'static {
    /// One-time global engine bring-up. Idempotent.
    fn global_init(&self) -> Result<(), EngineInitError>;

    /// System-level init (argv and friends). Runs after `global_init`, on
    /// the thread that becomes the registered main thread.
    fn sys_init(&self, args: &[String]) -> Result<(), EngineInitError>;

    /// Resolve and prepare a module for execution.
    fn load_module(&self, source: &ModuleSource) -> Result<ModuleRef, ModuleError>;

    /// Release a prepared module. Must tolerate an already-released ref.
    fn unload_module(&self, module: ModuleRef);

    /// Invoke the module's designated entry function on the calling thread.
    ///
    /// The calling thread must hold a live GC registration. Uncaught managed
    /// exceptions come back as values, never as native faults.
    fn call_entry(&self, module: ModuleRef) -> Result<(), ManagedException>;

    /// Advance one tick of deferred managed work (timers, scheduled
    /// callbacks). Never blocks.
    fn pump_tick(&self, module: ModuleRef, delta: Duration) -> Result<(), ManagedException>;

    /// Cheap non-blocking query: is deferred work queued?
    fn has_pending_work(&self, module: ModuleRef) -> bool;

    /// Announce the calling thread's stack bounds to the collector.
    ///
    /// Callers go through [`crate::registry`], which guarantees the
    /// register/unregister pairing; engines only record the registration.
    fn register_thread(&self, stack_base: StackBase);

    /// Remove the calling thread from the collector's registry.
    fn unregister_thread(&self);

    /// Short human-readable name for a loaded module (debug banner).
    fn module_name(&self, module: ModuleRef) -> String;
}

/// Trivial conforming engine: no modules, instant entry, no pending work.
///
/// Exists so lifecycle and registration logic can be unit-tested without a
/// real engine.
#[derive(Debug, Default)]
pub struct NoopEngine;

impl NoopEngine {
    /// A fresh no-op engine.
    pub fn new() -> Self {
        NoopEngine
    }
}

impl Engine for NoopEngine {
    fn global_init(&self) -> Result<(), EngineInitError> {
        Ok(())
    }

    fn sys_init(&self, _args: &[String]) -> Result<(), EngineInitError> {
        Ok(())
    }

    fn load_module(&self, _source: &ModuleSource) -> Result<ModuleRef, ModuleError> {
        Ok(ModuleRef::new(0))
    }

    fn unload_module(&self, _module: ModuleRef) {}

    fn call_entry(&self, _module: ModuleRef) -> Result<(), ManagedException> {
        Ok(())
    }

    fn pump_tick(&self, _module: ModuleRef, _delta: Duration) -> Result<(), ManagedException> {
        Ok(())
    }

    fn has_pending_work(&self, _module: ModuleRef) -> bool {
        false
    }

    fn register_thread(&self, _stack_base: StackBase) {}

    fn unregister_thread(&self) {}

    fn module_name(&self, _module: ModuleRef) -> String {
        "noop".to_string()
    }
}
