//! A deterministic stand-in engine for the embervm embedding bridge.
//!
//! `StubEngine` satisfies the [`Engine`] contract with observable,
//! scriptable behavior: entry points print, block, schedule deferred work,
//! and throw on command, so every lifecycle and threading property of the
//! bridge can be exercised without a real managed runtime. It is a test
//! double, not a bytecode interpreter.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod script;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use embervm_core::{
    Engine, EngineInitError, ManagedException, ModuleError, ModuleRef, ModuleSource, StackBase,
    Value,
};

use script::{Action, Directive, Script};

/// Deferred work queued by an entry point.
#[derive(Debug, Clone)]
struct PendingTask {
    remaining: Duration,
    action: Action,
}

/// A loaded script module and its observable execution state.
struct ModuleState {
    name: String,
    program: Script,
    pending: Mutex<Vec<PendingTask>>,
    output: Mutex<Vec<String>>,
    entry_runs: AtomicU32,
    pump_calls: AtomicU32,
}

impl ModuleState {
    fn new(name: String, program: Script) -> Self {
        Self {
            name,
            program,
            pending: Mutex::new(Vec::new()),
            output: Mutex::new(Vec::new()),
            entry_runs: AtomicU32::new(0),
            pump_calls: AtomicU32::new(0),
        }
    }
}

/// Scriptable engine double.
pub struct StubEngine {
    globals_initialized: AtomicBool,
    args: Mutex<Vec<String>>,
    next_module: AtomicU64,
    modules: Mutex<HashMap<u64, Arc<ModuleState>>>,
    registered: Mutex<HashSet<ThreadId>>,
}

impl StubEngine {
    /// A fresh engine with no modules loaded.
    pub fn new() -> Self {
        Self {
            globals_initialized: AtomicBool::new(false),
            args: Mutex::new(Vec::new()),
            next_module: AtomicU64::new(1),
            modules: Mutex::new(HashMap::new()),
            registered: Mutex::new(HashSet::new()),
        }
    }

    fn module(&self, module: ModuleRef) -> Option<Arc<ModuleState>> {
        self.modules.lock().get(&module.raw()).cloned()
    }

    /// Lines printed by the module so far (entry plus fired timers).
    pub fn output(&self, module: ModuleRef) -> Vec<String> {
        self.module(module)
            .map(|m| m.output.lock().clone())
            .unwrap_or_default()
    }

    /// How many times the module's entry point ran to completion or threw.
    pub fn entry_runs(&self, module: ModuleRef) -> u32 {
        self.module(module)
            .map(|m| m.entry_runs.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// How many pump ticks actually entered this module.
    pub fn pump_calls(&self, module: ModuleRef) -> u32 {
        self.module(module)
            .map(|m| m.pump_calls.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Number of native threads currently registered with the collector.
    pub fn registered_thread_count(&self) -> usize {
        self.registered.lock().len()
    }

    /// Arguments recorded by `sys_init`.
    pub fn args(&self) -> Vec<String> {
        self.args.lock().clone()
    }

    fn load_script(&self, name: String, program: Script) -> ModuleRef {
        let id = self.next_module.fetch_add(1, Ordering::Relaxed);
        self.modules
            .lock()
            .insert(id, Arc::new(ModuleState::new(name, program)));
        ModuleRef::new(id)
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn module_display_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("module")
        .to_string()
}

fn throw(message: &str, module: &str) -> ManagedException {
    ManagedException {
        value: Value::Str(message.to_string()),
        stack: vec![format!("{}.entry", module)],
    }
}

impl Engine for StubEngine {
    fn global_init(&self) -> Result<(), EngineInitError> {
        // idempotent: restart within one process reuses the bring-up
        self.globals_initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn sys_init(&self, args: &[String]) -> Result<(), EngineInitError> {
        if !self.globals_initialized.load(Ordering::Acquire) {
            return Err(EngineInitError("sys_init before global_init".to_string()));
        }
        *self.args.lock() = args.to_vec();
        Ok(())
    }

    fn load_module(&self, source: &ModuleSource) -> Result<ModuleRef, ModuleError> {
        match source {
            ModuleSource::File(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|_| ModuleError::NotFound(path.display().to_string()))?;
                let program =
                    Script::parse(&text).map_err(|e| ModuleError::Parse(e.to_string()))?;
                Ok(self.load_script(module_display_name(path), program))
            }
            ModuleSource::Memory(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| ModuleError::Parse(format!("not utf-8: {}", e)))?;
                let program =
                    Script::parse(text).map_err(|e| ModuleError::Parse(e.to_string()))?;
                Ok(self.load_script("memory".to_string(), program))
            }
            ModuleSource::Static => Ok(self.load_script("static".to_string(), Script::empty())),
        }
    }

    fn unload_module(&self, module: ModuleRef) {
        self.modules.lock().remove(&module.raw());
    }

    fn call_entry(&self, module: ModuleRef) -> Result<(), ManagedException> {
        let state = self
            .module(module)
            .ok_or_else(|| ManagedException::new("module not loaded"))?;
        state.entry_runs.fetch_add(1, Ordering::AcqRel);
        for directive in state.program.directives() {
            match directive {
                Directive::Print(text) => state.output.lock().push(text.clone()),
                Directive::Sleep(duration) => thread::sleep(*duration),
                Directive::Throw(message) => return Err(throw(message, &state.name)),
                Directive::Schedule { delay, action } => state.pending.lock().push(PendingTask {
                    remaining: *delay,
                    action: action.clone(),
                }),
            }
        }
        Ok(())
    }

    fn pump_tick(&self, module: ModuleRef, delta: Duration) -> Result<(), ManagedException> {
        let state = match self.module(module) {
            Some(s) => s,
            None => return Ok(()),
        };
        state.pump_calls.fetch_add(1, Ordering::AcqRel);

        let due: Vec<Action> = {
            let mut pending = state.pending.lock();
            for task in pending.iter_mut() {
                task.remaining = task.remaining.saturating_sub(delta);
            }
            let mut fired = Vec::new();
            pending.retain(|task| {
                if task.remaining.is_zero() {
                    fired.push(task.action.clone());
                    false
                } else {
                    true
                }
            });
            fired
        };

        for action in due {
            match action {
                Action::Print(text) => state.output.lock().push(text),
                // an exception aborts the tick; later due work is dropped
                Action::Throw(message) => return Err(throw(&message, &state.name)),
            }
        }
        Ok(())
    }

    fn has_pending_work(&self, module: ModuleRef) -> bool {
        self.module(module)
            .map(|m| !m.pending.lock().is_empty())
            .unwrap_or(false)
    }

    fn register_thread(&self, _stack_base: StackBase) {
        self.registered.lock().insert(thread::current().id());
    }

    fn unregister_thread(&self) {
        self.registered.lock().remove(&thread::current().id());
    }

    fn module_name(&self, module: ModuleRef) -> String {
        self.module(module)
            .map(|m| m.name.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(source: &str) -> (StubEngine, ModuleRef) {
        let engine = StubEngine::new();
        engine.global_init().unwrap();
        let module = engine
            .load_module(&ModuleSource::Memory(source.as_bytes().to_vec()))
            .unwrap();
        (engine, module)
    }

    #[test]
    fn test_entry_prints_and_schedules() {
        let (engine, module) = loaded("print a\nschedule 20 print b\nprint c");
        engine.call_entry(module).unwrap();
        assert_eq!(engine.output(module), vec!["a", "c"]);
        assert!(engine.has_pending_work(module));
        assert_eq!(engine.entry_runs(module), 1);
    }

    #[test]
    fn test_entry_throw_skips_rest() {
        let (engine, module) = loaded("print a\nthrow boom\nprint never");
        let exc = engine.call_entry(module).unwrap_err();
        assert_eq!(exc.value.as_str(), Some("boom"));
        assert_eq!(exc.stack, vec!["memory.entry"]);
        assert_eq!(engine.output(module), vec!["a"]);
    }

    #[test]
    fn test_pump_fires_in_delay_order() {
        let (engine, module) = loaded("schedule 30 print late\nschedule 10 print early");
        engine.call_entry(module).unwrap();
        engine
            .pump_tick(module, Duration::from_millis(16))
            .unwrap();
        assert_eq!(engine.output(module), vec!["early"]);
        engine
            .pump_tick(module, Duration::from_millis(16))
            .unwrap();
        assert_eq!(engine.output(module), vec!["early", "late"]);
        assert!(!engine.has_pending_work(module));
        assert_eq!(engine.pump_calls(module), 2);
    }

    #[test]
    fn test_scheduled_throw_aborts_tick() {
        let (engine, module) = loaded("schedule 5 throw later");
        engine.call_entry(module).unwrap();
        let exc = engine
            .pump_tick(module, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(exc.value.as_str(), Some("later"));
        assert!(!engine.has_pending_work(module));
    }

    #[test]
    fn test_file_load_errors() {
        let engine = StubEngine::new();
        engine.global_init().unwrap();
        match engine.load_module(&ModuleSource::File("/no/such/module.evm".into())) {
            Err(ModuleError::NotFound(path)) => assert!(path.contains("module.evm")),
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
        match engine.load_module(&ModuleSource::Memory(b"warp 9".to_vec())) {
            Err(ModuleError::Parse(reason)) => assert!(reason.contains("warp")),
            other => panic!("expected Parse, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_static_module_is_empty_and_named() {
        let engine = StubEngine::new();
        engine.global_init().unwrap();
        let module = engine.load_module(&ModuleSource::Static).unwrap();
        engine.call_entry(module).unwrap();
        assert!(engine.output(module).is_empty());
        assert_eq!(engine.module_name(module), "static");
    }

    #[test]
    fn test_thread_registration_tracked() {
        let engine = StubEngine::new();
        let marker = 0u8;
        engine.register_thread(StackBase::from_marker(&marker));
        assert_eq!(engine.registered_thread_count(), 1);
        engine.unregister_thread();
        assert_eq!(engine.registered_thread_count(), 0);
    }

    #[test]
    fn test_sys_init_requires_global_init() {
        let engine = StubEngine::new();
        assert!(engine.sys_init(&[]).is_err());
        engine.global_init().unwrap();
        engine.sys_init(&["--level".into(), "1".into()]).unwrap();
        assert_eq!(engine.args(), vec!["--level", "1"]);
    }
}
