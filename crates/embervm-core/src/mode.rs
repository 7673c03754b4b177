//! Integration mode controller.
//!
//! One enum-dispatched state object enforces the three threading
//! disciplines, so every call site asks the controller instead of repeating
//! a three-way switch and a fourth discipline would touch one component.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::engine::{Engine, ModuleRef};
use crate::error::{VmError, VmResult};
use crate::registry::{self, CallScope};

/// Threading discipline for running the VM's entry point.
///
/// A one-time, pre-load decision; switching afterwards requires a fresh
/// handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrationMode {
    /// Entry runs synchronously on the caller's (registered) thread
    #[default]
    NonThreaded,
    /// The bridge owns one worker thread that registers itself and runs the
    /// entry point
    Threaded,
    /// The host owns the thread and performs the register/call/unregister
    /// sequence itself
    ManualThread,
}

impl IntegrationMode {
    /// Stable name for diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationMode::NonThreaded => "NonThreaded",
            IntegrationMode::Threaded => "Threaded",
            IntegrationMode::ManualThread => "ManualThread",
        }
    }
}

impl fmt::Display for IntegrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-handle enforcement of the selected discipline.
pub(crate) enum ModeController {
    NonThreaded,
    Threaded(ThreadedRunner),
    Manual,
}

impl ModeController {
    pub(crate) fn new(mode: IntegrationMode) -> Self {
        match mode {
            IntegrationMode::NonThreaded => ModeController::NonThreaded,
            IntegrationMode::Threaded => ModeController::Threaded(ThreadedRunner::new()),
            IntegrationMode::ManualThread => ModeController::Manual,
        }
    }

    pub(crate) fn mode(&self) -> IntegrationMode {
        match self {
            ModeController::NonThreaded => IntegrationMode::NonThreaded,
            ModeController::Threaded(_) => IntegrationMode::Threaded,
            ModeController::Manual => IntegrationMode::ManualThread,
        }
    }

    /// Has a worker ever been spawned? Mode becomes unchangeable after this.
    pub(crate) fn has_spawned(&self) -> bool {
        match self {
            ModeController::Threaded(runner) => runner.spawned,
            _ => false,
        }
    }

    /// Run the entry point under the active discipline.
    pub(crate) fn call_entry(&self, engine: &Arc<dyn Engine>, module: ModuleRef) -> VmResult<()> {
        match self {
            ModeController::NonThreaded | ModeController::Manual => {
                run_entry_on_current_thread(engine, module)
            }
            ModeController::Threaded(_) => Err(VmError::InvalidModeTransition(
                "call_entry is the worker's job in Threaded mode; use thread_start",
            )),
        }
    }

    pub(crate) fn thread_start(
        &mut self,
        engine: &Arc<dyn Engine>,
        module: ModuleRef,
    ) -> VmResult<()> {
        match self {
            ModeController::Threaded(runner) => runner.start(engine.clone(), module),
            _ => Err(VmError::InvalidModeTransition(
                "thread_start requires Threaded mode",
            )),
        }
    }

    pub(crate) fn thread_stop(&mut self) -> VmResult<()> {
        match self {
            ModeController::Threaded(runner) => runner.stop(),
            _ => Err(VmError::InvalidModeTransition(
                "thread_stop requires Threaded mode",
            )),
        }
    }

    pub(crate) fn thread_is_running(&self) -> bool {
        match self {
            ModeController::Threaded(runner) => runner.is_running(),
            _ => false,
        }
    }

    /// Best-effort teardown for `destroy`: join a live worker and report
    /// rather than surface whatever it left behind.
    pub(crate) fn shutdown(&mut self) {
        if let ModeController::Threaded(runner) = self {
            if runner.worker.is_some() {
                if let Err(e) = runner.stop() {
                    eprintln!("embervm: worker stop during destroy failed: {}", e);
                }
            }
        }
    }
}

/// Entry on the caller's thread: the caller must already hold a
/// registration (normally the thread that ran `init`).
fn run_entry_on_current_thread(engine: &Arc<dyn Engine>, module: ModuleRef) -> VmResult<()> {
    let _scope = CallScope::enter()?;
    engine
        .call_entry(module)
        .map_err(|exc| VmError::UncaughtException(exc.render()))
}

/// Owner of the single VM worker thread in `Threaded` mode.
///
/// The running flag and the result slot are the only state the host thread
/// and the worker share; polls stay non-blocking while `stop` joins.
pub(crate) struct ThreadedRunner {
    running: Arc<AtomicBool>,
    result: Arc<Mutex<Option<VmResult<()>>>>,
    worker: Option<JoinHandle<()>>,
    spawned: bool,
}

impl ThreadedRunner {
    fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            result: Arc::new(Mutex::new(None)),
            worker: None,
            spawned: false,
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawn the worker: register with the collector, run the entry point,
    /// unregister on every exit path, flip the completion flag.
    fn start(&mut self, engine: Arc<dyn Engine>, module: ModuleRef) -> VmResult<()> {
        if self.worker.is_some() || self.is_running() {
            return Err(VmError::ThreadAlreadyRunning);
        }

        let running = self.running.clone();
        let result = self.result.clone();
        *result.lock() = None;
        running.store(true, Ordering::Release);

        let spawn = thread::Builder::new()
            .name("embervm-worker".to_string())
            .spawn(move || {
                let outcome = run_worker(engine, module);
                *result.lock() = Some(outcome);
                // Completion flag flips last so a true poll implies the
                // result slot is not yet final, never the reverse.
                running.store(false, Ordering::Release);
            });

        match spawn {
            Ok(handle) => {
                self.worker = Some(handle);
                self.spawned = true;
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(VmError::ThreadSpawnFailed(e.to_string()))
            }
        }
    }

    /// Join the worker and surface its outcome.
    fn stop(&mut self) -> VmResult<()> {
        let handle = self.worker.take().ok_or(VmError::ThreadNotRunning)?;
        if handle.join().is_err() {
            self.running.store(false, Ordering::Release);
            return Err(VmError::UncaughtException(
                "worker thread panicked".to_string(),
            ));
        }
        match self.result.lock().take() {
            Some(outcome) => outcome,
            None => Ok(()),
        }
    }
}

/// Worker body. Registration and the call scope are plain RAII so the
/// unregister happens on normal return, error return, and unwind alike.
fn run_worker(engine: Arc<dyn Engine>, module: ModuleRef) -> VmResult<()> {
    let _guard = registry::register_current_thread(engine.clone())?;
    let _scope = CallScope::enter()?;
    engine
        .call_entry(module)
        .map_err(|exc| VmError::UncaughtException(exc.render()))
}
