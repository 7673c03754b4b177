//! The VM handle: lifecycle façade over the process-global engine.
//!
//! Exactly one handle is assumed live per process. All lifecycle ordering is
//! enforced here; threading discipline is delegated to the mode controller
//! and GC visibility to the registration bridge.

use std::sync::Arc;
use std::time::Duration;

use crate::debug::{DebugSession, DebugState};
use crate::engine::{Engine, ModuleRef, ModuleSource};
use crate::error::{ErrorRecord, VmError, VmResult};
use crate::mode::{IntegrationMode, ModeController};
use crate::pump::UpdatePump;
use crate::registry;

/// Lifecycle phase of a [`VmHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Allocated, engine untouched
    Created,
    /// Engine globals and sys init done; main thread registered
    Initialized,
    /// A module is prepared for execution
    ModuleLoaded,
    /// The entry point is executing (synchronously or on the worker)
    Running,
    /// Entry point returned; deferred work may remain
    Idle,
    /// Torn down; the handle is inert
    Destroyed,
}

/// Handle to the embedded VM.
///
/// Operations follow a strict order: `set_integration_mode` (optional,
/// defaults to [`IntegrationMode::NonThreaded`]) → [`init`] → [`load_module`]
/// → entry ([`call_entry`] or [`thread_start`]) → [`update`] until
/// [`has_pending_work`] is false → [`destroy`]. Out-of-order calls fail with
/// a lifecycle error and leave the phase unchanged.
///
/// [`init`]: VmHandle::init
/// [`load_module`]: VmHandle::load_module
/// [`call_entry`]: VmHandle::call_entry
/// [`thread_start`]: VmHandle::thread_start
/// [`update`]: VmHandle::update
/// [`has_pending_work`]: VmHandle::has_pending_work
/// [`destroy`]: VmHandle::destroy
pub struct VmHandle {
    engine: Arc<dyn Engine>,
    phase: Phase,
    controller: ModeController,
    module: Option<ModuleRef>,
    static_module: bool,
    debug: DebugSession,
    pump: UpdatePump,
    last_error: Option<ErrorRecord>,
}

impl VmHandle {
    /// Allocate the façade at phase `Created`.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            phase: Phase::Created,
            controller: ModeController::new(IntegrationMode::default()),
            module: None,
            static_module: false,
            debug: DebugSession::new(),
            pump: UpdatePump::new(),
            last_error: None,
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Active integration mode.
    pub fn mode(&self) -> IntegrationMode {
        self.controller.mode()
    }

    /// Last failing operation's record, cleared by the next success.
    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.last_error.as_ref()
    }

    /// Choose the threading discipline. Valid until a module is loaded and
    /// never after a worker thread has been spawned.
    pub fn set_integration_mode(&mut self, mode: IntegrationMode) -> VmResult<()> {
        let res = if self.controller.has_spawned() {
            Err(VmError::InvalidModeTransition(
                "mode is fixed once a worker thread has been spawned",
            ))
        } else if !matches!(self.phase, Phase::Created | Phase::Initialized) {
            Err(VmError::InvalidModeTransition(
                "mode must be chosen before a module is loaded",
            ))
        } else {
            self.controller = ModeController::new(mode);
            Ok(())
        };
        self.finish(res)
    }

    /// One-time engine bring-up plus sys-args init.
    ///
    /// Must run on the thread that becomes the registered main thread; that
    /// registration is pinned for the life of the process because the
    /// engine does not support clean unregister/re-register of the main
    /// thread.
    pub fn init(&mut self, args: &[String]) -> VmResult<()> {
        let res = self.init_inner(args);
        self.finish(res)
    }

    fn init_inner(&mut self, args: &[String]) -> VmResult<()> {
        if self.phase != Phase::Created {
            return Err(VmError::AlreadyInitialized);
        }
        self.engine
            .global_init()
            .map_err(|e| VmError::EngineInitFailed(e.0))?;
        self.engine
            .sys_init(args)
            .map_err(|e| VmError::EngineInitFailed(e.0))?;
        registry::ensure_main_thread_registered(&self.engine);
        self.phase = Phase::Initialized;
        Ok(())
    }

    /// Resolve and prepare the bytecode unit.
    ///
    /// A [`ModuleSource::Static`] load is a validity check rather than a
    /// file read; all sources converge on `ModuleLoaded` so downstream
    /// logic is source-agnostic.
    pub fn load_module(&mut self, source: ModuleSource) -> VmResult<()> {
        let res = self.load_module_inner(source);
        self.finish(res)
    }

    fn load_module_inner(&mut self, source: ModuleSource) -> VmResult<()> {
        match self.phase {
            Phase::Created => return Err(VmError::NotInitialized("init")),
            Phase::Initialized => {}
            Phase::Destroyed => return Err(VmError::NotInitialized("VmHandle::new")),
            _ => return Err(VmError::AlreadyInitialized),
        }
        let module = self.engine.load_module(&source).map_err(|e| match e {
            crate::engine::ModuleError::NotFound(m) => VmError::ModuleNotFound(m),
            crate::engine::ModuleError::Parse(m) => VmError::ModuleParseError(m),
        })?;
        self.static_module = source.is_static();
        self.module = Some(module);
        self.phase = Phase::ModuleLoaded;
        Ok(())
    }

    /// Invoke the module's entry function under the active mode.
    ///
    /// Uncaught managed exceptions come back as
    /// [`VmError::UncaughtException`] with the rendered stack preserved in
    /// the error record; they never cross the boundary as native faults.
    pub fn call_entry(&mut self) -> VmResult<()> {
        let res = self.call_entry_inner();
        self.finish(res)
    }

    fn call_entry_inner(&mut self) -> VmResult<()> {
        let module = self.require_module()?;
        if self.controller.thread_is_running() {
            return Err(VmError::ThreadAlreadyRunning);
        }
        let prev = self.phase;
        self.phase = Phase::Running;
        let res = self.controller.call_entry(&self.engine, module);
        self.phase = match &res {
            // entry completed, with or without a managed exception
            Ok(()) | Err(VmError::UncaughtException(_)) => Phase::Idle,
            Err(_) => prev,
        };
        res
    }

    /// Spawn the VM worker thread (`Threaded` mode only); it registers
    /// itself, runs the entry point, and unregisters on completion.
    pub fn thread_start(&mut self) -> VmResult<()> {
        let res = self.thread_start_inner();
        self.finish(res)
    }

    fn thread_start_inner(&mut self) -> VmResult<()> {
        let module = self.require_module()?;
        self.controller.thread_start(&self.engine, module)?;
        self.phase = Phase::Running;
        Ok(())
    }

    /// Join the worker thread and surface its outcome.
    pub fn thread_stop(&mut self) -> VmResult<()> {
        let res = self.controller.thread_stop();
        match &res {
            Ok(()) | Err(VmError::UncaughtException(_)) => {
                if self.phase == Phase::Running {
                    self.phase = Phase::Idle;
                }
            }
            Err(_) => {}
        }
        self.finish(res)
    }

    /// Non-blocking poll: is the worker thread between a successful
    /// `thread_start` and its completion?
    pub fn thread_is_running(&self) -> bool {
        self.controller.thread_is_running()
    }

    /// Pump one tick of deferred managed work.
    ///
    /// Returns immediately when nothing is pending. Fails fast with
    /// [`VmError::ThreadAlreadyRunning`] while a `Threaded`-mode worker is
    /// still executing the entry point: the engine contract does not permit
    /// concurrent pumping.
    pub fn update(&mut self, delta: Duration) -> VmResult<()> {
        let res = self.update_inner(delta);
        self.finish(res)
    }

    fn update_inner(&mut self, delta: Duration) -> VmResult<()> {
        let module = self.require_module()?;
        if self.controller.thread_is_running() {
            return Err(VmError::ThreadAlreadyRunning);
        }
        self.pump.tick(&self.engine, module, delta)
    }

    /// Cheap non-blocking query: does the module have deferred work queued?
    pub fn has_pending_work(&self) -> bool {
        match (self.phase, self.module) {
            (Phase::Destroyed, _) | (_, None) => false,
            (_, Some(module)) => self.engine.has_pending_work(module),
        }
    }

    /// Open a debug listener on `port` (0 picks an ephemeral port).
    ///
    /// With `wait_for_attach`, blocks until a remote debugger completes the
    /// handshake. Failures are surfaced but non-fatal: the phase is
    /// unchanged and execution may proceed without a debugger.
    pub fn debug_start(&mut self, port: u16, wait_for_attach: bool) -> VmResult<()> {
        let res = self.debug_start_inner(port, wait_for_attach);
        self.finish(res)
    }

    fn debug_start_inner(&mut self, port: u16, wait_for_attach: bool) -> VmResult<()> {
        let module = self.require_module()?;
        if self.mode() == IntegrationMode::ManualThread {
            return Err(VmError::DebugNotSupportedInMode(
                "ManualThread mode".to_string(),
            ));
        }
        if self.static_module {
            // statically compiled code has no interpreter loop to step
            return Err(VmError::DebugNotSupportedInMode(
                "statically linked module".to_string(),
            ));
        }
        let banner = self.engine.module_name(module);
        self.debug.start(port, wait_for_attach, banner)
    }

    /// Tear down the debug session. Idempotent; never fails.
    pub fn debug_stop(&mut self) {
        self.debug.stop();
    }

    /// Has a remote debugger completed the handshake?
    pub fn debug_is_attached(&self) -> bool {
        self.debug.is_attached()
    }

    /// Debug session state.
    pub fn debug_state(&self) -> DebugState {
        self.debug.state()
    }

    /// Actual debug listening port, once a session is live.
    pub fn debug_port(&self) -> Option<u16> {
        self.debug.port()
    }

    /// Tear everything down: worker thread first, then the debug session,
    /// then the module, so no thread can touch freed engine state.
    ///
    /// Idempotent; cleanup problems are reported to stderr, never surfaced —
    /// there is no corrective action left once teardown is requested.
    /// Dropping the handle runs `destroy`.
    pub fn destroy(&mut self) {
        if self.phase == Phase::Destroyed {
            return;
        }
        self.controller.shutdown();
        self.debug.stop();
        if let Some(module) = self.module.take() {
            self.engine.unload_module(module);
        }
        // The main thread stays registered: the engine cannot cleanly
        // re-register it, and other engine threads (a debugger included)
        // may still be running at teardown.
        self.phase = Phase::Destroyed;
    }

    /// Module ref for phases that may execute or pump managed code.
    fn require_module(&self) -> VmResult<ModuleRef> {
        match self.phase {
            Phase::ModuleLoaded | Phase::Running | Phase::Idle => self
                .module
                .ok_or(VmError::NotInitialized("load_module")),
            Phase::Created | Phase::Initialized => Err(VmError::NotInitialized("load_module")),
            Phase::Destroyed => Err(VmError::NotInitialized("VmHandle::new")),
        }
    }

    /// Record the outcome: failures overwrite the error record, successes
    /// clear it.
    fn finish<T>(&mut self, res: VmResult<T>) -> VmResult<T> {
        match &res {
            Ok(_) => self.last_error = None,
            Err(e) => self.last_error = Some(ErrorRecord::from_error(e)),
        }
        res
    }
}

impl Drop for VmHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}
