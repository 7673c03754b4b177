//! Embedding error types.
//!
//! Lifecycle and registration errors always surface to the caller: they mark
//! a precondition violation the host must fix. Debug-session errors surface
//! too but are recoverable — the host may continue without a debugger.

/// Result alias for fallible embedding operations.
pub type VmResult<T> = Result<T, VmError>;

/// Errors surfaced by the embedding bridge.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Engine already initialized, or a module is already loaded
    #[error("already initialized")]
    AlreadyInitialized,

    /// Operation requires an earlier lifecycle step that has not happened
    #[error("not initialized: call {0} first")]
    NotInitialized(&'static str),

    /// Underlying engine failed its one-time global bring-up
    #[error("engine initialization failed: {0}")]
    EngineInitFailed(String),

    /// Module path did not resolve to readable bytecode
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// Module bytes were readable but not valid bytecode
    #[error("module parse error: {0}")]
    ModuleParseError(String),

    /// Integration mode changed too late, or an operation belongs to a
    /// different mode
    #[error("invalid mode transition: {0}")]
    InvalidModeTransition(&'static str),

    /// The VM worker thread is already running
    #[error("worker thread already running")]
    ThreadAlreadyRunning,

    /// The VM worker thread is not running
    #[error("worker thread not running")]
    ThreadNotRunning,

    /// Worker thread could not be spawned
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawnFailed(String),

    /// Managed code raised an exception that nothing caught; the rendered
    /// message and stack are preserved in the handle's error record
    #[error("uncaught exception: {0}")]
    UncaughtException(String),

    /// Cooperative GC thread-registration protocol violated
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// Debug listener could not bind its port (non-fatal)
    #[error("debug bind failed on port {port}: {reason}")]
    DebugBindFailed {
        /// Requested listening port
        port: u16,
        /// Underlying bind failure
        reason: String,
    },

    /// Remote debugger connected but did not complete the handshake
    /// (non-fatal)
    #[error("debug handshake failed: {0}")]
    DebugHandshakeFailed(String),

    /// Debug attachment is unavailable in the current configuration
    #[error("debugging not supported: {0}")]
    DebugNotSupportedInMode(String),
}

impl VmError {
    /// Stable short code for the error record.
    pub fn code(&self) -> &'static str {
        match self {
            VmError::AlreadyInitialized => "already_initialized",
            VmError::NotInitialized(_) => "not_initialized",
            VmError::EngineInitFailed(_) => "engine_init_failed",
            VmError::ModuleNotFound(_) => "module_not_found",
            VmError::ModuleParseError(_) => "module_parse_error",
            VmError::InvalidModeTransition(_) => "invalid_mode_transition",
            VmError::ThreadAlreadyRunning => "thread_already_running",
            VmError::ThreadNotRunning => "thread_not_running",
            VmError::ThreadSpawnFailed(_) => "thread_spawn_failed",
            VmError::UncaughtException(_) => "uncaught_exception",
            VmError::Registration(_) => "registration_error",
            VmError::DebugBindFailed { .. } => "debug_bind_failed",
            VmError::DebugHandshakeFailed(_) => "debug_handshake_failed",
            VmError::DebugNotSupportedInMode(_) => "debug_not_supported_in_mode",
        }
    }

    /// Debug-session errors degrade gracefully; everything else is a
    /// lifecycle error the host must fix.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VmError::DebugBindFailed { .. }
                | VmError::DebugHandshakeFailed(_)
                | VmError::DebugNotSupportedInMode(_)
        )
    }
}

/// Violations of the cooperative GC thread-registration protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// The current thread already holds a live registration
    #[error("thread is already registered with the collector")]
    AlreadyRegistered,

    /// The current thread holds no registration but tried to enter managed
    /// code
    #[error("thread is not registered with the collector")]
    NotRegistered,

    /// Unregistration attempted while managed calls are still on this
    /// thread's stack
    #[error("cannot unregister: {0} managed call(s) still on this thread's stack")]
    UnregisterWhileActive(usize),
}

/// Last (code, message) pair recorded by a failing handle operation.
///
/// Overwritten on each failing operation and cleared on each succeeding one;
/// read-only from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Stable short code, see [`VmError::code`]
    pub code: &'static str,
    /// Human-readable message
    pub message: String,
}

impl ErrorRecord {
    pub(crate) fn from_error(err: &VmError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(VmError::AlreadyInitialized.code(), "already_initialized");
        assert_eq!(
            VmError::Registration(RegistrationError::AlreadyRegistered).code(),
            "registration_error"
        );
        assert_eq!(
            VmError::DebugBindFailed {
                port: 6112,
                reason: "in use".into()
            }
            .code(),
            "debug_bind_failed"
        );
    }

    #[test]
    fn test_only_debug_errors_are_recoverable() {
        assert!(VmError::DebugHandshakeFailed("bad magic".into()).is_recoverable());
        assert!(VmError::DebugNotSupportedInMode("ManualThread".into()).is_recoverable());
        assert!(!VmError::UncaughtException("boom".into()).is_recoverable());
        assert!(!VmError::NotInitialized("init").is_recoverable());
    }

    #[test]
    fn test_record_carries_message() {
        let err = VmError::ModuleNotFound("game.evm".into());
        let rec = ErrorRecord::from_error(&err);
        assert_eq!(rec.code, "module_not_found");
        assert!(rec.message.contains("game.evm"));
    }
}
