//! Embervm core — embedding bridge for a managed bytecode VM.
//!
//! This crate wraps a foreign, garbage-collected execution engine behind a
//! lifecycle façade a host application can drive from its own thread and
//! update model:
//! - [`VmHandle`] — the lifecycle state machine
//!   (`Created → Initialized → ModuleLoaded → Running → Idle → Destroyed`)
//! - [`registry`] — cooperative GC thread registration, expressed as a
//!   scope-bound [`RegistrationGuard`]
//! - [`IntegrationMode`] — the three threading disciplines (synchronous
//!   call-in, VM-owned worker thread, host-owned manual thread)
//! - a TCP debug-attachment bridge and an update pump for deferred managed
//!   work
//!
//! The engine itself is an external collaborator: the [`Engine`] trait
//! captures the call/return contract this bridge relies on, and nothing more.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod debug;
pub mod engine;
pub mod error;
pub mod handle;
pub mod mode;
mod pump;
pub mod registry;
pub mod value;

pub use debug::DebugState;
pub use engine::{
    Engine, EngineInitError, ManagedException, ModuleError, ModuleRef, ModuleSource, NoopEngine,
    StackBase,
};
pub use error::{ErrorRecord, RegistrationError, VmError, VmResult};
pub use handle::{Phase, VmHandle};
pub use mode::IntegrationMode;
pub use registry::{current_thread_registered, register_current_thread, RegistrationGuard};
pub use value::Value;
