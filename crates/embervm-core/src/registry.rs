//! Cooperative GC thread registration.
//!
//! The wrapped engine's collector scans native stacks found in a global
//! thread registry to discover references into managed memory. An
//! unregistered thread's managed pointers are invisible to the collector and
//! may be reclaimed while still in use; a thread that never unregisters
//! leaks a registry slot and risks a dangling stack-base pointer after the
//! native thread exits. Registration is therefore a scope-bound resource:
//! [`register_current_thread`] is the only way in, and the returned
//! [`RegistrationGuard`] guarantees release on every exit path.
//!
//! Inside the bridge, every managed call is additionally bracketed by a
//! [`CallScope`] that tracks how many managed calls are live on the current
//! thread's stack, so unregistering mid-call is caught instead of corrupting
//! the collector's view.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::engine::{Engine, StackBase};
use crate::error::{RegistrationError, VmResult};

struct ThreadRecord {
    #[allow(dead_code)] // scanned by the real collector, inert for doubles
    stack_base: StackBase,
    /// Managed calls currently on this thread's stack
    active_calls: usize,
    /// Pinned records (the main thread) outlive any guard and are never
    /// released; the engine cannot re-register a thread cleanly, so the main
    /// thread stays registered for the life of the process.
    pinned: bool,
}

static REGISTRY: Lazy<Mutex<HashMap<ThreadId, ThreadRecord>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Is the current thread registered with the collector?
pub fn current_thread_registered() -> bool {
    REGISTRY.lock().contains_key(&thread::current().id())
}

/// Register the current thread with the collector for the duration of the
/// returned guard.
///
/// Must be called near the top of the thread's managed-call window: the
/// recorded stack base is the registering frame, and the collector scans
/// from there downward. Fails with
/// [`RegistrationError::AlreadyRegistered`] if this thread already holds a
/// live registration.
pub fn register_current_thread(engine: Arc<dyn Engine>) -> VmResult<RegistrationGuard> {
    let id = thread::current().id();
    let marker = 0u8;
    let base = StackBase::from_marker(&marker);

    let mut registry = REGISTRY.lock();
    if registry.contains_key(&id) {
        return Err(RegistrationError::AlreadyRegistered.into());
    }
    engine.register_thread(base);
    registry.insert(
        id,
        ThreadRecord {
            stack_base: base,
            active_calls: 0,
            pinned: false,
        },
    );
    Ok(RegistrationGuard {
        engine,
        thread: id,
        released: false,
        _not_send: PhantomData,
    })
}

/// Register the current thread as the process's main registered thread.
///
/// Idempotent: the engine does not support clean unregister/re-register of
/// the main thread, so the record is pinned once and reused by any later
/// handle on the same thread.
pub(crate) fn ensure_main_thread_registered(engine: &Arc<dyn Engine>) {
    let id = thread::current().id();
    let marker = 0u8;
    let base = StackBase::from_marker(&marker);

    let mut registry = REGISTRY.lock();
    if registry.contains_key(&id) {
        return;
    }
    engine.register_thread(base);
    registry.insert(
        id,
        ThreadRecord {
            stack_base: base,
            active_calls: 0,
            pinned: true,
        },
    );
}

/// Live registration of one native thread with the collector.
///
/// Not `Send`: releasing must happen on the registered thread, because the
/// engine's unregister primitive acts on the calling thread.
pub struct RegistrationGuard {
    engine: Arc<dyn Engine>,
    thread: ThreadId,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl RegistrationGuard {
    /// Release the registration.
    ///
    /// Fails with [`RegistrationError::UnregisterWhileActive`] while managed
    /// calls are still on this thread's stack, leaving the registration
    /// intact; call again after the calls return. Idempotent once released.
    pub fn release(&mut self) -> VmResult<()> {
        if self.released {
            return Ok(());
        }
        let mut registry = REGISTRY.lock();
        match registry.get(&self.thread) {
            None => return Err(RegistrationError::NotRegistered.into()),
            Some(rec) if rec.active_calls > 0 => {
                return Err(RegistrationError::UnregisterWhileActive(rec.active_calls).into());
            }
            // guards are only handed out for unpinned records
            Some(rec) => debug_assert!(!rec.pinned),
        }
        registry.remove(&self.thread);
        drop(registry);
        self.engine.unregister_thread();
        self.released = true;
        Ok(())
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Last resort on abnormal scope exit: a leaked slot with a dangling
        // stack base is worse than a forced release.
        let removed = REGISTRY.lock().remove(&self.thread);
        if let Some(rec) = removed {
            debug_assert!(!rec.pinned);
            if rec.active_calls > 0 {
                eprintln!(
                    "embervm: thread unregistered with {} managed call(s) still on its stack",
                    rec.active_calls
                );
            }
            self.engine.unregister_thread();
        }
    }
}

/// RAII bracket around one managed call on the current thread.
///
/// Entering requires a live registration; the active-call count keeps
/// [`RegistrationGuard::release`] honest while managed frames are live.
pub(crate) struct CallScope {
    thread: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl CallScope {
    pub(crate) fn enter() -> Result<Self, RegistrationError> {
        let id = thread::current().id();
        let mut registry = REGISTRY.lock();
        let rec = registry.get_mut(&id).ok_or(RegistrationError::NotRegistered)?;
        rec.active_calls += 1;
        Ok(CallScope {
            thread: id,
            _not_send: PhantomData,
        })
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        if let Some(rec) = REGISTRY.lock().get_mut(&self.thread) {
            rec.active_calls = rec.active_calls.saturating_sub(1);
        }
    }
}
