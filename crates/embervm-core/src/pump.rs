//! Update pump for deferred managed work.
//!
//! After the entry point returns, the managed program may still hold timers
//! and scheduled callbacks. The host drives them from its own loop: a cheap
//! `has_pending_work` poll decides whether to keep ticking, and one `tick`
//! advances one step without ever blocking.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::{Engine, ModuleRef};
use crate::error::{VmError, VmResult};
use crate::registry::CallScope;

pub(crate) struct UpdatePump {
    ticks: u64,
    pumped: Duration,
}

impl UpdatePump {
    pub(crate) fn new() -> Self {
        Self {
            ticks: 0,
            pumped: Duration::ZERO,
        }
    }

    /// Advance one step of deferred work. Returns immediately when the
    /// engine reports nothing pending, without entering managed code.
    pub(crate) fn tick(
        &mut self,
        engine: &Arc<dyn Engine>,
        module: ModuleRef,
        delta: Duration,
    ) -> VmResult<()> {
        if !engine.has_pending_work(module) {
            return Ok(());
        }
        let _scope = CallScope::enter()?;
        engine
            .pump_tick(module, delta)
            .map_err(|exc| VmError::UncaughtException(exc.render()))?;
        self.ticks += 1;
        self.pumped += delta;
        Ok(())
    }

    #[allow(dead_code)]
    pub(crate) fn ticks(&self) -> u64 {
        self.ticks
    }

    #[allow(dead_code)]
    pub(crate) fn pumped(&self) -> Duration {
        self.pumped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        EngineInitError, ManagedException, ModuleError, ModuleSource, StackBase,
    };
    use crate::registry;
    use parking_lot::Mutex;

    /// Engine with a countdown of pending ticks, counting pump calls.
    struct CountdownEngine {
        remaining: Mutex<u32>,
        pump_calls: Mutex<u32>,
    }

    impl CountdownEngine {
        fn new(pending: u32) -> Self {
            Self {
                remaining: Mutex::new(pending),
                pump_calls: Mutex::new(0),
            }
        }
    }

    impl Engine for CountdownEngine {
        fn global_init(&self) -> Result<(), EngineInitError> {
            Ok(())
        }
        fn sys_init(&self, _args: &[String]) -> Result<(), EngineInitError> {
            Ok(())
        }
        fn load_module(&self, _source: &ModuleSource) -> Result<ModuleRef, ModuleError> {
            Ok(ModuleRef::new(7))
        }
        fn unload_module(&self, _module: ModuleRef) {}
        fn call_entry(&self, _module: ModuleRef) -> Result<(), ManagedException> {
            Ok(())
        }
        fn pump_tick(&self, _m: ModuleRef, _d: Duration) -> Result<(), ManagedException> {
            *self.pump_calls.lock() += 1;
            let mut rem = self.remaining.lock();
            *rem = rem.saturating_sub(1);
            Ok(())
        }
        fn has_pending_work(&self, _module: ModuleRef) -> bool {
            *self.remaining.lock() > 0
        }
        fn register_thread(&self, _stack_base: StackBase) {}
        fn unregister_thread(&self) {}
        fn module_name(&self, _module: ModuleRef) -> String {
            "countdown".to_string()
        }
    }

    #[test]
    fn test_tick_skips_when_idle() {
        std::thread::spawn(|| {
            let engine = Arc::new(CountdownEngine::new(0));
            let dyn_engine: Arc<dyn Engine> = engine.clone();
            let mut pump = UpdatePump::new();
            // no registration needed: the fast path never enters managed code
            pump.tick(&dyn_engine, ModuleRef::new(7), Duration::from_millis(16))
                .unwrap();
            assert_eq!(*engine.pump_calls.lock(), 0);
            assert_eq!(pump.ticks(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_tick_drains_pending_work() {
        std::thread::spawn(|| {
            let engine = Arc::new(CountdownEngine::new(3));
            let dyn_engine: Arc<dyn Engine> = engine.clone();
            let _guard = registry::register_current_thread(dyn_engine.clone()).unwrap();
            let mut pump = UpdatePump::new();
            let module = ModuleRef::new(7);
            while dyn_engine.has_pending_work(module) {
                pump.tick(&dyn_engine, module, Duration::from_millis(16))
                    .unwrap();
            }
            assert_eq!(*engine.pump_calls.lock(), 3);
            assert_eq!(pump.ticks(), 3);
            assert_eq!(pump.pumped(), Duration::from_millis(48));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_tick_requires_registration_when_work_pending() {
        std::thread::spawn(|| {
            let engine: Arc<dyn Engine> = Arc::new(CountdownEngine::new(1));
            let mut pump = UpdatePump::new();
            let res = pump.tick(&engine, ModuleRef::new(7), Duration::from_millis(16));
            assert!(matches!(res, Err(VmError::Registration(_))));
        })
        .join()
        .unwrap();
    }
}
