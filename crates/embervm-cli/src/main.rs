//! Embervm host launcher.
//!
//! Drives the full embedding lifecycle against the scriptable stub engine:
//! init, module load, entry under the selected integration mode, update
//! pump until deferred work drains, teardown. Doubles as a worked example
//! of embedding the bridge in a host application.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use embervm_core::{
    register_current_thread, IntegrationMode, ModuleRef, ModuleSource, VmHandle, VmResult,
};
use embervm_stub::StubEngine;

#[derive(Parser)]
#[command(name = "embervm")]
#[command(about = "Run a module through the embervm embedding bridge", long_about = None)]
#[command(version)]
struct Cli {
    /// Module script to run
    module: PathBuf,

    /// Run the entry point on a bridge-owned worker thread
    #[arg(long, conflicts_with = "manual_thread")]
    threaded: bool,

    /// Run the entry point on a host-owned thread that registers itself
    #[arg(long)]
    manual_thread: bool,

    /// Open a debug listener on this port before running (0 = ephemeral)
    #[arg(long)]
    debug_port: Option<u16>,

    /// Block until a debugger attaches before running
    #[arg(long, requires = "debug_port")]
    debug_wait: bool,

    /// Update pump tick length in milliseconds
    #[arg(long, default_value_t = 16)]
    tick_ms: u64,

    /// Arguments to pass to the module
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mode = if cli.threaded {
        IntegrationMode::Threaded
    } else if cli.manual_thread {
        IntegrationMode::ManualThread
    } else {
        IntegrationMode::NonThreaded
    };

    let engine = Arc::new(StubEngine::new());
    let mut vm = VmHandle::new(engine.clone());
    vm.set_integration_mode(mode)
        .context("failed to select integration mode")?;
    vm.init(&cli.args).context("engine initialization failed")?;
    vm.load_module(ModuleSource::File(cli.module.clone()))
        .with_context(|| format!("failed to load {}", cli.module.display()))?;

    if let Some(port) = cli.debug_port {
        match vm.debug_start(port, cli.debug_wait) {
            Ok(()) => {
                if let Some(actual) = vm.debug_port() {
                    println!("Debug listener on 127.0.0.1:{}", actual);
                }
            }
            // debug failures are non-fatal; run without a debugger
            Err(e) => eprintln!("Warning: {}", e),
        }
    }

    let outcome = match mode {
        IntegrationMode::NonThreaded => vm.call_entry(),
        IntegrationMode::Threaded => vm.thread_start().and_then(|()| {
            while vm.thread_is_running() {
                thread::sleep(Duration::from_millis(10));
            }
            vm.thread_stop()
        }),
        IntegrationMode::ManualThread => run_on_host_thread(&engine, &mut vm),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
        vm.destroy();
        std::process::exit(1);
    }

    let tick = Duration::from_millis(cli.tick_ms);
    while vm.has_pending_work() {
        vm.update(tick).context("update pump failed")?;
        thread::sleep(tick);
    }

    // the launcher loads exactly one module; the stub numbers them from 1
    for line in engine.output(ModuleRef::new(1)) {
        println!("{}", line);
    }

    vm.debug_stop();
    vm.destroy();
    Ok(())
}

/// Manual-thread discipline: the host owns the thread and performs the
/// register/call/release sequence itself.
fn run_on_host_thread(engine: &Arc<StubEngine>, vm: &mut VmHandle) -> VmResult<()> {
    thread::scope(|s| {
        let worker = s.spawn(|| {
            let mut guard = register_current_thread(engine.clone())?;
            let res = vm.call_entry();
            guard.release()?;
            res
        });
        match worker.join() {
            Ok(res) => res,
            Err(_) => {
                eprintln!("Error: host thread panicked while running the entry point");
                std::process::exit(1);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_mode_flags_conflict() {
        let res = Cli::try_parse_from(["embervm", "game.evm", "--threaded", "--manual-thread"]);
        assert!(res.is_err());
    }

    #[test]
    fn test_trailing_args_reach_the_module() {
        let cli = Cli::try_parse_from(["embervm", "game.evm", "--level", "1"]).unwrap();
        assert_eq!(cli.args, vec!["--level", "1"]);
        assert_eq!(cli.tick_ms, 16);
    }
}
