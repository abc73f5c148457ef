//! Process lifecycle
//!
//! Interrupt and terminate are trapped with flag-only handlers: nothing
//! runs in signal context beyond an atomic store, and user code observes
//! the flag at safe points. Broken-pipe is ignored so long-lived servers
//! survive disconnecting readers. A bounded table of named shutdown hooks
//! runs on graceful exit, followed by the global pool shutdown.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::dispatch;
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::value::Value;

/// Set by the signal handlers, polled by accept loops.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Maximum number of named shutdown hooks.
const MAX_SHUTDOWN_HOOKS: usize = 16;

static SHUTDOWN_HOOKS: Mutex<Vec<(String, Value)>> = Mutex::new(Vec::new());

/// Handler body: an atomic store and nothing else, the only thing safe in
/// signal context.
#[cfg(unix)]
extern "C" fn flag_shutdown_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install handlers: SIGINT and SIGTERM set the shutdown flag, SIGPIPE is
/// ignored.
#[cfg(unix)]
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, flag_shutdown_handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, flag_shutdown_handler as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
pub fn install_signal_handlers() {}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Set the flag programmatically (tests, embedders).
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Clear the flag (tests).
pub fn reset_shutdown_flag() {
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
}

/// Register a named shutdown hook. Re-registering a key replaces its hook.
pub fn add_shutdown_hook(key: impl Into<String>, callable: Value) -> Result<()> {
    let key = key.into();
    let mut hooks = SHUTDOWN_HOOKS.lock().expect("shutdown hooks poisoned");
    if let Some(entry) = hooks.iter_mut().find(|(k, _)| *k == key) {
        entry.1 = callable;
        return Ok(());
    }
    if hooks.len() >= MAX_SHUTDOWN_HOOKS {
        return Err(Error::value_error(format!(
            "shutdown hook table is full ({MAX_SHUTDOWN_HOOKS} entries)"
        )));
    }
    hooks.push((key, callable));
    Ok(())
}

pub fn remove_shutdown_hook(key: &str) {
    SHUTDOWN_HOOKS
        .lock()
        .expect("shutdown hooks poisoned")
        .retain(|(k, _)| k != key);
}

/// Run every registered hook, logging failures rather than aborting the
/// exit path.
pub fn run_shutdown_hooks(heap: &Heap) {
    let hooks: Vec<(String, Value)> = SHUTDOWN_HOOKS
        .lock()
        .expect("shutdown hooks poisoned")
        .clone();
    for (key, callable) in hooks {
        if let Err(e) = dispatch::call_fn_val(heap, callable, &[]) {
            warn!(hook = %key, error = %e, "shutdown hook failed");
        }
    }
}

/// Graceful exit: hooks first, then the global pool.
pub fn graceful_exit(heap: &Heap) {
    info!("running graceful shutdown");
    run_shutdown_hooks(heap);
    crate::pool::shutdown_global_pool();
}

/// Poll-based accept loop: invoke `tick` once per second until it returns
/// false or shutdown is requested. Long-running servers put their accept
/// step inside `tick` so a signal terminates them within a second.
pub fn run_poll_loop(mut tick: impl FnMut() -> bool) {
    while !shutdown_requested() {
        if !tick() {
            return;
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_shutdown_flag() {
        reset_shutdown_flag();
        assert!(!shutdown_requested());
        request_shutdown();
        assert!(shutdown_requested());
        reset_shutdown_flag();
    }

    #[test]
    #[serial]
    fn test_hook_table_bounded() {
        let heap = Heap::new();
        let noop = heap.builtin("noop", |_h, _a| Ok(Value::nil()));
        for i in 0..MAX_SHUTDOWN_HOOKS {
            add_shutdown_hook(format!("hook-{i}"), noop).unwrap();
        }
        let err = add_shutdown_hook("one-too-many", noop).unwrap_err();
        assert_eq!(err.kind_name(), "value_error");
        // Replacing an existing key is not an insertion
        add_shutdown_hook("hook-0", noop).unwrap();
        for i in 0..MAX_SHUTDOWN_HOOKS {
            remove_shutdown_hook(&format!("hook-{i}"));
        }
    }

    #[test]
    #[serial]
    fn test_hooks_run_on_graceful_exit() {
        let heap = Heap::new();
        let witness = heap.atom(Value::int(0));
        let hook = heap.foreign(
            "mark",
            Box::new(move |_h: &Heap, _a: &[Value]| {
                crate::refs::atom_reset(witness, Value::int(1))
            }),
        );
        add_shutdown_hook("witness", hook).unwrap();
        graceful_exit(&heap);
        remove_shutdown_hook("witness");
        assert_eq!(crate::refs::atom_deref(witness).unwrap().as_int(), 1);
    }

    #[test]
    #[serial]
    fn test_poll_loop_stops_on_flag() {
        reset_shutdown_flag();
        request_shutdown();
        let mut ticks = 0;
        run_poll_loop(|| {
            ticks += 1;
            true
        });
        assert_eq!(ticks, 0);
        reset_shutdown_flag();
    }
}
