//! Thread pool
//!
//! A fixed-size pool of OS worker threads (default: CPU count) running two
//! work-item kinds: nullary callables paired with a `FutureResult`, and
//! agent queue drains. Submission captures the spawning thread's
//! namespace (through an env thread-clone) and its binding-frame stack, so
//! workers observe the caller's dynamic context.
//!
//! The pool's own allocations - the queue, thread handles, future cells -
//! are plain Rust ownership and never touch the value heap, so heap scans
//! cannot reclaim a live OS thread handle out from under the pool. Values
//! produced inside a work item allocate through the shared heap as usual.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::dispatch;
use crate::error::{Error, format_panic_payload, take_last_exception};
use crate::future::FutureResult;
use crate::ns::{Env, with_eval_env};
use crate::value::Value;
use crate::var::{self, BindingConveyance};

/// Completed work items across all pools, for diagnostics.
pub static TOTAL_COMPLETED: AtomicU64 = AtomicU64::new(0);

/// Context conveyed from the submitting thread to a worker.
struct WorkCtx {
    env: Env,
    bindings: BindingConveyance,
}

enum WorkItem {
    Func {
        callable: Value,
        result: Arc<FutureResult>,
        ctx: WorkCtx,
    },
    Agent {
        agent: Value,
        ctx: WorkCtx,
    },
}

struct PoolShared {
    queue: Mutex<VecDeque<WorkItem>>,
    available: Condvar,
    shutdown: AtomicBool,
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl ThreadPool {
    pub fn new(size: usize) -> ThreadPool {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..size)
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("clove-worker-{i}"))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn pool worker")
            })
            .collect();
        ThreadPool {
            shared,
            workers: Mutex::new(workers),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn submit(&self, item: WorkItem) {
        let mut queue = self.shared.queue.lock().expect("pool queue poisoned");
        queue.push_back(item);
        self.shared.available.notify_one();
    }

    /// Submit a nullary callable; the returned future completes with its
    /// value or error.
    pub fn submit_fn(&self, env: &Env, callable: Value) -> Arc<FutureResult> {
        let result = FutureResult::new();
        self.submit(WorkItem::Func {
            callable,
            result: result.clone(),
            ctx: WorkCtx {
                env: env.thread_clone(),
                bindings: var::conveyance(),
            },
        });
        result
    }

    /// Submit an agent whose processing flag the caller just claimed.
    pub fn submit_agent(&self, env: &Env, agent: Value) {
        self.submit(WorkItem::Agent {
            agent,
            ctx: WorkCtx {
                env: env.thread_clone(),
                bindings: var::conveyance(),
            },
        });
    }

    /// Signal workers to drain the queue and join them.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        let mut workers = self.workers.lock().expect("pool workers poisoned");
        for worker in workers.drain(..) {
            if let Err(payload) = worker.join() {
                warn!(
                    panic = %format_panic_payload(&payload),
                    "pool worker panicked during shutdown"
                );
            }
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let item = {
            let mut queue = shared.queue.lock().expect("pool queue poisoned");
            loop {
                if let Some(item) = queue.pop_front() {
                    break item;
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                queue = shared
                    .available
                    .wait(queue)
                    .expect("pool queue poisoned");
            }
        };
        run_item(item);
        TOTAL_COMPLETED.fetch_add(1, Ordering::Relaxed);
    }
}

fn run_item(item: WorkItem) {
    match item {
        WorkItem::Func {
            callable,
            result,
            ctx,
        } => {
            let prev = var::install_conveyance(ctx.bindings);
            let heap = ctx.env.heap.clone();
            let outcome = with_eval_env(&ctx.env, || {
                catch_unwind(AssertUnwindSafe(|| {
                    dispatch::call_fn_val(&heap, callable, &[])
                }))
            });
            match outcome {
                Ok(Ok(v)) => result.set_result(v),
                Ok(Err(e)) => result.set_error(e),
                Err(payload) => {
                    // Prefer the thrown exception value when one is
                    // pending; synthesize from the panic otherwise.
                    let error = match take_last_exception() {
                        Some(v) => Error::user(v, "worker exception"),
                        None => Error::internal(format_panic_payload(&payload)),
                    };
                    result.set_error(error);
                }
            }
            var::install_conveyance(prev);
        }
        WorkItem::Agent { agent, ctx } => {
            let prev = var::install_conveyance(ctx.bindings);
            let heap = ctx.env.heap.clone();
            let outcome = with_eval_env(&ctx.env, || {
                catch_unwind(AssertUnwindSafe(|| crate::agent::run_agent(&heap, agent)))
            });
            if let Err(payload) = outcome {
                warn!(
                    panic = %format_panic_payload(&payload),
                    "agent action panicked"
                );
            }
            var::install_conveyance(prev);
        }
    }
}

// =============================================================================
// Global pool
// =============================================================================

static GLOBAL_POOL: Mutex<Option<Arc<ThreadPool>>> = Mutex::new(None);

/// The process-wide pool, created lazily on the first future/agent/pmap
/// submission.
pub fn global_pool() -> Arc<ThreadPool> {
    let mut guard = GLOBAL_POOL.lock().expect("global pool poisoned");
    match &*guard {
        Some(pool) => pool.clone(),
        None => {
            let size = num_cpus::get().max(1);
            debug!(size, "creating global thread pool");
            let pool = Arc::new(ThreadPool::new(size));
            *guard = Some(pool.clone());
            pool
        }
    }
}

/// Submit a future to the global pool.
pub fn submit_future(env: &Env, callable: Value) -> Arc<FutureResult> {
    global_pool().submit_fn(env, callable)
}

/// Submit an agent drain to the global pool.
pub fn submit_agent(env: &Env, agent: Value) {
    global_pool().submit_agent(env, agent);
}

/// Drain and join the global pool; the next submission recreates it.
pub fn shutdown_global_pool() {
    let pool = GLOBAL_POOL.lock().expect("global pool poisoned").take();
    if let Some(pool) = pool {
        debug!("shutting down global thread pool");
        pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_pool_runs_function_items() {
        let env = Env::new("user");
        let pool = ThreadPool::new(2);
        let f = env.heap.builtin("answer", |_h, _a| Ok(Value::int(42)));
        let fut = pool.submit_fn(&env, f);
        assert_eq!(fut.get().unwrap().as_int(), 42);
        pool.shutdown();
    }

    #[test]
    fn test_pool_captures_errors() {
        let env = Env::new("user");
        let pool = ThreadPool::new(1);
        let f = env
            .heap
            .builtin("boom", |_h, _a| Err(Error::value_error("worker failure")));
        let fut = pool.submit_fn(&env, f);
        assert_eq!(fut.get().unwrap_err().message, "worker failure");
        pool.shutdown();
    }

    #[test]
    fn test_pool_synthesizes_error_from_panic() {
        let env = Env::new("user");
        let pool = ThreadPool::new(1);
        let f = env
            .heap
            .builtin("panic", |_h, _a| panic!("deliberate worker panic"));
        let fut = pool.submit_fn(&env, f);
        let err = fut.get().unwrap_err();
        assert!(err.message.contains("deliberate worker panic"));
        // The worker survives the panic and keeps serving
        let ok = env.heap.builtin("fine", |_h, _a| Ok(Value::int(1)));
        assert_eq!(pool.submit_fn(&env, ok).get().unwrap().as_int(), 1);
        pool.shutdown();
    }

    #[test]
    fn test_bindings_conveyed_to_worker() {
        let env = Env::new("user");
        let pool = ThreadPool::new(1);
        let v = crate::var::Var::new("user", "*ctx*");
        v.set_dynamic(true);
        v.set_root(Value::int(0));

        var::push_bindings(crate::var::BindingFrame::new(vec![(
            v.clone(),
            Value::int(9),
        )]));
        let var_for_worker = v.clone();
        let f = env.heap.foreign(
            "read-ctx",
            Box::new(move |_h, _a| Ok(var_for_worker.deref())),
        );
        let fut = pool.submit_fn(&env, f);
        assert_eq!(fut.get().unwrap().as_int(), 9);
        var::pop_bindings();
        pool.shutdown();
    }

    #[test]
    #[serial]
    fn test_global_pool_lazy_create_and_shutdown() {
        shutdown_global_pool();
        let env = Env::new("user");
        let f = env.heap.builtin("one", |_h, _a| Ok(Value::int(1)));
        let fut = submit_future(&env, f);
        assert_eq!(fut.get().unwrap().as_int(), 1);
        shutdown_global_pool();
        // Recreated on the next submission
        let fut = submit_future(&env, f);
        assert_eq!(fut.get().unwrap().as_int(), 1);
        shutdown_global_pool();
    }

    #[test]
    #[serial]
    fn test_agent_send_through_global_pool() {
        shutdown_global_pool();
        let env = Env::new("user");
        let h = &env.heap;
        let a = h.agent(Value::int(0));
        let inc = h.builtin("inc", |heap, args| {
            crate::arith::add_promoting(heap, args[0], Value::int(1))
        });
        for _ in 0..20 {
            crate::agent::agent_send(&env, a, inc, vec![]).unwrap();
        }
        crate::agent::agent_await(&[a]).unwrap();
        assert_eq!(crate::agent::agent_deref(a).unwrap().as_int(), 20);
        shutdown_global_pool();
    }
}
