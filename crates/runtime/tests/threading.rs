//! Cross-thread behavior of the runtime substrate: binding conveyance,
//! future/agent ordering, and shared-state guarantees under the pool.

use std::sync::Arc;

use clove_runtime::agent::{agent_await, agent_deref, agent_send};
use clove_runtime::error::Result;
use clove_runtime::heap::Heap;
use clove_runtime::ns::Env;
use clove_runtime::pool::{ThreadPool, shutdown_global_pool};
use clove_runtime::refs::{atom_deref, atom_swap};
use clove_runtime::value::Value;
use clove_runtime::var::{self, Var};
use serial_test::serial;

fn inc(heap: &Heap, args: &[Value]) -> Result<Value> {
    clove_runtime::arith::add_promoting(heap, args[0], Value::int(1))
}

#[test]
fn futures_observe_spawning_thread_bindings() {
    let env = Env::new("user");
    let pool = ThreadPool::new(2);

    let v = Var::new("user", "*request-id*");
    v.set_dynamic(true);
    v.set_root(Value::int(-1));

    var::push_bindings(var::BindingFrame::new(vec![(v.clone(), Value::int(314))]));
    let var_for_worker = v.clone();
    let read_binding = env.heap.foreign(
        "read-binding",
        Box::new(move |_h, _a| Ok(var_for_worker.deref())),
    );
    let fut = pool.submit_fn(&env, read_binding);
    assert_eq!(fut.get().unwrap().as_int(), 314);
    var::pop_bindings();

    // After the frame pops, a new submission sees the root
    let var_for_worker = v.clone();
    let read_binding = env.heap.foreign(
        "read-binding",
        Box::new(move |_h, _a| Ok(var_for_worker.deref())),
    );
    let fut = pool.submit_fn(&env, read_binding);
    assert_eq!(fut.get().unwrap().as_int(), -1);
    pool.shutdown();
}

#[test]
fn futures_observe_spawning_thread_namespace() {
    let env = Env::new("user");
    env.in_ns("worker.jobs");
    let pool = ThreadPool::new(1);

    let read_ns = env.heap.builtin("read-ns", |heap, _args| {
        clove_runtime::ns::eval_env(|env| match env {
            Some(env) => Ok(heap.str_value(env.current_ns().name.clone())),
            None => Ok(Value::nil()),
        })
    });
    let fut = pool.submit_fn(&env, read_ns);
    let seen = fut.get().unwrap();
    assert_eq!(seen.as_str(), "worker.jobs");
    pool.shutdown();
}

#[test]
#[serial]
fn agent_actions_totally_ordered_by_submission() {
    shutdown_global_pool();
    let env = Env::new("user");
    let h = &env.heap;
    let a = h.agent(h.vector_from(vec![]));

    fn append(heap: &Heap, args: &[Value]) -> Result<Value> {
        clove_runtime::collections::conj(heap, args[0], args[1])
    }
    let f = h.builtin("append", append);

    for i in 0..50 {
        agent_send(&env, a, f, vec![Value::int(i)]).unwrap();
    }
    agent_await(&[a]).unwrap();

    let state = agent_deref(a).unwrap();
    let items = state.as_seq_items();
    assert_eq!(items.len(), 50);
    for (i, item) in items.iter().enumerate() {
        assert_eq!(item.as_int(), i as i64, "order preserved at {i}");
    }
    shutdown_global_pool();
}

#[test]
#[serial]
fn no_interleaving_on_one_agent_from_many_senders() {
    shutdown_global_pool();
    let env = Env::new("user");
    let h = &env.heap;
    // State is a counter; each action reads, yields, writes: interleaving
    // would lose increments
    let a = h.agent(Value::int(0));
    let bump = h.builtin("bump", |heap, args| {
        let seen = args[0];
        std::thread::yield_now();
        clove_runtime::arith::add_promoting(heap, seen, Value::int(1))
    });

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let env = env.thread_clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    agent_send(&env, a, bump, vec![]).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    agent_await(&[a]).unwrap();
    assert_eq!(agent_deref(a).unwrap().as_int(), 100);
    shutdown_global_pool();
}

#[test]
fn atom_cas_survives_contention_across_pool_and_threads() {
    let env = Env::new("user");
    let h = &env.heap;
    let a = h.atom(Value::int(0));
    let inc_fn = h.builtin("inc", inc);

    let pool = ThreadPool::new(4);
    let futures: Vec<_> = (0..200)
        .map(|_| {
            let swapper = h.foreign(
                "swap-inc",
                Box::new(move |heap: &Heap, _args: &[Value]| {
                    atom_swap(heap, a, inc_fn, &[])
                }),
            );
            pool.submit_fn(&env, swapper)
        })
        .collect();
    for fut in futures {
        fut.get().unwrap();
    }
    assert_eq!(atom_deref(a).unwrap().as_int(), 200);
    pool.shutdown();
}

#[test]
fn var_roots_shared_across_threads() {
    let env = Env::new("user");
    let ns = env.current_ns();
    let v = ns.intern("shared");
    v.set_root(Value::int(0));

    let writer = {
        let v = v.clone();
        std::thread::spawn(move || {
            v.set_root(Value::int(7));
        })
    };
    writer.join().unwrap();
    assert_eq!(v.deref().as_int(), 7);

    // Registry lookups stay safe while another thread interns
    let registry = env.registry.clone();
    let interner = std::thread::spawn(move || {
        let other = registry.find_or_create("other.ns");
        for i in 0..100 {
            other.intern(&format!("v{i}"));
        }
    });
    for _ in 0..100 {
        let _ = env.registry.find("user");
    }
    interner.join().unwrap();
    assert!(env.registry.find("other.ns").unwrap().lookup("v99").is_some());
}

#[test]
fn heap_sharing_across_threads() {
    let heap = Heap::new();
    let shared = heap.str_value("shared across threads");
    let heap2 = Arc::clone(&heap);
    let observed = std::thread::spawn(move || {
        // Allocate from another thread while reading the shared value
        for i in 0..1000 {
            heap2.int(i);
        }
        shared.as_str().len()
    })
    .join()
    .unwrap();
    assert_eq!(observed, "shared across threads".len());
}
