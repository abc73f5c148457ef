//! Agents
//!
//! An agent is a mutable reference whose updates are serialized through a
//! per-agent FIFO action queue executed on the thread pool. `send` is
//! non-blocking: it enqueues and, when the agent is idle, claims the
//! processing flag and submits the agent to the pool in one atomic step,
//! so two workers can never drain the same agent concurrently.

use std::sync::Arc;

use tracing::warn;

use crate::dispatch;
use crate::error::{Error, ErrorKind, Result};
use crate::future::FutureResult;
use crate::heap::Heap;
use crate::ns::Env;
use crate::value::{AgentAction, AgentData, AgentErrorMode, HeapObj, Value};

fn agent_data(v: Value) -> Result<&'static AgentData> {
    if v.is_heap() {
        if let HeapObj::Agent(a) = v.obj() {
            // The heap outlives every value; stretch the borrow to match.
            return Ok(unsafe { &*(a as *const AgentData) });
        }
    }
    Err(Error::type_error(format!("{} is not an agent", v.type_name())))
}

/// Current state of the agent.
pub fn agent_deref(agent: Value) -> Result<Value> {
    Ok(agent_data(agent)?.inner.lock().expect("agent poisoned").state)
}

/// Cached error of a failed agent, if any.
pub fn agent_error(agent: Value) -> Result<Option<Value>> {
    Ok(agent_data(agent)?.inner.lock().expect("agent poisoned").error)
}

pub fn agent_set_error_mode(agent: Value, mode: AgentErrorMode) -> Result<()> {
    agent_data(agent)?.inner.lock().expect("agent poisoned").error_mode = mode;
    Ok(())
}

pub fn agent_set_error_handler(agent: Value, handler: Option<Value>) -> Result<()> {
    agent_data(agent)?
        .inner
        .lock()
        .expect("agent poisoned")
        .error_handler = handler;
    Ok(())
}

/// Clear a failed agent's error and optionally reset its state.
pub fn agent_restart(agent: Value, new_state: Value) -> Result<Value> {
    let data = agent_data(agent)?;
    let mut inner = data.inner.lock().expect("agent poisoned");
    inner.error = None;
    inner.state = new_state;
    Ok(new_state)
}

pub fn agent_add_watch(agent: Value, key: Value, f: Value) -> Result<()> {
    let data = agent_data(agent)?;
    let mut inner = data.inner.lock().expect("agent poisoned");
    inner.watches.retain(|(k, _)| !crate::eql::eql(*k, key));
    inner.watches.push((key, f));
    Ok(())
}

pub fn agent_remove_watch(agent: Value, key: Value) -> Result<()> {
    let data = agent_data(agent)?;
    let mut inner = data.inner.lock().expect("agent poisoned");
    inner.watches.retain(|(k, _)| !crate::eql::eql(*k, key));
    Ok(())
}

/// Enqueue `(f state args...)` for asynchronous application.
///
/// Returns the agent. Fails on an agent already in the error state under
/// `fail` mode.
pub fn agent_send(env: &Env, agent: Value, f: Value, args: Vec<Value>) -> Result<Value> {
    let data = agent_data(agent)?;
    let claimed = {
        let mut inner = data.inner.lock().expect("agent poisoned");
        if inner.error.is_some() && inner.error_mode == AgentErrorMode::Fail {
            return Err(Error::value_error("Agent is failed, needs restart"));
        }
        inner.queue.push_back(AgentAction::Apply(f, args));
        if inner.processing {
            false
        } else {
            inner.processing = true;
            true
        }
    };
    if claimed {
        crate::pool::submit_agent(env, agent);
    }
    Ok(agent)
}

/// Block until every queued action on the given agents has run.
pub fn agent_await(agents: &[Value]) -> Result<()> {
    let mut pending: Vec<Arc<FutureResult>> = Vec::new();
    for agent in agents {
        let data = agent_data(*agent)?;
        let mut inner = data.inner.lock().expect("agent poisoned");
        if inner.processing || !inner.queue.is_empty() {
            let fut = FutureResult::new();
            inner.queue.push_back(AgentAction::Notify(fut.clone()));
            pending.push(fut);
        }
    }
    for fut in pending {
        fut.get()?;
    }
    Ok(())
}

/// Drain an agent's queue on a pool worker.
///
/// Only the worker holding the processing flag runs this; the flag clears
/// under the lock when the queue is empty, so a concurrent `send` either
/// sees the flag and just enqueues, or re-claims and re-submits.
pub fn run_agent(heap: &Heap, agent: Value) {
    let data = match agent_data(agent) {
        Ok(d) => d,
        Err(_) => return,
    };
    loop {
        let action = {
            let mut inner = data.inner.lock().expect("agent poisoned");
            match inner.queue.pop_front() {
                None => {
                    inner.processing = false;
                    return;
                }
                Some(action) => {
                    // A failed agent in fail mode drops pending
                    // applications but still completes awaits.
                    if inner.error.is_some()
                        && inner.error_mode == AgentErrorMode::Fail
                        && matches!(action, AgentAction::Apply(..))
                    {
                        continue;
                    }
                    action
                }
            }
        };

        match action {
            AgentAction::Notify(fut) => fut.set_result(Value::nil()),
            AgentAction::Apply(f, args) => {
                let state = data.inner.lock().expect("agent poisoned").state;
                let mut call_args = Vec::with_capacity(1 + args.len());
                call_args.push(state);
                call_args.extend(args);
                match dispatch::call_fn_val(heap, f, &call_args) {
                    Ok(new_state) => {
                        let (old, watches) = {
                            let mut inner = data.inner.lock().expect("agent poisoned");
                            let old = inner.state;
                            inner.state = new_state;
                            (old, inner.watches.clone())
                        };
                        for (key, watch_fn) in watches {
                            if let Err(e) = dispatch::call_fn_val(
                                heap,
                                watch_fn,
                                &[key, agent, old, new_state],
                            ) {
                                warn!(error = %e, "agent watch failed");
                            }
                        }
                    }
                    Err(e) => {
                        let error_value = error_to_value(heap, &e);
                        let handler = data
                            .inner
                            .lock()
                            .expect("agent poisoned")
                            .error_handler;
                        match handler {
                            Some(handler) => {
                                if let Err(he) =
                                    dispatch::call_fn_val(heap, handler, &[agent, error_value])
                                {
                                    warn!(error = %he, "agent error handler failed");
                                }
                            }
                            None => {
                                let mut inner = data.inner.lock().expect("agent poisoned");
                                match inner.error_mode {
                                    AgentErrorMode::Fail => inner.error = Some(error_value),
                                    AgentErrorMode::Continue => {}
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// The thrown value for user exceptions, a message string otherwise.
pub fn error_to_value(heap: &Heap, e: &Error) -> Value {
    match &e.kind {
        ErrorKind::User(v) => *v,
        _ => heap.str_value(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_state_and_watch_bookkeeping() {
        let env = Env::new("user");
        let h = &env.heap;
        let a = h.agent(Value::int(0));
        assert_eq!(agent_deref(a).unwrap().as_int(), 0);

        let k = h.keyword(None, "w");
        let f = h.builtin("noop", |_h, _a| Ok(Value::nil()));
        agent_add_watch(a, k, f).unwrap();
        agent_add_watch(a, k, f).unwrap();
        {
            let data = agent_data(a).unwrap();
            assert_eq!(data.inner.lock().unwrap().watches.len(), 1);
        }
        agent_remove_watch(a, k).unwrap();
        {
            let data = agent_data(a).unwrap();
            assert!(data.inner.lock().unwrap().watches.is_empty());
        }
    }

    #[test]
    fn test_run_agent_applies_in_order() {
        let env = Env::new("user");
        let h = &env.heap;
        let a = h.agent(h.vector_from(vec![]));
        fn append(heap: &Heap, args: &[Value]) -> Result<Value> {
            crate::collections::conj(heap, args[0], args[1])
        }
        let f = h.builtin("append", append);
        {
            let data = agent_data(a).unwrap();
            let mut inner = data.inner.lock().unwrap();
            inner.processing = true;
            for i in 0..5 {
                inner
                    .queue
                    .push_back(AgentAction::Apply(f, vec![Value::int(i)]));
            }
        }
        run_agent(h, a);
        let state = agent_deref(a).unwrap();
        let items = state.as_seq_items();
        assert_eq!(items.len(), 5);
        assert_eq!(items[0].as_int(), 0);
        assert_eq!(items[4].as_int(), 4);
        // Flag cleared after drain
        assert!(!agent_data(a).unwrap().inner.lock().unwrap().processing);
    }

    #[test]
    fn test_fail_mode_records_error_and_drops_rest() {
        let env = Env::new("user");
        let h = &env.heap;
        let a = h.agent(Value::int(0));
        let boom = h.builtin("boom", |_h, _a| {
            Err(Error::value_error("deliberate failure"))
        });
        let inc = h.builtin("inc", |heap, args| {
            crate::arith::add_promoting(heap, args[0], Value::int(1))
        });
        {
            let data = agent_data(a).unwrap();
            let mut inner = data.inner.lock().unwrap();
            inner.processing = true;
            inner.queue.push_back(AgentAction::Apply(boom, vec![]));
            inner.queue.push_back(AgentAction::Apply(inc, vec![]));
        }
        run_agent(h, a);
        // Error recorded, state untouched by the dropped action
        assert!(agent_error(a).unwrap().is_some());
        assert_eq!(agent_deref(a).unwrap().as_int(), 0);

        // Restart clears the error
        agent_restart(a, Value::int(10)).unwrap();
        assert!(agent_error(a).unwrap().is_none());
        assert_eq!(agent_deref(a).unwrap().as_int(), 10);
    }

    #[test]
    fn test_continue_mode_ignores_errors() {
        let env = Env::new("user");
        let h = &env.heap;
        let a = h.agent(Value::int(0));
        agent_set_error_mode(a, AgentErrorMode::Continue).unwrap();
        let boom = h.builtin("boom", |_h, _a| {
            Err(Error::value_error("deliberate failure"))
        });
        let inc = h.builtin("inc", |heap, args| {
            crate::arith::add_promoting(heap, args[0], Value::int(1))
        });
        {
            let data = agent_data(a).unwrap();
            let mut inner = data.inner.lock().unwrap();
            inner.processing = true;
            inner.queue.push_back(AgentAction::Apply(boom, vec![]));
            inner.queue.push_back(AgentAction::Apply(inc, vec![]));
        }
        run_agent(h, a);
        assert!(agent_error(a).unwrap().is_none());
        assert_eq!(agent_deref(a).unwrap().as_int(), 1);
    }
}
