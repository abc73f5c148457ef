//! Callable dispatch
//!
//! `call_fn_val` is the single entry point for calling any value. The
//! runtime sits below the evaluators, yet must call back into them for
//! interpreted functions; the bridge vtable installed once at boot breaks
//! that cycle. The runtime depends only on function pointers, never on
//! concrete evaluator types.
//!
//! While a VM is executing on a thread it publishes an invoke hook here;
//! bytecode calls prefer the hook so nested calls reuse the live stack
//! instead of allocating a fresh VM per call.

use std::cell::Cell;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::value::{Backend, HeapObj, Value};

/// Signature shared by both back-end bridges: invoke `callee` with `args`.
pub type BridgeFn = fn(&Heap, Value, &[Value]) -> Result<Value>;

/// Canonical type key of a value, for protocol lookup.
pub type TypeKeyFn = fn(Value) -> &'static str;

/// The seq-ops triplet.
#[derive(Clone, Copy)]
pub struct SeqOps {
    pub seq: fn(&Heap, Value) -> Result<Value>,
    pub first: fn(&Heap, Value) -> Result<Value>,
    pub rest: fn(&Heap, Value) -> Result<Value>,
}

/// The vtable registered before the first call.
#[derive(Clone, Copy)]
pub struct Bridges {
    pub tree_walk: BridgeFn,
    pub bytecode: BridgeFn,
    pub type_key: TypeKeyFn,
    pub seq_ops: SeqOps,
}

static BRIDGES: OnceLock<Bridges> = OnceLock::new();

/// Install the back-end bridges. Boot calls this exactly once; later calls
/// are ignored so embedded REPL restarts stay harmless.
pub fn install_bridges(bridges: Bridges) {
    let _ = BRIDGES.set(bridges);
}

pub fn bridges_installed() -> bool {
    BRIDGES.get().is_some()
}

fn bridges() -> Result<&'static Bridges> {
    BRIDGES
        .get()
        .ok_or_else(|| Error::internal("dispatch bridges not installed"))
}

/// The installed seq-ops triplet.
pub fn seq_ops() -> Result<SeqOps> {
    Ok(bridges()?.seq_ops)
}

/// Type key of a value through the installed extractor, falling back to
/// the value's own tag name before boot completes.
pub fn type_key(v: Value) -> &'static str {
    match BRIDGES.get() {
        Some(b) => (b.type_key)(v),
        None => v.type_name(),
    }
}

// =============================================================================
// Active-VM hook
// =============================================================================

/// Re-entry point into a VM currently executing on this thread.
#[derive(Clone, Copy)]
pub struct ActiveVm {
    /// Opaque pointer to the live VM, owned by the executing frame.
    pub ctx: usize,
    /// Invoke a bytecode function on the live stack.
    pub invoke: fn(usize, &Heap, Value, &[Value]) -> Result<Value>,
}

thread_local! {
    static ACTIVE_VM: Cell<Option<ActiveVm>> = const { Cell::new(None) };

    /// Set by `apply` just before invoking a variadic interpreted
    /// function: the trailing argument is already a sequence and should
    /// bind directly as the rest parameter instead of being flattened and
    /// re-collected.
    static APPLY_REST_IS_SEQ: Cell<bool> = const { Cell::new(false) };
}

/// Arm the apply-rest-is-seq flag for the next interpreted-function bind
/// on this thread.
pub fn set_apply_rest_seq(on: bool) {
    APPLY_REST_IS_SEQ.with(|cell| cell.set(on));
}

/// Consume the flag; binding clears it whether or not it applies.
pub fn take_apply_rest_seq() -> bool {
    APPLY_REST_IS_SEQ.with(|cell| cell.replace(false))
}

/// Publish a VM as active on this thread, returning the previous hook for
/// restoration when the frame exits.
pub fn set_active_vm(vm: Option<ActiveVm>) -> Option<ActiveVm> {
    ACTIVE_VM.with(|cell| cell.replace(vm))
}

pub fn active_vm() -> Option<ActiveVm> {
    ACTIVE_VM.with(|cell| cell.get())
}

// =============================================================================
// call_fn_val
// =============================================================================

/// Call any callable value with the given arguments.
pub fn call_fn_val(heap: &Heap, callee: Value, args: &[Value]) -> Result<Value> {
    if !callee.is_heap() {
        return Err(Error::type_error(format!(
            "{} is not callable",
            callee.type_name()
        )));
    }
    match callee.obj() {
        HeapObj::Builtin(b) => (b.f)(heap, args),
        HeapObj::Fn(f) => match f.backend {
            Backend::Bytecode => match active_vm() {
                Some(vm) => (vm.invoke)(vm.ctx, heap, callee, args),
                None => (bridges()?.bytecode)(heap, callee, args),
            },
            Backend::TreeWalk => (bridges()?.tree_walk)(heap, callee, args),
        },
        HeapObj::Multi(multi) => {
            let dispatch_value = call_fn_val(heap, multi.dispatch, args)?;
            let method = {
                let methods = multi.methods.lock().expect("multimethod poisoned");
                let found = methods
                    .iter()
                    .find(|(k, _)| crate::eql::eql(*k, dispatch_value))
                    .map(|(_, m)| *m);
                match found {
                    Some(m) => Some(m),
                    None => {
                        let default_key = heap.keyword(None, "default");
                        methods
                            .iter()
                            .find(|(k, _)| crate::eql::eql(*k, default_key))
                            .map(|(_, m)| *m)
                    }
                }
            };
            match method {
                Some(m) => call_fn_val(heap, m, args),
                None => Err(Error::value_error(format!(
                    "no method in multimethod '{}' for dispatch value",
                    multi.name
                ))),
            }
        }
        HeapObj::Keyword(_) => {
            check_arity("keyword lookup", args.len(), 1, 2)?;
            let target = args[0];
            // Over a module handle a keyword resolves the named export
            if target.is_heap() {
                if let HeapObj::Module(_) = target.obj() {
                    return module_resolve(callee, target);
                }
            }
            match crate::collections::map_get(target, callee) {
                Some(v) => Ok(v),
                None => Ok(args.get(1).copied().unwrap_or_else(Value::nil)),
            }
        }
        HeapObj::ArrayMap(_) | HeapObj::Map(_) => {
            check_arity("map lookup", args.len(), 1, 2)?;
            match crate::collections::map_get(callee, args[0]) {
                Some(v) => Ok(v),
                None => Ok(args.get(1).copied().unwrap_or_else(Value::nil)),
            }
        }
        HeapObj::Set(_) => {
            check_arity("set lookup", args.len(), 1, 1)?;
            if crate::collections::set_contains(callee, args[0]) {
                Ok(args[0])
            } else {
                Ok(Value::nil())
            }
        }
        HeapObj::Module(_) => {
            check_arity("module resolve", args.len(), 1, 1)?;
            module_resolve(args[0], callee)
        }
        HeapObj::Foreign(f) => (f.f)(heap, args),
        HeapObj::Var(var) => {
            let referenced = var.deref();
            call_fn_val(heap, referenced, args)
        }
        HeapObj::Protocol(proto) => {
            let target = args.first().copied().ok_or_else(|| {
                Error::arity(format!(
                    "protocol method '{}' needs at least one argument",
                    proto.name
                ))
            })?;
            let key = type_key(target);
            let implementation = {
                let impls = proto.impls.lock().expect("protocol poisoned");
                impls.iter().find(|(k, _)| k == key).map(|(_, f)| *f)
            };
            match implementation {
                Some(f) => call_fn_val(heap, f, args),
                None => Err(Error::type_error(format!(
                    "no implementation of '{}' for {}",
                    proto.name, key
                ))),
            }
        }
        other => Err(Error::type_error(format!(
            "{} is not callable",
            other.kind().name()
        ))),
    }
}

fn check_arity(what: &str, got: usize, min: usize, max: usize) -> Result<()> {
    if got < min || got > max {
        return Err(Error::arity(format!(
            "{what} expects {min}..{max} arguments, got {got}"
        )));
    }
    Ok(())
}

/// Resolve a module export named by a keyword or string.
fn module_resolve(name: Value, module: Value) -> Result<Value> {
    let HeapObj::Module(m) = module.obj() else {
        return Err(Error::type_error("expected a module handle"));
    };
    let wanted = if name.is_heap() {
        match name.obj() {
            HeapObj::Keyword(sym) => sym.name.clone(),
            HeapObj::Str(s) => s.clone(),
            _ => {
                return Err(
                    Error::type_error("module export name must be a keyword or string")
                        .with_arg(0),
                );
            }
        }
    } else {
        return Err(
            Error::type_error("module export name must be a keyword or string").with_arg(0),
        );
    };
    let exports = m.exports.lock().expect("module poisoned");
    exports
        .iter()
        .find(|(n, _)| *n == wanted)
        .map(|(_, v)| *v)
        .ok_or_else(|| {
            Error::value_error(format!("module '{}' has no export '{}'", m.name, wanted))
        })
}
