//! Bytecode VM
//!
//! A value-stack machine over [`crate::bytecode::Chunk`]s. While a VM is
//! executing it publishes itself through the active-VM hook, so dispatch
//! routes nested bytecode calls back into the running instance instead of
//! standing up a fresh VM per call; reduce callbacks and chained
//! predicates stay cheap.
//!
//! Errors unwind to the innermost armed try handler: the operand stack
//! truncates to the handler's recorded height, binding frames pushed since
//! the handler drop away, and the thrown value lands in the catch slot.

use std::cell::Cell;
use std::sync::Arc;

use clove_runtime::agent::error_to_value;
use clove_runtime::dispatch::{self, ActiveVm};
use clove_runtime::error::{Error, Result, set_last_exception};
use clove_runtime::heap::Heap;
use clove_runtime::ns::eval_env;
use clove_runtime::value::{Backend, FnData, Value};
use clove_runtime::var;

use crate::ast::{CaptureSource, FnProto};
use crate::bytecode::{Chunk, NO_CATCH_SLOT, Op, arity_chunk};

/// Nested bytecode calls beyond this depth abort rather than exhaust the
/// host stack.
const MAX_CALL_DEPTH: usize = 1024;

pub struct Vm {
    depth: Cell<usize>,
}

impl Vm {
    pub fn new() -> Vm {
        Vm {
            depth: Cell::new(0),
        }
    }

    /// Run with this VM published as the thread's active VM, restoring the
    /// previous hook on exit.
    fn with_hook<R>(&self, f: impl FnOnce() -> R) -> R {
        let hook = ActiveVm {
            ctx: self as *const Vm as usize,
            invoke: vm_invoke,
        };
        let prev = dispatch::set_active_vm(Some(hook));
        let result = f();
        dispatch::set_active_vm(prev);
        result
    }

    /// Execute a top-level chunk against a fresh root frame.
    pub fn run_chunk(&self, heap: &Heap, chunk: &Chunk) -> Result<Value> {
        self.with_hook(|| {
            let mut locals = vec![Value::nil(); chunk.n_slots];
            self.run(heap, chunk, &mut locals, &[], Value::nil())
        })
    }

    /// Invoke a bytecode closure on this VM.
    pub fn call_function(&self, heap: &Heap, callee: Value, args: &[Value]) -> Result<Value> {
        let data = callee.as_fn();
        let proto = data
            .proto
            .clone()
            .downcast::<FnProto>()
            .map_err(|_| Error::internal("function prototype from a foreign compiler"))?;
        let display_name = proto.name.clone().unwrap_or_else(|| "fn".to_string());
        let arity = proto.select_arity(args.len()).ok_or_else(|| {
            Error::arity(format!(
                "Wrong number of args ({}) passed to: {}",
                args.len(),
                display_name
            ))
        })?;
        let chunk = arity_chunk(arity)?;

        let depth = self.depth.get();
        if depth >= MAX_CALL_DEPTH {
            return Err(Error::internal("call stack depth limit exceeded"));
        }
        self.depth.set(depth + 1);

        let rest_is_seq = dispatch::take_apply_rest_seq();
        let mut locals = vec![Value::nil(); chunk.n_slots.max(arity.bound_params())];
        locals[..arity.params].copy_from_slice(&args[..arity.params]);
        if arity.variadic {
            let rest = &args[arity.params..];
            locals[arity.params] = if rest.is_empty() {
                Value::nil()
            } else if rest_is_seq
                && rest.len() == 1
                && clove_runtime::seq::is_seq_like(rest[0])
            {
                // apply handed us the trailing seq itself
                rest[0]
            } else {
                heap.list_from(rest.to_vec())
            };
        }

        let result = self.run(heap, &chunk, &mut locals, &data.env, callee);
        self.depth.set(depth);
        result
    }

    fn run(
        &self,
        heap: &Heap,
        chunk: &Chunk,
        locals: &mut [Value],
        captures: &[Value],
        self_val: Value,
    ) -> Result<Value> {
        let mut stack: Vec<Value> = Vec::with_capacity(8);
        let mut handlers: Vec<Handler> = Vec::new();
        let mut pending: Vec<Error> = Vec::new();
        let entry_depth = var::frame_depth();
        let mut pc: usize = 0;

        loop {
            let op = chunk.code[pc];
            match step(
                heap,
                chunk,
                op,
                &mut stack,
                locals,
                captures,
                self_val,
                &mut handlers,
                &mut pending,
                pc,
            ) {
                Ok(Ctl::Next) => pc += 1,
                Ok(Ctl::Jump(target)) => pc = target,
                Ok(Ctl::Ret(v)) => {
                    var::truncate_frames(entry_depth);
                    return Ok(v);
                }
                Err(e) => {
                    let e = anchor(e, chunk, pc);
                    match handlers.pop() {
                        Some(h) => {
                            stack.truncate(h.stack_len);
                            var::truncate_frames(h.frame_depth);
                            if h.slot != NO_CATCH_SLOT {
                                let thrown = error_to_value(heap, &e);
                                set_last_exception(thrown);
                                locals[h.slot as usize] = thrown;
                            }
                            pending.push(e);
                            pc = h.pc;
                        }
                        None => {
                            var::truncate_frames(entry_depth);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Invoke hook target: re-enter the live VM published on this thread.
fn vm_invoke(ctx: usize, heap: &Heap, callee: Value, args: &[Value]) -> Result<Value> {
    let vm = unsafe { &*(ctx as *const Vm) };
    vm.call_function(heap, callee, args)
}

/// The bytecode bridge: stand up a VM for a call arriving with no live VM
/// on this thread.
pub fn bridge(heap: &Heap, callee: Value, args: &[Value]) -> Result<Value> {
    let vm = Vm::new();
    vm.with_hook(|| vm.call_function(heap, callee, args))
}

struct Handler {
    pc: usize,
    slot: u16,
    stack_len: usize,
    frame_depth: usize,
}

enum Ctl {
    Next,
    Jump(usize),
    Ret(Value),
}

fn anchor(e: Error, chunk: &Chunk, pc: usize) -> Error {
    if let (Some(arg_idx), Op::Call { site, .. }) = (e.arg_index, chunk.code[pc]) {
        if let Some((line, col)) = chunk.call_sites[site as usize].get(arg_idx) {
            return e.at(*line, *col);
        }
    }
    let (line, col) = chunk.spans[pc];
    e.at(line, col)
}

#[allow(clippy::too_many_arguments)]
fn step(
    heap: &Heap,
    chunk: &Chunk,
    op: Op,
    stack: &mut Vec<Value>,
    locals: &mut [Value],
    captures: &[Value],
    self_val: Value,
    handlers: &mut Vec<Handler>,
    pending: &mut Vec<Error>,
    pc: usize,
) -> Result<Ctl> {
    match op {
        Op::Const(i) => stack.push(chunk.consts[i as usize]),
        Op::Nil => stack.push(Value::nil()),
        Op::LoadLocal(slot) => stack.push(locals[slot as usize]),
        Op::StoreLocal(slot) => {
            locals[slot as usize] = pop(stack)?;
        }
        Op::LoadCapture(i) => stack.push(captures[i as usize]),
        Op::LoadSelf => stack.push(self_val),
        Op::LoadVar(i) => stack.push(chunk.vars[i as usize].deref()),
        Op::VarObj(i) => stack.push(heap.var_value(chunk.vars[i as usize].clone())),

        Op::DefVar { var, has_init } => {
            let var = &chunk.vars[var as usize];
            if has_init {
                let v = pop(stack)?;
                var.set_root(v);
            }
            stack.push(heap.var_value(var.clone()));
        }

        Op::SetVarBang(i) => {
            let v = pop(stack)?;
            var::set_thread_binding(&chunk.vars[i as usize], v)?;
            stack.push(v);
        }

        Op::BindFrame(i) => {
            let spec = &chunk.bind_specs[i as usize];
            let mut entries = Vec::with_capacity(spec.len());
            for var_idx in spec.iter().rev() {
                let v = pop(stack)?;
                entries.push((chunk.vars[*var_idx as usize].clone(), v));
            }
            entries.reverse();
            var::push_bindings(var::BindingFrame::new(entries));
        }
        Op::UnbindFrame => var::pop_bindings(),

        Op::MakeClosure(i) => {
            let proto = &chunk.protos[i as usize];
            let env: Vec<Value> = proto
                .captures
                .iter()
                .map(|src| match src {
                    CaptureSource::Slot(s) => locals[*s],
                    CaptureSource::Capture(c) => captures[*c],
                    CaptureSource::SelfRef => self_val,
                })
                .collect();
            stack.push(heap.fn_value(FnData {
                name: proto.name.clone(),
                backend: Backend::Bytecode,
                proto: proto.clone() as Arc<dyn std::any::Any + Send + Sync>,
                env: env.into(),
            }));
        }

        Op::Call { argc, .. } => {
            let argc = argc as usize;
            let at = stack
                .len()
                .checked_sub(argc + 1)
                .ok_or_else(|| Error::internal("operand stack underflow"))?;
            let callee = stack[at];
            let result = dispatch::call_fn_val(heap, callee, &stack[at + 1..])?;
            stack.truncate(at);
            stack.push(result);
        }

        Op::Jump(offset) => return Ok(Ctl::Jump(offset_pc(pc, offset))),
        Op::JumpIfFalse(offset) => {
            let v = pop(stack)?;
            if !v.is_truthy() {
                return Ok(Ctl::Jump(offset_pc(pc, offset)));
            }
        }
        Op::Pop => {
            pop(stack)?;
        }

        Op::InNs(i) => {
            let name = &chunk.ns_names[i as usize];
            eval_env(|env| match env {
                Some(env) => {
                    let ns = env.in_ns(name);
                    crate::builtins::refer_core(env, &ns);
                    Ok(())
                }
                None => Err(Error::internal("ns change outside of a pipeline")),
            })?;
            stack.push(Value::nil());
        }

        Op::TryPush { handler, slot } => handlers.push(Handler {
            pc: handler as usize,
            slot,
            stack_len: stack.len(),
            frame_depth: var::frame_depth(),
        }),
        Op::TryPop => {
            handlers.pop();
        }

        Op::Throw => {
            let v = pop(stack)?;
            set_last_exception(v);
            return Err(Error::user(v, clove_runtime::print::pr_str(v)));
        }
        Op::Rethrow => {
            return Err(pending
                .pop()
                .unwrap_or_else(|| Error::internal("rethrow with no pending error")));
        }

        Op::MakeVector(n) => {
            let at = take_n(stack, n as usize)?;
            let items = stack.split_off(at);
            stack.push(heap.vector_from(items));
        }
        Op::MakeMap(n_pairs) => {
            let at = take_n(stack, n_pairs as usize * 2)?;
            let items = stack.split_off(at);
            let pairs = items.chunks(2).map(|p| (p[0], p[1])).collect();
            stack.push(clove_runtime::collections::map_from_pairs(heap, pairs));
        }
        Op::MakeSet(n) => {
            let at = take_n(stack, n as usize)?;
            let items = stack.split_off(at);
            stack.push(clove_runtime::collections::set_from_items(heap, items));
        }

        Op::Ret => return Ok(Ctl::Ret(stack.pop().unwrap_or_else(Value::nil))),
    }
    Ok(Ctl::Next)
}

fn pop(stack: &mut Vec<Value>) -> Result<Value> {
    stack
        .pop()
        .ok_or_else(|| Error::internal("operand stack underflow"))
}

fn take_n(stack: &[Value], n: usize) -> Result<usize> {
    stack
        .len()
        .checked_sub(n)
        .ok_or_else(|| Error::internal("operand stack underflow"))
}

fn offset_pc(pc: usize, offset: i32) -> usize {
    (pc as i64 + offset as i64) as usize
}
