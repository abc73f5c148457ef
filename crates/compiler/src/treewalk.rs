//! Tree-walking evaluator
//!
//! The reference back-end: direct evaluation over analyzed nodes with
//! slot-indexed frames. `recur` travels as a control-flow result bounded
//! by the nearest loop or function body; `try` maps runtime errors to
//! catchable values; `binding` frames are popped on every exit path.
//!
//! Registered as the tree-walk bridge at boot, so dispatch reaches us for
//! every interpreted function created by this back-end.

use std::sync::Arc;

use clove_runtime::agent::error_to_value;
use clove_runtime::dispatch;
use clove_runtime::error::{Error, Result};
use clove_runtime::heap::Heap;
use clove_runtime::ns::{Env, eval_env};
use clove_runtime::value::{Backend, FnData, Value};
use clove_runtime::var;

use crate::ast::{CaptureSource, FnProto, Node, NodeKind};

/// Result of evaluating a node: a value, or an in-flight `recur`.
pub enum Flow {
    Val(Value),
    Recur(Vec<Value>),
}

struct Ctx<'a> {
    heap: &'a Heap,
    captures: &'a [Value],
    self_val: Value,
}

/// Evaluate a top-level node against a fresh root frame.
pub fn eval_top(env: &Env, node: &Node, n_slots: usize) -> Result<Value> {
    let mut frame = vec![Value::nil(); n_slots];
    let ctx = Ctx {
        heap: &env.heap,
        captures: &[],
        self_val: Value::nil(),
    };
    match eval(&ctx, node, &mut frame)? {
        Flow::Val(v) => Ok(v),
        Flow::Recur(_) => Err(Error::value_error("recur outside of loop or fn")
            .at(node.line, node.col)),
    }
}

/// The bridge installed into dispatch for tree-walk closures.
pub fn bridge(heap: &Heap, callee: Value, args: &[Value]) -> Result<Value> {
    call_fn(heap, callee, args)
}

/// Invoke an interpreted function created by this back-end.
pub fn call_fn(heap: &Heap, callee: Value, args: &[Value]) -> Result<Value> {
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

    let mut frame = vec![Value::nil(); arity.slots];
    bind_args(heap, &mut frame, arity.params, arity.variadic, args);

    let ctx = Ctx {
        heap,
        captures: &data.env,
        self_val: callee,
    };
    loop {
        match eval_body(&ctx, &arity.body, &mut frame)? {
            Flow::Val(v) => return Ok(v),
            Flow::Recur(vals) => {
                let bound = arity.bound_params();
                if vals.len() != bound {
                    return Err(Error::arity(format!(
                        "recur expects {bound} arguments, got {}",
                        vals.len()
                    )));
                }
                frame[..bound].copy_from_slice(&vals);
            }
        }
    }
}

fn bind_args(heap: &Heap, frame: &mut [Value], params: usize, variadic: bool, args: &[Value]) {
    let rest_is_seq = dispatch::take_apply_rest_seq();
    frame[..params].copy_from_slice(&args[..params]);
    if variadic {
        let rest = &args[params..];
        frame[params] = if rest.is_empty() {
            Value::nil()
        } else if rest_is_seq && rest.len() == 1 && clove_runtime::seq::is_seq_like(rest[0]) {
            // apply handed us the trailing seq itself
            rest[0]
        } else {
            heap.list_from(rest.to_vec())
        };
    }
}

fn eval_body(ctx: &Ctx<'_>, body: &[Node], frame: &mut Vec<Value>) -> Result<Flow> {
    let mut result = Flow::Val(Value::nil());
    for (i, node) in body.iter().enumerate() {
        result = eval(ctx, node, frame)?;
        if matches!(result, Flow::Recur(_)) && i + 1 < body.len() {
            return Ok(result);
        }
    }
    Ok(result)
}

fn eval(ctx: &Ctx<'_>, node: &Node, frame: &mut Vec<Value>) -> Result<Flow> {
    match &node.kind {
        NodeKind::Const(v) => Ok(Flow::Val(*v)),
        NodeKind::LocalRef { slot, .. } => Ok(Flow::Val(frame[*slot])),
        NodeKind::CaptureRef { idx, .. } => Ok(Flow::Val(ctx.captures[*idx])),
        NodeKind::SelfRef => Ok(Flow::Val(ctx.self_val)),
        NodeKind::VarRef(v) => Ok(Flow::Val(v.deref())),
        NodeKind::TheVar(v) => Ok(Flow::Val(ctx.heap.var_value(v.clone()))),

        NodeKind::If { test, then, els } => {
            let t = match eval(ctx, test, frame)? {
                Flow::Val(v) => v,
                recur => return Ok(recur),
            };
            if t.is_truthy() {
                eval(ctx, then, frame)
            } else {
                match els {
                    Some(e) => eval(ctx, e, frame),
                    None => Ok(Flow::Val(Value::nil())),
                }
            }
        }

        NodeKind::Do(body) => eval_body(ctx, body, frame),

        NodeKind::Let {
            bindings,
            body,
            is_loop,
        } => {
            for (slot, init) in bindings {
                match eval(ctx, init, frame)? {
                    Flow::Val(v) => frame[*slot] = v,
                    recur => return Ok(recur),
                }
            }
            if !is_loop {
                return eval_body(ctx, body, frame);
            }
            loop {
                match eval_body(ctx, body, frame)? {
                    Flow::Val(v) => return Ok(Flow::Val(v)),
                    Flow::Recur(vals) => {
                        if vals.len() != bindings.len() {
                            return Err(Error::arity(format!(
                                "recur expects {} arguments, got {}",
                                bindings.len(),
                                vals.len()
                            ))
                            .at(node.line, node.col));
                        }
                        for ((slot, _), v) in bindings.iter().zip(vals) {
                            frame[*slot] = v;
                        }
                    }
                }
            }
        }

        NodeKind::Recur(args) => {
            let mut vals = Vec::with_capacity(args.len());
            for a in args {
                match eval(ctx, a, frame)? {
                    Flow::Val(v) => vals.push(v),
                    recur => return Ok(recur),
                }
            }
            Ok(Flow::Recur(vals))
        }

        NodeKind::Fn(proto) => Ok(Flow::Val(make_closure(
            ctx,
            proto,
            frame,
            Backend::TreeWalk,
        ))),

        NodeKind::Call {
            callee,
            args,
            arg_spans,
        } => {
            let f = match eval(ctx, callee, frame)? {
                Flow::Val(v) => v,
                recur => return Ok(recur),
            };
            let mut vals = Vec::with_capacity(args.len());
            for a in args {
                match eval(ctx, a, frame)? {
                    Flow::Val(v) => vals.push(v),
                    recur => return Ok(recur),
                }
            }
            match dispatch::call_fn_val(ctx.heap, f, &vals) {
                Ok(v) => Ok(Flow::Val(v)),
                Err(e) => {
                    // Anchor at the failing operand when the callee told us
                    // which argument it was, else at the call itself
                    let anchored = match e.arg_index.and_then(|i| arg_spans.get(i)) {
                        Some((line, col)) => e.at(*line, *col),
                        None => e.at(node.line, node.col),
                    };
                    Err(anchored)
                }
            }
        }

        NodeKind::Def { var, init } => {
            if let Some(init) = init {
                match eval(ctx, init, frame)? {
                    Flow::Val(v) => var.set_root(v),
                    recur => return Ok(recur),
                }
            }
            Ok(Flow::Val(ctx.heap.var_value(var.clone())))
        }

        NodeKind::SetBang { var, expr } => {
            let v = match eval(ctx, expr, frame)? {
                Flow::Val(v) => v,
                recur => return Ok(recur),
            };
            var::set_thread_binding(var, v).map_err(|e| e.at(node.line, node.col))?;
            Ok(Flow::Val(v))
        }

        NodeKind::Binding { pairs, body } => {
            let mut entries = Vec::with_capacity(pairs.len());
            for (v, init) in pairs {
                match eval(ctx, init, frame)? {
                    Flow::Val(value) => entries.push((v.clone(), value)),
                    recur => return Ok(recur),
                }
            }
            let depth = var::frame_depth();
            var::push_bindings(var::BindingFrame::new(entries));
            let result = eval_body(ctx, body, frame);
            var::truncate_frames(depth);
            result
        }

        NodeKind::Try {
            body,
            catch,
            finally,
        } => {
            let depth = var::frame_depth();
            let mut outcome = match eval_body(ctx, body, frame) {
                Err(e) => {
                    var::truncate_frames(depth);
                    match catch {
                        Some(c) => {
                            let thrown = error_to_value(ctx.heap, &e);
                            clove_runtime::error::set_last_exception(thrown);
                            frame[c.slot] = thrown;
                            eval_body(ctx, &c.body, frame)
                        }
                        None => Err(e),
                    }
                }
                ok => ok,
            };
            if let Some(f) = finally {
                let fin = eval_body(ctx, f, frame);
                if fin.is_err() {
                    outcome = fin;
                }
            }
            outcome
        }

        NodeKind::Throw(expr) => {
            let v = match eval(ctx, expr, frame)? {
                Flow::Val(v) => v,
                recur => return Ok(recur),
            };
            clove_runtime::error::set_last_exception(v);
            Err(Error::user(v, clove_runtime::print::pr_str(v)).at(node.line, node.col))
        }

        NodeKind::InNs { name } => {
            eval_env(|env| match env {
                Some(env) => {
                    let ns = env.in_ns(name);
                    crate::builtins::refer_core(env, &ns);
                    Ok(Flow::Val(Value::nil()))
                }
                None => Err(Error::internal("ns change outside of a pipeline")
                    .at(node.line, node.col)),
            })
        }

        NodeKind::MakeVector(items) => {
            let mut vals = Vec::with_capacity(items.len());
            for item in items {
                match eval(ctx, item, frame)? {
                    Flow::Val(v) => vals.push(v),
                    recur => return Ok(recur),
                }
            }
            Ok(Flow::Val(ctx.heap.vector_from(vals)))
        }

        NodeKind::MakeMap(pairs) => {
            let mut entries = Vec::with_capacity(pairs.len());
            for (k, v) in pairs {
                let key = match eval(ctx, k, frame)? {
                    Flow::Val(v) => v,
                    recur => return Ok(recur),
                };
                let val = match eval(ctx, v, frame)? {
                    Flow::Val(v) => v,
                    recur => return Ok(recur),
                };
                entries.push((key, val));
            }
            Ok(Flow::Val(clove_runtime::collections::map_from_pairs(
                ctx.heap, entries,
            )))
        }

        NodeKind::MakeSet(items) => {
            let mut vals = Vec::with_capacity(items.len());
            for item in items {
                match eval(ctx, item, frame)? {
                    Flow::Val(v) => vals.push(v),
                    recur => return Ok(recur),
                }
            }
            Ok(Flow::Val(clove_runtime::collections::set_from_items(
                ctx.heap, vals,
            )))
        }
    }
}

fn make_closure(ctx: &Ctx<'_>, proto: &Arc<FnProto>, frame: &[Value], backend: Backend) -> Value {
    let env: Vec<Value> = proto
        .captures
        .iter()
        .map(|src| match src {
            CaptureSource::Slot(s) => frame[*s],
            CaptureSource::Capture(c) => ctx.captures[*c],
            CaptureSource::SelfRef => ctx.self_val,
        })
        .collect();
    ctx.heap.fn_value(FnData {
        name: proto.name.clone(),
        backend,
        proto: proto.clone() as Arc<dyn std::any::Any + Send + Sync>,
        env: env.into(),
    })
}
