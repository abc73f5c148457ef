//! Bytecode chunks and the compiler lowering AST nodes to them
//!
//! A chunk is a flat op vector with side tables: constants, vars,
//! function prototypes, binding specs, call sites (argument source spans
//! for error attribution), and a per-op span map. Function arities compile
//! lazily on first VM invocation and cache the chunk on the arity.

use std::sync::Arc;

use clove_runtime::error::{Error, Result};
use clove_runtime::value::Value;
use clove_runtime::var::Var;

use crate::ast::{FnArity, FnProto, Node, NodeKind};

/// Sentinel slot for try handlers that rethrow instead of binding.
pub const NO_CATCH_SLOT: u16 = u16::MAX;

#[derive(Debug, Clone, Copy)]
pub enum Op {
    /// Push consts[i].
    Const(u16),
    Nil,
    LoadLocal(u16),
    StoreLocal(u16),
    LoadCapture(u16),
    LoadSelf,
    /// Push vars[i] dereferenced.
    LoadVar(u16),
    /// Push the var object itself.
    VarObj(u16),
    /// Pop the initial value (when present) into vars[i]'s root, push the
    /// var object.
    DefVar { var: u16, has_init: bool },
    /// Pop a value, set the innermost thread binding of vars[i], push it
    /// back.
    SetVarBang(u16),
    /// Pop bind_specs[i].len() values (last on top) and push a binding
    /// frame mapping the spec'd vars to them.
    BindFrame(u16),
    UnbindFrame,
    /// Push a closure over protos[i], capturing from the current frame.
    MakeClosure(u16),
    /// Pop argc args and the callee below them; push the result.
    Call { argc: u8, site: u16 },
    Jump(i32),
    JumpIfFalse(i32),
    Pop,
    /// Switch namespace to ns_names[i] via the eval-env hook.
    InNs(u16),
    /// Arm a handler: on error, unwind to this op's recorded shape and
    /// jump to `handler`.
    TryPush { handler: u32, slot: u16 },
    TryPop,
    /// Pop a value and raise it as a user exception.
    Throw,
    /// Re-raise the error captured by the innermost finally handler.
    Rethrow,
    /// Pop n values and push a vector/map/set.
    MakeVector(u16),
    MakeMap(u16),
    MakeSet(u16),
    Ret,
}

pub struct Chunk {
    pub code: Vec<Op>,
    pub consts: Vec<Value>,
    pub vars: Vec<Arc<Var>>,
    pub protos: Vec<Arc<FnProto>>,
    pub bind_specs: Vec<Vec<u16>>,
    pub call_sites: Vec<Vec<(u32, u32)>>,
    /// Namespace names referenced by InNs ops.
    pub ns_names: Vec<String>,
    /// Source anchor per op, parallel to `code`.
    pub spans: Vec<(u32, u32)>,
    /// Frame slots needed to execute this chunk.
    pub n_slots: usize,
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("ops", &self.code.len())
            .field("consts", &self.consts.len())
            .field("protos", &self.protos.len())
            .field("n_slots", &self.n_slots)
            .finish()
    }
}

struct LoopCtx {
    start: usize,
    slots: Vec<u16>,
}

struct Compiler {
    code: Vec<Op>,
    consts: Vec<Value>,
    vars: Vec<Arc<Var>>,
    protos: Vec<Arc<FnProto>>,
    bind_specs: Vec<Vec<u16>>,
    call_sites: Vec<Vec<(u32, u32)>>,
    ns_names: Vec<String>,
    spans: Vec<(u32, u32)>,
    loops: Vec<LoopCtx>,
}

/// Compile a top-level node into a chunk executing against `n_slots`
/// root-frame slots.
pub fn compile_top(node: &Node, n_slots: usize) -> Result<Arc<Chunk>> {
    let mut c = Compiler::new();
    c.compile(node)?;
    c.emit(Op::Ret, (node.line, node.col));
    Ok(Arc::new(c.finish(n_slots)))
}

/// Compile one function arity; the implicit recur target is the parameter
/// slots at pc 0.
pub fn compile_arity(arity: &FnArity) -> Result<Arc<Chunk>> {
    let mut c = Compiler::new();
    let bound = arity.bound_params();
    c.loops.push(LoopCtx {
        start: 0,
        slots: (0..bound as u16).collect(),
    });
    let span = arity
        .body
        .first()
        .map(|n| (n.line, n.col))
        .unwrap_or((0, 0));
    c.compile_body(&arity.body, span)?;
    c.loops.pop();
    c.emit(Op::Ret, span);
    Ok(Arc::new(c.finish(arity.slots)))
}

/// Fetch or lazily compile the chunk for an arity.
pub fn arity_chunk(arity: &FnArity) -> Result<Arc<Chunk>> {
    if let Some(chunk) = arity.chunk.get() {
        return Ok(chunk.clone());
    }
    let chunk = compile_arity(arity)?;
    // A concurrent compile of the same arity produced an identical chunk;
    // first set wins either way.
    let _ = arity.chunk.set(chunk);
    Ok(arity.chunk.get().expect("arity chunk just set").clone())
}

impl Compiler {
    fn new() -> Compiler {
        Compiler {
            code: Vec::new(),
            consts: Vec::new(),
            vars: Vec::new(),
            protos: Vec::new(),
            bind_specs: Vec::new(),
            call_sites: Vec::new(),
            ns_names: Vec::new(),
            spans: Vec::new(),
            loops: Vec::new(),
        }
    }

    fn finish(self, n_slots: usize) -> Chunk {
        Chunk {
            code: self.code,
            consts: self.consts,
            vars: self.vars,
            protos: self.protos,
            bind_specs: self.bind_specs,
            call_sites: self.call_sites,
            ns_names: self.ns_names,
            spans: self.spans,
            n_slots,
        }
    }

    fn emit(&mut self, op: Op, span: (u32, u32)) -> usize {
        self.code.push(op);
        self.spans.push(span);
        self.code.len() - 1
    }

    fn add_const(&mut self, v: Value) -> Result<u16> {
        self.consts.push(v);
        index16(self.consts.len() - 1, "constants")
    }

    fn add_var(&mut self, var: &Arc<Var>) -> Result<u16> {
        if let Some(i) = self.vars.iter().position(|v| Arc::ptr_eq(v, var)) {
            return index16(i, "vars");
        }
        self.vars.push(var.clone());
        index16(self.vars.len() - 1, "vars")
    }

    fn patch_jump(&mut self, at: usize) {
        let target = self.code.len() as i32 - at as i32;
        match &mut self.code[at] {
            Op::Jump(offset) | Op::JumpIfFalse(offset) => *offset = target,
            other => unreachable!("patching non-jump op {other:?}"),
        }
    }

    fn compile_body(&mut self, body: &[Node], span: (u32, u32)) -> Result<()> {
        if body.is_empty() {
            self.emit(Op::Nil, span);
            return Ok(());
        }
        for (i, node) in body.iter().enumerate() {
            self.compile(node)?;
            if i + 1 < body.len() {
                self.emit(Op::Pop, (node.line, node.col));
            }
        }
        Ok(())
    }

    fn compile(&mut self, node: &Node) -> Result<()> {
        let span = (node.line, node.col);
        match &node.kind {
            NodeKind::Const(v) => {
                if v.is_nil() {
                    self.emit(Op::Nil, span);
                } else {
                    let idx = self.add_const(*v)?;
                    self.emit(Op::Const(idx), span);
                }
            }
            NodeKind::LocalRef { slot, .. } => {
                self.emit(Op::LoadLocal(index16(*slot, "locals")?), span);
            }
            NodeKind::CaptureRef { idx, .. } => {
                self.emit(Op::LoadCapture(index16(*idx, "captures")?), span);
            }
            NodeKind::SelfRef => {
                self.emit(Op::LoadSelf, span);
            }
            NodeKind::VarRef(var) => {
                let idx = self.add_var(var)?;
                self.emit(Op::LoadVar(idx), span);
            }
            NodeKind::TheVar(var) => {
                let idx = self.add_var(var)?;
                self.emit(Op::VarObj(idx), span);
            }

            NodeKind::If { test, then, els } => {
                self.compile(test)?;
                let to_else = self.emit(Op::JumpIfFalse(0), span);
                self.compile(then)?;
                let to_end = self.emit(Op::Jump(0), span);
                self.patch_jump(to_else);
                match els {
                    Some(e) => self.compile(e)?,
                    None => {
                        self.emit(Op::Nil, span);
                    }
                }
                self.patch_jump(to_end);
            }

            NodeKind::Do(body) => self.compile_body(body, span)?,

            NodeKind::Let {
                bindings,
                body,
                is_loop,
            } => {
                for (slot, init) in bindings {
                    self.compile(init)?;
                    self.emit(Op::StoreLocal(index16(*slot, "locals")?), span);
                }
                if *is_loop {
                    let slots = bindings
                        .iter()
                        .map(|(slot, _)| index16(*slot, "locals"))
                        .collect::<Result<Vec<_>>>()?;
                    self.loops.push(LoopCtx {
                        start: self.code.len(),
                        slots,
                    });
                    self.compile_body(body, span)?;
                    self.loops.pop();
                } else {
                    self.compile_body(body, span)?;
                }
            }

            NodeKind::Recur(args) => {
                for a in args {
                    self.compile(a)?;
                }
                let ctx = self
                    .loops
                    .last()
                    .ok_or_else(|| {
                        Error::value_error("recur outside of loop or fn").at(node.line, node.col)
                    })?;
                let slots = ctx.slots.clone();
                let start = ctx.start;
                for slot in slots.iter().rev() {
                    self.emit(Op::StoreLocal(*slot), span);
                }
                let at = self.emit(Op::Jump(0), span);
                let offset = start as i32 - at as i32;
                if let Op::Jump(o) = &mut self.code[at] {
                    *o = offset;
                }
            }

            NodeKind::Fn(proto) => {
                self.protos.push(proto.clone());
                let idx = index16(self.protos.len() - 1, "prototypes")?;
                self.emit(Op::MakeClosure(idx), span);
            }

            NodeKind::Call {
                callee,
                args,
                arg_spans,
            } => {
                self.compile(callee)?;
                for a in args {
                    self.compile(a)?;
                }
                self.call_sites.push(arg_spans.clone());
                let site = index16(self.call_sites.len() - 1, "call sites")?;
                let argc = u8::try_from(args.len())
                    .map_err(|_| Error::value_error("too many call arguments"))?;
                self.emit(Op::Call { argc, site }, span);
            }

            NodeKind::Def { var, init } => {
                let has_init = init.is_some();
                if let Some(init) = init {
                    self.compile(init)?;
                }
                let idx = self.add_var(var)?;
                self.emit(Op::DefVar { var: idx, has_init }, span);
            }

            NodeKind::SetBang { var, expr } => {
                self.compile(expr)?;
                let idx = self.add_var(var)?;
                self.emit(Op::SetVarBang(idx), span);
            }

            NodeKind::Binding { pairs, body } => {
                let mut spec = Vec::with_capacity(pairs.len());
                for (var, init) in pairs {
                    self.compile(init)?;
                    spec.push(self.add_var(var)?);
                }
                self.bind_specs.push(spec);
                let idx = index16(self.bind_specs.len() - 1, "binding specs")?;
                self.emit(Op::BindFrame(idx), span);
                self.compile_body(body, span)?;
                self.emit(Op::UnbindFrame, span);
            }

            NodeKind::Try {
                body,
                catch,
                finally,
            } => {
                let slot = match catch {
                    Some(c) => index16(c.slot, "locals")?,
                    None => NO_CATCH_SLOT,
                };
                let try_push = self.emit(Op::TryPush { handler: 0, slot }, span);
                self.compile_body(body, span)?;
                self.emit(Op::TryPop, span);
                if let Some(f) = finally {
                    self.compile_body(f, span)?;
                    self.emit(Op::Pop, span);
                }
                let to_end = self.emit(Op::Jump(0), span);

                let handler_pc = self.code.len() as u32;
                if let Op::TryPush { handler, .. } = &mut self.code[try_push] {
                    *handler = handler_pc;
                }
                match catch {
                    Some(c) => {
                        self.compile_body(&c.body, span)?;
                        if let Some(f) = finally {
                            self.compile_body(f, span)?;
                            self.emit(Op::Pop, span);
                        }
                    }
                    None => {
                        // finally-only: run the cleanup, then rethrow
                        if let Some(f) = finally {
                            self.compile_body(f, span)?;
                            self.emit(Op::Pop, span);
                        }
                        self.emit(Op::Rethrow, span);
                    }
                }
                self.patch_jump(to_end);
            }

            NodeKind::Throw(expr) => {
                self.compile(expr)?;
                self.emit(Op::Throw, span);
            }

            NodeKind::InNs { name } => {
                self.ns_names.push(name.clone());
                let idx = index16(self.ns_names.len() - 1, "namespace names")?;
                self.emit(Op::InNs(idx), span);
            }

            NodeKind::MakeVector(items) => {
                for item in items {
                    self.compile(item)?;
                }
                self.emit(Op::MakeVector(index16(items.len(), "elements")?), span);
            }
            NodeKind::MakeMap(pairs) => {
                for (k, v) in pairs {
                    self.compile(k)?;
                    self.compile(v)?;
                }
                self.emit(Op::MakeMap(index16(pairs.len(), "entries")?), span);
            }
            NodeKind::MakeSet(items) => {
                for item in items {
                    self.compile(item)?;
                }
                self.emit(Op::MakeSet(index16(items.len(), "elements")?), span);
            }
        }
        Ok(())
    }
}

fn index16(i: usize, what: &str) -> Result<u16> {
    u16::try_from(i).map_err(|_| Error::value_error(format!("chunk {what} table overflow")))
}

/// Render a chunk listing for the `dump` CLI command.
#[allow(clippy::format_in_format_args)]
pub fn dump(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    use std::fmt::Write;
    let _ = writeln!(
        out,
        "== {} ==  ({} ops, {} consts, {} vars, {} protos, {} slots)",
        name,
        chunk.code.len(),
        chunk.consts.len(),
        chunk.vars.len(),
        chunk.protos.len(),
        chunk.n_slots
    );
    for (pc, op) in chunk.code.iter().enumerate() {
        let detail = match op {
            Op::Const(i) => format!(
                "{:<14} ; {}",
                format!("const[{i}]"),
                clove_runtime::print::pr_str(chunk.consts[*i as usize])
            ),
            Op::LoadVar(i) | Op::VarObj(i) => format!(
                "{:<14} ; #'{}",
                format!("{op:?}"),
                chunk.vars[*i as usize].qualified_name()
            ),
            Op::DefVar { var, .. } => format!(
                "{:<14} ; #'{}",
                format!("{op:?}"),
                chunk.vars[*var as usize].qualified_name()
            ),
            Op::MakeClosure(i) => {
                let proto = &chunk.protos[*i as usize];
                format!(
                    "{:<14} ; {} ({} arities, {} captures)",
                    format!("closure[{i}]"),
                    proto.name.as_deref().unwrap_or("fn"),
                    proto.arities.len(),
                    proto.captures.len()
                )
            }
            other => format!("{other:?}"),
        };
        let (line, col) = chunk.spans[pc];
        let _ = writeln!(out, "{pc:04}  {detail:<40} @{}:{}", line + 1, col);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze_top;
    use crate::builtins::bootstrap;
    use crate::reader::Reader;

    fn compile_src(src: &str) -> Arc<Chunk> {
        let env = bootstrap();
        let mut reader = Reader::new(&env.heap, src).unwrap();
        let form = reader.next_form().unwrap().unwrap();
        let (node, n_slots) =
            clove_runtime::ns::with_eval_env(&env, || analyze_top(&env, &form)).unwrap();
        compile_top(&node, n_slots).unwrap()
    }

    #[test]
    fn test_if_compiles_to_conditional_jumps() {
        let chunk = compile_src("(if true 1 2)");
        assert!(chunk.code.iter().any(|op| matches!(op, Op::JumpIfFalse(_))));
        assert!(chunk.code.iter().any(|op| matches!(op, Op::Jump(_))));
        assert!(matches!(chunk.code.last(), Some(Op::Ret)));
    }

    #[test]
    fn test_loop_recur_jumps_backward() {
        let chunk = compile_src("(loop [i 0] (if (< i 3) (recur (inc i)) i))");
        let back_jump = chunk
            .code
            .iter()
            .any(|op| matches!(op, Op::Jump(offset) if *offset < 0));
        assert!(back_jump, "recur should jump backward");
    }

    #[test]
    fn test_call_records_arg_spans() {
        let chunk = compile_src("(+ 1 2)");
        let call = chunk
            .code
            .iter()
            .find_map(|op| match op {
                Op::Call { argc, site } => Some((*argc, *site)),
                _ => None,
            })
            .expect("call op emitted");
        assert_eq!(call.0, 2);
        assert_eq!(chunk.call_sites[call.1 as usize].len(), 2);
    }

    #[test]
    fn test_vars_deduplicated() {
        let chunk = compile_src("(+ (+ 1 2) (+ 3 4))");
        // One var table entry for + no matter how many references
        assert_eq!(chunk.vars.len(), 1);
    }

    #[test]
    fn test_dump_renders_listing() {
        let chunk = compile_src("(def x 42)");
        let listing = dump(&chunk, "test");
        assert!(listing.contains("== test =="));
        assert!(listing.contains("42"));
        assert!(listing.contains("#'user/x"));
    }

    #[test]
    fn test_arity_chunk_cached() {
        let env = bootstrap();
        let mut reader = Reader::new(&env.heap, "(fn [x] (+ x 1))").unwrap();
        let form = reader.next_form().unwrap().unwrap();
        let (node, _) =
            clove_runtime::ns::with_eval_env(&env, || analyze_top(&env, &form)).unwrap();
        let crate::ast::NodeKind::Fn(proto) = &node.kind else {
            panic!("expected fn node");
        };
        let first = arity_chunk(&proto.arities[0]).unwrap();
        let second = arity_chunk(&proto.arities[0]).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
