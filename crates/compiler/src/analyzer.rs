//! Analyzer: forms -> AST nodes
//!
//! Resolves symbols to frame slots, closure captures, or vars; recognizes
//! special forms; expands macros during analysis by invoking the macro's
//! function through dispatch (the pipeline installs the eval-env hook
//! around us so macro bodies see the right environment).
//!
//! Slot assignment happens here: each function arity gets a fresh frame
//! layout (parameters first, rest-seq slot for variadics, then let-locals),
//! and free names resolve to capture entries recorded on the prototype so
//! both back-ends materialize identical closures.

use std::sync::{Arc, OnceLock};

use clove_runtime::dispatch;
use clove_runtime::error::{Error, Phase, Result};
use clove_runtime::ns::Env;
use clove_runtime::value::{Value, ValueKind};
use clove_runtime::var::Var;

use crate::ast::{Catch, CaptureSource, FnArity, FnProto, Node, NodeKind};
use crate::reader::Form;

fn analyze_error(msg: impl Into<String>, form: &Form) -> Error {
    Error::value_error(msg)
        .with_phase(Phase::Analyze)
        .at(form.line, form.col)
}

enum Resolution {
    Slot(usize),
    Capture(usize),
    SelfRef,
}

struct FnScope {
    locals: Vec<(String, usize)>,
    captures: Vec<CaptureSource>,
    self_name: Option<String>,
    n_slots: usize,
    /// Argument counts of active recur targets, innermost last.
    recur_targets: Vec<usize>,
}

impl FnScope {
    fn new() -> FnScope {
        FnScope {
            locals: Vec::new(),
            captures: Vec::new(),
            self_name: None,
            n_slots: 0,
            recur_targets: Vec::new(),
        }
    }

    fn alloc_slot(&mut self) -> usize {
        let slot = self.n_slots;
        self.n_slots += 1;
        slot
    }
}

pub struct Analyzer<'e> {
    env: &'e Env,
    scopes: Vec<FnScope>,
}

/// Analyze one top-level form. Returns the node and the number of slots
/// top-level evaluation needs for its root frame.
pub fn analyze_top(env: &Env, form: &Form) -> Result<(Node, usize)> {
    let mut analyzer = Analyzer {
        env,
        scopes: vec![FnScope::new()],
    };
    let node = analyzer.analyze(form)?;
    Ok((node, analyzer.scopes[0].n_slots))
}

impl<'e> Analyzer<'e> {
    fn scope(&mut self) -> &mut FnScope {
        self.scopes.last_mut().expect("analyzer scope underflow")
    }

    fn analyze(&mut self, form: &Form) -> Result<Node> {
        let v = form.value;
        match v.kind() {
            ValueKind::Symbol => self.analyze_symbol(form),
            ValueKind::List => {
                if form.children.is_empty() {
                    // The empty list evaluates to itself
                    return Ok(Node::new(NodeKind::Const(v), form.line, form.col));
                }
                self.analyze_list(form)
            }
            ValueKind::Vector => {
                let nodes = form
                    .children
                    .iter()
                    .map(|c| self.analyze(c))
                    .collect::<Result<Vec<_>>>()?;
                if nodes.iter().all(|n| matches!(n.kind, NodeKind::Const(_))) {
                    Ok(Node::new(NodeKind::Const(v), form.line, form.col))
                } else {
                    Ok(Node::new(NodeKind::MakeVector(nodes), form.line, form.col))
                }
            }
            ValueKind::ArrayMap | ValueKind::HashMap => {
                let nodes = form
                    .children
                    .iter()
                    .map(|c| self.analyze(c))
                    .collect::<Result<Vec<_>>>()?;
                if nodes.iter().all(|n| matches!(n.kind, NodeKind::Const(_))) {
                    Ok(Node::new(NodeKind::Const(v), form.line, form.col))
                } else {
                    let mut pairs = Vec::with_capacity(nodes.len() / 2);
                    let mut iter = nodes.into_iter();
                    while let (Some(k), Some(val)) = (iter.next(), iter.next()) {
                        pairs.push((k, val));
                    }
                    Ok(Node::new(NodeKind::MakeMap(pairs), form.line, form.col))
                }
            }
            ValueKind::HashSet => {
                let nodes = form
                    .children
                    .iter()
                    .map(|c| self.analyze(c))
                    .collect::<Result<Vec<_>>>()?;
                if nodes.iter().all(|n| matches!(n.kind, NodeKind::Const(_))) {
                    Ok(Node::new(NodeKind::Const(v), form.line, form.col))
                } else {
                    Ok(Node::new(NodeKind::MakeSet(nodes), form.line, form.col))
                }
            }
            // Everything else is self-evaluating
            _ => Ok(Node::new(NodeKind::Const(v), form.line, form.col)),
        }
    }

    fn analyze_symbol(&mut self, form: &Form) -> Result<Node> {
        let sym = form.value.as_symbol();
        if sym.ns.is_none() {
            if let Some(resolution) = self.resolve_local(&sym.name) {
                return Ok(Node::new(
                    match resolution {
                        Resolution::Slot(slot) => NodeKind::LocalRef {
                            slot,
                            name: sym.name.clone(),
                        },
                        Resolution::Capture(idx) => NodeKind::CaptureRef {
                            idx,
                            name: sym.name.clone(),
                        },
                        Resolution::SelfRef => NodeKind::SelfRef,
                    },
                    form.line,
                    form.col,
                ));
            }
        }
        match self.env.resolve(sym.ns.as_deref(), &sym.name) {
            Some(var) => Ok(Node::new(NodeKind::VarRef(var), form.line, form.col)),
            None => Err(analyze_error(
                format!("Unable to resolve symbol: {}", sym.qualified()),
                form,
            )),
        }
    }

    fn resolve_local(&mut self, name: &str) -> Option<Resolution> {
        self.resolve_in(self.scopes.len() - 1, name)
    }

    fn resolve_in(&mut self, idx: usize, name: &str) -> Option<Resolution> {
        {
            let scope = &self.scopes[idx];
            if let Some((_, slot)) = scope.locals.iter().rev().find(|(n, _)| n == name) {
                return Some(Resolution::Slot(*slot));
            }
            if scope.self_name.as_deref() == Some(name) {
                return Some(Resolution::SelfRef);
            }
        }
        if idx == 0 {
            return None;
        }
        let outer = self.resolve_in(idx - 1, name)?;
        let source = match outer {
            Resolution::Slot(slot) => CaptureSource::Slot(slot),
            Resolution::Capture(c) => CaptureSource::Capture(c),
            Resolution::SelfRef => CaptureSource::SelfRef,
        };
        let scope = &mut self.scopes[idx];
        let cap_idx = scope
            .captures
            .iter()
            .position(|c| *c == source)
            .unwrap_or_else(|| {
                scope.captures.push(source);
                scope.captures.len() - 1
            });
        Some(Resolution::Capture(cap_idx))
    }

    fn analyze_list(&mut self, form: &Form) -> Result<Node> {
        let head = &form.children[0];
        if head.value.kind() == ValueKind::Symbol {
            let sym = head.value.as_symbol();
            if sym.ns.is_none() {
                match sym.name.as_str() {
                    "quote" => return self.analyze_quote(form),
                    "if" => return self.analyze_if(form),
                    "do" => return self.analyze_do(form),
                    "let" | "let*" => return self.analyze_let(form, false),
                    "loop" | "loop*" => return self.analyze_let(form, true),
                    "recur" => return self.analyze_recur(form),
                    "fn" | "fn*" => return self.analyze_fn(form),
                    "def" => return self.analyze_def(form, false),
                    "defn" => return self.analyze_defn(form, false),
                    "defmacro" => return self.analyze_defn(form, true),
                    "letfn" => return self.analyze_letfn(form),
                    "var" => return self.analyze_var_form(form),
                    "set!" => return self.analyze_set_bang(form),
                    "binding" => return self.analyze_binding(form),
                    "try" => return self.analyze_try(form),
                    "throw" => return self.analyze_throw(form),
                    "ns" => return self.analyze_ns(form),
                    "and" => return self.analyze_and_or(form, true),
                    "or" => return self.analyze_and_or(form, false),
                    // Body-wrapping sugar: lower to a nullary fn handed to
                    // the corresponding runtime constructor
                    "lazy-seq" => return self.analyze_thunk_sugar(form, "lazy-seq*"),
                    "delay" => return self.analyze_thunk_sugar(form, "delay*"),
                    "future" => return self.analyze_thunk_sugar(form, "future-call"),
                    _ => {}
                }
                // Macro call?
                if self.resolve_local(&sym.name).is_none() {
                    if let Some(var) = self.env.resolve(None, &sym.name) {
                        if var.is_macro() {
                            return self.expand_macro(form, &var);
                        }
                    }
                }
            } else if let Some(var) = self.env.resolve(sym.ns.as_deref(), &sym.name) {
                if var.is_macro() {
                    return self.expand_macro(form, &var);
                }
            }
        }

        // Ordinary call
        let callee = Box::new(self.analyze(head)?);
        let mut args = Vec::with_capacity(form.children.len() - 1);
        let mut arg_spans = Vec::with_capacity(form.children.len() - 1);
        for child in &form.children[1..] {
            args.push(self.analyze(child)?);
            arg_spans.push((child.line, child.col));
        }
        Ok(Node::new(
            NodeKind::Call {
                callee,
                args,
                arg_spans,
            },
            form.line,
            form.col,
        ))
    }

    fn expand_macro(&mut self, form: &Form, var: &Arc<Var>) -> Result<Node> {
        let macro_fn = var.deref();
        let arg_values: Vec<Value> = form.children[1..].iter().map(|c| c.value).collect();
        let expanded = dispatch::call_fn_val(&self.env.heap, macro_fn, &arg_values)
            .map_err(|e| e.with_phase(Phase::Analyze).at(form.line, form.col))?;
        let expanded_form = Form::from_value(expanded, form.line, form.col);
        self.analyze(&expanded_form)
    }

    fn analyze_quote(&mut self, form: &Form) -> Result<Node> {
        if form.children.len() != 2 {
            return Err(analyze_error("quote expects exactly one form", form));
        }
        Ok(Node::new(
            NodeKind::Const(form.children[1].value),
            form.line,
            form.col,
        ))
    }

    fn analyze_if(&mut self, form: &Form) -> Result<Node> {
        if form.children.len() < 3 || form.children.len() > 4 {
            return Err(analyze_error("if expects a test, a then, and an optional else", form));
        }
        let test = Box::new(self.analyze(&form.children[1])?);
        let then = Box::new(self.analyze(&form.children[2])?);
        let els = match form.children.get(3) {
            Some(e) => Some(Box::new(self.analyze(e)?)),
            None => None,
        };
        Ok(Node::new(NodeKind::If { test, then, els }, form.line, form.col))
    }

    fn analyze_do(&mut self, form: &Form) -> Result<Node> {
        let body = form.children[1..]
            .iter()
            .map(|c| self.analyze(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Node::new(NodeKind::Do(body), form.line, form.col))
    }

    fn analyze_let(&mut self, form: &Form, is_loop: bool) -> Result<Node> {
        let Some(binding_form) = form.children.get(1) else {
            return Err(analyze_error("let expects a binding vector", form));
        };
        if binding_form.value.kind() != ValueKind::Vector
            || binding_form.children.len() % 2 != 0
        {
            return Err(analyze_error(
                "let binding vector needs an even number of forms",
                binding_form,
            ));
        }

        let locals_before = self.scope().locals.len();
        let mut bindings = Vec::new();
        for pair in binding_form.children.chunks(2) {
            let name_form = &pair[0];
            if name_form.value.kind() != ValueKind::Symbol {
                return Err(analyze_error("let binding name must be a symbol", name_form));
            }
            let init = self.analyze(&pair[1])?;
            let name = name_form.value.as_symbol().name.clone();
            let slot = self.scope().alloc_slot();
            self.scope().locals.push((name, slot));
            bindings.push((slot, init));
        }

        if is_loop {
            let argc = bindings.len();
            self.scope().recur_targets.push(argc);
        }
        let body = form.children[2..]
            .iter()
            .map(|c| self.analyze(c))
            .collect::<Result<Vec<_>>>()?;
        if is_loop {
            self.scope().recur_targets.pop();
        }
        self.scope().locals.truncate(locals_before);

        Ok(Node::new(
            NodeKind::Let {
                bindings,
                body,
                is_loop,
            },
            form.line,
            form.col,
        ))
    }

    fn analyze_recur(&mut self, form: &Form) -> Result<Node> {
        let argc = form.children.len() - 1;
        match self.scope().recur_targets.last() {
            None => Err(analyze_error("recur outside of loop or fn", form)),
            Some(&expected) if expected != argc => Err(analyze_error(
                format!("recur expects {expected} arguments, got {argc}"),
                form,
            )),
            Some(_) => {
                let args = form.children[1..]
                    .iter()
                    .map(|c| self.analyze(c))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Node::new(NodeKind::Recur(args), form.line, form.col))
            }
        }
    }

    fn analyze_fn(&mut self, form: &Form) -> Result<Node> {
        let mut idx = 1;
        let mut name = None;
        if let Some(child) = form.children.get(idx) {
            if child.value.kind() == ValueKind::Symbol {
                name = Some(child.value.as_symbol().name.clone());
                idx += 1;
            }
        }
        let rest = &form.children[idx..];
        if rest.is_empty() {
            return Err(analyze_error("fn expects a parameter vector", form));
        }

        // Single-arity (fn [params] body...) or multi-arity (fn ([p] b)...)
        let arity_forms: Vec<(&Form, &[Form])> = if rest[0].value.kind() == ValueKind::Vector {
            vec![(&rest[0], &rest[1..])]
        } else {
            rest.iter()
                .map(|clause| {
                    if clause.value.kind() != ValueKind::List || clause.children.is_empty() {
                        return Err(analyze_error("fn arity clause must be a list", clause));
                    }
                    Ok((&clause.children[0], &clause.children[1..]))
                })
                .collect::<Result<Vec<_>>>()?
        };

        self.scopes.push(FnScope::new());
        self.scope().self_name = name.clone();

        let mut arities = Vec::new();
        let result = (|| {
            for (params_form, body_forms) in &arity_forms {
                if params_form.value.kind() != ValueKind::Vector {
                    return Err(analyze_error("fn parameters must be a vector", params_form));
                }
                // Fresh frame layout per arity; captures accumulate on the proto
                {
                    let scope = self.scope();
                    scope.locals.clear();
                    scope.n_slots = 0;
                }
                let mut params = 0usize;
                let mut variadic = false;
                for p in &params_form.children {
                    if p.value.kind() != ValueKind::Symbol {
                        return Err(analyze_error("fn parameter must be a symbol", p));
                    }
                    let pname = p.value.as_symbol().name.clone();
                    if pname == "&" {
                        variadic = true;
                        continue;
                    }
                    let slot = self.scope().alloc_slot();
                    self.scope().locals.push((pname, slot));
                    if !variadic {
                        params += 1;
                    }
                }
                self.scope().recur_targets.push(params + usize::from(variadic));
                let body = body_forms
                    .iter()
                    .map(|c| self.analyze(c))
                    .collect::<Result<Vec<_>>>()?;
                self.scope().recur_targets.pop();
                arities.push(FnArity {
                    params,
                    variadic,
                    slots: self.scope().n_slots,
                    body,
                    chunk: OnceLock::new(),
                });
            }
            Ok(())
        })();
        let captures = self.scopes.pop().expect("fn scope underflow").captures;
        result?;

        let proto = Arc::new(FnProto {
            name,
            captures,
            arities,
        });
        Ok(Node::new(NodeKind::Fn(proto), form.line, form.col))
    }

    fn analyze_def(&mut self, form: &Form, is_macro: bool) -> Result<Node> {
        let Some(name_form) = form.children.get(1) else {
            return Err(analyze_error("def expects a name", form));
        };
        if name_form.value.kind() != ValueKind::Symbol {
            return Err(analyze_error("def name must be a symbol", name_form));
        }
        let sym = name_form.value.as_symbol();
        if sym.ns.is_some() {
            return Err(analyze_error("def name must not be namespace-qualified", name_form));
        }

        let var = self.env.current_ns().intern(&sym.name);
        self.apply_def_meta(&var, name_form, form)?;
        if is_macro {
            var.set_macro(true);
        }

        // (def name), (def name init), (def name "doc" init)
        let init_form = match form.children.len() {
            2 => None,
            3 => Some(&form.children[2]),
            4 => {
                let doc = &form.children[2];
                if doc.value.kind() == ValueKind::String {
                    var.meta.lock().expect("var meta poisoned").doc =
                        Some(doc.value.as_str().to_string());
                } else {
                    return Err(analyze_error("def docstring must be a string", doc));
                }
                Some(&form.children[3])
            }
            _ => return Err(analyze_error("too many forms in def", form)),
        };
        let init = match init_form {
            Some(f) => Some(Box::new(self.analyze(f)?)),
            None => None,
        };
        Ok(Node::new(NodeKind::Def { var, init }, form.line, form.col))
    }

    fn apply_def_meta(&mut self, var: &Arc<Var>, name_form: &Form, form: &Form) -> Result<()> {
        {
            let mut meta = var.meta.lock().expect("var meta poisoned");
            meta.line = Some(form.line);
            meta.col = Some(form.col);
        }
        let Some(meta_map) = name_form.meta else {
            return Ok(());
        };
        let heap = &self.env.heap;
        let flag = |name: &str| {
            clove_runtime::collections::map_get(meta_map, heap.keyword(None, name))
                .map(|v| v.is_truthy())
                .unwrap_or(false)
        };
        if flag("dynamic") {
            var.set_dynamic(true);
        }
        if flag("private") {
            var.set_private(true);
        }
        if flag("const") {
            var.set_const(true);
        }
        if let Some(doc) =
            clove_runtime::collections::map_get(meta_map, heap.keyword(None, "doc"))
        {
            if doc.kind() == ValueKind::String {
                var.meta.lock().expect("var meta poisoned").doc =
                    Some(doc.as_str().to_string());
            }
        }
        var.meta.lock().expect("var meta poisoned").user = Some(meta_map);
        Ok(())
    }

    /// `(defn name doc? [params] body...)` sugar for `(def name (fn ...))`.
    fn analyze_defn(&mut self, form: &Form, is_macro: bool) -> Result<Node> {
        if form.children.len() < 3 {
            return Err(analyze_error("defn expects a name and a body", form));
        }
        let name_form = form.children[1].clone();
        let mut rest: Vec<Form> = form.children[2..].to_vec();

        // Optional docstring before the parameter vector
        let mut doc = None;
        if rest.len() > 1 && rest[0].value.kind() == ValueKind::String {
            doc = Some(rest[0].value.as_str().to_string());
            rest.remove(0);
        }

        let heap = &self.env.heap;
        let fn_sym = heap.symbol(None, "fn");
        let mut fn_items: Vec<Value> = vec![fn_sym, name_form.value];
        let mut fn_children =
            vec![Form::from_value(fn_sym, form.line, form.col), name_form.clone()];
        for f in &rest {
            fn_items.push(f.value);
            fn_children.push(f.clone());
        }
        let fn_form = Form {
            value: heap.list_from(fn_items),
            line: form.line,
            col: form.col,
            children: fn_children,
            meta: None,
        };

        let def_sym = heap.symbol(None, "def");
        let def_form = Form {
            value: heap.list_from(vec![def_sym, name_form.value, fn_form.value]),
            line: form.line,
            col: form.col,
            children: vec![
                Form::from_value(def_sym, form.line, form.col),
                name_form,
                fn_form,
            ],
            meta: None,
        };
        let node = self.analyze_def(&def_form, is_macro)?;
        if let NodeKind::Def { var, .. } = &node.kind {
            if let Some(doc) = doc {
                var.meta.lock().expect("var meta poisoned").doc = Some(doc);
            }
            let arglists = form.children[2..]
                .iter()
                .find(|f| f.value.kind() == ValueKind::Vector)
                .map(|f| clove_runtime::print::pr_str(f.value));
            if let Some(arglists) = arglists {
                var.meta.lock().expect("var meta poisoned").arglists = Some(arglists);
            }
        }
        Ok(node)
    }

    /// `(letfn [(f [x] body)...] body...)`: each fn sees itself by name;
    /// later fns see earlier ones.
    fn analyze_letfn(&mut self, form: &Form) -> Result<Node> {
        let Some(fns_form) = form.children.get(1) else {
            return Err(analyze_error("letfn expects a vector of fn clauses", form));
        };
        if fns_form.value.kind() != ValueKind::Vector {
            return Err(analyze_error("letfn expects a vector of fn clauses", fns_form));
        }

        let locals_before = self.scope().locals.len();
        let mut bindings = Vec::new();
        for clause in &fns_form.children {
            if clause.value.kind() != ValueKind::List || clause.children.len() < 2 {
                return Err(analyze_error(
                    "letfn clause must be (name [params] body...)",
                    clause,
                ));
            }
            let name_form = &clause.children[0];
            if name_form.value.kind() != ValueKind::Symbol {
                return Err(analyze_error("letfn name must be a symbol", name_form));
            }
            let name = name_form.value.as_symbol().name.clone();

            // Build (fn name [params] body...) so the body can self-recur
            let heap = &self.env.heap;
            let fn_sym = heap.symbol(None, "fn");
            let mut items: Vec<Value> = vec![fn_sym];
            let mut children = vec![Form::from_value(fn_sym, clause.line, clause.col)];
            for f in &clause.children {
                items.push(f.value);
                children.push(f.clone());
            }
            let fn_form = Form {
                value: heap.list_from(items),
                line: clause.line,
                col: clause.col,
                children,
                meta: None,
            };
            let init = self.analyze_fn(&fn_form)?;
            let slot = self.scope().alloc_slot();
            self.scope().locals.push((name, slot));
            bindings.push((slot, init));
        }

        let body = form.children[2..]
            .iter()
            .map(|c| self.analyze(c))
            .collect::<Result<Vec<_>>>()?;
        self.scope().locals.truncate(locals_before);

        Ok(Node::new(
            NodeKind::Let {
                bindings,
                body,
                is_loop: false,
            },
            form.line,
            form.col,
        ))
    }

    fn analyze_var_form(&mut self, form: &Form) -> Result<Node> {
        let Some(name_form) = form.children.get(1) else {
            return Err(analyze_error("var expects a symbol", form));
        };
        if name_form.value.kind() != ValueKind::Symbol {
            return Err(analyze_error("var expects a symbol", name_form));
        }
        let sym = name_form.value.as_symbol();
        match self.env.resolve(sym.ns.as_deref(), &sym.name) {
            Some(var) => Ok(Node::new(NodeKind::TheVar(var), form.line, form.col)),
            None => Err(analyze_error(
                format!("Unable to resolve var: {}", sym.qualified()),
                name_form,
            )),
        }
    }

    fn analyze_set_bang(&mut self, form: &Form) -> Result<Node> {
        if form.children.len() != 3 {
            return Err(analyze_error("set! expects a var and a value", form));
        }
        let target = &form.children[1];
        if target.value.kind() != ValueKind::Symbol {
            return Err(analyze_error("set! target must be a symbol", target));
        }
        let sym = target.value.as_symbol();
        let var = self
            .env
            .resolve(sym.ns.as_deref(), &sym.name)
            .ok_or_else(|| {
                analyze_error(format!("Unable to resolve symbol: {}", sym.qualified()), target)
            })?;
        let expr = Box::new(self.analyze(&form.children[2])?);
        Ok(Node::new(NodeKind::SetBang { var, expr }, form.line, form.col))
    }

    fn analyze_binding(&mut self, form: &Form) -> Result<Node> {
        let Some(binding_form) = form.children.get(1) else {
            return Err(analyze_error("binding expects a binding vector", form));
        };
        if binding_form.value.kind() != ValueKind::Vector
            || binding_form.children.len() % 2 != 0
        {
            return Err(analyze_error(
                "binding vector needs an even number of forms",
                binding_form,
            ));
        }
        let mut pairs = Vec::new();
        for pair in binding_form.children.chunks(2) {
            let name_form = &pair[0];
            if name_form.value.kind() != ValueKind::Symbol {
                return Err(analyze_error("binding name must be a symbol", name_form));
            }
            let sym = name_form.value.as_symbol();
            let var = self
                .env
                .resolve(sym.ns.as_deref(), &sym.name)
                .ok_or_else(|| {
                    analyze_error(
                        format!("Unable to resolve symbol: {}", sym.qualified()),
                        name_form,
                    )
                })?;
            if !var.is_dynamic() {
                return Err(analyze_error(
                    format!("Can't dynamically bind non-dynamic var: {}", var.qualified_name()),
                    name_form,
                ));
            }
            let init = self.analyze(&pair[1])?;
            pairs.push((var, init));
        }
        let body = form.children[2..]
            .iter()
            .map(|c| self.analyze(c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Node::new(NodeKind::Binding { pairs, body }, form.line, form.col))
    }

    fn analyze_try(&mut self, form: &Form) -> Result<Node> {
        let mut body = Vec::new();
        let mut catch = None;
        let mut finally = None;

        for child in &form.children[1..] {
            let head_name = child.children.first().and_then(|h| {
                if h.value.kind() == ValueKind::Symbol {
                    Some(h.value.as_symbol().name.clone())
                } else {
                    None
                }
            });
            match head_name.as_deref() {
                Some("catch") if child.value.kind() == ValueKind::List => {
                    if catch.is_some() || finally.is_some() {
                        return Err(analyze_error("catch must come before finally", child));
                    }
                    catch = Some(self.analyze_catch(child)?);
                }
                Some("finally") if child.value.kind() == ValueKind::List => {
                    if finally.is_some() {
                        return Err(analyze_error("only one finally clause allowed", child));
                    }
                    finally = Some(
                        child.children[1..]
                            .iter()
                            .map(|c| self.analyze(c))
                            .collect::<Result<Vec<_>>>()?,
                    );
                }
                _ => {
                    if catch.is_some() || finally.is_some() {
                        return Err(analyze_error(
                            "body forms must come before catch/finally",
                            child,
                        ));
                    }
                    body.push(self.analyze(child)?);
                }
            }
        }
        Ok(Node::new(
            NodeKind::Try {
                body,
                catch,
                finally,
            },
            form.line,
            form.col,
        ))
    }

    fn analyze_catch(&mut self, clause: &Form) -> Result<Catch> {
        // (catch e body...) or (catch SomeType e body...); the type is
        // informational and skipped when present
        let mut idx = 1;
        if clause.children.len() > 2
            && clause.children[1].value.kind() == ValueKind::Symbol
            && clause.children[2].value.kind() == ValueKind::Symbol
        {
            idx = 2;
        }
        let Some(name_form) = clause.children.get(idx) else {
            return Err(analyze_error("catch expects a binding symbol", clause));
        };
        if name_form.value.kind() != ValueKind::Symbol {
            return Err(analyze_error("catch binding must be a symbol", name_form));
        }
        let name = name_form.value.as_symbol().name.clone();

        let locals_before = self.scope().locals.len();
        let slot = self.scope().alloc_slot();
        self.scope().locals.push((name.clone(), slot));
        let body = clause.children[idx + 1..]
            .iter()
            .map(|c| self.analyze(c))
            .collect::<Result<Vec<_>>>()?;
        self.scope().locals.truncate(locals_before);

        Ok(Catch { slot, name, body })
    }

    fn analyze_throw(&mut self, form: &Form) -> Result<Node> {
        if form.children.len() != 2 {
            return Err(analyze_error("throw expects exactly one form", form));
        }
        let expr = Box::new(self.analyze(&form.children[1])?);
        Ok(Node::new(NodeKind::Throw(expr), form.line, form.col))
    }

    fn analyze_ns(&mut self, form: &Form) -> Result<Node> {
        let Some(name_form) = form.children.get(1) else {
            return Err(analyze_error("ns expects a name", form));
        };
        if name_form.value.kind() != ValueKind::Symbol {
            return Err(analyze_error("ns name must be a symbol", name_form));
        }
        let name = name_form.value.as_symbol().name.clone();
        // Reference clauses (:require ...) are accepted and ignored; the
        // loader surface is out of scope here.
        // Switch the analysis namespace now so later forms in the same
        // source resolve there.
        let ns = self.env.in_ns(&name);
        crate::builtins::refer_core(self.env, &ns);
        Ok(Node::new(NodeKind::InNs { name }, form.line, form.col))
    }

    /// `(lazy-seq body...)` and friends become `(ctor (fn [] body...))`.
    fn analyze_thunk_sugar(&mut self, form: &Form, ctor: &str) -> Result<Node> {
        let heap = &self.env.heap;
        let fn_sym = heap.symbol(None, "fn");
        let params = heap.vector_from(vec![]);
        let mut fn_items: Vec<Value> = vec![fn_sym, params];
        let mut fn_children = vec![
            Form::from_value(fn_sym, form.line, form.col),
            Form::from_value(params, form.line, form.col),
        ];
        for f in &form.children[1..] {
            fn_items.push(f.value);
            fn_children.push(f.clone());
        }
        let fn_form = Form {
            value: heap.list_from(fn_items),
            line: form.line,
            col: form.col,
            children: fn_children,
            meta: None,
        };
        let ctor_sym = heap.symbol(None, ctor);
        let call_form = Form {
            value: heap.list_from(vec![ctor_sym, fn_form.value]),
            line: form.line,
            col: form.col,
            children: vec![Form::from_value(ctor_sym, form.line, form.col), fn_form],
            meta: None,
        };
        self.analyze(&call_form)
    }

    /// `and`/`or` lower into let+if chains preserving the value of the
    /// deciding form.
    fn analyze_and_or(&mut self, form: &Form, is_and: bool) -> Result<Node> {
        if form.children.len() == 1 {
            return Ok(Node::new(
                NodeKind::Const(if is_and {
                    Value::bool_val(true)
                } else {
                    Value::nil()
                }),
                form.line,
                form.col,
            ));
        }
        self.lower_and_or(&form.children[1..], is_and, form.line, form.col)
    }

    fn lower_and_or(
        &mut self,
        forms: &[Form],
        is_and: bool,
        line: u32,
        col: u32,
    ) -> Result<Node> {
        if forms.len() == 1 {
            return self.analyze(&forms[0]);
        }
        let first = self.analyze(&forms[0])?;
        let slot = self.scope().alloc_slot();
        let rest = self.lower_and_or(&forms[1..], is_and, line, col)?;
        let local = |k| Node::new(k, line, col);
        let test = Box::new(local(NodeKind::LocalRef {
            slot,
            name: "__t".to_string(),
        }));
        let keep = Box::new(local(NodeKind::LocalRef {
            slot,
            name: "__t".to_string(),
        }));
        let if_node = if is_and {
            NodeKind::If {
                test,
                then: Box::new(rest),
                els: Some(keep),
            }
        } else {
            NodeKind::If {
                test,
                then: keep,
                els: Some(Box::new(rest)),
            }
        };
        Ok(Node::new(
            NodeKind::Let {
                bindings: vec![(slot, first)],
                body: vec![local(if_node)],
                is_loop: false,
            },
            line,
            col,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::bootstrap;
    use crate::reader::Reader;

    fn analyze_src(env: &Env, src: &str) -> Result<(Node, usize)> {
        let mut reader = Reader::new(&env.heap, src).unwrap();
        let form = reader.next_form().unwrap().unwrap();
        clove_runtime::ns::with_eval_env(env, || analyze_top(env, &form))
    }

    #[test]
    fn test_locals_get_sequential_slots() {
        let env = bootstrap();
        let (node, slots) = analyze_src(&env, "(let [a 1 b 2] b)").unwrap();
        assert_eq!(slots, 2);
        match node.kind {
            NodeKind::Let { bindings, body, .. } => {
                assert_eq!(bindings[0].0, 0);
                assert_eq!(bindings[1].0, 1);
                match &body[0].kind {
                    NodeKind::LocalRef { slot, name } => {
                        assert_eq!(*slot, 1);
                        assert_eq!(name, "b");
                    }
                    other => panic!("expected local ref, got {other:?}"),
                }
            }
            other => panic!("expected let, got {other:?}"),
        }
    }

    #[test]
    fn test_unresolved_symbol_is_analyze_error() {
        let env = bootstrap();
        let err = analyze_src(&env, "nope-not-defined").unwrap_err();
        assert_eq!(err.phase, Phase::Analyze);
        assert!(err.message.contains("Unable to resolve symbol"));
    }

    #[test]
    fn test_closure_captures_outer_local() {
        let env = bootstrap();
        let (node, _) = analyze_src(&env, "(let [n 2] (fn [x] (+ x n)))").unwrap();
        let NodeKind::Let { body, .. } = node.kind else {
            panic!("expected let");
        };
        let NodeKind::Fn(proto) = &body[0].kind else {
            panic!("expected fn");
        };
        // n lives in the enclosing frame's slot 0
        assert_eq!(proto.captures, vec![CaptureSource::Slot(0)]);
        assert_eq!(proto.arities[0].params, 1);
    }

    #[test]
    fn test_recur_arity_checked() {
        let env = bootstrap();
        let err = analyze_src(&env, "(loop [i 0] (recur 1 2))").unwrap_err();
        assert!(err.message.contains("recur expects 1 arguments"));
        let err = analyze_src(&env, "(recur 1)").unwrap_err();
        assert!(err.message.contains("recur outside"));
    }

    #[test]
    fn test_variadic_params() {
        let env = bootstrap();
        let (node, _) = analyze_src(&env, "(fn [a b & more] more)").unwrap();
        let NodeKind::Fn(proto) = node.kind else {
            panic!("expected fn");
        };
        let arity = &proto.arities[0];
        assert_eq!(arity.params, 2);
        assert!(arity.variadic);
        assert_eq!(arity.bound_params(), 3);
    }

    #[test]
    fn test_def_dynamic_meta_sets_flag() {
        let env = bootstrap();
        let (node, _) = analyze_src(&env, "(def ^:dynamic *width* 80)").unwrap();
        let NodeKind::Def { var, .. } = node.kind else {
            panic!("expected def");
        };
        assert!(var.is_dynamic());
    }

    #[test]
    fn test_binding_rejects_non_dynamic() {
        let env = bootstrap();
        analyze_src(&env, "(def plain 1)").unwrap();
        let err = analyze_src(&env, "(binding [plain 2] plain)").unwrap_err();
        assert!(err.message.contains("non-dynamic"));
    }

    #[test]
    fn test_vector_literal_with_expr_lowers_to_make_vector() {
        let env = bootstrap();
        let (node, _) = analyze_src(&env, "[1 (+ 1 1)]").unwrap();
        assert!(matches!(node.kind, NodeKind::MakeVector(_)));
        let (node, _) = analyze_src(&env, "[1 2]").unwrap();
        assert!(matches!(node.kind, NodeKind::Const(_)));
    }
}
