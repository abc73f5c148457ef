//! Analyzed AST
//!
//! The analyzer lowers forms into `Node`s consumed by both back-ends: the
//! tree-walker evaluates them directly, the bytecode compiler lowers them
//! to chunks. Every node carries the source coordinates of the form it
//! came from, so errors anchor at the offending operand.
//!
//! Function prototypes are shared between back-ends: the tree-walker
//! evaluates an arity's body nodes, the VM compiles them on first call and
//! caches the chunk on the arity.

use std::sync::{Arc, OnceLock};

use clove_runtime::value::Value;
use clove_runtime::var::Var;

#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub line: u32,
    pub col: u32,
}

impl Node {
    pub fn new(kind: NodeKind, line: u32, col: u32) -> Node {
        Node { kind, line, col }
    }
}

#[derive(Debug)]
pub enum NodeKind {
    /// Literal or quoted value.
    Const(Value),
    /// Local slot in the current frame.
    LocalRef { slot: usize, name: String },
    /// Captured value from the enclosing closure environment.
    CaptureRef { idx: usize, name: String },
    /// The executing function itself (named fn self-reference).
    SelfRef,
    /// Dereference of a resolved var.
    VarRef(Arc<Var>),
    /// The var object itself, `(var x)`.
    TheVar(Arc<Var>),
    If {
        test: Box<Node>,
        then: Box<Node>,
        els: Option<Box<Node>>,
    },
    Do(Vec<Node>),
    Let {
        bindings: Vec<(usize, Node)>,
        body: Vec<Node>,
        is_loop: bool,
    },
    /// Rebind the nearest loop/fn target and jump back.
    Recur(Vec<Node>),
    Fn(Arc<FnProto>),
    Call {
        callee: Box<Node>,
        args: Vec<Node>,
        /// Source anchor per argument, for error attribution.
        arg_spans: Vec<(u32, u32)>,
    },
    Def {
        var: Arc<Var>,
        init: Option<Box<Node>>,
    },
    /// `set!` of a thread-bound dynamic var.
    SetBang {
        var: Arc<Var>,
        expr: Box<Node>,
    },
    /// `binding`: push a frame around the body.
    Binding {
        pairs: Vec<(Arc<Var>, Node)>,
        body: Vec<Node>,
    },
    Try {
        body: Vec<Node>,
        catch: Option<Catch>,
        finally: Option<Vec<Node>>,
    },
    Throw(Box<Node>),
    /// `ns` / `in-ns`: switch the evaluation namespace.
    InNs { name: String },
    /// Collection literals with non-constant elements.
    MakeVector(Vec<Node>),
    MakeMap(Vec<(Node, Node)>),
    MakeSet(Vec<Node>),
}

#[derive(Debug)]
pub struct Catch {
    pub slot: usize,
    pub name: String,
    pub body: Vec<Node>,
}

/// Where a closure capture reads from at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    /// A slot of the creating frame.
    Slot(usize),
    /// A capture of the creating closure.
    Capture(usize),
    /// The creating function itself.
    SelfRef,
}

#[derive(Debug)]
pub struct FnProto {
    pub name: Option<String>,
    pub captures: Vec<CaptureSource>,
    pub arities: Vec<FnArity>,
}

impl FnProto {
    /// Select the arity for an invocation with `argc` arguments: an exact
    /// fixed match wins, else the widest variadic that fits.
    pub fn select_arity(&self, argc: usize) -> Option<&FnArity> {
        self.arities
            .iter()
            .find(|a| !a.variadic && a.params == argc)
            .or_else(|| {
                self.arities
                    .iter()
                    .filter(|a| a.variadic && argc >= a.params)
                    .max_by_key(|a| a.params)
            })
    }
}

#[derive(Debug)]
pub struct FnArity {
    /// Fixed parameter count; a variadic arity takes a rest seq after these.
    pub params: usize,
    pub variadic: bool,
    /// Frame slots this arity needs (params, rest slot, lets).
    pub slots: usize,
    pub body: Vec<Node>,
    /// Bytecode, compiled on first VM invocation.
    pub chunk: OnceLock<Arc<crate::bytecode::Chunk>>,
}

impl FnArity {
    /// Number of slots the invocation itself fills (params + rest).
    pub fn bound_params(&self) -> usize {
        self.params + usize::from(self.variadic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arity(params: usize, variadic: bool) -> FnArity {
        FnArity {
            params,
            variadic,
            slots: params + usize::from(variadic),
            body: Vec::new(),
            chunk: OnceLock::new(),
        }
    }

    #[test]
    fn test_arity_selection() {
        let proto = FnProto {
            name: None,
            captures: Vec::new(),
            arities: vec![arity(1, false), arity(2, false), arity(2, true)],
        };
        assert_eq!(proto.select_arity(1).unwrap().params, 1);
        let two = proto.select_arity(2).unwrap();
        assert_eq!(two.params, 2);
        assert!(!two.variadic);
        // Three args spill into the variadic arity
        let three = proto.select_arity(3).unwrap();
        assert!(three.variadic);
        assert!(proto.select_arity(0).is_none());
    }
}
