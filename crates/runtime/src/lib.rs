//! Clove runtime: the shared substrate under both evaluator back-ends
//!
//! Key design principles:
//! - Value: an 8-byte NaN-boxed handle; heap data is shared, never copied
//! - The numeric tower promotes small -> big stickily and reduces ratios
//!   to integers when that is a mathematical identity
//! - One dispatch entry point (`call_fn_val`) serves every callable kind;
//!   the evaluators above are reached only through the boot-installed
//!   bridge vtable
//! - Dynamic context (bindings, hooks, last exception) is per-thread and
//!   conveyed explicitly to pool workers

pub mod agent;
pub mod arith;
pub mod collections;
pub mod dispatch;
pub mod eql;
pub mod error;
pub mod future;
pub mod hash;
pub mod heap;
pub mod keyword;
pub mod lifecycle;
pub mod ns;
pub mod pool;
pub mod print;
pub mod refs;
pub mod seq;
pub mod value;
pub mod var;

// Re-export the types nearly every consumer needs
pub use error::{Error, ErrorKind, Phase, Result};
pub use heap::Heap;
pub use ns::{Env, Namespace, Registry};
pub use value::{Backend, FnData, HeapObj, Value, ValueKind};
pub use var::Var;

pub use dispatch::{Bridges, SeqOps, call_fn_val, install_bridges};
pub use eql::{eql, eql_alloc};
pub use hash::hash_value;
pub use print::{display_str, pr_str};
