//! Namespaces and the evaluation environment
//!
//! A `Namespace` maps short names to vars (definitions plus refers) and
//! short names to aliased namespaces. The `Registry` is the process-wide
//! namespace table; lookups stay safe during concurrent interning on other
//! namespaces because each namespace carries its own locks.
//!
//! An `Env` bundles the registry, the current namespace, and the value
//! heap, and retains analyzed AST roots so closures created by earlier
//! forms outlive per-form evaluation scopes. `thread_clone` hands workers a
//! lightweight copy sharing the registry and heap but owning its own
//! current-namespace pointer and root retention.

use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::var::Var;

/// Bound on the symbols an env owns for deterministic deallocation.
const MAX_OWNED_SYMBOLS: usize = 4096;

pub struct Namespace {
    pub name: String,
    mappings: RwLock<HashMap<String, Arc<Var>>>,
    aliases: RwLock<HashMap<String, Arc<Namespace>>>,
}

impl Namespace {
    fn new(name: impl Into<String>) -> Arc<Namespace> {
        Arc::new(Namespace {
            name: name.into(),
            mappings: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
        })
    }

    /// Find or create the var mapped to `name` in this namespace.
    pub fn intern(&self, name: &str) -> Arc<Var> {
        if let Some(existing) = self.lookup(name) {
            if existing.ns_name == self.name {
                return existing;
            }
        }
        let var = Var::new(self.name.clone(), name);
        self.mappings
            .write()
            .expect("namespace mappings poisoned")
            .insert(name.to_string(), var.clone());
        var
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Var>> {
        self.mappings
            .read()
            .expect("namespace mappings poisoned")
            .get(name)
            .cloned()
    }

    /// Map `name` to a var from another namespace. Idempotent: referring
    /// the same var again is a no-op; remapping to a different var is
    /// permitted and replaces the mapping.
    pub fn refer(&self, name: &str, var: Arc<Var>) {
        let mut mappings = self.mappings.write().expect("namespace mappings poisoned");
        if let Some(existing) = mappings.get(name) {
            if Arc::ptr_eq(existing, &var) {
                return;
            }
        }
        mappings.insert(name.to_string(), var);
    }

    pub fn alias(&self, name: &str, target: Arc<Namespace>) {
        self.aliases
            .write()
            .expect("namespace aliases poisoned")
            .insert(name.to_string(), target);
    }

    pub fn lookup_alias(&self, name: &str) -> Option<Arc<Namespace>> {
        self.aliases
            .read()
            .expect("namespace aliases poisoned")
            .get(name)
            .cloned()
    }

    /// Var names defined or referred in this namespace.
    pub fn mapped_names(&self) -> Vec<String> {
        self.mappings
            .read()
            .expect("namespace mappings poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#<ns {}>", self.name)
    }
}

pub struct Registry {
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry {
            namespaces: RwLock::new(HashMap::new()),
        })
    }

    pub fn find_or_create(&self, name: &str) -> Arc<Namespace> {
        if let Some(ns) = self.find(name) {
            return ns;
        }
        let ns = Namespace::new(name);
        self.namespaces
            .write()
            .expect("registry poisoned")
            .entry(name.to_string())
            .or_insert(ns)
            .clone()
    }

    pub fn find(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces
            .read()
            .expect("registry poisoned")
            .get(name)
            .cloned()
    }

    /// Remove a namespace; its vars die with it once unreferenced.
    pub fn remove(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces
            .write()
            .expect("registry poisoned")
            .remove(name)
    }

    pub fn all_names(&self) -> Vec<String> {
        self.namespaces
            .read()
            .expect("registry poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

// =============================================================================
// Env
// =============================================================================

pub struct Env {
    pub registry: Arc<Registry>,
    pub heap: Arc<Heap>,
    current_ns: Mutex<Arc<Namespace>>,
    /// Analyzed AST roots retained for the env lifetime, so closures keep
    /// their bodies after the per-form scope unwinds.
    roots: Mutex<Vec<Arc<dyn Any + Send + Sync>>>,
    owned_syms: Mutex<Vec<String>>,
}

impl Env {
    /// Fresh environment with its own registry and heap, positioned in the
    /// given namespace.
    pub fn new(initial_ns: &str) -> Env {
        let registry = Registry::new();
        let current = registry.find_or_create(initial_ns);
        Env {
            registry,
            heap: Heap::new(),
            current_ns: Mutex::new(current),
            roots: Mutex::new(Vec::new()),
            owned_syms: Mutex::new(Vec::new()),
        }
    }

    pub fn current_ns(&self) -> Arc<Namespace> {
        self.current_ns.lock().expect("env poisoned").clone()
    }

    pub fn set_current_ns(&self, ns: Arc<Namespace>) {
        *self.current_ns.lock().expect("env poisoned") = ns;
    }

    /// Switch to (creating if needed) the named namespace.
    pub fn in_ns(&self, name: &str) -> Arc<Namespace> {
        let ns = self.registry.find_or_create(name);
        self.set_current_ns(ns.clone());
        ns
    }

    /// Retain an analyzed AST root for the env's lifetime.
    pub fn retain_root(&self, root: Arc<dyn Any + Send + Sync>) {
        self.roots.lock().expect("env poisoned").push(root);
    }

    /// Record a symbol this env owns; bounded for deterministic teardown.
    pub fn own_symbol(&self, sym: impl Into<String>) -> Result<()> {
        let mut owned = self.owned_syms.lock().expect("env poisoned");
        if owned.len() >= MAX_OWNED_SYMBOLS {
            return Err(Error::value_error("environment symbol table is full"));
        }
        owned.push(sym.into());
        Ok(())
    }

    /// Lightweight copy for a worker thread: shares the namespace registry
    /// and heap, owns its current-namespace pointer and root retention.
    pub fn thread_clone(&self) -> Env {
        Env {
            registry: self.registry.clone(),
            heap: self.heap.clone(),
            current_ns: Mutex::new(self.current_ns()),
            roots: Mutex::new(Vec::new()),
            owned_syms: Mutex::new(Vec::new()),
        }
    }

    /// Resolve a possibly namespace-qualified symbol to a var, following
    /// aliases and refers from the current namespace.
    pub fn resolve(&self, ns: Option<&str>, name: &str) -> Option<Arc<Var>> {
        match ns {
            Some(ns_name) => {
                let current = self.current_ns();
                let target = current
                    .lookup_alias(ns_name)
                    .or_else(|| self.registry.find(ns_name))?;
                target.lookup(name)
            }
            None => self.current_ns().lookup(name),
        }
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#<env {}>", self.current_ns().name)
    }
}

// =============================================================================
// Macro-eval-env hook
// =============================================================================

thread_local! {
    /// Env the enclosing pipeline is evaluating under, for macro expansion
    /// and env-sensitive builtins on this thread.
    static EVAL_ENV: Cell<Option<*const Env>> = const { Cell::new(None) };
}

/// Install `env` as this thread's evaluation env for the duration of `f`,
/// restoring the previous hook on every exit path.
pub fn with_eval_env<R>(env: &Env, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<*const Env>);
    impl Drop for Restore {
        fn drop(&mut self) {
            EVAL_ENV.with(|cell| cell.set(self.0));
        }
    }
    let prev = EVAL_ENV.with(|cell| cell.replace(Some(env as *const Env)));
    let _restore = Restore(prev);
    f()
}

/// Run `f` with the current thread's evaluation env, if one is installed.
pub fn eval_env<R>(f: impl FnOnce(Option<&Env>) -> R) -> R {
    let ptr = EVAL_ENV.with(|cell| cell.get());
    match ptr {
        // The hook is only ever set by with_eval_env, whose scope guards
        // the env borrow.
        Some(p) => f(Some(unsafe { &*p })),
        None => f(None),
    }
}
