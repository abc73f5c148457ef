//! Value heap
//!
//! The shared allocation arena every heap value lives in. The collector
//! itself is an external collaborator; from the core's perspective the heap
//! is an allocator handing out stable pointers that stay valid for the
//! heap's lifetime, which the owning `Env` ties to the program lifetime.
//!
//! A mutex guards the arena so worker threads can allocate concurrently;
//! allocation is a bump in the common case, so contention is short.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use typed_arena::Arena;

use crate::value::{
    AgentData, AgentErrorMode, AgentInner, AtomData, BigDecData, BuiltinData, BuiltinFn,
    ChunkedData, ConsData, DelayData, DelayState, FnData, ForeignFnData, HKey, HeapObj, LazyMeta,
    LazySeqData, LazyState, MatcherData, ModuleData, MultiFnData, ProtocolFnData, RatioData,
    SymbolData, Value,
};
use crate::var::Var;

pub struct Heap {
    arena: Mutex<Arena<HeapObj>>,
    allocated: AtomicUsize,
}

impl Heap {
    pub fn new() -> Arc<Heap> {
        Arc::new(Heap {
            arena: Mutex::new(Arena::new()),
            allocated: AtomicUsize::new(0),
        })
    }

    /// Number of objects allocated so far.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Allocate a heap object and return its tagged value.
    ///
    /// The arena never moves allocations, so the returned pointer is stable
    /// until the heap itself is dropped.
    pub fn alloc(&self, obj: HeapObj) -> Value {
        let ptr: *const HeapObj = {
            let arena = self.arena.lock().expect("heap arena poisoned");
            arena.alloc(obj) as *const HeapObj
        };
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Value::from_heap_ptr(ptr)
    }

    // =========================================================================
    // Typed constructors
    // =========================================================================

    pub fn str_value(&self, s: impl Into<String>) -> Value {
        self.alloc(HeapObj::Str(s.into()))
    }

    pub fn symbol(&self, ns: Option<&str>, name: &str) -> Value {
        self.alloc(HeapObj::Symbol(SymbolData {
            ns: ns.map(str::to_string),
            name: name.to_string(),
        }))
    }

    /// Keywords register in the process-wide intern table on construction.
    pub fn keyword(&self, ns: Option<&str>, name: &str) -> Value {
        crate::keyword::intern(ns, name);
        self.alloc(HeapObj::Keyword(SymbolData {
            ns: ns.map(str::to_string),
            name: name.to_string(),
        }))
    }

    /// An integer of any magnitude: small immediates below the 48-bit bound,
    /// big-int heap objects past it.
    pub fn int(&self, n: i64) -> Value {
        match Value::try_int(n) {
            Some(v) => v,
            None => self.alloc(HeapObj::Big(BigInt::from(n))),
        }
    }

    /// A big integer value. Stays big even when the magnitude would fit a
    /// small int: promotion is sticky, demotion loses the kind.
    pub fn big(&self, n: BigInt) -> Value {
        self.alloc(HeapObj::Big(n))
    }

    /// An integer from a big value, demoting to a small immediate when it
    /// fits. Used where a mathematical identity (ratio reduction, literal
    /// parsing) rather than arithmetic promotion produced the big form.
    pub fn int_from_big(&self, n: BigInt) -> Value {
        match n.to_i64().and_then(Value::try_int) {
            Some(v) => v,
            None => self.alloc(HeapObj::Big(n)),
        }
    }

    /// A ratio from an already-reduced numerator/denominator pair.
    /// Use [`crate::arith::make_ratio`] to construct from arbitrary parts.
    pub fn ratio_raw(&self, num: BigInt, den: BigInt) -> Value {
        debug_assert!(den > BigInt::from(0), "ratio denominator must be positive");
        self.alloc(HeapObj::Ratio(RatioData { num, den }))
    }

    pub fn big_dec(&self, unscaled: BigInt, scale: u32) -> Value {
        self.alloc(HeapObj::BigDec(BigDecData { unscaled, scale }))
    }

    pub fn list(&self, items: im::Vector<Value>) -> Value {
        self.alloc(HeapObj::List(items))
    }

    pub fn list_from(&self, items: Vec<Value>) -> Value {
        self.alloc(HeapObj::List(items.into_iter().collect()))
    }

    pub fn vector(&self, items: im::Vector<Value>) -> Value {
        self.alloc(HeapObj::Vector(items))
    }

    pub fn vector_from(&self, items: Vec<Value>) -> Value {
        self.alloc(HeapObj::Vector(items.into_iter().collect()))
    }

    pub fn array_map(&self, pairs: Vec<(Value, Value)>) -> Value {
        self.alloc(HeapObj::ArrayMap(pairs))
    }

    pub fn hash_map(&self, map: im::HashMap<HKey, Value>) -> Value {
        self.alloc(HeapObj::Map(map))
    }

    pub fn hash_set(&self, set: im::HashSet<HKey>) -> Value {
        self.alloc(HeapObj::Set(set))
    }

    pub fn cons(&self, first: Value, rest: Value) -> Value {
        self.alloc(HeapObj::Cons(ConsData { first, rest }))
    }

    pub fn chunked(&self, chunk: Vec<Value>, rest: Value) -> Value {
        self.alloc(HeapObj::Chunked(ChunkedData { chunk, rest }))
    }

    pub fn lazy_thunk(&self, thunk: Value) -> Value {
        self.alloc(HeapObj::Lazy(LazySeqData {
            state: Mutex::new(LazyState::Thunk(thunk)),
        }))
    }

    pub fn lazy_meta(&self, meta: LazyMeta) -> Value {
        self.alloc(HeapObj::Lazy(LazySeqData {
            state: Mutex::new(LazyState::Meta(meta)),
        }))
    }

    pub fn atom(&self, initial: Value) -> Value {
        self.alloc(HeapObj::Atom(AtomData {
            value: Mutex::new(initial),
        }))
    }

    pub fn volatile(&self, initial: Value) -> Value {
        self.alloc(HeapObj::Volatile(Mutex::new(initial)))
    }

    pub fn delay(&self, body: Value) -> Value {
        self.alloc(HeapObj::Delay(DelayData {
            state: Mutex::new(DelayState::Pending(body)),
        }))
    }

    pub fn reduced(&self, v: Value) -> Value {
        self.alloc(HeapObj::Reduced(v))
    }

    pub fn transient_vector(&self, items: im::Vector<Value>) -> Value {
        self.alloc(HeapObj::TransientVector(Mutex::new(items)))
    }

    pub fn transient_map(&self, map: im::HashMap<HKey, Value>) -> Value {
        self.alloc(HeapObj::TransientMap(Mutex::new(map)))
    }

    pub fn transient_set(&self, set: im::HashSet<HKey>) -> Value {
        self.alloc(HeapObj::TransientSet(Mutex::new(set)))
    }

    pub fn builtin(&self, name: &'static str, f: BuiltinFn) -> Value {
        self.alloc(HeapObj::Builtin(BuiltinData { name, f }))
    }

    pub fn fn_value(&self, data: FnData) -> Value {
        self.alloc(HeapObj::Fn(data))
    }

    pub fn var_value(&self, var: Arc<Var>) -> Value {
        self.alloc(HeapObj::Var(var))
    }

    pub fn multi(&self, name: impl Into<String>, dispatch: Value) -> Value {
        self.alloc(HeapObj::Multi(MultiFnData {
            name: name.into(),
            dispatch,
            methods: Mutex::new(Vec::new()),
        }))
    }

    pub fn protocol_method(&self, name: impl Into<String>) -> Value {
        self.alloc(HeapObj::Protocol(ProtocolFnData {
            name: name.into(),
            impls: Mutex::new(Vec::new()),
        }))
    }

    pub fn agent(&self, initial: Value) -> Value {
        self.alloc(HeapObj::Agent(AgentData {
            inner: Mutex::new(AgentInner {
                state: initial,
                queue: std::collections::VecDeque::new(),
                processing: false,
                error_mode: AgentErrorMode::Fail,
                error_handler: None,
                error: None,
                watches: Vec::new(),
            }),
        }))
    }

    pub fn future_value(&self, result: Arc<crate::future::FutureResult>) -> Value {
        self.alloc(HeapObj::Future(result))
    }

    pub fn module(&self, name: impl Into<String>, exports: Vec<(String, Value)>) -> Value {
        self.alloc(HeapObj::Module(ModuleData {
            name: name.into(),
            exports: Mutex::new(exports),
        }))
    }

    pub fn foreign(
        &self,
        name: impl Into<String>,
        f: Box<dyn Fn(&Heap, &[Value]) -> crate::error::Result<Value> + Send + Sync>,
    ) -> Value {
        self.alloc(HeapObj::Foreign(ForeignFnData {
            name: name.into(),
            f,
        }))
    }

    pub fn regex(&self, pattern: regex::Regex) -> Value {
        self.alloc(HeapObj::Regex(pattern))
    }

    pub fn matcher(&self, pattern: regex::Regex, input: impl Into<String>) -> Value {
        self.alloc(HeapObj::Matcher(MatcherData {
            pattern,
            input: input.into(),
            pos: Mutex::new(0),
        }))
    }

    pub fn byte_array(&self, bytes: Vec<u8>) -> Value {
        self.alloc(HeapObj::Bytes(Mutex::new(bytes)))
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("allocated", &self.allocated())
            .finish()
    }
}
