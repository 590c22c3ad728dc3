// Tagged value union and heap object model.
//
// Heap objects are allocated through `memory::Heap` and referenced from
// `Value::Obj` as raw, non-owning pointers: ownership lives entirely in the
// intrusive `Heap::objects` list, and reachability (not Rust's borrow
// checker) is what keeps them alive. This mirrors a C-style VM's object
// graph, which is the only practical way to express a cyclic,
// mutably-shared heap (closures <-> upvalues <-> stack, instances <->
// classes) without reference counting.

use std::fmt;
use std::ptr::NonNull;

use crate::chunk::Chunk;
use crate::table::Table;

/// A tagged runtime value. Copy because every variant is either a scalar
/// or a non-owning pointer into the heap.
#[derive(Clone, Copy)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(ObjRef),
}

impl Value {
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(o) => Some(*o),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<NonNull<ObjString>> {
        match self {
            Value::Obj(o) => o.as_string(),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Obj(o) => o.type_name(),
        }
    }

    /// Same tag and payload; NaN != NaN; obj values compare by pointer
    /// identity rather than structural equality.
    pub fn values_equal(a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Obj(x), Value::Obj(y)) => x.same_identity(y),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Obj(o) => write!(f, "{:?}", o),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Obj(o) => write!(f, "{}", o),
        }
    }
}

/// Discriminant for `Obj`. Kept as a standalone enum (rather than matching
/// on `ObjRef` variants directly) because the GC, printer, and equality all
/// need to switch on it without touching the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjKind {
    String,
    Function,
    Native,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
}

/// Every heap object begins with this header: GC mark bit plus the
/// intrusive "all objects" link threading every live object in allocation
/// order (see memory::Heap).
#[repr(C)]
pub struct ObjHeader {
    pub kind: ObjKind,
    pub marked: bool,
    pub next: Option<NonNull<ObjHeader>>,
}

/// Non-owning reference to a heap object. The tag is read from the shared
/// `ObjHeader` prefix every variant has, so a `*mut ObjHeader` can always be
/// safely reinterpreted as the concrete pointee named by `kind`.
#[derive(Clone, Copy)]
pub struct ObjRef(pub NonNull<ObjHeader>);

impl ObjRef {
    pub fn kind(&self) -> ObjKind {
        unsafe { self.0.as_ref().kind }
    }

    pub fn same_identity(&self, other: ObjRef) -> bool {
        self.0 == other.0
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind() {
            ObjKind::String => "string",
            ObjKind::Function => "function",
            ObjKind::Native => "native function",
            ObjKind::Closure => "function",
            ObjKind::Upvalue => "upvalue",
            ObjKind::Class => "class",
            ObjKind::Instance => "instance",
            ObjKind::BoundMethod => "function",
        }
    }

    /// # Safety
    /// Caller must know `self` actually points at the claimed variant.
    pub unsafe fn cast<T>(&self) -> NonNull<T> {
        self.0.cast::<T>()
    }

    pub fn as_string(&self) -> Option<NonNull<ObjString>> {
        (self.kind() == ObjKind::String).then(|| unsafe { self.cast() })
    }

    pub fn as_function(&self) -> Option<NonNull<ObjFunction>> {
        (self.kind() == ObjKind::Function).then(|| unsafe { self.cast() })
    }

    pub fn as_native(&self) -> Option<NonNull<ObjNative>> {
        (self.kind() == ObjKind::Native).then(|| unsafe { self.cast() })
    }

    pub fn as_closure(&self) -> Option<NonNull<ObjClosure>> {
        (self.kind() == ObjKind::Closure).then(|| unsafe { self.cast() })
    }

    pub fn as_upvalue(&self) -> Option<NonNull<ObjUpvalue>> {
        (self.kind() == ObjKind::Upvalue).then(|| unsafe { self.cast() })
    }

    pub fn as_class(&self) -> Option<NonNull<ObjClass>> {
        (self.kind() == ObjKind::Class).then(|| unsafe { self.cast() })
    }

    pub fn as_instance(&self) -> Option<NonNull<ObjInstance>> {
        (self.kind() == ObjKind::Instance).then(|| unsafe { self.cast() })
    }

    pub fn as_bound_method(&self) -> Option<NonNull<ObjBoundMethod>> {
        (self.kind() == ObjKind::BoundMethod).then(|| unsafe { self.cast() })
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        unsafe {
            match self.kind() {
                ObjKind::String => write!(f, "{}", self.cast::<ObjString>().as_ref().as_str()),
                ObjKind::Function => {
                    let func = self.cast::<ObjFunction>();
                    match func.as_ref().name {
                        Some(name) => write!(f, "<fn {}>", name.as_ref().as_str()),
                        None => write!(f, "<script>"),
                    }
                }
                ObjKind::Native => write!(f, "<native fn>"),
                ObjKind::Closure => {
                    let closure = self.cast::<ObjClosure>();
                    write!(f, "{}", Value::Obj(ObjRef(closure.as_ref().function.cast())))
                }
                ObjKind::Upvalue => write!(f, "upvalue"),
                ObjKind::Class => {
                    let class = self.cast::<ObjClass>();
                    write!(f, "{}", class.as_ref().name.as_ref().as_str())
                }
                ObjKind::Instance => {
                    let inst = self.cast::<ObjInstance>();
                    write!(f, "{} instance", inst.as_ref().class.as_ref().name.as_ref().as_str())
                }
                ObjKind::BoundMethod => {
                    let bm = self.cast::<ObjBoundMethod>();
                    write!(
                        f,
                        "{}",
                        Value::Obj(ObjRef(bm.as_ref().method.as_ref().function.cast()))
                    )
                }
            }
        }
    }
}

/// Interned, immutable byte string with a precomputed FNV-1a hash.
#[repr(C)]
pub struct ObjString {
    pub header: ObjHeader,
    pub hash: u32,
    chars: Box<str>,
}

impl ObjString {
    pub fn new(chars: Box<str>, hash: u32) -> ObjString {
        ObjString {
            header: ObjHeader { kind: ObjKind::String, marked: false, next: None },
            hash,
            chars,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.chars
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }
}

/// FNV-1a over raw bytes.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// A compiled function: arity, upvalue count, its own chunk, and an
/// optional name (absent for the implicit top-level script).
#[repr(C)]
pub struct ObjFunction {
    pub header: ObjHeader,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<NonNull<ObjString>>,
}

impl ObjFunction {
    pub fn new(name: Option<NonNull<ObjString>>) -> ObjFunction {
        ObjFunction {
            header: ObjHeader { kind: ObjKind::Function, marked: false, next: None },
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}

pub type NativeFn = fn(args: &[Value]) -> Result<Value, String>;

/// Host-provided function. Natives must not allocate GC objects that
/// aren't immediately rooted — `clock` never allocates, so this holds
/// trivially for the one native currently registered.
#[repr(C)]
pub struct ObjNative {
    pub header: ObjHeader,
    pub function: NativeFn,
    pub name: &'static str,
}

impl ObjNative {
    pub fn new(function: NativeFn, name: &'static str) -> ObjNative {
        ObjNative { header: ObjHeader { kind: ObjKind::Native, marked: false, next: None }, function, name }
    }
}

/// Either open (points at a live VM stack slot) or closed (owns its value).
pub enum UpvalueState {
    Open(*mut Value),
    Closed(Value),
}

#[repr(C)]
pub struct ObjUpvalue {
    pub header: ObjHeader,
    pub state: UpvalueState,
    /// Intrusive singly-linked list of open upvalues, sorted by descending
    /// stack address (see vm::Vm::open_upvalues).
    pub next_open: Option<NonNull<ObjUpvalue>>,
}

impl ObjUpvalue {
    pub fn new(slot: *mut Value) -> ObjUpvalue {
        ObjUpvalue {
            header: ObjHeader { kind: ObjKind::Upvalue, marked: false, next: None },
            state: UpvalueState::Open(slot),
            next_open: None,
        }
    }

    pub fn location(&self) -> *mut Value {
        match &self.state {
            UpvalueState::Open(ptr) => *ptr,
            UpvalueState::Closed(_) => std::ptr::null_mut(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, UpvalueState::Open(_))
    }
}

/// Runtime closure: a non-owning reference to its `ObjFunction` plus a
/// fixed-length array of captured upvalue references.
#[repr(C)]
pub struct ObjClosure {
    pub header: ObjHeader,
    pub function: NonNull<ObjFunction>,
    pub upvalues: Vec<NonNull<ObjUpvalue>>,
}

impl ObjClosure {
    pub fn new(function: NonNull<ObjFunction>) -> ObjClosure {
        let count = unsafe { function.as_ref().upvalue_count };
        ObjClosure {
            header: ObjHeader { kind: ObjKind::Closure, marked: false, next: None },
            function,
            upvalues: Vec::with_capacity(count),
        }
    }
}

#[repr(C)]
pub struct ObjClass {
    pub header: ObjHeader,
    pub name: NonNull<ObjString>,
    pub methods: Table,
}

impl ObjClass {
    pub fn new(name: NonNull<ObjString>) -> ObjClass {
        ObjClass {
            header: ObjHeader { kind: ObjKind::Class, marked: false, next: None },
            name,
            methods: Table::new(),
        }
    }
}

#[repr(C)]
pub struct ObjInstance {
    pub header: ObjHeader,
    pub class: NonNull<ObjClass>,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(class: NonNull<ObjClass>) -> ObjInstance {
        ObjInstance {
            header: ObjHeader { kind: ObjKind::Instance, marked: false, next: None },
            class,
            fields: Table::new(),
        }
    }
}

#[repr(C)]
pub struct ObjBoundMethod {
    pub header: ObjHeader,
    pub receiver: Value,
    pub method: NonNull<ObjClosure>,
}

impl ObjBoundMethod {
    pub fn new(receiver: Value, method: NonNull<ObjClosure>) -> ObjBoundMethod {
        ObjBoundMethod {
            header: ObjHeader { kind: ObjKind::BoundMethod, marked: false, next: None },
            receiver,
            method,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falsey_values() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Bool(true).is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
    }

    #[test]
    fn nan_is_not_equal_to_itself() {
        let nan = Value::Number(f64::NAN);
        assert!(!Value::values_equal(nan, nan));
    }

    #[test]
    fn hash_is_stable_for_equal_bytes() {
        assert_eq!(fnv1a_hash(b"hello"), fnv1a_hash(b"hello"));
        assert_ne!(fnv1a_hash(b"hello"), fnv1a_hash(b"world"));
    }
}
