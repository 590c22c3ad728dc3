// Heap allocation and the tracing garbage collector.
//
// Every `Obj*` is boxed, leaked into a raw pointer, and threaded onto
// `Heap::objects`, an intrusive singly-linked list through `ObjHeader::next`.
// That list is the only thing that owns heap objects; a `collect` walks
// roots, marks everything reachable (tri-color: white = unmarked, gray =
// marked but not yet scanned, black = marked and scanned), then sweeps the
// list freeing anything left white. This is the one module, along with
// `value.rs`'s pointer casts, that reaches for `unsafe`: a mutably-shared,
// possibly-cyclic object graph (closures <-> upvalues <-> stack, instances
// <-> classes) isn't expressible through the borrow checker without either
// reference counting (which can't collect cycles) or arena indices (which
// the rest of this design doesn't use).

use std::mem::size_of;
use std::ptr::NonNull;

use crate::table::Table;
use crate::value::{
    ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHeader, ObjInstance, ObjKind, ObjNative,
    ObjRef, ObjString, ObjUpvalue, UpvalueState, Value, fnv1a_hash,
};

const HEAP_GROW_FACTOR: usize = 2;

/// Anything that can hand the collector its root set and re-walk itself
/// once its own roots have been marked. The VM and the compiler (while a
/// function is mid-compilation, its in-progress `ObjFunction` constant
/// pool is a set of roots not yet reachable from any chunk) both implement
/// this.
pub trait Trace {
    fn mark_roots(&mut self, heap: &mut Heap);
}

pub struct Heap {
    objects: Option<NonNull<ObjHeader>>,
    gray_stack: Vec<ObjRef>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    pub stress_gc: bool,
    pub strings: Table,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objects: None,
            gray_stack: Vec::new(),
            bytes_allocated: 0,
            next_gc: 1024 * 1024,
            stress_gc: false,
            strings: Table::new(),
        }
    }

    fn track<T>(&mut self, value: T, kind: ObjKind) -> NonNull<T>
    where
        T: HasHeader,
    {
        self.bytes_allocated += size_of::<T>();
        let boxed = Box::new(value);
        let mut ptr = NonNull::new(Box::into_raw(boxed)).unwrap();
        unsafe {
            let header = ptr.as_mut().header_mut();
            header.kind = kind;
            header.next = self.objects;
        }
        self.objects = Some(ptr.cast());
        ptr
    }

    pub fn alloc_string(&mut self, chars: Box<str>) -> NonNull<ObjString> {
        let hash = fnv1a_hash(chars.as_bytes());
        if let Some(existing) = self.strings.find_string(&chars, hash) {
            return existing;
        }
        let ptr = self.track(ObjString::new(chars, hash), ObjKind::String);
        self.strings.set(ptr, Value::Nil);
        ptr
    }

    pub fn alloc_function(&mut self, name: Option<NonNull<ObjString>>) -> NonNull<ObjFunction> {
        self.track(ObjFunction::new(name), ObjKind::Function)
    }

    pub fn alloc_native(
        &mut self,
        function: crate::value::NativeFn,
        name: &'static str,
    ) -> NonNull<ObjNative> {
        self.track(ObjNative::new(function, name), ObjKind::Native)
    }

    pub fn alloc_closure(&mut self, function: NonNull<ObjFunction>) -> NonNull<ObjClosure> {
        self.track(ObjClosure::new(function), ObjKind::Closure)
    }

    pub fn alloc_upvalue(&mut self, slot: *mut Value) -> NonNull<ObjUpvalue> {
        self.track(ObjUpvalue::new(slot), ObjKind::Upvalue)
    }

    pub fn alloc_class(&mut self, name: NonNull<ObjString>) -> NonNull<ObjClass> {
        self.track(ObjClass::new(name), ObjKind::Class)
    }

    pub fn alloc_instance(&mut self, class: NonNull<ObjClass>) -> NonNull<ObjInstance> {
        self.track(ObjInstance::new(class), ObjKind::Instance)
    }

    pub fn alloc_bound_method(
        &mut self,
        receiver: Value,
        method: NonNull<ObjClosure>,
    ) -> NonNull<ObjBoundMethod> {
        self.track(ObjBoundMethod::new(receiver, method), ObjKind::BoundMethod)
    }

    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    /// Mark `value` gray if it's an unmarked object, pushing it onto the
    /// worklist. Safe to call on non-object values; a no-op there.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    pub fn mark_object(&mut self, mut obj: ObjRef) {
        let header = unsafe { obj.0.as_mut() };
        if header.marked {
            return;
        }
        header.marked = true;
        self.gray_stack.push(obj);
    }

    fn blacken(&mut self, obj: ObjRef) {
        unsafe {
            match obj.kind() {
                ObjKind::String | ObjKind::Native => {}
                ObjKind::Upvalue => {
                    let up = obj.cast::<ObjUpvalue>();
                    if let UpvalueState::Closed(v) = up.as_ref().state {
                        self.mark_value(v);
                    }
                }
                ObjKind::Function => {
                    let func = obj.cast::<ObjFunction>();
                    if let Some(name) = func.as_ref().name {
                        self.mark_object(ObjRef(name.cast()));
                    }
                    for constant in &func.as_ref().chunk.constants {
                        self.mark_value(*constant);
                    }
                }
                ObjKind::Closure => {
                    let closure = obj.cast::<ObjClosure>();
                    self.mark_object(ObjRef(closure.as_ref().function.cast()));
                    for upvalue in &closure.as_ref().upvalues {
                        self.mark_object(ObjRef(upvalue.cast()));
                    }
                }
                ObjKind::Class => {
                    let class = obj.cast::<ObjClass>();
                    self.mark_object(ObjRef(class.as_ref().name.cast()));
                    self.mark_table(&class.as_ref().methods);
                }
                ObjKind::Instance => {
                    let inst = obj.cast::<ObjInstance>();
                    self.mark_object(ObjRef(inst.as_ref().class.cast()));
                    self.mark_table(&inst.as_ref().fields);
                }
                ObjKind::BoundMethod => {
                    let bm = obj.cast::<ObjBoundMethod>();
                    self.mark_value(bm.as_ref().receiver);
                    self.mark_object(ObjRef(bm.as_ref().method.cast()));
                }
            }
        }
    }

    fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(ObjRef(key.cast()));
            self.mark_value(value);
        }
    }

    fn trace_references(&mut self) {
        while let Some(obj) = self.gray_stack.pop() {
            self.blacken(obj);
        }
    }

    fn sweep(&mut self) {
        let mut previous: Option<NonNull<ObjHeader>> = None;
        let mut current = self.objects;
        while let Some(mut node) = current {
            let header = unsafe { node.as_mut() };
            let next = header.next;
            if header.marked {
                header.marked = false;
                previous = Some(node);
                current = next;
            } else {
                if let Some(mut prev) = previous {
                    unsafe { prev.as_mut().next = next };
                } else {
                    self.objects = next;
                }
                current = next;
                self.bytes_allocated -= free_object(node);
            }
        }
    }

    /// Full mark-sweep cycle. Every tracer in `tracers` gets to mark its own
    /// roots before tracing starts -- a collection triggered mid-compile
    /// needs both the in-progress compiler state *and* whatever the VM
    /// already had reachable before `compile` was called (e.g. the `clock`
    /// native registered in `globals` at startup), or the second tracer's
    /// objects look unreachable and get swept out from under it.
    pub fn collect(&mut self, tracers: &mut [&mut dyn Trace]) {
        for tracer in tracers.iter_mut() {
            tracer.mark_roots(self);
        }
        self.trace_references();
        self.strings.remove_white();
        self.sweep();
        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut current = self.objects;
        while let Some(node) = current {
            let next = unsafe { node.as_ref().next };
            free_object(node);
            current = next;
        }
    }
}

/// Frees the concrete object behind `header` and returns its size in bytes.
fn free_object(header: NonNull<ObjHeader>) -> usize {
    unsafe {
        let kind = header.as_ref().kind;
        match kind {
            ObjKind::String => {
                let size = size_of::<ObjString>();
                drop(Box::from_raw(header.cast::<ObjString>().as_ptr()));
                size
            }
            ObjKind::Function => {
                let size = size_of::<ObjFunction>();
                drop(Box::from_raw(header.cast::<ObjFunction>().as_ptr()));
                size
            }
            ObjKind::Native => {
                let size = size_of::<ObjNative>();
                drop(Box::from_raw(header.cast::<ObjNative>().as_ptr()));
                size
            }
            ObjKind::Closure => {
                let size = size_of::<ObjClosure>();
                drop(Box::from_raw(header.cast::<ObjClosure>().as_ptr()));
                size
            }
            ObjKind::Upvalue => {
                let size = size_of::<ObjUpvalue>();
                drop(Box::from_raw(header.cast::<ObjUpvalue>().as_ptr()));
                size
            }
            ObjKind::Class => {
                let size = size_of::<ObjClass>();
                drop(Box::from_raw(header.cast::<ObjClass>().as_ptr()));
                size
            }
            ObjKind::Instance => {
                let size = size_of::<ObjInstance>();
                drop(Box::from_raw(header.cast::<ObjInstance>().as_ptr()));
                size
            }
            ObjKind::BoundMethod => {
                let size = size_of::<ObjBoundMethod>();
                drop(Box::from_raw(header.cast::<ObjBoundMethod>().as_ptr()));
                size
            }
        }
    }
}

/// Every heap object type starts with an `ObjHeader`; `#[repr(C)]` on each
/// guarantees the header is at offset 0, so a raw cast back to `&mut
/// ObjHeader` is always valid.
trait HasHeader {
    fn header_mut(&mut self) -> &mut ObjHeader;
}

macro_rules! impl_has_header {
    ($($ty:ty),* $(,)?) => {
        $(impl HasHeader for $ty {
            fn header_mut(&mut self) -> &mut ObjHeader {
                &mut self.header
            }
        })*
    };
}

impl_has_header!(
    ObjString,
    ObjFunction,
    ObjNative,
    ObjClosure,
    ObjUpvalue,
    ObjClass,
    ObjInstance,
    ObjBoundMethod,
);

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRoots;
    impl Trace for NoRoots {
        fn mark_roots(&mut self, _heap: &mut Heap) {}
    }

    #[test]
    fn unreachable_string_is_collected() {
        let mut heap = Heap::new();
        heap.alloc_string("hello".to_string().into_boxed_str());
        assert!(heap.bytes_allocated > 0);
        heap.collect(&mut [&mut NoRoots]);
        assert_eq!(heap.bytes_allocated, 0);
    }

    #[test]
    fn string_interning_returns_same_pointer() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("hi".to_string().into_boxed_str());
        let b = heap.alloc_string("hi".to_string().into_boxed_str());
        assert_eq!(a, b);
    }

    struct RootsOneString(NonNull<ObjString>);
    impl Trace for RootsOneString {
        fn mark_roots(&mut self, heap: &mut Heap) {
            heap.mark_object(ObjRef(self.0.cast()));
        }
    }

    #[test]
    fn reachable_string_survives_collection() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("kept".to_string().into_boxed_str());
        let mut tracer = RootsOneString(s);
        heap.collect(&mut [&mut tracer]);
        assert!(heap.bytes_allocated > 0);
    }

    #[test]
    fn collection_marks_roots_from_every_tracer_passed_in() {
        let mut heap = Heap::new();
        let kept_by_first = heap.alloc_string("first".to_string().into_boxed_str());
        let kept_by_second = heap.alloc_string("second".to_string().into_boxed_str());
        let mut first = RootsOneString(kept_by_first);
        let mut second = RootsOneString(kept_by_second);
        heap.collect(&mut [&mut first, &mut second]);
        assert!(heap.bytes_allocated > 0);
        assert!(heap.strings.find_string("first", crate::value::fnv1a_hash(b"first")).is_some());
        assert!(heap.strings.find_string("second", crate::value::fnv1a_hash(b"second")).is_some());
    }

    #[test]
    fn stress_gc_flag_forces_collection_eligibility() {
        let mut heap = Heap::new();
        assert!(!heap.should_collect());
        heap.stress_gc = true;
        assert!(heap.should_collect());
    }
}
