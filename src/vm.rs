// Call frames, operand stack, and the dispatch loop.
//
// One opcode is fetched and executed per iteration of `run`'s loop; there is
// no AST to walk, so "interpreting" a compiled chunk means advancing a per-
// frame instruction pointer through a flat byte stream and pushing/popping a
// shared `Vec<Value>` operand stack. The stack is reserved at `STACK_MAX`
// capacity up front and never allowed to reallocate (`push` bounds-checks
// before growing), because open upvalues hold raw pointers directly into its
// backing storage -- a reallocation would dangle them.

use std::ptr::NonNull;
use std::sync::OnceLock;
use std::time::Instant;

use crate::chunk::{Chunk, OpCode};
use crate::compiler;
use crate::error::{CompileError, RuntimeError};
use crate::memory::{Heap, Trace};
use crate::table::Table;
use crate::value::{
    NativeFn, ObjClosure, ObjKind, ObjRef, ObjString, ObjUpvalue, UpvalueState, Value,
};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// Per-invocation record: which closure is running, where in its chunk, and
/// where its locals/arguments start in the shared operand stack.
struct CallFrame {
    closure: NonNull<ObjClosure>,
    ip: usize,
    slot_base: usize,
}

/// Where `OpCode::Print` sends its rendered value. Mirrors the teacher's own
/// `Output` trait (there gating the canvas effects of its `Disp` opcode):
/// tests swap in a capturing sink instead of writing to real stdout.
pub trait Output {
    fn print(&mut self, text: &str);
}

pub struct StdoutOutput;

impl Output for StdoutOutput {
    fn print(&mut self, text: &str) {
        println!("{}", text);
    }
}

#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

pub struct Vm {
    heap: Heap,
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: Table,
    open_upvalues: Option<NonNull<ObjUpvalue>>,
    output: Box<dyn Output>,
    trace: bool,
}

impl Vm {
    pub fn new() -> Vm {
        let mut vm = Vm {
            heap: Heap::new(),
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(STACK_MAX),
            globals: Table::new(),
            open_upvalues: None,
            output: Box::new(StdoutOutput),
            trace: false,
        };
        vm.define_native("clock", native_clock);
        vm
    }

    pub fn with_stress_gc(mut self) -> Vm {
        self.heap.stress_gc = true;
        self
    }

    pub fn with_trace(mut self) -> Vm {
        self.trace = true;
        self
    }

    pub fn with_output(mut self, output: Box<dyn Output>) -> Vm {
        self.output = output;
        self
    }

    fn define_native(&mut self, name: &'static str, function: NativeFn) {
        let name_ptr = self.heap.alloc_string(name.to_string().into_boxed_str());
        let native_ptr = self.heap.alloc_native(function, name);
        self.globals.set(name_ptr, Value::Obj(ObjRef(native_ptr.cast())));
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        // Swapped out for the same reason `maybe_collect` swaps it: a
        // collection triggered while compiling needs `self` (globals, the
        // `clock` native already registered there, the stack) as an extra
        // tracer alongside the compiler's own in-progress functions, and
        // `self` can't be borrowed whole while `self.heap` is also borrowed.
        let mut heap = std::mem::replace(&mut self.heap, Heap::new());
        let compiled = compiler::compile(source, &mut heap, self);
        self.heap = heap;
        let function = match compiled {
            Ok(function) => function,
            Err(errors) => return Err(InterpretError::Compile(errors)),
        };
        // Root the bare function on the stack across the closure allocation.
        self.stack.push(Value::Obj(ObjRef(function.cast())));
        let closure = self.heap.alloc_closure(function);
        self.stack.pop();
        let closure_value = Value::Obj(ObjRef(closure.cast()));
        self.push(closure_value).map_err(InterpretError::Runtime)?;
        self.call_value(closure_value, 0).map_err(InterpretError::Runtime)?;
        self.run().map_err(InterpretError::Runtime)
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error_str("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow: compiler invariant violated")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            let mut heap = std::mem::replace(&mut self.heap, Heap::new());
            heap.collect(&mut [self]);
            self.heap = heap;
        }
    }

    // --- call handling ---

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        let obj = match callee {
            Value::Obj(obj) => obj,
            _ => return Err(self.runtime_error_str("Can only call functions and classes.")),
        };
        match obj.kind() {
            ObjKind::Closure => {
                let closure = unsafe { obj.cast::<ObjClosure>() };
                self.call_closure(closure, arg_count)
            }
            ObjKind::Native => {
                let native = unsafe { obj.cast::<crate::value::ObjNative>() };
                let args_start = self.stack.len() - arg_count as usize;
                let result = {
                    let function = unsafe { native.as_ref().function };
                    function(&self.stack[args_start..])
                };
                let callee_slot = args_start - 1;
                self.stack.truncate(callee_slot);
                match result {
                    Ok(value) => self.push(value),
                    Err(message) => Err(self.runtime_error(message)),
                }
            }
            ObjKind::Class => {
                let class = unsafe { obj.cast::<crate::value::ObjClass>() };
                let instance = self.heap.alloc_instance(class);
                let callee_slot = self.stack.len() - arg_count as usize - 1;
                self.stack[callee_slot] = Value::Obj(ObjRef(instance.cast()));
                // No user-defined `init` is wired through the interpreter
                // (see DESIGN.md); any constructor arguments are simply
                // discarded along with the rest of the call's operand slots.
                self.stack.truncate(callee_slot + 1);
                Ok(())
            }
            _ => Err(self.runtime_error_str("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: NonNull<ObjClosure>, arg_count: u8) -> Result<(), RuntimeError> {
        let arity = unsafe { closure.as_ref().function.as_ref().arity };
        if arg_count != arity {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                arity, arg_count
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error_str("Stack overflow."));
        }
        let slot_base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame { closure, ip: 0, slot_base });
        Ok(())
    }

    // --- upvalues ---

    fn capture_upvalue(&mut self, index: usize) -> NonNull<ObjUpvalue> {
        let slot_ptr = unsafe { self.stack.as_mut_ptr().add(index) };
        let mut prev: Option<NonNull<ObjUpvalue>> = None;
        let mut current = self.open_upvalues;
        while let Some(node) = current {
            let loc = unsafe { node.as_ref() }.location();
            if loc <= slot_ptr {
                break;
            }
            prev = Some(node);
            current = unsafe { node.as_ref() }.next_open;
        }
        if let Some(node) = current {
            if unsafe { node.as_ref() }.location() == slot_ptr {
                return node;
            }
        }
        let mut created = self.heap.alloc_upvalue(slot_ptr);
        unsafe {
            created.as_mut().next_open = current;
        }
        match prev {
            Some(mut p) => unsafe { p.as_mut().next_open = Some(created) },
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Closes every open upvalue whose stack slot is at or above `from_index`.
    fn close_upvalues(&mut self, from_index: usize) {
        let threshold = unsafe { self.stack.as_ptr().add(from_index) };
        while let Some(mut node) = self.open_upvalues {
            let loc = unsafe { node.as_ref() }.location();
            if loc < threshold {
                break;
            }
            let value = unsafe { *loc };
            unsafe {
                let next = node.as_ref().next_open;
                node.as_mut().state = UpvalueState::Closed(value);
                node.as_mut().next_open = None;
                self.open_upvalues = next;
            }
        }
    }

    // --- errors ---

    fn runtime_error(&mut self, message: String) -> RuntimeError {
        let mut stack_trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = unsafe { frame.closure.as_ref().function.as_ref() };
            let line = function.chunk.line_at(frame.ip.saturating_sub(1));
            let label = match function.name {
                Some(name) => format!("{}()", unsafe { name.as_ref().as_str() }),
                None => "script".to_string(),
            };
            stack_trace.push(format!("[line {}] in {}", line, label));
        }
        self.stack.clear();
        self.frames.clear();
        RuntimeError { message, stack_trace }
    }

    fn runtime_error_str(&mut self, message: &str) -> RuntimeError {
        self.runtime_error(message.to_string())
    }

    fn undefined_variable_error(&mut self, name: NonNull<ObjString>) -> RuntimeError {
        let message = format!("Undefined variable '{}'.", unsafe { name.as_ref().as_str() });
        self.runtime_error(message)
    }

    // --- bytecode reading ---

    fn read_byte(&mut self, frame_idx: usize) -> u8 {
        let frame = &mut self.frames[frame_idx];
        let byte = unsafe { frame.closure.as_ref().function.as_ref().chunk.code[frame.ip] };
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self, frame_idx: usize) -> u16 {
        let hi = self.read_byte(frame_idx) as u16;
        let lo = self.read_byte(frame_idx) as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self, frame_idx: usize) -> Value {
        let index = self.read_byte(frame_idx) as usize;
        let frame = &self.frames[frame_idx];
        unsafe { frame.closure.as_ref().function.as_ref().chunk.constants[index] }
    }

    fn read_string(&mut self, frame_idx: usize) -> NonNull<ObjString> {
        self.read_constant(frame_idx)
            .as_obj()
            .and_then(|obj| obj.as_string())
            .expect("constant referenced by a name opcode is not a string")
    }

    // --- arithmetic helpers ---
    //
    // One generic helper parameterized by the result constructor, rather
    // than a macro per operator.

    fn numeric_binary(&mut self, make: impl Fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.pop();
                self.pop();
                self.push(make(x, y))
            }
            _ => Err(self.runtime_error_str("Operands must be numbers.")),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            return self.push(Value::Number(x + y));
        }
        if let (Some(sa), Some(sb)) = (a.as_string(), b.as_string()) {
            let concatenated =
                unsafe { format!("{}{}", sa.as_ref().as_str(), sb.as_ref().as_str()) };
            let interned = self.heap.alloc_string(concatenated.into_boxed_str());
            self.pop();
            self.pop();
            return self.push(Value::Obj(ObjRef(interned.cast())));
        }
        Err(self.runtime_error_str("Operands must be two numbers or two strings."))
    }

    // --- the dispatch loop ---

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            self.maybe_collect();
            let frame_idx = self.frames.len() - 1;

            if self.trace {
                self.print_trace(frame_idx);
            }

            let op = OpCode::from_byte(self.read_byte(frame_idx));
            match op {
                OpCode::Constant => {
                    let value = self.read_constant(frame_idx);
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte(frame_idx) as usize;
                    let base = self.frames[frame_idx].slot_base;
                    let value = self.stack[base + slot];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte(frame_idx) as usize;
                    let base = self.frames[frame_idx].slot_base;
                    let value = self.peek(0);
                    self.stack[base + slot] = value;
                }
                OpCode::GetGlobal => {
                    let name = self.read_string(frame_idx);
                    match self.globals.get(name) {
                        Some(value) => self.push(value)?,
                        None => return Err(self.undefined_variable_error(name)),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string(frame_idx);
                    let value = self.pop();
                    self.globals.set(name, value);
                }
                OpCode::SetGlobal => {
                    let name = self.read_string(frame_idx);
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        self.globals.delete(name);
                        return Err(self.undefined_variable_error(name));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte(frame_idx) as usize;
                    let upvalue = unsafe { self.frames[frame_idx].closure.as_ref().upvalues[slot] };
                    self.push(upvalue_get(upvalue))?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte(frame_idx) as usize;
                    let upvalue = unsafe { self.frames[frame_idx].closure.as_ref().upvalues[slot] };
                    let value = self.peek(0);
                    upvalue_set(upvalue, value);
                }
                OpCode::GetProperty => {
                    let name = self.read_string(frame_idx);
                    let receiver = self.peek(0);
                    let instance = match receiver.as_obj().and_then(|o| o.as_instance()) {
                        Some(instance) => instance,
                        None => return Err(self.runtime_error_str("Only instances have properties.")),
                    };
                    let field = unsafe { instance.as_ref().fields.get(name) };
                    match field {
                        Some(value) => {
                            self.pop();
                            self.push(value)?;
                        }
                        None => {
                            let message =
                                format!("Undefined property '{}'.", unsafe { name.as_ref().as_str() });
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string(frame_idx);
                    let value = self.peek(0);
                    let receiver = self.peek(1);
                    let mut instance = match receiver.as_obj().and_then(|o| o.as_instance()) {
                        Some(instance) => instance,
                        None => return Err(self.runtime_error_str("Only instances have fields.")),
                    };
                    unsafe { instance.as_mut().fields.set(name, value) };
                    self.pop();
                    self.pop();
                    self.push(value)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(Value::values_equal(a, b)))?;
                }
                OpCode::Greater => self.numeric_binary(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.numeric_binary(|a, b| Value::Bool(a < b))?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.numeric_binary(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.numeric_binary(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.numeric_binary(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()))?;
                }
                OpCode::Negate => {
                    let value = self.peek(0);
                    match value.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n))?;
                        }
                        None => return Err(self.runtime_error_str("Operand must be a number.")),
                    }
                }
                OpCode::Print => {
                    let value = self.pop();
                    let text = format!("{}", value);
                    self.output.print(&text);
                }
                OpCode::Jump => {
                    let offset = self.read_short(frame_idx);
                    self.frames[frame_idx].ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short(frame_idx);
                    if self.peek(0).is_falsey() {
                        self.frames[frame_idx].ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short(frame_idx);
                    self.frames[frame_idx].ip -= offset as usize;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte(frame_idx);
                    let callee = self.peek(arg_count as usize);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Closure => {
                    let function = self
                        .read_constant(frame_idx)
                        .as_obj()
                        .and_then(|obj| obj.as_function())
                        .expect("CLOSURE constant is not a function");
                    let mut closure_ptr = self.heap.alloc_closure(function);
                    let upvalue_count = unsafe { function.as_ref().upvalue_count };
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte(frame_idx) != 0;
                        let index = self.read_byte(frame_idx) as usize;
                        let upvalue = if is_local {
                            let base = self.frames[frame_idx].slot_base;
                            self.capture_upvalue(base + index)
                        } else {
                            unsafe { self.frames[frame_idx].closure.as_ref().upvalues[index] }
                        };
                        unsafe { closure_ptr.as_mut().upvalues.push(upvalue) };
                    }
                    self.push(Value::Obj(ObjRef(closure_ptr.cast())))?;
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frames[frame_idx].slot_base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result)?;
                }
                OpCode::Class => {
                    let name = self
                        .read_constant(frame_idx)
                        .as_obj()
                        .and_then(|obj| obj.as_string())
                        .expect("CLASS constant is not a string");
                    let class = self.heap.alloc_class(name);
                    self.push(Value::Obj(ObjRef(class.cast())))?;
                }
            }
        }
    }

    fn print_trace(&self, frame_idx: usize) {
        print!("          ");
        for value in &self.stack {
            print!("[ {} ]", value);
        }
        println!();
        let frame = &self.frames[frame_idx];
        let chunk = unsafe { &frame.closure.as_ref().function.as_ref().chunk };
        println!("{}", disassemble_instruction(chunk, frame.ip));
    }
}

impl Trace for Vm {
    /// Roots: the operand stack, every frame's closure, every open upvalue,
    /// and the globals table. The compiler's in-progress function chain is
    /// rooted separately by `compiler::Compiler` -- but `compile` (see
    /// `interpret`) passes this `Vm` in as a second tracer alongside the
    /// `Compiler`, because by the time a program compiles, `globals` already
    /// holds the `clock` native registered in `Vm::new`. A compile-time
    /// collection that only marked the compiler's roots would see `clock`
    /// as unreachable and free it out from under `globals`.
    fn mark_roots(&mut self, heap: &mut Heap) {
        for value in &self.stack {
            heap.mark_value(*value);
        }
        for frame in &self.frames {
            heap.mark_object(ObjRef(frame.closure.cast()));
        }
        let mut upvalue = self.open_upvalues;
        while let Some(node) = upvalue {
            heap.mark_object(ObjRef(node.cast()));
            upvalue = unsafe { node.as_ref().next_open };
        }
        for (key, value) in self.globals.iter() {
            heap.mark_object(ObjRef(key.cast()));
            heap.mark_value(value);
        }
    }
}

fn upvalue_get(upvalue: NonNull<ObjUpvalue>) -> Value {
    match unsafe { &upvalue.as_ref().state } {
        UpvalueState::Open(ptr) => unsafe { **ptr },
        UpvalueState::Closed(value) => *value,
    }
}

fn upvalue_set(mut upvalue: NonNull<ObjUpvalue>, value: Value) {
    match unsafe { &mut upvalue.as_mut().state } {
        UpvalueState::Open(ptr) => unsafe { **ptr = value },
        UpvalueState::Closed(slot) => *slot = value,
    }
}

/// Seconds elapsed since this process started running, as a stand-in for
/// CPU time: `std` has no portable CPU-time clock, but wall time since an
/// arbitrary fixed point (here, process start) is at least monotonic and
/// process-relative, unlike seconds-since-epoch.
fn process_start() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

fn native_clock(_args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(process_start().elapsed().as_secs_f64()))
}

/// Debug-only: one line describing the instruction at `offset`, used by the
/// opcode trace (`Vm::with_trace`). Never consulted by normal execution.
fn disassemble_instruction(chunk: &Chunk, offset: usize) -> String {
    let op = OpCode::from_byte(chunk.code[offset]);
    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal
        | OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::GetProperty
        | OpCode::SetProperty
        | OpCode::Call
        | OpCode::Closure
        | OpCode::Class => format!("{:04} {:?} {}", offset, op, chunk.code[offset + 1]),
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => {
            let jump = ((chunk.code[offset + 1] as u16) << 8) | chunk.code[offset + 2] as u16;
            format!("{:04} {:?} {}", offset, op, jump)
        }
        _ => format!("{:04} {:?}", offset, op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Capture(Rc<RefCell<Vec<String>>>);

    impl Output for Capture {
        fn print(&mut self, text: &str) {
            self.0.borrow_mut().push(text.to_string());
        }
    }

    fn run(source: &str) -> Vec<String> {
        let capture = Capture::default();
        let mut vm = Vm::new().with_output(Box::new(capture.clone()));
        vm.interpret(source).expect("program should run successfully");
        capture.0.borrow().clone()
    }

    fn run_stress(source: &str) -> Vec<String> {
        let capture = Capture::default();
        let mut vm = Vm::new().with_stress_gc().with_output(Box::new(capture.clone()));
        vm.interpret(source).expect("program should run successfully");
        capture.0.borrow().clone()
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run("print 1 + 2 * 3;"), vec!["7"]);
    }

    #[test]
    fn equal_strings_are_interned_to_the_same_identity() {
        assert_eq!(run(r#"var a = "hi"; var b = "hi"; print a == b;"#), vec!["true"]);
    }

    #[test]
    fn closures_capture_and_mutate_shared_upvalues() {
        let src = r#"
            fun make() {
                var x = 0;
                fun inc() {
                    x = x + 1;
                    return x;
                }
                return inc;
            }
            var c = make();
            print c();
            print c();
            print c();
        "#;
        assert_eq!(run(src), vec!["1", "2", "3"]);
    }

    #[test]
    fn recursive_fibonacci() {
        let src = "fun fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); } print fib(10);";
        assert_eq!(run(src), vec!["55"]);
    }

    #[test]
    fn uninitialized_variable_is_nil() {
        assert_eq!(run("var x; print x;"), vec!["nil"]);
    }

    #[test]
    fn class_instances_store_fields() {
        let src = "class Pair {} var p = Pair(); p.first = 1; p.second = 2; print p.first + p.second;";
        assert_eq!(run(src), vec!["3"]);
    }

    #[test]
    fn reading_an_undefined_global_is_a_runtime_error() {
        let mut vm = Vm::new();
        match vm.interpret("print undefined_name;") {
            Err(InterpretError::Runtime(err)) => {
                assert!(err.message.contains("Undefined variable 'undefined_name'"));
                assert!(!err.stack_trace.is_empty());
            }
            other => panic!("expected a runtime error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn assigning_an_undefined_global_is_a_runtime_error() {
        let mut vm = Vm::new();
        let result = vm.interpret("x = 1;");
        assert!(matches!(result, Err(InterpretError::Runtime(_))));
    }

    #[test]
    fn stress_gc_does_not_change_observable_output() {
        let src = r#"
            fun fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); }
            for (var i = 0; i < 8; i = i + 1) { print fib(i); }
            class Pair {}
            var p = Pair();
            p.x = "a" + "b";
            print p.x;
        "#;
        assert_eq!(run(src), run_stress(src));
    }

    #[test]
    fn stack_is_empty_after_top_level_script_returns() {
        let capture = Capture::default();
        let mut vm = Vm::new().with_output(Box::new(capture));
        vm.interpret("var a = 1; { var b = 2; } print a;").expect("runs");
        assert_eq!(vm.stack.len(), 0);
    }

    #[test]
    fn concatenation_is_associative_under_interning() {
        let src = r#"
            var ab = "a" + "b";
            var left = ab + "c";
            var right = "a" + ("b" + "c");
            print left == right;
        "#;
        assert_eq!(run(src), vec!["true"]);
    }
}
