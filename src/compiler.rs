// Single-pass Pratt compiler: tokens go straight to bytecode, no AST is ever
// built. A stack of `FunctionState`s tracks the function currently being
// compiled (and its enclosing functions, for upvalue resolution) the same
// way nested scopes are tracked by `scope_depth` within each state.

use std::ptr::NonNull;

use crate::chunk::{Chunk, OpCode};
use crate::error::CompileError;
use crate::memory::{Heap, Trace};
use crate::scanner::{Scanner, Token, TokenKind};
use crate::value::{ObjFunction, ObjRef, ObjString, Value};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src> = fn(&mut Compiler<'src>, &mut Heap, bool);

struct ParseRule<'src> {
    prefix: Option<ParseFn<'src>>,
    infix: Option<ParseFn<'src>>,
    precedence: Precedence,
}

fn get_rule<'src>(kind: TokenKind) -> ParseRule<'src> {
    match kind {
        TokenKind::LeftParen => ParseRule {
            prefix: Some(Compiler::grouping),
            infix: Some(Compiler::call),
            precedence: Precedence::Call,
        },
        TokenKind::Dot => {
            ParseRule { prefix: None, infix: Some(Compiler::dot), precedence: Precedence::Call }
        }
        TokenKind::Minus => ParseRule {
            prefix: Some(Compiler::unary),
            infix: Some(Compiler::binary),
            precedence: Precedence::Term,
        },
        TokenKind::Plus => ParseRule {
            prefix: None,
            infix: Some(Compiler::binary),
            precedence: Precedence::Term,
        },
        TokenKind::Slash | TokenKind::Star => ParseRule {
            prefix: None,
            infix: Some(Compiler::binary),
            precedence: Precedence::Factor,
        },
        TokenKind::Bang => {
            ParseRule { prefix: Some(Compiler::unary), infix: None, precedence: Precedence::None }
        }
        TokenKind::BangEqual | TokenKind::EqualEqual => ParseRule {
            prefix: None,
            infix: Some(Compiler::binary),
            precedence: Precedence::Equality,
        },
        TokenKind::Greater | TokenKind::GreaterEqual | TokenKind::Less | TokenKind::LessEqual => {
            ParseRule {
                prefix: None,
                infix: Some(Compiler::binary),
                precedence: Precedence::Comparison,
            }
        }
        TokenKind::Identifier => ParseRule {
            prefix: Some(Compiler::variable),
            infix: None,
            precedence: Precedence::None,
        },
        TokenKind::String => {
            ParseRule { prefix: Some(Compiler::string), infix: None, precedence: Precedence::None }
        }
        TokenKind::Number => {
            ParseRule { prefix: Some(Compiler::number), infix: None, precedence: Precedence::None }
        }
        TokenKind::And => {
            ParseRule { prefix: None, infix: Some(Compiler::and_), precedence: Precedence::And }
        }
        TokenKind::Or => {
            ParseRule { prefix: None, infix: Some(Compiler::or_), precedence: Precedence::Or }
        }
        TokenKind::False | TokenKind::Nil | TokenKind::True => ParseRule {
            prefix: Some(Compiler::literal),
            infix: None,
            precedence: Precedence::None,
        },
        _ => ParseRule { prefix: None, infix: None, precedence: Precedence::None },
    }
}

#[derive(Clone, Copy)]
struct Local<'src> {
    name: Token<'src>,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

struct FunctionState<'src> {
    function: NonNull<ObjFunction>,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    funcs: Vec<FunctionState<'src>>,
    /// Whatever roots were already live in the caller before this `compile`
    /// call started (the VM's globals/stack/frames, or a no-op tracer in
    /// tests). `compile`'s caller outlives this `Compiler`, so the pointer
    /// stays valid for as long as this struct does -- see `compile`.
    external_roots: NonNull<dyn Trace>,
}

impl<'src> Trace for Compiler<'src> {
    /// The in-progress `ObjFunction`s on the compiler stack aren't yet
    /// reachable from any chunk's constant pool (a function only lands in
    /// its enclosing chunk once `end_compiler` returns), so they need to be
    /// rooted here too.
    fn mark_roots(&mut self, heap: &mut Heap) {
        for state in &self.funcs {
            heap.mark_object(ObjRef(state.function.cast()));
        }
    }
}

pub fn compile(
    source: &str,
    heap: &mut Heap,
    external_roots: &mut dyn Trace,
) -> Result<NonNull<ObjFunction>, Vec<CompileError>> {
    let dummy = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        current: dummy,
        previous: dummy,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        funcs: Vec::new(),
        external_roots: NonNull::from(external_roots),
    };
    compiler.push_function(FunctionKind::Script, None, heap);
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration(heap);
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    let function = compiler.end_compiler();
    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(function)
    }
}

impl<'src> Compiler<'src> {
    fn push_function(&mut self, kind: FunctionKind, name: Option<NonNull<ObjString>>, heap: &mut Heap) {
        let function = heap.alloc_function(name);
        let slot_zero = Token { kind: TokenKind::Identifier, lexeme: "", line: 0 };
        self.funcs.push(FunctionState {
            function,
            kind,
            locals: vec![Local { name: slot_zero, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        });
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        let function = self.funcs.last().unwrap().function;
        unsafe { &mut (*function.as_ptr()).chunk }
    }

    // --- token stream plumbing ---

    /// Checked at the start of every declaration and every precedence climb:
    /// by the time control returns to either entry point, any object the
    /// previous statement or sub-expression allocated is already rooted,
    /// either in the current function's constant pool or (for a freshly
    /// pushed `FunctionState`) on `self.funcs` itself, so a collection
    /// triggered here can't reclaim it.
    ///
    /// A collection here marks roots from two tracers, not one: `self` (the
    /// in-progress function chain) and `external_roots` (the caller's own
    /// roots from before `compile` started, e.g. the VM's `globals` table,
    /// which already holds the `clock` native registered in `Vm::new`).
    /// Marking only `self` would leave those objects looking unreachable.
    fn maybe_collect(&mut self, heap: &mut Heap) {
        if heap.should_collect() {
            let external = self.external_roots;
            // Safety: `external_roots` was built from a live `&mut dyn
            // Trace` in `compile` and that borrow outlives this `Compiler`.
            let external_ref: &mut dyn Trace = unsafe { &mut *external.as_ptr() };
            let mut tracers: [&mut dyn Trace; 2] = [self, external_ref];
            heap.collect(&mut tracers);
        }
    }

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme;
            self.error_at_current(msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.errors.push(CompileError {
            line: token.line,
            location,
            message: message.to_string(),
        });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // --- bytecode emission ---

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = self.current_chunk();
        chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.current_chunk().add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_bytes(OpCode::Constant, index);
    }

    fn identifier_constant(&mut self, heap: &mut Heap, name: &str) -> u8 {
        let s = heap.alloc_string(name.to_string().into_boxed_str());
        self.make_constant(Value::Obj(ObjRef(s.cast())))
    }

    fn end_compiler(&mut self) -> NonNull<ObjFunction> {
        self.emit_return();
        self.funcs.pop().unwrap().function
    }

    // --- scopes & variables ---

    fn begin_scope(&mut self) {
        self.funcs.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = {
            let state = self.funcs.last_mut().unwrap();
            state.scope_depth -= 1;
            state.scope_depth
        };
        loop {
            let should_pop = match self.funcs.last().unwrap().locals.last() {
                Some(local) => local.depth > depth,
                None => false,
            };
            if !should_pop {
                break;
            }
            let is_captured = self.funcs.last().unwrap().locals.last().unwrap().is_captured;
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.funcs.last_mut().unwrap().locals.pop();
        }
    }

    fn add_local(&mut self, name: Token<'src>) {
        let too_many = self.funcs.last().unwrap().locals.len() >= 256;
        if too_many {
            self.error("Too many local variables in function.");
            return;
        }
        self.funcs.last_mut().unwrap().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self) {
        let depth = self.funcs.last().unwrap().scope_depth;
        if depth == 0 {
            return;
        }
        let name = self.previous;
        let mut duplicate = false;
        {
            let locals = &self.funcs.last().unwrap().locals;
            for local in locals.iter().rev() {
                if local.depth != -1 && local.depth < depth {
                    break;
                }
                if local.name.lexeme == name.lexeme {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, heap: &mut Heap, error_msg: &str) -> u8 {
        self.consume(TokenKind::Identifier, error_msg);
        self.declare_variable();
        if self.funcs.last().unwrap().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(heap, name)
    }

    fn mark_initialized(&mut self) {
        let depth = self.funcs.last().unwrap().scope_depth;
        if depth == 0 {
            return;
        }
        let state = self.funcs.last_mut().unwrap();
        let last = state.locals.len() - 1;
        state.locals[last].depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.funcs.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, idx: usize, name: &str) -> Option<u8> {
        let mut found: Option<(usize, bool)> = None;
        {
            let locals = &self.funcs[idx].locals;
            for i in (0..locals.len()).rev() {
                if locals[i].name.lexeme == name {
                    found = Some((i, locals[i].depth == -1));
                    break;
                }
            }
        }
        match found {
            Some((i, uninitialized)) => {
                if uninitialized {
                    self.error("Can't read local variable in its own initializer.");
                }
                Some(i as u8)
            }
            None => None,
        }
    }

    fn resolve_upvalue(&mut self, idx: usize, name: &str) -> Option<u8> {
        if idx == 0 {
            return None;
        }
        let parent = idx - 1;
        if let Some(local) = self.resolve_local(parent, name) {
            self.funcs[parent].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(idx, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(parent, name) {
            return Some(self.add_upvalue(idx, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, idx: usize, index: u8, is_local: bool) -> u8 {
        let existing_count = self.funcs[idx].upvalues.len();
        for i in 0..existing_count {
            let uv = self.funcs[idx].upvalues[i];
            if uv.index == index && uv.is_local == is_local {
                return i as u8;
            }
        }
        if existing_count >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.funcs[idx].upvalues.push(UpvalueDesc { index, is_local });
        let new_count = self.funcs[idx].upvalues.len();
        unsafe {
            (*self.funcs[idx].function.as_ptr()).upvalue_count = new_count;
        }
        (new_count - 1) as u8
    }

    // --- expressions (Pratt parser) ---

    fn parse_precedence(&mut self, heap: &mut Heap, precedence: Precedence) {
        self.maybe_collect(heap);
        self.advance();
        let rule: ParseRule<'src> = get_rule(self.previous.kind);
        let prefix_rule = match rule.prefix {
            Some(f) => f,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix_rule(self, heap, can_assign);

        loop {
            let next_rule: ParseRule<'src> = get_rule(self.current.kind);
            if precedence > next_rule.precedence {
                break;
            }
            self.advance();
            let infix_rule = get_rule::<'src>(self.previous.kind).infix.unwrap();
            infix_rule(self, heap, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self, heap: &mut Heap) {
        self.parse_precedence(heap, Precedence::Assignment);
    }

    fn number(&mut self, _heap: &mut Heap, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, heap: &mut Heap, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let raw = &lexeme[1..lexeme.len() - 1];
        let s = heap.alloc_string(raw.to_string().into_boxed_str());
        self.emit_constant(Value::Obj(ObjRef(s.cast())));
    }

    fn literal(&mut self, _heap: &mut Heap, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self, heap: &mut Heap, _can_assign: bool) {
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(heap, Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule: ParseRule<'src> = get_rule(operator);
        self.parse_precedence(heap, rule.precedence.next());
        match operator {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, heap: &mut Heap, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(heap, Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, heap: &mut Heap, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(heap, Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, heap: &mut Heap, _can_assign: bool) {
        let arg_count = self.argument_list(heap);
        self.emit_bytes(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self, heap: &mut Heap) -> u8 {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression(heap);
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count
    }

    fn dot(&mut self, heap: &mut Heap, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme;
        let constant = self.identifier_constant(heap, name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression(heap);
            self.emit_bytes(OpCode::SetProperty, constant);
        } else {
            self.emit_bytes(OpCode::GetProperty, constant);
        }
    }

    fn named_variable(&mut self, heap: &mut Heap, name: Token<'src>, can_assign: bool) {
        let idx = self.funcs.len() - 1;
        let (get_op, set_op, arg) = if let Some(local) = self.resolve_local(idx, name.lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, local)
        } else if let Some(upvalue) = self.resolve_upvalue(idx, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
        } else {
            let global = self.identifier_constant(heap, name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, global)
        };
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression(heap);
            self.emit_bytes(set_op, arg);
        } else {
            self.emit_bytes(get_op, arg);
        }
    }

    fn variable(&mut self, heap: &mut Heap, can_assign: bool) {
        let name = self.previous;
        self.named_variable(heap, name, can_assign);
    }

    // --- statements & declarations ---

    fn declaration(&mut self, heap: &mut Heap) {
        self.maybe_collect(heap);
        if self.match_token(TokenKind::Class) {
            self.class_declaration(heap);
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration(heap);
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(heap);
        } else {
            self.statement(heap);
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name = self.previous.lexeme;
        let name_constant = self.identifier_constant(heap, name);
        self.declare_variable();
        self.emit_bytes(OpCode::Class, name_constant);
        self.define_variable(name_constant);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
    }

    fn fun_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable(heap, "Expect function name.");
        self.mark_initialized();
        self.function(heap, FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, heap: &mut Heap, kind: FunctionKind) {
        let name = heap.alloc_string(self.previous.lexeme.to_string().into_boxed_str());
        self.push_function(kind, Some(name), heap);
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let overflow =
                    unsafe { (*self.funcs.last().unwrap().function.as_ptr()).arity >= 255 };
                if overflow {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    unsafe {
                        (*self.funcs.last().unwrap().function.as_ptr()).arity += 1;
                    }
                }
                let constant = self.parse_variable(heap, "Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block(heap);

        let upvalues: Vec<UpvalueDesc> = self.funcs.last().unwrap().upvalues.clone();
        let function_ptr = self.end_compiler();
        let constant = self.make_constant(Value::Obj(ObjRef(function_ptr.cast())));
        self.emit_bytes(OpCode::Closure, constant);
        for uv in upvalues {
            self.emit_byte(uv.is_local as u8);
            self.emit_byte(uv.index);
        }
    }

    fn var_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable(heap, "Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression(heap);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self, heap: &mut Heap) {
        if self.match_token(TokenKind::Print) {
            self.print_statement(heap);
        } else if self.match_token(TokenKind::If) {
            self.if_statement(heap);
        } else if self.match_token(TokenKind::While) {
            self.while_statement(heap);
        } else if self.match_token(TokenKind::For) {
            self.for_statement(heap);
        } else if self.match_token(TokenKind::Return) {
            self.return_statement(heap);
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block(heap);
            self.end_scope();
        } else {
            self.expression_statement(heap);
        }
    }

    fn block(&mut self, heap: &mut Heap) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration(heap);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn if_statement(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement(heap);

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement(heap);
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self, heap: &mut Heap) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement(heap);
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self, heap: &mut Heap) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(heap);
        } else {
            self.expression_statement(heap);
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression(heap);
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement(heap);
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self, heap: &mut Heap) {
        if self.funcs.last().unwrap().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stand-in for a VM or other caller with nothing of its own to root;
    /// every test below compiles standalone, with no surrounding `Vm`.
    struct NoRoots;
    impl Trace for NoRoots {
        fn mark_roots(&mut self, _heap: &mut Heap) {}
    }

    #[test]
    fn compiles_a_simple_expression_statement() {
        let mut heap = Heap::new();
        let result = compile("1 + 2;", &mut heap, &mut NoRoots);
        assert!(result.is_ok());
    }

    #[test]
    fn reports_an_error_for_an_unterminated_string() {
        let mut heap = Heap::new();
        let result = compile("\"abc", &mut heap, &mut NoRoots);
        assert!(result.is_err());
        assert!(!result.unwrap_err().is_empty());
    }

    #[test]
    fn compiles_a_function_declaration_with_parameters() {
        let mut heap = Heap::new();
        let result = compile("fun add(a, b) { return a + b; }", &mut heap, &mut NoRoots);
        assert!(result.is_ok());
    }

    #[test]
    fn local_scope_is_popped_after_a_block() {
        let mut heap = Heap::new();
        let result = compile("{ var a = 1; print a; }", &mut heap, &mut NoRoots);
        assert!(result.is_ok());
    }

    #[test]
    fn top_level_return_is_a_compile_error() {
        let mut heap = Heap::new();
        let result = compile("return 1;", &mut heap, &mut NoRoots);
        assert!(result.is_err());
    }

    #[test]
    fn class_declaration_with_empty_body_compiles() {
        let mut heap = Heap::new();
        let result =
            compile("class Point {} var p = Point(); p.x = 1; print p.x;", &mut heap, &mut NoRoots);
        assert!(result.is_ok());
    }

    #[test]
    fn for_loop_and_closures_compile() {
        let mut heap = Heap::new();
        let src = r#"
            fun makeCounter() {
                var i = 0;
                fun count() {
                    i = i + 1;
                    return i;
                }
                return count;
            }
            var counter = makeCounter();
            for (var j = 0; j < 3; j = j + 1) {
                print counter();
            }
        "#;
        let result = compile(src, &mut heap, &mut NoRoots);
        assert!(result.is_ok());
    }

    /// With `stress_gc` forcing a collection at the top of every declaration
    /// and every precedence climb, the only things keeping a function's name,
    /// its nested functions, and its constant-pool strings alive are the
    /// compiler's own roots (`Compiler::mark_roots`) -- this would corrupt
    /// the resulting chunk (or crash) if that root set were wrong.
    #[test]
    fn compiling_under_stress_gc_produces_a_working_chunk() {
        let mut heap = Heap::new();
        heap.stress_gc = true;
        let src = r#"
            fun outer(a, b) {
                var sum = a + b;
                fun inner(c) {
                    return sum + c;
                }
                return inner;
            }
            var hi = "hello" + " " + "world";
            class Widget {}
            var w = Widget();
            w.label = hi;
            print outer(1, 2)(3);
            print w.label;
        "#;
        let result = compile(src, &mut heap, &mut NoRoots);
        assert!(result.is_ok());
    }

    /// The scenario the maintainer flagged: a tracer that roots one string
    /// stands in for "the VM already had something reachable before this
    /// program was compiled" (in `Vm`, that something is the `clock`
    /// native's name in `globals`). A compile-time collection must keep it
    /// alive even though no compiler function ever references it.
    #[test]
    fn compile_time_collection_also_marks_the_callers_external_roots() {
        let mut heap = Heap::new();
        let pinned = heap.alloc_string("pinned-by-caller".to_string().into_boxed_str());
        struct PinsOneString(NonNull<ObjString>);
        impl Trace for PinsOneString {
            fn mark_roots(&mut self, heap: &mut Heap) {
                heap.mark_object(ObjRef(self.0.cast()));
            }
        }
        let mut external = PinsOneString(pinned);
        heap.stress_gc = true;
        let src = "var a = 1; var b = 2; var c = a + b; print c;";
        let result = compile(src, &mut heap, &mut external);
        assert!(result.is_ok());
        let hash = crate::value::fnv1a_hash(b"pinned-by-caller");
        assert!(heap.strings.find_string("pinned-by-caller", hash).is_some());
    }
}
