//! A tree-less, single-pass compiled bytecode VM for a small dynamically
//! typed scripting language: a Pratt-parsing compiler that emits directly to
//! a flat bytecode buffer (no intermediate AST), a stack-based interpreter
//! with explicit call frames and upvalue-based closures, and a tracing
//! mark-and-sweep collector over an open-addressed string-interning table.

pub mod chunk;
pub mod compiler;
pub mod error;
pub mod memory;
pub mod scanner;
pub mod table;
#[macro_use]
pub mod util;
pub mod value;
pub mod vm;
