// Error types surfaced across the compile/run boundary.
//
// Compilation and execution fail in observably different ways: a compile
// error is a list of positions the scanner/parser couldn't make sense of
// (reporting keeps going after the first one, via synchronization), while
// a runtime error is a single fault with a call stack at the point it
// happened. Two enums, not one, because callers handle them differently:
// `main.rs` maps the first to exit code 65, the second to 70.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub line: i32,
    pub location: String,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[line {}] Error{}: {}", self.line, self.location, self.message)
    }
}

impl std::error::Error for CompileError {}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub message: String,
    /// One formatted line per call frame, innermost first, as produced by
    /// `Vm`'s stack unwind at the point the fault occurred.
    pub stack_trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for line in &self.stack_trace {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_formats_with_line_and_location() {
        let err = CompileError { line: 3, location: " at 'x'".to_string(), message: "bad".to_string() };
        assert_eq!(err.to_string(), "[line 3] Error at 'x': bad");
    }

    #[test]
    fn runtime_error_includes_stack_trace_lines() {
        let err = RuntimeError {
            message: "boom".to_string(),
            stack_trace: vec!["[line 4] in foo()".to_string()],
        };
        assert!(err.to_string().contains("boom"));
        assert!(err.to_string().contains("in foo()"));
    }
}
