//! Test utilities for obfusc-core: compact AST builders and a reference
//! interpreter for comparing program behavior before and after a transform.

pub mod builders;
pub mod interpreter;

pub use interpreter::{Interpreter, Value};
