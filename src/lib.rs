//! Crate root: wires together the compilation pipeline.
//!
//! The stages are small and composable so they can be evolved independently:
//! - `tokenizer` performs lexical analysis and produces a flat token stream.
//! - `parser` owns all syntactic knowledge and builds the symbol tables,
//!   typing each statement through `ty` as it goes.
//! - `codegen` lays out stack frames and lowers the program into x86-64 AT&T
//!   assembly.
//! - `error` centralises reporting utilities shared by the other modules.

pub mod ast;
pub mod codegen;
pub mod error;
pub mod parser;
pub mod tokenizer;
pub mod ty;

use tracing::instrument;

pub use error::{CompileError, CompileResult, ErrorKind};

/// Compile a source string into AT&T assembly.
#[instrument(skip_all, fields(len = source.len()))]
pub fn generate_assembly(source: &str) -> CompileResult<String> {
  let tokens = tokenizer::tokenize(source)?;
  let mut program = parser::parse(tokens, source)?;
  codegen::codegen(&mut program, source)
}
