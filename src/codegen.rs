//! Code generation: lower the typed program into AT&T x86-64 assembly.
//!
//! The emitter is a simple stack machine around `%rax`: every expression
//! leaves its value in the accumulator, and a binary operator parks its right
//! operand on the stack while the left one is computed. Locals live on the
//! stack frame and are addressed relative to `%rbp`; globals are addressed
//! relative to `%rip`.

use tracing::{debug, instrument};

use crate::ast::{BinaryOp, Function, Global, Node, NodeKind, Program, Stmt, Symbols};
use crate::error::{CompileError, CompileResult};
use crate::ty::Type;

const ARGREG: [&str; 6] = ["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];

/// Lay out every frame, then emit the whole program.
#[instrument(skip_all)]
pub fn codegen(program: &mut Program, source: &str) -> CompileResult<String> {
  assign_lvar_offsets(program, source)?;
  CodeGenerator::new(program, source).generate()
}

/// Round `n` up to the nearest multiple of `align`.
pub fn align_to(n: i64, align: i64) -> i64 {
  (n + align - 1) / align * align
}

/// Largest frame whose `%rbp` displacements still fit a 32-bit immediate.
const MAX_FRAME_SIZE: i64 = i32::MAX as i64 - 15;

/// Give every local a negative `%rbp` offset, parameters first, and size
/// each frame to a multiple of 16 bytes.
pub fn assign_lvar_offsets(program: &mut Program, source: &str) -> CompileResult<()> {
  let Program { globals, tokens } = program;
  for global in globals {
    let Global::Func(func) = global else {
      continue;
    };

    let mut offset: i64 = 0;
    for var in &mut func.locals {
      offset = var
        .ty
        .checked_size()
        .and_then(|size| offset.checked_add(size))
        .filter(|&offset| offset <= MAX_FRAME_SIZE)
        .ok_or_else(|| {
          let loc = var
            .ty
            .decl_token
            .and_then(|tok| tokens.get(tok))
            .map_or(source.len(), |token| token.loc);
          CompileError::codegen(source, loc, format!("stack frame of '{}' too large", func.name))
        })?;
      var.offset = -offset;
    }
    func.stack_size = align_to(offset, 16);
    debug!(name = %func.name, stack_size = func.stack_size, "assigned frame");
  }
  Ok(())
}

/// Emission state for one compilation.
pub struct CodeGenerator<'a> {
  program: &'a Program,
  source: &'a str,
  asm: String,
  /// Values currently pushed on the operand stack.
  depth: i64,
  label_count: usize,
  current_fn: Option<&'a Function>,
}

impl<'a> CodeGenerator<'a> {
  pub fn new(program: &'a Program, source: &'a str) -> Self {
    Self {
      program,
      source,
      asm: String::new(),
      depth: 0,
      label_count: 1,
      current_fn: None,
    }
  }

  /// Emit assembly for every global variable and defined function.
  pub fn generate(mut self) -> CompileResult<String> {
    self.emit_data();
    self.emit_text()?;
    Ok(self.asm)
  }

  fn emit_data(&mut self) {
    let program = self.program;
    for var in program.variables() {
      self.asm.push_str(".data\n");
      self.asm.push_str(&format!(".globl {}\n", var.name));
      self.asm.push_str(&format!("{}:\n", var.name));
      self.asm.push_str(&format!("    .zero {}\n", var.ty.size()));
    }
  }

  fn emit_text(&mut self) -> CompileResult<()> {
    let program = self.program;
    for func in program.functions().filter(|func| func.is_definition()) {
      self.current_fn = Some(func);
      if func.params > ARGREG.len() {
        return Err(self.error_in_fn("too many parameters"));
      }

      self.asm.push_str(&format!(".globl {}\n", func.name));
      self.asm.push_str(".text\n");
      self.asm.push_str(&format!("{}:\n", func.name));

      self.asm.push_str("    push %rbp\n");
      self.asm.push_str("    mov %rsp, %rbp\n");
      if func.stack_size > 0 {
        self.asm.push_str(&format!("    sub ${}, %rsp\n", func.stack_size));
      }

      for (reg, param) in ARGREG.iter().zip(func.params()) {
        self.asm.push_str(&format!("    mov {reg}, {}(%rbp)\n", param.offset));
      }

      if let Some(body) = &func.body {
        self.emit_stmt(body)?;
      }
      self.check_balance()?;

      self.asm.push_str(&format!(".L.return.{}:\n", func.name));
      self.asm.push_str("    mov %rbp, %rsp\n");
      self.asm.push_str("    pop %rbp\n");
      self.asm.push_str("    ret\n");
    }
    Ok(())
  }

  fn count(&mut self) -> usize {
    let label = self.label_count;
    self.label_count += 1;
    label
  }

  fn push(&mut self) {
    self.asm.push_str("    push %rax\n");
    self.depth += 1;
  }

  fn pop(&mut self, reg: &str) {
    self.asm.push_str(&format!("    pop {reg}\n"));
    self.depth -= 1;
  }

  fn check_balance(&self) -> CompileResult<()> {
    if self.depth != 0 {
      return Err(self.error_in_fn(format!("unbalanced stack: depth {}", self.depth)));
    }
    Ok(())
  }

  fn symbols(&self) -> Symbols<'a> {
    let locals = self.current_fn.map_or(&[][..], |func| &func.locals[..]);
    Symbols::new(locals, &self.program.globals)
  }

  fn error(&self, tok: usize, message: impl Into<String>) -> CompileError {
    let loc = self
      .program
      .tokens
      .get(tok)
      .map_or(self.source.len(), |token| token.loc);
    CompileError::codegen(self.source, loc, message)
  }

  /// An error anchored at the name of the function being emitted.
  fn error_in_fn(&self, message: impl Into<String>) -> CompileError {
    let tok = self
      .current_fn
      .and_then(|func| func.ty.decl_token)
      .unwrap_or(usize::MAX);
    self.error(tok, message)
  }

  fn type_of<'n>(&self, node: &'n Node) -> CompileResult<&'n Type> {
    node
      .ty
      .as_ref()
      .ok_or_else(|| self.error(node.tok, "expression has no type"))
  }

  /// Load the value `%rax` points at. An array is left as its address.
  fn load(&mut self, ty: &Type) {
    if ty.is_array() {
      return;
    }
    self.asm.push_str("    mov (%rax), %rax\n");
  }

  /// Store `%rax` at the address on top of the stack.
  fn store(&mut self) {
    self.pop("%rdi");
    self.asm.push_str("    mov %rax, (%rdi)\n");
  }

  /// Compute the address of an lvalue into `%rax`.
  fn emit_addr(&mut self, node: &Node) -> CompileResult<()> {
    match &node.kind {
      NodeKind::Var(var) => {
        let obj = self
          .symbols()
          .get(*var)
          .ok_or_else(|| self.error(node.tok, "undefined variable"))?;
        if obj.is_local {
          self.asm.push_str(&format!("    lea {}(%rbp), %rax\n", obj.offset));
        } else {
          self.asm.push_str(&format!("    lea {}(%rip), %rax\n", obj.name));
        }
        Ok(())
      }
      NodeKind::Deref(operand) => self.emit_expr(operand),
      _ => Err(self.error(node.tok, "not an lvalue")),
    }
  }

  /// Emit code leaving the value of `node` in `%rax`.
  fn emit_expr(&mut self, node: &Node) -> CompileResult<()> {
    match &node.kind {
      NodeKind::Num(value) => {
        self.asm.push_str(&format!("    mov ${value}, %rax\n"));
      }
      NodeKind::Neg(operand) => {
        self.emit_expr(operand)?;
        self.asm.push_str("    neg %rax\n");
      }
      NodeKind::Var(_) => {
        self.emit_addr(node)?;
        let ty = self.type_of(node)?;
        self.load(ty);
      }
      NodeKind::Deref(operand) => {
        self.emit_expr(operand)?;
        let ty = self.type_of(node)?;
        self.load(ty);
      }
      NodeKind::Addr(operand) => self.emit_addr(operand)?,
      NodeKind::Assign { lhs, rhs } => {
        self.emit_addr(lhs)?;
        self.push();
        self.emit_expr(rhs)?;
        self.store();
      }
      NodeKind::FunCall { name, args } => {
        if args.len() > ARGREG.len() {
          return Err(self.error(node.tok, "too many arguments"));
        }

        for arg in args {
          self.emit_expr(arg)?;
          self.push();
        }
        for reg in ARGREG[..args.len()].iter().rev() {
          self.pop(reg);
        }

        // %rsp must be 16-byte aligned at the call instruction.
        let pad = self.depth % 2 != 0;
        if pad {
          self.asm.push_str("    sub $8, %rsp\n");
        }
        self.asm.push_str("    mov $0, %rax\n");
        self.asm.push_str(&format!("    call {name}\n"));
        if pad {
          self.asm.push_str("    add $8, %rsp\n");
        }
      }
      NodeKind::Binary { op, lhs, rhs } => {
        self.emit_expr(rhs)?;
        self.push();
        self.emit_expr(lhs)?;
        self.pop("%rdi");

        match op {
          BinaryOp::Add => self.asm.push_str("    add %rdi, %rax\n"),
          BinaryOp::Sub => self.asm.push_str("    sub %rdi, %rax\n"),
          BinaryOp::Mul => self.asm.push_str("    imul %rdi, %rax\n"),
          BinaryOp::Div => {
            self.asm.push_str("    cqo\n");
            self.asm.push_str("    idiv %rdi\n");
          }
          BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le => {
            let set = match op {
              BinaryOp::Eq => "sete",
              BinaryOp::Ne => "setne",
              BinaryOp::Lt => "setl",
              _ => "setle",
            };
            self.asm.push_str("    cmp %rdi, %rax\n");
            self.asm.push_str(&format!("    {set} %al\n"));
            self.asm.push_str("    movzbl %al, %eax\n");
          }
        }
      }
    }
    Ok(())
  }

  fn emit_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
    match stmt {
      Stmt::If { cond, then, els } => {
        let c = self.count();
        self.emit_expr(cond)?;
        self.asm.push_str("    cmp $0, %rax\n");
        self.asm.push_str(&format!("    je .L.else.{c}\n"));
        self.emit_stmt(then)?;
        self.asm.push_str(&format!("    jmp .L.end.{c}\n"));
        self.asm.push_str(&format!(".L.else.{c}:\n"));
        if let Some(els) = els {
          self.emit_stmt(els)?;
        }
        self.asm.push_str(&format!(".L.end.{c}:\n"));
      }
      Stmt::For {
        init,
        cond,
        inc,
        body,
      } => {
        let c = self.count();
        if let Some(init) = init {
          self.emit_stmt(init)?;
        }
        self.asm.push_str(&format!(".L.begin.{c}:\n"));
        if let Some(cond) = cond {
          self.emit_expr(cond)?;
          self.asm.push_str("    cmp $0, %rax\n");
          self.asm.push_str(&format!("    je .L.end.{c}\n"));
        }
        self.emit_stmt(body)?;
        if let Some(inc) = inc {
          self.emit_expr(inc)?;
        }
        self.asm.push_str(&format!("    jmp .L.begin.{c}\n"));
        self.asm.push_str(&format!(".L.end.{c}:\n"));
      }
      Stmt::Block(body) => {
        for stmt in body {
          self.emit_stmt(stmt)?;
        }
      }
      Stmt::Return(node) => {
        self.emit_expr(node)?;
        let name = self.current_fn.map_or("", |func| func.name.as_str());
        self.asm.push_str(&format!("    jmp .L.return.{name}\n"));
      }
      Stmt::Expr(node) => self.emit_expr(node)?,
    }
    self.check_balance()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::ErrorKind;
  use crate::generate_assembly;
  use crate::parser::parse;
  use crate::tokenizer::tokenize;

  fn laid_out(source: &str) -> Program {
    let mut program = parse(tokenize(source).unwrap(), source).unwrap();
    assign_lvar_offsets(&mut program, source).unwrap();
    program
  }

  #[test]
  fn align_to_rounds_up() {
    assert_eq!(align_to(0, 16), 0);
    assert_eq!(align_to(5, 8), 8);
    assert_eq!(align_to(11, 8), 16);
    assert_eq!(align_to(32, 16), 32);
  }

  #[test]
  fn locals_get_decreasing_offsets_and_an_aligned_frame() {
    let program = laid_out("int main() { int a; int b[3]; int *c; return 0; }");
    let main = program.function("main").unwrap();
    let offsets: Vec<_> = main.locals.iter().map(|obj| obj.offset).collect();
    assert_eq!(offsets, [-8, -32, -40]);
    assert_eq!(main.stack_size, 48);
  }

  #[test]
  fn parameters_occupy_the_first_slots() {
    let program = laid_out("int f(int a, int b) { int c; return a; }");
    let f = program.function("f").unwrap();
    let offsets: Vec<_> = f.params().iter().map(|obj| obj.offset).collect();
    assert_eq!(offsets, [-8, -16]);
    assert_eq!(f.stack_size, 32);

    let asm = generate_assembly("int f(int a, int b) { int c; return a; }").unwrap();
    assert!(asm.contains("    mov %rdi, -8(%rbp)\n    mov %rsi, -16(%rbp)\n"));
  }

  #[test]
  fn function_without_locals_reserves_no_frame() {
    let program = laid_out("int main() { return 0; }");
    assert_eq!(program.function("main").unwrap().stack_size, 0);

    let asm = generate_assembly("int main() { return 0; }").unwrap();
    assert_eq!(
      asm,
      ".globl main\n.text\nmain:\n    push %rbp\n    mov %rsp, %rbp\n    mov $0, %rax\n    jmp .L.return.main\n.L.return.main:\n    mov %rbp, %rsp\n    pop %rbp\n    ret\n"
    );
  }

  #[test]
  fn globals_are_zero_filled_data() {
    let asm = generate_assembly("int g; int arr[4]; int main() { return g; }").unwrap();
    assert!(asm.starts_with(".data\n.globl g\ng:\n    .zero 8\n.data\n.globl arr\narr:\n    .zero 32\n"));
    assert!(asm.contains("    lea g(%rip), %rax\n    mov (%rax), %rax\n"));
  }

  #[test]
  fn arrays_evaluate_to_their_address() {
    let asm = generate_assembly("int main() { int a[2]; int *p; p = a; return 0; }").unwrap();
    assert!(asm.contains("    lea -16(%rbp), %rax\n    pop %rdi\n    mov %rax, (%rdi)\n"));
  }

  #[test]
  fn labels_share_one_counter() {
    let asm = generate_assembly(
      "int main() { int i; if (1) i = 1; else i = 2; while (i) i = i - 1; if (i) return 1; return 0; }",
    )
    .unwrap();
    for label in [
      ".L.else.1:",
      ".L.end.1:",
      ".L.begin.2:",
      ".L.end.2:",
      ".L.else.3:",
      ".L.end.3:",
    ] {
      assert_eq!(asm.matches(&format!("{label}\n")).count(), 1, "{label}");
    }
  }

  #[test]
  fn comparisons_set_a_flag_byte() {
    let asm = generate_assembly("int main() { return 1 < 2; }").unwrap();
    assert!(asm.contains("    cmp %rdi, %rax\n    setl %al\n    movzbl %al, %eax\n"));
  }

  #[test]
  fn call_arguments_fill_registers_in_order() {
    let asm = generate_assembly("int main() { return add(1, 2, 3); }").unwrap();
    assert!(asm.contains(
      "    pop %rdx\n    pop %rsi\n    pop %rdi\n    mov $0, %rax\n    call add\n"
    ));
  }

  #[test]
  fn calls_are_padded_when_the_stack_is_odd() {
    let asm = generate_assembly("int main() { return f() + 1; }").unwrap();
    assert!(asm.contains("    sub $8, %rsp\n    mov $0, %rax\n    call f\n    add $8, %rsp\n"));

    let asm = generate_assembly("int main() { return 1 + f(); }").unwrap();
    assert!(!asm.contains("sub $8, %rsp"));
  }

  #[test]
  fn prototypes_emit_nothing() {
    let asm = generate_assembly("int f(); int main() { return f(); }").unwrap();
    assert!(!asm.contains("f:\n"));
    assert!(asm.contains("main:\n"));
  }

  #[test]
  fn output_is_deterministic() {
    let source = "int g; int f(int x) { if (x) return g; return 0; } int main() { for (g = 0; g < 3; g = g + 1) f(g); return g; }";
    assert_eq!(
      generate_assembly(source).unwrap(),
      generate_assembly(source).unwrap()
    );
  }

  #[test]
  fn non_lvalues_cannot_be_addressed() {
    let err = generate_assembly("int main() { 1 = 2; return 0; }").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Codegen);
    assert_eq!(err.message(), "not an lvalue");

    let err = generate_assembly("int main() { int a; return &(a + 1); }").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Codegen);
  }

  #[test]
  fn more_than_six_arguments_is_rejected() {
    let err = generate_assembly("int main() { return f(1, 2, 3, 4, 5, 6, 7); }").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Codegen);
    assert_eq!(err.message(), "too many arguments");

    let err =
      generate_assembly("int f(int a, int b, int c, int d, int e, int g, int h) { return a; }")
        .unwrap_err();
    assert_eq!(err.message(), "too many parameters");
  }

  #[test]
  fn frames_beyond_32_bit_displacements_are_rejected() {
    let err =
      generate_assembly("int main() { int a[200000000]; int b[200000000]; return 0; }").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Codegen);
    assert_eq!(err.message(), "stack frame of 'main' too large");
    assert!(err.to_string().starts_with("1:36: "), "{err}");

    let program = laid_out("int main() { int a[200000000]; return 0; }");
    assert_eq!(program.function("main").unwrap().stack_size, 1_600_000_000);
  }
}
