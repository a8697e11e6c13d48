//! Syntax tree and symbol table shared by the parser, the type pass and the
//! code generator.
//!
//! Expressions and statements are separate sum types: expressions carry a
//! type slot filled in by [`crate::ty::Typer`], statements do not. Variable
//! nodes refer to their symbol through a [`VarRef`] index rather than a
//! reference, so the tables can be mutated during frame layout.

use crate::tokenizer::Token;
use crate::ty::Type;

/// Binary operators that survive parsing. `>` and `>=` are rewritten into
/// `Lt`/`Le` with swapped operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
  Div,
  Eq,
  Ne,
  Lt,
  Le,
}

/// Handle to a symbol: an index into the current function's locals or into
/// the program's globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarRef {
  Local(usize),
  Global(usize),
}

#[derive(Debug, Clone)]
pub enum NodeKind {
  Num(i64),
  Neg(Box<Node>),
  Addr(Box<Node>),
  Deref(Box<Node>),
  Binary {
    op: BinaryOp,
    lhs: Box<Node>,
    rhs: Box<Node>,
  },
  Assign {
    lhs: Box<Node>,
    rhs: Box<Node>,
  },
  Var(VarRef),
  FunCall {
    name: String,
    args: Vec<Node>,
  },
}

/// Expression tree produced by the parser.
#[derive(Debug, Clone)]
pub struct Node {
  pub kind: NodeKind,
  pub ty: Option<Type>,
  /// Index of the token that best represents this node in diagnostics.
  pub tok: usize,
}

impl Node {
  fn new(kind: NodeKind, tok: usize) -> Self {
    Self {
      kind,
      ty: None,
      tok,
    }
  }

  pub fn number(value: i64, tok: usize) -> Self {
    Self::new(NodeKind::Num(value), tok)
  }

  pub fn var(var: VarRef, tok: usize) -> Self {
    Self::new(NodeKind::Var(var), tok)
  }

  pub fn unary_neg(operand: Node, tok: usize) -> Self {
    Self::new(NodeKind::Neg(Box::new(operand)), tok)
  }

  pub fn addr(operand: Node, tok: usize) -> Self {
    Self::new(NodeKind::Addr(Box::new(operand)), tok)
  }

  pub fn deref(operand: Node, tok: usize) -> Self {
    Self::new(NodeKind::Deref(Box::new(operand)), tok)
  }

  pub fn binary(op: BinaryOp, lhs: Node, rhs: Node, tok: usize) -> Self {
    Self::new(
      NodeKind::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
      },
      tok,
    )
  }

  pub fn assign(lhs: Node, rhs: Node, tok: usize) -> Self {
    Self::new(
      NodeKind::Assign {
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
      },
      tok,
    )
  }

  pub fn funcall(name: impl Into<String>, args: Vec<Node>, tok: usize) -> Self {
    Self::new(
      NodeKind::FunCall {
        name: name.into(),
        args,
      },
      tok,
    )
  }
}

#[derive(Debug, Clone)]
pub enum Stmt {
  Expr(Node),
  Return(Node),
  Block(Vec<Stmt>),
  If {
    cond: Node,
    then: Box<Stmt>,
    els: Option<Box<Stmt>>,
  },
  /// Both `for` and `while`; a `while` loop has neither `init` nor `inc`.
  For {
    init: Option<Box<Stmt>>,
    cond: Option<Node>,
    inc: Option<Node>,
    body: Box<Stmt>,
  },
}

/// A declared variable, local or global.
#[derive(Debug, Clone)]
pub struct Obj {
  pub name: String,
  pub ty: Type,
  pub is_local: bool,
  /// Offset from `%rbp`; assigned by frame layout, always negative for locals.
  pub offset: i64,
}

impl Obj {
  pub fn local(name: impl Into<String>, ty: Type) -> Self {
    Self {
      name: name.into(),
      ty,
      is_local: true,
      offset: 0,
    }
  }

  pub fn global(name: impl Into<String>, ty: Type) -> Self {
    Self {
      name: name.into(),
      ty,
      is_local: false,
      offset: 0,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Function {
  pub name: String,
  pub ty: Type,
  /// Parameters are the first `params` entries of `locals`.
  pub params: usize,
  /// `None` for a prototype.
  pub body: Option<Stmt>,
  pub locals: Vec<Obj>,
  pub stack_size: i64,
}

impl Function {
  pub fn params(&self) -> &[Obj] {
    &self.locals[..self.params]
  }

  pub fn is_definition(&self) -> bool {
    self.body.is_some()
  }
}

#[derive(Debug, Clone)]
pub enum Global {
  Var(Obj),
  Func(Function),
}

impl Global {
  pub fn name(&self) -> &str {
    match self {
      Self::Var(obj) => &obj.name,
      Self::Func(func) => &func.name,
    }
  }
}

/// A fully parsed and typed translation unit.
#[derive(Debug, Clone)]
pub struct Program {
  pub globals: Vec<Global>,
  /// Tokens referenced by `Node::tok`.
  pub tokens: Vec<Token>,
}

impl Program {
  pub fn functions(&self) -> impl Iterator<Item = &Function> {
    self.globals.iter().filter_map(|global| match global {
      Global::Func(func) => Some(func),
      Global::Var(_) => None,
    })
  }

  pub fn variables(&self) -> impl Iterator<Item = &Obj> {
    self.globals.iter().filter_map(|global| match global {
      Global::Var(obj) => Some(obj),
      Global::Func(_) => None,
    })
  }

  pub fn function(&self, name: &str) -> Option<&Function> {
    self.functions().find(|func| func.name == name)
  }
}

/// Read-only view over the symbols visible from one function body.
#[derive(Debug, Clone, Copy)]
pub struct Symbols<'a> {
  pub locals: &'a [Obj],
  pub globals: &'a [Global],
}

impl<'a> Symbols<'a> {
  pub fn new(locals: &'a [Obj], globals: &'a [Global]) -> Self {
    Self { locals, globals }
  }

  pub fn get(&self, var: VarRef) -> Option<&'a Obj> {
    match var {
      VarRef::Local(index) => self.locals.get(index),
      VarRef::Global(index) => match self.globals.get(index) {
        Some(Global::Var(obj)) => Some(obj),
        _ => None,
      },
    }
  }
}
