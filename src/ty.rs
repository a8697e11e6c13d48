//! Type model and the bottom-up type inference pass.
//!
//! Types are small owned trees. Two types compare equal when their shapes
//! match; the declaration token they may carry is ignored.

use tracing::trace;

use crate::ast::{BinaryOp, Node, NodeKind, Stmt, Symbols};
use crate::error::{CompileError, CompileResult};
use crate::tokenizer::Token;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
  Int,
  Ptr(Box<Type>),
  Array { base: Box<Type>, len: usize },
  Func { ret: Box<Type>, params: Vec<Type> },
}

#[derive(Debug, Clone)]
pub struct Type {
  pub kind: TypeKind,
  /// Token naming the declared entity, if this type came from a declarator.
  pub decl_token: Option<usize>,
}

impl PartialEq for Type {
  fn eq(&self, other: &Self) -> bool {
    self.kind == other.kind
  }
}

impl Eq for Type {}

impl Type {
  fn new(kind: TypeKind) -> Self {
    Self {
      kind,
      decl_token: None,
    }
  }

  pub fn int() -> Self {
    Self::new(TypeKind::Int)
  }

  pub fn pointer_to(base: Type) -> Self {
    Self::new(TypeKind::Ptr(Box::new(base)))
  }

  pub fn array_of(base: Type, len: usize) -> Self {
    Self::new(TypeKind::Array {
      base: Box::new(base),
      len,
    })
  }

  /// A function type with no parameters yet; the parser appends them.
  pub fn func_type(ret: Type) -> Self {
    Self::new(TypeKind::Func {
      ret: Box::new(ret),
      params: Vec::new(),
    })
  }

  pub fn with_decl_token(mut self, token: usize) -> Self {
    self.decl_token = Some(token);
    self
  }

  pub fn is_integer(&self) -> bool {
    matches!(self.kind, TypeKind::Int)
  }

  pub fn is_pointer(&self) -> bool {
    matches!(self.kind, TypeKind::Ptr(_))
  }

  pub fn is_array(&self) -> bool {
    matches!(self.kind, TypeKind::Array { .. })
  }

  pub fn is_func(&self) -> bool {
    matches!(self.kind, TypeKind::Func { .. })
  }

  /// Element type of a pointer or array.
  pub fn base(&self) -> Option<&Type> {
    match &self.kind {
      TypeKind::Ptr(base) | TypeKind::Array { base, .. } => Some(base),
      TypeKind::Int | TypeKind::Func { .. } => None,
    }
  }

  pub fn params(&self) -> &[Type] {
    match &self.kind {
      TypeKind::Func { params, .. } => params,
      _ => &[],
    }
  }

  /// Size in bytes, or `None` when an array is too large to address.
  pub fn checked_size(&self) -> Option<i64> {
    match &self.kind {
      TypeKind::Int | TypeKind::Ptr(_) | TypeKind::Func { .. } => Some(8),
      TypeKind::Array { base, len } => base
        .checked_size()?
        .checked_mul(i64::try_from(*len).ok()?),
    }
  }

  /// Size in bytes. The parser rejects arrays whose size overflows, so this
  /// only saturates for hand-built types.
  pub fn size(&self) -> i64 {
    self.checked_size().unwrap_or(i64::MAX)
  }
}

pub fn pointer_to(base: Type) -> Type {
  Type::pointer_to(base)
}

pub fn array_of(base: Type, len: usize) -> Type {
  Type::array_of(base, len)
}

pub fn func_type(ret: Type) -> Type {
  Type::func_type(ret)
}

/// Assigns types to expression trees and performs pointer-arithmetic
/// rewriting. Borrowed views only; the typer owns no state of its own.
pub struct Typer<'a> {
  symbols: Symbols<'a>,
  tokens: &'a [Token],
  source: &'a str,
}

impl<'a> Typer<'a> {
  pub fn new(symbols: Symbols<'a>, tokens: &'a [Token], source: &'a str) -> Self {
    Self {
      symbols,
      tokens,
      source,
    }
  }

  fn error(&self, tok: usize, message: &str) -> CompileError {
    let loc = self.tokens.get(tok).map_or(self.source.len(), |t| t.loc);
    CompileError::ty(self.source, loc, message)
  }

  pub fn type_of<'n>(&self, node: &'n Node) -> CompileResult<&'n Type> {
    node
      .ty
      .as_ref()
      .ok_or_else(|| self.error(node.tok, "expression has no type"))
  }

  /// Type `node` and everything below it. Nodes that already carry a type
  /// are left untouched.
  pub fn add_type(&self, node: &mut Node) -> CompileResult<()> {
    if node.ty.is_some() {
      return Ok(());
    }

    match &mut node.kind {
      NodeKind::Num(_) | NodeKind::Var(_) => {}
      NodeKind::Neg(operand) | NodeKind::Addr(operand) | NodeKind::Deref(operand) => {
        self.add_type(operand)?;
      }
      NodeKind::Binary { lhs, rhs, .. } | NodeKind::Assign { lhs, rhs } => {
        self.add_type(lhs)?;
        self.add_type(rhs)?;
      }
      NodeKind::FunCall { args, .. } => {
        for arg in args {
          self.add_type(arg)?;
        }
      }
    }

    let ty = match &node.kind {
      NodeKind::Num(_) | NodeKind::FunCall { .. } => Type::int(),
      NodeKind::Binary { op, lhs, .. } => match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
          self.type_of(lhs)?.clone()
        }
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le => Type::int(),
      },
      NodeKind::Neg(operand) => self.type_of(operand)?.clone(),
      NodeKind::Assign { lhs, .. } => {
        let ty = self.type_of(lhs)?;
        if ty.is_array() {
          return Err(self.error(node.tok, "not an lvalue"));
        }
        ty.clone()
      }
      NodeKind::Var(var) => self
        .symbols
        .get(*var)
        .map(|obj| obj.ty.clone())
        .ok_or_else(|| self.error(node.tok, "undefined variable"))?,
      NodeKind::Addr(operand) => {
        let ty = self.type_of(operand)?;
        match &ty.kind {
          TypeKind::Array { base, .. } => pointer_to(base.as_ref().clone()),
          _ => pointer_to(ty.clone()),
        }
      }
      NodeKind::Deref(operand) => self
        .type_of(operand)?
        .base()
        .cloned()
        .ok_or_else(|| self.error(node.tok, "invalid pointer dereference"))?,
    };

    trace!(tok = node.tok, ?ty, "typed node");
    node.ty = Some(ty);
    Ok(())
  }

  /// Type every expression contained in a statement.
  pub fn add_type_stmt(&self, stmt: &mut Stmt) -> CompileResult<()> {
    match stmt {
      Stmt::Expr(node) | Stmt::Return(node) => self.add_type(node),
      Stmt::Block(body) => body.iter_mut().try_for_each(|stmt| self.add_type_stmt(stmt)),
      Stmt::If { cond, then, els } => {
        self.add_type(cond)?;
        self.add_type_stmt(then)?;
        if let Some(els) = els {
          self.add_type_stmt(els)?;
        }
        Ok(())
      }
      Stmt::For {
        init,
        cond,
        inc,
        body,
      } => {
        if let Some(init) = init {
          self.add_type_stmt(init)?;
        }
        if let Some(cond) = cond {
          self.add_type(cond)?;
        }
        if let Some(inc) = inc {
          self.add_type(inc)?;
        }
        self.add_type_stmt(body)
      }
    }
  }

  /// `lhs + rhs`, scaling the integer operand when the other side is a
  /// pointer or array.
  pub fn new_add(&self, mut lhs: Node, mut rhs: Node, tok: usize) -> CompileResult<Node> {
    self.add_type(&mut lhs)?;
    self.add_type(&mut rhs)?;

    let (lty, rty) = (self.type_of(&lhs)?, self.type_of(&rhs)?);
    if lty.is_integer() && rty.is_integer() {
      return Ok(Node::binary(BinaryOp::Add, lhs, rhs, tok));
    }
    if lty.base().is_some() && rty.base().is_some() {
      return Err(self.error(tok, "invalid operands"));
    }

    // Canonicalize `num + ptr` to `ptr + num`.
    if lty.base().is_none() && rty.base().is_some() {
      std::mem::swap(&mut lhs, &mut rhs);
    }

    let elem_size = self.type_of(&lhs)?.base().map(Type::size);
    let (Some(elem_size), true) = (elem_size, self.type_of(&rhs)?.is_integer()) else {
      return Err(self.error(tok, "invalid operands"));
    };

    let scaled = Node::binary(BinaryOp::Mul, rhs, Node::number(elem_size, tok), tok);
    Ok(Node::binary(BinaryOp::Add, lhs, scaled, tok))
  }

  /// `lhs - rhs`. Pointer minus pointer yields the element count between
  /// them.
  pub fn new_sub(&self, mut lhs: Node, mut rhs: Node, tok: usize) -> CompileResult<Node> {
    self.add_type(&mut lhs)?;
    self.add_type(&mut rhs)?;

    let (lty, rty) = (self.type_of(&lhs)?, self.type_of(&rhs)?);
    if lty.is_integer() && rty.is_integer() {
      return Ok(Node::binary(BinaryOp::Sub, lhs, rhs, tok));
    }

    if let Some(base) = lty.base()
      && rty.is_integer()
    {
      let scaled = Node::binary(BinaryOp::Mul, rhs, Node::number(base.size(), tok), tok);
      return Ok(Node::binary(BinaryOp::Sub, lhs, scaled, tok));
    }

    if let Some(base) = lty.base()
      && rty.base().is_some()
    {
      let elem_size = base.size();
      let mut diff = Node::binary(BinaryOp::Sub, lhs, rhs, tok);
      diff.ty = Some(Type::int());
      return Ok(Node::binary(
        BinaryOp::Div,
        diff,
        Node::number(elem_size, tok),
        tok,
      ));
    }

    Err(self.error(tok, "invalid operands"))
  }
}
