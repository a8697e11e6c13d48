//! Recursive-descent parser producing a typed program.
//!
//! The parser mirrors the classic chibicc structure: one method per grammar
//! production, a precedence-climbing set of helpers for expressions, and a
//! symbol table built as declarations are seen. Every statement is typed as
//! soon as it is complete, and `+`/`-` go through the pointer-arithmetic
//! rewriting in [`crate::ty::Typer`].
//!
//! ```text
//! program       = (declspec (function | global-vars))*
//! function      = declarator ("{" compound-stmt | ";")
//! global-vars   = declarator ("," declarator)* ";"
//! declspec      = "int"
//! declarator    = "*"* ident type-suffix
//! type-suffix   = "(" func-params | "[" num "]" type-suffix | ε
//! func-params   = (param ("," param)*)? ")"
//! param         = declspec declarator
//! compound-stmt = stmt* "}"
//! stmt          = "return" expr ";"
//!               | "if" "(" expr ")" stmt ("else" stmt)?
//!               | "for" "(" expr-stmt expr? ";" expr? ")" stmt
//!               | "while" "(" expr ")" stmt
//!               | "{" compound-stmt
//!               | declaration
//!               | expr-stmt
//! declaration   = declspec (declarator ("=" assign)? ("," declarator ("=" assign)?)*)? ";"
//! expr-stmt     = expr? ";"
//! expr          = assign
//! assign        = equality ("=" assign)?
//! equality      = relational ("==" relational | "!=" relational)*
//! relational    = add ("<" add | "<=" add | ">" add | ">=" add)*
//! add           = mul ("+" mul | "-" mul)*
//! mul           = unary ("*" unary | "/" unary)*
//! unary         = ("+" | "-" | "*" | "&") unary | "sizeof" unary | primary
//! primary       = "(" expr ")" | ident ("(" func-args)? | num
//! func-args     = (assign ("," assign)*)? ")"
//! ```

use tracing::{debug, instrument, trace};

use crate::ast::{BinaryOp, Function, Global, Node, Obj, Program, Stmt, Symbols, VarRef};
use crate::error::{CompileError, CompileResult};
use crate::tokenizer::{Token, TokenKind, describe};
use crate::ty::{Type, TypeKind, Typer, array_of, func_type, pointer_to};

const KEYWORDS: [&str; 7] = ["return", "if", "else", "for", "while", "int", "sizeof"];

/// Parse a whole translation unit.
#[instrument(skip_all)]
pub fn parse(tokens: Vec<Token>, source: &str) -> CompileResult<Program> {
  Parser::new(tokens, source).program()
}

/// Owns the token cursor and the symbol tables while a translation unit is
/// being parsed.
pub struct Parser<'a> {
  stream: TokenStream<'a>,
  /// Locals of the function being parsed, in declaration order.
  locals: Vec<Obj>,
  globals: Vec<Global>,
}

impl<'a> Parser<'a> {
  pub fn new(tokens: Vec<Token>, source: &'a str) -> Self {
    Self {
      stream: TokenStream::new(tokens, source),
      locals: Vec::new(),
      globals: Vec::new(),
    }
  }

  fn typer(&self) -> Typer<'_> {
    Typer::new(
      Symbols::new(&self.locals, &self.globals),
      &self.stream.tokens,
      self.stream.source,
    )
  }

  pub fn program(mut self) -> CompileResult<Program> {
    while !self.stream.is_eof() {
      let basety = self.declspec()?;
      if self.is_function(&basety)? {
        self.function(basety)?;
      } else {
        self.global_variables(basety)?;
      }
    }

    debug!(globals = self.globals.len(), "parsed program");
    Ok(Program {
      globals: self.globals,
      tokens: self.stream.tokens,
    })
  }

  /// Look ahead over a declarator to decide between a function and a list
  /// of global variables, then rewind.
  fn is_function(&mut self, basety: &Type) -> CompileResult<bool> {
    if self.stream.is(";") {
      return Ok(false);
    }

    let start = self.stream.pos;
    let ty = self.declarator(basety.clone());
    self.stream.pos = start;
    Ok(ty?.is_func())
  }

  fn function(&mut self, basety: Type) -> CompileResult<()> {
    let ty = self.declarator(basety)?;
    let name_tok = ty.decl_token.unwrap_or(self.stream.pos);
    let name = self.stream.text(name_tok).to_string();

    self.locals = Vec::new();
    for param in ty.params() {
      let tok = param.decl_token.unwrap_or(name_tok);
      let param_name = self.stream.text(tok).to_string();
      self.declare_local(param_name, param.clone(), tok)?;
    }
    let params = self.locals.len();

    let body = if self.stream.equal(";") {
      None
    } else {
      self.stream.skip("{")?;
      Some(self.compound_stmt()?)
    };

    let func = Function {
      name,
      ty,
      params,
      body,
      locals: std::mem::take(&mut self.locals),
      stack_size: 0,
    };
    debug!(
      name = %func.name,
      params,
      locals = func.locals.len(),
      definition = func.is_definition(),
      "parsed function"
    );
    self.declare_function(func, name_tok)
  }

  fn global_variables(&mut self, basety: Type) -> CompileResult<()> {
    let mut first = true;
    while !self.stream.equal(";") {
      if !first {
        self.stream.skip(",")?;
      }
      first = false;

      let ty = self.declarator(basety.clone())?;
      let tok = ty.decl_token.unwrap_or(self.stream.pos);
      if ty.is_func() {
        return Err(self.stream.error_at(tok, "unexpected function declarator"));
      }
      let name = self.stream.text(tok).to_string();
      self.declare_global(name, ty, tok)?;
    }
    Ok(())
  }

  fn declspec(&mut self) -> CompileResult<Type> {
    self.stream.skip("int")?;
    Ok(Type::int())
  }

  fn declarator(&mut self, mut ty: Type) -> CompileResult<Type> {
    while self.stream.equal("*") {
      ty = pointer_to(ty);
    }

    let (_, tok) = self.stream.get_ident()?;
    let ty = self.type_suffix(ty)?;
    Ok(ty.with_decl_token(tok))
  }

  fn type_suffix(&mut self, ty: Type) -> CompileResult<Type> {
    if self.stream.equal("(") {
      return self.func_params(ty);
    }

    if self.stream.equal("[") {
      let (len, tok) = self.stream.get_number()?;
      let len = usize::try_from(len)
        .map_err(|_| self.stream.error_at(tok, "invalid array length"))?;
      self.stream.skip("]")?;
      let base = self.type_suffix(ty)?;
      let array = array_of(base, len);
      if array.checked_size().is_none() {
        return Err(self.stream.error_at(tok, "array too large"));
      }
      return Ok(array);
    }

    Ok(ty)
  }

  fn func_params(&mut self, ret: Type) -> CompileResult<Type> {
    let mut params = Vec::new();
    while !self.stream.equal(")") {
      if !params.is_empty() {
        self.stream.skip(",")?;
      }
      let basety = self.declspec()?;
      let ty = self.declarator(basety)?;
      params.push(adjust_param(ty));
    }

    let mut ty = func_type(ret);
    if let TypeKind::Func { params: slot, .. } = &mut ty.kind {
      *slot = params;
    }
    Ok(ty)
  }

  fn declare_local(&mut self, name: String, ty: Type, tok: usize) -> CompileResult<VarRef> {
    if self.locals.iter().any(|obj| obj.name == name) {
      return Err(
        self
          .stream
          .error_at(tok, format!("redefinition of '{name}'")),
      );
    }

    trace!(%name, ?ty, "declared local");
    self.locals.push(Obj::local(name, ty));
    Ok(VarRef::Local(self.locals.len() - 1))
  }

  fn declare_global(&mut self, name: String, ty: Type, tok: usize) -> CompileResult<()> {
    if self.globals.iter().any(|global| global.name() == name) {
      return Err(
        self
          .stream
          .error_at(tok, format!("redefinition of '{name}'")),
      );
    }

    trace!(%name, ?ty, "declared global");
    self.globals.push(Global::Var(Obj::global(name, ty)));
    Ok(())
  }

  /// Record a function. A prototype may be completed by one later
  /// definition with the same type.
  fn declare_function(&mut self, func: Function, tok: usize) -> CompileResult<()> {
    let Some(index) = self
      .globals
      .iter()
      .position(|global| global.name() == func.name)
    else {
      self.globals.push(Global::Func(func));
      return Ok(());
    };

    let existing = match &self.globals[index] {
      Global::Func(existing) => Some((existing.ty == func.ty, existing.is_definition())),
      Global::Var(_) => None,
    };

    match existing {
      Some((false, _)) => Err(
        self
          .stream
          .error_at(tok, format!("conflicting types for '{}'", func.name)),
      ),
      Some((true, false)) => {
        if func.is_definition() {
          self.globals[index] = Global::Func(func);
        }
        Ok(())
      }
      Some((true, true)) if !func.is_definition() => Ok(()),
      _ => Err(
        self
          .stream
          .error_at(tok, format!("redefinition of '{}'", func.name)),
      ),
    }
  }

  /// Locals first, most recent declaration wins; then global variables.
  fn find_var(&self, name: &str) -> Option<VarRef> {
    if let Some(index) = self.locals.iter().rposition(|obj| obj.name == name) {
      return Some(VarRef::Local(index));
    }

    self
      .globals
      .iter()
      .position(|global| matches!(global, Global::Var(obj) if obj.name == name))
      .map(VarRef::Global)
  }

  /// Parse a statement and type it.
  fn stmt(&mut self) -> CompileResult<Stmt> {
    let mut stmt = self.parse_stmt()?;
    self.typer().add_type_stmt(&mut stmt)?;
    Ok(stmt)
  }

  fn parse_stmt(&mut self) -> CompileResult<Stmt> {
    if self.stream.equal("return") {
      let node = self.expr()?;
      self.stream.skip(";")?;
      return Ok(Stmt::Return(node));
    }

    if self.stream.equal("if") {
      self.stream.skip("(")?;
      let cond = self.expr()?;
      self.stream.skip(")")?;
      let then = Box::new(self.stmt()?);
      let els = if self.stream.equal("else") {
        Some(Box::new(self.stmt()?))
      } else {
        None
      };
      return Ok(Stmt::If { cond, then, els });
    }

    if self.stream.equal("for") {
      self.stream.skip("(")?;
      let init = Some(Box::new(self.expr_stmt()?));

      let cond = if self.stream.equal(";") {
        None
      } else {
        let cond = self.expr()?;
        self.stream.skip(";")?;
        Some(cond)
      };

      let inc = if self.stream.equal(")") {
        None
      } else {
        let inc = self.expr()?;
        self.stream.skip(")")?;
        Some(inc)
      };

      let body = Box::new(self.stmt()?);
      return Ok(Stmt::For {
        init,
        cond,
        inc,
        body,
      });
    }

    if self.stream.equal("while") {
      self.stream.skip("(")?;
      let cond = self.expr()?;
      self.stream.skip(")")?;
      let body = Box::new(self.stmt()?);
      return Ok(Stmt::For {
        init: None,
        cond: Some(cond),
        inc: None,
        body,
      });
    }

    if self.stream.equal("{") {
      return self.compound_stmt();
    }

    if self.stream.is("int") {
      return self.declaration();
    }

    self.expr_stmt()
  }

  fn compound_stmt(&mut self) -> CompileResult<Stmt> {
    let mut body = Vec::new();
    while !self.stream.equal("}") {
      body.push(self.stmt()?);
    }
    Ok(Stmt::Block(body))
  }

  /// A declaration becomes a block of assignments, one per initializer.
  fn declaration(&mut self) -> CompileResult<Stmt> {
    let basety = self.declspec()?;
    let mut body = Vec::new();
    let mut first = true;

    while !self.stream.equal(";") {
      if !first {
        self.stream.skip(",")?;
      }
      first = false;

      let ty = self.declarator(basety.clone())?;
      let tok = ty.decl_token.unwrap_or(self.stream.pos);
      if ty.is_func() {
        return Err(self.stream.error_at(tok, "unexpected function declarator"));
      }
      let name = self.stream.text(tok).to_string();
      let var = self.declare_local(name, ty, tok)?;

      let assign_tok = self.stream.pos;
      if !self.stream.equal("=") {
        continue;
      }
      let rhs = self.assign()?;
      let node = Node::assign(Node::var(var, tok), rhs, assign_tok);
      body.push(Stmt::Expr(node));
    }

    Ok(Stmt::Block(body))
  }

  fn expr_stmt(&mut self) -> CompileResult<Stmt> {
    if self.stream.equal(";") {
      return Ok(Stmt::Block(Vec::new()));
    }

    let node = self.expr()?;
    self.stream.skip(";")?;
    Ok(Stmt::Expr(node))
  }

  fn expr(&mut self) -> CompileResult<Node> {
    self.assign()
  }

  fn assign(&mut self) -> CompileResult<Node> {
    let node = self.equality()?;

    let tok = self.stream.pos;
    if self.stream.equal("=") {
      let rhs = self.assign()?;
      return Ok(Node::assign(node, rhs, tok));
    }

    Ok(node)
  }

  fn equality(&mut self) -> CompileResult<Node> {
    let mut node = self.relational()?;

    loop {
      let tok = self.stream.pos;
      let op = match self.stream.peek_punct() {
        Some("==") => BinaryOp::Eq,
        Some("!=") => BinaryOp::Ne,
        _ => break,
      };

      self.stream.pos += 1;
      let rhs = self.relational()?;
      node = Node::binary(op, node, rhs, tok);
    }

    Ok(node)
  }

  fn relational(&mut self) -> CompileResult<Node> {
    let mut node = self.add()?;

    loop {
      let tok = self.stream.pos;
      let op_str = match self.stream.peek_punct() {
        Some(symbol @ ("<" | "<=" | ">" | ">=")) => symbol,
        _ => break,
      };

      self.stream.pos += 1;
      let rhs = self.add()?;
      node = match op_str {
        "<" => Node::binary(BinaryOp::Lt, node, rhs, tok),
        "<=" => Node::binary(BinaryOp::Le, node, rhs, tok),
        ">" => Node::binary(BinaryOp::Lt, rhs, node, tok),
        ">=" => Node::binary(BinaryOp::Le, rhs, node, tok),
        _ => unreachable!(),
      };
    }

    Ok(node)
  }

  fn add(&mut self) -> CompileResult<Node> {
    let mut node = self.mul()?;

    loop {
      let tok = self.stream.pos;
      let op_str = match self.stream.peek_punct() {
        Some(symbol @ ("+" | "-")) => symbol,
        _ => break,
      };

      self.stream.pos += 1;
      let rhs = self.mul()?;
      node = match op_str {
        "+" => self.typer().new_add(node, rhs, tok)?,
        "-" => self.typer().new_sub(node, rhs, tok)?,
        _ => unreachable!(),
      };
    }

    Ok(node)
  }

  fn mul(&mut self) -> CompileResult<Node> {
    let mut node = self.unary()?;

    loop {
      let tok = self.stream.pos;
      let op = match self.stream.peek_punct() {
        Some("*") => BinaryOp::Mul,
        Some("/") => BinaryOp::Div,
        _ => break,
      };

      self.stream.pos += 1;
      let rhs = self.unary()?;
      node = Node::binary(op, node, rhs, tok);
    }

    Ok(node)
  }

  fn unary(&mut self) -> CompileResult<Node> {
    let tok = self.stream.pos;

    if self.stream.equal("+") {
      return self.unary();
    }

    if self.stream.equal("-") {
      let operand = self.unary()?;
      return Ok(Node::unary_neg(operand, tok));
    }

    if self.stream.equal("*") {
      let operand = self.unary()?;
      return Ok(Node::deref(operand, tok));
    }

    if self.stream.equal("&") {
      let operand = self.unary()?;
      return Ok(Node::addr(operand, tok));
    }

    if self.stream.equal("sizeof") {
      let mut operand = self.unary()?;
      let typer = self.typer();
      typer.add_type(&mut operand)?;
      let size = typer.type_of(&operand)?.size();
      return Ok(Node::number(size, tok));
    }

    self.primary()
  }

  fn primary(&mut self) -> CompileResult<Node> {
    if self.stream.equal("(") {
      let node = self.expr()?;
      self.stream.skip(")")?;
      return Ok(node);
    }

    let tok = self.stream.pos;
    let kind = self.stream.peek().map(|token| token.kind);

    if kind == Some(TokenKind::Ident) && !self.stream.is_keyword(tok) {
      let name = self.stream.text(tok).to_string();
      self.stream.pos += 1;

      if self.stream.equal("(") {
        return self.funcall(name, tok);
      }

      let var = self
        .find_var(&name)
        .ok_or_else(|| self.stream.error_at(tok, "undefined variable"))?;
      return Ok(Node::var(var, tok));
    }

    if kind == Some(TokenKind::Num) {
      let (value, tok) = self.stream.get_number()?;
      return Ok(Node::number(value, tok));
    }

    let got = describe(self.stream.peek(), self.stream.source);
    Err(
      self
        .stream
        .error_at(tok, format!("expected an expression, but got \"{got}\"")),
    )
  }

  /// The opening parenthesis has already been consumed.
  fn funcall(&mut self, name: String, tok: usize) -> CompileResult<Node> {
    let mut args = Vec::new();
    while !self.stream.equal(")") {
      if !args.is_empty() {
        self.stream.skip(",")?;
      }
      args.push(self.assign()?);
    }
    Ok(Node::funcall(name, args, tok))
  }
}

/// Array parameters decay to pointers to their element type.
fn adjust_param(ty: Type) -> Type {
  let decl_token = ty.decl_token;
  match ty.kind {
    TypeKind::Array { base, .. } => Type {
      kind: TypeKind::Ptr(base),
      decl_token,
    },
    _ => ty,
  }
}

/// Lightweight cursor over the token vector.
struct TokenStream<'a> {
  tokens: Vec<Token>,
  source: &'a str,
  pos: usize,
}

impl<'a> TokenStream<'a> {
  /// Take ownership of the token stream; the parser will advance `pos` as it consumes input.
  fn new(tokens: Vec<Token>, source: &'a str) -> Self {
    Self {
      tokens,
      source,
      pos: 0,
    }
  }

  fn peek(&self) -> Option<&Token> {
    self.tokens.get(self.pos)
  }

  /// Text of the current token if it is a punctuator.
  fn peek_punct(&self) -> Option<&'a str> {
    self
      .peek()
      .filter(|token| token.kind == TokenKind::Punctuator)
      .map(|token| token.text(self.source))
  }

  fn text(&self, index: usize) -> &'a str {
    self
      .tokens
      .get(index)
      .map_or("", |token| token.text(self.source))
  }

  fn is_keyword(&self, index: usize) -> bool {
    KEYWORDS.contains(&self.text(index))
  }

  /// Whether the current token is the punctuator or keyword `op`.
  fn is(&self, op: &str) -> bool {
    self.peek().is_some_and(|token| {
      matches!(token.kind, TokenKind::Punctuator | TokenKind::Ident)
        && token.len == op.len()
        && token.text(self.source) == op
    })
  }

  /// Consume the current token if it matches `op`.
  fn equal(&mut self, op: &str) -> bool {
    if self.is(op) {
      self.pos += 1;
      return true;
    }
    false
  }

  fn skip(&mut self, s: &str) -> CompileResult<()> {
    if self.equal(s) {
      return Ok(());
    }

    let got = describe(self.peek(), self.source);
    Err(self.error_at(self.pos, format!("expected \"{s}\", but got \"{got}\"")))
  }

  fn error_at(&self, index: usize, message: impl Into<String>) -> CompileError {
    let loc = self
      .tokens
      .get(index)
      .map_or(self.source.len(), |token| token.loc);
    CompileError::parse(self.source, loc, message)
  }

  /// Consume an integer literal, returning its value and token index.
  fn get_number(&mut self) -> CompileResult<(i64, usize)> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Num
    {
      let value = token
        .value
        .ok_or_else(|| self.error_at(self.pos, "internal error: numeric token missing value"))?;
      self.pos += 1;
      return Ok((value, self.pos - 1));
    }

    let got = describe(self.peek(), self.source);
    Err(self.error_at(self.pos, format!("expected a number, but got \"{got}\"")))
  }

  /// Consume a non-keyword identifier, returning its text and token index.
  fn get_ident(&mut self) -> CompileResult<(&'a str, usize)> {
    if let Some(token) = self.peek()
      && token.kind == TokenKind::Ident
      && !self.is_keyword(self.pos)
    {
      let ident = token.text(self.source);
      self.pos += 1;
      return Ok((ident, self.pos - 1));
    }

    let got = describe(self.peek(), self.source);
    Err(self.error_at(
      self.pos,
      format!("expected an identifier, but got \"{got}\""),
    ))
  }

  fn is_eof(&self) -> bool {
    matches!(self.peek().map(|token| token.kind), Some(TokenKind::Eof) | None)
  }
}
