//! Lexical analysis: turns the raw input string into a vector of tokens.
//!
//! The tokenizer knows nothing about semantics. Word runs become numbers or
//! identifiers (keywords included, the parser tells them apart), and
//! two-character punctuators are matched before single-character ones so the
//! longest match always wins.

use std::ops::Range;

use tracing::{debug, instrument};

use crate::error::{CompileError, CompileResult};

/// Kinds of tokens recognised by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
  Punctuator,
  Num,
  Ident,
  Eof,
}

/// One lexeme. `loc..loc + len` is its byte span in the source; `value` is
/// only set for numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
  pub kind: TokenKind,
  pub loc: usize,
  pub len: usize,
  pub value: Option<i64>,
}

impl Token {
  fn punct(loc: usize, len: usize) -> Self {
    Self {
      kind: TokenKind::Punctuator,
      loc,
      len,
      value: None,
    }
  }

  fn number(loc: usize, len: usize, value: i64) -> Self {
    Self {
      kind: TokenKind::Num,
      loc,
      len,
      value: Some(value),
    }
  }

  fn ident(loc: usize, len: usize) -> Self {
    Self {
      kind: TokenKind::Ident,
      loc,
      len,
      value: None,
    }
  }

  fn eof(loc: usize) -> Self {
    Self {
      kind: TokenKind::Eof,
      loc,
      len: 0,
      value: None,
    }
  }

  pub fn span(&self) -> Range<usize> {
    self.loc..self.loc + self.len
  }

  /// The characters of `source` this token was lexed from.
  pub fn text<'a>(&self, source: &'a str) -> &'a str {
    source.get(self.span()).unwrap_or_default()
  }
}

const TWO_CHAR_PUNCTUATORS: [&str; 8] = ["==", "<=", ">=", "!=", "&&", "||", "++", "--"];

fn is_word_byte(c: u8) -> bool {
  c.is_ascii_alphanumeric() || c == b'_'
}

/// Lex the input into a flat vector of tokens terminated by an `Eof` marker.
#[instrument(skip_all)]
pub fn tokenize(input: &str) -> CompileResult<Vec<Token>> {
  let mut tokens = Vec::new();
  let bytes = input.as_bytes();
  let mut i = 0;

  while i < bytes.len() {
    let c = bytes[i];
    if c.is_ascii_whitespace() {
      i += 1;
      continue;
    }

    if is_word_byte(c) {
      let start = i;
      while i < bytes.len() && is_word_byte(bytes[i]) {
        i += 1;
      }
      let text = &input[start..i];
      if text.bytes().all(|b| b.is_ascii_digit()) {
        let value = text
          .parse::<i64>()
          .map_err(|err| CompileError::lex(input, start, format!("invalid number: {err}")))?;
        tokens.push(Token::number(start, i - start, value));
      } else {
        tokens.push(Token::ident(start, i - start));
      }
      continue;
    }

    if let Some(op) = TWO_CHAR_PUNCTUATORS
      .into_iter()
      .find(|op| input[i..].starts_with(op))
    {
      tokens.push(Token::punct(i, op.len()));
      i += op.len();
      continue;
    }

    if matches!(
      c,
      b'{'
        | b'}'
        | b'('
        | b')'
        | b';'
        | b'['
        | b']'
        | b','
        | b'='
        | b'+'
        | b'-'
        | b'*'
        | b'/'
        | b'<'
        | b'>'
        | b'!'
        | b'&'
    ) {
      tokens.push(Token::punct(i, 1));
      i += 1;
      continue;
    }

    let invalid_char = input[i..].chars().next().unwrap_or('\0');
    return Err(CompileError::lex(
      input,
      i,
      format!("invalid token: '{invalid_char}'"),
    ));
  }

  tokens.push(Token::eof(input.len()));
  debug!(count = tokens.len(), "tokenized input");
  Ok(tokens)
}

/// How a token is quoted in "expected X, but got Y" diagnostics.
pub fn describe<'a>(token: Option<&Token>, source: &'a str) -> &'a str {
  match token {
    Some(token) if token.kind != TokenKind::Eof => token.text(source),
    _ => "EOF",
  }
}
