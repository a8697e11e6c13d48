//! Shared error utilities used across the compilation pipeline.
//!
//! Every stage reports through [`CompileError`]. Located variants render the
//! offending source line with a caret under the byte that triggered them, in
//! the style of chibicc's `error_at`.

use std::path::PathBuf;

use snafu::Snafu;

pub type CompileResult<T> = Result<T, CompileError>;

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Lex,
  Parse,
  Type,
  Codegen,
  Io,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CompileError {
  #[snafu(display("{snippet}\n{marker} {message}"))]
  Lex {
    snippet: String,
    marker: String,
    message: String,
  },

  #[snafu(display("{snippet}\n{marker} {message}"))]
  Parse {
    snippet: String,
    marker: String,
    message: String,
  },

  #[snafu(display("{snippet}\n{marker} {message}"))]
  Type {
    snippet: String,
    marker: String,
    message: String,
  },

  #[snafu(display("{snippet}\n{marker} {message}"))]
  Codegen {
    snippet: String,
    marker: String,
    message: String,
  },

  #[snafu(display("{}: {source}", path.display()))]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
}

impl CompileError {
  /// A lexing failure anchored at byte offset `loc`.
  pub fn lex(source: &str, loc: usize, message: impl Into<String>) -> Self {
    let (snippet, marker) = render(source, loc);
    Self::Lex {
      snippet,
      marker,
      message: message.into(),
    }
  }

  pub fn parse(source: &str, loc: usize, message: impl Into<String>) -> Self {
    let (snippet, marker) = render(source, loc);
    Self::Parse {
      snippet,
      marker,
      message: message.into(),
    }
  }

  pub fn ty(source: &str, loc: usize, message: impl Into<String>) -> Self {
    let (snippet, marker) = render(source, loc);
    Self::Type {
      snippet,
      marker,
      message: message.into(),
    }
  }

  pub fn codegen(source: &str, loc: usize, message: impl Into<String>) -> Self {
    let (snippet, marker) = render(source, loc);
    Self::Codegen {
      snippet,
      marker,
      message: message.into(),
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Lex { .. } => ErrorKind::Lex,
      Self::Parse { .. } => ErrorKind::Parse,
      Self::Type { .. } => ErrorKind::Type,
      Self::Codegen { .. } => ErrorKind::Codegen,
      Self::Io { .. } => ErrorKind::Io,
    }
  }

  /// The bare diagnostic text, without the rendered source line.
  pub fn message(&self) -> String {
    match self {
      Self::Lex { message, .. }
      | Self::Parse { message, .. }
      | Self::Type { message, .. }
      | Self::Codegen { message, .. } => message.clone(),
      Self::Io { source, .. } => source.to_string(),
    }
  }
}

/// Render the source line containing `loc`, prefixed by its 1-based line and
/// column, and a caret marker aligned under the offending character.
fn render(source: &str, loc: usize) -> (String, String) {
  let mut safe_loc = loc.min(source.len());
  while !source.is_char_boundary(safe_loc) {
    safe_loc -= 1;
  }

  let line_start = source[..safe_loc].rfind('\n').map_or(0, |i| i + 1);
  let line_end = source[safe_loc..]
    .find('\n')
    .map_or(source.len(), |i| safe_loc + i);
  let line_no = source[..line_start].matches('\n').count() + 1;

  let column = source[line_start..safe_loc].chars().count();
  let prefix = format!("{line_no}:{}: ", column + 1);
  let line = source[line_start..line_end].trim_end_matches('\r');
  let snippet = format!("{prefix}{line}");
  let marker = format!("{}^", " ".repeat(prefix.len() + column));
  (snippet, marker)
}
