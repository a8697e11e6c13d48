use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser};
use snafu::ResultExt;
use tracing::debug;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use minicc::CompileResult;
use minicc::error::IoSnafu;

#[derive(Parser, Debug)]
#[command(name = "minicc", version)]
#[command(about = "Compile a small subset of C into x86-64 assembly")]
struct Args {
  /// C source file, `-` for stdin, or the program text itself with `--expr`.
  input: String,
  /// Treat INPUT as source text rather than a path.
  #[arg(short = 'e', long = "expr")]
  expr: bool,
  /// Write assembly to this file instead of stdout.
  #[arg(short = 'o', long = "output")]
  output: Option<PathBuf>,
  /// Raise log verbosity; repeat for more detail.
  #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
  verbose: u8,
}

fn init_logging(verbose: u8) {
  let level = match verbose {
    0 => LevelFilter::WARN,
    1 => LevelFilter::DEBUG,
    _ => LevelFilter::TRACE,
  };
  let filter = EnvFilter::builder()
    .with_default_directive(level.into())
    .from_env_lossy();

  tracing_subscriber::fmt()
    .compact()
    .without_time()
    .with_env_filter(filter)
    .with_writer(io::stderr)
    .init();
}

fn read_source(args: &Args) -> CompileResult<String> {
  if args.expr {
    return Ok(args.input.clone());
  }

  if args.input == "-" {
    let mut source = String::new();
    io::stdin()
      .read_to_string(&mut source)
      .context(IoSnafu { path: "<stdin>" })?;
    return Ok(source);
  }

  fs::read_to_string(&args.input).context(IoSnafu {
    path: args.input.as_str(),
  })
}

fn write_output(args: &Args, asm: &str) -> CompileResult<()> {
  match &args.output {
    Some(path) => fs::write(path, asm).context(IoSnafu { path }),
    None => io::stdout()
      .lock()
      .write_all(asm.as_bytes())
      .context(IoSnafu { path: "<stdout>" }),
  }
}

fn run(args: &Args) -> CompileResult<()> {
  let source = read_source(args)?;
  debug!(input = %args.input, bytes = source.len(), "read source");
  let asm = minicc::generate_assembly(&source)?;
  write_output(args, &asm)
}

fn main() {
  let args = Args::parse();
  init_logging(args.verbose);

  if let Err(err) = run(&args) {
    eprintln!("{err}");
    process::exit(1);
  }
}
