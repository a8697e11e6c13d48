use std::fs;
use std::path::PathBuf;
use std::process::{self, Command};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use minicc::codegen::assign_lvar_offsets;
use minicc::{ErrorKind, generate_assembly, parser, tokenizer};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

fn scratch_path(ext: &str) -> PathBuf {
  let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
  PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join(format!("minicc-{}-{id}.{ext}", process::id()))
}

/// Assemble and link `asm` with the host C toolchain.
fn link(asm: &str) -> Option<PathBuf> {
  let src = scratch_path("s");
  let exe = scratch_path("out");
  fs::write(&src, asm).ok()?;
  let status = Command::new("cc")
    .arg("-o")
    .arg(&exe)
    .arg(&src)
    .status()
    .ok()?;
  status.success().then_some(exe)
}

/// Whether assembled programs can be executed on this host.
fn toolchain_available() -> bool {
  static AVAILABLE: OnceLock<bool> = OnceLock::new();
  *AVAILABLE.get_or_init(|| {
    cfg!(all(target_arch = "x86_64", target_os = "linux"))
      && link(".globl main\nmain:\n    mov $0, %rax\n    ret\n").is_some()
  })
}

/// Compile, link and run `source`, returning its exit status. `None` when
/// there is no usable toolchain.
fn run(source: &str) -> Option<i32> {
  if !toolchain_available() {
    return None;
  }

  let asm = generate_assembly(source).unwrap_or_else(|err| panic!("{source}\n{err}"));
  let exe = link(&asm).unwrap_or_else(|| panic!("toolchain rejected output for {source}:\n{asm}"));
  let status = Command::new(&exe).status().expect("failed to run compiled program");
  status.code()
}

fn assert_returns(source: &str, expected: i64) {
  if let Some(code) = run(source) {
    assert_eq!(i64::from(code), expected.rem_euclid(256), "{source}");
  }
}

fn main_returning(expr: &str) -> String {
  format!("int main() {{ return {expr}; }}")
}

#[test_log::test]
fn arithmetic_precedence() {
  assert_returns(&main_returning("2 + 3 * 4"), 14);
  assert_returns(&main_returning("(2 + 3) * 4"), 20);
  assert_returns(&main_returning("17 / 5"), 3);
  assert_returns(&main_returning("-10 + 20"), 10);
  assert_returns(&main_returning("- -3"), 3);
  assert_returns(&main_returning("+5"), 5);
}

#[test]
fn additive_chains_are_left_associative() {
  let cases: [&[i64]; 5] = [
    &[10, 3, 2],
    &[1, 2, 3, 4],
    &[100, 50, 25, 12, 6],
    &[7],
    &[0, 9, 1, 8, 2, 7],
  ];

  for (index, values) in cases.iter().enumerate() {
    let mut expr = values[0].to_string();
    let mut expected = values[0];
    for (i, value) in values.iter().enumerate().skip(1) {
      if (i + index) % 2 == 0 {
        expr.push_str(&format!(" + {value}"));
        expected += value;
      } else {
        expr.push_str(&format!(" - {value}"));
        expected -= value;
      }
    }
    assert_returns(&main_returning(&expr), expected);
  }
}

#[test]
fn comparisons_yield_zero_or_one() {
  assert_returns(
    &main_returning("(1 < 2) + (2 <= 2) + (3 > 2) + (2 >= 3) + (1 == 1) + (1 != 1)"),
    4,
  );
}

#[test_log::test]
fn pointer_arithmetic_scales_by_element_size() {
  assert_returns(
    "int main() { int a[3]; int *p; p = a; *(p + 1) = 7; return *(p + 1); }",
    7,
  );
  assert_returns(
    "int main() { int a[3]; *a = 1; *(a + 1) = 2; *(a + 2) = 4; return *a + *(a + 1) + *(2 + a); }",
    7,
  );
  assert_returns(
    "int main() { int a[3]; int *p; p = a + 2; *p = 9; p = p - 1; *p = 3; return *(a + 1) * 10 + *(a + 2); }",
    39,
  );
}

#[test]
fn pointer_difference_counts_elements() {
  assert_returns(
    "int main() { int a[5]; int *p; int *q; p = a; q = p + 3; return q - p; }",
    3,
  );
  assert_returns("int main() { int a[5]; return &a + 4 - &a; }", 4);
}

#[test]
fn locals_and_address_of() {
  assert_returns(
    "int main() { int x; int *p; p = &x; *p = 5; return x; }",
    5,
  );
  assert_returns("int main() { int a = 3, b = 4; return a * b; }", 12);
  assert_returns("int main() { int a[4]; return sizeof a + sizeof *a; }", 40);
}

#[test_log::test]
fn control_flow() {
  assert_returns("int main() { if (0) return 1; return 2; }", 2);
  assert_returns("int main() { if (1) return 1; else return 2; }", 1);
  assert_returns(
    "int main() { int i; for (i = 0; i < 5; i = i + 1) ; return i; }",
    5,
  );
  assert_returns(
    "int main() { int i; int sum; i = 0; sum = 0; while (i <= 10) { sum = sum + i; i = i + 1; } return sum; }",
    55,
  );
  assert_returns(
    "int main() { int i; i = 0; for (;;) { i = i + 1; if (i == 7) return i; } return 0; }",
    7,
  );
}

#[test]
fn calls_pass_arguments_in_order() {
  assert_returns(
    "int sub3(int a, int b, int c) { return a - b - c; } int main() { return sub3(20, 5, 3); }",
    12,
  );
  assert_returns(
    "int f(int a, int b, int c, int d, int e, int g) { return a - b + c - d + e - g; } int main() { return f(32, 16, 8, 4, 2, 1); }",
    21,
  );
  assert_returns(
    "int fib(int n) { if (n <= 1) return n; return fib(n - 1) + fib(n - 2); } int main() { return fib(10); }",
    55,
  );
  assert_returns(
    "int one() { return 1; } int main() { return one() + 2 * one(); }",
    3,
  );
  assert_returns(
    "int set(int *p, int v) { *p = v; return 0; } int main() { int x; set(&x, 42); return x; }",
    42,
  );
}

#[test]
fn globals_live_in_data() {
  assert_returns(
    "int g; int inc() { g = g + 1; return g; } int main() { inc(); inc(); return g; }",
    2,
  );
  assert_returns(
    "int arr[4]; int main() { *(arr + 3) = 9; return *(arr + 3); }",
    9,
  );
  assert_returns("int x; int main() { int x; x = 4; return x; }", 4);
}

#[test]
fn recompiling_is_byte_identical() {
  let source = "int g[2]; int f(int a) { if (a < 2) return a; return f(a - 1) + f(a - 2); } int main() { int i; for (i = 0; i < 2; i = i + 1) *(g + i) = f(i); while (0) ; return *g + *(g + 1); }";
  let first = generate_assembly(source).unwrap();
  let second = generate_assembly(source).unwrap();
  assert_eq!(first, second);
}

#[test]
fn frame_size_is_the_smallest_aligned_cover() {
  for len in 1..=10 {
    let source = format!("int main() {{ int a[{len}]; int b; int *c; return 0; }}");
    let mut program = parser::parse(tokenizer::tokenize(&source).unwrap(), &source).unwrap();
    assign_lvar_offsets(&mut program, &source).unwrap();

    let main = program.function("main").unwrap();
    let total: i64 = main.locals.iter().map(|obj| obj.ty.size()).sum();
    assert_eq!(total, 8 * len + 16);
    assert_eq!(main.stack_size % 16, 0);
    assert!(main.stack_size >= total && main.stack_size - total < 16);

    for pair in main.locals.windows(2) {
      assert!(pair[1].offset < pair[0].offset);
    }
  }
}

#[test]
fn type_errors_produce_no_assembly() {
  let err = generate_assembly("int main() { int a[2]; a = 0; return 0; }").unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Type);

  let err = generate_assembly("int main() { int x; return *x; }").unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Type);
}

#[test]
fn huge_arrays_are_errors_not_crashes() {
  let err = generate_assembly("int main() { int a[2000000000000000000]; return 0; }").unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Parse);
  assert_eq!(err.message(), "array too large");

  let err = generate_assembly("int big[1000000000]; int main() { int a[300000000]; return 0; }")
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Codegen);
}

#[test]
fn lex_and_parse_errors_are_reported() {
  let err = generate_assembly("int main() { return 1 @ 2; }").unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Lex);

  let err = generate_assembly("int main() { return x; }").unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Parse);
  assert!(err.to_string().contains("undefined variable"));

  let err = generate_assembly("int main() { return --1; }").unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Parse);
}
