use rill::{CompileOptions, Mode, Session, Value};

fn evaluate(source: &str) -> Value {
    let mut session = Session::new();
    let errors = session.compile_expression(source);
    assert!(errors.is_empty(), "compile errors: {:?}", errors);
    session.evaluate().expect("Execution failed")
}

fn compiled(source: &str) -> Session {
    let mut session = Session::new();
    let errors = session.compile_source("test.rill", source, Mode::Debug, CompileOptions::default());
    assert!(errors.is_empty(), "compile errors: {:?}", errors);
    session
}

#[test]
fn test_block_expression() {
    assert_eq!(evaluate("{let a=4 a+5}"), Value::Int(9));
}

#[test]
fn test_or_short_circuits() {
    assert_eq!(evaluate("{mut a=false true or {a=true false} a}"), Value::Bool(false));
    assert_eq!(evaluate("{mut a=false false and {a=true true} a}"), Value::Bool(false));
    assert_eq!(evaluate("{mut a=false false or {a=true false} a}"), Value::Bool(true));
}

#[test]
fn test_else_if_chain() {
    assert_eq!(evaluate("if 3>3 {4} else if 3<3 {-4} else {5}"), Value::Int(5));
}

#[test]
fn test_arithmetic_and_strings() {
    assert_eq!(evaluate("7 % 3 + 10 / 4 * 2"), Value::Int(5));
    assert_eq!(evaluate("1.5 * 2.0"), Value::Float(3.0));
    assert_eq!(evaluate("\"ri\" + \"ll\""), Value::String("rill".into()));
    assert_eq!(evaluate("!(1 == 2) and 2.0 >= 1.5"), Value::Bool(true));
}

#[test]
fn test_undeclared_variable() {
    let mut session = Session::new();
    let errors = session.compile_expression("{let a = 1 a + b}");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "undeclared variable 'b'");
    assert!(session.runtime_error().is_none());
    assert!(session.evaluate().is_err());
    assert!(session.runtime_error().is_none());
}

#[test]
fn test_recursion_and_loops() {
    let source = r#"
        fn main() -> int {
            mut i = 0
            mut total = 0
            while i < 10 {
                total = total + fib(i)
                i = i + 1
            }
            total
        }

        fn fib(n: int) -> int {
            if n < 2 { return n }
            fib(n - 1) + fib(n - 2)
        }
    "#;
    let mut session = compiled(source);
    assert_eq!(session.call_entry("main"), Ok(Value::Int(88)));
}

#[test]
fn test_get_function_by_signature() {
    let source = "fn main() -> int { add(40, 2) }\nfn add(a: int, b: int) -> int { a + b }";
    let mut session = compiled(source);

    let main = session.get_function::<(), i64>("main").expect("main not found");
    assert_eq!(main.call(&mut session, ()), Ok(42));

    let add = session.get_function::<(i64, i64), i64>("add").expect("add not found");
    assert_eq!(add.call(&mut session, (-3, 5)), Ok(2));

    assert!(session.get_function::<(), bool>("main").is_none());
    assert!(session.get_function::<(i64,), i64>("main").is_none());
    assert!(session.get_function::<(), i64>("missing").is_none());
}

#[test]
fn test_failed_compile_finds_nothing() {
    let mut session = Session::new();
    let errors = session.compile_source("bad.rill", "fn main() -> int { true }", Mode::Debug, CompileOptions::default());
    assert_eq!(errors.len(), 1);
    assert!(!session.is_compiled());
    assert!(session.get_function::<(), i64>("main").is_none());
    assert!(!session.has_entry("main"));

    // The session stays usable after a failure.
    let errors = session.compile_source("good.rill", "fn main() -> int { 1 }", Mode::Debug, CompileOptions::default());
    assert!(errors.is_empty());
    assert_eq!(session.call_entry("main"), Ok(Value::Int(1)));
}

#[test]
fn test_disassembly_mentions_each_function_once() {
    let source = "fn main() -> int { twice(half(8)) }\n\
                  fn twice(n: int) -> int { n * 2 }\n\
                  fn half(n: int) -> int { n / 2 }";
    let session = compiled(source);
    let listing = session.disassemble();
    for header in ["== main() -> int ==", "== twice(n: int) -> int ==", "== half(n: int) -> int =="] {
        assert_eq!(listing.matches(header).count(), 1, "{}", listing);
    }
    assert!(listing.contains("; fn twice(n: int) -> int { n * 2 }"));
}

#[test]
fn test_runtime_error_keeps_call_stack() {
    let source = "fn main() -> int {\n    divide(1, 0)\n}\nfn divide(a: int, b: int) -> int {\n    a / b\n}";
    let mut session = compiled(source);

    let error = session.call_entry("main").unwrap_err();
    assert_eq!(error.message, "division by zero");
    assert_eq!(error.position.as_ref().map(|p| p.line), Some(5));
    assert_eq!(session.runtime_error(), Some(&error));

    let trace = session.trace_call_stack();
    assert!(trace.contains("at divide (test.rill:5)"), "{}", trace);
    assert!(trace.contains("at main (test.rill:2)"), "{}", trace);

    let report = session.format_runtime_error(&error);
    assert!(report.starts_with("runtime error: division by zero"));
    assert!(report.contains("a / b"));
    assert!(report.contains("call stack:"));

    // The next run starts clean.
    let errors = session.compile_source("test.rill", "fn main() -> int { 3 }", Mode::Release, CompileOptions::default());
    assert!(errors.is_empty());
    assert_eq!(session.call_entry("main"), Ok(Value::Int(3)));
    assert!(session.runtime_error().is_none());
}

#[test]
fn test_compile_error_report() {
    let mut session = Session::new();
    let source = "fn main() -> int {\n    1 + 2.0\n}";
    let errors = session.compile_source("types.rill", source, Mode::Debug, CompileOptions::default());
    assert_eq!(errors.len(), 1);

    let report = session.format_compile_error(&errors[0]);
    assert!(report.starts_with("error: operator '+' cannot be applied to int and float"));
    assert!(report.contains("--> types.rill:2"));
    assert!(report.contains("    1 + 2.0"));
    assert!(report.contains('^'));
}

#[test]
fn test_release_mode_runs_the_same() {
    let source = "fn main() -> int { let a = 6 { let b = a * 7 b } }";
    let mut session = Session::new();
    let errors = session.compile_source("r.rill", source, Mode::Release, CompileOptions::default());
    assert!(errors.is_empty());
    assert_eq!(session.call_entry("main"), Ok(Value::Int(42)));
}

#[test]
fn test_handle_from_previous_compile_is_rejected() {
    let mut session = compiled("fn main() -> int { 0 }\nfn add(a: int, b: int) -> int { a + b }");
    let add = session.get_function::<(i64, i64), i64>("add").expect("add not found");
    assert_eq!(add.call(&mut session, (2, 3)), Ok(5));

    let errors = session.compile_source(
        "test.rill",
        "fn main() -> int { 0 }\nfn half(x: float) -> float { x / 2.0 }",
        Mode::Debug,
        CompileOptions::default(),
    );
    assert!(errors.is_empty());

    let error = add.call(&mut session, (2, 3)).unwrap_err();
    assert!(error.message.starts_with("stale function handle"), "{}", error.message);
    assert_eq!(session.runtime_error(), Some(&error));

    // A fresh lookup against the new program works.
    let half = session.get_function::<(f64,), f64>("half").expect("half not found");
    assert_eq!(half.call(&mut session, (3.0,)), Ok(1.5));
}
