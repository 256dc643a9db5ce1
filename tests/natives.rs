use std::cell::RefCell;
use std::rc::Rc;

use rill::value::TypeRegistry;
use rill::{CompileOptions, HostStruct, Marshal, Mode, NativeError, Reader, Session, Value, ValueType, Writer};

#[derive(Debug, Clone, PartialEq)]
struct Point {
    x: i64,
    y: i64,
}

impl Marshal for Point {
    fn value_type(types: &TypeRegistry) -> Result<ValueType, NativeError> {
        Self::registered_type(types)
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, NativeError> {
        let x = i64::read(reader)?;
        let y = i64::read(reader)?;
        Ok(Point { x, y })
    }

    fn write(self, writer: &mut Writer<'_>) {
        writer.write(self.x);
        writer.write(self.y);
    }
}

impl HostStruct for Point {
    const NAME: &'static str = "Point";

    fn fields(_types: &TypeRegistry) -> Result<Vec<(&'static str, ValueType)>, NativeError> {
        Ok(vec![("x", ValueType::Int), ("y", ValueType::Int)])
    }
}

fn compile(session: &mut Session, source: &str) -> Vec<String> {
    session
        .compile_source("host.rill", source, Mode::Debug, CompileOptions::default())
        .into_iter()
        .map(|e| e.message)
        .collect()
}

#[test]
fn test_native_function_call() {
    let mut session = Session::new();
    session
        .add_function(
            |def| {
                def.name("square").param::<i64>("x")?;
                def.returns::<i64>()
            },
            |ctx| {
                let x = ctx.arg::<i64>(0)?;
                ctx.ret(x * x)
            },
        )
        .unwrap();

    assert!(compile(&mut session, "fn main() -> int { square(7) + 1 }").is_empty());
    assert_eq!(session.call_entry("main"), Ok(Value::Int(50)));
}

#[test]
fn test_native_side_effects() {
    let log: Rc<RefCell<Vec<String>>> = Rc::default();
    let sink = Rc::clone(&log);

    let mut session = Session::new();
    session
        .add_function(
            |def| {
                def.name("emit").param::<String>("line")?.param::<bool>("loud")?;
                def.returns::<()>()
            },
            move |ctx| {
                let line = ctx.arg::<String>(0)?;
                let loud = ctx.arg::<bool>(1)?;
                sink.borrow_mut().push(if loud { line.to_uppercase() } else { line });
                Ok(())
            },
        )
        .unwrap();

    let source = "fn main() { emit(\"one\", false) emit(\"t\" + \"wo\", true) }";
    assert!(compile(&mut session, source).is_empty());
    assert_eq!(session.call_entry("main"), Ok(Value::Unit));
    assert_eq!(*log.borrow(), vec!["one", "TWO"]);
}

#[test]
fn test_missing_return_is_one_error() {
    let mut session = Session::new();
    let error = session
        .add_function(
            |def| {
                def.name("broken").param::<i64>("x")?;
                Ok(())
            },
            |_ctx| Ok(()),
        )
        .unwrap_err();
    assert!(error.message.contains("No native function body found"));

    // Reported again by the next compile, and only once.
    let errors = compile(&mut session, "fn main() -> int { 1 }");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("No native function body found"));
    assert!(compile(&mut session, "fn main() -> int { 1 }").is_empty());

    // Nothing was committed.
    let errors = compile(&mut session, "fn main() -> int { broken(1) }");
    assert_eq!(errors, vec!["undeclared function 'broken'"]);
}

#[test]
fn test_failing_definition() {
    let mut session = Session::new();
    let error = session
        .add_function(|_def| Err(NativeError::failed("boom")), |_ctx| Ok(()))
        .unwrap_err();
    assert_eq!(error.message, "Error when adding native function: boom");

    let errors = compile(&mut session, "fn main() {}");
    assert_eq!(errors, vec!["Error when adding native function: boom"]);
}

#[test]
fn test_duplicate_native_name() {
    let mut session = Session::new();
    let error = session
        .add_function(
            |def| {
                def.name("print").param::<String>("value")?;
                def.returns::<()>()
            },
            |_ctx| Ok(()),
        )
        .unwrap_err();
    assert!(error.message.contains("'print' is already defined"));
}

#[test]
fn test_unregistered_struct_is_rejected() {
    let mut session = Session::new();
    let error = session
        .add_function(
            |def| {
                def.name("origin");
                def.returns::<Point>()
            },
            |ctx| ctx.ret(Point { x: 0, y: 0 }),
        )
        .unwrap_err();
    assert!(error.message.contains("struct 'Point' is not registered"));
}

#[test]
fn test_native_errors_fault_the_run() {
    let mut session = Session::new();
    session
        .add_function(
            |def| {
                def.name("fail").param::<i64>("code")?;
                def.returns::<i64>()
            },
            |ctx| {
                let code = ctx.arg::<i64>(0)?;
                Err(NativeError::failed(format!("code {}", code)))
            },
        )
        .unwrap();

    assert!(compile(&mut session, "fn main() -> int {\n    fail(3)\n}").is_empty());
    let error = session.call_entry("main").unwrap_err();
    assert_eq!(error.message, "native function 'fail' failed: code 3");

    let trace = session.trace_call_stack();
    assert!(trace.contains("at main (host.rill:2)"), "{}", trace);
    assert!(trace.contains("at fail [native]"), "{}", trace);
}

#[test]
fn test_host_struct_round_trip() {
    let mut session = Session::new();
    session.add_struct::<Point>().unwrap();
    session
        .add_function(
            |def| {
                def.name("manhattan").param::<Point>("p")?;
                def.returns::<i64>()
            },
            |ctx| {
                let p = ctx.arg::<Point>(0)?;
                ctx.ret(p.x.abs() + p.y.abs())
            },
        )
        .unwrap();

    let source = "fn main() -> int { let p = Point { x: 3, y: -4 } manhattan(p) + p.x }\n\
                  fn shifted(p: Point, by: int) -> Point { Point { x: p.x + by, y: p.y + by, } }";
    assert!(compile(&mut session, source).is_empty());
    assert_eq!(session.call_entry("main"), Ok(Value::Int(10)));

    let shifted = session.get_function::<(Point, i64), Point>("shifted").expect("shifted not found");
    assert_eq!(shifted.call(&mut session, (Point { x: 1, y: 2 }, 10)), Ok(Point { x: 11, y: 12 }));
}

#[test]
fn test_struct_values_decode() {
    let mut session = Session::new();
    session.add_struct::<Point>().unwrap();
    assert!(compile(&mut session, "fn main() -> Point { Point { x: 1, y: 2 } }").is_empty());
    let value = session.call_entry("main").unwrap();
    assert_eq!(value.to_string(), "Point { x: 1, y: 2 }");
}

#[test]
fn test_prelude() {
    let mut session = Session::new();
    let source = "fn main() -> string { int_to_string(to_int(2.9) + 40) + \" / \" + float_to_string(to_float(3)) }";
    assert!(compile(&mut session, source).is_empty());
    assert_eq!(session.call_entry("main"), Ok(Value::String("42 / 3.0".into())));
}

#[test]
fn test_builtin_frames_are_tagged() {
    let mut session = Session::new();
    assert!(compile(&mut session, "fn main() -> int {\n    to_int(100000000000000000000.0)\n}").is_empty());
    let error = session.call_entry("main").unwrap_err();
    assert!(error.message.starts_with("native function 'to_int' failed"), "{}", error.message);

    let trace = session.trace_call_stack();
    assert!(trace.contains("at main (host.rill:2)"), "{}", trace);
    assert!(trace.contains("at to_int [builtin]"), "{}", trace);
    assert!(!trace.contains("[native]"), "{}", trace);
}
