use std::cell::RefCell;
use std::rc::Rc;

use rill::{CompileOptions, Mode, Session, Value};

const LOOP: &str = "fn main() -> int {
    mut i = 0
    mut total = 0
    while i < 3 {
        total = total + i
        i = i + 1
    }
    total
}";

type Hits = Rc<RefCell<Vec<(usize, Vec<String>)>>>;

fn session_with_hook(mode: Mode) -> (Session, Hits) {
    let mut session = Session::new();
    let errors = session.compile_source("loop.rill", LOOP, mode, CompileOptions::default());
    assert!(errors.is_empty(), "compile errors: {:?}", errors);

    let hits: Hits = Rc::default();
    let sink = Rc::clone(&hits);
    session.add_debug_hook(move |breakpoint, locals| {
        let locals = locals.iter().map(|l| l.to_string()).collect();
        sink.borrow_mut().push((breakpoint.position.line, locals));
    });
    (session, hits)
}

#[test]
fn test_loop_breakpoint_fires_once_per_entry() {
    let (mut session, hits) = session_with_hook(Mode::Debug);
    session.add_breakpoint("loop.rill", 5).unwrap();

    assert_eq!(session.call_entry("main"), Ok(Value::Int(3)));
    let hits = hits.borrow();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0], (5, vec!["i = 0".to_string(), "total = 0".to_string()]));
    assert_eq!(hits[2].1, vec!["i = 2", "total = 1"]);
}

#[test]
fn test_breakpoint_after_loop() {
    let (mut session, hits) = session_with_hook(Mode::Debug);
    session.add_breakpoint("loop.rill", 8).unwrap();
    session.add_breakpoint("loop.rill", 8).unwrap();

    assert_eq!(session.call_entry("main"), Ok(Value::Int(3)));
    assert_eq!(*hits.borrow(), vec![(8, vec!["i = 3".to_string(), "total = 3".to_string()])]);

    // A fresh run may fire on the same line again.
    assert_eq!(session.call_entry("main"), Ok(Value::Int(3)));
    assert_eq!(hits.borrow().len(), 2);
}

#[test]
fn test_cleared_breakpoints_do_not_fire() {
    let (mut session, hits) = session_with_hook(Mode::Debug);
    session.add_breakpoint("loop.rill", 5).unwrap();
    session.clear_breakpoints();

    assert_eq!(session.call_entry("main"), Ok(Value::Int(3)));
    assert!(hits.borrow().is_empty());
}

#[test]
fn test_release_mode_is_silent() {
    let (mut session, hits) = session_with_hook(Mode::Release);
    session.add_breakpoint("loop.rill", 5).unwrap();

    assert_eq!(session.call_entry("main"), Ok(Value::Int(3)));
    assert!(hits.borrow().is_empty());
}

#[test]
fn test_unknown_breakpoint_location() {
    let (mut session, _) = session_with_hook(Mode::Debug);
    let error = session.add_breakpoint("loop.rill", 99).unwrap_err();
    assert_eq!(error.message, "no line 99 in source 'loop.rill'");
    assert!(session.add_breakpoint("other.rill", 1).is_err());
}

#[test]
fn test_single_line_loop_fires_once() {
    let source = "fn main() -> int {\n    mut i = 0\n    while i < 5 { i = i + 1 }\n    i\n}";
    let mut session = Session::new();
    let errors = session.compile_source("inline.rill", source, Mode::Debug, CompileOptions::default());
    assert!(errors.is_empty(), "compile errors: {:?}", errors);

    let hits: Hits = Rc::default();
    let sink = Rc::clone(&hits);
    session.add_debug_hook(move |breakpoint, locals| {
        let locals = locals.iter().map(|l| l.to_string()).collect();
        sink.borrow_mut().push((breakpoint.position.line, locals));
    });
    session.add_breakpoint("inline.rill", 3).unwrap();

    assert_eq!(session.call_entry("main"), Ok(Value::Int(5)));
    assert_eq!(*hits.borrow(), vec![(3, vec!["i = 0".to_string()])]);
}
