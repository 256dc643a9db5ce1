//! Source-level debugger
//!
//! The VM calls [`Debugger::observe`] before every instruction. For
//! debug-mode chunks with at least one hook and one breakpoint, the current
//! instruction is resolved to a source line; a breakpoint on that line fires
//! when execution moves onto it from a different line, and the hooks receive
//! a snapshot of the innermost managed frame's locals.

use crate::bytecode::{Chunk, SourcePosition};
use crate::compiler::Mode;
use crate::token::Slice;
use crate::value::{Value, ValueType};
use crate::vm::{FrameKind, VirtualMachine};
use std::fmt;
use tracing::debug;

/// A registered breakpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub position: SourcePosition,
    /// Byte region of the breakpoint's line.
    pub region: Slice,
}

/// One local in a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVariable {
    pub name: String,
    pub ty: ValueType,
    pub value: Value,
}

impl fmt::Display for LocalVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.name, self.value)
    }
}

/// Callback run when a breakpoint fires. It may block for as long as the
/// host wants execution paused.
pub type DebugHook = Box<dyn FnMut(&Breakpoint, &[LocalVariable])>;

#[derive(Default)]
pub struct Debugger {
    hooks: Vec<DebugHook>,
    breakpoints: Vec<Breakpoint>,
    last_position: Option<SourcePosition>,
}

impl Debugger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&mut self, hook: DebugHook) {
        self.hooks.push(hook);
    }

    pub fn add_breakpoint(&mut self, breakpoint: Breakpoint) {
        if !self.breakpoints.contains(&breakpoint) {
            self.breakpoints.push(breakpoint);
        }
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// Forget the last observed line, so the next run may fire on its
    /// first line.
    pub fn reset(&mut self) {
        self.last_position = None;
    }

    fn is_active(&self) -> bool {
        !self.hooks.is_empty() && !self.breakpoints.is_empty()
    }

    /// Per-instruction observer.
    pub fn observe(&mut self, chunk: &Chunk, vm: &VirtualMachine, address: usize) {
        if chunk.mode == Mode::Release || !self.is_active() {
            return;
        }
        let Some(position) = chunk.instruction_position(address) else {
            return;
        };
        if self.last_position.as_ref() == Some(&position) {
            return;
        }
        self.last_position = Some(position.clone());

        let Some(breakpoint) = self.breakpoints.iter().find(|b| b.position == position).cloned() else {
            return;
        };
        let locals = snapshot(chunk, vm);
        debug!(target: "rill::debugger", %position, locals = locals.len(), "breakpoint hit");
        for hook in &mut self.hooks {
            hook(&breakpoint, &locals);
        }
    }
}

impl fmt::Debug for Debugger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debugger")
            .field("hooks", &self.hooks.len())
            .field("breakpoints", &self.breakpoints)
            .field("last_position", &self.last_position)
            .finish()
    }
}

/// Decode the shadow locals of the innermost managed frame.
pub fn snapshot(chunk: &Chunk, vm: &VirtualMachine) -> Vec<LocalVariable> {
    let Some(frame) = vm.frames().iter().rev().find(|f| f.kind == FrameKind::Function) else {
        return Vec::new();
    };
    frame
        .locals
        .iter()
        .filter_map(|local| {
            let name = chunk.names.get(local.name)?.clone();
            let (bytes, _) = vm.stack().slice(frame.base + local.offset, local.ty.size())?;
            let value = Value::decode(bytes, local.ty, &chunk.types, vm.strings())?;
            Some(LocalVariable {
                name,
                ty: local.ty,
                value,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileOptions, Compiler};
    use crate::lexer::ScannerSet;
    use crate::vm::VmConfig;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn compiled(mode: Mode, source: &str) -> Chunk {
        let scanners = ScannerSet::language();
        let mut chunk = Chunk::new(mode);
        let errors = Compiler::new(&scanners, CompileOptions::default()).compile(&mut chunk, &[("dbg.rill", source)]);
        assert!(errors.is_empty(), "{:?}", errors);
        chunk
    }

    fn breakpoint(chunk: &Chunk, line: usize) -> Breakpoint {
        Breakpoint {
            position: SourcePosition {
                uri: "dbg.rill".into(),
                line,
            },
            region: chunk.line_region("dbg.rill", line).unwrap(),
        }
    }

    #[test]
    fn test_breakpoint_snapshots_locals() {
        let source = "fn main() -> int {\n    let a = 2\n    let b = a * 3\n    b\n}";
        let chunk = compiled(Mode::Debug, source);
        let seen: Rc<RefCell<Vec<String>>> = Rc::default();

        let mut debugger = Debugger::new();
        debugger.add_breakpoint(breakpoint(&chunk, 4));
        let sink = Rc::clone(&seen);
        debugger.add_hook(Box::new(move |_, locals| {
            sink.borrow_mut().extend(locals.iter().map(|l| l.to_string()));
        }));

        let mut vm = VirtualMachine::new(VmConfig::default());
        vm.reset(&chunk);
        vm.execute(&chunk, 0, &mut debugger).unwrap();
        assert_eq!(*seen.borrow(), vec!["a = 2", "b = 6"]);
    }

    #[test]
    fn test_release_chunks_never_fire() {
        let source = "fn main() -> int {\n    1\n}";
        let chunk = compiled(Mode::Release, source);
        let hits = Rc::new(RefCell::new(0));

        let mut debugger = Debugger::new();
        debugger.add_breakpoint(breakpoint(&chunk, 2));
        let counter = Rc::clone(&hits);
        debugger.add_hook(Box::new(move |_, _| *counter.borrow_mut() += 1));

        let mut vm = VirtualMachine::new(VmConfig::default());
        vm.reset(&chunk);
        vm.execute(&chunk, 0, &mut debugger).unwrap();
        assert_eq!(*hits.borrow(), 0);
    }
}
