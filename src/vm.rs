//! Stack-based Virtual Machine for rill
//!
//! Executes a [`Chunk`] against a typed value stack and a call-frame stack.
//! Faults stop execution immediately and leave the frames in place so the
//! host can render a post-mortem trace.

use crate::bytecode::{BinaryOp, Chunk, Constant, Instruction, Primitive};
use crate::debugger::Debugger;
use crate::error::RuntimeError;
use crate::marshal::RuntimeContext;
use crate::stack::ValueStack;
use crate::value::{StringArena, ValueType};
use std::fmt::Write as _;
use std::rc::Rc;
use tracing::{debug, trace};

/// Maximum call depth
const FRAMES_MAX: usize = 256;

/// Maximum value-stack size in bytes
const STACK_MAX: usize = 1 << 20;

/// Execution limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub max_frames: usize,
    pub max_stack_bytes: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_frames: FRAMES_MAX,
            max_stack_bytes: STACK_MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Sentinel below the first managed frame of a host call.
    EntryPoint,
    Function,
    /// A native registered by the host.
    NativeFunction,
    /// A prelude native registered by the session itself.
    AutoNativeFunction,
}

/// A local tracked by the debug-mode shadow stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowLocal {
    /// Index into the chunk's name table.
    pub name: usize,
    pub ty: ValueType,
    /// Byte offset from the frame base.
    pub offset: usize,
}

/// A call frame
#[derive(Debug, Clone)]
pub struct CallFrame {
    pub kind: FrameKind,
    /// Index into the function table, or the native table for native frames.
    pub function: usize,
    /// Next instruction; the executing one is at `ip - 1`.
    pub ip: usize,
    /// First value-stack byte owned by this frame.
    pub base: usize,
    pub locals: Vec<ShadowLocal>,
}

impl CallFrame {
    fn new(kind: FrameKind, function: usize, ip: usize, base: usize) -> Self {
        Self {
            kind,
            function,
            ip,
            base,
            locals: Vec::new(),
        }
    }
}

/// The Virtual Machine
#[derive(Debug, Default)]
pub struct VirtualMachine {
    stack: ValueStack,
    frames: Vec<CallFrame>,
    strings: StringArena,
    config: VmConfig,
}

fn underflow() -> String {
    "value stack underflow".to_string()
}

fn overflow() -> String {
    "integer overflow".to_string()
}

impl VirtualMachine {
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Clear all state left by the previous run.
    pub fn reset(&mut self, chunk: &Chunk) {
        self.stack.clear();
        self.frames.clear();
        self.strings.reset(&chunk.strings);
    }

    pub fn stack(&self) -> &ValueStack {
        &self.stack
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    pub fn strings(&self) -> &StringArena {
        &self.strings
    }

    pub fn strings_mut(&mut self) -> &mut StringArena {
        &mut self.strings
    }

    /// Push one host argument ahead of [`VirtualMachine::execute`].
    pub fn push_argument(&mut self, bytes: &[u8], ty: ValueType) {
        self.stack.push_bytes(bytes, ty);
    }

    /// Call managed function `function`, whose arguments are already on the
    /// stack, and return the bytes of its result.
    pub fn execute(&mut self, chunk: &Chunk, function: usize, debugger: &mut Debugger) -> Result<Vec<u8>, RuntimeError> {
        let detached = |message: String| RuntimeError::new(Default::default(), message);
        let target = chunk
            .functions
            .get(function)
            .ok_or_else(|| detached(format!("no function with index {}", function)))?;
        let function_type = chunk
            .function_types
            .get(target.type_index)
            .ok_or_else(|| detached(format!("function '{}' has no type", target.name)))?;
        let base = self
            .stack
            .len()
            .checked_sub(function_type.parameter_size)
            .ok_or_else(|| detached(format!("missing arguments for '{}'", target.name)))?;

        debug!(target: "rill::vm", function = %target.name, "execute");
        self.frames.push(CallFrame::new(FrameKind::EntryPoint, function, 0, base));
        self.frames.push(CallFrame::new(FrameKind::Function, function, target.entry, base));
        self.run(chunk, debugger)?;
        self.frames.pop();

        self.stack
            .pop_bytes(function_type.return_type.size())
            .ok_or_else(|| detached(underflow()))
    }

    /// Run until control returns to an entry-point frame.
    fn run(&mut self, chunk: &Chunk, debugger: &mut Debugger) -> Result<(), RuntimeError> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Ok(());
            };
            if frame.kind == FrameKind::EntryPoint {
                return Ok(());
            }
            let address = frame.ip;
            frame.ip += 1;

            let Some(instruction) = chunk.code.get(address).copied() else {
                return Err(self.fault(chunk, address, format!("instruction pointer {} out of bounds", address)));
            };
            debugger.observe(chunk, self, address);

            if let Err(message) = self.step(chunk, instruction) {
                return Err(self.fault(chunk, address, message));
            }
            if self.stack.len() > self.config.max_stack_bytes {
                let message = format!("stack overflow: more than {} bytes", self.config.max_stack_bytes);
                return Err(self.fault(chunk, address, message));
            }
        }
    }

    fn fault(&self, chunk: &Chunk, address: usize, message: String) -> RuntimeError {
        let slice = chunk.slices.get(address).copied().unwrap_or_default();
        debug!(target: "rill::vm", address, %message, frames = self.frames.len(), "runtime fault");
        RuntimeError::new(slice, message).with_position(chunk.position(slice.index))
    }

    fn base(&self) -> usize {
        self.frames.last().map_or(0, |f| f.base)
    }

    fn jump(&mut self, target: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = target;
        }
    }

    fn step(&mut self, chunk: &Chunk, instruction: Instruction) -> Result<(), String> {
        match instruction {
            Instruction::Constant(index) => match chunk.constants.get(index) {
                Some(Constant::Int(n)) => self.stack.push_int(*n),
                Some(Constant::Float(n)) => self.stack.push_float(*n),
                Some(Constant::String(handle)) => self.stack.push_string(*handle),
                None => return Err(format!("constant {} out of range", index)),
            },
            Instruction::True => self.stack.push_bool(true),
            Instruction::False => self.stack.push_bool(false),

            Instruction::Pop(size) => self.stack.pop(size).ok_or_else(underflow)?,
            Instruction::Squash { keep, drop } => self.stack.squash(keep, drop).ok_or_else(underflow)?,

            Instruction::LoadLocal { offset, size } => {
                let at = self.base() + offset;
                self.stack.load(at, size).ok_or_else(underflow)?
            }
            Instruction::StoreLocal { offset, size } => {
                let at = self.base() + offset;
                self.stack.store(at, size).ok_or_else(underflow)?
            }

            Instruction::Binary(op, primitive) => self.binary(op, primitive)?,
            Instruction::Negate(Primitive::Int) => {
                let n = self.stack.pop_int().ok_or_else(underflow)?;
                self.stack.push_int(n.checked_neg().ok_or_else(overflow)?);
            }
            Instruction::Negate(Primitive::Float) => {
                let n = self.stack.pop_float().ok_or_else(underflow)?;
                self.stack.push_float(-n);
            }
            Instruction::Negate(primitive) => return Err(format!("cannot negate {:?}", primitive)),
            Instruction::Not => {
                let b = self.stack.pop_bool().ok_or_else(underflow)?;
                self.stack.push_bool(!b);
            }

            Instruction::Jump(target) => self.jump(target),
            Instruction::JumpIfFalse(target) => {
                if !self.stack.pop_bool().ok_or_else(underflow)? {
                    self.jump(target);
                }
            }
            Instruction::JumpIfTrue(target) => {
                if self.stack.pop_bool().ok_or_else(underflow)? {
                    self.jump(target);
                }
            }

            Instruction::Call(index) => self.call_function(chunk, index)?,
            Instruction::CallNative(index) => self.call_native(chunk, index)?,
            Instruction::Return(size) => {
                let frame = self.frames.pop().ok_or("return without a frame")?;
                let (bytes, types) = self.stack.pop_tagged(size).ok_or_else(underflow)?;
                self.stack.truncate(frame.base);
                self.stack.push_tagged(&bytes, &types);
            }

            Instruction::MakeStruct(ty) => self.stack.retag(ty.size(), ty).ok_or_else(underflow)?,
            Instruction::Field { offset, ty, struct_size } => {
                let bytes = self.stack.pop_bytes(struct_size).ok_or_else(underflow)?;
                let field = bytes
                    .get(offset..offset + ty.size())
                    .ok_or_else(|| format!("field at {} outside struct of {} bytes", offset, struct_size))?;
                self.stack.push_bytes(field, ty);
            }

            Instruction::DebugPushLocal { name, ty, offset } => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.locals.push(ShadowLocal { name, ty, offset });
                }
            }
            Instruction::DebugPopLocals(count) => {
                if let Some(frame) = self.frames.last_mut() {
                    let keep = frame.locals.len().saturating_sub(count);
                    frame.locals.truncate(keep);
                }
            }
        }
        Ok(())
    }

    fn binary(&mut self, op: BinaryOp, primitive: Primitive) -> Result<(), String> {
        match primitive {
            Primitive::Int => {
                let b = self.stack.pop_int().ok_or_else(underflow)?;
                let a = self.stack.pop_int().ok_or_else(underflow)?;
                if let Some(result) = compare(op, &a, &b) {
                    self.stack.push_bool(result);
                    return Ok(());
                }
                let result = match op {
                    BinaryOp::Add => a.checked_add(b),
                    BinaryOp::Subtract => a.checked_sub(b),
                    BinaryOp::Multiply => a.checked_mul(b),
                    BinaryOp::Divide | BinaryOp::Remainder if b == 0 => {
                        return Err("division by zero".to_string());
                    }
                    BinaryOp::Divide => a.checked_div(b),
                    BinaryOp::Remainder => a.checked_rem(b),
                    _ => return Err(format!("invalid integer operator {:?}", op)),
                };
                self.stack.push_int(result.ok_or_else(overflow)?);
            }
            Primitive::Float => {
                let b = self.stack.pop_float().ok_or_else(underflow)?;
                let a = self.stack.pop_float().ok_or_else(underflow)?;
                if let Some(result) = compare(op, &a, &b) {
                    self.stack.push_bool(result);
                    return Ok(());
                }
                let result = match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Subtract => a - b,
                    BinaryOp::Multiply => a * b,
                    BinaryOp::Divide => a / b,
                    BinaryOp::Remainder => a % b,
                    _ => return Err(format!("invalid float operator {:?}", op)),
                };
                self.stack.push_float(result);
            }
            Primitive::Bool => {
                let b = self.stack.pop_bool().ok_or_else(underflow)?;
                let a = self.stack.pop_bool().ok_or_else(underflow)?;
                match op {
                    BinaryOp::Equal => self.stack.push_bool(a == b),
                    BinaryOp::NotEqual => self.stack.push_bool(a != b),
                    _ => return Err(format!("invalid bool operator {:?}", op)),
                }
            }
            Primitive::String => {
                let b = self.stack.pop_string().ok_or_else(underflow)?;
                let a = self.stack.pop_string().ok_or_else(underflow)?;
                let (a, b) = match (self.strings.get(a), self.strings.get(b)) {
                    (Some(a), Some(b)) => (Rc::clone(a), Rc::clone(b)),
                    _ => return Err("dangling string handle".to_string()),
                };
                match op {
                    BinaryOp::Add => {
                        let handle = self.strings.push(format!("{}{}", a, b));
                        self.stack.push_string(handle);
                    }
                    BinaryOp::Equal => self.stack.push_bool(a == b),
                    BinaryOp::NotEqual => self.stack.push_bool(a != b),
                    _ => return Err(format!("invalid string operator {:?}", op)),
                }
            }
        }
        Ok(())
    }

    fn push_frame(&mut self, frame: CallFrame) -> Result<(), String> {
        if self.frames.len() >= self.config.max_frames {
            return Err(format!("stack overflow: more than {} call frames", self.config.max_frames));
        }
        self.frames.push(frame);
        Ok(())
    }

    fn call_function(&mut self, chunk: &Chunk, index: usize) -> Result<(), String> {
        let function = chunk
            .functions
            .get(index)
            .ok_or_else(|| format!("no function with index {}", index))?;
        let function_type = chunk
            .function_types
            .get(function.type_index)
            .ok_or_else(|| format!("function '{}' has no type", function.name))?;
        let base = self
            .stack
            .len()
            .checked_sub(function_type.parameter_size)
            .ok_or_else(underflow)?;
        trace!(target: "rill::vm", function = %function.name, base, "call");
        self.push_frame(CallFrame::new(FrameKind::Function, index, function.entry, base))
    }

    /// Invoke a host callback synchronously. On failure the native frame is
    /// left on the stack for the trace.
    fn call_native(&mut self, chunk: &Chunk, index: usize) -> Result<(), String> {
        let native = chunk
            .natives
            .get(index)
            .ok_or_else(|| format!("no native function with index {}", index))?;
        let function_type = chunk
            .function_types
            .get(native.type_index)
            .ok_or_else(|| format!("native function '{}' has no type", native.name))?;
        let base = self
            .stack
            .len()
            .checked_sub(function_type.parameter_size)
            .ok_or_else(underflow)?;
        let kind = if native.builtin {
            FrameKind::AutoNativeFunction
        } else {
            FrameKind::NativeFunction
        };
        trace!(target: "rill::vm", native = %native.name, "call native");
        self.push_frame(CallFrame::new(kind, index, 0, base))?;

        let (args, tags) = self
            .stack
            .pop_tagged(function_type.parameter_size)
            .ok_or_else(underflow)?;
        let callback = Rc::clone(&native.callback);
        let mut context = RuntimeContext::new(
            &native.name,
            &args,
            &tags,
            &function_type.parameters,
            function_type.return_type,
            &chunk.types,
            &mut self.strings,
        );
        let bytes = callback(&mut context)
            .and_then(|()| context.finish())
            .map_err(|e| format!("native function '{}' failed: {}", native.name, e))?;
        if bytes.len() != function_type.return_type.size() {
            return Err(format!(
                "native function '{}' returned {} bytes, expected {}",
                native.name,
                bytes.len(),
                function_type.return_type.size()
            ));
        }

        self.frames.pop();
        self.stack.push_bytes(&bytes, function_type.return_type);
        Ok(())
    }

    /// Render the live frames, outermost first. Managed frames show their
    /// current line and its source text; native frames show their name only.
    pub fn trace_call_stack(&self, chunk: &Chunk) -> String {
        let mut trace = String::new();
        for frame in &self.frames {
            match frame.kind {
                FrameKind::EntryPoint => {}
                FrameKind::Function => {
                    let name = chunk.functions.get(frame.function).map_or("?", |f| f.name.as_str());
                    let address = frame.ip.saturating_sub(1);
                    match chunk.instruction_position(address) {
                        Some(position) => {
                            let _ = writeln!(trace, "  at {} ({})", name, position);
                            let text = chunk.slices.get(address).and_then(|s| chunk.line_text(s.index));
                            if let Some(text) = text {
                                let _ = writeln!(trace, "      {}", text.trim());
                            }
                        }
                        None => {
                            let _ = writeln!(trace, "  at {}", name);
                        }
                    }
                }
                FrameKind::NativeFunction | FrameKind::AutoNativeFunction => {
                    let name = chunk.natives.get(frame.function).map_or("?", |n| n.name.as_str());
                    let tag = if frame.kind == FrameKind::AutoNativeFunction {
                        "builtin"
                    } else {
                        "native"
                    };
                    let _ = writeln!(trace, "  at {} [{}]", name, tag);
                }
            }
        }
        trace
    }
}

/// Evaluate a comparison operator; `None` for arithmetic operators.
fn compare<T: PartialOrd>(op: BinaryOp, a: &T, b: &T) -> Option<bool> {
    match op {
        BinaryOp::Equal => Some(a == b),
        BinaryOp::NotEqual => Some(a != b),
        BinaryOp::Less => Some(a < b),
        BinaryOp::LessEqual => Some(a <= b),
        BinaryOp::Greater => Some(a > b),
        BinaryOp::GreaterEqual => Some(a >= b),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Function, FunctionType};
    use crate::compiler::Mode;
    use crate::token::Slice;

    /// Build a chunk with a single zero-argument function over `code`.
    fn chunk(code: &[Instruction], constants: &[Constant], return_type: ValueType) -> Chunk {
        let mut chunk = Chunk::new(Mode::Release);
        chunk.add_source("vm.rill", "line one\nline two");
        for constant in constants {
            chunk.add_constant(*constant);
        }
        let type_index = chunk.add_function_type(FunctionType::new(Vec::new(), return_type));
        chunk.functions.push(Function {
            name: "test".into(),
            type_index,
            entry: 0,
            parameter_names: Vec::new(),
            slice: Slice::new(0, 4),
        });
        for (i, instruction) in code.iter().enumerate() {
            chunk.write(*instruction, Slice::new(if i < 2 { 0 } else { 9 }, 4));
        }
        chunk
    }

    fn run(chunk: &Chunk) -> Result<Vec<u8>, RuntimeError> {
        let mut vm = VirtualMachine::new(VmConfig::default());
        vm.reset(chunk);
        vm.execute(chunk, 0, &mut Debugger::new())
    }

    #[test]
    fn test_arithmetic() {
        let code = [
            Instruction::Constant(0),
            Instruction::Constant(1),
            Instruction::Binary(BinaryOp::Multiply, Primitive::Int),
            Instruction::Return(8),
        ];
        let chunk = chunk(&code, &[Constant::Int(6), Constant::Int(7)], ValueType::Int);
        let bytes = run(&chunk).unwrap();
        assert_eq!(i64::from_le_bytes(bytes.try_into().unwrap()), 42);
    }

    #[test]
    fn test_division_by_zero_faults_with_position() {
        let code = [
            Instruction::Constant(0),
            Instruction::Constant(1),
            Instruction::Binary(BinaryOp::Divide, Primitive::Int),
            Instruction::Return(8),
        ];
        let chunk = chunk(&code, &[Constant::Int(1), Constant::Int(0)], ValueType::Int);
        let mut vm = VirtualMachine::new(VmConfig::default());
        vm.reset(&chunk);
        let error = vm.execute(&chunk, 0, &mut Debugger::new()).unwrap_err();
        assert_eq!(error.message, "division by zero");
        assert_eq!(error.position.as_ref().map(|p| p.line), Some(2));

        // Frames survive the fault for the trace.
        assert_eq!(vm.frames().len(), 2);
        let trace = vm.trace_call_stack(&chunk);
        assert!(trace.contains("at test (vm.rill:2)"));
        assert!(trace.contains("line two"));
    }

    #[test]
    fn test_integer_overflow() {
        let code = [
            Instruction::Constant(0),
            Instruction::Constant(1),
            Instruction::Binary(BinaryOp::Add, Primitive::Int),
            Instruction::Return(8),
        ];
        let chunk = chunk(&code, &[Constant::Int(i64::MAX), Constant::Int(1)], ValueType::Int);
        assert_eq!(run(&chunk).unwrap_err().message, "integer overflow");
    }

    #[test]
    fn test_frame_limit() {
        // The function calls itself forever.
        let code = [Instruction::Call(0), Instruction::Return(0)];
        let chunk = chunk(&code, &[], ValueType::Unit);
        let mut vm = VirtualMachine::new(VmConfig {
            max_frames: 8,
            ..VmConfig::default()
        });
        vm.reset(&chunk);
        let error = vm.execute(&chunk, 0, &mut Debugger::new()).unwrap_err();
        assert!(error.message.starts_with("stack overflow"));
        assert_eq!(vm.frames().len(), 8);
    }

    #[test]
    fn test_stack_byte_limit() {
        // Each activation leaves an int below the next call.
        let code = [Instruction::Constant(0), Instruction::Call(0), Instruction::Return(0)];
        let chunk = chunk(&code, &[Constant::Int(1)], ValueType::Unit);
        let mut vm = VirtualMachine::new(VmConfig {
            max_stack_bytes: 64,
            ..VmConfig::default()
        });
        vm.reset(&chunk);
        let error = vm.execute(&chunk, 0, &mut Debugger::new()).unwrap_err();
        assert_eq!(error.message, "stack overflow: more than 64 bytes");
        assert!(vm.stack().len() > 64);
    }

    #[test]
    fn test_string_concatenation() {
        let mut chunk = chunk(&[], &[], ValueType::String);
        let a = chunk.add_string("foo");
        let b = chunk.add_string("bar");
        chunk.write(Instruction::Constant(a), Slice::new(0, 1));
        chunk.write(Instruction::Constant(b), Slice::new(0, 1));
        chunk.write(Instruction::Binary(BinaryOp::Add, Primitive::String), Slice::new(0, 1));
        chunk.write(Instruction::Return(4), Slice::new(0, 1));

        let mut vm = VirtualMachine::new(VmConfig::default());
        vm.reset(&chunk);
        let bytes = vm.execute(&chunk, 0, &mut Debugger::new()).unwrap();
        let handle = u32::from_le_bytes(bytes.try_into().unwrap());
        assert_eq!(vm.strings().get(handle).map(|s| s.to_string()), Some("foobar".to_string()));
    }
}
