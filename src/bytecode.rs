//! Bytecode instructions and the compiled chunk
//!
//! A chunk owns everything the VM needs to run a compiled program: the
//! instruction stream with one source slice per instruction, constants,
//! function and native tables, struct layouts and the source registry.

use crate::compiler::Mode;
use crate::marshal::NativeCallback;
use crate::token::Slice;
use crate::value::{TypeRegistry, ValueType};
use std::fmt;
use std::fmt::Write as _;
use std::rc::Rc;

/// Arithmetic and comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        !matches!(
            self,
            BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Remainder
        )
    }
}

/// Operand kind of a typed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Bool,
    Int,
    Float,
    String,
}

impl Primitive {
    pub fn of(ty: ValueType) -> Option<Primitive> {
        match ty {
            ValueType::Bool => Some(Primitive::Bool),
            ValueType::Int => Some(Primitive::Int),
            ValueType::Float => Some(Primitive::Float),
            ValueType::String => Some(Primitive::String),
            _ => None,
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Primitive::Bool => ValueType::Bool,
            Primitive::Int => ValueType::Int,
            Primitive::Float => ValueType::Float,
            Primitive::String => ValueType::String,
        }
    }
}

/// Instructions for the VM. Sizes and offsets are in value-stack bytes;
/// local offsets are relative to the frame's base.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    // Constants and literals
    Constant(usize),
    True,
    False,

    // Stack manipulation
    Pop(usize),
    /// Remove `drop` bytes beneath the top `keep` bytes (scope exit).
    Squash { keep: usize, drop: usize },

    // Locals
    LoadLocal { offset: usize, size: usize },
    StoreLocal { offset: usize, size: usize },

    // Arithmetic, comparison, logic
    Binary(BinaryOp, Primitive),
    Negate(Primitive),
    Not,

    // Control flow (absolute addresses)
    Jump(usize),
    JumpIfFalse(usize),
    JumpIfTrue(usize),

    // Functions
    Call(usize),
    CallNative(usize),
    Return(usize),

    // Structs
    MakeStruct(ValueType),
    Field { offset: usize, ty: ValueType, struct_size: usize },

    // Debug-mode shadow locals
    DebugPushLocal { name: usize, ty: ValueType, offset: usize },
    DebugPopLocals(usize),
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Constant(idx) => write!(f, "CONSTANT {:04}", idx),
            Instruction::True => write!(f, "TRUE"),
            Instruction::False => write!(f, "FALSE"),
            Instruction::Pop(size) => write!(f, "POP {}", size),
            Instruction::Squash { keep, drop } => write!(f, "SQUASH keep:{} drop:{}", keep, drop),
            Instruction::LoadLocal { offset, size } => write!(f, "LOAD_LOCAL @{} ({})", offset, size),
            Instruction::StoreLocal { offset, size } => write!(f, "STORE_LOCAL @{} ({})", offset, size),
            Instruction::Binary(op, primitive) => write!(f, "{:?}_{:?}", op, primitive),
            Instruction::Negate(primitive) => write!(f, "NEGATE_{:?}", primitive),
            Instruction::Not => write!(f, "NOT"),
            Instruction::Jump(target) => write!(f, "JUMP -> {:04}", target),
            Instruction::JumpIfFalse(target) => write!(f, "JUMP_IF_FALSE -> {:04}", target),
            Instruction::JumpIfTrue(target) => write!(f, "JUMP_IF_TRUE -> {:04}", target),
            Instruction::Call(index) => write!(f, "CALL fn#{}", index),
            Instruction::CallNative(index) => write!(f, "CALL_NATIVE native#{}", index),
            Instruction::Return(size) => write!(f, "RETURN ({})", size),
            Instruction::MakeStruct(ty) => write!(f, "MAKE_STRUCT {}", ty),
            Instruction::Field { offset, ty, .. } => write!(f, "FIELD @{} {}", offset, ty),
            Instruction::DebugPushLocal { name, ty, offset } => {
                write!(f, "DEBUG_PUSH_LOCAL name#{} {} @{}", name, ty, offset)
            }
            Instruction::DebugPopLocals(count) => write!(f, "DEBUG_POP_LOCALS {}", count),
        }
    }
}

/// Constant pool entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
    /// Index into the chunk's string table.
    String(u32),
}

/// Structural function signature shared by managed and native functions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub return_type: ValueType,
    pub parameters: Vec<ValueType>,
    /// Total value-stack bytes taken by the parameters.
    pub parameter_size: usize,
}

impl FunctionType {
    pub fn new(parameters: Vec<ValueType>, return_type: ValueType) -> Self {
        let parameter_size = parameters.iter().map(ValueType::size).sum();
        Self {
            return_type,
            parameters,
            parameter_size,
        }
    }
}

/// A compiled managed function.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub type_index: usize,
    /// Address of the first instruction.
    pub entry: usize,
    pub parameter_names: Vec<String>,
    /// Where the function was declared.
    pub slice: Slice,
}

/// A host function callable from bytecode.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: String,
    pub type_index: usize,
    pub callback: NativeCallback,
    /// Registered by the session prelude rather than by the host.
    pub builtin: bool,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("type_index", &self.type_index)
            .field("builtin", &self.builtin)
            .finish()
    }
}

/// A source file registered with the chunk. `offset` is where its bytes
/// start in the chunk-wide index space used by every [`Slice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub uri: String,
    pub content: String,
    pub offset: usize,
}

impl Source {
    pub fn contains(&self, index: usize) -> bool {
        index >= self.offset && index <= self.offset + self.content.len()
    }
}

/// A resolved 1-based source line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourcePosition {
    pub uri: String,
    pub line: usize,
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uri, self.line)
    }
}

/// A chunk of bytecode with associated data
#[derive(Debug, Clone)]
pub struct Chunk {
    pub mode: Mode,

    /// The bytecode instructions
    pub code: Vec<Instruction>,

    /// Source slice of each instruction
    pub slices: Vec<Slice>,

    /// Constant pool
    pub constants: Vec<Constant>,

    /// String literals referenced by string constants
    pub strings: Vec<Rc<str>>,

    /// Local names referenced by debug instructions
    pub names: Vec<String>,

    pub function_types: Vec<FunctionType>,
    pub functions: Vec<Function>,
    pub natives: Vec<NativeFunction>,

    /// Struct layouts visible to this chunk
    pub types: TypeRegistry,

    /// Ordered source registry
    pub sources: Vec<Source>,
}

impl Chunk {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            code: Vec::new(),
            slices: Vec::new(),
            constants: Vec::new(),
            strings: Vec::new(),
            names: Vec::new(),
            function_types: Vec::new(),
            functions: Vec::new(),
            natives: Vec::new(),
            types: TypeRegistry::new(),
            sources: Vec::new(),
        }
    }

    /// Write an instruction and return its address
    pub fn write(&mut self, instruction: Instruction, slice: Slice) -> usize {
        self.code.push(instruction);
        self.slices.push(slice);
        self.code.len() - 1
    }

    /// Get current code length (for jump patching)
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Point the jump at `address` to `target`.
    pub fn patch_jump(&mut self, address: usize, target: usize) {
        match &mut self.code[address] {
            Instruction::Jump(t) | Instruction::JumpIfFalse(t) | Instruction::JumpIfTrue(t) => *t = target,
            other => debug_assert!(false, "patching non-jump instruction {}", other),
        }
    }

    /// Add a constant and return its index
    pub fn add_constant(&mut self, constant: Constant) -> usize {
        if let Some(idx) = self.constants.iter().position(|c| *c == constant) {
            return idx;
        }
        self.constants.push(constant);
        self.constants.len() - 1
    }

    /// Add a string literal and return its constant index
    pub fn add_string(&mut self, value: &str) -> usize {
        let string_index = match self.strings.iter().position(|s| &**s == value) {
            Some(idx) => idx,
            None => {
                self.strings.push(Rc::from(value));
                self.strings.len() - 1
            }
        };
        self.add_constant(Constant::String(string_index as u32))
    }

    /// Add a name and return its index
    pub fn add_name(&mut self, name: &str) -> usize {
        // Check if name already exists
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            return idx;
        }
        self.names.push(name.to_string());
        self.names.len() - 1
    }

    /// Intern a function type; structurally equal types share an index.
    pub fn add_function_type(&mut self, function_type: FunctionType) -> usize {
        if let Some(idx) = self.function_types.iter().position(|t| *t == function_type) {
            return idx;
        }
        self.function_types.push(function_type);
        self.function_types.len() - 1
    }

    /// Register a source and return the offset its slices are shifted by.
    pub fn add_source(&mut self, uri: &str, content: &str) -> usize {
        let offset = self
            .sources
            .last()
            .map_or(0, |s| s.offset + s.content.len() + 1);
        self.sources.push(Source {
            uri: uri.to_string(),
            content: content.to_string(),
            offset,
        });
        offset
    }

    /// The source owning chunk-wide byte `index`.
    pub fn source_for(&self, index: usize) -> Option<&Source> {
        let position = self.sources.partition_point(|s| s.offset <= index);
        let source = self.sources.get(position.checked_sub(1)?)?;
        source.contains(index).then_some(source)
    }

    pub fn source_by_uri(&self, uri: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.uri == uri)
    }

    /// Resolve a byte index to its source and 1-based line.
    pub fn position(&self, index: usize) -> Option<SourcePosition> {
        let source = self.source_for(index)?;
        let local = index - source.offset;
        let line = source.content[..local.min(source.content.len())]
            .bytes()
            .filter(|b| *b == b'\n')
            .count()
            + 1;
        Some(SourcePosition {
            uri: source.uri.clone(),
            line,
        })
    }

    /// Position of the instruction at `address`.
    pub fn instruction_position(&self, address: usize) -> Option<SourcePosition> {
        self.slices.get(address).and_then(|slice| self.position(slice.index))
    }

    /// Text of the line containing byte `index`, without its newline.
    pub fn line_text(&self, index: usize) -> Option<&str> {
        let source = self.source_for(index)?;
        let local = (index - source.offset).min(source.content.len());
        let start = source.content[..local].rfind('\n').map_or(0, |i| i + 1);
        let end = source.content[local..]
            .find('\n')
            .map_or(source.content.len(), |i| local + i);
        Some(&source.content[start..end])
    }

    /// Chunk-wide byte region of 1-based `line` in `uri`.
    pub fn line_region(&self, uri: &str, line: usize) -> Option<Slice> {
        let source = self.source_by_uri(uri)?;
        let mut start = 0;
        for (number, text) in source.content.split('\n').enumerate() {
            if number + 1 == line {
                return Some(Slice::new(source.offset + start, text.len()));
            }
            start += text.len() + 1;
        }
        None
    }

    /// Index of the managed function whose body contains `address`.
    pub fn function_at(&self, address: usize) -> Option<usize> {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, f)| f.entry <= address)
            .max_by_key(|(_, f)| f.entry)
            .map(|(i, _)| i)
    }

    /// Human-readable signature such as `add(a: int, b: int) -> int`.
    pub fn signature(&self, function: &Function) -> String {
        let Some(function_type) = self.function_types.get(function.type_index) else {
            return function.name.clone();
        };
        let params: Vec<String> = function_type
            .parameters
            .iter()
            .enumerate()
            .map(|(i, ty)| match function.parameter_names.get(i) {
                Some(name) => format!("{}: {}", name, self.types.type_name(*ty)),
                None => self.types.type_name(*ty),
            })
            .collect();
        format!(
            "{}({}) -> {}",
            function.name,
            params.join(", "),
            self.types.type_name(function_type.return_type)
        )
    }

    /// Disassemble every function, annotating instructions with the source
    /// line they came from whenever the line changes.
    pub fn disassemble(&self) -> String {
        let mut result = String::new();
        let mut order: Vec<&Function> = self.functions.iter().collect();
        order.sort_by_key(|f| f.entry);

        for (i, function) in order.iter().enumerate() {
            let end = order.get(i + 1).map_or(self.code.len(), |next| next.entry);
            let _ = writeln!(result, "== {} ==", self.signature(function));

            let mut last_position: Option<SourcePosition> = None;
            for address in function.entry..end {
                let position = self.instruction_position(address);
                if position.is_some() && position != last_position {
                    if let Some(text) = self.slices.get(address).and_then(|s| self.line_text(s.index)) {
                        let _ = writeln!(result, "     ; {}", text.trim());
                    }
                }
                let line = position.as_ref().map_or(0, |p| p.line);
                let _ = writeln!(result, "{}", self.disassemble_instruction(address, line));
                last_position = position;
            }
        }

        result
    }

    fn disassemble_instruction(&self, address: usize, line: usize) -> String {
        let instruction = self.code[address];
        let detail = match instruction {
            Instruction::Constant(idx) => match self.constants.get(idx) {
                Some(Constant::Int(n)) => format!(" '{}'", n),
                Some(Constant::Float(n)) => format!(" '{:?}'", n),
                Some(Constant::String(s)) => self
                    .strings
                    .get(*s as usize)
                    .map_or(String::new(), |s| format!(" {:?}", s)),
                None => String::new(),
            },
            Instruction::DebugPushLocal { name, .. } => self
                .names
                .get(name)
                .map_or(String::new(), |n| format!(" '{}'", n)),
            _ => String::new(),
        };
        format!("{:04} {:4} {}{}", address, line, instruction, detail)
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new(Mode::Debug)
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.disassemble())
    }
}
