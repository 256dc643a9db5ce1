//! Rill - An embeddable, statically typed scripting runtime
//!
//! Source is compiled in a single pass to bytecode and executed by a VM with
//! a typed value stack. Hosts register native functions and structs, call
//! compiled functions through typed handles, and can pause execution on
//! source-line breakpoints.

pub mod token;
pub mod lexer;
pub mod parser;
pub mod value;
pub mod stack;
pub mod error;
pub mod bytecode;
pub mod compiler;
pub mod marshal;
pub mod vm;
pub mod debugger;
pub mod session;

pub use bytecode::{Chunk, SourcePosition};
pub use compiler::{CompileOptions, Mode};
pub use debugger::{Breakpoint, LocalVariable};
pub use error::{CompileError, NativeError, RuntimeError};
pub use marshal::{DefinitionContext, FunctionHandle, HostStruct, Marshal, MarshalArgs, Reader, RuntimeContext, Writer};
pub use session::Session;
pub use value::{Value, ValueType};
pub use vm::VmConfig;

/// Version of the rill runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
