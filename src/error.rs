//! Error types for rill
//!
//! Compile errors are collected, never raised; a runtime error is terminal
//! for its run; native errors travel between host callbacks and the VM.

use crate::bytecode::SourcePosition;
use crate::token::Slice;
use crate::value::ValueType;
use thiserror::Error;

/// A static diagnostic produced while compiling or while registering host
/// functions and structs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CompileError {
    pub slice: Slice,
    pub message: String,
}

impl CompileError {
    pub fn new(slice: Slice, message: impl Into<String>) -> Self {
        Self {
            slice,
            message: message.into(),
        }
    }

    /// A diagnostic with no source location (host registration mistakes).
    pub fn detached(message: impl Into<String>) -> Self {
        Self::new(Slice::default(), message)
    }
}

/// A fault raised while executing bytecode. At most one per run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RuntimeError {
    /// Resolved source position of the faulting instruction, if known.
    pub position: Option<SourcePosition>,
    pub slice: Slice,
    pub message: String,
}

impl RuntimeError {
    pub fn new(slice: Slice, message: impl Into<String>) -> Self {
        Self {
            position: None,
            slice,
            message: message.into(),
        }
    }

    pub fn with_position(mut self, position: Option<SourcePosition>) -> Self {
        self.position = position;
        self
    }
}

/// Errors crossing the host/VM boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NativeError {
    #[error("argument {index} out of range ({count} declared)")]
    ArgumentIndex { index: usize, count: usize },

    #[error("argument {index} has type {found}, expected {expected}")]
    ArgumentType {
        index: usize,
        expected: ValueType,
        found: ValueType,
    },

    #[error("return value has type {found}, expected {expected}")]
    ReturnType { expected: ValueType, found: ValueType },

    #[error("return value already set")]
    DuplicateReturn,

    #[error("native function '{0}' returned no value")]
    MissingReturn(String),

    #[error("struct '{0}' is not registered")]
    UnknownStruct(String),

    #[error("native function has no name")]
    MissingName,

    #[error("{0}")]
    Failed(String),
}

impl NativeError {
    /// Convenience for host callbacks reporting their own failures.
    pub fn failed(message: impl Into<String>) -> Self {
        NativeError::Failed(message.into())
    }
}
