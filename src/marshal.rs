//! Native interop: typed signatures and value conversion across the
//! host/VM boundary.
//!
//! A native function is registered with two callbacks. The definition
//! callback runs once against a [`DefinitionContext`] and declares the
//! function's name, ordered parameters and return type; its outcome is an
//! explicit [`DefinitionOutcome`]. The runtime callback runs on every call
//! against a [`RuntimeContext`] that hands out typed arguments and accepts the
//! typed return value.

use crate::error::NativeError;
use crate::value::{StringArena, TypeRegistry, ValueType, BOOL_SIZE, FLOAT_SIZE, INT_SIZE, STRING_SIZE};
use std::marker::PhantomData;
use std::rc::Rc;

/// Host callback invoked by the VM for a native call.
pub type NativeCallback = Rc<dyn Fn(&mut RuntimeContext<'_>) -> Result<(), NativeError>>;

/// Cursor over the bytes of one marshaled value.
pub struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
    strings: &'a StringArena,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8], strings: &'a StringArena) -> Self {
        Self {
            bytes,
            position: 0,
            strings,
        }
    }

    pub fn read<T: Marshal>(&mut self) -> Result<T, NativeError> {
        T::read(self)
    }

    /// Take the next `size` raw bytes.
    pub fn take(&mut self, size: usize) -> Result<&'a [u8], NativeError> {
        let end = self.position + size;
        let bytes = self
            .bytes
            .get(self.position..end)
            .ok_or_else(|| NativeError::failed("value truncated while marshaling"))?;
        self.position = end;
        Ok(bytes)
    }

    pub fn string(&self, handle: u32) -> Result<String, NativeError> {
        self.strings
            .get(handle)
            .map(|s| s.to_string())
            .ok_or_else(|| NativeError::failed(format!("dangling string handle {}", handle)))
    }
}

/// Accumulates the bytes of marshaled values.
pub struct Writer<'a> {
    bytes: Vec<u8>,
    strings: &'a mut StringArena,
}

impl<'a> Writer<'a> {
    pub fn new(strings: &'a mut StringArena) -> Self {
        Self {
            bytes: Vec::new(),
            strings,
        }
    }

    pub fn write<T: Marshal>(&mut self, value: T) {
        value.write(self)
    }

    pub fn put(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Store a string in the run's arena and return its handle.
    pub fn intern(&mut self, value: String) -> u32 {
        self.strings.push(value)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// A host type with a fixed value-stack layout.
pub trait Marshal: Sized {
    /// The VM type this host type maps to.
    fn value_type(types: &TypeRegistry) -> Result<ValueType, NativeError>;

    fn read(reader: &mut Reader<'_>) -> Result<Self, NativeError>;

    fn write(self, writer: &mut Writer<'_>);
}

impl Marshal for () {
    fn value_type(_types: &TypeRegistry) -> Result<ValueType, NativeError> {
        Ok(ValueType::Unit)
    }

    fn read(_reader: &mut Reader<'_>) -> Result<Self, NativeError> {
        Ok(())
    }

    fn write(self, _writer: &mut Writer<'_>) {}
}

impl Marshal for bool {
    fn value_type(_types: &TypeRegistry) -> Result<ValueType, NativeError> {
        Ok(ValueType::Bool)
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, NativeError> {
        Ok(reader.take(BOOL_SIZE)?[0] != 0)
    }

    fn write(self, writer: &mut Writer<'_>) {
        writer.put(&[self as u8]);
    }
}

impl Marshal for i64 {
    fn value_type(_types: &TypeRegistry) -> Result<ValueType, NativeError> {
        Ok(ValueType::Int)
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, NativeError> {
        let bytes = reader.take(INT_SIZE)?;
        let mut raw = [0u8; INT_SIZE];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    fn write(self, writer: &mut Writer<'_>) {
        writer.put(&self.to_le_bytes());
    }
}

impl Marshal for f64 {
    fn value_type(_types: &TypeRegistry) -> Result<ValueType, NativeError> {
        Ok(ValueType::Float)
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, NativeError> {
        let bytes = reader.take(FLOAT_SIZE)?;
        let mut raw = [0u8; FLOAT_SIZE];
        raw.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(raw))
    }

    fn write(self, writer: &mut Writer<'_>) {
        writer.put(&self.to_le_bytes());
    }
}

impl Marshal for String {
    fn value_type(_types: &TypeRegistry) -> Result<ValueType, NativeError> {
        Ok(ValueType::String)
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, NativeError> {
        let bytes = reader.take(STRING_SIZE)?;
        let mut raw = [0u8; STRING_SIZE];
        raw.copy_from_slice(bytes);
        reader.string(u32::from_le_bytes(raw))
    }

    fn write(self, writer: &mut Writer<'_>) {
        let handle = writer.intern(self);
        writer.put(&handle.to_le_bytes());
    }
}

/// A host struct whose field layout can be registered with a session.
///
/// Its `Marshal` impl must read and write the fields in the declared order.
pub trait HostStruct: Marshal {
    const NAME: &'static str;

    fn fields(types: &TypeRegistry) -> Result<Vec<(&'static str, ValueType)>, NativeError>;

    /// The registered type of this struct, for use in `Marshal::value_type`.
    fn registered_type(types: &TypeRegistry) -> Result<ValueType, NativeError> {
        types
            .lookup(Self::NAME)
            .ok_or_else(|| NativeError::UnknownStruct(Self::NAME.to_string()))
    }
}

/// An ordered argument list (tuples of `Marshal` types).
pub trait MarshalArgs: Sized {
    fn value_types(types: &TypeRegistry) -> Result<Vec<ValueType>, NativeError>;

    fn write_all(self, writer: &mut Writer<'_>);
}

impl MarshalArgs for () {
    fn value_types(_types: &TypeRegistry) -> Result<Vec<ValueType>, NativeError> {
        Ok(Vec::new())
    }

    fn write_all(self, _writer: &mut Writer<'_>) {}
}

macro_rules! impl_marshal_args {
    ($($name:ident $var:ident),+) => {
        impl<$($name: Marshal),+> MarshalArgs for ($($name,)+) {
            fn value_types(types: &TypeRegistry) -> Result<Vec<ValueType>, NativeError> {
                Ok(vec![$($name::value_type(types)?),+])
            }

            fn write_all(self, writer: &mut Writer<'_>) {
                let ($($var,)+) = self;
                $(writer.write($var);)+
            }
        }
    };
}

impl_marshal_args!(A a);
impl_marshal_args!(A a, B b);
impl_marshal_args!(A a, B b, C c);
impl_marshal_args!(A a, B b, C c, D d);

/// Collects a native function's declared signature.
pub struct DefinitionContext<'a> {
    types: &'a TypeRegistry,
    name: Option<String>,
    parameters: Vec<(String, ValueType)>,
    return_type: Option<ValueType>,
}

impl<'a> DefinitionContext<'a> {
    pub fn new(types: &'a TypeRegistry) -> Self {
        Self {
            types,
            name: None,
            parameters: Vec::new(),
            return_type: None,
        }
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// Declare the next parameter with the type of `T`.
    pub fn param<T: Marshal>(&mut self, name: &str) -> Result<&mut Self, NativeError> {
        let ty = T::value_type(self.types)?;
        self.param_type(name, ty)
    }

    /// Declare the next parameter with an explicit type.
    pub fn param_type(&mut self, name: &str, ty: ValueType) -> Result<&mut Self, NativeError> {
        if self.return_type.is_some() {
            return Err(NativeError::failed(format!(
                "parameter '{}' declared after the return type",
                name
            )));
        }
        if matches!(ty, ValueType::Unit | ValueType::Never) {
            return Err(NativeError::failed(format!(
                "parameter '{}' cannot have type {}",
                name, ty
            )));
        }
        self.parameters.push((name.to_string(), ty));
        Ok(self)
    }

    /// Declare the return type as that of `T`. Completes the definition.
    pub fn returns<T: Marshal>(&mut self) -> Result<(), NativeError> {
        let ty = T::value_type(self.types)?;
        self.returns_type(ty)
    }

    pub fn returns_type(&mut self, ty: ValueType) -> Result<(), NativeError> {
        if self.return_type.is_some() {
            return Err(NativeError::DuplicateReturn);
        }
        if ty == ValueType::Never {
            return Err(NativeError::failed("a native function cannot return '!'"));
        }
        self.return_type = Some(ty);
        Ok(())
    }
}

/// A completed native signature.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeSignature {
    pub name: String,
    pub parameters: Vec<(String, ValueType)>,
    pub return_type: ValueType,
}

/// Result of running a definition callback.
#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionOutcome {
    /// Name and return type were declared.
    Complete(NativeSignature),
    /// The callback finished without declaring a return type.
    Incomplete,
    /// The callback failed before completing.
    Failed(NativeError),
}

/// Run a definition callback against a fresh context.
pub fn define<D>(types: &TypeRegistry, definition: D) -> DefinitionOutcome
where
    D: FnOnce(&mut DefinitionContext<'_>) -> Result<(), NativeError>,
{
    let mut context = DefinitionContext::new(types);
    if let Err(error) = definition(&mut context) {
        return DefinitionOutcome::Failed(error);
    }
    let Some(return_type) = context.return_type else {
        return DefinitionOutcome::Incomplete;
    };
    let Some(name) = context.name else {
        return DefinitionOutcome::Failed(NativeError::MissingName);
    };
    DefinitionOutcome::Complete(NativeSignature {
        name,
        parameters: context.parameters,
        return_type,
    })
}

/// Argument access and result collection for one native call.
pub struct RuntimeContext<'a> {
    name: &'a str,
    args: &'a [u8],
    tags: &'a [ValueType],
    parameters: &'a [ValueType],
    return_type: ValueType,
    types: &'a TypeRegistry,
    strings: &'a mut StringArena,
    result: Option<Vec<u8>>,
}

impl<'a> RuntimeContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: &'a str,
        args: &'a [u8],
        tags: &'a [ValueType],
        parameters: &'a [ValueType],
        return_type: ValueType,
        types: &'a TypeRegistry,
        strings: &'a mut StringArena,
    ) -> Self {
        Self {
            name,
            args,
            tags,
            parameters,
            return_type,
            types,
            strings,
            result: None,
        }
    }

    /// Name of the native function being called.
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn arg_count(&self) -> usize {
        self.parameters.len()
    }

    /// Read argument `index` as `T`, checked against both the declared
    /// parameter type and the tag on the value stack.
    pub fn arg<T: Marshal>(&self, index: usize) -> Result<T, NativeError> {
        let declared = *self.parameters.get(index).ok_or(NativeError::ArgumentIndex {
            index,
            count: self.parameters.len(),
        })?;
        let requested = T::value_type(self.types)?;
        if requested != declared {
            return Err(NativeError::ArgumentType {
                index,
                expected: declared,
                found: requested,
            });
        }

        let offset: usize = self.parameters[..index].iter().map(ValueType::size).sum();
        let size = declared.size();
        if size > 0 {
            let found = self.tags.get(offset).copied().unwrap_or(ValueType::Unit);
            if found != declared {
                return Err(NativeError::ArgumentType {
                    index,
                    expected: declared,
                    found,
                });
            }
        }

        let bytes = self
            .args
            .get(offset..offset + size)
            .ok_or_else(|| NativeError::failed("argument bytes missing"))?;
        T::read(&mut Reader::new(bytes, &*self.strings))
    }

    /// Set the call's return value.
    pub fn ret<T: Marshal>(&mut self, value: T) -> Result<(), NativeError> {
        if self.result.is_some() {
            return Err(NativeError::DuplicateReturn);
        }
        let found = T::value_type(self.types)?;
        if found != self.return_type {
            return Err(NativeError::ReturnType {
                expected: self.return_type,
                found,
            });
        }
        let mut writer = Writer::new(&mut *self.strings);
        writer.write(value);
        self.result = Some(writer.into_bytes());
        Ok(())
    }

    /// The returned bytes; a Unit function that never called `ret` yields
    /// an empty value.
    pub(crate) fn finish(self) -> Result<Vec<u8>, NativeError> {
        match self.result {
            Some(bytes) => Ok(bytes),
            None if self.return_type == ValueType::Unit => Ok(Vec::new()),
            None => Err(NativeError::MissingReturn(self.name.to_string())),
        }
    }
}

/// A typed handle to a compiled function, found with `Session::get_function`.
///
/// A handle is valid only for the compile that produced it.
pub struct FunctionHandle<A, R> {
    index: usize,
    generation: u64,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> FunctionHandle<A, R> {
    pub(crate) fn new(index: usize, generation: u64) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Index into the chunk's function table.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The compile this handle belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<A, R> Clone for FunctionHandle<A, R> {
    fn clone(&self) -> Self {
        Self::new(self.index, self.generation)
    }
}

impl<A, R> Copy for FunctionHandle<A, R> {}

impl<A, R> std::fmt::Debug for FunctionHandle<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}
