//! Runtime value types for rill
//!
//! Values live on the VM stack as raw little-endian bytes; a [`ValueType`]
//! says how many bytes a value takes and how to read them back.

use std::fmt;
use std::rc::Rc;

/// Byte sizes of the primitive types on the value stack.
pub const BOOL_SIZE: usize = 1;
pub const INT_SIZE: usize = 8;
pub const FLOAT_SIZE: usize = 8;
pub const STRING_SIZE: usize = 4;

/// Type tag for a stack value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Unit,
    Bool,
    Int,
    Float,
    /// Handle into the run's [`StringArena`].
    String,
    /// Index into the struct table plus the struct's total byte size.
    Struct { index: u16, size: u16 },
    /// Type of expressions that never produce a value: `return`, and
    /// expressions that already failed to compile. Never exists at runtime.
    Never,
}

impl ValueType {
    /// Number of value-stack bytes a value of this type occupies.
    pub fn size(&self) -> usize {
        match self {
            ValueType::Unit | ValueType::Never => 0,
            ValueType::Bool => BOOL_SIZE,
            ValueType::Int => INT_SIZE,
            ValueType::Float => FLOAT_SIZE,
            ValueType::String => STRING_SIZE,
            ValueType::Struct { size, .. } => *size as usize,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueType::Int | ValueType::Float)
    }

    /// Parse a primitive type name as written in source.
    pub fn primitive(name: &str) -> Option<ValueType> {
        match name {
            "int" => Some(ValueType::Int),
            "float" => Some(ValueType::Float),
            "bool" => Some(ValueType::Bool),
            "string" => Some(ValueType::String),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Unit => write!(f, "()"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Int => write!(f, "int"),
            ValueType::Float => write!(f, "float"),
            ValueType::String => write!(f, "string"),
            ValueType::Struct { index, .. } => write!(f, "struct#{}", index),
            ValueType::Never => write!(f, "!"),
        }
    }
}

/// One field of a struct layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub ty: ValueType,
    pub offset: usize,
}

/// Field layout of a host struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub size: usize,
}

impl StructDef {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Table of registered struct layouts.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    structs: Vec<StructDef>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a struct layout and return its type.
    pub fn register(&mut self, name: &str, fields: &[(&str, ValueType)]) -> Result<ValueType, String> {
        if self.lookup(name).is_some() || ValueType::primitive(name).is_some() {
            return Err(format!("type '{}' is already defined", name));
        }

        let mut offset = 0;
        let mut defs = Vec::with_capacity(fields.len());
        for (field_name, ty) in fields {
            if matches!(ty, ValueType::Never | ValueType::Unit) {
                return Err(format!("field '{}' of '{}' cannot have type {}", field_name, name, ty));
            }
            if defs.iter().any(|f: &FieldDef| f.name == *field_name) {
                return Err(format!("duplicate field '{}' in '{}'", field_name, name));
            }
            defs.push(FieldDef {
                name: field_name.to_string(),
                ty: *ty,
                offset,
            });
            offset += ty.size();
        }

        let index = u16::try_from(self.structs.len()).map_err(|_| "too many struct types".to_string())?;
        let size = u16::try_from(offset).map_err(|_| format!("struct '{}' is too large", name))?;
        self.structs.push(StructDef {
            name: name.to_string(),
            fields: defs,
            size: offset,
        });
        Ok(ValueType::Struct { index, size })
    }

    pub fn lookup(&self, name: &str) -> Option<ValueType> {
        self.structs.iter().enumerate().find(|(_, s)| s.name == name).map(|(i, s)| {
            ValueType::Struct {
                index: i as u16,
                size: s.size as u16,
            }
        })
    }

    pub fn get(&self, ty: ValueType) -> Option<&StructDef> {
        match ty {
            ValueType::Struct { index, .. } => self.structs.get(index as usize),
            _ => None,
        }
    }

    /// Resolve a type name as written in source.
    pub fn resolve(&self, name: &str) -> Option<ValueType> {
        ValueType::primitive(name).or_else(|| self.lookup(name))
    }

    /// Human-readable name, using struct names where known.
    pub fn type_name(&self, ty: ValueType) -> String {
        match self.get(ty) {
            Some(def) => def.name.clone(),
            None => ty.to_string(),
        }
    }
}

/// Strings referenced from the value stack by handle. Cleared between runs.
#[derive(Debug, Clone, Default)]
pub struct StringArena {
    items: Vec<Rc<str>>,
}

impl StringArena {
    /// Reset to contain exactly the chunk's string constants.
    pub fn reset(&mut self, constants: &[Rc<str>]) {
        self.items.clear();
        self.items.extend(constants.iter().cloned());
    }

    pub fn push(&mut self, value: impl Into<Rc<str>>) -> u32 {
        self.items.push(value.into());
        (self.items.len() - 1) as u32
    }

    pub fn get(&self, handle: u32) -> Option<&Rc<str>> {
        self.items.get(handle as usize)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Host-side decoded value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Struct {
        name: String,
        fields: Vec<(String, Value)>,
    },
}

impl Value {
    pub fn type_name(&self) -> &str {
        match self {
            Value::Unit => "()",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Struct { name, .. } => name,
        }
    }

    /// Decode `bytes` as a value of type `ty`. Returns `None` when the bytes
    /// are too short or a string handle is dangling.
    pub fn decode(bytes: &[u8], ty: ValueType, types: &TypeRegistry, strings: &StringArena) -> Option<Value> {
        if bytes.len() < ty.size() {
            return None;
        }
        let value = match ty {
            ValueType::Unit | ValueType::Never => Value::Unit,
            ValueType::Bool => Value::Bool(bytes[0] != 0),
            ValueType::Int => Value::Int(i64::from_le_bytes(bytes[..INT_SIZE].try_into().ok()?)),
            ValueType::Float => Value::Float(f64::from_le_bytes(bytes[..FLOAT_SIZE].try_into().ok()?)),
            ValueType::String => {
                let handle = u32::from_le_bytes(bytes[..STRING_SIZE].try_into().ok()?);
                Value::String(strings.get(handle)?.to_string())
            }
            ValueType::Struct { .. } => {
                let def = types.get(ty)?;
                let mut fields = Vec::with_capacity(def.fields.len());
                for field in &def.fields {
                    let value = Value::decode(&bytes[field.offset..], field.ty, types, strings)?;
                    fields.push((field.name.clone(), value));
                }
                Value::Struct {
                    name: def.name.clone(),
                    fields,
                }
            }
        };
        Some(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{:?}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Struct { name, fields } => {
                write!(f, "{} {{", name)?;
                for (i, (field, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {}: {}", field, value)?;
                }
                write!(f, " }}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(ValueType::Unit.size(), 0);
        assert_eq!(ValueType::Bool.size(), 1);
        assert_eq!(ValueType::Int.size(), 8);
        assert_eq!(ValueType::String.size(), 4);
    }

    #[test]
    fn test_struct_layout() {
        let mut types = TypeRegistry::new();
        let ty = types
            .register("Pair", &[("flag", ValueType::Bool), ("count", ValueType::Int)])
            .unwrap();
        assert_eq!(ty.size(), 9);
        let def = types.get(ty).unwrap();
        assert_eq!(def.field("count").unwrap().offset, 1);
        assert_eq!(types.type_name(ty), "Pair");
        assert!(types.register("Pair", &[]).is_err());
    }

    #[test]
    fn test_decode_struct() {
        let mut types = TypeRegistry::new();
        let ty = types
            .register("Point", &[("x", ValueType::Int), ("y", ValueType::Int)])
            .unwrap();
        let mut bytes = 3i64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&(-4i64).to_le_bytes());
        let value = Value::decode(&bytes, ty, &types, &StringArena::default()).unwrap();
        assert_eq!(value.to_string(), "Point { x: 3, y: -4 }");
    }

    #[test]
    fn test_float_display_keeps_fraction() {
        assert_eq!(Value::Float(5.0).to_string(), "5.0");
        assert_eq!(Value::Int(5).to_string(), "5");
    }
}
