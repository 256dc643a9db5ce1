//! The VM's typed value stack
//!
//! Raw value bytes and their type tags are stored side by side, one tag per
//! byte. Every operation moves bytes and tags together so the two vectors
//! always have the same length.

use crate::value::{ValueType, BOOL_SIZE, FLOAT_SIZE, INT_SIZE, STRING_SIZE};

#[derive(Debug, Clone, Default)]
pub struct ValueStack {
    bytes: Vec<u8>,
    types: Vec<ValueType>,
}

impl ValueStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.bytes.len(), self.types.len());
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
        self.types.clear();
    }

    pub fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
        self.types.truncate(len);
    }

    /// Push a value's bytes, tagging every byte with `ty`.
    pub fn push_bytes(&mut self, bytes: &[u8], ty: ValueType) {
        self.bytes.extend_from_slice(bytes);
        self.types.resize(self.bytes.len(), ty);
    }

    /// Push bytes that carry their own per-byte tags.
    pub fn push_tagged(&mut self, bytes: &[u8], types: &[ValueType]) {
        debug_assert_eq!(bytes.len(), types.len());
        self.bytes.extend_from_slice(bytes);
        self.types.extend_from_slice(types);
    }

    pub fn push_bool(&mut self, value: bool) {
        self.push_bytes(&[value as u8], ValueType::Bool);
    }

    pub fn push_int(&mut self, value: i64) {
        self.push_bytes(&value.to_le_bytes(), ValueType::Int);
    }

    pub fn push_float(&mut self, value: f64) {
        self.push_bytes(&value.to_le_bytes(), ValueType::Float);
    }

    pub fn push_string(&mut self, handle: u32) {
        self.push_bytes(&handle.to_le_bytes(), ValueType::String);
    }

    /// Pop the top `size` bytes along with their tags.
    pub fn pop_tagged(&mut self, size: usize) -> Option<(Vec<u8>, Vec<ValueType>)> {
        let at = self.len().checked_sub(size)?;
        let bytes = self.bytes.split_off(at);
        let types = self.types.split_off(at);
        Some((bytes, types))
    }

    pub fn pop_bytes(&mut self, size: usize) -> Option<Vec<u8>> {
        self.pop_tagged(size).map(|(bytes, _)| bytes)
    }

    /// Drop the top `size` bytes.
    pub fn pop(&mut self, size: usize) -> Option<()> {
        let at = self.len().checked_sub(size)?;
        self.truncate(at);
        Some(())
    }

    pub fn pop_bool(&mut self) -> Option<bool> {
        let bytes = self.pop_bytes(BOOL_SIZE)?;
        Some(bytes[0] != 0)
    }

    pub fn pop_int(&mut self) -> Option<i64> {
        let bytes = self.pop_bytes(INT_SIZE)?;
        Some(i64::from_le_bytes(bytes.try_into().ok()?))
    }

    pub fn pop_float(&mut self) -> Option<f64> {
        let bytes = self.pop_bytes(FLOAT_SIZE)?;
        Some(f64::from_le_bytes(bytes.try_into().ok()?))
    }

    pub fn pop_string(&mut self) -> Option<u32> {
        let bytes = self.pop_bytes(STRING_SIZE)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Bytes and tags of `size` bytes starting at `at`.
    pub fn slice(&self, at: usize, size: usize) -> Option<(&[u8], &[ValueType])> {
        let end = at.checked_add(size)?;
        if end > self.len() {
            return None;
        }
        Some((&self.bytes[at..end], &self.types[at..end]))
    }

    /// Tag of the byte at `index`.
    pub fn type_at(&self, index: usize) -> Option<ValueType> {
        self.types.get(index).copied()
    }

    /// Push a copy of `size` bytes starting at `at`.
    pub fn load(&mut self, at: usize, size: usize) -> Option<()> {
        let end = at.checked_add(size)?;
        if end > self.len() {
            return None;
        }
        self.bytes.extend_from_within(at..end);
        self.types.extend_from_within(at..end);
        Some(())
    }

    /// Pop the top `size` bytes and write them over `at..at + size`.
    pub fn store(&mut self, at: usize, size: usize) -> Option<()> {
        let (bytes, types) = self.pop_tagged(size)?;
        let end = at.checked_add(size)?;
        if end > self.len() {
            return None;
        }
        self.bytes[at..end].copy_from_slice(&bytes);
        self.types[at..end].copy_from_slice(&types);
        Some(())
    }

    /// Remove `drop` bytes sitting directly beneath the top `keep` bytes.
    pub fn squash(&mut self, keep: usize, drop: usize) -> Option<()> {
        let top = self.len().checked_sub(keep)?;
        let start = top.checked_sub(drop)?;
        self.bytes.drain(start..top);
        self.types.drain(start..top);
        Some(())
    }

    /// Re-tag the top `size` bytes as one value of type `ty`.
    pub fn retag(&mut self, size: usize, ty: ValueType) -> Option<()> {
        let at = self.len().checked_sub(size)?;
        for tag in &mut self.types[at..] {
            *tag = ty;
        }
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_operations() {
        let mut stack = ValueStack::new();
        stack.push_int(1);
        stack.push_bool(true);
        stack.push_float(2.5);

        assert_eq!(stack.len(), 17);
        assert_eq!(stack.type_at(8), Some(ValueType::Bool));
        assert_eq!(stack.pop_float(), Some(2.5));
        assert_eq!(stack.pop_bool(), Some(true));
        assert_eq!(stack.pop_int(), Some(1));
        assert!(stack.is_empty());
        assert_eq!(stack.pop_int(), None);
    }

    #[test]
    fn test_load_and_store() {
        let mut stack = ValueStack::new();
        stack.push_int(10);
        stack.push_int(20);
        stack.load(0, 8).unwrap();
        assert_eq!(stack.pop_int(), Some(10));

        stack.push_int(99);
        stack.store(0, 8).unwrap();
        assert_eq!(stack.len(), 16);
        stack.pop(8).unwrap();
        assert_eq!(stack.pop_int(), Some(99));
    }

    #[test]
    fn test_squash_keeps_top() {
        let mut stack = ValueStack::new();
        stack.push_int(1);
        stack.push_int(2);
        stack.push_bool(false);
        stack.squash(1, 16).unwrap();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.type_at(0), Some(ValueType::Bool));
    }

    #[test]
    fn test_retag() {
        let ty = ValueType::Struct { index: 0, size: 16 };
        let mut stack = ValueStack::new();
        stack.push_int(1);
        stack.push_int(2);
        stack.retag(16, ty).unwrap();
        assert_eq!(stack.type_at(0), Some(ty));
        assert_eq!(stack.type_at(15), Some(ty));
    }
}
