/// Buffer allocation for batches
use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::tensor::Tensor;

/// Identifies an allocator family. Workers advertise the kinds they can
/// consume without a copy; the pool places batch buffers accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    Cpu,
    CpuPinned,
    Gpu,
}

/// A contiguous region lent out by the pool. The kind is fixed at
/// allocation; the contents are mutable. Consumers address by byte offset.
#[derive(Debug)]
pub struct Buffer {
    kind: MemoryKind,
    data: Vec<u8>,
}

impl Buffer {
    pub fn new(kind: MemoryKind, len: usize) -> Self {
        Self {
            kind,
            data: vec![0; len],
        }
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The bytes starting at `offset`.
    pub fn data(&self, offset: usize) -> &[u8] {
        &self.data[offset..]
    }

    pub fn data_mut(&mut self, offset: usize) -> &mut [u8] {
        &mut self.data[offset..]
    }

    /// Copy `bytes` into the buffer at `offset`.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn resize(&mut self, len: usize) {
        // Growth zero-fills the tail; a reused prefix keeps its old
        // contents. Callers must not assume zero-initialization.
        self.data.resize(len, 0);
    }
}

/// One allocator per memory kind.
pub trait Allocator: Send + Sync {
    fn kind(&self) -> MemoryKind;
    fn get(&self, len: usize) -> Result<Buffer, Error>;
    fn put(&self, buffer: Buffer);
}

/// Heap-backed allocator with a free list. Returned buffers are reused for
/// later requests of any size.
pub struct VectorAllocator {
    kind: MemoryKind,
    free: Mutex<Vec<Buffer>>,
}

impl VectorAllocator {
    pub fn new(kind: MemoryKind) -> Self {
        Self {
            kind,
            free: Mutex::new(Vec::new()),
        }
    }
}

impl Allocator for VectorAllocator {
    fn kind(&self) -> MemoryKind {
        self.kind
    }

    fn get(&self, len: usize) -> Result<Buffer, Error> {
        let reused = self.free.lock().pop();
        match reused {
            Some(mut buffer) => {
                buffer.resize(len);
                Ok(buffer)
            }
            None => Ok(Buffer::new(self.kind, len)),
        }
    }

    fn put(&self, buffer: Buffer) {
        self.free.lock().push(buffer);
    }
}

/// Registry of allocators keyed by memory kind. Issues buffers for
/// (tensor, batch size) tuples drawn from a preferred-kind list.
pub struct MemoryPool {
    allocators: HashMap<MemoryKind, Box<dyn Allocator>>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    /// A pool with the CPU allocator registered.
    pub fn new() -> Self {
        let mut allocators: HashMap<MemoryKind, Box<dyn Allocator>> = HashMap::new();
        allocators.insert(MemoryKind::Cpu, Box::new(VectorAllocator::new(MemoryKind::Cpu)));
        Self { allocators }
    }

    pub fn register(&mut self, allocator: Box<dyn Allocator>) {
        self.allocators.insert(allocator.kind(), allocator);
    }

    /// Walk `preferred` in order and return a buffer from the first kind
    /// with a registered allocator, sized for `batch_size` copies of
    /// `tensor`.
    pub fn get(
        &self,
        preferred: &[MemoryKind],
        tensor: &Tensor,
        batch_size: usize,
    ) -> Result<Buffer, Error> {
        let len = tensor.byte_size() * batch_size;
        for kind in preferred {
            if let Some(allocator) = self.allocators.get(kind) {
                return allocator.get(len);
            }
        }
        Err(Error::Runtime(format!(
            "no allocator available for any of the preferred kinds: {preferred:?}"
        )))
    }

    /// Return a buffer for reuse. Buffers of unregistered kinds are freed.
    pub fn put(&self, buffer: Buffer) {
        if let Some(allocator) = self.allocators.get(&buffer.kind()) {
            allocator.put(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::DataType;

    #[test]
    fn get_sizes_for_the_whole_batch() {
        let pool = MemoryPool::new();
        let tensor = Tensor::new("input", vec![2, 2], DataType::Uint32);
        let buffer = pool
            .get(&[MemoryKind::Cpu], &tensor, 4)
            .unwrap();
        assert_eq!(buffer.kind(), MemoryKind::Cpu);
        assert_eq!(buffer.len(), 4 * 4 * 4);
    }

    #[test]
    fn preferred_kinds_are_walked_in_order() {
        let pool = MemoryPool::new();
        let tensor = Tensor::new("input", vec![1], DataType::Uint8);
        // Gpu is unregistered, so the pool falls through to Cpu
        let buffer = pool
            .get(&[MemoryKind::Gpu, MemoryKind::Cpu], &tensor, 1)
            .unwrap();
        assert_eq!(buffer.kind(), MemoryKind::Cpu);
    }

    #[test]
    fn get_fails_when_no_preferred_kind_is_registered() {
        let pool = MemoryPool::new();
        let tensor = Tensor::new("input", vec![1], DataType::Uint8);
        let result = pool.get(&[MemoryKind::Gpu], &tensor, 1);
        assert!(matches!(result, Err(Error::Runtime(_))));
    }

    #[test]
    fn put_makes_the_buffer_reusable() {
        let pool = MemoryPool::new();
        let tensor = Tensor::new("input", vec![8], DataType::Uint8);

        let mut buffer = pool.get(&[MemoryKind::Cpu], &tensor, 1).unwrap();
        buffer.write_at(0, &[7; 8]);
        pool.put(buffer);

        // the free list hands the same region back, resized
        let small = Tensor::new("input", vec![4], DataType::Uint8);
        let buffer = pool.get(&[MemoryKind::Cpu], &small, 1).unwrap();
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.data(0), &[7; 4]);
    }

    #[test]
    fn registered_allocators_take_priority() {
        let mut pool = MemoryPool::new();
        pool.register(Box::new(VectorAllocator::new(MemoryKind::CpuPinned)));

        let tensor = Tensor::new("input", vec![16], DataType::Uint8);
        let buffer = pool
            .get(&[MemoryKind::CpuPinned, MemoryKind::Cpu], &tensor, 2)
            .unwrap();
        assert_eq!(buffer.kind(), MemoryKind::CpuPinned);
        assert_eq!(buffer.len(), 32);
        pool.put(buffer);
    }

    #[test]
    fn buffer_offset_addressing() {
        let mut buffer = Buffer::new(MemoryKind::Cpu, 8);
        buffer.write_at(4, &[1, 2, 3, 4]);
        assert_eq!(&buffer.data(4)[..4], &[1, 2, 3, 4]);
        assert_eq!(&buffer.data(0)[..4], &[0, 0, 0, 0]);
    }
}
