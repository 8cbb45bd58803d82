use std::fmt;
use std::sync::Arc;

/// Backend storage behind a mapped range.
pub trait HostMemory: Send + Sync {
    fn write(&self, offset: u64, data: &[u8]);
    fn read(&self, offset: u64, out: &mut [u8]);
}

/// A persistently mapped CPU-visible range.
///
/// Offsets are relative to the start of the mapping and are bounds-checked.
#[derive(Clone)]
pub struct MappedMemory {
    memory: Arc<dyn HostMemory>,
    base: u64,
    len: u64,
}

impl MappedMemory {
    pub fn new(memory: Arc<dyn HostMemory>, base: u64, len: u64) -> Self {
        Self { memory, base, len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write(&self, offset: u64, data: &[u8]) {
        assert!(
            offset + data.len() as u64 <= self.len,
            "mapped write of {} bytes at {offset} exceeds mapping of {} bytes",
            data.len(),
            self.len
        );
        self.memory.write(self.base + offset, data);
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) {
        assert!(
            offset + out.len() as u64 <= self.len,
            "mapped read of {} bytes at {offset} exceeds mapping of {} bytes",
            out.len(),
            self.len
        );
        self.memory.read(self.base + offset, out);
    }
}

impl fmt::Debug for MappedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedMemory")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}
