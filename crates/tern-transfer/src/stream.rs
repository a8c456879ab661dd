//! Byte-stream traits the transfer protocol moves data through.
//!
//! A read transfer pulls from a [`Reader`] on the server and pushes into a
//! [`Writer`] on the client; a write transfer does the reverse. End of
//! stream is signaled by `Err(Status::OutOfRange)` from [`Reader::read`],
//! which keeps "no more data" distinct from "read zero bytes into an empty
//! buffer".

use tern_wire::Status;

/// A readable byte source.
pub trait Reader: Send {
    /// Read up to `out.len()` bytes. Returns the number of bytes read, or
    /// `Err(OutOfRange)` once the source is exhausted.
    fn read(&mut self, out: &mut [u8]) -> Result<usize, Status>;

    /// Whether [`seek`](Reader::seek) can reposition this source.
    fn supports_seek(&self) -> bool {
        false
    }

    /// Reposition to an absolute offset. Non-seekable readers return
    /// `Unimplemented`.
    fn seek(&mut self, _offset: u64) -> Result<(), Status> {
        Err(Status::Unimplemented)
    }
}

/// A writable byte sink.
pub trait Writer: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), Status>;

    /// A conservative bound on how many more bytes this sink accepts, if it
    /// has one. Receivers use it to size their flow-control windows.
    fn remaining_capacity(&self) -> Option<u64> {
        None
    }
}

/// A seekable [`Reader`] over an in-memory buffer.
pub struct MemoryReader {
    data: Vec<u8>,
    position: usize,
}

impl MemoryReader {
    pub fn new(data: impl Into<Vec<u8>>) -> MemoryReader {
        MemoryReader {
            data: data.into(),
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

impl Reader for MemoryReader {
    fn read(&mut self, out: &mut [u8]) -> Result<usize, Status> {
        if self.position >= self.data.len() {
            return Err(Status::OutOfRange);
        }
        let n = out.len().min(self.data.len() - self.position);
        out[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }

    fn supports_seek(&self) -> bool {
        true
    }

    fn seek(&mut self, offset: u64) -> Result<(), Status> {
        let offset = usize::try_from(offset).map_err(|_| Status::OutOfRange)?;
        if offset > self.data.len() {
            return Err(Status::OutOfRange);
        }
        self.position = offset;
        Ok(())
    }
}

/// A fixed-capacity [`Writer`] collecting into memory.
pub struct MemoryWriter {
    buffer: Vec<u8>,
    capacity: usize,
}

impl MemoryWriter {
    pub fn new(capacity: usize) -> MemoryWriter {
        MemoryWriter {
            buffer: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Writer for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), Status> {
        if self.buffer.len() + data.len() > self.capacity {
            return Err(Status::ResourceExhausted);
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn remaining_capacity(&self) -> Option<u64> {
        Some((self.capacity - self.buffer.len()) as u64)
    }
}
