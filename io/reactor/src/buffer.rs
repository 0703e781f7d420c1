//! Pooled input/output buffers for non-blocking connection I/O.

use crate::buffer_pool::{BufferPool, Chunk, PoolError};
use std::io::{self, Read, Write};
use std::sync::Arc;
use thiserror::Error;

/// Default slab requested on first use.
const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Largest read issued per syscall.
const MAX_READ_PER_CALL: usize = 64 * 1024;

/// Growth ceiling for a single output buffer. Exceeding it is a write
/// failure, which the connection layer collapses to a close.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("write of {0} bytes would exceed the output buffer ceiling")]
    CeilingExceeded(usize),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

fn pool_error(e: PoolError) -> io::Error {
    io::Error::new(io::ErrorKind::OutOfMemory, e)
}

/// Read-side buffer. Holds at most one pooled chunk; the chunk may carry a
/// head gap between reads and is compacted lazily when more space is needed.
/// An emptied buffer returns its chunk to the pool.
pub struct InputBuffer {
    pool: Arc<BufferPool>,
    chunk: Option<Chunk>,
}

impl InputBuffer {
    pub fn new(pool: Arc<BufferPool>) -> InputBuffer {
        InputBuffer { pool, chunk: None }
    }

    pub fn len(&self) -> usize {
        self.chunk.as_ref().map(Chunk::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The buffered bytes, starting at the head offset.
    pub fn bytes(&self) -> &[u8] {
        self.chunk.as_ref().map(Chunk::bytes).unwrap_or(&[])
    }

    /// Consumes `n` bytes from the front.
    pub fn pop(&mut self, n: usize) {
        if let Some(chunk) = self.chunk.as_mut() {
            chunk.pop(n);
            if chunk.is_empty() {
                if let Some(chunk) = self.chunk.take() {
                    self.pool.retrieve(chunk);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.pool.retrieve(chunk);
        }
    }

    /// Reads once from `src` into the spare tail, at most 64 KiB.
    ///
    /// `Ok(0)` is end of stream. Would-block surfaces as
    /// `ErrorKind::WouldBlock`; interruption by a signal is retried here.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        self.ensure_space(DEFAULT_BUFFER_SIZE).map_err(pool_error)?;
        let chunk = match self.chunk.as_mut() {
            Some(chunk) => chunk,
            None => return Err(io::Error::other("input buffer has no chunk")),
        };

        let n = loop {
            let spare = chunk.spare_mut();
            let limit = spare.len().min(MAX_READ_PER_CALL);
            match src.read(&mut spare[..limit]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        chunk.advance(n);
        Ok(n)
    }

    fn ensure_space(&mut self, additional: usize) -> Result<(), PoolError> {
        match self.chunk.as_mut() {
            None => {
                let chunk = self.pool.alloc(additional.max(DEFAULT_BUFFER_SIZE))?;
                self.chunk = Some(chunk);
                Ok(())
            }
            Some(chunk) => {
                if chunk.head() != 0 {
                    chunk.adjust();
                }
                if chunk.available() >= additional {
                    return Ok(());
                }
                let mut grown = self.pool.alloc(chunk.len() + additional)?;
                grown.copy_from(chunk);
                if let Some(old) = self.chunk.replace(grown) {
                    self.pool.retrieve(old);
                }
                Ok(())
            }
        }
    }
}

impl Drop for InputBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Write-side buffer. The head offset is always zero: partial drains compact
/// immediately so the next write starts at the front of the chunk.
pub struct OutputBuffer {
    pool: Arc<BufferPool>,
    chunk: Option<Chunk>,
}

impl OutputBuffer {
    pub fn new(pool: Arc<BufferPool>) -> OutputBuffer {
        OutputBuffer { pool, chunk: None }
    }

    pub fn len(&self) -> usize {
        self.chunk.as_ref().map(Chunk::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        self.chunk.as_ref().map(Chunk::bytes).unwrap_or(&[])
    }

    pub fn available_space(&self) -> usize {
        match self.chunk.as_ref() {
            None => DEFAULT_BUFFER_SIZE,
            Some(chunk) => chunk.capacity() - chunk.len(),
        }
    }

    /// Appends `data`, growing through the pool. A buffer never grows past
    /// [`MAX_OUTPUT_BYTES`].
    pub fn append(&mut self, data: &[u8]) -> Result<(), BufferError> {
        if data.is_empty() {
            return Ok(());
        }
        match self.chunk.as_mut() {
            None => {
                if data.len() > MAX_OUTPUT_BYTES {
                    return Err(BufferError::CeilingExceeded(data.len()));
                }
                let mut chunk = self.pool.alloc(data.len().max(DEFAULT_BUFFER_SIZE))?;
                chunk.extend_from_slice(data);
                self.chunk = Some(chunk);
                Ok(())
            }
            Some(chunk) => {
                debug_assert_eq!(chunk.head(), 0, "output buffer head must stay at 0");
                if chunk.available() >= data.len() {
                    chunk.extend_from_slice(data);
                    return Ok(());
                }
                let required = chunk.len() + data.len();
                if required > MAX_OUTPUT_BYTES {
                    return Err(BufferError::CeilingExceeded(required));
                }
                let mut grown = self.pool.alloc(required)?;
                grown.copy_from(chunk);
                grown.extend_from_slice(data);
                if let Some(old) = self.chunk.replace(grown) {
                    self.pool.retrieve(old);
                }
                Ok(())
            }
        }
    }

    /// Writes the buffered prefix to `dst` and pops what was written.
    ///
    /// Would-block surfaces as `ErrorKind::WouldBlock`; interruption by a
    /// signal is retried here. Returns `Ok(0)` when the buffer is empty.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> io::Result<usize> {
        let chunk = match self.chunk.as_mut() {
            Some(chunk) => chunk,
            None => return Ok(0),
        };
        debug_assert_eq!(chunk.head(), 0, "output buffer head must stay at 0");

        let n = loop {
            match dst.write(chunk.bytes()) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.pop(n);
        Ok(n)
    }

    fn pop(&mut self, n: usize) {
        let emptied = match self.chunk.as_mut() {
            Some(chunk) => {
                chunk.pop(n);
                chunk.adjust();
                chunk.is_empty()
            }
            None => return,
        };
        if emptied {
            if let Some(chunk) = self.chunk.take() {
                self.pool.retrieve(chunk);
            }
        }
    }

    pub fn clear(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.pool.retrieve(chunk);
        }
    }
}

impl Drop for OutputBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::with_defaults())
    }

    #[test]
    fn test_input_read_and_pop() {
        let mut buf = InputBuffer::new(pool());
        let mut src: &[u8] = b"ping\n";

        let n = buf.read_from(&mut src).unwrap();
        assert_eq!(n, 5);
        assert_eq!(buf.bytes(), b"ping\n");

        buf.pop(4);
        assert_eq!(buf.bytes(), b"\n");

        // Emptying returns the chunk to the pool.
        buf.pop(1);
        assert!(buf.is_empty());
        assert_eq!(buf.bytes(), b"");
    }

    #[test]
    fn test_input_eof() {
        let mut buf = InputBuffer::new(pool());
        let mut src: &[u8] = b"";
        assert_eq!(buf.read_from(&mut src).unwrap(), 0);
    }

    #[test]
    fn test_input_compacts_after_partial_pop() {
        let mut buf = InputBuffer::new(pool());
        let mut src: &[u8] = b"abcdef";
        buf.read_from(&mut src).unwrap();
        buf.pop(3);

        let mut more: &[u8] = b"ghi";
        buf.read_from(&mut more).unwrap();
        assert_eq!(buf.bytes(), b"defghi");
    }

    #[test]
    fn test_input_grows_across_classes() {
        let mut buf = InputBuffer::new(pool());
        let payload = vec![0x5au8; 10_000];
        let mut src: &[u8] = &payload;

        let mut total = 0;
        while total < payload.len() {
            let n = buf.read_from(&mut src).unwrap();
            assert!(n > 0);
            total += n;
        }
        assert_eq!(buf.len(), payload.len());
        assert_eq!(buf.bytes(), &payload[..]);
    }

    #[test]
    fn test_output_append_and_drain() {
        let mut buf = OutputBuffer::new(pool());
        buf.append(b"hello ").unwrap();
        buf.append(b"world").unwrap();
        assert_eq!(buf.len(), 11);

        let mut dst = Vec::new();
        let n = buf.write_to(&mut dst).unwrap();
        assert_eq!(n, 11);
        assert_eq!(dst, b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_output_growth_ceiling() {
        let mut buf = OutputBuffer::new(pool());
        let big = vec![0u8; MAX_OUTPUT_BYTES + 1];
        assert!(matches!(
            buf.append(&big),
            Err(BufferError::CeilingExceeded(_))
        ));

        buf.append(&vec![1u8; 700 * 1024]).unwrap();
        assert!(matches!(
            buf.append(&vec![2u8; 500 * 1024]),
            Err(BufferError::CeilingExceeded(_))
        ));
        // Earlier content is untouched by the failed append.
        assert_eq!(buf.len(), 700 * 1024);
    }

    #[test]
    fn test_output_pool_exhaustion() {
        let pool = Arc::new(BufferPool::new(4 * 1024));
        let mut buf = OutputBuffer::new(pool);
        buf.append(&vec![0u8; 4 * 1024]).unwrap();
        assert!(matches!(
            buf.append(b"x"),
            Err(BufferError::Pool(PoolError::Exhausted))
        ));
    }

    /// Writer that accepts a fixed number of bytes, then signals would-block.
    struct Throttled {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let n = data.len().min(self.budget);
            self.accepted.extend_from_slice(&data[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_output_partial_write_keeps_tail() {
        let mut buf = OutputBuffer::new(pool());
        buf.append(b"0123456789").unwrap();

        let mut dst = Throttled {
            accepted: Vec::new(),
            budget: 4,
        };
        assert_eq!(buf.write_to(&mut dst).unwrap(), 4);
        assert_eq!(buf.bytes(), b"456789");

        let err = buf.write_to(&mut dst).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buf.bytes(), b"456789");
        assert_eq!(dst.accepted, b"0123");
    }
}
