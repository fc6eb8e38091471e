// ABOUTME: Chunked byte buffer backing a connection's read/write/msg streams
// ABOUTME: Growable sequence of fixed-size chunks addressed by (chunk, offset) cursors

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BufferError;

/// Size of a single chunk, in bytes. A compile-time constant per the buffer
/// contract; chosen to match a typical TCP read size.
pub const CHUNK_SIZE: usize = 4096;

struct Chunk(Box<[u8; CHUNK_SIZE]>);

impl Chunk {
    fn new() -> Self {
        Chunk(Box::new([0u8; CHUNK_SIZE]))
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk").field("len", &CHUNK_SIZE).finish()
    }
}

/// A position within a [`ChunkedBuffer`], expressed as a chunk index plus a
/// byte offset into that chunk. A cursor is only meaningful together with the
/// buffer that produced it; this crate never lets a cursor outlive its buffer
/// by construction, since every buffer operation takes the cursor by value
/// and the buffer by `&self`/`&mut self` rather than handing out a borrowing
/// cursor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    pub chunk: usize,
    pub offset: usize,
}

impl Cursor {
    pub const ZERO: Cursor = Cursor { chunk: 0, offset: 0 };

    fn absolute(self) -> u128 {
        self.chunk as u128 * CHUNK_SIZE as u128 + self.offset as u128
    }
}

/// Growable sequence of fixed-size chunks with independent read and write
/// cursors (component A). Chunks are appended on demand as the write cursor
/// reaches the tail; dropping the buffer frees every chunk (ordinary Rust
/// ownership already gives us this — there is no separate `free` to call).
#[derive(Debug)]
pub struct ChunkedBuffer {
    chunks: Vec<Chunk>,
    read: Cursor,
    write: Cursor,
}

impl Default for ChunkedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedBuffer {
    /// Allocates one chunk and sets `read`/`write` to offset 0.
    pub fn new() -> Self {
        ChunkedBuffer {
            chunks: vec![Chunk::new()],
            read: Cursor::ZERO,
            write: Cursor::ZERO,
        }
    }

    pub fn read_cursor(&self) -> Cursor {
        self.read
    }

    pub fn write_cursor(&self) -> Cursor {
        self.write
    }

    pub fn set_read_cursor(&mut self, cursor: Cursor) {
        self.read = cursor;
    }

    pub fn set_write_cursor(&mut self, cursor: Cursor) {
        self.write = cursor;
    }

    /// Creates an auxiliary cursor at the start of the buffer. Callers
    /// reposition it with [`ChunkedBuffer::index`] or
    /// [`ChunkedBuffer::advance`].
    pub fn new_cursor(&self) -> Cursor {
        Cursor::ZERO
    }

    pub fn chunks_allocated(&self) -> usize {
        self.chunks.len()
    }

    /// Positions a cursor at an absolute byte offset into the buffer.
    /// Precondition: `absolute_offset < chunks_allocated() * CHUNK_SIZE`.
    pub fn index(&self, absolute_offset: u64) -> Result<Cursor, BufferError> {
        let allocated = self.chunks.len() as u64 * CHUNK_SIZE as u64;
        if absolute_offset >= allocated {
            return Err(BufferError::OutOfRange {
                offset: absolute_offset,
                allocated,
            });
        }
        Ok(Cursor {
            chunk: (absolute_offset / CHUNK_SIZE as u64) as usize,
            offset: (absolute_offset % CHUNK_SIZE as u64) as usize,
        })
    }

    /// Moves `cursor` forward by `n` bytes, carrying across chunk boundaries.
    /// Does not allocate; the caller is responsible for ensuring the target
    /// chunk exists (writes do this implicitly, see [`Self::write_u8`]).
    pub fn advance(&self, cursor: Cursor, n: u64) -> Cursor {
        let abs = cursor.absolute() + n as u128;
        Cursor {
            chunk: (abs / CHUNK_SIZE as u128) as usize,
            offset: (abs % CHUNK_SIZE as u128) as usize,
        }
    }

    /// Returns `a - b` in bytes, or `None` if `a` precedes `b` — the real
    /// precondition the source's unsigned subtraction glossed over.
    pub fn diff(&self, a: Cursor, b: Cursor) -> Option<u64> {
        let (da, db) = (a.absolute(), b.absolute());
        if da < db {
            None
        } else {
            Some((da - db) as u64)
        }
    }

    fn ensure_allocated(&mut self, chunk_idx: usize) {
        while self.chunks.len() <= chunk_idx {
            self.chunks.push(Chunk::new());
        }
    }

    fn require_readable(&self, cursor: Cursor, size: u64) -> Result<(), BufferError> {
        match self.diff(self.write, cursor) {
            Some(available) if available >= size => Ok(()),
            Some(available) => Err(BufferError::ShortRead {
                needed: size as usize,
                available: available as usize,
            }),
            None => Err(BufferError::Misordered(self.write, cursor)),
        }
    }

    /// Reads one byte in place and advances the cursor.
    pub fn read_u8(&self, cursor: &mut Cursor) -> Result<u8, BufferError> {
        self.require_readable(*cursor, 1)?;
        let byte = self.chunks[cursor.chunk].0[cursor.offset];
        *cursor = self.advance(*cursor, 1);
        Ok(byte)
    }

    /// Writes one byte, allocating a new chunk if the cursor sits at the
    /// tail of the last allocated chunk.
    pub fn write_u8(&mut self, cursor: &mut Cursor, value: u8) {
        self.ensure_allocated(cursor.chunk);
        self.chunks[cursor.chunk].0[cursor.offset] = value;
        *cursor = self.advance(*cursor, 1);
        self.ensure_allocated(cursor.chunk);
    }

    /// Reads a little-endian-host `u16`, byte-wise so the read never
    /// straddles a chunk unsoundly (see spec's chunk-crossing open question).
    pub fn read_u16(&self, cursor: &mut Cursor) -> Result<u16, BufferError> {
        let mut bytes = [0u8; 2];
        for b in bytes.iter_mut() {
            *b = self.read_u8(cursor)?;
        }
        Ok(u16::from_ne_bytes(bytes))
    }

    pub fn write_u16(&mut self, cursor: &mut Cursor, value: u16) {
        for b in value.to_ne_bytes() {
            self.write_u8(cursor, b);
        }
    }

    pub fn read_u32(&self, cursor: &mut Cursor) -> Result<u32, BufferError> {
        let mut bytes = [0u8; 4];
        for b in bytes.iter_mut() {
            *b = self.read_u8(cursor)?;
        }
        Ok(u32::from_ne_bytes(bytes))
    }

    pub fn write_u32(&mut self, cursor: &mut Cursor, value: u32) {
        for b in value.to_ne_bytes() {
            self.write_u8(cursor, b);
        }
    }

    pub fn read_u64(&self, cursor: &mut Cursor) -> Result<u64, BufferError> {
        let mut bytes = [0u8; 8];
        for b in bytes.iter_mut() {
            *b = self.read_u8(cursor)?;
        }
        Ok(u64::from_ne_bytes(bytes))
    }

    pub fn write_u64(&mut self, cursor: &mut Cursor, value: u64) {
        for b in value.to_ne_bytes() {
            self.write_u8(cursor, b);
        }
    }

    /// Reads a big-endian (network byte order) `u16`. Used by the Bolt and
    /// WebSocket framers for length prefixes, which are defined on the wire
    /// in network order regardless of host endianness.
    pub fn read_u16_be(&self, cursor: &mut Cursor) -> Result<u16, BufferError> {
        let mut bytes = [0u8; 2];
        for b in bytes.iter_mut() {
            *b = self.read_u8(cursor)?;
        }
        Ok(u16::from_be_bytes(bytes))
    }

    pub fn write_u16_be(&mut self, cursor: &mut Cursor, value: u16) {
        for b in value.to_be_bytes() {
            self.write_u8(cursor, b);
        }
    }

    pub fn read_u64_be(&self, cursor: &mut Cursor) -> Result<u64, BufferError> {
        let mut bytes = [0u8; 8];
        for b in bytes.iter_mut() {
            *b = self.read_u8(cursor)?;
        }
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn write_u64_be(&mut self, cursor: &mut Cursor, value: u64) {
        for b in value.to_be_bytes() {
            self.write_u8(cursor, b);
        }
    }

    pub fn read_u32_be(&self, cursor: &mut Cursor) -> Result<u32, BufferError> {
        let mut bytes = [0u8; 4];
        for b in bytes.iter_mut() {
            *b = self.read_u8(cursor)?;
        }
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn write_u32_be(&mut self, cursor: &mut Cursor, value: u32) {
        for b in value.to_be_bytes() {
            self.write_u8(cursor, b);
        }
    }

    /// Writes a raw byte slice starting at `cursor`, allocating chunks as
    /// needed, and returns the cursor advanced past the written bytes.
    pub fn write_bytes(&mut self, mut cursor: Cursor, data: &[u8]) -> Cursor {
        for &b in data {
            self.write_u8(&mut cursor, b);
        }
        cursor
    }

    /// Reads `len` bytes starting at `cursor` into a freshly allocated
    /// `Vec<u8>`, advancing the cursor.
    pub fn read_bytes(&self, mut cursor: Cursor, len: usize) -> Result<Vec<u8>, BufferError> {
        self.require_readable(cursor, len as u64)?;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.read_u8(&mut cursor)?);
        }
        Ok(out)
    }

    /// Block-copies `size` bytes from `src` (at `src_cursor`) into `self`
    /// (at `dst_cursor`), allocating destination chunks as needed. Returns
    /// the advanced (src_cursor, dst_cursor) pair.
    pub fn copy_from(
        &mut self,
        src: &ChunkedBuffer,
        mut src_cursor: Cursor,
        mut dst_cursor: Cursor,
        size: u64,
    ) -> Result<(Cursor, Cursor), BufferError> {
        src.require_readable(src_cursor, size)?;
        for _ in 0..size {
            let byte = src.chunks[src_cursor.chunk].0[src_cursor.offset];
            src_cursor = src.advance(src_cursor, 1);
            self.write_u8(&mut dst_cursor, byte);
        }
        Ok((src_cursor, dst_cursor))
    }

    /// Reads from `socket` into the buffer starting at the current write
    /// cursor, allocating new chunks as needed, until a read returns less
    /// than a full scratch buffer (taken as "no more data immediately
    /// available" for this non-blocking-style drain). Returns `Ok(false)` on
    /// a clean EOF with nothing read, `Ok(true)` otherwise.
    pub async fn socket_read<S>(&mut self, socket: &mut S) -> Result<bool, BufferError>
    where
        S: AsyncRead + Unpin,
    {
        let mut scratch = [0u8; CHUNK_SIZE];
        let mut read_anything = false;
        loop {
            let n = socket.read(&mut scratch).await?;
            if n == 0 {
                return Ok(read_anything);
            }
            read_anything = true;
            self.write = self.write_bytes(self.write, &scratch[..n]);
            if n < scratch.len() {
                return Ok(true);
            }
        }
    }

    /// Writes every fully-used chunk before `cursor.chunk`, then
    /// `cursor.offset` bytes from the final chunk, to `socket`.
    pub async fn socket_write<S>(&self, cursor: Cursor, socket: &mut S) -> Result<(), BufferError>
    where
        S: AsyncWrite + Unpin,
    {
        for chunk in &self.chunks[..cursor.chunk] {
            socket.write_all(chunk.0.as_slice()).await?;
        }
        if let Some(last) = self.chunks.get(cursor.chunk) {
            socket.write_all(&last.0[..cursor.offset]).await?;
        }
        socket.flush().await?;
        Ok(())
    }
}
