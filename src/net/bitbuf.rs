/// Backing-buffer growth ceiling. Bit indices are kept addressable as `i32`
/// on the fixed client, so the byte capacity may never exceed this.
pub const MAX_CAPACITY_BYTES: usize = (i32::MAX >> 3) as usize;

const MIN_GROW_BYTES: usize = 64;

/// Which write/read loop a buffer runs. `Unchecked` performs the same
/// algorithm through raw pointer arithmetic after the public entry points
/// have validated bounds; `Checked` is the reference path and the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecMode {
    #[default]
    Checked,
    Unchecked,
}

/// A bit-addressed cursor over a contiguous byte region.
///
/// Both indices are counted in bits. Invariant:
/// `0 <= reader_bits <= writer_bits <= data.len() * 8`.
#[derive(Debug)]
pub struct BitBuf {
    data: Vec<u8>,
    writer_bits: usize,
    reader_bits: usize,
    limit_bytes: usize,
    mode: CodecMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Bit counts must be in `1..=32`.
    CountOutOfRange(u32),
    /// Growing the buffer would exceed the configured byte ceiling.
    CapacityExceeded { needed_bytes: usize, limit_bytes: usize },
    /// A read would advance the reader past the writer.
    ReadPastWriter { wanted_bits: usize, available_bits: usize },
    /// Byte-aligned access attempted while the writer sits mid-byte.
    UnalignedByteAccess { writer_bits: usize },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::CountOutOfRange(count) => {
                write!(f, "bit count {} outside 1..=32", count)
            }
            CodecError::CapacityExceeded {
                needed_bytes,
                limit_bytes,
            } => write!(
                f,
                "buffer needs {} bytes, ceiling is {}",
                needed_bytes, limit_bytes
            ),
            CodecError::ReadPastWriter {
                wanted_bits,
                available_bits,
            } => write!(
                f,
                "read of {} bits with only {} readable",
                wanted_bits, available_bits
            ),
            CodecError::UnalignedByteAccess { writer_bits } => {
                write!(f, "byte access at bit index {}", writer_bits)
            }
        }
    }
}

impl std::error::Error for CodecError {}

impl BitBuf {
    pub fn new(mode: CodecMode) -> Self {
        Self::with_limit(MAX_CAPACITY_BYTES, mode)
    }

    pub fn with_limit(limit_bytes: usize, mode: CodecMode) -> Self {
        Self::from_vec(Vec::new(), limit_bytes, mode)
    }

    /// Wrap a recycled buffer. Its contents are discarded, its allocation
    /// kept.
    pub fn from_vec(mut data: Vec<u8>, limit_bytes: usize, mode: CodecMode) -> Self {
        data.clear();
        Self {
            data,
            writer_bits: 0,
            reader_bits: 0,
            limit_bytes: limit_bytes.min(MAX_CAPACITY_BYTES).max(1),
            mode,
        }
    }

    /// Wrap a received region for reading: the writer starts at the end so
    /// every byte is readable.
    pub fn decoder(data: Vec<u8>) -> Self {
        let writer_bits = data.len() * 8;
        Self {
            data,
            writer_bits,
            reader_bits: 0,
            limit_bytes: MAX_CAPACITY_BYTES,
            mode: CodecMode::Checked,
        }
    }

    pub fn writer_bits(&self) -> usize {
        self.writer_bits
    }

    pub fn reader_bits(&self) -> usize {
        self.reader_bits
    }

    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    /// Bytes the writer has touched so far, partial byte included.
    pub fn byte_len(&self) -> usize {
        (self.writer_bits + 7) >> 3
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.byte_len()]
    }

    /// Recover the backing allocation, truncated to the written length.
    pub fn into_vec(mut self) -> Vec<u8> {
        let len = self.byte_len();
        self.data.truncate(len);
        self.data
    }

    /// Non-throwing probe: could `count` bits be written without crossing
    /// the byte ceiling? Growth is accounted for.
    pub fn is_writable(&self, count: u32) -> bool {
        (1..=32).contains(&count) && (self.writer_bits + count as usize) <= self.limit_bytes * 8
    }

    /// Non-throwing probe: are `count` bits available between the reader
    /// and the writer?
    pub fn is_readable(&self, count: u32) -> bool {
        (1..=32).contains(&count) && (self.reader_bits + count as usize) <= self.writer_bits
    }

    /// Grow the backing region so `count` more bits fit. Fails once the
    /// ceiling would be crossed.
    pub fn ensure_writable(&mut self, count: usize) -> Result<(), CodecError> {
        let needed_bytes = (self.writer_bits + count + 7) >> 3;
        if needed_bytes <= self.data.len() {
            return Ok(());
        }
        if needed_bytes > self.limit_bytes {
            return Err(CodecError::CapacityExceeded {
                needed_bytes,
                limit_bytes: self.limit_bytes,
            });
        }
        let grown = (self.data.len() * 2)
            .max(needed_bytes)
            .max(MIN_GROW_BYTES)
            .min(self.limit_bytes);
        self.data.resize(grown, 0);
        Ok(())
    }

    /// Write the low `count` bits of `value`, advancing the writer.
    pub fn write_bits(&mut self, count: u32, value: u32) -> Result<(), CodecError> {
        if !(1..=32).contains(&count) {
            return Err(CodecError::CountOutOfRange(count));
        }
        self.ensure_writable(count as usize)?;
        let value = if count == 32 {
            value
        } else {
            value & ((1u32 << count) - 1)
        };
        match self.mode {
            CodecMode::Checked => self.write_loop(count as usize, value),
            // Bounds were established by ensure_writable above.
            CodecMode::Unchecked => unsafe { self.write_loop_unchecked(count as usize, value) },
        }
        Ok(())
    }

    /// Read `count` bits at the reader index, advancing it.
    pub fn read_bits(&mut self, count: u32) -> Result<u32, CodecError> {
        if !(1..=32).contains(&count) {
            return Err(CodecError::CountOutOfRange(count));
        }
        if self.reader_bits + count as usize > self.writer_bits {
            return Err(CodecError::ReadPastWriter {
                wanted_bits: count as usize,
                available_bits: self.writer_bits - self.reader_bits,
            });
        }
        let value = match self.mode {
            CodecMode::Checked => self.read_loop(count as usize),
            // The range check above established that every touched byte is
            // inside the written region.
            CodecMode::Unchecked => unsafe { self.read_loop_unchecked(count as usize) },
        };
        Ok(value)
    }

    fn write_loop(&mut self, count: usize, value: u32) {
        let mut remaining = count;
        let mut pos = self.writer_bits;
        while remaining > 0 {
            let byte = pos >> 3;
            let free = 8 - (pos & 7);
            let n = free.min(remaining);
            let shift = free - n;
            let mask = (((1u16 << n) - 1) as u8) << shift;
            let chunk = ((value >> (remaining - n)) as u8) & ((1u16 << n) - 1) as u8;
            self.data[byte] = (self.data[byte] & !mask) | (chunk << shift);
            pos += n;
            remaining -= n;
        }
        self.writer_bits = pos;
    }

    /// Same splitting as `write_loop`, raw pointers instead of indexing.
    ///
    /// # Safety
    /// `ensure_writable(count)` must have succeeded for this writer
    /// position, so every byte touched lies inside `self.data`.
    unsafe fn write_loop_unchecked(&mut self, count: usize, value: u32) {
        let base = self.data.as_mut_ptr();
        let mut remaining = count;
        let mut pos = self.writer_bits;
        while remaining > 0 {
            let free = 8 - (pos & 7);
            let n = free.min(remaining);
            let shift = free - n;
            let mask = (((1u16 << n) - 1) as u8) << shift;
            let chunk = ((value >> (remaining - n)) as u8) & ((1u16 << n) - 1) as u8;
            let slot = base.add(pos >> 3);
            *slot = (*slot & !mask) | (chunk << shift);
            pos += n;
            remaining -= n;
        }
        self.writer_bits = pos;
    }

    fn read_loop(&mut self, count: usize) -> u32 {
        let mut remaining = count;
        let mut pos = self.reader_bits;
        let mut value: u32 = 0;
        while remaining > 0 {
            let byte = pos >> 3;
            let avail = 8 - (pos & 7);
            let n = avail.min(remaining);
            let shift = avail - n;
            let chunk = (self.data[byte] >> shift) & ((1u16 << n) - 1) as u8;
            value = (value << n) | u32::from(chunk);
            pos += n;
            remaining -= n;
        }
        self.reader_bits = pos;
        value
    }

    /// # Safety
    /// The caller checked `reader_bits + count <= writer_bits`, and the
    /// writer never passes the end of `self.data`.
    unsafe fn read_loop_unchecked(&mut self, count: usize) -> u32 {
        let base = self.data.as_ptr();
        let mut remaining = count;
        let mut pos = self.reader_bits;
        let mut value: u32 = 0;
        while remaining > 0 {
            let avail = 8 - (pos & 7);
            let n = avail.min(remaining);
            let shift = avail - n;
            let chunk = (*base.add(pos >> 3) >> shift) & ((1u16 << n) - 1) as u8;
            value = (value << n) | u32::from(chunk);
            pos += n;
            remaining -= n;
        }
        self.reader_bits = pos;
        value
    }

    /// End the bit-write session: pad the writer to the next byte boundary
    /// with zero bits and round the reader up the same way. Required before
    /// the buffer is handed to the transport, otherwise the final partial
    /// byte is garbage.
    pub fn close_writer(&mut self) {
        self.writer_bits = (self.writer_bits + 7) & !7;
        self.reader_bits = (self.reader_bits + 7) & !7;
        let len = self.byte_len();
        if self.data.len() < len {
            self.data.resize(len, 0);
        }
    }

    /// Byte-aligned append, used for the extended-info tail after
    /// `close_writer`.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        if self.writer_bits & 7 != 0 {
            return Err(CodecError::UnalignedByteAccess {
                writer_bits: self.writer_bits,
            });
        }
        self.ensure_writable(bytes.len() * 8)?;
        let start = self.writer_bits >> 3;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.writer_bits += bytes.len() * 8;
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), CodecError> {
        self.put_bytes(&[value])
    }
}
