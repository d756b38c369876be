//! Fixed-capacity circular byte buffer between the receive loop and a
//!  notification worker.
//!
//! One producer (the connection's receive loop) and one consumer (the
//!  dispatcher's worker task) - concurrency control lives entirely outside
//!  this type. The backing store has one byte more than the usable capacity
//!  so that full and empty are distinguishable from the cursors alone.

/// Circular buffer over `N+1` bytes backing `N` usable bytes.
///
/// All read and write amounts are asserted (not checked) to fit the
///  available data / free space - callers gate on [`RingBuffer::bytes_free`]
///  and [`RingBuffer::bytes_available`] first.
pub struct RingBuffer {
    data: Vec<u8>,
    read: usize,
    write: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> RingBuffer {
        RingBuffer {
            data: vec![0; capacity + 1],
            read: 0,
            write: 0,
        }
    }

    pub fn bytes_free(&self) -> usize {
        if self.write < self.read {
            self.read - self.write - 1
        } else {
            self.data.len() - 1 - (self.write - self.read)
        }
    }

    pub fn bytes_available(&self) -> usize {
        (self.write + self.data.len() - self.read) % self.data.len()
    }

    /// Length of the longest contiguous run writable before wraparound, so a
    ///  logical write needs at most two copies.
    pub fn write_chunk(&self) -> usize {
        if self.write < self.read {
            self.read - self.write - 1
        } else {
            self.data.len() - self.write - usize::from(self.read == 0)
        }
    }

    /// Copy `bytes` in, wrapping around at the end of the backing store.
    pub fn write(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.bytes_free());

        let chunk = usize::min(bytes.len(), self.write_chunk());
        self.data[self.write..self.write + chunk].copy_from_slice(&bytes[..chunk]);
        self.write = self.advanced(self.write, chunk);

        let rest = &bytes[chunk..];
        self.data[self.write..self.write + rest.len()].copy_from_slice(rest);
        self.write = self.advanced(self.write, rest.len());
    }

    pub fn read_u32_le(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.read_into(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    pub fn read_u64_le(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.read_into(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    pub fn read_into(&mut self, target: &mut [u8]) {
        assert!(target.len() <= self.bytes_available());
        for b in target {
            *b = self.data[self.read];
            self.read = self.advanced(self.read, 1);
        }
    }

    /// Advance the read cursor without looking at the data.
    pub fn skip(&mut self, n: usize) {
        assert!(n <= self.bytes_available());
        self.read = self.advanced(self.read, n);
    }

    fn advanced(&self, cursor: usize, n: usize) -> usize {
        (cursor + n) % self.data.len()
    }
}
