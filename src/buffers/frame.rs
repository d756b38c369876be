//! A byte buffer for layering protocol headers around a payload.
//!
//! AMS frames are built innermost-first: the request payload is written,
//!  then the AoE header is laid directly in front of it, then the AMS/TCP
//!  header in front of that. [`Frame`] supports this with an O(1) `prepend`
//!  into pre-allocated headroom, falling back to copy-and-relocate only when
//!  the headroom is exhausted.

/// Buffer with a movable logical window into a fixed allocation.
///
/// The window starts at the end of the allocation (fully prepend-able) and
///  grows towards the front with every [`Frame::prepend`]. On the receive
///  side the same type is reused as a response buffer via [`Frame::limit`].
///
/// All consuming operations clamp to the available size instead of failing:
///  popping an integer off a too-short frame yields zero. Response parsing
///  relies on this lenience, callers that need strict validation parse the
///  bytes of [`Frame::data`] themselves.
pub struct Frame {
    data: Vec<u8>,
    pos: usize,
    original_capacity: usize,
}

impl Frame {
    /// An empty frame whose window sits at the end of `capacity` bytes of
    ///  headroom.
    pub fn new(capacity: usize) -> Frame {
        Frame {
            data: vec![0; capacity],
            pos: capacity,
            original_capacity: capacity,
        }
    }

    /// The logical window, i.e. everything prepended so far.
    pub fn data(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// The full backing store, regardless of the current window. The receive
    ///  path fills `raw_mut()[..n]` and then calls [`Frame::limit`] with `n`.
    pub fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn size(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Lay `bytes` immediately before the current window. Grows the backing
    ///  store (relocating the window content) only when the headroom is too
    ///  small.
    pub fn prepend(&mut self, bytes: &[u8]) -> &mut Frame {
        if bytes.len() > self.pos {
            let mut grown = Vec::with_capacity(self.data.len() + bytes.len());
            grown.extend_from_slice(&self.data[..self.pos]);
            grown.extend_from_slice(bytes);
            grown.extend_from_slice(&self.data[self.pos..]);
            self.data = grown;
            self.original_capacity = self.data.len();
        } else {
            self.pos -= bytes.len();
            self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        }
        self
    }

    /// Consume `n` bytes from the front of the window, clamped to its size.
    pub fn remove(&mut self, n: usize) -> &mut Frame {
        self.pos = usize::min(self.pos + n, self.data.len());
        self
    }

    pub fn clear(&mut self) -> &mut Frame {
        self.remove(self.size())
    }

    /// Truncate the buffer to `n` bytes and reset the window to its start.
    ///  Used to turn a buffer that was sized for writing into the window of a
    ///  shorter received response.
    pub fn limit(&mut self, n: usize) -> &mut Frame {
        self.data.truncate(usize::min(self.data.len(), n));
        self.pos = 0;
        self
    }

    /// Restore the full (possibly re-grown) allocation and move the window
    ///  to its end, ready for a new round of prepends.
    pub fn reset(&mut self, capacity: usize) -> &mut Frame {
        if capacity > self.original_capacity {
            self.original_capacity = capacity;
        }
        self.data.clear();
        self.data.resize(self.original_capacity, 0);
        self.pos = self.data.len();
        self
    }

    pub fn pop_u8(&mut self) -> u8 {
        let mut bytes = [0u8; 1];
        self.pop_into(&mut bytes);
        bytes[0]
    }

    pub fn pop_u16_le(&mut self) -> u16 {
        let mut bytes = [0u8; 2];
        self.pop_into(&mut bytes);
        u16::from_le_bytes(bytes)
    }

    pub fn pop_u32_le(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.pop_into(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    pub fn pop_u64_le(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.pop_into(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    // A short window consumes whatever is left and leaves the remainder of
    //  `target` zeroed, so truncated frames parse as zero values.
    fn pop_into(&mut self, target: &mut [u8]) {
        let available = usize::min(target.len(), self.size());
        target[..available].copy_from_slice(&self.data[self.pos..self.pos + available]);
        self.remove(target.len());
    }
}
