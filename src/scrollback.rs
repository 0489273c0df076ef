use bytes::{Buf, Bytes, BytesMut};

/// Default scrollback cap per session (50 KiB).
pub const DEFAULT_SCROLLBACK_BYTES: usize = 50 * 1024;

/// Bounded byte history of a session's output.
///
/// Appending past the cap discards the oldest bytes first; the newest bytes
/// are always retained.
#[derive(Debug)]
pub struct Scrollback {
    buf: BytesMut,
    cap: usize,
}

impl Scrollback {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap.min(DEFAULT_SCROLLBACK_BYTES)),
            cap,
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        if self.cap == 0 {
            return;
        }
        if data.len() >= self.cap {
            self.buf.clear();
            self.buf.extend_from_slice(&data[data.len() - self.cap..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.advance(overflow);
        }
        self.buf.extend_from_slice(data);
    }

    /// Copy of the current contents, oldest byte first.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.cap
    }
}

impl Default for Scrollback {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK_BYTES)
    }
}
