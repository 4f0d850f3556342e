use std::collections::VecDeque;

use bytes::Bytes;

/// Bounded replay buffer holding the most recent PTY output for a session.
///
/// The bound is a strict byte-size cap: appending trims whole chunks from the
/// front (oldest first) until the total is back under the cap. Late-joining
/// clients receive `snapshot()` before consuming their live channel.
pub struct ReplayBuffer {
    chunks: VecDeque<Bytes>,
    total_bytes: usize,
    cap_bytes: usize,
}

impl ReplayBuffer {
    /// Default cap: 100 KiB of output per session.
    pub const DEFAULT_CAP_BYTES: usize = 100 * 1024;

    pub fn new(cap_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            cap_bytes,
        }
    }

    /// Append a chunk, evicting oldest chunks until the byte cap holds.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        if chunk.len() > self.cap_bytes {
            // Chunks are never split; an oversized chunk replaces everything
            // and is truncated to the newest cap_bytes of data.
            self.chunks.clear();
            let start = chunk.len() - self.cap_bytes;
            let tail = chunk.slice(start..);
            self.total_bytes = tail.len();
            self.chunks.push_back(tail);
            return;
        }
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);
        while self.total_bytes > self.cap_bytes {
            match self.chunks.pop_front() {
                Some(evicted) => self.total_bytes -= evicted.len(),
                None => break,
            }
        }
    }

    /// Concatenated copy of everything currently buffered, oldest first.
    pub fn snapshot(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        Bytes::from(out)
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }

    pub fn len_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_accumulates_in_order() {
        let mut buf = ReplayBuffer::new(1024);
        buf.push(Bytes::from_static(b"hello "));
        buf.push(Bytes::from_static(b"world"));
        assert_eq!(buf.snapshot(), Bytes::from_static(b"hello world"));
        assert_eq!(buf.len_bytes(), 11);
    }

    #[test]
    fn cap_is_never_exceeded() {
        let mut buf = ReplayBuffer::new(10);
        for _ in 0..100 {
            buf.push(Bytes::from_static(b"abc"));
            assert!(buf.len_bytes() <= 10);
        }
    }

    #[test]
    fn eviction_is_fifo_by_chunk() {
        let mut buf = ReplayBuffer::new(6);
        buf.push(Bytes::from_static(b"aa"));
        buf.push(Bytes::from_static(b"bb"));
        buf.push(Bytes::from_static(b"cc"));
        assert_eq!(buf.snapshot(), Bytes::from_static(b"aabbcc"));

        // One more chunk pushes the oldest out.
        buf.push(Bytes::from_static(b"dd"));
        assert_eq!(buf.snapshot(), Bytes::from_static(b"bbccdd"));
    }

    #[test]
    fn one_byte_chunks_past_cap_keep_exactly_cap_bytes() {
        let cap = 16;
        let mut buf = ReplayBuffer::new(cap);
        for i in 0..64u8 {
            buf.push(Bytes::copy_from_slice(&[i]));
        }
        assert_eq!(buf.len_bytes(), cap);
        // Oldest chunks are gone: only bytes 48..64 remain.
        let expected: Vec<u8> = (48..64).collect();
        assert_eq!(buf.snapshot(), Bytes::from(expected));
    }

    #[test]
    fn oversized_chunk_keeps_newest_tail() {
        let mut buf = ReplayBuffer::new(4);
        buf.push(Bytes::from_static(b"xy"));
        buf.push(Bytes::from_static(b"0123456789"));
        assert_eq!(buf.snapshot(), Bytes::from_static(b"6789"));
        assert_eq!(buf.len_bytes(), 4);
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let mut buf = ReplayBuffer::new(8);
        buf.push(Bytes::new());
        assert!(buf.is_empty());
    }

    #[test]
    fn clear_resets_to_empty() {
        let mut buf = ReplayBuffer::new(64);
        buf.push(Bytes::from_static(b"data"));
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.len_bytes(), 0);
        assert_eq!(buf.snapshot(), Bytes::new());
    }
}
