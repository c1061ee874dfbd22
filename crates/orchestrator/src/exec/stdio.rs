use std::collections::VecDeque;

use runtime_core::StdioStream;

pub const DEFAULT_MAX_BUFFER_BYTES: usize = 64 * 1024;

/// One output callback, numbered in the run-wide sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedChunk {
    pub sequence: u64,
    pub stream: StdioStream,
    pub bytes: usize,
    pub data: String,
}

/// Keeps only the most recent `limit` bytes.
#[derive(Debug, Default)]
struct BoundedBuffer {
    bytes: VecDeque<u8>,
}

impl BoundedBuffer {
    fn push(&mut self, data: &[u8], limit: usize) {
        if limit == 0 {
            self.bytes.clear();
            return;
        }
        if data.len() >= limit {
            self.bytes.clear();
            self.bytes.extend(&data[data.len() - limit..]);
            return;
        }
        self.bytes.extend(data);
        let overflow = self.bytes.len().saturating_sub(limit);
        self.bytes.drain(..overflow);
    }

    fn to_string_lossy(&self) -> String {
        let (front, back) = self.bytes.as_slices();
        if back.is_empty() {
            return String::from_utf8_lossy(front).into_owned();
        }
        let mut joined = Vec::with_capacity(self.bytes.len());
        joined.extend_from_slice(front);
        joined.extend_from_slice(back);
        String::from_utf8_lossy(&joined).into_owned()
    }
}

/// Sequences stdout/stderr chunks and keeps a bounded tail of each stream.
#[derive(Debug)]
pub struct StdioTracker {
    max_buffer_bytes: usize,
    start_sequence: u64,
    sequence: u64,
    stdout: BoundedBuffer,
    stderr: BoundedBuffer,
}

impl StdioTracker {
    pub fn new(max_buffer_bytes: usize) -> Self {
        Self::starting_at(max_buffer_bytes, 0)
    }

    /// The first pushed chunk gets `start_sequence + 1`.
    pub fn starting_at(max_buffer_bytes: usize, start_sequence: u64) -> Self {
        Self {
            max_buffer_bytes,
            start_sequence,
            sequence: start_sequence,
            stdout: BoundedBuffer::default(),
            stderr: BoundedBuffer::default(),
        }
    }

    pub fn push(&mut self, stream: StdioStream, data: &[u8]) -> SequencedChunk {
        let limit = self.max_buffer_bytes;
        self.buffer_mut(stream).push(data, limit);
        self.sequence += 1;
        SequencedChunk {
            sequence: self.sequence,
            stream,
            bytes: data.len(),
            data: String::from_utf8_lossy(data).into_owned(),
        }
    }

    pub fn buffered(&self, stream: StdioStream) -> String {
        self.buffer(stream).to_string_lossy()
    }

    pub fn buffered_bytes(&self, stream: StdioStream) -> usize {
        self.buffer(stream).bytes.len()
    }

    /// Sequence number of the last pushed chunk.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn reset(&mut self) {
        self.stdout = BoundedBuffer::default();
        self.stderr = BoundedBuffer::default();
        self.sequence = self.start_sequence;
    }

    fn buffer(&self, stream: StdioStream) -> &BoundedBuffer {
        match stream {
            StdioStream::Stdout => &self.stdout,
            StdioStream::Stderr => &self.stderr,
        }
    }

    fn buffer_mut(&mut self, stream: StdioStream) -> &mut BoundedBuffer {
        match stream {
            StdioStream::Stdout => &mut self.stdout,
            StdioStream::Stderr => &mut self.stderr,
        }
    }
}

impl Default for StdioTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_keeps_most_recent_bytes() {
        let mut tracker = StdioTracker::new(16);
        tracker.push(StdioStream::Stdout, b"abcdefgh");
        tracker.push(StdioStream::Stdout, b"ijklmnop");
        tracker.push(StdioStream::Stdout, b"qrstuvwx");

        assert_eq!(tracker.buffered(StdioStream::Stdout), "ijklmnopqrstuvwx");
        assert_eq!(tracker.buffered_bytes(StdioStream::Stdout), 16);
    }

    #[test]
    fn test_oversized_chunk_is_truncated_from_front() {
        let mut tracker = StdioTracker::new(4);
        let chunk = tracker.push(StdioStream::Stderr, b"0123456789");

        assert_eq!(chunk.bytes, 10);
        assert_eq!(chunk.data, "0123456789");
        assert_eq!(tracker.buffered(StdioStream::Stderr), "6789");
    }

    #[test]
    fn test_sequence_shared_across_streams() {
        let mut tracker = StdioTracker::starting_at(1024, 5);
        let first = tracker.push(StdioStream::Stdout, b"out");
        let second = tracker.push(StdioStream::Stderr, b"err");

        assert_eq!(first.sequence, 6);
        assert_eq!(second.sequence, 7);
        assert_eq!(tracker.buffered(StdioStream::Stdout), "out");
        assert_eq!(tracker.buffered(StdioStream::Stderr), "err");

        tracker.reset();
        assert_eq!(tracker.sequence(), 5);
        assert_eq!(tracker.buffered(StdioStream::Stdout), "");
    }

    #[test]
    fn test_zero_limit_keeps_nothing() {
        let mut tracker = StdioTracker::new(0);
        tracker.push(StdioStream::Stdout, b"hello");
        assert_eq!(tracker.buffered_bytes(StdioStream::Stdout), 0);
    }
}
