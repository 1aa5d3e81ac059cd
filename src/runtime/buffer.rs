//! Per-connection buffers.
//!
//! The protocol has no framing beyond fixed message sizes, so inbound data
//! is accumulated into a `FrameBuffer` until exactly one frame is present.
//! Outbound data is an ordered `WriteQueue` of byte buffers that survives
//! partial writes across writable events.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// Accumulator for fixed-size inbound frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    filled: usize,
    frame_len: usize,
}

impl FrameBuffer {
    /// Create a buffer for frames of exactly `frame_len` bytes.
    ///
    /// # Panics
    /// Panics if `frame_len` is zero.
    pub fn new(frame_len: usize) -> Self {
        assert!(frame_len > 0, "frame length must be non-zero");
        Self {
            buf: BytesMut::zeroed(frame_len),
            filled: 0,
            frame_len,
        }
    }

    /// Perform one read into the unfilled part of the current frame.
    ///
    /// Returns the number of bytes read; `Ok(0)` means the peer closed.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        debug_assert!(self.filled < self.frame_len, "take the frame before reading");
        let n = reader.read(&mut self.buf[self.filled..])?;
        self.filled += n;
        Ok(n)
    }

    /// Whether a complete frame is buffered.
    pub fn is_complete(&self) -> bool {
        self.filled == self.frame_len
    }

    /// Take the buffered frame if it is complete.
    pub fn take_frame(&mut self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let frame = std::mem::replace(&mut self.buf, BytesMut::zeroed(self.frame_len));
        self.filled = 0;
        Some(frame.freeze())
    }

    /// Bytes of a partial frame currently buffered.
    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }
}

/// Outcome of flushing a write queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Every queued buffer was written.
    Drained,
    /// The transport stopped accepting data; retry on the next writable event.
    Blocked,
}

/// Ordered queue of pending outbound buffers.
#[derive(Debug, Default)]
pub struct WriteQueue {
    queue: VecDeque<Bytes>,
    pending: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer to the tail of the queue. Empty buffers are ignored.
    pub fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.pending += data.len();
        self.queue.push_back(data);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of buffers not yet fully written.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Number of bytes not yet written.
    pub fn pending_bytes(&self) -> usize {
        self.pending
    }

    /// Write queued buffers in order until the queue drains or `writer`
    /// would block. A partially written buffer stays at the head.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<FlushStatus> {
        while let Some(front) = self.queue.front_mut() {
            match writer.write(&front[..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    front.advance(n);
                    self.pending -= n;
                    if front.is_empty() {
                        self.queue.pop_front();
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushStatus::Blocked);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(FlushStatus::Drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader yielding its data in fixed-size chunks, then WouldBlock.
    struct ChunkedReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Writer accepting at most `budget` bytes before blocking.
    struct ThrottledWriter {
        out: Vec<u8>,
        budget: usize,
    }

    impl Write for ThrottledWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget).min(3);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_frame_assembled_from_partial_reads() {
        let data: Vec<u8> = (0..20).collect();
        let mut reader = ChunkedReader { data: data.clone(), pos: 0, chunk: 3 };
        let mut frames = FrameBuffer::new(10);
        let mut out = Vec::new();

        loop {
            match frames.read_from(&mut reader) {
                Ok(_) => {
                    if let Some(frame) = frames.take_frame() {
                        out.push(frame);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(out.len(), 2);
        assert_eq!(&out[0][..], &data[..10]);
        assert_eq!(&out[1][..], &data[10..]);
        assert_eq!(frames.filled(), 0);
    }

    #[test]
    fn test_incomplete_frame_is_held() {
        let mut reader = ChunkedReader { data: vec![7; 4], pos: 0, chunk: 4 };
        let mut frames = FrameBuffer::new(8);

        assert_eq!(frames.read_from(&mut reader).unwrap(), 4);
        assert!(frames.take_frame().is_none());
        assert_eq!(frames.filled(), 4);
    }

    #[test]
    fn test_zero_length_read_reports_close() {
        let mut frames = FrameBuffer::new(8);
        let mut empty: &[u8] = &[];
        assert_eq!(frames.read_from(&mut empty).unwrap(), 0);
        assert!(!frames.is_complete());
    }

    #[test]
    fn test_write_queue_resumes_after_block() {
        let mut queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"hello"));
        queue.push(Bytes::new());
        queue.push(Bytes::from_static(b"world"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pending_bytes(), 10);

        let mut writer = ThrottledWriter { out: Vec::new(), budget: 7 };
        assert_eq!(queue.write_to(&mut writer).unwrap(), FlushStatus::Blocked);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending_bytes(), 3);

        writer.budget = 100;
        assert_eq!(queue.write_to(&mut writer).unwrap(), FlushStatus::Drained);
        assert!(queue.is_empty());
        assert_eq!(writer.out, b"helloworld");
    }

    #[test]
    fn test_write_zero_is_an_error() {
        let mut queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"x"));
        let mut full: &mut [u8] = &mut [];
        let err = queue.write_to(&mut full).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
