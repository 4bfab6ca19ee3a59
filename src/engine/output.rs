//! Bounded capture of a child process's combined stdout/stderr.
//!
//! The engine can be very chatty during startup, and the output is only
//! ever needed for diagnostics when something goes wrong. [`BoundedOutputBuffer`]
//! keeps the first `N` and the last `N` bytes written to it and counts
//! everything in between, so memory stays bounded no matter how long the
//! process runs.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::error::LockResultExt;

/// Size of the read buffer used by output pumps.
const PUMP_CHUNK_SIZE: usize = 8 * 1024;

/// Write sink that retains a bounded prefix and suffix of its input.
///
/// Retained content is independent of how writes are chunked: writing one
/// byte at a time yields the same head and tail as a single large write.
#[derive(Debug, Clone)]
pub struct BoundedOutputBuffer {
    capacity: usize,
    head: Vec<u8>,
    tail: VecDeque<u8>,
    total: u64,
}

impl BoundedOutputBuffer {
    /// Create a buffer that keeps at most `capacity` bytes on each side.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            head: Vec::with_capacity(capacity.min(PUMP_CHUNK_SIZE)),
            tail: VecDeque::new(),
            total: 0,
        }
    }

    /// Total number of bytes ever written.
    pub fn total_written(&self) -> u64 {
        self.total
    }

    /// Number of bytes dropped from the middle.
    pub fn omitted(&self) -> u64 {
        self.total - (self.head.len() + self.tail.len()) as u64
    }

    /// Append bytes. Never fails and never blocks.
    pub fn push(&mut self, mut bytes: &[u8]) {
        self.total += bytes.len() as u64;

        let room = self.capacity - self.head.len();
        if room > 0 {
            let take = room.min(bytes.len());
            self.head.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
        if bytes.is_empty() {
            return;
        }

        if bytes.len() >= self.capacity {
            self.tail.clear();
            self.tail.extend(&bytes[bytes.len() - self.capacity..]);
        } else {
            self.tail.extend(bytes);
            let excess = self.tail.len().saturating_sub(self.capacity);
            self.tail.drain(..excess);
        }
    }

    /// Retained bytes: `head ++ tail`.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.head.len() + self.tail.len());
        out.extend_from_slice(&self.head);
        out.extend(self.tail.iter());
        out
    }

    /// Retained content as text, trimmed of trailing whitespace.
    ///
    /// Equals everything written when at most `2 * capacity` bytes were
    /// written; otherwise it is the first and last `capacity` bytes joined
    /// together.
    pub fn snapshot(&self) -> String {
        trim_output(&self.bytes())
    }

    /// Like [`snapshot`](Self::snapshot), but marks where bytes were dropped.
    pub fn annotated(&self) -> String {
        let omitted = self.omitted();
        if omitted == 0 {
            return self.snapshot();
        }
        let mut out = self.head.clone();
        out.extend_from_slice(format!("\n... omitting {} bytes ...\n", omitted).as_bytes());
        out.extend(self.tail.iter());
        trim_output(&out)
    }
}

impl io::Write for BoundedOutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decode process output and drop trailing whitespace.
pub fn trim_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

/// Shared handle to a [`BoundedOutputBuffer`].
///
/// Cloning shares the underlying buffer, which is how stdout and stderr of
/// one child end up interleaved in the same capture.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    inner: Arc<Mutex<BoundedOutputBuffer>>,
}

impl OutputCapture {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BoundedOutputBuffer::new(capacity))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoundedOutputBuffer> {
        self.inner.lock().recover_poison("OutputCapture")
    }

    pub fn write(&self, bytes: &[u8]) {
        self.lock().push(bytes);
    }

    pub fn snapshot(&self) -> String {
        self.lock().snapshot()
    }

    pub fn annotated(&self) -> String {
        self.lock().annotated()
    }

    pub fn total_written(&self) -> u64 {
        self.lock().total_written()
    }

    /// Spawn a task copying `reader` into this capture until EOF.
    ///
    /// Read errors end the pump; whatever was captured so far is kept.
    pub fn pump<R>(&self, mut reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let capture = self.clone();
        tokio::spawn(async move {
            let mut chunk = vec![0u8; PUMP_CHUNK_SIZE];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => capture.write(&chunk[..n]),
                    Err(e) => {
                        log::debug!(
                            target: "sqlbuild::engine",
                            "Output pump stopped on read error: {}",
                            e
                        );
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| b'a' + (i % 26) as u8).collect()
    }

    fn write_in_chunks(buf: &mut BoundedOutputBuffer, data: &[u8], chunk: usize) {
        for piece in data.chunks(chunk) {
            buf.write_all(piece).unwrap();
        }
    }

    #[test]
    fn retains_everything_up_to_twice_capacity() {
        let data = sample(20);
        for chunk in [1, 3, 7, 20] {
            let mut buf = BoundedOutputBuffer::new(10);
            write_in_chunks(&mut buf, &data, chunk);
            assert_eq!(buf.bytes(), data, "chunk size {}", chunk);
            assert_eq!(buf.omitted(), 0);
        }
    }

    #[test]
    fn keeps_head_and_tail_when_overflowing() {
        let data = sample(100);
        let mut expected = data[..10].to_vec();
        expected.extend_from_slice(&data[90..]);

        for chunk in [1, 4, 9, 10, 11, 33, 100] {
            let mut buf = BoundedOutputBuffer::new(10);
            write_in_chunks(&mut buf, &data, chunk);
            assert_eq!(buf.bytes(), expected, "chunk size {}", chunk);
            assert_eq!(buf.snapshot().as_bytes(), expected.as_slice());
            assert_eq!(buf.total_written(), 100);
            assert_eq!(buf.omitted(), 80);
        }
    }

    #[test]
    fn snapshot_trims_trailing_whitespace() {
        let mut buf = BoundedOutputBuffer::new(64);
        buf.push(b"engine starting\n  ready \n\n");
        assert_eq!(buf.snapshot(), "engine starting\n  ready");
    }

    #[test]
    fn annotated_marks_dropped_bytes() {
        let mut buf = BoundedOutputBuffer::new(4);
        buf.push(b"AAAA-middle-BBBB");
        assert_eq!(buf.snapshot(), "AAAABBBB");
        assert_eq!(buf.annotated(), "AAAA\n... omitting 8 bytes ...\nBBBB");
    }

    #[tokio::test]
    async fn pump_copies_reader_until_eof() {
        let capture = OutputCapture::new(1024);
        let reader: &'static [u8] = b"line one\nline two\n";
        capture.pump(reader).await.unwrap();
        assert_eq!(capture.snapshot(), "line one\nline two");
        assert_eq!(capture.total_written(), 18);
    }
}
