//! Byte FIFO shared between a completion handler (writer) and stream
//! readers. Order preserving, never copies beyond the destination buffer.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::sync::futures::Notified;

pub struct ByteFifo {
    inner: Mutex<Inner>,
    readable: Notify,
}

struct Inner {
    buf: VecDeque<u8>,
    position: u64,
}

impl Default for ByteFifo {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteFifo {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::new(),
                position: 0,
            }),
            readable: Notify::new(),
        }
    }

    /// Enqueue bytes and wake every waiter.
    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.lock().buf.extend(data);
        self.readable.notify_waiters();
    }

    /// Dequeue up to `dst.len()` bytes, returns the number of bytes read.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut inner = self.lock();
        let count = dst.len().min(inner.buf.len());
        for (slot, byte) in dst.iter_mut().zip(inner.buf.drain(..count)) {
            *slot = byte;
        }
        inner.position += count as u64;
        count
    }

    /// Take everything currently queued in one go. Used by the stream's
    /// single-drain send pipeline.
    pub fn drain(&self) -> Vec<u8> {
        let mut inner = self.lock();
        let drained: Vec<u8> = inner.buf.drain(..).collect();
        inner.position += drained.len() as u64;
        drained
    }

    pub fn available(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buf.is_empty()
    }

    /// Total bytes consumed over the FIFO's lifetime, monotone.
    pub fn position(&self) -> u64 {
        self.lock().position
    }

    /// Wake-up for readers. Pin and `enable()` the future BEFORE
    /// re-checking [ByteFifo::available], otherwise an append between the
    /// check and the first poll is lost.
    pub fn readable(&self) -> Notified<'_> {
        self.readable.notified()
    }

    /// Wake all waiters without appending, e.g. when the owning client
    /// disconnects and blocked readers must notice EOF.
    pub fn wake_waiters(&self) {
        self.readable.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod test {
    use super::ByteFifo;

    #[test]
    fn test_read_preserves_order() {
        let fifo = ByteFifo::new();
        fifo.append(b"hello ");
        fifo.append(b"world");

        let mut dst = [0u8; 8];
        assert_eq!(fifo.read(&mut dst), 8);
        assert_eq!(&dst, b"hello wo");
        assert_eq!(fifo.available(), 3);

        let mut rest = [0u8; 8];
        assert_eq!(fifo.read(&mut rest), 3);
        assert_eq!(&rest[..3], b"rld");
        assert_eq!(fifo.position(), 11);
    }

    #[test]
    fn test_read_empty() {
        let fifo = ByteFifo::new();
        let mut dst = [0u8; 4];
        assert_eq!(fifo.read(&mut dst), 0);
        assert_eq!(fifo.position(), 0);
    }
}
