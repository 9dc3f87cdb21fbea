//! Bounded byte fifo bridging an asynchronous producer to the blocking engine.
//!
//! Inbound bytes arrive from a driver or interrupt context and must be handed
//! to the engine's blocking reads through a bounded intermediary buffer. The
//! producer side ([`FifoProducer::offer`]) uses a short timeout with a single
//! bounded retry; if the buffer stays saturated the excess bytes are dropped
//! and logged. There is no retransmission at this layer; a drop
//! desynchronizes the stream until the next magic-byte resync.
//!
//! [`duplex`] wires two fifos into a loopback transport pair, used by the
//! integration tests and the demo in place of a hardware link.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use super::Transport;
use crate::error::{Error, Result};

/// Default producer-side wait before retrying a saturated fifo.
pub const DEFAULT_OFFER_TIMEOUT: Duration = Duration::from_millis(100);

struct Inner {
    buf: VecDeque<u8>,
    closed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    capacity: usize,
    /// Signalled when bytes are added or the fifo closes.
    data: Condvar,
    /// Signalled when bytes are consumed or the fifo closes.
    space: Condvar,
}

impl Shared {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            data: Condvar::new(),
            space: Condvar::new(),
        })
    }

    /// Queue as many bytes as fit right now. Returns the count accepted.
    fn push_some(&self, inner: &mut Inner, data: &[u8]) -> usize {
        let room = self.capacity - inner.buf.len();
        let n = room.min(data.len());
        inner.buf.extend(&data[..n]);
        if n > 0 {
            self.data.notify_one();
        }
        n
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.data.notify_all();
        self.space.notify_all();
    }
}

/// Producer handle for the driver/interrupt side of a fifo.
#[derive(Clone)]
pub struct FifoProducer {
    shared: Arc<Shared>,
    offer_timeout: Duration,
}

impl FifoProducer {
    /// Hand bytes to the consumer.
    ///
    /// Tries once, waits up to the offer timeout for space, then retries once
    /// more. Anything still unaccepted is dropped and logged. Returns the
    /// number of bytes accepted.
    pub fn offer(&self, data: &[u8]) -> usize {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return 0;
        }

        let mut accepted = self.shared.push_some(&mut inner, data);
        if accepted < data.len() {
            // One bounded retry after waiting for the consumer to drain.
            self.shared
                .space
                .wait_for(&mut inner, self.offer_timeout);
            if !inner.closed {
                accepted += self.shared.push_some(&mut inner, &data[accepted..]);
            }
            if accepted < data.len() {
                warn!(
                    dropped = data.len() - accepted,
                    capacity = self.shared.capacity,
                    "fifo saturated, dropping bytes"
                );
            }
        }
        accepted
    }

    /// Close the fifo; pending and future consumer reads fail.
    pub fn close(&self) {
        self.shared.close();
    }
}

/// Blocking consumer side of a fifo.
struct FifoConsumer {
    shared: Arc<Shared>,
}

impl FifoConsumer {
    fn read_exact(&self, out: &mut [u8]) -> Result<()> {
        let mut read = 0;
        let mut inner = self.shared.inner.lock();
        while read < out.len() {
            while inner.buf.is_empty() {
                if inner.closed {
                    return Err(Error::ConnectionClosed);
                }
                self.shared.data.wait(&mut inner);
            }
            while read < out.len() {
                match inner.buf.pop_front() {
                    Some(b) => {
                        out[read] = b;
                        read += 1;
                    }
                    None => break,
                }
            }
            self.shared.space.notify_all();
        }
        Ok(())
    }
}

/// One endpoint of a loopback transport pair.
///
/// Writes block until the peer drains (lossless; the drop policy applies
/// only to [`FifoProducer::offer`], the driver seam).
pub struct FifoTransport {
    rx: FifoConsumer,
    tx: Arc<Shared>,
}

impl FifoTransport {
    /// Producer handle feeding this endpoint's inbound fifo.
    ///
    /// Lets a driver callback inject received bytes directly.
    pub fn inbound_producer(&self) -> FifoProducer {
        FifoProducer {
            shared: self.rx.shared.clone(),
            offer_timeout: DEFAULT_OFFER_TIMEOUT,
        }
    }

    /// Close both directions of this endpoint.
    pub fn close(&self) {
        self.rx.shared.close();
        self.tx.close();
    }
}

impl Transport for FifoTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.rx.read_exact(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        let mut inner = self.tx.inner.lock();
        while written < buf.len() {
            if inner.closed {
                return Err(Error::ConnectionClosed);
            }
            written += self.tx.push_some(&mut inner, &buf[written..]);
            if written < buf.len() {
                self.tx.space.wait(&mut inner);
            }
        }
        Ok(())
    }

    fn buffer_limit(&self) -> Option<usize> {
        Some(self.rx.shared.capacity)
    }
}

impl Drop for FifoTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build a connected pair of loopback endpoints, each direction bounded to
/// `capacity` bytes. Bytes written on one endpoint are read from the other.
pub fn duplex(capacity: usize) -> (FifoTransport, FifoTransport) {
    let a_to_b = Shared::new(capacity);
    let b_to_a = Shared::new(capacity);

    let a = FifoTransport {
        rx: FifoConsumer {
            shared: b_to_a.clone(),
        },
        tx: a_to_b.clone(),
    };
    let b = FifoTransport {
        rx: FifoConsumer { shared: a_to_b },
        tx: b_to_a,
    };
    (a, b)
}
