//! Transport abstraction: a duplex blocking byte stream.

pub mod fifo;

pub use fifo::{duplex, FifoProducer, FifoTransport};

use crate::error::Result;

/// A duplex byte-oriented link.
///
/// Both operations block until complete. `read_exact` returns
/// [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if the peer
/// goes away mid-read; the engine treats that as fatal for its loop.
pub trait Transport {
    /// Read exactly `buf.len()` bytes.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf`.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Transport-imposed buffering limit in bytes, if any.
    ///
    /// Folded into the negotiated max payload advertised via GetInfo.
    fn buffer_limit(&self) -> Option<usize> {
        None
    }
}
