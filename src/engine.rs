//! Execution engine orchestration.
//!
//! Wires the packet framer to the command dispatcher and drives them from a
//! single blocking worker. One engine per process: command execution mutates
//! process-wide state (the allocation table, injected code), so a second
//! concurrent instance is refused at construction.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{info, warn};

use crate::cache::CacheOps;
use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::memory::{BufferPool, DeviceMemory};
use crate::protocol::wire::error_code;
use crate::protocol::{flags, Framer, FramerEvent};
use crate::transport::Transport;

/// Set while an engine instance exists anywhere in the process.
static ENGINE_ACTIVE: AtomicBool = AtomicBool::new(false);

/// RAII ownership of the process-wide engine slot.
struct ActiveGuard;

impl ActiveGuard {
    fn acquire() -> Result<Self> {
        if ENGINE_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::EngineActive);
        }
        Ok(ActiveGuard)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ENGINE_ACTIVE.store(false, Ordering::Release);
    }
}

/// Allocate a protocol buffer, preferring the external pool.
fn alloc_buffer<M: DeviceMemory>(memory: &mut M, size: usize, label: &str) -> Result<Box<[u8]>> {
    if let Some(buf) = memory.alloc_protocol_buffer(size, BufferPool::External) {
        return Ok(buf);
    }
    warn!(size, label, "external pool exhausted, falling back to internal");
    memory
        .alloc_protocol_buffer(size, BufferPool::Internal)
        .ok_or_else(|| Error::Startup(format!("cannot allocate {size}-byte {label} buffer")))
}

/// The remote execution engine.
///
/// Owns the transport (through the framer), the dispatcher, and the RX/TX
/// buffers. Construction performs all fallible setup; [`Engine::run`] then
/// loops until the transport fails or closes.
pub struct Engine<T: Transport, M: DeviceMemory, C: CacheOps> {
    framer: Framer<T>,
    dispatcher: Dispatcher<M, C>,
    rx: Box<[u8]>,
    tx: Box<[u8]>,
    stack_size: usize,
    _guard: ActiveGuard,
}

impl<T: Transport, M: DeviceMemory, C: CacheOps> fmt::Debug for Engine<T, M, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("rx_len", &self.rx.len())
            .field("tx_len", &self.tx.len())
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

impl<T: Transport, M: DeviceMemory, C: CacheOps> Engine<T, M, C> {
    /// Set up an engine over `transport`.
    ///
    /// Fails with [`Error::EngineActive`] if another instance exists, or
    /// [`Error::Startup`] if neither memory pool can supply the RX/TX
    /// buffers. The effective max payload is the smallest of the RX buffer,
    /// the TX buffer, and the transport's own limit.
    pub fn new(transport: T, mut memory: M, cache_ops: C, config: &EngineConfig) -> Result<Self> {
        let guard = ActiveGuard::acquire()?;

        let rx = alloc_buffer(&mut memory, config.effective_rx_size(), "rx")?;
        let tx = alloc_buffer(&mut memory, config.effective_tx_size(), "tx")?;

        let max_payload = rx
            .len()
            .min(tx.len())
            .min(transport.buffer_limit().unwrap_or(usize::MAX));

        info!(
            rx = rx.len(),
            tx = tx.len(),
            max_payload,
            priority = config.worker_priority,
            affinity = config.core_affinity,
            "engine ready"
        );

        Ok(Self {
            framer: Framer::new(transport, max_payload),
            dispatcher: Dispatcher::new(memory, cache_ops, max_payload),
            rx,
            tx,
            stack_size: config.stack_size,
            _guard: guard,
        })
    }

    /// Negotiated maximum payload size in bytes.
    pub fn max_payload(&self) -> usize {
        self.framer.max_payload()
    }

    /// Serve requests until the transport closes or fails.
    ///
    /// Recoverable frame problems (bad checksum, oversized packet) are
    /// handled inside the framer and the loop continues. A closed peer is a
    /// normal shutdown, not an error.
    pub fn run(mut self) -> Result<()> {
        loop {
            match self.framer.read_event(&mut self.rx) {
                Ok(FramerEvent::Request { cmd_id, flags: _, len }) => {
                    let (out_len, code) =
                        self.dispatcher.execute(cmd_id, &self.rx[..len], &mut self.tx);
                    if code == error_code::OK {
                        self.framer
                            .send_response(cmd_id, flags::RESPONSE_OK, &self.tx[..out_len])?;
                    } else {
                        self.framer.send_error(cmd_id, code)?;
                    }
                }
                Ok(FramerEvent::ChecksumMismatch { .. }) | Ok(FramerEvent::Oversized { .. }) => {}
                Err(Error::ConnectionClosed) => {
                    info!("peer closed, shutting down");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run the engine loop on a dedicated worker thread.
    pub fn spawn(self) -> Result<EngineHandle>
    where
        T: Send + 'static,
        M: Send + 'static,
        C: Send + 'static,
    {
        let join = thread::Builder::new()
            .name("jitlink-worker".into())
            .stack_size(self.stack_size)
            .spawn(move || self.run())
            .map_err(|e| Error::Startup(format!("cannot spawn worker: {e}")))?;
        Ok(EngineHandle { join })
    }
}

/// Handle to a spawned engine worker.
pub struct EngineHandle {
    join: thread::JoinHandle<Result<()>>,
}

impl EngineHandle {
    /// Wait for the worker to finish and return its outcome.
    pub fn join(self) -> Result<()> {
        self.join
            .join()
            .map_err(|_| Error::Startup("engine worker panicked".into()))?
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;
    use crate::cache::NoopCache;
    use crate::memory::EmulatedMemory;
    use crate::transport::duplex;

    fn small_config() -> EngineConfig {
        EngineConfig {
            rx_buffer_size: 4096,
            tx_buffer_size: 4096,
            ..EngineConfig::default()
        }
    }

    #[test]
    #[serial]
    fn test_second_instance_refused_until_first_drops() {
        let (a, _peer_a) = duplex(1024);
        let first = Engine::new(a, EmulatedMemory::new(4096), NoopCache, &small_config()).unwrap();

        let (b, _peer_b) = duplex(1024);
        let err =
            Engine::new(b, EmulatedMemory::new(4096), NoopCache, &small_config()).unwrap_err();
        assert!(matches!(err, Error::EngineActive));

        drop(first);
        let (c, _peer_c) = duplex(1024);
        Engine::new(c, EmulatedMemory::new(4096), NoopCache, &small_config()).unwrap();
    }

    #[test]
    #[serial]
    fn test_buffer_allocation_failure_is_startup_error_and_releases_slot() {
        let (a, _peer) = duplex(1024);
        let memory = EmulatedMemory::new(4096).fail_buffer_alloc();
        let err = Engine::new(a, memory, NoopCache, &small_config()).unwrap_err();
        assert!(matches!(err, Error::Startup(_)));

        // The failed construction must not leave the slot occupied.
        let (b, _peer_b) = duplex(1024);
        Engine::new(b, EmulatedMemory::new(4096), NoopCache, &small_config()).unwrap();
    }

    #[test]
    #[serial]
    fn test_max_payload_takes_transport_limit() {
        let (a, _peer) = duplex(512);
        let engine =
            Engine::new(a, EmulatedMemory::new(4096), NoopCache, &small_config()).unwrap();
        assert_eq!(engine.max_payload(), 512);
    }

    #[test]
    #[serial]
    fn test_max_payload_takes_smaller_buffer() {
        let (a, _peer) = duplex(1 << 20);
        let config = EngineConfig {
            rx_buffer_size: 4096,
            tx_buffer_size: 2048,
            ..EngineConfig::default()
        };
        let engine = Engine::new(a, EmulatedMemory::new(4096), NoopCache, &config).unwrap();
        assert_eq!(engine.max_payload(), 2048);
    }
}
