//! In-process loopback demo: an engine worker serving an emulated device,
//! driven by the blocking client over a fifo duplex.
//!
//! Run with `cargo run --example loopback`.

use jitlink::cache::NoopCache;
use jitlink::memory::EmulatedMemory;
use jitlink::transport::duplex;
use jitlink::{Client, Engine, EngineConfig};

fn main() -> jitlink::error::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = EngineConfig {
        rx_buffer_size: 16 * 1024,
        tx_buffer_size: 16 * 1024,
        ..EngineConfig::default()
    };

    let (device_end, host_end) = duplex(32 * 1024);
    let engine = Engine::new(
        device_end,
        EmulatedMemory::new(256 * 1024),
        NoopCache,
        &config,
    )?;
    let worker = engine.spawn()?;

    let mut client = Client::new(host_end);

    let info = client.get_info()?;
    println!(
        "device: protocol {}.{}, max payload {} bytes, {} allocation slots",
        info.protocol_major, info.protocol_minor, info.max_payload, info.table_capacity
    );

    let heap = client.heap_info()?;
    println!(
        "heap: {}/{} external bytes free",
        heap.free_external, heap.total_external
    );

    // Inject a "routine" and call it. The emulated device's call convention
    // returns the little-endian word at the entry address.
    let addr = client.alloc(256, 0, 16)?;
    println!("allocated 256 bytes at {addr}");

    let mut routine = [0u8; 64];
    routine[..4].copy_from_slice(&42u32.to_le_bytes());
    let report = client.write_mem(addr, &routine, false)?;
    println!(
        "wrote {} bytes, cache synced: {}",
        report.bytes_written, report.cache_synced
    );

    let result = client.exec(addr, false)?;
    println!("exec({addr}) -> {result}");

    client.free(addr)?;
    println!("freed {addr}");

    drop(client);
    worker.join()
}
