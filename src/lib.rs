//! # jitlink
//!
//! Device-side protocol engine that turns a microcontroller into a remotely
//! programmable execution target. A host issues framed binary commands over a
//! byte-oriented link to allocate device memory, upload machine code and data,
//! execute that code in place, and read results back, all without reflashing.
//!
//! ## Architecture
//!
//! - **Framer** ([`protocol::Framer`]): packet framing, checksum verification,
//!   magic-byte resynchronization after corruption
//! - **Dispatcher** ([`dispatch::Dispatcher`]): the eight protocol commands
//! - **Allocation tracker** ([`tracker::AllocationTracker`]): fixed-capacity
//!   bounds bookkeeping for WriteMem/ReadMem/Exec validation
//! - **Cache synchronizer** ([`cache::CacheSynchronizer`]): makes
//!   "write then execute" safe on split instruction/data cache targets
//! - **Engine** ([`engine::Engine`]): allocates the protocol buffers and
//!   drives Framer → Dispatcher → Framer on one dedicated worker
//!
//! The wire protocol carries no authentication and executes arbitrary machine
//! code by design. Expose the transport only to trusted hosts.
//!
//! ## Example
//!
//! ```ignore
//! use jitlink::{Engine, EngineConfig};
//!
//! let engine = Engine::new(transport, platform_memory, platform_cache,
//!                          &EngineConfig::default())?;
//! engine.run()?; // blocks forever servicing host commands
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod tracker;
pub mod transport;

pub use client::Client;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::Error;
pub use memory::DeviceAddr;
