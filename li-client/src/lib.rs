//! # Libinfo Lookup Client
//!
//! Purpose: Run directory-service lookups over a pluggable message transport,
//! either as blocking queries or as tracked asynchronous requests.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `LookupClient` and `AsyncEngine` hide endpoint
//!    resolution, procedure linking, retries, and reply normalization.
//! 2. **Strategy Pattern**: Every transport detail sits behind `Transport`.
//! 3. **Shared Budget**: Both engines stop after `max_attempts` deaths.
//! 4. **Fail Closed**: Untrusted or malformed replies never reach extractors.

mod async_engine;
mod client;
mod config;
mod endpoint;
pub mod loopback;
mod pipeline;
mod procedure;
mod stats;
mod transport;

pub use async_engine::{AsyncEngine, Callback, LookupResult, ReplyOutcome};
pub use client::LookupClient;
pub use config::{ConfigError, LookupConfig};
pub use endpoint::Endpoint;
pub use loopback::{LoopbackTransport, ReplyMode};
pub use pipeline::RecordExtractor;
pub use procedure::ProcedureCache;
pub use stats::{EngineStats, StatsSnapshot};
pub use transport::{SendMode, Transport};
