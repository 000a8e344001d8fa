//! # dex-whitelist
//!
//! Dynamic whitelist of DEX liquidity pools on EVM chains. A refresh cycle
//! discovers newly-created pools from factory events, scrapes per-pool
//! on-chain state in block-anchored batches, applies a liquidity/slippage
//! filter, and broadcasts the resulting set to downstream consumers in two
//! forms: minimal (pool ids) for event-filtering infrastructure and full
//! (pools plus token metadata) for price-reconstruction services.
//!
//! ## Pipeline
//!
//! ```text
//! extractor -> batch files -> decoder -> pool registry (+checkpoint)
//!                                             |
//!                 batch scraper (reference-block anchored)
//!                                             |
//!                 liquidity filter (slippage / trusted / network effect)
//!                                             |
//!                 snapshot differ -> postgres history -> broker
//! ```
//!
//! Crash safety rests on two rules: the checkpoint only advances in the same
//! transaction that records the ingested events, and on resume the newest
//! batch file is deleted before the extractor re-runs.

// Core types
/// Pipeline error kinds
pub mod error;
/// Typed records at stage boundaries
pub mod types;

// Configuration
/// Protocol catalog (topics, factories, deployment blocks)
pub mod protocols;
/// Config.toml + environment settings
pub mod settings;

// Ingestion
/// Per-protocol creation-event decoders
pub mod event_decoder;
/// External extractor driver with checkpoint resumption
pub mod log_ingestor;
/// Parquet batch file reader
pub mod log_reader;

// Storage
/// Monotone per-(chain, protocol) checkpoints
pub mod checkpoints;
/// PostgreSQL connection and schema
pub mod database;
/// Durable pool registry with transactional checkpoint advance
pub mod pool_registry;
/// Snapshot diffing and append-only history
pub mod snapshot_store;

// Scraping
/// Block-synchronized batch scraper
pub mod batch_scraper;
/// RPC surface (block numbers, storage reads)
pub mod rpc;
/// Protocol-aware storage-slot reader
pub mod state_reader;

// Filtering
/// Slippage-based whitelist filter
pub mod liquidity_filter;
/// Token USD price oracle
pub mod price_feeds;
/// ERC-20 metadata enrichment
pub mod token_metadata;

// Publishing & orchestration
/// Counter/gauge helpers
pub mod metrics;
/// Broker publisher (minimal / full / reference-block subjects)
pub mod publisher;
/// Per-chain refresh cycles
pub mod refresh;

// Re-exports for convenience
pub use error::WhitelistError;
pub use refresh::RefreshOrchestrator;
pub use settings::Settings;
pub use types::{DiscoveredPool, PoolId, Protocol};
