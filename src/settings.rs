use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

use crate::types::Protocol;

/// One protocol family configured for a chain: which factories (or pool
/// manager) emit creation events, from which block, under which topic.
#[derive(Debug, Deserialize, Clone)]
pub struct ProtocolEntry {
    /// Variant tag, e.g. "uniswap_v2", "aerodrome_v2", "uniswap_v4".
    pub variant: String,
    /// Protocol family: "v2", "v3" or "v4".
    pub protocol: String,
    /// Factory addresses for V2/V3; the single pool manager address for V4.
    pub factories: Vec<String>,
    pub deployment_block: u64,
    /// Creation event topic0 hash, 0x-prefixed.
    pub topic: String,
    /// Fee recorded for V2-family pools that do not carry one on-chain
    /// (3000 = 0.30%, the Uniswap/Sushi default).
    #[serde(default = "default_v2_fee")]
    pub default_fee: u32,
    /// Whether the variant emits a stable flag in topic3 (Aerodrome-style
    /// PairCreated).
    #[serde(default = "default_false")]
    pub stable_flag: bool,
}

fn default_v2_fee() -> u32 {
    3000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainEntry {
    pub rpc_url: String,
    #[serde(default = "default_block_time_seconds")]
    pub block_time_seconds: f64,
    pub protocols: Vec<ProtocolEntry>,
}

fn default_block_time_seconds() -> f64 {
    12.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct Extractor {
    /// Extractor binary name or path.
    #[serde(default = "default_extractor_binary")]
    pub binary: String,
    #[serde(default = "default_inner_request_size")]
    pub inner_request_size: u64,
    #[serde(default = "default_extractor_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Root for batch files; each (chain, variant) gets its own subdirectory.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_extractor_binary() -> String {
    "cryo".to_string()
}
fn default_inner_request_size() -> u64 {
    10_000
}
fn default_extractor_timeout_seconds() -> u64 {
    600
}
fn default_data_dir() -> String {
    "data".to_string()
}

impl Default for Extractor {
    fn default() -> Self {
        Self {
            binary: default_extractor_binary(),
            inner_request_size: default_inner_request_size(),
            timeout_seconds: default_extractor_timeout_seconds(),
            data_dir: default_data_dir(),
        }
    }
}

/// Scrape depth: price/reserves only, or also the tick bitmap and a window
/// of tick data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeMode {
    Filtering,
    FullTicks,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Scraper {
    // Batch sizes are tuned so one batch fits inside
    // block_time * safety_margin.
    #[serde(default = "default_v2_batch_size")]
    pub v2_batch_size: usize,
    #[serde(default = "default_v3_slot0_batch_size")]
    pub v3_slot0_batch_size: usize,
    #[serde(default = "default_v4_slot0_batch_size")]
    pub v4_slot0_batch_size: usize,
    #[serde(default = "default_v3_full_ticks_batch_size")]
    pub v3_full_ticks_batch_size: usize,
    #[serde(default = "default_v4_full_ticks_batch_size")]
    pub v4_full_ticks_batch_size: usize,
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
    #[serde(default = "default_true")]
    pub wait_for_next_block: bool,
    #[serde(default = "default_per_batch_concurrency")]
    pub per_batch_concurrency: usize,
    #[serde(default = "default_state_read_timeout_seconds")]
    pub state_read_timeout_seconds: u64,
    #[serde(default = "default_state_read_retries")]
    pub state_read_retries: u32,
    /// Bitmap words read around the current tick in full-ticks mode.
    #[serde(default = "default_tick_word_window")]
    pub tick_word_window: i16,
}

fn default_v2_batch_size() -> usize {
    200
}
fn default_v3_slot0_batch_size() -> usize {
    150
}
fn default_v4_slot0_batch_size() -> usize {
    100
}
fn default_v3_full_ticks_batch_size() -> usize {
    30
}
fn default_v4_full_ticks_batch_size() -> usize {
    20
}
fn default_safety_margin() -> f64 {
    0.8
}
fn default_per_batch_concurrency() -> usize {
    16
}
fn default_state_read_timeout_seconds() -> u64 {
    5
}
fn default_state_read_retries() -> u32 {
    3
}
fn default_tick_word_window() -> i16 {
    1
}

impl Default for Scraper {
    fn default() -> Self {
        Self {
            v2_batch_size: default_v2_batch_size(),
            v3_slot0_batch_size: default_v3_slot0_batch_size(),
            v4_slot0_batch_size: default_v4_slot0_batch_size(),
            v3_full_ticks_batch_size: default_v3_full_ticks_batch_size(),
            v4_full_ticks_batch_size: default_v4_full_ticks_batch_size(),
            safety_margin: default_safety_margin(),
            wait_for_next_block: true,
            per_batch_concurrency: default_per_batch_concurrency(),
            state_read_timeout_seconds: default_state_read_timeout_seconds(),
            state_read_retries: default_state_read_retries(),
            tick_word_window: default_tick_word_window(),
        }
    }
}

impl Scraper {
    /// Batch size dispatch table per (protocol, mode).
    pub fn batch_size(&self, protocol: Protocol, mode: ScrapeMode) -> usize {
        match (protocol, mode) {
            (Protocol::V2, _) => self.v2_batch_size,
            (Protocol::V3, ScrapeMode::Filtering) => self.v3_slot0_batch_size,
            (Protocol::V4, ScrapeMode::Filtering) => self.v4_slot0_batch_size,
            (Protocol::V3, ScrapeMode::FullTicks) => self.v3_full_ticks_batch_size,
            (Protocol::V4, ScrapeMode::FullTicks) => self.v4_full_ticks_batch_size,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Filter {
    #[serde(default = "default_trade_size_usd")]
    pub trade_size_usd: f64,
    #[serde(default = "default_max_slippage_percent")]
    pub max_slippage_percent: f64,
    /// Tokens whose presence alone whitelists a pool (USDC, WETH, ...).
    #[serde(default)]
    pub trusted_tokens: Vec<String>,
    #[serde(default = "default_iteration_depth")]
    pub iteration_depth: u32,
    /// Optional HTTP endpoint returning `{ "0xtoken": usd_price, ... }`.
    #[serde(default)]
    pub price_endpoint: Option<String>,
    #[serde(default = "default_price_cache_ttl_seconds")]
    pub price_cache_ttl_seconds: u64,
    /// Static USD prices merged under the fetched map (stables, wrapped
    /// native).
    #[serde(default)]
    pub static_prices: HashMap<String, f64>,
}

fn default_trade_size_usd() -> f64 {
    1000.0
}
fn default_max_slippage_percent() -> f64 {
    5.0
}
fn default_iteration_depth() -> u32 {
    1
}
fn default_price_cache_ttl_seconds() -> u64 {
    300
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            trade_size_usd: default_trade_size_usd(),
            max_slippage_percent: default_max_slippage_percent(),
            trusted_tokens: Vec::new(),
            iteration_depth: default_iteration_depth(),
            price_endpoint: None,
            price_cache_ttl_seconds: default_price_cache_ttl_seconds(),
            static_prices: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Publisher {
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub publish_minimal: bool,
    #[serde(default = "default_true")]
    pub publish_full: bool,
}

fn default_broker_url() -> String {
    "nats://localhost:4222".to_string()
}

impl Default for Publisher {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            enabled: true,
            publish_minimal: true,
            publish_full: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Telemetry {
    #[serde(default = "default_false")]
    pub persist_batch_reports: bool,
    /// 0 disables the retention delete.
    #[serde(default = "default_batch_report_retention_days")]
    pub batch_report_retention_days: u32,
}

fn default_batch_report_retention_days() -> u32 {
    30
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            persist_batch_reports: false,
            batch_report_retention_days: default_batch_report_retention_days(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Refresh {
    #[serde(default = "default_cycle_deadline_seconds")]
    pub cycle_deadline_seconds: u64,
    /// Interval between cycles when running as a service.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

fn default_cycle_deadline_seconds() -> u64 {
    900
}
fn default_interval_seconds() -> u64 {
    3600
}

impl Default for Refresh {
    fn default() -> Self {
        Self {
            cycle_deadline_seconds: default_cycle_deadline_seconds(),
            interval_seconds: default_interval_seconds(),
        }
    }
}

fn default_false() -> bool {
    false
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub chains: HashMap<String, ChainEntry>,
    #[serde(default)]
    pub extractor: Extractor,
    #[serde(default)]
    pub scraper: Scraper,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub publisher: Publisher,
    #[serde(default)]
    pub telemetry: Telemetry,
    #[serde(default)]
    pub refresh: Refresh,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("Config.toml"))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Environment overrides. RPC URLs are the usual per-deployment knob:
        // WHITELIST_RPC_URL_ETHEREUM, WHITELIST_RPC_URL_BASE, ...
        for (name, chain) in settings.chains.iter_mut() {
            let key = format!("WHITELIST_RPC_URL_{}", name.to_uppercase());
            if let Ok(url) = env::var(&key) {
                if !url.trim().is_empty() {
                    chain.rpc_url = url;
                }
            }
        }

        if let Ok(url) = env::var("WHITELIST_NATS_URL") {
            if !url.trim().is_empty() {
                settings.publisher.broker_url = url;
            }
        }

        if let Ok(binary) = env::var("WHITELIST_EXTRACTOR_BIN") {
            if !binary.trim().is_empty() {
                settings.extractor.binary = binary;
            }
        }

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_dispatch() {
        let scraper = Scraper::default();
        assert_eq!(scraper.batch_size(Protocol::V2, ScrapeMode::Filtering), 200);
        assert_eq!(scraper.batch_size(Protocol::V2, ScrapeMode::FullTicks), 200);
        assert_eq!(scraper.batch_size(Protocol::V3, ScrapeMode::Filtering), 150);
        assert_eq!(scraper.batch_size(Protocol::V4, ScrapeMode::Filtering), 100);
        assert_eq!(scraper.batch_size(Protocol::V3, ScrapeMode::FullTicks), 30);
        assert_eq!(scraper.batch_size(Protocol::V4, ScrapeMode::FullTicks), 20);
    }

    #[test]
    fn defaults_match_block_budget() {
        let scraper = Scraper::default();
        // 12s block time at 0.8 margin leaves a 9.6s budget per batch.
        assert!((default_block_time_seconds() * scraper.safety_margin - 9.6).abs() < 1e-9);
        assert!(scraper.wait_for_next_block);
    }
}
