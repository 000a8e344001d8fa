// Typed records exchanged between pipeline stages. Everything that crosses a
// module boundary (event -> pool -> state -> snapshot) has a concrete type
// here instead of a free-form map.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WhitelistError};

/// AMM protocol family. Dispatch tables (topic, decoder, state layout, batch
/// size, slippage formula) are keyed by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    V2,
    V3,
    V4,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::V2 => "v2",
            Protocol::V3 => "v3",
            Protocol::V4 => "v4",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "v2" => Ok(Protocol::V2),
            "v3" => Ok(Protocol::V3),
            "v4" => Ok(Protocol::V4),
            other => Err(WhitelistError::ConfigInvalid(format!(
                "unknown protocol '{other}' (expected v2, v3 or v4)"
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool identity. V2/V3 pools are addressed contracts; V4 pools live inside
/// the pool manager and are keyed by a 32-byte id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PoolId {
    Address(Address),
    Bytes32(H256),
}

impl PoolId {
    /// Lowercase `0x…` form used in the database and broker payloads.
    pub fn to_hex(&self) -> String {
        match self {
            PoolId::Address(a) => format!("{:#x}", a),
            PoolId::Bytes32(h) => format!("{:#x}", h),
        }
    }

    /// Parses the database/payload form back; 20-byte hex becomes an address,
    /// 32-byte hex a V4 pool id.
    pub fn from_hex(s: &str) -> Result<Self> {
        let stripped = s.trim().trim_start_matches("0x");
        match stripped.len() {
            40 => {
                let bytes = hex::decode(stripped)
                    .map_err(|e| WhitelistError::DecodeFailed(format!("bad pool id '{s}': {e}")))?;
                Ok(PoolId::Address(Address::from_slice(&bytes)))
            }
            64 => {
                let bytes = hex::decode(stripped)
                    .map_err(|e| WhitelistError::DecodeFailed(format!("bad pool id '{s}': {e}")))?;
                Ok(PoolId::Bytes32(H256::from_slice(&bytes)))
            }
            n => Err(WhitelistError::DecodeFailed(format!(
                "bad pool id '{s}': expected 20 or 32 bytes, got {n} hex chars"
            ))),
        }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A pool-creation event normalized across protocol variants.
///
/// Identity is `(chain, pool_id)`. Immutable after creation; token metadata
/// is enriched separately in the `tokens` table.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPool {
    pub pool_id: PoolId,
    pub protocol: Protocol,
    /// Variant tag, e.g. "uniswap_v2", "aerodrome_v2", "uniswap_v3".
    pub variant: String,
    /// Factory for V2/V3; the emitting pool manager for V4.
    pub factory: Address,
    pub token0: Address,
    pub token1: Address,
    pub fee: Option<u32>,
    pub tick_spacing: Option<i32>,
    pub stable: Option<bool>,
    pub hooks: Option<Address>,
    pub creation_block: u64,
    /// Set when the decoder swapped tokens to restore `token0 < token1`.
    pub was_swapped: bool,
}

/// ERC-20 metadata for a token referenced by at least one pool.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenMeta {
    pub address: Address,
    pub decimals: Option<u8>,
    pub symbol: Option<String>,
    pub name: Option<String>,
}

/// One initialized tick read in full-ticks mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickEntry {
    pub tick: i32,
    pub liquidity_gross: u128,
    pub liquidity_net: i128,
}

/// Protocol-specific on-chain state read for one pool.
#[derive(Debug, Clone, PartialEq)]
pub enum StateData {
    V2 {
        reserve0: U256,
        reserve1: U256,
    },
    Slot0 {
        sqrt_price_x96: U256,
        tick: i32,
        liquidity: u128,
    },
    FullTicks {
        sqrt_price_x96: U256,
        tick: i32,
        liquidity: u128,
        ticks: Vec<TickEntry>,
        bitmap_words: Vec<(i16, U256)>,
    },
}

impl StateData {
    pub fn slot0(&self) -> Option<(U256, i32, u128)> {
        match self {
            StateData::Slot0 {
                sqrt_price_x96,
                tick,
                liquidity,
            }
            | StateData::FullTicks {
                sqrt_price_x96,
                tick,
                liquidity,
                ..
            } => Some((*sqrt_price_x96, *tick, *liquidity)),
            StateData::V2 { .. } => None,
        }
    }
}

/// State of one pool anchored to the batch's reference block.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolState {
    pub pool_id: PoolId,
    pub protocol: Protocol,
    pub data: StateData,
    pub reference_block: u64,
    pub reference_timestamp: DateTime<Utc>,
}

/// Raw decoded log event as it comes out of an extractor batch file.
#[derive(Debug, Clone)]
pub struct RawLogEvent {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
    pub block_number: u64,
}

/// Per-batch scrape metrics, kept in memory for the cycle report and
/// optionally persisted for telemetry.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_number: usize,
    pub total_batches: usize,
    pub protocol: Protocol,
    pub reference_block: u64,
    pub reference_timestamp: DateTime<Utc>,
    pub pools_scraped: usize,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

/// How a pool earned its whitelist membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassType {
    /// Passed the slippage threshold with both token prices known.
    Slippage,
    /// Contains a trusted token; no slippage computed.
    Trusted,
    /// Passed on a later iteration because its tokens gained coverage from
    /// already-passing pools.
    NetworkEffect { depth: u32 },
}

/// Outcome of the liquidity filter for one pool.
#[derive(Debug, Clone)]
pub struct FilterVerdict {
    pub pool_id: PoolId,
    pub liquidity_usd: Option<f64>,
    pub slippage_percent: Option<f64>,
    pub passes: bool,
    pub pass_type: Option<PassType>,
}

/// Lossy conversion for USD/slippage math. Values beyond 2^53 lose precision,
/// which is acceptable for threshold comparisons.
pub fn u256_to_f64_lossy(value: U256) -> f64 {
    let limbs = value.0;
    let mut out = 0.0_f64;
    for (i, limb) in limbs.iter().enumerate() {
        out += (*limb as f64) * 2.0_f64.powi(64 * i as i32);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn pool_id_hex_round_trip() {
        let addr = Address::from_str("0x88e6A0c2dDD26FEEb64F039a2c41296FcB3f5640").unwrap();
        let id = PoolId::Address(addr);
        assert_eq!(id.to_hex(), "0x88e6a0c2ddd26feeb64f039a2c41296fcb3f5640");
        assert_eq!(PoolId::from_hex(&id.to_hex()).unwrap(), id);

        let v4 = PoolId::Bytes32(H256::from_low_u64_be(1));
        let hex = v4.to_hex();
        assert_eq!(hex.len(), 66);
        assert_eq!(PoolId::from_hex(&hex).unwrap(), v4);
    }

    #[test]
    fn pool_id_rejects_odd_lengths() {
        assert!(PoolId::from_hex("0x1234").is_err());
    }

    #[test]
    fn u256_to_f64_small_values_exact() {
        assert_eq!(u256_to_f64_lossy(U256::from(0u64)), 0.0);
        assert_eq!(u256_to_f64_lossy(U256::from(1_000_000u64)), 1_000_000.0);
        let v = U256::from(1u64) << 64;
        assert_eq!(u256_to_f64_lossy(v), 2.0_f64.powi(64));
    }

    #[test]
    fn protocol_parse() {
        assert_eq!(Protocol::parse("V3").unwrap(), Protocol::V3);
        assert!(Protocol::parse("v5").is_err());
    }
}
