// State reader: per-pool raw storage reads at a pinned block. The trait
// mirrors the embedded-database reader used in production so an RPC-backed
// shim and the real reader are interchangeable.
//
// Storage layouts:
//   V2   reserves packed in slot 8: reserve0 u112 | reserve1 u112 | ts u32
//   V3   slot0 at slot 0 (sqrtPriceX96 u160 | tick i24 | ...),
//        liquidity at slot 4,
//        ticks[tick] at keccak(abi.encode(tick, 5)),
//        tickBitmap[word] at keccak(abi.encode(word, 6))
//   V4   pools[poolId] base at keccak(abi.encode(poolId, 6));
//        slot0 = base+0, liquidity = base+3,
//        ticks root = base+4, bitmap root = base+5

use std::time::Duration;

use async_trait::async_trait;
use ethers::abi::{encode, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;
use futures::stream::{self, StreamExt};
use log::warn;

use crate::error::{Result, WhitelistError};
use crate::metrics;
use crate::rpc::RpcClient;
use crate::settings::{ScrapeMode, Scraper};
use crate::types::TickEntry;

const V2_RESERVES_SLOT: u64 = 8;
const V3_SLOT0_SLOT: u64 = 0;
const V3_LIQUIDITY_SLOT: u64 = 4;
const V3_TICKS_MAPPING_SLOT: u64 = 5;
const V3_BITMAP_MAPPING_SLOT: u64 = 6;
const V4_POOLS_MAPPING_SLOT: u64 = 6;
const V4_LIQUIDITY_OFFSET: u64 = 3;
const V4_TICKS_OFFSET: u64 = 4;
const V4_BITMAP_OFFSET: u64 = 5;

/// Price-slot state for a V3/V4 pool; `ticks`/`bitmap_words` are populated
/// only in full-ticks mode.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Slot0State {
    pub sqrt_price_x96: U256,
    pub tick: i32,
    pub liquidity: u128,
    pub ticks: Vec<TickEntry>,
    pub bitmap_words: Vec<(i16, U256)>,
}

#[derive(Debug, Clone)]
pub struct V3PoolConfig {
    pub address: Address,
    pub tick_spacing: i32,
}

#[derive(Debug, Clone)]
pub struct V4PoolConfig {
    pub pool_id: H256,
    pub manager: Address,
    pub tick_spacing: i32,
}

#[async_trait]
pub trait StateReader: Send + Sync {
    async fn load_v2(&self, pool: Address, block: u64) -> Result<(U256, U256)>;

    /// Per-pool results are returned in input order; individual failures do
    /// not fail the batch.
    async fn batch_load_v3(
        &self,
        configs: &[V3PoolConfig],
        block: u64,
        mode: ScrapeMode,
    ) -> Vec<(Address, Result<Slot0State>)>;

    async fn batch_load_v4(
        &self,
        configs: &[V4PoolConfig],
        block: u64,
        mode: ScrapeMode,
    ) -> Vec<(H256, Result<Slot0State>)>;
}

// ---- slot derivation ------------------------------------------------------

/// 256-bit two's complement of a signed value, as abi.encode produces for
/// int24/int16 arguments.
fn int_word(value: i64) -> U256 {
    if value >= 0 {
        U256::from(value as u64)
    } else {
        U256::MAX - U256::from((-(value + 1)) as u64)
    }
}

fn slot(n: u64) -> H256 {
    H256::from_low_u64_be(n)
}

fn add_offset(base: H256, offset: u64) -> H256 {
    let value = U256::from_big_endian(base.as_bytes()).overflowing_add(U256::from(offset)).0;
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    H256::from(out)
}

fn mapping_slot(key: Token, mapping: U256) -> H256 {
    H256::from(keccak256(encode(&[key, Token::Uint(mapping)])))
}

pub fn v3_tick_slot(tick: i32) -> H256 {
    mapping_slot(
        Token::Int(int_word(tick as i64)),
        U256::from(V3_TICKS_MAPPING_SLOT),
    )
}

pub fn v3_bitmap_slot(word: i16) -> H256 {
    mapping_slot(
        Token::Int(int_word(word as i64)),
        U256::from(V3_BITMAP_MAPPING_SLOT),
    )
}

pub fn v4_base_slot(pool_id: H256) -> H256 {
    mapping_slot(
        Token::FixedBytes(pool_id.as_bytes().to_vec()),
        U256::from(V4_POOLS_MAPPING_SLOT),
    )
}

pub fn v4_liquidity_slot(pool_id: H256) -> H256 {
    add_offset(v4_base_slot(pool_id), V4_LIQUIDITY_OFFSET)
}

pub fn v4_tick_slot(pool_id: H256, tick: i32) -> H256 {
    let root = add_offset(v4_base_slot(pool_id), V4_TICKS_OFFSET);
    mapping_slot(
        Token::Int(int_word(tick as i64)),
        U256::from_big_endian(root.as_bytes()),
    )
}

pub fn v4_bitmap_slot(pool_id: H256, word: i16) -> H256 {
    let root = add_offset(v4_base_slot(pool_id), V4_BITMAP_OFFSET);
    mapping_slot(
        Token::Int(int_word(word as i64)),
        U256::from_big_endian(root.as_bytes()),
    )
}

// ---- word decoding --------------------------------------------------------

pub fn decode_v2_reserves(word: H256) -> (U256, U256) {
    let value = U256::from_big_endian(word.as_bytes());
    let mask112 = (U256::one() << 112) - 1;
    (value & mask112, (value >> 112) & mask112)
}

pub fn decode_slot0(word: H256) -> (U256, i32) {
    let value = U256::from_big_endian(word.as_bytes());
    let mask160 = (U256::one() << 160) - 1;
    let sqrt_price_x96 = value & mask160;
    let tick_raw = ((value >> 160) & U256::from(0x00ff_ffffu64)).as_u32();
    let tick = if tick_raw & 0x0080_0000 != 0 {
        (tick_raw | 0xff00_0000) as i32
    } else {
        tick_raw as i32
    };
    (sqrt_price_x96, tick)
}

pub fn decode_liquidity(word: H256) -> u128 {
    let value = U256::from_big_endian(word.as_bytes());
    (value & ((U256::one() << 128) - 1)).as_u128()
}

pub fn decode_tick_word(tick: i32, word: H256) -> TickEntry {
    let value = U256::from_big_endian(word.as_bytes());
    let liquidity_gross = (value & ((U256::one() << 128) - 1)).as_u128();
    let liquidity_net = (value >> 128).as_u128() as i128;
    TickEntry {
        tick,
        liquidity_gross,
        liquidity_net,
    }
}

/// Bitmap word position of a tick (after tick-spacing compression).
pub fn bitmap_word_of(tick: i32, tick_spacing: i32) -> i16 {
    let compressed = tick.div_euclid(tick_spacing);
    compressed.div_euclid(256) as i16
}

/// Initialized ticks encoded in one bitmap word.
pub fn ticks_in_word(word_pos: i16, word: U256, tick_spacing: i32) -> Vec<i32> {
    let mut ticks = Vec::new();
    if word.is_zero() {
        return ticks;
    }
    for bit in 0..256u32 {
        if word.bit(bit as usize) {
            let compressed = (word_pos as i32) * 256 + bit as i32;
            ticks.push(compressed * tick_spacing);
        }
    }
    ticks
}

// ---- RPC-backed shim ------------------------------------------------------

/// `StateReader` over direct `eth_getStorageAt` calls, for deployments
/// without a colocated node database.
pub struct RpcStateReader {
    rpc: RpcClient,
    concurrency: usize,
    read_timeout: Duration,
    tick_word_window: i16,
}

impl RpcStateReader {
    pub fn new(rpc: RpcClient, scraper: &Scraper) -> Self {
        Self {
            rpc,
            concurrency: scraper.per_batch_concurrency.max(1),
            read_timeout: Duration::from_secs(scraper.state_read_timeout_seconds),
            tick_word_window: scraper.tick_word_window,
        }
    }

    async fn read_word(&self, account: Address, slot: H256, block: u64, pool: &str) -> Result<H256> {
        let read = self.rpc.get_storage_at(account, slot, Some(block));
        match tokio::time::timeout(self.read_timeout, read).await {
            Ok(Ok(word)) => Ok(word),
            Ok(Err(e)) => Err(WhitelistError::StateReadFailed {
                pool: pool.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(WhitelistError::StateReadFailed {
                pool: pool.to_string(),
                reason: format!("storage read timed out after {:?}", self.read_timeout),
            }),
        }
    }

    async fn load_v3_pool(
        &self,
        config: &V3PoolConfig,
        block: u64,
        mode: ScrapeMode,
    ) -> Result<Slot0State> {
        let pool = format!("{:#x}", config.address);
        let slot0_word = self
            .read_word(config.address, slot(V3_SLOT0_SLOT), block, &pool)
            .await?;
        let (sqrt_price_x96, tick) = decode_slot0(slot0_word);
        let liquidity_word = self
            .read_word(config.address, slot(V3_LIQUIDITY_SLOT), block, &pool)
            .await?;
        let liquidity = decode_liquidity(liquidity_word);

        let mut state = Slot0State {
            sqrt_price_x96,
            tick,
            liquidity,
            ticks: Vec::new(),
            bitmap_words: Vec::new(),
        };

        if mode == ScrapeMode::FullTicks && config.tick_spacing > 0 {
            let center = bitmap_word_of(tick, config.tick_spacing);
            for word_pos in
                (center - self.tick_word_window)..=(center + self.tick_word_window)
            {
                let word_value = self
                    .read_word(config.address, v3_bitmap_slot(word_pos), block, &pool)
                    .await?;
                let word_u256 = U256::from_big_endian(word_value.as_bytes());
                state.bitmap_words.push((word_pos, word_u256));
                for tick in ticks_in_word(word_pos, word_u256, config.tick_spacing) {
                    let tick_word = self
                        .read_word(config.address, v3_tick_slot(tick), block, &pool)
                        .await?;
                    state.ticks.push(decode_tick_word(tick, tick_word));
                }
            }
        }
        Ok(state)
    }

    async fn load_v4_pool(
        &self,
        config: &V4PoolConfig,
        block: u64,
        mode: ScrapeMode,
    ) -> Result<Slot0State> {
        let pool = format!("{:#x}", config.pool_id);
        let base = v4_base_slot(config.pool_id);
        let slot0_word = self.read_word(config.manager, base, block, &pool).await?;
        let (sqrt_price_x96, tick) = decode_slot0(slot0_word);
        let liquidity_word = self
            .read_word(config.manager, v4_liquidity_slot(config.pool_id), block, &pool)
            .await?;
        let liquidity = decode_liquidity(liquidity_word);

        let mut state = Slot0State {
            sqrt_price_x96,
            tick,
            liquidity,
            ticks: Vec::new(),
            bitmap_words: Vec::new(),
        };

        if mode == ScrapeMode::FullTicks && config.tick_spacing > 0 {
            let center = bitmap_word_of(tick, config.tick_spacing);
            for word_pos in
                (center - self.tick_word_window)..=(center + self.tick_word_window)
            {
                let word_value = self
                    .read_word(
                        config.manager,
                        v4_bitmap_slot(config.pool_id, word_pos),
                        block,
                        &pool,
                    )
                    .await?;
                let word_u256 = U256::from_big_endian(word_value.as_bytes());
                state.bitmap_words.push((word_pos, word_u256));
                for tick in ticks_in_word(word_pos, word_u256, config.tick_spacing) {
                    let tick_word = self
                        .read_word(
                            config.manager,
                            v4_tick_slot(config.pool_id, tick),
                            block,
                            &pool,
                        )
                        .await?;
                    state.ticks.push(decode_tick_word(tick, tick_word));
                }
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl StateReader for RpcStateReader {
    async fn load_v2(&self, pool: Address, block: u64) -> Result<(U256, U256)> {
        let label = format!("{:#x}", pool);
        let word = self
            .read_word(pool, slot(V2_RESERVES_SLOT), block, &label)
            .await?;
        Ok(decode_v2_reserves(word))
    }

    async fn batch_load_v3(
        &self,
        configs: &[V3PoolConfig],
        block: u64,
        mode: ScrapeMode,
    ) -> Vec<(Address, Result<Slot0State>)> {
        stream::iter(configs.iter().cloned())
            .map(|config| async move {
                let result = self.load_v3_pool(&config, block, mode).await;
                if let Err(e) = &result {
                    metrics::increment_state_read_failed("v3");
                    warn!("[StateReader] {}", e);
                }
                (config.address, result)
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }

    async fn batch_load_v4(
        &self,
        configs: &[V4PoolConfig],
        block: u64,
        mode: ScrapeMode,
    ) -> Vec<(H256, Result<Slot0State>)> {
        stream::iter(configs.iter().cloned())
            .map(|config| async move {
                let result = self.load_v4_pool(&config, block, mode).await;
                if let Err(e) = &result {
                    metrics::increment_state_read_failed("v4");
                    warn!("[StateReader] {}", e);
                }
                (config.pool_id, result)
            })
            .buffered(self.concurrency)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_word_is_twos_complement() {
        assert_eq!(int_word(0), U256::zero());
        assert_eq!(int_word(60), U256::from(60u64));
        assert_eq!(int_word(-1), U256::MAX);
        assert_eq!(int_word(-60), U256::MAX - U256::from(59u64));
    }

    #[test]
    fn v2_reserves_unpack() {
        // reserve0 = 7, reserve1 = 9, timestamp bits set high
        let value = U256::from(7u64) | (U256::from(9u64) << 112) | (U256::from(0xffu64) << 224);
        let mut bytes = [0u8; 32];
        value.to_big_endian(&mut bytes);
        let (r0, r1) = decode_v2_reserves(H256::from(bytes));
        assert_eq!(r0, U256::from(7u64));
        assert_eq!(r1, U256::from(9u64));
    }

    #[test]
    fn slot0_unpacks_negative_tick() {
        let sqrt_price = U256::from(2u128.pow(96));
        let tick = -887_220i32;
        let tick_bits = U256::from((tick as u32) & 0x00ff_ffff);
        let value = sqrt_price | (tick_bits << 160);
        let mut bytes = [0u8; 32];
        value.to_big_endian(&mut bytes);
        let (price, decoded_tick) = decode_slot0(H256::from(bytes));
        assert_eq!(price, sqrt_price);
        assert_eq!(decoded_tick, tick);
    }

    #[test]
    fn slot0_unpacks_positive_tick_with_fee_bits() {
        let sqrt_price = U256::from(1u64) << 100;
        let tick = 193_000i32;
        // V4 packs protocol/lp fees above the tick; they must not leak in.
        let value = sqrt_price
            | (U256::from(tick as u32) << 160)
            | (U256::from(0xbeefu64) << 184);
        let mut bytes = [0u8; 32];
        value.to_big_endian(&mut bytes);
        let (price, decoded_tick) = decode_slot0(H256::from(bytes));
        assert_eq!(price, sqrt_price);
        assert_eq!(decoded_tick, tick);
    }

    #[test]
    fn tick_word_splits_gross_and_net() {
        let gross = 123_456_789u128;
        let net = -42i128;
        let value = U256::from(gross) | (U256::from(net as u128) << 128);
        let mut bytes = [0u8; 32];
        value.to_big_endian(&mut bytes);
        let entry = decode_tick_word(60, H256::from(bytes));
        assert_eq!(entry.tick, 60);
        assert_eq!(entry.liquidity_gross, gross);
        assert_eq!(entry.liquidity_net, net);
    }

    #[test]
    fn tick_slot_matches_independent_encoding() {
        // keccak over the hand-assembled 64-byte preimage must agree with
        // the Token-based encoding.
        let tick = -60i32;
        let mut preimage = [0u8; 64];
        let mut word = [0u8; 32];
        int_word(tick as i64).to_big_endian(&mut word);
        preimage[..32].copy_from_slice(&word);
        preimage[63] = V3_TICKS_MAPPING_SLOT as u8;
        assert_eq!(v3_tick_slot(tick), H256::from(keccak256(preimage)));
    }

    #[test]
    fn v4_slots_are_distinct_per_member() {
        let pool_id = H256::from_low_u64_be(1);
        let base = v4_base_slot(pool_id);
        let liquidity = v4_liquidity_slot(pool_id);
        let tick = v4_tick_slot(pool_id, 0);
        let bitmap = v4_bitmap_slot(pool_id, 0);
        assert_ne!(base, liquidity);
        assert_ne!(tick, bitmap);
        assert_ne!(base, tick);
        assert_eq!(
            U256::from_big_endian(liquidity.as_bytes()),
            U256::from_big_endian(base.as_bytes()) + U256::from(V4_LIQUIDITY_OFFSET)
        );
    }

    #[test]
    fn bitmap_word_math() {
        assert_eq!(bitmap_word_of(0, 60), 0);
        assert_eq!(bitmap_word_of(60 * 256, 60), 1);
        assert_eq!(bitmap_word_of(-60, 60), -1);

        let word = U256::one() | (U256::one() << 5);
        let ticks = ticks_in_word(0, word, 60);
        assert_eq!(ticks, vec![0, 300]);

        let ticks_neg = ticks_in_word(-1, U256::one() << 255, 10);
        assert_eq!(ticks_neg, vec![-10]);
    }
}
