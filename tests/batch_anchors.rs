// Batch scraper behavior against mock chain/state/broker: block anchors are
// strictly increasing with the block gate on, every batch emits a
// reference-block message, and per-pool read failures never abort a batch.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};

use dex_whitelist::batch_scraper::BatchScraper;
use dex_whitelist::error::{Result, WhitelistError};
use dex_whitelist::publisher::{FullPoolPayload, ReferenceBlockMeta, SnapshotPublisher};
use dex_whitelist::rpc::BlockSource;
use dex_whitelist::settings::{ScrapeMode, Scraper};
use dex_whitelist::state_reader::{Slot0State, StateReader, V3PoolConfig, V4PoolConfig};
use dex_whitelist::types::{DiscoveredPool, PoolId, Protocol};

struct MockChain {
    block: AtomicU64,
}

impl MockChain {
    fn new(start: u64) -> Self {
        Self {
            block: AtomicU64::new(start),
        }
    }
}

#[async_trait]
impl BlockSource for MockChain {
    async fn block_number(&self) -> Result<u64> {
        // The chain advances one block per observation, so the gate never
        // spins.
        Ok(self.block.fetch_add(1, Ordering::SeqCst))
    }

    async fn finalized_block_number(&self) -> Result<u64> {
        Ok(self.block.load(Ordering::SeqCst).saturating_sub(64))
    }
}

#[derive(Default)]
struct MockStateReader {
    failing: HashSet<Address>,
}

#[async_trait]
impl StateReader for MockStateReader {
    async fn load_v2(&self, pool: Address, _block: u64) -> Result<(U256, U256)> {
        if self.failing.contains(&pool) {
            return Err(WhitelistError::StateReadFailed {
                pool: format!("{pool:#x}"),
                reason: "missing account".to_string(),
            });
        }
        Ok((U256::exp10(24), U256::exp10(24)))
    }

    async fn batch_load_v3(
        &self,
        configs: &[V3PoolConfig],
        _block: u64,
        _mode: ScrapeMode,
    ) -> Vec<(Address, Result<Slot0State>)> {
        configs
            .iter()
            .map(|c| {
                (
                    c.address,
                    Ok(Slot0State {
                        sqrt_price_x96: U256::from(2u128.pow(96)),
                        tick: 0,
                        liquidity: 1u128 << 90,
                        ticks: Vec::new(),
                        bitmap_words: Vec::new(),
                    }),
                )
            })
            .collect()
    }

    async fn batch_load_v4(
        &self,
        configs: &[V4PoolConfig],
        _block: u64,
        _mode: ScrapeMode,
    ) -> Vec<(H256, Result<Slot0State>)> {
        configs
            .iter()
            .map(|c| {
                (
                    c.pool_id,
                    Ok(Slot0State {
                        sqrt_price_x96: U256::from(2u128.pow(96)),
                        tick: 0,
                        liquidity: 1u128 << 90,
                        ticks: Vec::new(),
                        bitmap_words: Vec::new(),
                    }),
                )
            })
            .collect()
    }
}

#[derive(Default)]
struct RecordingPublisher {
    reference_blocks: Mutex<Vec<(u64, ReferenceBlockMeta)>>,
    minimal: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl SnapshotPublisher for RecordingPublisher {
    async fn publish_minimal(
        &self,
        _chain: &str,
        _reference_block: u64,
        _timestamp: &str,
        pool_ids: &[String],
    ) -> Result<()> {
        self.minimal.lock().unwrap().push(pool_ids.to_vec());
        Ok(())
    }

    async fn publish_full(
        &self,
        _chain: &str,
        _reference_block: u64,
        _timestamp: &str,
        _pools: &[FullPoolPayload],
    ) -> Result<()> {
        Ok(())
    }

    async fn publish_reference_block(
        &self,
        _chain: &str,
        reference_block: u64,
        _timestamp: &str,
        meta: &ReferenceBlockMeta,
    ) -> Result<()> {
        self.reference_blocks
            .lock()
            .unwrap()
            .push((reference_block, meta.clone()));
        Ok(())
    }
}

fn v2_pool(n: u64) -> DiscoveredPool {
    DiscoveredPool {
        pool_id: PoolId::Address(Address::from_low_u64_be(n + 1)),
        protocol: Protocol::V2,
        variant: "uniswap_v2".to_string(),
        factory: Address::from_low_u64_be(0xfac),
        token0: Address::from_low_u64_be(1),
        token1: Address::from_low_u64_be(2),
        fee: Some(3000),
        tick_spacing: None,
        stable: None,
        hooks: None,
        creation_block: n,
        was_swapped: false,
    }
}

#[tokio::test]
async fn reference_blocks_strictly_increase_across_batches() {
    // 1000 V2 pools at batch size 200 = exactly 5 batches.
    let pools: Vec<_> = (0..1000).map(v2_pool).collect();
    let chain = MockChain::new(19_000_000);
    let reader = MockStateReader::default();
    let publisher = RecordingPublisher::default();
    let config = Scraper {
        wait_for_next_block: true,
        ..Scraper::default()
    };

    let scraper = BatchScraper::new("ethereum", &chain, &reader, &publisher, &config);
    let outcome = scraper
        .scrape_all(&pools, ScrapeMode::Filtering)
        .await
        .unwrap();

    assert_eq!(outcome.reports.len(), 5);
    assert_eq!(outcome.states.len(), 1000);
    assert!(outcome.failures.is_empty());

    let anchors: Vec<u64> = outcome.reports.iter().map(|r| r.reference_block).collect();
    for pair in anchors.windows(2) {
        assert!(
            pair[1] > pair[0],
            "batch anchors must strictly increase: {anchors:?}"
        );
    }

    // One reference-block message per batch, in batch order.
    let published = publisher.reference_blocks.lock().unwrap();
    assert_eq!(published.len(), 5);
    for (i, (block, meta)) in published.iter().enumerate() {
        assert_eq!(meta.batch_number, i + 1);
        assert_eq!(meta.total_batches, 5);
        assert_eq!(meta.protocol, "v2");
        assert_eq!(meta.pools_in_batch, 200);
        assert_eq!(*block, anchors[i]);
    }

    // Every state carries its batch anchor.
    for state in &outcome.states {
        assert!(anchors.contains(&state.reference_block));
    }

    // The scraper only emits reference-block messages, never pool lists.
    assert!(publisher.minimal.lock().unwrap().is_empty());
}

#[tokio::test]
async fn per_pool_failures_do_not_abort_the_batch() {
    let pools: Vec<_> = (0..10).map(v2_pool).collect();
    let mut reader = MockStateReader::default();
    reader.failing.insert(Address::from_low_u64_be(3));
    reader.failing.insert(Address::from_low_u64_be(7));

    let chain = MockChain::new(100);
    let publisher = RecordingPublisher::default();
    let config = Scraper::default();

    let scraper = BatchScraper::new("ethereum", &chain, &reader, &publisher, &config);
    let outcome = scraper
        .scrape_all(&pools, ScrapeMode::Filtering)
        .await
        .unwrap();

    assert_eq!(outcome.states.len(), 8);
    assert_eq!(outcome.failures.len(), 2);
    assert_eq!(outcome.reports.len(), 1);
    assert!(outcome.reports[0].success);
    // The reference-block message still goes out for the partial batch.
    assert_eq!(publisher.reference_blocks.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn mixed_protocols_scrape_in_v2_v3_v4_order() {
    let mut pools = Vec::new();
    for n in 0..3 {
        pools.push(DiscoveredPool {
            pool_id: PoolId::Bytes32(H256::from_low_u64_be(n + 1)),
            protocol: Protocol::V4,
            variant: "uniswap_v4".to_string(),
            tick_spacing: Some(60),
            ..v2_pool(n)
        });
        pools.push(DiscoveredPool {
            pool_id: PoolId::Address(Address::from_low_u64_be(100 + n)),
            protocol: Protocol::V3,
            variant: "uniswap_v3".to_string(),
            tick_spacing: Some(60),
            ..v2_pool(n)
        });
        pools.push(v2_pool(200 + n));
    }

    let chain = MockChain::new(500);
    let reader = MockStateReader::default();
    let publisher = RecordingPublisher::default();
    let config = Scraper::default();

    let scraper = BatchScraper::new("ethereum", &chain, &reader, &publisher, &config);
    let outcome = scraper
        .scrape_all(&pools, ScrapeMode::Filtering)
        .await
        .unwrap();

    let order: Vec<Protocol> = outcome.reports.iter().map(|r| r.protocol).collect();
    assert_eq!(order, vec![Protocol::V2, Protocol::V3, Protocol::V4]);
    assert_eq!(outcome.states.len(), 9);
}
