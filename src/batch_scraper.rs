// Block-synchronized batch scraper. Pools are partitioned by protocol (V2,
// then V3, then V4), chunked into protocol-sized batches, and each batch is
// anchored to a single reference block sampled at batch start. With the
// block gate enabled, at most one batch is read per chain block.

use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use log::{info, warn};

use crate::error::Result;
use crate::metrics;
use crate::publisher::{ReferenceBlockMeta, SnapshotPublisher};
use crate::rpc::BlockSource;
use crate::settings::{ScrapeMode, Scraper};
use crate::state_reader::{StateReader, V3PoolConfig, V4PoolConfig};
use crate::types::{BatchReport, DiscoveredPool, PoolId, PoolState, Protocol, StateData};

const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything one scrape produced: anchored states, per-batch reports, and
/// the pools that failed to read (absent from the new whitelist).
#[derive(Debug, Default)]
pub struct ScrapeOutcome {
    pub states: Vec<PoolState>,
    pub reports: Vec<BatchReport>,
    pub failures: Vec<(PoolId, String)>,
}

impl ScrapeOutcome {
    /// The most recent batch anchor; the snapshot publisher uses it as the
    /// snapshot's reference block.
    pub fn last_reference_block(&self) -> Option<u64> {
        self.reports.iter().map(|r| r.reference_block).max()
    }
}

/// Partitions pools by protocol and chunks them into batches. Batch order is
/// V2 first, then V3, then V4; within a protocol, input order is preserved.
pub fn create_batches(
    pools: &[DiscoveredPool],
    config: &Scraper,
    mode: ScrapeMode,
) -> Vec<(Protocol, Vec<DiscoveredPool>)> {
    let mut by_protocol: [Vec<DiscoveredPool>; 3] = Default::default();
    for pool in pools {
        let idx = match pool.protocol {
            Protocol::V2 => 0,
            Protocol::V3 => 1,
            Protocol::V4 => 2,
        };
        by_protocol[idx].push(pool.clone());
    }

    let mut batches = Vec::new();
    for (idx, protocol) in [Protocol::V2, Protocol::V3, Protocol::V4].iter().enumerate() {
        let group = &by_protocol[idx];
        if group.is_empty() {
            continue;
        }
        let size = config.batch_size(*protocol, mode).max(1);
        for chunk in group.chunks(size) {
            batches.push((*protocol, chunk.to_vec()));
        }
    }

    info!(
        "[Scraper] Created {} batches: {} V2, {} V3, {} V4 pools",
        batches.len(),
        by_protocol[0].len(),
        by_protocol[1].len(),
        by_protocol[2].len()
    );
    batches
}

pub struct BatchScraper<'a> {
    chain: &'a str,
    block_source: &'a dyn BlockSource,
    state_reader: &'a dyn StateReader,
    publisher: &'a dyn SnapshotPublisher,
    config: &'a Scraper,
}

impl<'a> BatchScraper<'a> {
    pub fn new(
        chain: &'a str,
        block_source: &'a dyn BlockSource,
        state_reader: &'a dyn StateReader,
        publisher: &'a dyn SnapshotPublisher,
        config: &'a Scraper,
    ) -> Self {
        Self {
            chain,
            block_source,
            state_reader,
            publisher,
            config,
        }
    }

    /// Scrapes every pool in protocol-sized, block-anchored batches.
    pub async fn scrape_all(
        &self,
        pools: &[DiscoveredPool],
        mode: ScrapeMode,
    ) -> Result<ScrapeOutcome> {
        let batches = create_batches(pools, self.config, mode);
        let total_batches = batches.len();
        let mut outcome = ScrapeOutcome::default();

        if batches.is_empty() {
            info!("[Scraper] No pools to scrape for {}", self.chain);
            return Ok(outcome);
        }

        let mut last_reference: Option<u64> = None;

        for (batch_idx, (protocol, batch)) in batches.into_iter().enumerate() {
            let batch_number = batch_idx + 1;
            let started = Instant::now();

            // One batch per block: block until the chain has moved past the
            // previous anchor.
            let reference_block = match last_reference {
                Some(last) if self.config.wait_for_next_block => {
                    match self.wait_for_next_block(last).await {
                        Ok(block) => block,
                        Err(e) => {
                            warn!(
                                "[Scraper] Batch {batch_number}/{total_batches} lost its anchor: {e}"
                            );
                            self.record_failed_batch(
                                &mut outcome,
                                batch_number,
                                total_batches,
                                protocol,
                                &batch,
                                last_reference.unwrap_or(0),
                                started,
                                e.to_string(),
                            )
                            .await;
                            continue;
                        }
                    }
                }
                _ => match self.block_source.block_number().await {
                    Ok(block) => block,
                    Err(e) => {
                        warn!(
                            "[Scraper] Batch {batch_number}/{total_batches} lost its anchor: {e}"
                        );
                        self.record_failed_batch(
                            &mut outcome,
                            batch_number,
                            total_batches,
                            protocol,
                            &batch,
                            last_reference.unwrap_or(0),
                            started,
                            e.to_string(),
                        )
                        .await;
                        continue;
                    }
                },
            };
            last_reference = Some(reference_block);

            let reference_timestamp = Utc::now();
            info!(
                "[Scraper] Batch {batch_number}/{total_batches}: {} {} pools at block {reference_block}",
                batch.len(),
                protocol,
            );

            let (states, failures) = self
                .scrape_batch(protocol, &batch, reference_block, mode)
                .await;

            let pools_scraped = states.len();
            for (pool_id, data) in states {
                outcome.states.push(PoolState {
                    pool_id,
                    protocol,
                    data,
                    reference_block,
                    reference_timestamp,
                });
            }
            outcome.failures.extend(failures);

            let report = BatchReport {
                batch_number,
                total_batches,
                protocol,
                reference_block,
                reference_timestamp,
                pools_scraped,
                duration: started.elapsed(),
                success: true,
                error: None,
            };
            self.publish_reference_block(&report, batch.len()).await;
            metrics::increment_batches_scraped(protocol.as_str());
            info!(
                "[Scraper] Batch {batch_number} complete: {pools_scraped}/{} pools in {:.2}s",
                batch.len(),
                report.duration.as_secs_f64()
            );
            outcome.reports.push(report);
        }

        let total_scraped = outcome.states.len();
        let successful = outcome.reports.iter().filter(|r| r.success).count();
        info!(
            "[Scraper] Scrape complete: {successful}/{} batches, {total_scraped} pools, {} failures",
            outcome.reports.len(),
            outcome.failures.len()
        );
        Ok(outcome)
    }

    async fn wait_for_next_block(&self, last: u64) -> Result<u64> {
        info!("[Scraper] Waiting for block > {last}...");
        loop {
            let current = self.block_source.block_number().await?;
            if current > last {
                return Ok(current);
            }
            tokio::time::sleep(BLOCK_POLL_INTERVAL).await;
        }
    }

    async fn scrape_batch(
        &self,
        protocol: Protocol,
        batch: &[DiscoveredPool],
        reference_block: u64,
        mode: ScrapeMode,
    ) -> (Vec<(PoolId, StateData)>, Vec<(PoolId, String)>) {
        match protocol {
            Protocol::V2 => self.scrape_v2(batch, reference_block).await,
            Protocol::V3 => self.scrape_v3(batch, reference_block, mode).await,
            Protocol::V4 => self.scrape_v4(batch, reference_block, mode).await,
        }
    }

    async fn scrape_v2(
        &self,
        batch: &[DiscoveredPool],
        reference_block: u64,
    ) -> (Vec<(PoolId, StateData)>, Vec<(PoolId, String)>) {
        let reader = self.state_reader;
        let results: Vec<(PoolId, Result<(ethers::types::U256, ethers::types::U256)>)> =
            stream::iter(batch.iter())
                .map(|pool| async move {
                    let result = match pool.pool_id {
                        PoolId::Address(addr) => reader.load_v2(addr, reference_block).await,
                        PoolId::Bytes32(_) => Err(crate::error::WhitelistError::StateReadFailed {
                            pool: pool.pool_id.to_hex(),
                            reason: "v2 pool with 32-byte id".to_string(),
                        }),
                    };
                    (pool.pool_id, result)
                })
                .buffered(self.config.per_batch_concurrency.max(1))
                .collect()
                .await;

        let mut states = Vec::new();
        let mut failures = Vec::new();
        for (pool_id, result) in results {
            match result {
                Ok((reserve0, reserve1)) => {
                    states.push((pool_id, StateData::V2 { reserve0, reserve1 }))
                }
                Err(e) => failures.push((pool_id, e.to_string())),
            }
        }
        (states, failures)
    }

    async fn scrape_v3(
        &self,
        batch: &[DiscoveredPool],
        reference_block: u64,
        mode: ScrapeMode,
    ) -> (Vec<(PoolId, StateData)>, Vec<(PoolId, String)>) {
        let mut configs = Vec::with_capacity(batch.len());
        let mut failures = Vec::new();
        for pool in batch {
            match pool.pool_id {
                PoolId::Address(address) => configs.push(V3PoolConfig {
                    address,
                    tick_spacing: pool.tick_spacing.unwrap_or(0),
                }),
                PoolId::Bytes32(_) => failures.push((
                    pool.pool_id,
                    "v3 pool with 32-byte id".to_string(),
                )),
            }
        }

        let results = self
            .state_reader
            .batch_load_v3(&configs, reference_block, mode)
            .await;

        let mut states = Vec::new();
        for (address, result) in results {
            let pool_id = PoolId::Address(address);
            match result {
                Ok(state) => states.push((pool_id, slot0_to_data(state, mode))),
                Err(e) => failures.push((pool_id, e.to_string())),
            }
        }
        (states, failures)
    }

    async fn scrape_v4(
        &self,
        batch: &[DiscoveredPool],
        reference_block: u64,
        mode: ScrapeMode,
    ) -> (Vec<(PoolId, StateData)>, Vec<(PoolId, String)>) {
        let mut configs = Vec::with_capacity(batch.len());
        let mut failures = Vec::new();
        for pool in batch {
            match pool.pool_id {
                PoolId::Bytes32(pool_id) => configs.push(V4PoolConfig {
                    pool_id,
                    manager: pool.factory,
                    tick_spacing: pool.tick_spacing.unwrap_or(0),
                }),
                PoolId::Address(_) => failures.push((
                    pool.pool_id,
                    "v4 pool without 32-byte id".to_string(),
                )),
            }
        }

        let results = self
            .state_reader
            .batch_load_v4(&configs, reference_block, mode)
            .await;

        let mut states = Vec::new();
        for (id, result) in results {
            let pool_id = PoolId::Bytes32(id);
            match result {
                Ok(state) => states.push((pool_id, slot0_to_data(state, mode))),
                Err(e) => failures.push((pool_id, e.to_string())),
            }
        }
        (states, failures)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_failed_batch(
        &self,
        outcome: &mut ScrapeOutcome,
        batch_number: usize,
        total_batches: usize,
        protocol: Protocol,
        batch: &[DiscoveredPool],
        reference_block: u64,
        started: Instant,
        error: String,
    ) {
        for pool in batch {
            outcome.failures.push((pool.pool_id, error.clone()));
        }
        let report = BatchReport {
            batch_number,
            total_batches,
            protocol,
            reference_block,
            reference_timestamp: Utc::now(),
            pools_scraped: 0,
            duration: started.elapsed(),
            success: false,
            error: Some(error),
        };
        // Downstream watermarks advance even on partial batches.
        self.publish_reference_block(&report, batch.len()).await;
        outcome.reports.push(report);
    }

    async fn publish_reference_block(&self, report: &BatchReport, pools_in_batch: usize) {
        let meta = ReferenceBlockMeta {
            batch_number: report.batch_number,
            total_batches: report.total_batches,
            protocol: report.protocol.as_str().to_string(),
            pools_in_batch,
        };
        let timestamp = report
            .reference_timestamp
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        if let Err(e) = self
            .publisher
            .publish_reference_block(self.chain, report.reference_block, &timestamp, &meta)
            .await
        {
            warn!(
                "[Scraper] Failed to publish reference block for batch {}: {e}",
                report.batch_number
            );
        }
    }
}

fn slot0_to_data(state: crate::state_reader::Slot0State, mode: ScrapeMode) -> StateData {
    match mode {
        ScrapeMode::Filtering => StateData::Slot0 {
            sqrt_price_x96: state.sqrt_price_x96,
            tick: state.tick,
            liquidity: state.liquidity,
        },
        ScrapeMode::FullTicks => StateData::FullTicks {
            sqrt_price_x96: state.sqrt_price_x96,
            tick: state.tick,
            liquidity: state.liquidity,
            ticks: state.ticks,
            bitmap_words: state.bitmap_words,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, H256};

    fn pool(protocol: Protocol, n: u64) -> DiscoveredPool {
        let pool_id = match protocol {
            Protocol::V4 => PoolId::Bytes32(H256::from_low_u64_be(n)),
            _ => PoolId::Address(Address::from_low_u64_be(n)),
        };
        DiscoveredPool {
            pool_id,
            protocol,
            variant: format!("uniswap_{}", protocol.as_str()),
            factory: Address::from_low_u64_be(0xfac),
            token0: Address::from_low_u64_be(1),
            token1: Address::from_low_u64_be(2),
            fee: Some(3000),
            tick_spacing: Some(60),
            stable: None,
            hooks: None,
            creation_block: n,
            was_swapped: false,
        }
    }

    #[test]
    fn batches_partition_by_protocol_in_order() {
        let mut pools = Vec::new();
        // Interleave protocols; batching must still emit V2, V3, V4 groups.
        for n in 0..5 {
            pools.push(pool(Protocol::V3, 100 + n));
            pools.push(pool(Protocol::V2, 200 + n));
            pools.push(pool(Protocol::V4, 300 + n));
        }

        let config = Scraper::default();
        let batches = create_batches(&pools, &config, ScrapeMode::Filtering);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].0, Protocol::V2);
        assert_eq!(batches[1].0, Protocol::V3);
        assert_eq!(batches[2].0, Protocol::V4);
        // Stable within a protocol.
        assert_eq!(
            batches[1].1.iter().map(|p| p.creation_block).collect::<Vec<_>>(),
            vec![100, 101, 102, 103, 104]
        );
    }

    #[test]
    fn batches_respect_size_limits() {
        let pools: Vec<_> = (0..450).map(|n| pool(Protocol::V2, n)).collect();
        let config = Scraper::default();
        let batches = create_batches(&pools, &config, ScrapeMode::Filtering);
        assert_eq!(batches.len(), 3); // 200 + 200 + 50
        assert_eq!(batches[0].1.len(), 200);
        assert_eq!(batches[2].1.len(), 50);
    }

    #[test]
    fn full_ticks_mode_uses_smaller_batches() {
        let pools: Vec<_> = (0..60).map(|n| pool(Protocol::V3, n)).collect();
        let config = Scraper::default();
        let filtering = create_batches(&pools, &config, ScrapeMode::Filtering);
        let full = create_batches(&pools, &config, ScrapeMode::FullTicks);
        assert_eq!(filtering.len(), 1);
        assert_eq!(full.len(), 2); // 30 + 30
    }

    #[test]
    fn empty_input_creates_no_batches() {
        let config = Scraper::default();
        assert!(create_batches(&[], &config, ScrapeMode::Filtering).is_empty());
    }
}
