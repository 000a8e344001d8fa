// Refresh orchestrator. One cycle per chain: ingest creation logs for every
// configured protocol, upsert pools and advance checkpoints, enrich token
// metadata, scrape current state in block-anchored batches, filter, then
// diff/persist/publish the snapshot. Chains run independently; two cycles
// for the same chain cannot overlap.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use log::{error, info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::batch_scraper::BatchScraper;
use crate::checkpoints;
use crate::database::{self, DbPool};
use crate::error::{Result, WhitelistError};
use crate::event_decoder::decode_event;
use crate::liquidity_filter::LiquidityFilter;
use crate::log_ingestor::LogIngestor;
use crate::log_reader::read_log_events;
use crate::metrics;
use crate::pool_registry;
use crate::price_feeds::PriceOracle;
use crate::protocols::{ProtocolCatalog, ProtocolSpec};
use crate::publisher::{FullPoolPayload, SnapshotPublisher, TokenPayload};
use crate::rpc::{BlockSource, RpcClient};
use crate::settings::{ChainEntry, ScrapeMode, Settings};
use crate::snapshot_store::{self, SnapshotKind};
use crate::state_reader::RpcStateReader;
use crate::token_metadata;
use crate::types::{BatchReport, DiscoveredPool, PoolId, StateData};

/// Outcome of one protocol's ingest within a cycle.
#[derive(Debug, Clone)]
pub struct ProtocolIngestReport {
    pub variant: String,
    pub covered_end_block: Option<u64>,
    pub events_decoded: usize,
    pub decode_failures: usize,
    pub inserted: u64,
    pub updated: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotSummary {
    pub snapshot_id: Uuid,
    pub kind: SnapshotKind,
    pub total_pools: usize,
    pub added: usize,
    pub removed: usize,
    pub reference_block: u64,
    pub published: bool,
}

/// Structured result of one refresh cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub chain: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub protocols: Vec<ProtocolIngestReport>,
    pub pools_known: usize,
    pub pools_scraped: usize,
    pub pools_passing: usize,
    pub snapshot: Option<SnapshotSummary>,
    pub batch_reports: Vec<BatchReport>,
    pub errors: Vec<String>,
    pub success: bool,
}

pub struct RefreshOrchestrator {
    settings: Arc<Settings>,
    db: DbPool,
    publisher: Arc<dyn SnapshotPublisher>,
    price_oracle: PriceOracle,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RefreshOrchestrator {
    pub fn new(
        settings: Arc<Settings>,
        db: DbPool,
        publisher: Arc<dyn SnapshotPublisher>,
    ) -> Result<Self> {
        let price_oracle = PriceOracle::from_settings(&settings.filter)?;
        Ok(Self {
            settings,
            db,
            publisher,
            price_oracle,
            locks: DashMap::new(),
        })
    }

    /// Runs one cycle for every configured chain, in parallel.
    pub async fn run_all(self: &Arc<Self>) -> Vec<(String, Result<CycleReport>)> {
        let mut handles = Vec::new();
        for chain in self.settings.chains.keys().cloned() {
            let orchestrator = Arc::clone(self);
            let fut: std::pin::Pin<Box<dyn std::future::Future<Output = (String, Result<CycleReport>)> + Send>> =
                Box::pin(async move {
                    let report = orchestrator.run_cycle(&chain).await;
                    (chain, report)
                });
            handles.push(tokio::spawn(fut));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => error!("[Refresh] Cycle task panicked: {e}"),
            }
        }
        results
    }

    /// Runs one refresh cycle for a chain under its exclusive lock, bounded
    /// by the cycle deadline. Work committed before the deadline (ingested
    /// events, advanced checkpoints) is preserved; the in-flight batch is
    /// discarded.
    pub async fn run_cycle<'a>(&'a self, chain: &'a str) -> Result<CycleReport> {
        let entry = self
            .settings
            .chains
            .get(chain)
            .ok_or_else(|| {
                WhitelistError::ConfigInvalid(format!("chain '{chain}' is not configured"))
            })?
            .clone();
        database::validate_chain_name(chain)?;

        let lock = {
            let entry = self
                .locks
                .entry(chain.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            entry.clone()
        };
        let _guard = lock.try_lock().map_err(|_| {
            WhitelistError::SnapshotConflict(format!("a refresh cycle for {chain} is already running"))
        })?;

        let started_at = Utc::now();
        let deadline = Duration::from_secs(self.settings.refresh.cycle_deadline_seconds);
        info!("[Refresh] Starting cycle for {chain} (deadline {deadline:?})");

        match tokio::time::timeout(deadline, Box::pin(self.cycle_inner(chain, &entry, started_at))).await {
            Ok(report) => report,
            Err(_) => {
                let message = WhitelistError::DeadlineExceeded(deadline).to_string();
                error!("[Refresh] {chain}: {message}");
                Ok(CycleReport {
                    chain: chain.to_string(),
                    started_at,
                    finished_at: Utc::now(),
                    protocols: Vec::new(),
                    pools_known: 0,
                    pools_scraped: 0,
                    pools_passing: 0,
                    snapshot: None,
                    batch_reports: Vec::new(),
                    errors: vec![message],
                    success: false,
                })
            }
        }
    }

    async fn cycle_inner<'a>(
        &'a self,
        chain: &'a str,
        entry: &'a ChainEntry,
        started_at: DateTime<Utc>,
    ) -> Result<CycleReport> {
        let catalog = ProtocolCatalog::from_chain(chain, entry)?;
        let rpc = RpcClient::connect(&entry.rpc_url)?;
        let mut errors: Vec<String> = Vec::new();

        // A -> C -> D: ingest, decode, upsert + checkpoint per protocol.
        let ingestor = LogIngestor::new(&self.settings.extractor);
        let extractor_ready = match ingestor.preflight().await {
            Ok(()) => true,
            Err(e) => {
                warn!("[Refresh] {chain}: {e}; skipping ingest this cycle");
                errors.push(e.to_string());
                false
            }
        };

        let mut protocols = Vec::with_capacity(catalog.specs.len());
        for spec in &catalog.specs {
            if !extractor_ready {
                protocols.push(ProtocolIngestReport {
                    variant: spec.variant.clone(),
                    covered_end_block: None,
                    events_decoded: 0,
                    decode_failures: 0,
                    inserted: 0,
                    updated: 0,
                    error: Some("extractor unavailable".to_string()),
                });
                continue;
            }
            let report = self.ingest_protocol(chain, entry, spec, &ingestor, &rpc).await;
            if let Some(e) = &report.error {
                errors.push(format!("{}: {e}", spec.variant));
            }
            protocols.push(report);
        }

        // Token metadata for previously-unseen tokens. Per-token RPC
        // failures are handled inside; an error here is a storage failure
        // and fails the cycle.
        let pending_tokens = pool_registry::tokens_needing_metadata(&self.db, chain).await?;
        if !pending_tokens.is_empty() {
            token_metadata::enrich(&self.db, chain, &rpc, &pending_tokens).await?;
        }

        // E: scrape the current registry in block-anchored batches.
        let pools = pool_registry::list_pools(&self.db, chain).await?;
        let state_reader = RpcStateReader::new(rpc.clone(), &self.settings.scraper);
        let scraper = BatchScraper::new(
            chain,
            &rpc,
            &state_reader,
            self.publisher.as_ref(),
            &self.settings.scraper,
        );
        let scrape = scraper.scrape_all(&pools, ScrapeMode::Filtering).await?;
        for (pool_id, reason) in &scrape.failures {
            warn!("[Refresh] {chain}: dropping {pool_id} this cycle: {reason}");
        }
        for report in scrape.reports.iter().filter(|r| !r.success) {
            errors.push(format!(
                "batch {}/{} ({}) failed: {}",
                report.batch_number,
                report.total_batches,
                report.protocol,
                report.error.as_deref().unwrap_or("unknown")
            ));
        }

        // F: liquidity filter over scraped state.
        let decimals = token_metadata::load_decimals(&self.db, chain).await?;
        let prices = self.price_oracle.usd_prices().await;
        let mut filter = LiquidityFilter::from_settings(&self.settings.filter)?;
        let db_trusted = database::load_trusted_tokens(&self.db, chain).await?;
        filter.extend_trusted(
            db_trusted
                .iter()
                .filter_map(|raw| raw.parse::<ethers::types::Address>().ok()),
        );

        let states: HashMap<PoolId, StateData> = scrape
            .states
            .iter()
            .map(|s| (s.pool_id, s.data.clone()))
            .collect();
        let verdicts = filter.evaluate(&pools, &states, &decimals, &prices);
        let new_set: BTreeSet<PoolId> = verdicts
            .iter()
            .filter(|v| v.passes)
            .map(|v| v.pool_id)
            .collect();
        metrics::set_whitelist_size(chain, new_set.len() as f64);

        // G: diff against the last snapshot, persist, publish.
        let reference_block = match scrape.last_reference_block() {
            Some(block) => block,
            None => rpc.block_number().await?,
        };
        let snapshot = self
            .publish_snapshot(chain, &pools, &new_set, reference_block, &mut errors)
            .await?;

        if self.settings.telemetry.persist_batch_reports {
            if let Err(e) = snapshot_store::persist_batch_reports(
                &self.db,
                chain,
                &scrape.reports,
                self.settings.telemetry.batch_report_retention_days,
            )
            .await
            {
                warn!("[Refresh] {chain}: batch report telemetry failed: {e}");
                errors.push(format!("telemetry: {e}"));
            }
        }

        let success = errors.is_empty();
        let report = CycleReport {
            chain: chain.to_string(),
            started_at,
            finished_at: Utc::now(),
            pools_known: pools.len(),
            pools_scraped: scrape.states.len(),
            pools_passing: new_set.len(),
            protocols,
            snapshot: Some(snapshot),
            batch_reports: scrape.reports,
            errors,
            success,
        };

        info!(
            "[Refresh] Cycle for {chain} finished: {} known, {} scraped, {} passing, {} errors",
            report.pools_known,
            report.pools_scraped,
            report.pools_passing,
            report.errors.len()
        );
        Ok(report)
    }

    fn ingest_protocol<'a>(
        &'a self,
        chain: &'a str,
        entry: &'a ChainEntry,
        spec: &'a ProtocolSpec,
        ingestor: &'a LogIngestor,
        rpc: &'a RpcClient,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ProtocolIngestReport> + Send + 'a>> {
        Box::pin(async move {
        let mut report = ProtocolIngestReport {
            variant: spec.variant.clone(),
            covered_end_block: None,
            events_decoded: 0,
            decode_failures: 0,
            inserted: 0,
            updated: 0,
            error: None,
        };

        let checkpoint = match checkpoints::get(&self.db, chain, spec.checkpoint_key()).await {
            Ok(ck) => ck,
            Err(e) => {
                report.error = Some(e.to_string());
                return report;
            }
        };

        let output_dir: PathBuf = [
            self.settings.extractor.data_dir.as_str(),
            chain,
            &format!("{}_events", spec.variant),
        ]
        .iter()
        .collect();

        let outcome = match ingestor
            .ingest(chain, spec, &entry.rpc_url, rpc, checkpoint, None, &output_dir)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // Fatal for this protocol this cycle; the checkpoint did not
                // move.
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.covered_end_block = Some(outcome.covered_end_block);

        let mut rows: Vec<DiscoveredPool> = Vec::new();
        for file in &outcome.batch_files {
            let events = match read_log_events(file) {
                Ok(events) => events,
                Err(e) => {
                    report.error = Some(e.to_string());
                    return report;
                }
            };
            for event in events {
                // Batch files are range-granular; re-filter at event level.
                if event.topics.first() != Some(&spec.topic) {
                    continue;
                }
                if !spec.factories.contains(&event.address) {
                    continue;
                }
                if let Some(ck) = checkpoint {
                    if event.block_number <= ck {
                        continue;
                    }
                }
                match decode_event(spec, &event) {
                    Ok(pool) => rows.push(pool),
                    Err(e) => {
                        warn!("[Refresh] {chain}: {e}");
                        report.decode_failures += 1;
                    }
                }
            }
        }
        report.events_decoded = rows.len();

        let rows = pool_registry::dedup_pools(rows);
        let advanced = checkpoint.map_or(true, |ck| outcome.covered_end_block > ck);
        if advanced || !rows.is_empty() {
            match pool_registry::upsert_with_checkpoint(
                &self.db,
                chain,
                spec.checkpoint_key(),
                &rows,
                outcome.covered_end_block,
            )
            .await
            {
                Ok((inserted, updated)) => {
                    report.inserted = inserted;
                    report.updated = updated;
                }
                Err(e) => report.error = Some(e.to_string()),
            }
        }
        report
        })
    }

    async fn publish_snapshot(
        &self,
        chain: &str,
        pools: &[DiscoveredPool],
        new_set: &BTreeSet<PoolId>,
        reference_block: u64,
        errors: &mut Vec<String>,
    ) -> Result<SnapshotSummary> {
        let previous = snapshot_store::last_snapshot(&self.db, chain).await?;
        let previous_set = previous.map(|(_, members)| members);
        let snapshot_diff = snapshot_store::diff(previous_set.as_ref(), new_set);

        let snapshot_id = Uuid::new_v4();
        let published_at = Utc::now();
        snapshot_store::persist_snapshot(
            &self.db,
            chain,
            snapshot_id,
            &snapshot_diff,
            reference_block,
            new_set,
            published_at,
        )
        .await?;

        let mut published = false;
        if snapshot_diff.is_empty() {
            // No-op snapshot: history row written, nothing broadcast.
            info!("[Refresh] {chain}: whitelist unchanged ({} pools)", new_set.len());
        } else {
            let timestamp = published_at.to_rfc3339_opts(SecondsFormat::Micros, true);
            let pool_ids: Vec<String> = new_set.iter().map(|id| id.to_hex()).collect();
            let full_payloads = self.build_full_payloads(chain, pools, new_set).await?;

            let minimal = self
                .publisher
                .publish_minimal(chain, reference_block, &timestamp, &pool_ids)
                .await;
            let full = self
                .publisher
                .publish_full(chain, reference_block, &timestamp, &full_payloads)
                .await;

            published = minimal.is_ok() && full.is_ok();
            for result in [minimal, full] {
                if let Err(e) = result {
                    warn!("[Refresh] {chain}: {e}");
                    errors.push(e.to_string());
                }
            }
        }

        info!(
            "[Refresh] {chain}: snapshot {snapshot_id} ({}) total={} added={} removed={} ref_block={reference_block}",
            snapshot_diff.kind.as_str(),
            new_set.len(),
            snapshot_diff.added.len(),
            snapshot_diff.removed.len(),
        );

        Ok(SnapshotSummary {
            snapshot_id,
            kind: snapshot_diff.kind,
            total_pools: new_set.len(),
            added: snapshot_diff.added.len(),
            removed: snapshot_diff.removed.len(),
            reference_block,
            published,
        })
    }

    /// Full-broadcast payloads for the whitelisted pools. Pools whose tokens
    /// are missing decimals are excluded here but stay in the minimal
    /// payload.
    async fn build_full_payloads(
        &self,
        chain: &str,
        pools: &[DiscoveredPool],
        members: &BTreeSet<PoolId>,
    ) -> Result<Vec<FullPoolPayload>> {
        let meta = token_metadata::load_meta(&self.db, chain).await?;
        let by_id: HashMap<PoolId, &DiscoveredPool> =
            pools.iter().map(|p| (p.pool_id, p)).collect();

        let mut payloads = Vec::with_capacity(members.len());
        let mut excluded = 0u64;
        for pool_id in members {
            let Some(pool) = by_id.get(pool_id) else {
                continue;
            };
            let token0 = meta.get(&pool.token0).and_then(token_payload);
            let token1 = meta.get(&pool.token1).and_then(token_payload);
            let (Some(token0), Some(token1)) = (token0, token1) else {
                excluded += 1;
                continue;
            };
            payloads.push(FullPoolPayload {
                id: pool_id.to_hex(),
                protocol: pool.protocol.as_str().to_string(),
                factory: format!("{:#x}", pool.factory),
                token0,
                token1,
                fee: pool.fee,
                tick_spacing: pool.tick_spacing,
                stable: pool.stable,
                hooks: pool.hooks.map(|h| format!("{:#x}", h)),
            });
        }

        if excluded > 0 {
            metrics::increment_pools_missing_decimals(excluded);
            warn!(
                "[Refresh] {chain}: {excluded} whitelisted pools lack token decimals, excluded from full broadcast"
            );
        }
        Ok(payloads)
    }
}

fn token_payload(meta: &crate::types::TokenMeta) -> Option<TokenPayload> {
    Some(TokenPayload {
        address: format!("{:#x}", meta.address),
        decimals: meta.decimals?,
        symbol: meta.symbol.clone(),
    })
}
