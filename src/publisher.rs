// Broker publisher. Three subjects per chain:
//   whitelist.pools.<chain>.minimal           pool ids only, for event filters
//   whitelist.pools.<chain>.full              pools + token metadata, for
//                                             price reconstruction
//   whitelist.snapshots.<chain>.reference_block   per-batch anchor
//
// Minimal and full messages for one snapshot share the same timestamp and
// reference block. Payloads are UTF-8 JSON.

use async_trait::async_trait;
use log::info;
use serde::Serialize;

use crate::error::{Result, WhitelistError};
use crate::metrics;
use crate::settings::Publisher as PublisherSettings;

/// Token half of a full-broadcast pool entry. Decimals are required; pools
/// with unknown decimals never reach the full subject.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPayload {
    pub address: String,
    pub decimals: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FullPoolPayload {
    pub id: String,
    pub protocol: String,
    pub factory: String,
    pub token0: TokenPayload,
    pub token1: TokenPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tick_spacing: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<String>,
}

/// Metadata attached to each per-batch reference-block message.
#[derive(Debug, Clone, Serialize)]
pub struct ReferenceBlockMeta {
    pub batch_number: usize,
    pub total_batches: usize,
    pub protocol: String,
    pub pools_in_batch: usize,
}

#[derive(Serialize)]
struct MinimalMessage<'a> {
    chain: &'a str,
    timestamp: &'a str,
    reference_block: u64,
    pools: &'a [String],
}

#[derive(Serialize)]
struct FullMessage<'a> {
    chain: &'a str,
    timestamp: &'a str,
    reference_block: u64,
    pools: &'a [FullPoolPayload],
}

#[derive(Serialize)]
struct ReferenceBlockMessage<'a> {
    chain: &'a str,
    reference_block: u64,
    snapshot_timestamp: &'a str,
    metadata: &'a ReferenceBlockMeta,
}

/// Seam between the pipeline and the broker; tests substitute a recording
/// implementation.
#[async_trait]
pub trait SnapshotPublisher: Send + Sync {
    async fn publish_minimal(
        &self,
        chain: &str,
        reference_block: u64,
        timestamp: &str,
        pool_ids: &[String],
    ) -> Result<()>;

    async fn publish_full(
        &self,
        chain: &str,
        reference_block: u64,
        timestamp: &str,
        pools: &[FullPoolPayload],
    ) -> Result<()>;

    async fn publish_reference_block(
        &self,
        chain: &str,
        reference_block: u64,
        timestamp: &str,
        meta: &ReferenceBlockMeta,
    ) -> Result<()>;
}

pub struct NatsPublisher {
    client: async_nats::Client,
    publish_minimal: bool,
    publish_full: bool,
}

impl NatsPublisher {
    pub async fn connect(settings: &PublisherSettings) -> Result<Self> {
        let client = async_nats::connect(&settings.broker_url)
            .await
            .map_err(|e| {
                WhitelistError::BrokerUnavailable(format!(
                    "connect to {} failed: {e}",
                    settings.broker_url
                ))
            })?;
        info!("[Publisher] Connected to broker at {}", settings.broker_url);
        Ok(Self {
            client,
            publish_minimal: settings.publish_minimal,
            publish_full: settings.publish_full,
        })
    }

    async fn publish_json<T: Serialize>(&self, subject: String, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| WhitelistError::BrokerUnavailable(format!("encode payload: {e}")))?;
        let size = payload.len();
        self.client
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| WhitelistError::BrokerUnavailable(format!("publish {subject}: {e}")))?;
        self.client
            .flush()
            .await
            .map_err(|e| WhitelistError::BrokerUnavailable(format!("flush {subject}: {e}")))?;
        info!("[Publisher] Published to {subject} ({size} bytes)");
        Ok(())
    }
}

#[async_trait]
impl SnapshotPublisher for NatsPublisher {
    async fn publish_minimal(
        &self,
        chain: &str,
        reference_block: u64,
        timestamp: &str,
        pool_ids: &[String],
    ) -> Result<()> {
        if !self.publish_minimal {
            return Ok(());
        }
        let message = MinimalMessage {
            chain,
            timestamp,
            reference_block,
            pools: pool_ids,
        };
        let result = self
            .publish_json(format!("whitelist.pools.{chain}.minimal"), &message)
            .await;
        if result.is_err() {
            metrics::increment_broker_publish_failed("minimal");
        }
        result
    }

    async fn publish_full(
        &self,
        chain: &str,
        reference_block: u64,
        timestamp: &str,
        pools: &[FullPoolPayload],
    ) -> Result<()> {
        if !self.publish_full {
            return Ok(());
        }
        let message = FullMessage {
            chain,
            timestamp,
            reference_block,
            pools,
        };
        let result = self
            .publish_json(format!("whitelist.pools.{chain}.full"), &message)
            .await;
        if result.is_err() {
            metrics::increment_broker_publish_failed("full");
        }
        result
    }

    async fn publish_reference_block(
        &self,
        chain: &str,
        reference_block: u64,
        timestamp: &str,
        meta: &ReferenceBlockMeta,
    ) -> Result<()> {
        let message = ReferenceBlockMessage {
            chain,
            reference_block,
            snapshot_timestamp: timestamp,
            metadata: meta,
        };
        let result = self
            .publish_json(
                format!("whitelist.snapshots.{chain}.reference_block"),
                &message,
            )
            .await;
        if result.is_err() {
            metrics::increment_broker_publish_failed("reference_block");
        }
        result
    }
}

/// Used when the publisher is disabled: snapshot history is still recorded,
/// nothing leaves the process.
pub struct NoopPublisher;

#[async_trait]
impl SnapshotPublisher for NoopPublisher {
    async fn publish_minimal(&self, _: &str, _: u64, _: &str, _: &[String]) -> Result<()> {
        Ok(())
    }
    async fn publish_full(&self, _: &str, _: u64, _: &str, _: &[FullPoolPayload]) -> Result<()> {
        Ok(())
    }
    async fn publish_reference_block(
        &self,
        _: &str,
        _: u64,
        _: &str,
        _: &ReferenceBlockMeta,
    ) -> Result<()> {
        Ok(())
    }
}
