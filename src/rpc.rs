// Thin RPC surface for the refresh pipeline: current/finalized block number
// and direct storage reads. Everything is bounded by a timeout and retried
// with exponential backoff before surfacing `RpcUnavailable`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockId, BlockNumber, Eip1559TransactionRequest, H256};
use log::debug;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

use crate::error::{Result, WhitelistError};

const RPC_TIMEOUT: Duration = Duration::from_secs(10);
const RPC_RETRIES: usize = 3;
const BACKOFF_BASE_MS: u64 = 200;

/// Source of chain head information. The scraper's block gate and the
/// ingestor's end-block resolution only need this, which keeps both testable
/// without a live endpoint.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Latest block number.
    async fn block_number(&self) -> Result<u64>;
    /// Latest finalized block number.
    async fn finalized_block_number(&self) -> Result<u64>;
}

#[derive(Clone)]
pub struct RpcClient {
    provider: Arc<Provider<Http>>,
    url: String,
}

impl RpcClient {
    pub fn connect(url: &str) -> Result<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| WhitelistError::ConfigInvalid(format!("bad rpc url '{url}': {e}")))?;
        Ok(Self {
            provider: Arc::new(provider),
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, ethers::providers::ProviderError>>,
    {
        let strategy = ExponentialBackoff::from_millis(BACKOFF_BASE_MS).take(RPC_RETRIES - 1);
        Retry::spawn(strategy, || async {
            match tokio::time::timeout(RPC_TIMEOUT, op()).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => {
                    debug!("[Rpc] {what} failed: {e}");
                    Err(WhitelistError::RpcUnavailable(format!("{what}: {e}")))
                }
                Err(_) => Err(WhitelistError::RpcUnavailable(format!(
                    "{what}: timed out after {RPC_TIMEOUT:?}"
                ))),
            }
        })
        .await
    }

    /// Raw storage word at `slot`, read at a specific block.
    pub async fn get_storage_at(
        &self,
        address: Address,
        slot: H256,
        block: Option<u64>,
    ) -> Result<H256> {
        let block_id = block.map(|b| BlockId::Number(BlockNumber::Number(b.into())));
        self.with_retry("eth_getStorageAt", || {
            self.provider.get_storage_at(address, slot, block_id)
        })
        .await
    }

    /// Read-only contract call (token metadata lookups).
    pub async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .to(to)
            .data(data)
            .into();
        let bytes = self
            .with_retry("eth_call", || self.provider.call(&tx, None))
            .await?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl BlockSource for RpcClient {
    async fn block_number(&self) -> Result<u64> {
        let number = self
            .with_retry("eth_blockNumber", || self.provider.get_block_number())
            .await?;
        Ok(number.as_u64())
    }

    async fn finalized_block_number(&self) -> Result<u64> {
        let block = self
            .with_retry("eth_getBlockByNumber(finalized)", || {
                self.provider.get_block(BlockNumber::Finalized)
            })
            .await?;
        block
            .and_then(|b| b.number)
            .map(|n| n.as_u64())
            .ok_or_else(|| {
                WhitelistError::RpcUnavailable("finalized block has no number".to_string())
            })
    }
}
