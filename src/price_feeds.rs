// Token price oracle feeding the liquidity filter: an optional HTTP JSON
// endpoint (address -> USD price) with a TTL cache, merged over static
// config prices for stables and wrapped native. The filter itself never
// fetches; it consumes the map produced here once per cycle.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use ethers::types::Address;
use log::{info, warn};
use tokio::sync::Mutex;

use crate::error::{Result, WhitelistError};
use crate::settings;

pub struct PriceOracle {
    endpoint: Option<String>,
    client: reqwest::Client,
    ttl: Duration,
    static_prices: HashMap<Address, f64>,
    cache: Mutex<Option<(Instant, HashMap<Address, f64>)>>,
}

impl PriceOracle {
    pub fn from_settings(filter: &settings::Filter) -> Result<Self> {
        let mut static_prices = HashMap::with_capacity(filter.static_prices.len());
        for (raw, price) in &filter.static_prices {
            let addr = Address::from_str(raw).map_err(|_| {
                WhitelistError::ConfigInvalid(format!("bad static price token '{raw}'"))
            })?;
            static_prices.insert(addr, *price);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WhitelistError::ConfigInvalid(format!("http client: {e}")))?;

        Ok(Self {
            endpoint: filter.price_endpoint.clone(),
            client,
            ttl: Duration::from_secs(filter.price_cache_ttl_seconds),
            static_prices,
            cache: Mutex::new(None),
        })
    }

    /// Current USD price map. A fetch failure serves the stale cache if one
    /// exists, otherwise just the static prices; the filter degrades to
    /// trusted-token passthroughs in that case.
    pub async fn usd_prices(&self) -> HashMap<Address, f64> {
        let mut merged = self.static_prices.clone();

        let endpoint = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => return merged,
        };

        let mut cache = self.cache.lock().await;
        let fresh = matches!(&*cache, Some((at, _)) if at.elapsed() < self.ttl);

        if !fresh {
            match self.fetch(&endpoint).await {
                Ok(prices) => {
                    info!("[Prices] Fetched {} token prices", prices.len());
                    *cache = Some((Instant::now(), prices));
                }
                Err(e) => {
                    warn!("[Prices] Fetch failed, serving cached/static prices: {e}");
                }
            }
        }

        if let Some((_, prices)) = &*cache {
            for (token, price) in prices {
                merged.insert(*token, *price);
            }
        }
        merged
    }

    async fn fetch(&self, endpoint: &str) -> Result<HashMap<Address, f64>> {
        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|e| WhitelistError::RpcUnavailable(format!("price endpoint: {e}")))?;
        let raw: HashMap<String, f64> = response
            .json()
            .await
            .map_err(|e| WhitelistError::DecodeFailed(format!("price payload: {e}")))?;

        let mut prices = HashMap::with_capacity(raw.len());
        for (token, price) in raw {
            match Address::from_str(&token) {
                Ok(addr) if price.is_finite() && price > 0.0 => {
                    prices.insert(addr, price);
                }
                Ok(_) => {}
                Err(_) => warn!("[Prices] Skipping unparseable token key '{token}'"),
            }
        }
        Ok(prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_prices_without_endpoint() {
        let mut filter = settings::Filter::default();
        filter.static_prices.insert(
            "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".to_string(),
            1.0,
        );
        let oracle = PriceOracle::from_settings(&filter).unwrap();
        let prices = oracle.usd_prices().await;
        assert_eq!(prices.len(), 1);
        let usdc = Address::from_str("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48").unwrap();
        assert_eq!(prices[&usdc], 1.0);
    }

    #[test]
    fn rejects_bad_static_price_address() {
        let mut filter = settings::Filter::default();
        filter.static_prices.insert("usdc".to_string(), 1.0);
        assert!(PriceOracle::from_settings(&filter).is_err());
    }
}
