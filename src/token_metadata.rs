// Token metadata enrichment: decimals()/symbol() lookups for tokens the
// registry references but the tokens table does not know yet. Pools whose
// tokens never yield decimals stay out of the full broadcast.

use std::collections::HashMap;

use ethers::types::Address;
use futures::stream::{self, StreamExt};
use log::{info, warn};
use sqlx::Row;

use crate::database::{DbPool, SCHEMA};
use crate::error::Result;
use crate::rpc::RpcClient;
use crate::types::TokenMeta;

// ERC-20 selectors
const DECIMALS_SELECTOR: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];
const SYMBOL_SELECTOR: [u8; 4] = [0x95, 0xd8, 0x9b, 0x41];

const ENRICH_CONCURRENCY: usize = 8;

/// Fetches metadata for `tokens` and upserts it. Tokens that revert on
/// either call are recorded with NULL fields so they are retried next cycle
/// only for the missing parts. Returns how many tokens yielded decimals.
pub async fn enrich(db: &DbPool, chain: &str, rpc: &RpcClient, tokens: &[Address]) -> Result<usize> {
    if tokens.is_empty() {
        return Ok(0);
    }
    info!(
        "[TokenMeta] Fetching metadata for {} tokens on {chain}",
        tokens.len()
    );

    let metas: Vec<TokenMeta> = stream::iter(tokens.iter().copied())
        .map(|token| async move { fetch_one(rpc, token).await })
        .buffered(ENRICH_CONCURRENCY)
        .collect()
        .await;

    let mut enriched = 0usize;
    let mut tx = db.begin().await?;
    for meta in &metas {
        if meta.decimals.is_some() {
            enriched += 1;
        }
        sqlx::query(&format!(
            "INSERT INTO {SCHEMA}.tokens (chain, address, decimals, symbol, name, updated_at) \
             VALUES ($1, $2, $3, $4, $5, NOW()) \
             ON CONFLICT (chain, address) DO UPDATE SET \
                 decimals = COALESCE(EXCLUDED.decimals, {SCHEMA}.tokens.decimals), \
                 symbol = COALESCE(EXCLUDED.symbol, {SCHEMA}.tokens.symbol), \
                 name = COALESCE(EXCLUDED.name, {SCHEMA}.tokens.name), \
                 updated_at = NOW()"
        ))
        .bind(chain)
        .bind(format!("{:#x}", meta.address))
        .bind(meta.decimals.map(|d| d as i32))
        .bind(&meta.symbol)
        .bind(&meta.name)
        .execute(tx.as_mut())
        .await?;
    }
    tx.commit().await?;

    info!(
        "[TokenMeta] Enriched {enriched}/{} tokens on {chain}",
        tokens.len()
    );
    Ok(enriched)
}

async fn fetch_one(rpc: &RpcClient, token: Address) -> TokenMeta {
    let decimals = match rpc.call(token, DECIMALS_SELECTOR.to_vec()).await {
        Ok(bytes) => decode_decimals(&bytes),
        Err(e) => {
            warn!("[TokenMeta] decimals() failed for {token:#x}: {e}");
            None
        }
    };
    let symbol = match rpc.call(token, SYMBOL_SELECTOR.to_vec()).await {
        Ok(bytes) => decode_string(&bytes),
        Err(_) => None,
    };
    TokenMeta {
        address: token,
        decimals,
        symbol,
        name: None,
    }
}

/// uint8 return value, right-aligned in one word.
fn decode_decimals(bytes: &[u8]) -> Option<u8> {
    if bytes.len() < 32 {
        return None;
    }
    // Anything above u8 is not a sane decimals value.
    if bytes[..31].iter().any(|b| *b != 0) {
        return None;
    }
    Some(bytes[31])
}

/// ABI string return, with the bytes32 fallback some legacy tokens use.
fn decode_string(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    if bytes.len() >= 64 {
        // Standard dynamic string: offset word, length word, data.
        let offset = usize::try_from(u64::from_be_bytes(bytes[24..32].try_into().ok()?)).ok()?;
        if offset.checked_add(32).is_some_and(|end| end <= bytes.len()) {
            let len =
                usize::try_from(u64::from_be_bytes(bytes[offset + 24..offset + 32].try_into().ok()?))
                    .ok()?;
            let start = offset + 32;
            if len > 0 && len <= 128 && start + len <= bytes.len() {
                let s = String::from_utf8_lossy(&bytes[start..start + len]);
                let trimmed = s.trim_matches(char::from(0)).trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }
    if bytes.len() == 32 {
        // bytes32 symbol (MKR-style).
        let s = String::from_utf8_lossy(bytes);
        let trimmed = s.trim_matches(char::from(0)).trim();
        if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_graphic()) {
            return Some(trimmed.to_string());
        }
    }
    None
}

/// Decimals map for every known token on a chain; the filter and the full
/// broadcast both consume this.
pub async fn load_decimals(db: &DbPool, chain: &str) -> Result<HashMap<Address, u8>> {
    let rows = sqlx::query(&format!(
        "SELECT address, decimals FROM {SCHEMA}.tokens \
         WHERE chain = $1 AND decimals IS NOT NULL"
    ))
    .bind(chain)
    .fetch_all(db)
    .await?;

    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let address: String = row.try_get("address")?;
        let decimals: i32 = row.try_get("decimals")?;
        if let (Ok(addr), Ok(d)) = (address.parse::<Address>(), u8::try_from(decimals)) {
            out.insert(addr, d);
        }
    }
    Ok(out)
}

/// Full metadata map (for the full broadcast payloads).
pub async fn load_meta(db: &DbPool, chain: &str) -> Result<HashMap<Address, TokenMeta>> {
    let rows = sqlx::query(&format!(
        "SELECT address, decimals, symbol, name FROM {SCHEMA}.tokens WHERE chain = $1"
    ))
    .bind(chain)
    .fetch_all(db)
    .await?;

    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let address: String = row.try_get("address")?;
        let Ok(addr) = address.parse::<Address>() else {
            continue;
        };
        out.insert(
            addr,
            TokenMeta {
                address: addr,
                decimals: row
                    .try_get::<Option<i32>, _>("decimals")?
                    .and_then(|d| u8::try_from(d).ok()),
                symbol: row.try_get("symbol")?,
                name: row.try_get("name")?,
            },
        );
    }
    Ok(out)
}
