// Pool registry: the durable set of known pools per chain. Upserts collapse
// in-batch duplicates first (retried extractor sub-ranges can emit the same
// event twice) and commit together with the checkpoint advance so ingestion
// is lossless under crash.

use std::str::FromStr;

use ethers::types::Address;
use indexmap::IndexMap;
use log::info;
use sqlx::Row;

use crate::checkpoints;
use crate::database::{pools_table, DbPool};
use crate::error::Result;
use crate::metrics;
use crate::types::{DiscoveredPool, PoolId, Protocol};

/// Collapses duplicate pool ids; the first occurrence wins.
pub fn dedup_pools(rows: Vec<DiscoveredPool>) -> Vec<DiscoveredPool> {
    let mut unique: IndexMap<PoolId, DiscoveredPool> = IndexMap::with_capacity(rows.len());
    for row in rows {
        unique.entry(row.pool_id).or_insert(row);
    }
    unique.into_values().collect()
}

/// Upserts a decoded batch and advances the checkpoint for the same
/// (chain, protocol variant, end block) in one transaction. Returns
/// (inserted, updated).
pub async fn upsert_with_checkpoint(
    db: &DbPool,
    chain: &str,
    protocol_key: &str,
    rows: &[DiscoveredPool],
    end_block: u64,
) -> Result<(u64, u64)> {
    let table = pools_table(chain)?;
    let mut tx = db.begin().await?;

    let mut inserted = 0u64;
    let mut updated = 0u64;

    for pool in rows {
        // xmax = 0 distinguishes a fresh insert from a conflict-update.
        let row = sqlx::query(&format!(
            "INSERT INTO {table} \
             (pool_id, protocol, variant, factory, token0, token1, fee, tick_spacing, \
              stable, hooks, creation_block, was_swapped) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (pool_id) DO UPDATE SET updated_at = NOW() \
             RETURNING (xmax = 0) AS inserted"
        ))
        .bind(pool.pool_id.to_hex())
        .bind(pool.protocol.as_str())
        .bind(&pool.variant)
        .bind(format!("{:#x}", pool.factory))
        .bind(format!("{:#x}", pool.token0))
        .bind(format!("{:#x}", pool.token1))
        .bind(pool.fee.map(|f| f as i32))
        .bind(pool.tick_spacing)
        .bind(pool.stable)
        .bind(pool.hooks.map(|h| format!("{:#x}", h)))
        .bind(pool.creation_block as i64)
        .bind(pool.was_swapped)
        .fetch_one(tx.as_mut())
        .await?;

        if row.try_get::<bool, _>("inserted")? {
            inserted += 1;
        } else {
            updated += 1;
        }
    }

    checkpoints::advance_in_tx(&mut tx, chain, protocol_key, end_block).await?;
    tx.commit().await?;

    metrics::increment_pools_upserted(inserted);
    info!(
        "[Registry] {chain}/{protocol_key}: {inserted} inserted, {updated} already known, checkpoint -> {end_block}"
    );
    Ok((inserted, updated))
}

/// All known pools for a chain, ordered by creation block.
pub async fn list_pools(db: &DbPool, chain: &str) -> Result<Vec<DiscoveredPool>> {
    let table = pools_table(chain)?;
    let rows = sqlx::query(&format!(
        "SELECT pool_id, protocol, variant, factory, token0, token1, fee, tick_spacing, \
                stable, hooks, creation_block, was_swapped \
         FROM {table} ORDER BY creation_block, pool_id"
    ))
    .fetch_all(db)
    .await?;

    let mut pools = Vec::with_capacity(rows.len());
    for row in rows {
        let protocol = Protocol::parse(&row.try_get::<String, _>("protocol")?)
            .map_err(|e| crate::error::WhitelistError::StorageUnavailable(e.to_string()))?;
        let pool_id = PoolId::from_hex(&row.try_get::<String, _>("pool_id")?)
            .map_err(|e| crate::error::WhitelistError::StorageUnavailable(e.to_string()))?;

        pools.push(DiscoveredPool {
            pool_id,
            protocol,
            variant: row.try_get("variant")?,
            factory: parse_address(&row.try_get::<String, _>("factory")?)?,
            token0: parse_address(&row.try_get::<String, _>("token0")?)?,
            token1: parse_address(&row.try_get::<String, _>("token1")?)?,
            fee: row.try_get::<Option<i32>, _>("fee")?.map(|f| f as u32),
            tick_spacing: row.try_get("tick_spacing")?,
            stable: row.try_get("stable")?,
            hooks: match row.try_get::<Option<String>, _>("hooks")? {
                Some(h) => Some(parse_address(&h)?),
                None => None,
            },
            creation_block: row.try_get::<i64, _>("creation_block")? as u64,
            was_swapped: row.try_get("was_swapped")?,
        });
    }
    Ok(pools)
}

/// Tokens referenced by the registry that have no decimals recorded yet.
pub async fn tokens_needing_metadata(db: &DbPool, chain: &str) -> Result<Vec<Address>> {
    let table = pools_table(chain)?;
    let rows = sqlx::query(&format!(
        "SELECT DISTINCT t.token FROM ( \
             SELECT token0 AS token FROM {table} \
             UNION SELECT token1 AS token FROM {table} \
         ) t \
         LEFT JOIN {schema}.tokens tok ON tok.chain = $1 AND tok.address = t.token \
         WHERE tok.decimals IS NULL",
        schema = crate::database::SCHEMA,
    ))
    .bind(chain)
    .fetch_all(db)
    .await?;

    let mut tokens = Vec::with_capacity(rows.len());
    for row in rows {
        tokens.push(parse_address(&row.try_get::<String, _>("token")?)?);
    }
    Ok(tokens)
}

fn parse_address(s: &str) -> Result<Address> {
    Address::from_str(s).map_err(|e| {
        crate::error::WhitelistError::StorageUnavailable(format!("bad address '{s}' in registry: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;

    fn pool(id: u64, block: u64) -> DiscoveredPool {
        DiscoveredPool {
            pool_id: PoolId::Address(Address::from_low_u64_be(id)),
            protocol: Protocol::V2,
            variant: "uniswap_v2".to_string(),
            factory: Address::from_low_u64_be(0xfac),
            token0: Address::from_low_u64_be(1),
            token1: Address::from_low_u64_be(2),
            fee: Some(3000),
            tick_spacing: None,
            stable: None,
            hooks: None,
            creation_block: block,
            was_swapped: false,
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let first = pool(1, 100);
        let mut dup = pool(1, 100);
        dup.variant = "sushiswap_v2".to_string();

        let out = dedup_pools(vec![first.clone(), dup, pool(2, 101)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].variant, "uniswap_v2");
        assert_eq!(out[1].pool_id, PoolId::Address(Address::from_low_u64_be(2)));
    }

    #[test]
    fn dedup_preserves_input_order() {
        let out = dedup_pools(vec![pool(3, 1), pool(1, 2), pool(2, 3), pool(1, 4)]);
        let ids: Vec<_> = out.iter().map(|p| p.pool_id).collect();
        assert_eq!(
            ids,
            vec![
                PoolId::Address(Address::from_low_u64_be(3)),
                PoolId::Address(Address::from_low_u64_be(1)),
                PoolId::Address(Address::from_low_u64_be(2)),
            ]
        );
    }

    #[test]
    fn dedup_distinguishes_v4_ids_from_addresses() {
        let v4 = DiscoveredPool {
            pool_id: PoolId::Bytes32(H256::from_low_u64_be(1)),
            protocol: Protocol::V4,
            ..pool(1, 100)
        };
        let out = dedup_pools(vec![pool(1, 100), v4]);
        assert_eq!(out.len(), 2);
    }
}
