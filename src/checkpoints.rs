// Checkpoint store: last safely-processed end block per (chain, protocol
// variant). A checkpoint only moves forward, and only inside the same
// transaction that durably records the corresponding events (see
// `pool_registry::upsert_with_checkpoint`).

use sqlx::{Postgres, Row, Transaction};

use crate::database::{DbPool, SCHEMA};
use crate::error::{Result, WhitelistError};

/// Current checkpoint, or None if this (chain, protocol) has never ingested.
pub async fn get(pool: &DbPool, chain: &str, protocol: &str) -> Result<Option<u64>> {
    let row = sqlx::query(&format!(
        "SELECT last_end_block FROM {SCHEMA}.checkpoints WHERE chain = $1 AND protocol = $2"
    ))
    .bind(chain)
    .bind(protocol)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some(row) => Some(row.try_get::<i64, _>("last_end_block")? as u64),
        None => None,
    })
}

/// The monotonicity guard, separated out so it can be tested without a
/// database.
pub fn validate_advance(
    chain: &str,
    protocol: &str,
    current: Option<u64>,
    new_end: u64,
) -> Result<()> {
    if let Some(current) = current {
        if new_end < current {
            return Err(WhitelistError::CheckpointRegression {
                chain: chain.to_string(),
                protocol: protocol.to_string(),
                current,
                requested: new_end,
            });
        }
    }
    Ok(())
}

/// Advances the checkpoint inside an open transaction. The row is locked
/// first so two writers cannot interleave a read-check-write.
pub async fn advance_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    chain: &str,
    protocol: &str,
    new_end: u64,
) -> Result<()> {
    let row = sqlx::query(&format!(
        "SELECT last_end_block FROM {SCHEMA}.checkpoints \
         WHERE chain = $1 AND protocol = $2 FOR UPDATE"
    ))
    .bind(chain)
    .bind(protocol)
    .fetch_optional(tx.as_mut())
    .await?;

    let current = match row {
        Some(row) => Some(row.try_get::<i64, _>("last_end_block")? as u64),
        None => None,
    };
    validate_advance(chain, protocol, current, new_end)?;

    sqlx::query(&format!(
        "INSERT INTO {SCHEMA}.checkpoints (chain, protocol, last_end_block, updated_at) \
         VALUES ($1, $2, $3, NOW()) \
         ON CONFLICT (chain, protocol) \
         DO UPDATE SET last_end_block = EXCLUDED.last_end_block, updated_at = NOW()"
    ))
    .bind(chain)
    .bind(protocol)
    .bind(new_end as i64)
    .execute(tx.as_mut())
    .await?;

    Ok(())
}

/// Standalone advance in its own transaction. The ingest path never uses
/// this; it exists for operator tooling.
pub async fn advance(pool: &DbPool, chain: &str, protocol: &str, new_end: u64) -> Result<()> {
    let mut tx = pool.begin().await?;
    advance_in_tx(&mut tx, chain, protocol, new_end).await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_advance_always_allowed() {
        assert!(validate_advance("ethereum", "uniswap_v2", None, 0).is_ok());
        assert!(validate_advance("ethereum", "uniswap_v2", None, 20_000_000).is_ok());
    }

    #[test]
    fn equal_or_forward_allowed() {
        assert!(validate_advance("ethereum", "uniswap_v3", Some(100), 100).is_ok());
        assert!(validate_advance("ethereum", "uniswap_v3", Some(100), 101).is_ok());
    }

    #[test]
    fn regression_rejected() {
        let err = validate_advance("ethereum", "uniswap_v3", Some(100), 99).unwrap_err();
        match err {
            WhitelistError::CheckpointRegression {
                current, requested, ..
            } => {
                assert_eq!(current, 100);
                assert_eq!(requested, 99);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
