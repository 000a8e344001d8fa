use std::env;
use std::time::Duration;

use log::{info, warn};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};

use crate::error::{Result, WhitelistError};

/// PostgreSQL connection pool type alias.
pub type DbPool = Pool<Postgres>;

/// Database schema name.
pub const SCHEMA: &str = "whitelist";

/// Per-chain pool registry table. Chain names are restricted to
/// `[a-z0-9_]` so they can be spliced into identifiers.
pub fn pools_table(chain: &str) -> Result<String> {
    validate_chain_name(chain)?;
    Ok(format!("{SCHEMA}.pools_{chain}"))
}

pub fn validate_chain_name(chain: &str) -> Result<()> {
    if chain.is_empty()
        || !chain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(WhitelistError::ConfigInvalid(format!(
            "chain name '{chain}' must be lowercase [a-z0-9_]"
        )));
    }
    Ok(())
}

pub async fn connect() -> Result<DbPool> {
    let database_url = env::var("DATABASE_URL")
        .map_err(|_| WhitelistError::ConfigInvalid("DATABASE_URL must be set".to_string()))?;

    // Retries with exponential backoff to survive DNS/startup races in
    // Compose deployments.
    let mut last_err: Option<WhitelistError> = None;
    let max_attempts: u32 = 10;
    for attempt in 1..=max_attempts {
        match PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&database_url)
            .await
        {
            Ok(pool) => {
                info!(
                    "[Db] Connected to database (attempt {}/{})",
                    attempt, max_attempts
                );
                return Ok(pool);
            }
            Err(e) => {
                last_err = Some(e.into());
            }
        }
        let delay_ms = (1u64 << attempt.min(6)) * 200; // 400ms doubling, capped ~12.8s
        warn!(
            "[Db] Connect attempt {}/{} failed, retrying in {} ms",
            attempt, max_attempts, delay_ms
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Err(last_err
        .unwrap_or_else(|| WhitelistError::StorageUnavailable("unknown connect error".into())))
}

/// Creates the schema and all tables if they are missing. Safe to run
/// concurrently: the whole initialization happens under an advisory
/// transaction lock.
pub async fn initialize_database(pool: &DbPool, chains: &[String]) -> Result<()> {
    const MIGRATION_LOCK_ID: i64 = 0x57484954454C5354; // "WHITELST"

    for chain in chains {
        validate_chain_name(chain)?;
    }

    let mut tx = pool.begin().await?;

    info!("[Db] Acquiring migration lock...");
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(tx.as_mut())
        .await?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {SCHEMA}"))
        .execute(tx.as_mut())
        .await?;

    // Token metadata, keyed by (chain, address). Decimals stay NULL until
    // enrichment succeeds.
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {SCHEMA}.tokens (
            chain VARCHAR(32) NOT NULL,
            address VARCHAR(42) NOT NULL,
            decimals INTEGER,
            symbol VARCHAR(64),
            name VARCHAR(128),
            created_at TIMESTAMPTZ DEFAULT NOW(),
            updated_at TIMESTAMPTZ DEFAULT NOW(),
            PRIMARY KEY (chain, address)
        )"
    ))
    .execute(tx.as_mut())
    .await?;

    // One pool registry table per configured chain.
    for chain in chains {
        let table = format!("{SCHEMA}.pools_{chain}");
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                pool_id VARCHAR(66) PRIMARY KEY,
                protocol VARCHAR(4) NOT NULL,
                variant VARCHAR(50) NOT NULL,
                factory VARCHAR(42) NOT NULL,
                token0 VARCHAR(42) NOT NULL,
                token1 VARCHAR(42) NOT NULL,
                fee INTEGER,
                tick_spacing INTEGER,
                stable BOOLEAN,
                hooks VARCHAR(42),
                creation_block BIGINT NOT NULL,
                was_swapped BOOLEAN NOT NULL DEFAULT false,
                created_at TIMESTAMPTZ DEFAULT NOW(),
                updated_at TIMESTAMPTZ DEFAULT NOW()
            )"
        ))
        .execute(tx.as_mut())
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_pools_{chain}_protocol ON {table} (protocol)"
        ))
        .execute(tx.as_mut())
        .await?;
    }

    // Last safely-processed end block per (chain, protocol variant).
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {SCHEMA}.checkpoints (
            chain VARCHAR(32) NOT NULL,
            protocol VARCHAR(50) NOT NULL,
            last_end_block BIGINT NOT NULL,
            updated_at TIMESTAMPTZ DEFAULT NOW(),
            PRIMARY KEY (chain, protocol)
        )"
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {SCHEMA}.whitelist_snapshot_headers (
            snapshot_id UUID PRIMARY KEY,
            chain VARCHAR(32) NOT NULL,
            kind VARCHAR(12) NOT NULL,
            reference_block BIGINT NOT NULL,
            total_pools INTEGER NOT NULL,
            added INTEGER NOT NULL,
            removed INTEGER NOT NULL,
            published_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_snapshot_headers_chain \
         ON {SCHEMA}.whitelist_snapshot_headers (chain, published_at DESC)"
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {SCHEMA}.whitelist_snapshots (
            snapshot_id UUID NOT NULL,
            chain VARCHAR(32) NOT NULL,
            pool_id VARCHAR(66) NOT NULL,
            PRIMARY KEY (snapshot_id, chain, pool_id)
        )"
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {SCHEMA}.trusted_tokens (
            chain VARCHAR(32) NOT NULL,
            address VARCHAR(42) NOT NULL,
            symbol VARCHAR(64),
            PRIMARY KEY (chain, address)
        )"
    ))
    .execute(tx.as_mut())
    .await?;

    // Telemetry; written only when telemetry.persist_batch_reports is on.
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {SCHEMA}.batch_reports (
            id BIGSERIAL PRIMARY KEY,
            chain VARCHAR(32) NOT NULL,
            batch_number INTEGER NOT NULL,
            total_batches INTEGER NOT NULL,
            protocol VARCHAR(16) NOT NULL,
            reference_block BIGINT NOT NULL,
            reference_timestamp TIMESTAMPTZ NOT NULL,
            pools_scraped INTEGER NOT NULL,
            duration_ms BIGINT NOT NULL,
            success BOOLEAN NOT NULL,
            error TEXT,
            created_at TIMESTAMPTZ DEFAULT NOW()
        )"
    ))
    .execute(tx.as_mut())
    .await?;

    tx.commit().await?;
    info!("[Db] Schema ready ({} chains)", chains.len());
    Ok(())
}

/// Trusted-token set for a chain, merged from the database table and the
/// static config list by the caller.
pub async fn load_trusted_tokens(pool: &DbPool, chain: &str) -> Result<Vec<String>> {
    validate_chain_name(chain)?;
    let rows = sqlx::query(&format!(
        "SELECT address FROM {SCHEMA}.trusted_tokens WHERE chain = $1"
    ))
    .bind(chain)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(row.try_get::<String, _>("address")?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_names_are_identifier_safe() {
        assert!(validate_chain_name("ethereum").is_ok());
        assert!(validate_chain_name("base").is_ok());
        assert!(validate_chain_name("arbitrum_one").is_ok());
        assert!(validate_chain_name("Ethereum").is_err());
        assert!(validate_chain_name("eth-mainnet").is_err());
        assert!(validate_chain_name("eth; DROP TABLE").is_err());
        assert!(validate_chain_name("").is_err());
    }

    #[test]
    fn pools_table_name() {
        assert_eq!(pools_table("ethereum").unwrap(), "whitelist.pools_ethereum");
        assert!(pools_table("bad-chain").is_err());
    }
}
