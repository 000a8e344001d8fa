// Snapshot differ and history store. Every cycle records a snapshot (header
// row + one row per member pool) even when nothing changed; broadcasts are
// the caller's concern. The first snapshot for a chain is full, every later
// one is differential against the last published.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use log::{info, warn};
use sqlx::Row;
use uuid::Uuid;

use crate::database::{DbPool, SCHEMA};
use crate::error::{Result, WhitelistError};
use crate::types::{BatchReport, PoolId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Full,
    Differential,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Full => "full",
            SnapshotKind::Differential => "differential",
        }
    }
}

/// Membership delta between the previous snapshot and the new candidate set.
#[derive(Debug, Clone)]
pub struct SnapshotDiff {
    pub kind: SnapshotKind,
    pub added: Vec<PoolId>,
    pub removed: Vec<PoolId>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Pure set diff. Kind is `Full` iff there is no previous snapshot.
pub fn diff(previous: Option<&BTreeSet<PoolId>>, new_set: &BTreeSet<PoolId>) -> SnapshotDiff {
    match previous {
        None => SnapshotDiff {
            kind: SnapshotKind::Full,
            added: new_set.iter().copied().collect(),
            removed: Vec::new(),
        },
        Some(previous) => SnapshotDiff {
            kind: SnapshotKind::Differential,
            added: new_set.difference(previous).copied().collect(),
            removed: previous.difference(new_set).copied().collect(),
        },
    }
}

/// Members of the most recently published snapshot for a chain.
pub async fn last_snapshot(
    db: &DbPool,
    chain: &str,
) -> Result<Option<(Uuid, BTreeSet<PoolId>)>> {
    let header = sqlx::query(&format!(
        "SELECT snapshot_id FROM {SCHEMA}.whitelist_snapshot_headers \
         WHERE chain = $1 ORDER BY published_at DESC LIMIT 1"
    ))
    .bind(chain)
    .fetch_optional(db)
    .await?;

    let Some(header) = header else {
        return Ok(None);
    };
    let snapshot_id: Uuid = header.try_get("snapshot_id")?;

    let rows = sqlx::query(&format!(
        "SELECT pool_id FROM {SCHEMA}.whitelist_snapshots \
         WHERE snapshot_id = $1 AND chain = $2"
    ))
    .bind(snapshot_id)
    .bind(chain)
    .fetch_all(db)
    .await?;

    let mut members = BTreeSet::new();
    for row in rows {
        let raw: String = row.try_get("pool_id")?;
        members.insert(
            PoolId::from_hex(&raw)
                .map_err(|e| WhitelistError::StorageUnavailable(e.to_string()))?,
        );
    }
    Ok(Some((snapshot_id, members)))
}

/// Persists a snapshot atomically: header plus one row per member. A
/// serialization conflict is retried once; conflicting twice means another
/// cycle is writing the same chain, which violates the per-chain lock and
/// surfaces as `SnapshotConflict`.
pub async fn persist_snapshot(
    db: &DbPool,
    chain: &str,
    snapshot_id: Uuid,
    snapshot_diff: &SnapshotDiff,
    reference_block: u64,
    members: &BTreeSet<PoolId>,
    published_at: DateTime<Utc>,
) -> Result<()> {
    match try_persist(
        db,
        chain,
        snapshot_id,
        snapshot_diff,
        reference_block,
        members,
        published_at,
    )
    .await
    {
        Ok(()) => Ok(()),
        Err(e) if is_serialization_conflict(&e) => {
            warn!("[Snapshots] Serialization conflict on {chain}, retrying once");
            match try_persist(
                db,
                chain,
                snapshot_id,
                snapshot_diff,
                reference_block,
                members,
                published_at,
            )
            .await
            {
                Ok(()) => Ok(()),
                Err(e2) if is_serialization_conflict(&e2) => {
                    Err(WhitelistError::SnapshotConflict(format!(
                        "snapshot write for {chain} conflicted twice: {e2}"
                    )))
                }
                Err(e2) => Err(e2.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

async fn try_persist(
    db: &DbPool,
    chain: &str,
    snapshot_id: Uuid,
    snapshot_diff: &SnapshotDiff,
    reference_block: u64,
    members: &BTreeSet<PoolId>,
    published_at: DateTime<Utc>,
) -> std::result::Result<(), sqlx::Error> {
    let mut tx = db.begin().await?;

    sqlx::query(&format!(
        "INSERT INTO {SCHEMA}.whitelist_snapshot_headers \
         (snapshot_id, chain, kind, reference_block, total_pools, added, removed, published_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
    ))
    .bind(snapshot_id)
    .bind(chain)
    .bind(snapshot_diff.kind.as_str())
    .bind(reference_block as i64)
    .bind(members.len() as i32)
    .bind(snapshot_diff.added.len() as i32)
    .bind(snapshot_diff.removed.len() as i32)
    .bind(published_at)
    .execute(tx.as_mut())
    .await?;

    for pool_id in members {
        sqlx::query(&format!(
            "INSERT INTO {SCHEMA}.whitelist_snapshots (snapshot_id, chain, pool_id) \
             VALUES ($1, $2, $3)"
        ))
        .bind(snapshot_id)
        .bind(chain)
        .bind(pool_id.to_hex())
        .execute(tx.as_mut())
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

fn is_serialization_conflict(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("40001"))
}

/// Telemetry: batch reports for one cycle, plus the config-driven retention
/// delete.
pub async fn persist_batch_reports(
    db: &DbPool,
    chain: &str,
    reports: &[BatchReport],
    retention_days: u32,
) -> Result<()> {
    let mut tx = db.begin().await?;
    for report in reports {
        sqlx::query(&format!(
            "INSERT INTO {SCHEMA}.batch_reports \
             (chain, batch_number, total_batches, protocol, reference_block, \
              reference_timestamp, pools_scraped, duration_ms, success, error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(chain)
        .bind(report.batch_number as i32)
        .bind(report.total_batches as i32)
        .bind(report.protocol.as_str())
        .bind(report.reference_block as i64)
        .bind(report.reference_timestamp)
        .bind(report.pools_scraped as i32)
        .bind(report.duration.as_millis() as i64)
        .bind(report.success)
        .bind(&report.error)
        .execute(tx.as_mut())
        .await?;
    }

    if retention_days > 0 {
        let deleted = sqlx::query(&format!(
            "DELETE FROM {SCHEMA}.batch_reports \
             WHERE chain = $1 AND created_at < NOW() - make_interval(days => $2)"
        ))
        .bind(chain)
        .bind(retention_days as i32)
        .execute(tx.as_mut())
        .await?;
        if deleted.rows_affected() > 0 {
            info!(
                "[Snapshots] Pruned {} batch reports older than {retention_days}d",
                deleted.rows_affected()
            );
        }
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;
    use std::str::FromStr;

    fn id(hex: &str) -> PoolId {
        PoolId::Address(Address::from_str(hex).unwrap())
    }

    fn set(ids: &[PoolId]) -> BTreeSet<PoolId> {
        ids.iter().copied().collect()
    }

    // The pools from the first-publish scenario.
    fn pool_a() -> PoolId {
        id("0x88e6A0c2dDD26FEEb64F039a2c41296FcB3f5640")
    }
    fn pool_b() -> PoolId {
        id("0x8ad599c3A0ff1De082011EFDDc58f1908eb6e6D8")
    }
    fn pool_c() -> PoolId {
        id("0xcbcdf9626bc03e24f779434178a73a0b4bad62ed")
    }
    fn pool_d() -> PoolId {
        id("0x4e68Ccd3E89f51C3074ca5072bbAC773960dFa36")
    }
    fn pool_e() -> PoolId {
        id("0x11b815efB8f581194ae79006d24E0d814B7697F6")
    }

    fn apply(previous: &BTreeSet<PoolId>, d: &SnapshotDiff) -> BTreeSet<PoolId> {
        let mut out = previous.clone();
        for added in &d.added {
            out.insert(*added);
        }
        for removed in &d.removed {
            out.remove(removed);
        }
        out
    }

    #[test]
    fn first_publish_is_full() {
        let new_set = set(&[pool_a(), pool_b(), pool_c()]);
        let d = diff(None, &new_set);
        assert_eq!(d.kind, SnapshotKind::Full);
        assert_eq!(d.added.len(), 3);
        assert!(d.removed.is_empty());
    }

    #[test]
    fn second_publish_is_differential() {
        let previous = set(&[pool_a(), pool_b(), pool_c()]);
        let new_set = set(&[pool_a(), pool_b(), pool_d(), pool_e()]);
        let d = diff(Some(&previous), &new_set);
        assert_eq!(d.kind, SnapshotKind::Differential);
        assert_eq!(set(&d.added), set(&[pool_d(), pool_e()]));
        assert_eq!(set(&d.removed), set(&[pool_c()]));
        assert_eq!(new_set.len(), 4);
    }

    #[test]
    fn identical_sets_give_empty_differential() {
        let previous = set(&[pool_a(), pool_b(), pool_d(), pool_e()]);
        let d = diff(Some(&previous), &previous.clone());
        assert_eq!(d.kind, SnapshotKind::Differential);
        assert!(d.is_empty());
    }

    #[test]
    fn diff_law_applying_delta_recovers_new_set() {
        let previous = set(&[pool_a(), pool_b(), pool_c()]);
        let new_set = set(&[pool_b(), pool_d(), pool_e()]);
        let d = diff(Some(&previous), &new_set);
        assert_eq!(apply(&previous, &d), new_set);

        // Round trip: full snapshot then diff equals direct diff.
        let full = diff(None, &previous);
        let recovered = apply(&BTreeSet::new(), &full);
        assert_eq!(recovered, previous);
        let d2 = diff(Some(&recovered), &new_set);
        assert_eq!(set(&d2.added), set(&d.added));
        assert_eq!(set(&d2.removed), set(&d.removed));
    }

    #[test]
    fn empty_new_set_removes_everything() {
        let previous = set(&[pool_a(), pool_b()]);
        let d = diff(Some(&previous), &BTreeSet::new());
        assert!(d.added.is_empty());
        assert_eq!(d.removed.len(), 2);
        assert!(apply(&previous, &d).is_empty());
    }
}
