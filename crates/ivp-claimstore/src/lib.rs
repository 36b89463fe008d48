//! Durable per-document claim table. Gives each `(source_id, content_hash)`
//! exactly one active processor at a time and records its terminal outcome.
//!
//! The atomic-claim idiom (insert-if-absent inside an immediate-write
//! transaction, falling back to a conditional re-claim update) mirrors this
//! workspace's outbox-claim pattern; the backing store is a single-file
//! SQLite database per spec rather than Postgres, since the claim table has
//! no multi-tenant or networked-cluster requirement.

use anyhow::{Context, Result};
use chrono::Utc;
use ivp_schemas::{ClaimOutcome, ClaimResult, ClaimStatus, DocumentClaim};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

pub type SqlitePool = Pool<Sqlite>;

/// Connects to the claim database at `path`, creating the file and its
/// parent directory if absent.
pub async fn connect(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| format!("create_dir_all {parent:?}"))?;
        }
    }
    let url = format!("sqlite://{path}?mode=rwc");
    let opts = sqlx::sqlite::SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("parse sqlite url for {path}"))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1) // single-file SQLite: serialize writers through one connection
        .connect_with(opts)
        .await
        .with_context(|| format!("connect to claim db {path}"))?;
    Ok(pool)
}

/// In-memory pool, used by tests and by callers that want an ephemeral store.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("connect to in-memory claim db")?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await.context("run claim store migrations")?;
    Ok(())
}

fn row_to_claim(row: SqliteRow) -> Result<DocumentClaim> {
    let status_raw: String = row.try_get("status").context("decode status")?;
    let status = ClaimStatus::parse(&status_raw)
        .with_context(|| format!("unknown claim status in db: {status_raw}"))?;
    Ok(DocumentClaim {
        source_id: row.try_get("source_id").context("decode source_id")?,
        content_hash: row.try_get("content_hash").context("decode content_hash")?,
        status,
        owner_id: row.try_get("owner_id").context("decode owner_id")?,
        claimed_at: row.try_get("claimed_at_utc").context("decode claimed_at_utc")?,
        updated_at: row.try_get("updated_at_utc").context("decode updated_at_utc")?,
    })
}

/// Attempts to acquire exclusive ownership of `(source_id, content_hash)`
/// for `owner_id`.
pub async fn claim(pool: &SqlitePool, source_id: &str, content_hash: &str, owner_id: &str) -> Result<ClaimResult> {
    let mut conn = pool.acquire().await.context("acquire claim store connection")?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await.context("begin immediate")?;

    let now = Utc::now();
    let insert = sqlx::query(
        "INSERT INTO document_claims (source_id, content_hash, status, owner_id, claimed_at_utc, updated_at_utc)
         VALUES (?1, ?2, 'CLAIMED', ?3, ?4, ?4)
         ON CONFLICT(source_id, content_hash) DO NOTHING",
    )
    .bind(source_id)
    .bind(content_hash)
    .bind(owner_id)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("insert-if-absent claim row")?;

    if insert.rows_affected() == 1 {
        sqlx::query("COMMIT").execute(&mut *conn).await.context("commit claim insert")?;
        return Ok(ClaimResult {
            status: ClaimOutcome::Claimed,
            source_id: source_id.to_string(),
            content_hash: content_hash.to_string(),
            owner_id: Some(owner_id.to_string()),
        });
    }

    let existing = sqlx::query("SELECT status, owner_id FROM document_claims WHERE source_id = ?1 AND content_hash = ?2")
        .bind(source_id)
        .bind(content_hash)
        .fetch_one(&mut *conn)
        .await
        .context("read existing claim row")?;
    let existing_status: String = existing.try_get("status").context("decode existing status")?;
    let existing_owner: Option<String> = existing.try_get("owner_id").context("decode existing owner")?;

    if matches!(existing_status.as_str(), "FAILED" | "REVIEW_REQUIRED") {
        sqlx::query(
            "UPDATE document_claims SET status = 'CLAIMED', owner_id = ?1, updated_at_utc = ?2
             WHERE source_id = ?3 AND content_hash = ?4",
        )
        .bind(owner_id)
        .bind(now)
        .bind(source_id)
        .bind(content_hash)
        .execute(&mut *conn)
        .await
        .context("reclaim failed/review_required row")?;
        sqlx::query("COMMIT").execute(&mut *conn).await.context("commit reclaim")?;
        return Ok(ClaimResult {
            status: ClaimOutcome::Claimed,
            source_id: source_id.to_string(),
            content_hash: content_hash.to_string(),
            owner_id: Some(owner_id.to_string()),
        });
    }

    sqlx::query("COMMIT").execute(&mut *conn).await.context("commit no-op read")?;

    let outcome = if matches!(existing_status.as_str(), "STORED" | "ARCHIVED") {
        ClaimOutcome::AlreadyProcessed
    } else {
        ClaimOutcome::AlreadyClaimed
    };

    Ok(ClaimResult {
        status: outcome,
        source_id: source_id.to_string(),
        content_hash: content_hash.to_string(),
        owner_id: existing_owner,
    })
}

/// Unconditionally updates the row's status. Callers are responsible for
/// only requesting state-machine-legal transitions (see `ivp-statemachine`).
pub async fn mark_status(pool: &SqlitePool, source_id: &str, content_hash: &str, new_status: ClaimStatus) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "UPDATE document_claims SET status = ?1, updated_at_utc = ?2 WHERE source_id = ?3 AND content_hash = ?4",
    )
    .bind(new_status.as_str())
    .bind(now)
    .bind(source_id)
    .bind(content_hash)
    .execute(pool)
    .await
    .context("mark_status update")?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, source_id: &str, content_hash: &str) -> Result<Option<DocumentClaim>> {
    let row = sqlx::query("SELECT * FROM document_claims WHERE source_id = ?1 AND content_hash = ?2")
        .bind(source_id)
        .bind(content_hash)
        .fetch_optional(pool)
        .await
        .context("fetch claim row")?;
    row.map(row_to_claim).transpose()
}

/// Count of rows per status, used by the monitoring API's status endpoint.
pub async fn counts_by_status(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query("SELECT status, COUNT(*) as n FROM document_claims GROUP BY status")
        .fetch_all(pool)
        .await
        .context("count claims by status")?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let status: String = row.try_get("status").context("decode status")?;
        let n: i64 = row.try_get("n").context("decode count")?;
        out.push((status, n));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn fresh_store() -> SqlitePool {
        let pool = connect_in_memory().await.unwrap();
        migrate(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn first_claim_succeeds() {
        let pool = fresh_store().await;
        let r = claim(&pool, "file-1", "hash-1", "worker-a").await.unwrap();
        assert_eq!(r.status, ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn second_claim_of_same_key_is_already_claimed() {
        let pool = fresh_store().await;
        claim(&pool, "file-1", "hash-1", "worker-a").await.unwrap();
        let r = claim(&pool, "file-1", "hash-1", "worker-b").await.unwrap();
        assert_eq!(r.status, ClaimOutcome::AlreadyClaimed);
    }

    #[tokio::test]
    async fn stored_documents_are_already_processed() {
        let pool = fresh_store().await;
        claim(&pool, "file-1", "hash-1", "worker-a").await.unwrap();
        mark_status(&pool, "file-1", "hash-1", ClaimStatus::Extracted).await.unwrap();
        mark_status(&pool, "file-1", "hash-1", ClaimStatus::Validated).await.unwrap();
        mark_status(&pool, "file-1", "hash-1", ClaimStatus::Stored).await.unwrap();

        let r = claim(&pool, "file-1", "hash-1", "worker-b").await.unwrap();
        assert_eq!(r.status, ClaimOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn failed_documents_can_be_reclaimed() {
        let pool = fresh_store().await;
        claim(&pool, "file-1", "hash-1", "worker-a").await.unwrap();
        mark_status(&pool, "file-1", "hash-1", ClaimStatus::Failed).await.unwrap();

        let r = claim(&pool, "file-1", "hash-1", "replay-worker").await.unwrap();
        assert_eq!(r.status, ClaimOutcome::Claimed);
        assert_eq!(r.owner_id.as_deref(), Some("replay-worker"));
    }

    #[tokio::test]
    async fn review_required_documents_can_be_reclaimed() {
        let pool = fresh_store().await;
        claim(&pool, "file-1", "hash-1", "worker-a").await.unwrap();
        mark_status(&pool, "file-1", "hash-1", ClaimStatus::Extracted).await.unwrap();
        mark_status(&pool, "file-1", "hash-1", ClaimStatus::ReviewRequired).await.unwrap();

        let r = claim(&pool, "file-1", "hash-1", "replay-worker").await.unwrap();
        assert_eq!(r.status, ClaimOutcome::Claimed);
    }

    /// Six concurrent callers claim the same key; exactly one sees `claimed`.
    #[tokio::test]
    async fn six_concurrent_claimants_exactly_one_wins() {
        let pool = Arc::new(fresh_store().await);
        let mut handles = Vec::new();
        for i in 0..6 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                claim(&pool, "file-2", "hash-2", &format!("worker-{i}")).await.unwrap()
            }));
        }
        let mut claimed = 0;
        let mut already_claimed = 0;
        for h in handles {
            match h.await.unwrap().status {
                ClaimOutcome::Claimed => claimed += 1,
                ClaimOutcome::AlreadyClaimed => already_claimed += 1,
                ClaimOutcome::AlreadyProcessed => panic!("unexpected already_processed"),
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(already_claimed, 5);
    }
}
