use super::model::CampaignStats;
use crate::model::{CampaignKey, RosterEntry};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;

/// Upper bound on stored `last_error` text, in characters.
pub const MAX_ERROR_LEN: usize = 500;

pub async fn init_pool(database_url: &str, timeout: Duration) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url)?;
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(timeout);
    let pool = SqlitePoolOptions::new()
        .acquire_timeout(timeout)
        .connect_with(options)
        .await
        .context("failed to open roster database")?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through unchanged.
fn prepare_sqlite_url(url: &str) -> Result<String> {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return Ok(url.to_string());
    };
    if rest.starts_with(":memory") {
        return Ok(url.to_string());
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return Ok(url.to_string());
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }
    }

    Ok(match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    })
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Bind a set of ids as a single JSON array parameter, expanded with `json_each`.
fn ids_json(ids: &[String]) -> Result<String> {
    serde_json::to_string(ids).context("failed to encode recipient ids")
}

/// Cut `text` to at most [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(text: &str) -> String {
    match text.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Insert a roster row for every id not yet present under `key`.
/// Existing rows are untouched. Returns the number of rows created.
#[instrument(skip_all, fields(campaign = %key, candidates = recipient_ids.len()))]
pub async fn reconcile(
    pool: &Pool,
    key: &CampaignKey,
    recipient_ids: &[String],
    now: DateTime<Utc>,
) -> Result<u64> {
    if recipient_ids.is_empty() {
        return Ok(0);
    }
    let res = sqlx::query(
        "INSERT OR IGNORE INTO roster (campaign_key, recipient_id, created_at) \
         SELECT ?, value, ? FROM json_each(?)",
    )
    .bind(key.as_str())
    .bind(now)
    .bind(ids_json(recipient_ids)?)
    .execute(pool)
    .await
    .context("failed to reconcile roster")?;
    Ok(res.rows_affected())
}

/// Insert a single roster row if absent. Returns true when a row was created.
#[instrument(skip_all, fields(campaign = %key))]
pub async fn ensure_single(
    pool: &Pool,
    key: &CampaignKey,
    recipient_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT OR IGNORE INTO roster (campaign_key, recipient_id, created_at) VALUES (?, ?, ?)",
    )
    .bind(key.as_str())
    .bind(recipient_id)
    .bind(now)
    .execute(pool)
    .await
    .context("failed to insert roster row")?;
    Ok(res.rows_affected() == 1)
}

/// Unsent rows for `key`, ordered by recipient id. `None` means no limit.
#[instrument(skip_all, fields(campaign = %key))]
pub async fn load_unsent(
    pool: &Pool,
    key: &CampaignKey,
    limit: Option<i64>,
) -> Result<Vec<RosterEntry>> {
    let rows = sqlx::query_as::<_, RosterEntry>(
        "SELECT campaign_key, recipient_id, created_at, sent_at, last_error FROM roster \
         WHERE campaign_key = ? AND sent_at IS NULL ORDER BY recipient_id ASC LIMIT ?",
    )
    .bind(key.as_str())
    .bind(limit.unwrap_or(-1))
    .fetch_all(pool)
    .await
    .context("failed to load unsent roster rows")?;
    Ok(rows)
}

/// Set `sent_at` and clear `last_error` for rows still unsent.
/// Rows already sent are left as they are. Returns the number of rows updated.
#[instrument(skip_all, fields(campaign = %key, recipients = recipient_ids.len()))]
pub async fn mark_sent(
    pool: &Pool,
    key: &CampaignKey,
    recipient_ids: &[String],
    now: DateTime<Utc>,
) -> Result<u64> {
    if recipient_ids.is_empty() {
        return Ok(0);
    }
    let res = sqlx::query(
        "UPDATE roster SET sent_at = ?, last_error = NULL \
         WHERE campaign_key = ? AND sent_at IS NULL \
           AND recipient_id IN (SELECT value FROM json_each(?))",
    )
    .bind(now)
    .bind(key.as_str())
    .bind(ids_json(recipient_ids)?)
    .execute(pool)
    .await
    .context("failed to mark roster rows sent")?;
    Ok(res.rows_affected())
}

/// Record `error` on unsent rows without touching `sent_at`.
#[instrument(skip_all, fields(campaign = %key, recipients = recipient_ids.len()))]
pub async fn mark_failed(
    pool: &Pool,
    key: &CampaignKey,
    recipient_ids: &[String],
    error: &str,
) -> Result<u64> {
    if recipient_ids.is_empty() {
        return Ok(0);
    }
    let res = sqlx::query(
        "UPDATE roster SET last_error = ? \
         WHERE campaign_key = ? AND sent_at IS NULL \
           AND recipient_id IN (SELECT value FROM json_each(?))",
    )
    .bind(truncate_error(error))
    .bind(key.as_str())
    .bind(ids_json(recipient_ids)?)
    .execute(pool)
    .await
    .context("failed to mark roster rows failed")?;
    Ok(res.rows_affected())
}

pub async fn fetch_entry(
    pool: &Pool,
    key: &CampaignKey,
    recipient_id: &str,
) -> Result<Option<RosterEntry>> {
    let row = sqlx::query_as::<_, RosterEntry>(
        "SELECT campaign_key, recipient_id, created_at, sent_at, last_error FROM roster \
         WHERE campaign_key = ? AND recipient_id = ?",
    )
    .bind(key.as_str())
    .bind(recipient_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Subset of `recipient_ids` that already has a row under `key`.
#[instrument(skip_all, fields(campaign = %key))]
pub async fn existing_ids(
    pool: &Pool,
    key: &CampaignKey,
    recipient_ids: &[String],
) -> Result<HashSet<String>> {
    if recipient_ids.is_empty() {
        return Ok(HashSet::new());
    }
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT recipient_id FROM roster \
         WHERE campaign_key = ? AND recipient_id IN (SELECT value FROM json_each(?))",
    )
    .bind(key.as_str())
    .bind(ids_json(recipient_ids)?)
    .fetch(pool)
    .try_collect()
    .await?;
    Ok(ids)
}

/// Recipients with a successful send under any campaign key.
#[instrument(skip_all)]
pub async fn sent_under_any(pool: &Pool) -> Result<HashSet<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT recipient_id FROM roster WHERE sent_at IS NOT NULL",
    )
    .fetch(pool)
    .try_collect()
    .await
    .context("failed to load ever-sent recipients")?;
    Ok(ids)
}

/// Recipients with a successful send under one of `keys`.
#[instrument(skip_all, fields(keys = keys.len()))]
pub async fn sent_under_keys(pool: &Pool, keys: &[CampaignKey]) -> Result<HashSet<String>> {
    if keys.is_empty() {
        return Ok(HashSet::new());
    }
    let keys: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT recipient_id FROM roster \
         WHERE sent_at IS NOT NULL AND campaign_key IN (SELECT value FROM json_each(?))",
    )
    .bind(ids_json(&keys)?)
    .fetch(pool)
    .try_collect()
    .await
    .context("failed to load recipients sent under other keys")?;
    Ok(ids)
}

pub async fn count_roster(pool: &Pool, key: &CampaignKey) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM roster WHERE campaign_key = ?")
        .bind(key.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn campaign_stats(pool: &Pool) -> Result<Vec<CampaignStats>> {
    let rows = sqlx::query_as::<_, CampaignStats>(
        "SELECT campaign_key, \
                COUNT(*) AS total, \
                SUM(CASE WHEN sent_at IS NOT NULL THEN 1 ELSE 0 END) AS sent, \
                SUM(CASE WHEN sent_at IS NULL THEN 1 ELSE 0 END) AS pending, \
                SUM(CASE WHEN sent_at IS NULL AND last_error IS NOT NULL THEN 1 ELSE 0 END) AS pending_with_error \
         FROM roster GROUP BY campaign_key ORDER BY campaign_key",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Most frequent `last_error` values among unsent rows of `key`.
pub async fn error_breakdown(
    pool: &Pool,
    key: &CampaignKey,
    limit: i64,
) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT last_error, COUNT(*) AS n FROM roster \
         WHERE campaign_key = ? AND sent_at IS NULL AND last_error IS NOT NULL \
         GROUP BY last_error ORDER BY n DESC, last_error ASC LIMIT ?",
    )
    .bind(key.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
