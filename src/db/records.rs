//! Read-only queries over the storefront's transactional records.
//!
//! Every time bound is compared through `julianday()` so records written with
//! slightly different timestamp formats still order correctly.

use super::repo::Pool;
use crate::model::CampaignKey;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use std::collections::HashSet;
use tracing::instrument;

fn statuses_json(statuses: &[String]) -> Result<String> {
    serde_json::to_string(statuses).context("failed to encode status set")
}

/// Result bound for a window query. Ids already on the roster of `key` are
/// left out before `max` applies, so a capped campaign reaches further into
/// its window on every run instead of returning the same first page.
#[derive(Debug, Clone, Copy)]
pub struct Cap<'a> {
    pub max: i64,
    pub key: &'a CampaignKey,
}

/// Distinct buyers with a purchase in `statuses` inside `[from, until)`.
#[instrument(skip_all, fields(statuses = statuses.len()))]
pub async fn purchasers_in_window(
    pool: &Pool,
    statuses: &[String],
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    cap: Option<Cap<'_>>,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT recipient_id FROM purchases \
         WHERE status IN (SELECT value FROM json_each(?)) \
           AND julianday(purchased_at) >= julianday(?) \
           AND julianday(purchased_at) < julianday(?) \
           AND (? IS NULL OR recipient_id NOT IN \
                (SELECT recipient_id FROM roster WHERE campaign_key = ?)) \
         ORDER BY recipient_id ASC LIMIT ?",
    )
    .bind(statuses_json(statuses)?)
    .bind(from)
    .bind(until)
    .bind(cap.map(|c| c.key.as_str()))
    .bind(cap.map(|c| c.key.as_str()))
    .bind(cap.map_or(-1, |c| c.max))
    .fetch_all(pool)
    .await
    .context("purchase window query failed")?;
    Ok(ids)
}

/// Distinct followers whose follow event falls inside `[from, until)`.
#[instrument(skip_all)]
pub async fn followers_in_window(
    pool: &Pool,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    cap: Option<Cap<'_>>,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT recipient_id FROM follows \
         WHERE julianday(followed_at) >= julianday(?) \
           AND julianday(followed_at) < julianday(?) \
           AND (? IS NULL OR recipient_id NOT IN \
                (SELECT recipient_id FROM roster WHERE campaign_key = ?)) \
         ORDER BY recipient_id ASC LIMIT ?",
    )
    .bind(from)
    .bind(until)
    .bind(cap.map(|c| c.key.as_str()))
    .bind(cap.map(|c| c.key.as_str()))
    .bind(cap.map_or(-1, |c| c.max))
    .fetch_all(pool)
    .await
    .context("follow window query failed")?;
    Ok(ids)
}

/// Distinct visitors with a visit log entry inside `[from, until)`.
#[instrument(skip_all)]
pub async fn visitors_in_window(
    pool: &Pool,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    cap: Option<Cap<'_>>,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT recipient_id FROM visits \
         WHERE julianday(visited_at) >= julianday(?) \
           AND julianday(visited_at) < julianday(?) \
           AND (? IS NULL OR recipient_id NOT IN \
                (SELECT recipient_id FROM roster WHERE campaign_key = ?)) \
         ORDER BY recipient_id ASC LIMIT ?",
    )
    .bind(from)
    .bind(until)
    .bind(cap.map(|c| c.key.as_str()))
    .bind(cap.map(|c| c.key.as_str()))
    .bind(cap.map_or(-1, |c| c.max))
    .fetch_all(pool)
    .await
    .context("visit window query failed")?;
    Ok(ids)
}

/// Recipients holding `item_code` through any purchase in `statuses`.
#[instrument(skip_all, fields(item = item_code))]
pub async fn item_holders(
    pool: &Pool,
    item_code: &str,
    statuses: &[String],
) -> Result<HashSet<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT recipient_id FROM purchases \
         WHERE item_code = ? AND status IN (SELECT value FROM json_each(?))",
    )
    .bind(item_code)
    .bind(statuses_json(statuses)?)
    .fetch(pool)
    .try_collect()
    .await
    .context("item holder query failed")?;
    Ok(ids)
}

/// Recipients with a purchase in `statuses` at or after `since`.
#[instrument(skip_all)]
pub async fn purchasers_since(
    pool: &Pool,
    since: DateTime<Utc>,
    statuses: &[String],
) -> Result<HashSet<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT recipient_id FROM purchases \
         WHERE status IN (SELECT value FROM json_each(?)) \
           AND julianday(purchased_at) >= julianday(?)",
    )
    .bind(statuses_json(statuses)?)
    .bind(since)
    .fetch(pool)
    .try_collect()
    .await
    .context("recent purchaser query failed")?;
    Ok(ids)
}

/// Most recent non-blank display name from follow events.
pub async fn follow_display_name(pool: &Pool, recipient_id: &str) -> Result<Option<String>> {
    let name = sqlx::query_scalar::<_, String>(
        "SELECT display_name FROM follows \
         WHERE recipient_id = ? AND TRIM(COALESCE(display_name, '')) <> '' \
         ORDER BY julianday(followed_at) DESC LIMIT 1",
    )
    .bind(recipient_id)
    .fetch_optional(pool)
    .await?;
    Ok(name)
}

/// Most recent non-blank shipping name from purchases.
pub async fn purchase_shipping_name(pool: &Pool, recipient_id: &str) -> Result<Option<String>> {
    let name = sqlx::query_scalar::<_, String>(
        "SELECT shipping_name FROM purchases \
         WHERE recipient_id = ? AND TRIM(COALESCE(shipping_name, '')) <> '' \
         ORDER BY julianday(purchased_at) DESC LIMIT 1",
    )
    .bind(recipient_id)
    .fetch_optional(pool)
    .await?;
    Ok(name)
}

/// Most recent non-blank nickname from the visit log.
pub async fn visit_nickname(pool: &Pool, recipient_id: &str) -> Result<Option<String>> {
    let name = sqlx::query_scalar::<_, String>(
        "SELECT nickname FROM visits \
         WHERE recipient_id = ? AND TRIM(COALESCE(nickname, '')) <> '' \
         ORDER BY julianday(visited_at) DESC LIMIT 1",
    )
    .bind(recipient_id)
    .fetch_optional(pool)
    .await?;
    Ok(name)
}
