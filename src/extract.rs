//! Candidate extraction: who qualifies for a campaign's window.
use crate::config::{ConfigError, DEFAULT_NAME};
use crate::db::{records, Pool};
use crate::model::{CampaignKey, Source, Window};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("record query failed: {0:#}")]
    Query(#[from] anyhow::Error),
}

/// Deduplicated recipient ids whose qualifying event falls inside `window`
/// relative to `now`, ordered by id. With a `cap`, ids already on `key`'s
/// roster are skipped and at most `cap` new ones are returned.
#[instrument(skip_all, fields(campaign = %key, source = source.as_str()))]
pub async fn extract_candidates(
    pool: &Pool,
    key: &CampaignKey,
    source: &Source,
    window: Window,
    cap: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Vec<String>, ExtractError> {
    window.validate()?;
    if matches!(cap, Some(c) if c <= 0) {
        return Err(ConfigError::Invalid("candidate cap must be > 0".into()).into());
    }
    let (from, until) = window.bounds(now)?;
    let cap = cap.map(|max| records::Cap { max, key });
    let ids = match source {
        Source::Purchases { statuses } => {
            if statuses.is_empty() {
                return Err(ConfigError::Invalid("purchase source needs statuses".into()).into());
            }
            records::purchasers_in_window(pool, statuses, from, until, cap).await?
        }
        Source::Follows => records::followers_in_window(pool, from, until, cap).await?,
        Source::Visits => records::visitors_in_window(pool, from, until, cap).await?,
    };
    info!(%from, %until, found = ids.len(), "candidates extracted");
    Ok(ids)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameSource {
    Follows,
    Purchases,
    Visits,
}

/// Lookup order: the campaign's own source first, then the rest.
fn name_chain(source: &Source) -> [NameSource; 3] {
    match source {
        Source::Follows => [NameSource::Follows, NameSource::Purchases, NameSource::Visits],
        Source::Purchases { .. } => {
            [NameSource::Purchases, NameSource::Follows, NameSource::Visits]
        }
        Source::Visits => [NameSource::Visits, NameSource::Follows, NameSource::Purchases],
    }
}

/// Resolve a display name for one recipient. Never fails: lookup errors are
/// logged and skipped, and `default_name` (or the built-in placeholder) is
/// returned when nothing resolves.
#[instrument(skip_all)]
pub async fn resolve_display_name(
    pool: &Pool,
    recipient_id: &str,
    source: &Source,
    default_name: &str,
) -> String {
    for step in name_chain(source) {
        let found = match step {
            NameSource::Follows => records::follow_display_name(pool, recipient_id).await,
            NameSource::Purchases => records::purchase_shipping_name(pool, recipient_id).await,
            NameSource::Visits => records::visit_nickname(pool, recipient_id).await,
        };
        match found {
            Ok(Some(name)) if !name.trim().is_empty() => return name.trim().to_string(),
            Ok(_) => {}
            Err(err) => warn!(?err, ?step, "display name lookup failed"),
        }
    }
    let fallback = default_name.trim();
    if fallback.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        fallback.to_string()
    }
}
