use crate::config::ConfigError;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider-side user identifier shape: `U` followed by 32 lowercase hex digits.
static RECIPIENT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^U[0-9a-f]{32}$").expect("valid recipient id regex"));

static CAMPAIGN_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-]{1,64}$").expect("valid campaign key regex"));

/// Largest day offset accepted anywhere in campaign configuration.
pub const MAX_DAYS_AGO: u32 = 36_500;

/// `now` minus `days` whole days, or an error when the offset is out of range.
pub fn days_before(now: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>, ConfigError> {
    if days > MAX_DAYS_AGO {
        return Err(ConfigError::Invalid(format!(
            "day offset {days} exceeds the maximum of {MAX_DAYS_AGO}"
        )));
    }
    now.checked_sub_signed(Duration::days(i64::from(days)))
        .ok_or_else(|| ConfigError::Invalid(format!("{days} days before {now} is out of range")))
}

pub fn is_valid_recipient_id(id: &str) -> bool {
    RECIPIENT_ID_RE.is_match(id)
}

/// Identifies one repeatable broadcast. Each key owns an independent ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CampaignKey(String);

impl CampaignKey {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        if !CAMPAIGN_KEY_RE.is_match(trimmed) {
            return Err(ConfigError::Invalid(format!(
                "campaign key {raw:?} must be 1-64 chars of [A-Za-z0-9_-]"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CampaignKey {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CampaignKey::parse(&value)
    }
}

impl From<CampaignKey> for String {
    fn from(key: CampaignKey) -> Self {
        key.0
    }
}

impl fmt::Display for CampaignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Eligibility window expressed in whole days before the run instant.
/// Covers the half-open range `[now - start_days_ago, now - end_days_ago)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Window {
    pub start_days_ago: u32,
    pub end_days_ago: u32,
}

impl Window {
    pub fn new(start_days_ago: u32, end_days_ago: u32) -> Result<Self, ConfigError> {
        let window = Self {
            start_days_ago,
            end_days_ago,
        };
        window.validate()?;
        Ok(window)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_days_ago > MAX_DAYS_AGO {
            return Err(ConfigError::Invalid(format!(
                "window.start_days_ago ({}) must be at most {MAX_DAYS_AGO}",
                self.start_days_ago
            )));
        }
        if self.start_days_ago <= self.end_days_ago {
            return Err(ConfigError::Invalid(format!(
                "window.start_days_ago ({}) must be greater than window.end_days_ago ({})",
                self.start_days_ago, self.end_days_ago
            )));
        }
        Ok(())
    }

    /// Inclusive lower bound and exclusive upper bound relative to `now`.
    pub fn bounds(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), ConfigError> {
        Ok((
            days_before(now, self.start_days_ago)?,
            days_before(now, self.end_days_ago)?,
        ))
    }
}

/// Which transactional record set qualifies a recipient for a campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Source {
    /// Purchases whose status is one of `statuses`, timed by `purchased_at`.
    Purchases { statuses: Vec<String> },
    /// Channel follow events, timed by `followed_at`.
    Follows,
    /// Storefront visit log, timed by `visited_at`.
    Visits,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Purchases { .. } => "purchases",
            Source::Follows => "follows",
            Source::Visits => "visits",
        }
    }
}

/// Record-based rule removing recipients from an otherwise eligible audience.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainExclusion {
    /// Already bought `item_code` (any purchase in one of `statuses`).
    HoldsItem {
        item_code: String,
        statuses: Vec<String>,
    },
    /// Completed a purchase in one of `statuses` within the last `days` days.
    PurchasedWithin { days: u32, statuses: Vec<String> },
}

impl DomainExclusion {
    pub fn reason(&self) -> String {
        match self {
            DomainExclusion::HoldsItem { item_code, .. } => {
                format!("excluded: already holds item {item_code}")
            }
            DomainExclusion::PurchasedWithin { days, .. } => {
                format!("excluded: purchased within last {days} days")
            }
        }
    }
}

/// One row of the delivery ledger.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, PartialEq, Eq)]
pub struct RosterEntry {
    pub campaign_key: String,
    pub recipient_id: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RosterEntry {
    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }
}
