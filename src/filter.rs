//! Eligibility filter pipeline.
//!
//! Exclusion data is gathered once per run into an [`ExclusionSets`] value and
//! passed explicitly to [`apply`]; nothing is cached beyond the run.
//! [`apply`] itself is pure: it decides, the runner records.

use crate::db::{self, records, Pool};
use crate::model::{days_before, is_valid_recipient_id, CampaignKey, DomainExclusion};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, instrument};

pub const REASON_INVALID_FORMAT: &str = "invalid recipient id format";
pub const REASON_CROSS_KEY: &str = "excluded: already sent under another key";
pub const REASON_ONCE_EVER: &str = "excluded: already received a broadcast";

/// The filters, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    InvalidFormat,
    Domain,
    CrossKey,
    OnceEver,
}

impl FilterKind {
    pub const ALL: [FilterKind; 4] = [
        FilterKind::InvalidFormat,
        FilterKind::Domain,
        FilterKind::CrossKey,
        FilterKind::OnceEver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKind::InvalidFormat => "invalid_format",
            FilterKind::Domain => "domain",
            FilterKind::CrossKey => "cross_key",
            FilterKind::OnceEver => "once_ever",
        }
    }
}

/// Which filters a campaign runs. Built once from validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPolicy {
    pub validate_format: bool,
    pub domain: Option<DomainExclusion>,
    pub exclude_sent_under: Vec<CampaignKey>,
    pub once_ever: bool,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            validate_format: true,
            domain: None,
            exclude_sent_under: Vec::new(),
            once_ever: true,
        }
    }
}

impl FilterPolicy {
    /// Audit text written to `last_error` for a rejection by `kind`.
    pub fn reason(&self, kind: FilterKind) -> String {
        match kind {
            FilterKind::InvalidFormat => REASON_INVALID_FORMAT.to_string(),
            FilterKind::Domain => self
                .domain
                .as_ref()
                .map(DomainExclusion::reason)
                .unwrap_or_else(|| "excluded: domain rule".to_string()),
            FilterKind::CrossKey => REASON_CROSS_KEY.to_string(),
            FilterKind::OnceEver => REASON_ONCE_EVER.to_string(),
        }
    }
}

/// Run-scoped exclusion data. `None` means the filter is disabled for this run.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSets {
    pub domain: Option<HashSet<String>>,
    pub cross_key: Option<HashSet<String>>,
    pub ever_sent: Option<HashSet<String>>,
}

impl ExclusionSets {
    /// Evaluate every enabled exclusion query once, relative to `now`.
    #[instrument(skip_all)]
    pub async fn load(pool: &Pool, policy: &FilterPolicy, now: DateTime<Utc>) -> Result<Self> {
        let domain = match &policy.domain {
            Some(rule) => Some(domain_excluded(pool, rule, now).await?),
            None => None,
        };
        let cross_key = if policy.exclude_sent_under.is_empty() {
            None
        } else {
            Some(db::sent_under_keys(pool, &policy.exclude_sent_under).await?)
        };
        let ever_sent = if policy.once_ever {
            Some(db::sent_under_any(pool).await?)
        } else {
            None
        };
        debug!(
            domain = domain.as_ref().map(HashSet::len),
            cross_key = cross_key.as_ref().map(HashSet::len),
            ever_sent = ever_sent.as_ref().map(HashSet::len),
            "exclusion sets loaded"
        );
        Ok(Self {
            domain,
            cross_key,
            ever_sent,
        })
    }
}

/// Recipients matching a domain exclusion rule.
pub async fn domain_excluded(
    pool: &Pool,
    rule: &DomainExclusion,
    now: DateTime<Utc>,
) -> Result<HashSet<String>> {
    match rule {
        DomainExclusion::HoldsItem {
            item_code,
            statuses,
        } => records::item_holders(pool, item_code, statuses).await,
        DomainExclusion::PurchasedWithin { days, statuses } => {
            records::purchasers_since(pool, days_before(now, *days)?, statuses).await
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Ids cleared for dispatch, in input order.
    pub eligible: Vec<String>,
    /// Rejected ids with the first filter that rejected them.
    pub rejected: Vec<(String, FilterKind)>,
}

impl FilterOutcome {
    pub fn rejected_by(&self, kind: FilterKind) -> Vec<String> {
        self.rejected
            .iter()
            .filter(|(_, k)| *k == kind)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn count(&self, kind: FilterKind) -> usize {
        self.rejected.iter().filter(|(_, k)| *k == kind).count()
    }
}

/// First filter rejecting `recipient_id`, if any.
pub fn first_rejection(
    policy: &FilterPolicy,
    sets: &ExclusionSets,
    recipient_id: &str,
) -> Option<FilterKind> {
    let in_set = |set: &Option<HashSet<String>>| set.as_ref().is_some_and(|s| s.contains(recipient_id));

    if policy.validate_format && !is_valid_recipient_id(recipient_id) {
        return Some(FilterKind::InvalidFormat);
    }
    if in_set(&sets.domain) {
        return Some(FilterKind::Domain);
    }
    if in_set(&sets.cross_key) {
        return Some(FilterKind::CrossKey);
    }
    if in_set(&sets.ever_sent) {
        return Some(FilterKind::OnceEver);
    }
    None
}

/// Split unsent ids into eligible and rejected.
pub fn apply<I>(policy: &FilterPolicy, sets: &ExclusionSets, unsent: I) -> FilterOutcome
where
    I: IntoIterator<Item = String>,
{
    let mut outcome = FilterOutcome::default();
    for id in unsent {
        match first_rejection(policy, sets, &id) {
            Some(kind) => outcome.rejected.push((id, kind)),
            None => outcome.eligible.push(id),
        }
    }
    outcome
}

/// Forced single recipient: skips every filter and becomes the only target.
pub fn forced(recipient_id: &str) -> FilterOutcome {
    FilterOutcome {
        eligible: vec![recipient_id.to_string()],
        rejected: Vec::new(),
    }
}
