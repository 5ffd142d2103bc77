//! View models for aggregate ledger queries.

use serde::Serialize;

/// Per-campaign ledger totals used by the inspection tool.
#[derive(Debug, Clone, Serialize, sqlx::FromRow, PartialEq, Eq)]
pub struct CampaignStats {
    pub campaign_key: String,
    pub total: i64,
    pub sent: i64,
    pub pending: i64,
    pub pending_with_error: i64,
}
