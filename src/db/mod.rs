//! Database module: the roster ledger and read access to transactional records.
//!
//! - `repo`: pool setup, migrations and every statement touching the `roster` table.
//! - `records`: read-only windowed queries over purchases, follows and visits.
//! - `model`: view models returned by aggregate ledger queries.
//!
//! Callers import from `segment_broadcast::db`; the ledger API is re-exported here.

pub mod model;
pub mod records;
pub mod repo;

pub use repo::*;

pub use model::CampaignStats;
