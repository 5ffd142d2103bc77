//! Segment broadcast delivery engine.
//!
//! Picks the audience for a campaign from transactional records, keeps a
//! per-campaign roster ledger so nobody is sent the same campaign twice, and
//! delivers in provider-sized chunks.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod extract;
pub mod filter;
pub mod model;
pub mod provider;
pub mod runner;
pub mod template;
