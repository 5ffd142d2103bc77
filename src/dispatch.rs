use crate::db::{self, Pool};
use crate::model::CampaignKey;
use crate::provider::DeliveryProvider;
use crate::template::MessagePayload;
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Shared stop flag, checked before each chunk.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    pub batch_size: usize,
    pub delay: Duration,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DispatchReport {
    pub batches_planned: usize,
    pub batches_attempted: usize,
    pub batches_failed: usize,
    pub marked_sent: u64,
    pub marked_failed: u64,
    pub aborted: bool,
}

/// Split `recipients` into consecutive chunks of at most `batch_size`.
pub fn plan_chunks(recipients: &[String], batch_size: usize) -> Vec<&[String]> {
    recipients.chunks(batch_size.max(1)).collect()
}

/// Attach the counts reached so far to a ledger error that stops the dispatch.
fn interrupted(err: anyhow::Error, report: &DispatchReport) -> anyhow::Error {
    error!(
        err = %format!("{err:#}"),
        batches_attempted = report.batches_attempted,
        batches_failed = report.batches_failed,
        marked_sent = report.marked_sent,
        marked_failed = report.marked_failed,
        "ledger write failed; dispatch stopped"
    );
    err.context(format!(
        "dispatch stopped after batches_attempted={} batches_failed={} sent={} failed={}",
        report.batches_attempted, report.batches_failed, report.marked_sent, report.marked_failed
    ))
}

/// Send `payload` to `recipients` one chunk at a time and record each chunk's
/// outcome in the ledger. A failed chunk is marked and skipped; the next run
/// picks it up again. Ledger errors abort the dispatch.
#[instrument(skip_all, fields(campaign = %key, recipients = recipients.len()))]
pub async fn dispatch(
    pool: &Pool,
    provider: &dyn DeliveryProvider,
    key: &CampaignKey,
    recipients: &[String],
    payload: &MessagePayload,
    opts: DispatchOptions,
    abort: &AbortSignal,
) -> Result<DispatchReport> {
    let chunks = plan_chunks(recipients, opts.batch_size);
    let mut report = DispatchReport {
        batches_planned: chunks.len(),
        ..DispatchReport::default()
    };

    if opts.dry_run {
        for (idx, chunk) in chunks.iter().enumerate() {
            info!(
                chunk = idx + 1,
                of = chunks.len(),
                size = chunk.len(),
                first = chunk.first().map(String::as_str),
                last = chunk.last().map(String::as_str),
                "dry run: would send chunk"
            );
        }
        return Ok(report);
    }

    for (idx, chunk) in chunks.iter().enumerate() {
        if abort.is_aborted() {
            warn!(
                remaining = chunks.len() - idx,
                "dispatch aborted; remaining chunks stay pending"
            );
            report.aborted = true;
            break;
        }
        if idx > 0 && !opts.delay.is_zero() {
            tokio::time::sleep(opts.delay).await;
        }

        report.batches_attempted += 1;
        match provider.send(chunk, payload).await {
            Ok(()) => {
                let updated = db::mark_sent(pool, key, chunk, Utc::now())
                    .await
                    .map_err(|err| interrupted(err, &report))?;
                report.marked_sent += updated;
                info!(chunk = idx + 1, size = chunk.len(), updated, "chunk sent");
            }
            Err(err) => {
                let updated = db::mark_failed(pool, key, chunk, &err.to_string())
                    .await
                    .map_err(|e| interrupted(e, &report))?;
                report.batches_failed += 1;
                report.marked_failed += updated;
                warn!(%err, chunk = idx + 1, size = chunk.len(), "chunk failed; will retry next run");
            }
        }
    }
    Ok(report)
}
