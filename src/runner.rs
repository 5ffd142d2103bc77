//! Campaign runner: extraction, reconciliation, filtering and dispatch for one
//! invocation. All state lives in the roster ledger; the runner keeps nothing
//! between runs.

use crate::config::{ConfigError, RunPlan};
use crate::db::{self, Pool};
use crate::dispatch::{self, AbortSignal, DispatchOptions, DispatchReport};
use crate::extract::{self, ExtractError};
use crate::filter::{self, ExclusionSets, FilterKind, FilterOutcome};
use crate::provider::DeliveryProvider;
use crate::template::{MessagePayload, TemplateError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("template error: {0}")]
    Template(#[from] TemplateError),
    #[error("candidate extraction failed: {0:#}")]
    Extraction(anyhow::Error),
    #[error("roster ledger error: {0:#}")]
    Ledger(anyhow::Error),
}

impl RunError {
    /// Whether re-running without operator changes can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RunError::Extraction(_) | RunError::Ledger(_))
    }
}

impl From<ExtractError> for RunError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Config(e) => RunError::Config(e),
            ExtractError::Query(e) => RunError::Extraction(e),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RejectedCounts {
    pub invalid_format: usize,
    pub domain: usize,
    pub cross_key: usize,
    pub once_ever: usize,
}

impl RejectedCounts {
    fn from_outcome(outcome: &FilterOutcome) -> Self {
        Self {
            invalid_format: outcome.count(FilterKind::InvalidFormat),
            domain: outcome.count(FilterKind::Domain),
            cross_key: outcome.count(FilterKind::CrossKey),
            once_ever: outcome.count(FilterKind::OnceEver),
        }
    }

    pub fn total(&self) -> usize {
        self.invalid_format + self.domain + self.cross_key + self.once_ever
    }
}

/// Counts reported after every run, including empty and partially failed ones.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub campaign_key: String,
    pub dry_run: bool,
    pub forced: bool,
    pub candidates_found: usize,
    /// Rows inserted into the ledger (projected in a dry run).
    pub roster_created: u64,
    pub unsent_total: usize,
    pub eligible_total: usize,
    pub rejected: RejectedCounts,
    pub batches_planned: usize,
    pub batches_attempted: usize,
    pub batches_failed: usize,
    pub marked_sent: u64,
    pub marked_failed: u64,
    pub aborted: bool,
}

impl RunSummary {
    fn new(run_id: Uuid, plan: &RunPlan) -> Self {
        Self {
            run_id,
            campaign_key: plan.key.to_string(),
            dry_run: plan.dry_run,
            forced: plan.test_recipient.is_some(),
            candidates_found: 0,
            roster_created: 0,
            unsent_total: 0,
            eligible_total: 0,
            rejected: RejectedCounts::default(),
            batches_planned: 0,
            batches_attempted: 0,
            batches_failed: 0,
            marked_sent: 0,
            marked_failed: 0,
            aborted: false,
        }
    }

    fn absorb(&mut self, report: DispatchReport) {
        self.batches_planned = report.batches_planned;
        self.batches_attempted = report.batches_attempted;
        self.batches_failed = report.batches_failed;
        self.marked_sent = report.marked_sent;
        self.marked_failed = report.marked_failed;
        self.aborted = report.aborted;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run_id={} campaign={} dry_run={} forced={} candidates={} roster_created={} \
             unsent={} eligible={} rejected_invalid_format={} rejected_domain={} \
             rejected_cross_key={} rejected_once_ever={} batches_planned={} \
             batches_attempted={} batches_failed={} sent={} failed={} aborted={}",
            self.run_id,
            self.campaign_key,
            self.dry_run,
            self.forced,
            self.candidates_found,
            self.roster_created,
            self.unsent_total,
            self.eligible_total,
            self.rejected.invalid_format,
            self.rejected.domain,
            self.rejected.cross_key,
            self.rejected.once_ever,
            self.batches_planned,
            self.batches_attempted,
            self.batches_failed,
            self.marked_sent,
            self.marked_failed,
            self.aborted,
        )
    }
}

/// Substitution map for one render: campaign vars plus `name` and `date`.
fn render_payload(
    plan: &RunPlan,
    name: &str,
    now: DateTime<Utc>,
) -> Result<MessagePayload, TemplateError> {
    let mut vars: BTreeMap<String, String> = plan.vars.clone();
    vars.insert("name".into(), name.to_string());
    vars.insert("date".into(), now.format("%Y-%m-%d").to_string());
    plan.template.render(&vars)
}

fn dispatch_options(plan: &RunPlan) -> DispatchOptions {
    DispatchOptions {
        batch_size: plan.batch_size,
        delay: plan.batch_delay,
        dry_run: plan.dry_run,
    }
}

/// Execute one invocation of the campaign described by `plan`.
pub async fn run_campaign(
    pool: &Pool,
    provider: &dyn DeliveryProvider,
    plan: &RunPlan,
    now: DateTime<Utc>,
    abort: &AbortSignal,
) -> Result<RunSummary, RunError> {
    let run_id = Uuid::new_v4();
    let span = info_span!("campaign_run", %run_id, campaign = %plan.key, dry_run = plan.dry_run);
    async move {
        let summary = match plan.test_recipient.as_deref() {
            Some(recipient) => run_forced(pool, provider, plan, recipient, now, abort, run_id).await?,
            None => run_audience(pool, provider, plan, now, abort, run_id).await?,
        };
        info!(
            candidates = summary.candidates_found,
            roster_created = summary.roster_created,
            unsent = summary.unsent_total,
            eligible = summary.eligible_total,
            rejected = summary.rejected.total(),
            batches = summary.batches_attempted,
            sent = summary.marked_sent,
            failed = summary.marked_failed,
            aborted = summary.aborted,
            "campaign run finished"
        );
        Ok::<_, RunError>(summary)
    }
    .instrument(span)
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_forced(
    pool: &Pool,
    provider: &dyn DeliveryProvider,
    plan: &RunPlan,
    recipient: &str,
    now: DateTime<Utc>,
    abort: &AbortSignal,
    run_id: Uuid,
) -> Result<RunSummary, RunError> {
    let mut summary = RunSummary::new(run_id, plan);
    let name = extract::resolve_display_name(pool, recipient, &plan.source, &plan.default_name).await;
    let payload = render_payload(plan, &name, now)?;
    info!(recipient, %name, "forced single-recipient run; filters bypassed");

    if !plan.dry_run {
        let created = db::ensure_single(pool, &plan.key, recipient, now)
            .await
            .map_err(RunError::Ledger)?;
        summary.roster_created = u64::from(created);
    }

    let outcome = filter::forced(recipient);
    summary.unsent_total = 1;
    summary.eligible_total = outcome.eligible.len();
    let report = dispatch::dispatch(
        pool,
        provider,
        &plan.key,
        &outcome.eligible,
        &payload,
        dispatch_options(plan),
        abort,
    )
    .await
    .map_err(RunError::Ledger)?;
    summary.absorb(report);
    Ok(summary)
}

async fn run_audience(
    pool: &Pool,
    provider: &dyn DeliveryProvider,
    plan: &RunPlan,
    now: DateTime<Utc>,
    abort: &AbortSignal,
    run_id: Uuid,
) -> Result<RunSummary, RunError> {
    let mut summary = RunSummary::new(run_id, plan);

    // Everything that can fail for configuration or record-store reasons
    // happens before the first ledger write.
    let payload = render_payload(plan, &plan.default_name, now)?;
    let candidates = extract::extract_candidates(
        pool,
        &plan.key,
        &plan.source,
        plan.window,
        plan.max_candidates,
        now,
    )
    .await?;
    summary.candidates_found = candidates.len();
    let exclusions = ExclusionSets::load(pool, &plan.filters, now)
        .await
        .map_err(RunError::Extraction)?;

    let unsent: Vec<String> = if plan.dry_run {
        let existing = db::existing_ids(pool, &plan.key, &candidates)
            .await
            .map_err(RunError::Ledger)?;
        let projected: BTreeSet<String> = candidates
            .iter()
            .filter(|id| !existing.contains(*id))
            .cloned()
            .collect();
        summary.roster_created = projected.len() as u64;
        let mut all = projected;
        all.extend(
            db::load_unsent(pool, &plan.key, None)
                .await
                .map_err(RunError::Ledger)?
                .into_iter()
                .map(|e| e.recipient_id),
        );
        all.into_iter().collect()
    } else {
        summary.roster_created = db::reconcile(pool, &plan.key, &candidates, now)
            .await
            .map_err(RunError::Ledger)?;
        db::load_unsent(pool, &plan.key, None)
            .await
            .map_err(RunError::Ledger)?
            .into_iter()
            .map(|e| e.recipient_id)
            .collect()
    };
    summary.unsent_total = unsent.len();

    let outcome = filter::apply(&plan.filters, &exclusions, unsent);
    summary.eligible_total = outcome.eligible.len();
    summary.rejected = RejectedCounts::from_outcome(&outcome);

    if !plan.dry_run {
        for kind in FilterKind::ALL {
            let rejected = outcome.rejected_by(kind);
            if rejected.is_empty() {
                continue;
            }
            db::mark_failed(pool, &plan.key, &rejected, &plan.filters.reason(kind))
                .await
                .map_err(RunError::Ledger)?;
            info!(filter = kind.as_str(), count = rejected.len(), "recipients filtered out");
        }
    }

    let report = dispatch::dispatch(
        pool,
        provider,
        &plan.key,
        &outcome.eligible,
        &payload,
        dispatch_options(plan),
        abort,
    )
    .await
    .map_err(RunError::Ledger)?;
    summary.absorb(report);
    Ok(summary)
}
