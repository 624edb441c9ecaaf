//! Dispatch orchestrator: drives evaluate → gate → render → send → finalize.
//!
//! Every candidate runs as an independent pipeline; one recipient's failure
//! never aborts the others. The ledger reservation is the only point where
//! concurrent pipelines (or processes) coordinate.

use chrono::{DateTime, Duration, Utc};
use coachdesk_core::config::AutomationConfig;
use coachdesk_core::error::{CoachDeskError, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelAdapter, RenderedMessage};
use crate::directory::{RecipientDirectory, RuleDirectory};
use crate::evaluator::Evaluator;
use crate::gate::{Admission, Gate, GateMode, GateRejection};
use crate::ledger::{DispatchKey, DispatchLedger, DispatchRecord, DispatchStatus};
use crate::recipient::{Occasion, Recipient};
use crate::rules::{AutomationRule, SendWindow, Trigger};
use crate::template::{InlineTemplate, TemplateRenderer};

/// Rule id used in the ledger for raw bulk messages.
pub const ADHOC_RULE_ID: &str = "adhoc";

/// Longest gap between sweeps that a late sweep still catches up on.
const MAX_CATCH_UP_HOURS: i64 = 24;

/// Engine tuning, usually taken from `[automation]`.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Max pipelines in flight per rule (sweep) or per batch (bulk).
    pub concurrency: usize,
    /// Look-back for threshold triggers on the first sweep; matches the sweep cadence.
    pub tolerance: Duration,
    /// Daily cap for raw bulk messages.
    pub manual_max_per_day: u32,
}

impl DispatchSettings {
    pub fn from_config(config: &AutomationConfig) -> Self {
        let secs = i64::try_from(config.sweep_interval_secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
        Self {
            concurrency: config.concurrency.max(1),
            tolerance: Duration::seconds(secs),
            manual_max_per_day: config.manual_max_per_day,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&AutomationConfig::default())
    }
}

/// Terminal result for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent,
    Failed { detail: String, transient: bool },
    Skipped(GateRejection),
    /// Not attempted because the cancellation token fired first.
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientResult {
    pub recipient_id: String,
    pub outcome: DispatchOutcome,
}

/// Bulk send result, in request order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchBatch {
    pub results: Vec<RecipientResult>,
    pub sent_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub cancelled_count: usize,
}

impl DispatchBatch {
    fn from_results(results: Vec<RecipientResult>) -> Self {
        let mut batch = Self::default();
        for r in &results {
            match r.outcome {
                DispatchOutcome::Sent => batch.sent_count += 1,
                DispatchOutcome::Failed { .. } => batch.failed_count += 1,
                DispatchOutcome::Skipped(_) => batch.skipped_count += 1,
                DispatchOutcome::Cancelled => batch.cancelled_count += 1,
            }
        }
        batch.results = results;
        batch
    }
}

/// What to send in a bulk request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchSource {
    /// Render the rule's template; the rule's cap applies.
    Rule(String),
    /// Raw message, capped by `manual_max_per_day`.
    Message { subject: String, body: String },
}

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub rules_evaluated: usize,
    /// Rules that failed validation or evaluation.
    pub rules_skipped: usize,
    /// Candidates produced by the evaluator.
    pub evaluated: usize,
    /// All gate rejections; the next three break it down.
    pub gated_out: usize,
    pub outside_window: usize,
    pub cap_exceeded: usize,
    pub duplicates: usize,
    pub sent: usize,
    pub failed: usize,
    /// The sweep stopped early because the token fired.
    pub cancelled: bool,
}

impl SweepReport {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Sent => self.sent += 1,
            DispatchOutcome::Failed { .. } => self.failed += 1,
            DispatchOutcome::Skipped(reason) => {
                self.gated_out += 1;
                match reason {
                    GateRejection::OutsideWindow => self.outside_window += 1,
                    GateRejection::CapExceeded => self.cap_exceeded += 1,
                    GateRejection::Duplicate => self.duplicates += 1,
                    GateRejection::NoConsent | GateRejection::UnknownRecipient => {}
                }
            }
            DispatchOutcome::Cancelled => self.cancelled = true,
        }
    }
}

#[derive(Clone, Copy)]
enum Content<'a> {
    Template(&'a str),
    Inline(InlineTemplate<'a>),
}

pub struct Dispatcher {
    rules: Arc<dyn RuleDirectory>,
    recipients: Arc<dyn RecipientDirectory>,
    ledger: Arc<dyn DispatchLedger>,
    renderer: Arc<dyn TemplateRenderer>,
    channel: Arc<dyn ChannelAdapter>,
    gate: Gate,
    evaluator: Evaluator,
    settings: DispatchSettings,
    cancel: CancellationToken,
    /// `now` of the most recent sweep started by this dispatcher.
    last_sweep: Mutex<Option<DateTime<Utc>>>,
}

impl Dispatcher {
    pub fn new(
        rules: Arc<dyn RuleDirectory>,
        recipients: Arc<dyn RecipientDirectory>,
        ledger: Arc<dyn DispatchLedger>,
        renderer: Arc<dyn TemplateRenderer>,
        channel: Arc<dyn ChannelAdapter>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            gate: Gate::new(ledger.clone()),
            evaluator: Evaluator::new(recipients.clone(), settings.tolerance),
            rules,
            recipients,
            ledger,
            renderer,
            channel,
            settings,
            cancel: CancellationToken::new(),
            last_sweep: Mutex::new(None),
        }
    }

    /// Share an externally owned cancellation token.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Reservations older than `older_than` that were never finalized.
    pub async fn stale_reservations(&self, older_than: DateTime<Utc>) -> Result<Vec<DispatchRecord>> {
        self.ledger.stale_reservations(older_than).await
    }

    /// One sweep over all active rules at `now`.
    ///
    /// Re-running the same sweep is harmless: already dispatched occasions
    /// come back as duplicates. Threshold triggers look back to the previous
    /// sweep, so a delayed tick still picks up everything that crossed in
    /// between.
    pub async fn run_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let lookback = self.sweep_lookback(now);
        let rules = self.rules.list_active_rules().await?;
        let mut report = SweepReport::default();

        for rule in &rules {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if let Err(e) = rule.validate() {
                tracing::warn!("⚠️ Skipping rule '{}': {e}", rule.id);
                report.rules_skipped += 1;
                continue;
            }
            let candidates = match self.evaluator.evaluate_with_lookback(rule, now, lookback).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("⚠️ Evaluation failed for rule '{}' ({}): {e}", rule.id, rule.trigger.tag());
                    report.rules_skipped += 1;
                    continue;
                }
            };
            report.rules_evaluated += 1;
            report.evaluated += candidates.len();
            tracing::debug!("🔎 Rule '{}' matched {} candidate(s)", rule.id, candidates.len());

            let content = Content::Template(&rule.template);
            let cancel = &self.cancel;
            let outcomes: Vec<DispatchOutcome> = stream::iter(candidates)
                .take_while(|_| futures::future::ready(!cancel.is_cancelled()))
                .map(|c| async move {
                    self.deliver(rule, &c.recipient, &c.occasion, now, GateMode::Scheduled, content)
                        .await
                })
                .buffer_unordered(self.settings.concurrency)
                .collect()
                .await;
            for outcome in &outcomes {
                report.record(outcome);
            }
        }
        if self.cancel.is_cancelled() {
            report.cancelled = true;
        }

        tracing::info!(
            "🔄 Sweep done: {} rules ({} skipped), {} candidates, {} sent, {} failed, {} gated out",
            report.rules_evaluated,
            report.rules_skipped,
            report.evaluated,
            report.sent,
            report.failed,
            report.gated_out
        );
        Ok(report)
    }

    /// Operator-initiated single send. Ignores the send window and the rule's
    /// active flag; consent and the daily cap still apply.
    pub async fn dispatch_manual(&self, rule_id: &str, recipient_id: &str) -> Result<DispatchOutcome> {
        self.dispatch_manual_at(rule_id, recipient_id, Utc::now()).await
    }

    pub async fn dispatch_manual_at(
        &self,
        rule_id: &str,
        recipient_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let rule = self.load_rule(rule_id).await?;
        let Some(recipient) = self.recipients.get_recipient(recipient_id).await? else {
            return Ok(DispatchOutcome::Skipped(GateRejection::UnknownRecipient));
        };
        let occasion = Occasion::manual(&uuid::Uuid::new_v4().to_string());
        Ok(self
            .deliver(&rule, &recipient, &occasion, now, GateMode::Manual, Content::Template(&rule.template))
            .await)
    }

    /// Send to many recipients. Fail-isolated: every recipient gets a result.
    /// All recipients share one occasion, so a repeated id is a duplicate.
    pub async fn dispatch_bulk(&self, source: &DispatchSource, recipient_ids: &[String]) -> Result<DispatchBatch> {
        self.dispatch_bulk_at(source, recipient_ids, Utc::now()).await
    }

    pub async fn dispatch_bulk_at(
        &self,
        source: &DispatchSource,
        recipient_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<DispatchBatch> {
        let rule = match source {
            DispatchSource::Rule(id) => self.load_rule(id).await?,
            DispatchSource::Message { .. } => self.adhoc_rule(now),
        };
        let content = match source {
            DispatchSource::Rule(_) => Content::Template(&rule.template),
            DispatchSource::Message { subject, body } => Content::Inline(InlineTemplate { subject, body }),
        };
        let occasion = Occasion::manual(&uuid::Uuid::new_v4().to_string());
        tracing::info!("📣 Bulk dispatch '{}' to {} recipient(s) ({})", rule.id, recipient_ids.len(), occasion.key);

        let rule = &rule;
        let occasion = &occasion;
        let results: Vec<RecipientResult> = stream::iter(recipient_ids)
            .map(|id| async move {
                if self.cancel.is_cancelled() {
                    return RecipientResult { recipient_id: id.clone(), outcome: DispatchOutcome::Cancelled };
                }
                let outcome = match self.recipients.get_recipient(id).await {
                    Ok(Some(recipient)) => {
                        self.deliver(rule, &recipient, occasion, now, GateMode::Manual, content).await
                    }
                    Ok(None) => DispatchOutcome::Skipped(GateRejection::UnknownRecipient),
                    Err(e) => {
                        tracing::warn!("⚠️ Recipient lookup failed for '{id}': {e}");
                        DispatchOutcome::Failed { detail: e.to_string(), transient: true }
                    }
                };
                RecipientResult { recipient_id: id.clone(), outcome }
            })
            .buffered(self.settings.concurrency)
            .collect()
            .await;

        let batch = DispatchBatch::from_results(results);
        tracing::info!(
            "📣 Bulk '{}' done: {} sent, {} failed, {} skipped, {} cancelled",
            rule.id,
            batch.sent_count,
            batch.failed_count,
            batch.skipped_count,
            batch.cancelled_count
        );
        Ok(batch)
    }

    /// Records `now` as the latest sweep and returns how far back this one
    /// should look: the gap since the previous sweep, at least the tolerance
    /// and at most a day. Replays and clock steps backwards use the tolerance.
    fn sweep_lookback(&self, now: DateTime<Utc>) -> Duration {
        let previous = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner).replace(now);
        let tolerance = self.settings.tolerance;
        match previous {
            Some(prev) if prev < now => {
                let limit = tolerance.max(Duration::hours(MAX_CATCH_UP_HOURS));
                (now - prev).clamp(tolerance, limit)
            }
            _ => tolerance,
        }
    }

    async fn load_rule(&self, rule_id: &str) -> Result<AutomationRule> {
        let rule = self
            .rules
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| CoachDeskError::RuleNotFound(rule_id.to_string()))?;
        rule.validate()?;
        Ok(rule)
    }

    /// Synthetic rule for raw messages; only its id and cap matter.
    fn adhoc_rule(&self, now: DateTime<Utc>) -> AutomationRule {
        AutomationRule::new(
            ADHOC_RULE_ID,
            "Ad-hoc message",
            Trigger::CalendarDate { date: now.date_naive() },
            "",
            SendWindow::all_day(),
            self.settings.manual_max_per_day,
        )
    }

    /// One candidate pipeline. Never returns an error: anything that goes
    /// wrong for this recipient becomes its outcome.
    async fn deliver(
        &self,
        rule: &AutomationRule,
        recipient: &Recipient,
        occasion: &Occasion,
        now: DateTime<Utc>,
        mode: GateMode,
        content: Content<'_>,
    ) -> DispatchOutcome {
        let admission = match self.gate.admit(rule, recipient, occasion, now, mode).await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!("⚠️ Reservation failed for {}/{}: {e}", rule.id, recipient.id);
                return DispatchOutcome::Failed { detail: e.to_string(), transient: true };
            }
        };
        let (record_id, key) = match admission {
            Admission::Admitted { record_id, key } => (record_id, key),
            Admission::Rejected(reason) => {
                tracing::debug!("⏭️ {}/{} {}: {reason}", rule.id, recipient.id, occasion.key);
                return DispatchOutcome::Skipped(reason);
            }
        };

        let message = match self.render(content, recipient, occasion) {
            Ok(m) => m,
            Err(e) => {
                let detail = e.to_string();
                tracing::warn!("⚠️ Render failed for {key}: {detail}");
                self.finalize(record_id, &key, DispatchStatus::Failed, Some(detail.clone())).await;
                return DispatchOutcome::Failed { detail, transient: false };
            }
        };

        match self.channel.send(&recipient.address, &message).await {
            Ok(()) => {
                self.finalize(record_id, &key, DispatchStatus::Sent, None).await;
                tracing::info!("📤 Sent {key} via {}", self.channel.name());
                DispatchOutcome::Sent
            }
            Err(e) => {
                tracing::warn!("⚠️ {} send failed for {key}: {}", self.channel.name(), e.detail);
                self.finalize(record_id, &key, DispatchStatus::Failed, Some(e.detail.clone())).await;
                DispatchOutcome::Failed { transient: e.is_transient(), detail: e.detail }
            }
        }
    }

    fn render(&self, content: Content<'_>, recipient: &Recipient, occasion: &Occasion) -> Result<RenderedMessage> {
        match content {
            Content::Template(template_ref) => self.renderer.render(template_ref, recipient, occasion),
            Content::Inline(inline) => Ok(inline.render(recipient, occasion)),
        }
    }

    /// A failed finalize leaves the record reserved; it then surfaces as a
    /// stale reservation and still blocks a resend.
    async fn finalize(&self, record_id: i64, key: &DispatchKey, status: DispatchStatus, detail: Option<String>) {
        if let Err(e) = self.ledger.finalize(record_id, status, detail).await {
            tracing::error!("❌ Could not mark {key} as {}: {e}", status.as_str());
        }
    }
}
