use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use super::mapping;
use super::{DateRange, DeliveryApi, InboundMessage, MessageEvent, OutboundMessage};
use crate::core::reconciliation::repository::{
    Direction, EmailRecord, EmailStatus, EmailUpdate, EntityRefs, NewEmail, StateSource,
};
use crate::core::reconciliation::{
    EmailEventDetails, EmailRepository, EventLogger, EventSource, ReconciliationOptions,
    ReconciliationResult, ReconciliationSummary, ReconciliationTask,
};
use crate::core::store::normalize_message_ref;

pub const TASK_ID: &str = "postmark";
const DEFAULT_BATCH_SIZE: usize = 50;

/// Syncs outbound/inbound messages and delivery events from Postmark into the
/// local email store, correcting drift left by missed or reordered webhooks.
pub struct PostmarkReconciliationTask {
    api: Arc<dyn DeliveryApi>,
    repo: Arc<dyn EmailRepository>,
    events: EventLogger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemChange {
    New,
    Updated,
    Skipped,
}

#[derive(Debug, Default)]
struct PhaseReport {
    summary: ReconciliationSummary,
    failed_items: u64,
}

impl PhaseReport {
    fn record(&mut self, change: ItemChange) {
        match change {
            ItemChange::New => self.summary.items_new += 1,
            ItemChange::Updated => self.summary.items_updated += 1,
            ItemChange::Skipped => {}
        }
    }
}

#[derive(Debug, Default)]
struct EventsApplied {
    processed: u64,
    corrections: u64,
}

/// An update applies only when `incoming` is strictly newer than the high-water mark.
fn is_newer(incoming: DateTime<Utc>, last_reconciled_at: Option<DateTime<Utc>>) -> bool {
    last_reconciled_at.is_none_or(|mark| incoming > mark)
}

fn advance(mark: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    mark.map_or(now, |m| m.max(now))
}

fn metadata_ref(metadata: &HashMap<String, String>, keys: [&str; 2]) -> Option<String> {
    keys.iter()
        .filter_map(|k| metadata.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn entity_refs(metadata: &HashMap<String, String>) -> EntityRefs {
    EntityRefs {
        quote_id: metadata_ref(metadata, ["quote_id", "quoteId"]),
        order_id: metadata_ref(metadata, ["order_id", "orderId"]),
        customer_id: metadata_ref(metadata, ["customer_id", "customerId"]),
        vendor_id: metadata_ref(metadata, ["vendor_id", "vendorId"]),
    }
}

/// The search API keeps reporting `Sent` long after delivery; it never moves a
/// record backwards.
fn derived_status(current: EmailStatus, external: EmailStatus) -> EmailStatus {
    if external == EmailStatus::Sent {
        current
    } else {
        external
    }
}

fn event_details(event: &MessageEvent, message_id: &str) -> EmailEventDetails {
    EmailEventDetails {
        recipient: event.recipient.clone(),
        occurred_at: Some(event.received_at),
        bounce_type: event.bounce_type.clone(),
        bounce_reason: event.description.clone(),
        url: event.url.clone(),
        city: event.city.clone(),
        country: event.country.clone(),
        client: event.client.clone(),
        external_message_id: Some(message_id.to_string()),
    }
}

fn correction_note(from: EmailStatus, to: EmailStatus, event: &MessageEvent) -> String {
    let mut note = format!(
        "Reconciliation corrected status from {} to {} based on {} event at {}",
        from.as_str(),
        to.as_str(),
        event.record_type,
        event.received_at.to_rfc3339()
    );
    if let Some(description) = event.description.as_deref().filter(|d| !d.is_empty()) {
        note.push_str(": ");
        note.push_str(description);
    }
    note
}

impl PostmarkReconciliationTask {
    pub fn new(
        api: Arc<dyn DeliveryApi>,
        repo: Arc<dyn EmailRepository>,
        events: EventLogger,
    ) -> Self {
        Self { api, repo, events }
    }

    fn batch_size(options: &ReconciliationOptions) -> usize {
        options
            .task_option("batch_size")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE)
    }

    // ── Phase 1: outbound messages ──

    async fn reconcile_outbound(&self, range: &DateRange, batch_size: usize) -> Result<PhaseReport> {
        let messages = self.api.get_all_outbound_messages(range).await?;
        let mut report = PhaseReport::default();
        report.summary.items_fetched = messages.len() as u64;

        for (n, batch) in messages.chunks(batch_size).enumerate() {
            debug!("Outbound batch {} ({} messages)", n + 1, batch.len());
            for message in batch {
                match self.apply_outbound(message).await {
                    Ok(change) => report.record(change),
                    Err(e) => {
                        warn!(
                            "Failed to reconcile outbound message {}: {:#}",
                            message.message_id, e
                        );
                        report.failed_items += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn apply_outbound(&self, message: &OutboundMessage) -> Result<ItemChange> {
        let now = Utc::now();
        let external_status = mapping::message_status(&message.status);

        let Some(existing) = self.repo.find_by_external_id(&message.message_id).await? else {
            let thread_id = self.repo.resolve_thread(None, &message.message_id).await?;
            let email = NewEmail {
                postmark_message_id: message.message_id.clone(),
                direction: Direction::Outbound,
                status: external_status,
                from_address: message.from.clone(),
                to_address: message.recipient_list(),
                subject: message.subject.clone(),
                thread_id: Some(thread_id),
                in_reply_to: None,
                refs: entity_refs(&message.metadata),
                sent_at: Some(message.received_at),
                delivered_at: None,
                last_reconciled_at: Some(now),
                state_source: StateSource::Reconciliation,
                reconciliation_notes: Some("Backfilled from Postmark outbound messages".to_string()),
            };
            let id = self.repo.insert_email(&email).await?;
            info!(
                "Backfilled outbound message {} as email {}",
                message.message_id, id
            );
            return Ok(ItemChange::New);
        };

        self.update_if_newer(&existing, message.received_at, external_status, now)
            .await
    }

    /// Shared update branch for both directions. Entity cross-references on an
    /// existing record are never rewritten here.
    async fn update_if_newer(
        &self,
        existing: &EmailRecord,
        external_time: DateTime<Utc>,
        external_status: EmailStatus,
        now: DateTime<Utc>,
    ) -> Result<ItemChange> {
        if !is_newer(external_time, existing.last_reconciled_at) {
            return Ok(ItemChange::Skipped);
        }
        let update = EmailUpdate {
            status: Some(derived_status(existing.status, external_status)),
            last_reconciled_at: Some(advance(existing.last_reconciled_at, now)),
            state_source: Some(StateSource::Reconciliation),
            ..Default::default()
        };
        self.repo.update_email(existing.id, &update).await?;
        Ok(ItemChange::Updated)
    }

    // ── Phase 2: inbound messages ──

    async fn reconcile_inbound(&self, range: &DateRange, batch_size: usize) -> Result<PhaseReport> {
        let messages = self.api.get_all_inbound_messages(range).await?;
        let mut report = PhaseReport::default();
        report.summary.items_fetched = messages.len() as u64;

        for (n, batch) in messages.chunks(batch_size).enumerate() {
            debug!("Inbound batch {} ({} messages)", n + 1, batch.len());
            for message in batch {
                match self.apply_inbound(message).await {
                    Ok(change) => report.record(change),
                    Err(e) => {
                        warn!(
                            "Failed to reconcile inbound message {}: {:#}",
                            message.message_id, e
                        );
                        report.failed_items += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn apply_inbound(&self, message: &InboundMessage) -> Result<ItemChange> {
        let now = Utc::now();
        let external_status = mapping::inbound_status(&message.status);

        let Some(existing) = self.repo.find_by_external_id(&message.message_id).await? else {
            let in_reply_to = message.in_reply_to();
            let thread_id = self
                .repo
                .resolve_thread(in_reply_to, &message.message_id)
                .await?;
            let email = NewEmail {
                postmark_message_id: message.message_id.clone(),
                direction: Direction::Inbound,
                status: external_status,
                from_address: message.from.clone(),
                to_address: message.to.clone(),
                subject: message.subject.clone(),
                thread_id: Some(thread_id),
                in_reply_to: in_reply_to.map(normalize_message_ref),
                refs: EntityRefs::default(),
                sent_at: Some(message.received_at),
                delivered_at: (external_status == EmailStatus::Delivered)
                    .then_some(message.received_at),
                last_reconciled_at: Some(now),
                state_source: StateSource::Reconciliation,
                reconciliation_notes: Some("Backfilled from Postmark inbound messages".to_string()),
            };
            let id = self.repo.insert_email(&email).await?;
            info!(
                "Backfilled inbound message {} as email {}",
                message.message_id, id
            );
            return Ok(ItemChange::New);
        };

        self.update_if_newer(&existing, message.received_at, external_status, now)
            .await
    }

    // ── Phase 3: delivery events ──

    async fn reconcile_events(&self, range: &DateRange, batch_size: usize) -> Result<PhaseReport> {
        let emails = self.repo.outbound_sent_between(range.from, range.to).await?;
        let mut report = PhaseReport::default();

        for (n, batch) in emails.chunks(batch_size).enumerate() {
            debug!("Event batch {} ({} emails)", n + 1, batch.len());
            for email in batch {
                let Some(message_id) = email.postmark_message_id.as_deref() else {
                    continue;
                };
                match self.apply_events(email, message_id).await {
                    Ok(applied) => {
                        report.summary.items_fetched += applied.processed;
                        report.summary.items_updated += applied.corrections;
                        report.summary.corrections += applied.corrections;
                    }
                    Err(e) => {
                        warn!(
                            "Failed to reconcile events for email {} ({}): {:#}",
                            email.id, message_id, e
                        );
                        report.failed_items += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn apply_events(&self, email: &EmailRecord, message_id: &str) -> Result<EventsApplied> {
        let mut history = self.api.get_message_events(message_id).await?;
        history.sort_by_key(|e| e.received_at);

        // Gate on the mark as it was before this pass; updates below move it to now.
        let mark = email.last_reconciled_at;
        let mut status = email.status;
        let mut applied = EventsApplied::default();

        for event in history.iter().filter(|e| is_newer(e.received_at, mark)) {
            applied.processed += 1;

            if let Some(kind) = mapping::event_type(&event.record_type) {
                self.events
                    .log_email_event(
                        email.id,
                        kind,
                        &event_details(event, message_id),
                        EventSource::Reconciliation,
                    )
                    .await?;
            } else {
                debug!(
                    "Not logging {} event for message {}",
                    event.record_type, message_id
                );
            }

            let Some(next) = mapping::event_status(&event.record_type) else {
                continue;
            };
            if next == status {
                continue;
            }

            let mut update = EmailUpdate {
                status: Some(next),
                last_reconciled_at: Some(advance(mark, Utc::now())),
                state_source: Some(StateSource::Reconciliation),
                reconciliation_notes: Some(correction_note(status, next, event)),
                ..Default::default()
            };
            match next {
                EmailStatus::Delivered => update.delivered_at = Some(event.received_at),
                EmailStatus::Bounced => update.bounced_at = Some(event.received_at),
                _ => {}
            }
            self.repo.update_email(email.id, &update).await?;
            info!(
                "Corrected email {} from {} to {} ({} at {})",
                email.id,
                status.as_str(),
                next.as_str(),
                event.record_type,
                event.received_at
            );
            status = next;
            applied.corrections += 1;
        }

        if applied.processed > 0 {
            self.repo
                .update_email(
                    email.id,
                    &EmailUpdate {
                        last_reconciled_at: Some(advance(mark, Utc::now())),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(applied)
    }
}

#[async_trait]
impl ReconciliationTask for PostmarkReconciliationTask {
    fn id(&self) -> &str {
        TASK_ID
    }

    fn name(&self) -> &str {
        "Postmark email reconciliation"
    }

    fn description(&self) -> &str {
        "Backfills missed outbound/inbound messages and corrects delivery status from Postmark events"
    }

    async fn execute(&self, options: &ReconciliationOptions) -> Result<ReconciliationResult> {
        let to = Utc::now();
        let range = DateRange {
            from: to - Duration::hours(i64::from(options.window_hours)),
            to,
        };
        let batch_size = Self::batch_size(options);
        info!(
            "Postmark reconciliation over {} -> {} (batch size {})",
            range.from, range.to, batch_size
        );

        let phases = [
            ("Outbound", self.reconcile_outbound(&range, batch_size).await),
            ("Inbound", self.reconcile_inbound(&range, batch_size).await),
            ("Events", self.reconcile_events(&range, batch_size).await),
        ];

        let mut summary = ReconciliationSummary::default();
        let mut errors = Vec::new();
        let mut failed_items = Vec::new();
        for (phase, outcome) in phases {
            match outcome {
                Ok(report) => {
                    summary.absorb(&report.summary);
                    if report.failed_items > 0 {
                        failed_items.push((phase, report.failed_items));
                    }
                }
                Err(e) => {
                    warn!("{} phase failed: {:#}", phase, e);
                    errors.push(format!("{} failed: {:#}", phase, e));
                }
            }
        }

        if !failed_items.is_empty() {
            let note = failed_items
                .iter()
                .map(|(phase, n)| format!("{} item(s) skipped in {} phase", n, phase.to_lowercase()))
                .collect::<Vec<_>>()
                .join("; ");
            let metadata = serde_json::Value::Object(
                failed_items
                    .iter()
                    .map(|(phase, n)| (phase.to_lowercase(), json!(n)))
                    .collect(),
            );
            if let Err(e) = self
                .events
                .log_reconciliation_note(TASK_ID, self.name(), &note, Some(metadata))
                .await
            {
                warn!("Could not record skipped-item note: {:#}", e);
            }
        }

        Ok(ReconciliationResult::from_parts(summary, errors))
    }

    async fn validate_config(&self) -> Vec<String> {
        if !self.api.has_credentials() {
            return vec!["Postmark server token is not configured".to_string()];
        }
        match self.api.health_check().await {
            Ok(true) => Vec::new(),
            Ok(false) => vec!["Postmark rejected the server token".to_string()],
            Err(e) => vec![format!("Postmark health check failed: {:#}", e)],
        }
    }
}
