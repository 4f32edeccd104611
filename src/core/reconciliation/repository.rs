use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    Sent,
    Delivered,
    Bounced,
    SpamComplaint,
    Failed,
}

impl EmailStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EmailStatus::Sent => "sent",
            EmailStatus::Delivered => "delivered",
            EmailStatus::Bounced => "bounced",
            EmailStatus::SpamComplaint => "spam_complaint",
            EmailStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(EmailStatus::Sent),
            "delivered" => Some(EmailStatus::Delivered),
            "bounced" => Some(EmailStatus::Bounced),
            "spam_complaint" => Some(EmailStatus::SpamComplaint),
            "failed" => Some(EmailStatus::Failed),
            _ => None,
        }
    }
}

/// Which writer last touched a record's delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateSource {
    Webhook,
    Reconciliation,
}

impl StateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            StateSource::Webhook => "webhook",
            StateSource::Reconciliation => "reconciliation",
        }
    }

    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "webhook" => Some(StateSource::Webhook),
            "reconciliation" => Some(StateSource::Reconciliation),
            _ => None,
        }
    }
}

/// Links from an email to the business records it concerns.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct EntityRefs {
    pub quote_id: Option<String>,
    pub order_id: Option<String>,
    pub customer_id: Option<String>,
    pub vendor_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EmailRecord {
    pub id: i64,
    pub postmark_message_id: Option<String>,
    pub direction: Direction,
    pub status: EmailStatus,
    pub from_address: String,
    pub to_address: String,
    pub subject: String,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub refs: EntityRefs,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub state_source: StateSource,
    pub reconciliation_notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewEmail {
    pub postmark_message_id: String,
    pub direction: Direction,
    pub status: EmailStatus,
    pub from_address: String,
    pub to_address: String,
    pub subject: String,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub refs: EntityRefs,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub state_source: StateSource,
    pub reconciliation_notes: Option<String>,
}

/// Partial update: `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct EmailUpdate {
    pub status: Option<EmailStatus>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub state_source: Option<StateSource>,
    pub reconciliation_notes: Option<String>,
}

#[async_trait]
pub trait EmailRepository: Send + Sync {
    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<EmailRecord>>;

    async fn insert_email(&self, email: &NewEmail) -> Result<i64>;

    async fn update_email(&self, id: i64, update: &EmailUpdate) -> Result<()>;

    /// Outbound records with an external id whose `sent_at` lies in `[from, to]`.
    async fn outbound_sent_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EmailRecord>>;

    /// Thread of the message `in_reply_to` points at, or a fresh thread id.
    async fn resolve_thread(&self, in_reply_to: Option<&str>, message_id: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            EmailStatus::Sent,
            EmailStatus::Delivered,
            EmailStatus::Bounced,
            EmailStatus::SpamComplaint,
            EmailStatus::Failed,
        ] {
            assert_eq!(EmailStatus::from_status(status.as_str()), Some(status));
        }
        assert_eq!(EmailStatus::from_status("opened"), None);
    }

    #[test]
    fn direction_and_source_parse_their_own_strings() {
        for direction in [Direction::Inbound, Direction::Outbound] {
            assert_eq!(Direction::from_str_opt(direction.as_str()), Some(direction));
        }
        assert_eq!(Direction::from_str_opt("sideways"), None);
        for source in [StateSource::Webhook, StateSource::Reconciliation] {
            assert_eq!(StateSource::from_str_opt(source.as_str()), Some(source));
        }
        assert_eq!(StateSource::from_str_opt("delivered"), None);
    }
}
