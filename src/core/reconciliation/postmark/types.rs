use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Postmark mixes RFC 3339 (`ReceivedAt`) and RFC 2822 (`Date`) timestamps.
pub(crate) fn parse_provider_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

fn deserialize_provider_time<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_provider_time(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognised timestamp '{}'", raw)))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Recipient {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutboundMessage {
    #[serde(rename = "MessageID")]
    pub message_id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<Recipient>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub status: String,
    #[serde(deserialize_with = "deserialize_provider_time")]
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn recipient_list(&self) -> String {
        if !self.to.is_empty() {
            self.to
                .iter()
                .map(|r| r.email.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            self.recipients.join(", ")
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InboundMessage {
    #[serde(rename = "MessageID")]
    pub message_id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub status: String,
    #[serde(alias = "Date", deserialize_with = "deserialize_provider_time")]
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub headers: Vec<MessageHeader>,
}

impl InboundMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn in_reply_to(&self) -> Option<&str> {
        self.header("In-Reply-To")
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// A delivery event normalised to webhook record-type names
/// (`Delivery`, `Bounce`, `Open`, `Click`, `SpamComplaint`, ...).
#[derive(Debug, Clone, Default)]
pub struct MessageEvent {
    pub record_type: String,
    pub received_at: DateTime<Utc>,
    pub recipient: Option<String>,
    pub description: Option<String>,
    pub bounce_type: Option<String>,
    pub url: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub client: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct OutboundSearchPage {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub messages: Vec<OutboundMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct InboundSearchPage {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub inbound_messages: Vec<InboundMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct InboundDetails {
    #[serde(default)]
    pub headers: Vec<MessageHeader>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct OutboundDetails {
    #[serde(default)]
    pub message_events: Vec<RawMessageEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct RawMessageEvent {
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(rename = "Type")]
    pub event_type: String,
    pub received_at: String,
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl RawMessageEvent {
    fn detail(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| match self.details.get(*k) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(serde_json::Value::Object(obj)) => obj
                .get("Name")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            _ => None,
        })
    }

    fn geo(&self, key: &str) -> Option<String> {
        self.details
            .get("Geo")
            .and_then(|g| g.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| self.detail(&[key]))
    }

    /// `None` when the timestamp cannot be parsed; such events cannot be ordered
    /// against `last_reconciled_at` and are dropped by the client.
    pub fn normalize(self) -> Option<MessageEvent> {
        let received_at = parse_provider_time(&self.received_at)?;
        Some(MessageEvent {
            record_type: normalize_record_type(&self.event_type).to_string(),
            received_at,
            recipient: self.recipient.clone(),
            description: self.detail(&["Summary", "DeliveryMessage", "Description"]),
            bounce_type: self.detail(&["BounceType"]),
            url: self.detail(&["OriginalLink", "Link"]),
            city: self.geo("City"),
            country: self.geo("Country"),
            client: self.detail(&["Client", "ClientName"]),
        })
    }
}

/// Maps message-details event names onto webhook record types.
pub(crate) fn normalize_record_type(raw: &str) -> &str {
    match raw {
        "Delivered" => "Delivery",
        "Bounced" => "Bounce",
        "Opened" => "Open",
        "LinkClicked" => "Click",
        "SubscriptionChanged" => "SubscriptionChange",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_page_decodes_postmark_shape() {
        let page: OutboundSearchPage = serde_json::from_value(json!({
            "TotalCount": 1,
            "Messages": [{
                "MessageID": "msg-1",
                "From": "sales@example.com",
                "To": [{"Email": "client@example.com", "Name": "Client"}],
                "Recipients": ["client@example.com"],
                "Subject": "Your quote",
                "Status": "Sent",
                "ReceivedAt": "2026-10-17T09:15:34.5829305-04:00",
                "Metadata": {"quote_id": "Q-77"}
            }]
        }))
        .unwrap();
        assert_eq!(page.total_count, 1);
        let msg = &page.messages[0];
        assert_eq!(msg.message_id, "msg-1");
        assert_eq!(msg.recipient_list(), "client@example.com");
        assert_eq!(msg.metadata["quote_id"], "Q-77");
        assert_eq!(msg.received_at.to_rfc3339(), "2026-10-17T13:15:34.582930500+00:00");
    }

    #[test]
    fn inbound_accepts_rfc2822_date_and_finds_in_reply_to() {
        let msg: InboundMessage = serde_json::from_value(json!({
            "MessageID": "in-1",
            "From": "client@example.com",
            "To": "sales@example.com",
            "Subject": "Re: Your quote",
            "Status": "Processed",
            "Date": "Sat, 17 Oct 2026 09:00:00 -0400",
            "Headers": [{"Name": "in-reply-to", "Value": " <msg-1@mtasv.net> "}]
        }))
        .unwrap();
        assert_eq!(msg.in_reply_to(), Some("<msg-1@mtasv.net>"));
        assert_eq!(msg.received_at.to_rfc3339(), "2026-10-17T13:00:00+00:00");
    }

    #[test]
    fn raw_events_normalise_to_record_types() {
        let raw: RawMessageEvent = serde_json::from_value(json!({
            "Recipient": "client@example.com",
            "Type": "Bounced",
            "ReceivedAt": "2026-10-17T10:00:00Z",
            "Details": {"Summary": "mailbox full", "BounceType": "SoftBounce"}
        }))
        .unwrap();
        let event = raw.normalize().unwrap();
        assert_eq!(event.record_type, "Bounce");
        assert_eq!(event.description.as_deref(), Some("mailbox full"));
        assert_eq!(event.bounce_type.as_deref(), Some("SoftBounce"));

        let raw: RawMessageEvent = serde_json::from_value(json!({
            "Type": "LinkClicked",
            "ReceivedAt": "not a time",
        }))
        .unwrap();
        assert!(raw.normalize().is_none());
    }

    #[test]
    fn unknown_record_types_pass_through() {
        assert_eq!(normalize_record_type("Opened"), "Open");
        assert_eq!(normalize_record_type("Delivery"), "Delivery");
        assert_eq!(normalize_record_type("Transient"), "Transient");
    }
}
