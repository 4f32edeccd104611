//! Fixed translation tables from Postmark status / record-type strings.
//! Matching is case-sensitive.

use crate::core::reconciliation::EmailEventType;
use crate::core::reconciliation::repository::EmailStatus;

/// Status of an outbound message as reported by the message search API.
/// Unknown values default to `Sent`.
pub fn message_status(external: &str) -> EmailStatus {
    match external {
        "Delivery" | "Delivered" => EmailStatus::Delivered,
        "Bounce" | "HardBounce" | "SoftBounce" | "Bounced" => EmailStatus::Bounced,
        "SpamComplaint" => EmailStatus::SpamComplaint,
        "ManuallyDropped" => EmailStatus::Failed,
        "Sent" | "Processed" | "Queued" => EmailStatus::Sent,
        _ => EmailStatus::Sent,
    }
}

/// Inbound mail is delivered the moment Postmark accepts it.
pub fn inbound_status(external: &str) -> EmailStatus {
    match external {
        "Failed" | "Blocked" | "ManuallyDropped" => EmailStatus::Failed,
        _ => EmailStatus::Delivered,
    }
}

/// Status a delivery event moves a message to. Opens and clicks change nothing.
pub fn event_status(record_type: &str) -> Option<EmailStatus> {
    match record_type {
        "Delivery" => Some(EmailStatus::Delivered),
        "Bounce" | "HardBounce" | "SoftBounce" => Some(EmailStatus::Bounced),
        "SpamComplaint" => Some(EmailStatus::SpamComplaint),
        _ => None,
    }
}

pub fn event_type(record_type: &str) -> Option<EmailEventType> {
    match record_type {
        "Delivery" => Some(EmailEventType::Delivered),
        "Bounce" | "HardBounce" | "SoftBounce" => Some(EmailEventType::Bounced),
        "SpamComplaint" => Some(EmailEventType::SpamComplaint),
        "Open" => Some(EmailEventType::Opened),
        "Click" => Some(EmailEventType::Clicked),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_status_table() {
        assert_eq!(message_status("Delivery"), EmailStatus::Delivered);
        assert_eq!(message_status("Delivered"), EmailStatus::Delivered);
        assert_eq!(message_status("HardBounce"), EmailStatus::Bounced);
        assert_eq!(message_status("SoftBounce"), EmailStatus::Bounced);
        assert_eq!(message_status("SpamComplaint"), EmailStatus::SpamComplaint);
        assert_eq!(message_status("ManuallyDropped"), EmailStatus::Failed);
        assert_eq!(message_status("Queued"), EmailStatus::Sent);
        assert_eq!(message_status("Processed"), EmailStatus::Sent);
    }

    #[test]
    fn unknown_and_miscased_statuses_default_to_sent() {
        assert_eq!(message_status("Teleported"), EmailStatus::Sent);
        assert_eq!(message_status("delivery"), EmailStatus::Sent);
        assert_eq!(message_status(""), EmailStatus::Sent);
    }

    #[test]
    fn opens_and_clicks_are_log_only() {
        assert_eq!(event_type("Open"), Some(EmailEventType::Opened));
        assert_eq!(event_type("Click"), Some(EmailEventType::Clicked));
        assert_eq!(event_status("Open"), None);
        assert_eq!(event_status("Click"), None);
    }

    #[test]
    fn sent_and_dropped_are_not_events() {
        for record_type in ["Sent", "Processed", "Queued", "ManuallyDropped", "Transient"] {
            assert_eq!(event_type(record_type), None);
            assert_eq!(event_status(record_type), None);
        }
    }

    #[test]
    fn bounce_family_maps_to_bounced() {
        for record_type in ["Bounce", "HardBounce", "SoftBounce"] {
            assert_eq!(event_status(record_type), Some(EmailStatus::Bounced));
            assert_eq!(event_type(record_type), Some(EmailEventType::Bounced));
        }
    }

    #[test]
    fn inbound_is_delivered_unless_rejected() {
        assert_eq!(inbound_status("Processed"), EmailStatus::Delivered);
        assert_eq!(inbound_status(""), EmailStatus::Delivered);
        assert_eq!(inbound_status("Blocked"), EmailStatus::Failed);
    }
}
