mod client;
pub mod mapping;
mod task;
pub mod types;

pub use client::{DeliveryApi, PostmarkClient};
pub use task::{PostmarkReconciliationTask, TASK_ID};
pub use types::{DateRange, InboundMessage, MessageEvent, OutboundMessage};
