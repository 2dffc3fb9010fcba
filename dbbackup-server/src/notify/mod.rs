//! Outbound notifications: live change events and finalized summaries.

pub mod changes;
pub mod webhook;

pub use changes::ChangeNotifier;
pub use webhook::{LogNotifier, SummaryNotifier, WebhookNotifier};
