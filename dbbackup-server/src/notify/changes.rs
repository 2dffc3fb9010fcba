use serde_json::Value;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 256;

/// Fan-out of store changes to whoever is listening (dashboard, CLI watchers).
/// `broadcast` never blocks: slow receivers lag and lose events, they never
/// hold up a writer.
#[derive(Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<String>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Publish `{type, payload}` as JSON text. Events written while nobody
    /// listens are dropped.
    pub fn broadcast(&self, event_type: &str, payload: Value) {
        let msg = serde_json::json!({
            "type": event_type,
            "payload": payload,
        });
        let _ = self.tx.send(msg.to_string());
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
