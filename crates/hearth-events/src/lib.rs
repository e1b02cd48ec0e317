use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Event envelope published on the bus (RFC3339 time, millisecond precision).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// Broadcast bus for JSON-serializable appliance events.
///
/// Delivery is best-effort: publishing never blocks, observers that lag
/// past the channel capacity lose the oldest events, and there is no
/// replay for observers that subscribe late. Anything that must survive a
/// reconnect has to be re-derived from the durable store, not the bus.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Number of observers currently subscribed.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val = serde_json::to_value(payload).unwrap_or_else(|err| {
            tracing::warn!(kind, %err, "event payload failed to serialize");
            serde_json::json!({"_ser": "error"})
        });
        let _ = self.tx.send(Envelope {
            time: now,
            kind: kind.to_string(),
            payload: val,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish("demo.kind", &json!({"n": 1}));
        let env = rx.recv().await.expect("event");
        assert_eq!(env.kind, "demo.kind");
        assert_eq!(env.payload["n"], 1);
        assert!(!env.time.is_empty());
    }

    #[tokio::test]
    async fn late_subscriber_never_sees_prior_events() {
        let bus = Bus::new(8);
        bus.publish("demo.kind", &json!({"n": 1}));
        let mut rx = bus.subscribe();
        bus.publish("demo.kind", &json!({"n": 2}));
        let env = rx.recv().await.expect("event");
        assert_eq!(env.payload["n"], 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let bus = Bus::new(8);
        bus.publish("demo.kind", &json!({}));
        assert_eq!(bus.receiver_count(), 0);
    }
}
