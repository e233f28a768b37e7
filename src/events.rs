//! Post-commit event publication over NATS.

use tracing::{debug, warn};

use crate::domain::events::DomainEvent;

#[derive(Clone, Debug, Default)]
pub struct EventPublisher {
    nats: Option<async_nats::Client>,
}

impl EventPublisher {
    pub fn new(nats: Option<async_nats::Client>) -> Self { Self { nats } }

    /// Publisher that drops every event; used when `NATS_URL` is unset.
    pub fn disabled() -> Self { Self::default() }

    pub fn is_enabled(&self) -> bool { self.nats.is_some() }

    /// Publishes each event on its subject. Failures are logged and swallowed:
    /// the state change has already committed.
    pub async fn publish_all(&self, events: Vec<DomainEvent>) {
        let Some(client) = &self.nats else { return };
        for event in events {
            let subject = event.subject();
            let payload = match serde_json::to_vec(&event) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(subject, error = %e, "failed to encode domain event");
                    continue;
                }
            };
            match client.publish(subject.to_string(), payload.into()).await {
                Ok(()) => debug!(subject, "published domain event"),
                Err(e) => warn!(subject, error = %e, "failed to publish domain event"),
            }
        }
    }
}
