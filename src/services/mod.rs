//! Application services.
//!
//! [`Engine`] is the explicit context every operation runs through: it owns the
//! store handle, the policy switches and the event publisher. Each public
//! operation opens one unit of work, applies every mutation inside it, commits,
//! and only then publishes the domain events it collected.

use crate::config::Policies;
use crate::domain::events::DomainEvent;
use crate::events::EventPublisher;
use crate::store::Store;

mod checkout;
mod coupons;
mod discounts;
mod orders;
mod wallet;

pub use wallet::{Page, Reconciliation, MAX_PAGE_SIZE};

#[derive(Clone)]
pub struct Engine<S: Store> {
    store: S,
    policies: Policies,
    events: EventPublisher,
}

impl<S: Store> Engine<S> {
    pub fn new(store: S, policies: Policies, events: EventPublisher) -> Self { Self { store, policies, events } }

    pub fn store(&self) -> &S { &self.store }

    pub fn policies(&self) -> &Policies { &self.policies }

    async fn publish(&self, events: Vec<DomainEvent>) {
        if !events.is_empty() { self.events.publish_all(events).await; }
    }
}
