//! Domain model: value objects, aggregates, pricing and events.
pub mod aggregates;
pub mod events;
pub mod pricing;
pub mod value_objects;
