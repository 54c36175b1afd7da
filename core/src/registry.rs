//! Event type → destination registry.
//!
//! Every event type a service publishes or consumes must be registered exactly
//! once. The registry is built at startup and frozen; resolving an unknown type
//! is a configuration error that should stop the process before it serves
//! traffic.
//!
//! Destinations follow the convention `IntegrationEvents-<EventTypeName>`. The
//! shared `eshop-integration-events` crate registers the whole catalogue so
//! producers and consumers cannot drift apart.

use crate::destinations::EVENT_PREFIX;
use crate::error::EventBusError;
use crate::event::IntegrationEvent;
use std::collections::BTreeMap;

/// Destination name for an event type discriminator.
///
/// # Examples
///
/// ```
/// use eshop_eventbus_core::registry::destination_for;
///
/// assert_eq!(
///     destination_for("OrderStartedIntegrationEvent"),
///     "IntegrationEvents-OrderStartedIntegrationEvent"
/// );
/// ```
#[must_use]
pub fn destination_for(event_name: &str) -> String {
    format!("{EVENT_PREFIX}{event_name}")
}

/// Frozen mapping from event type names to destination names.
#[derive(Debug, Clone, Default)]
pub struct TopicRegistry {
    destinations: BTreeMap<&'static str, String>,
}

impl TopicRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> TopicRegistryBuilder {
        TopicRegistryBuilder::default()
    }

    /// Destination for event type `E`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::UnregisteredEvent`] if `E` was never registered.
    pub fn destination<E: IntegrationEvent>(&self) -> Result<&str, EventBusError> {
        self.destination_of(E::EVENT_NAME)
    }

    /// Destination for an event type name.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::UnregisteredEvent`] if the name is unknown.
    pub fn destination_of(&self, event_name: &str) -> Result<&str, EventBusError> {
        self.destinations
            .get(event_name)
            .map(String::as_str)
            .ok_or_else(|| EventBusError::UnregisteredEvent(event_name.to_string()))
    }

    /// Fail unless `E` is registered.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::UnregisteredEvent`] if `E` was never registered.
    pub fn ensure_registered<E: IntegrationEvent>(&self) -> Result<(), EventBusError> {
        self.destination::<E>().map(|_| ())
    }

    /// Whether an event type name is registered.
    #[must_use]
    pub fn contains(&self, event_name: &str) -> bool {
        self.destinations.contains_key(event_name)
    }

    /// Registered `(event name, destination)` pairs, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.destinations.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Number of registered event types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

/// Builder for [`TopicRegistry`].
///
/// Duplicates are collected rather than rejected immediately so `build()` can
/// report them all at once.
#[derive(Debug, Default)]
pub struct TopicRegistryBuilder {
    destinations: BTreeMap<&'static str, String>,
    duplicates: Vec<&'static str>,
}

impl TopicRegistryBuilder {
    /// Register `E` under the conventional destination name.
    #[must_use]
    pub fn register<E: IntegrationEvent>(self) -> Self {
        let destination = destination_for(E::EVENT_NAME);
        self.register_with_destination::<E>(destination)
    }

    /// Register `E` under an explicit destination name.
    #[must_use]
    pub fn register_with_destination<E: IntegrationEvent>(
        mut self,
        destination: impl Into<String>,
    ) -> Self {
        if self
            .destinations
            .insert(E::EVENT_NAME, destination.into())
            .is_some()
        {
            self.duplicates.push(E::EVENT_NAME);
        }
        self
    }

    /// Merge every entry of an existing registry into this builder.
    #[must_use]
    pub fn extend(mut self, other: &TopicRegistry) -> Self {
        for (name, destination) in &other.destinations {
            if self.destinations.insert(name, destination.clone()).is_some() {
                self.duplicates.push(name);
            }
        }
        self
    }

    /// Freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::DuplicateRegistration`] naming the first event
    /// type that was registered more than once.
    pub fn build(self) -> Result<TopicRegistry, EventBusError> {
        if let Some(name) = self.duplicates.first() {
            return Err(EventBusError::DuplicateRegistration((*name).to_string()));
        }

        Ok(TopicRegistry {
            destinations: self.destinations,
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code can use expect
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Paid {
        order_id: i32,
    }

    impl IntegrationEvent for Paid {
        const EVENT_NAME: &'static str = "OrderStatusChangedToPaidIntegrationEvent";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Shipped {
        order_id: i32,
    }

    impl IntegrationEvent for Shipped {
        const EVENT_NAME: &'static str = "OrderStatusChangedToShippedIntegrationEvent";
    }

    #[test]
    fn resolves_conventional_destination() {
        let registry = TopicRegistry::builder()
            .register::<Paid>()
            .build()
            .expect("no duplicates");

        assert_eq!(
            registry.destination::<Paid>().expect("registered"),
            "IntegrationEvents-OrderStatusChangedToPaidIntegrationEvent"
        );
    }

    #[test]
    fn unregistered_type_is_configuration_error() {
        let registry = TopicRegistry::builder()
            .register::<Paid>()
            .build()
            .expect("no duplicates");

        let err = registry.destination::<Shipped>().expect_err("not registered");
        assert_eq!(
            err,
            EventBusError::UnregisteredEvent("OrderStatusChangedToShippedIntegrationEvent".into())
        );
        assert!(err.is_configuration());
    }

    #[test]
    fn duplicate_registration_fails_build() {
        let result = TopicRegistry::builder()
            .register::<Paid>()
            .register::<Shipped>()
            .register_with_destination::<Paid>("custom")
            .build();

        assert!(matches!(result, Err(EventBusError::DuplicateRegistration(_))));
    }

    #[test]
    fn extend_merges_and_detects_overlap() {
        let base = TopicRegistry::builder().register::<Paid>().build().expect("base");

        let merged = TopicRegistry::builder()
            .register::<Shipped>()
            .extend(&base)
            .build()
            .expect("disjoint");
        assert_eq!(merged.len(), 2);

        let overlap = TopicRegistry::builder().register::<Paid>().extend(&base).build();
        assert!(overlap.is_err());
    }
}
