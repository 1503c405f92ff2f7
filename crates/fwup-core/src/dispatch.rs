//! Notification dispatcher.
//!
//! Routes "value changed" events to the single consumer registered for the
//! source endpoint. Consumers run synchronously on the caller's thread and
//! their return value is handed back to the caller, which lets the state
//! machine turn a notification into a follow-up request without shared
//! mutable state.

use std::collections::HashMap;
use std::fmt;

use tracing::trace;
use uuid::Uuid;

use crate::protocol::VALUE_PROPERTY;
use crate::transport::ChangedFields;

type Consumer<T> = Box<dyn FnMut(&[u8]) -> T + Send>;

pub struct NotificationDispatcher<T> {
    consumers: HashMap<Uuid, Consumer<T>>,
}

impl<T> NotificationDispatcher<T> {
    pub fn new() -> Self {
        Self {
            consumers: HashMap::new(),
        }
    }

    /// Register `consumer` for `endpoint`, replacing any previous one.
    pub fn register<F>(&mut self, endpoint: Uuid, consumer: F)
    where
        F: FnMut(&[u8]) -> T + Send + 'static,
    {
        self.consumers.insert(endpoint, Box::new(consumer));
    }

    pub fn unregister(&mut self, endpoint: Uuid) -> bool {
        self.consumers.remove(&endpoint).is_some()
    }

    pub fn is_registered(&self, endpoint: Uuid) -> bool {
        self.consumers.contains_key(&endpoint)
    }

    /// Deliver a change event.
    ///
    /// Returns `None` without invoking anything when the event carries no
    /// value, an empty value, or targets an endpoint nobody listens on.
    pub fn dispatch(&mut self, endpoint: Uuid, changed: &ChangedFields) -> Option<T> {
        let value = match changed.get(VALUE_PROPERTY) {
            Some(v) if !v.is_empty() => v,
            _ => {
                trace!(%endpoint, "Ignoring change event without a value");
                return None;
            }
        };

        match self.consumers.get_mut(&endpoint) {
            Some(consumer) => Some(consumer(value)),
            None => {
                trace!(%endpoint, "No consumer registered, dropping event");
                None
            }
        }
    }
}

impl<T> Default for NotificationDispatcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for NotificationDispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("endpoints", &self.consumers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FWUPDATE_BOOT_NOTIFY_UUID, FWUPDATE_VERSION_UUID};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_dispatch_to_registered_consumer() {
        let mut d = NotificationDispatcher::new();
        d.register(FWUPDATE_BOOT_NOTIFY_UUID, |v: &[u8]| v.len());

        let out = d.dispatch(FWUPDATE_BOOT_NOTIFY_UUID, &ChangedFields::with_value(vec![1, 2, 3, 4]));
        assert_eq!(out, Some(4));
    }

    #[test]
    fn test_unregistered_endpoint_is_dropped() {
        let calls = Arc::new(Mutex::new(0));
        let c = calls.clone();
        let mut d = NotificationDispatcher::new();
        d.register(FWUPDATE_BOOT_NOTIFY_UUID, move |_: &[u8]| {
            *c.lock().unwrap() += 1;
        });

        let out = d.dispatch(FWUPDATE_VERSION_UUID, &ChangedFields::with_value(vec![1]));
        assert!(out.is_none());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_empty_or_missing_value_is_ignored() {
        let calls = Arc::new(Mutex::new(0));
        let c = calls.clone();
        let mut d = NotificationDispatcher::new();
        d.register(FWUPDATE_BOOT_NOTIFY_UUID, move |_: &[u8]| {
            *c.lock().unwrap() += 1;
        });

        assert!(d.dispatch(FWUPDATE_BOOT_NOTIFY_UUID, &ChangedFields::new()).is_none());
        assert!(d
            .dispatch(FWUPDATE_BOOT_NOTIFY_UUID, &ChangedFields::with_value(Vec::new()))
            .is_none());

        let mut other = ChangedFields::new();
        other.insert("Notifying", vec![1]);
        assert!(d.dispatch(FWUPDATE_BOOT_NOTIFY_UUID, &other).is_none());

        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_register_replaces_previous() {
        let mut d = NotificationDispatcher::new();
        d.register(FWUPDATE_BOOT_NOTIFY_UUID, |_: &[u8]| "first");
        d.register(FWUPDATE_BOOT_NOTIFY_UUID, |_: &[u8]| "second");

        let out = d.dispatch(FWUPDATE_BOOT_NOTIFY_UUID, &ChangedFields::with_value(vec![0]));
        assert_eq!(out, Some("second"));

        assert!(d.unregister(FWUPDATE_BOOT_NOTIFY_UUID));
        assert!(!d.is_registered(FWUPDATE_BOOT_NOTIFY_UUID));
        assert!(d
            .dispatch(FWUPDATE_BOOT_NOTIFY_UUID, &ChangedFields::with_value(vec![0]))
            .is_none());
    }
}
