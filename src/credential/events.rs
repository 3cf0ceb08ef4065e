//! In-process event bus: topic-keyed, synchronously invoked pub/sub used to
//! break the cyclic dependency between the routing strategy, the dispatcher
//! and the credential manager. Subscribers are plain closures; there is no
//! queueing or async delivery, so handlers must be cheap (update an
//! in-memory cache, not make a network call).

use super::model::ChangeReason;
use std::sync::RwLock;

/// Topics a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    CredentialChanged,
    CredentialBanned,
    CredentialRecovered,
    UsageSample,
}

/// Payload delivered to subscribers. `credential_id` is empty for
/// bus-wide notifications (none currently defined, but kept for symmetry).
#[derive(Debug, Clone)]
pub struct CredentialEvent {
    pub credential_id: String,
    pub reason: ChangeReason,
}

type Listener = Box<dyn Fn(&CredentialEvent) + Send + Sync>;

/// A synchronous, in-process publish/subscribe bus. Cloning an [`EventBus`]
/// shares the same subscriber lists (it's a thin handle, not a deep copy).
#[derive(Default)]
pub struct EventBus {
    credential_changed: RwLock<Vec<Listener>>,
    credential_banned: RwLock<Vec<Listener>>,
    credential_recovered: RwLock<Vec<Listener>>,
    usage_sample: RwLock<Vec<Listener>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self, topic: Topic) -> &RwLock<Vec<Listener>> {
        match topic {
            Topic::CredentialChanged => &self.credential_changed,
            Topic::CredentialBanned => &self.credential_banned,
            Topic::CredentialRecovered => &self.credential_recovered,
            Topic::UsageSample => &self.usage_sample,
        }
    }

    /// Registers `listener` under `topic`. Returns nothing resembling a
    /// subscription handle: listeners live for the lifetime of the bus,
    /// which in practice is the lifetime of the process.
    pub fn subscribe(&self, topic: Topic, listener: impl Fn(&CredentialEvent) + Send + Sync + 'static) {
        self.listeners(topic)
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Box::new(listener));
    }

    pub fn publish(&self, topic: Topic, event: CredentialEvent) {
        let guard = self.listeners(topic).read().unwrap_or_else(|p| p.into_inner());
        for listener in guard.iter() {
            listener(&event);
        }
    }

    /// Sugar for subscribing to [`Topic::CredentialChanged`] — the hook the
    /// routing strategy and dispatcher client cache use to invalidate their
    /// own per-credential state without holding a reference back into the
    /// credential manager.
    pub fn register_invalidation_hook(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.subscribe(Topic::CredentialChanged, move |event| {
            listener(&event.credential_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn publish_invokes_subscribed_listeners_only() {
        let bus = EventBus::new();
        let changed = Arc::new(AtomicUsize::new(0));
        let banned = Arc::new(AtomicUsize::new(0));

        let c = changed.clone();
        bus.subscribe(Topic::CredentialChanged, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let b = banned.clone();
        bus.subscribe(Topic::CredentialBanned, move |_| {
            b.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(
            Topic::CredentialChanged,
            CredentialEvent {
                credential_id: "a".into(),
                reason: ChangeReason::Refreshed,
            },
        );

        assert_eq!(changed.load(Ordering::SeqCst), 1);
        assert_eq!(banned.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalidation_hook_receives_credential_id() {
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.register_invalidation_hook(move |id| s.lock().unwrap().push(id.to_string()));

        bus.publish(
            Topic::CredentialChanged,
            CredentialEvent {
                credential_id: "cred-1".into(),
                reason: ChangeReason::Banned,
            },
        );

        assert_eq!(seen.lock().unwrap().as_slice(), ["cred-1"]);
    }
}
