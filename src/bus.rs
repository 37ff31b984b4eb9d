use crate::models::SchedulerState;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub type Listener = Arc<dyn Fn(Arc<SchedulerState>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SubscriptionBus {
    listeners: Arc<Mutex<Vec<(Uuid, Listener)>>>,
}

/// Handle returned by [`SubscriptionBus::subscribe`]. Dropping it keeps the
/// listener registered; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: Uuid,
    bus: SubscriptionBus,
}

impl Subscription {
    pub fn unsubscribe(self) -> bool {
        self.bus.unsubscribe(self.id)
    }
}

impl SubscriptionBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Listener) -> Subscription {
        let id = Uuid::new_v4();
        self.lock().push((id, listener));
        Subscription {
            id,
            bus: self.clone(),
        }
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every listener with `snapshot`. A panicking listener is logged and
    /// skipped; the remaining listeners still run.
    pub fn notify(&self, snapshot: &Arc<SchedulerState>) {
        let listeners = self
            .lock()
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect::<Vec<_>>();

        for (id, listener) in listeners {
            let state = snapshot.clone();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(state))) {
                tracing::error!(
                    subscription_id = %id,
                    panic = %panic_message(payload.as_ref()),
                    "state listener panicked"
                );
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Uuid, Listener)>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::SubscriptionBus;
    use crate::models::SchedulerState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn notifies_until_unsubscribed() {
        let bus = SubscriptionBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let subscription = bus.subscribe(Arc::new(move |_: Arc<SchedulerState>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let snapshot = Arc::new(SchedulerState::new(Vec::new()));
        bus.notify(&snapshot);
        bus.notify(&snapshot);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(subscription.unsubscribe());
        bus.notify(&snapshot);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(bus.is_empty());
    }

    #[test]
    fn panicking_listener_does_not_starve_others() {
        let bus = SubscriptionBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Arc::new(|_: Arc<SchedulerState>| panic!("render failed")));
        let counter = calls.clone();
        bus.subscribe(Arc::new(move |state: Arc<SchedulerState>| {
            assert!(!state.is_running);
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bus.notify(&Arc::new(SchedulerState::new(Vec::new())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.len(), 2);
    }
}
