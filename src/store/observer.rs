use super::StoreEvent;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError, unbounded_channel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of a store subscription.
///
/// Events arrive in mutation order. Pass `id()` to `EntityStore::unsubscribe`
/// to deregister; a dropped subscription is pruned on the next notification.
#[derive(Debug)]
pub struct StoreSubscription {
    id: SubscriptionId,
    events: UnboundedReceiver<StoreEvent>,
}

impl StoreSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<StoreEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StoreEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Everything delivered so far, without waiting.
    pub fn drain(&mut self) -> Vec<StoreEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

#[derive(Debug, Default)]
pub(crate) struct ObserverRegistry {
    next_id: u64,
    observers: Vec<(SubscriptionId, UnboundedSender<StoreEvent>)>,
}

impl ObserverRegistry {
    pub(crate) fn subscribe(&mut self) -> StoreSubscription {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        let (tx, rx) = unbounded_channel();
        self.observers.push((id, tx));
        StoreSubscription { id, events: rx }
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    pub(crate) fn notify(&mut self, event: &StoreEvent) {
        self.observers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn clear(&mut self) {
        self.observers.clear();
    }
}
