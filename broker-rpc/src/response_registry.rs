use std::collections::HashMap;

use bytes::Bytes;
use futures::channel::oneshot::{channel as one_channel, Receiver as OneReceiver, Sender as OneSender};
use log::{debug, trace, warn};

use crate::message::CorrelationId;

/// Pending response slot.
/// `sender` is taken by the consumer loop when the reply arrives,
/// `receiver` is taken by the waiting caller
struct Slot {
    sender: Option<OneSender<Bytes>>,
    receiver: Option<OneReceiver<Bytes>>,
}

impl Slot {
    /// Caller gave up waiting: the receiver was taken and dropped
    fn is_abandoned(&self) -> bool {
        self.receiver.is_none()
            && self
                .sender
                .as_ref()
                .map_or(true, |sender| sender.is_canceled())
    }
}

/// A registry of outgoing requests, which are added before publishing and resolved by the consumer loop
/// after the peer has replied
pub struct ResponseRegistry {
    slots: HashMap<CorrelationId, Slot>,
}

impl ResponseRegistry {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Add a new unset slot
    pub fn create(&mut self, id: CorrelationId) {
        let (sender, receiver) = one_channel();

        trace!("Add new pending request {id}");

        if self
            .slots
            .insert(
                id.clone(),
                Slot {
                    sender: Some(sender),
                    receiver: Some(receiver),
                },
            )
            .is_some()
        {
            warn!("Replaced a pending request with a duplicate id {id}")
        }
    }

    /// Resolve a pending request. Replies to requests we don't track are dropped.
    /// Returns `true` if the payload was handed to a waiter
    pub fn resolve(&mut self, id: &CorrelationId, payload: Bytes) -> bool {
        let Some(slot) = self.slots.get_mut(id) else {
            warn!("Received unexpected reply {id}. Registry doesn't have a matching request");
            return false;
        };

        match slot.sender.take() {
            Some(sender) => {
                if sender.send(payload).is_err() {
                    debug!("Caller stopped waiting for {id}. Dropping the reply");
                    false
                } else {
                    debug!("Succesfully resolved {id} request");
                    true
                }
            }
            None => {
                warn!("Duplicate reply for {id}");
                false
            }
        }
    }

    /// Take a waiter for the request. The slot stays tracked until [ResponseRegistry::remove]
    pub(crate) fn take_waiter(
        &mut self,
        id: &CorrelationId,
    ) -> crate::Result<OneReceiver<Bytes>> {
        self.slots
            .get_mut(id)
            .and_then(|slot| slot.receiver.take())
            .ok_or_else(|| crate::Error::UnknownRequest(id.clone()))
    }

    /// Remove a slot
    pub fn remove(&mut self, id: &CorrelationId) -> bool {
        self.slots.remove(id).is_some()
    }

    /// If the request is still tracked
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.slots.contains_key(id)
    }

    /// Remove slots left by callers which stopped waiting. Returns number of slots removed
    pub fn sweep_abandoned(&mut self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_abandoned());

        let removed = before - self.slots.len();
        if removed > 0 {
            debug!("Swept {removed} abandoned request(s)");
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for ResponseRegistry {
    fn default() -> Self {
        Self::new()
    }
}
