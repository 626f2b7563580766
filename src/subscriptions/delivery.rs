//! Per-subscriber delivery queue.
//!
//! Producers never block: the queue is an unbounded channel. Pullers block on
//! the receiving side and see the end of the stream once the queue is closed
//! and drained. Registering a listener switches the queue to flowing mode,
//! where pushes are handed to the listeners instead of being queued.

use crate::types::Message;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

/// Callback-style consumer.
pub type MessageListener = Arc<dyn Fn(&Message) + Send + Sync>;

struct DeliveryState {
    /// `None` once closed.
    sender: Option<Sender<Message>>,
    listeners: Vec<MessageListener>,
}

pub(crate) struct DeliveryQueue {
    receiver: Receiver<Message>,
    state: Mutex<DeliveryState>,
}

impl DeliveryQueue {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            receiver,
            state: Mutex::new(DeliveryState {
                sender: Some(sender),
                listeners: Vec::new(),
            }),
        }
    }

    /// Hand a message to the listeners, or queue it for pullers.
    /// Returns false if the queue is closed.
    pub(crate) fn enqueue(&self, message: Message) -> bool {
        let listeners = {
            let state = self.state.lock();
            let Some(sender) = state.sender.as_ref() else {
                return false;
            };
            if state.listeners.is_empty() {
                // Cannot fail: we hold a receiver ourselves.
                return sender.send(message).is_ok();
            }
            state.listeners.clone()
        };

        for listener in &listeners {
            listener(&message);
        }
        true
    }

    /// Register a listener. Anything already queued is drained into it first.
    pub(crate) fn add_listener(&self, listener: MessageListener) {
        let backlog: Vec<Message> = {
            let mut state = self.state.lock();
            state.listeners.push(Arc::clone(&listener));
            self.receiver.try_iter().collect()
        };

        for message in &backlog {
            listener(message);
        }
    }

    /// Close the queue. Returns true the first time only.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock();
        state.listeners.clear();
        state.sender.take().is_some()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().sender.is_none()
    }

    pub(crate) fn receiver(&self) -> &Receiver<Message> {
        &self.receiver
    }

    pub(crate) fn len(&self) -> usize {
        self.receiver.len()
    }
}
