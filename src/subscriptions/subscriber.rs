//! The subscriber state machine.

use crate::bus::Registry;
use crate::error::{BusError, Result};
use crate::matcher;
use crate::retention::RetentionBuffer;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::types::{BufferingState, Lifecycle, Message, RelayMode, SubscriberId};
use crossbeam_channel::{bounded, Receiver, RecvError, RecvTimeoutError, TryRecvError};
use parking_lot::{Mutex, ReentrantMutex};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::delivery::{DeliveryQueue, MessageListener};
use super::types::{SubscribeOptions, Transform};

type CutoverListener = Box<dyn FnOnce(Duration) + Send + 'static>;
type CloseListener = Box<dyn FnOnce() + Send + 'static>;

/// Mutable subscriber state.
struct SubscriberState {
    lifecycle: Lifecycle,
    buffering: BufferingState,
    retention: Option<RetentionBuffer<Message>>,
    /// Whether attached relays are fed.
    relaying: bool,
    downstreams: BTreeMap<SubscriberId, Subscriber>,
    relayer: Option<Weak<SubscriberInner>>,
    timer: Option<TimerHandle>,
    /// Bumped on every arm and every fire; stale fires compare unequal.
    timer_generation: u64,
    cutover_listeners: Vec<CutoverListener>,
    close_listeners: Vec<CloseListener>,
}

struct SubscriberInner {
    id: SubscriberId,
    pattern: Message,
    transform: Option<Transform>,
    relay_mode: RelayMode,
    registry: Weak<Registry>,
    scheduler: Arc<dyn Scheduler>,
    queue: DeliveryQueue,
    /// Serializes retain + forward + enqueue so every path sees one order.
    /// Reentrant so a transform or listener may publish on the same thread.
    fanout: ReentrantMutex<()>,
    state: Mutex<SubscriberState>,
}

/// A registered consumer: a pattern, a delivery queue, and optional
/// retention and relay behavior.
///
/// Cloning yields another handle to the same subscriber. Clones pulling
/// concurrently compete for messages.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    pub(crate) fn new(
        id: SubscriberId,
        pattern: Message,
        options: SubscribeOptions,
        registry: Weak<Registry>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let (buffering, retention) = if options.retain {
            (
                BufferingState::Retaining,
                Some(RetentionBuffer::new(options.max)),
            )
        } else {
            (BufferingState::NotRetaining, None)
        };

        let subscriber = Self {
            inner: Arc::new(SubscriberInner {
                id,
                pattern,
                transform: options.map,
                relay_mode: options.relay_mode,
                registry,
                scheduler,
                queue: DeliveryQueue::new(),
                fanout: ReentrantMutex::new(()),
                state: Mutex::new(SubscriberState {
                    lifecycle: Lifecycle::Active,
                    buffering,
                    retention,
                    relaying: options.relays,
                    downstreams: BTreeMap::new(),
                    relayer: None,
                    timer: None,
                    timer_generation: 0,
                    cutover_listeners: Vec::new(),
                    close_listeners: Vec::new(),
                }),
            }),
        };

        if options.retain {
            // Bounds memory for a retaining subscriber nobody ever cuts over.
            subscriber.arm_cutover(options.fallback_cutover);
        }

        subscriber
    }

    fn from_inner(inner: Arc<SubscriberInner>) -> Self {
        Self { inner }
    }

    // --- Introspection ---

    /// Registry id, unique within the bus.
    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    /// The pattern this subscriber was registered with.
    pub fn pattern(&self) -> &Message {
        &self.inner.pattern
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    /// Current retention state.
    pub fn buffering(&self) -> BufferingState {
        self.inner.state.lock().buffering
    }

    /// True until `destroy` is called.
    pub fn is_active(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }

    /// Copy of the retention buffer, oldest first.
    pub fn retained(&self) -> Vec<Message> {
        self.inner
            .state
            .lock()
            .retention
            .as_ref()
            .map(RetentionBuffer::snapshot)
            .unwrap_or_default()
    }

    /// Number of attached relays.
    pub fn downstream_count(&self) -> usize {
        self.inner.state.lock().downstreams.len()
    }

    /// Whether a live upstream relays into this subscriber.
    pub fn has_relayer(&self) -> bool {
        self.relayer().is_some()
    }

    /// Messages queued and not yet pulled.
    pub fn len(&self) -> usize {
        self.inner.queue.len()
    }

    /// True if nothing is waiting to be pulled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the delivery stream has been ended or destroyed.
    pub fn is_closed(&self) -> bool {
        self.inner.queue.is_closed()
    }

    fn relayer(&self) -> Option<Arc<SubscriberInner>> {
        self.inner
            .state
            .lock()
            .relayer
            .as_ref()
            .and_then(Weak::upgrade)
    }

    // --- Delivery ---

    /// Push `message` if it satisfies this subscriber's pattern.
    ///
    /// Returns whether the message was accepted. Inactive subscribers accept
    /// nothing.
    pub fn push_on_match(&self, message: &Message) -> Result<bool> {
        if !self.is_active() || !matcher::matches(message, &self.inner.pattern) {
            return Ok(false);
        }
        self.push(message.clone())?;
        Ok(true)
    }

    /// Transform, retain, relay and enqueue a message. Never blocks on
    /// consumers.
    ///
    /// Fails only if the transform fails, in which case nothing is retained,
    /// relayed or delivered.
    pub fn push(&self, message: Message) -> Result<()> {
        if !self.is_active() {
            trace!(subscriber = %self.id(), "push to inactive subscriber ignored");
            return Ok(());
        }

        let message = match &self.inner.transform {
            Some(transform) => transform(message)?,
            None => message,
        };

        let _gate = self.inner.fanout.lock();

        let downstreams: Vec<Subscriber> = {
            let mut state = self.inner.state.lock();
            if state.buffering.is_retaining() {
                if let Some(buffer) = state.retention.as_mut() {
                    if buffer.push(message.clone()).is_some() {
                        trace!(
                            subscriber = %self.inner.id,
                            max = buffer.capacity(),
                            "retention full, evicted oldest"
                        );
                    }
                }
            }
            if state.relaying {
                state.downstreams.values().cloned().collect()
            } else {
                Vec::new()
            }
        };

        for downstream in &downstreams {
            self.forward(downstream, &message);
        }

        self.inner.queue.enqueue(message);
        Ok(())
    }

    /// Enqueue directly, bypassing pattern, transform, retention and relays.
    fn deliver(&self, message: Message) {
        if self.is_active() {
            self.inner.queue.enqueue(message);
        }
    }

    fn forward(&self, downstream: &Subscriber, message: &Message) {
        match self.inner.relay_mode {
            RelayMode::Filtered => {
                if let Err(e) = downstream.push_on_match(message) {
                    warn!(
                        upstream = %self.inner.id,
                        downstream = %downstream.id(),
                        error = %e,
                        "relay forward failed"
                    );
                }
            }
            RelayMode::Raw => downstream.deliver(message.clone()),
        }
    }

    // --- Consumption ---

    /// Pull the next message, blocking while the queue is empty. Errors once
    /// the stream has ended and is drained.
    pub fn recv(&self) -> std::result::Result<Message, RecvError> {
        self.inner.queue.receiver().recv()
    }

    /// Pull the next message without blocking.
    pub fn try_recv(&self) -> std::result::Result<Message, TryRecvError> {
        self.inner.queue.receiver().try_recv()
    }

    /// Pull the next message, waiting at most `timeout`.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<Message, RecvTimeoutError> {
        self.inner.queue.receiver().recv_timeout(timeout)
    }

    /// Pull the next message and decode it. `Ok(None)` means end of stream.
    pub fn recv_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.recv() {
            Ok(message) => Ok(Some(serde_json::from_value(message)?)),
            Err(RecvError) => Ok(None),
        }
    }

    /// Blocking iterator over delivered messages; ends with the stream.
    pub fn iter(&self) -> crossbeam_channel::Iter<'_, Message> {
        self.inner.queue.receiver().iter()
    }

    /// Switch to callback-style consumption. Queued messages are handed to
    /// `listener` first, then every later delivery in order.
    pub fn on_message<F>(&self, listener: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let listener: MessageListener = Arc::new(listener);
        // Held until the backlog is handed over, so no live push overtakes it.
        let _gate = self.inner.fanout.lock();
        self.inner.queue.add_listener(listener);
    }

    /// End the delivery stream. Pullers drain what is queued, then stop.
    /// Registry membership, retention and relays are left alone.
    pub fn end(&self) {
        self.close_stream();
    }

    /// Run `listener` when the delivery stream closes (end or destroy).
    /// Runs immediately if already closed.
    pub fn on_close<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if !self.inner.queue.is_closed() {
                state.close_listeners.push(Box::new(listener));
                return;
            }
        }
        listener();
    }

    fn close_stream(&self) {
        let listeners = {
            let _gate = self.inner.fanout.lock();
            if !self.inner.queue.close() {
                return;
            }
            let mut state = self.inner.state.lock();
            state.relayer = None;
            std::mem::take(&mut state.close_listeners)
        };
        debug!(subscriber = %self.inner.id, "delivery stream closed");

        for listener in listeners {
            listener();
        }
    }

    // --- Relay ---

    /// Attach `downstream` for continuous replication and return it.
    ///
    /// Retained history is replayed into it before any live forwarding. The
    /// attachment is removed when `downstream` closes.
    ///
    /// Relaying from an upstream that is being destroyed, or into a
    /// downstream whose stream is closed, attaches nothing.
    pub fn relay(&self, downstream: &Subscriber) -> Result<Subscriber> {
        if self.is_fed_by(downstream) {
            return Err(BusError::RelayCycle {
                upstream: self.id(),
                downstream: downstream.id(),
            });
        }

        if !self.is_active() {
            debug!(
                upstream = %self.inner.id,
                downstream = %downstream.id(),
                "relay from inactive upstream ignored"
            );
            return Ok(downstream.clone());
        }

        {
            let mut state = downstream.inner.state.lock();
            if downstream.inner.queue.is_closed() {
                debug!(
                    upstream = %self.inner.id,
                    downstream = %downstream.id(),
                    "relay into closed downstream ignored"
                );
                return Ok(downstream.clone());
            }
            match state.relayer.as_ref().and_then(Weak::upgrade) {
                Some(existing) if Arc::ptr_eq(&existing, &self.inner) => {
                    return Ok(downstream.clone());
                }
                Some(_) => {
                    return Err(BusError::DuplicateRelayer {
                        downstream: downstream.id(),
                    });
                }
                None => state.relayer = Some(Arc::downgrade(&self.inner)),
            }
        }

        {
            let _gate = self.inner.fanout.lock();
            let replay = {
                let mut state = self.inner.state.lock();
                // Destruction may have started since the check above.
                if state.lifecycle != Lifecycle::Active {
                    drop(state);
                    downstream.release_relayer(&self.inner);
                    return Ok(downstream.clone());
                }
                state
                    .downstreams
                    .insert(downstream.id(), downstream.clone());
                state
                    .retention
                    .as_ref()
                    .map(RetentionBuffer::snapshot)
                    .unwrap_or_default()
            };

            debug!(
                upstream = %self.inner.id,
                downstream = %downstream.id(),
                replayed = replay.len(),
                "relay attached"
            );

            for message in &replay {
                self.forward(downstream, message);
            }
        }

        let upstream = Arc::downgrade(&self.inner);
        let downstream_id = downstream.id();
        downstream.on_close(move || {
            if let Some(upstream) = upstream.upgrade() {
                Subscriber::from_inner(upstream).detach(downstream_id);
            }
        });

        Ok(downstream.clone())
    }

    /// Suspend or resume forwarding to attached relays.
    pub fn set_relaying(&self, relaying: bool) {
        self.inner.state.lock().relaying = relaying;
    }

    fn detach(&self, downstream: SubscriberId) {
        if self
            .inner
            .state
            .lock()
            .downstreams
            .remove(&downstream)
            .is_some()
        {
            debug!(upstream = %self.inner.id, %downstream, "relay detached");
        }
    }

    /// True if `other` is this subscriber or one of its relayers, directly or
    /// transitively.
    fn is_fed_by(&self, other: &Subscriber) -> bool {
        let mut cursor = Some(Arc::clone(&self.inner));
        while let Some(node) = cursor {
            if Arc::ptr_eq(&node, &other.inner) {
                return true;
            }
            cursor = Subscriber::from_inner(node).relayer();
        }
        false
    }

    fn release_relayer(&self, upstream: &Arc<SubscriberInner>) {
        let mut state = self.inner.state.lock();
        let ours = state
            .relayer
            .as_ref()
            .is_some_and(|r| r.as_ptr() == Arc::as_ptr(upstream));
        if ours {
            state.relayer = None;
        }
    }

    // --- Cutover ---

    /// Arm (or re-arm) the cutover timer. When it fires the retention buffer
    /// is released for good and the `on_cutover` listeners get `after`.
    ///
    /// Ignored once destruction has started.
    pub fn cutover(&self, after: Duration) {
        if !self.is_active() {
            return;
        }
        self.arm_cutover(after);
    }

    fn arm_cutover(&self, after: Duration) {
        let generation = {
            let mut state = self.inner.state.lock();
            state.timer_generation += 1;
            state.timer = None;
            state.timer_generation
        };

        let weak = Arc::downgrade(&self.inner);
        let handle = self.inner.scheduler.schedule(
            after,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Subscriber::from_inner(inner).complete_cutover(generation, after);
                }
            }),
        );

        let mut state = self.inner.state.lock();
        // The timer may already have fired, or been re-armed meanwhile.
        if state.timer_generation == generation {
            state.timer = Some(handle);
        }
        trace!(subscriber = %self.inner.id, ?after, "cutover armed");
    }

    fn complete_cutover(&self, generation: u64, after: Duration) {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.timer_generation != generation {
                return;
            }
            state.timer_generation += 1;
            state.timer = None;
            state.retention = None;
            state.buffering = BufferingState::CutOver;
            std::mem::take(&mut state.cutover_listeners)
        };
        debug!(subscriber = %self.inner.id, ?after, "cutover complete");

        for listener in listeners {
            listener(after);
        }
    }

    /// Run `listener` with the delay used when the next cutover fires.
    pub fn on_cutover<F>(&self, listener: F)
    where
        F: FnOnce(Duration) + Send + 'static,
    {
        self.inner
            .state
            .lock()
            .cutover_listeners
            .push(Box::new(listener));
    }

    /// One-shot channel carrying the delay of the next cutover.
    pub fn cutover_signal(&self) -> Receiver<Duration> {
        let (tx, rx) = bounded(1);
        self.on_cutover(move |after| {
            let _ = tx.try_send(after);
        });
        rx
    }

    // --- Destroy ---

    /// Deregister at once, then force a cutover and finish destruction when
    /// it fires. Idempotent.
    pub fn destroy(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.lifecycle != Lifecycle::Active {
                return;
            }
            state.lifecycle = Lifecycle::Destroying;

            let weak = Arc::downgrade(&self.inner);
            state.cutover_listeners.push(Box::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    Subscriber::from_inner(inner).finish_destroy();
                }
            }));
        }

        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(self.inner.id);
        }
        debug!(subscriber = %self.inner.id, "destroying");

        self.arm_cutover(Duration::ZERO);
    }

    fn finish_destroy(&self) {
        let downstreams = {
            let mut state = self.inner.state.lock();
            state.lifecycle = Lifecycle::Destroyed;
            std::mem::take(&mut state.downstreams)
        };

        self.close_stream();

        for downstream in downstreams.values() {
            downstream.release_relayer(&self.inner);
        }
        debug!(subscriber = %self.inner.id, "destroyed");
    }
}

impl<'a> IntoIterator for &'a Subscriber {
    type Item = Message;
    type IntoIter = crossbeam_channel::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Subscriber {}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Subscriber")
            .field("id", &self.inner.id)
            .field("pattern", &self.inner.pattern)
            .field("lifecycle", &state.lifecycle)
            .field("buffering", &state.buffering)
            .field("downstreams", &state.downstreams.len())
            .finish()
    }
}
