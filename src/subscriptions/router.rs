//! Fan-out of record events to local subscribers.

use crate::cancel::CancellationToken;
use crate::types::{DomainEvent, SubscriberId, Termination, Topic};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::types::EventSink;

/// Where a subscriber's events go.
#[derive(Clone)]
pub(crate) enum Sink {
    /// Callback run inline on the connection thread.
    Push(Arc<dyn EventSink>),
    /// Subscriber-owned unbounded queue.
    Pull(Sender<Arc<DomainEvent>>),
}

/// Internal subscriber state.
pub(crate) struct Subscriber {
    pub(crate) id: SubscriberId,
    pub(crate) topic: Topic,
    sink: Sink,
    cancel: CancellationToken,
    termination: Arc<Mutex<Option<Termination>>>,
}

impl Subscriber {
    pub fn new(
        id: SubscriberId,
        topic: Topic,
        sink: Sink,
        cancel: CancellationToken,
        termination: Arc<Mutex<Option<Termination>>>,
    ) -> Self {
        Self {
            id,
            topic,
            sink,
            cancel,
            termination,
        }
    }

    /// Record the termination and tell the sink, consuming the subscriber.
    pub fn terminate(self, termination: &Termination) {
        *self.termination.lock() = Some(termination.clone());
        if let Sink::Push(sink) = &self.sink {
            let result = panic::catch_unwind(AssertUnwindSafe(|| sink.on_terminated(termination)));
            if result.is_err() {
                warn!(subscriber = self.id.0, topic = %self.topic, "termination callback panicked");
            }
        }
    }
}

/// Routes each record event to every subscriber whose topic matches.
pub(crate) struct EventRouter {
    subscribers: RwLock<BTreeMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    /// Push callbacks slower than this are reported.
    slow_callback_threshold: Duration,
}

impl EventRouter {
    pub fn new(slow_callback_threshold: Duration) -> Self {
        Self {
            subscribers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            slow_callback_threshold,
        }
    }

    pub fn next_id(&self) -> SubscriberId {
        SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn add(&self, subscriber: Subscriber) {
        debug!(subscriber = subscriber.id.0, topic = %subscriber.topic, "subscriber attached");
        self.subscribers.write().insert(subscriber.id, subscriber);
    }

    pub fn remove(&self, id: SubscriberId) -> Option<Subscriber> {
        self.subscribers.write().remove(&id)
    }

    /// Detach every subscriber whose topic satisfies `filter`.
    pub fn remove_where<F>(&self, filter: F) -> Vec<Subscriber>
    where
        F: Fn(&Topic) -> bool,
    {
        let mut subs = self.subscribers.write();
        let ids: Vec<SubscriberId> = subs
            .values()
            .filter(|sub| filter(&sub.topic))
            .map(|sub| sub.id)
            .collect();
        ids.into_iter().filter_map(|id| subs.remove(&id)).collect()
    }

    /// Detach everyone.
    pub fn drain(&self) -> Vec<Subscriber> {
        std::mem::take(&mut *self.subscribers.write())
            .into_values()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Deliver an event to every matching subscriber. Returns how many
    /// subscribers it reached.
    ///
    /// Sinks are collected under the read lock and invoked after it is
    /// released, so a callback may unsubscribe without deadlocking.
    pub fn dispatch(&self, event: DomainEvent) -> usize {
        self.deliver(event, |sub, event| sub.topic.matches(event))
    }

    /// Deliver an event the server addressed to `topic`. Only subscribers
    /// of exactly that topic receive it; the server sends a separate copy
    /// for every other topic the event falls under.
    pub fn dispatch_to(&self, topic: &Topic, event: DomainEvent) -> usize {
        self.deliver(event, |sub, _| sub.topic == *topic)
    }

    fn deliver<F>(&self, event: DomainEvent, wants: F) -> usize
    where
        F: Fn(&Subscriber, &DomainEvent) -> bool,
    {
        let event = Arc::new(event);
        let targets: Vec<(SubscriberId, Sink)> = {
            let subs = self.subscribers.read();
            subs.values()
                .filter(|sub| !sub.cancel.is_cancelled() && wants(sub, &event))
                .map(|sub| (sub.id, sub.sink.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (id, sink) in targets {
            match sink {
                Sink::Pull(sender) => {
                    if sender.send(Arc::clone(&event)).is_ok() {
                        delivered += 1;
                    } else {
                        debug!(subscriber = id.0, "pull queue already closed");
                    }
                }
                Sink::Push(sink) => {
                    let started = Instant::now();
                    let result = panic::catch_unwind(AssertUnwindSafe(|| sink.on_event(&event)));
                    let elapsed = started.elapsed();
                    if result.is_err() {
                        warn!(subscriber = id.0, "event callback panicked");
                    } else {
                        delivered += 1;
                    }
                    if elapsed > self.slow_callback_threshold {
                        warn!(
                            subscriber = id.0,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "slow event callback is holding up the connection"
                        );
                    }
                }
            }
        }

        delivered
    }
}
