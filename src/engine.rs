//! The realtime engine: one shared connection, many local subscribers.

use crate::cancel::CancellationToken;
use crate::connection::{Connection, ConnectionEvents};
use crate::error::{RealtimeError, Result};
use crate::registry::TopicRegistry;
use crate::subscriptions::{
    EventRouter, EventSink, PullHandle, PushHandle, Release, Sink, Subscriber,
};
use crate::transport::{HttpTransport, HttpTransportConfig, RealtimeTransport};
use crate::types::{
    ConnectionIdentity, ConnectionState, DomainEvent, ListenerId, SubscriberId, Termination, Topic,
};
use crossbeam_channel::unbounded;
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How long a subscribe waits for the connect frame.
    /// Default: 10s
    pub handshake_timeout: Duration,

    /// Push callbacks running longer than this are logged.
    /// Default: 100ms
    pub slow_callback_threshold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            slow_callback_threshold: Duration::from_millis(100),
        }
    }
}

type Listener = Arc<dyn Fn(&Termination) + Send + Sync>;

/// Subscribers cut loose from an ended connection, still to be told.
struct Detached {
    termination: Termination,
    subscribers: Vec<Subscriber>,
}

/// Shared engine state. Handles reach it through a `Weak`.
pub(crate) struct EngineInner {
    config: EngineConfig,
    transport: Arc<dyn RealtimeTransport>,
    connection: RwLock<Option<Arc<Connection>>>,
    registry: TopicRegistry,
    router: EventRouter,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_connection: AtomicU64,
    next_listener: AtomicU64,
    /// Serialises subscribe, release, and teardown. Held across handshake
    /// waits and control calls; never held while a subscriber or listener
    /// callback runs.
    lifecycle: Mutex<()>,
    this: Weak<EngineInner>,
}

impl EngineInner {
    fn subscribe(
        &self,
        topic: Topic,
        sink: Sink,
        cancel: CancellationToken,
    ) -> Result<(SubscriberId, Arc<Mutex<Option<Termination>>>)> {
        let mut stale = None;
        let result = {
            let _guard = self.lifecycle.lock();
            self.attach(topic, sink, cancel, &mut stale)
        };
        if let Some(detached) = stale {
            self.notify(detached);
        }
        result
    }

    fn attach(
        &self,
        topic: Topic,
        sink: Sink,
        cancel: CancellationToken,
        stale: &mut Option<Detached>,
    ) -> Result<(SubscriberId, Arc<Mutex<Option<Termination>>>)> {
        let connection = self.ensure_started(&cancel, stale)?;

        if let Err(e) = self.registry.register(&connection, &topic) {
            warn!(%topic, error = %e, "topic registration failed");
            self.teardown_if_idle();
            return Err(match (e, connection.termination()) {
                (RealtimeError::NotConnected, Some(ended)) => {
                    RealtimeError::StreamTerminated(ended.reasons)
                }
                (e, _) => e,
            });
        }

        let id = self.router.next_id();
        let termination = Arc::new(Mutex::new(None));
        self.router.add(Subscriber::new(
            id,
            topic.clone(),
            sink,
            cancel,
            Arc::clone(&termination),
        ));
        info!(subscriber = id.0, %topic, connection = connection.id(), "subscribed");
        Ok((id, termination))
    }

    /// Reuse the live connection or start a new one, then wait for its
    /// handshake. A connection that ended without its hook running yet is
    /// detached here and handed back through `stale`.
    fn ensure_started(
        &self,
        cancel: &CancellationToken,
        stale: &mut Option<Detached>,
    ) -> Result<Arc<Connection>> {
        let connection = {
            let mut slot = self.connection.write();
            let live = slot
                .as_ref()
                .filter(|current| current.state().is_alive())
                .cloned();
            match live {
                Some(current) => current,
                None => {
                    if let Some(ended) = slot.take() {
                        *stale = Some(self.detach(&ended, None));
                    }
                    let id = self.next_connection.fetch_add(1, Ordering::SeqCst);
                    let events: Arc<dyn ConnectionEvents> =
                        Arc::new(EngineEvents(self.this.clone()));
                    let connection = Connection::start(id, Arc::clone(&self.transport), events)?;
                    *slot = Some(Arc::clone(&connection));
                    connection
                }
            }
        };

        if let Err(e) = connection.wait_ready(self.config.handshake_timeout, Some(cancel)) {
            warn!(connection = connection.id(), error = %e, "realtime handshake failed");
            self.teardown_if_idle();
            return Err(e);
        }
        Ok(connection)
    }

    /// Stop `ended` and cut its subscribers loose. Caller holds `lifecycle`
    /// and has already emptied the connection slot.
    fn detach(&self, ended: &Connection, termination: Option<Termination>) -> Detached {
        let termination = termination
            .or_else(|| ended.termination())
            .unwrap_or_else(|| Termination::transport("connection lost"));
        ended.close();
        self.registry.reset();
        Detached {
            termination,
            subscribers: self.router.drain(),
        }
    }

    /// Close the connection once nobody is subscribed. Caller holds
    /// `lifecycle`.
    fn teardown_if_idle(&self) {
        if !self.router.is_empty() {
            return;
        }
        let connection = self.connection.write().take();
        if let Some(connection) = connection {
            if let Err(e) = self.registry.deregister_all(&connection) {
                warn!(connection = connection.id(), error = %e, "final topic removal failed");
            }
            info!(connection = connection.id(), "no subscribers left, closing realtime connection");
            connection.close();
        }
    }

    /// Tell detached subscribers, then disconnect listeners. Runs without
    /// any engine lock held.
    fn notify(&self, detached: Detached) {
        let Detached {
            termination,
            subscribers,
        } = detached;
        info!(
            cause = ?termination.cause,
            reasons = ?termination.reasons,
            subscribers = subscribers.len(),
            "realtime connection ended"
        );

        for subscriber in subscribers {
            subscriber.terminate(&termination);
        }

        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener(&termination)));
            if result.is_err() {
                warn!("disconnect listener panicked");
            }
        }
    }

    /// Hook for the decode loop. Ignores connections that are no longer
    /// current.
    fn connection_terminated(&self, id: u64, termination: Termination) {
        let detached = {
            let _guard = self.lifecycle.lock();
            let ended = {
                let mut slot = self.connection.write();
                if slot.as_ref().map(|current| current.id()) == Some(id) {
                    slot.take()
                } else {
                    None
                }
            };
            match ended {
                Some(ended) => self.detach(&ended, Some(termination)),
                None => {
                    debug!(connection = id, "termination from a stale connection");
                    return;
                }
            }
        };
        self.notify(detached);
    }

    /// Remove one subscriber, dropping its topic reference.
    pub(crate) fn release(&self, id: SubscriberId) -> Result<()> {
        let _guard = self.lifecycle.lock();
        let subscriber = match self.router.remove(id) {
            Some(subscriber) => subscriber,
            None => return Ok(()),
        };
        let topic = subscriber.topic.clone();
        drop(subscriber);
        info!(subscriber = id.0, %topic, "unsubscribed");

        let connection = self.connection.read().clone();
        let result = match connection {
            Some(connection) => self.registry.deregister(&connection, &topic),
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!(%topic, error = %e, "topic removal failed");
        }
        self.teardown_if_idle();
        result
    }

    /// Remove every subscriber whose topic satisfies `filter`, and the
    /// topics themselves, in a single control call.
    fn unsubscribe_where<F>(&self, filter: F) -> Result<()>
    where
        F: Fn(&Topic) -> bool,
    {
        let _guard = self.lifecycle.lock();
        let removed = self.router.remove_where(filter);
        if removed.is_empty() {
            return Ok(());
        }

        let mut topics: Vec<Topic> = removed.iter().map(|sub| sub.topic.clone()).collect();
        topics.sort();
        topics.dedup();
        info!(subscribers = removed.len(), ?topics, "unsubscribed");
        drop(removed);

        let connection = self.connection.read().clone();
        let result = match connection {
            Some(connection) => self.registry.remove_topics(&connection, &topics),
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!(error = %e, "topic removal failed");
        }
        self.teardown_if_idle();
        result
    }

    fn shutdown(&self) -> Result<()> {
        let (detached, result) = {
            let _guard = self.lifecycle.lock();
            let connection = self.connection.write().take();
            let result = match &connection {
                Some(connection) => self.registry.deregister_all(connection),
                None => Ok(()),
            };
            self.registry.reset();
            if let Some(connection) = &connection {
                connection.close();
            }

            let subscribers = self.router.drain();
            let detached = if connection.is_some() || !subscribers.is_empty() {
                Some(Detached {
                    termination: Termination::local(),
                    subscribers,
                })
            } else {
                None
            };
            (detached, result)
        };

        if let Some(detached) = detached {
            self.notify(detached);
        }
        result
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.close();
        }
        let subscribers = self.router.drain();
        if !subscribers.is_empty() {
            self.notify(Detached {
                termination: Termination::local(),
                subscribers,
            });
        }
    }
}

/// Routes decode loop output back into the engine.
struct EngineEvents(Weak<EngineInner>);

impl ConnectionEvents for EngineEvents {
    fn on_record(&self, _connection: u64, event: DomainEvent) {
        if let Some(engine) = self.0.upgrade() {
            engine.router.dispatch(event);
        }
    }

    fn on_topic_record(&self, _connection: u64, topic: Topic, event: DomainEvent) {
        if let Some(engine) = self.0.upgrade() {
            engine.router.dispatch_to(&topic, event);
        }
    }

    fn on_terminated(&self, connection: u64, termination: Termination) {
        if let Some(engine) = self.0.upgrade() {
            engine.connection_terminated(connection, termination);
        }
    }
}

/// Realtime subscription engine.
///
/// Multiplexes any number of topic subscriptions over a single streaming
/// connection, opened lazily on the first subscribe and closed when the
/// last subscriber goes. Cloning is cheap; clones share the connection.
///
/// Dropping the last clone closes the connection without contacting the
/// server. Use [`RealtimeEngine::shutdown`] to remove topics first.
#[derive(Clone)]
pub struct RealtimeEngine {
    inner: Arc<EngineInner>,
}

impl RealtimeEngine {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: EngineConfig) -> Self {
        let inner = Arc::new_cyclic(|this| EngineInner {
            registry: TopicRegistry::new(Arc::clone(&transport)),
            router: EventRouter::new(config.slow_callback_threshold),
            transport,
            config,
            connection: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            next_connection: AtomicU64::new(1),
            next_listener: AtomicU64::new(1),
            lifecycle: Mutex::new(()),
            this: this.clone(),
        });
        Self { inner }
    }

    /// Engine over the HTTP transport.
    pub fn http(transport: HttpTransportConfig, config: EngineConfig) -> Result<Self> {
        let transport = HttpTransport::new(transport)?;
        Ok(Self::new(Arc::new(transport), config))
    }

    /// Subscribe and consume events by iterating the returned handle.
    pub fn subscribe(&self, topic: &str) -> Result<PullHandle> {
        self.subscribe_until(topic, &CancellationToken::new())
    }

    /// Like [`RealtimeEngine::subscribe`], but the sequence also ends when
    /// `cancel` fires. Cancelling during the handshake fails the call with
    /// [`RealtimeError::Cancelled`].
    pub fn subscribe_until(&self, topic: &str, cancel: &CancellationToken) -> Result<PullHandle> {
        let topic = Topic::new(topic)?;
        let (sender, events) = unbounded();
        let (id, termination) = self
            .inner
            .subscribe(topic.clone(), Sink::Pull(sender), cancel.clone())?;
        Ok(PullHandle::new(
            id,
            topic,
            events,
            cancel.clone(),
            termination,
            self.release_for(id),
        ))
    }

    /// Subscribe with a callback run on the connection thread.
    pub fn subscribe_with<S>(&self, topic: &str, sink: S) -> Result<PushHandle>
    where
        S: EventSink + 'static,
    {
        let topic = Topic::new(topic)?;
        let (id, termination) = self.inner.subscribe(
            topic.clone(),
            Sink::Push(Arc::new(sink)),
            CancellationToken::new(),
        )?;
        Ok(PushHandle::new(id, topic, termination, self.release_for(id)))
    }

    /// Remove every subscriber of exactly `topic`.
    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        let topic = Topic::new(topic)?;
        self.inner.unsubscribe_where(|candidate| *candidate == topic)
    }

    /// Remove every subscriber whose topic starts with `prefix`.
    pub fn unsubscribe_by_prefix(&self, prefix: &str) -> Result<()> {
        self.inner
            .unsubscribe_where(|candidate| candidate.as_str().starts_with(prefix))
    }

    /// Remove every subscriber. The connection closes afterwards.
    pub fn unsubscribe_all(&self) -> Result<()> {
        self.inner.unsubscribe_where(|_| true)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self.inner.connection.read().as_ref() {
            Some(connection) => connection.state(),
            None => ConnectionState::Disconnected,
        }
    }

    /// Identity assigned by the server to the current connection.
    pub fn connection_id(&self) -> Option<ConnectionIdentity> {
        self.inner
            .connection
            .read()
            .as_ref()
            .and_then(|connection| connection.identity())
    }

    /// Topics currently registered with the server.
    pub fn active_topics(&self) -> Vec<Topic> {
        self.inner.registry.active_topics()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.router.len()
    }

    /// Call `listener` whenever the connection ends, after subscribers have
    /// been told.
    pub fn on_disconnect<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Termination) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::SeqCst));
        self.inner.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(candidate, _)| *candidate != id);
        listeners.len() != before
    }

    /// Remove all topics from the server, close the connection, and end
    /// every subscription with a local termination notice.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shutdown()
    }

    fn release_for(&self, id: SubscriberId) -> Release {
        Release::new(Arc::downgrade(&self.inner), id)
    }
}
