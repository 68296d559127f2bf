//! Consumer-facing subscription handles.

use crate::cancel::CancellationToken;
use crate::engine::EngineInner;
use crate::error::Result;
use crate::types::{DomainEvent, SubscriberId, Termination, Topic};
use crossbeam_channel::{after, never, select, Receiver, TryRecvError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::warn;

/// Receiver of push-style deliveries.
///
/// Both methods run on the connection thread. They should return quickly:
/// every other subscriber waits while a callback runs.
///
/// A callback may close its own handle or any other, but closing waits for
/// a subscribe or unsubscribe already running on another thread, control
/// request included. Until then no further events are delivered on the
/// connection. A callback that must not stall should hand the handle to
/// another thread to close.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &DomainEvent);

    /// The connection ended. Not called for local unsubscribes.
    fn on_terminated(&self, _termination: &Termination) {}
}

impl<F> EventSink for F
where
    F: Fn(&DomainEvent) + Send + Sync,
{
    fn on_event(&self, event: &DomainEvent) {
        self(event)
    }
}

/// Unsubscribes exactly once, on close or drop.
pub(crate) struct Release {
    engine: Weak<EngineInner>,
    id: SubscriberId,
    done: AtomicBool,
}

impl Release {
    pub fn new(engine: Weak<EngineInner>, id: SubscriberId) -> Self {
        Self {
            engine,
            id,
            done: AtomicBool::new(false),
        }
    }

    pub fn run(&self) -> Result<()> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.engine.upgrade() {
            Some(engine) => engine.release(self.id),
            None => Ok(()),
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        if let Err(e) = self.run() {
            warn!(subscriber = self.id.0, error = %e, "unsubscribe on drop failed");
        }
    }
}

/// Handle for a callback subscription. Dropping it unsubscribes.
pub struct PushHandle {
    id: SubscriberId,
    topic: Topic,
    termination: Arc<Mutex<Option<Termination>>>,
    release: Release,
}

impl PushHandle {
    pub(crate) fn new(
        id: SubscriberId,
        topic: Topic,
        termination: Arc<Mutex<Option<Termination>>>,
        release: Release,
    ) -> Self {
        Self {
            id,
            topic,
            termination,
            release,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// The termination notice, if the connection ended under this handle.
    pub fn termination(&self) -> Option<Termination> {
        self.termination.lock().clone()
    }

    /// Unsubscribe now and report whether the server accepted the removal.
    ///
    /// Called from inside a callback, this blocks the connection thread
    /// until the engine is free; see [`EventSink`].
    pub fn close(self) -> Result<()> {
        self.release.run()
    }
}

/// Handle for a pull subscription: a blocking iterator of events.
///
/// The sequence ends when the handle's token is cancelled, the topic is
/// unsubscribed, or the connection terminates. Unsubscribing happens once:
/// when the token fires, when the sequence ends, or when the handle drops,
/// whichever comes first. A cancelled handle that is never polled again
/// still lets go of its topic.
pub struct PullHandle {
    id: SubscriberId,
    topic: Topic,
    events: Receiver<Arc<DomainEvent>>,
    cancel: CancellationToken,
    termination: Arc<Mutex<Option<Termination>>>,
    release: Arc<Release>,
}

impl PullHandle {
    pub(crate) fn new(
        id: SubscriberId,
        topic: Topic,
        events: Receiver<Arc<DomainEvent>>,
        cancel: CancellationToken,
        termination: Arc<Mutex<Option<Termination>>>,
        release: Release,
    ) -> Self {
        let release = Arc::new(release);
        let on_cancel = Arc::downgrade(&release);
        let cancelled_topic = topic.clone();
        cancel.on_cancel(move || {
            if let Some(release) = on_cancel.upgrade() {
                if let Err(e) = release.run() {
                    warn!(
                        subscriber = id.0,
                        topic = %cancelled_topic,
                        error = %e,
                        "unsubscribe on cancel failed"
                    );
                }
            }
        });

        Self {
            id,
            topic,
            events,
            cancel,
            termination,
            release,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Token that ends this sequence when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination.lock().clone()
    }

    /// True once the sequence has ended.
    pub fn is_finished(&self) -> bool {
        self.release.is_done()
    }

    /// Wait up to `timeout` for the next event. `None` means either the
    /// timeout passed or the sequence ended; see [`PullHandle::is_finished`].
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Arc<DomainEvent>> {
        self.wait(Some(Instant::now() + timeout))
    }

    /// Take an already-queued event without blocking.
    pub fn try_recv(&mut self) -> Option<Arc<DomainEvent>> {
        self.wait(Some(Instant::now()))
    }

    /// Unsubscribe now and report whether the server accepted the removal.
    pub fn close(self) -> Result<()> {
        self.release.run()
    }

    fn wait(&self, deadline: Option<Instant>) -> Option<Arc<DomainEvent>> {
        if self.release.is_done() {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.finish();
            return None;
        }

        // Queued events win over an expired timer.
        match self.events.try_recv() {
            Ok(event) => return Some(event),
            Err(TryRecvError::Disconnected) => {
                self.finish();
                return None;
            }
            Err(TryRecvError::Empty) => {}
        }

        let timer = match deadline {
            Some(deadline) => after(deadline.saturating_duration_since(Instant::now())),
            None => never(),
        };

        select! {
            recv(self.events) -> event => match event {
                Ok(event) => Some(event),
                Err(_) => {
                    self.finish();
                    None
                }
            },
            recv(self.cancel.signal()) -> _ => {
                self.finish();
                None
            },
            recv(timer) -> _ => None,
        }
    }

    fn finish(&self) {
        if let Err(e) = self.release.run() {
            warn!(subscriber = self.id.0, topic = %self.topic, error = %e, "unsubscribe failed");
        }
    }
}

impl Iterator for PullHandle {
    type Item = Arc<DomainEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.wait(None)
    }
}
