//! Reference-counted server-side topic registrations.

use crate::connection::Connection;
use crate::error::{RealtimeError, Result};
use crate::transport::{ControlRequest, RealtimeTransport};
use crate::types::Topic;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Keeps the server's active topics in step with local demand.
///
/// Counts are held under one lock for the whole add/remove round trip, so
/// two callers never interleave partial updates of the active set.
pub(crate) struct TopicRegistry {
    transport: Arc<dyn RealtimeTransport>,
    counts: Mutex<BTreeMap<Topic, usize>>,
}

impl TopicRegistry {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self {
            transport,
            counts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Add one reference to `topic`. Only the first reference is sent to
    /// the server.
    pub fn register(&self, connection: &Connection, topic: &Topic) -> Result<()> {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(topic) {
            *count += 1;
            debug!(%topic, refs = *count, "topic already registered");
            return Ok(());
        }

        let identity = connection.identity().ok_or(RealtimeError::NotConnected)?;
        debug!(connection = connection.id(), %topic, "registering topic");
        self.transport
            .send_control(&ControlRequest::add(&identity, vec![topic.clone()]))?;
        counts.insert(topic.clone(), 1);
        Ok(())
    }

    /// Drop one reference to `topic`. The removal is sent when the last
    /// reference goes; unknown topics are ignored.
    pub fn deregister(&self, connection: &Connection, topic: &Topic) -> Result<()> {
        let mut counts = self.counts.lock();
        match counts.get_mut(topic) {
            None => return Ok(()),
            Some(count) if *count > 1 => {
                *count -= 1;
                debug!(%topic, refs = *count, "topic still referenced");
                return Ok(());
            }
            Some(_) => {}
        }

        counts.remove(topic);
        self.send_removal(connection, vec![topic.clone()])
    }

    /// Remove the given topics outright, whatever their counts, in one call.
    pub fn remove_topics(&self, connection: &Connection, topics: &[Topic]) -> Result<()> {
        let mut counts = self.counts.lock();
        let removed: Vec<Topic> = topics
            .iter()
            .filter(|topic| counts.remove(*topic).is_some())
            .cloned()
            .collect();
        self.send_removal(connection, removed)
    }

    /// Remove every active topic in one call. No call is made when the
    /// connection has already ended, since the server dropped its state.
    pub fn deregister_all(&self, connection: &Connection) -> Result<()> {
        let mut counts = self.counts.lock();
        let topics: Vec<Topic> = std::mem::take(&mut *counts).into_keys().collect();
        self.send_removal(connection, topics)
    }

    /// Forget all topics without telling the server.
    pub fn reset(&self) {
        self.counts.lock().clear();
    }

    pub fn active_topics(&self) -> Vec<Topic> {
        self.counts.lock().keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn references(&self, topic: &Topic) -> usize {
        self.counts.lock().get(topic).copied().unwrap_or(0)
    }

    fn send_removal(&self, connection: &Connection, topics: Vec<Topic>) -> Result<()> {
        if topics.is_empty() || !connection.is_connected() {
            return Ok(());
        }
        let identity = match connection.identity() {
            Some(identity) => identity,
            None => return Ok(()),
        };

        debug!(connection = connection.id(), ?topics, "removing topics");
        self.transport
            .send_control(&ControlRequest::remove(&identity, topics))
    }
}
