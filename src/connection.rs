//! A single streaming session and its decode loop.

use crate::cancel::CancellationToken;
use crate::error::{RealtimeError, Result};
use crate::frames::{classify, FrameDecoder, FrameKind};
use crate::transport::RealtimeTransport;
use crate::types::{ConnectionIdentity, ConnectionState, DomainEvent, Termination, Topic};
use crossbeam_channel::{bounded, never, select, Receiver, Sender};
use parking_lot::RwLock;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receives what the decode loop produces.
pub(crate) trait ConnectionEvents: Send + Sync + 'static {
    fn on_record(&self, connection: u64, event: DomainEvent);
    fn on_topic_record(&self, connection: u64, topic: Topic, event: DomainEvent);
    fn on_terminated(&self, connection: u64, termination: Termination);
}

#[derive(Default)]
struct Status {
    state: ConnectionState,
    identity: Option<ConnectionIdentity>,
    termination: Option<Termination>,
}

/// One streaming session to the realtime endpoint.
///
/// All state writes happen on the session's own thread. Other threads only
/// read, or cancel.
pub(crate) struct Connection {
    id: u64,
    status: RwLock<Status>,
    /// Disconnects once the handshake resolves, either way.
    ready: Receiver<()>,
    cancel: CancellationToken,
}

impl Connection {
    /// Open the stream on a new thread and return immediately in
    /// `Connecting`.
    pub fn start(
        id: u64,
        transport: Arc<dyn RealtimeTransport>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Arc<Self>> {
        let (ready_tx, ready) = bounded(0);
        let connection = Arc::new(Self {
            id,
            status: RwLock::new(Status {
                state: ConnectionState::Connecting,
                ..Default::default()
            }),
            ready,
            cancel: CancellationToken::new(),
        });

        let worker = Arc::clone(&connection);
        thread::Builder::new()
            .name(format!("realtime-conn-{}", id))
            .spawn(move || worker.run(transport.as_ref(), events.as_ref(), ready_tx))?;

        Ok(connection)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        if self.cancel.is_cancelled() {
            return ConnectionState::Disconnected;
        }
        self.status.read().state.clone()
    }

    pub fn identity(&self) -> Option<ConnectionIdentity> {
        self.status.read().identity.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// How the session ended, if the loop reported an end.
    pub fn termination(&self) -> Option<Termination> {
        self.status.read().termination.clone()
    }

    /// Stop the loop locally. Subscribers are not told; the loop simply
    /// stops delivering. The transport ends the stream on the same signal,
    /// so a read blocked in the loop returns and the thread exits.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(connection = self.id, "closing realtime connection");
        }
        self.cancel.cancel();
    }

    /// Block until the handshake completes, the caller cancels, or the
    /// timeout elapses.
    pub fn wait_ready(
        &self,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<ConnectionIdentity> {
        if let Some(identity) = self.ready_identity()? {
            return Ok(identity);
        }

        let idle = never();
        let caller = cancel.map_or(&idle, CancellationToken::signal);

        select! {
            recv(self.ready) -> _ => {},
            recv(caller) -> _ => return Err(RealtimeError::Cancelled),
            recv(self.cancel.signal()) -> _ => {
                return Err(RealtimeError::HandshakeFailed("connection closed locally".to_string()));
            },
            default(timeout) => {
                return Err(RealtimeError::HandshakeFailed(format!(
                    "no handshake within {:?}",
                    timeout
                )));
            },
        }

        self.ready_identity()?.ok_or_else(|| {
            RealtimeError::HandshakeFailed("stream ended before handshake".to_string())
        })
    }

    fn ready_identity(&self) -> Result<Option<ConnectionIdentity>> {
        let status = self.status.read();
        match &status.state {
            ConnectionState::Connected => Ok(status.identity.clone()),
            ConnectionState::Connecting => Ok(None),
            ConnectionState::Terminated(reasons) => {
                Err(RealtimeError::HandshakeFailed(reasons.join("; ")))
            }
            ConnectionState::Disconnected => Err(RealtimeError::HandshakeFailed(
                "connection closed".to_string(),
            )),
        }
    }

    fn run(&self, transport: &dyn RealtimeTransport, events: &dyn ConnectionEvents, ready: Sender<()>) {
        let mut ready = Some(ready);
        info!(connection = self.id, "opening realtime stream");

        let stream = match transport.open_stream(&self.cancel) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(connection = self.id, error = %e, "failed to open realtime stream");
                self.finish(Termination::transport(e.to_string()), &mut ready, events);
                return;
            }
        };

        for frame in FrameDecoder::new(stream) {
            if self.cancel.is_cancelled() {
                break;
            }

            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(connection = self.id, error = %e, "realtime stream failed");
                    self.finish(
                        Termination::transport(format!("stream failed: {}", e)),
                        &mut ready,
                        events,
                    );
                    return;
                }
            };

            match classify(&frame) {
                FrameKind::Connect(identity) => {
                    info!(connection = self.id, identity = %identity, "realtime connection established");
                    {
                        let mut status = self.status.write();
                        status.identity = Some(identity);
                        status.state = ConnectionState::Connected;
                    }
                    ready.take();
                }
                FrameKind::Disconnect(reasons) => {
                    info!(connection = self.id, ?reasons, "server closed realtime connection");
                    self.finish(Termination::server(reasons), &mut ready, events);
                    return;
                }
                FrameKind::Record(event) => {
                    debug!(
                        connection = self.id,
                        action = %event.action,
                        resource = %event.resource,
                        selector = %event.selector,
                        "record event"
                    );
                    events.on_record(self.id, event);
                }
                FrameKind::TopicRecord { topic, event } => {
                    debug!(
                        connection = self.id,
                        topic = %topic,
                        action = %event.action,
                        selector = %event.selector,
                        "record event for topic"
                    );
                    events.on_topic_record(self.id, topic, event);
                }
                FrameKind::Skipped(reason) => {
                    warn!(connection = self.id, event = %frame.event, %reason, "skipping frame");
                }
            }
        }

        if self.cancel.is_cancelled() {
            debug!(connection = self.id, "realtime loop stopped");
            let mut status = self.status.write();
            status.state = ConnectionState::Disconnected;
            status.identity = None;
            return;
        }

        info!(connection = self.id, "realtime stream closed by peer");
        self.finish(Termination::transport("stream closed"), &mut ready, events);
    }

    fn finish(
        &self,
        termination: Termination,
        ready: &mut Option<Sender<()>>,
        events: &dyn ConnectionEvents,
    ) {
        {
            let mut status = self.status.write();
            status.state = ConnectionState::Terminated(termination.reasons.clone());
            status.identity = None;
            status.termination = Some(termination.clone());
        }
        ready.take();

        if !self.cancel.is_cancelled() {
            events.on_terminated(self.id, termination);
        }
    }

    /// A session that is already connected, with no loop behind it.
    #[cfg(test)]
    pub fn established(id: u64, identity: &str) -> Arc<Self> {
        Self::detached(
            id,
            ConnectionState::Connected,
            Some(ConnectionIdentity(identity.to_string())),
        )
    }

    /// A session still waiting for its handshake, with no loop behind it.
    #[cfg(test)]
    pub fn pending(id: u64) -> Arc<Self> {
        Self::detached(id, ConnectionState::Connecting, None)
    }

    #[cfg(test)]
    fn detached(
        id: u64,
        state: ConnectionState,
        identity: Option<ConnectionIdentity>,
    ) -> Arc<Self> {
        let (_, ready) = bounded(0);
        Arc::new(Self {
            id,
            status: RwLock::new(Status {
                state,
                identity,
                termination: None,
            }),
            ready,
            cancel: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ControlRequest;
    use crate::types::{Action, TerminationCause};
    use parking_lot::Mutex;
    use std::io::{self, BufRead, BufReader, Cursor, Read};
    use std::time::Instant;

    struct ChannelReader {
        chunks: Receiver<Vec<u8>>,
        current: Cursor<Vec<u8>>,
        /// Disconnects its receiver when the loop drops the reader.
        _alive: Option<Sender<()>>,
    }

    impl Read for ChannelReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let n = self.current.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                match self.chunks.recv() {
                    Ok(chunk) => self.current = Cursor::new(chunk),
                    Err(_) => return Ok(0),
                }
            }
        }
    }

    /// Serves one stream: either fixed text or a live channel.
    struct OneShotTransport {
        stream: Mutex<Option<Box<dyn BufRead + Send>>>,
    }

    impl OneShotTransport {
        fn text(text: &str) -> Arc<Self> {
            Arc::new(Self {
                stream: Mutex::new(Some(Box::new(Cursor::new(text.as_bytes().to_vec())))),
            })
        }

        fn live() -> (Arc<Self>, Sender<Vec<u8>>) {
            let (tx, rx) = crossbeam_channel::unbounded();
            let reader = ChannelReader {
                chunks: rx,
                current: Cursor::new(Vec::new()),
                _alive: None,
            };
            let transport = Arc::new(Self {
                stream: Mutex::new(Some(Box::new(BufReader::new(reader)))),
            });
            (transport, tx)
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                stream: Mutex::new(None),
            })
        }
    }

    impl RealtimeTransport for OneShotTransport {
        fn open_stream(&self, _cancel: &CancellationToken) -> Result<Box<dyn BufRead + Send>> {
            self.stream
                .lock()
                .take()
                .ok_or_else(|| RealtimeError::Transport("connection refused".to_string()))
        }

        fn send_control(&self, _request: &ControlRequest) -> Result<()> {
            Ok(())
        }
    }

    /// Serves one live stream and hangs it up when the session is closed.
    struct HangupTransport {
        server: Arc<Mutex<Option<Sender<Vec<u8>>>>>,
        stream: Mutex<Option<Box<dyn BufRead + Send>>>,
    }

    impl HangupTransport {
        /// The transport, a handle to its server side, and a receiver that
        /// disconnects once the reader is dropped.
        fn new() -> (Arc<Self>, Arc<Mutex<Option<Sender<Vec<u8>>>>>, Receiver<()>) {
            let (tx, rx) = crossbeam_channel::unbounded();
            let (alive, gone) = bounded(0);
            let reader = ChannelReader {
                chunks: rx,
                current: Cursor::new(Vec::new()),
                _alive: Some(alive),
            };
            let server = Arc::new(Mutex::new(Some(tx)));
            let transport = Arc::new(Self {
                server: Arc::clone(&server),
                stream: Mutex::new(Some(Box::new(BufReader::new(reader)))),
            });
            (transport, server, gone)
        }
    }

    impl RealtimeTransport for HangupTransport {
        fn open_stream(&self, cancel: &CancellationToken) -> Result<Box<dyn BufRead + Send>> {
            let server = Arc::clone(&self.server);
            cancel.on_cancel(move || {
                server.lock().take();
            });
            self.stream
                .lock()
                .take()
                .ok_or_else(|| RealtimeError::Transport("connection refused".to_string()))
        }

        fn send_control(&self, _request: &ControlRequest) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        records: Mutex<Vec<DomainEvent>>,
        topic_records: Mutex<Vec<(Topic, DomainEvent)>>,
        terminations: Mutex<Vec<Termination>>,
        done: Mutex<Option<Sender<()>>>,
    }

    impl ConnectionEvents for Recorder {
        fn on_record(&self, _connection: u64, event: DomainEvent) {
            self.records.lock().push(event);
        }

        fn on_topic_record(&self, _connection: u64, topic: Topic, event: DomainEvent) {
            self.topic_records.lock().push((topic, event));
        }

        fn on_terminated(&self, _connection: u64, termination: Termination) {
            self.terminations.lock().push(termination);
            self.done.lock().take();
        }
    }

    fn recorder() -> (Arc<Recorder>, Receiver<()>) {
        let (tx, rx) = bounded(0);
        let recorder = Arc::new(Recorder {
            done: Mutex::new(Some(tx)),
            ..Default::default()
        });
        (recorder, rx)
    }

    fn wait_done(done: &Receiver<()>) {
        assert!(matches!(
            done.recv_timeout(Duration::from_secs(5)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn test_handshake_then_records_then_close() {
        let transport = OneShotTransport::text(concat!(
            "event: connect\ndata: {\"connectionIdentity\":\"c1\"}\n\n",
            "event: create\ndata: {\"resource\":\"posts\",\"selector\":\"p1\"}\n\n",
            "event: posts/p1\ndata: {\"action\":\"update\",\"record\":{\"collectionName\":\"posts\",\"id\":\"p1\"}}\n\n",
        ));
        let (events, done) = recorder();
        let connection = Connection::start(1, transport, events.clone()).unwrap();

        wait_done(&done);
        let records = events.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, Action::Create);
        let topic_records = events.topic_records.lock();
        assert_eq!(topic_records.len(), 1);
        assert_eq!(topic_records[0].0.as_str(), "posts/p1");
        assert_eq!(topic_records[0].1.action, Action::Update);

        let terminations = events.terminations.lock();
        assert_eq!(terminations[0].cause, TerminationCause::TransportFailure);
        assert_eq!(
            connection.state(),
            ConnectionState::Terminated(vec!["stream closed".to_string()])
        );
        assert!(connection.identity().is_none());
    }

    #[test]
    fn test_disconnect_frame_terminates() {
        let (transport, server) = OneShotTransport::live();
        let (events, done) = recorder();
        let connection = Connection::start(2, transport, events.clone()).unwrap();

        server
            .send(b"event: connect\ndata: {\"clientId\":\"c2\"}\n\n".to_vec())
            .unwrap();
        let identity = connection.wait_ready(Duration::from_secs(5), None).unwrap();
        assert_eq!(identity.as_str(), "c2");
        assert!(connection.is_connected());

        server
            .send(b"event: disconnect\ndata: [\"idle timeout\"]\n\n".to_vec())
            .unwrap();
        wait_done(&done);

        assert_eq!(
            events.terminations.lock()[0],
            Termination::server(vec!["idle timeout".to_string()])
        );
        assert!(!connection.is_connected());
        assert_eq!(
            connection.termination().map(|t| t.reasons),
            Some(vec!["idle timeout".to_string()])
        );
    }

    #[test]
    fn test_open_failure_fails_handshake() {
        let (events, _done) = recorder();
        let connection = Connection::start(3, OneShotTransport::failing(), events).unwrap();

        let result = connection.wait_ready(Duration::from_secs(5), None);
        match result {
            Err(RealtimeError::HandshakeFailed(reason)) => {
                assert!(reason.contains("connection refused"))
            }
            other => panic!("Expected HandshakeFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_handshake_timeout_fails_fast() {
        let (transport, _server) = OneShotTransport::live();
        let (events, _done) = recorder();
        let connection = Connection::start(4, transport, events).unwrap();

        let started = Instant::now();
        let result = connection.wait_ready(Duration::from_millis(50), None);
        assert!(matches!(result, Err(RealtimeError::HandshakeFailed(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(connection.state(), ConnectionState::Connecting);
        connection.close();
    }

    #[test]
    fn test_caller_cancellation_during_handshake() {
        let (transport, _server) = OneShotTransport::live();
        let (events, _done) = recorder();
        let connection = Connection::start(5, transport, events).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = connection.wait_ready(Duration::from_secs(5), Some(&token));
        assert!(matches!(result, Err(RealtimeError::Cancelled)));
        connection.close();
    }

    #[test]
    fn test_local_close_does_not_report_termination() {
        let (transport, server) = OneShotTransport::live();
        let (events, _done) = recorder();
        let connection = Connection::start(6, transport, events.clone()).unwrap();

        server
            .send(b"event: connect\ndata: {\"connectionIdentity\":\"c6\"}\n\n".to_vec())
            .unwrap();
        connection.wait_ready(Duration::from_secs(5), None).unwrap();

        connection.close();
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        // The loop notices the close on its next frame and stops quietly.
        server
            .send(b"event: disconnect\ndata: [\"bye\"]\n\n".to_vec())
            .unwrap();
        drop(server);
        thread::sleep(Duration::from_millis(50));

        assert!(events.terminations.lock().is_empty());
        assert!(events.records.lock().is_empty());
    }

    #[test]
    fn test_close_ends_a_blocked_read() {
        let (transport, server, reader_gone) = HangupTransport::new();
        let (events, _done) = recorder();
        let connection = Connection::start(7, transport, events.clone()).unwrap();

        server
            .lock()
            .as_ref()
            .unwrap()
            .send(b"event: connect\ndata: {\"connectionIdentity\":\"c7\"}\n\n".to_vec())
            .unwrap();
        connection.wait_ready(Duration::from_secs(5), None).unwrap();

        // The loop is parked in a read with nothing more coming.
        connection.close();
        assert!(server.lock().is_none());
        assert!(matches!(
            reader_gone.recv_timeout(Duration::from_secs(5)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));
        assert!(events.terminations.lock().is_empty());
    }
}
