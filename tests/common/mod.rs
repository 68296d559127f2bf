//! Scripted in-process server shared by the integration tests.

#![allow(dead_code)]

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use realtime_engine::{
    CancellationToken, ControlRequest, EngineConfig, RealtimeEngine, RealtimeError,
    RealtimeTransport, Result,
};
use std::collections::HashSet;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How long tests wait for something that should happen promptly.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Poll `condition` until it holds or `WAIT` passes.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Blocking reader fed chunk by chunk from a channel. Ends when the
/// sender drops.
struct ChannelReader {
    chunks: Receiver<Vec<u8>>,
    current: Cursor<Vec<u8>>,
    /// Disconnects the transport's liveness receiver once dropped.
    _alive: Sender<()>,
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

/// Server side of one stream. Emptied when the stream ends.
type StreamSlot = Arc<Mutex<Option<Sender<Vec<u8>>>>>;

/// Transport whose streams are driven by the test.
///
/// Each `open_stream` starts a new stream; frames go to the most recent
/// one. With `auto_connect` the stream opens with a connect frame carrying
/// identity `c<n>`, `n` counting streams from 1. A stream whose token fires
/// is hung up, like a dropped HTTP response.
pub struct ScriptedTransport {
    auto_connect: bool,
    streams: Mutex<Vec<StreamSlot>>,
    readers: Mutex<Vec<Receiver<()>>>,
    requests: Mutex<Vec<ControlRequest>>,
    rejected: Mutex<HashSet<String>>,
    control_delay: Mutex<Duration>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    /// Streams stay silent until the test sends a connect frame.
    pub fn silent() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    fn build(auto_connect: bool) -> Self {
        Self {
            auto_connect,
            streams: Mutex::new(Vec::new()),
            readers: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            control_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Write raw text to the current stream.
    pub fn send(&self, text: &str) {
        let current = self.streams.lock().last().cloned().expect("no stream opened");
        let slot = current.lock();
        let sender = slot.as_ref().expect("stream closed");
        sender.send(text.as_bytes().to_vec()).expect("stream reader gone");
    }

    pub fn connect(&self, identity: &str) {
        self.send(&format!(
            "event: PB_CONNECT\ndata: {{\"clientId\":\"{}\"}}\n\n",
            identity
        ));
    }

    pub fn create(&self, resource: &str, selector: &str) {
        self.send(&format!(
            "event: create\ndata: {{\"resource\":\"{}\",\"selector\":\"{}\"}}\n\n",
            resource, selector
        ));
    }

    /// A record frame tagged with the wildcard topic of its resource.
    pub fn record(&self, action: &str, resource: &str, id: &str) {
        self.topic_record(&format!("{}/*", resource), action, resource, id);
    }

    /// A record frame in the `record` envelope, tagged with the topic the
    /// server is sending it for.
    pub fn topic_record(&self, topic: &str, action: &str, resource: &str, id: &str) {
        self.send(&format!(
            "event: {}\ndata: {{\"action\":\"{}\",\"record\":{{\"collectionName\":\"{}\",\"id\":\"{}\"}}}}\n\n",
            topic, action, resource, id
        ));
    }

    pub fn disconnect(&self, reasons: &[&str]) {
        let payload = serde_json::to_string(reasons).expect("reasons serialize");
        self.send(&format!("event: disconnect\ndata: {}\n\n", payload));
    }

    /// Close the current stream as if the network dropped it.
    pub fn drop_stream(&self) {
        if let Some(slot) = self.streams.lock().last() {
            slot.lock().take();
        }
    }

    /// Make control calls naming `topic` fail.
    pub fn reject(&self, topic: &str) {
        self.rejected.lock().insert(topic.to_string());
    }

    /// Hold every control call for `delay` before answering.
    pub fn delay_control(&self, delay: Duration) {
        *self.control_delay.lock() = delay;
    }

    pub fn requests(&self) -> Vec<ControlRequest> {
        self.requests.lock().clone()
    }

    /// Streams opened so far.
    pub fn opened(&self) -> usize {
        self.streams.lock().len()
    }

    /// Streams the client still holds open.
    pub fn open_streams(&self) -> usize {
        self.streams
            .lock()
            .iter()
            .filter(|slot| slot.lock().is_some())
            .count()
    }

    /// Readers handed out and not yet dropped by the client.
    pub fn live_readers(&self) -> usize {
        self.readers
            .lock()
            .iter()
            .filter(|alive| matches!(alive.try_recv(), Err(TryRecvError::Empty)))
            .count()
    }
}

impl RealtimeTransport for ScriptedTransport {
    fn open_stream(&self, cancel: &CancellationToken) -> Result<Box<dyn BufRead + Send>> {
        let (tx, rx) = unbounded();
        let slot: StreamSlot = Arc::new(Mutex::new(None));
        {
            let mut streams = self.streams.lock();
            if self.auto_connect {
                let n = streams.len() + 1;
                let _ = tx.send(
                    format!("event: connect\ndata: {{\"connectionIdentity\":\"c{}\"}}\n\n", n)
                        .into_bytes(),
                );
            }
            *slot.lock() = Some(tx);
            streams.push(Arc::clone(&slot));
        }

        let (alive, liveness) = bounded(0);
        self.readers.lock().push(liveness);

        cancel.on_cancel(move || {
            slot.lock().take();
        });
        Ok(Box::new(BufReader::new(ChannelReader {
            chunks: rx,
            current: Cursor::new(Vec::new()),
            _alive: alive,
        })))
    }

    fn send_control(&self, request: &ControlRequest) -> Result<()> {
        let delay = *self.control_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let rejected = self.rejected.lock();
        if let Some(topic) = request
            .topics()
            .iter()
            .find(|topic| rejected.contains(topic.as_str()))
        {
            return Err(RealtimeError::SubscriptionRejected {
                topic: topic.to_string(),
                reason: "403 Forbidden".to_string(),
            });
        }
        self.requests.lock().push(request.clone());
        Ok(())
    }
}

pub fn engine(transport: &Arc<ScriptedTransport>) -> RealtimeEngine {
    init_tracing();
    RealtimeEngine::new(
        transport.clone(),
        EngineConfig {
            handshake_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    )
}

/// Signal channel for callbacks; the receiver side is waited on.
pub fn signal<T>() -> (Sender<T>, Receiver<T>) {
    unbounded()
}
