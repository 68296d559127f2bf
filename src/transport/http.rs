//! HTTP transport for the realtime endpoint.
//!
//! Control calls are plain blocking requests. The event stream is read by a
//! small pump thread driving an async request on a current-thread runtime,
//! so a cancelled stream can be dropped mid-read instead of waiting for the
//! server's next byte.

use super::{ControlRequest, RealtimeTransport};
use crate::cancel::CancellationToken;
use crate::error::{RealtimeError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default server base URL.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8090";

/// Default realtime endpoint path.
pub const DEFAULT_ENDPOINT: &str = "api/realtime";

/// HTTP transport configuration.
#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    /// Server base URL.
    pub base_url: String,

    /// Realtime endpoint, relative to `base_url`.
    pub endpoint: String,

    /// Value for the `Authorization` header, sent as-is.
    pub auth_token: Option<String>,

    /// Timeout for control (topic add/remove) requests.
    /// Default: 30s
    pub request_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            auth_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpTransportConfig {
    /// Build a config from `REALTIME_BASE_URL` and `REALTIME_AUTH_TOKEN`,
    /// falling back to defaults if not set.
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("REALTIME_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let auth_token = std::env::var("REALTIME_AUTH_TOKEN")
            .ok()
            .filter(|token| !token.is_empty());
        Self {
            base_url,
            auth_token,
            ..Default::default()
        }
    }

    /// Full URL of the realtime endpoint.
    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.endpoint.trim_start_matches('/')
        )
    }
}

/// Realtime transport over `reqwest`.
pub struct HttpTransport {
    url: String,
    /// No total timeout: the event stream stays open indefinitely. Nothing
    /// is pooled, since every stream runs on its own short-lived runtime.
    stream_client: reqwest::Client,
    control_client: Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        let url = config.url();
        reqwest::Url::parse(&url).map_err(|e| RealtimeError::Config(format!("{}: {}", url, e)))?;

        let mut headers = HeaderMap::new();
        if let Some(token) = &config.auth_token {
            let value = HeaderValue::from_str(token)
                .map_err(|e| RealtimeError::Config(format!("auth token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        let stream_client = reqwest::Client::builder()
            .default_headers(headers.clone())
            .pool_max_idle_per_host(0)
            .build()?;
        let control_client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            url,
            stream_client,
            control_client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RealtimeTransport for HttpTransport {
    fn open_stream(&self, cancel: &CancellationToken) -> Result<Box<dyn BufRead + Send>> {
        debug!(url = %self.url, "opening realtime stream");
        let request = self
            .stream_client
            .get(&self.url)
            .header(ACCEPT, "text/event-stream");

        let (abort_tx, abort) = oneshot::channel::<()>();
        cancel.on_cancel(move || drop(abort_tx));

        let (opened_tx, opened) = bounded(1);
        let (chunks_tx, chunks) = unbounded();
        thread::Builder::new()
            .name("realtime-http-stream".to_string())
            .spawn(move || pump(request, abort, opened_tx, chunks_tx))?;

        match opened.recv() {
            Ok(Ok(())) => Ok(Box::new(BufReader::new(ChunkReader::new(chunks)))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RealtimeError::Transport(
                "stream closed before it opened".to_string(),
            )),
        }
    }

    fn send_control(&self, request: &ControlRequest) -> Result<()> {
        let response = self.control_client.post(&self.url).json(request).send()?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().unwrap_or_default();
        Err(RealtimeError::rejected(
            request.topics(),
            format!("{}: {}", status, body.trim()),
        ))
    }
}

/// Drive one streaming response, forwarding body chunks until the body
/// ends, the reader goes away, or `abort` resolves. Leaving this function
/// drops the response and the runtime, which closes the socket.
fn pump(
    request: reqwest::RequestBuilder,
    mut abort: oneshot::Receiver<()>,
    opened: Sender<Result<()>>,
    chunks: Sender<io::Result<Vec<u8>>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = opened.send(Err(e.into()));
            return;
        }
    };

    runtime.block_on(async move {
        let sent = tokio::select! {
            _ = &mut abort => {
                let _ = opened.send(Err(RealtimeError::Cancelled));
                return;
            }
            sent = request.send() => sent,
        };
        let mut response = match sent.and_then(|response| response.error_for_status()) {
            Ok(response) => response,
            Err(e) => {
                let _ = opened.send(Err(e.into()));
                return;
            }
        };
        if opened.send(Ok(())).is_err() {
            return;
        }

        loop {
            let next = tokio::select! {
                _ = &mut abort => {
                    debug!("realtime stream aborted");
                    break;
                }
                next = response.chunk() => next,
            };
            match next {
                Ok(Some(bytes)) => {
                    if chunks.send(Ok(bytes.to_vec())).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "realtime stream read failed");
                    let _ = chunks.send(Err(io::Error::new(io::ErrorKind::Other, e)));
                    break;
                }
            }
        }
    });
}

/// Blocking reader over the chunks a pump forwards. Ends when the pump
/// stops.
struct ChunkReader {
    chunks: Receiver<io::Result<Vec<u8>>>,
    current: Cursor<Vec<u8>>,
}

impl ChunkReader {
    fn new(chunks: Receiver<io::Result<Vec<u8>>>) -> Self {
        Self {
            chunks,
            current: Cursor::new(Vec::new()),
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.current.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            match self.chunks.recv() {
                Ok(Ok(chunk)) => self.current = Cursor::new(chunk),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(0),
            }
        }
    }
}
