// =============================================================================
// Message Bus Endpoints — brokerless TCP pub/sub and push/pull
// =============================================================================
//
// Four endpoint shapes over plain TCP:
//
//   Subscriber   — connects to one or more publishers, filters frames by
//                  topic prefix, fans all connections into one FIFO queue.
//   PushProducer — connects to one pull address; opaque frames; a bounded
//                  send queue acts as the high-water mark.
//   PullConsumer — binds the pull address; each frame reaches exactly one
//                  receiver.
//   PubProducer  — binds an address and broadcasts (topic, payload) frames
//                  to every connected subscriber. Late joiners miss history.
//   Poller       — multiplexes N subscribers with a bounded timeout.
//
// Frame layout (all integers little-endian):
//
//   Offset  Size  Field
//   0       2     topic length
//   2       4     payload length
//   6       n     topic (UTF-8)
//   6+n     m     payload
//
// Connections are owned by background tasks; endpoints expose only
// thread-confined handles. Dropping an endpoint aborts its tasks, which
// closes the sockets — teardown is RAII on every exit path.
//
// Disconnect policy: reader and writer tasks reconnect with a fixed backoff;
// frames sent while a link is down are lost (logged, never buffered across
// reconnects).
// =============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

/// Default bounded-queue depth for subscribers and push producers.
pub const DEFAULT_HIGH_WATER_MARK: usize = 1000;

/// Reconnect backoff for dropped links.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on a single frame payload (sanity guard against a corrupt
/// length header).
const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// One two-part bus frame.
#[derive(Debug, Clone, PartialEq)]
pub struct BusFrame {
    pub topic: String,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Address + frame plumbing
// ---------------------------------------------------------------------------

/// Strip the `tcp://` scheme from a configured endpoint URL.
pub fn parse_endpoint(url: &str) -> Result<String> {
    match url.strip_prefix("tcp://") {
        Some(addr) if !addr.is_empty() => Ok(addr.to_string()),
        _ => Err(EngineError::ConfigInvalid(format!(
            "bus endpoint must be tcp://host:port, got {url:?}"
        ))),
    }
}

pub(crate) async fn read_frame(stream: &mut TcpStream) -> std::io::Result<BusFrame> {
    let mut header = [0u8; 6];
    stream.read_exact(&mut header).await?;
    let topic_len = u16::from_le_bytes([header[0], header[1]]) as usize;
    let payload_len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;

    if payload_len > MAX_PAYLOAD_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame payload length {payload_len} exceeds limit"),
        ));
    }

    let mut topic = vec![0u8; topic_len];
    stream.read_exact(&mut topic).await?;
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;

    let topic = String::from_utf8(topic)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "topic is not UTF-8"))?;

    Ok(BusFrame { topic, payload })
}

pub(crate) fn encode_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(6 + topic.len() + payload.len());
    buf.extend_from_slice(&(topic.len() as u16).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(topic.as_bytes());
    buf.extend_from_slice(payload);
    buf
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// Topic-filtered fan-in over one or more publisher connections.
///
/// Each connection is serviced by its own reader task, so frames from one
/// publisher arrive in publish order; no order is promised across publishers.
pub struct Subscriber {
    rx: mpsc::Receiver<BusFrame>,
    pending: Option<BusFrame>,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscriber {
    /// Connect to `endpoints` (each `tcp://host:port`) and receive frames
    /// whose topic starts with any of `prefixes`. At least one prefix must be
    /// registered; a subscriber with no prefixes would receive nothing.
    pub fn connect(endpoints: &[String], prefixes: &[String]) -> Result<Self> {
        if prefixes.is_empty() {
            return Err(EngineError::ConfigInvalid(
                "subscriber needs at least one topic prefix".to_string(),
            ));
        }

        let addrs: Vec<String> = endpoints
            .iter()
            .map(|e| parse_endpoint(e))
            .collect::<Result<_>>()?;

        let (tx, rx) = mpsc::channel(DEFAULT_HIGH_WATER_MARK);
        let prefixes: Arc<[String]> = prefixes.to_vec().into();

        let tasks = addrs
            .into_iter()
            .map(|addr| {
                let tx = tx.clone();
                let prefixes = prefixes.clone();
                tokio::spawn(async move {
                    subscriber_reader(addr, prefixes, tx).await;
                })
            })
            .collect();

        Ok(Self {
            rx,
            pending: None,
            tasks,
        })
    }

    /// Wait up to `timeout` for a frame. Returns true when `recv` will yield.
    pub async fn poll(&mut self, timeout: Duration) -> bool {
        if self.pending.is_some() {
            return true;
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(frame)) => {
                self.pending = Some(frame);
                true
            }
            // All reader tasks gone, or timeout.
            Ok(None) | Err(_) => false,
        }
    }

    /// Take the next frame without waiting.
    pub fn recv(&mut self) -> Option<BusFrame> {
        if let Some(frame) = self.pending.take() {
            return Some(frame);
        }
        self.rx.try_recv().ok()
    }

    /// True when a frame is queued, buffering it if necessary.
    fn ready_now(&mut self) -> bool {
        if self.pending.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(frame) => {
                self.pending = Some(frame);
                true
            }
            Err(_) => false,
        }
    }

    /// Park until one frame is buffered. Pends forever when every reader
    /// task has stopped, so a poller timeout still fires.
    async fn wait_one(&mut self) {
        if self.pending.is_some() {
            return;
        }
        match self.rx.recv().await {
            Some(frame) => self.pending = Some(frame),
            None => futures_util::future::pending::<()>().await,
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn subscriber_reader(addr: String, prefixes: Arc<[String]>, tx: mpsc::Sender<BusFrame>) {
    loop {
        let mut stream = match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!(addr = %addr, "subscriber connected");
                stream
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "subscriber connect failed — retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        loop {
            match read_frame(&mut stream).await {
                Ok(frame) => {
                    if !prefixes.iter().any(|p| frame.topic.starts_with(p.as_str())) {
                        continue;
                    }
                    // Blocking send applies backpressure instead of dropping.
                    if tx.send(frame).await.is_err() {
                        // Subscriber dropped — stop reading.
                        return;
                    }
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "subscriber link lost — reconnecting");
                    break;
                }
            }
        }

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

// ---------------------------------------------------------------------------
// Push producer
// ---------------------------------------------------------------------------

/// Connects to one pull address and sends opaque frames. The bounded send
/// queue is the high-water mark: when it is full, `send` fails with
/// BUS_OVERFLOW and the caller decides whether to retry or drop.
pub struct PushProducer {
    tx: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
    endpoint: String,
}

impl PushProducer {
    pub fn connect(endpoint: &str, high_water_mark: usize) -> Result<Self> {
        let addr = parse_endpoint(endpoint)?;
        let (tx, rx) = mpsc::channel(high_water_mark.max(1));

        let task_addr = addr.clone();
        let task = tokio::spawn(async move {
            push_writer(task_addr, rx).await;
        });

        info!(endpoint, high_water_mark, "push producer started");
        Ok(Self {
            tx,
            task,
            endpoint: endpoint.to_string(),
        })
    }

    /// Queue one frame for delivery. Fails with BUS_OVERFLOW when the
    /// high-water mark is reached.
    pub fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::BusOverflow,
            mpsc::error::TrySendError::Closed(_) => {
                EngineError::BusDisconnect(self.endpoint.clone())
            }
        })
    }
}

impl Drop for PushProducer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn push_writer(addr: String, mut rx: mpsc::Receiver<Vec<u8>>) {
    loop {
        let mut stream = match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!(addr = %addr, "push producer connected");
                stream
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "push connect failed — retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        loop {
            let Some(payload) = rx.recv().await else {
                // Producer dropped; nothing more to deliver.
                return;
            };
            let frame = encode_frame("", &payload);
            if let Err(e) = stream.write_all(&frame).await {
                // The frame in flight is lost; reconnect for the next one.
                warn!(addr = %addr, error = %e, "push link lost — reconnecting");
                break;
            }
        }

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

// ---------------------------------------------------------------------------
// Pull consumer
// ---------------------------------------------------------------------------

/// The receiving side of the push channel: binds an address and fans frames
/// from every connected producer into one queue. Each frame is delivered to
/// exactly one caller of `recv`.
pub struct PullConsumer {
    rx: mpsc::Receiver<Vec<u8>>,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl PullConsumer {
    pub async fn bind(endpoint: &str) -> Result<Self> {
        let addr = parse_endpoint(endpoint)?;
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            EngineError::ConfigInvalid(format!("cannot bind pull consumer on {endpoint}: {e}"))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| EngineError::ConfigInvalid(format!("pull consumer local_addr: {e}")))?;

        let (tx, rx) = mpsc::channel(DEFAULT_HIGH_WATER_MARK);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!(peer = %peer, "pull consumer accepted producer");
                        tokio::spawn(pull_reader(stream, tx.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "pull consumer accept failed");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        info!(addr = %local_addr, "pull consumer bound");
        Ok(Self {
            rx,
            accept_task,
            local_addr,
        })
    }

    /// Wait up to `timeout` for the next frame payload.
    pub async fn recv(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(timeout, self.rx.recv()).await.ok()?
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for PullConsumer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn pull_reader(mut stream: TcpStream, tx: mpsc::Sender<Vec<u8>>) {
    loop {
        match read_frame(&mut stream).await {
            Ok(frame) => {
                if tx.send(frame.payload).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "producer link closed");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pub producer
// ---------------------------------------------------------------------------

/// Binds an address and broadcasts two-part frames to every connected
/// subscriber. A subscriber that stops draining its queue is dropped rather
/// than allowed to stall the publisher.
pub struct PubProducer {
    clients: Arc<Mutex<Vec<mpsc::Sender<Arc<Vec<u8>>>>>>,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl PubProducer {
    pub async fn bind(endpoint: &str) -> Result<Self> {
        let addr = parse_endpoint(endpoint)?;
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            EngineError::ConfigInvalid(format!("cannot bind publisher on {endpoint}: {e}"))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| EngineError::ConfigInvalid(format!("publisher local_addr: {e}")))?;

        let clients: Arc<Mutex<Vec<mpsc::Sender<Arc<Vec<u8>>>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let accept_clients = clients.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        info!(peer = %peer, "publisher accepted subscriber");
                        let (tx, rx) = mpsc::channel(DEFAULT_HIGH_WATER_MARK);
                        accept_clients.lock().push(tx);
                        tokio::spawn(pub_client_writer(stream, rx));
                    }
                    Err(e) => {
                        warn!(error = %e, "publisher accept failed");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        info!(addr = %local_addr, "publisher bound");
        Ok(Self {
            clients,
            accept_task,
            local_addr,
        })
    }

    /// Broadcast one frame. Subscribers that have disconnected or fallen
    /// behind their queue are pruned here.
    pub fn publish(&self, topic: &str, payload: &[u8]) {
        let frame = Arc::new(encode_frame(topic, payload));
        let mut clients = self.clients.lock();
        clients.retain(|tx| match tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic, "dropping slow subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Number of currently connected subscribers.
    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// The bound socket address (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for PubProducer {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.clients.lock().clear();
    }
}

async fn pub_client_writer(mut stream: TcpStream, mut rx: mpsc::Receiver<Arc<Vec<u8>>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = stream.write_all(&frame).await {
            debug!(error = %e, "subscriber write failed — closing");
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// Multiplexes N subscribers. Single-threaded by contract: one poller per
/// engine task.
pub struct Poller;

impl Poller {
    /// Wait until at least one subscriber has a frame ready or the timeout
    /// elapses. Returns the indexes of all ready subscribers (empty on
    /// timeout).
    pub async fn poll(subs: &mut [&mut Subscriber], timeout: Duration) -> Vec<usize> {
        if subs.is_empty() {
            tokio::time::sleep(timeout).await;
            return Vec::new();
        }

        // Fast path: frames already buffered.
        let ready: Vec<usize> = subs
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.ready_now().then_some(i))
            .collect();
        if !ready.is_empty() {
            return ready;
        }

        let waiters: Vec<_> = subs
            .iter_mut()
            .map(|sub| Box::pin(async move { sub.wait_one().await }))
            .collect();

        let woke = tokio::select! {
            _ = futures_util::future::select_all(waiters) => true,
            _ = tokio::time::sleep(timeout) => false,
        };
        if !woke {
            return Vec::new();
        }

        subs.iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.ready_now().then_some(i))
            .collect()
    }
}
