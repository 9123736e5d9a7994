// ABOUTME: Node connection lifecycle
// ABOUTME: Outbound queue, session resuming, backoff-driven reconnects and inbound dispatch

//! One persistent connection to a node.
//!
//! A [`Connection`] owns at most one [`Transport`] at a time and a background
//! lifecycle task that opens it, flushes queued payloads, reads inbound
//! messages and decides whether to reconnect after an unexpected close.

mod backoff;
mod state;

pub use backoff::{Backoff, ExponentialBackoff};
pub use state::ConnectionState;

use crate::config::NodeConfig;
use crate::error::Error;
use crate::node::NodeEvent;
use crate::protocol::messages::OutgoingMessage;
use crate::transport::{close_code, Message, Transport, TransportEvent, TransportSender, WriteHandle};
use crate::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Receives what a connection reads and reports
pub(crate) trait ConnectionHandler: Send + Sync {
    /// Bot user id, required to connect
    fn user_id(&self) -> Option<u64>;

    /// A text message arrived
    fn on_message(&self, text: &str);

    /// A lifecycle notification
    fn on_event(&self, event: NodeEvent);
}

/// A payload waiting for the socket
#[derive(Debug)]
struct Queued {
    text: String,
    done: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Default)]
struct Link {
    state: ConnectionState,
    queue: VecDeque<Queued>,
    sender: Option<TransportSender>,
}

impl Link {
    fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition(next) {
            log::warn!("Ignoring illegal transition {} -> {}", self.state, next);
            return false;
        }

        log::debug!("Connection state {} -> {}", self.state, next);
        self.state = next;
        true
    }

    fn reject_queue(&mut self) -> Vec<Queued> {
        self.queue.drain(..).collect()
    }
}

struct Shared {
    config: Arc<NodeConfig>,
    handler: Weak<dyn ConnectionHandler>,
    link: Mutex<Link>,
    attempts: AtomicU32,
    latency: Mutex<Option<Duration>>,
    last_ping: Mutex<Option<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn emit(&self, event: NodeEvent) {
        if let Some(handler) = self.handler.upgrade() {
            handler.on_event(event);
        }
    }

    fn debug(&self, message: String) {
        log::debug!("[{}] {}", self.config.id, message);
        self.emit(NodeEvent::Debug(format!("connection: {}", message)));
    }
}

/// Why a socket stopped
#[derive(Debug, Clone)]
struct Closed {
    code: Option<u16>,
    reason: String,
}

/// Persistent connection to one node
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("node", &self.shared.config.id)
            .field("state", &self.state())
            .field("queued", &self.queued())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(config: Arc<NodeConfig>, handler: Weak<dyn ConnectionHandler>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                handler,
                link: Mutex::new(Link::default()),
                attempts: AtomicU32::new(0),
                latency: Mutex::new(None),
                last_ping: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.link.lock().state
    }

    /// Whether the socket is open and flushed
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Payloads waiting for the socket
    pub fn queued(&self) -> usize {
        self.shared.link.lock().queue.len()
    }

    /// Reconnect attempts since the last manual connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Round trip of the last answered ping
    pub fn latency(&self) -> Option<Duration> {
        *self.shared.latency.lock()
    }

    /// `host:port` of the node
    pub fn address(&self) -> String {
        self.shared.config.address()
    }

    /// Open the connection in the background
    ///
    /// Any active socket is torn down first. The outcome is reported through
    /// `Connect`/`Disconnect`/`Error` events. Must be called within a tokio
    /// runtime.
    pub fn connect(&self) -> Result<()> {
        let handler = self.shared.handler.upgrade().ok_or(Error::Closed)?;
        let user_id = handler.user_id().ok_or(Error::MissingUserId)?;

        if let Some(task) = self.shared.task.lock().take() {
            task.abort();
        }

        {
            let mut link = self.shared.link.lock();
            if let Some(sender) = link.sender.take() {
                tokio::spawn(async move {
                    let _ = sender.close(close_code::NORMAL, "reconnecting").await;
                });
            }
            if link.state != ConnectionState::Idle {
                link.transition(ConnectionState::Disconnected);
            }
            link.transition(ConnectionState::Connecting);
        }

        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.debug("creating websocket...".to_string());

        let shared = Arc::clone(&self.shared);
        *self.shared.task.lock() = Some(tokio::spawn(run(shared, user_id)));
        Ok(())
    }

    /// Send a payload, or queue it until the socket is open
    ///
    /// Prioritized payloads jump to the front of the queue. The returned
    /// handle resolves once the payload has been written.
    pub fn send(&self, payload: &OutgoingMessage, prioritize: bool) -> SendHandle {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(e) => return SendHandle::ready(Err(e.into())),
        };

        let mut link = self.shared.link.lock();
        if link.state == ConnectionState::Connected {
            if let Some(sender) = &link.sender {
                log::trace!("[{}] >>> {}", self.shared.config.id, text);
                return SendHandle(Pending::Writing(sender.send(Message::Text(text))));
            }
        }

        let (done, rx) = oneshot::channel();
        let entry = Queued { text, done };
        if prioritize {
            link.queue.push_front(entry);
        } else {
            link.queue.push_back(entry);
        }

        SendHandle(Pending::Queued(rx))
    }

    /// Send a ping; the matching pong updates [`latency`](Self::latency)
    ///
    /// Returns whether the connection was open.
    pub async fn ping(&self) -> Result<bool> {
        let sender = {
            let link = self.shared.link.lock();
            match link.state {
                ConnectionState::Connected => link.sender.clone(),
                _ => None,
            }
        };

        match sender {
            Some(sender) => {
                *self.shared.last_ping.lock() = Some(Instant::now());
                sender.ping(Bytes::new()).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close the connection without reconnecting
    ///
    /// Queued payloads stay queued for the next [`connect`](Self::connect).
    pub async fn disconnect(&self, code: u16, reason: &str) -> Result<()> {
        let sender = {
            let mut link = self.shared.link.lock();
            match link.state {
                ConnectionState::Connected => {
                    link.transition(ConnectionState::Disconnecting);
                    link.sender.take()
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    if let Some(task) = self.shared.task.lock().take() {
                        task.abort();
                    }
                    link.sender = None;
                    link.transition(ConnectionState::Disconnected);
                    drop(link);

                    self.shared.emit(NodeEvent::Disconnect {
                        code: Some(code),
                        reason: reason.to_string(),
                        reconnecting: false,
                    });
                    return Ok(());
                }
                _ => None,
            }
        };

        if let Some(sender) = sender {
            self.shared
                .debug(format!("disconnecting... code={}, reason={}", code, reason));
            sender.close(code, reason).await?;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.shared.task.lock().take() {
            task.abort();
        }

        let mut link = self.shared.link.lock();
        if let Some(sender) = link.sender.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = sender.close(close_code::GOING_AWAY, "client dropped").await;
                });
            }
        }
    }
}

/// Resolves once a payload has been written, or fails if it never will be
#[derive(Debug)]
pub struct SendHandle(Pending);

#[derive(Debug)]
enum Pending {
    Ready(Option<Result<()>>),
    Queued(oneshot::Receiver<Result<()>>),
    Writing(WriteHandle),
}

impl SendHandle {
    fn ready(result: Result<()>) -> Self {
        SendHandle(Pending::Ready(Some(result)))
    }
}

impl Future for SendHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.0 {
            Pending::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(Error::Closed))),
            Pending::Queued(rx) => Pin::new(rx)
                .poll(cx)
                .map(|res| res.unwrap_or(Err(Error::Closed))),
            Pending::Writing(handle) => Pin::new(handle).poll(cx).map(|res| res.map_err(Error::from)),
        }
    }
}

fn handshake_headers(config: &NodeConfig, user_id: u64) -> Vec<(String, String)> {
    let mut headers = vec![
        ("Authorization".to_string(), config.password.clone()),
        ("User-Id".to_string(), user_id.to_string()),
        ("Client-Name".to_string(), config.client_name.clone()),
        ("Num-Shards".to_string(), config.num_shards.to_string()),
        (
            "User-Agent".to_string(),
            format!("lavawire/{}", env!("CARGO_PKG_VERSION")),
        ),
    ];

    if let Some(resuming) = &config.resuming {
        headers.push(("Resume-Key".to_string(), resuming.key.clone()));
    }

    headers
}

/// Lifecycle task: connect, serve, and reconnect until told to stop
async fn run(shared: Arc<Shared>, user_id: u64) {
    let headers = handshake_headers(&shared.config, user_id);
    let url = shared.config.ws_url();
    let mut backoff: Option<Backoff> = None;
    let mut reconnect = false;

    loop {
        let started = Instant::now();
        let closed = match Transport::connect(&url, &headers).await {
            Ok(transport) => {
                let (closed, flushed) = serve(&shared, transport, started, reconnect).await;
                if flushed {
                    backoff = None;
                }
                closed
            }
            Err(e) => {
                log::warn!("[{}] Failed to connect to {}: {}", shared.config.id, url, e);
                let reason = e.to_string();
                shared.emit(NodeEvent::Error(Arc::new(Error::Handshake(e))));
                Closed { code: None, reason }
            }
        };

        {
            let mut link = shared.link.lock();
            link.sender = None;
            if link.state == ConnectionState::Disconnecting {
                link.transition(ConnectionState::Disconnected);
                drop(link);

                shared.debug(format!("disconnected, code={:?}", closed.code));
                shared.emit(NodeEvent::Disconnect {
                    code: closed.code,
                    reason: closed.reason,
                    reconnecting: false,
                });
                return;
            }
        }

        let attempts = shared.attempts.load(Ordering::SeqCst);
        let policy = shared.config.reconnect.as_ref();
        let reconnecting = match policy {
            Some(policy) => policy.tries().map_or(true, |max| attempts < max),
            None => false,
        };

        shared.emit(NodeEvent::Disconnect {
            code: closed.code,
            reason: closed.reason.clone(),
            reconnecting,
        });

        let Some(policy) = policy.filter(|_| reconnecting) else {
            let rejected = {
                let mut link = shared.link.lock();
                link.transition(ConnectionState::Disconnected);
                link.reject_queue()
            };

            if policy.is_some() {
                log::warn!(
                    "[{}] Giving up after {} reconnect attempts",
                    shared.config.id,
                    attempts
                );
                shared.emit(NodeEvent::GaveUp { attempts });
            }
            for entry in rejected {
                let _ = entry.done.send(Err(Error::Closed));
            }
            return;
        };

        if !shared.link.lock().transition(ConnectionState::Reconnecting) {
            return;
        }

        let delay = backoff
            .get_or_insert_with(|| Backoff::new(policy))
            .next_delay();
        let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        shared.debug(format!(
            "attempting to reconnect in {}ms, try={}",
            delay.as_millis(),
            attempt
        ));

        tokio::time::sleep(delay).await;

        if !shared.link.lock().transition(ConnectionState::Connecting) {
            return;
        }
        reconnect = true;
    }
}

/// Flush the queue over a fresh transport, then read until it closes
///
/// Returns the close and whether the queue was flushed.
async fn serve(
    shared: &Arc<Shared>,
    transport: Transport,
    started: Instant,
    reconnect: bool,
) -> (Closed, bool) {
    let (sender, mut receiver) = transport.split();

    if let Some(resuming) = &shared.config.resuming {
        let payload = OutgoingMessage::ConfigureResuming {
            key: resuming.key.clone(),
            timeout: resuming.timeout.as_secs(),
        };
        match serde_json::to_string(&payload) {
            Ok(text) => {
                let (done, _) = oneshot::channel();
                shared.link.lock().queue.push_front(Queued { text, done });
            }
            Err(e) => shared.emit(NodeEvent::Error(Arc::new(e.into()))),
        }
    }

    loop {
        let entry = {
            let mut link = shared.link.lock();
            match link.queue.pop_front() {
                Some(entry) => entry,
                None => {
                    link.sender = Some(sender.clone());
                    link.transition(ConnectionState::Connected);
                    break;
                }
            }
        };

        log::trace!("[{}] >>> {}", shared.config.id, entry.text);
        let result = sender
            .send(Message::Text(entry.text))
            .await
            .map_err(Error::from);
        let failure = result.as_ref().err().map(|e| e.to_string());
        let _ = entry.done.send(result);

        if let Some(reason) = failure {
            return (Closed { code: None, reason }, false);
        }
    }

    let took = started.elapsed();
    shared.debug(format!("connected in {}ms", took.as_millis()));
    shared.emit(NodeEvent::Connect { took, reconnect });

    let closed = loop {
        let Some(event) = receiver.next_event().await else {
            break Closed {
                code: Some(close_code::ABNORMAL),
                reason: "connection dropped".to_string(),
            };
        };

        match event {
            TransportEvent::Message(Message::Text(text)) => {
                if let Some(handler) = shared.handler.upgrade() {
                    handler.on_message(&text);
                }
            }
            TransportEvent::Message(Message::Binary(data)) => {
                shared.debug(format!("ignoring binary message of {} bytes", data.len()));
            }
            TransportEvent::Ping(_) => shared.debug("received ping".to_string()),
            TransportEvent::Pong(_) => {
                let latency = shared.last_ping.lock().take().map(|sent| sent.elapsed());
                *shared.latency.lock() = latency;
                match latency {
                    Some(latency) => {
                        shared.debug(format!("received pong, latency={}ms", latency.as_millis()))
                    }
                    None => shared.debug("received pong".to_string()),
                }
            }
            TransportEvent::Close(frame) => {
                break Closed {
                    code: Some(frame.code),
                    reason: frame.reason,
                }
            }
        }
    };

    shared.debug(format!(
        "socket closed, code={:?}, reason={}",
        closed.code, closed.reason
    ));
    (closed, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReconnectPolicy, ResumingOptions};

    struct Recorder {
        user_id: Option<u64>,
        events: Mutex<Vec<NodeEvent>>,
    }

    impl ConnectionHandler for Recorder {
        fn user_id(&self) -> Option<u64> {
            self.user_id
        }

        fn on_message(&self, _text: &str) {}

        fn on_event(&self, event: NodeEvent) {
            self.events.lock().push(event);
        }
    }

    fn connection_with(config: NodeConfig, user_id: Option<u64>) -> (Arc<Recorder>, Connection) {
        let recorder = Arc::new(Recorder {
            user_id,
            events: Mutex::new(Vec::new()),
        });
        let handler: Arc<dyn ConnectionHandler> = recorder.clone();
        let connection = Connection::new(Arc::new(config), Arc::downgrade(&handler));
        (recorder, connection)
    }

    fn connection(user_id: Option<u64>) -> (Arc<Recorder>, Connection) {
        connection_with(NodeConfig::new("test", "127.0.0.1", 1, "pw"), user_id)
    }

    fn stop(guild_id: u64) -> OutgoingMessage {
        OutgoingMessage::Stop { guild_id }
    }

    #[test]
    fn test_connect_requires_user_id() {
        let (_recorder, connection) = connection(None);
        assert!(matches!(connection.connect(), Err(Error::MissingUserId)));
        assert_eq!(connection.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_send_while_idle_queues_with_priority() {
        let (_recorder, connection) = connection(Some(1));

        let _a = connection.send(&stop(1), false);
        let _b = connection.send(&stop(2), false);
        let _c = connection.send(&stop(3), true);

        let link = connection.shared.link.lock();
        let order: Vec<&str> = link.queue.iter().map(|q| q.text.as_str()).collect();
        assert_eq!(
            order,
            vec![
                r#"{"op":"stop","guildId":"3"}"#,
                r#"{"op":"stop","guildId":"1"}"#,
                r#"{"op":"stop","guildId":"2"}"#,
            ]
        );
    }

    #[test]
    fn test_queued_handle_rejects_when_connection_dropped() {
        let (_recorder, connection) = connection(Some(1));
        let mut handle = tokio_test::task::spawn(connection.send(&stop(1), false));
        tokio_test::assert_pending!(handle.poll());

        drop(connection);
        assert!(handle.is_woken());
        assert!(matches!(
            tokio_test::assert_ready!(handle.poll()),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_headers_include_resume_key() {
        let config = NodeConfig::new("a", "h", 1, "secret")
            .client_name("bot")
            .num_shards(4)
            .resuming(ResumingOptions::new("resume-me"));

        let headers = handshake_headers(&config, 99);
        let get = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("Authorization"), Some("secret"));
        assert_eq!(get("User-Id"), Some("99"));
        assert_eq!(get("Client-Name"), Some("bot"));
        assert_eq!(get("Num-Shards"), Some("4"));
        assert_eq!(get("Resume-Key"), Some("resume-me"));
    }

    #[tokio::test]
    async fn test_failed_dial_without_policy_rejects_queue() {
        let config = NodeConfig::new("test", "127.0.0.1", 1, "pw").no_reconnect();
        let (recorder, connection) = connection_with(config, Some(1));

        let queued = connection.send(&stop(1), false);
        connection.connect().unwrap();

        assert!(matches!(queued.await, Err(Error::Closed)));
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        let events = recorder.events.lock();
        assert!(events.iter().any(|e| matches!(
            e,
            NodeEvent::Disconnect {
                code: None,
                reconnecting: false,
                ..
            }
        )));
        assert!(!events.iter().any(|e| matches!(e, NodeEvent::GaveUp { .. })));
    }

    #[tokio::test]
    async fn test_exhausted_policy_gives_up() {
        let policy = ReconnectPolicy::Basic {
            delay: Duration::from_millis(5),
            max_tries: Some(2),
        };
        let config = NodeConfig::new("test", "127.0.0.1", 1, "pw").reconnect(policy);
        let (recorder, connection) = connection_with(config, Some(1));

        let queued = connection.send(&stop(1), false);
        connection.connect().unwrap();

        assert!(matches!(queued.await, Err(Error::Closed)));
        assert_eq!(connection.reconnect_attempts(), 2);

        let events = recorder.events.lock();
        let flags: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                NodeEvent::Disconnect { reconnecting, .. } => Some(*reconnecting),
                _ => None,
            })
            .collect();
        assert_eq!(flags, vec![true, true, false]);
        assert!(events
            .iter()
            .any(|e| matches!(e, NodeEvent::GaveUp { attempts: 2 })));
    }
}
