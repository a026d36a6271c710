//! # WebSocket Transport
//!
//! Owns the single duplex connection to the content server.
//!
//! ## State machine
//!
//! ```text
//!   Closed ──connect()──▶ Connecting ──handshake ok──▶ Open
//!     ▲                       │                          │
//!     │                  handshake failed          socket error / server close
//!     │                       ▼                          ▼
//!     └──── timer fires ◀── ReconnectScheduled ◀──── Closed (unexpected)
//! ```
//!
//! - `connect()` is a no-op while `Connecting` or `Open`.
//! - While `Open`, a ping `{a: "ping", p: {ts}}` goes out every
//!   `heartbeat_interval`. Pongs are swallowed; there is no response timeout.
//! - An unexpected close schedules one reconnect after
//!   `min(base * 2^attempt, cap)`. At most one reconnect is pending at a time,
//!   and the attempt counter resets on every successful open.
//! - `disconnect()` cancels the session and any pending reconnect and resets
//!   the attempt counter.
//!
//! Every spawned task (session, reconnect timer) is tagged with an id. A task
//! whose id no longer matches the current state is stale and does nothing.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::dispatcher::panic_message;
use crate::core::envelope::{InboundMessage, OutboundEnvelope, OutboundSink};
use crate::core::errors::{DispatchError, ErrorSink, ParseError, TransportError};
use crate::transport::backoff::ReconnectBackoff;

const EVENT_CAPACITY: usize = 64;

/// Connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// WebSocket endpoint, `ws://` or `wss://`.
    pub url: String,
    /// Query parameter carrying the bearer credential.
    pub token_param: String,
    /// Keep-alive ping period.
    pub heartbeat_interval: Duration,
    /// Backoff base.
    pub reconnect_base_delay: Duration,
    /// Backoff cap.
    pub reconnect_max_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3010/ws".to_string(),
            token_param: "token".to_string(),
            heartbeat_interval: Duration::from_secs(20),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection (a reconnect may be pending).
    Closed,
    /// Handshake in progress.
    Connecting,
    /// Ready to send.
    Open,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A handshake started.
    Connecting,
    /// The connection is open; requests lost while closed may be re-issued.
    Open,
    /// The connection closed.
    Closed {
        /// `true` for `disconnect()`, `false` for failures.
        expected: bool,
    },
    /// A reconnect was scheduled.
    ReconnectScheduled {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The failure that caused an unexpected close.
    Error(TransportError),
}

/// Supplies the opaque bearer credential appended to the connection URL.
pub trait CredentialProvider: Send + Sync {
    /// Current credential, `None` for anonymous connections.
    fn token(&self) -> Option<String>;
}

/// Fixed credential.
#[derive(Debug, Clone, Default)]
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    /// Wraps `token`.
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()))
    }
}

impl CredentialProvider for StaticCredential {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Receives every classified inbound message except heartbeats.
pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

struct LinkState {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<String>>,
    session: Option<(u64, CancellationToken)>,
    reconnect: Option<(u64, CancellationToken, Duration)>,
    backoff: ReconnectBackoff,
    next_id: u64,
}

impl LinkState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_session(&self, id: u64) -> bool {
        self.session.as_ref().is_some_and(|(current, _)| *current == id)
    }
}

struct TransportInner {
    config: TransportConfig,
    credentials: Arc<dyn CredentialProvider>,
    link: Mutex<LinkState>,
    on_message: RwLock<Option<MessageCallback>>,
    errors: Arc<dyn ErrorSink>,
    events: broadcast::Sender<TransportEvent>,
}

/// # Transport
///
/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Creates a closed transport.
    pub fn new(
        config: TransportConfig,
        credentials: Arc<dyn CredentialProvider>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let backoff = ReconnectBackoff::new(config.reconnect_base_delay, config.reconnect_max_delay);
        Self {
            inner: Arc::new(TransportInner {
                config,
                credentials,
                link: Mutex::new(LinkState {
                    state: ConnectionState::Closed,
                    outbound: None,
                    session: None,
                    reconnect: None,
                    backoff,
                    next_id: 0,
                }),
                on_message: RwLock::new(None),
                errors,
                events,
            }),
        }
    }

    /// Settings in effect.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Installs the inbound message callback, replacing any previous one.
    pub fn set_message_handler<F>(&self, callback: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        *self.inner.on_message.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Subscribes to lifecycle events. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock_link().state
    }

    /// Reconnects scheduled since the last successful open.
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.lock_link().backoff.attempt()
    }

    /// Delay of the pending reconnect, if one is scheduled.
    pub fn pending_reconnect_delay(&self) -> Option<Duration> {
        self.inner.lock_link().reconnect.as_ref().map(|(_, _, delay)| *delay)
    }

    /// Opens the connection unless one is already open or connecting.
    ///
    /// A pending reconnect is replaced by an immediate attempt. Must be called
    /// from within a tokio runtime.
    pub fn connect(&self) -> Result<(), TransportError> {
        let url = self.inner.endpoint()?;
        let mut link = self.inner.lock_link();
        if link.state != ConnectionState::Closed {
            log::debug!("connect() ignored: already {:?}", link.state);
            return Ok(());
        }
        if let Some((_, timer, _)) = link.reconnect.take() {
            timer.cancel();
        }
        self.inner.open_locked(&mut link, url);
        Ok(())
    }

    /// Closes the connection, cancels every pending timer and resets backoff.
    pub fn disconnect(&self) {
        let was_active = {
            let mut link = self.inner.lock_link();
            let session = link.session.take();
            let reconnect = link.reconnect.take();
            link.outbound = None;
            link.state = ConnectionState::Closed;
            link.backoff.reset();

            if let Some((_, token)) = &session {
                token.cancel();
            }
            if let Some((_, token, _)) = &reconnect {
                token.cancel();
            }
            session.is_some() || reconnect.is_some()
        };

        if was_active {
            log::info!("Transport disconnected");
            self.inner.emit(TransportEvent::Closed { expected: true });
        }
    }

    /// Queues `envelope` for the open connection.
    ///
    /// Returns [`TransportError::NotOpen`] (and drops the envelope) otherwise.
    pub fn send(&self, envelope: OutboundEnvelope) -> Result<(), TransportError> {
        let text = envelope.to_json()?;
        let link = self.inner.lock_link();
        match (link.state, &link.outbound) {
            (ConnectionState::Open, Some(tx)) => tx.send(text).map_err(|_| TransportError::NotOpen),
            (state, _) => {
                log::warn!("Dropping '{}': connection is {:?}", envelope.action(), state);
                Err(TransportError::NotOpen)
            }
        }
    }
}

impl OutboundSink for Transport {
    fn send(&self, envelope: OutboundEnvelope) -> Result<(), TransportError> {
        Transport::send(self, envelope)
    }
}

impl TransportInner {
    fn lock_link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        self.events.send(event).ok();
    }

    /// Endpoint with the credential appended.
    fn endpoint(&self) -> Result<String, TransportError> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", self.config.url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl(format!(
                "{}: scheme must be ws or wss",
                self.config.url
            )));
        }
        if let Some(token) = self.credentials.token() {
            url.query_pairs_mut().append_pair(&self.config.token_param, &token);
        }
        Ok(url.into())
    }

    fn open_locked(self: &Arc<Self>, link: &mut LinkState, url: String) {
        let id = link.next_id();
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        link.state = ConnectionState::Connecting;
        link.outbound = Some(tx);
        link.session = Some((id, token.clone()));
        self.emit(TransportEvent::Connecting);

        tokio::spawn(run_session(Arc::clone(self), id, token, rx, url));
    }

    /// Returns `false` when `session` has been superseded.
    fn mark_open(&self, session: u64) -> bool {
        {
            let mut link = self.lock_link();
            if !link.is_session(session) {
                return false;
            }
            link.state = ConnectionState::Open;
            link.backoff.reset();
        }
        log::info!("Connected to {}", self.config.url);
        self.emit(TransportEvent::Open);
        true
    }

    fn session_failed(self: &Arc<Self>, session: u64, error: TransportError) {
        let scheduled = {
            let mut link = self.lock_link();
            if !link.is_session(session) {
                return;
            }
            link.session = None;
            link.outbound = None;
            link.state = ConnectionState::Closed;
            self.schedule_reconnect_locked(&mut link)
        };

        log::warn!("Connection to {} lost: {}", self.config.url, error);
        self.errors.report(error.clone().into());
        self.emit(TransportEvent::Error(error));
        self.emit(TransportEvent::Closed { expected: false });
        if let Some((attempt, delay)) = scheduled {
            log::info!("Reconnect attempt {} in {}ms", attempt, delay.as_millis());
            self.emit(TransportEvent::ReconnectScheduled { attempt, delay });
        }
    }

    /// Schedules a reconnect unless one is pending. Returns `(attempt, delay)`
    /// when a new one was scheduled.
    fn schedule_reconnect_locked(self: &Arc<Self>, link: &mut LinkState) -> Option<(u32, Duration)> {
        if link.reconnect.is_some() {
            return None;
        }
        let delay = link.backoff.next_delay();
        let id = link.next_id();
        let token = CancellationToken::new();
        link.reconnect = Some((id, token.clone(), delay));

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => inner.fire_reconnect(id),
            }
        });
        Some((link.backoff.attempt(), delay))
    }

    fn fire_reconnect(self: &Arc<Self>, id: u64) {
        let retry = {
            let mut link = self.lock_link();
            if !link.reconnect.as_ref().is_some_and(|(current, _, _)| *current == id) {
                return;
            }
            link.reconnect = None;
            if link.state != ConnectionState::Closed {
                return;
            }
            match self.endpoint() {
                Ok(url) => {
                    self.open_locked(&mut link, url);
                    None
                }
                Err(e) => Some((e, self.schedule_reconnect_locked(&mut link))),
            }
        };

        if let Some((error, scheduled)) = retry {
            log::error!("Reconnect skipped: {}", error);
            self.errors.report(error.into());
            if let Some((attempt, delay)) = scheduled {
                self.emit(TransportEvent::ReconnectScheduled { attempt, delay });
            }
        }
    }

    /// Parses one frame and hands it to the callback. Never fails the session.
    fn handle_text(&self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(InboundMessage::Pong) => {
                log::trace!("pong");
                return;
            }
            Ok(message) => message,
            Err(e) => {
                log::warn!("Dropping inbound frame: {}", e);
                self.errors.report(e.into());
                return;
            }
        };

        let callback = self
            .on_message
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(callback) = callback else {
            log::debug!("No message handler installed, dropping {:?}", message);
            return;
        };

        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback(message))) {
            let error = DispatchError {
                action: "inbound".to_string(),
                prefix: "on_message".to_string(),
                reason: panic_message(panic.as_ref()),
            };
            log::error!("{}", error);
            self.errors.report(error.into());
        }
    }
}

async fn run_session(
    inner: Arc<TransportInner>,
    session: u64,
    cancel: CancellationToken,
    mut outbound: mpsc::UnboundedReceiver<String>,
    url: String,
) {
    log::info!("Connecting to {}", inner.config.url);

    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        result = connect_async(url.as_str()) => result,
    };
    let ws_stream = match connected {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            inner.session_failed(session, TransportError::Connect(e.to_string()));
            return;
        }
    };
    if !inner.mark_open(session) {
        return;
    }

    let (mut write, mut read) = ws_stream.split();
    let period = inner.config.heartbeat_interval.max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let failure = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = write.close().await {
                    log::debug!("Session {} close handshake failed: {}", session, e);
                }
                log::debug!("Session {} closed on request", session);
                return;
            }
            _ = heartbeat.tick() => {
                let ping = OutboundEnvelope::ping(chrono::Utc::now().timestamp_millis());
                match ping.to_json() {
                    Ok(text) => {
                        log::trace!("ping");
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            break TransportError::Socket(e.to_string());
                        }
                    }
                    Err(e) => inner.errors.report(e.into()),
                }
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    break TransportError::Socket(e.to_string());
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => inner.handle_text(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => inner.handle_text(text),
                    Err(e) => inner.errors.report(ParseError::Json(format!("binary frame: {e}")).into()),
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                    break TransportError::Socket(format!("closed by server: {reason}"));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break TransportError::Socket(e.to_string()),
                None => break TransportError::Socket("stream ended".to_string()),
            }
        }
    };

    inner.session_failed(session, failure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{CollectingErrorSink, StreamError};
    use serde_json::json;

    fn transport(url: &str, token: Option<&str>) -> (Transport, Arc<CollectingErrorSink>) {
        let sink = Arc::new(CollectingErrorSink::new());
        let config = TransportConfig {
            url: url.to_string(),
            ..TransportConfig::default()
        };
        let credentials = Arc::new(StaticCredential::new(token.map(str::to_string)));
        (Transport::new(config, credentials, sink.clone()), sink)
    }

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.token_param, "token");
    }

    #[test]
    fn test_endpoint_appends_credential() {
        let (t, _) = transport("ws://localhost:3010/ws?lang=en", Some("abc 123"));
        assert_eq!(t.inner.endpoint().unwrap(), "ws://localhost:3010/ws?lang=en&token=abc+123");

        let (anon, _) = transport("wss://example.com/ws", None);
        assert_eq!(anon.inner.endpoint().unwrap(), "wss://example.com/ws");
    }

    #[test]
    fn test_endpoint_rejects_bad_urls() {
        let (t, _) = transport("not a url", None);
        assert!(matches!(t.connect(), Err(TransportError::InvalidUrl(_))));
        let (t, _) = transport("http://example.com", None);
        assert!(matches!(t.connect(), Err(TransportError::InvalidUrl(_))));
        assert_eq!(t.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_send_while_closed_is_dropped() {
        let (t, sink) = transport("ws://localhost:1/ws", None);
        let result = t.send(OutboundEnvelope::new("discovery.widget.list", json!({})));
        assert_eq!(result, Err(TransportError::NotOpen));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_disconnect_when_idle_is_silent() {
        let (t, _) = transport("ws://localhost:1/ws", None);
        let mut events = t.subscribe();
        t.disconnect();
        assert!(events.try_recv().is_err());
        assert_eq!(t.reconnect_attempt(), 0);
    }

    #[test]
    fn test_malformed_frame_is_reported_not_fatal() {
        let (t, sink) = transport("ws://localhost:1/ws", None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        t.set_message_handler(move |m| seen_cb.lock().unwrap().push(m));

        t.inner.handle_text("{oops");
        t.inner.handle_text(r#"{"type":"pong"}"#);
        t.inner.handle_text(r#"{"a":"user.profile.response","p":{"name":"x"}}"#);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(matches!(sink.errors()[..], [StreamError::Parse(_)]));
    }

    /// Registers a live session so `session_failed` sees an unexpected close.
    fn open_session(t: &Transport) -> u64 {
        let mut link = t.inner.lock_link();
        let id = link.next_id();
        link.session = Some((id, CancellationToken::new()));
        link.state = ConnectionState::Open;
        id
    }

    fn scheduled(events: &mut broadcast::Receiver<TransportEvent>) -> Vec<(u32, Duration)> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransportEvent::ReconnectScheduled { attempt, delay } = event {
                out.push((attempt, delay));
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_are_coalesced_and_back_off() {
        // http is refused when a reconnect fires, so each attempt reschedules without any IO.
        let sink = Arc::new(CollectingErrorSink::new());
        let config = TransportConfig {
            url: "http://example.com/ws".to_string(),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(8),
            ..TransportConfig::default()
        };
        let t = Transport::new(config, Arc::new(StaticCredential::default()), sink.clone());
        let mut events = t.subscribe();

        t.inner.session_failed(open_session(&t), TransportError::Socket("reset".into()));
        t.inner.session_failed(open_session(&t), TransportError::Socket("reset".into()));
        assert_eq!(scheduled(&mut events), vec![(1, Duration::from_secs(2))]);
        assert_eq!(t.pending_reconnect_delay(), Some(Duration::from_secs(2)));
        assert_eq!(t.reconnect_attempt(), 1);

        let mut delays = vec![Duration::from_secs(2)];
        for attempt in 2..=4 {
            let pending = t.pending_reconnect_delay().unwrap();
            tokio::time::sleep(pending + Duration::from_millis(1)).await;
            let next = scheduled(&mut events);
            assert_eq!(next.len(), 1);
            assert_eq!(next[0].0, attempt);
            assert_eq!(t.pending_reconnect_delay(), Some(next[0].1));
            delays.push(next[0].1);
        }
        assert_eq!(delays, [2, 4, 8, 8].map(Duration::from_secs));

        t.disconnect();
        assert_eq!(t.pending_reconnect_delay(), None);
        assert_eq!(t.reconnect_attempt(), 0);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(scheduled(&mut events).is_empty());
        assert_eq!(t.state(), ConnectionState::Closed);
        assert!(sink.errors().iter().all(StreamError::is_retryable));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let (t, sink) = transport("ws://localhost:1/ws", None);
        t.set_message_handler(|_| panic!("render bug"));
        t.inner.handle_text(r#"{"a":"x"}"#);
        t.inner.handle_text(r#"{"a":"y"}"#);
        assert_eq!(sink.len(), 2);
    }
}
