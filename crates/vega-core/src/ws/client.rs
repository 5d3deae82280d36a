//! Single WebSocket connection with auto-reconnect and ping keep-alive.
//!
//! Each `WsConnection` runs as a tokio task that:
//! 1. Connects to the WebSocket endpoint (TLS).
//! 2. Sends the messages produced by the `on_connect` callback, so the
//!    current subscription set is restored after every reconnect.
//! 3. Reads messages and forwards them to a callback.
//! 4. Sends periodic ping messages.
//! 5. Reconnects on disconnection with bounded exponential backoff; once the
//!    attempts are exhausted the task exits and `is_connected` stays false.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::{Result, VegaError};
use crate::resilience::{Backoff, BackoffConfig};

/// Callback invoked for each received text message.
///
/// Parameters: `(connection_id, message_text)`
pub type OnMessageCallback = Arc<dyn Fn(u64, &str) + Send + Sync>;

/// Callback invoked for each received binary message.
///
/// Parameters: `(connection_id, message_bytes)`
pub type OnBinaryCallback = Arc<dyn Fn(u64, &[u8]) + Send + Sync>;

/// Produces the messages to send right after every successful connect.
pub type OnConnectCallback = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Ping payload format.
#[derive(Debug, Clone)]
pub enum PingPayload {
    /// Send a text frame.
    Text(String),
    /// Send a JSON object as text.
    Json(serde_json::Value),
    /// Use the standard WebSocket ping frame.
    WebSocketPing,
}

/// Configuration for a single WebSocket connection.
#[derive(Debug, Clone)]
pub struct WsConnConfig {
    /// Full WebSocket URL, credentials included where the server expects
    /// them in the query string.
    pub url: String,
    /// Extra HTTP headers for the handshake.
    pub extra_headers: HashMap<String, String>,
    /// Interval between ping messages.
    pub ping_interval: Option<Duration>,
    /// Ping message format.
    pub ping_payload: Option<PingPayload>,
    /// Reconnect schedule.
    pub backoff: BackoffConfig,
    /// Connection identifier, used in logs and callbacks.
    pub id: u64,
}

#[derive(Debug)]
enum Command {
    Send(String),
    Reconnect,
}

#[derive(Clone)]
struct Callbacks {
    on_text: OnMessageCallback,
    on_binary: Option<OnBinaryCallback>,
    on_connect: Option<OnConnectCallback>,
}

struct Running {
    cmd_tx: mpsc::Sender<Command>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A single WebSocket connection managed by a background tokio task.
pub struct WsConnection {
    /// Connection configuration.
    pub config: WsConnConfig,
    connected: Arc<watch::Sender<bool>>,
    callbacks: Mutex<Option<Callbacks>>,
    running: Mutex<Option<Running>>,
}

impl WsConnection {
    /// Create a new (not yet started) connection.
    pub fn new(config: WsConnConfig) -> Self {
        Self {
            config,
            connected: Arc::new(watch::Sender::new(false)),
            callbacks: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    /// Start the connection task.
    ///
    /// Text frames go to `on_text`, binary frames to `on_binary`.
    /// `on_connect` is consulted after every successful handshake.
    pub async fn start(
        &self,
        on_text: OnMessageCallback,
        on_binary: Option<OnBinaryCallback>,
        on_connect: Option<OnConnectCallback>,
    ) {
        let callbacks = Callbacks {
            on_text,
            on_binary,
            on_connect,
        };
        *self.callbacks.lock().await = Some(callbacks.clone());
        self.spawn(callbacks).await;
    }

    async fn spawn(&self, callbacks: Callbacks) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(64);
        let config = self.config.clone();
        let connected = self.connected.clone();

        let task = tokio::spawn(async move {
            connection_loop(config, callbacks, cmd_rx, shutdown_rx, connected).await;
        });

        let previous = self.running.lock().await.replace(Running {
            cmd_tx,
            shutdown_tx,
            task,
        });
        if let Some(old) = previous {
            let _ = old.shutdown_tx.send(true);
            old.task.abort();
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Follow handshake and disconnect transitions.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Send a text message on this connection.
    pub async fn send(&self, msg: String) -> Result<()> {
        self.command(Command::Send(msg)).await
    }

    /// Drop the current socket and connect again, restarting the task if it
    /// gave up earlier.
    pub async fn reconnect(&self) -> Result<()> {
        let alive = self
            .running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished());
        if alive {
            return self.command(Command::Reconnect).await;
        }
        let callbacks = self.callbacks.lock().await.clone();
        match callbacks {
            Some(cb) => {
                info!("[ws-{}] restarting connection task", self.config.id);
                self.spawn(cb).await;
                Ok(())
            }
            None => Err(VegaError::WebSocket(format!(
                "connection {} was never started",
                self.config.id
            ))),
        }
    }

    async fn command(&self, cmd: Command) -> Result<()> {
        let tx = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|r| r.cmd_tx.clone())
            .ok_or_else(|| VegaError::WebSocket(format!("connection {} not running", self.config.id)))?;
        tx.send(cmd)
            .await
            .map_err(|_| VegaError::WebSocket(format!("connection {} task has exited", self.config.id)))
    }

    /// Stop the connection and wait for the task to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(r) = running {
            let _ = r.shutdown_tx.send(true);
            let _ = r.task.await;
        }
        self.connected.send_replace(false);
    }

    /// Abort the connection task without a close handshake.
    pub async fn abort(&self) {
        if let Some(r) = self.running.lock().await.take() {
            r.task.abort();
        }
        self.connected.send_replace(false);
    }
}

/// Main connection loop: connects, subscribes, reads, pings, reconnects.
async fn connection_loop(
    config: WsConnConfig,
    callbacks: Callbacks,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
    connected: Arc<watch::Sender<bool>>,
) {
    let mut backoff = Backoff::new(config.backoff.clone());
    let conn_id = config.id;

    loop {
        // Check shutdown before connecting
        if *shutdown_rx.borrow() {
            info!("[ws-{conn_id}] shutdown requested");
            return;
        }

        info!("[ws-{conn_id}] connecting to {}", redact(&config.url));

        let ws_stream = match connect_ws(&config).await {
            Ok(s) => {
                backoff.reset();
                info!("[ws-{conn_id}] connected");
                s
            }
            Err(e) => {
                let Some(delay) = backoff.next_delay() else {
                    error!("[ws-{conn_id}] connection failed: {e}, giving up after {} attempts", backoff.attempts());
                    return;
                };
                error!("[ws-{conn_id}] connection failed: {e}, retrying in {delay:?}");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = shutdown_rx.changed() => return,
                }
                continue;
            }
        };

        let (mut ws_write, mut ws_read) = ws_stream.split();

        // Restore subscriptions
        let mut restored = true;
        if let Some(on_connect) = &callbacks.on_connect {
            for msg in on_connect() {
                debug!("[ws-{conn_id}] subscribing: {msg}");
                if let Err(e) = ws_write.send(Message::Text(msg.into())).await {
                    error!("[ws-{conn_id}] subscribe send failed: {e}");
                    restored = false;
                    break;
                }
            }
        }
        connected.send_replace(restored);

        // Set up ping timer
        let ping_interval = config.ping_interval.map(tokio::time::interval);

        // Pin the interval for use in select!
        tokio::pin! {
            let ping_tick = async {
                if let Some(mut interval) = ping_interval {
                    interval.tick().await;
                    loop {
                        interval.tick().await;
                    }
                } else {
                    // No pinging, wait forever
                    std::future::pending::<()>().await
                }
            };
        }

        // Main read/write loop
        while restored {
            tokio::select! {
                // Shutdown signal
                _ = shutdown_rx.changed() => {
                    info!("[ws-{conn_id}] shutdown signal received");
                    let _ = ws_write.close().await;
                    connected.send_replace(false);
                    return;
                }

                // Incoming message
                msg = ws_read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            (callbacks.on_text)(conn_id, &text);
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if let Some(ref cb) = callbacks.on_binary {
                                cb(conn_id, &data);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws_write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            warn!("[ws-{conn_id}] received close frame");
                            break;
                        }
                        Some(Err(e)) => {
                            error!("[ws-{conn_id}] read error: {e}");
                            break;
                        }
                        None => {
                            warn!("[ws-{conn_id}] stream ended");
                            break;
                        }
                        _ => {} // Pong, Frame: ignore
                    }
                }

                // Command from the owner
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Send(msg)) => {
                            if let Err(e) = ws_write.send(Message::Text(msg.into())).await {
                                error!("[ws-{conn_id}] send error: {e}");
                                break;
                            }
                        }
                        Some(Command::Reconnect) => {
                            info!("[ws-{conn_id}] reconnect requested");
                            let _ = ws_write.close().await;
                            backoff.reset();
                            break;
                        }
                        None => {
                            debug!("[ws-{conn_id}] owner dropped, closing");
                            let _ = ws_write.close().await;
                            connected.send_replace(false);
                            return;
                        }
                    }
                }

                // Ping timer
                _ = &mut ping_tick => {
                    let ping_msg = match &config.ping_payload {
                        Some(PingPayload::Text(t)) => Message::Text(t.clone().into()),
                        Some(PingPayload::Json(j)) => Message::Text(j.to_string().into()),
                        Some(PingPayload::WebSocketPing) | None => {
                            Message::Ping(vec![].into())
                        }
                    };
                    if let Err(e) = ws_write.send(ping_msg).await {
                        error!("[ws-{conn_id}] ping send error: {e}");
                        break;
                    }
                }
            }
        }

        connected.send_replace(false);

        // Disconnected; reconnect at the top of the outer loop
        let Some(delay) = backoff.next_delay() else {
            error!("[ws-{conn_id}] reconnect attempts exhausted");
            return;
        };
        warn!("[ws-{conn_id}] disconnected, reconnecting in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = shutdown_rx.changed() => return,
        }
    }
}

/// Establish a TLS WebSocket connection.
async fn connect_ws(
    config: &WsConnConfig,
) -> anyhow::Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = config.url.as_str().into_client_request()?;
    for (key, value) in &config.extra_headers {
        request.headers_mut().insert(
            tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(key.as_bytes())?,
            value.parse()?,
        );
    }

    let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}

/// Strip the query string (which may carry credentials) for logging.
fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut u) => {
            u.set_query(None);
            u.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
