//! WebSocket implementation of the ticker transport.
//!
//! Each [`WsTickerConnection`] wraps one [`WsConnection`]. The desired token
//! set lives in a `watch` channel so the connect hook, which runs inside the
//! socket task, can read it synchronously and replay the subscriptions after
//! every reconnect.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vega_core::error::{Result, VegaError};
use vega_core::resilience::BackoffConfig;
use vega_core::types::StreamMode;
use vega_core::ws::{
    OnBinaryCallback, OnConnectCallback, OnMessageCallback, PingPayload, WsConnConfig,
    WsConnection,
};

use crate::codec::{self, Frame};
use crate::transport::{ConnectionSink, TickerConnection, TickerConnector};

/// Settings shared by every socket of one account.
#[derive(Debug, Clone)]
pub struct WsTickerConfig {
    pub ws_url: String,
    pub api_key: String,
    pub access_token: String,
    pub ping_interval: Option<Duration>,
    pub backoff: BackoffConfig,
    /// How long `connect` waits for the first handshake.
    pub connect_timeout: Duration,
}

impl WsTickerConfig {
    fn endpoint(&self) -> Result<String> {
        let mut url = url::Url::parse(&self.ws_url)
            .map_err(|e| VegaError::Config(format!("invalid ws_url '{}': {e}", self.ws_url)))?;
        url.query_pairs_mut()
            .append_pair("api_key", &self.api_key)
            .append_pair("access_token", &self.access_token);
        Ok(url.to_string())
    }
}

pub struct WsTickerConnector {
    config: WsTickerConfig,
}

impl WsTickerConnector {
    pub fn new(config: WsTickerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TickerConnector for WsTickerConnector {
    async fn connect(
        &self,
        connection_id: u64,
        sink: Arc<ConnectionSink>,
    ) -> Result<Arc<dyn TickerConnection>> {
        let ws = WsConnection::new(WsConnConfig {
            url: self.config.endpoint()?,
            extra_headers: HashMap::new(),
            ping_interval: self.config.ping_interval,
            ping_payload: Some(PingPayload::WebSocketPing),
            backoff: self.config.backoff.clone(),
            id: connection_id,
        });
        let (desired_tx, desired_rx) = watch::channel(BTreeMap::<u32, StreamMode>::new());

        let text_sink = sink.clone();
        let on_text: OnMessageCallback = Arc::new(move |conn_id, text| {
            match codec::decode_frame(text) {
                Ok(Frame::Ticks { ticks, malformed }) => {
                    text_sink.record_malformed(malformed);
                    text_sink.push(ticks);
                }
                Ok(Frame::Error(msg)) => warn!("[ticker-{conn_id}] server error: {msg}"),
                Ok(Frame::Other) => {}
                Err(e) => {
                    text_sink.record_malformed(1);
                    debug!("[ticker-{conn_id}] {e}");
                }
            }
        });
        // Single-byte binary frames are heartbeats.
        let on_binary: OnBinaryCallback = Arc::new(|_conn_id, _data| {});
        let on_connect: OnConnectCallback = Arc::new(move || {
            let desired: Vec<(u32, StreamMode)> =
                desired_rx.borrow().iter().map(|(t, m)| (*t, *m)).collect();
            codec::subscription_messages(&desired)
        });

        ws.start(on_text, Some(on_binary), Some(on_connect)).await;

        let mut state = ws.connection_state();
        let ready = matches!(
            tokio::time::timeout(self.config.connect_timeout, state.wait_for(|up| *up)).await,
            Ok(Ok(_))
        );
        if !ready {
            ws.abort().await;
            return Err(VegaError::timeout(
                format!("ticker connect {connection_id}"),
                self.config.connect_timeout,
            ));
        }
        info!("[ticker-{connection_id}] ready for {}", sink.account_id());

        Ok(Arc::new(WsTickerConnection {
            id: connection_id,
            ws,
            desired: desired_tx,
            sink,
        }))
    }
}

pub struct WsTickerConnection {
    id: u64,
    ws: WsConnection,
    desired: watch::Sender<BTreeMap<u32, StreamMode>>,
    sink: Arc<ConnectionSink>,
}

impl WsTickerConnection {
    fn ensure_connected(&self) -> Result<()> {
        if self.ws.is_connected() {
            Ok(())
        } else {
            Err(VegaError::Transport(format!("ticker {} is not connected", self.id)))
        }
    }
}

#[async_trait]
impl TickerConnection for WsTickerConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_connected(&self) -> bool {
        self.ws.is_connected()
    }

    async fn subscribe(&self, tokens: &[u32], mode: StreamMode) -> Result<()> {
        self.ensure_connected()?;
        self.desired.send_modify(|d| {
            for &t in tokens {
                d.insert(t, mode);
            }
        });
        let sent = async {
            self.ws.send(codec::subscribe_message(tokens)).await?;
            self.ws.send(codec::mode_message(mode, tokens)).await
        }
        .await;
        if sent.is_err() {
            self.desired.send_modify(|d| {
                for t in tokens {
                    d.remove(t);
                }
            });
        }
        sent
    }

    async fn unsubscribe(&self, tokens: &[u32]) -> Result<()> {
        self.desired.send_modify(|d| {
            for t in tokens {
                d.remove(t);
            }
        });
        self.ensure_connected()?;
        self.ws.send(codec::unsubscribe_message(tokens)).await
    }

    async fn reconnect(&self, tokens: &[(u32, StreamMode)]) -> Result<()> {
        self.desired
            .send_replace(tokens.iter().copied().collect::<BTreeMap<_, _>>());
        self.ws.reconnect().await?;
        self.sink.touch();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.ws.stop().await;
        Ok(())
    }

    async fn abort(&self) {
        self.ws.abort().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TickSink;

    fn config(url: &str) -> WsTickerConfig {
        WsTickerConfig {
            ws_url: url.into(),
            api_key: "key".into(),
            access_token: "tok en".into(),
            ping_interval: None,
            backoff: BackoffConfig {
                max_attempts: 1,
                initial_delay_ms: 1,
                ..BackoffConfig::default()
            },
            connect_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn endpoint_carries_credentials() {
        let url = config("wss://ws.example.com/").endpoint().unwrap();
        assert_eq!(url, "wss://ws.example.com/?api_key=key&access_token=tok+en");
        assert!(matches!(
            config("not a url").endpoint(),
            Err(VegaError::Config(_))
        ));
    }

    #[tokio::test]
    async fn connect_times_out_against_dead_endpoint() {
        let (handoff, _rx) = TickSink::channel(4);
        let sink = Arc::new(ConnectionSink::new(9, "A".into(), handoff));
        let connector = WsTickerConnector::new(config("ws://127.0.0.1:1/"));
        let err = connector.connect(9, sink).await.err().unwrap();
        assert!(matches!(err, VegaError::Timeout { .. }));
    }

    #[tokio::test]
    async fn connect_resolves_on_handshake_and_sends_subscriptions() {
        use futures_util::StreamExt;
        use tokio_tungstenite::tungstenite::Message;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let _ = seen_tx.send(text.as_str().to_string());
                }
            }
        });

        let (handoff, _rx) = TickSink::channel(4);
        let sink = Arc::new(ConnectionSink::new(3, "A".into(), handoff));
        let connector = WsTickerConnector::new(config(&format!("ws://{addr}/")));
        let conn = connector.connect(3, sink).await.unwrap();
        assert!(conn.is_connected());

        conn.subscribe(&[256265], StreamMode::Full).await.unwrap();
        let wait = Duration::from_secs(1);
        let first = tokio::time::timeout(wait, seen_rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, codec::subscribe_message(&[256265]));
        let second = tokio::time::timeout(wait, seen_rx.recv()).await.unwrap().unwrap();
        assert_eq!(second, codec::mode_message(StreamMode::Full, &[256265]));
        conn.close().await.unwrap();
    }
}
