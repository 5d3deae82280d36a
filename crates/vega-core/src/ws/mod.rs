//! WebSocket client with auto-reconnect and subscription restore.

pub mod client;

pub use client::{
    OnBinaryCallback, OnConnectCallback, OnMessageCallback, PingPayload, WsConnConfig,
    WsConnection,
};
