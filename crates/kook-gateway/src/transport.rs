//! Seams between the session and the outside world: where the gateway URL
//! comes from and how a stream to it is opened.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use kook_api::RestClient;
use kook_api::gateway::GetGateway;
use kook_common::Ticket;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::trace;

use crate::error::Result;

/// One inbound frame, stripped of transport details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<String>),
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait FrameStream: Send {
    /// `None` once the stream has ended. Must be cancel safe.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
}

pub struct Connection {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Connection>;
}

/// Resolves a `gateway/index` request to a stream URL.
#[async_trait]
pub trait GatewayLocator: Send + Sync {
    async fn locate(&self, request: &GetGateway) -> Result<String>;
}

// ── WebSocket ─────────────────────────────────────────────────────────────────

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection> {
        let (ws, response) = connect_async(url).await?;
        trace!(status = %response.status(), "websocket upgraded");
        let (sink, stream) = ws.split();
        Ok(Connection {
            sink: Box::new(WsSink(sink)),
            stream: Box::new(WsStream(stream)),
        })
    }
}

struct WsSink(SplitSink<Ws, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.0.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.0.close().await?;
        Ok(())
    }
}

struct WsStream(SplitStream<Ws>);

#[async_trait]
impl FrameStream for WsStream {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.0.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };
            return Some(Ok(match message {
                Message::Text(text) => Frame::Text(text.to_string()),
                Message::Binary(bytes) => Frame::Binary(bytes.to_vec()),
                Message::Close(frame) => Frame::Close(frame.map(|f| f.reason.to_string())),
                // tungstenite answers pings itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }));
        }
    }
}

// ── REST ──────────────────────────────────────────────────────────────────────

/// Asks the REST API, authenticating with the current (possibly rotated)
/// ticket.
pub struct RestLocator {
    rest: RestClient,
    ticket: Arc<RwLock<Ticket>>,
}

impl RestLocator {
    pub fn new(rest: RestClient, ticket: Arc<RwLock<Ticket>>) -> Self {
        Self { rest, ticket }
    }
}

#[async_trait]
impl GatewayLocator for RestLocator {
    async fn locate(&self, request: &GetGateway) -> Result<String> {
        let authorization = self.ticket.read().await.authorization();
        let gateway = self.rest.request_data(request, &authorization).await?;
        Ok(gateway.url)
    }
}
