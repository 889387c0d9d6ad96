//! A single WebSocket carrying tunnel traffic.

use anyhow::{bail, Context, Result};
use axum::extract::ws::{
    CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket as AxumWebSocket,
};
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use log::debug;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

type MessageSink = Pin<Box<dyn Sink<Message, Error = anyhow::Error> + Send>>;
type MessageSource = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

/// An established WebSocket, split so that one task can write while another
/// is blocked reading.
///
/// Whether the socket was dialed or accepted, and whatever it runs on, is
/// erased here; the tunnel only sees messages.
pub struct TunnelLink {
    sink: Mutex<MessageSink>,
    source: Mutex<MessageSource>,
}

impl TunnelLink {
    pub fn new<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        Self::from_parts(
            sink.sink_map_err(anyhow::Error::from),
            source.map(|message| message.map_err(anyhow::Error::from)),
        )
    }

    /// Wraps a socket upgraded by the HTTP server.
    pub fn from_axum(socket: AxumWebSocket) -> Self {
        let (sink, source) = socket.split();
        Self::from_parts(
            sink.with(|message: Message| future::ready(to_axum(message))),
            source.map(|message| message.map(from_axum).map_err(anyhow::Error::from)),
        )
    }

    fn from_parts<Si, St>(sink: Si, source: St) -> Self
    where
        Si: Sink<Message, Error = anyhow::Error> + Send + 'static,
        St: Stream<Item = Result<Message>> + Send + 'static,
    {
        TunnelLink {
            sink: Mutex::new(Box::pin(sink)),
            source: Mutex::new(Box::pin(source)),
        }
    }

    /// Opens a new WebSocket to `url`.
    pub async fn dial(url: &str) -> Result<Self> {
        let (ws, response) = timeout(DIAL_TIMEOUT, connect_async(url))
            .await
            .with_context(|| format!("timed out connecting to {url}"))?
            .with_context(|| format!("failed to connect to {url}"))?;
        debug!("connected to {url}, status: {}", response.status());
        Ok(Self::new(ws))
    }

    /// Sends one datagram as one binary message.
    pub async fn send_packet(&self, data: &[u8]) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(data.to_vec()))
            .await
    }

    /// Sends an empty ping frame.
    pub async fn send_ping(&self) -> Result<()> {
        self.sink.lock().await.send(Message::Ping(Vec::new())).await
    }

    /// Waits for the next message; `None` once the peer has gone away.
    pub async fn recv(&self) -> Option<Result<Message>> {
        self.source.lock().await.next().await
    }

    /// Sends a close frame and flushes; errors are irrelevant at this point.
    pub async fn close(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!("error while closing link: {e}");
        }
    }
}

fn to_axum(message: Message) -> Result<AxumMessage> {
    Ok(match message {
        Message::Text(text) => AxumMessage::Text(text),
        Message::Binary(data) => AxumMessage::Binary(data),
        Message::Ping(data) => AxumMessage::Ping(data),
        Message::Pong(data) => AxumMessage::Pong(data),
        Message::Close(frame) => AxumMessage::Close(frame.map(|frame| AxumCloseFrame {
            code: frame.code.into(),
            reason: frame.reason,
        })),
        Message::Frame(_) => bail!("raw frames are never sent"),
    })
}

fn from_axum(message: AxumMessage) -> Message {
    match message {
        AxumMessage::Text(text) => Message::Text(text),
        AxumMessage::Binary(data) => Message::Binary(data),
        AxumMessage::Ping(data) => Message::Ping(data),
        AxumMessage::Pong(data) => Message::Pong(data),
        AxumMessage::Close(frame) => Message::Close(frame.map(|frame| CloseFrame {
            code: frame.code.into(),
            reason: frame.reason,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn link_pair() -> (TunnelLink, WebSocketStream<tokio::io::DuplexStream>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (local, remote) = tokio::join!(
            WebSocketStream::from_raw_socket(local, Role::Client, None),
            WebSocketStream::from_raw_socket(remote, Role::Server, None),
        );
        (TunnelLink::new(local), remote)
    }

    #[tokio::test]
    async fn packets_are_binary_messages() {
        let (link, mut peer) = link_pair().await;
        link.send_packet(b"abc").await.unwrap();
        link.send_ping().await.unwrap();

        assert_eq!(
            peer.next().await.unwrap().unwrap(),
            Message::Binary(b"abc".to_vec())
        );
        assert_eq!(peer.next().await.unwrap().unwrap(), Message::Ping(Vec::new()));
    }

    #[tokio::test]
    async fn recv_ends_when_peer_goes_away() {
        let (link, mut peer) = link_pair().await;
        peer.send(Message::Binary(vec![7; 3])).await.unwrap();
        drop(peer);

        assert_eq!(
            link.recv().await.unwrap().unwrap(),
            Message::Binary(vec![7; 3])
        );
        assert!(!matches!(link.recv().await, Some(Ok(Message::Binary(_)))));
    }

    #[test]
    fn axum_messages_map_onto_tunnel_messages() {
        let binary = to_axum(Message::Binary(vec![1, 2, 3])).unwrap();
        assert_eq!(from_axum(binary), Message::Binary(vec![1, 2, 3]));

        let close = Message::Close(Some(CloseFrame {
            code: 1001u16.into(),
            reason: "going away".into(),
        }));
        match to_axum(close.clone()).unwrap() {
            AxumMessage::Close(Some(frame)) => {
                assert_eq!(frame.code, 1001);
                assert_eq!(frame.reason, "going away");
                assert_eq!(from_axum(AxumMessage::Close(Some(frame))), close);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dial_fails_on_refused_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(TunnelLink::dial(&format!("ws://{addr}/tunnel")).await.is_err());
    }
}
