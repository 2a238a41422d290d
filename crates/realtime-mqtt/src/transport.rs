//! Broker transports: anything that can carry MQTT packets both ways.

use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::BytesMut;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::Error;
use crate::mqtt::{MqttCodec, Packet};

pub type PacketSink = Pin<Box<dyn Sink<Packet, Error = Error> + Send>>;
pub type PacketStream = Pin<Box<dyn Stream<Item = Result<Packet, Error>> + Send>>;

/// Split halves of an open broker connection.
pub struct Transport {
    pub sink: PacketSink,
    pub stream: PacketStream,
}

impl Transport {
    /// Frame a raw byte stream (TCP socket, TLS stream, in-memory duplex) with
    /// the MQTT codec.
    pub fn from_io<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (sink, stream) = Framed::new(io, MqttCodec::default()).split();
        Self {
            sink: Box::pin(sink.sink_map_err(Error::from)),
            stream: Box::pin(stream.map(|r| r.map_err(Error::from))),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens broker connections. Implementations own socket setup, TLS, and proxy
/// concerns; the connection manager only sees framed packets.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Transport, Error>;
}

// ---------------------------------------------------------------------------
// Plain TCP
// ---------------------------------------------------------------------------

/// Plain TCP connector. Wrap it (or supply your own [`Connector`]) when the
/// broker requires TLS on a raw socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Transport, Error> {
        let tcp = tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Timeout("tcp connect"))??;
        tcp.set_nodelay(true)?;
        tracing::debug!(host, port, "tcp connected");
        Ok(Transport::from_io(tcp))
    }
}

// ---------------------------------------------------------------------------
// MQTT over WebSocket
// ---------------------------------------------------------------------------

const WS_SUBPROTOCOL: &str = "mqtt";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// MQTT over WebSocket (`wss://host:port/path`, subprotocol `mqtt`). TLS is
/// negotiated by tungstenite using the platform's native roots.
///
/// The default path and framing are assumed, not broker-verified; implement
/// [`Connector`] when the broker expects something else.
#[derive(Debug, Clone)]
pub struct WsConnector {
    pub path: String,
    pub secure: bool,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            path: "/chat".to_string(),
            secure: true,
        }
    }
}

impl WsConnector {
    pub(crate) fn build_url(&self, host: &str, port: u16) -> Result<String, Error> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut u = url::Url::parse(&format!("{scheme}://{host}:{port}/"))?;
        u.set_path(&self.path);
        Ok(u.to_string())
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Transport, Error> {
        let url = self.build_url(host, port)?;
        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            tungstenite::http::HeaderValue::from_static(WS_SUBPROTOCOL),
        );
        let (ws, _resp): (WsStream, _) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| Error::Timeout("websocket connect"))??;
        tracing::debug!(%url, "websocket connected");

        let (ws_write, ws_read) = ws.split();
        let sink = ws_write.sink_map_err(Error::from).with(|packet: Packet| async move {
            let mut buf = BytesMut::new();
            MqttCodec::default().encode(packet, &mut buf)?;
            Ok::<_, Error>(tungstenite::Message::Binary(buf.freeze()))
        });
        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(WsPackets {
                inner: ws_read,
                buf: BytesMut::new(),
                codec: MqttCodec::default(),
            }),
        })
    }
}

/// Reassembles MQTT packets from WebSocket binary frames. A frame may carry
/// several packets or a fragment of one.
struct WsPackets {
    inner: futures_util::stream::SplitStream<WsStream>,
    buf: BytesMut,
    codec: MqttCodec,
}

impl Stream for WsPackets {
    type Item = Result<Packet, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            match this.codec.decode(&mut this.buf) {
                Ok(Some(packet)) => return Poll::Ready(Some(Ok(packet))),
                Ok(None) => {}
                Err(e) => return Poll::Ready(Some(Err(e.into()))),
            }
            match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(tungstenite::Message::Binary(data))) => this.buf.extend_from_slice(&data),
                Some(Ok(tungstenite::Message::Close(_))) | None => return Poll::Ready(None),
                Some(Ok(_)) => {
                    // Ignore text, ping, pong frames
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
