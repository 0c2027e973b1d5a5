#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context as _;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Frame queued by a pooled connection for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
	Text(String),
	Close,
}

/// What the socket reader observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
	Text(String),
	Closed(Option<String>),
	Error(String),
}

/// Channel ends of one open socket.
///
/// Dropping `outbound` closes the socket.
#[derive(Debug)]
pub struct SocketPair {
	pub outbound: mpsc::UnboundedSender<OutboundFrame>,
	pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens a socket to a URL. Replaceable so connections can be driven without a network.
pub type SocketConnector = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<SocketPair>> + Send + Sync>;

type Ws = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connector backed by a tokio-tungstenite websocket.
pub fn websocket_connector() -> SocketConnector {
	Arc::new(|url: String| {
		Box::pin(async move { connect_websocket(url).await }) as BoxFuture<'static, anyhow::Result<SocketPair>>
	})
}

async fn connect_websocket(url: String) -> anyhow::Result<SocketPair> {
	let url = Url::parse(&url).with_context(|| format!("parse websocket url {url}"))?;
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.with_context(|| format!("connect_async to {url}"))?;

	let (outbound, outbound_rx) = mpsc::unbounded_channel();
	let (inbound_tx, inbound) = mpsc::unbounded_channel();
	tokio::spawn(pump(ws, outbound_rx, inbound_tx));

	Ok(SocketPair { outbound, inbound })
}

async fn pump(
	mut ws: Ws,
	mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
	inbound_tx: mpsc::UnboundedSender<SocketEvent>,
) {
	loop {
		tokio::select! {
			frame = outbound_rx.recv() => {
				match frame {
					Some(OutboundFrame::Text(text)) => {
						if let Err(err) = ws.send(Message::Text(text.into())).await {
							warn!(error = %err, "websocket send failed");
							let _ = inbound_tx.send(SocketEvent::Error(err.to_string()));
							break;
						}
					}
					Some(OutboundFrame::Close) | None => {
						debug!("closing websocket");
						let _ = ws.close(None).await;
						break;
					}
				}
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					let _ = inbound_tx.send(SocketEvent::Closed(None));
					break;
				};

				match msg {
					Ok(Message::Text(text)) => {
						if inbound_tx.send(SocketEvent::Text(text.to_string())).is_err() {
							let _ = ws.close(None).await;
							break;
						}
					}
					Ok(Message::Close(frame)) => {
						let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
						let _ = inbound_tx.send(SocketEvent::Closed(reason));
						break;
					}
					Ok(_) => {}
					Err(err) => {
						let _ = inbound_tx.send(SocketEvent::Error(err.to_string()));
						break;
					}
				}
			}
		}
	}
}
