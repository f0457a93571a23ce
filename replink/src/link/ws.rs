//! WebSocket / WebREPL backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use super::{Handshake, Link, LinkInfo};
use crate::channel::Sink;
use crate::config::WsConfig;
use crate::{Error, Result};

/// Connected socket.
type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
/// Write half, shared with the heartbeat.
type Writer = Arc<Mutex<SplitSink<Socket, Message>>>;

/// Shortest heartbeat interval accepted.
const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

/// A board reachable over WebREPL, or any relay speaking the same framing.
#[derive(Debug)]
pub struct WsLink {
    /// URL and login settings.
    config: WsConfig,
    /// Write half while connected.
    writer: Option<Writer>,
    /// Stops the pump.
    stop: Option<oneshot::Sender<()>>,
    /// Receive and heartbeat task.
    pump: Option<JoinHandle<()>>,
}

impl WsLink {
    /// Creates an unopened link.
    pub const fn new(config: WsConfig) -> Self {
        Self {
            config,
            writer: None,
            stop: None,
            pump: None,
        }
    }
}

#[async_trait]
impl Link for WsLink {
    fn name(&self) -> &'static str {
        "ws"
    }

    async fn request_access(&mut self) -> Result<LinkInfo> {
        let url = &self.config.url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(Error::AccessDenied(format!("not a WebSocket URL: {url:?}")));
        }
        let mut info = LinkInfo::new("ws");
        info.url = Some(url.clone());
        Ok(info)
    }

    async fn connect(&mut self, sink: Sink) -> Result<()> {
        let (socket, _) = connect_async(self.config.url.as_str()).await.map_err(Error::connect)?;
        debug!(url = %self.config.url, "websocket open");
        let (writer, reader) = socket.split();
        let writer = Arc::new(Mutex::new(writer));
        let (stop, stopped) = oneshot::channel();
        let heartbeat = self.config.heartbeat.max(MIN_HEARTBEAT);
        self.pump = Some(tokio::spawn(pump(reader, Arc::clone(&writer), sink, stopped, heartbeat)));
        self.writer = Some(writer);
        self.stop = Some(stop);
        Ok(())
    }

    async fn send(&mut self, chunk: &[u8]) -> Result<()> {
        let writer = self.writer.as_ref().ok_or(Error::Closed)?;
        // WebREPL reads REPL input from text frames only.
        let text = String::from_utf8_lossy(chunk).into_owned();
        writer
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::ConnectFailed(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                warn!(error = %e, "websocket pump panicked");
            }
        }
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.lock().await.close().await {
                debug!(error = %e, "websocket close");
            }
        }
        Ok(())
    }

    fn max_chunk(&self) -> Option<usize> {
        Some(128)
    }

    fn pacing(&self) -> Duration {
        Duration::from_millis(150)
    }

    fn handshake(&self) -> Handshake {
        Handshake::WebRepl {
            password: self.config.password.clone(),
            prompt_timeout: self.config.prompt_timeout,
        }
    }
}

/// Forwards frames to `sink` and keeps the connection alive until stopped.
async fn pump(
    mut reader: SplitStream<Socket>,
    writer: Writer,
    sink: Sink,
    mut stopped: oneshot::Receiver<()>,
    heartbeat: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            _ = ticker.tick() => {
                if let Err(e) = writer.lock().await.send(Message::Text(String::new())).await {
                    warn!(error = %e, "websocket heartbeat failed");
                    break;
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => sink.deliver(text.as_bytes()),
                Some(Ok(Message::Binary(data))) => sink.deliver(&data),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "websocket receive failed");
                    break;
                }
            },
        }
    }
    debug!("websocket pump stopped");
    sink.closed();
}
