//! WebRTC data channel backend with WebSocket signaling.
//!
//! Both sides join a room on the signaling server: the listener at
//! `{signal}/new/{own_id}`, the dialer at `{signal}/{peer}`. The dialer sends
//! a JSON offer, the listener answers, and from then on the data channel
//! carries the REPL stream.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use replink_proto::ConnectionUid;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{Link, LinkInfo};
use crate::channel::{Sink, lock};
use crate::config::P2pConfig;
use crate::{Error, Result};

/// Data channel label.
const LABEL: &str = "replink";
/// How long a dial waits for the answer and the channel to open.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Messages exchanged through the signaling room.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Signal {
    /// Dialer to listener.
    Offer {
        /// Dialer's id.
        from: ConnectionUid,
        /// SDP offer with gathered candidates.
        description: RTCSessionDescription,
    },
    /// Listener to dialer.
    Answer {
        /// SDP answer with gathered candidates.
        description: RTCSessionDescription,
    },
}

/// Joins `signal` and a room path.
fn room_url(signal: &str, path: &str) -> String {
    format!("{}/{path}", signal.trim_end_matches('/'))
}

/// Open signaling socket.
type Room = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Connects to a signaling room.
async fn join(url: &str) -> Result<Room> {
    debug!(url, "joining signaling room");
    let (room, _) = connect_async(url).await.map_err(Error::connect)?;
    Ok(room)
}

/// Sends one signaling message.
async fn post(room: &mut Room, signal: &Signal) -> Result<()> {
    let text = serde_json::to_string(signal).map_err(Error::connect)?;
    room.send(Message::Text(text)).await.map_err(Error::connect)
}

/// Waits for the next well-formed signaling message.
async fn next_signal(room: &mut Room) -> Result<Signal> {
    while let Some(frame) = room.next().await {
        match frame.map_err(Error::connect)? {
            Message::Text(text) => match serde_json::from_str(&text) {
                Ok(signal) => return Ok(signal),
                Err(e) => debug!(error = %e, "ignoring signaling message"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(Error::ConnectFailed("signaling room closed".into()))
}

/// Sets `desc` locally and waits for ICE gathering to finish.
async fn settle(
    pc: &RTCPeerConnection,
    desc: RTCSessionDescription,
) -> Result<RTCSessionDescription> {
    let mut gathered = pc.gathering_complete_promise().await;
    pc.set_local_description(desc).await.map_err(Error::connect)?;
    let _ = gathered.recv().await;
    pc.local_description()
        .await
        .ok_or_else(|| Error::ConnectFailed("no local description".into()))
}

/// Hooks `dc` up to `sink`. The receiver fires once the channel is open.
fn wire(dc: &Arc<RTCDataChannel>, sink: &Sink) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let opened = Arc::new(Mutex::new(Some(tx)));
    let notify = Arc::clone(&opened);
    dc.on_open(Box::new(move || {
        if let Some(tx) = lock(&notify).take() {
            let _ = tx.send(());
        }
        Box::pin(async {})
    }));
    let inbound = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        inbound.deliver(&msg.data);
        Box::pin(async {})
    }));
    let closing = sink.clone();
    dc.on_close(Box::new(move || {
        debug!("data channel closed");
        closing.closed();
        Box::pin(async {})
    }));
    if dc.ready_state() == RTCDataChannelState::Open {
        if let Some(tx) = lock(&opened).take() {
            let _ = tx.send(());
        }
    }
    rx
}

/// A board, or a browser tab bridging one, reached over WebRTC.
pub struct P2pLink {
    /// Signaling and ICE settings.
    config: P2pConfig,
    /// Id announced when listening.
    own_id: ConnectionUid,
    /// Peer connection while open.
    pc: Option<Arc<RTCPeerConnection>>,
    /// Data channel while open.
    dc: Option<Arc<RTCDataChannel>>,
}

impl P2pLink {
    /// Creates an unopened link, generating an id if none is configured.
    pub fn new(config: P2pConfig) -> Self {
        let own_id = config.own_id.clone().unwrap_or_else(ConnectionUid::random);
        Self {
            config,
            own_id,
            pc: None,
            dc: None,
        }
    }

    /// Id this side is reachable under.
    pub const fn own_id(&self) -> &ConnectionUid {
        &self.own_id
    }

    /// Builds a peer connection with the configured ICE servers.
    async fn peer_connection(&self, sink: &Sink) -> Result<Arc<RTCPeerConnection>> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(Error::connect)?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(Error::connect)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..RTCIceServer::default()
            }],
            ..RTCConfiguration::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(Error::connect)?);
        let watcher = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(%state, "peer connection state");
            if matches!(
                state,
                RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
                    | RTCPeerConnectionState::Disconnected
            ) {
                watcher.closed();
            }
            Box::pin(async {})
        }));
        Ok(pc)
    }

    /// Offers a data channel to `peer`.
    async fn dial(
        &self,
        pc: &RTCPeerConnection,
        peer: &ConnectionUid,
        sink: &Sink,
    ) -> Result<Arc<RTCDataChannel>> {
        let dc = pc.create_data_channel(LABEL, None).await.map_err(Error::connect)?;
        let opened = wire(&dc, sink);
        let offer = pc.create_offer(None).await.map_err(Error::connect)?;
        let description = settle(pc, offer).await?;

        let mut room = join(&room_url(&self.config.signal, peer.as_str())).await?;
        post(&mut room, &Signal::Offer {
            from: self.own_id.clone(),
            description,
        })
        .await?;
        let negotiate = async {
            loop {
                if let Signal::Answer { description } = next_signal(&mut room).await? {
                    pc.set_remote_description(description).await.map_err(Error::connect)?;
                    break;
                }
            }
            opened.await.map_err(|_| Error::ConnectFailed("data channel never opened".into()))
        };
        tokio::time::timeout(DIAL_TIMEOUT, negotiate)
            .await
            .map_err(|_| Error::ConnectFailed(format!("no answer from {peer}")))??;
        Ok(dc)
    }

    /// Waits for a dialer, answers it and accepts its data channel.
    async fn listen(&self, pc: &RTCPeerConnection, sink: &Sink) -> Result<Arc<RTCDataChannel>> {
        let (tx, rx) = oneshot::channel();
        let incoming = Mutex::new(Some(tx));
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            if let Some(tx) = lock(&incoming).take() {
                let _ = tx.send(dc);
            }
            Box::pin(async {})
        }));

        let mut room = join(&room_url(&self.config.signal, &format!("new/{}", self.own_id))).await?;
        debug!(id = %self.own_id, "waiting for a peer");
        let (from, offer) = loop {
            if let Signal::Offer { from, description } = next_signal(&mut room).await? {
                break (from, description);
            }
        };
        debug!(%from, "offer received");
        pc.set_remote_description(offer).await.map_err(Error::connect)?;
        let answer = pc.create_answer(None).await.map_err(Error::connect)?;
        let description = settle(pc, answer).await?;
        post(&mut room, &Signal::Answer { description }).await?;

        let accept = async {
            let dc = rx
                .await
                .map_err(|_| Error::ConnectFailed("peer opened no data channel".into()))?;
            let opened = wire(&dc, sink);
            opened.await.map_err(|_| Error::ConnectFailed("data channel never opened".into()))?;
            Ok::<_, Error>(dc)
        };
        tokio::time::timeout(DIAL_TIMEOUT, accept)
            .await
            .map_err(|_| Error::ConnectFailed(format!("{from} never opened a data channel")))?
    }
}

impl fmt::Debug for P2pLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("P2pLink")
            .field("config", &self.config)
            .field("own_id", &self.own_id)
            .field("open", &self.dc.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Link for P2pLink {
    fn name(&self) -> &'static str {
        "p2p"
    }

    async fn request_access(&mut self) -> Result<LinkInfo> {
        if self.config.signal.is_empty() {
            return Err(Error::AccessDenied("no signaling server configured".into()));
        }
        let mut info = LinkInfo::new("p2p");
        info.peer_id = Some(self.own_id.to_string());
        info.name = self.config.peer.as_ref().map(ToString::to_string);
        info.url = Some(self.config.signal.clone());
        Ok(info)
    }

    async fn connect(&mut self, sink: Sink) -> Result<()> {
        self.request_access().await?;
        let pc = self.peer_connection(&sink).await?;
        let opened = match self.config.peer.clone() {
            Some(peer) => self.dial(&pc, &peer, &sink).await,
            None => self.listen(&pc, &sink).await,
        };
        match opened {
            Ok(dc) => {
                debug!(label = dc.label(), "data channel open");
                self.dc = Some(dc);
                self.pc = Some(pc);
                Ok(())
            }
            Err(e) => {
                if let Err(err) = pc.close().await {
                    debug!(error = %err, "closing peer connection");
                }
                Err(e)
            }
        }
    }

    async fn send(&mut self, chunk: &[u8]) -> Result<()> {
        let dc = self.dc.as_ref().ok_or(Error::Closed)?;
        dc.send(&Bytes::copy_from_slice(chunk))
            .await
            .map(drop)
            .map_err(|e| Error::ConnectFailed(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(dc) = self.dc.take() {
            if let Err(e) = dc.close().await {
                warn!(error = %e, "closing data channel");
            }
        }
        if let Some(pc) = self.pc.take() {
            pc.close().await.map_err(Error::connect)?;
        }
        Ok(())
    }

    fn max_chunk(&self) -> Option<usize> {
        None
    }

    fn pacing(&self) -> Duration {
        Duration::from_millis(1)
    }
}
