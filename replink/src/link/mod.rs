//! Byte links to a device.
//!
//! A [`Link`] moves raw bytes; everything above it (decoding, capture,
//! framing) lives in [`crate::Channel`]. Each backend sits behind a cargo
//! feature: `serial` and `ws` are on by default, `ble` and `p2p` are opt-in.

#[cfg(feature = "ble")]
mod ble;
#[cfg(test)]
pub(crate) mod fake;
#[cfg(feature = "p2p")]
mod p2p;
#[cfg(feature = "serial")]
mod serial;
#[cfg(feature = "ws")]
mod ws;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::channel::Sink;

#[cfg(feature = "ble")]
pub use ble::BleLink;
#[cfg(feature = "p2p")]
pub use p2p::P2pLink;
#[cfg(feature = "serial")]
pub use serial::{SerialLink, available_ports};
#[cfg(feature = "ws")]
pub use ws::WsLink;

/// A bidirectional byte stream to one device.
///
/// Implementations push inbound bytes into the [`Sink`] handed to
/// [`connect`](Link::connect) from a pump they own, and call
/// [`Sink::closed`] when the pump exits.
#[async_trait]
pub trait Link: Send + fmt::Debug {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Resolves the device and checks that it may be opened.
    async fn request_access(&mut self) -> Result<LinkInfo>;

    /// Opens the link and starts the inbound pump.
    ///
    /// On failure no pump is left running.
    async fn connect(&mut self, sink: Sink) -> Result<()>;

    /// Sends one chunk of at most [`max_chunk`](Link::max_chunk) bytes.
    async fn send(&mut self, chunk: &[u8]) -> Result<()>;

    /// Stops the pump and releases the device. Safe to call repeatedly.
    async fn disconnect(&mut self) -> Result<()>;

    /// Largest chunk accepted by [`send`](Link::send), `None` if unbounded.
    fn max_chunk(&self) -> Option<usize>;

    /// Delay between consecutive chunks of one write.
    fn pacing(&self) -> Duration;

    /// Exchange the channel runs right after connecting.
    fn handshake(&self) -> Handshake {
        Handshake::None
    }
}

/// Post-connect exchange required by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Handshake {
    /// Nothing to do.
    None,
    /// WebREPL password login.
    WebRepl {
        /// Configured password, if any.
        password: Option<String>,
        /// How long to wait for the `Password:` prompt.
        prompt_timeout: Duration,
    },
}

/// Shortest password WebREPL accepts.
pub const MIN_PASSWORD_LEN: usize = 4;

impl Handshake {
    /// Rejects configurations that cannot succeed, before any I/O.
    pub(crate) fn check(&self) -> Result<()> {
        match self {
            Self::WebRepl { password: Some(p), .. } if p.chars().count() < MIN_PASSWORD_LEN => {
                Err(crate::Error::AccessDenied(format!(
                    "password must be at least {MIN_PASSWORD_LEN} characters"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Connection state of a [`crate::Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ConnState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Link is opening or logging in.
    Connecting,
    /// Ready for transactions.
    Connected,
}

/// What is known about the device behind a link.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct LinkInfo {
    /// Backend name.
    pub link: String,
    /// Advertised or port name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// OS device path or hardware address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// WebSocket URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Own P2P connection id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    /// USB vendor id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    /// USB product id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
}

impl LinkInfo {
    /// Empty record for backend `link`.
    pub fn new(link: &str) -> Self {
        Self {
            link: link.to_owned(),
            ..Self::default()
        }
    }
}

impl fmt::Display for LinkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.link)?;
        for v in [&self.name, &self.address, &self.url, &self.peer_id].into_iter().flatten() {
            write!(f, " {v}")?;
        }
        if let (Some(vid), Some(pid)) = (self.vid, self.pid) {
            write!(f, " [{vid:04x}:{pid:04x}]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_password_is_rejected_before_io() {
        let hs = Handshake::WebRepl {
            password: Some("abc".into()),
            prompt_timeout: Duration::from_secs(1),
        };
        assert!(matches!(hs.check(), Err(crate::Error::AccessDenied(_))));
        let hs = Handshake::WebRepl {
            password: None,
            prompt_timeout: Duration::from_secs(1),
        };
        assert!(hs.check().is_ok());
    }

    #[test]
    fn info_display() {
        let mut info = LinkInfo::new("serial");
        info.address = Some("/dev/ttyACM0".into());
        info.vid = Some(0x2e8a);
        info.pid = Some(0x0005);
        assert_eq!(info.to_string(), "serial /dev/ttyACM0 [2e8a:0005]");
    }
}
