//! Backend configuration and endpoint strings.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use replink_proto::ConnectionUid;
use serde::{Deserialize, Serialize};

use crate::link::Link;
use crate::{Error, Result};

/// USB serial port settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct SerialConfig {
    /// OS device path. `None` picks the first USB serial port.
    pub path: Option<String>,
    /// Line speed.
    pub baud: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: None,
            baud: 115_200,
        }
    }
}

/// Bluetooth LE scan settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct BleConfig {
    /// Only accept devices whose advertised name starts with this.
    pub name_prefix: Option<String>,
    /// How long to scan before picking a device.
    pub scan_window: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            name_prefix: None,
            scan_window: Duration::from_secs(5),
        }
    }
}

/// WebSocket / WebREPL settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct WsConfig {
    /// `ws://` or `wss://` URL.
    pub url: String,
    /// WebREPL password.
    pub password: Option<String>,
    /// How long to wait for the password prompt before assuming open access.
    pub prompt_timeout: Duration,
    /// Interval between keep-alive frames.
    pub heartbeat: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            password: None,
            prompt_timeout: Duration::from_secs(1),
            heartbeat: Duration::from_secs(55),
        }
    }
}

/// Public STUN server used when none is configured.
pub const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

/// WebRTC data channel settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct P2pConfig {
    /// Base URL of the WebSocket signaling server.
    pub signal: String,
    /// Peer to dial. `None` listens for an incoming offer.
    pub peer: Option<ConnectionUid>,
    /// Own id announced when listening. Generated when `None`.
    pub own_id: Option<ConnectionUid>,
    /// STUN/TURN server URLs.
    pub ice_servers: Vec<String>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            signal: String::new(),
            peer: None,
            own_id: None,
            ice_servers: vec![DEFAULT_STUN.to_owned()],
        }
    }
}

/// Where to connect, parsed from strings like `serial:/dev/ttyACM0`,
/// `ws://192.168.4.1:8266` or `rtc://ABCD-EFGH-JKMN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "link", rename_all = "lowercase")]
#[non_exhaustive]
pub enum Endpoint {
    /// USB serial.
    Serial(SerialConfig),
    /// Bluetooth LE UART.
    Ble(BleConfig),
    /// WebSocket / WebREPL.
    Ws(WsConfig),
    /// WebRTC data channel.
    P2p(P2pConfig),
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::Serial(SerialConfig::default())
    }
}

impl Endpoint {
    /// Backend name.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Serial(_) => "serial",
            Self::Ble(_) => "ble",
            Self::Ws(_) => "ws",
            Self::P2p(_) => "p2p",
        }
    }

    /// Builds the backend. Fails with [`Error::AccessDenied`] when its
    /// feature is not compiled in.
    pub fn into_link(self) -> Result<Box<dyn Link>> {
        match self {
            #[cfg(feature = "serial")]
            Self::Serial(config) => Ok(Box::new(crate::link::SerialLink::new(config))),
            #[cfg(feature = "ble")]
            Self::Ble(config) => Ok(Box::new(crate::link::BleLink::new(config))),
            #[cfg(feature = "ws")]
            Self::Ws(config) => Ok(Box::new(crate::link::WsLink::new(config))),
            #[cfg(feature = "p2p")]
            Self::P2p(config) => Ok(Box::new(crate::link::P2pLink::new(config))),
            #[allow(unreachable_patterns)]
            other => Err(Error::AccessDenied(format!(
                "{} support is not compiled in",
                other.kind()
            ))),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let ws = |url: String| {
            Self::Ws(WsConfig {
                url,
                ..WsConfig::default()
            })
        };

        if s.starts_with("ws://") || s.starts_with("wss://") {
            return Ok(ws(s.to_owned()));
        }
        if let Some(rest) = s.strip_prefix("http://") {
            return Ok(ws(format!("ws://{rest}")));
        }
        if let Some(rest) = s.strip_prefix("https://") {
            return Ok(ws(format!("wss://{rest}")));
        }
        if let Some(rest) = s.strip_prefix("rtc").filter(|r| r.is_empty() || r.starts_with("://")) {
            let id = rest.trim_start_matches("://");
            let peer = if id.is_empty() {
                None
            } else {
                Some(ConnectionUid::parse(id).map_err(|e| Error::AccessDenied(e.to_string()))?)
            };
            return Ok(Self::P2p(P2pConfig {
                peer,
                ..P2pConfig::default()
            }));
        }
        if s == "ble" || s.starts_with("ble:") {
            let prefix = s.strip_prefix("ble:").filter(|p| !p.is_empty());
            return Ok(Self::Ble(BleConfig {
                name_prefix: prefix.map(str::to_owned),
                ..BleConfig::default()
            }));
        }
        if s == "serial" || s.starts_with("serial:") {
            let path = s.strip_prefix("serial:").filter(|p| !p.is_empty());
            return Ok(serial(path.map(str::to_owned)));
        }
        if s.starts_with("/dev/") || s.starts_with("COM") {
            return Ok(serial(Some(s.to_owned())));
        }
        if s.starts_with("tty") {
            return Ok(serial(Some(format!("/dev/{s}"))));
        }
        if !s.is_empty() && (s.contains('.') || s.contains(':')) && !s.contains("://") {
            return Ok(ws(format!("ws://{s}")));
        }
        Err(Error::AccessDenied(format!("unrecognised endpoint: {s:?}")))
    }
}

/// Serial endpoint for `path`.
fn serial(path: Option<String>) -> Endpoint {
    Endpoint::Serial(SerialConfig {
        path,
        ..SerialConfig::default()
    })
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(c) => match &c.path {
                Some(path) => write!(f, "serial:{path}"),
                None => f.write_str("serial"),
            },
            Self::Ble(c) => match &c.name_prefix {
                Some(prefix) => write!(f, "ble:{prefix}"),
                None => f.write_str("ble"),
            },
            Self::Ws(c) => f.write_str(&c.url),
            Self::P2p(c) => match &c.peer {
                Some(peer) => write!(f, "rtc://{peer}"),
                None => f.write_str("rtc"),
            },
        }
    }
}
