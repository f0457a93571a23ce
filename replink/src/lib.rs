//! Host client for the MicroPython raw REPL.
//!
//! `replink` talks to a MicroPython board over a byte [`Link`] (USB serial,
//! BLE, WebSocket/WebREPL or a WebRTC data channel), serialises
//! conversations through [`Transaction`]s on a [`Channel`] and drives the
//! raw REPL with [`RawRepl`]: execute code, transfer files and inspect the
//! device.
//!
//! # Quick start
//!
//! ```no_run
//! use replink::{Channel, Endpoint, RawRepl};
//!
//! # async fn demo() -> replink::Result<()> {
//! let endpoint: Endpoint = "serial:/dev/ttyACM0".parse()?;
//! let channel = Channel::new(endpoint.into_link()?);
//! channel.request_access().await?;
//! channel.connect().await?;
//!
//! let mut repl = RawRepl::begin(&channel, false).await?;
//! let out = repl.exec("print(1 + 1)").await?;
//! assert_eq!(out.trim(), "2");
//! repl.end().await?;
//! channel.disconnect().await
//! # }
//! ```

mod channel;
mod config;
mod error;
pub mod link;
mod raw;
mod transaction;

pub use channel::{Channel, Sink};
pub use config::{BleConfig, Endpoint, P2pConfig, SerialConfig, WsConfig};
pub use error::{Error, ExecError, Result};
pub use link::{ConnState, Handshake, Link, LinkInfo};
pub use raw::{RawOptions, RawRepl, RunOutcome, WriteOptions, run_script};
pub use replink_proto as proto;
pub use replink_proto::control::RebootMode;
pub use transaction::Transaction;
