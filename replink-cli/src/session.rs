//! Connection flags and the open/close dance shared by every device command.

use std::time::Duration;

use anyhow::{Context, Result};
use replink::{Channel, Endpoint, RawOptions, RawRepl};
use replink_proto::ConnectionUid;
use tracing::{debug, info};

/// How to reach the board.
#[derive(clap::Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Endpoint: `serial[:path]`, `/dev/tty…`, `COM3`, `ble[:prefix]`,
    /// `ws://host:port`, `rtc` or `rtc://PEER-ID`.
    #[arg(short = 'c', long, global = true, default_value = "serial")]
    pub connect: String,

    /// WebREPL password.
    #[arg(long, global = true)]
    pub password: Option<String>,

    /// Serial line speed.
    #[arg(long, global = true)]
    pub baud: Option<u32>,

    /// WebSocket signaling server for `rtc` endpoints.
    #[arg(long, global = true)]
    pub signal: Option<String>,

    /// Own connection id when listening on `rtc`.
    #[arg(long, global = true)]
    pub peer_id: Option<ConnectionUid>,

    /// STUN/TURN server, repeatable. Replaces the default STUN server.
    #[arg(long, global = true)]
    pub ice: Vec<String>,

    /// Seconds of device silence tolerated per command.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
}

impl ConnectArgs {
    /// Parses `--connect` and applies the backend flags.
    pub fn endpoint(&self) -> Result<Endpoint> {
        let mut endpoint: Endpoint = self
            .connect
            .parse()
            .with_context(|| format!("bad --connect value {:?}", self.connect))?;
        match &mut endpoint {
            Endpoint::Serial(c) => {
                if let Some(baud) = self.baud {
                    c.baud = baud;
                }
            }
            Endpoint::Ws(c) => c.password.clone_from(&self.password),
            Endpoint::P2p(c) => {
                if let Some(signal) = &self.signal {
                    c.signal.clone_from(signal);
                }
                c.own_id.clone_from(&self.peer_id);
                if !self.ice.is_empty() {
                    c.ice_servers.clone_from(&self.ice);
                }
            }
            _ => {}
        }
        Ok(endpoint)
    }

    /// Engine timing with `--timeout` applied.
    pub fn options(&self) -> RawOptions {
        let mut options = RawOptions::default();
        if let Some(secs) = self.timeout {
            options.exec_timeout = Duration::from_secs(secs);
        }
        options
    }
}

/// An open channel plus the engine options chosen on the command line.
#[derive(Debug)]
pub struct Session {
    /// Connected channel.
    channel: Channel,
    /// Engine timing.
    options: RawOptions,
}

impl Session {
    /// Resolves, opens and logs into the endpoint.
    pub async fn open(args: &ConnectArgs) -> Result<Self> {
        let endpoint = args.endpoint()?;
        let listening = matches!(&endpoint, Endpoint::P2p(c) if c.peer.is_none());
        let channel = Channel::new(endpoint.into_link()?);

        let found = channel.request_access().await.context("no device")?;
        info!(device = %found, "device found");
        if listening {
            if let Some(id) = &found.peer_id {
                eprintln!("waiting for a peer, connection id {id}");
            }
        }
        channel
            .connect()
            .await
            .with_context(|| format!("cannot open {}", args.connect))?;
        Ok(Self {
            channel,
            options: args.options(),
        })
    }

    /// The underlying channel.
    pub const fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Engine timing.
    pub fn options(&self) -> RawOptions {
        self.options.clone()
    }

    /// Enters raw mode.
    pub async fn raw(&self) -> Result<RawRepl<'_>> {
        RawRepl::begin_with(&self.channel, false, self.options())
            .await
            .context("cannot enter raw REPL")
    }

    /// Disconnects. Errors are only logged so they never mask a command result.
    pub async fn close(self) {
        if let Err(e) = self.channel.disconnect().await {
            debug!(error = %e, "disconnect");
        }
    }
}

/// Leaves raw mode and combines the outcome of the command with that of the exit.
pub async fn finish<T>(repl: RawRepl<'_>, res: replink::Result<T>) -> Result<T> {
    let ended = repl.end().await;
    let out = res?;
    ended.context("cannot leave raw REPL")?;
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clap::Parser;
    use replink::P2pConfig;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        conn: ConnectArgs,
    }

    fn args(argv: &[&str]) -> ConnectArgs {
        let mut full = vec!["replink"];
        full.extend_from_slice(argv);
        Harness::parse_from(full).conn
    }

    #[test]
    fn serial_is_the_default() {
        let Endpoint::Serial(c) = args(&["--baud", "921600"]).endpoint().unwrap() else {
            panic!("not serial");
        };
        assert_eq!(c.path, None);
        assert_eq!(c.baud, 921_600);
    }

    #[test]
    fn password_reaches_webrepl() {
        let ep = args(&["-c", "192.168.4.1:8266", "--password", "hunter2"]).endpoint().unwrap();
        let Endpoint::Ws(c) = ep else {
            panic!("not ws");
        };
        assert_eq!(c.url, "ws://192.168.4.1:8266");
        assert_eq!(c.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn rtc_flags_are_applied() {
        let ep = args(&[
            "-c",
            "rtc",
            "--signal",
            "wss://signal.example",
            "--peer-id",
            "abcd-efgh-jkmn",
            "--ice",
            "stun:a",
            "--ice",
            "stun:b",
        ])
        .endpoint()
        .unwrap();
        let Endpoint::P2p(c) = ep else {
            panic!("not p2p");
        };
        assert_eq!(c.signal, "wss://signal.example");
        assert_eq!(c.own_id.unwrap().as_str(), "A8CD-FF6H-JKMN");
        assert_eq!(c.ice_servers, ["stun:a", "stun:b"]);
        assert_eq!(c.peer, None);
    }

    #[test]
    fn rtc_keeps_default_stun() {
        let Endpoint::P2p(c) = args(&["-c", "rtc://abcd-efgh-jkmn"]).endpoint().unwrap() else {
            panic!("not p2p");
        };
        assert_eq!(c.ice_servers, P2pConfig::default().ice_servers);
    }

    #[test]
    fn timeout_sets_exec_window() {
        assert_eq!(args(&["--timeout", "30"]).options().exec_timeout, Duration::from_secs(30));
        assert_eq!(args(&[]).options(), RawOptions::default());
    }

    #[test]
    fn bad_endpoint_is_reported() {
        let err = args(&["-c", "carrier-pigeon"]).endpoint().unwrap_err();
        assert!(format!("{err:#}").contains("carrier-pigeon"));
    }
}
