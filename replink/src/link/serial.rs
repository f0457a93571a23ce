//! USB serial backend.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serialport::{SerialPort, SerialPortType};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Link, LinkInfo};
use crate::channel::Sink;
use crate::config::SerialConfig;
use crate::{Error, Result};

/// Read timeout of the pump, bounding how long a disconnect waits for it.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Lists serial ports, USB ones with their vendor and product ids.
pub fn available_ports() -> Result<Vec<LinkInfo>> {
    let ports = serialport::available_ports().map_err(|e| Error::AccessDenied(e.to_string()))?;
    Ok(ports
        .into_iter()
        .map(|port| {
            let mut info = LinkInfo::new("serial");
            if let SerialPortType::UsbPort(usb) = port.port_type {
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
                info.name = usb.product;
            }
            info.address = Some(port.port_name);
            info
        })
        .collect())
}

/// A board on a USB CDC or UART bridge port.
pub struct SerialLink {
    /// Requested settings.
    config: SerialConfig,
    /// Port chosen by `request_access`.
    info: Option<LinkInfo>,
    /// Write half.
    port: Option<Box<dyn SerialPort>>,
    /// Tells the pump to exit.
    stop: Arc<AtomicBool>,
    /// Blocking reader task.
    pump: Option<JoinHandle<()>>,
}

impl SerialLink {
    /// Creates an unopened link.
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            info: None,
            port: None,
            stop: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }

    /// Device path to open, resolving it first if needed.
    async fn path(&mut self) -> Result<String> {
        if self.info.is_none() {
            self.request_access().await?;
        }
        self.info
            .as_ref()
            .and_then(|i| i.address.clone())
            .ok_or_else(|| Error::AccessDenied("no serial port selected".into()))
    }
}

impl fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialLink")
            .field("config", &self.config)
            .field("info", &self.info)
            .field("open", &self.port.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Link for SerialLink {
    fn name(&self) -> &'static str {
        "serial"
    }

    async fn request_access(&mut self) -> Result<LinkInfo> {
        let info = match &self.config.path {
            Some(path) => {
                // Enumeration is informational when the path is given.
                let known = available_ports().unwrap_or_default();
                known
                    .into_iter()
                    .find(|p| p.address.as_deref() == Some(path.as_str()))
                    .unwrap_or_else(|| {
                        let mut info = LinkInfo::new("serial");
                        info.address = Some(path.clone());
                        info
                    })
            }
            None => available_ports()?
                .into_iter()
                .find(|p| p.vid.is_some())
                .ok_or_else(|| Error::AccessDenied("no USB serial port found".into()))?,
        };
        self.info = Some(info.clone());
        Ok(info)
    }

    async fn connect(&mut self, sink: Sink) -> Result<()> {
        let path = self.path().await?;
        let baud = self.config.baud;
        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(&path, baud).timeout(READ_TIMEOUT).open()
        })
        .await
        .map_err(Error::connect)?;
        let port = opened.map_err(Error::connect)?;
        let reader = port.try_clone().map_err(Error::connect)?;

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        self.pump = Some(tokio::task::spawn_blocking(move || pump(reader, &sink, &flag)));
        self.stop = stop;
        self.port = Some(port);
        debug!(baud, "serial port open");
        Ok(())
    }

    async fn send(&mut self, chunk: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::Closed)?;
        port.write_all(chunk)?;
        port.flush()?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        self.port = None;
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                warn!(error = %e, "serial pump panicked");
            }
        }
        Ok(())
    }

    fn max_chunk(&self) -> Option<usize> {
        Some(128)
    }

    fn pacing(&self) -> Duration {
        Duration::from_millis(2)
    }
}

/// Reads until stopped or the port fails.
fn pump(mut reader: Box<dyn SerialPort>, sink: &Sink, stop: &AtomicBool) {
    let mut buf = [0_u8; 1024];
    while !stop.load(Ordering::Acquire) {
        match reader.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => sink.deliver(&buf[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
            Err(e) => {
                warn!(error = %e, "serial read failed");
                break;
            }
        }
    }
    debug!("serial pump stopped");
    sink.closed();
}
