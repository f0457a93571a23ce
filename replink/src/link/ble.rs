//! Bluetooth LE UART backend (Nordic UART and Adafruit's variant).

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Link, LinkInfo};
use crate::channel::Sink;
use crate::config::BleConfig;
use crate::{Error, Result};

/// Nordic UART service.
const NUS_SERVICE: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);
/// Adafruit's UART service.
const ADA_NUS_SERVICE: Uuid = Uuid::from_u128(0xadaf_0001_4369_7263_7569_7450_7974_686e);
/// Adafruit file transfer service (16-bit 0xFEBB).
const ADA_FT_SERVICE: Uuid = Uuid::from_u128(0x0000_febb_0000_1000_8000_0080_5f9b_34fb);
/// File transfer protocol version, u32 little endian.
const ADA_VER: Uuid = Uuid::from_u128(0xadaf_0100_4669_6c65_5472_616e_7366_6572);
/// File transfer data characteristic.
const ADA_FT: Uuid = Uuid::from_u128(0xadaf_0200_4669_6c65_5472_616e_7366_6572);
/// File transfer version the firmware must report.
const ADA_FT_VERSION: u32 = 4;

/// Advertised name prefixes accepted without a matching service.
const NAME_PREFIXES: [&str; 2] = ["mpy-", "CIRCUITPY"];

/// One UART flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Profile {
    /// Primary service.
    service: Uuid,
    /// Host to device.
    tx: Uuid,
    /// Device to host, notified.
    rx: Uuid,
    /// Largest write.
    max_chunk: usize,
}

/// Nordic UART.
const NUS: Profile = Profile {
    service: NUS_SERVICE,
    tx: Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e),
    rx: Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e),
    max_chunk: 241,
};

/// Adafruit UART.
const ADA_NUS: Profile = Profile {
    service: ADA_NUS_SERVICE,
    tx: Uuid::from_u128(0xadaf_0002_4369_7263_7569_7450_7974_686e),
    rx: Uuid::from_u128(0xadaf_0003_4369_7263_7569_7450_7974_686e),
    max_chunk: 20,
};

/// Whether a scan result looks like a MicroPython or CircuitPython board.
fn is_candidate(name: Option<&str>, services: &[Uuid], prefix: Option<&str>) -> bool {
    if let Some(prefix) = prefix {
        return name.is_some_and(|n| n.starts_with(prefix));
    }
    services.iter().any(|s| [NUS_SERVICE, ADA_FT_SERVICE, ADA_NUS_SERVICE].contains(s))
        || name.is_some_and(|n| NAME_PREFIXES.iter().any(|p| n.starts_with(p)))
}

/// Picks the UART flavour from the discovered services, Nordic first.
fn select_profile(services: &BTreeSet<Uuid>) -> Option<Profile> {
    [NUS, ADA_NUS].into_iter().find(|p| services.contains(&p.service))
}

/// Decodes the file transfer version characteristic.
fn ft_version(raw: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = raw
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::ConnectFailed(format!("bad version value {raw:02x?}")))?;
    Ok(u32::from_le_bytes(bytes))
}

/// Maps a btleplug failure to [`Error::ConnectFailed`].
fn ble_err(e: btleplug::Error) -> Error {
    Error::ConnectFailed(e.to_string())
}

/// A board advertising a BLE UART service.
#[derive(Debug)]
pub struct BleLink {
    /// Scan settings.
    config: BleConfig,
    /// Adapter the device was found on.
    adapter: Option<Adapter>,
    /// Device chosen by `request_access`.
    peripheral: Option<Peripheral>,
    /// Write characteristic while connected.
    tx: Option<Characteristic>,
    /// Chunk limit of the matched profile.
    max_chunk: usize,
    /// Stops the pump.
    stop: Option<oneshot::Sender<()>>,
    /// Notification task.
    pump: Option<JoinHandle<()>>,
}

impl BleLink {
    /// Creates a link that scans on first use.
    pub const fn new(config: BleConfig) -> Self {
        Self {
            config,
            adapter: None,
            peripheral: None,
            tx: None,
            max_chunk: ADA_NUS.max_chunk,
            stop: None,
            pump: None,
        }
    }

    /// Finds the characteristic `uuid`.
    fn characteristic(chars: &BTreeSet<Characteristic>, uuid: Uuid) -> Result<Characteristic> {
        chars
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| Error::ConnectFailed(format!("characteristic {uuid} not found")))
    }

    /// Checks the Adafruit file transfer version and subscribes to its data.
    async fn adafruit_handshake(
        peripheral: &Peripheral,
        chars: &BTreeSet<Characteristic>,
    ) -> Result<()> {
        let ver = Self::characteristic(chars, ADA_VER)?;
        let version = ft_version(&peripheral.read(&ver).await.map_err(ble_err)?)?;
        if version != ADA_FT_VERSION {
            return Err(Error::ConnectFailed(format!(
                "unsupported file transfer version {version}"
            )));
        }
        let ft = Self::characteristic(chars, ADA_FT)?;
        peripheral.subscribe(&ft).await.map_err(ble_err)
    }

    /// Discovers services and wires up the UART characteristics.
    async fn open(&mut self, peripheral: &Peripheral, adapter: &Adapter, sink: Sink) -> Result<()> {
        peripheral.connect().await.map_err(ble_err)?;
        peripheral.discover_services().await.map_err(ble_err)?;
        let services: BTreeSet<Uuid> = peripheral.services().iter().map(|s| s.uuid).collect();
        let profile = select_profile(&services)
            .ok_or_else(|| Error::ConnectFailed("no compatible UART service found".into()))?;
        let chars = peripheral.characteristics();
        if profile == ADA_NUS {
            Self::adafruit_handshake(peripheral, &chars).await?;
        }

        let rx = Self::characteristic(&chars, profile.rx)?;
        let tx = Self::characteristic(&chars, profile.tx)?;
        let notifications = peripheral.notifications().await.map_err(ble_err)?;
        let events = adapter.events().await.map_err(ble_err)?;
        peripheral.subscribe(&rx).await.map_err(ble_err)?;

        let (stop, stopped) = oneshot::channel();
        let id = peripheral.id();
        self.pump = Some(tokio::spawn(async move {
            let mut notifications = notifications;
            let mut events = events;
            let mut stopped = stopped;
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    note = notifications.next() => match note {
                        Some(note) if note.uuid == profile.rx => sink.deliver(&note.value),
                        Some(_) => {}
                        None => break,
                    },
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => break,
                        Some(_) => {}
                        None => break,
                    },
                }
            }
            debug!("ble pump stopped");
            sink.closed();
        }));
        self.stop = Some(stop);
        self.tx = Some(tx);
        self.max_chunk = profile.max_chunk;
        debug!(service = %profile.service, max_chunk = profile.max_chunk, "ble uart ready");
        Ok(())
    }
}

#[async_trait]
impl Link for BleLink {
    fn name(&self) -> &'static str {
        "ble"
    }

    async fn request_access(&mut self) -> Result<LinkInfo> {
        let denied = |e: btleplug::Error| Error::AccessDenied(e.to_string());
        let manager = Manager::new().await.map_err(denied)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(denied)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::AccessDenied("no Bluetooth adapter".into()))?;

        adapter.start_scan(ScanFilter::default()).await.map_err(denied)?;
        tokio::time::sleep(self.config.scan_window).await;
        let peripherals = adapter.peripherals().await.map_err(denied);
        if let Err(e) = adapter.stop_scan().await {
            debug!(error = %e, "stop scan");
        }

        for peripheral in peripherals? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let name = props.local_name.as_deref();
            if !is_candidate(name, &props.services, self.config.name_prefix.as_deref()) {
                continue;
            }
            let mut info = LinkInfo::new("ble");
            info.name.clone_from(&props.local_name);
            info.address = Some(props.address.to_string());
            self.peripheral = Some(peripheral);
            self.adapter = Some(adapter);
            return Ok(info);
        }
        Err(Error::AccessDenied("no MicroPython BLE device found".into()))
    }

    async fn connect(&mut self, sink: Sink) -> Result<()> {
        if self.peripheral.is_none() {
            self.request_access().await?;
        }
        let (Some(peripheral), Some(adapter)) = (self.peripheral.clone(), self.adapter.clone())
        else {
            return Err(Error::InvalidState("no BLE device selected"));
        };
        let opened = self.open(&peripheral, &adapter, sink).await;
        if opened.is_err() {
            if let Err(e) = peripheral.disconnect().await {
                debug!(error = %e, "ble disconnect after failed connect");
            }
        }
        opened
    }

    async fn send(&mut self, chunk: &[u8]) -> Result<()> {
        let (Some(peripheral), Some(tx)) = (self.peripheral.as_ref(), self.tx.as_ref()) else {
            return Err(Error::Closed);
        };
        peripheral
            .write(tx, chunk, WriteType::WithResponse)
            .await
            .map_err(ble_err)
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(pump) = self.pump.take() {
            if let Err(e) = pump.await {
                warn!(error = %e, "ble pump panicked");
            }
        }
        if let (Some(peripheral), Some(_)) = (self.peripheral.as_ref(), self.tx.take()) {
            peripheral.disconnect().await.map_err(ble_err)?;
        }
        Ok(())
    }

    fn max_chunk(&self) -> Option<usize> {
        Some(self.max_chunk)
    }

    fn pacing(&self) -> Duration {
        Duration::from_millis(5)
    }
}
