//! Bluetooth adapter capability: power state and device discovery

use crate::error::TransportError;
use crate::transport::traits::RadioAdapter;
use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, Session};
use futures::StreamExt;
use spp_link_shared::PeerAddress;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shown in place of a device name the radio could not resolve
pub const UNKNOWN_NAME: &str = "\u{2013}";

/// A device seen during discovery
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeer {
    /// Bluetooth MAC address
    pub address: PeerAddress,
    /// Advertised name, if the radio resolved one
    pub name: Option<String>,
    /// Whether the device is already bonded with this adapter
    pub paired: bool,
    /// Signal strength (if available)
    pub rssi: Option<i16>,
}

impl DiscoveredPeer {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_NAME)
    }
}

/// Open the BlueZ session and its default adapter, powered on
pub async fn open_default_adapter() -> Result<(Session, Adapter), TransportError> {
    let session = Session::new()
        .await
        .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;
    let adapter = session
        .default_adapter()
        .await
        .map_err(|e| TransportError::AdapterUnavailable(e.to_string()))?;

    if !adapter.is_powered().await? {
        info!("[BT] Powering on adapter {}", adapter.name());
        adapter.set_powered(true).await?;
    }
    Ok((session, adapter))
}

/// The BlueZ adapter as seen by the link
pub struct BluezRadio {
    adapter: Adapter,
    /// Running discovery scan, stopped by dropping its stream
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl BluezRadio {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            discovery: Mutex::new(None),
        }
    }

    /// Start scanning, reporting each new device on `found`.
    ///
    /// A scan already in progress is replaced.
    pub async fn start_discovery(
        &self,
        found: mpsc::Sender<DiscoveredPeer>,
    ) -> Result<(), TransportError> {
        self.ensure_ready().await?;

        let adapter = self.adapter.clone();
        let discover = adapter.discover_devices().await?;
        info!("[BT] Discovery started on {}", adapter.name());

        let task = tokio::spawn(async move {
            tokio::pin!(discover);
            while let Some(event) = discover.next().await {
                let AdapterEvent::DeviceAdded(addr) = event else {
                    continue;
                };
                let Ok(device) = adapter.device(addr) else {
                    continue;
                };

                let peer = DiscoveredPeer {
                    address: PeerAddress::from_bluetooth(addr.0),
                    name: device.name().await.ok().flatten(),
                    paired: device.is_paired().await.unwrap_or(false),
                    rssi: device.rssi().await.ok().flatten(),
                };
                debug!("[BT] Found {} ({})", peer.address, peer.display_name());

                if found.send(peer).await.is_err() {
                    break;
                }
            }
            debug!("[BT] Discovery stream ended");
        });

        if let Some(previous) = self.discovery.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }
}

#[async_trait]
impl RadioAdapter for BluezRadio {
    async fn ensure_ready(&self) -> Result<(), TransportError> {
        match self.adapter.is_powered().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportError::PoweredOff),
            Err(e) => Err(TransportError::AdapterUnavailable(e.to_string())),
        }
    }

    async fn cancel_discovery(&self) -> Result<(), TransportError> {
        if let Some(task) = self.discovery.lock().await.take() {
            task.abort();
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("[BT] Discovery task panicked: {}", e);
                }
            }
            info!("[BT] Discovery cancelled");
        }
        Ok(())
    }
}
