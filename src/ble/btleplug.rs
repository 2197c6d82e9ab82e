//! Radio transport backed by btleplug.
//!
//! btleplug exposes awaitable operations; they are run on spawned tasks and
//! their outcomes reported as [`TransportEvent`]s so the core sees the same
//! event-driven contract on every platform.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::{Advertisement, ScanRequest};
use crate::ble::transport::{
    CharacteristicRef, EventSender, GattLink, GattService, Transport, TransportEvent,
};
use crate::ble::uuids::CCCD_UUID;
use crate::error::{Error, Result};

impl From<&Characteristic> for CharacteristicRef {
    fn from(characteristic: &Characteristic) -> Self {
        Self {
            service_uuid: characteristic.service_uuid,
            uuid: characteristic.uuid,
            descriptors: characteristic.descriptors.iter().map(|d| d.uuid).collect(),
        }
    }
}

/// Peripherals seen during the current scan, by address.
///
/// Reset whenever a scan starts so entries for units that went away do not
/// accumulate. `open` falls back to the adapter for anything not cached.
#[derive(Debug)]
struct PeripheralCache<P> {
    entries: RwLock<HashMap<String, P>>,
}

impl<P: Clone> PeripheralCache<P> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn remember(&self, address: String, peripheral: P) {
        self.entries.write().insert(address, peripheral);
    }

    fn get(&self, address: &str) -> Option<P> {
        self.entries.read().get(address).cloned()
    }

    /// Forget every entry. Returns how many were dropped.
    fn reset(&self) -> usize {
        let mut entries = self.entries.write();
        let n = entries.len();
        entries.clear();
        n
    }
}

/// Transport over the first available Bluetooth adapter.
pub struct BtleplugTransport {
    adapter: Adapter,
    events: EventSender,
    peripherals: Arc<PeripheralCache<Peripheral>>,
    /// Whether advertisements are currently reported.
    scanning: Arc<AtomicBool>,
    /// Adapter event pump.
    pump: JoinHandle<()>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter and start pumping its events.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(events: EventSender) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        let mut stream = adapter.events().await.map_err(Error::Bluetooth)?;

        let peripherals = Arc::new(PeripheralCache::new());
        let scanning = Arc::new(AtomicBool::new(false));

        let pump = {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();
            let scanning = scanning.clone();
            let events = events.clone();

            tokio::spawn(async move {
                while let Some(event) = stream.next().await {
                    Self::handle_event(event, &adapter, &peripherals, &scanning, &events).await;
                }
                debug!("Adapter event stream ended");
            })
        };

        Ok(Self {
            adapter,
            events,
            peripherals,
            scanning,
            pump,
        })
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Handle a BLE central event.
    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        peripherals: &PeripheralCache<Peripheral>,
        scanning: &AtomicBool,
        events: &EventSender,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. }
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                if scanning.load(Ordering::SeqCst) {
                    Self::report_advertisement(adapter, id, peripherals, events).await;
                }
            }
            CentralEvent::DeviceConnected(id) => {
                // Reported by the link once its connect call returns
                trace!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                let _ = events.send(TransportEvent::Disconnected {
                    address: id.to_string(),
                });
            }
            _ => {}
        }
    }

    /// Read a peripheral's advertised properties and report them.
    async fn report_advertisement(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &PeripheralCache<Peripheral>,
        events: &EventSender,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let address = id.to_string();
        let advertisement = Advertisement {
            address: address.clone(),
            name: properties.local_name,
            rssi: properties.rssi.unwrap_or(i16::MIN),
            // Not reported by btleplug
            connectable: true,
            manufacturer_data: properties.manufacturer_data,
            services: properties.services,
        };

        peripherals.remember(address, peripheral);
        let _ = events.send(TransportEvent::Advertisement(advertisement));
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn start_scan(&self, request: &ScanRequest) -> Result<()> {
        debug!(
            "Starting BLE scan (services: {:?}, mode: {:?})",
            request.services, request.mode
        );

        let filter = ScanFilter {
            services: request.services.clone(),
        };

        let forgotten = self.peripherals.reset();
        if forgotten > 0 {
            trace!("Forgot {} peripherals from the previous scan", forgotten);
        }

        if let Err(e) = self.adapter.start_scan(filter).await {
            error!("Failed to start scan: {}", e);
            let _ = self.events.send(TransportEvent::ScanFailed {
                reason: e.to_string(),
            });
            return Err(Error::Bluetooth(e));
        }

        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        debug!("Stopping BLE scan");
        self.scanning.store(false, Ordering::SeqCst);
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn open(&self, address: &str) -> Result<Arc<dyn GattLink>> {
        let cached = self.peripherals.get(address);

        let peripheral = match cached {
            Some(p) => p,
            None => self
                .adapter
                .peripherals()
                .await
                .map_err(Error::Bluetooth)?
                .into_iter()
                .find(|p| p.id().to_string() == address)
                .ok_or_else(|| Error::DeviceNotFound {
                    address: address.to_string(),
                })?,
        };

        let name = match peripheral.properties().await {
            Ok(Some(p)) => p.local_name,
            _ => None,
        };

        Ok(Arc::new(BtleplugLink::new(
            address.to_string(),
            name,
            peripheral,
            self.events.clone(),
        )))
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Event sender that goes quiet once its link is closed.
#[derive(Debug, Clone)]
struct LinkEvents {
    tx: EventSender,
    closed: Arc<AtomicBool>,
}

impl LinkEvents {
    fn send(&self, event: TransportEvent) {
        if self.closed.load(Ordering::SeqCst) {
            trace!("Link closed, dropping {:?}", event);
            return;
        }
        let _ = self.tx.send(event);
    }
}

/// One peripheral link over btleplug.
#[derive(Debug)]
pub struct BtleplugLink {
    address: String,
    name: Option<String>,
    peripheral: Peripheral,
    events: LinkEvents,
    /// Notification listener task.
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugLink {
    fn new(address: String, name: Option<String>, peripheral: Peripheral, tx: EventSender) -> Self {
        Self {
            address,
            name,
            peripheral,
            events: LinkEvents {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            listener: Mutex::new(None),
        }
    }

    fn characteristic(&self, reference: &CharacteristicRef) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == reference.uuid && c.service_uuid == reference.service_uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: reference.uuid.to_string(),
            })
    }

    fn services(peripheral: &Peripheral) -> Vec<GattService> {
        peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .iter()
                    .map(CharacteristicRef::from)
                    .collect(),
            })
            .collect()
    }

    fn start_listener(&self) {
        let mut listener = self.listener.lock();
        if listener.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        let address = self.address.clone();

        *listener = Some(tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification from {}: {:02X?}",
                    notification.uuid,
                    notification.value
                );
                events.send(TransportEvent::Notification {
                    address: address.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }

            debug!("Notification listener stopped");
        }));
    }

    fn stop_listener(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    fn address(&self) -> &str {
        &self.address
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn connect(&self) -> Result<()> {
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        let address = self.address.clone();

        tokio::spawn(async move {
            match peripheral.connect().await {
                Ok(()) => events.send(TransportEvent::Connected { address }),
                Err(e) => {
                    warn!("Connection to {} failed: {}", address, e);
                    events.send(TransportEvent::Disconnected { address });
                }
            }
        });

        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        let address = self.address.clone();

        tokio::spawn(async move {
            match peripheral.discover_services().await {
                Ok(()) => {
                    let services = Self::services(&peripheral);
                    debug!("Discovered {} services on {}", services.len(), address);
                    events.send(TransportEvent::ServicesDiscovered { address, services });
                }
                Err(e) => events.send(TransportEvent::DiscoveryFailed {
                    address,
                    reason: e.to_string(),
                }),
            }
        });

        Ok(())
    }

    async fn set_notify(&self, characteristic: &CharacteristicRef, enabled: bool) -> Result<()> {
        let target = self.characteristic(characteristic)?;

        if enabled {
            self.peripheral
                .subscribe(&target)
                .await
                .map_err(Error::Bluetooth)?;
            self.start_listener();
            debug!("Subscribed to notifications from {}", target.uuid);
        } else {
            self.peripheral
                .unsubscribe(&target)
                .await
                .map_err(Error::Bluetooth)?;
            debug!("Unsubscribed from notifications from {}", target.uuid);
        }

        Ok(())
    }

    async fn write_descriptor(
        &self,
        characteristic: &CharacteristicRef,
        descriptor: &Uuid,
        value: &[u8],
    ) -> Result<()> {
        // subscribe() already configures the CCCD
        if *descriptor == CCCD_UUID {
            trace!("CCCD of {} configured by subscribe", characteristic.uuid);
            return Ok(());
        }

        let target = self
            .characteristic(characteristic)?
            .descriptors
            .into_iter()
            .find(|d| d.uuid == *descriptor)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: descriptor.to_string(),
            })?;

        self.peripheral
            .write_descriptor(&target, value)
            .await
            .map_err(Error::Bluetooth)
    }

    async fn write(&self, characteristic: &CharacteristicRef, payload: &[u8]) -> Result<()> {
        let target = self.characteristic(characteristic)?;
        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        let address = self.address.clone();
        let payload = payload.to_vec();

        tokio::spawn(async move {
            match peripheral
                .write(&target, &payload, WriteType::WithResponse)
                .await
            {
                Ok(()) => {
                    trace!("Wrote {} bytes to {}", payload.len(), target.uuid);
                    events.send(TransportEvent::WriteComplete {
                        address,
                        characteristic: target.uuid,
                    });
                }
                Err(e) => warn!("Write to {} failed: {}", target.uuid, e),
            }
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_listener();
        self.peripheral.disconnect().await.map_err(Error::Bluetooth)?;
        self.events.send(TransportEvent::Disconnected {
            address: self.address.clone(),
        });
        Ok(())
    }

    async fn close(&self) {
        self.events.closed.store(true, Ordering::SeqCst);
        self.stop_listener();

        if self.peripheral.is_connected().await.unwrap_or(false) {
            if let Err(e) = self.peripheral.disconnect().await {
                debug!("Disconnect on close failed: {}", e);
            }
        }
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.stop_listener();
    }
}
