//! Scripted in-memory transport for driving a `DeviceManager` in tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use motor_link_ble::ble::{
    event_channel, CharacteristicRef, EventSender, GattService, CCCD_UUID,
    COMMAND_CHARACTERISTIC_UUID, DEFAULT_COMPANY_ID, MOTOR_SERVICE_UUID,
    TELEMETRY_CHARACTERISTIC_UUID,
};
use motor_link_ble::{
    Advertisement, ConnectionState, DeviceManager, Error, GattLink, LinkConfig, Result,
    ScanRequest, Transport, TransportEvent,
};

/// A call made by the manager into the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan(ScanRequest),
    StopScan,
    Open(String),
    Connect(String),
    DiscoverServices(String),
    SetNotify(Uuid, bool),
    WriteDescriptor(Uuid, Uuid, Vec<u8>),
    Write(Uuid, Vec<u8>),
    Disconnect(String),
    Close(String),
}

type CallLog = Arc<Mutex<Vec<(Instant, Call)>>>;

/// Transport that records calls and never reports anything on its own.
#[derive(Default)]
pub struct FakeTransport {
    calls: CallLog,
    /// Refuse scans as if no adapter were present.
    pub unavailable: AtomicBool,
    /// Make link disconnect requests fail.
    pub fail_disconnect: AtomicBool,
}

impl FakeTransport {
    fn record(&self, call: Call) {
        self.calls.lock().push((Instant::now(), call));
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn start_scan(&self, request: &ScanRequest) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::BluetoothUnavailable);
        }
        self.record(Call::StartScan(request.clone()));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn open(&self, address: &str) -> Result<Arc<dyn GattLink>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::BluetoothUnavailable);
        }
        self.record(Call::Open(address.to_string()));
        Ok(Arc::new(FakeLink {
            address: address.to_string(),
            calls: self.calls.clone(),
            fail_disconnect: self.fail_disconnect.load(Ordering::SeqCst),
        }))
    }
}

#[derive(Debug)]
pub struct FakeLink {
    address: String,
    calls: CallLog,
    fail_disconnect: bool,
}

impl FakeLink {
    fn record(&self, call: Call) {
        self.calls.lock().push((Instant::now(), call));
    }
}

#[async_trait]
impl GattLink for FakeLink {
    fn address(&self) -> &str {
        &self.address
    }

    fn name(&self) -> Option<String> {
        None
    }

    async fn connect(&self) -> Result<()> {
        self.record(Call::Connect(self.address.clone()));
        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        self.record(Call::DiscoverServices(self.address.clone()));
        Ok(())
    }

    async fn set_notify(&self, characteristic: &CharacteristicRef, enabled: bool) -> Result<()> {
        self.record(Call::SetNotify(characteristic.uuid, enabled));
        Ok(())
    }

    async fn write_descriptor(
        &self,
        characteristic: &CharacteristicRef,
        descriptor: &Uuid,
        value: &[u8],
    ) -> Result<()> {
        self.record(Call::WriteDescriptor(
            characteristic.uuid,
            *descriptor,
            value.to_vec(),
        ));
        Ok(())
    }

    async fn write(&self, characteristic: &CharacteristicRef, payload: &[u8]) -> Result<()> {
        self.record(Call::Write(characteristic.uuid, payload.to_vec()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(Call::Disconnect(self.address.clone()));
        if self.fail_disconnect {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    async fn close(&self) {
        self.record(Call::Close(self.address.clone()));
    }
}

/// A manager wired to a [`FakeTransport`].
pub struct Harness {
    pub manager: DeviceManager,
    pub transport: Arc<FakeTransport>,
    events: EventSender,
}

impl Harness {
    pub fn new(config: LinkConfig) -> Self {
        Self::with_transport(FakeTransport::default(), config)
    }

    pub fn with_transport(transport: FakeTransport, config: LinkConfig) -> Self {
        init_tracing();

        let transport = Arc::new(transport);
        let (events, rx) = event_channel();
        let manager = DeviceManager::new(transport.clone(), rx, config).unwrap();

        Self {
            manager,
            transport,
            events,
        }
    }

    /// Deliver a transport event to the manager.
    pub fn emit(&self, event: TransportEvent) {
        self.events.send(event).unwrap();
    }

    /// Deliver an advertisement carrying the motor service.
    pub fn advertise(&self, address: &str, rssi: i16, device_id: Option<[u8; 6]>) {
        self.emit(TransportEvent::Advertisement(advertisement(
            address, rssi, device_id,
        )));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.transport
            .calls
            .lock()
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.transport.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.transport.calls.lock().clear();
    }

    /// Payloads written to the command characteristic, in order.
    pub fn command_writes(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Write(uuid, payload) if uuid == COMMAND_CHARACTERISTIC_UUID => Some(payload),
                _ => None,
            })
            .collect()
    }

    /// Scan, connect to `address` and walk the link to `Ready`.
    pub async fn connect_ready(&self, address: &str, device_id: Option<[u8; 6]>) {
        self.manager.start_scan().await.unwrap();
        self.advertise(address, -60, device_id);
        settle().await;

        self.manager.connect(address).await.unwrap();
        self.emit(TransportEvent::Connected {
            address: address.to_string(),
        });
        settle().await;

        self.emit(TransportEvent::ServicesDiscovered {
            address: address.to_string(),
            services: motor_services(true),
        });
        settle().await;

        assert_eq!(self.manager.connection_state(), ConnectionState::Ready);
    }
}

pub fn advertisement(address: &str, rssi: i16, device_id: Option<[u8; 6]>) -> Advertisement {
    Advertisement {
        address: address.to_string(),
        name: Some("MotorCtl".to_string()),
        rssi,
        connectable: true,
        manufacturer_data: device_id
            .map(|id| HashMap::from([(DEFAULT_COMPANY_ID, id.to_vec())]))
            .unwrap_or_default(),
        services: vec![MOTOR_SERVICE_UUID],
    }
}

/// The motor service, optionally without its telemetry characteristic.
pub fn motor_services(with_telemetry: bool) -> Vec<GattService> {
    let mut characteristics = vec![CharacteristicRef {
        service_uuid: MOTOR_SERVICE_UUID,
        uuid: COMMAND_CHARACTERISTIC_UUID,
        descriptors: Vec::new(),
    }];

    if with_telemetry {
        characteristics.push(CharacteristicRef {
            service_uuid: MOTOR_SERVICE_UUID,
            uuid: TELEMETRY_CHARACTERISTIC_UUID,
            descriptors: vec![CCCD_UUID],
        });
    }

    vec![GattService {
        uuid: MOTOR_SERVICE_UUID,
        characteristics,
    }]
}

/// Let the driver task and workers drain under paused time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
