//! Device manager for discovering, connecting to and commanding a motor controller.
//!
//! The manager owns the discovery registry, the command queue, the single
//! connection session and the reconnect task. Transport events are handled one
//! at a time by a driver task, and every public operation takes the same async
//! lock, so state changes never interleave.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::advertising::{Advertisement, DeviceId, ScanRequest};
use crate::ble::btleplug::BtleplugTransport;
use crate::ble::connection::{
    ConnectionEvent, ConnectionState, ConnectionSummary, MotorCharacteristics, Session,
};
use crate::ble::queue::{CommandQueue, LinkSlot};
use crate::ble::reconnect::{poll_for_match, ReconnectEvent, ReconnectPlan};
use crate::ble::registry::{DiscoveryRegistry, Sighting};
use crate::ble::transport::{event_channel, EventReceiver, GattService, Transport, TransportEvent};
use crate::ble::uuids::*;
use crate::config::LinkConfig;
use crate::error::{Error, Result};
use crate::protocol::{Command, TelemetryFrame};
use crate::subscription::{spawn_callback, CallbackHandle};

/// Capacity of each event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Which scan, if any, the radio is running.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum ScanState {
    #[default]
    Stopped,
    /// User-requested discovery scan.
    Normal(ScanRequest),
    /// Scan for a lost unit.
    Reconnect(ScanRequest),
}

impl ScanState {
    fn request(&self) -> Option<&ScanRequest> {
        match self {
            Self::Stopped => None,
            Self::Normal(request) | Self::Reconnect(request) => Some(request),
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: RwLock<LinkConfig>,
    registry: DiscoveryRegistry,
    link: LinkSlot,
    queue: CommandQueue,
    session: Mutex<Session>,
    scan: Mutex<ScanState>,
    /// Serializes operations and event handling.
    ops: tokio::sync::Mutex<()>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    summary: RwLock<ConnectionSummary>,
    latest_telemetry: RwLock<Option<TelemetryFrame>>,
    sighted_tx: broadcast::Sender<Sighting>,
    removed_tx: broadcast::Sender<Sighting>,
    summary_tx: broadcast::Sender<ConnectionSummary>,
    state_tx: broadcast::Sender<ConnectionEvent>,
    telemetry_tx: broadcast::Sender<TelemetryFrame>,
    reconnect_tx: broadcast::Sender<ReconnectEvent>,
}

/// Central manager for one motor controller link.
pub struct DeviceManager {
    inner: Arc<Inner>,
    /// Transport event driver task.
    driver: Mutex<Option<JoinHandle<()>>>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl DeviceManager {
    /// Create a manager over `transport`, consuming its events from `events`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: EventReceiver,
        config: LinkConfig,
    ) -> Result<Self> {
        config.validate()?;

        let link: LinkSlot = Arc::new(RwLock::new(None));
        let queue = CommandQueue::new(link.clone(), config.ack_timeout);
        queue.start();

        let inner = Arc::new(Inner {
            transport,
            config: RwLock::new(config),
            registry: DiscoveryRegistry::new(),
            link,
            queue,
            session: Mutex::new(Session::default()),
            scan: Mutex::new(ScanState::Stopped),
            ops: tokio::sync::Mutex::new(()),
            cleanup_task: Mutex::new(None),
            reconnect_task: Mutex::new(None),
            summary: RwLock::new(ConnectionSummary::default()),
            latest_telemetry: RwLock::new(None),
            sighted_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            removed_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            summary_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            state_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            telemetry_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            reconnect_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        });

        let driver = tokio::spawn(inner.clone().drive(events));

        Ok(Self {
            inner,
            driver: Mutex::new(Some(driver)),
            callback_counter: AtomicU64::new(0),
        })
    }

    /// Create a manager over the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available or `config` is invalid.
    pub async fn btleplug(config: LinkConfig) -> Result<Self> {
        let (tx, rx) = event_channel();
        let transport = BtleplugTransport::new(tx).await?;
        Self::new(Arc::new(transport), rx, config)
    }

    // === Scanning ===

    /// Start a discovery scan.
    ///
    /// Does nothing if a discovery scan is already running. A reconnect in
    /// progress is cancelled first. The registry is cleared and the stale
    /// sighting cleanup starts.
    pub async fn start_scan(&self) -> Result<()> {
        let _op = self.inner.ops.lock().await;
        self.inner.start_scan().await
    }

    /// Stop scanning, the stale sighting cleanup and any reconnect attempt.
    pub async fn stop_scan(&self) -> Result<()> {
        let _op = self.inner.ops.lock().await;
        self.inner.cancel_reconnect();
        self.inner.stop_transport_scan().await
    }

    /// Check if any scan is running.
    pub fn is_scanning(&self) -> bool {
        *self.inner.scan.lock() != ScanState::Stopped
    }

    /// Check if a reconnect attempt is in progress.
    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnect_task.lock().is_some()
    }

    // === Discovered devices ===

    /// All visible devices, ordered by first sighting.
    pub fn devices(&self) -> Vec<Sighting> {
        self.inner.registry.snapshot()
    }

    /// Get a visible device by address.
    pub fn device(&self, address: &str) -> Option<Sighting> {
        self.inner.registry.get(address)
    }

    /// Get the visible device with the strongest signal.
    pub fn strongest(&self) -> Option<Sighting> {
        self.inner.registry.strongest()
    }

    // === Connection ===

    /// Connect to a visible device by address.
    ///
    /// Cancels scanning and any reconnect attempt and closes the previous
    /// link. Progress is reported through connection state events.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let _op = self.inner.ops.lock().await;

        let sighting =
            self.inner
                .registry
                .get(address)
                .ok_or_else(|| Error::DeviceNotFound {
                    address: address.to_string(),
                })?;

        self.inner.connect(sighting).await
    }

    /// Connect to a sighting, whether or not it is still in the registry.
    pub async fn connect_to(&self, sighting: Sighting) -> Result<()> {
        let _op = self.inner.ops.lock().await;
        self.inner.connect(sighting).await
    }

    /// Disconnect from the peripheral.
    ///
    /// No reconnect follows. The disconnected summary is published right
    /// away, without waiting for the radio.
    pub async fn disconnect(&self) -> Result<()> {
        let _op = self.inner.ops.lock().await;
        self.inner.disconnect().await
    }

    /// Get the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.session.lock().state
    }

    /// Get the latest connection summary.
    pub fn connection_summary(&self) -> ConnectionSummary {
        self.inner.summary.read().clone()
    }

    /// Check if commands can be sent.
    pub fn is_ready(&self) -> bool {
        self.connection_state().is_ready()
    }

    // === Commands ===

    /// Queue a command for the peripheral. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the link is ready.
    pub fn send_command(&self, command: Command) -> Result<()> {
        let characteristic = {
            let session = self.inner.session.lock();
            match (&session.characteristics, session.state) {
                (Some(c), ConnectionState::Ready) => c.command.clone(),
                _ => return Err(Error::NotConnected),
            }
        };

        debug!("Sending {} ({})", command.opcode(), command.value());
        self.inner
            .queue
            .enqueue_write(characteristic, command.encode());
        Ok(())
    }

    /// Stop the motor.
    pub fn shutdown(&self) -> Result<()> {
        self.send_command(Command::shutdown())
    }

    /// Run the calibration routine.
    pub fn calibrate(&self) -> Result<()> {
        self.send_command(Command::calibrate())
    }

    /// Run at `rpm`.
    pub fn set_speed(&self, rpm: i32) -> Result<()> {
        self.send_command(Command::set_speed(rpm))
    }

    /// Move to `degrees`.
    pub fn set_position(&self, degrees: i32) -> Result<()> {
        self.send_command(Command::set_position(degrees))
    }

    /// Number of commands waiting for dispatch.
    pub fn pending_commands(&self) -> usize {
        self.inner.queue.len()
    }

    // === Telemetry ===

    /// Get the most recent telemetry frame of the session.
    pub fn latest_telemetry(&self) -> Option<TelemetryFrame> {
        *self.inner.latest_telemetry.read()
    }

    // === Configuration ===

    /// Replace the configuration.
    ///
    /// Running cleanup and reconnect tasks keep the values they started with.
    /// The acknowledgment timeout is fixed at construction.
    pub fn apply_config(&self, config: LinkConfig) -> Result<()> {
        config.validate()?;
        info!("Applying link configuration");
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Get a copy of the configuration.
    pub fn config(&self) -> LinkConfig {
        self.inner.config.read().clone()
    }

    /// Identifier of the last connected unit, for the settings store to persist.
    pub fn last_device_id(&self) -> Option<DeviceId> {
        self.inner.config.read().last_device_id
    }

    // === Events ===

    /// Subscribe to device sightings.
    pub fn subscribe_sightings(&self) -> broadcast::Receiver<Sighting> {
        self.inner.sighted_tx.subscribe()
    }

    /// Register a callback for device sightings.
    pub fn on_device_sighted<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&Sighting) + Send + Sync + 'static,
    {
        spawn_callback(self.next_callback_id(), self.subscribe_sightings(), callback)
    }

    /// Subscribe to stale device removals.
    pub fn subscribe_removals(&self) -> broadcast::Receiver<Sighting> {
        self.inner.removed_tx.subscribe()
    }

    /// Register a callback for stale device removals.
    pub fn on_device_removed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&Sighting) + Send + Sync + 'static,
    {
        spawn_callback(self.next_callback_id(), self.subscribe_removals(), callback)
    }

    /// Subscribe to connection summary changes.
    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionSummary> {
        self.inner.summary_tx.subscribe()
    }

    /// Register a callback for connection summary changes.
    pub fn on_connection_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&ConnectionSummary) + Send + Sync + 'static,
    {
        spawn_callback(self.next_callback_id(), self.subscribe_connection(), callback)
    }

    /// Subscribe to connection state transitions.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to telemetry frames.
    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetryFrame> {
        self.inner.telemetry_tx.subscribe()
    }

    /// Register a callback for telemetry frames.
    pub fn on_telemetry<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&TelemetryFrame) + Send + Sync + 'static,
    {
        spawn_callback(self.next_callback_id(), self.subscribe_telemetry(), callback)
    }

    /// Subscribe to reconnect progress.
    pub fn subscribe_reconnect(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.inner.reconnect_tx.subscribe()
    }

    /// Register a callback for reconnect attempts that found nothing.
    pub fn on_reconnect_timeout<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&DeviceId) + Send + Sync + 'static,
    {
        spawn_callback(
            self.next_callback_id(),
            self.subscribe_reconnect(),
            move |event| {
                if let ReconnectEvent::TimedOut { device_id } = event {
                    callback(device_id);
                }
            },
        )
    }

    fn next_callback_id(&self) -> u64 {
        self.callback_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Clean shutdown of scanning, reconnecting and the link.
    pub async fn shutdown_manager(&self) -> Result<()> {
        info!("Shutting down device manager");

        let _op = self.inner.ops.lock().await;
        self.inner.cancel_reconnect();
        if let Err(e) = self.inner.stop_transport_scan().await {
            warn!("Error stopping scan: {}", e);
        }

        let link = self.inner.link.read().clone();
        if let Some(link) = link {
            self.inner.session.lock().user_disconnect = true;
            if let Err(e) = link.disconnect().await {
                warn!("Error disconnecting from {}: {}", link.address(), e);
            }
        }

        self.inner.close_link().await;
        self.inner.set_state(ConnectionState::Idle);
        self.inner.queue.stop();

        Ok(())
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if let Some(handle) = self.driver.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.cleanup_task.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.reconnect_task.lock().take() {
            handle.abort();
        }
        self.inner.queue.stop();
    }
}

impl Inner {
    /// Handle transport events until the channel closes.
    async fn drive(self: Arc<Self>, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            let _op = self.ops.lock().await;
            self.handle_event(event).await;
        }
        debug!("Transport event channel closed");
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Advertisement(advertisement) => self.on_advertisement(advertisement),
            TransportEvent::ScanFailed { reason } => error!("Scan failed: {}", reason),
            TransportEvent::Connected { address } => self.on_connected(&address).await,
            TransportEvent::Disconnected { address } => self.on_disconnected(&address).await,
            TransportEvent::ServicesDiscovered { address, services } => {
                self.on_services_discovered(&address, &services).await
            }
            TransportEvent::DiscoveryFailed { address, reason } => {
                if self.session.lock().is_for(&address) {
                    warn!("Service discovery on {} failed: {}", address, reason);
                }
            }
            TransportEvent::Notification {
                address,
                characteristic,
                value,
            } => self.on_notification(&address, &characteristic, &value),
            TransportEvent::WriteComplete { address, .. } => {
                if self.session.lock().is_for(&address) {
                    self.queue.on_write_complete();
                }
            }
        }
    }

    // === State ===

    fn set_state(&self, state: ConnectionState) {
        let event = {
            let mut session = self.session.lock();
            if session.state == state {
                return;
            }
            let previous = std::mem::replace(&mut session.state, state);
            ConnectionEvent {
                address: session.address().map(str::to_string),
                previous,
                state,
            }
        };

        debug!("Connection state: {} -> {}", event.previous, event.state);
        let _ = self.state_tx.send(event);
    }

    /// Publish the summary if it changed.
    fn publish_summary(&self, connected: bool) {
        let summary = ConnectionSummary {
            name: self.session.lock().name(),
            connected,
        };

        {
            let mut current = self.summary.write();
            if *current == summary {
                return;
            }
            *current = summary.clone();
        }

        let _ = self.summary_tx.send(summary);
    }

    // === Scanning ===

    async fn start_scan(&self) -> Result<()> {
        let current = self.scan.lock().clone();
        if matches!(current, ScanState::Normal(_)) {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        self.cancel_reconnect();
        if matches!(current, ScanState::Reconnect(_)) {
            debug!("Stopping reconnect scan");
            if let Err(e) = self.stop_transport_scan().await {
                warn!("Error stopping reconnect scan: {}", e);
            }
        }

        self.registry.clear();

        let request = {
            let config = self.config.read();
            if config.filter_scan_by_service {
                ScanRequest::by_service(MOTOR_SERVICE_UUID, config.scan_mode)
            } else {
                ScanRequest::unfiltered(config.scan_mode)
            }
        };

        if let Err(e) = self.transport.start_scan(&request).await {
            warn!("Scan refused: {}", e);
            return Err(e);
        }

        info!("Scanning for motor controllers");
        *self.scan.lock() = ScanState::Normal(request);
        self.start_cleanup();

        Ok(())
    }

    /// Stop whichever scan is running and the stale sighting cleanup.
    async fn stop_transport_scan(&self) -> Result<()> {
        let previous = std::mem::take(&mut *self.scan.lock());

        if let Some(handle) = self.cleanup_task.lock().take() {
            handle.abort();
        }

        if previous == ScanState::Stopped {
            return Ok(());
        }

        debug!("Stopping BLE scan");
        self.transport.stop_scan().await
    }

    fn start_cleanup(&self) {
        let mut task = self.cleanup_task.lock();
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let (period, stale_after) = {
            let config = self.config.read();
            (config.cleanup_interval, config.stale_after)
        };
        let registry = self.registry.clone();
        let removed_tx = self.removed_tx.clone();

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                for sighting in registry.evict_stale(Instant::now(), stale_after) {
                    debug!("Removing stale device {}", sighting.address);
                    let _ = removed_tx.send(sighting);
                }
            }
        }));
    }

    fn on_advertisement(&self, advertisement: Advertisement) {
        let matches = match self.scan.lock().request() {
            Some(request) => request.matches(&advertisement),
            None => {
                trace!("Not scanning, ignoring advertisement");
                return;
            }
        };

        if !matches {
            trace!("Advertisement from {} filtered out", advertisement.address);
            return;
        }

        let device_id = advertisement.device_id(self.config.read().company_id);
        let sighting = self.registry.observe(&advertisement, device_id);
        trace!("Sighted {} ({} dBm)", sighting.address, sighting.rssi);
        let _ = self.sighted_tx.send(sighting);
    }

    // === Connection ===

    async fn connect(&self, sighting: Sighting) -> Result<()> {
        self.abort_reconnect();
        if let Err(e) = self.stop_transport_scan().await {
            warn!("Error stopping scan: {}", e);
        }
        self.close_link().await;

        self.config.write().last_device_id = sighting.device_id;

        let link = match self.transport.open(&sighting.address).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Failed to open link to {}: {}", sighting.address, e);
                self.set_state(ConnectionState::Idle);
                return Err(e);
            }
        };

        info!("Connecting to {}", sighting.address);
        {
            let mut session = self.session.lock();
            let previous = session.state;
            *session = Session::for_target(sighting, previous);
        }
        *self.link.write() = Some(link.clone());
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = link.connect().await {
            warn!("Connect request to {} failed: {}", link.address(), e);
            self.close_link().await;
            self.set_state(ConnectionState::Idle);
            return Err(Error::ConnectionFailed {
                reason: e.to_string(),
            });
        }

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let reconnecting = self.session.lock().state == ConnectionState::Reconnecting;
        if reconnecting {
            info!("Cancelling reconnect");
            self.cancel_reconnect();
            if let Err(e) = self.stop_transport_scan().await {
                warn!("Error stopping reconnect scan: {}", e);
            }
            self.publish_summary(false);
            return Ok(());
        }

        let link = self.link.read().clone();
        let Some(link) = link else {
            debug!("Not connected, ignoring disconnect request");
            return Ok(());
        };

        info!("Disconnecting from {}", link.address());
        self.session.lock().user_disconnect = true;
        self.queue.clear();
        self.publish_summary(false);
        self.set_state(ConnectionState::Disconnecting);

        if let Err(e) = link.disconnect().await {
            warn!("Disconnect request failed: {}, closing link", e);
            self.close_link().await;
            self.session.lock().user_disconnect = false;
            self.set_state(ConnectionState::Idle);
            return Err(e);
        }

        Ok(())
    }

    /// Close the link, drop resolved characteristics and flush the queue.
    async fn close_link(&self) {
        let link = self.link.write().take();
        self.queue.clear();
        self.session.lock().characteristics = None;
        self.publish_summary(false);

        if let Some(link) = link {
            debug!("Closing link to {}", link.address());
            link.close().await;
        }
    }

    async fn on_connected(&self, address: &str) {
        let link = {
            let session = self.session.lock();
            if !session.is_for(address) || session.state != ConnectionState::Connecting {
                debug!("Ignoring connect of {}", address);
                return;
            }
            self.link.read().clone()
        };
        let Some(link) = link else {
            return;
        };

        info!("Connected to {}", address);
        self.set_state(ConnectionState::DiscoveringServices);
        self.publish_summary(true);

        if let Err(e) = link.discover_services().await {
            warn!("Failed to start service discovery on {}: {}", address, e);
        }
    }

    async fn on_services_discovered(&self, address: &str, services: &[GattService]) {
        let link = {
            let session = self.session.lock();
            if !session.is_for(address) || session.state != ConnectionState::DiscoveringServices {
                debug!("Ignoring services of {}", address);
                return;
            }
            self.link.read().clone()
        };
        let Some(link) = link else {
            return;
        };

        let characteristics = match MotorCharacteristics::resolve(services) {
            Ok(c) => c,
            Err(e) => {
                warn!("{} on {}, commands and telemetry unavailable", e, address);
                return;
            }
        };

        let telemetry = &characteristics.telemetry;
        if let Err(e) = link.set_notify(telemetry, true).await {
            warn!("Failed to enable telemetry notifications: {}", e);
        }

        if telemetry.has_descriptor(&CCCD_UUID) {
            if let Err(e) = link
                .write_descriptor(telemetry, &CCCD_UUID, &ENABLE_NOTIFICATION_VALUE)
                .await
            {
                warn!("Failed to write telemetry CCCD: {}", e);
            }
        } else {
            debug!("Telemetry characteristic has no CCCD");
        }

        self.session.lock().characteristics = Some(characteristics);
        self.set_state(ConnectionState::Ready);
        info!("Motor controller {} ready", address);
    }

    fn on_notification(&self, address: &str, characteristic: &Uuid, value: &[u8]) {
        if !self.session.lock().is_for(address) || *characteristic != TELEMETRY_CHARACTERISTIC_UUID
        {
            trace!("Ignoring notification from {} on {}", address, characteristic);
            return;
        }

        let Some(frame) = TelemetryFrame::decode(value) else {
            trace!("Dropping {} byte telemetry notification", value.len());
            return;
        };

        *self.latest_telemetry.write() = Some(frame);
        let _ = self.telemetry_tx.send(frame);
    }

    async fn on_disconnected(self: &Arc<Self>, address: &str) {
        {
            let session = self.session.lock();
            if !session.is_for(address)
                || matches!(
                    session.state,
                    ConnectionState::Idle | ConnectionState::Reconnecting
                )
            {
                debug!("Ignoring disconnect of {}", address);
                return;
            }
        }

        info!("Disconnected from {}", address);
        self.close_link().await;

        let user_initiated = std::mem::take(&mut self.session.lock().user_disconnect);
        let config = self.config.read().clone();

        match config.last_device_id {
            Some(device_id) if config.can_reconnect() && !user_initiated => {
                let plan = ReconnectPlan::for_device(device_id, MOTOR_SERVICE_UUID, &config);
                self.set_state(ConnectionState::Reconnecting);
                self.spawn_reconnect(plan, config.reconnect_settle_delay);
            }
            _ => self.set_state(ConnectionState::Idle),
        }
    }

    // === Reconnect ===

    fn spawn_reconnect(self: &Arc<Self>, plan: ReconnectPlan, settle: std::time::Duration) {
        let inner = self.clone();
        let handle = tokio::spawn(async move { inner.reconnect(plan, settle).await });

        if let Some(previous) = self.reconnect_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Abort the reconnect task if any, leaving `Reconnecting` for `Idle`.
    /// Stop the reconnect task without touching the connection state.
    fn abort_reconnect(&self) {
        if let Some(handle) = self.reconnect_task.lock().take() {
            handle.abort();
            debug!("Reconnect cancelled");
            let _ = self.reconnect_tx.send(ReconnectEvent::Cancelled);
        }
    }

    fn cancel_reconnect(&self) {
        self.abort_reconnect();

        let reconnecting = self.session.lock().state == ConnectionState::Reconnecting;
        if reconnecting {
            self.set_state(ConnectionState::Idle);
        }
    }

    async fn reconnect(self: Arc<Self>, plan: ReconnectPlan, settle: std::time::Duration) {
        // Let the radio stack release the old link
        tokio::time::sleep(settle).await;

        {
            let _op = self.ops.lock().await;

            if let Err(e) = self.stop_transport_scan().await {
                warn!("Error stopping scan: {}", e);
            }
            self.registry.clear();

            let request = plan.scan_request();
            if let Err(e) = self.transport.start_scan(&request).await {
                warn!("Reconnect scan refused: {}", e);
                self.reconnect_task.lock().take();
                self.set_state(ConnectionState::Idle);
                let _ = self.reconnect_tx.send(ReconnectEvent::Cancelled);
                return;
            }

            info!("Scanning for {} to reconnect", plan.device_id);
            *self.scan.lock() = ScanState::Reconnect(request);
            let _ = self.reconnect_tx.send(ReconnectEvent::Started {
                device_id: plan.device_id,
            });
        }

        let matched = poll_for_match(&self.registry, &plan).await;

        let _op = self.ops.lock().await;
        // Detach so that connecting or stopping does not abort this task
        self.reconnect_task.lock().take();

        match matched {
            Some(sighting) => {
                let _ = self.reconnect_tx.send(ReconnectEvent::Matched {
                    address: sighting.address.clone(),
                });
                if let Err(e) = self.connect(sighting).await {
                    warn!("Reconnect to {} failed: {}", plan.device_id, e);
                }
            }
            None => {
                warn!(
                    "No sighting of {} within {:?}, giving up",
                    plan.device_id, plan.timeout
                );
                if let Err(e) = self.stop_transport_scan().await {
                    warn!("Error stopping reconnect scan: {}", e);
                }
                self.set_state(ConnectionState::Idle);
                let _ = self.reconnect_tx.send(ReconnectEvent::TimedOut {
                    device_id: plan.device_id,
                });
            }
        }
    }
}
