//! Serial command arbitration, connection lifecycle, and read caches.
//!
//! One worker task owns all serial I/O. Every command, whether from an HTTP
//! handler or a background poller, goes through the two priority lanes and
//! is answered on a private oneshot channel. The port handle, the two read
//! caches, and the switch table each live under their own lock so a handler
//! reading cached state never waits behind a slow serial round-trip.

use crate::capability_sync::SwitchTable;
use crate::config::ConfigStore;
use crate::errors::{BridgeError, Result};
use crate::port_discovery;
use crate::protocol::{self, FieldMap, FieldValue, BAUD_RATE, CMD_GET_SENSORS, CMD_GET_STATUS};
use crate::transport::{DeviceLink, LinkFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock, RwLockReadGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(5);
const CACHE_REFRESH_INTERVAL: Duration = Duration::from_secs(3);
const HEAP_LOG_FORCE_INTERVAL: Duration = Duration::from_secs(120);

/// High is reserved for user-initiated writes; Low for periodic polling.
/// Strict priority, no aging: Low traffic is self-throttled by its own
/// polling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

struct Command {
    payload: String,
    timeout: Duration,
    reply: oneshot::Sender<Result<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotifiedState {
    Connected,
    Disconnected,
}

struct PortState {
    link: Option<Box<dyn DeviceLink>>,
    /// Tracks the last notified transition so connect/disconnect events fire
    /// exactly once per real state change.
    last_notified: NotifiedState,
    /// Set while an external tool (e.g. a firmware flasher) borrows the
    /// physical port; the supervisor checks it before every open attempt.
    reconnect_paused: bool,
}

#[derive(Default)]
struct HeapLog {
    free: f64,
    min_free: f64,
    max_alloc: f64,
    size: f64,
    last_logged: Option<Instant>,
}

struct ManagerInner {
    high_tx: mpsc::UnboundedSender<Command>,
    low_tx: mpsc::UnboundedSender<Command>,
    lanes: std::sync::Mutex<Option<Lanes>>,
    state: Mutex<PortState>,
    status: RwLock<FieldMap>,
    conditions: RwLock<FieldMap>,
    switch_table: RwLock<SwitchTable>,
    /// Last commanded/observed adjustable-voltage setpoint; -1 means unknown.
    voltage_target: RwLock<f64>,
    firmware_version: RwLock<String>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    config: Arc<ConfigStore>,
    link_factory: Arc<dyn LinkFactory>,
    /// Latched barrier releasing the periodic tasks after the initial
    /// synchronous connection attempt.
    ready: CancellationToken,
    heap_log: Mutex<HeapLog>,
}

struct Lanes {
    high_rx: mpsc::UnboundedReceiver<Command>,
    low_rx: mpsc::UnboundedReceiver<Command>,
}

/// Owns the serial session: port handle, caches, switch table, and the
/// command lanes. Cheap to clone; constructed once and injected into the
/// HTTP layer.
#[derive(Clone)]
pub struct SerialManager {
    inner: Arc<ManagerInner>,
}

impl SerialManager {
    pub fn new(
        config: Arc<ConfigStore>,
        link_factory: Arc<dyn LinkFactory>,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(8);

        let inner = Arc::new(ManagerInner {
            high_tx,
            low_tx,
            lanes: std::sync::Mutex::new(Some(Lanes { high_rx, low_rx })),
            state: Mutex::new(PortState {
                link: None,
                last_notified: NotifiedState::Disconnected,
                reconnect_paused: false,
            }),
            status: RwLock::new(FieldMap::new()),
            conditions: RwLock::new(FieldMap::new()),
            switch_table: RwLock::new(SwitchTable::default_table()),
            voltage_target: RwLock::new(-1.0),
            firmware_version: RwLock::new("unknown".to_string()),
            events_tx,
            config,
            link_factory,
            ready: CancellationToken::new(),
            heap_log: Mutex::new(HeapLog::default()),
        });

        (Self { inner }, events_rx)
    }

    /// Two-phase start: the worker runs immediately, the periodic tasks park
    /// on the ready barrier, then one synchronous connection attempt runs
    /// before the barrier is released. This keeps background polling from
    /// racing the very first connect.
    pub async fn start(&self) {
        self.spawn_worker();

        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.supervisor_loop().await });
        let updater = self.clone();
        tokio::spawn(async move { updater.cache_updater_loop().await });

        self.initial_connect().await;

        info!("Signaling background tasks to start main loops");
        self.inner.ready.cancel();
    }

    // --- Command arbitration ---

    pub(crate) fn spawn_worker(&self) {
        let lanes = self
            .inner
            .lanes
            .lock()
            .expect("lanes mutex poisoned")
            .take();
        let Some(lanes) = lanes else {
            warn!("Command worker already started");
            return;
        };
        let inner = self.inner.clone();
        tokio::spawn(async move { worker_loop(inner, lanes).await });
    }

    /// Queues a command and waits for its reply. Blocks the caller for at
    /// most the given timeout even if the worker is stuck on an unrelated
    /// slow transport call (caller-side timeout racing the worker-side one).
    pub async fn send_command(
        &self,
        payload: &str,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let timeout = timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command {
            payload: payload.to_string(),
            timeout,
            reply: reply_tx,
        };

        let lane = match priority {
            Priority::High => {
                debug!("Queueing high-priority command: {}", payload);
                &self.inner.high_tx
            }
            Priority::Low => {
                debug!("Queueing low-priority command: {}", payload);
                &self.inner.low_tx
            }
        };
        lane.send(command).map_err(|_| BridgeError::WorkerGone)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::WorkerGone),
            Err(_) => Err(BridgeError::Timeout),
        }
    }

    // --- Connection state ---

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.link.is_some()
    }

    pub async fn firmware_version(&self) -> String {
        self.inner.firmware_version.read().await.clone()
    }

    pub(crate) async fn set_firmware_version(&self, version: String) {
        *self.inner.firmware_version.write().await = version;
    }

    /// Closes the port for external access (e.g. firmware flashing) and
    /// pauses auto-reconnect until `resume_reconnect`.
    pub async fn release_port(&self) {
        let mut state = self.inner.state.lock().await;
        state.reconnect_paused = true;
        info!("ReleasePort: auto-reconnect paused");
        if state.link.is_none() {
            info!("ReleasePort: port is already closed");
            return;
        }
        mark_disconnected(&self.inner, &mut state);
        info!("ReleasePort: serial port closed for external access");
    }

    pub async fn resume_reconnect(&self) {
        let mut state = self.inner.state.lock().await;
        state.reconnect_paused = false;
        info!("ResumeReconnect: auto-reconnect resumed");
    }

    pub async fn is_reconnect_paused(&self) -> bool {
        self.inner.state.lock().await.reconnect_paused
    }

    /// Forces an immediate reconnect attempt. An empty port name disconnects
    /// and leaves the connection closed (the supervisor takes over).
    pub async fn force_reconnect(&self, port_name: &str) {
        let mut state = self.inner.state.lock().await;
        self.reconnect_locked(&mut state, port_name).await;
    }

    async fn initial_connect(&self) {
        info!("Performing initial device connection attempt...");
        let conf = self.inner.config.get().await;
        if !conf.serial_port_name.is_empty() {
            info!(
                "Initial connection: trying configured port '{}'",
                conf.serial_port_name
            );
            let mut state = self.inner.state.lock().await;
            self.reconnect_locked(&mut state, &conf.serial_port_name).await;
        } else {
            info!("Initial connection: starting auto-detection...");
            match port_discovery::find_port(self.inner.link_factory.clone()).await {
                Ok(found) => {
                    info!("Auto-detection found device on port {}. Connecting...", found);
                    let mut state = self.inner.state.lock().await;
                    self.reconnect_locked(&mut state, &found).await;
                }
                Err(e) => warn!("Initial connection: auto-detection failed: {}", e),
            }
        }

        if self.is_connected().await {
            info!("Initial connection attempt finished successfully.");
        } else {
            warn!("Initial connection attempt failed. Retrying in the background.");
        }
    }

    /// Closes any current link and opens the named port. Must hold the port
    /// state lock. Fires the connected event and kicks off capability sync
    /// and the firmware version fetch on a fresh transition.
    async fn reconnect_locked(&self, state: &mut PortState, new_port: &str) {
        mark_disconnected(&self.inner, state);

        if new_port.is_empty() {
            info!("Reconnect called with empty port name. Connection remains closed.");
            return;
        }

        info!("Attempting to open serial port: {}", new_port);
        match self.inner.link_factory.open(new_port, BAUD_RATE).await {
            Err(e) => error!("Failed to open port {}: {}", new_port, e),
            Ok(link) => {
                state.link = Some(link);
                self.inner.config.set_serial_port(new_port).await;
                info!("Successfully opened serial port: {}", new_port);

                if state.last_notified == NotifiedState::Disconnected {
                    state.last_notified = NotifiedState::Connected;
                    if self.inner.events_tx.try_send(ConnectionEvent::Connected).is_err() {
                        debug!("No listener ready for connected event; dropped");
                    }

                    // Detached so they never hold the port lock; they go
                    // through the command lanes like any other caller.
                    let manager = self.clone();
                    tokio::spawn(async move { manager.sync_capabilities().await });
                    let manager = self.clone();
                    tokio::spawn(async move { manager.fetch_firmware_version().await });
                }
            }
        }
    }

    // --- Connection supervisor ---

    async fn supervisor_loop(&self) {
        self.inner.ready.cancelled().await;
        info!("Connection manager task started");
        loop {
            tokio::time::sleep(SUPERVISOR_INTERVAL).await;
            self.supervisor_tick().await;
        }
    }

    /// One supervisor cycle: no-op while paused or connected, otherwise try
    /// the configured port and fall back to discovery.
    pub(crate) async fn supervisor_tick(&self) {
        let mut state = self.inner.state.lock().await;
        if state.reconnect_paused {
            debug!("Connection manager: reconnect is paused, skipping");
            return;
        }
        if state.link.is_some() {
            debug!("Connection manager: device is connected");
            return;
        }

        info!("Connection manager: device is disconnected, attempting to connect...");
        let conf = self.inner.config.get().await;
        let target = conf.serial_port_name.clone();

        // With auto-detect off, only the configured port is ever tried.
        if !conf.auto_detect_port && !target.is_empty() {
            info!("Connection manager: trying configured port '{}'", target);
            self.reconnect_locked(&mut state, &target).await;
            return;
        }

        if !target.is_empty() {
            info!("Connection manager: trying configured port '{}'", target);
            self.reconnect_locked(&mut state, &target).await;
            if state.link.is_none() {
                warn!(
                    "Connection manager: configured port '{}' failed. Falling back to auto-detection.",
                    target
                );
                self.inner.config.clear_serial_port().await;
            }
        }

        if state.link.is_none() {
            info!("Connection manager: starting auto-detection...");
            match port_discovery::find_port(self.inner.link_factory.clone()).await {
                Ok(found) => {
                    info!("Connection manager: found device on port {}. Connecting...", found);
                    self.reconnect_locked(&mut state, &found).await;
                }
                Err(e) => warn!("Connection manager: auto-detection failed: {}", e),
            }
        }
    }

    // --- Caches ---

    pub async fn status(&self) -> RwLockReadGuard<'_, FieldMap> {
        self.inner.status.read().await
    }

    pub async fn conditions(&self) -> RwLockReadGuard<'_, FieldMap> {
        self.inner.conditions.read().await
    }

    pub async fn switch_table(&self) -> RwLockReadGuard<'_, SwitchTable> {
        self.inner.switch_table.read().await
    }

    pub(crate) async fn replace_switch_table(&self, table: SwitchTable) {
        *self.inner.switch_table.write().await = table;
    }

    pub async fn voltage_target(&self) -> f64 {
        *self.inner.voltage_target.read().await
    }

    pub async fn set_voltage_target(&self, target: f64) {
        *self.inner.voltage_target.write().await = target;
    }

    pub(crate) fn config(&self) -> &Arc<ConfigStore> {
        &self.inner.config
    }

    async fn cache_updater_loop(&self) {
        self.inner.ready.cancelled().await;
        info!("Periodic cache update task started");
        loop {
            self.refresh_caches().await;
            tokio::time::sleep(CACHE_REFRESH_INTERVAL).await;
        }
    }

    pub(crate) async fn refresh_caches(&self) {
        debug!("Performing cache update");

        match self.send_command(CMD_GET_STATUS, Priority::Low, None).await {
            Ok(raw) => {
                if let Err(e) = self.apply_status_response(&raw).await {
                    warn!("Failed to parse status response: {}. Raw data: {}", e, raw);
                }
            }
            Err(e) => warn!("Failed to get status for cache update: {}", e),
        }

        match self.send_command(CMD_GET_SENSORS, Priority::Low, None).await {
            Ok(raw) => match protocol::parse_conditions_response(&raw) {
                Ok(fields) => {
                    self.log_heap_stats(&fields).await;
                    *self.inner.conditions.write().await = fields;
                }
                Err(e) => warn!("Failed to parse conditions response: {}. Raw data: {}", e, raw),
            },
            Err(e) => warn!("Failed to get conditions for cache update: {}", e),
        }
    }

    /// Replaces the status cache from a status-bearing response, applying
    /// the dew-mode merge: a response without "dm" (typical for narrow set
    /// commands) keeps the previously cached array. Also syncs the voltage
    /// target from a reported adjustable-output level.
    ///
    /// HTTP set handlers call this directly with the synchronous reply so
    /// reads reflect the write before the next periodic refresh.
    pub async fn apply_status_response(&self, raw: &str) -> Result<()> {
        let (mut fields, dew_modes) = protocol::parse_status_response(raw)?;

        let mut status = self.inner.status.write().await;
        match dew_modes {
            Some(dm) => {
                fields.insert("dm".to_string(), dm);
            }
            None => {
                if let Some(existing) = status.get("dm") {
                    fields.insert("dm".to_string(), existing.clone());
                }
            }
        }

        if let Some(adj) = fields.get("adj").and_then(FieldValue::as_f64) {
            if adj > 0.0 {
                *self.inner.voltage_target.write().await = adj;
            }
        }

        *status = fields;
        Ok(())
    }

    /// Debug-logs the device heap counters when they change, or every two
    /// minutes regardless, to keep firmware memory leaks visible.
    async fn log_heap_stats(&self, conditions: &FieldMap) {
        let get = |key: &str| conditions.get(key).and_then(FieldValue::as_f64).unwrap_or(0.0);
        let (free, min_free, max_alloc, size) = (get("hf"), get("hmf"), get("hma"), get("hs"));

        let mut log = self.inner.heap_log.lock().await;
        let changed = free != log.free
            || min_free != log.min_free
            || max_alloc != log.max_alloc
            || size != log.size;
        let forced = log
            .last_logged
            .map_or(true, |t| t.elapsed() > HEAP_LOG_FORCE_INTERVAL);

        if changed || forced {
            debug!(
                "Device heap: size={:.0} free={:.0} min_free={:.0} max_alloc={:.0}",
                size, free, min_free, max_alloc
            );
            log.free = free;
            log.min_free = min_free;
            log.max_alloc = max_alloc;
            log.size = size;
            log.last_logged = Some(Instant::now());
        }
    }
}

/// Closes the port and notifies listeners on a Connected→Disconnected
/// transition. Must hold the port state lock.
fn mark_disconnected(inner: &ManagerInner, state: &mut PortState) {
    if state.link.is_some() {
        if state.last_notified == NotifiedState::Connected {
            state.last_notified = NotifiedState::Disconnected;
            if inner.events_tx.try_send(ConnectionEvent::Disconnected).is_err() {
                debug!("No listener ready for disconnected event; dropped");
            }
        }
        // Dropping the link closes the underlying port handle.
        state.link = None;
    } else {
        state.last_notified = NotifiedState::Disconnected;
    }
}

/// The single consumer of both command lanes. High priority wins whenever a
/// command is immediately available; within a lane, dispatch is FIFO.
async fn worker_loop(inner: Arc<ManagerInner>, mut lanes: Lanes) {
    info!("Serial command processor started");
    loop {
        let command = match lanes.high_rx.try_recv() {
            Ok(command) => command,
            Err(_) => {
                tokio::select! {
                    biased;
                    cmd = lanes.high_rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => return,
                    },
                    cmd = lanes.low_rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => return,
                    },
                }
            }
        };
        dispatch(&inner, command).await;
    }
}

async fn dispatch(inner: &Arc<ManagerInner>, command: Command) {
    let mut state = inner.state.lock().await;

    let Some(link) = state.link.as_mut() else {
        let _ = command.reply.send(Err(BridgeError::NotConnected));
        return;
    };

    // Stale buffered output would be misread as this command's reply.
    link.drain_input().await;

    debug!("Processing command: {}", command.payload);
    if let Err(e) = link.write_line(&command.payload).await {
        error!("Serial write failed: {}. Marking port as disconnected.", e);
        mark_disconnected(inner, &mut state);
        drop(state);
        let _ = command.reply.send(Err(e));
        return;
    }

    match link.read_line(command.timeout).await {
        Ok(response) => {
            drop(state);
            debug!("Received response from device: {}", response);
            let _ = command.reply.send(Ok(response));
        }
        Err(e) => {
            error!("Serial read failed: {}. Marking port as disconnected.", e);
            // The disconnect transition completes before the error reaches
            // the caller; nobody observes a failed command on a port still
            // reported as connected.
            mark_disconnected(inner, &mut state);
            drop(state);
            let _ = command.reply.send(Err(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Copy, PartialEq)]
    enum LinkMode {
        Echo,
        FailWrite,
        FailRead,
    }

    struct MockLink {
        sent: Arc<StdMutex<Vec<String>>>,
        mode: Arc<StdMutex<LinkMode>>,
        last: String,
    }

    #[async_trait]
    impl DeviceLink for MockLink {
        async fn write_line(&mut self, line: &str) -> Result<()> {
            if *self.mode.lock().unwrap() == LinkMode::FailWrite {
                return Err(BridgeError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "port gone",
                )));
            }
            self.sent.lock().unwrap().push(line.to_string());
            self.last = line.to_string();
            Ok(())
        }

        async fn read_line(&mut self, _timeout: Duration) -> Result<String> {
            if *self.mode.lock().unwrap() == LinkMode::FailRead {
                return Err(BridgeError::Timeout);
            }
            Ok(format!("echo:{}", self.last))
        }

        async fn drain_input(&mut self) {}
    }

    struct MockFactory {
        sent: Arc<StdMutex<Vec<String>>>,
        mode: Arc<StdMutex<LinkMode>>,
        opens: AtomicUsize,
        fail_open: AtomicBool,
    }

    impl MockFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Arc::new(StdMutex::new(Vec::new())),
                mode: Arc::new(StdMutex::new(LinkMode::Echo)),
                opens: AtomicUsize::new(0),
                fail_open: AtomicBool::new(false),
            })
        }

        fn set_mode(&self, mode: LinkMode) {
            *self.mode.lock().unwrap() = mode;
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LinkFactory for MockFactory {
        async fn open(&self, _port_name: &str, _baud_rate: u32) -> Result<Box<dyn DeviceLink>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(BridgeError::NotConnected);
            }
            Ok(Box::new(MockLink {
                sent: self.sent.clone(),
                mode: self.mode.clone(),
                last: String::new(),
            }))
        }
    }

    fn test_config(name: &str) -> Arc<ConfigStore> {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "powerbox_mgr_test_{}_{}.json",
            name,
            std::process::id()
        ));
        std::fs::remove_file(&path).ok();
        Arc::new(ConfigStore::load_from(path))
    }

    fn test_manager(
        name: &str,
        factory: Arc<MockFactory>,
    ) -> (SerialManager, mpsc::Receiver<ConnectionEvent>) {
        SerialManager::new(test_config(name), factory)
    }

    #[tokio::test]
    async fn high_priority_dispatches_before_queued_low() {
        let factory = MockFactory::new();
        let (manager, _events) = test_manager("priority", factory.clone());
        manager.force_reconnect("MOCK").await;

        // Queue while the worker is not yet running, so all three commands
        // are pending when dispatch begins.
        let m = manager.clone();
        let low_a = tokio::spawn(async move {
            m.send_command(r#"{"get":"status"}"#, Priority::Low, None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let m = manager.clone();
        let low_b = tokio::spawn(async move {
            m.send_command(r#"{"get":"sensors"}"#, Priority::Low, None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let m = manager.clone();
        let high = tokio::spawn(async move {
            m.send_command(r#"{"set":{"d1":true}}"#, Priority::High, None).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.spawn_worker();

        assert!(high.await.unwrap().is_ok());
        assert!(low_a.await.unwrap().is_ok());
        assert!(low_b.await.unwrap().is_ok());

        let sent = factory.sent();
        assert_eq!(sent[0], r#"{"set":{"d1":true}}"#, "high must preempt queued low");
        // FIFO within the low lane.
        assert_eq!(sent[1], r#"{"get":"status"}"#);
        assert_eq!(sent[2], r#"{"get":"sensors"}"#);
    }

    #[tokio::test]
    async fn command_fails_fast_when_disconnected() {
        let factory = MockFactory::new();
        let (manager, _events) = test_manager("disconnected", factory);
        manager.spawn_worker();

        let err = manager
            .send_command(r#"{"get":"status"}"#, Priority::High, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
    }

    #[tokio::test]
    async fn read_failure_disconnects_before_error_delivery() {
        let factory = MockFactory::new();
        let (manager, mut events) = test_manager("read_fail", factory.clone());
        manager.spawn_worker();
        manager.force_reconnect("MOCK").await;
        assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));

        factory.set_mode(LinkMode::FailRead);
        let err = manager
            .send_command(r#"{"get":"status"}"#, Priority::High, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout));
        assert!(!manager.is_connected().await);
        assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected));
    }

    #[tokio::test]
    async fn write_failure_disconnects_before_error_delivery() {
        let factory = MockFactory::new();
        let (manager, mut events) = test_manager("write_fail", factory.clone());
        manager.spawn_worker();
        manager.force_reconnect("MOCK").await;
        assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));

        factory.set_mode(LinkMode::FailWrite);
        let err = manager
            .send_command(r#"{"set":{"d1":true}}"#, Priority::High, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
        assert!(!manager.is_connected().await);
        assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected));
    }

    #[tokio::test]
    async fn one_event_per_transition() {
        let factory = MockFactory::new();
        let (manager, mut events) = test_manager("transitions", factory.clone());

        manager.force_reconnect("MOCK").await;
        assert_eq!(events.try_recv(), Ok(ConnectionEvent::Connected));

        manager.release_port().await;
        assert_eq!(events.try_recv(), Ok(ConnectionEvent::Disconnected));

        // Releasing an already-closed port must not fire again.
        manager.release_port().await;
        assert!(events.try_recv().is_err());

        manager.resume_reconnect().await;
        manager.supervisor_tick().await;
        assert!(manager.is_connected().await);
        assert_eq!(events.try_recv(), Ok(ConnectionEvent::Connected));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn supervisor_honors_pause_flag() {
        let factory = MockFactory::new();
        let (manager, _events) = test_manager("paused", factory.clone());

        manager.force_reconnect("MOCK").await;
        manager.release_port().await;
        let opens_before = factory.opens.load(Ordering::SeqCst);

        manager.supervisor_tick().await;
        assert!(!manager.is_connected().await);
        assert_eq!(factory.opens.load(Ordering::SeqCst), opens_before);

        manager.resume_reconnect().await;
        manager.supervisor_tick().await;
        assert!(manager.is_connected().await);
        assert_eq!(factory.opens.load(Ordering::SeqCst), opens_before + 1);
    }

    #[tokio::test]
    async fn supervisor_skips_when_connected() {
        let factory = MockFactory::new();
        let (manager, _events) = test_manager("skip_connected", factory.clone());
        manager.force_reconnect("MOCK").await;

        let opens_before = factory.opens.load(Ordering::SeqCst);
        manager.supervisor_tick().await;
        assert_eq!(factory.opens.load(Ordering::SeqCst), opens_before);
    }

    #[tokio::test]
    async fn dew_modes_survive_status_replacement_without_dm() {
        let factory = MockFactory::new();
        let (manager, _events) = test_manager("dm_merge", factory);

        manager
            .apply_status_response(r#"{"status":{"d1":true},"dm":[0,3]}"#)
            .await
            .unwrap();
        manager
            .apply_status_response(r#"{"status":{"d1":false}}"#)
            .await
            .unwrap();

        {
            let status = manager.status().await;
            assert_eq!(status.get("d1"), Some(&FieldValue::Bool(false)));
            assert_eq!(
                status.get("dm"),
                Some(&FieldValue::NumberArray(vec![0.0, 3.0])),
                "dm must be preserved across a replacement that lacks it"
            );
        }

        manager
            .apply_status_response(r#"{"status":{"d1":true},"dm":[1,1]}"#)
            .await
            .unwrap();
        let status = manager.status().await;
        assert_eq!(
            status.get("dm"),
            Some(&FieldValue::NumberArray(vec![1.0, 1.0])),
            "a response that carries dm overwrites it"
        );
    }

    #[tokio::test]
    async fn malformed_status_leaves_cache_untouched() {
        let factory = MockFactory::new();
        let (manager, _events) = test_manager("stale_cache", factory);

        manager
            .apply_status_response(r#"{"status":{"d1":true}}"#)
            .await
            .unwrap();
        assert!(manager.apply_status_response("not json").await.is_err());
        assert!(manager.apply_status_response(r#"{"v":12.1}"#).await.is_err());

        let status = manager.status().await;
        assert_eq!(status.get("d1"), Some(&FieldValue::Bool(true)));
    }

    #[tokio::test]
    async fn voltage_target_synced_from_reported_level() {
        let factory = MockFactory::new();
        let (manager, _events) = test_manager("voltage", factory);
        assert_eq!(manager.voltage_target().await, -1.0);

        manager
            .apply_status_response(r#"{"status":{"adj":12.5}}"#)
            .await
            .unwrap();
        assert_eq!(manager.voltage_target().await, 12.5);

        // A powered-off output reports boolean false; the target survives.
        manager
            .apply_status_response(r#"{"status":{"adj":false}}"#)
            .await
            .unwrap();
        assert_eq!(manager.voltage_target().await, 12.5);
    }

    #[tokio::test]
    async fn known_good_port_is_persisted_on_connect() {
        let factory = MockFactory::new();
        let (manager, _events) = test_manager("persist_port", factory);
        manager.force_reconnect("COM5").await;

        assert_eq!(manager.config().get().await.serial_port_name, "COM5");
    }
}
