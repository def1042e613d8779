//! Channel-by-channel WiFi scanning.
//!
//! A scan walks the channels from [`WIFI_SCAN_MAX_CHANNEL`] down to 1. For
//! each channel the worker asks the [`ScanDriver`] to start a passive scan,
//! then sleeps until the platform reports the channel done (through
//! [`WiFiScanManager::on_scan_done`]) or the per-channel timeout passes. The
//! networks found on each channel are broadcast to the discovery handlers.
//!
//! ## Status flow
//!
//! `Started` and `InProgress` are reported once the first channel is
//! running; every scan then ends with exactly one of `Completed`, `TimedOut`,
//! `Aborted` or `Error`.
//!
//! Event hooks only set notification bits. All driver calls and handler
//! invocations happen on the scan worker or on the caller of
//! [`WiFiScanManager::abort_scan`]. Status reports are serialized, so no
//! status of a scan ever follows its terminal one.

use crate::consts::{WIFI_SCAN_MAX_CHANNEL, WIFI_SCAN_MAX_MS_PER_CHANNEL, WIFI_SCAN_TIMEOUT_MS};
use crate::notify::TaskNotifier;
use core::fmt;
use log::{debug, error, warn};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const CHANNEL_DONE: u32 = 1 << 0;
const SCAN_ERROR: u32 = 1 << 1;
const WIFI_DISABLED: u32 = 1 << 2;
const ABORT: u32 = 1 << 3;

/// Progress and outcome of a scan, as reported to status handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WiFiScanStatus {
    /// The first channel scan was started.
    Started,
    /// Channels are being scanned.
    InProgress,
    /// All channels were scanned.
    Completed,
    /// A channel did not finish in time.
    TimedOut,
    /// The scan was cancelled or WiFi was switched off.
    Aborted,
    /// The driver reported a failure.
    Error,
}

impl WiFiScanStatus {
    /// Whether the status ends a scan.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Started | Self::InProgress)
    }
}

/// Authentication scheme advertised by an access point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WiFiAuthMode {
    /// No authentication.
    Open,
    /// WEP.
    Wep,
    /// WPA personal.
    WpaPsk,
    /// WPA2 personal.
    Wpa2Psk,
    /// WPA/WPA2 mixed personal.
    WpaWpa2Psk,
    /// WPA2 enterprise.
    Wpa2Enterprise,
    /// WPA3 personal.
    Wpa3Psk,
    /// WPA2/WPA3 mixed personal.
    Wpa2Wpa3Psk,
    /// Anything the hub does not know.
    Unknown,
}

/// One access point seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WiFiNetwork {
    /// Network name; empty for hidden networks.
    pub ssid: String,
    /// Access point MAC address.
    pub bssid: [u8; 6],
    /// Primary channel.
    pub channel: u8,
    /// Signal strength in dBm.
    pub rssi: i8,
    /// Advertised authentication.
    pub auth_mode: WiFiAuthMode,
}

/// Failures reported by a [`ScanDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScanError {
    /// The radio refused to start the scan.
    #[error("failed to start channel scan")]
    StartFailed,
    /// The radio is still busy with an earlier scan.
    #[error("radio scan already running")]
    Running,
    /// Results could not be read back.
    #[error("failed to read scan results")]
    Results,
}

/// The WiFi radio, as far as scanning is concerned.
pub trait ScanDriver: Send + Sync {
    /// Starts an asynchronous passive scan of one channel.
    ///
    /// Completion is reported through [`WiFiScanManager::on_scan_done`].
    fn start_channel_scan(&self, channel: u8, max_ms_per_channel: u32) -> Result<(), ScanError>;

    /// Networks found by the last completed channel scan.
    fn scan_results(&self) -> Result<Vec<WiFiNetwork>, ScanError>;
}

/// Scan tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanConfig {
    /// First (highest) channel scanned.
    pub max_channel: u8,
    /// Dwell time per channel handed to the driver.
    pub max_ms_per_channel: u32,
    /// How long to wait for one channel to complete.
    pub channel_timeout_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_channel: WIFI_SCAN_MAX_CHANNEL,
            max_ms_per_channel: WIFI_SCAN_MAX_MS_PER_CHANNEL,
            channel_timeout_ms: WIFI_SCAN_TIMEOUT_MS,
        }
    }
}

/// Called on every status change.
pub type StatusChangedHandler = Arc<dyn Fn(WiFiScanStatus) + Send + Sync>;
/// Called with the networks found on each channel.
pub type NetworksDiscoveredHandler = Arc<dyn Fn(&[WiFiNetwork]) + Send + Sync>;

#[derive(Debug)]
struct ActiveScan {
    generation: u64,
    notifier: Arc<TaskNotifier>,
    handle: JoinHandle<()>,
}

struct Shared {
    driver: Arc<dyn ScanDriver>,
    config: ScanConfig,
    active: Mutex<Option<ActiveScan>>,
    /// Held while reporting a status; taken before `active`. Reentrant so
    /// handlers may abort the scan.
    reporting: ReentrantMutex<()>,
    generation: AtomicU64,
    next_handle: AtomicU64,
    status_handlers: Mutex<BTreeMap<u64, StatusChangedHandler>>,
    network_handlers: Mutex<BTreeMap<u64, NetworksDiscoveredHandler>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|scan| scan.generation == generation)
    }

    fn notify_task(&self, bits: u32) -> bool {
        match self.active.lock().as_ref() {
            Some(scan) => {
                scan.notifier.notify(bits);
                true
            }
            None => false,
        }
    }

    fn notify_status(&self, status: WiFiScanStatus) {
        let handlers: Vec<_> = self.status_handlers.lock().values().cloned().collect();
        for handler in handlers {
            handler(status);
        }
    }

    /// Reports non-terminal `statuses` for as long as `generation` is the
    /// active scan.
    fn notify_progress(&self, generation: u64, statuses: &[WiFiScanStatus]) {
        let _reporting = self.reporting.lock();
        for &status in statuses {
            if !self.is_current(generation) {
                return;
            }
            self.notify_status(status);
        }
    }

    fn notify_networks(&self, networks: &[WiFiNetwork]) {
        let handlers: Vec<_> = self.network_handlers.lock().values().cloned().collect();
        for handler in handlers {
            handler(networks);
        }
    }

    fn start_channel(&self, channel: u8) -> Result<(), ScanError> {
        self.driver
            .start_channel_scan(channel, self.config.max_ms_per_channel)
            .inspect_err(|e| error!("Failed to start scan on channel {channel}: {e}"))
    }

    fn run_scan(&self, generation: u64, notifier: &TaskNotifier) -> WiFiScanStatus {
        let mut channel = self.config.max_channel;
        if self.start_channel(channel).is_err() {
            return WiFiScanStatus::Error;
        }

        self.notify_progress(
            generation,
            &[WiFiScanStatus::Started, WiFiScanStatus::InProgress],
        );

        let timeout = Duration::from_millis(self.config.channel_timeout_ms);
        loop {
            let Some(bits) = notifier.wait(timeout) else {
                error!("Scan timed out on channel {channel}");
                return WiFiScanStatus::TimedOut;
            };

            if bits & ABORT != 0 || !self.is_current(generation) {
                return WiFiScanStatus::Aborted;
            }
            if bits & WIFI_DISABLED != 0 {
                error!("Scan task exiting due to WiFi being disabled");
                return WiFiScanStatus::Aborted;
            }
            if bits != CHANNEL_DONE {
                error!("Scan task exiting due to a driver error");
                return WiFiScanStatus::Error;
            }

            match self.driver.scan_results() {
                Ok(networks) => self.notify_networks(&networks),
                Err(e) => {
                    error!("Failed to read results of channel {channel}: {e}");
                    return WiFiScanStatus::Error;
                }
            }

            channel -= 1;
            if channel == 0 {
                return WiFiScanStatus::Completed;
            }
            if self.start_channel(channel).is_err() {
                return WiFiScanStatus::Error;
            }
        }
    }
}

fn scan_task(shared: Arc<Shared>, generation: u64, notifier: Arc<TaskNotifier>) {
    debug!("Scan {generation} started");
    let status = shared.run_scan(generation, &notifier);

    // Whoever clears the active scan reports its terminal status
    let _reporting = shared.reporting.lock();
    let owned = {
        let mut active = shared.active.lock();
        if active.as_ref().is_some_and(|scan| scan.generation == generation) {
            *active = None;
            true
        } else {
            false
        }
    };

    if owned {
        shared.notify_status(status);
    }
    debug!("Scan {generation} finished: {status:?}");
}

/// Runs at most one WiFi scan at a time and fans out its results.
pub struct WiFiScanManager {
    shared: Arc<Shared>,
}

impl fmt::Debug for WiFiScanManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WiFiScanManager")
            .field("config", &self.shared.config)
            .field("scanning", &self.is_scanning())
            .finish_non_exhaustive()
    }
}

impl WiFiScanManager {
    /// An idle manager scanning through `driver`.
    pub fn new(driver: Arc<dyn ScanDriver>, config: ScanConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                driver,
                config,
                active: Mutex::new(None),
                reporting: ReentrantMutex::new(()),
                generation: AtomicU64::new(0),
                next_handle: AtomicU64::new(0),
                status_handlers: Mutex::new(BTreeMap::new()),
                network_handlers: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.shared.active.lock().is_some()
    }

    /// Starts a scan.
    ///
    /// # Returns
    /// `false` when a scan is already running or the worker could not start.
    pub fn start_scan(&self) -> bool {
        let mut active = self.shared.active.lock();
        if active.is_some() {
            warn!("Cannot start scan: scan task is already running");
            return false;
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let notifier = Arc::new(TaskNotifier::new());
        let shared = Arc::clone(&self.shared);
        let task_notifier = Arc::clone(&notifier);

        match thread::Builder::new()
            .name("wifi-scan".into())
            .spawn(move || scan_task(shared, generation, task_notifier))
        {
            Ok(handle) => {
                *active = Some(ActiveScan {
                    generation,
                    notifier,
                    handle,
                });
                true
            }
            Err(e) => {
                error!("Failed to create scan task: {e}");
                false
            }
        }
    }

    /// Cancels the running scan and reports `Aborted` before returning.
    ///
    /// The worker is told to stop and exits without reporting anything else.
    ///
    /// # Returns
    /// `false` when no scan is running.
    pub fn abort_scan(&self) -> bool {
        let _reporting = self.shared.reporting.lock();
        let Some(scan) = self.shared.active.lock().take() else {
            warn!("Cannot abort scan: no scan is in progress");
            return false;
        };

        scan.notifier.notify(ABORT);
        drop(scan.handle);
        self.shared.notify_status(WiFiScanStatus::Aborted);
        true
    }

    /// Hook for the platform's "scan done" event.
    ///
    /// # Returns
    /// `false` when no scan is running.
    pub fn on_scan_done(&self) -> bool {
        self.shared.notify_task(CHANNEL_DONE)
    }

    /// Hook for a scan failure reported asynchronously by the platform.
    pub fn on_scan_error(&self) -> bool {
        self.shared.notify_task(SCAN_ERROR)
    }

    /// Hook for the platform's "station stopped" event.
    pub fn on_sta_stopped(&self) -> bool {
        self.shared.notify_task(WIFI_DISABLED)
    }

    /// Registers a status handler and returns its handle.
    pub fn register_status_changed_handler(
        &self,
        handler: impl Fn(WiFiScanStatus) + Send + Sync + 'static,
    ) -> u64 {
        let handle = self.shared.next_handle.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .shared
            .status_handlers
            .lock()
            .insert(handle, Arc::new(handler));
        handle
    }

    /// Removes a status handler; unknown handles are ignored.
    pub fn unregister_status_changed_handler(&self, handle: u64) -> bool {
        self.shared.status_handlers.lock().remove(&handle).is_some()
    }

    /// Registers a discovery handler and returns its handle.
    pub fn register_networks_discovered_handler(
        &self,
        handler: impl Fn(&[WiFiNetwork]) + Send + Sync + 'static,
    ) -> u64 {
        let handle = self.shared.next_handle.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .shared
            .network_handlers
            .lock()
            .insert(handle, Arc::new(handler));
        handle
    }

    /// Removes a discovery handler; unknown handles are ignored.
    pub fn unregister_networks_discovered_handler(&self, handle: u64) -> bool {
        self.shared.network_handlers.lock().remove(&handle).is_some()
    }
}

impl Drop for WiFiScanManager {
    fn drop(&mut self) {
        if let Some(scan) = self.shared.active.lock().take() {
            scan.notifier.notify(ABORT);
        }
    }
}
