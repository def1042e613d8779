//! Staged over-the-air firmware updates.
//!
//! The [`OtaUpdateManager`] owns a worker thread that wakes on WiFi and
//! update-request events (or every few seconds), decides whether to look for
//! new firmware, and runs the install:
//!
//! 1. persist a fresh update id and step `Updating`
//! 2. fetch the release manifest from the firmware CDN
//! 3. flash the static filesystem, then the application image, checking each
//!    against the SHA-256 from the release manifest
//! 4. persist step `Updated` and restart
//!
//! On the next boot the step tells what happened: `Updated` means the new
//! image is running for the first time (it moves to `Validating` until the
//! application calls [`OtaUpdateManager::validate_app`]); `Validating` or
//! `RollingBack` means the bootloader fell back to the old image.
//!
//! Persisting a step on the boot path is critical. When that fails the
//! operation returns [`OtaError::Fatal`] and the caller is expected to
//! restart the device.

use crate::clock::Clock;
use crate::config::{ConfigError, ConfigStore};
use crate::consts::{DEFAULT_FW_CDN_DOMAIN, OTA_TASK_WAKE_MS};
use crate::http::{DownloadSink, HttpClient, RequestError, TransportFactory};
use crate::notify::TaskNotifier;
use core::fmt;
use core::str::FromStr;
use log::{debug, error, info};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const UPDATE_REQUESTED: u32 = 1 << 0;
/// Takes priority over `WIFI_CONNECTED` when both are set.
const WIFI_DISCONNECTED: u32 = 1 << 1;
const WIFI_CONNECTED: u32 = 1 << 2;
const TASK_STOP: u32 = 1 << 3;

const TEXT_HEADERS: &[(&str, &str)] = &[("Accept", "text/plain")];
const TEXT_CODES: &[u16] = &[200, 304];
const BINARY_CODES: &[u16] = &[200];

/// Errors of the update machinery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OtaError {
    /// Reading or writing the persisted update state failed.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    /// A CDN request failed.
    #[error("request failed: {0}")]
    Request(#[from] RequestError),
    /// A version string did not parse.
    #[error("invalid version {0:?}")]
    InvalidVersion(String),
    /// The hash manifest is malformed or incomplete.
    #[error("invalid hash manifest: {0}")]
    InvalidManifest(&'static str),
    /// The target partition does not exist.
    #[error("partition not found")]
    PartitionNotFound,
    /// Writing or verifying a partition failed.
    #[error("flash error: {0}")]
    Flash(&'static str),
    /// A downloaded image does not match its manifest hash.
    #[error("image hash mismatch")]
    HashMismatch,
    /// The gateway could not be told about the install.
    #[error("failed to report install progress")]
    Report,
    /// Boot state could not be recorded; the device must restart.
    #[error("fatal: {0}")]
    Fatal(&'static str),
}

/// A semantic version, `major.minor.patch[-prerelease][+build]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SemVer {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
    /// Patch version.
    pub patch: u16,
    /// Pre-release identifiers, without the leading `-`.
    pub prerelease: String,
    /// Build metadata, without the leading `+`.
    pub build: String,
}

impl SemVer {
    /// A release version without pre-release or build parts.
    pub fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
            ..Self::default()
        }
    }
}

fn parse_numeric(part: &str) -> Option<u16> {
    let leading_zero = part.len() > 1 && part.starts_with('0');
    if part.is_empty() || leading_zero || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

fn valid_identifiers(part: &str) -> bool {
    part.split('.').all(|id| {
        !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

impl FromStr for SemVer {
    type Err = OtaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || OtaError::InvalidVersion(s.to_owned());

        let (rest, build) = match s.split_once('+') {
            Some((rest, build)) if valid_identifiers(build) => (rest, build),
            Some(_) => return Err(invalid()),
            None => (s, ""),
        };
        let (core, prerelease) = match rest.split_once('-') {
            Some((core, pre)) if valid_identifiers(pre) => (core, pre),
            Some(_) => return Err(invalid()),
            None => (rest, ""),
        };

        let mut parts = core.split('.');
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        Ok(Self {
            major: parse_numeric(major).ok_or_else(invalid)?,
            minor: parse_numeric(minor).ok_or_else(invalid)?,
            patch: parse_numeric(patch).ok_or_else(invalid)?,
            prerelease: prerelease.to_owned(),
            build: build.to_owned(),
        })
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.prerelease.is_empty() {
            write!(f, "-{}", self.prerelease)?;
        }
        if !self.build.is_empty() {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}

/// Release channel followed by automatic checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OtaUpdateChannel {
    /// Tested releases.
    #[default]
    Stable,
    /// Release candidates.
    Beta,
    /// Builds of the development branch.
    Develop,
}

impl OtaUpdateChannel {
    /// Name used in CDN paths.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Develop => "develop",
        }
    }
}

/// Persisted progress of an update across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OtaUpdateStep {
    /// No update in flight.
    #[default]
    None,
    /// Partitions are being written.
    Updating,
    /// The new image was flashed and marked bootable.
    Updated,
    /// The new image booted and awaits validation.
    Validating,
    /// The new image was accepted.
    Validated,
    /// The new image was rejected.
    RollingBack,
}

/// How the running image came to be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareBootType {
    /// Ordinary boot.
    Normal,
    /// First boot after an update.
    NewFirmware,
    /// The bootloader fell back to the previous image.
    Rollback,
}

impl From<OtaUpdateStep> for FirmwareBootType {
    fn from(step: OtaUpdateStep) -> Self {
        match step {
            OtaUpdateStep::Updated => Self::NewFirmware,
            OtaUpdateStep::Validating | OtaUpdateStep::RollingBack => Self::Rollback,
            _ => Self::Normal,
        }
    }
}

/// Stage reported in install progress messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OtaInstallProgressTask {
    /// Downloading the release manifest.
    FetchingMetadata,
    /// Shutting down services that use the filesystem.
    PreparingForInstall,
    /// Writing the filesystem image.
    FlashingFilesystem,
    /// Mounting the new filesystem.
    VerifyingFilesystem,
    /// Writing the application image.
    FlashingApplication,
    /// Switching the boot partition.
    MarkingApplicationBootable,
    /// About to restart.
    Rebooting,
}

/// Persisted OTA settings and state.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OtaUpdateConfig {
    /// Master switch for update checks.
    pub is_enabled: bool,
    /// Host serving firmware images.
    pub cdn_domain: String,
    /// Channel followed by automatic checks.
    pub update_channel: OtaUpdateChannel,
    /// Check once after boot.
    pub check_on_startup: bool,
    /// Check every [`OtaUpdateConfig::check_interval`] minutes.
    pub check_periodically: bool,
    /// Minutes between periodic checks.
    pub check_interval: u16,
    /// Whether the backend may request installs.
    pub allow_backend_management: bool,
    /// Found updates wait for approval instead of installing.
    pub require_manual_approval: bool,
    /// Id of the last started install.
    pub update_id: u32,
    /// Progress of the last started install.
    pub update_step: OtaUpdateStep,
}

impl Default for OtaUpdateConfig {
    fn default() -> Self {
        Self {
            is_enabled: true,
            cdn_domain: DEFAULT_FW_CDN_DOMAIN.into(),
            update_channel: OtaUpdateChannel::Stable,
            check_on_startup: false,
            check_periodically: false,
            check_interval: 30,
            allow_backend_management: true,
            require_manual_approval: false,
            update_id: 0,
            update_step: OtaUpdateStep::None,
        }
    }
}

/// Build-time facts and timeouts of the updater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaSettings {
    /// Version of the running image.
    pub current_version: SemVer,
    /// Board name used in CDN paths.
    pub board: String,
    /// Worker wake-up period without events.
    pub wake_interval_ms: u64,
    /// Timeout for manifest requests.
    pub request_timeout_ms: u32,
    /// Timeout for a whole image download.
    pub flash_timeout_ms: u32,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            current_version: env!("CARGO_PKG_VERSION").parse().unwrap_or_default(),
            board: String::new(),
            wake_interval_ms: OTA_TASK_WAKE_MS,
            request_timeout_ms: 10_000,
            flash_timeout_ms: 300_000,
        }
    }
}

/// Everything needed to install one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRelease {
    /// Released version.
    pub version: SemVer,
    /// Application image URL.
    pub app_binary_url: String,
    /// SHA-256 of the application image.
    pub app_binary_hash: [u8; 32],
    /// Filesystem image URL.
    pub filesystem_binary_url: String,
    /// SHA-256 of the filesystem image.
    pub filesystem_binary_hash: [u8; 32],
}

/// `https://{cdn}/version-{channel}.txt`
pub fn channel_version_url(cdn: &str, channel: OtaUpdateChannel) -> String {
    format!("https://{cdn}/version-{}.txt", channel.as_str())
}

/// `https://{cdn}/{version}/boards.txt`
pub fn boards_index_url(cdn: &str, version: &SemVer) -> String {
    format!("https://{cdn}/{version}/boards.txt")
}

/// `https://{cdn}/{version}/{board}/{file}`
pub fn artifact_url(cdn: &str, version: &SemVer, board: &str, file: &str) -> String {
    format!("https://{cdn}/{version}/{board}/{file}")
}

/// Trimmed, non-empty lines of a plain-text list.
pub fn parse_string_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_hash(text: &str) -> Option<[u8; 32]> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(text, &mut out).ok()?;
    Some(out)
}

/// Parses a `hashes.sha256.txt` manifest.
///
/// Each non-empty line is `<64 hex digits> <file>`, where the file may carry
/// a `./` prefix. Entries for other files are ignored.
///
/// # Returns
/// The hashes of `app.bin` and `staticfs.bin`, in that order.
pub fn parse_hash_manifest(text: &str) -> Result<([u8; 32], [u8; 32]), OtaError> {
    let mut app = None;
    let mut filesystem = None;

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut parts = line.split_whitespace();
        let (Some(hash), Some(file), None) = (parts.next(), parts.next(), parts.next()) else {
            error!("Invalid hashes entry: {line}");
            return Err(OtaError::InvalidManifest("malformed entry"));
        };
        let file = file.strip_prefix("./").unwrap_or(file);

        if hash.len() != 64 {
            error!("Invalid hash: {hash}");
            return Err(OtaError::InvalidManifest("wrong hash length"));
        }

        let slot = match file {
            "app.bin" => &mut app,
            "staticfs.bin" => &mut filesystem,
            _ => continue,
        };
        if slot.is_some() {
            error!("Duplicate hash for {file}");
            return Err(OtaError::InvalidManifest("duplicate entry"));
        }
        *slot = Some(parse_hash(hash).ok_or(OtaError::InvalidManifest("hash is not hex"))?);
    }

    match (app, filesystem) {
        (Some(app), Some(filesystem)) => Ok((app, filesystem)),
        (None, _) => Err(OtaError::InvalidManifest("missing app.bin")),
        (_, None) => Err(OtaError::InvalidManifest("missing staticfs.bin")),
    }
}

/// Whether the worker should look for an update now.
///
/// # Arguments
/// - `last_check_ms`: time of the previous check, `None` before the first
/// - `update_requested`: an install was requested since the last check
pub fn should_check(
    config: &OtaUpdateConfig,
    last_check_ms: Option<i64>,
    now_ms: i64,
    update_requested: bool,
) -> bool {
    let first_check = last_check_ms.is_none();
    let diff_mins = (now_ms - last_check_ms.unwrap_or(0)) / 60_000;

    (config.check_on_startup && first_check)
        || (config.check_periodically && diff_mins >= i64::from(config.check_interval))
        || (update_requested && (first_check || diff_mins >= 1))
}

/// Flash partitions an update writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OtaPartition {
    /// The inactive application slot.
    App,
    /// The static web filesystem.
    Filesystem,
}

/// Sequential writer for one partition.
pub trait PartitionWriter: Send {
    /// Erases room for an image of `len` bytes.
    fn begin(&mut self, len: usize) -> Result<(), OtaError>;
    /// Writes `data` at byte `offset` of the image.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), OtaError>;
    /// Seals the partition once the whole image checked out.
    fn finish(&mut self) -> Result<(), OtaError>;
}

/// Boot, flash and restart services of the platform.
pub trait OtaPlatform: Send + Sync {
    /// Whether the running image still awaits validation by the bootloader.
    fn is_pending_verify(&self) -> bool;
    /// A random update id.
    fn random_u32(&self) -> u32;
    /// Opens `partition` for writing.
    fn open_partition(&self, partition: OtaPartition) -> Option<Box<dyn PartitionWriter>>;
    /// Stops services that use the filesystem; `false` on timeout.
    fn prepare_install(&self) -> bool;
    /// Mounts the freshly written filesystem as a smoke test.
    fn verify_filesystem(&self) -> bool;
    /// Boots from the freshly written application partition next time.
    fn set_boot_partition(&self) -> Result<(), OtaError>;
    /// Cancels the bootloader's pending rollback.
    fn mark_app_valid(&self) -> Result<(), OtaError>;
    /// Marks the running image invalid and reboots into the previous one.
    ///
    /// Only returns on failure.
    fn rollback_and_restart(&self) -> Result<(), OtaError>;
    /// Restarts the device.
    fn restart(&self);
}

/// Gateway messages about an install.
pub trait OtaReporter: Send + Sync {
    /// An install of `version` has begun.
    fn install_started(&self, update_id: u32, version: &SemVer) -> bool;
    /// Progress of one stage, from 0 to 1.
    fn install_progress(&self, update_id: u32, task: OtaInstallProgressTask, progress: f32) -> bool;
    /// The install failed.
    fn install_failed(&self, update_id: u32, message: &str, fatal: bool);
}

/// Streams an image into a partition, hashing it and reporting progress per
/// chunk.
struct PartitionSink<'a> {
    writer: &'a mut dyn PartitionWriter,
    reporter: &'a dyn OtaReporter,
    update_id: u32,
    task: OtaInstallProgressTask,
    total: Option<usize>,
    hasher: Sha256,
    error: Option<OtaError>,
}

impl DownloadSink for PartitionSink<'_> {
    fn on_content_length(&mut self, len: usize) -> bool {
        match self.writer.begin(len) {
            Ok(()) => {
                self.total = Some(len);
                true
            }
            Err(e) => {
                self.error = Some(e);
                false
            }
        }
    }

    fn on_chunk(&mut self, offset: usize, data: &[u8]) -> bool {
        let Some(total) = self.total else {
            error!("Firmware image has no Content-Length");
            self.error = Some(OtaError::Flash("image length unknown"));
            return false;
        };
        if let Err(e) = self.writer.write(offset, data) {
            self.error = Some(e);
            return false;
        }
        self.hasher.update(data);

        let current = offset + data.len();
        let progress = current as f32 / total as f32;
        debug!("{:?}: {current} / {total} ({:.2}%)", self.task, progress * 100.0);
        let _ = self.reporter.install_progress(self.update_id, self.task, progress);
        true
    }
}

struct Inner<F> {
    config: Arc<dyn ConfigStore>,
    http: Arc<HttpClient<F>>,
    platform: Arc<dyn OtaPlatform>,
    reporter: Arc<dyn OtaReporter>,
    clock: Arc<dyn Clock>,
    settings: OtaSettings,
    notifier: TaskNotifier,
    requested: Mutex<Option<SemVer>>,
    boot_type: FirmwareBootType,
    pending_verify: AtomicBool,
}

impl<F: TransportFactory> Inner<F> {
    fn firmware_version(&self, cdn: &str, channel: OtaUpdateChannel) -> Result<SemVer, OtaError> {
        let url = channel_version_url(cdn, channel);
        debug!("Fetching firmware version from {url}");

        let res = self
            .http
            .get_string(&url, TEXT_HEADERS, TEXT_CODES, self.settings.request_timeout_ms)?;
        res.data.trim().parse()
    }

    fn firmware_boards(&self, cdn: &str, version: &SemVer) -> Result<Vec<String>, OtaError> {
        let url = boards_index_url(cdn, version);
        debug!("Fetching firmware boards from {url}");

        let res = self
            .http
            .get_string(&url, TEXT_HEADERS, TEXT_CODES, self.settings.request_timeout_ms)?;
        Ok(parse_string_list(&res.data))
    }

    fn firmware_release(&self, cdn: &str, version: &SemVer) -> Result<FirmwareRelease, OtaError> {
        let board = &self.settings.board;
        let url = artifact_url(cdn, version, board, "hashes.sha256.txt");

        let res = self
            .http
            .get_string(&url, TEXT_HEADERS, TEXT_CODES, self.settings.request_timeout_ms)?;
        let (app_hash, fs_hash) = parse_hash_manifest(&res.data)?;

        Ok(FirmwareRelease {
            version: version.clone(),
            app_binary_url: artifact_url(cdn, version, board, "app.bin"),
            app_binary_hash: app_hash,
            filesystem_binary_url: artifact_url(cdn, version, board, "staticfs.bin"),
            filesystem_binary_hash: fs_hash,
        })
    }

    fn progress(&self, update_id: u32, task: OtaInstallProgressTask) -> Result<(), OtaError> {
        if self.reporter.install_progress(update_id, task, 0.0) {
            Ok(())
        } else {
            error!("Failed to send OTA install progress message");
            Err(OtaError::Report)
        }
    }

    fn fail(&self, update_id: u32, message: &'static str, e: OtaError) -> OtaError {
        error!("{message}: {e}");
        self.reporter.install_failed(update_id, message, false);
        e
    }

    fn flash(
        &self,
        writer: &mut dyn PartitionWriter,
        url: &str,
        hash: &[u8; 32],
        update_id: u32,
        task: OtaInstallProgressTask,
    ) -> Result<(), OtaError> {
        let mut sink = PartitionSink {
            writer: &mut *writer,
            reporter: self.reporter.as_ref(),
            update_id,
            task,
            total: None,
            hasher: Sha256::new(),
            error: None,
        };

        let res = self
            .http
            .download(url, &[], BINARY_CODES, &mut sink, self.settings.flash_timeout_ms);
        let PartitionSink { hasher, error, .. } = sink;
        if let Some(e) = error {
            return Err(e);
        }
        let _ = res?;

        let digest = hasher.finalize();
        if digest.as_slice() != hash {
            error!(
                "Image hash mismatch: expected {}, got {}",
                hex::encode(hash),
                hex::encode(digest)
            );
            return Err(OtaError::HashMismatch);
        }

        writer.finish()
    }

    fn install(&self, config: &OtaUpdateConfig, version: &SemVer) -> Result<(), OtaError> {
        use OtaInstallProgressTask::*;

        let update_id = self.platform.random_u32();
        self.config.set_ota_update_id(update_id)?;
        self.config.set_ota_update_step(OtaUpdateStep::Updating)?;

        if !self.reporter.install_started(update_id, version) {
            error!("Failed to send OTA install started message");
            return Err(OtaError::Report);
        }
        self.progress(update_id, FetchingMetadata)?;

        let release = self
            .firmware_release(&config.cdn_domain, version)
            .map_err(|e| self.fail(update_id, "Failed to fetch firmware release", e))?;

        debug!("Firmware release:");
        debug!("  Version:                {}", release.version);
        debug!("  App binary URL:         {}", release.app_binary_url);
        debug!("  App binary hash:        {}", hex::encode(release.app_binary_hash));
        debug!("  Filesystem binary URL:  {}", release.filesystem_binary_url);
        debug!("  Filesystem binary hash: {}", hex::encode(release.filesystem_binary_hash));

        let mut app = self.platform.open_partition(OtaPartition::App).ok_or_else(|| {
            self.fail(update_id, "Failed to get app update partition", OtaError::PartitionNotFound)
        })?;
        let mut filesystem = self
            .platform
            .open_partition(OtaPartition::Filesystem)
            .ok_or_else(|| {
                self.fail(update_id, "Failed to find filesystem partition", OtaError::PartitionNotFound)
            })?;

        self.progress(update_id, PreparingForInstall)?;
        if !self.platform.prepare_install() {
            return Err(self.fail(
                update_id,
                "Failed to stop services before install (timed out)",
                OtaError::Flash("prepare timed out"),
            ));
        }

        self.progress(update_id, FlashingFilesystem)?;
        self.flash(
            &mut *filesystem,
            &release.filesystem_binary_url,
            &release.filesystem_binary_hash,
            update_id,
            FlashingFilesystem,
        )
        .map_err(|e| self.fail(update_id, "Failed to flash filesystem partition", e))?;

        self.progress(update_id, VerifyingFilesystem)?;
        if !self.platform.verify_filesystem() {
            return Err(self.fail(
                update_id,
                "Failed to mount filesystem",
                OtaError::Flash("filesystem does not mount"),
            ));
        }

        self.progress(update_id, FlashingApplication)?;
        self.flash(
            &mut *app,
            &release.app_binary_url,
            &release.app_binary_hash,
            update_id,
            FlashingApplication,
        )
        .map_err(|e| self.fail(update_id, "Failed to flash app partition", e))?;

        self.progress(update_id, MarkingApplicationBootable)?;
        self.platform
            .set_boot_partition()
            .map_err(|e| self.fail(update_id, "Failed to set app partition bootable", e))?;

        self.config
            .set_ota_update_step(OtaUpdateStep::Updated)
            .map_err(|e| self.fail(update_id, "Failed to set OTA update step", e.into()))?;

        let _ = self.reporter.install_progress(update_id, Rebooting, 0.0);
        Ok(())
    }
}

fn ota_task<F: TransportFactory>(inner: Arc<Inner<F>>) {
    debug!("OTA update task started");

    let wake = Duration::from_millis(inner.settings.wake_interval_ms);
    let mut connected = false;
    let mut update_requested = false;
    let mut last_check: Option<i64> = None;

    loop {
        let bits = inner.notifier.wait(wake).unwrap_or(0);
        if bits & TASK_STOP != 0 {
            break;
        }

        update_requested |= bits & UPDATE_REQUESTED != 0;

        if bits & WIFI_DISCONNECTED != 0 {
            debug!("WiFi disconnected");
            connected = false;
            continue;
        }
        if bits & WIFI_CONNECTED != 0 && !connected {
            debug!("WiFi connected");
            connected = true;
        }
        if !connected {
            continue;
        }

        let config = match inner.config.ota_update_config() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to get OTA update config: {e}");
                continue;
            }
        };
        if !config.is_enabled {
            debug!("OTA updates are disabled, skipping update check");
            continue;
        }

        let now = inner.clock.now_ms();
        if !should_check(&config, last_check, now, update_requested) {
            continue;
        }
        last_check = Some(now);

        if config.require_manual_approval {
            debug!("Manual approval required, skipping update check");
            continue;
        }

        let version = if update_requested {
            update_requested = false;
            let Some(version) = inner.requested.lock().take() else {
                error!("Update requested without a version");
                continue;
            };
            debug!("Update requested for version {version}");
            version
        } else {
            debug!("Checking for updates");
            match inner.firmware_version(&config.cdn_domain, config.update_channel) {
                Ok(version) => {
                    debug!("Remote version: {version}");
                    version
                }
                Err(e) => {
                    error!("Failed to fetch firmware version: {e}");
                    continue;
                }
            }
        };

        if version == inner.settings.current_version {
            info!("Requested version is already installed");
            continue;
        }

        match inner.install(&config, &version) {
            Ok(()) => {
                info!("Restarting into new firmware...");
                inner.platform.restart();
                break;
            }
            Err(e) => error!("Firmware installation failed: {e}"),
        }
    }

    debug!("OTA update task stopped");
}

/// Owner of the update worker and the boot-time update state.
pub struct OtaUpdateManager<F> {
    inner: Arc<Inner<F>>,
    task: Option<JoinHandle<()>>,
}

impl<F> fmt::Debug for OtaUpdateManager<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtaUpdateManager")
            .field("settings", &self.inner.settings)
            .field("boot_type", &self.inner.boot_type)
            .field("notifier", &self.inner.notifier)
            .finish_non_exhaustive()
    }
}

impl<F: TransportFactory + 'static> OtaUpdateManager<F> {
    /// Reads the boot state and starts the update worker.
    ///
    /// A first boot into new firmware advances the persisted step from
    /// `Updated` to `Validating`.
    ///
    /// # Returns
    /// [`OtaError::Fatal`] when that step cannot be persisted.
    pub fn init(
        config: Arc<dyn ConfigStore>,
        http: Arc<HttpClient<F>>,
        platform: Arc<dyn OtaPlatform>,
        reporter: Arc<dyn OtaReporter>,
        clock: Arc<dyn Clock>,
        settings: OtaSettings,
    ) -> Result<Self, OtaError> {
        debug!("Fetching previous update step");
        let step = config.ota_update_config()?.update_step;
        let boot_type = FirmwareBootType::from(step);

        if step == OtaUpdateStep::Updated {
            config
                .set_ota_update_step(OtaUpdateStep::Validating)
                .map_err(|e| {
                    error!("Failed to set OTA update step in critical section: {e}");
                    OtaError::Fatal("failed to persist update step")
                })?;
        }

        let inner = Arc::new(Inner {
            pending_verify: AtomicBool::new(platform.is_pending_verify()),
            config,
            http,
            platform,
            reporter,
            clock,
            settings,
            notifier: TaskNotifier::new(),
            requested: Mutex::new(None),
            boot_type,
        });

        let worker = Arc::clone(&inner);
        let task = thread::Builder::new()
            .name("ota-update".into())
            .spawn(move || ota_task(worker))
            .map_err(|e| {
                error!("Failed to start OTA update task: {e}");
                OtaError::Fatal("failed to start update task")
            })?;

        Ok(Self {
            inner,
            task: Some(task),
        })
    }

    /// Latest version published on `channel`.
    pub fn firmware_version(&self, channel: OtaUpdateChannel) -> Result<SemVer, OtaError> {
        let cdn = self.inner.config.ota_update_config()?.cdn_domain;
        self.inner.firmware_version(&cdn, channel)
    }

    /// Boards `version` was built for.
    pub fn firmware_boards(&self, version: &SemVer) -> Result<Vec<String>, OtaError> {
        let cdn = self.inner.config.ota_update_config()?.cdn_domain;
        self.inner.firmware_boards(&cdn, version)
    }

    /// Image URLs and hashes of `version` for this board.
    pub fn firmware_release(&self, version: &SemVer) -> Result<FirmwareRelease, OtaError> {
        let cdn = self.inner.config.ota_update_config()?.cdn_domain;
        self.inner.firmware_release(&cdn, version)
    }
}

impl<F> OtaUpdateManager<F> {
    /// Asks the worker to install `version` at its next check.
    pub fn request_firmware_installation(&self, version: SemVer) {
        debug!("Requesting firmware version {version}");
        *self.inner.requested.lock() = Some(version);
        self.inner.notifier.notify(UPDATE_REQUESTED);
    }

    /// Hook for "station got an IP address".
    pub fn on_wifi_connected(&self) {
        self.inner.notifier.notify(WIFI_CONNECTED);
    }

    /// Hook for "station disconnected".
    pub fn on_wifi_disconnected(&self) {
        self.inner.notifier.notify(WIFI_DISCONNECTED);
    }

    /// How this boot came about.
    pub fn boot_type(&self) -> FirmwareBootType {
        self.inner.boot_type
    }

    /// Whether the running image still needs [`Self::validate_app`].
    pub fn is_validating_app(&self) -> bool {
        self.inner.pending_verify.load(Ordering::SeqCst)
    }

    /// Accepts the running image.
    ///
    /// # Returns
    /// [`OtaError::Fatal`] if the image could not be marked valid or the
    /// `Validated` step could not be persisted.
    pub fn validate_app(&self) -> Result<(), OtaError> {
        self.inner.platform.mark_app_valid().map_err(|e| {
            error!("Unable to mark app as valid: {e}");
            OtaError::Fatal("failed to mark app valid")
        })?;

        self.inner
            .config
            .set_ota_update_step(OtaUpdateStep::Validated)
            .map_err(|e| {
                error!("Failed to set OTA update step in critical section: {e}");
                OtaError::Fatal("failed to persist update step")
            })?;

        self.inner.pending_verify.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Rejects the running image and reboots into the previous one.
    ///
    /// If the platform cannot roll back, the step is reset and the device
    /// restarts anyway.
    pub fn invalidate_and_rollback(&self) -> Result<(), OtaError> {
        self.inner
            .config
            .set_ota_update_step(OtaUpdateStep::RollingBack)
            .map_err(|e| {
                error!("Failed to set OTA update step in critical section: {e}");
                OtaError::Fatal("failed to persist update step")
            })?;

        if let Err(e) = self.inner.platform.rollback_and_restart() {
            error!("Rollback failed: {e}");
        }

        if let Err(e) = self.inner.config.set_ota_update_step(OtaUpdateStep::None) {
            error!("Failed to set OTA update step: {e}");
        }

        self.inner.platform.restart();
        Ok(())
    }
}

impl<F> Drop for OtaUpdateManager<F> {
    fn drop(&mut self) {
        self.inner.notifier.notify(TASK_STOP);
        if let Some(task) = self.task.take() {
            let _ = task.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{MemoryConfigStore, RfConfig};
    use crate::http::{ByteStream, HttpTransport, TransportError};
    use crate::ratelimit::{RateLimitPolicy, RateLimiterRegistry};
    use crate::testing::{init_logging, wait_until};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    const VERSION: &str = "1.4.0";
    const BOARD: &str = "wemos-d1-mini-esp32";

    fn hash_line(byte: u8, file: &str) -> String {
        format!("{} {file}\n", hex::encode([byte; 32]))
    }

    fn app_image() -> Vec<u8> {
        vec![0xA5; 3000]
    }

    fn fs_image() -> Vec<u8> {
        vec![0x5A; 1200]
    }

    /// A manifest matching the served images.
    fn release_manifest() -> String {
        format!(
            "{} ./app.bin\n{} ./staticfs.bin\n",
            hex::encode(Sha256::digest(app_image())),
            hex::encode(Sha256::digest(fs_image()))
        )
    }

    /// Serves a fixed set of URLs with a declared length.
    struct CdnTransport {
        files: Arc<HashMap<String, Vec<u8>>>,
        body: Vec<u8>,
        pos: usize,
        found: bool,
    }

    impl ByteStream for CdnTransport {
        fn connected(&self) -> bool {
            self.pos < self.body.len()
        }

        fn read_available(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError> {
            let n = buf.len().min(self.body.len() - self.pos).min(512);
            buf[..n].copy_from_slice(&self.body[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl HttpTransport for CdnTransport {
        fn begin(&mut self, url: &str, _user_agent: &str) -> Result<(), TransportError> {
            if let Some(body) = self.files.get(url) {
                self.body = body.clone();
                self.found = true;
            }
            Ok(())
        }

        fn get(&mut self, _headers: &[(&str, &str)]) -> Result<u16, TransportError> {
            Ok(if self.found { 200 } else { 404 })
        }

        fn header(&self, _name: &str) -> Option<String> {
            None
        }

        fn content_length(&self) -> Option<usize> {
            Some(self.body.len())
        }
    }

    type CdnFactory = Box<dyn Fn() -> CdnTransport + Send + Sync>;

    fn cdn(files: &[(String, Vec<u8>)]) -> Arc<HttpClient<CdnFactory>> {
        let files: Arc<HashMap<_, _>> = Arc::new(files.iter().cloned().collect());
        let factory: CdnFactory = Box::new(move || CdnTransport {
            files: Arc::clone(&files),
            body: Vec::new(),
            pos: 0,
            found: false,
        });
        let limits = RateLimiterRegistry::new(RateLimitPolicy::default(), Arc::new(ManualClock::new(0)));
        Arc::new(HttpClient::new(factory, Arc::new(limits)))
    }

    fn release_files(manifest: String) -> Vec<(String, Vec<u8>)> {
        let version: SemVer = VERSION.parse().unwrap();
        vec![
            (
                artifact_url(DEFAULT_FW_CDN_DOMAIN, &version, BOARD, "hashes.sha256.txt"),
                manifest.into_bytes(),
            ),
            (
                artifact_url(DEFAULT_FW_CDN_DOMAIN, &version, BOARD, "app.bin"),
                app_image(),
            ),
            (
                artifact_url(DEFAULT_FW_CDN_DOMAIN, &version, BOARD, "staticfs.bin"),
                fs_image(),
            ),
            (
                channel_version_url(DEFAULT_FW_CDN_DOMAIN, OtaUpdateChannel::Stable),
                format!("{VERSION}\n").into_bytes(),
            ),
            (
                boards_index_url(DEFAULT_FW_CDN_DOMAIN, &version),
                format!("{BOARD}\n\n  seeed-xiao-esp32c3 \n").into_bytes(),
            ),
        ]
    }

    #[derive(Default)]
    struct Flashed {
        bytes: Mutex<HashMap<&'static str, Vec<u8>>>,
        finished: Mutex<Vec<&'static str>>,
    }

    struct FakeWriter {
        name: &'static str,
        flashed: Arc<Flashed>,
    }

    impl PartitionWriter for FakeWriter {
        fn begin(&mut self, len: usize) -> Result<(), OtaError> {
            let _ = self
                .flashed
                .bytes
                .lock()
                .insert(self.name, Vec::with_capacity(len));
            Ok(())
        }

        fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), OtaError> {
            let mut bytes = self.flashed.bytes.lock();
            let image = bytes.entry(self.name).or_default();
            assert_eq!(image.len(), offset);
            image.extend_from_slice(data);
            Ok(())
        }

        fn finish(&mut self) -> Result<(), OtaError> {
            self.flashed.finished.lock().push(self.name);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakePlatform {
        flashed: Arc<Flashed>,
        restarts: AtomicUsize,
        rollbacks: AtomicUsize,
        valid: AtomicBool,
        fail_mark_valid: bool,
    }

    impl OtaPlatform for FakePlatform {
        fn is_pending_verify(&self) -> bool {
            true
        }

        fn random_u32(&self) -> u32 {
            0xC0FFEE
        }

        fn open_partition(&self, partition: OtaPartition) -> Option<Box<dyn PartitionWriter>> {
            let name = match partition {
                OtaPartition::App => "app",
                OtaPartition::Filesystem => "fs",
            };
            Some(Box::new(FakeWriter {
                name,
                flashed: Arc::clone(&self.flashed),
            }))
        }

        fn prepare_install(&self) -> bool {
            true
        }

        fn verify_filesystem(&self) -> bool {
            true
        }

        fn set_boot_partition(&self) -> Result<(), OtaError> {
            Ok(())
        }

        fn mark_app_valid(&self) -> Result<(), OtaError> {
            if self.fail_mark_valid {
                return Err(OtaError::Flash("otadata"));
            }
            self.valid.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn rollback_and_restart(&self) -> Result<(), OtaError> {
            let _ = self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Err(OtaError::Flash("no previous image"))
        }

        fn restart(&self) {
            let _ = self.restarts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeReporter {
        started: Mutex<Vec<(u32, SemVer)>>,
        tasks: Mutex<Vec<OtaInstallProgressTask>>,
        failures: Mutex<Vec<String>>,
    }

    impl OtaReporter for FakeReporter {
        fn install_started(&self, update_id: u32, version: &SemVer) -> bool {
            self.started.lock().push((update_id, version.clone()));
            true
        }

        fn install_progress(&self, _id: u32, task: OtaInstallProgressTask, _p: f32) -> bool {
            let mut tasks = self.tasks.lock();
            if tasks.last() != Some(&task) {
                tasks.push(task);
            }
            true
        }

        fn install_failed(&self, _id: u32, message: &str, _fatal: bool) {
            self.failures.lock().push(message.to_owned());
        }
    }

    struct Harness {
        store: Arc<MemoryConfigStore>,
        platform: Arc<FakePlatform>,
        reporter: Arc<FakeReporter>,
        manager: OtaUpdateManager<CdnFactory>,
    }

    fn harness(step: OtaUpdateStep, files: Vec<(String, Vec<u8>)>) -> Harness {
        harness_with(step, files, FakePlatform::default())
    }

    fn harness_with(step: OtaUpdateStep, files: Vec<(String, Vec<u8>)>, platform: FakePlatform) -> Harness {
        let ota = OtaUpdateConfig {
            update_step: step,
            ..OtaUpdateConfig::default()
        };
        let store = Arc::new(MemoryConfigStore::new(RfConfig::default(), ota));
        let platform = Arc::new(platform);
        let reporter = Arc::new(FakeReporter::default());
        let settings = OtaSettings {
            current_version: SemVer::new(1, 3, 0),
            board: BOARD.into(),
            ..OtaSettings::default()
        };

        let manager = OtaUpdateManager::init(
            store.clone(),
            cdn(&files),
            platform.clone(),
            reporter.clone(),
            Arc::new(ManualClock::new(0)),
            settings,
        )
        .unwrap();

        Harness {
            store,
            platform,
            reporter,
            manager,
        }
    }

    #[test]
    fn test_semver_parse_and_display() {
        let v: SemVer = "1.2.3-beta.1+build.42".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 2, 3));
        assert_eq!(v.prerelease, "beta.1");
        assert_eq!(v.build, "build.42");
        assert_eq!(v.to_string(), "1.2.3-beta.1+build.42");
        assert_eq!(SemVer::new(0, 10, 7).to_string(), "0.10.7");

        for bad in ["", "1.2", "1.2.3.4", "01.2.3", "1.2.x", "1.2.3-", "1.2.3+", "1.2.3-be..ta"] {
            assert!(bad.parse::<SemVer>().is_err(), "{bad:?} parsed");
        }
    }

    #[test]
    fn test_cdn_urls() {
        let v = SemVer::new(1, 4, 0);
        assert_eq!(
            channel_version_url("cdn.test", OtaUpdateChannel::Beta),
            "https://cdn.test/version-beta.txt"
        );
        assert_eq!(boards_index_url("cdn.test", &v), "https://cdn.test/1.4.0/boards.txt");
        assert_eq!(
            artifact_url("cdn.test", &v, "board", "app.bin"),
            "https://cdn.test/1.4.0/board/app.bin"
        );
    }

    #[test]
    fn test_hash_manifest() {
        let manifest = format!(
            "{}{}{}",
            hash_line(0x11, "./app.bin"),
            hash_line(0x22, "staticfs.bin"),
            hash_line(0x33, "bootloader.bin")
        );
        let (app, fs) = parse_hash_manifest(&manifest).unwrap();
        assert_eq!(app, [0x11; 32]);
        assert_eq!(fs, [0x22; 32]);

        let duplicate = format!("{manifest}{}", hash_line(0x44, "app.bin"));
        assert_eq!(
            parse_hash_manifest(&duplicate),
            Err(OtaError::InvalidManifest("duplicate entry"))
        );
        assert_eq!(
            parse_hash_manifest(&hash_line(0x11, "app.bin")),
            Err(OtaError::InvalidManifest("missing staticfs.bin"))
        );
        assert_eq!(
            parse_hash_manifest("abcd app.bin\n"),
            Err(OtaError::InvalidManifest("wrong hash length"))
        );
        assert_eq!(
            parse_hash_manifest("app.bin\n"),
            Err(OtaError::InvalidManifest("malformed entry"))
        );
        let not_hex = format!("{} app.bin\n", "zz".repeat(32));
        assert_eq!(
            parse_hash_manifest(&not_hex),
            Err(OtaError::InvalidManifest("hash is not hex"))
        );
    }

    #[test]
    fn test_should_check() {
        let mut config = OtaUpdateConfig::default();
        assert!(!should_check(&config, None, 0, false));
        assert!(should_check(&config, None, 0, true));
        assert!(!should_check(&config, Some(0), 59_999, true));
        assert!(should_check(&config, Some(0), 60_000, true));

        config.check_on_startup = true;
        assert!(should_check(&config, None, 0, false));
        assert!(!should_check(&config, Some(0), 0, false));

        config.check_periodically = true;
        assert!(!should_check(&config, Some(0), 29 * 60_000, false));
        assert!(should_check(&config, Some(0), 30 * 60_000, false));
    }

    #[test]
    fn test_boot_type_follows_step() {
        let cases = [
            (OtaUpdateStep::None, FirmwareBootType::Normal, OtaUpdateStep::None),
            (OtaUpdateStep::Updated, FirmwareBootType::NewFirmware, OtaUpdateStep::Validating),
            (OtaUpdateStep::Validating, FirmwareBootType::Rollback, OtaUpdateStep::Validating),
            (OtaUpdateStep::RollingBack, FirmwareBootType::Rollback, OtaUpdateStep::RollingBack),
            (OtaUpdateStep::Validated, FirmwareBootType::Normal, OtaUpdateStep::Validated),
        ];
        for (step, boot, persisted) in cases {
            let h = harness(step, Vec::new());
            assert_eq!(h.manager.boot_type(), boot);
            assert_eq!(h.store.ota_update_config().unwrap().update_step, persisted);
        }
    }

    #[test]
    fn test_unpersistable_boot_step_is_fatal() {
        let ota = OtaUpdateConfig {
            update_step: OtaUpdateStep::Updated,
            ..OtaUpdateConfig::default()
        };
        let store = Arc::new(MemoryConfigStore::new(RfConfig::default(), ota));
        store.set_read_only(true);

        let res = OtaUpdateManager::init(
            store,
            cdn(&[]),
            Arc::new(FakePlatform::default()),
            Arc::new(FakeReporter::default()),
            Arc::new(ManualClock::new(0)),
            OtaSettings::default(),
        );
        assert!(matches!(res, Err(OtaError::Fatal(_))));
    }

    #[test]
    fn test_validate_and_rollback() {
        let h = harness(OtaUpdateStep::Updated, Vec::new());
        assert!(h.manager.is_validating_app());
        h.manager.validate_app().unwrap();
        assert!(!h.manager.is_validating_app());
        assert!(h.platform.valid.load(Ordering::SeqCst));
        assert_eq!(h.store.ota_update_config().unwrap().update_step, OtaUpdateStep::Validated);

        h.manager.invalidate_and_rollback().unwrap();
        assert_eq!(h.platform.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(h.platform.restarts.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.ota_update_config().unwrap().update_step, OtaUpdateStep::None);

        h.store.set_read_only(true);
        assert!(matches!(h.manager.validate_app(), Err(OtaError::Fatal(_))));
        assert!(matches!(h.manager.invalidate_and_rollback(), Err(OtaError::Fatal(_))));

        let platform = FakePlatform {
            fail_mark_valid: true,
            ..FakePlatform::default()
        };
        let h = harness_with(OtaUpdateStep::Updated, Vec::new(), platform);
        assert!(matches!(h.manager.validate_app(), Err(OtaError::Fatal(_))));
        assert!(h.manager.is_validating_app());
    }

    #[test]
    fn test_cdn_queries() {
        let manifest = format!("{}{}", hash_line(1, "app.bin"), hash_line(2, "staticfs.bin"));
        let h = harness(OtaUpdateStep::None, release_files(manifest));
        let version = SemVer::new(1, 4, 0);

        assert_eq!(h.manager.firmware_version(OtaUpdateChannel::Stable), Ok(version.clone()));
        assert_eq!(
            h.manager.firmware_boards(&version).unwrap(),
            vec![BOARD.to_owned(), "seeed-xiao-esp32c3".to_owned()]
        );
        let release = h.manager.firmware_release(&version).unwrap();
        assert_eq!(release.app_binary_hash, [1; 32]);
        assert!(release.filesystem_binary_url.ends_with("/1.4.0/wemos-d1-mini-esp32/staticfs.bin"));

        assert_eq!(
            h.manager.firmware_version(OtaUpdateChannel::Develop),
            Err(OtaError::Request(RequestError::CodeRejected(404)))
        );
    }

    #[test]
    fn test_requested_update_installs_and_restarts() {
        init_logging();
        let h = harness(OtaUpdateStep::None, release_files(release_manifest()));

        h.manager.request_firmware_installation(SemVer::new(1, 4, 0));
        h.manager.on_wifi_connected();

        assert!(wait_until(Duration::from_secs(5), || {
            h.platform.restarts.load(Ordering::SeqCst) == 1
        }));

        let config = h.store.ota_update_config().unwrap();
        assert_eq!(config.update_step, OtaUpdateStep::Updated);
        assert_eq!(config.update_id, 0xC0FFEE);

        let flashed = h.platform.flashed.bytes.lock();
        assert_eq!(flashed["fs"], fs_image());
        assert_eq!(flashed["app"], app_image());
        assert_eq!(*h.platform.flashed.finished.lock(), vec!["fs", "app"]);

        use OtaInstallProgressTask::*;
        assert_eq!(*h.reporter.started.lock(), vec![(0xC0FFEE, SemVer::new(1, 4, 0))]);
        assert_eq!(
            *h.reporter.tasks.lock(),
            vec![
                FetchingMetadata,
                PreparingForInstall,
                FlashingFilesystem,
                VerifyingFilesystem,
                FlashingApplication,
                MarkingApplicationBootable,
                Rebooting
            ]
        );
        assert!(h.reporter.failures.lock().is_empty());
    }

    #[test]
    fn test_broken_manifest_reports_failure() {
        init_logging();
        let h = harness(OtaUpdateStep::None, release_files(hash_line(1, "app.bin")));

        h.manager.request_firmware_installation(SemVer::new(1, 4, 0));
        h.manager.on_wifi_connected();

        assert!(wait_until(Duration::from_secs(5), || {
            !h.reporter.failures.lock().is_empty()
        }));
        assert_eq!(
            *h.reporter.failures.lock(),
            vec!["Failed to fetch firmware release".to_owned()]
        );
        assert_eq!(h.platform.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.ota_update_config().unwrap().update_step, OtaUpdateStep::Updating);
    }

    #[test]
    fn test_corrupted_image_is_not_sealed() {
        init_logging();
        let manifest = format!(
            "{} app.bin\n{}",
            hex::encode(Sha256::digest(app_image())),
            hash_line(2, "staticfs.bin")
        );
        let h = harness(OtaUpdateStep::None, release_files(manifest));

        h.manager.request_firmware_installation(SemVer::new(1, 4, 0));
        h.manager.on_wifi_connected();

        assert!(wait_until(Duration::from_secs(5), || {
            !h.reporter.failures.lock().is_empty()
        }));
        assert_eq!(
            *h.reporter.failures.lock(),
            vec!["Failed to flash filesystem partition".to_owned()]
        );
        assert!(h.platform.flashed.finished.lock().is_empty());
        assert!(!h.platform.flashed.bytes.lock().contains_key("app"));
        assert_eq!(h.platform.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.ota_update_config().unwrap().update_step, OtaUpdateStep::Updating);
    }

    #[test]
    fn test_no_check_without_wifi() {
        let manifest = format!("{}{}", hash_line(1, "app.bin"), hash_line(2, "staticfs.bin"));
        let h = harness(OtaUpdateStep::None, release_files(manifest));

        h.manager.request_firmware_installation(SemVer::new(1, 4, 0));
        h.manager.on_wifi_disconnected();
        thread::sleep(Duration::from_millis(100));

        assert!(h.reporter.started.lock().is_empty());
        assert_eq!(h.platform.restarts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_installed_version_is_skipped() {
        let manifest = format!("{}{}", hash_line(1, "app.bin"), hash_line(2, "staticfs.bin"));
        let h = harness(OtaUpdateStep::None, release_files(manifest));

        h.manager.request_firmware_installation(SemVer::new(1, 3, 0));
        h.manager.on_wifi_connected();
        thread::sleep(Duration::from_millis(100));

        assert!(h.reporter.started.lock().is_empty());
        assert_eq!(h.store.ota_update_config().unwrap().update_step, OtaUpdateStep::None);
    }
}
