//! Constants used across the hub core.
//!
//! This module defines the timing, sizing and policy constants shared by the
//! transmitter, the keep-alive scheduler, the HTTP stream reader, the WiFi
//! scanner and the OTA updater.
//!
//! ## Key Concepts
//!
//! - **Keep-alive**: a receiver that hears nothing for a while disarms, so an
//!   idle shocker gets a zero-intensity vibrate pulse every interval.
//! - **Stop**: a stop request is transmitted as a short zero-intensity vibrate.
//! - **Queues**: every task queue is bounded; producers wait at most
//!   [`QUEUE_SEND_TIMEOUT_MS`] before giving up.
//! - **HTTP**: bodies are streamed through a fixed buffer and capped at
//!   [`HTTP_DOWNLOAD_SIZE_LIMIT`].
//!
//! Runtime-tunable values live in the config structs of each module; the
//! constants here are their defaults.

/// Interval after which an idle shocker receives a keep-alive pulse.
pub const KEEP_ALIVE_INTERVAL_MS: i64 = 60_000;

/// Duration of the synthetic keep-alive vibrate pulse.
pub const KEEP_ALIVE_DURATION_MS: u16 = 300;

/// Capacity of the keep-alive activity queue.
pub const KEEP_ALIVE_QUEUE_CAPACITY: usize = 32;

/// Duration of the zero-intensity vibrate a `Stop` command is translated into.
pub const STOP_DURATION_MS: u16 = 300;

/// Capacity of the transmitter's pending command queue.
pub const TRANSMIT_QUEUE_CAPACITY: usize = 64;

/// How long a producer waits for room in a task queue.
pub const QUEUE_SEND_TIMEOUT_MS: u64 = 10;

/// Poll interval used while waiting for a worker thread to terminate.
pub const TASK_SHUTDOWN_POLL_MS: u64 = 10;

/// Line-idle time the pin writer holds after every transmitted sequence.
///
/// This is the guaranteed minimum spacing between two consecutive frames on air.
pub const RF_FRAME_GAP_US: u32 = 5_000;

/// GPIO used for the RF transmitter when the configured one is unusable.
pub const DEFAULT_RF_TX_PIN: u8 = 15;

/// Size of the HTTP streaming buffer.
pub const HTTP_BUFFER_SIZE: usize = 4096;

/// Largest body (or single chunk) the HTTP client accepts.
pub const HTTP_DOWNLOAD_SIZE_LIMIT: usize = 200 * 1024 * 1024;

/// Longest chunk-size field, in hex digits.
pub const HTTP_CHUNK_SIZE_FIELD_MAX: usize = 16;

/// Delay between polls of a byte stream that has nothing available.
pub const HTTP_POLL_DELAY_MS: u64 = 5;

/// Default request timeout.
pub const HTTP_DEFAULT_TIMEOUT_MS: u32 = 10_000;

/// Cooldown applied after a `429` without a usable `Retry-After` header.
pub const HTTP_DEFAULT_RETRY_AFTER_S: i64 = 15;

/// Longest cooldown a `Retry-After` header can impose.
pub const HTTP_MAX_RETRY_AFTER_S: i64 = 24 * 60 * 60;

/// User agent sent with every request.
pub const HTTP_USER_AGENT: &str = concat!("ShockerHub/", env!("CARGO_PKG_VERSION"));

/// Registrable domain of the primary backend.
pub const DEFAULT_API_DOMAIN: &str = "openshock.app";

/// Domain serving firmware images and manifests.
pub const DEFAULT_FW_CDN_DOMAIN: &str = "firmware.openshock.org";

/// Highest WiFi channel scanned; scans count down from here to 1.
pub const WIFI_SCAN_MAX_CHANNEL: u8 = 13;

/// Dwell time per channel passed to the radio driver.
pub const WIFI_SCAN_MAX_MS_PER_CHANNEL: u32 = 300;

/// How long the scan task waits for a single channel to complete.
pub const WIFI_SCAN_TIMEOUT_MS: u64 = 10_000;

/// Wake-up period of the OTA task when no event arrives.
pub const OTA_TASK_WAKE_MS: u64 = 5_000;
