//! # shocker-hub
//!
//! Command transmission core for a 433 MHz shocker hub. It turns logical
//! shocker commands into OOK pulse trains and schedules them onto a single
//! radio transmitter, together with the services around it.
//!
//! The crate is built around:
//! - `embedded-hal` traits for the transmitter pin and bit timing
//! - dedicated worker threads fed by bounded `crossbeam-channel` queues
//! - ISR-safe notification bits on top of `critical-section`
//! - `parking_lot` locks around shared state
//!
//! ## Modules
//! | Module          | Description |
//! |-----------------|-------------|
//! | [`encoding`]    | Per-model pulse sequences (CaiXianlin, Petrainer, Petrainer 998DR) |
//! | [`radio`]       | Bit-banged pulse output on a GPIO pin |
//! | [`transmitter`] | Command queue and round-robin transmit loop |
//! | [`keepalive`]   | Zero-intensity pulses that keep idle receivers armed |
//! | [`command`]     | Command entry point, pin reconfiguration, keep-alive control |
//! | [`ratelimit`]   | Per-domain sliding-window request admission |
//! | [`http`]        | Rate-limited GET with chunked and fixed-length streaming |
//! | [`wifi_scan`]   | Channel-by-channel WiFi scan orchestration |
//! | [`ota`]         | Staged firmware updates with boot validation |
//!
//! ## Crate features
//! | Feature | Description |
//! |---------|-------------|
//! | `serde` | Derives `Serialize`/`Deserialize` for persisted config types |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shocker_hub::clock::MonotonicClock;
//! use shocker_hub::command::CommandHandler;
//! use shocker_hub::config::MemoryConfigStore;
//! use shocker_hub::encoding::{ShockerCommandType, ShockerModel};
//! # use shocker_hub::radio::RadioFactory;
//! # use std::sync::Arc;
//! # fn demo(radio: Arc<dyn RadioFactory>) {
//! let handler = CommandHandler::init(
//!     Arc::new(MemoryConfigStore::default()),
//!     radio,
//!     Arc::new(MonotonicClock::new()),
//! )
//! .unwrap();
//!
//! handler
//!     .handle_command(ShockerModel::CaiXianlin, 4242, ShockerCommandType::Vibrate, 30, 1000)
//!     .unwrap();
//! # }
//! ```
//!
//! Hardware-facing pieces (`RadioFactory`, `ScanDriver`, `HttpTransport`,
//! `OtaPlatform`, `ConfigStore`) are traits, so the whole core runs on a host
//! for testing.
//!
//! No logger is installed; output goes through the `log` facade.

#![deny(
    bad_style,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    while_true,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    unused_extern_crates,
    unused_import_braces
)]

pub use critical_section;
pub use heapless;

pub mod consts;
pub(crate) mod checksum;
pub mod clock;
pub mod command;
pub mod config;
pub mod encoding;
pub mod gpio;
pub mod http;
pub mod keepalive;
pub mod notify;
pub mod ota;
pub mod radio;
pub mod ratelimit;
pub mod transmitter;
pub mod wifi_scan;

#[cfg(test)]
mod testing;
