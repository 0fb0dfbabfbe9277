//! # chargeguard - battery-protecting charger controller
//!
//! Watches pack voltage reported by a Victron battery monitor over the
//! VE.Direct serial protocol and switches the charger relay with hysteresis,
//! so the pack is never pushed past its charge limit by a charger that has
//! no battery voltage input of its own.
//!
//! ## Features
//!
//! - **Async control loop**: Tokio ticker with cancellable sampling
//! - **VE.Direct decoding**: checksum-verified text frames, HEX records skipped
//! - **Fail-safe actuation**: missing data holds state, shutdown disconnects
//! - **Serial discovery**: tries candidate ports and reconnects after errors
//! - **Configuration**: YAML-based configuration with validation
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `vedirect`: VE.Direct text-protocol frame decoder
//! - `telemetry`: Serial telemetry source
//! - `sampler`: Bounded-window voltage sampling
//! - `control`: Hysteresis state machine
//! - `relay`: Relay polarity and output line backends
//! - `guard`: Control loop and its handle

pub mod config;
pub mod control;
pub mod error;
pub mod guard;
pub mod logging;
pub mod relay;
pub mod sampler;
pub mod telemetry;
pub mod vedirect;

// Re-export commonly used types
pub use config::Config;
pub use guard::{ChargeGuard, GuardHandle};
pub use error::{ChargeGuardError, Result};
