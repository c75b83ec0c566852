//! BLE vitals monitor library
//! Discovers BLE peripherals, holds one GATT session, decodes battery and
//! heart-rate data and reconnects sessions that drop unexpectedly.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;
