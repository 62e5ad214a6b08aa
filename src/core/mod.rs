//! Core abstractions for field-device drivers.
//!
//! - [`driver::DriverAdapter`]: Trait to implement for new hardware
//! - [`types`]: Status, register map metadata, confirmation and argument helpers

pub mod driver;
pub mod types;
