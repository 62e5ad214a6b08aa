//! safety-io - field-device integration layer for an industrial safety controller
//!
//! Drivers for a battery management system, a solar charge controller, a
//! hoist hook module, a relay bank, a multi-turn encoder and single-point
//! lidars, all reached through Modbus-style gateways and coordinated by the
//! [`Orchestrator`].
//!
//! ```no_run
//! use safety_io::{Config, DriverContext, Orchestrator, console::Console};
//! use safety_io::core::types::deny_all;
//! use std::sync::Arc;
//!
//! let (config, path) = Config::load(None)?;
//! let context = DriverContext::new(&config.transport, deny_all());
//! let mut orchestrator = Orchestrator::new(config, context, Arc::new(Console::stdout()))
//!     .with_config_path(path);
//! orchestrator.init()?;
//! let status = orchestrator.dispatch_command("battery", &["basic".to_string()]);
//! println!("{}", status);
//! # Ok::<(), safety_io::Error>(())
//! ```

pub mod config;
pub mod core;
pub mod devices;
pub mod error;
pub mod orchestrator;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use core::driver::DriverAdapter;
pub use core::types::{Report, Status};
pub use devices::DriverContext;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, console};
