//! Field-device drivers
//!
//! Every driver owns its own transport; all of them share one
//! [`RateLimiter`] so exchanges to a gateway stay spaced out no matter which
//! driver issues them.

pub mod battery;
pub mod common;
pub mod encoder;
pub mod hoist_hook;
pub mod io_relay;
pub mod solar;
pub mod spd_lidar;

use crate::config::{Config, EncoderConfig, EncoderTransport, TransportConfig};
use crate::core::driver::DriverAdapter;
use crate::core::types::Confirm;
use crate::error::Result;
use crate::transport::{
    Connector, Endpoint, ModbusRtu, ModbusTcp, RateLimiter, RegisterClient, TcpConnector,
};
use battery::BatteryDriver;
use encoder::{EncoderDriver, LinkFactory};
use hoist_hook::HoistHookDriver;
use io_relay::IoRelayDriver;
use solar::SolarDriver;
use spd_lidar::SpdLidarDriver;
use std::sync::Arc;

/// Shared resources handed to every driver
#[derive(Clone)]
pub struct DriverContext {
    pub transport: TransportConfig,
    pub limiter: Arc<RateLimiter>,
    pub connector: Arc<dyn Connector>,
    pub confirm: Confirm,
}

impl DriverContext {
    /// Real sockets and a limiter built from `transport`
    pub fn new(transport: &TransportConfig, confirm: Confirm) -> Self {
        Self {
            transport: transport.clone(),
            limiter: Arc::new(RateLimiter::new(transport.min_gap(), transport.lock_scope)),
            connector: Arc::new(TcpConnector),
            confirm,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Modbus TCP transport for one driver
    pub fn tcp(&self, endpoint: Endpoint) -> ModbusTcp {
        ModbusTcp::new(endpoint)
            .with_connector(Arc::clone(&self.connector))
            .with_limiter(Arc::clone(&self.limiter))
            .with_policy(self.transport.connection)
            .with_timeout(self.transport.timeout())
    }

    fn encoder_link(&self, config: &EncoderConfig) -> LinkFactory {
        match config.transport {
            EncoderTransport::Tcp => {
                let ctx = self.clone();
                let endpoint = config.endpoint();
                Box::new(move || Ok(Box::new(ctx.tcp(endpoint.clone())) as Box<dyn RegisterClient>))
            }
            EncoderTransport::Rtu => {
                let limiter = Arc::clone(&self.limiter);
                let settings = config.serial();
                Box::new(move || {
                    let link = ModbusRtu::open(&settings, Arc::clone(&limiter))?;
                    Ok(Box::new(link) as Box<dyn RegisterClient>)
                })
            }
        }
    }
}

/// Create the driver for every enabled hardware family
pub fn create_drivers(config: &Config, ctx: &DriverContext) -> Result<Vec<Box<dyn DriverAdapter>>> {
    let runtime = &config.runtime;
    let mut drivers: Vec<Box<dyn DriverAdapter>> = Vec::new();

    if runtime.battery.enable {
        let transport = ctx.tcp(runtime.battery.endpoint());
        drivers.push(Box::new(BatteryDriver::new(
            &runtime.battery,
            transport,
            Arc::clone(&ctx.confirm),
        )));
    }
    if runtime.solar.enable {
        let transport = ctx.tcp(runtime.solar.endpoint());
        drivers.push(Box::new(SolarDriver::new(
            &runtime.solar,
            transport,
            Arc::clone(&ctx.confirm),
        )));
    }
    if runtime.hoist_hook.enable {
        let transport = ctx.tcp(runtime.hoist_hook.endpoint());
        drivers.push(Box::new(HoistHookDriver::new(
            &runtime.hoist_hook,
            transport,
            Arc::clone(&ctx.confirm),
        )));
    }
    if runtime.io_relay.enable {
        let transport = ctx.tcp(runtime.io_relay.endpoint());
        drivers.push(Box::new(IoRelayDriver::new(&runtime.io_relay, transport)));
    }
    if runtime.multi_turn_encoder.enable {
        let encoder = &runtime.multi_turn_encoder;
        drivers.push(Box::new(EncoderDriver::new(
            encoder,
            ctx.encoder_link(encoder),
            Arc::clone(&ctx.confirm),
        )));
    }
    if runtime.spd_lidar.enable {
        drivers.push(Box::new(SpdLidarDriver::new(
            &runtime.spd_lidar,
            Arc::clone(&ctx.connector),
            Arc::clone(&ctx.limiter),
        )));
    }

    log::info!("Created {} driver(s)", drivers.len());
    Ok(drivers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::deny_all;

    #[test]
    fn test_all_families_enabled_by_default() {
        let config = Config::default();
        let ctx = DriverContext::new(&config.transport, deny_all());
        let drivers = create_drivers(&config, &ctx).unwrap();
        let names: Vec<&str> = drivers.iter().map(|d| d.name()).collect();
        assert_eq!(
            names,
            vec!["battery", "solar", "hoist_hook", "io_relay", "multi_turn_encoder", "spd_lidar"]
        );
    }

    #[test]
    fn test_disabled_families_skipped() {
        let mut config = Config::default();
        config.runtime.solar.enable = false;
        config.runtime.multi_turn_encoder.enable = false;
        let ctx = DriverContext::new(&config.transport, deny_all());
        let drivers = create_drivers(&config, &ctx).unwrap();
        assert!(drivers.iter().all(|d| d.name() != "solar"));
        assert!(drivers.iter().all(|d| d.name() != "multi_turn_encoder"));
        assert_eq!(drivers.len(), 4);
    }
}
