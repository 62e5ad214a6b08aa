//! 16-channel relay bank
//!
//! Channel `n` (1-16) is coil `n - 1`. Switching uses fc 0x05 with the
//! request echoed back; reading uses fc 0x01.

use crate::config::IoRelayConfig;
use crate::core::driver::DriverAdapter;
use crate::core::types::{Access, RegisterGroup, Report, Status, parse_in_range, write_register_map};
use crate::error::{Error, Result};
use crate::transport::ModbusTcp;

const NAME: &str = "io_relay";

pub const CHANNELS: u16 = 16;

pub const REGISTER_GROUPS: &[RegisterGroup] = &[RegisterGroup::new(
    0x0000,
    0x000F,
    Access::CoilWrite,
    "relay coils, channel n at n-1",
)];

const COMMANDS: [&str; 4] = ["map", "on", "off", "read"];

/// Coil address for a 1-based channel number
pub fn coil_address(channel: i64) -> Result<u16> {
    if !(1..=CHANNELS as i64).contains(&channel) {
        return Err(Error::Format(format!(
            "relay channel must be 1-{}, got {}",
            CHANNELS, channel
        )));
    }
    Ok((channel - 1) as u16)
}

/// Relay bank driver
pub struct IoRelayDriver {
    transport: ModbusTcp,
    unit: u8,
}

impl IoRelayDriver {
    pub fn new(config: &IoRelayConfig, transport: ModbusTcp) -> Self {
        Self {
            transport,
            unit: config.unit,
        }
    }

    /// Switch one channel on or off
    pub fn switch(&mut self, channel: i64, on: bool, report: &mut Report) -> Result<String> {
        let address = coil_address(channel)?;
        self.transport.write_coil(self.unit, address, on)?;

        let state = if on { "closed" } else { "open" };
        report.line(format!("[io_relay] channel {} {}", channel, state));
        Ok(format!("channel {} {}", channel, state))
    }

    /// Read one channel, or all 16 when `channel` is 0
    pub fn read(&mut self, channel: i64, report: &mut Report) -> Result<String> {
        if channel > 0 {
            let address = coil_address(channel)?;
            let coils = self.transport.read_coils(self.unit, address, 1)?;
            report.line(format!(
                "[io_relay] channel {}: {}",
                channel,
                if coils[0] { "closed" } else { "open" }
            ));
            return Ok("ok".to_string());
        }

        let coils = self.transport.read_coils(self.unit, 0, CHANNELS)?;
        report.line("[io_relay] channels:");
        let states: Vec<String> = coils
            .iter()
            .enumerate()
            .map(|(i, on)| format!("{}={}", i + 1, if *on { "ON" } else { "OFF" }))
            .collect();
        report.line(format!("  {}", states.join(" ")));
        Ok("ok".to_string())
    }

    fn dispatch(&mut self, args: &[String], report: &mut Report) -> Result<String> {
        let Some(command) = args.first() else {
            return Err(Error::Format("missing command".to_string()));
        };
        match command.as_str() {
            "map" => {
                write_register_map(report, NAME, REGISTER_GROUPS);
                Ok("ok".to_string())
            }
            "on" | "off" => {
                let Some(text) = args.get(1) else {
                    return Err(Error::Format(format!("usage: io_relay {} <1-16>", command)));
                };
                let channel = parse_in_range(text, "channel", 1, CHANNELS as i64)?;
                self.switch(channel, command == "on", report)
            }
            "read" => {
                let channel = match args.get(1) {
                    Some(text) => parse_in_range(text, "channel", 0, CHANNELS as i64)?,
                    None => 0,
                };
                self.read(channel, report)
            }
            other => Err(Error::UnknownCommand {
                sensor: NAME.to_string(),
                command: other.to_string(),
            }),
        }
    }
}

impl DriverAdapter for IoRelayDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&mut self) -> Result<()> {
        log::info!("io_relay: {} unit {}", self.transport.endpoint(), self.unit);
        Ok(())
    }

    fn query(&mut self, args: &[String], report: &mut Report) -> Status {
        self.dispatch(args, report).into()
    }

    fn available_commands(&self) -> Vec<String> {
        COMMANDS.iter().map(|s| s.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::common::args;
    use crate::transport::mock::{MockConnector, MockDevice};
    use crate::transport::{Endpoint, LockScope, RateLimiter};
    use std::sync::Arc;
    use std::time::Duration;

    fn driver(device: &MockDevice) -> (IoRelayDriver, MockConnector) {
        let connector = MockConnector::new(device.clone());
        let transport = ModbusTcp::new(Endpoint::new("192.168.1.12", 502))
            .with_connector(Arc::new(connector.clone()))
            .with_limiter(Arc::new(RateLimiter::new(Duration::ZERO, LockScope::Global)));
        (IoRelayDriver::new(&IoRelayConfig::default(), transport), connector)
    }

    #[test]
    fn test_channel_mapping() {
        assert_eq!(coil_address(1).unwrap(), 0x0000);
        assert_eq!(coil_address(16).unwrap(), 0x000F);
        assert!(coil_address(0).is_err());
        assert!(coil_address(17).is_err());
    }

    #[test]
    fn test_on_sends_coil_on_and_checks_echo() {
        let device = MockDevice::new();
        let (mut relay, connector) = driver(&device);

        let status = relay.query(&args(&["on", "5"]), &mut Report::new());
        assert!(status.ok, "{}", status.message);
        assert!(device.coil(3, 4));

        let request = &connector.requests()[0];
        assert_eq!(&request[7..12], &[0x05, 0x00, 0x04, 0xFF, 0x00]);

        assert!(relay.query(&args(&["off", "5"]), &mut Report::new()).ok);
        assert!(!device.coil(3, 4));
    }

    #[test]
    fn test_out_of_range_channel_no_io() {
        let (mut relay, connector) = driver(&MockDevice::new());
        assert!(!relay.query(&args(&["on", "17"]), &mut Report::new()).ok);
        assert!(!relay.query(&args(&["off"]), &mut Report::new()).ok);
        assert_eq!(connector.connect_count(), 0);
    }

    #[test]
    fn test_read_all_channels() {
        let device = MockDevice::new();
        device.set_coil(3, 0, true);
        device.set_coil(3, 9, true);
        let (mut relay, connector) = driver(&device);

        let mut report = Report::new();
        assert!(relay.query(&args(&["read"]), &mut report).ok);
        assert!(report.as_str().contains("1=ON 2=OFF"));
        assert!(report.as_str().contains("10=ON"));
        assert!(report.as_str().contains("16=OFF"));
        assert_eq!(&connector.requests()[0][7..12], &[0x01, 0x00, 0x00, 0x00, 0x10]);
    }

    #[test]
    fn test_read_single_channel() {
        let device = MockDevice::new();
        device.set_coil(3, 2, true);
        let (mut relay, _) = driver(&device);

        let mut report = Report::new();
        assert!(relay.query(&args(&["read", "3"]), &mut report).ok);
        assert!(report.as_str().contains("channel 3: closed"));
    }
}
