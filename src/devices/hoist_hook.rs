//! Hoist hook accessory module
//!
//! Two units share the gateway: the hook itself (speaker, warning light and
//! RFID tag groups in its command area) and a separate power module whose
//! status area starts at 0x0064. Only fc 0x03 and 0x06 are used.

use super::common::{RegisterProfile, usage};
use crate::config::HoistHookConfig;
use crate::core::driver::DriverAdapter;
use crate::core::types::{
    Access, Confirm, RegisterGroup, Report, Status, confirm_write, write_register_map,
};
use crate::error::{Error, Result};
use crate::transport::ModbusTcp;
use crate::transport::modbus::function;

const NAME: &str = "hoist_hook";

const REG_LIGHT: u16 = 0x0001;
const REG_SPEAKER: u16 = 0x0002;
const REG_RFID_MASK: u16 = 0x0003;
const REG_RFID_GROUPS: u16 = 0x0004;
const RFID_GROUPS: usize = 8;
const REG_POWER: u16 = 0x0064;
const POWER_COUNT: u16 = 6;

const SPEAKER_7M: u16 = 0x0001;
const SPEAKER_3M: u16 = 0x0002;

pub const REGISTER_GROUPS: &[RegisterGroup] = &[
    RegisterGroup::new(0x0000, 0x0063, Access::Mixed, "command registers (0-99)"),
    RegisterGroup::new(0x0064, 0x00C7, Access::ReadOnly, "status registers (100-199)"),
];

const RISKY: &[(u16, u16)] = &[(0x0000, 0x0063)];

const COMMANDS: [&str; 11] = [
    "map", "speaker", "light", "rfid", "power", "gps", "all", "speaker_ctl", "light_ctl", "get", "set",
];

pub fn describe(address: u16) -> Option<String> {
    let text = match address {
        0x0001 => "warning light (1 on / 0 off)",
        0x0002 => "speaker control (bit0=7m, bit1=3m)",
        0x0003 => "RFID valid group mask (bit0-bit7)",
        0x0004..=0x001B => {
            let offset = address - REG_RFID_GROUPS;
            let group = offset / 3 + 1;
            let field = match offset % 3 {
                0 => "UID high word",
                1 => "UID low word",
                _ => "RSSI/battery (hi RSSI, lo battery)",
            };
            return Some(format!("RFID group {} {}", group, field));
        }
        0x0064 => "status area start",
        _ => return None,
    };
    Some(text.to_string())
}

static PROFILE: RegisterProfile = RegisterProfile {
    name: NAME,
    read_codes: &[function::READ_HOLDING_REGISTERS],
    default_read: function::READ_HOLDING_REGISTERS,
    write_codes: &[function::WRITE_SINGLE_REGISTER],
    default_write: function::WRITE_SINGLE_REGISTER,
    risky: RISKY,
    describe,
};

/// Speaker output selected by the module; 3m has priority over 7m
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerOutput {
    ThreeMetre,
    SevenMetre,
    Stopped,
}

impl SpeakerOutput {
    pub fn from_register(value: u16) -> Self {
        if value & SPEAKER_3M != 0 {
            SpeakerOutput::ThreeMetre
        } else if value & SPEAKER_7M != 0 {
            SpeakerOutput::SevenMetre
        } else {
            SpeakerOutput::Stopped
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SpeakerOutput::ThreeMetre => "3m voice",
            SpeakerOutput::SevenMetre => "7m voice",
            SpeakerOutput::Stopped => "stopped",
        }
    }
}

/// Register value for a `speaker_ctl` mode
pub fn speaker_mode(mode: &str) -> Result<u16> {
    match mode {
        "off" => Ok(0),
        "7m" => Ok(SPEAKER_7M),
        "3m" => Ok(SPEAKER_3M),
        "both" => Ok(SPEAKER_7M | SPEAKER_3M),
        other => Err(Error::Format(format!(
            "speaker mode must be off/7m/3m/both, got {}",
            other
        ))),
    }
}

/// One RFID tag group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfidGroup {
    pub valid: bool,
    pub uid: u32,
    /// Signal strength magnitude; the tag reports -rssi dBm
    pub rssi: u8,
    pub battery: u8,
}

/// Decode the 24 group registers against the valid mask
pub fn decode_rfid(mask: u16, registers: &[u16]) -> Vec<RfidGroup> {
    registers
        .chunks_exact(3)
        .take(RFID_GROUPS)
        .enumerate()
        .map(|(i, group)| RfidGroup {
            valid: (mask >> i) & 1 != 0,
            uid: ((group[0] as u32) << 16) | group[1] as u32,
            rssi: (group[2] >> 8) as u8,
            battery: (group[2] & 0xFF) as u8,
        })
        .collect()
}

/// Hoist hook driver
pub struct HoistHookDriver {
    transport: ModbusTcp,
    hook_unit: u8,
    power_unit: u8,
    confirm: Confirm,
}

impl HoistHookDriver {
    pub fn new(config: &HoistHookConfig, transport: ModbusTcp, confirm: Confirm) -> Self {
        Self {
            transport,
            hook_unit: config.hook_unit,
            power_unit: config.power_unit,
            confirm,
        }
    }

    fn read_hook(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.transport
            .read_registers(self.hook_unit, function::READ_HOLDING_REGISTERS, address, quantity)
    }

    fn query_speaker(&mut self, report: &mut Report) -> Result<()> {
        let value = self.read_hook(REG_SPEAKER, 1)?[0];
        let on_off = |bit: u16| if value & bit != 0 { "on" } else { "off" };
        report.line(format!("[hoist_hook] speaker register=0x{:04X}", value));
        report.line(format!("  7m voice: {}", on_off(SPEAKER_7M)));
        report.line(format!("  3m voice: {}", on_off(SPEAKER_3M)));
        report.line(format!(
            "  active output: {}",
            SpeakerOutput::from_register(value).label()
        ));
        Ok(())
    }

    fn query_light(&mut self, report: &mut Report) -> Result<()> {
        let value = self.read_hook(REG_LIGHT, 1)?[0];
        report.line(format!(
            "[hoist_hook] warning light: {} (raw=0x{:04X})",
            if value & 1 != 0 { "on" } else { "off" },
            value
        ));
        Ok(())
    }

    fn query_rfid(&mut self, report: &mut Report) -> Result<()> {
        let mask = self.read_hook(REG_RFID_MASK, 1)?[0] & 0x00FF;
        let registers = self.read_hook(REG_RFID_GROUPS, (RFID_GROUPS * 3) as u16)?;
        let groups = decode_rfid(mask, &registers);

        report.line(format!("[hoist_hook] RFID valid mask=0x{:02X}", mask));
        for (i, group) in groups.iter().enumerate() {
            if group.valid {
                report.line(format!(
                    "  group {}: valid, UID=0x{:08X}, RSSI=-{} dBm, battery={}",
                    i + 1,
                    group.uid,
                    group.rssi,
                    group.battery
                ));
            } else {
                report.line(format!("  group {}: invalid", i + 1));
            }
        }
        let valid = groups.iter().filter(|g| g.valid).count();
        if valid == 0 {
            report.line("  no valid RFID groups");
        } else {
            report.line(format!("  valid groups: {}/{}", valid, RFID_GROUPS));
        }
        Ok(())
    }

    fn query_power(&mut self, report: &mut Report) -> Result<()> {
        let values = self.transport.read_registers(
            self.power_unit,
            function::READ_HOLDING_REGISTERS,
            REG_POWER,
            POWER_COUNT,
        )?;

        report.line(format!("[hoist_hook] power unit={}", self.power_unit));
        report.line(format!(
            "  bus voltage: {:.2} V (raw={})",
            values[0] as f64 * 0.01,
            values[0]
        ));
        report.line(format!(
            "  bus current: {:.2} A (raw={})",
            values[1] as f64 * 0.01,
            values[1]
        ));
        report.line(format!("  SOC: {:.2} % (raw={})", values[2] as f64 * 0.01, values[2]));
        report.line(format!("  status word: 0x{:04X}", values[3]));
        report.line(format!("  temperature/reserved (raw): {}, {}", values[4], values[5]));
        let raw: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(i, v)| format!("[0x{:04X}={}]", REG_POWER + i as u16, v))
            .collect();
        report.line(format!("  raw: {}", raw.join(" ")));
        Ok(())
    }

    fn query_gps(&mut self, report: &mut Report) -> Result<()> {
        report.line("[hoist_hook] GPS not available on this module");
        Ok(())
    }

    pub fn query_info(&mut self, section: &str, report: &mut Report) -> Result<String> {
        match section {
            "speaker" => self.query_speaker(report)?,
            "light" => self.query_light(report)?,
            "rfid" => self.query_rfid(report)?,
            "power" => self.query_power(report)?,
            "gps" => self.query_gps(report)?,
            "all" => {
                type Section = fn(&mut HoistHookDriver, &mut Report) -> Result<()>;
                let sections: [(&str, Section); 5] = [
                    ("speaker", Self::query_speaker),
                    ("light", Self::query_light),
                    ("rfid", Self::query_rfid),
                    ("power", Self::query_power),
                    ("gps", Self::query_gps),
                ];
                for (name, run) in sections {
                    if let Err(e) = run(self, report) {
                        log::warn!("hoist_hook: {} section skipped: {}", name, e);
                    }
                }
            }
            other => {
                return Err(Error::UnknownCommand {
                    sensor: NAME.to_string(),
                    command: other.to_string(),
                });
            }
        }
        Ok("ok".to_string())
    }

    /// Named actuator write in the command area, confirmed like any risky write
    fn control(&mut self, address: u16, value: u16, what: &str, report: &mut Report) -> Result<String> {
        confirm_write(&self.confirm, RISKY, address)?;
        self.transport.write_register(self.hook_unit, address, value)?;
        report.line(format!("[hoist_hook] {} set (0x{:04X} <= {})", what, address, value));
        Ok(format!("{} set", what))
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
            "speaker" | "light" | "rfid" | "power" | "gps" | "all" => self.query_info(command, report),
            "speaker_ctl" => {
                let Some(mode) = args.get(1) else {
                    return Err(usage("hoist_hook speaker_ctl <off|7m|3m|both>"));
                };
                let value = speaker_mode(mode)?;
                self.control(REG_SPEAKER, value, "speaker", report)
            }
            "light_ctl" => {
                let value = match args.get(1).map(String::as_str) {
                    Some("on") => 1,
                    Some("off") => 0,
                    _ => return Err(usage("hoist_hook light_ctl <on|off>")),
                };
                self.control(REG_LIGHT, value, "warning light", report)
            }
            "get" => PROFILE.read(&mut self.transport, self.hook_unit, args, report),
            "set" => PROFILE.write(&mut self.transport, self.hook_unit, &self.confirm, args, report),
            other => Err(Error::UnknownCommand {
                sensor: NAME.to_string(),
                command: other.to_string(),
            }),
        }
    }
}

impl DriverAdapter for HoistHookDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&mut self) -> Result<()> {
        log::info!(
            "hoist_hook: {} hook unit {} power unit {}",
            self.transport.endpoint(),
            self.hook_unit,
            self.power_unit
        );
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
    use crate::core::types::{allow_all, deny_all};
    use crate::devices::common::args;
    use crate::transport::mock::{MockConnector, MockDevice};
    use crate::transport::{Endpoint, LockScope, RateLimiter};
    use std::sync::Arc;
    use std::time::Duration;

    fn driver(device: &MockDevice) -> (HoistHookDriver, MockConnector) {
        driver_with(device, deny_all())
    }

    fn driver_with(device: &MockDevice, confirm: Confirm) -> (HoistHookDriver, MockConnector) {
        let connector = MockConnector::new(device.clone());
        let transport = ModbusTcp::new(Endpoint::new("192.168.1.12", 502))
            .with_connector(Arc::new(connector.clone()))
            .with_limiter(Arc::new(RateLimiter::new(Duration::ZERO, LockScope::Global)));
        (
            HoistHookDriver::new(&HoistHookConfig::default(), transport, confirm),
            connector,
        )
    }

    #[test]
    fn test_speaker_priority() {
        assert_eq!(SpeakerOutput::from_register(0), SpeakerOutput::Stopped);
        assert_eq!(SpeakerOutput::from_register(1), SpeakerOutput::SevenMetre);
        assert_eq!(SpeakerOutput::from_register(2), SpeakerOutput::ThreeMetre);
        assert_eq!(SpeakerOutput::from_register(3), SpeakerOutput::ThreeMetre);
    }

    #[test]
    fn test_decode_rfid_groups() {
        let mut registers = [0u16; 24];
        registers[0] = 0x1234;
        registers[1] = 0x5678;
        registers[2] = 0x4B05;
        let groups = decode_rfid(0x01, &registers);
        assert_eq!(groups.len(), 8);
        assert_eq!(
            groups[0],
            RfidGroup {
                valid: true,
                uid: 0x1234_5678,
                rssi: 75,
                battery: 5
            }
        );
        assert!(!groups[1].valid);
    }

    #[test]
    fn test_rfid_report() {
        let device = MockDevice::new();
        device.set_register(3, 0x0003, 0xFF05);
        device.set_registers(3, 0x0004, &[0x00AB, 0xCDEF, 0x3C02]);
        device.set_registers(3, 0x000A, &[0x0000, 0x0001, 0x5001]);
        let (mut hook, _) = driver(&device);

        let mut report = Report::new();
        assert!(hook.query(&args(&["rfid"]), &mut report).ok);
        let text = report.as_str();
        assert!(text.contains("valid mask=0x05"));
        assert!(text.contains("group 1: valid, UID=0x00ABCDEF, RSSI=-60 dBm, battery=2"));
        assert!(text.contains("group 2: invalid"));
        assert!(text.contains("group 3: valid, UID=0x00000001, RSSI=-80 dBm, battery=1"));
        assert!(text.contains("valid groups: 2/8"));
    }

    #[test]
    fn test_power_reads_power_unit() {
        let device = MockDevice::new();
        device.set_registers(4, 0x0064, &[2450, 130, 8800, 0x0011, 31, 0]);
        let (mut hook, connector) = driver(&device);

        let mut report = Report::new();
        assert!(hook.query(&args(&["power"]), &mut report).ok);
        assert!(report.as_str().contains("bus voltage: 24.50 V (raw=2450)"));
        assert!(report.as_str().contains("SOC: 88.00 %"));
        assert!(report.as_str().contains("[0x0069=0]"));
        assert_eq!(connector.requests()[0][6], 4);
    }

    #[test]
    fn test_all_continues_past_failures() {
        let device = MockDevice::new();
        device.set_silent(4);
        device.set_register(3, 0x0001, 1);
        let (mut hook, _) = driver(&device);

        let mut report = Report::new();
        assert!(hook.query(&args(&["all"]), &mut report).ok);
        assert!(report.as_str().contains("warning light: on"));
        assert!(report.as_str().contains("GPS not available"));
        assert!(!report.as_str().contains("bus voltage"));
    }

    #[test]
    fn test_controls_cancelled_when_declined() {
        let device = MockDevice::new();
        let (mut hook, connector) = driver(&device);

        let status = hook.query(&args(&["speaker_ctl", "both"]), &mut Report::new());
        assert!(!status.ok);
        assert!(status.message.contains("cancelled"), "{}", status.message);
        let status = hook.query(&args(&["light_ctl", "on"]), &mut Report::new());
        assert!(!status.ok);
        assert!(status.message.contains("cancelled"), "{}", status.message);

        assert_eq!(connector.connect_count(), 0);
        assert_eq!(device.register(3, 0x0002), 0);
        assert_eq!(device.register(3, 0x0001), 0);
    }

    #[test]
    fn test_controls_write_when_confirmed() {
        let device = MockDevice::new();
        let (mut hook, _) = driver_with(&device, allow_all());
        assert!(hook.query(&args(&["speaker_ctl", "both"]), &mut Report::new()).ok);
        assert_eq!(device.register(3, 0x0002), 3);
        assert!(hook.query(&args(&["light_ctl", "on"]), &mut Report::new()).ok);
        assert_eq!(device.register(3, 0x0001), 1);
    }

    #[test]
    fn test_speaker_ctl_rejects_unknown_mode() {
        let (mut hook, connector) = driver(&MockDevice::new());
        assert!(!hook.query(&args(&["speaker_ctl", "loud"]), &mut Report::new()).ok);
        assert!(!hook.query(&args(&["light_ctl"]), &mut Report::new()).ok);
        assert_eq!(connector.connect_count(), 0);
    }

    #[test]
    fn test_generic_set_in_command_area_needs_confirmation() {
        let (mut hook, connector) = driver(&MockDevice::new());
        let status = hook.query(&args(&["set", "0x0002", "1"]), &mut Report::new());
        assert!(!status.ok);
        assert!(status.message.contains("cancelled"));
        assert_eq!(connector.connect_count(), 0);
    }
}
