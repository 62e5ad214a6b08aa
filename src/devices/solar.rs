//! Solar charge controller behind the RS485 gateway
//!
//! Real-time values live in input registers (fc 0x04). Powers are 32-bit
//! little-word-first pairs scaled by 1/100.

use super::common::RegisterProfile;
use crate::config::SolarConfig;
use crate::core::driver::DriverAdapter;
use crate::core::types::{Access, Confirm, RegisterGroup, Report, Status, arg_or, write_register_map};
use crate::error::{Error, Result};
use crate::transport::ModbusTcp;
use crate::transport::modbus::function;
use std::time::Duration;

const NAME: &str = "solar";

const REG_PV: u16 = 0x3100;
const REG_LOAD: u16 = 0x310C;
const REG_SOC: u16 = 0x311A;
const REG_BATTERY: u16 = 0x331A;

const SCAN_TIMEOUT: Duration = Duration::from_millis(1500);

pub const REGISTER_GROUPS: &[RegisterGroup] = &[
    RegisterGroup::new(0x3000, 0x3010, Access::ReadOnly, "rated parameters (array/battery/load)"),
    RegisterGroup::new(0x3100, 0x311D, Access::ReadOnly, "real-time values (array/load/temperature/SOC)"),
    RegisterGroup::new(0x3200, 0x3202, Access::ReadOnly, "status bits (battery/charge/discharge)"),
    RegisterGroup::new(0x3302, 0x3313, Access::ReadOnly, "daily/monthly/yearly/total statistics"),
    RegisterGroup::new(0x331A, 0x331C, Access::ReadOnly, "battery voltage, current L/H"),
    RegisterGroup::new(0x9000, 0x9070, Access::HighRisk, "battery and management parameters"),
    RegisterGroup::new(0x9013, 0x9015, Access::ReadWrite, "real-time clock"),
    RegisterGroup::new(0x9017, 0x9063, Access::ReadWrite, "device parameters (temperature limits)"),
    RegisterGroup::new(0x901E, 0x9069, Access::ReadWrite, "load control / light control / timers"),
];

const RISKY: &[(u16, u16)] = &[(0x000D, 0x000E), (0x9000, 0x9070)];

const COMMANDS: [&str; 7] = ["map", "basic", "status", "all", "scan", "get", "set"];

pub fn describe(address: u16) -> Option<String> {
    let text = match address {
        0x3100 => "array voltage (V/100)",
        0x3101 => "array current (A/100)",
        0x3102 => "generated power L",
        0x3103 => "generated power H",
        0x310C => "load voltage (V/100)",
        0x310D => "load current (A/100)",
        0x310E => "load power L",
        0x310F => "load power H",
        0x311A => "battery SOC (%)",
        0x3200 => "battery status bits",
        0x3201 => "charging equipment status bits",
        0x3202 => "discharging equipment status bits",
        0x331A => "battery voltage (V/100)",
        0x331B => "battery current L",
        0x331C => "battery current H",
        _ => return None,
    };
    Some(text.to_string())
}

static PROFILE: RegisterProfile = RegisterProfile {
    name: NAME,
    read_codes: &[function::READ_HOLDING_REGISTERS, function::READ_INPUT_REGISTERS],
    default_read: function::READ_INPUT_REGISTERS,
    write_codes: &[function::WRITE_SINGLE_COIL, function::WRITE_SINGLE_REGISTER],
    default_write: function::WRITE_SINGLE_REGISTER,
    risky: RISKY,
    describe,
};

/// Combine a low/high word pair into an unsigned 32-bit value
pub fn u32_from_lh(low: u16, high: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

/// Combine a low/high word pair into a signed 32-bit value
pub fn i32_from_lh(low: u16, high: u16) -> i32 {
    u32_from_lh(low, high) as i32
}

/// Voltage, current and power from a 4-register real-time block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerReading {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

impl PowerReading {
    pub fn from_registers(values: &[u16]) -> Self {
        Self {
            voltage: values[0] as f64 / 100.0,
            current: values[1] as f64 / 100.0,
            power: u32_from_lh(values[2], values[3]) as f64 / 100.0,
        }
    }

    fn write(&self, report: &mut Report, label: &str) {
        report.line(format!("  {} voltage: {:.2} V", label, self.voltage));
        report.line(format!("  {} current: {:.2} A", label, self.current));
        report.line(format!("  {} power: {:.2} W", label, self.power));
    }
}

/// Solar controller driver
pub struct SolarDriver {
    transport: ModbusTcp,
    module_unit: u8,
    solar_unit: u8,
    confirm: Confirm,
}

impl SolarDriver {
    pub fn new(config: &SolarConfig, transport: ModbusTcp, confirm: Confirm) -> Self {
        Self {
            transport,
            module_unit: config.module_unit,
            solar_unit: config.solar_unit,
            confirm,
        }
    }

    fn check_units(&self) -> Result<()> {
        if self.solar_unit == self.module_unit {
            return Err(Error::Format(format!(
                "solar unit {} conflicts with module unit",
                self.solar_unit
            )));
        }
        Ok(())
    }

    fn read_input(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.transport
            .read_registers(self.solar_unit, function::READ_INPUT_REGISTERS, address, quantity)
    }

    /// Every section is optional; fails only when none could be read
    fn query_basic(&mut self, report: &mut Report) -> Result<()> {
        let pv = self.read_input(REG_PV, 4);
        let load = self.read_input(REG_LOAD, 4);
        let soc = self.read_input(REG_SOC, 1);
        let battery = self.read_input(REG_BATTERY, 3);

        if pv.is_err() && load.is_err() && soc.is_err() && battery.is_err() {
            return Err(Error::Other("solar basic read failed".to_string()));
        }

        report.line(format!("[solar] unit={} basic", self.solar_unit));
        match pv {
            Ok(values) => PowerReading::from_registers(&values).write(report, "PV"),
            Err(e) => log::debug!("solar: PV section skipped: {}", e),
        }
        match load {
            Ok(values) => PowerReading::from_registers(&values).write(report, "load"),
            Err(e) => log::debug!("solar: load section skipped: {}", e),
        }
        match soc {
            Ok(values) => report.line(format!("  battery SOC: {} %", values[0])),
            Err(e) => log::debug!("solar: SOC section skipped: {}", e),
        }
        match battery {
            Ok(values) => {
                report.line(format!("  battery voltage: {:.2} V", values[0] as f64 / 100.0));
                report.line(format!(
                    "  battery current: {:.2} A (charge positive)",
                    i32_from_lh(values[1], values[2]) as f64 / 100.0
                ));
            }
            Err(e) => log::debug!("solar: battery section skipped: {}", e),
        }
        Ok(())
    }

    fn query_status(&mut self, report: &mut Report) -> Result<()> {
        let pv = self
            .read_input(REG_PV, 4)
            .map_err(|e| Error::Other(format!("solar status: PV read failed: {}", e)))?;
        let load = self
            .read_input(REG_LOAD, 4)
            .map_err(|e| Error::Other(format!("solar status: load read failed: {}", e)))?;

        report.line(format!("[solar] unit={} status", self.solar_unit));
        PowerReading::from_registers(&pv).write(report, "PV");
        PowerReading::from_registers(&load).write(report, "load");
        Ok(())
    }

    pub fn query_info(&mut self, section: &str, report: &mut Report) -> Result<String> {
        self.check_units()?;
        match section {
            "basic" => self.query_basic(report)?,
            "status" => self.query_status(report)?,
            "all" => {
                let basic = self.query_basic(report);
                let status = self.query_status(report);
                if let (Err(e), Err(_)) = (&basic, &status) {
                    return Err(Error::Other(format!("solar: every section failed: {}", e)));
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

    pub fn scan(&mut self, start: i64, end: i64, report: &mut Report) -> Result<String> {
        if start < 1 || end > 252 || start > end {
            return Err(Error::Format(
                "scan range must satisfy 1 <= start <= end <= 252".to_string(),
            ));
        }

        report.line(format!("[solar] scanning units {}..={}", start, end));
        let mut found = Vec::new();
        for unit in start as u8..=end as u8 {
            if unit == self.module_unit {
                continue;
            }
            let Ok(values) = self.transport.read_registers_timeout(
                unit,
                function::READ_INPUT_REGISTERS,
                REG_PV,
                1,
                SCAN_TIMEOUT,
            ) else {
                continue;
            };
            report.line(format!(
                "  unit {}: array voltage {:.2} V",
                unit,
                values[0] as f64 / 100.0
            ));
            found.push(unit.to_string());
        }

        if found.is_empty() {
            report.line("[solar] no responders");
        } else {
            report.line(format!("[solar] responders: [{}]", found.join(", ")));
        }
        Ok(format!("{} responder(s)", found.len()))
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
            "basic" | "status" | "all" => self.query_info(command, report),
            "scan" => {
                let start = arg_or(args, 1, "scan start", 1)?;
                let end = arg_or(args, 2, "scan end", 16)?;
                self.scan(start, end, report)
            }
            "get" => {
                self.check_units()?;
                PROFILE.read(&mut self.transport, self.solar_unit, args, report)
            }
            "set" => {
                self.check_units()?;
                PROFILE.write(&mut self.transport, self.solar_unit, &self.confirm, args, report)
            }
            other => Err(Error::UnknownCommand {
                sensor: NAME.to_string(),
                command: other.to_string(),
            }),
        }
    }
}

impl DriverAdapter for SolarDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&mut self) -> Result<()> {
        self.check_units()?;
        log::info!(
            "solar: {} module unit {} solar unit {}",
            self.transport.endpoint(),
            self.module_unit,
            self.solar_unit
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
