//! Battery management system behind the RS485 gateway
//!
//! The BMS answers on its own unit id (`battery_unit`), distinct from the
//! gateway module's unit id. All values are scaled integers:
//!
//! | Register | Meaning                       | Scale        |
//! |----------|-------------------------------|--------------|
//! | 0x0000   | State of charge               | 0.01 %       |
//! | 0x0001   | Pack current (signed)         | 0.01 A       |
//! | 0x0002   | Pack voltage                  | 0.01 V       |
//! | 0x0005   | Remaining time                | hi=h, lo=min |
//! | 0x000A   | Charge MOS                    | 0/1          |
//! | 0x000B   | Discharge MOS                 | 0/1          |
//! | 0x0010.. | Cell voltages 1-64            | mV           |
//! | 0x0050.. | NTC temperatures (signed)     | 0.1 °C       |
//! | 0x0062   | Protection bits               | bitfield     |
//! | 0x0064   | RS485 address                 |              |

use super::common::{RegisterProfile, usage};
use crate::config::BatteryConfig;
use crate::core::driver::DriverAdapter;
use crate::core::types::{Access, Confirm, RegisterGroup, Report, Status, arg_or, parse_in_range, write_register_map};
use crate::error::{Error, Result};
use crate::transport::ModbusTcp;
use crate::transport::modbus::function;
use std::time::Duration;

const NAME: &str = "battery";

const REG_BASIC: u16 = 0x0000;
const BASIC_COUNT: u16 = 9;
const REG_VOLTAGE: u16 = 0x0002;
const REG_CHARGE_MOS: u16 = 0x000A;
const REG_DISCHARGE_MOS: u16 = 0x000B;
const REG_CELLS: u16 = 0x0010;
const CELL_COUNT: u16 = 16;
const REG_TEMPS: u16 = 0x0050;
const TEMP_COUNT: u16 = 2;
const REG_PROTECTION: u16 = 0x0062;
const REG_ADDRESS: u16 = 0x0064;

/// Unit ids a battery may use
const MIN_UNIT: i64 = 1;
const MAX_UNIT: i64 = 252;

/// Current magnitude below which the pack is considered idle
const IDLE_CURRENT_A: f64 = 0.05;

const SCAN_TIMEOUT: Duration = Duration::from_millis(1500);

pub const REGISTER_GROUPS: &[RegisterGroup] = &[
    RegisterGroup::new(0x0000, 0x000F, Access::Mixed, "basic state (SOC, current, voltage, MOS)"),
    RegisterGroup::new(0x0010, 0x004F, Access::ReadOnly, "cell voltages 1-64 (mV)"),
    RegisterGroup::new(0x0050, 0x0061, Access::ReadOnly, "NTC temperatures (0.1 C)"),
    RegisterGroup::new(0x0062, 0x0090, Access::Mixed, "protection, series count, address, baud, thresholds"),
    RegisterGroup::new(0x0100, 0x0161, Access::Mixed, "calibration"),
    RegisterGroup::new(0x0162, 0x0183, Access::ReadOnly, "bluetooth, GPS, insulation, alarms, SOH"),
    RegisterGroup::new(0x0200, 0x0221, Access::Mixed, "alarm thresholds"),
    RegisterGroup::new(0x0FA1, 0x0FB4, Access::HighRisk, "debug / forced outputs"),
    RegisterGroup::new(0x5A60, 0x5A8E, Access::HighRisk, "advanced system parameters"),
];

const RISKY: &[(u16, u16)] = &[(0x0FA1, 0x0FB4), (0x5A60, 0x5A8E)];

const PROTECTION_BITS: [&str; 11] = [
    "cell over-voltage",
    "cell under-voltage",
    "pack over-voltage",
    "pack under-voltage",
    "charge over-temperature",
    "charge under-temperature",
    "discharge over-temperature",
    "discharge under-temperature",
    "charge over-current",
    "discharge over-current",
    "short circuit",
];

const COMMANDS: [&str; 11] = [
    "map", "basic", "cell", "temp", "mos", "protect", "all", "scan", "addr", "get", "set",
];

/// Annotation for generic reads
pub fn describe(address: u16) -> Option<String> {
    let text = match address {
        0x0000 => "SOC (0.01 %)",
        0x0001 => "current (0.01 A, signed)",
        0x0002 => "pack voltage (0.01 V)",
        0x0005 => "remaining time (hi=h, lo=min)",
        0x000A => "charge MOS",
        0x000B => "discharge MOS",
        0x0010..=0x004F => return Some(format!("cell {} voltage (mV)", address - REG_CELLS + 1)),
        0x0062 => "protection bits",
        0x0063 => "series cell count",
        0x0064 => "RS485 address",
        0x0182 => "SOH (0.1 %)",
        _ => return None,
    };
    Some(text.to_string())
}

static PROFILE: RegisterProfile = RegisterProfile {
    name: NAME,
    read_codes: &[function::READ_HOLDING_REGISTERS, function::READ_INPUT_REGISTERS],
    default_read: function::READ_HOLDING_REGISTERS,
    write_codes: &[function::WRITE_SINGLE_REGISTER],
    default_write: function::WRITE_SINGLE_REGISTER,
    risky: RISKY,
    describe,
};

/// Charge state derived from current and (optionally) the charge MOS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeState {
    Charging,
    Discharging,
    Idle,
    /// Charge MOS closed but no charge current flowing
    ChargeAllowed,
    /// Charge MOS open
    NotCharging,
}

impl ChargeState {
    pub fn derive(current_a: f64, charge_mos: Option<u16>) -> Self {
        match charge_mos {
            Some(0) => ChargeState::NotCharging,
            Some(_) if current_a > IDLE_CURRENT_A => ChargeState::Charging,
            Some(_) => ChargeState::ChargeAllowed,
            None if current_a > IDLE_CURRENT_A => ChargeState::Charging,
            None if current_a < -IDLE_CURRENT_A => ChargeState::Discharging,
            None => ChargeState::Idle,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChargeState::Charging => "charging",
            ChargeState::Discharging => "discharging",
            ChargeState::Idle => "idle",
            ChargeState::ChargeAllowed => "charge allowed",
            ChargeState::NotCharging => "not charging",
        }
    }
}

/// Names of the protection bits set in `bits`
pub fn active_protections(bits: u16) -> Vec<&'static str> {
    PROTECTION_BITS
        .iter()
        .enumerate()
        .filter(|(i, _)| bits & (1 << i) != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Battery driver
pub struct BatteryDriver {
    transport: ModbusTcp,
    module_unit: u8,
    battery_unit: u8,
    confirm: Confirm,
}

impl BatteryDriver {
    pub fn new(config: &BatteryConfig, transport: ModbusTcp, confirm: Confirm) -> Self {
        Self {
            transport,
            module_unit: config.module_unit,
            battery_unit: config.battery_unit,
            confirm,
        }
    }

    pub fn battery_unit(&self) -> u8 {
        self.battery_unit
    }

    fn check_units(&self) -> Result<()> {
        if self.battery_unit == self.module_unit || self.battery_unit < 2 {
            return Err(Error::Format(format!(
                "invalid battery unit {} (module unit {})",
                self.battery_unit, self.module_unit
            )));
        }
        Ok(())
    }

    fn read(&mut self, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.transport
            .read_registers(self.battery_unit, function::READ_HOLDING_REGISTERS, address, quantity)
    }

    fn query_basic(&mut self, report: &mut Report) -> Result<()> {
        let values = self.read(REG_BASIC, BASIC_COUNT)?;
        let charge_mos = match self.read(REG_CHARGE_MOS, 1) {
            Ok(v) => Some(v[0]),
            Err(e) => {
                log::debug!("battery: charge MOS unavailable: {}", e);
                None
            }
        };

        let soc = values[0] as f64 * 0.01;
        let current = values[1] as i16 as f64 * 0.01;
        let voltage = values[2] as f64 * 0.01;
        let state = ChargeState::derive(current, charge_mos);
        let remaining = values[5];

        report.line(format!("[battery] unit={} basic", self.battery_unit));
        report.line(format!("  SOC: {:.2} %", soc));
        report.line(format!("  current: {:.2} A", current));
        report.line(format!("  voltage: {:.2} V", voltage));
        report.line(format!("  state: {}", state.label()));
        report.line(format!(
            "  remaining: {} h {} min",
            remaining >> 8,
            remaining & 0xFF
        ));
        Ok(())
    }

    fn query_cells(&mut self, report: &mut Report) -> Result<()> {
        let cells = self.read(REG_CELLS, CELL_COUNT)?;
        let max = cells.iter().copied().max().unwrap_or(0);
        let min = cells.iter().copied().min().unwrap_or(0);

        report.line(format!(
            "[battery] cells: max={} mV min={} mV delta={} mV",
            max,
            min,
            max - min
        ));
        for (i, mv) in cells.iter().enumerate() {
            report.line(format!("  cell {:02}: {} mV", i + 1, mv));
        }
        Ok(())
    }

    fn query_temps(&mut self, report: &mut Report) -> Result<()> {
        let temps = self.read(REG_TEMPS, TEMP_COUNT)?;
        report.line("[battery] temperatures:");
        for (i, raw) in temps.iter().enumerate() {
            report.line(format!("  NTC{}: {:.1} C", i + 1, *raw as i16 as f64 * 0.1));
        }
        Ok(())
    }

    fn query_mos(&mut self, report: &mut Report) -> Result<()> {
        let charge = self.read(REG_CHARGE_MOS, 1);
        let discharge = self.read(REG_DISCHARGE_MOS, 1);
        if let (Err(e), Err(_)) = (&charge, &discharge) {
            return Err(Error::Other(format!("MOS read failed: {}", e)));
        }

        let label = |r: &Result<Vec<u16>>| match r {
            Ok(v) if v[0] != 0 => "ON".to_string(),
            Ok(_) => "OFF".to_string(),
            Err(e) => format!("unavailable ({})", e),
        };
        report.line("[battery] MOS:");
        report.line(format!("  charge: {}", label(&charge)));
        report.line(format!("  discharge: {}", label(&discharge)));
        Ok(())
    }

    fn query_protection(&mut self, report: &mut Report) -> Result<()> {
        let bits = self.read(REG_PROTECTION, 1)?[0];
        let active = active_protections(bits);
        report.line(format!("[battery] protection bits=0x{:04X}", bits));
        if active.is_empty() {
            report.line("  none");
        }
        for name in active {
            report.line(format!("  {}", name));
        }
        Ok(())
    }

    /// Run one info section, or every section for `all`
    pub fn query_info(&mut self, section: &str, report: &mut Report) -> Result<String> {
        self.check_units()?;
        match section {
            "basic" => self.query_basic(report)?,
            "cell" => self.query_cells(report)?,
            "temp" => self.query_temps(report)?,
            "mos" => self.query_mos(report)?,
            "protect" => self.query_protection(report)?,
            "all" => {
                type Section = fn(&mut BatteryDriver, &mut Report) -> Result<()>;
                let sections: [(&str, Section); 5] = [
                    ("basic", Self::query_basic),
                    ("cell", Self::query_cells),
                    ("temp", Self::query_temps),
                    ("mos", Self::query_mos),
                    ("protect", Self::query_protection),
                ];
                let mut succeeded = 0;
                for (name, run) in sections {
                    match run(self, report) {
                        Ok(()) => succeeded += 1,
                        Err(e) => log::warn!("battery: {} section skipped: {}", name, e),
                    }
                }
                if succeeded == 0 {
                    return Err(Error::Other("battery: every section failed".to_string()));
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

    /// Probe unit ids in `[start, end]`, skipping the gateway module
    pub fn scan(&mut self, start: i64, end: i64, report: &mut Report) -> Result<String> {
        if start < MIN_UNIT || end > MAX_UNIT || start > end {
            return Err(Error::Format(format!(
                "scan range must satisfy {} <= start <= end <= {}",
                MIN_UNIT, MAX_UNIT
            )));
        }

        report.line(format!("[battery] scanning units {}..={}", start, end));
        let mut found = 0;
        for unit in start as u8..=end as u8 {
            if unit == self.module_unit {
                continue;
            }
            match self.transport.read_registers_timeout(
                unit,
                function::READ_HOLDING_REGISTERS,
                REG_VOLTAGE,
                1,
                SCAN_TIMEOUT,
            ) {
                Ok(values) => {
                    found += 1;
                    report.line(format!(
                        "  unit {}: voltage {:.2} V",
                        unit,
                        values[0] as f64 * 0.01
                    ));
                }
                Err(e) => log::debug!("battery scan: unit {} silent: {}", unit, e),
            }
        }
        report.line(format!("[battery] scan done, {} responder(s)", found));
        Ok(format!("{} responder(s)", found))
    }

    /// Change the battery's RS485 address and adopt it on success
    pub fn set_address(&mut self, new_unit: i64, report: &mut Report) -> Result<String> {
        if !(MIN_UNIT..=MAX_UNIT).contains(&new_unit) {
            return Err(Error::Format(format!(
                "battery address {} out of range [{}, {}]",
                new_unit, MIN_UNIT, MAX_UNIT
            )));
        }
        self.check_units()?;
        self.transport
            .write_register(self.battery_unit, REG_ADDRESS, new_unit as u16)?;

        report.line(format!(
            "[battery] address changed {} -> {}",
            self.battery_unit, new_unit
        ));
        log::info!("battery: unit id now {}", new_unit);
        self.battery_unit = new_unit as u8;
        Ok("address updated".to_string())
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
            "basic" | "cell" | "temp" | "mos" | "protect" | "all" => {
                self.query_info(command, report)
            }
            "scan" => {
                let start = arg_or(args, 1, "scan start", 1)?;
                let end = arg_or(args, 2, "scan end", 16)?;
                self.scan(start, end, report)
            }
            "addr" => {
                let Some(text) = args.get(1) else {
                    return Err(usage("battery addr <new_addr>"));
                };
                let new_unit = parse_in_range(text, "addr value", MIN_UNIT, MAX_UNIT)?;
                self.set_address(new_unit, report)
            }
            "get" => {
                self.check_units()?;
                PROFILE.read(&mut self.transport, self.battery_unit, args, report)
            }
            "set" => {
                self.check_units()?;
                PROFILE.write(&mut self.transport, self.battery_unit, &self.confirm, args, report)
            }
            other => Err(Error::UnknownCommand {
                sensor: NAME.to_string(),
                command: other.to_string(),
            }),
        }
    }
}

impl DriverAdapter for BatteryDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&mut self) -> Result<()> {
        self.check_units()?;
        log::info!(
            "battery: {} module unit {} battery unit {}",
            self.transport.endpoint(),
            self.module_unit,
            self.battery_unit
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
