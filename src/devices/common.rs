//! Generic `get`/`set` register commands shared by the gateway drivers

use crate::core::types::{Confirm, Report, RiskyRange, confirm_write, parse_in_range};
use crate::error::{Error, Result};
use crate::transport::ModbusTcp;
use crate::transport::modbus::{MAX_READ_QUANTITY, function};

/// What a driver allows for raw register access
pub struct RegisterProfile {
    /// Output prefix, e.g. `battery`
    pub name: &'static str,
    pub read_codes: &'static [u8],
    pub default_read: u8,
    pub write_codes: &'static [u8],
    pub default_write: u8,
    pub risky: &'static [RiskyRange],
    pub describe: fn(u16) -> Option<String>,
}

/// Parsed `get <addr> [qty] [fc]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: u16,
    pub quantity: u16,
    pub function_code: u8,
}

/// Parsed `set <addr> <value> [fc]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRequest {
    pub address: u16,
    pub value: u16,
    pub function_code: u8,
}

impl RegisterProfile {
    /// Parse `get` arguments (`args[0]` is the sub-command)
    pub fn parse_read(&self, args: &[String]) -> Result<ReadRequest> {
        let Some(addr) = args.get(1) else {
            return Err(Error::Format(format!(
                "usage: {} get <addr> [qty] [fc]",
                self.name
            )));
        };
        let address = parse_in_range(addr, "addr", 0, 0xFFFF)? as u16;
        let quantity = match args.get(2) {
            Some(text) => parse_in_range(text, "qty", 1, MAX_READ_QUANTITY as i64)? as u16,
            None => 1,
        };
        let function_code = match args.get(3) {
            Some(text) => parse_in_range(text, "fc", 0, 0xFF)? as u8,
            None => self.default_read,
        };
        if !self.read_codes.contains(&function_code) {
            return Err(Error::Format(format!(
                "{} read does not support fc {:#04x}",
                self.name, function_code
            )));
        }
        Ok(ReadRequest {
            address,
            quantity,
            function_code,
        })
    }

    /// Parse `set` arguments (`args[0]` is the sub-command)
    pub fn parse_write(&self, args: &[String]) -> Result<WriteRequest> {
        if args.len() < 3 {
            return Err(Error::Format(format!(
                "usage: {} set <addr> <value> [fc]",
                self.name
            )));
        }
        let address = parse_in_range(&args[1], "addr", 0, 0xFFFF)? as u16;
        let value = parse_in_range(&args[2], "value", 0, 0xFFFF)? as u16;
        let function_code = match args.get(3) {
            Some(text) => parse_in_range(text, "fc", 0, 0xFF)? as u8,
            None => self.default_write,
        };
        if !self.write_codes.contains(&function_code) {
            return Err(Error::Format(format!(
                "{} write does not support fc {:#04x}",
                self.name, function_code
            )));
        }
        Ok(WriteRequest {
            address,
            value,
            function_code,
        })
    }

    /// Run a generic read and print one line per register
    pub fn read(&self, transport: &mut ModbusTcp, unit: u8, args: &[String], report: &mut Report) -> Result<String> {
        let request = self.parse_read(args)?;
        let values = transport.read_registers(unit, request.function_code, request.address, request.quantity)?;

        report.line(format!(
            "[{}] read unit={} fc={:#04x} addr=0x{:04X} qty={}",
            self.name, unit, request.function_code, request.address, request.quantity
        ));
        for (i, value) in values.iter().enumerate() {
            let address = request.address.wrapping_add(i as u16);
            let description = (self.describe)(address).unwrap_or_else(|| "-".to_string());
            report.line(format!(
                "  0x{:04X} = {} (0x{:04X}) | {}",
                address, value, value, description
            ));
        }
        Ok("ok".to_string())
    }

    /// Run a generic write after confirming risky addresses
    ///
    /// For fc 0x05 any non-zero value switches the coil on.
    pub fn write(
        &self,
        transport: &mut ModbusTcp,
        unit: u8,
        confirm: &Confirm,
        args: &[String],
        report: &mut Report,
    ) -> Result<String> {
        let request = self.parse_write(args)?;
        confirm_write(confirm, self.risky, request.address)?;

        if request.function_code == function::WRITE_SINGLE_COIL {
            transport.write_coil(unit, request.address, request.value != 0)?;
        } else {
            transport.write_single(unit, request.function_code, request.address, request.value)?;
        }

        report.line(format!(
            "[{}] write ok unit={} fc={:#04x} addr=0x{:04X} value={} (0x{:04X})",
            self.name, unit, request.function_code, request.address, request.value, request.value
        ));
        Ok("write ok".to_string())
    }
}

/// `usage` error helper for driver sub-commands
pub(crate) fn usage(text: &str) -> Error {
    Error::Format(format!("usage: {}", text))
}

/// Owned argument list from string slices
#[cfg(test)]
pub(crate) fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_description(_: u16) -> Option<String> {
        None
    }

    static PROFILE: RegisterProfile = RegisterProfile {
        name: "test",
        read_codes: &[0x03, 0x04],
        default_read: 0x03,
        write_codes: &[0x06],
        default_write: 0x06,
        risky: &[(0x0FA1, 0x0FB4)],
        describe: no_description,
    };

    #[test]
    fn test_parse_read_defaults() {
        let request = PROFILE.parse_read(&args(&["get", "0x0010"])).unwrap();
        assert_eq!(
            request,
            ReadRequest {
                address: 0x0010,
                quantity: 1,
                function_code: 0x03
            }
        );
    }

    #[test]
    fn test_parse_read_rejects_bad_input() {
        assert!(PROFILE.parse_read(&args(&["get"])).is_err());
        assert!(PROFILE.parse_read(&args(&["get", "0x10", "126"])).is_err());
        assert!(PROFILE.parse_read(&args(&["get", "0x10", "0"])).is_err());
        assert!(PROFILE.parse_read(&args(&["get", "0x10", "1", "6"])).is_err());
        assert!(PROFILE.parse_read(&args(&["get", "zz"])).is_err());
    }

    #[test]
    fn test_parse_write() {
        let request = PROFILE.parse_write(&args(&["set", "100", "0x5"])).unwrap();
        assert_eq!(request.address, 100);
        assert_eq!(request.value, 5);
        assert_eq!(request.function_code, 0x06);
        assert!(PROFILE.parse_write(&args(&["set", "100"])).is_err());
        assert!(PROFILE.parse_write(&args(&["set", "100", "1", "3"])).is_err());
        assert!(PROFILE.parse_write(&args(&["set", "100", "70000"])).is_err());
    }
}
