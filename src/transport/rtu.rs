//! Modbus RTU over a serial line
//!
//! Frame: `[unit][pdu...][crc_lo][crc_hi]`, CRC-16/MODBUS (poly 0xA001, init 0xFFFF).
//! The port stays open between exchanges; spacing and serialization still go
//! through the [`RateLimiter`], keyed by device path.

use super::modbus::{self, function};
use super::{RateLimiter, RegisterClient};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default response timeout
const RTU_TIMEOUT: Duration = Duration::from_millis(500);
/// Per-read port timeout while collecting a response
const RTU_POLL: Duration = Duration::from_millis(10);

/// Anything a response can be read from and a request written to
pub trait SerialLink: Read + Write + Send {}

impl<T: Read + Write + Send> SerialLink for T {}

/// Serial line parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub device: String,
    pub baud: u32,
    /// `N`, `E` or `O`
    pub parity: char,
    pub data_bits: u8,
    pub stop_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud: 9600,
            parity: 'N',
            data_bits: 8,
            stop_bits: 1,
        }
    }
}

impl SerialSettings {
    fn parity(&self) -> Result<Parity> {
        match self.parity.to_ascii_uppercase() {
            'N' => Ok(Parity::None),
            'E' => Ok(Parity::Even),
            'O' => Ok(Parity::Odd),
            other => Err(Error::Config(format!("unsupported parity '{}'", other))),
        }
    }

    fn data_bits(&self) -> Result<DataBits> {
        match self.data_bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(Error::Config(format!("unsupported data bits {}", other))),
        }
    }

    fn stop_bits(&self) -> Result<StopBits> {
        match self.stop_bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(Error::Config(format!("unsupported stop bits {}", other))),
        }
    }
}

/// CRC-16/MODBUS
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Build an RTU frame from unit id and PDU
pub fn encode_rtu(unit: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(unit);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Validate CRC and unit id, returning the response PDU
pub fn decode_rtu(unit: u8, frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < 5 {
        return Err(Error::protocol(format!("RTU frame too short: {} bytes", frame.len())));
    }
    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    let actual = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if expected != actual {
        return Err(Error::protocol(format!(
            "RTU CRC mismatch: expected {:#06x}, got {:#06x}",
            expected, actual
        )));
    }
    if body[0] != unit {
        return Err(Error::protocol(format!(
            "RTU unit mismatch: expected {}, got {}",
            unit, body[0]
        )));
    }
    Ok(&body[1..])
}

/// Modbus RTU client on one serial device
pub struct ModbusRtu {
    label: String,
    port: Box<dyn SerialLink>,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
}

impl ModbusRtu {
    /// Open the serial device described by `settings`
    pub fn open(settings: &SerialSettings, limiter: Arc<RateLimiter>) -> Result<Self> {
        let port = serialport::new(&settings.device, settings.baud)
            .data_bits(settings.data_bits()?)
            .parity(settings.parity()?)
            .stop_bits(settings.stop_bits()?)
            .flow_control(FlowControl::None)
            .timeout(RTU_POLL)
            .open()?;

        log::info!(
            "Opened serial port: {} at {} baud ({}{}{})",
            settings.device,
            settings.baud,
            settings.data_bits,
            settings.parity,
            settings.stop_bits
        );
        Ok(Self::from_link(&settings.device, Box::new(port), limiter))
    }

    /// Wrap an already open link
    pub fn from_link(label: &str, port: Box<dyn SerialLink>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            label: label.to_string(),
            port,
            limiter,
            timeout: RTU_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one PDU and return the validated response PDU, retrying once
    pub fn exchange(&mut self, unit: u8, pdu: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let limiter = Arc::clone(&self.limiter);
        let _guard = limiter.acquire(&self.label);

        let request = encode_rtu(unit, pdu);
        let raw = match self.attempt(&request, expected_len) {
            Ok(raw) => raw,
            Err(first) => {
                log::warn!("{}: RTU exchange failed ({}), retrying", self.label, first);
                self.attempt(&request, expected_len)?
            }
        };
        decode_rtu(unit, &raw).map(|pdu| pdu.to_vec())
    }

    fn attempt(&mut self, request: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        self.port
            .write_all(request)
            .and_then(|_| self.port.flush())
            .map_err(|e| Error::Network(format!("{}: send failed: {}", self.label, e)))?;

        let deadline = Instant::now() + self.timeout;
        let mut response = Vec::with_capacity(expected_len);
        let mut chunk = [0u8; 256];
        while Instant::now() < deadline {
            match self.port.read(&mut chunk) {
                Ok(0) => thread::sleep(Duration::from_millis(1)),
                Ok(n) => response.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    return Err(Error::Network(format!("{}: read failed: {}", self.label, e)));
                }
            }
            // Exception replies are always 5 bytes
            let is_exception = response.len() >= 5 && response[1] & 0x80 != 0;
            if response.len() >= expected_len || is_exception {
                return Ok(response);
            }
        }

        if response.is_empty() {
            Err(Error::Network(format!("{}: no response", self.label)))
        } else {
            Err(Error::Network(format!(
                "{}: incomplete response ({} of {} bytes)",
                self.label,
                response.len(),
                expected_len
            )))
        }
    }
}

impl RegisterClient for ModbusRtu {
    fn read_holding(&mut self, unit: u8, address: u16, quantity: u16) -> Result<Vec<u16>> {
        let pdu = modbus::Frame::new(0, unit, function::READ_HOLDING_REGISTERS, address, quantity).pdu();
        // unit + fc + count + data + crc
        let expected = 5 + quantity as usize * 2;
        let response = self.exchange(unit, &pdu, expected)?;
        modbus::decode_registers_pdu(&response, function::READ_HOLDING_REGISTERS, quantity)
    }

    fn write_registers(&mut self, unit: u8, address: u16, values: &[u16]) -> Result<()> {
        let pdu = modbus::write_multiple_pdu(address, values);
        // unit + fc + addr + qty + crc
        let response = self.exchange(unit, &pdu, 8)?;
        modbus::check_write_multiple_pdu(&response, address, values.len() as u16)
    }

    fn describe(&self) -> String {
        format!("rtu {}", self.label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LockScope;
    use crate::transport::mock::MockDevice;
    use std::collections::VecDeque;

    /// Serial link answering through a [`MockDevice`]
    struct LoopbackLink {
        device: MockDevice,
        rx: VecDeque<u8>,
        corrupt: bool,
    }

    impl Read for LoopbackLink {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.rx.len().min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.rx.pop_front().unwrap_or(0);
            }
            Ok(n)
        }
    }

    impl Write for LoopbackLink {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            let unit = data[0];
            let pdu = &data[1..data.len() - 2];
            if let Some(reply) = self.device.respond_pdu(unit, pdu) {
                let mut frame = encode_rtu(unit, &reply);
                if self.corrupt {
                    let last = frame.len() - 1;
                    frame[last] ^= 0xFF;
                }
                self.rx.extend(frame);
            }
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn rtu(device: &MockDevice, corrupt: bool) -> ModbusRtu {
        let link = LoopbackLink {
            device: device.clone(),
            rx: VecDeque::new(),
            corrupt,
        };
        ModbusRtu::from_link(
            "/dev/ttyTEST",
            Box::new(link),
            Arc::new(RateLimiter::new(Duration::ZERO, LockScope::Global)),
        )
        .with_timeout(Duration::from_millis(50))
    }

    #[test]
    fn test_crc16_known_vector() {
        // 01 03 00 00 00 01 -> CRC 84 0A on the wire
        let frame = encode_rtu(0x01, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn test_decode_rtu_rejects_bad_crc() {
        let mut frame = encode_rtu(0x01, &[0x03, 0x02, 0x00, 0x05]);
        assert_eq!(decode_rtu(0x01, &frame).unwrap(), &[0x03, 0x02, 0x00, 0x05]);
        frame[3] ^= 0x01;
        assert!(decode_rtu(0x01, &frame).is_err());
    }

    #[test]
    fn test_read_holding_over_rtu() {
        let device = MockDevice::new();
        device.set_registers(1, 0x0000, &[0x0000, 0x000C, 0x000C, 4096]);
        let mut client = rtu(&device, false);
        assert_eq!(
            client.read_holding(1, 0x0000, 4).unwrap(),
            vec![0x0000, 0x000C, 0x000C, 4096]
        );
    }

    #[test]
    fn test_write_registers_over_rtu() {
        let device = MockDevice::new();
        let mut client = rtu(&device, false);
        client.write_registers(1, 0x004A, &[0xFFFF, 0xFFFE]).unwrap();
        assert_eq!(device.register(1, 0x004B), 0xFFFE);
    }

    #[test]
    fn test_silent_unit_is_network_error() {
        let device = MockDevice::new();
        device.set_silent(1);
        let mut client = rtu(&device, false);
        assert!(client.read_holding(1, 0, 1).unwrap_err().is_network());
    }

    #[test]
    fn test_corrupt_crc_is_protocol_error() {
        let device = MockDevice::new();
        let mut client = rtu(&device, true);
        assert!(matches!(
            client.read_holding(1, 0, 1),
            Err(Error::Protocol { .. })
        ));
    }

    #[test]
    fn test_serial_settings_validation() {
        let mut settings = SerialSettings::default();
        assert!(settings.parity().is_ok());
        settings.parity = 'X';
        assert!(settings.parity().is_err());
        settings.data_bits = 9;
        assert!(settings.data_bits().is_err());
    }
}
