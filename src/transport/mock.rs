//! Mock device and connector for testing
//!
//! [`MockDevice`] is an in-memory register/coil bank that answers Modbus PDUs.
//! [`MockConnector`] hands out connections to it and can be scripted to
//! refuse connects or swallow responses, which drives the retry paths.

use super::modbus::{self, function};
use super::{Connection, Connector, Endpoint};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// In-memory Modbus device serving any number of unit ids
#[derive(Clone, Default)]
pub struct MockDevice {
    inner: Arc<Mutex<DeviceState>>,
}

#[derive(Default)]
struct DeviceState {
    registers: HashMap<(u8, u16), u16>,
    coils: HashMap<(u8, u16), bool>,
    /// Units that answer every request with this exception code
    exceptions: HashMap<u8, u8>,
    /// Units that never answer
    silent: HashSet<u8>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_register(&self, unit: u8, address: u16, value: u16) {
        self.inner.lock().registers.insert((unit, address), value);
    }

    /// Set consecutive registers starting at `start`
    pub fn set_registers(&self, unit: u8, start: u16, values: &[u16]) {
        let mut state = self.inner.lock();
        for (i, &value) in values.iter().enumerate() {
            state.registers.insert((unit, start.wrapping_add(i as u16)), value);
        }
    }

    /// Register value, 0 when never written
    pub fn register(&self, unit: u8, address: u16) -> u16 {
        self.inner
            .lock()
            .registers
            .get(&(unit, address))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_coil(&self, unit: u8, address: u16, on: bool) {
        self.inner.lock().coils.insert((unit, address), on);
    }

    pub fn coil(&self, unit: u8, address: u16) -> bool {
        self.inner
            .lock()
            .coils
            .get(&(unit, address))
            .copied()
            .unwrap_or(false)
    }

    /// Make `unit` reply to everything with exception `code`
    pub fn set_exception(&self, unit: u8, code: u8) {
        self.inner.lock().exceptions.insert(unit, code);
    }

    /// Make `unit` never reply
    pub fn set_silent(&self, unit: u8) {
        self.inner.lock().silent.insert(unit);
    }

    /// Answer one request PDU addressed to `unit`; `None` means no reply
    pub fn respond_pdu(&self, unit: u8, pdu: &[u8]) -> Option<Vec<u8>> {
        let mut state = self.inner.lock();
        if state.silent.contains(&unit) {
            return None;
        }
        let fc = *pdu.first()?;
        if let Some(&code) = state.exceptions.get(&unit) {
            return Some(vec![fc | 0x80, code]);
        }
        if pdu.len() < 5 {
            return Some(vec![fc | 0x80, 0x03]);
        }
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let word = u16::from_be_bytes([pdu[3], pdu[4]]);

        match fc {
            function::READ_COILS => {
                let mut bytes = vec![0u8; (word as usize).div_ceil(8)];
                for i in 0..word {
                    let on = state
                        .coils
                        .get(&(unit, address.wrapping_add(i)))
                        .copied()
                        .unwrap_or(false);
                    if on {
                        bytes[i as usize / 8] |= 1 << (i % 8);
                    }
                }
                let mut out = vec![fc, bytes.len() as u8];
                out.extend_from_slice(&bytes);
                Some(out)
            }
            function::READ_HOLDING_REGISTERS | function::READ_INPUT_REGISTERS => {
                let mut out = vec![fc, (word * 2) as u8];
                for i in 0..word {
                    let value = state
                        .registers
                        .get(&(unit, address.wrapping_add(i)))
                        .copied()
                        .unwrap_or(0);
                    out.extend_from_slice(&value.to_be_bytes());
                }
                Some(out)
            }
            function::WRITE_SINGLE_COIL => {
                state.coils.insert((unit, address), word == modbus::COIL_ON);
                Some(pdu[..5].to_vec())
            }
            function::WRITE_SINGLE_REGISTER => {
                state.registers.insert((unit, address), word);
                Some(pdu[..5].to_vec())
            }
            function::WRITE_MULTIPLE_REGISTERS => {
                let values = pdu.get(6..6 + word as usize * 2)?;
                for (i, pair) in values.chunks_exact(2).enumerate() {
                    state.registers.insert(
                        (unit, address.wrapping_add(i as u16)),
                        u16::from_be_bytes([pair[0], pair[1]]),
                    );
                }
                Some(pdu[..5].to_vec())
            }
            _ => Some(vec![fc | 0x80, 0x01]),
        }
    }

    /// Answer one TCP request (MBAP framed)
    pub fn respond(&self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < modbus::HEADER_LEN + 1 {
            return None;
        }
        let transaction_id = u16::from_be_bytes([request[0], request[1]]);
        let unit = request[6];
        let pdu = self.respond_pdu(unit, &request[modbus::HEADER_LEN..])?;
        Some(modbus::wrap_tcp(transaction_id, unit, &pdu))
    }
}

/// Connector that serves a [`MockDevice`] instead of a socket
#[derive(Clone)]
pub struct MockConnector {
    device: MockDevice,
    state: Arc<Mutex<ConnectorState>>,
}

#[derive(Default)]
struct ConnectorState {
    fail_connects: usize,
    drop_responses: usize,
    connects: usize,
    open: usize,
    requests: Vec<Vec<u8>>,
}

impl MockConnector {
    pub fn new(device: MockDevice) -> Self {
        Self {
            device,
            state: Arc::new(Mutex::new(ConnectorState::default())),
        }
    }

    /// Refuse the next `n` connect attempts
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().fail_connects = n;
    }

    /// Accept the next `n` requests but never answer them
    pub fn drop_next_responses(&self, n: usize) {
        self.state.lock().drop_responses = n;
    }

    /// Connect attempts, including refused ones
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.state.lock().open
    }

    /// Every request sent so far, in order
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.lock().requests.clone()
    }

    pub fn device(&self) -> &MockDevice {
        &self.device
    }
}

impl Connector for MockConnector {
    fn connect(&self, endpoint: &Endpoint, _timeout: Duration) -> Result<Box<dyn Connection>> {
        let mut state = self.state.lock();
        state.connects += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(Error::Network(format!(
                "connect {} failed: connection refused",
                endpoint
            )));
        }
        state.open += 1;
        Ok(Box::new(MockConnection {
            device: self.device.clone(),
            state: Arc::clone(&self.state),
            pending: None,
        }))
    }
}

struct MockConnection {
    device: MockDevice,
    state: Arc<Mutex<ConnectorState>>,
    pending: Option<Vec<u8>>,
}

impl Connection for MockConnection {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        let dropped = {
            let mut state = self.state.lock();
            state.requests.push(data.to_vec());
            if state.drop_responses > 0 {
                state.drop_responses -= 1;
                true
            } else {
                false
            }
        };
        self.pending = if dropped {
            None
        } else {
            self.device.respond(data)
        };
        Ok(())
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let Some(response) = self.pending.take() else {
            return Ok(0);
        };
        let n = response.len().min(buffer.len());
        buffer[..n].copy_from_slice(&response[..n]);
        Ok(n)
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.open = state.open.saturating_sub(1);
    }
}
