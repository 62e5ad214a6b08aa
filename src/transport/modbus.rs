//! Modbus frame encoding and response decoding
//!
//! Request (12 bytes, big-endian):
//! `[tid:2][pid=0:2][len=6:2][unit][fc][addr:2][data:2]`
//!
//! Response: `[tid:2][pid:2][len:2][unit][fc][byte_count][payload...]`.
//! A response whose function code differs from the request carries the
//! device exception code in the byte after it.
//!
//! Length checks use an "at least" policy: trailing bytes after the declared
//! payload are tolerated.

use crate::error::{Error, Result};

/// Function codes used by the drivers
pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

    /// Reads advance the transaction id; writes reuse it
    pub fn is_read(fc: u8) -> bool {
        matches!(fc, READ_COILS | READ_HOLDING_REGISTERS | READ_INPUT_REGISTERS)
    }
}

/// Encoded single-word request size
pub const REQUEST_LEN: usize = 12;
/// MBAP header plus unit id
pub const HEADER_LEN: usize = 7;
/// Smallest meaningful response: header, fc, byte count / exception code
pub const MIN_RESPONSE_LEN: usize = 9;
/// Largest register quantity a single read may request
pub const MAX_READ_QUANTITY: u16 = 125;
/// Coil values for write single coil
pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

/// One single-word request
///
/// `data_word` is the quantity for reads and the value for single writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub function_code: u8,
    pub address: u16,
    pub data_word: u16,
}

impl Frame {
    pub fn new(transaction_id: u16, unit_id: u8, function_code: u8, address: u16, data_word: u16) -> Self {
        Self {
            transaction_id,
            unit_id,
            function_code,
            address,
            data_word,
        }
    }

    /// Protocol data unit: `[fc][addr:2][data:2]`
    pub fn pdu(&self) -> [u8; 5] {
        let [ah, al] = self.address.to_be_bytes();
        let [dh, dl] = self.data_word.to_be_bytes();
        [self.function_code, ah, al, dh, dl]
    }

    /// 12-byte TCP request
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let [th, tl] = self.transaction_id.to_be_bytes();
        let pdu = self.pdu();
        [
            th,
            tl,
            0x00,
            0x00,
            0x00,
            0x06,
            self.unit_id,
            pdu[0],
            pdu[1],
            pdu[2],
            pdu[3],
            pdu[4],
        ]
    }
}

/// PDU for write multiple registers: `[0x10][addr:2][qty:2][byte_count][values...]`
pub fn write_multiple_pdu(address: u16, values: &[u16]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(function::WRITE_MULTIPLE_REGISTERS);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push((values.len() * 2) as u8);
    for value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    pdu
}

/// Wrap a PDU in an MBAP header
pub fn wrap_tcp(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + pdu.len());
    out.extend_from_slice(&transaction_id.to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    out.push(unit_id);
    out.extend_from_slice(pdu);
    out
}

/// Strip the MBAP header, returning the response PDU
fn response_pdu(response: &[u8]) -> Result<&[u8]> {
    if response.len() < MIN_RESPONSE_LEN {
        return Err(Error::protocol(format!(
            "response too short: {} bytes",
            response.len()
        )));
    }
    Ok(&response[HEADER_LEN..])
}

/// Check the function code and return the declared payload
fn pdu_payload(pdu: &[u8], function_code: u8) -> Result<&[u8]> {
    if pdu.len() < 2 {
        return Err(Error::protocol("response PDU too short"));
    }
    if pdu[0] != function_code {
        return Err(Error::exception(pdu[1]));
    }
    let byte_count = pdu[1] as usize;
    if pdu.len() < 2 + byte_count {
        return Err(Error::protocol(format!(
            "payload truncated: declared {} bytes, got {}",
            byte_count,
            pdu.len() - 2
        )));
    }
    Ok(&pdu[2..2 + byte_count])
}

/// Decode a register read from a response PDU
pub fn decode_registers_pdu(pdu: &[u8], function_code: u8, quantity: u16) -> Result<Vec<u16>> {
    let payload = pdu_payload(pdu, function_code)?;
    let needed = quantity as usize * 2;
    if payload.len() < needed {
        return Err(Error::protocol(format!(
            "payload {} bytes, need {} for {} registers",
            payload.len(),
            needed,
            quantity
        )));
    }
    Ok(payload[..needed]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Decode a register read from a full TCP response
pub fn decode_registers(response: &[u8], function_code: u8, quantity: u16) -> Result<Vec<u16>> {
    decode_registers_pdu(response_pdu(response)?, function_code, quantity)
}

/// Decode a coil read (fc 0x01) from a full TCP response
///
/// Coil `i` is bit `i % 8` of payload byte `i / 8`.
pub fn decode_coils(response: &[u8], count: u16) -> Result<Vec<bool>> {
    let payload = pdu_payload(response_pdu(response)?, function::READ_COILS)?;
    let needed = (count as usize).div_ceil(8);
    if payload.len() < needed {
        return Err(Error::protocol(format!(
            "coil payload {} bytes, need {}",
            payload.len(),
            needed
        )));
    }
    Ok((0..count as usize)
        .map(|i| payload[i / 8] & (1 << (i % 8)) != 0)
        .collect())
}

/// Check a write multiple response PDU echoes address and quantity
pub fn check_write_multiple_pdu(pdu: &[u8], address: u16, quantity: u16) -> Result<()> {
    if pdu.len() < 2 {
        return Err(Error::protocol("response PDU too short"));
    }
    if pdu[0] != function::WRITE_MULTIPLE_REGISTERS {
        return Err(Error::exception(pdu[1]));
    }
    if pdu.len() < 5 {
        return Err(Error::protocol("write multiple response too short"));
    }
    let echoed_addr = u16::from_be_bytes([pdu[1], pdu[2]]);
    let echoed_qty = u16::from_be_bytes([pdu[3], pdu[4]]);
    if echoed_addr != address || echoed_qty != quantity {
        return Err(Error::protocol(format!(
            "write multiple echo mismatch: addr {:#06x} qty {}",
            echoed_addr, echoed_qty
        )));
    }
    Ok(())
}

/// Check a single-write response echoes the request
///
/// A shorter or different reply with the exception bit set maps to the device code.
pub fn check_echo(request: &[u8], response: &[u8]) -> Result<()> {
    if response.len() >= request.len() && response[..request.len()] == *request {
        return Ok(());
    }
    if response.len() >= MIN_RESPONSE_LEN && response[7] & 0x80 != 0 {
        return Err(Error::exception(response[8]));
    }
    Err(Error::protocol("write not confirmed: response does not echo request"))
}

/// Format bytes as space separated upper-case hex
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
