//! Transport layer for register-protocol exchanges
//!
//! - [`rate_limiter`]: process-wide exchange serialization with per-endpoint spacing
//! - [`modbus`]: frame encoding and response decoding
//! - [`tcp`]: per-driver Modbus TCP client (fresh or pooled connections, one retry)
//! - [`rtu`]: Modbus RTU over a serial line
//! - [`mock`]: scripted in-memory device for tests

pub mod mock;
pub mod modbus;
pub mod rate_limiter;
pub mod rtu;
pub mod tcp;

pub use rate_limiter::{LockScope, RateGuard, RateLimiter};
pub use rtu::{ModbusRtu, SerialSettings};
pub use tcp::ModbusTcp;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Physical gateway address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Rate limiter key, `host:port`
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How a transport manages its socket between exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPolicy {
    /// Connect, exchange and close on every attempt
    #[default]
    Fresh,
    /// Keep a healthy connection for the next exchange; drop it on any failure
    Pooled,
}

/// One open byte-stream connection
pub trait Connection: Send {
    /// Send the whole buffer
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive once into `buffer`, returning the byte count
    fn receive(&mut self, buffer: &mut [u8]) -> Result<usize>;
}

/// Opens connections to an endpoint
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Box<dyn Connection>>;
}

/// Register-level operations shared by the TCP and RTU links
pub trait RegisterClient: Send {
    /// Read holding registers (function code 0x03)
    fn read_holding(&mut self, unit: u8, address: u16, quantity: u16) -> Result<Vec<u16>>;

    /// Write a block of holding registers (function code 0x10)
    fn write_registers(&mut self, unit: u8, address: u16, values: &[u16]) -> Result<()>;

    /// Human readable link description for logs
    fn describe(&self) -> String;
}

/// Blocking TCP connector with connect/send/receive timeouts
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

struct TcpConnection {
    stream: TcpStream,
}

impl Connector for TcpConnector {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Box<dyn Connection>> {
        let addr = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|e| Error::Network(format!("resolve {} failed: {}", endpoint, e)))?
            .next()
            .ok_or_else(|| Error::Network(format!("no address for {}", endpoint)))?;

        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| Error::Network(format!("connect {} failed: {}", endpoint, e)))?;
        stream
            .set_read_timeout(Some(timeout))
            .and_then(|_| stream.set_write_timeout(Some(timeout)))
            .map_err(|e| Error::Network(format!("set timeout on {} failed: {}", endpoint, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("set_nodelay on {} failed: {}", endpoint, e);
        }

        log::trace!("Connected to {}", endpoint);
        Ok(Box::new(TcpConnection { stream }))
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream
            .write_all(data)
            .and_then(|_| self.stream.flush())
            .map_err(|e| Error::Network(format!("send failed: {}", e)))
    }

    fn receive(&mut self, buffer: &mut [u8]) -> Result<usize> {
        self.stream
            .read(buffer)
            .map_err(|e| Error::Network(format!("no response: {}", e)))
    }
}
