//! Modbus TCP client owned by one driver
//!
//! Every exchange holds the [`RateLimiter`] guard for its endpoint from the
//! first connect until the retry (if any) has finished. A failed attempt is
//! retried exactly once over a brand new connection.

use super::modbus::{self, Frame, function};
use super::{Connection, ConnectionPolicy, Connector, Endpoint, RateLimiter, RegisterClient, TcpConnector};
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Receive buffer size for one response
const RECV_BUFFER_SIZE: usize = 1024;

/// Default connect/send/receive timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-driver Modbus TCP transport
pub struct ModbusTcp {
    endpoint: Endpoint,
    transaction_id: u16,
    timeout: Duration,
    policy: ConnectionPolicy,
    connector: Arc<dyn Connector>,
    limiter: Arc<RateLimiter>,
    /// Kept between exchanges only under [`ConnectionPolicy::Pooled`]
    pooled: Option<Box<dyn Connection>>,
}

impl ModbusTcp {
    /// Transport using real sockets, the process-wide limiter and fresh connections
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            transaction_id: 0,
            timeout: DEFAULT_TIMEOUT,
            policy: ConnectionPolicy::Fresh,
            connector: Arc::new(TcpConnector),
            limiter: RateLimiter::global(),
            pooled: None,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_policy(mut self, policy: ConnectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: u16) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    /// Build the next frame, advancing the transaction id for reads
    pub fn next_frame(&mut self, unit_id: u8, function_code: u8, address: u16, data_word: u16) -> Frame {
        if function::is_read(function_code) {
            self.transaction_id = self.transaction_id.wrapping_add(1);
        }
        Frame::new(self.transaction_id, unit_id, function_code, address, data_word)
    }

    /// One rate-limited request/response round trip with a single retry
    pub fn exchange(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let limiter = Arc::clone(&self.limiter);
        let _guard = limiter.acquire(&self.endpoint.key());

        match self.attempt(request, timeout) {
            Ok(response) => Ok(response),
            Err(first) => {
                log::warn!(
                    "{}: exchange failed ({}), retrying on a new connection",
                    self.endpoint,
                    first
                );
                self.pooled = None;
                self.attempt(request, timeout).inspect_err(|e| {
                    log::warn!("{}: retry failed: {}", self.endpoint, e);
                })
            }
        }
    }

    fn attempt(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let mut conn = match self.pooled.take() {
            Some(conn) => conn,
            None => self.connector.connect(&self.endpoint, timeout)?,
        };

        let result = round_trip(conn.as_mut(), request);
        log::trace!(
            "{}: tx [{}] rx {:?}",
            self.endpoint,
            modbus::hex_dump(request),
            result.as_ref().map(|r| modbus::hex_dump(r))
        );

        if result.is_ok() && self.policy == ConnectionPolicy::Pooled {
            self.pooled = Some(conn);
        }
        // Otherwise `conn` drops here, closing the socket
        result
    }

    /// Encode and exchange one single-word request
    pub fn request(
        &mut self,
        unit_id: u8,
        function_code: u8,
        address: u16,
        data_word: u16,
        timeout: Duration,
    ) -> Result<(Frame, Vec<u8>)> {
        let frame = self.next_frame(unit_id, function_code, address, data_word);
        let response = self.exchange(&frame.encode(), timeout)?;
        Ok((frame, response))
    }

    /// Read `quantity` registers with fc 0x03 or 0x04
    pub fn read_registers(&mut self, unit_id: u8, function_code: u8, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.read_registers_timeout(unit_id, function_code, address, quantity, self.timeout)
    }

    /// [`Self::read_registers`] with an explicit timeout
    pub fn read_registers_timeout(
        &mut self,
        unit_id: u8,
        function_code: u8,
        address: u16,
        quantity: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>> {
        if quantity == 0 || quantity > modbus::MAX_READ_QUANTITY {
            return Err(Error::Format(format!(
                "register quantity {} out of range [1, {}]",
                quantity,
                modbus::MAX_READ_QUANTITY
            )));
        }
        let (_, response) = self.request(unit_id, function_code, address, quantity, timeout)?;
        modbus::decode_registers(&response, function_code, quantity)
    }

    /// Read `count` coils with fc 0x01
    pub fn read_coils(&mut self, unit_id: u8, address: u16, count: u16) -> Result<Vec<bool>> {
        let (_, response) = self.request(unit_id, function::READ_COILS, address, count, self.timeout)?;
        modbus::decode_coils(&response, count)
    }

    /// Single write (fc 0x05 or 0x06); succeeds only on an exact echo
    pub fn write_single(&mut self, unit_id: u8, function_code: u8, address: u16, value: u16) -> Result<()> {
        let (frame, response) = self.request(unit_id, function_code, address, value, self.timeout)?;
        modbus::check_echo(&frame.encode(), &response)
    }

    /// Write one holding register (fc 0x06)
    pub fn write_register(&mut self, unit_id: u8, address: u16, value: u16) -> Result<()> {
        self.write_single(unit_id, function::WRITE_SINGLE_REGISTER, address, value)
    }

    /// Switch one coil (fc 0x05)
    pub fn write_coil(&mut self, unit_id: u8, address: u16, on: bool) -> Result<()> {
        let value = if on { modbus::COIL_ON } else { modbus::COIL_OFF };
        self.write_single(unit_id, function::WRITE_SINGLE_COIL, address, value)
    }
}

fn round_trip(conn: &mut dyn Connection, request: &[u8]) -> Result<Vec<u8>> {
    conn.send(request)?;
    let mut buffer = [0u8; RECV_BUFFER_SIZE];
    let n = conn.receive(&mut buffer)?;
    if n == 0 {
        return Err(Error::Network("no response".to_string()));
    }
    Ok(buffer[..n].to_vec())
}

impl RegisterClient for ModbusTcp {
    fn read_holding(&mut self, unit: u8, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.read_registers(unit, function::READ_HOLDING_REGISTERS, address, quantity)
    }

    fn write_registers(&mut self, unit: u8, address: u16, values: &[u16]) -> Result<()> {
        let pdu = modbus::write_multiple_pdu(address, values);
        let request = modbus::wrap_tcp(self.transaction_id, unit, &pdu);
        let response = self.exchange(&request, self.timeout)?;
        if response.len() < modbus::MIN_RESPONSE_LEN {
            return Err(Error::protocol(format!(
                "response too short: {} bytes",
                response.len()
            )));
        }
        modbus::check_write_multiple_pdu(&response[modbus::HEADER_LEN..], address, values.len() as u16)
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LockScope;
    use crate::transport::mock::{MockConnector, MockDevice};

    fn transport(connector: &MockConnector) -> ModbusTcp {
        ModbusTcp::new(Endpoint::new("10.0.0.1", 502))
            .with_connector(Arc::new(connector.clone()))
            .with_limiter(Arc::new(RateLimiter::new(Duration::ZERO, LockScope::Global)))
            .with_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_read_registers_roundtrip() {
        let device = MockDevice::new();
        device.set_register(2, 0x0002, 5234);
        let connector = MockConnector::new(device);
        let mut tcp = transport(&connector);

        assert_eq!(tcp.read_registers(2, 0x03, 0x0002, 1).unwrap(), vec![5234]);
        assert_eq!(connector.connect_count(), 1);
    }

    #[test]
    fn test_retry_after_connect_failure_is_transparent() {
        let device = MockDevice::new();
        device.set_register(1, 0x0000, 42);
        let connector = MockConnector::new(device);
        connector.fail_next_connects(1);
        let mut tcp = transport(&connector);

        assert_eq!(tcp.read_registers(1, 0x03, 0x0000, 1).unwrap(), vec![42]);
        assert_eq!(connector.connect_count(), 2);
    }

    #[test]
    fn test_retry_after_silent_response() {
        let device = MockDevice::new();
        let connector = MockConnector::new(device);
        connector.drop_next_responses(1);
        let mut tcp = transport(&connector);

        assert!(tcp.read_registers(1, 0x03, 0x0000, 1).is_ok());
        assert_eq!(connector.requests().len(), 2);
    }

    #[test]
    fn test_two_failures_surface_network_error() {
        let connector = MockConnector::new(MockDevice::new());
        connector.fail_next_connects(2);
        let mut tcp = transport(&connector);

        let err = tcp.read_registers(1, 0x03, 0x0000, 1).unwrap_err();
        assert!(err.is_network());
        assert_eq!(connector.connect_count(), 2);
    }

    #[test]
    fn test_fresh_policy_reconnects_every_exchange() {
        let connector = MockConnector::new(MockDevice::new());
        let mut tcp = transport(&connector);
        tcp.read_registers(1, 0x03, 0, 1).unwrap();
        tcp.read_registers(1, 0x03, 0, 1).unwrap();
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(connector.open_connections(), 0);
    }

    #[test]
    fn test_pooled_policy_reuses_connection() {
        let connector = MockConnector::new(MockDevice::new());
        let mut tcp = transport(&connector).with_policy(ConnectionPolicy::Pooled);
        tcp.read_registers(1, 0x03, 0, 1).unwrap();
        tcp.read_registers(1, 0x03, 0, 1).unwrap();
        assert_eq!(connector.connect_count(), 1);
    }

    #[test]
    fn test_transaction_id_advances_on_reads_only() {
        let connector = MockConnector::new(MockDevice::new());
        let mut tcp = transport(&connector).with_transaction_id(0x31A6);

        tcp.read_registers(1, 0x03, 0, 1).unwrap();
        assert_eq!(tcp.transaction_id(), 0x31A7);
        tcp.write_register(1, 0x0010, 7).unwrap();
        assert_eq!(tcp.transaction_id(), 0x31A7);
        tcp.read_coils(1, 0, 8).unwrap();
        assert_eq!(tcp.transaction_id(), 0x31A8);

        let requests = connector.requests();
        assert_eq!(&requests[1][..2], &[0x31, 0xA7]);
    }

    #[test]
    fn test_write_register_and_coil_echo() {
        let device = MockDevice::new();
        let connector = MockConnector::new(device.clone());
        let mut tcp = transport(&connector);

        tcp.write_register(3, 0x0001, 1).unwrap();
        assert_eq!(device.register(3, 0x0001), 1);

        tcp.write_coil(1, 4, true).unwrap();
        assert!(device.coil(1, 4));
        assert!(tcp.read_coils(1, 0, 8).unwrap()[4]);
    }

    #[test]
    fn test_exception_response_not_retried() {
        let device = MockDevice::new();
        device.set_exception(9, 0x0B);
        let connector = MockConnector::new(device);
        let mut tcp = transport(&connector);

        match tcp.read_registers(9, 0x03, 0, 1) {
            Err(Error::Protocol { code, .. }) => assert_eq!(code, Some(0x0B)),
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert_eq!(connector.requests().len(), 1);
    }

    #[test]
    fn test_quantity_out_of_range_rejected_before_io() {
        let connector = MockConnector::new(MockDevice::new());
        let mut tcp = transport(&connector);
        assert!(matches!(tcp.read_registers(1, 0x03, 0, 0), Err(Error::Format(_))));
        assert!(matches!(tcp.read_registers(1, 0x03, 0, 126), Err(Error::Format(_))));
        assert_eq!(connector.connect_count(), 0);
    }

    #[test]
    fn test_write_multiple_registers() {
        let device = MockDevice::new();
        let connector = MockConnector::new(device.clone());
        let mut tcp = transport(&connector);

        tcp.write_registers(1, 0x004A, &[0x0001, 0x0002]).unwrap();
        assert_eq!(device.register(1, 0x004A), 1);
        assert_eq!(device.register(1, 0x004B), 2);
    }
}
