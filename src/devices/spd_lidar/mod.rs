//! Single-point lidar family
//!
//! One adapter serves every configured instance. Each enabled instance owns
//! a [`FrameDecoder`] and an exchange function; commands are built from the
//! operator line, sent, and whatever comes back is pushed through the
//! decoder.

pub mod protocol;

use crate::config::{LidarInstanceConfig, SpdLidarConfig};
use crate::core::driver::DriverAdapter;
use crate::core::types::{Report, Status};
use crate::error::{Error, Result};
use crate::transport::{Connector, RateLimiter};
use protocol::{FrameDecoder, LidarFrame, build_command, format_hex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const NAME: &str = "spd_lidar";

/// Connect/send/receive timeout for one exchange
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(1);

const RECV_BUFFER_SIZE: usize = 256;

const COMMANDS: [&str; 3] = ["list", "status", "send"];

/// Sends one command and returns the bytes received
pub type Exchange = Box<dyn FnMut(&[u8]) -> Result<Vec<u8>> + Send>;

/// Exchange over a fresh TCP connection to the instance's target address
pub fn tcp_exchange(
    config: &LidarInstanceConfig,
    connector: Arc<dyn Connector>,
    limiter: Arc<RateLimiter>,
) -> Exchange {
    let target = config.target();
    Box::new(move |request: &[u8]| {
        let _guard = limiter.acquire(&target.key());
        let mut conn = connector.connect(&target, EXCHANGE_TIMEOUT)?;
        conn.send(request)?;
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        let n = conn.receive(&mut buffer)?;
        if n == 0 {
            return Err(Error::Network("empty response".to_string()));
        }
        Ok(buffer[..n].to_vec())
    })
}

/// One initialized lidar
struct LidarInstance {
    decoder: FrameDecoder,
    exchange: Exchange,
}

impl LidarInstance {
    fn send(&mut self, id: &str, command: &[u8], report: &mut Report) -> Result<usize> {
        report.line(format!("[spd_lidar:{}] send: {}", id, format_hex(command)));
        let response = (self.exchange)(command).inspect_err(|e| {
            report.line(format!("[spd_lidar:{}] net error: {}", id, e));
        })?;

        let frames = self.decoder.push(&response);
        for frame in &frames {
            report.line(format!("[spd_lidar:{}] {}", id, describe_frame(frame)));
        }
        if frames.is_empty() {
            report.line(format!(
                "[spd_lidar:{}] {} byte(s) received, waiting for a complete frame",
                id,
                response.len()
            ));
        }
        Ok(frames.len())
    }
}

/// `distance=Nmm (X.XXXm) status=0xHH checksum_ok=bool`
pub fn describe_frame(frame: &LidarFrame) -> String {
    format!(
        "distance={}mm ({:.3}m) status=0x{:02X} checksum_ok={}",
        frame.distance_mm,
        frame.distance_m(),
        frame.status,
        frame.checksum_ok
    )
}

/// Lidar family driver
pub struct SpdLidarDriver {
    /// Every configured instance, enabled or not, for `list`
    configured: Vec<LidarInstanceConfig>,
    /// Enabled instances keyed by id
    instances: BTreeMap<String, LidarInstance>,
}

impl SpdLidarDriver {
    /// Build instances that talk TCP through `connector`
    pub fn new(config: &SpdLidarConfig, connector: Arc<dyn Connector>, limiter: Arc<RateLimiter>) -> Self {
        Self::with_exchange(config, |instance| {
            tcp_exchange(instance, Arc::clone(&connector), Arc::clone(&limiter))
        })
    }

    /// Build instances with a caller-supplied exchange per instance
    pub fn with_exchange<F>(config: &SpdLidarConfig, mut make_exchange: F) -> Self
    where
        F: FnMut(&LidarInstanceConfig) -> Exchange,
    {
        let configured = config.effective_instances();
        let instances = configured
            .iter()
            .filter(|c| c.enable)
            .map(|c| {
                (
                    c.id.clone(),
                    LidarInstance {
                        decoder: FrameDecoder::new(),
                        exchange: make_exchange(c),
                    },
                )
            })
            .collect();
        Self {
            configured,
            instances,
        }
    }

    /// Ids of enabled instances, sorted
    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    fn list(&self, report: &mut Report) {
        report.line("[spd_lidar] configured instances:");
        for c in &self.configured {
            let mut line = format!(
                "  - id={} enable={} mode={} local={}:{} device={}:{} initialized={}",
                c.id,
                c.enable,
                c.mode.as_str(),
                c.local_ip,
                c.local_port,
                c.device_ip,
                c.device_port,
                self.instances.contains_key(&c.id)
            );
            if !c.role.is_empty() {
                line.push_str(&format!(" role={}", c.role));
            }
            line.push_str(&format!(" priority={}", c.priority));
            report.line(line);
        }
    }

    /// Send `payload` to one instance, or to every instance for `all`
    pub fn send(&mut self, target: &str, payload: &str, report: &mut Report) -> Result<String> {
        let command = build_command(payload)?;

        if target != "all" {
            let Some(instance) = self.instances.get_mut(target) else {
                return Err(Error::Other(format!("unknown spd_lidar id: {}", target)));
            };
            let frames = instance.send(target, &command, report)?;
            return Ok(format!("{} frame(s)", frames));
        }

        if self.instances.is_empty() {
            return Err(Error::Other("no enabled spd_lidar instance".to_string()));
        }
        let mut failures = 0;
        for (id, instance) in self.instances.iter_mut() {
            if let Err(e) = instance.send(id, &command, report) {
                log::warn!("spd_lidar:{} exchange failed: {}", id, e);
                failures += 1;
            }
        }
        if failures == self.instances.len() {
            return Err(Error::Network("every spd_lidar exchange failed".to_string()));
        }
        Ok(format!("sent to {} instance(s)", self.instances.len() - failures))
    }

    fn dispatch(&mut self, args: &[String], report: &mut Report) -> Result<String> {
        let Some(command) = args.first() else {
            return Err(Error::Format("missing command".to_string()));
        };
        match command.as_str() {
            "list" | "status" => {
                self.list(report);
                Ok("ok".to_string())
            }
            "send" => {
                if args.len() < 3 {
                    return Err(Error::Format(
                        "usage: spd_lidar send <id|all> <single|hex bytes>".to_string(),
                    ));
                }
                let payload = args[2..].join(" ");
                self.send(&args[1], &payload, report)
            }
            other => Err(Error::UnknownCommand {
                sensor: NAME.to_string(),
                command: other.to_string(),
            }),
        }
    }
}

impl DriverAdapter for SpdLidarDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&mut self) -> Result<()> {
        for c in self.configured.iter().filter(|c| c.enable) {
            log::info!("spd_lidar:{} {} mode, target {}", c.id, c.mode.as_str(), c.target());
        }
        Ok(())
    }

    fn query(&mut self, args: &[String], report: &mut Report) -> Status {
        self.dispatch(args, report).into()
    }

    fn available_commands(&self) -> Vec<String> {
        COMMANDS.iter().map(|s| s.to_string()).collect()
    }
}
