//! Multi-turn absolute encoder
//!
//! The encoder is read over Modbus RTU (serial) or Modbus TCP. Once running,
//! a background reader polls the position block every `sample_ms` and keeps
//! the latest smoothed sample for `get`.
//!
//! Position block (holding registers, 0x0000..=0x0003):
//! - 0x0000/0x0001: whole turns, signed 32-bit, high word first
//! - 0x0003: fractional turn in 1/8192 steps
//!
//! The position preset at 0x004A takes a signed 32-bit turn count via fc 0x10.

use crate::config::EncoderConfig;
use crate::core::driver::DriverAdapter;
use crate::core::types::{Confirm, Report, Status, confirm_write, parse_int};
use crate::error::{Error, Result};
use crate::transport::RegisterClient;
use chrono::{Local, TimeZone};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NAME: &str = "multi_turn_encoder";

const REG_POSITION: u16 = 0x0000;
const POSITION_COUNT: u16 = 4;
const REG_PRESET: u16 = 0x004A;
const FRACTION_STEPS: f64 = 8192.0;

const RISKY: &[(u16, u16)] = &[(0x0044, 0x004A)];

const COMMANDS: [&str; 6] = ["connect", "run", "get", "status", "stop", "setpos"];

/// Opens the register link; called on every `connect`
pub type LinkFactory = Box<dyn Fn() -> Result<Box<dyn RegisterClient>> + Send>;

type SharedLink = Arc<Mutex<Box<dyn RegisterClient>>>;

/// Latest reading published by the background reader
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncoderSample {
    /// Unix time of the reading in seconds, 0 before the first reading
    pub timestamp: f64,
    /// Seconds since the previous reading
    pub duration: f64,
    pub turns_raw: f64,
    pub turns_filtered: f64,
    /// Turns per second, from the filtered position
    pub velocity: f64,
}

impl EncoderSample {
    pub fn is_valid(&self) -> bool {
        self.timestamp > 0.0
    }
}

/// Turn count from the 4-register position block
pub fn decode_turns(registers: &[u16]) -> f64 {
    let whole = (((registers[0] as u32) << 16) | registers[1] as u32) as i32;
    whole as f64 + registers[3] as f64 / FRACTION_STEPS
}

/// High and low preset words for a signed turn count
pub fn preset_words(turns: i32) -> [u16; 2] {
    let bits = turns as u32;
    [(bits >> 16) as u16, bits as u16]
}

/// Exponential smoothing plus velocity estimate
#[derive(Debug, Clone)]
pub struct PositionFilter {
    alpha: f64,
    last: Option<EncoderSample>,
}

impl PositionFilter {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, last: None }
    }

    /// Fold in a raw reading taken at `timestamp` seconds
    pub fn update(&mut self, turns_raw: f64, timestamp: f64) -> EncoderSample {
        let sample = match self.last {
            None => EncoderSample {
                timestamp,
                duration: 0.0,
                turns_raw,
                turns_filtered: turns_raw,
                velocity: 0.0,
            },
            Some(prev) => {
                let filtered = self.alpha * turns_raw + (1.0 - self.alpha) * prev.turns_filtered;
                let dt = timestamp - prev.timestamp;
                let velocity = if dt > 0.0 {
                    (filtered - prev.turns_filtered) / dt
                } else {
                    prev.velocity
                };
                EncoderSample {
                    timestamp,
                    duration: dt,
                    turns_raw,
                    turns_filtered: filtered,
                    velocity,
                }
            }
        };
        self.last = Some(sample);
        sample
    }
}

/// Local wall-clock rendering of an epoch timestamp
fn format_local(timestamp: f64) -> String {
    if timestamp <= 0.0 {
        return "n/a".to_string();
    }
    match Local.timestamp_millis_opt((timestamp * 1000.0) as i64).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => "n/a".to_string(),
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Encoder driver
pub struct EncoderDriver {
    unit: u8,
    sample_period: Duration,
    alpha: f64,
    confirm: Confirm,
    factory: LinkFactory,
    link: Option<SharedLink>,
    latest: Arc<Mutex<EncoderSample>>,
    shutdown: Arc<AtomicBool>,
    error_count: Arc<AtomicU64>,
    reader_handle: Option<JoinHandle<()>>,
}

impl EncoderDriver {
    pub fn new(config: &EncoderConfig, factory: LinkFactory, confirm: Confirm) -> Self {
        Self {
            unit: config.unit,
            sample_period: Duration::from_millis(config.sample_ms.max(1)),
            alpha: config.filter_alpha,
            confirm,
            factory,
            link: None,
            latest: Arc::new(Mutex::new(EncoderSample::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
            error_count: Arc::new(AtomicU64::new(0)),
            reader_handle: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.reader_handle.is_some()
    }

    /// Latest published sample
    pub fn latest(&self) -> EncoderSample {
        *self.latest.lock()
    }

    /// Open the link and probe the position block once
    pub fn connect(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        let mut client = (self.factory)()?;
        client.read_holding(self.unit, REG_POSITION, POSITION_COUNT)?;
        log::info!("Encoder connected via {} (unit {})", client.describe(), self.unit);
        self.link = Some(Arc::new(Mutex::new(client)));
        Ok(())
    }

    /// Start the background reader
    pub fn run(&mut self) -> Result<()> {
        if self.reader_handle.is_some() {
            return Ok(());
        }
        let Some(link) = self.link.as_ref().map(Arc::clone) else {
            return Err(Error::Other("encoder not connected".to_string()));
        };

        self.shutdown.store(false, Ordering::Relaxed);
        let shutdown = Arc::clone(&self.shutdown);
        let latest = Arc::clone(&self.latest);
        let error_count = Arc::clone(&self.error_count);
        let unit = self.unit;
        let period = self.sample_period;
        let filter = PositionFilter::new(self.alpha);

        self.reader_handle = Some(
            thread::Builder::new()
                .name("encoder-reader".to_string())
                .spawn(move || {
                    Self::reader_loop(link, unit, period, filter, shutdown, latest, error_count);
                })
                .map_err(|e| Error::Other(format!("Failed to spawn encoder thread: {}", e)))?,
        );

        log::info!("Encoder reader started ({} ms period)", period.as_millis());
        Ok(())
    }

    fn reader_loop(
        link: SharedLink,
        unit: u8,
        period: Duration,
        mut filter: PositionFilter,
        shutdown: Arc<AtomicBool>,
        latest: Arc<Mutex<EncoderSample>>,
        error_count: Arc<AtomicU64>,
    ) {
        while !shutdown.load(Ordering::Relaxed) {
            let reading = link.lock().read_holding(unit, REG_POSITION, POSITION_COUNT);
            match reading {
                Ok(registers) => {
                    let sample = filter.update(decode_turns(&registers), now_epoch());
                    *latest.lock() = sample;
                }
                Err(e) => {
                    let errors = error_count.fetch_add(1, Ordering::Relaxed) + 1;
                    log::warn!("Encoder read error #{}: {}", errors, e);
                }
            }
            thread::sleep(period);
        }

        log::info!("Encoder reader thread exiting");
    }

    /// Stop the background reader and wait for it
    pub fn stop_reader(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader_handle.take() {
            handle.join().map_err(|_| Error::ThreadPanic)?;
            log::info!("Encoder reader stopped");
        }
        Ok(())
    }

    /// Preset the absolute position to `turns`
    pub fn set_position(&mut self, turns: i32) -> Result<()> {
        confirm_write(&self.confirm, RISKY, REG_PRESET)?;
        let Some(link) = &self.link else {
            return Err(Error::Other("encoder not connected".to_string()));
        };
        link.lock()
            .write_registers(self.unit, REG_PRESET, &preset_words(turns))?;
        log::info!("Encoder position preset to {} turns", turns);
        Ok(())
    }

    fn dispatch(&mut self, args: &[String], report: &mut Report) -> Result<String> {
        let Some(command) = args.first() else {
            return Err(Error::Format("missing command".to_string()));
        };
        match command.as_str() {
            "connect" => {
                self.connect()?;
                Ok("encoder connected".to_string())
            }
            "run" => {
                self.run()?;
                Ok("encoder run started".to_string())
            }
            "stop" => {
                self.stop_reader()?;
                Ok("encoder stopped".to_string())
            }
            "status" => {
                report.line(format!(
                    "[multi_turn_encoder] connected={} running={}",
                    self.is_connected(),
                    self.is_running()
                ));
                Ok("ok".to_string())
            }
            "get" => {
                let sample = self.latest();
                report.line(format!(
                    "[multi_turn_encoder] valid={} ts_epoch={:.3} ts_local=\"{}\" turns_raw={:.4} turns_filtered={:.4} velocity={:.4}",
                    sample.is_valid(),
                    sample.timestamp,
                    format_local(sample.timestamp),
                    sample.turns_raw,
                    sample.turns_filtered,
                    sample.velocity
                ));
                Ok("ok".to_string())
            }
            "setpos" => {
                let Some(text) = args.get(1) else {
                    return Err(Error::Format("usage: multi_turn_encoder setpos <turns>".to_string()));
                };
                let turns = i32::try_from(parse_int(text)?)
                    .map_err(|_| Error::Format(format!("turns out of range: {}", text)))?;
                self.set_position(turns)?;
                report.line(format!("[multi_turn_encoder] position preset to {} turns", turns));
                Ok("position set".to_string())
            }
            other => Err(Error::UnknownCommand {
                sensor: NAME.to_string(),
                command: other.to_string(),
            }),
        }
    }
}

impl DriverAdapter for EncoderDriver {
    fn name(&self) -> &str {
        NAME
    }

    fn start(&mut self) -> Result<()> {
        self.connect()?;
        self.run()
    }

    fn stop(&mut self) -> Result<()> {
        self.stop_reader()
    }

    fn query(&mut self, args: &[String], report: &mut Report) -> Status {
        self.dispatch(args, report).into()
    }

    fn available_commands(&self) -> Vec<String> {
        COMMANDS.iter().map(|s| s.to_string()).collect()
    }
}

impl Drop for EncoderDriver {
    fn drop(&mut self) {
        let _ = self.stop_reader();
    }
}
