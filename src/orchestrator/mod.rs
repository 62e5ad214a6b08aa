//! Driver orchestration
//!
//! The [`Orchestrator`] owns the driver registry and the two background
//! workers:
//!
//! ```text
//! init()  -> create_drivers -> DriverAdapter::init for each -> registry
//! start() -> DriverAdapter::start for each -> Scheduler + Reporter
//! stop()  -> join Scheduler + Reporter -> DriverAdapter::stop for each
//! ```
//!
//! Interactive dispatch and background polls both take the console lock
//! before running a query, so their output never interleaves.

pub mod console;
pub mod reporter;
pub mod scheduler;

use crate::config::Config;
use crate::core::driver::DriverAdapter;
use crate::core::types::{Report, Status};
use crate::devices::{DriverContext, create_drivers};
use crate::error::{Error, Result};
use console::{Console, write_text};
use parking_lot::Mutex;
use reporter::{Reporter, SnapshotEntry, Snapshots};
use scheduler::{Scheduler, build_tasks};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Adapter shared between interactive dispatch and the scheduler
pub type SharedAdapter = Arc<Mutex<Box<dyn DriverAdapter>>>;

/// Registered adapters keyed by sensor name
pub type Registry = BTreeMap<String, SharedAdapter>;

/// Registry, lifecycle and background workers
pub struct Orchestrator {
    config: Config,
    config_path: Option<PathBuf>,
    context: DriverContext,
    console: Arc<Console>,
    registry: Option<Arc<Registry>>,
    snapshots: Snapshots,
    started: bool,
    scheduler: Option<Scheduler>,
    reporter: Option<Reporter>,
}

impl Orchestrator {
    pub fn new(config: Config, context: DriverContext, console: Arc<Console>) -> Self {
        Self {
            config,
            config_path: None,
            context,
            console,
            registry: None,
            snapshots: Arc::default(),
            started: false,
            scheduler: None,
            reporter: None,
        }
    }

    /// Record where the configuration came from, for messages and `showcfg`
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn console(&self) -> &Arc<Console> {
        &self.console
    }

    pub fn is_initialized(&self) -> bool {
        self.registry.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Build the registry; later calls are no-ops
    pub fn init(&mut self) -> Result<String> {
        if self.registry.is_some() {
            return Ok("already initialized".to_string());
        }

        let mut registry = Registry::new();
        for mut driver in create_drivers(&self.config, &self.context)? {
            let name = driver.name().to_string();
            driver.init().map_err(|e| Error::DriverInit {
                name: name.clone(),
                message: e.to_string(),
            })?;
            log::debug!("Registered {}", name);
            registry.insert(name, Arc::new(Mutex::new(driver)));
        }
        self.registry = Some(Arc::new(registry));

        let message = match &self.config_path {
            Some(path) => format!("safety-io initialized with config: {}", path.display()),
            None => "safety-io initialized".to_string(),
        };
        log::info!("{}", message);
        Ok(message)
    }

    fn registry(&self) -> Result<&Arc<Registry>> {
        self.registry.as_ref().ok_or(Error::NotInitialized)
    }

    /// Start every adapter, then the scheduler and reporter
    pub fn start(&mut self) -> Result<String> {
        let registry = Arc::clone(self.registry()?);
        if self.started {
            return Ok("already started".to_string());
        }

        let mut running: Vec<&SharedAdapter> = Vec::new();
        for (name, adapter) in registry.iter() {
            if let Err(e) = adapter.lock().start() {
                log::error!("{} failed to start: {}", name, e);
                for started in running {
                    let _ = started.lock().stop();
                }
                return Err(Error::Other(format!("{} start failed: {}", name, e)));
            }
            running.push(adapter);
        }

        let tasks = build_tasks(&self.config, &registry, Instant::now());
        self.scheduler = Some(Scheduler::spawn(
            tasks,
            Arc::clone(&registry),
            Arc::clone(&self.snapshots),
            Arc::clone(&self.console),
        )?);
        if self.config.reporter.enable {
            self.reporter = Some(Reporter::spawn(
                Duration::from_millis(self.config.reporter.period_ms.max(1)),
                Arc::clone(&self.snapshots),
                Arc::clone(&self.console),
            )?);
        }

        self.started = true;
        log::info!("Orchestrator started");
        Ok("started".to_string())
    }

    /// Join the workers, then stop every adapter
    pub fn stop(&mut self) -> Result<String> {
        let registry = Arc::clone(self.registry()?);
        if !self.started {
            return Ok("already stopped".to_string());
        }

        let mut first_error = None;
        let scheduler = self.scheduler.take().map(|mut s| s.stop());
        if let Some(Err(e)) = scheduler {
            log::error!("Scheduler stop failed: {}", e);
            first_error.get_or_insert(e);
        }
        let reporter = self.reporter.take().map(|mut r| r.stop());
        if let Some(Err(e)) = reporter {
            log::error!("Reporter stop failed: {}", e);
            first_error.get_or_insert(e);
        }

        for (name, adapter) in registry.iter() {
            if let Err(e) = adapter.lock().stop() {
                log::error!("{} failed to stop: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        self.started = false;
        log::info!("Orchestrator stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok("stopped".to_string()),
        }
    }

    /// Forward `args` to the sensor's adapter, writing its output into `report`
    pub fn query(&self, sensor: &str, args: &[String], report: &mut Report) -> Status {
        let adapter = match self.lookup(sensor) {
            Ok(adapter) => adapter,
            Err(e) => return e.into(),
        };
        adapter.lock().query(args, report)
    }

    fn lookup(&self, sensor: &str) -> Result<&SharedAdapter> {
        self.registry()?
            .get(sensor)
            .ok_or_else(|| Error::UnknownSensor(sensor.to_string()))
    }

    /// Interactive dispatch: run the query under the output lock and print its output
    pub fn dispatch_command(&self, sensor: &str, args: &[String]) -> Status {
        let adapter = match self.lookup(sensor) {
            Ok(adapter) => adapter,
            Err(e) => return e.into(),
        };
        let mut sink = self.console.lock();
        let mut report = Report::new();
        let status = adapter.lock().query(args, &mut report);
        write_text(&mut **sink, report.as_str());
        status
    }

    /// Registered sensor names, sorted
    pub fn enabled_sensors(&self) -> Vec<String> {
        self.registry
            .as_ref()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn available_commands(&self, sensor: &str) -> Result<Vec<String>> {
        Ok(self.lookup(sensor)?.lock().available_commands())
    }

    /// Copy of the snapshot cache
    pub fn snapshots(&self) -> BTreeMap<String, SnapshotEntry> {
        self.snapshots.lock().clone()
    }

    /// Human readable view of the active configuration
    pub fn show_config(&self) -> Result<String> {
        let runtime = &self.config.runtime;
        let mut out = String::new();
        let source = self
            .config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "built-in defaults".to_string());
        let _ = writeln!(out, "[config] source: {}", source);
        let _ = writeln!(
            out,
            "  - transport: min_gap_ms={} lock_scope={:?} connection={:?} timeout_ms={}",
            self.config.transport.min_gap_ms,
            self.config.transport.lock_scope,
            self.config.transport.connection,
            self.config.transport.timeout_ms
        );
        let _ = writeln!(
            out,
            "  - battery: enabled={} endpoint={} module_unit={} battery_unit={} query_hz={}",
            runtime.battery.enable,
            runtime.battery.endpoint(),
            runtime.battery.module_unit,
            runtime.battery.battery_unit,
            runtime.battery.query_hz
        );
        let _ = writeln!(
            out,
            "  - solar: enabled={} endpoint={} solar_unit={} query_hz={}",
            runtime.solar.enable,
            runtime.solar.endpoint(),
            runtime.solar.solar_unit,
            runtime.solar.query_hz
        );
        let _ = writeln!(
            out,
            "  - hoist_hook: enabled={} endpoint={} hook_unit={} power_unit={} query_hz={}",
            runtime.hoist_hook.enable,
            runtime.hoist_hook.endpoint(),
            runtime.hoist_hook.hook_unit,
            runtime.hoist_hook.power_unit,
            runtime.hoist_hook.query_hz
        );
        let _ = writeln!(
            out,
            "  - io_relay: enabled={} endpoint={} unit={} query_hz={}",
            runtime.io_relay.enable,
            runtime.io_relay.endpoint(),
            runtime.io_relay.unit,
            runtime.io_relay.query_hz
        );
        let encoder = &runtime.multi_turn_encoder;
        let link = match encoder.transport {
            crate::config::EncoderTransport::Tcp => format!("tcp {}", encoder.endpoint()),
            crate::config::EncoderTransport::Rtu => format!(
                "rtu {} {} {}{}{}",
                encoder.device, encoder.baud, encoder.data_bits, encoder.parity, encoder.stop_bits
            ),
        };
        let _ = writeln!(
            out,
            "  - multi_turn_encoder: enabled={} link={} unit={} query_hz={}",
            encoder.enable, link, encoder.unit, encoder.query_hz
        );
        let lidar = &runtime.spd_lidar;
        let instances = lidar.effective_instances();
        let _ = writeln!(
            out,
            "  - spd_lidar: enabled={} enabled_instances={} query_hz={}",
            lidar.enable,
            instances.iter().filter(|i| i.enable).count(),
            lidar.query_hz
        );
        let _ = writeln!(
            out,
            "  - registered: [{}]",
            self.enabled_sensors().join(", ")
        );
        Ok(out)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.started {
            log::debug!("Orchestrator dropped while running, stopping");
            if let Err(e) = self.stop() {
                log::warn!("Stop during drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::deny_all;
    use crate::transport::mock::{MockConnector, MockDevice};
    use console::SharedBuffer;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn network_config() -> Config {
        let mut config = Config::default();
        config.transport.min_gap_ms = 0;
        config.runtime.multi_turn_encoder.enable = false;
        config.runtime.spd_lidar.enable = false;
        config
    }

    fn orchestrator(config: Config, device: &MockDevice) -> (Orchestrator, MockConnector, SharedBuffer) {
        let connector = MockConnector::new(device.clone());
        let context = DriverContext::new(&config.transport, deny_all())
            .with_connector(Arc::new(connector.clone()));
        let buffer = SharedBuffer::new();
        let console = Arc::new(Console::new(Box::new(buffer.clone())));
        (Orchestrator::new(config, context, console), connector, buffer)
    }

    #[test]
    fn test_init_is_idempotent() {
        let (mut orch, _, _) = orchestrator(network_config(), &MockDevice::new());
        assert_eq!(orch.init().unwrap(), "safety-io initialized");
        let first = Arc::clone(orch.registry.as_ref().unwrap());
        assert_eq!(orch.init().unwrap(), "already initialized");
        assert!(Arc::ptr_eq(&first, orch.registry.as_ref().unwrap()));
    }

    #[test]
    fn test_init_message_names_config_path() {
        let (orch, _, _) = orchestrator(network_config(), &MockDevice::new());
        let mut orch = orch.with_config_path(Some(PathBuf::from("config/safety_io.toml")));
        assert_eq!(
            orch.init().unwrap(),
            "safety-io initialized with config: config/safety_io.toml"
        );
    }

    #[test]
    fn test_driver_init_failure_is_tagged() {
        let mut config = network_config();
        config.runtime.battery.battery_unit = config.runtime.battery.module_unit;
        let (mut orch, _, _) = orchestrator(config, &MockDevice::new());
        let err = orch.init().unwrap_err();
        assert!(matches!(err, Error::DriverInit { ref name, .. } if name == "battery"));
        assert!(!orch.is_initialized());
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let (mut orch, _, _) = orchestrator(network_config(), &MockDevice::new());
        assert!(matches!(orch.start(), Err(Error::NotInitialized)));
        assert!(matches!(orch.stop(), Err(Error::NotInitialized)));

        orch.init().unwrap();
        assert_eq!(orch.start().unwrap(), "started");
        assert_eq!(orch.start().unwrap(), "already started");
        assert_eq!(orch.stop().unwrap(), "stopped");
        assert_eq!(orch.stop().unwrap(), "already stopped");
    }

    #[test]
    fn test_unknown_sensor_does_no_io() {
        let (mut orch, connector, _) = orchestrator(network_config(), &MockDevice::new());
        orch.init().unwrap();

        let status = orch.query("unknown_sensor", &args(&["basic"]), &mut Report::new());
        assert!(!status.ok);
        assert_eq!(status.message, "sensor not enabled or unknown sensor: unknown_sensor");
        assert_eq!(connector.connect_count(), 0);
    }

    #[test]
    fn test_enabled_sensors_sorted() {
        let (mut orch, _, _) = orchestrator(network_config(), &MockDevice::new());
        assert!(orch.enabled_sensors().is_empty());
        orch.init().unwrap();
        assert_eq!(
            orch.enabled_sensors(),
            vec!["battery", "hoist_hook", "io_relay", "solar"]
        );
        assert!(orch.available_commands("io_relay").unwrap().contains(&"read".to_string()));
        assert!(orch.available_commands("nope").is_err());
    }

    #[test]
    fn test_dispatch_prints_to_console() {
        let device = MockDevice::new();
        device.set_coil(3, 0, true);
        let (mut orch, _, buffer) = orchestrator(network_config(), &device);
        orch.init().unwrap();

        let status = orch.dispatch_command("io_relay", &args(&["read", "1"]));
        assert!(status.ok, "{}", status.message);
        assert_eq!(buffer.contents(), "[io_relay] channel 1: closed\n");
    }

    #[test]
    fn test_scheduler_fills_snapshots() {
        let device = MockDevice::new();
        device.set_registers(2, 0x0000, &[9000, 0, 5300, 0, 0, 0, 0, 0, 0]);
        let mut config = network_config();
        config.runtime.battery.query_hz = 50.0;
        config.reporter.enable = false;
        let (mut orch, _, _) = orchestrator(config, &device);
        orch.init().unwrap();
        orch.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while !orch.snapshots().contains_key("battery") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        orch.stop().unwrap();

        let snapshots = orch.snapshots();
        let entry = &snapshots["battery"];
        assert!(entry.status.ok, "{}", entry.status.message);
        assert!(entry.text.contains("SOC: 90.00 %"));
        assert_eq!(snapshots.len(), 1);
    }

    struct PanickingPoll {
        stopped: Arc<AtomicBool>,
    }

    impl DriverAdapter for PanickingPoll {
        fn name(&self) -> &str {
            "battery"
        }

        fn stop(&mut self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn query(&mut self, _args: &[String], _report: &mut Report) -> Status {
            panic!("poll blew up");
        }

        fn available_commands(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[test]
    fn test_stop_finishes_teardown_after_worker_panic() {
        let mut config = network_config();
        config.runtime.battery.query_hz = 50.0;
        let (mut orch, _, _) = orchestrator(config, &MockDevice::new());

        let stopped = Arc::new(AtomicBool::new(false));
        let adapter: Box<dyn DriverAdapter> = Box::new(PanickingPoll {
            stopped: Arc::clone(&stopped),
        });
        let mut registry = Registry::new();
        registry.insert("battery".to_string(), Arc::new(Mutex::new(adapter)));
        orch.registry = Some(Arc::new(registry));

        orch.start().unwrap();
        thread::sleep(Duration::from_millis(100));

        assert!(matches!(orch.stop(), Err(Error::ThreadPanic)));
        assert!(!orch.is_started());
        assert!(orch.reporter.is_none());
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(orch.stop().unwrap(), "already stopped");
    }

    #[test]
    fn test_show_config_lists_sections() {
        let (mut orch, _, _) = orchestrator(network_config(), &MockDevice::new());
        orch.init().unwrap();
        let text = orch.show_config().unwrap();
        assert!(text.starts_with("[config] source: built-in defaults"));
        assert!(text.contains("battery: enabled=true endpoint=192.168.1.12:502"));
        assert!(text.contains("multi_turn_encoder: enabled=false link=rtu /dev/ttyUSB0 9600 8N1"));
        assert!(text.contains("registered: [battery, hoist_hook, io_relay, solar]"));
    }
}
