//! Polling scheduler
//!
//! A single worker walks the task list in a fixed order and runs the first
//! task that is due, then starts over from the top. Only one poll runs at a
//! time, so a slow device delays every task queued behind it.

use super::console::Console;
use super::reporter::{SnapshotEntry, Snapshots};
use super::Registry;
use crate::config::Config;
use crate::core::types::Report;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const MIN_RATE_HZ: f64 = 0.1;
pub const MAX_RATE_HZ: f64 = 50.0;

/// Sleep when nothing is due
const IDLE_SLEEP: Duration = Duration::from_millis(20);

/// Clamp a configured poll rate into the supported band
pub fn clamp_rate(hz: f64) -> f64 {
    hz.clamp(MIN_RATE_HZ, MAX_RATE_HZ)
}

/// Poll period for a configured rate
pub fn period_for(hz: f64) -> Duration {
    Duration::from_secs_f64(1.0 / clamp_rate(hz))
}

/// One periodic query
#[derive(Debug, Clone)]
pub struct PollTask {
    pub sensor: String,
    pub snapshot_key: String,
    pub args: Vec<String>,
    pub period: Duration,
    pub next_due: Instant,
}

impl PollTask {
    pub fn new(sensor: &str, snapshot_key: &str, args: &[&str], hz: f64, now: Instant) -> Self {
        Self {
            sensor: sensor.to_string(),
            snapshot_key: snapshot_key.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            period: period_for(hz),
            next_due: now,
        }
    }

    /// Schedule the next run after one finished at `now`
    ///
    /// Keeps a fixed cadence while the task keeps up. A task slower than
    /// its rate is pushed a full period past `now` so it cannot hold the
    /// head of the list.
    pub fn advance(&mut self, now: Instant) {
        self.next_due += self.period;
        if self.next_due <= now {
            self.next_due = now + self.period;
        }
    }
}

/// Tasks for every registered sensor with a positive rate, in a fixed order
pub fn build_tasks(config: &Config, registry: &Registry, now: Instant) -> Vec<PollTask> {
    let runtime = &config.runtime;
    let candidates: [(&str, f64, &[&str]); 5] = [
        ("battery", runtime.battery.query_hz, &["basic"]),
        ("solar", runtime.solar.query_hz, &["status"]),
        ("hoist_hook", runtime.hoist_hook.query_hz, &["all"]),
        ("io_relay", runtime.io_relay.query_hz, &["read"]),
        ("multi_turn_encoder", runtime.multi_turn_encoder.query_hz, &["get"]),
    ];

    let mut tasks: Vec<PollTask> = candidates
        .into_iter()
        .filter(|(sensor, hz, _)| *hz > 0.0 && registry.contains_key(*sensor))
        .map(|(sensor, hz, args)| PollTask::new(sensor, sensor, args, hz, now))
        .collect();

    let lidar = &runtime.spd_lidar;
    if lidar.query_hz > 0.0 && registry.contains_key("spd_lidar") {
        for instance in lidar.effective_instances().iter().filter(|i| i.enable) {
            tasks.push(PollTask::new(
                "spd_lidar",
                &format!("spd_lidar:{}", instance.id),
                &["send", instance.id.as_str(), "single"],
                lidar.query_hz,
                now,
            ));
        }
    }

    for task in &tasks {
        log::info!(
            "Poll task {} every {} ms: {}",
            task.snapshot_key,
            task.period.as_millis(),
            task.args.join(" ")
        );
    }
    tasks
}

/// Index of the first task due at `now`
pub fn first_due(tasks: &[PollTask], now: Instant) -> Option<usize> {
    tasks.iter().position(|t| t.next_due <= now)
}

/// Background poll worker
pub struct Scheduler {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn spawn(
        tasks: Vec<PollTask>,
        registry: Arc<Registry>,
        snapshots: Snapshots,
        console: Arc<Console>,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("poll-scheduler".to_string())
            .spawn(move || Self::poll_loop(tasks, flag, registry, snapshots, console))
            .map_err(|e| Error::Other(format!("Failed to spawn scheduler thread: {}", e)))?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    fn poll_loop(
        mut tasks: Vec<PollTask>,
        shutdown: Arc<AtomicBool>,
        registry: Arc<Registry>,
        snapshots: Snapshots,
        console: Arc<Console>,
    ) {
        log::debug!("Scheduler started with {} task(s)", tasks.len());

        while !shutdown.load(Ordering::Relaxed) {
            let Some(index) = first_due(&tasks, Instant::now()) else {
                thread::sleep(IDLE_SLEEP);
                continue;
            };
            let task = &mut tasks[index];
            run_task(task, &registry, &snapshots, &console);
            task.advance(Instant::now());
        }

        log::debug!("Scheduler exiting");
    }

    /// Signal the worker and wait for the running poll to finish
    pub fn stop(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| Error::ThreadPanic)?;
        }
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Run one task under the output lock and replace its snapshot
fn run_task(task: &PollTask, registry: &Registry, snapshots: &Snapshots, console: &Console) {
    let Some(adapter) = registry.get(&task.sensor) else {
        log::warn!("Poll task for unregistered sensor {}", task.sensor);
        return;
    };

    let mut report = Report::new();
    let status = {
        let _output = console.lock();
        adapter.lock().query(&task.args, &mut report)
    };
    if !status.ok {
        log::debug!("Poll {} failed: {}", task.snapshot_key, status.message);
    }

    let entry = SnapshotEntry::new(report.into_string(), status);
    snapshots.lock().insert(task.snapshot_key.clone(), entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LidarInstanceConfig;
    use crate::core::driver::DriverAdapter;
    use crate::core::types::Status;
    use crate::orchestrator::console::SharedBuffer;
    use parking_lot::Mutex;

    struct Stub(&'static str);

    impl DriverAdapter for Stub {
        fn name(&self) -> &str {
            self.0
        }

        fn query(&mut self, _args: &[String], _report: &mut Report) -> Status {
            Status::success("ok")
        }

        fn available_commands(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn registry(names: &[&'static str]) -> Registry {
        names
            .iter()
            .map(|&n| {
                let adapter: Box<dyn DriverAdapter> = Box::new(Stub(n));
                (n.to_string(), Arc::new(Mutex::new(adapter)))
            })
            .collect()
    }

    #[test]
    fn test_rate_clamping() {
        assert_eq!(clamp_rate(0.02), 0.1);
        assert_eq!(period_for(0.02), Duration::from_secs(10));
        assert_eq!(clamp_rate(1000.0), 50.0);
        assert_eq!(period_for(1000.0), Duration::from_millis(20));
        assert_eq!(period_for(2.0), Duration::from_millis(500));
    }

    #[test]
    fn test_build_tasks_only_for_positive_rates() {
        let mut config = Config::default();
        config.runtime.battery.query_hz = 1.0;
        config.runtime.io_relay.query_hz = 2.0;
        config.runtime.solar.query_hz = 5.0;
        let registry = registry(&["battery", "io_relay"]);

        let tasks = build_tasks(&config, &registry, Instant::now());
        let keys: Vec<&str> = tasks.iter().map(|t| t.snapshot_key.as_str()).collect();
        // solar has a rate but is not registered
        assert_eq!(keys, vec!["battery", "io_relay"]);
        assert_eq!(tasks[0].args, vec!["basic".to_string()]);
        assert_eq!(tasks[1].args, vec!["read".to_string()]);
    }

    #[test]
    fn test_lidar_task_per_enabled_instance() {
        let mut config = Config::default();
        config.runtime.spd_lidar.query_hz = 4.0;
        config.runtime.spd_lidar.instances = vec![
            LidarInstanceConfig {
                id: "front".to_string(),
                ..LidarInstanceConfig::default()
            },
            LidarInstanceConfig {
                id: "rear".to_string(),
                enable: false,
                ..LidarInstanceConfig::default()
            },
        ];
        let tasks = build_tasks(&config, &registry(&["spd_lidar"]), Instant::now());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].sensor, "spd_lidar");
        assert_eq!(tasks[0].snapshot_key, "spd_lidar:front");
        assert_eq!(tasks[0].args, vec!["send", "front", "single"]);
    }

    #[test]
    fn test_first_due_prefers_list_order() {
        let now = Instant::now();
        let mut tasks = vec![
            PollTask::new("a", "a", &[], 1.0, now + Duration::from_secs(1)),
            PollTask::new("b", "b", &[], 1.0, now),
            PollTask::new("c", "c", &[], 1.0, now),
        ];
        assert_eq!(first_due(&tasks, now), Some(1));
        let period = tasks[1].period;
        tasks[1].next_due += period;
        assert_eq!(first_due(&tasks, now), Some(2));
        let period = tasks[2].period;
        tasks[2].next_due += period;
        assert_eq!(first_due(&tasks, now), None);
    }

    #[test]
    fn test_advance_keeps_cadence_when_on_time() {
        let start = Instant::now();
        let mut task = PollTask::new("a", "a", &[], 2.0, start);
        task.advance(start + Duration::from_millis(100));
        assert_eq!(task.next_due, start + Duration::from_millis(500));
    }

    #[test]
    fn test_advance_resyncs_when_behind() {
        let start = Instant::now();
        let mut task = PollTask::new("a", "a", &[], 50.0, start);
        let finished = start + Duration::from_millis(240);
        task.advance(finished);
        assert_eq!(task.next_due, finished + Duration::from_millis(20));
    }

    /// Adapter whose every poll takes longer than a 50 Hz period
    struct Slow(&'static str);

    impl DriverAdapter for Slow {
        fn name(&self) -> &str {
            self.0
        }

        fn query(&mut self, _args: &[String], _report: &mut Report) -> Status {
            thread::sleep(Duration::from_millis(60));
            Status::success("ok")
        }

        fn available_commands(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[test]
    fn test_slow_fast_task_does_not_starve_later_tasks() {
        let mut registry = registry(&["io_relay"]);
        let slow: Box<dyn DriverAdapter> = Box::new(Slow("battery"));
        registry.insert("battery".to_string(), Arc::new(Mutex::new(slow)));

        let now = Instant::now();
        let tasks = vec![
            PollTask::new("battery", "battery", &["basic"], 50.0, now),
            PollTask::new("io_relay", "io_relay", &["read"], 1.0, now),
        ];
        let snapshots = Snapshots::default();
        let console = Arc::new(Console::new(Box::new(SharedBuffer::new())));
        let mut scheduler =
            Scheduler::spawn(tasks, Arc::new(registry), Arc::clone(&snapshots), console).unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while !snapshots.lock().contains_key("io_relay") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        scheduler.stop().unwrap();

        let snapshots = snapshots.lock();
        assert!(snapshots.contains_key("battery"));
        assert!(snapshots.contains_key("io_relay"));
    }
}
