//! safety-io - interactive console for the field-device layer
//!
//! ```text
//! safety-io --config config/safety_io.toml
//! > start
//! > battery basic
//! > io_relay on 3
//! > quit
//! ```
//!
//! Background polls print through the same output lock as interactive
//! commands, so a snapshot never lands in the middle of a command's output.

use clap::Parser;
use parking_lot::Mutex;
use safety_io::console::Console;
use safety_io::core::types::Confirm;
use safety_io::{Config, DriverContext, Error, Orchestrator, Result};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "safety-io")]
#[command(about = "Field-device console for the safety controller")]
struct Args {
    /// Configuration file (falls back to SAFETY_IO_CONFIG and the default search path)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Start polling right after init
    #[arg(long)]
    autostart: bool,
}

const HELP: &str = "\
commands:
  help                      show this text
  start | stop              start or stop polling and the reporter
  sensors                   list registered sensors
  cmds <sensor>             list a sensor's commands
  showcfg                   print the active configuration
  <sensor> <cmd> [args...]  run a sensor command
  quit                      stop everything and exit";

/// How long the Ctrl-C handler waits for an idle orchestrator
const SIGNAL_LOCK_WAIT: Duration = Duration::from_millis(200);

/// Ask on the terminal before a risky write
fn stdin_confirm() -> Confirm {
    Arc::new(|address| {
        print!(
            "write to {:#06x} may actuate hardware or change device config. continue? [y/N] ",
            address
        );
        let _ = io::stdout().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    log::info!("safety-io v{} starting...", env!("CARGO_PKG_VERSION"));

    let (config, config_path) = Config::load(args.config.as_deref())?;

    let console = Arc::new(Console::stdout());
    let context = DriverContext::new(&config.transport, stdin_confirm());
    let orchestrator = Arc::new(Mutex::new(
        Orchestrator::new(config, context, Arc::clone(&console)).with_config_path(config_path),
    ));

    let message = orchestrator.lock().init()?;
    console.print(&message);

    // A command holding the lock may be waiting on a confirmation prompt, so
    // the handler never blocks on it; the REPL shuts down after that command.
    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_orchestrator = Arc::clone(&orchestrator);
    let handler_shutdown = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        if stop_on_signal(&handler_orchestrator, &handler_shutdown) {
            std::process::exit(0);
        }
    })
    .map_err(|e| Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    if args.autostart {
        let result = orchestrator.lock().start();
        report(&console, result);
    }

    console.print("type 'help' for commands");
    run_repl(&orchestrator, &console, &shutdown)?;

    if let Err(e) = orchestrator.lock().stop() {
        log::error!("Stop failed: {}", e);
    }
    log::info!("safety-io stopped");
    Ok(())
}

/// Flag shutdown and stop the orchestrator if it is idle
///
/// Returns false when a command holds the orchestrator; the REPL then stops
/// after that command returns.
fn stop_on_signal(orchestrator: &Mutex<Orchestrator>, shutdown: &AtomicBool) -> bool {
    shutdown.store(true, Ordering::SeqCst);
    let Some(mut orchestrator) = orchestrator.try_lock_for(SIGNAL_LOCK_WAIT) else {
        log::info!("Command in progress; shutting down once it finishes");
        return false;
    };
    if let Err(e) = orchestrator.stop() {
        log::error!("Stop failed: {}", e);
    }
    true
}

fn report(console: &Console, result: Result<String>) {
    match result {
        Ok(message) => console.print(&message),
        Err(e) => console.print(&format!("error: {}", e)),
    }
}

fn run_repl(orchestrator: &Mutex<Orchestrator>, console: &Console, shutdown: &AtomicBool) -> Result<()> {
    let mut line = String::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut sink = console.lock();
            let _ = sink.write_all(b"> ");
            let _ = sink.flush();
        }

        line.clear();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let words: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        let Some((head, rest)) = words.split_first() else {
            continue;
        };

        match head.as_str() {
            "quit" | "exit" => return Ok(()),
            "help" => console.print(HELP),
            "start" => {
                let result = orchestrator.lock().start();
                report(console, result);
            }
            "stop" => {
                let result = orchestrator.lock().stop();
                report(console, result);
            }
            "sensors" => {
                let sensors = orchestrator.lock().enabled_sensors();
                console.print(&format!("sensors: {}", sensors.join(" ")));
            }
            "cmds" => {
                let Some(sensor) = rest.first() else {
                    console.print("usage: cmds <sensor>");
                    continue;
                };
                let result = orchestrator
                    .lock()
                    .available_commands(sensor)
                    .map(|commands| format!("{}: {}", sensor, commands.join(" ")));
                report(console, result);
            }
            "showcfg" => {
                let result = orchestrator.lock().show_config();
                report(console, result);
            }
            sensor => {
                if rest.is_empty() {
                    console.print(&format!("usage: {} <command> [args...]", sensor));
                    continue;
                }
                let status = orchestrator.lock().dispatch_command(sensor, rest);
                if status.ok {
                    log::debug!("{} {}: {}", sensor, rest[0], status.message);
                } else {
                    console.print(&format!("error: {}", status.message));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safety_io::console::SharedBuffer;
    use safety_io::core::types::deny_all;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn idle_orchestrator() -> Mutex<Orchestrator> {
        let mut config = Config::default();
        config.reporter.enable = false;
        let runtime = &mut config.runtime;
        runtime.battery.enable = false;
        runtime.solar.enable = false;
        runtime.hoist_hook.enable = false;
        runtime.io_relay.enable = false;
        runtime.multi_turn_encoder.enable = false;
        runtime.spd_lidar.enable = false;

        let context = DriverContext::new(&config.transport, deny_all());
        let console = Arc::new(Console::new(Box::new(SharedBuffer::new())));
        let mut orchestrator = Orchestrator::new(config, context, console);
        orchestrator.init().unwrap();
        orchestrator.start().unwrap();
        Mutex::new(orchestrator)
    }

    #[test]
    fn test_signal_stops_idle_orchestrator() {
        let orchestrator = idle_orchestrator();
        let shutdown = AtomicBool::new(false);
        assert!(stop_on_signal(&orchestrator, &shutdown));
        assert!(shutdown.load(Ordering::SeqCst));
        assert!(!orchestrator.lock().is_started());
    }

    #[test]
    fn test_signal_defers_while_command_holds_lock() {
        let orchestrator = Arc::new(idle_orchestrator());
        let shutdown = AtomicBool::new(false);

        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let holder = {
            let orchestrator = Arc::clone(&orchestrator);
            thread::spawn(move || {
                let _busy = orchestrator.lock();
                held_tx.send(()).unwrap();
                let _ = release_rx.recv();
            })
        };
        held_rx.recv().unwrap();

        let begin = Instant::now();
        assert!(!stop_on_signal(&orchestrator, &shutdown));
        assert!(begin.elapsed() < Duration::from_secs(2));
        assert!(shutdown.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(orchestrator.lock().is_started());
    }
}
