//! Forwards monitor values to an external command.

use crate::config::ExternalLoggerConfig;
use crate::monitor::PerformanceMonitor;
use crate::prelude::*;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    /// Number of lines written
    Logged(usize),
    /// A previous data point was still being written
    Skipped,
}

/// One tab separated line per monitor and monitored task.
///
/// With `systemwide`, only the first task of each monitor is reported.
pub fn data_point_lines(
    monitors: &[Arc<dyn PerformanceMonitor>],
    elapsed: Duration,
    systemwide: bool,
) -> Vec<String> {
    let mut lines = Vec::new();
    for monitor in monitors {
        for task in monitor.monitored_tasks() {
            match monitor.value(task) {
                Ok(value) => lines.push(format!(
                    "{}\t{task}\t{:.3}\t{value:.6}\t{}",
                    monitor.name(),
                    elapsed.as_secs_f64(),
                    monitor.unit().filter(|unit| !unit.is_empty()).unwrap_or("none"),
                )),
                Err(e) => warn!("Could not read {} for task {task}: {e}", monitor.name()),
            }

            if systemwide {
                break;
            }
        }
    }
    lines
}

fn log_lines(reader: impl Read, prefix: &'static str) {
    for line in BufReader::new(reader).lines() {
        match line {
            Ok(line) => info!("{prefix} {line}"),
            Err(e) => {
                debug!("Stopped reading the data logger output: {e}");
                break;
            }
        }
    }
}

pub struct ExternalLogger {
    config: ExternalLoggerConfig,
    monitors: Vec<Arc<dyn PerformanceMonitor>>,
    child: Child,
    // Doubles as the re-entrancy guard of `log_data_point`
    stdin: Mutex<Option<ChildStdin>>,
    started: Instant,
}

impl std::fmt::Debug for ExternalLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalLogger")
            .field("config", &self.config)
            .field("child", &self.child)
            .finish_non_exhaustive()
    }
}

impl ExternalLogger {
    /// Starts the configured command, logging everything it prints.
    pub fn spawn(
        config: ExternalLoggerConfig,
        monitors: Vec<Arc<dyn PerformanceMonitor>>,
    ) -> Result<Self> {
        let Some((program, args)) = config.command.split_first() else {
            return Err(Error::bad_config(
                "option_format",
                "The external data logger needs a command",
            ));
        };

        info!("Initializing the external data logger");
        info!("  - command = {}", config.command.join(" "));
        info!("  - interval = {}", config.interval);
        info!("  - systemwide = {}", config.systemwide);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::bad_config(
                    "option_format",
                    format!("Could not start the data logger {program:?}: {e}"),
                )
                .with_io_source(&e)
            })?;

        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || log_lines(stdout, "[stdout]"));
        }
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || log_lines(stderr, "[stderr]"));
        }
        let stdin = child.stdin.take();

        Ok(Self {
            config,
            monitors,
            child,
            stdin: Mutex::new(stdin),
            started: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Writes the current value of every monitor to the command.
    ///
    /// Returns [`LogOutcome::Skipped`] without doing anything if another call has not finished.
    pub fn log_data_point(&self) -> Result<LogOutcome> {
        let mut stdin = match self.stdin.try_lock() {
            Ok(stdin) => stdin,
            Err(TryLockError::WouldBlock) => return Ok(LogOutcome::Skipped),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let Some(stdin) = stdin.as_mut() else {
            return Ok(LogOutcome::Logged(0));
        };

        let lines = data_point_lines(
            &self.monitors,
            self.started.elapsed(),
            self.config.systemwide,
        );
        for line in &lines {
            writeln!(stdin, "{line}").map_err(|e| {
                Error::system("logger", format!("Could not write to the data logger: {e}"))
                    .with_io_source(&e)
            })?;
        }
        stdin.flush().map_err(|e| {
            Error::system("logger", format!("Could not write to the data logger: {e}"))
                .with_io_source(&e)
        })?;

        Ok(LogOutcome::Logged(lines.len()))
    }

    /// Logs a data point every `Interval` milliseconds until writing fails.
    pub async fn run(&self) -> Result<()> {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.interval.max(1)));
        loop {
            interval.tick().await;
            if self.log_data_point()? == LogOutcome::Skipped {
                debug!("Skipping a data point, the previous one is still being written");
            }
        }
    }

    /// Closes the command's stdin and waits for it to exit.
    pub fn stop(mut self) -> Result<ExitStatus> {
        self.stdin
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.child.wait().map_err(|e| {
            Error::system("logger", format!("Could not wait for the data logger: {e}"))
                .with_io_source(&e)
        })
    }
}

impl Drop for ExternalLogger {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
