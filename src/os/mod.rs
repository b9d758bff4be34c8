//! Process control on Linux: signals, tracing, `/proc` queries and the control channel.

pub mod control;
pub mod proc_fs;
pub mod signal_bridge;
pub mod spawn;
pub mod tracer;

use crate::prelude::*;
use autopin_shared::TaskSet;
use autopin_shared::control::{ControlMessage, DEFAULT_SOCKET_NAME, EventKind};
use control::{ChannelStatus, ControlChannel};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use proc_fs::ProcEnumerator;
use signal_bridge::SignalBridge;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracer::{ProcessTracer, TracerState};

/// Notifications produced by the OS layer, consumed by [`crate::ObservedProcess`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OsEvent {
    TaskCreated(i32),
    TaskTerminated(i32),
    Message(ControlMessage),
}

/// The process context: owns every process-wide OS resource used by autopin.
///
/// Exactly one instance may exist at a time. Dropping it detaches from traced tasks, closes the
/// control channel and restores the previous `SIGCHLD` handler.
pub struct OsServices {
    enumerator: Arc<ProcEnumerator>,
    tracer: ProcessTracer,
    control: ControlChannel,
    bridge: SignalBridge,
    events_tx: UnboundedSender<OsEvent>,
    events_rx: UnboundedReceiver<OsEvent>,
    // Processes created through `create_process` and not reaped yet
    children: TaskSet,
    pending: VecDeque<OsEvent>,
}

impl OsServices {
    /// Installs the `SIGCHLD` bridge. Must be called from within a tokio runtime.
    pub fn init() -> Result<Self> {
        let bridge = SignalBridge::install()?;
        let enumerator = Arc::new(ProcEnumerator::new());
        let (events_tx, events_rx) = unbounded_channel();

        Ok(Self {
            tracer: ProcessTracer::new(enumerator.clone()),
            enumerator,
            control: ControlChannel::new(),
            bridge,
            events_tx,
            events_rx,
            children: TaskSet::new(),
            pending: VecDeque::new(),
        })
    }

    pub fn enumerator(&self) -> &ProcEnumerator {
        &self.enumerator
    }

    /// `$HOME/.autopin_socket`
    pub fn default_control_addr() -> Result<PathBuf> {
        let home = std::env::var_os("HOME")
            .filter(|home| !home.is_empty())
            .ok_or_else(|| {
                Error::system(
                    "comm_target",
                    "HOME is not set, cannot determine the default socket path",
                )
            })?;
        Ok(PathBuf::from(home).join(DEFAULT_SOCKET_NAME))
    }

    /// Spawns the observed process. Its termination is reported by [`OsServices::next_event`].
    pub fn create_process(&mut self, command_line: &str, wait_for_attach: bool) -> Result<i32> {
        let pid = spawn::spawn(command_line, wait_for_attach)?;
        self.children.insert(pid);
        Ok(pid)
    }

    /// Kills a process created by [`OsServices::create_process`] and reaps it.
    pub fn terminate_process(&mut self, pid: i32) -> Result<()> {
        if !self.children.remove(&pid) {
            return Err(Error::process(
                "not_found",
                format!("Process {pid} was not created by autopin"),
            ));
        }

        let target = Pid::from_raw(pid);
        kill(target, Signal::SIGKILL).map_err(|e| {
            Error::process("terminate", format!("Could not kill process {pid}")).with_source(e)
        })?;
        loop {
            match waitpid(target, None) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(Error::process(
                        "terminate",
                        format!("Could not wait for process {pid}"),
                    )
                    .with_source(e));
                }
            }
        }
        debug!("Killed process {pid}");
        Ok(())
    }

    /// Traces every task below `pid`, blocking until all current tasks are attached.
    ///
    /// While tracing, the trace worker reaps the traced tasks itself, so the bridge hands the
    /// `SIGCHLD` disposition back until [`OsServices::detach_from_process`].
    pub fn attach_to_process(&mut self, pid: i32, wake_subject: bool) -> Result<()> {
        if self.tracer.state() != TracerState::Idle {
            return Err(Error::proc_trace(
                "in_use",
                "A process is already being traced",
            ));
        }

        self.bridge.release_handler()?;

        let attached = self
            .tracer
            .init(pid, wake_subject, self.events_tx.clone())
            .and_then(|handle| handle.wait());
        if let Err(e) = attached {
            if self.tracer.is_active() {
                let _ = self.tracer.deinit();
            }
            self.bridge.rearm_handler()?;
            return Err(e);
        }

        Ok(())
    }

    pub fn is_tracing(&self) -> bool {
        self.tracer.is_active()
    }

    pub fn detach_from_process(&mut self) -> Result<()> {
        let detached = self.tracer.deinit();
        self.bridge.rearm_handler()?;
        detached
    }

    pub fn init_control_channel(&mut self, path: &Path) -> Result<()> {
        self.control.open(path)
    }

    pub async fn connect_control_channel(&mut self, timeout_secs: u64) -> Result<()> {
        self.control.connect(timeout_secs).await
    }

    pub fn send_message(&self, kind: EventKind, arg: i32, value: f64) -> Result<()> {
        self.control.send(kind, arg, value)
    }

    pub fn close_control_channel(&mut self) {
        self.pending.retain(|event| !matches!(event, OsEvent::Message(_)));
        self.control.close();
    }

    pub fn control_status(&self) -> ChannelStatus {
        self.control.status()
    }

    /// Waits for the next event from any source, in arrival order per source.
    pub async fn next_event(&mut self) -> Result<OsEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }

            let armed = self.bridge.is_armed();
            let receiving = self.control.is_receiving();

            tokio::select! {
                reaped = self.bridge.next_terminations(&mut self.children), if armed => {
                    self.pending.extend(reaped?.into_iter().map(OsEvent::TaskTerminated));
                }
                Some(event) = self.events_rx.recv() => {
                    // The trace worker reaps traced children itself
                    if let OsEvent::TaskTerminated(tid) = event {
                        self.children.remove(&tid);
                    }
                    return Ok(event);
                }
                batch = self.control.recv_batch(), if receiving => {
                    self.pending.extend(batch?.into_iter().map(OsEvent::Message));
                }
            }
        }
    }
}

impl Drop for OsServices {
    fn drop(&mut self) {
        if self.tracer.is_active() {
            if let Err(e) = self.detach_from_process() {
                warn!("{e}");
            }
        }
        self.control.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_control_addr() {
        temp_env::with_var("HOME", Some("/home/autopin"), || {
            assert_eq!(
                OsServices::default_control_addr().unwrap(),
                PathBuf::from("/home/autopin/.autopin_socket")
            );
        });
    }

    #[test]
    fn test_default_control_addr_without_home() {
        temp_env::with_var_unset("HOME", || {
            let err = OsServices::default_control_addr().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::System);
        });
    }
}
