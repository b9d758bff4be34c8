//! Attaches to every task of the observed process tree and reports task creation and exit.
//!
//! All ptrace requests must come from the thread that attached, so the whole trace session runs
//! on one dedicated worker thread.

use super::OsEvent;
use super::proc_fs::ProcEnumerator;
use crate::prelude::*;
use autopin_shared::{ProcessTree, TaskSet};
use itertools::Itertools;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Event, Options};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerState {
    Idle,
    Attaching,
    Attached,
    Detaching,
}

/// Resolves once the worker has attached to every task of the tree, or failed to.
pub struct AttachHandle {
    rx: mpsc::Receiver<Result<()>>,
}

impl AttachHandle {
    /// Blocks until the attach outcome is known.
    pub fn wait(self) -> Result<()> {
        self.rx.recv().unwrap_or_else(|_| {
            Err(Error::proc_trace(
                "attach",
                "The trace worker exited before attaching",
            ))
        })
    }
}

pub struct ProcessTracer {
    enumerator: Arc<ProcEnumerator>,
    state: Arc<Mutex<TracerState>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ProcessTracer {
    pub fn new(enumerator: Arc<ProcEnumerator>) -> Self {
        Self {
            enumerator,
            state: Arc::new(Mutex::new(TracerState::Idle)),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn state(&self) -> TracerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TracerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Whether a trace worker exists, even one that already stopped because every task exited.
    pub fn is_active(&self) -> bool {
        self.worker.is_some()
    }

    /// Starts tracing the process tree rooted at `pid`.
    ///
    /// When `wake_subject` is set, `SIGUSR1` is sent to `pid` once every task is attached; see
    /// [`super::spawn::spawn`].
    pub fn init(
        &mut self,
        pid: i32,
        wake_subject: bool,
        events: UnboundedSender<OsEvent>,
    ) -> Result<AttachHandle> {
        match self.state() {
            TracerState::Attaching | TracerState::Attached | TracerState::Detaching => {
                return Err(Error::proc_trace(
                    "in_use",
                    "A process is already being traced",
                ));
            }
            TracerState::Idle => {}
        }

        // A worker whose tasks all exited is still waiting to be joined
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        self.set_state(TracerState::Attaching);
        self.shutdown.store(false, Ordering::SeqCst);

        let (attached_tx, attached_rx) = mpsc::channel();
        let worker = TraceWorker {
            root: pid,
            traced: TaskSet::new(),
            enumerator: self.enumerator.clone(),
            events,
            shutdown: self.shutdown.clone(),
            state: self.state.clone(),
        };

        let handle = std::thread::Builder::new()
            .name("autopin-tracer".into())
            .spawn(move || worker.run(wake_subject, attached_tx))
            .map_err(|e| {
                self.set_state(TracerState::Idle);
                Error::proc_trace("attach", format!("Could not start the trace worker: {e}"))
                    .with_io_source(&e)
            })?;
        self.worker = Some(handle);

        Ok(AttachHandle { rx: attached_rx })
    }

    /// Detaches from every traced task and stops the worker.
    pub fn deinit(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Err(Error::proc_trace(
                "not_attached",
                "No process is being traced",
            ));
        };

        self.shutdown.store(true, Ordering::SeqCst);
        let joined = worker.join();
        self.set_state(TracerState::Idle);

        joined.map_err(|_| Error::proc_trace("detach", "The trace worker panicked"))
    }
}

impl Drop for ProcessTracer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.deinit() {
                warn!("{e}");
            }
        }
    }
}

struct TraceWorker {
    root: i32,
    traced: TaskSet,
    enumerator: Arc<ProcEnumerator>,
    events: UnboundedSender<OsEvent>,
    shutdown: Arc<AtomicBool>,
    state: Arc<Mutex<TracerState>>,
}

impl TraceWorker {
    fn set_state(&self, state: TracerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn run(mut self, wake_subject: bool, attached_tx: mpsc::Sender<Result<()>>) {
        if let Err(e) = self.attach_all() {
            self.detach_all();
            self.set_state(TracerState::Idle);
            let _ = attached_tx.send(Err(e));
            return;
        }

        self.set_state(TracerState::Attached);
        let _ = attached_tx.send(Ok(()));
        info!(
            "Tracing {} tasks of process {}",
            self.traced.len(),
            self.root
        );

        if wake_subject {
            if let Err(e) = kill(Pid::from_raw(self.root), Signal::SIGUSR1) {
                warn!("Could not release process {}: {e}", self.root);
            }
        }

        self.trace_loop();

        self.set_state(TracerState::Detaching);
        self.detach_all();
        self.set_state(TracerState::Idle);
    }

    /// Seizes every task of the tree, enumerating again until no new task shows up.
    fn attach_all(&mut self) -> Result<()> {
        loop {
            let tree = ProcessTree::build(&*self.enumerator, self.root).map_err(|e| {
                Error::proc_trace(
                    "attach",
                    format!("Could not enumerate the tasks of process {}: {e}", self.root),
                )
            })?;

            let pending: Vec<i32> = tree
                .all_tasks()
                .into_iter()
                .filter(|tid| !self.traced.contains(tid))
                .collect();
            if pending.is_empty() {
                return Ok(());
            }

            for tid in pending {
                ptrace::seize(Pid::from_raw(tid), trace_options()).map_err(|e| {
                    Error::proc_trace("attach", format!("Could not attach to task {tid}"))
                        .with_source(e)
                })?;
                trace!("Attached to task {tid}");
                self.traced.insert(tid);
            }
        }
    }

    /// Collects the status changes of the traced tasks until all of them exited.
    ///
    /// Tasks are waited for by id, other children of autopin keep their status for their owner.
    fn trace_loop(&mut self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let mut idle = true;
            for tid in self.traced.iter().copied().collect_vec() {
                let flags = WaitPidFlag::__WALL | WaitPidFlag::WNOHANG;
                match waitpid(Pid::from_raw(tid), Some(flags)) {
                    Ok(WaitStatus::StillAlive) => {}
                    Ok(status) => {
                        idle = false;
                        self.handle_status(status);
                    }
                    Err(Errno::EINTR) => idle = false,
                    // Gone without a status left to collect
                    Err(Errno::ECHILD) => self.terminated(tid),
                    Err(e) => {
                        warn!("Waiting for task {tid} failed: {e}");
                        self.terminated(tid);
                    }
                }
            }

            if self.traced.is_empty() {
                debug!("Every traced task exited");
                break;
            }
            if idle {
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }

    fn handle_status(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::PtraceEvent(pid, _, event) => self.handle_event(pid, event),
            WaitStatus::Stopped(pid, signal) => {
                let _ = ptrace::cont(pid, forwarded(signal));
            }
            WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                self.terminated(pid.as_raw());
            }
            status => trace!("Ignoring wait status {status:?}"),
        }
    }

    fn terminated(&mut self, tid: i32) {
        if self.traced.remove(&tid) {
            let _ = self.events.send(OsEvent::TaskTerminated(tid));
        }
    }

    fn handle_event(&mut self, pid: Pid, event: i32) {
        self.register(pid.as_raw());

        let spawns_task = event == Event::PTRACE_EVENT_CLONE as i32
            || event == Event::PTRACE_EVENT_FORK as i32
            || event == Event::PTRACE_EVENT_VFORK as i32;
        if spawns_task {
            match ptrace::getevent(pid) {
                Ok(new_tid) => self.register(new_tid as i32),
                Err(e) => debug!("Could not get the new task of {pid}: {e}"),
            }
        }

        let _ = ptrace::cont(pid, None);
    }

    fn register(&mut self, tid: i32) {
        if self.traced.insert(tid) {
            debug!("New task {tid}");
            let _ = self.events.send(OsEvent::TaskCreated(tid));
        }
    }

    fn detach_all(&mut self) {
        for tid in std::mem::take(&mut self.traced) {
            let pid = Pid::from_raw(tid);
            if ptrace::interrupt(pid).is_err() {
                continue;
            }

            loop {
                match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Stopped(_, signal)) => {
                        let _ = ptrace::detach(pid, forwarded(signal));
                        break;
                    }
                    Ok(WaitStatus::PtraceEvent(..) | WaitStatus::PtraceSyscall(_)) => {
                        let _ = ptrace::detach(pid, None);
                        break;
                    }
                    Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                        let _ = self.events.send(OsEvent::TaskTerminated(tid));
                        break;
                    }
                    Ok(_) | Err(Errno::EINTR) => continue,
                    Err(_) => break,
                }
            }
            trace!("Detached from task {tid}");
        }
    }
}

fn trace_options() -> Options {
    Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACEEXEC
}

/// Signals stopping a tracee that must be delivered when it resumes.
fn forwarded(signal: Signal) -> Option<Signal> {
    match signal {
        Signal::SIGSTOP | Signal::SIGTRAP => None,
        signal => Some(signal),
    }
}
