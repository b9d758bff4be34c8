use crate::config::{AttachTarget, ProcessConfig, Subject};
use crate::os::proc_fs::ProcEnumerator;
use crate::os::{OsEvent, OsServices};
use crate::prelude::*;
use autopin_shared::control::EventKind;
use autopin_shared::{ProcessSource, ProcessTree};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Configured,
    Running,
    Terminated,
}

/// Notifications republished to the components reacting to the observed process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessEvent {
    TaskCreated(i32),
    TaskTerminated(i32),
    PhaseChanged(i32),
    UserMessage { arg: i32, value: f64 },
}

/// The application whose threads are pinned, either spawned by autopin or attached to.
pub struct ObservedProcess {
    pid: i32,
    command: String,
    spawn: bool,
    trace: bool,
    comm_addr: Option<PathBuf>,
    comm_timeout: u64,
    execution_phase: i32,
    state: ProcessState,
    subscribers: Vec<UnboundedSender<ProcessEvent>>,
}

impl ObservedProcess {
    /// Resolves the configured subject. Nothing is created or attached yet.
    pub fn init(config: &ProcessConfig, enumerator: &ProcEnumerator) -> Result<Self> {
        info!("> Initializing the observed process");

        let subject = config.subject()?;
        let comm_addr = config.control_addr()?;

        let (pid, command, spawn) = match subject {
            Subject::Exec(command) => (-1, command, true),
            Subject::Attach(target) => {
                let pid = resolve_attach_target(&target, enumerator)?;
                (pid, enumerator.command_line(pid), false)
            }
        };

        Ok(Self {
            pid,
            command,
            spawn,
            trace: config.trace,
            comm_addr,
            comm_timeout: config.comm_timeout(),
            execution_phase: 0,
            state: ProcessState::Configured,
            subscribers: Vec::new(),
        })
    }

    /// Tracked pid, `-1` before the process is spawned and after it terminated.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    pub fn is_spawned(&self) -> bool {
        self.spawn
    }

    pub fn trace(&self) -> bool {
        self.trace
    }

    pub fn comm_addr(&self) -> Option<&Path> {
        self.comm_addr.as_deref()
    }

    pub fn comm_timeout(&self) -> u64 {
        self.comm_timeout
    }

    pub fn execution_phase(&self) -> i32 {
        self.execution_phase
    }

    /// Registers a new listener for [`ProcessEvent`]s.
    pub fn subscribe(&mut self) -> UnboundedReceiver<ProcessEvent> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn publish(&mut self, event: ProcessEvent) {
        self.subscribers.retain(|subscriber| subscriber.send(event).is_ok());
    }

    /// Opens the control channel, spawns or attaches, then waits for the process to connect.
    ///
    /// A failing step aborts right away, the steps already done are only undone by
    /// [`ObservedProcess::deinit`]. The exception is a spawned process that could not be traced:
    /// it is killed, since it would otherwise wait for the tracer forever, and the process is
    /// left `Configured`.
    pub async fn start(&mut self, os: &mut OsServices) -> Result<()> {
        if self.state != ProcessState::Configured {
            return Err(Error::process(
                "already_connected",
                "The observed process is already running",
            ));
        }

        if let Some(comm_addr) = &self.comm_addr {
            info!("> Initializing the communication channel");
            os.init_control_channel(comm_addr)?;
        }

        if self.spawn {
            info!("> Starting new process {}", self.command);
            self.pid = os.create_process(&self.command, self.trace)?;
        }

        self.state = ProcessState::Running;

        if self.trace {
            info!("> Attaching to process {}", self.pid);
            if let Err(e) = os.attach_to_process(self.pid, self.spawn) {
                if self.spawn {
                    if let Err(kill_err) = os.terminate_process(self.pid) {
                        warn!("{kill_err}");
                    }
                    self.pid = -1;
                    self.state = ProcessState::Configured;
                }
                return Err(e);
            }
        }

        if self.comm_addr.is_some() {
            info!(
                "> Waiting for process {} to connect (Timeout: {} sec)",
                self.pid, self.comm_timeout
            );
            os.connect_control_channel(self.comm_timeout).await?;
            info!("> The connection with the observed process has been established");
        }

        self.publish(ProcessEvent::TaskCreated(self.pid));
        Ok(())
    }

    /// Stops tracing and closes the control channel, whichever of them is active.
    pub fn deinit(&mut self, os: &mut OsServices) {
        if os.is_tracing() {
            if let Err(e) = os.detach_from_process() {
                warn!("{e}");
            }
        }
        os.close_control_channel();
    }

    /// Asks the observed process to report its phase every `interval_ms` milliseconds.
    pub fn set_phase_notification_interval(&self, os: &OsServices, interval_ms: i32) -> Result<()> {
        if self.comm_addr.is_none() || interval_ms < 0 {
            return Ok(());
        }
        os.send_message(EventKind::SetInterval, interval_ms, 0.0)
    }

    /// Snapshot of the process hierarchy, `None` if it is not running or could not be read.
    pub fn process_tree<S: ProcessSource>(&self, source: &S) -> Option<ProcessTree> {
        if !self.is_running() {
            return None;
        }

        ProcessTree::build(source, self.pid)
            .inspect_err(|e| debug!("Could not build the process tree of {}: {e}", self.pid))
            .ok()
    }

    /// Applies one OS notification.
    ///
    /// Returns a `PROCESS` `terminated` error once the observed process itself exited.
    pub fn handle_os_event(&mut self, event: OsEvent) -> Result<()> {
        match event {
            OsEvent::TaskCreated(tid) => {
                info!(":: Task created: {tid}");
                self.publish(ProcessEvent::TaskCreated(tid));
            }
            OsEvent::TaskTerminated(tid) if self.is_running() && tid == self.pid => {
                self.pid = -1;
                self.state = ProcessState::Terminated;
                return Err(Error::process(
                    "terminated",
                    format!("The observed process {tid} has terminated"),
                ));
            }
            OsEvent::TaskTerminated(tid) => {
                info!(":: Task terminated: {tid}");
                self.publish(ProcessEvent::TaskTerminated(tid));
            }
            OsEvent::Message(message) => match message.kind() {
                Some(EventKind::PhaseChanged) => {
                    info!(":: New execution phase: {}", message.arg);
                    self.execution_phase = message.arg;
                    self.publish(ProcessEvent::PhaseChanged(message.arg));
                }
                Some(EventKind::UserEvent) => {
                    info!(":: Received user-defined message");
                    self.publish(ProcessEvent::UserMessage {
                        arg: message.arg,
                        value: message.value,
                    });
                }
                _ => info!(":: Received unknown message type {}", message.tag),
            },
        }
        Ok(())
    }
}

fn resolve_attach_target(target: &AttachTarget, enumerator: &ProcEnumerator) -> Result<i32> {
    if let Some(pid) = target.pid() {
        if !enumerator.exists(pid) {
            return Err(Error::process(
                "not_found",
                format!("No process found with pid {pid}"),
            ));
        }
        return Ok(pid);
    }

    let AttachTarget::Name(name) = target else {
        return Err(Error::process("not_found", "No process configured"));
    };
    let mut pids = enumerator.find_by_name(name)?.into_iter();
    match (pids.next(), pids.next()) {
        (None, _) => Err(Error::process(
            "not_found",
            format!("No process found with name {name}"),
        )),
        (Some(pid), None) => Ok(pid),
        (Some(_), Some(_)) => Err(Error::process(
            "found_many",
            format!("There exist more processes with name {name}"),
        )),
    }
}

#[cfg(test)]
impl ObservedProcess {
    /// A process that is already running as `pid`, without tracing or control channel
    pub fn running(pid: i32) -> Self {
        Self {
            pid,
            command: String::new(),
            spawn: false,
            trace: false,
            comm_addr: None,
            comm_timeout: 60,
            execution_phase: 0,
            state: ProcessState::Running,
            subscribers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopin_shared::TaskSet;
    use autopin_shared::control::ControlMessage;
    use rstest::rstest;

    struct SingleProcess;

    impl ProcessSource for SingleProcess {
        type Error = String;

        fn threads(&self, pid: i32) -> Result<TaskSet, String> {
            Ok(TaskSet::from([pid, pid + 1]))
        }

        fn children(&self, _pid: i32) -> Result<TaskSet, String> {
            Ok(TaskSet::new())
        }
    }

    struct Vanished;

    impl ProcessSource for Vanished {
        type Error = String;

        fn threads(&self, pid: i32) -> Result<TaskSet, String> {
            Err(format!("{pid} is gone"))
        }

        fn children(&self, _pid: i32) -> Result<TaskSet, String> {
            Ok(TaskSet::new())
        }
    }

    #[test]
    fn test_init_exec() {
        let process =
            ObservedProcess::init(&ProcessConfig::test("sleep 5"), &ProcEnumerator::new())
                .unwrap();

        assert_eq!(process.pid(), -1);
        assert_eq!(process.command(), "sleep 5");
        assert!(process.is_spawned());
        assert_eq!(process.state(), ProcessState::Configured);
        assert_eq!(process.comm_timeout(), 60);
    }

    #[test]
    fn test_init_attach_by_pid() {
        let config = ProcessConfig {
            attach: Some(AttachTarget::Name(std::process::id().to_string())),
            ..Default::default()
        };

        let process = ObservedProcess::init(&config, &ProcEnumerator::new()).unwrap();
        assert_eq!(process.pid(), std::process::id() as i32);
        assert!(!process.is_spawned());
    }

    #[rstest]
    #[case(AttachTarget::Pid(i32::MAX))]
    #[case(AttachTarget::Name(i32::MAX.to_string()))]
    fn test_init_attach_missing_pid(#[case] target: AttachTarget) {
        let config = ProcessConfig {
            attach: Some(target),
            ..Default::default()
        };

        let err = ObservedProcess::init(&config, &ProcEnumerator::new())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Process);
        assert_eq!(err.tag(), "not_found");
    }

    #[rstest]
    #[case(AttachTarget::Pid(-1))]
    #[case(AttachTarget::Pid(0))]
    fn test_init_attach_rejects_non_positive_pid(#[case] target: AttachTarget) {
        let config = ProcessConfig {
            attach: Some(target),
            ..Default::default()
        };

        let err = ObservedProcess::init(&config, &ProcEnumerator::new())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::BadConfig);
        assert_eq!(err.tag(), "option_format");
    }

    #[test]
    fn test_init_attach_unknown_name() {
        let config = ProcessConfig {
            attach: Some(AttachTarget::Name("autopin-no-such-process".into())),
            ..Default::default()
        };

        let err = ObservedProcess::init(&config, &ProcEnumerator::new())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Process);
        assert_eq!(err.tag(), "not_found");
    }

    #[test]
    fn test_init_rejects_bad_config() {
        let err = ObservedProcess::init(&ProcessConfig::default(), &ProcEnumerator::new())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::BadConfig);
    }

    #[test]
    fn test_root_termination() {
        let mut process = ObservedProcess::running(42);
        let mut events = process.subscribe();

        let err = process
            .handle_os_event(OsEvent::TaskTerminated(42))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Process);
        assert_eq!(err.tag(), "terminated");
        assert_eq!(process.pid(), -1);
        assert!(!process.is_running());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_other_task_termination_is_republished() {
        let mut process = ObservedProcess::running(42);
        let mut events = process.subscribe();

        process.handle_os_event(OsEvent::TaskTerminated(43)).unwrap();
        assert_eq!(process.pid(), 42);
        assert!(process.is_running());
        assert_eq!(events.try_recv().unwrap(), ProcessEvent::TaskTerminated(43));
    }

    #[test]
    fn test_control_messages() {
        let mut process = ObservedProcess::running(42);
        let mut events = process.subscribe();

        let phase = ControlMessage::new(EventKind::PhaseChanged, 3, 0.0);
        let user = ControlMessage::new(EventKind::UserEvent, 7, 0.5);
        let ready = ControlMessage::new(EventKind::Ready, 0, 0.0);
        for message in [phase, user, ready] {
            process.handle_os_event(OsEvent::Message(message)).unwrap();
        }

        assert_eq!(process.execution_phase(), 3);
        assert_eq!(events.try_recv().unwrap(), ProcessEvent::PhaseChanged(3));
        assert_eq!(
            events.try_recv().unwrap(),
            ProcessEvent::UserMessage { arg: 7, value: 0.5 }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let mut process = ObservedProcess::running(42);
        let closed = process.subscribe();
        let mut open = process.subscribe();
        drop(closed);

        process.handle_os_event(OsEvent::TaskCreated(50)).unwrap();
        assert_eq!(process.subscribers.len(), 1);
        assert_eq!(open.try_recv().unwrap(), ProcessEvent::TaskCreated(50));
    }

    #[test]
    fn test_process_tree() {
        let process = ObservedProcess::running(42);
        let tree = process.process_tree(&SingleProcess).unwrap();
        assert_eq!(tree.root(), 42);
        assert_eq!(tree.all_tasks(), TaskSet::from([42, 43]));

        assert!(process.process_tree(&Vanished).is_none());

        let configured =
            ObservedProcess::init(&ProcessConfig::test("ls"), &ProcEnumerator::new()).unwrap();
        assert!(configured.process_tree(&SingleProcess).is_none());
    }
}
