//! Turns asynchronous `SIGCHLD` deliveries into records readable from the event loop.
//!
//! The handler writes the raw `siginfo_t` it receives to the write end of a socket pair, the
//! event loop reads whole records from the other end.

use crate::prelude::*;
use autopin_shared::TaskSet;
use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tokio::net::UnixStream;

const RECORD_SIZE: usize = std::mem::size_of::<libc::siginfo_t>();

static BRIDGE_ACTIVE: AtomicBool = AtomicBool::new(false);
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigchld(
    _signal: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let fd = NOTIFY_FD.load(Ordering::SeqCst);
    if fd < 0 || info.is_null() {
        return;
    }

    let saved = Errno::last_raw();
    // SAFETY: write(2) is async-signal-safe and `info` is provided by the kernel
    unsafe {
        libc::write(fd, info.cast(), RECORD_SIZE);
    }
    Errno::set_raw(saved);
}

fn bridge_error(message: &str, e: &io::Error) -> Error {
    Error::system("sigchld", format!("{message}: {e}")).with_io_source(e)
}

/// Process-wide `SIGCHLD` forwarder. At most one may exist at a time.
pub struct SignalBridge {
    reader: UnixStream,
    // Kept open for the handler, which writes to it through `NOTIFY_FD`
    _writer: StdUnixStream,
    previous: Option<SigAction>,
}

impl SignalBridge {
    /// Creates the socket pair and installs the `SIGCHLD` handler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn install() -> Result<Self> {
        if BRIDGE_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::system(
                "already_initialized",
                "A SIGCHLD handler is already installed",
            ));
        }

        Self::create().inspect_err(|_| {
            NOTIFY_FD.store(-1, Ordering::SeqCst);
            BRIDGE_ACTIVE.store(false, Ordering::SeqCst);
        })
    }

    fn create() -> Result<Self> {
        let (reader, writer) = StdUnixStream::pair()
            .map_err(|e| bridge_error("Could not create the signal socket pair", &e))?;
        reader
            .set_nonblocking(true)
            .and_then(|_| writer.set_nonblocking(true))
            .map_err(|e| bridge_error("Could not configure the signal socket pair", &e))?;
        let reader = UnixStream::from_std(reader)
            .map_err(|e| bridge_error("Could not register the signal socket", &e))?;

        NOTIFY_FD.store(writer.as_raw_fd(), Ordering::SeqCst);

        let mut bridge = Self {
            reader,
            _writer: writer,
            previous: None,
        };
        bridge.rearm_handler()?;
        Ok(bridge)
    }

    pub fn is_armed(&self) -> bool {
        self.previous.is_some()
    }

    /// Installs the forwarding handler again after [`SignalBridge::release_handler`].
    pub fn rearm_handler(&mut self) -> Result<()> {
        if self.previous.is_some() {
            return Ok(());
        }

        let action = SigAction::new(
            SigHandler::SigAction(on_sigchld),
            SaFlags::SA_RESTART | SaFlags::SA_SIGINFO | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        // SAFETY: the handler only performs async-signal-safe calls
        let previous = unsafe { sigaction(Signal::SIGCHLD, &action) }.map_err(|e| {
            Error::system("sigset", "Could not install the handler for SIGCHLD").with_source(e)
        })?;
        self.previous = Some(previous);
        Ok(())
    }

    /// Restores the previous `SIGCHLD` disposition, e.g. while the tracer waits for its tasks.
    pub fn release_handler(&mut self) -> Result<()> {
        let Some(previous) = self.previous.take() else {
            return Ok(());
        };

        // SAFETY: restores the disposition saved when the handler was installed
        unsafe { sigaction(Signal::SIGCHLD, &previous) }.map_err(|e| {
            Error::system("sigset", "Could not restore the handler for SIGCHLD").with_source(e)
        })?;
        Ok(())
    }

    /// Waits for the next forwarded `SIGCHLD` and reaps the exited processes among `children`.
    ///
    /// Other children of autopin are never waited for, they keep their exit status for whoever
    /// owns them. Reaped pids are removed from `children` and returned, so the list is empty when
    /// the signal was about some other process. Deliveries may coalesce, hence every pid of
    /// `children` is checked on each record.
    ///
    /// Cancel safe: a record is either consumed completely or left in the socket.
    pub async fn next_terminations(&self, children: &mut TaskSet) -> Result<Vec<i32>> {
        loop {
            self.reader
                .readable()
                .await
                .map_err(|e| bridge_error("Could not wait for signal records", &e))?;

            let mut record = [0u8; RECORD_SIZE];
            match self.reader.try_read(&mut record) {
                Ok(0) => {
                    return Err(Error::system("sigchld", "The signal socket was closed"));
                }
                Ok(RECORD_SIZE) => {
                    // SAFETY: the bytes were written from a `siginfo_t` of the same layout
                    let info: libc::siginfo_t =
                        unsafe { std::ptr::read_unaligned(record.as_ptr().cast()) };
                    // SAFETY: SIGCHLD records carry the child fields
                    trace!("Received SIGCHLD for {}", unsafe { info.si_pid() });
                    return Ok(reap_exited(children));
                }
                Ok(read) => {
                    return Err(Error::system(
                        "sigchld",
                        format!("Truncated signal record of {read} bytes"),
                    ));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(bridge_error("Could not read a signal record", &e)),
            }
        }
    }

    /// Restores the previous handler and releases the bridge.
    pub fn uninstall(mut self) -> Result<()> {
        self.release_handler()
    }
}

fn reap_exited(children: &mut TaskSet) -> Vec<i32> {
    let mut reaped = Vec::new();
    children.retain(|&pid| {
        match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) => {
                reaped.push(pid);
                false
            }
            // Reaped by the trace worker, which already reported it
            Err(Errno::ECHILD) => false,
            _ => true,
        }
    });
    reaped
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        if let Err(e) = self.release_handler() {
            warn!("{e}");
        }
        NOTIFY_FD.store(-1, Ordering::SeqCst);
        BRIDGE_ACTIVE.store(false, Ordering::SeqCst);
    }
}
